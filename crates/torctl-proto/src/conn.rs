//! The control connection: a request/response multiplexer over the wire
//! codec, cleanly separating solicited replies from asynchronous `6xx`
//! event messages.
//!
//! Three logical tasks cooperate here, matching spec §4.1 and the reactor
//! style of `tor_proto::channel::reactor` (one task reads the socket and
//! classifies frames; commands block on a per-request oneshot; an event
//! dispatcher hands parsed events to whoever is draining
//! [`Connection::events`]):
//!
//! 1. **Reader** ([`reader_task`]) — reads [`Reply`](crate::codec::Reply)
//!    frames off the socket and either completes the oldest pending
//!    command callback (a solicited reply) or forwards the frame to the
//!    event channel (a `6xx` reply).
//! 2. **Command responder** — implicit in the reader: the FIFO of pending
//!    callbacks mirrors write order, so "pop the next callback" is exactly
//!    matching reply N to command N (spec invariant ii).
//! 3. **Event dispatcher** — not run by this crate at all: spec §5 assigns
//!    exclusive ownership of event dispatch to the path builder's single
//!    task, so this module's job ends at handing parsed, timestamped
//!    events to an `mpsc` channel the path builder drains.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use torctl_error::Error;

use crate::codec::{ControlCodec, Reply};
use crate::event::Event;

/// A parsed event together with the time the reader task observed it,
/// matching the `(timestamp, reply)` pairs spec §4.1 says the event
/// dispatcher pops from its queue.
#[derive(Debug, Clone)]
pub struct TimedEvent {
    pub at: SystemTime,
    pub event: Event,
}

/// One outstanding command: the oneshot the reader task completes when
/// its reply arrives.
type Waiter = oneshot::Sender<Result<Reply, Error>>;

/// Shared connection state: the FIFO of pending command callbacks and
/// whether the connection has been closed.
struct Shared {
    waiters: Mutex<VecDeque<Waiter>>,
    closed: Mutex<Option<Error>>,
}

/// A live control-port connection.
///
/// Clone is cheap (an `Arc` underneath); every clone shares the same
/// socket write-half and the same pending-callback FIFO, so commands
/// issued from any task are still serialized correctly (spec invariant i).
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    writer: Arc<AsyncMutex<Box<dyn AsyncCommandWriter>>>,
}

/// Object-safe alias for the half of the connection we write commands to.
trait AsyncCommandWriter: Send {
    fn write_line<'a>(
        &'a mut self,
        line: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>>;
}

impl<W> AsyncCommandWriter for FramedWrite<W, ControlCodec>
where
    W: AsyncWrite + Unpin + Send,
{
    fn write_line<'a>(
        &'a mut self,
        line: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(async move {
            self.send(line)
                .await
                .map_err(|e| Error::Protocol(e.to_string()))
        })
    }
}

impl Connection {
    /// Wrap a connected, split async stream (TCP or Unix-domain) as a
    /// control connection, spawning the reader task.
    ///
    /// Returns the connection handle plus the receiving end of the event
    /// channel; the caller (the path builder, per spec §5) is responsible
    /// for draining it from its single event-dispatch task.
    pub fn new<R, W>(read_half: R, write_half: W) -> (Connection, mpsc::UnboundedReceiver<TimedEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            waiters: Mutex::new(VecDeque::new()),
            closed: Mutex::new(None),
        });
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let reader_shared = Arc::clone(&shared);
        let framed_read = FramedRead::new(read_half, ControlCodec::new());
        tokio::spawn(reader_task(framed_read, reader_shared, event_tx));

        let framed_write = FramedWrite::new(write_half, ControlCodec::new());
        let conn = Connection {
            shared,
            writer: Arc::new(AsyncMutex::new(Box::new(framed_write))),
        };
        (conn, event_rx)
    }

    /// Send one command line (without `\r\n`, which is added here) and
    /// block until its reply arrives.
    ///
    /// This is the "caller-side synchronization primitive" of spec §4.1:
    /// submission and write are atomic with respect to other commands
    /// because both the write and the FIFO push happen while holding
    /// `writer`'s lock.
    pub async fn send_and_recv(&self, line: impl Into<String>) -> Result<Reply, Error> {
        if let Some(err) = self.shared.closed.lock().expect("poisoned").clone() {
            return Err(err);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut writer = self.writer.lock().await;
            // Queue the waiter before writing so that a reply racing in
            // immediately after the write always finds its callback.
            self.shared.waiters.lock().expect("poisoned").push_back(tx);
            if let Err(e) = writer.write_line(line.into()).await {
                // Roll back: drop the waiter we just queued, it'll never
                // be answered now that the write failed.
                self.shared.waiters.lock().expect("poisoned").pop_back();
                self.fail_all(e.clone());
                return Err(e);
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed),
        }
    }

    /// Send a command and return only its joined reply text if it
    /// succeeded, raising [`Error::ErrorReply`] on a `4xx`/`5xx` status.
    pub async fn command(&self, line: impl Into<String>) -> Result<Reply, Error> {
        let reply = self.send_and_recv(line).await?;
        if reply.is_error() {
            let first = reply.lines.first().map(|l| l.text.clone()).unwrap_or_default();
            return Err(Error::ErrorReply {
                code: reply.code,
                text: first,
            });
        }
        Ok(reply)
    }

    /// Complete every pending command with `err`, matching spec invariant
    /// iii ("every queued callback is completed with a `Closed` error").
    fn fail_all(&self, err: Error) {
        let mut closed = self.shared.closed.lock().expect("poisoned");
        if closed.is_none() {
            *closed = Some(err.clone());
        }
        drop(closed);
        let mut waiters = self.shared.waiters.lock().expect("poisoned");
        for waiter in waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    // -- Wire-exact command surface (spec §4.1) --------------------------

    pub async fn authenticate(&self, secret: &str) -> Result<(), Error> {
        self.command(format!("AUTHENTICATE \"{}\"", escape_quotes(secret)))
            .await?;
        Ok(())
    }

    pub async fn getconf(&self, name: &str) -> Result<Reply, Error> {
        self.command(format!("GETCONF {name}")).await
    }

    pub async fn setconf(&self, kv: &[(String, String)]) -> Result<(), Error> {
        let body = kv
            .iter()
            .map(|(k, v)| format!("{k}={}", quote(v)))
            .collect::<Vec<_>>()
            .join(" ");
        self.command(format!("SETCONF {body}")).await?;
        Ok(())
    }

    pub async fn resetconf(&self, keys: &[String]) -> Result<(), Error> {
        self.command(format!("RESETCONF {}", keys.join(" "))).await?;
        Ok(())
    }

    pub async fn saveconf(&self) -> Result<(), Error> {
        self.command("SAVECONF").await?;
        Ok(())
    }

    pub async fn signal(&self, sig: &str) -> Result<(), Error> {
        self.command(format!("SIGNAL {sig}")).await?;
        Ok(())
    }

    pub async fn getinfo(&self, name: &str) -> Result<Reply, Error> {
        self.command(format!("GETINFO {name}")).await
    }

    pub async fn setevents(&self, events: &[String], extended: bool) -> Result<(), Error> {
        let kw = if extended { "SETEVENTS EXTENDED" } else { "SETEVENTS" };
        self.command(format!("{kw} {}", events.join(" "))).await?;
        Ok(())
    }

    pub async fn map_address(&self, from: &str, to: &str) -> Result<Reply, Error> {
        self.command(format!("MAPADDRESS {from}={to}")).await
    }

    pub async fn extend_circuit(&self, circ_id: u64, path: &[String]) -> Result<u64, Error> {
        let reply = self
            .command(format!("EXTENDCIRCUIT {circ_id} {}", path.join(",")))
            .await?;
        parse_extended_circ_id(&reply)
    }

    pub async fn attach_stream(&self, strm_id: u64, circ_id: u64) -> Result<(), Error> {
        self.command(format!("ATTACHSTREAM {strm_id} {circ_id}"))
            .await?;
        Ok(())
    }

    pub async fn redirect_stream(&self, strm_id: u64, addr: &str) -> Result<(), Error> {
        self.command(format!("REDIRECTSTREAM {strm_id} {addr}"))
            .await?;
        Ok(())
    }

    pub async fn close_stream(&self, strm_id: u64, reason: u8) -> Result<(), Error> {
        self.command(format!("CLOSESTREAM {strm_id} {reason}"))
            .await?;
        Ok(())
    }

    pub async fn close_circuit(&self, circ_id: u64, reason: &str) -> Result<(), Error> {
        self.command(format!("CLOSECIRCUIT {circ_id} {reason}"))
            .await?;
        Ok(())
    }

    pub async fn resolve(&self, host: &str) -> Result<(), Error> {
        self.command(format!("RESOLVE {host}")).await?;
        Ok(())
    }
}

/// Extract the new circuit id out of an `EXTENDCIRCUIT`'s `250 EXTENDED <id>` reply.
fn parse_extended_circ_id(reply: &Reply) -> Result<u64, Error> {
    let text = reply.joined_text();
    text.split_whitespace()
        .nth(1)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("malformed EXTENDCIRCUIT reply: {text:?}")))
}

/// Quote a `SETCONF` value per control-spec QuotedString rules (used
/// whenever the value contains whitespace or is empty).
fn quote(v: &str) -> String {
    if v.chars().all(|c| !c.is_whitespace()) && !v.is_empty() {
        v.to_owned()
    } else {
        format!("\"{}\"", escape_quotes(v))
    }
}

fn escape_quotes(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"")
}

/// The reader task: classifies every complete reply as event or solicited
/// response, per spec §4.1.
async fn reader_task<R>(
    mut framed: FramedRead<R, ControlCodec>,
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<TimedEvent>,
) where
    R: AsyncRead + Unpin,
{
    use futures::StreamExt;

    loop {
        match framed.next().await {
            Some(Ok(reply)) => {
                if reply.is_event() {
                    if is_bare_650_ok(&reply) {
                        trace!("ignoring bare 650 OK");
                        continue;
                    }
                    match Event::parse(&reply) {
                        Ok(event) => {
                            let _ = event_tx.send(TimedEvent {
                                at: SystemTime::now(),
                                event,
                            });
                        }
                        Err(e) => warn!(error = %e, "dropping unparseable event"),
                    }
                    continue;
                }

                let waiter = {
                    let mut waiters = shared.waiters.lock().expect("poisoned");
                    waiters.pop_front()
                };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(reply));
                    }
                    None => {
                        warn!(code = reply.code, "reply with no matching pending command");
                    }
                }
            }
            Some(Err(e)) => {
                debug!(error = %e, "control connection framing error");
                fail_all_static(&shared, Error::Protocol(e.to_string()));
                return;
            }
            None => {
                debug!("control connection closed");
                fail_all_static(&shared, Error::Closed);
                return;
            }
        }
    }
}

/// Same as [`Connection::fail_all`] but usable from the reader task, which
/// doesn't hold a `Connection` handle.
fn fail_all_static(shared: &Arc<Shared>, err: Error) {
    let mut closed = shared.closed.lock().expect("poisoned");
    if closed.is_none() {
        *closed = Some(err.clone());
    }
    drop(closed);
    let mut waiters = shared.waiters.lock().expect("poisoned");
    for waiter in waiters.drain(..) {
        let _ = waiter.send(Err(err.clone()));
    }
}

/// A lone `650 OK` line is benign noise, not an event (spec §4.1).
fn is_bare_650_ok(reply: &Reply) -> bool {
    reply.code == 650 && reply.lines.len() == 1 && reply.lines[0].text == "OK"
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn getinfo_round_trip() {
        let (client_io, mut server_io) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        let (conn, _events) = Connection::new(read_half, write_half);

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let n = server_io.read(&mut buf).await.unwrap();
            assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("GETINFO version"));
            server_io.write_all(b"250-version=0.4.8.1\r\n250 OK\r\n").await.unwrap();
        });

        let reply = conn.getinfo("version").await.unwrap();
        assert_eq!(reply.lines[0].text, "version=0.4.8.1");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_reply_surfaces_as_error_reply() {
        let (client_io, mut server_io) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        let (conn, _events) = Connection::new(read_half, write_half);

        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = vec![0u8; 4096];
            let _ = server_io.read(&mut buf).await.unwrap();
            server_io.write_all(b"552 Unrecognized option\r\n").await.unwrap();
        });

        let err = conn.getinfo("bogus").await.unwrap_err();
        assert!(matches!(err, Error::ErrorReply { code: 552, .. }));
    }

    #[tokio::test]
    async fn event_is_routed_to_event_channel_not_command_waiter() {
        let (client_io, mut server_io) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        let (conn, mut events) = Connection::new(read_half, write_half);

        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = vec![0u8; 4096];
            let _ = server_io.read(&mut buf).await.unwrap();
            // An event interleaves before the actual reply.
            server_io.write_all(b"650 OK\r\n").await.unwrap();
            server_io
                .write_all(b"650 STREAM_BW 1 10 20\r\n250 OK\r\n")
                .await
                .unwrap();
        });

        let reply = conn.command("SETEVENTS STREAM_BW").await.unwrap();
        assert_eq!(reply.code, 250);
        let ev = events.recv().await.unwrap();
        match ev.event {
            Event::StreamBw { id, read, written } => {
                assert_eq!((id, read, written), (1, 10, 20));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_socket_fails_pending_command() {
        let (client_io, server_io) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        let (conn, _events) = Connection::new(read_half, write_half);
        drop(server_io);

        let err = conn.getinfo("version").await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }
}
