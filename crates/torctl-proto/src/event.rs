//! Typed event records and the parser from raw `6xx` reply text.
//!
//! Grammars are the subset of the control-spec used by the path builder
//! (spec §6); `Event::parse` never fails on an event type it doesn't
//! recognize — it falls back to [`Event::Unknown`] — but it does fail
//! (`torctl_error::Error::Protocol`) if a *known* event type doesn't match
//! its expected grammar, mirroring `TorCtl.py`'s `ProtocolError` raises in
//! `_decode1`.

use torctl_error::Error;

use crate::codec::Reply;

/// A parsed `6xx` asynchronous event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `CIRC <id> <status> [<path>] [REASON=] [REMOTE_REASON=]`
    Circuit(CircuitEvent),
    /// `STREAM <id> <status> <circ> <host>:<port> [...]`
    Stream(StreamEvent),
    /// `STREAM_BW <id> <read> <written>`
    StreamBw { id: u64, read: u64, written: u64 },
    /// `NS` (multi-line; one [`NetworkStatus`] per `r`/`s` group).
    NetworkStatus(Vec<NetworkStatus>),
    /// `NEWDESC <space-separated idhex list>`
    NewDesc(Vec<String>),
    /// `ADDRMAP <from> <to> (<timestamp>|NEVER|bareword)`
    AddrMap {
        from: String,
        to: String,
        expires: AddrMapExpiry,
    },
    /// `BW <read> <written>`
    Bandwidth { read: u64, written: u64 },
    /// `ORCONN <target> <status> [AGE=] [READ=] [WRITTEN=] [REASON=] [NCIRCS=]`
    OrConn {
        target: String,
        status: String,
        ncircs: u32,
    },
    /// `DEBUG`/`INFO`/`NOTICE`/`WARN`/`ERR` control-port log lines.
    Log { severity: LogSeverity, message: String },
    /// Anything else; carries the raw event-type keyword and body text.
    Unknown { keyword: String, text: String },
}

/// Severity of a control-port `Log` event, ordered least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogSeverity {
    Debug,
    Info,
    Notice,
    Warn,
    Err,
}

/// When an `ADDRMAP` entry expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrMapExpiry {
    /// The mapping never expires.
    Never,
    /// The mapping expires at this control-port-formatted timestamp
    /// (`YYYY-MM-DD HH:MM:SS`), kept as text since this crate doesn't
    /// depend on a calendar/timezone library for one field.
    At(String),
    /// A bareword expiry value we don't interpret further.
    Other(String),
}

/// A parsed `CIRC` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitEvent {
    pub circ_id: u64,
    pub status: String,
    pub path: Vec<String>,
    pub reason: Option<String>,
    pub remote_reason: Option<String>,
}

/// A parsed `STREAM` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub strm_id: u64,
    pub status: String,
    pub circ_id: u64,
    pub target_host: String,
    pub target_port: u16,
    pub reason: Option<String>,
    pub remote_reason: Option<String>,
    pub source: Option<String>,
    pub source_addr: Option<String>,
}

/// A single relay's entry as parsed out of an `NS` reply's `r`/`s` group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStatus {
    pub nickname: String,
    pub idhex: String,
    pub ip: String,
    pub orport: u16,
    pub dirport: u16,
    pub flags: Vec<String>,
}

/// Split an `NS` reply's data body (one line per `r`/`s`/... field) into
/// per-router groups starting at each `r ` line, matching
/// `parse_ns_body`'s `re.compile(r"^r ", re.M).split(data)`.
pub fn parse_ns_body(lines: &[String]) -> Result<Vec<NetworkStatus>, Error> {
    let mut groups: Vec<Vec<&str>> = Vec::new();
    for line in lines {
        if let Some(rest) = line.strip_prefix("r ") {
            groups.push(vec![rest]);
        } else if let Some(last) = groups.last_mut() {
            last.push(line.as_str());
        }
        // Lines before the first "r " line (there shouldn't be any) are dropped,
        // matching nsgroups.pop(0) in the original.
    }

    let mut out = Vec::with_capacity(groups.len());
    for group in groups {
        out.push(parse_ns_group(&group)?);
    }
    Ok(out)
}

/// Parse one `r`/`s`/... group into a [`NetworkStatus`].
fn parse_ns_group(group: &[&str]) -> Result<NetworkStatus, Error> {
    let r_line = group
        .first()
        .ok_or_else(|| Error::Protocol("empty NS group".into()))?;
    let r_fields: Vec<&str> = r_line.split_whitespace().collect();
    // r Nickname Identity Digest PublicationDate PublicationTime IP ORPort DirPort
    if r_fields.len() < 8 {
        return Err(Error::Protocol(format!("malformed r line: {r_line:?}")));
    }
    let nickname = r_fields[0].to_owned();
    let idhex = base64_identity_to_hex(r_fields[1])?;
    let ip = r_fields[5].to_owned();
    let orport: u16 = r_fields[6]
        .parse()
        .map_err(|_| Error::Protocol(format!("bad orport in r line: {r_line:?}")))?;
    let dirport: u16 = r_fields[7]
        .parse()
        .map_err(|_| Error::Protocol(format!("bad dirport in r line: {r_line:?}")))?;

    let s_line = group
        .iter()
        .skip(1)
        .find(|l| l.starts_with('s') && (l.len() == 1 || l.as_bytes()[1] == b' '));
    let flags = match s_line {
        Some(line) => line
            .strip_prefix('s')
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_owned)
            .collect(),
        None => Vec::new(),
    };

    Ok(NetworkStatus {
        nickname,
        idhex,
        ip,
        orport,
        dirport,
        flags,
    })
}

/// Decode a base64 identity digest (as seen in an `r` line) into an
/// upper-case hex fingerprint, per spec §6's idhex normalization rule.
pub fn base64_identity_to_hex(b64: &str) -> Result<String, Error> {
    use base64::Engine as _;
    // Tor's base64 identity digests are unpadded; the engine needs padding
    // tolerance turned on to accept that.
    let engine = base64::engine::general_purpose::STANDARD_NO_PAD;
    let padded_len = (b64.len() + 3) / 4 * 4;
    let mut padded = b64.to_owned();
    padded.push_str(&"=".repeat(padded_len.saturating_sub(b64.len())));
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&padded)
        .or_else(|_| engine.decode(b64))
        .map_err(|e| Error::Protocol(format!("bad base64 identity {b64:?}: {e}")))?;
    Ok(bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<String>())
}

impl Event {
    /// Parse one already-classified `6xx` [`Reply`] into a typed [`Event`].
    ///
    /// Mirrors `EventHandler._decode1`: the event keyword is the first
    /// whitespace-delimited token of the reply's (first line's) text,
    /// upper-cased.
    pub fn parse(reply: &Reply) -> Result<Event, Error> {
        let first = reply
            .lines
            .first()
            .ok_or_else(|| Error::Protocol("empty event reply".into()))?;
        let (keyword, body) = match first.text.split_once(' ') {
            Some((k, b)) => (k.to_uppercase(), b),
            None => (first.text.to_uppercase(), ""),
        };

        match keyword.as_str() {
            "CIRC" => parse_circ(body).map(Event::Circuit),
            "STREAM" => parse_stream(body).map(Event::Stream),
            "STREAM_BW" => parse_stream_bw(body),
            "BW" => parse_bw(body),
            "ORCONN" => parse_orconn(body),
            "NEWDESC" => Ok(Event::NewDesc(
                body.split_whitespace().map(str::to_owned).collect(),
            )),
            "ADDRMAP" => parse_addrmap(body),
            "NS" => {
                let data = first.data.clone().unwrap_or_default();
                Ok(Event::NetworkStatus(parse_ns_body(&data)?))
            }
            "DEBUG" | "INFO" | "NOTICE" | "WARN" | "ERR" => Ok(Event::Log {
                severity: match keyword.as_str() {
                    "DEBUG" => LogSeverity::Debug,
                    "INFO" => LogSeverity::Info,
                    "NOTICE" => LogSeverity::Notice,
                    "WARN" => LogSeverity::Warn,
                    _ => LogSeverity::Err,
                },
                message: body.to_owned(),
            }),
            _ => Ok(Event::Unknown {
                keyword,
                text: body.to_owned(),
            }),
        }
    }
}

/// Pull `KEY=value` out of a token if present, returning the trimmed value.
fn strip_kv<'a>(tok: Option<&'a str>, prefix: &str) -> Option<&'a str> {
    tok.and_then(|t| t.strip_prefix(prefix))
}

fn parse_circ(body: &str) -> Result<CircuitEvent, Error> {
    let mut toks = body.split_whitespace();
    let circ_id: u64 = toks
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("CIRC event misformatted: {body:?}")))?;
    let status = toks
        .next()
        .ok_or_else(|| Error::Protocol(format!("CIRC event misformatted: {body:?}")))?
        .to_owned();

    let rest: Vec<&str> = toks.collect();
    let mut path = Vec::new();
    let mut reason = None;
    let mut remote_reason = None;
    for tok in rest {
        if let Some(v) = strip_kv(Some(tok), "REASON=") {
            reason = Some(v.to_owned());
        } else if let Some(v) = strip_kv(Some(tok), "REMOTE_REASON=") {
            remote_reason = Some(v.to_owned());
        } else if !tok.contains('=') {
            // A comma-separated path token, e.g. "$AAAA...,$BBBB...".
            path = tok.split(',').map(str::to_owned).collect();
        }
    }

    Ok(CircuitEvent {
        circ_id,
        status,
        path,
        reason,
        remote_reason,
    })
}

fn parse_stream(body: &str) -> Result<StreamEvent, Error> {
    let mut toks = body.split_whitespace();
    let err = || Error::Protocol(format!("STREAM event misformatted: {body:?}"));
    let strm_id: u64 = toks.next().and_then(|t| t.parse().ok()).ok_or_else(err)?;
    let status = toks.next().ok_or_else(err)?.to_owned();
    let circ_id: u64 = toks.next().and_then(|t| t.parse().ok()).ok_or_else(err)?;
    let target = toks.next().ok_or_else(err)?;
    let (target_host, target_port) = target.rsplit_once(':').ok_or_else(err)?;
    let target_port: u16 = target_port.parse().map_err(|_| err())?;

    let mut reason = None;
    let mut remote_reason = None;
    let mut source = None;
    let mut source_addr = None;
    for tok in toks {
        if let Some(v) = strip_kv(Some(tok), "REASON=") {
            reason = Some(v.to_owned());
        } else if let Some(v) = strip_kv(Some(tok), "REMOTE_REASON=") {
            remote_reason = Some(v.to_owned());
        } else if let Some(v) = strip_kv(Some(tok), "SOURCE_ADDR=") {
            source_addr = Some(v.to_owned());
        } else if let Some(v) = strip_kv(Some(tok), "SOURCE=") {
            source = Some(v.to_owned());
        }
    }

    Ok(StreamEvent {
        strm_id,
        status,
        circ_id,
        target_host: target_host.to_owned(),
        target_port,
        reason,
        remote_reason,
        source,
        source_addr,
    })
}

fn parse_stream_bw(body: &str) -> Result<Event, Error> {
    let mut toks = body.split_whitespace();
    let err = || Error::Protocol(format!("STREAM_BW event misformatted: {body:?}"));
    let id: u64 = toks.next().and_then(|t| t.parse().ok()).ok_or_else(err)?;
    let read: u64 = toks.next().and_then(|t| t.parse().ok()).ok_or_else(err)?;
    let written: u64 = toks.next().and_then(|t| t.parse().ok()).ok_or_else(err)?;
    Ok(Event::StreamBw { id, read, written })
}

fn parse_bw(body: &str) -> Result<Event, Error> {
    let mut toks = body.split_whitespace();
    let err = || Error::Protocol(format!("BW event misformatted: {body:?}"));
    let read: u64 = toks.next().and_then(|t| t.parse().ok()).ok_or_else(err)?;
    let written: u64 = toks.next().and_then(|t| t.parse().ok()).ok_or_else(err)?;
    Ok(Event::Bandwidth { read, written })
}

fn parse_orconn(body: &str) -> Result<Event, Error> {
    let mut toks = body.split_whitespace();
    let err = || Error::Protocol(format!("ORCONN event misformatted: {body:?}"));
    let target = toks.next().ok_or_else(err)?.to_owned();
    let status = toks.next().ok_or_else(err)?.to_owned();
    let mut ncircs = 0u32;
    for tok in toks {
        if let Some(v) = strip_kv(Some(tok), "NCIRCS=") {
            ncircs = v.parse().unwrap_or(0);
        }
    }
    Ok(Event::OrConn {
        target,
        status,
        ncircs,
    })
}

fn parse_addrmap(body: &str) -> Result<Event, Error> {
    let err = || Error::Protocol(format!("ADDRMAP event misformatted: {body:?}"));
    let mut toks = body.splitn(3, ' ');
    let from = toks.next().ok_or_else(err)?.to_owned();
    let to = toks.next().ok_or_else(err)?.to_owned();
    let when = toks.next().ok_or_else(err)?.trim();
    let expires = if when.eq_ignore_ascii_case("NEVER") {
        AddrMapExpiry::Never
    } else if let Some(stripped) = when.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        AddrMapExpiry::At(stripped.to_owned())
    } else {
        AddrMapExpiry::Other(when.to_owned())
    };
    Ok(Event::AddrMap { from, to, expires })
}
