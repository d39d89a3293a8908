//! The path builder: a single-task event loop owning the router table,
//! circuit/stream bookkeeping, and the selection manager (spec §4.7, §5:
//! "Exactly one task owns `RouterTable`/`circuits`/`streams` and drains
//! the event channel; every other task reaches in only through the
//! scheduler").
//!
//! Grounded on `original_source/PathSupport.py`'s `PathBuilder` and
//! `CircuitHandler`: `attach_stream_any`'s existing-circuit-first,
//! build-a-fresh-one-otherwise order, the `NEWNYM` reclaim-then-retry
//! dance, and `check_circuit_pool`'s "keep topping up, log and move on if
//! a build fails" behavior are all carried over.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use torctl_error::Error;
use torctl_netdir::{parse_descriptor, GeoIp, NsEntry, Router, RouterTable};
use torctl_proto::{Connection, Event, LogSeverity, NetworkStatus, TimedEvent};

use crate::circuit::{CircId, Circuit};
use crate::scheduler::{self, is_latency_sensitive, Job, SchedulerHandle};
use crate::selmgr::SelectionManager;
use crate::stream::{Stream, StrmId};

/// Owns the path-building state machine: the live router table, every
/// circuit and stream the path builder is tracking, and the selection
/// manager that turns them into paths.
pub struct PathBuilder {
    conn: Connection,
    events: mpsc::UnboundedReceiver<TimedEvent>,
    routers: RouterTable,
    geoip: Arc<dyn GeoIp>,
    selmgr: SelectionManager,
    circuits: HashMap<CircId, Circuit>,
    streams: HashMap<StrmId, Stream>,
    /// Set by a `SelMgr` job or a fresh `NS`; consumed by the next
    /// heartbeat, which reconfigures the selector and tops up the pool
    /// (spec §4.6, §4.7).
    do_reconfigure: bool,
    /// Set by [`PathBuilder::new_nym`]; consumed by the next stream
    /// dispatch (spec §4.7: "NEWNYM reclaim").
    new_nym_pending: bool,
    immediate_rx: mpsc::UnboundedReceiver<Job>,
    low_prio_rx: mpsc::UnboundedReceiver<Job>,
}

impl PathBuilder {
    /// Build a path builder over an already-authenticated connection. The
    /// caller is responsible for `SETEVENTS`-ing whatever event types it
    /// wants delivered before handing the receiver half here.
    pub fn new(
        conn: Connection,
        events: mpsc::UnboundedReceiver<TimedEvent>,
        geoip: Arc<dyn GeoIp>,
        selmgr: SelectionManager,
    ) -> (PathBuilder, SchedulerHandle) {
        let (handle, queues) = scheduler::channel();
        let builder = PathBuilder {
            conn,
            events,
            routers: RouterTable::new(),
            geoip,
            selmgr,
            circuits: HashMap::new(),
            streams: HashMap::new(),
            // Forces a first reconfigure (and pool fill) as soon as a
            // router table exists, without a prior SelMgr job.
            do_reconfigure: true,
            new_nym_pending: false,
            immediate_rx: queues.immediate_rx,
            low_prio_rx: queues.low_prio_rx,
        };
        (builder, handle)
    }

    /// Mark every non-dirty circuit's pending streams for reclaim on the
    /// next dispatch, matching a `SIGNAL NEWNYM` (spec §4.7).
    pub fn new_nym(&mut self) {
        self.new_nym_pending = true;
    }

    /// Run the event-dispatch loop until the control connection's event
    /// channel closes.
    pub async fn run(mut self) {
        loop {
            match self.events.recv().await {
                Some(te) => {
                    self.heartbeat(&te.event).await;
                    self.handle_event(te).await;
                }
                None => {
                    tracing::info!("event channel closed, path builder exiting");
                    break;
                }
            }
        }
    }

    /// Drain immediate jobs, reconfigure if asked, then run at most one
    /// low-priority job unless `event` is latency-sensitive (spec §4.7).
    async fn heartbeat(&mut self, event: &Event) {
        while let Ok(job) = self.immediate_rx.try_recv() {
            self.run_job(job);
        }

        if self.do_reconfigure {
            let sorted: Vec<Router> = self.routers.iter().cloned().collect();
            self.selmgr.reconfigure(&sorted);
            self.do_reconfigure = false;
            self.check_circuit_pool().await;
        }

        if !is_latency_sensitive(event) {
            if let Ok(job) = self.low_prio_rx.try_recv() {
                self.run_job(job);
            }
        }
    }

    fn run_job(&mut self, job: Job) {
        match job {
            Job::General(f) => f(self),
            Job::SelMgr(f) => {
                f(&mut self.selmgr);
                self.do_reconfigure = true;
            }
        }
    }

    async fn handle_event(&mut self, te: TimedEvent) {
        match te.event {
            Event::Circuit(c) => self.handle_circuit_event(c).await,
            Event::Stream(s) => self.handle_stream_event(s).await,
            Event::NetworkStatus(list) => self.handle_network_status(list),
            Event::NewDesc(ids) => self.handle_new_desc(ids).await,
            Event::StreamBw { id, read, written } => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.set_bandwidth(read, written);
                }
            }
            Event::OrConn { target, status, ncircs } => {
                tracing::debug!(%target, %status, ncircs, "OR connection status change");
            }
            Event::Log { severity, message } => match severity {
                LogSeverity::Debug => tracing::debug!(tor = true, "{message}"),
                LogSeverity::Info => tracing::info!(tor = true, "{message}"),
                LogSeverity::Notice => tracing::info!(tor = true, "{message}"),
                LogSeverity::Warn => tracing::warn!(tor = true, "{message}"),
                LogSeverity::Err => tracing::error!(tor = true, "{message}"),
            },
            Event::Bandwidth { .. } | Event::AddrMap { .. } | Event::Unknown { .. } => {}
        }
    }

    fn handle_network_status(&mut self, list: Vec<NetworkStatus>) {
        let entries: Vec<NsEntry> = list
            .into_iter()
            .map(|ns| NsEntry {
                idhex: ns.idhex,
                nickname: ns.nickname,
                ip: ns.ip,
                flags: ns.flags,
            })
            .collect();
        self.routers.read_routers(entries, &*self.geoip);
        self.do_reconfigure = true;
    }

    async fn handle_new_desc(&mut self, ids: Vec<String>) {
        for idhex in ids {
            let reply = match self.conn.getinfo(&format!("desc/id/{idhex}")).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!(idhex, error = %e, "GETINFO desc/id failed");
                    continue;
                }
            };
            let body = reply.lines.first().and_then(|l| l.data.clone()).unwrap_or_default();
            match parse_descriptor(&body) {
                Ok(desc) => self.routers.apply_descriptor(&idhex, desc),
                Err(e) => tracing::warn!(idhex, error = %e, "unparseable descriptor"),
            }
        }
    }

    async fn handle_circuit_event(&mut self, c: torctl_proto::CircuitEvent) {
        match c.status.as_str() {
            "EXTENDED" => {
                if let Some(circ) = self.circuits.get_mut(&c.circ_id) {
                    circ.on_extended(Instant::now());
                }
            }
            "BUILT" => {
                if let Some(circ) = self.circuits.get_mut(&c.circ_id) {
                    circ.on_built();
                }
                let pending = self
                    .circuits
                    .get(&c.circ_id)
                    .map(|circ| circ.pending_streams.clone())
                    .unwrap_or_default();
                for strm_id in pending {
                    if let Err(e) = self.conn.attach_stream(strm_id, c.circ_id).await {
                        tracing::warn!(strm_id, circ_id = c.circ_id, error = %e, "ATTACHSTREAM failed after BUILT");
                    }
                }
            }
            "FAILED" | "CLOSED" => {
                if let Some(circ) = self.circuits.remove(&c.circ_id) {
                    for strm_id in circ.pending_streams {
                        let badcircs = self
                            .streams
                            .get(&strm_id)
                            .map(|s| s.detached_from.clone())
                            .unwrap_or_default();
                        self.attach_stream_any(strm_id, badcircs).await;
                    }
                    self.check_circuit_pool().await;
                }
            }
            // Unknown circ id, or a status with no state transition of its
            // own (e.g. LAUNCHED) — ignored.
            _ => {}
        }
    }

    async fn handle_stream_event(&mut self, s: torctl_proto::StreamEvent) {
        match s.status.as_str() {
            "NEW" | "NEWRESOLVE" => {
                let port = if s.status == "NEWRESOLVE" && s.target_port == 0 {
                    self.selmgr.resolve_port()
                } else {
                    s.target_port
                };
                self.streams
                    .insert(s.strm_id, Stream::new(s.strm_id, s.target_host, port));
                self.attach_stream_any(s.strm_id, Vec::new()).await;
            }
            "DETACHED" => {
                if let Some(stream) = self.streams.get_mut(&s.strm_id) {
                    stream.detached_from.push(s.circ_id);
                    stream.pending_circ = None;
                }
                if let Some(circ) = self.circuits.get_mut(&s.circ_id) {
                    circ.pending_streams.retain(|id| *id != s.strm_id);
                    circ.on_stream_detached();
                }
                let badcircs = self
                    .streams
                    .get(&s.strm_id)
                    .map(|st| st.detached_from.clone())
                    .unwrap_or_default();
                self.attach_stream_any(s.strm_id, badcircs).await;
            }
            "SUCCEEDED" => {
                if let Some(stream) = self.streams.get_mut(&s.strm_id) {
                    if let Some(circ_id) = stream.pending_circ.take() {
                        stream.circ = Some(circ_id);
                    }
                    stream.attached_at = Some(Instant::now());
                }
            }
            "FAILED" => {
                if let Some(stream) = self.streams.get_mut(&s.strm_id) {
                    stream.failed = true;
                }
                if let Some(circ) = self.circuits.get_mut(&s.circ_id) {
                    circ.dirty = true;
                }
            }
            "CLOSED" => {
                if let Some(circ) = self.circuits.get_mut(&s.circ_id) {
                    circ.pending_streams.retain(|id| *id != s.strm_id);
                }
                self.streams.remove(&s.strm_id);
            }
            "REMAP" => {
                if let Some(stream) = self.streams.get_mut(&s.strm_id) {
                    stream.host = s.target_host;
                    stream.port = s.target_port;
                }
            }
            _ => {}
        }
    }

    /// Attach `strm_id` to an existing usable circuit whose exit policy
    /// admits it, or build a fresh one (spec §4.7 `attach_stream_any`). A
    /// pending `NEWNYM` first reclaims every non-dirty circuit's pending
    /// streams and folds them into this dispatch as a union set.
    async fn attach_stream_any(&mut self, strm_id: StrmId, badcircs: Vec<CircId>) {
        let mut worklist = vec![(strm_id, badcircs)];

        if self.new_nym_pending {
            self.new_nym_pending = false;
            let mut reclaimed = Vec::new();
            for circ in self.circuits.values_mut() {
                if !circ.dirty {
                    reclaimed.extend(circ.pending_streams.drain(..));
                }
                circ.dirty = true;
            }
            for sid in reclaimed {
                if let Some(stream) = self.streams.get_mut(&sid) {
                    stream.pending_circ = None;
                }
                if sid != strm_id {
                    worklist.push((sid, Vec::new()));
                }
            }
        }

        for (sid, bad) in worklist {
            self.attach_one(sid, &bad).await;
        }
    }

    async fn attach_one(&mut self, strm_id: StrmId, badcircs: &[CircId]) {
        let Some((host, port)) = self.streams.get(&strm_id).map(|s| (s.target_ip(), s.port)) else {
            return;
        };

        let mut chosen = None;
        for (circ_id, circ) in self.circuits.iter() {
            if !circ.is_usable() || badcircs.contains(circ_id) {
                continue;
            }
            let Some(exit_idhex) = circ.exit_idhex() else {
                continue;
            };
            let Some(exit_router) = self.routers.id_of(exit_idhex).and_then(|id| self.routers.get(id)) else {
                continue;
            };
            if exit_router.will_exit_to(host, port) {
                chosen = Some(*circ_id);
                break;
            }
        }

        if let Some(circ_id) = chosen {
            if let Err(e) = self.conn.attach_stream(strm_id, circ_id).await {
                tracing::warn!(strm_id, circ_id, error = %e, "ATTACHSTREAM failed");
                return;
            }
            if let Some(circ) = self.circuits.get_mut(&circ_id) {
                circ.pending_streams.push(strm_id);
            }
            if let Some(stream) = self.streams.get_mut(&strm_id) {
                stream.pending_circ = Some(circ_id);
            }
            return;
        }

        self.selmgr.set_target(host, port);
        match self.build_circuit().await {
            Ok(circ_id) => {
                if let Some(circ) = self.circuits.get_mut(&circ_id) {
                    circ.pending_streams.push(strm_id);
                }
                if let Some(stream) = self.streams.get_mut(&strm_id) {
                    stream.pending_circ = Some(circ_id);
                }
            }
            Err(e) => tracing::warn!(strm_id, error = %e, "build_circuit failed for stream attach"),
        }
    }

    /// Draw a path from the current router table and `EXTENDCIRCUIT` it.
    async fn build_circuit(&mut self) -> Result<CircId, Error> {
        let sorted: Vec<Router> = self.routers.iter().cloned().collect();
        let path = self.selmgr.build_path(&sorted)?;
        let idhex_path: Vec<String> = path.iter().map(|r| r.idhex.clone()).collect();
        let circ_id = self.conn.extend_circuit(0, &idhex_path).await?;
        self.circuits.insert(circ_id, Circuit::new(circ_id, idhex_path));
        Ok(circ_id)
    }

    /// Build a circuit with no stream waiting on it yet, targeting the
    /// wildcard `(255.255.255.255, 80)` seed (spec §4.7
    /// `CircuitHandler::check_circuit_pool`).
    async fn build_preemptive_circuit(&mut self) -> Result<CircId, Error> {
        self.selmgr.set_target(Ipv4Addr::new(255, 255, 255, 255), 80);
        self.build_circuit().await
    }

    /// Top up the circuit pool to `SelectionConfig::num_circuits`. A
    /// failed build is logged and left for the next trigger (a fresh `NS`,
    /// or another circuit closing) rather than retried in a tight loop.
    async fn check_circuit_pool(&mut self) {
        let target = self.selmgr.num_circuits();
        while self.circuits.values().filter(|c| !c.closed).count() < target {
            if let Err(e) = self.build_preemptive_circuit().await {
                tracing::warn!(error = %e, "circuit pool build failed; will retry later");
                break;
            }
        }
    }
}
