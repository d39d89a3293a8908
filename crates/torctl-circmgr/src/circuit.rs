//! The `Circuit` record and its `CIRC`-event-driven state transitions
//! (spec §4.7: "Circuit state transitions").

use std::time::{Duration, Instant};

use crate::stream::StrmId;

/// A circuit's wire identifier, as carried by every `CIRC`/`STREAM` event.
pub type CircId = u64;

/// One circuit the path builder has extended or is extending, tracked from
/// `EXTENDCIRCUIT`'s reply through to `BUILT`/`FAILED`/`CLOSED`.
#[derive(Debug, Clone)]
pub struct Circuit {
    /// This circuit's wire id.
    pub circ_id: CircId,
    /// The idhex of each hop, entry first, exit last, as drawn by
    /// `SelectionManager::build_path`.
    pub path: Vec<String>,
    /// Set once a `BUILT` event for this circuit has arrived.
    pub built: bool,
    /// Set once a stream attached to this circuit has failed, or a
    /// `NEWNYM` flush has claimed it — a dirty circuit is never offered to
    /// a new stream (spec §4.7).
    pub dirty: bool,
    /// Set once this circuit has been torn down; held briefly so a
    /// just-removed circuit's last state is still inspectable.
    pub closed: bool,
    /// Streams this circuit has been asked to carry via `ATTACHSTREAM`,
    /// whether or not the control port has confirmed `SUCCEEDED` yet.
    pub pending_streams: Vec<StrmId>,
    /// Number of streams ever detached from this circuit (spec §3: Circuit
    /// counters).
    pub detached_cnt: u32,
    /// Time between successive `EXTENDED` events, in arrival order.
    pub extend_times: Vec<Duration>,
    last_extended_at: Instant,
    /// Total build time, set once `BUILT` arrives (spec §4.7: "sets
    /// `setup_duration = sum(extend_times)`").
    pub setup_duration: Option<Duration>,
}

impl Circuit {
    /// A circuit just created from an `EXTENDCIRCUIT 0 <path>` reply.
    pub fn new(circ_id: CircId, path: Vec<String>) -> Circuit {
        Circuit {
            circ_id,
            path,
            built: false,
            dirty: false,
            closed: false,
            pending_streams: Vec::new(),
            detached_cnt: 0,
            extend_times: Vec::new(),
            last_extended_at: Instant::now(),
            setup_duration: None,
        }
    }

    /// This circuit's exit hop, if its path is non-empty (spec §4.7: exit
    /// policy on a candidate circuit is checked against its last hop).
    pub fn exit_idhex(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }

    /// True if this circuit can carry a new stream right now.
    pub fn is_usable(&self) -> bool {
        self.built && !self.dirty && !self.closed
    }

    /// Record a stream having been detached from this circuit (spec §3:
    /// Circuit counter `detached_cnt`).
    pub fn on_stream_detached(&mut self) {
        self.detached_cnt += 1;
    }

    /// Record one more `EXTENDED` hop (spec §4.7: "appends
    /// `arrived_at - last_extended_at` to `extend_times`").
    pub fn on_extended(&mut self, arrived_at: Instant) {
        self.extend_times.push(arrived_at.saturating_duration_since(self.last_extended_at));
        self.last_extended_at = arrived_at;
    }

    /// Mark this circuit built, freezing its total setup time (spec §4.7:
    /// "marks `built = true`, sets `setup_duration = sum(extend_times)`").
    pub fn on_built(&mut self) {
        self.built = true;
        self.setup_duration = Some(self.extend_times.iter().sum());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_circuit_is_not_usable_until_built() {
        let circ = Circuit::new(1, vec!["AAAA".into(), "BBBB".into(), "CCCC".into()]);
        assert!(!circ.is_usable());
        assert_eq!(circ.exit_idhex(), Some("CCCC"));
    }

    #[test]
    fn built_circuit_is_usable_and_records_setup_duration() {
        let mut circ = Circuit::new(1, vec!["AAAA".into()]);
        let t0 = Instant::now();
        circ.on_extended(t0);
        circ.on_built();
        assert!(circ.is_usable());
        assert_eq!(circ.setup_duration, Some(circ.extend_times.iter().sum()));
    }

    #[test]
    fn dirty_or_closed_circuit_is_not_usable() {
        let mut circ = Circuit::new(1, vec!["AAAA".into()]);
        circ.on_built();
        circ.dirty = true;
        assert!(!circ.is_usable());
        circ.dirty = false;
        circ.closed = true;
        assert!(!circ.is_usable());
    }

    #[test]
    fn detach_count_accumulates_across_reassignments() {
        let mut circ = Circuit::new(1, vec!["AAAA".into()]);
        circ.on_stream_detached();
        circ.on_stream_detached();
        assert_eq!(circ.detached_cnt, 2);
    }
}
