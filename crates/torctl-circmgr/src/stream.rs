//! The `Stream` record and its `STREAM`-event-driven state transitions
//! (spec §4.7: "Stream state transitions").

use std::net::Ipv4Addr;
use std::time::Instant;

use crate::circuit::CircId;

/// A stream's wire identifier, as carried by every `STREAM` event.
pub type StrmId = u64;

/// One application stream the path builder is responsible for attaching to
/// a circuit.
#[derive(Debug, Clone)]
pub struct Stream {
    /// This stream's wire id.
    pub strm_id: StrmId,
    /// The stream's target host, as last set by a `NEW`/`NEWRESOLVE`/`REMAP` event.
    pub host: String,
    /// The stream's target port.
    pub port: u16,
    /// The circuit an `ATTACHSTREAM` was just issued for, not yet
    /// confirmed by a `SUCCEEDED` event.
    pub pending_circ: Option<CircId>,
    /// The circuit this stream is actually attached to, once confirmed.
    pub circ: Option<CircId>,
    /// Circuits this stream has already been detached from — excluded from
    /// consideration the next time it's dispatched (spec §4.7: "re-dispatches
    /// ... via `attach_stream_any(stream, stream.detached_from)`").
    pub detached_from: Vec<CircId>,
    pub attached_at: Option<Instant>,
    /// Cumulative bytes read/written, last set by a `STREAM_BW` event.
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub failed: bool,
}

impl Stream {
    /// A brand new stream, as seen on a `NEW`/`NEWRESOLVE` event.
    pub fn new(strm_id: StrmId, host: String, port: u16) -> Stream {
        Stream {
            strm_id,
            host,
            port,
            pending_circ: None,
            circ: None,
            detached_from: Vec::new(),
            attached_at: None,
            bytes_read: 0,
            bytes_written: 0,
            failed: false,
        }
    }

    /// Accumulate a `STREAM_BW` sample (spec §3: "byte counters").
    /// `STREAM_BW` reports an incremental per-interval delta, not a
    /// running total, so each sample adds onto the running counters
    /// (`PathSupport.py`'s `stream_bw_event`: `bytes_read += s.bytes_read`).
    pub fn set_bandwidth(&mut self, read: u64, written: u64) {
        self.bytes_read += read;
        self.bytes_written += written;
    }

    /// This stream's target host as an `Ipv4Addr`, normalizing anything
    /// that isn't a bare dotted-quad (a hostname, for instance) to
    /// `255.255.255.255` for exit-policy evaluation (spec §4.7: "Normalize
    /// non-IPv4 `target_host`").
    pub fn target_ip(&self) -> Ipv4Addr {
        self.host.parse().unwrap_or(Ipv4Addr::new(255, 255, 255, 255))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dotted_quad_host_parses_directly() {
        let s = Stream::new(1, "1.2.3.4".into(), 80);
        assert_eq!(s.target_ip(), Ipv4Addr::new(1, 2, 3, 4));
    }

    #[test]
    fn hostname_normalizes_to_sentinel() {
        let s = Stream::new(1, "www.example.com".into(), 443);
        assert_eq!(s.target_ip(), Ipv4Addr::new(255, 255, 255, 255));
    }

    #[test]
    fn fresh_stream_has_no_circuit_yet() {
        let s = Stream::new(5, "10.0.0.1".into(), 22);
        assert!(s.pending_circ.is_none());
        assert!(s.circ.is_none());
        assert!(s.detached_from.is_empty());
    }

    #[test]
    fn stream_bw_accumulates_the_cumulative_counters() {
        let mut s = Stream::new(1, "1.2.3.4".into(), 80);
        s.set_bandwidth(100, 40);
        s.set_bandwidth(250, 90);
        assert_eq!(s.bytes_read, 350);
        assert_eq!(s.bytes_written, 130);
    }
}
