//! Job queues and the heartbeat that drains them (spec §4.7, §5:
//! "External code that needs to mutate the builder's state must enqueue a
//! job via `schedule_immediate`/`schedule_low_prio`/`schedule_selmgr`
//! rather than reach into it directly").
//!
//! Grounded on `original_source/PathSupport.py`'s `PathBuilder.heartbeat`:
//! immediate jobs always run before the triggering event is handled;
//! low-priority jobs run at most one per heartbeat, and are skipped
//! entirely when the event is latency-sensitive.

use tokio::sync::mpsc;

use crate::builder::PathBuilder;
use crate::selmgr::SelectionManager;
use torctl_proto::Event;

/// A unit of deferred work the path builder's single task will run on its
/// own turn.
pub enum Job {
    /// Mutates the builder directly (e.g. "close this circuit").
    General(Box<dyn FnOnce(&mut PathBuilder) + Send>),
    /// Mutates the selection manager; running it marks the builder's
    /// `do_reconfigure` flag so the next heartbeat rebuilds generators
    /// from the (possibly changed) router table (spec §4.6).
    SelMgr(Box<dyn FnOnce(&mut SelectionManager) + Send>),
}

/// A cloneable handle any task can use to enqueue work on the path
/// builder's single event-dispatch task, without touching its state
/// directly.
#[derive(Clone)]
pub struct SchedulerHandle {
    immediate_tx: mpsc::UnboundedSender<Job>,
    low_prio_tx: mpsc::UnboundedSender<Job>,
}

/// The receiving half [`PathBuilder`] drains from its event loop.
pub struct SchedulerQueues {
    pub immediate_rx: mpsc::UnboundedReceiver<Job>,
    pub low_prio_rx: mpsc::UnboundedReceiver<Job>,
}

/// Build a fresh pair of job queues: the handle callers enqueue through,
/// and the receivers the path builder drains.
pub fn channel() -> (SchedulerHandle, SchedulerQueues) {
    let (immediate_tx, immediate_rx) = mpsc::unbounded_channel();
    let (low_prio_tx, low_prio_rx) = mpsc::unbounded_channel();
    (
        SchedulerHandle { immediate_tx, low_prio_tx },
        SchedulerQueues { immediate_rx, low_prio_rx },
    )
}

impl SchedulerHandle {
    /// Enqueue a job that runs before the next event is handled, no matter
    /// what that event is.
    pub fn schedule_immediate(&self, job: impl FnOnce(&mut PathBuilder) + Send + 'static) {
        let _ = self.immediate_tx.send(Job::General(Box::new(job)));
    }

    /// Enqueue a job that runs at most once per heartbeat, and only when
    /// the triggering event isn't latency-sensitive.
    pub fn schedule_low_prio(&self, job: impl FnOnce(&mut PathBuilder) + Send + 'static) {
        let _ = self.low_prio_tx.send(Job::General(Box::new(job)));
    }

    /// Enqueue a mutation to the selection manager's config; runs as an
    /// immediate job and marks the builder for reconfigure (spec §4.6).
    pub fn schedule_selmgr(&self, job: impl FnOnce(&mut SelectionManager) + Send + 'static) {
        let _ = self.immediate_tx.send(Job::SelMgr(Box::new(job)));
    }
}

/// Is `event` one where running a low-priority job would add unacceptable
/// latency — the moments a human is waiting on a circuit or stream (spec
/// §4.7: "`CIRC BUILT`/`FAILED`, `STREAM NEW`/`NEWRESOLVE`/`DETACHED`")?
pub fn is_latency_sensitive(event: &Event) -> bool {
    match event {
        Event::Circuit(c) => matches!(c.status.as_str(), "BUILT" | "FAILED"),
        Event::Stream(s) => matches!(s.status.as_str(), "NEW" | "NEWRESOLVE" | "DETACHED"),
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use torctl_proto::event::CircuitEvent;

    #[test]
    fn built_and_failed_circ_events_are_latency_sensitive() {
        let built = Event::Circuit(CircuitEvent {
            circ_id: 1,
            status: "BUILT".into(),
            path: vec![],
            reason: None,
            remote_reason: None,
        });
        assert!(is_latency_sensitive(&built));
    }

    #[test]
    fn bandwidth_event_is_not_latency_sensitive() {
        assert!(!is_latency_sensitive(&Event::Bandwidth { read: 0, written: 0 }));
    }
}
