//! Per-slot worker records.
//!
//! A slot is a stable pool position; the worker is whichever child process
//! currently occupies it. Slot records live in the pool table and are only
//! touched under the pool lock.

use crate::net::Endpoint;
use crate::protocol::{ControlMessage, SlotStatus};
use tokio::sync::{mpsc, oneshot};

/// State of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Child process is being started
    Spawning,
    /// Child is running, waiting for its `register` message
    AwaitingRegister,
    /// `register` accepted, `bootstrap` sent, waiting for `ready`
    Bootstrapping,
    /// Eligible for traffic
    Ready,
    /// Carrying a proxied connection (exclusive mode)
    Busy,
    /// Ineligible; recycled once the last connection ends
    Draining,
    /// No live child; a respawn may be scheduled
    Dead,
    /// Held closed until a file change re-enables the slot
    KeepClosed,
}

impl SlotState {
    pub fn name(&self) -> &'static str {
        match self {
            SlotState::Spawning => "spawning",
            SlotState::AwaitingRegister => "awaiting-register",
            SlotState::Bootstrapping => "bootstrapping",
            SlotState::Ready => "ready",
            SlotState::Busy => "busy",
            SlotState::Draining => "draining",
            SlotState::Dead => "dead",
            SlotState::KeepClosed => "keep-closed",
        }
    }
}

/// Outbound half of a worker's control connection. Dropping the link closes
/// the connection, which the worker treats as the order to exit.
#[derive(Debug)]
pub struct ControlLink {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ControlLink {
    pub fn new(tx: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self { tx }
    }

    /// Queue a message for the connection writer. A send to a connection
    /// that is already gone is ignored; the close event does the cleanup.
    pub fn send(&self, msg: ControlMessage) {
        let _ = self.tx.send(msg);
    }
}

/// One worker slot.
#[derive(Debug)]
pub struct WorkerSlot {
    pub id: usize,
    pub data_addr: Endpoint,
    pub state: SlotState,
    /// Spawn counter; events carrying a stale generation are ignored.
    pub generation: u64,
    pub pid: Option<u32>,
    pub control: Option<ControlLink>,
    /// Signals the child's wait task to kill the process.
    pub kill: Option<oneshot::Sender<()>>,
    pub in_flight: usize,
    pub served: u64,
    pub close_when_free: bool,
    pub keep_closed: bool,
    pub bootstrap_failures: u32,
    /// True once this slot has reached `Ready` at least once (initial fill).
    pub seen_ready: bool,
}

impl WorkerSlot {
    pub fn new(id: usize, data_addr: Endpoint) -> Self {
        Self {
            id,
            data_addr,
            state: SlotState::Dead,
            generation: 0,
            pid: None,
            control: None,
            kill: None,
            in_flight: 0,
            served: 0,
            close_when_free: false,
            keep_closed: false,
            bootstrap_failures: 0,
            seen_ready: false,
        }
    }

    /// Whether the scheduler may hand this slot the next request.
    pub fn eligible(&self, concurrent: bool) -> bool {
        self.state == SlotState::Ready && (self.in_flight == 0 || concurrent)
    }

    /// Begin a new spawn: bump the generation and reset per-child state.
    /// Returns the new generation for the spawn's event callbacks.
    pub fn begin_spawn(&mut self) -> u64 {
        self.generation += 1;
        self.state = SlotState::Spawning;
        self.pid = None;
        self.control = None;
        self.kill = None;
        self.in_flight = 0;
        self.served = 0;
        self.close_when_free = false;
        self.generation
    }

    /// Whether a live child process is attached to this slot.
    pub fn has_child(&self) -> bool {
        self.pid.is_some()
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus {
            id: self.id,
            state: self.state.name().to_string(),
            in_flight: self.in_flight,
            served: self.served,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn slot() -> WorkerSlot {
        let addr: SocketAddr = "127.0.0.1:5501".parse().unwrap();
        WorkerSlot::new(0, Endpoint::Tcp(addr))
    }

    #[test]
    fn test_eligibility_exclusive_mode() {
        let mut s = slot();
        assert!(!s.eligible(false));

        s.state = SlotState::Ready;
        assert!(s.eligible(false));

        s.in_flight = 1;
        assert!(!s.eligible(false));
    }

    #[test]
    fn test_eligibility_concurrent_mode() {
        let mut s = slot();
        s.state = SlotState::Ready;
        s.in_flight = 3;
        assert!(s.eligible(true));
    }

    #[test]
    fn test_only_ready_is_eligible() {
        let mut s = slot();
        for state in [
            SlotState::Spawning,
            SlotState::AwaitingRegister,
            SlotState::Bootstrapping,
            SlotState::Busy,
            SlotState::Draining,
            SlotState::Dead,
            SlotState::KeepClosed,
        ] {
            s.state = state;
            assert!(!s.eligible(true), "{:?} must not be eligible", state);
        }
    }

    #[test]
    fn test_begin_spawn_resets_child_state() {
        let mut s = slot();
        s.served = 40;
        s.in_flight = 1;
        s.close_when_free = true;
        s.pid = Some(999);

        let gen = s.begin_spawn();
        assert_eq!(gen, 1);
        assert_eq!(s.state, SlotState::Spawning);
        assert_eq!(s.served, 0);
        assert_eq!(s.in_flight, 0);
        assert!(!s.close_when_free);
        assert!(s.pid.is_none());

        assert_eq!(s.begin_spawn(), 2);
    }
}
