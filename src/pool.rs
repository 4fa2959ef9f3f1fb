//! The worker pool.
//!
//! `Pool` owns the slot table, the FIFO queue of dispatcher requests waiting
//! for a worker, and the pool-wide flags. Every mutation happens under one
//! lock so scheduler picks observe a consistent table; no lock is held
//! across an await point. Child processes themselves are owned by per-spawn
//! tasks (see [`crate::supervisor`]) which report back through the
//! generation-stamped `on_*` methods here.

use crate::config::Config;
use crate::error::{PoolError, Result};
use crate::net::Endpoint;
use crate::protocol::{ControlMessage, SlotStatus};
use crate::scheduler::{self, Assignment, Lease, Waiter};
use crate::slot::{ControlLink, SlotState, WorkerSlot};
use crate::supervisor::respawn_delay;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// An order for the supervisor task to (re)spawn a slot's child process.
#[derive(Debug, Clone, Copy)]
pub struct SpawnOrder {
    pub slot_id: usize,
    pub delay: Duration,
}

struct PoolInner {
    slots: Vec<WorkerSlot>,
    waiters: VecDeque<Waiter>,
    in_reload: bool,
    emergency: bool,
    in_shutdown: bool,
    wait_for_initial_fill: bool,
}

/// Shared pool state.
///
/// Designed to be used behind an `Arc` for shared ownership across the
/// control server, dispatcher, watcher, and supervisor tasks; the
/// constructor returns `Arc<Self>` directly to enforce this pattern.
pub struct Pool {
    config: Config,
    run_dir: PathBuf,
    control_addr: Endpoint,
    spawn_tx: mpsc::UnboundedSender<SpawnOrder>,
    inner: Mutex<PoolInner>,
}

impl Pool {
    /// Create the pool and the spawn-order channel its supervisor consumes.
    pub fn new(config: Config, run_dir: &Path) -> (Arc<Self>, mpsc::UnboundedReceiver<SpawnOrder>) {
        let (spawn_tx, spawn_rx) = mpsc::unbounded_channel();
        let slots = (0..config.pool.workers)
            .map(|i| WorkerSlot::new(i, Endpoint::worker_data(run_dir, i)))
            .collect();
        let pool = Arc::new(Self {
            control_addr: Endpoint::control_plane(run_dir),
            run_dir: run_dir.to_path_buf(),
            config,
            spawn_tx,
            inner: Mutex::new(PoolInner {
                slots,
                waiters: VecDeque::new(),
                in_reload: false,
                emergency: false,
                in_shutdown: false,
                wait_for_initial_fill: true,
            }),
        });
        (pool, spawn_rx)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn control_addr(&self) -> &Endpoint {
        &self.control_addr
    }

    /// Queue spawn orders for every slot (initial fill).
    pub fn spawn_all(&self) {
        let n = self.inner.lock().slots.len();
        for slot_id in 0..n {
            self.schedule_respawn(slot_id, Duration::ZERO);
        }
    }

    pub(crate) fn schedule_respawn(&self, slot_id: usize, delay: Duration) {
        let _ = self.spawn_tx.send(SpawnOrder { slot_id, delay });
    }

    // ------------------------------------------------------------------
    // Supervisor callbacks
    // ------------------------------------------------------------------

    /// Reserve a slot for a new spawn. Returns the generation for the
    /// spawn's event callbacks and the slot's data address, or `None` if
    /// the slot must not be spawned (held closed, shutting down, or a child
    /// is already attached).
    pub(crate) fn begin_spawn(&self, slot_id: usize) -> Option<(u64, Endpoint)> {
        let mut inner = self.inner.lock();
        if inner.in_shutdown {
            return None;
        }
        let slot = &mut inner.slots[slot_id];
        if slot.keep_closed || slot.state != SlotState::Dead {
            return None;
        }
        let generation = slot.begin_spawn();
        Some((generation, slot.data_addr.clone()))
    }

    /// Record a successfully spawned child. Returns false if the pool began
    /// shutting down in the meantime, in which case the caller must kill the
    /// child it just spawned.
    pub(crate) fn note_spawned(
        &self,
        slot_id: usize,
        generation: u64,
        pid: u32,
        kill: oneshot::Sender<()>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.in_shutdown || inner.slots[slot_id].generation != generation {
            return false;
        }
        let slot = &mut inner.slots[slot_id];
        slot.pid = Some(pid);
        slot.kill = Some(kill);
        slot.state = SlotState::AwaitingRegister;
        debug!(slot = slot_id, pid, "worker process spawned");
        true
    }

    /// Record a failed spawn attempt. Returns true if the supervisor should
    /// retry.
    pub(crate) fn note_spawn_failed(&self, slot_id: usize, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.in_shutdown {
            return false;
        }
        let slot = &mut inner.slots[slot_id];
        if slot.generation != generation {
            return false;
        }
        slot.state = SlotState::Dead;
        !slot.keep_closed
    }

    // ------------------------------------------------------------------
    // Control-plane callbacks
    // ------------------------------------------------------------------

    /// Bind a freshly registered control connection to its slot, matched by
    /// data address. Sends `bootstrap` on success. A register that matches
    /// no slot awaiting one is a protocol violation.
    pub fn on_register(
        &self,
        data_addr: &str,
        pid: u32,
        link: ControlLink,
    ) -> Result<(usize, u64)> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| {
                s.state == SlotState::AwaitingRegister && s.data_addr.to_string() == data_addr
            })
            .ok_or_else(|| {
                PoolError::Protocol(format!(
                    "register for {} matches no slot awaiting registration",
                    data_addr
                ))
            })?;
        // The reported pid is authoritative: launcher wrappers may exec the
        // real application under a different pid than the direct child.
        slot.pid = Some(pid);
        slot.state = SlotState::Bootstrapping;
        link.send(ControlMessage::Bootstrap);
        slot.control = Some(link);
        info!(slot = slot.id, pid, "worker registered, bootstrapping");
        Ok((slot.id, slot.generation))
    }

    /// A worker finished its bootstrap and is eligible for traffic.
    pub fn on_ready(&self, slot_id: usize, generation: u64) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[slot_id];
        if slot.generation != generation || slot.state != SlotState::Bootstrapping {
            return;
        }
        slot.state = SlotState::Ready;
        slot.bootstrap_failures = 0;
        slot.seen_ready = true;
        info!(slot = slot_id, "worker ready");

        if inner.wait_for_initial_fill && inner.slots.iter().all(|s| s.seen_ready) {
            inner.wait_for_initial_fill = false;
            info!(workers = inner.slots.len(), "all workers booted; pool is ready");
        }
        if inner.emergency && inner.slots.iter().all(|s| s.state == SlotState::Ready) {
            inner.emergency = false;
            info!("pool recovered from emergency mode; all workers ready");
        }
        self.service_waiters(&mut inner);
    }

    /// The control connection for a slot closed: the authoritative
    /// "worker is gone" signal, whether crash, recycle, or violation.
    pub fn on_control_closed(&self, slot_id: usize, generation: u64) {
        let mut inner = self.inner.lock();
        {
            let slot = &inner.slots[slot_id];
            if slot.generation != generation {
                return;
            }
            match slot.state {
                SlotState::Dead | SlotState::KeepClosed | SlotState::Spawning => return,
                _ => {}
            }
        }
        if inner.in_shutdown {
            // Children get SIGTERM and a grace period at shutdown; the
            // control close is expected and must not escalate to SIGKILL.
            let slot = &mut inner.slots[slot_id];
            slot.control = None;
            slot.state = SlotState::Dead;
            return;
        }
        let was_bootstrapping = inner.slots[slot_id].state == SlotState::Bootstrapping;
        self.worker_gone(&mut inner, slot_id, was_bootstrapping);
    }

    /// A slot's child process exited. Fires for every child eventually;
    /// if the control-close path already handled the incident this only
    /// clears the pid.
    pub fn on_child_exit(&self, slot_id: usize, generation: u64, status: Option<i32>) {
        let mut inner = self.inner.lock();
        {
            let slot = &mut inner.slots[slot_id];
            if slot.generation != generation {
                return;
            }
            slot.pid = None;
            slot.kill = None;
            match slot.state {
                SlotState::Dead | SlotState::KeepClosed => return,
                _ => {}
            }
        }
        if inner.in_shutdown {
            inner.slots[slot_id].state = SlotState::Dead;
            return;
        }
        let was_bootstrapping = inner.slots[slot_id].state == SlotState::Bootstrapping;
        warn!(slot = slot_id, code = ?status, "worker process exited unexpectedly");
        self.worker_gone(&mut inner, slot_id, was_bootstrapping);
    }

    /// Shared teardown for a lost worker: release the child and control
    /// link, then decide between respawn, keep-closed, and emergency mode.
    /// Never called while shutting down.
    fn worker_gone(&self, inner: &mut PoolInner, slot_id: usize, was_bootstrapping: bool) {
        {
            let slot = &mut inner.slots[slot_id];
            slot.control = None;
            if let Some(kill) = slot.kill.take() {
                let _ = kill.send(());
            }
            slot.state = SlotState::Dead;
        }

        if was_bootstrapping {
            inner.slots[slot_id].bootstrap_failures += 1;
            let failures = inner.slots[slot_id].bootstrap_failures;
            error!(
                slot = slot_id,
                failures, "worker died during bootstrap"
            );
            if self.config.debug {
                self.enter_emergency(inner);
                return;
            }
            if !inner.slots[slot_id].keep_closed {
                self.schedule_respawn(slot_id, respawn_delay(failures));
            }
            return;
        }

        let slot = &mut inner.slots[slot_id];
        if slot.keep_closed {
            slot.state = SlotState::KeepClosed;
            return;
        }
        self.schedule_respawn(slot_id, Duration::ZERO);
    }

    /// Debug-mode response to a failed bootstrap: hold the whole pool closed
    /// until a source-file change re-enables it.
    fn enter_emergency(&self, inner: &mut PoolInner) {
        inner.emergency = true;
        for slot in inner.slots.iter_mut() {
            slot.keep_closed = true;
            slot.control = None;
            if let Some(kill) = slot.kill.take() {
                let _ = kill.send(());
            }
            slot.state = SlotState::KeepClosed;
        }
        inner.waiters.clear();
        error!("bootstrap failed in debug mode; entering emergency mode until a watched file changes");
    }

    // ------------------------------------------------------------------
    // Dispatcher interface
    // ------------------------------------------------------------------

    /// Request a worker for the next connection. Resolves as soon as an
    /// eligible slot exists, FIFO across callers. Dropping the returned
    /// future cancels the request, even if a lease was already granted
    /// into it.
    pub fn next_worker(self: &Arc<Self>) -> Assignment {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if inner.in_shutdown {
            // tx dropped: the assignment resolves to None.
            return Assignment::new(rx, Arc::downgrade(self));
        }
        match scheduler::pick(&inner.slots, self.config.pool.concurrent_requests) {
            Some(slot_id) => {
                let lease = Self::apply_assign(
                    &mut inner.slots[slot_id],
                    self.config.pool.concurrent_requests,
                );
                let _ = tx.send(lease);
            }
            None => inner.waiters.push_back(tx),
        }
        Assignment::new(rx, Arc::downgrade(self))
    }

    /// The data address the dispatcher should dial for a slot.
    pub fn data_addr(&self, slot_id: usize) -> Endpoint {
        self.inner.lock().slots[slot_id].data_addr.clone()
    }

    /// Release a leased slot after a proxied connection ends. `served` is
    /// false when the back-end dial failed and no request reached the
    /// worker. A lease for a child that has since been replaced is a no-op.
    pub fn release(&self, lease: Lease, served: bool) {
        let mut inner = self.inner.lock();
        {
            let slot = &mut inner.slots[lease.slot_id];
            if slot.generation != lease.generation {
                return;
            }
            slot.in_flight = slot.in_flight.saturating_sub(1);
            if served {
                slot.served += 1;
            }
            if slot.state == SlotState::Busy && slot.in_flight == 0 {
                slot.state = SlotState::Ready;
            }

            let max = self.config.pool.max_requests;
            let hit_max = max > 0 && slot.served >= max;
            if (hit_max || slot.close_when_free) && slot.control.is_some() {
                if slot.in_flight == 0 {
                    info!(slot = lease.slot_id, served = slot.served, "recycling worker");
                    slot.state = SlotState::Draining;
                    // Dropping the link closes the control connection; the
                    // close event funnels through the respawn path.
                    slot.control = None;
                } else {
                    slot.state = SlotState::Draining;
                    slot.close_when_free = true;
                }
            }
        }
        self.service_waiters(&mut inner);
    }

    fn apply_assign(slot: &mut WorkerSlot, concurrent: bool) -> Lease {
        slot.in_flight += 1;
        if !concurrent {
            slot.state = SlotState::Busy;
        }
        Lease {
            slot_id: slot.id,
            generation: slot.generation,
        }
    }

    fn rollback_assign(slot: &mut WorkerSlot, concurrent: bool) {
        slot.in_flight = slot.in_flight.saturating_sub(1);
        if !concurrent && slot.state == SlotState::Busy && slot.in_flight == 0 {
            slot.state = SlotState::Ready;
        }
    }

    /// Hand eligible slots to queued waiters, oldest first. An assignment
    /// whose waiter disappeared is rolled back and re-offered.
    fn service_waiters(&self, inner: &mut PoolInner) {
        let concurrent = self.config.pool.concurrent_requests;
        while !inner.waiters.is_empty() {
            let Some(slot_id) = scheduler::pick(&inner.slots, concurrent) else {
                break;
            };
            let waiter = inner.waiters.pop_front().expect("queue checked non-empty");
            let lease = Self::apply_assign(&mut inner.slots[slot_id], concurrent);
            if waiter.send(lease).is_err() {
                // Caller abandoned the request (client hung up).
                Self::rollback_assign(&mut inner.slots[slot_id], concurrent);
            }
        }
    }

    // ------------------------------------------------------------------
    // Reload, shutdown, introspection
    // ------------------------------------------------------------------

    /// Rolling restart: drain-and-respawn every slot so in-flight requests
    /// finish on the old workers while fresh ones boot. Also the recovery
    /// path out of emergency mode. Returns false if a reload is already in
    /// progress or the pool is shutting down.
    pub fn begin_rolling_restart(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.in_reload || inner.in_shutdown {
            return false;
        }
        inner.in_reload = true;
        info!("restarting worker pool");

        let n = inner.slots.len();
        for slot_id in 0..n {
            let slot = &mut inner.slots[slot_id];
            slot.keep_closed = false;
            slot.bootstrap_failures = 0;
            if slot.control.is_some() {
                if slot.in_flight == 0 {
                    slot.state = SlotState::Draining;
                    slot.control = None;
                } else {
                    slot.state = SlotState::Draining;
                    slot.close_when_free = true;
                }
            } else if matches!(slot.state, SlotState::Dead | SlotState::KeepClosed) {
                slot.state = SlotState::Dead;
                self.schedule_respawn(slot_id, Duration::ZERO);
            }
            // A slot mid-spawn (Spawning/AwaitingRegister) boots into the
            // new source tree already; leave it alone.
        }
        inner.in_reload = false;
        true
    }

    /// Enter shutdown: refuse new assignments, close every control link,
    /// and politely terminate the children. Idempotent; returns false on
    /// repeat calls.
    pub fn begin_shutdown(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.in_shutdown {
            return false;
        }
        inner.in_shutdown = true;
        inner.waiters.clear();
        for slot in inner.slots.iter_mut() {
            slot.control = None;
            if let Some(pid) = slot.pid {
                debug!(slot = slot.id, pid, "sending SIGTERM to worker");
                #[cfg(unix)]
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }
        true
    }

    /// Forcefully kill any child still alive after the shutdown grace
    /// period.
    pub fn kill_remaining(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            if let Some(kill) = slot.kill.take() {
                warn!(slot = slot.id, pid = ?slot.pid, "grace period exceeded, killing worker");
                let _ = kill.send(());
            }
        }
    }

    /// Number of slots with a live child attached.
    pub fn live_children(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.has_child()).count()
    }

    pub fn worker_pid(&self, slot_id: usize) -> Option<u32> {
        self.inner.lock().slots[slot_id].pid
    }

    pub fn is_emergency(&self) -> bool {
        self.inner.lock().emergency
    }

    /// Per-slot counters, also the payload of the `status` control verb.
    pub fn snapshot(&self) -> Vec<SlotStatus> {
        self.inner.lock().slots.iter().map(|s| s.status()).collect()
    }

    pub fn status_reply(&self) -> ControlMessage {
        ControlMessage::Status {
            workers: Some(self.snapshot()),
        }
    }
}
