//! Request admission gates for the registry data path
//!
//! Each traffic direction (pull, push) gets an independent gate that bounds
//! in-flight work and queues the overflow. A request either gets a [`Permit`]
//! immediately, waits its turn in a bounded FIFO queue, or is rejected with
//! a suggested retry delay. Dropping the permit releases the slot and wakes
//! the next waiter.
//!
//! Limits are hot-swappable: the controller pushes resolved spec limits into
//! the gates on every reconciliation pass without draining in-flight work.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::debug;

use crate::crd::{RequestLimitsSpec, RequestsSpec};
use crate::metrics;

/// Fallback in-flight bound for pull traffic
pub const DEFAULT_READ_MAX_RUNNING: usize = 100;
/// Fallback in-flight bound for push traffic
pub const DEFAULT_WRITE_MAX_RUNNING: usize = 25;
/// Fallback queue wait bound
pub const DEFAULT_MAX_WAIT_IN_QUEUE: Duration = Duration::from_secs(30);

/// Traffic direction a gate admits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effective limits for one gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateLimits {
    /// Requests allowed in flight
    pub max_running: usize,

    /// Requests allowed to wait; zero rejects overflow immediately
    pub max_in_queue: usize,

    /// Longest a request may wait before rejection
    pub max_wait: Duration,
}

impl GateLimits {
    /// Resolve declared limits against an operator default.
    ///
    /// Zero or negative values mean unset: maxRunning falls back to the
    /// operator default, maxInQueue to a zero-capacity queue, and the wait
    /// bound to [`DEFAULT_MAX_WAIT_IN_QUEUE`].
    pub fn resolve(spec: &RequestLimitsSpec, default_max_running: usize) -> Self {
        let max_running = if spec.max_running > 0 {
            spec.max_running as usize
        } else {
            default_max_running
        };
        let max_in_queue = if spec.max_in_queue > 0 {
            spec.max_in_queue as usize
        } else {
            0
        };
        let max_wait = if spec.max_wait_in_queue_secs > 0 {
            Duration::from_secs(spec.max_wait_in_queue_secs)
        } else {
            DEFAULT_MAX_WAIT_IN_QUEUE
        };
        Self {
            max_running,
            max_in_queue,
            max_wait,
        }
    }
}

/// Why a request was turned away
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The wait queue was already full on arrival
    QueueFull,
    /// The request waited the full bound without getting a slot
    QueueTimeout,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::QueueFull => "QueueFull",
            RejectReason::QueueTimeout => "QueueTimeout",
        }
    }
}

/// A turned-away request, with a backoff hint scaled by queue pressure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub direction: Direction,
    pub reason: RejectReason,
    pub retry_after: Duration,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} request rejected ({}), retry after {}s",
            self.direction,
            self.reason.as_str(),
            self.retry_after.as_secs()
        )
    }
}

/// An admitted request's slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct Permit {
    gate: Arc<GateInner>,
}

impl Permit {
    /// Release the slot explicitly.
    pub fn release(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.gate.hand_back();
    }
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

/// Undoes an enqueue when the acquire future is dropped while queued, so an
/// abandoned caller stops counting against the queue capacity.
struct QueueGuard {
    gate: Arc<GateInner>,
    id: u64,
    armed: bool,
}

impl QueueGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let direction = self.gate.direction;
        let mut state = self.gate.lock();
        let before = state.queue.len();
        state.queue.retain(|waiter| waiter.id != self.id);
        if state.queue.len() != before {
            state.publish_depth(direction);
        } else {
            // Gone from the queue while still armed: a grant landed before
            // the caller went away, so the slot is ours to give back.
            state.grant_or_release(direction);
        }
    }
}

#[derive(Debug)]
struct GateState {
    limits: GateLimits,
    running: usize,
    next_waiter: u64,
    queue: VecDeque<Waiter>,
}

impl GateState {
    /// Give one slot back: hand it to the next live waiter or free it.
    fn grant_or_release(&mut self, direction: Direction) {
        while let Some(waiter) = self.queue.pop_front() {
            // A dead sender means the waiter gave up; skip it.
            if waiter.tx.send(()).is_ok() {
                // Slot transferred, running stays put.
                self.publish_depth(direction);
                return;
            }
        }
        self.running = self.running.saturating_sub(1);
        self.publish_depth(direction);
    }

    fn reject(&self, direction: Direction, reason: RejectReason) -> Rejection {
        metrics::ADMISSION_REJECTED
            .with_label_values(&[direction.as_str(), reason.as_str()])
            .inc();
        Rejection {
            direction,
            reason,
            retry_after: self.retry_after(),
        }
    }

    /// Backoff hint: the wait bound scaled by current queue occupancy,
    /// never less than a second.
    fn retry_after(&self) -> Duration {
        let occupancy = self.queue.len() as u64 + 1;
        let capacity = self.limits.max_in_queue as u64 + 1;
        let secs = self
            .limits
            .max_wait
            .as_secs()
            .saturating_mul(occupancy)
            .checked_div(capacity)
            .unwrap_or(0);
        Duration::from_secs(secs.max(1))
    }

    fn publish_depth(&self, direction: Direction) {
        metrics::ADMISSION_QUEUE_DEPTH
            .with_label_values(&[direction.as_str()])
            .set(self.queue.len() as f64);
    }
}

#[derive(Debug)]
struct GateInner {
    direction: Direction,
    state: Mutex<GateState>,
}

impl GateInner {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hand_back(&self) {
        self.lock().grant_or_release(self.direction);
    }
}

/// One direction's admission gate
#[derive(Clone, Debug)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Gate {
    pub fn new(direction: Direction, limits: GateLimits) -> Self {
        Self {
            inner: Arc::new(GateInner {
                direction,
                state: Mutex::new(GateState {
                    limits,
                    running: 0,
                    next_waiter: 0,
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Requests in flight, including granted permits not yet polled
    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    /// Requests currently waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Swap in new limits and promote waiters into any newly opened slots.
    pub fn update_limits(&self, limits: GateLimits) {
        let direction = self.inner.direction;
        let mut state = self.inner.lock();
        if state.limits == limits {
            return;
        }
        debug!(
            "Updating {} admission limits: maxRunning={}, maxInQueue={}, maxWait={}s",
            direction,
            limits.max_running,
            limits.max_in_queue,
            limits.max_wait.as_secs()
        );
        state.limits = limits;
        while state.running < state.limits.max_running {
            match state.queue.pop_front() {
                Some(waiter) => {
                    if waiter.tx.send(()).is_ok() {
                        state.running += 1;
                    }
                }
                None => break,
            }
        }
        state.publish_depth(direction);
    }

    /// Admit a request, waiting in the queue if the gate is saturated.
    pub async fn acquire(&self) -> Result<Permit, Rejection> {
        let direction = self.inner.direction;
        let (id, mut rx, max_wait) = {
            let mut state = self.inner.lock();
            if state.running < state.limits.max_running {
                state.running += 1;
                metrics::ADMISSION_ADMITTED
                    .with_label_values(&[direction.as_str()])
                    .inc();
                return Ok(Permit {
                    gate: Arc::clone(&self.inner),
                });
            }
            if state.queue.len() >= state.limits.max_in_queue {
                return Err(state.reject(direction, RejectReason::QueueFull));
            }
            let id = state.next_waiter;
            state.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter { id, tx });
            state.publish_depth(direction);
            (id, rx, state.limits.max_wait)
        };

        // Declared after rx: on cancellation the guard drops first, while
        // the receiver is still alive, so a raced grant is handed back.
        let mut guard = QueueGuard {
            gate: Arc::clone(&self.inner),
            id,
            armed: true,
        };

        let enqueued = Instant::now();
        let granted = tokio::select! {
            result = &mut rx => result.is_ok(),
            _ = tokio::time::sleep(max_wait) => false,
        };
        metrics::ADMISSION_WAIT
            .with_label_values(&[direction.as_str()])
            .observe(enqueued.elapsed().as_secs_f64());

        if granted {
            guard.disarm();
            metrics::ADMISSION_ADMITTED
                .with_label_values(&[direction.as_str()])
                .inc();
            return Ok(Permit {
                gate: Arc::clone(&self.inner),
            });
        }

        let rejection = {
            guard.disarm();
            let mut state = self.inner.lock();
            let before = state.queue.len();
            state.queue.retain(|waiter| waiter.id != id);
            let removed = state.queue.len() != before;
            state.publish_depth(direction);
            if !removed {
                // The receiver stayed alive until now, so if we are no
                // longer queued a grant must have landed; the slot is ours
                // to give back.
                state.grant_or_release(direction);
            }
            state.reject(direction, RejectReason::QueueTimeout)
        };
        Err(rejection)
    }
}

/// Operator-level fallback bounds, taken from configuration
#[derive(Clone, Copy, Debug)]
pub struct GateDefaults {
    pub read_max_running: usize,
    pub write_max_running: usize,
}

impl Default for GateDefaults {
    fn default() -> Self {
        Self {
            read_max_running: DEFAULT_READ_MAX_RUNNING,
            write_max_running: DEFAULT_WRITE_MAX_RUNNING,
        }
    }
}

/// The pair of gates guarding the registry data path
#[derive(Clone, Debug)]
pub struct RequestGates {
    defaults: GateDefaults,
    read: Gate,
    write: Gate,
}

impl RequestGates {
    pub fn new(defaults: GateDefaults) -> Self {
        let unset = RequestsSpec::default();
        Self {
            defaults,
            read: Gate::new(
                Direction::Read,
                GateLimits::resolve(&unset.read, defaults.read_max_running),
            ),
            write: Gate::new(
                Direction::Write,
                GateLimits::resolve(&unset.write, defaults.write_max_running),
            ),
        }
    }

    /// Push declared limits into both gates.
    pub fn apply(&self, spec: &RequestsSpec) {
        self.read
            .update_limits(GateLimits::resolve(&spec.read, self.defaults.read_max_running));
        self.write
            .update_limits(GateLimits::resolve(&spec.write, self.defaults.write_max_running));
    }

    pub fn read(&self) -> &Gate {
        &self.read
    }

    pub fn write(&self) -> &Gate {
        &self.write
    }
}

impl Default for RequestGates {
    fn default() -> Self {
        Self::new(GateDefaults::default())
    }
}
