//! Integration tests for the request admission gates
//!
//! Timer-dependent cases run on a paused tokio clock and poll the acquire
//! futures by hand with tokio-test, so queue timeouts are exercised without
//! real waiting.

use std::time::Duration;

use tokio_test::task;
use tokio_test::{assert_pending, assert_ready, assert_ready_ok};

use image_registry_operator::admission::{
    Direction, Gate, GateDefaults, GateLimits, RejectReason, RequestGates,
    DEFAULT_MAX_WAIT_IN_QUEUE, DEFAULT_READ_MAX_RUNNING, DEFAULT_WRITE_MAX_RUNNING,
};
use image_registry_operator::crd::{RequestLimitsSpec, RequestsSpec};

// ============================================================================
// Test Helpers
// ============================================================================

fn limits(max_running: usize, max_in_queue: usize, max_wait_secs: u64) -> GateLimits {
    GateLimits {
        max_running,
        max_in_queue,
        max_wait: Duration::from_secs(max_wait_secs),
    }
}

fn gate(max_running: usize, max_in_queue: usize, max_wait_secs: u64) -> Gate {
    Gate::new(Direction::Read, limits(max_running, max_in_queue, max_wait_secs))
}

/// Spawn an acquire call as a hand-polled task
fn spawn_acquire(
    gate: &Gate,
) -> task::Spawn<
    impl std::future::Future<
        Output = Result<
            image_registry_operator::admission::Permit,
            image_registry_operator::admission::Rejection,
        >,
    >,
> {
    let gate = gate.clone();
    task::spawn(async move { gate.acquire().await })
}

// ============================================================================
// Immediate admission and saturation
// ============================================================================

#[tokio::test]
async fn admits_up_to_max_running_immediately() {
    let gate = gate(3, 5, 60);

    let mut permits = Vec::new();
    for _ in 0..3 {
        permits.push(gate.acquire().await.expect("should admit under limit"));
    }
    assert_eq!(gate.running(), 3);

    // The fourth call queues instead of running.
    let mut fourth = spawn_acquire(&gate);
    assert_pending!(fourth.poll());
    assert_eq!(gate.running(), 3);
    assert_eq!(gate.queue_len(), 1);
}

#[tokio::test]
async fn release_grants_the_queue_head() {
    let gate = gate(1, 5, 60);
    let permit = gate.acquire().await.expect("first acquire");

    let mut waiting = spawn_acquire(&gate);
    assert_pending!(waiting.poll());

    drop(permit);
    let next = assert_ready_ok!(waiting.poll());

    // The slot transferred; nothing was freed in between.
    assert_eq!(gate.running(), 1);
    assert_eq!(gate.queue_len(), 0);
    drop(next);
    assert_eq!(gate.running(), 0);
}

#[tokio::test]
async fn waiters_are_granted_in_fifo_order() {
    let gate = gate(1, 5, 60);
    let permit = gate.acquire().await.expect("first acquire");

    let mut first = spawn_acquire(&gate);
    assert_pending!(first.poll());
    let mut second = spawn_acquire(&gate);
    assert_pending!(second.poll());
    assert_eq!(gate.queue_len(), 2);

    drop(permit);
    assert_pending!(second.poll());
    let head = assert_ready_ok!(first.poll());

    drop(head);
    assert_ready_ok!(second.poll());
}

// ============================================================================
// Rejection: QueueFull
// ============================================================================

#[tokio::test]
async fn zero_queue_capacity_rejects_overflow_immediately() {
    let gate = gate(1, 0, 40);
    let _permit = gate.acquire().await.expect("first acquire");

    let rejection = gate.acquire().await.expect_err("should reject");
    assert_eq!(rejection.reason, RejectReason::QueueFull);
    assert_eq!(rejection.direction, Direction::Read);
    assert_eq!(gate.queue_len(), 0);
}

#[tokio::test]
async fn full_queue_rejects_new_arrivals() {
    let gate = gate(1, 1, 60);
    let _permit = gate.acquire().await.expect("first acquire");

    let mut queued = spawn_acquire(&gate);
    assert_pending!(queued.poll());

    let rejection = gate.acquire().await.expect_err("queue is full");
    assert_eq!(rejection.reason, RejectReason::QueueFull);
    assert_eq!(gate.queue_len(), 1);
}

#[tokio::test]
async fn retry_after_reflects_the_wait_bound() {
    let gate = gate(1, 0, 40);
    let _permit = gate.acquire().await.expect("first acquire");

    let rejection = gate.acquire().await.expect_err("should reject");
    assert_eq!(rejection.retry_after, Duration::from_secs(40));
}

// ============================================================================
// Rejection: QueueTimeout
// ============================================================================

#[tokio::test(start_paused = true)]
async fn queued_request_times_out() {
    let gate = gate(1, 5, 5);
    let _permit = gate.acquire().await.expect("first acquire");

    let mut waiting = spawn_acquire(&gate);
    assert_pending!(waiting.poll());
    assert_eq!(gate.queue_len(), 1);

    tokio::time::advance(Duration::from_secs(6)).await;

    let rejection = assert_ready!(waiting.poll()).expect_err("should time out");
    assert_eq!(rejection.reason, RejectReason::QueueTimeout);

    // The timed-out waiter left no residue in the counts.
    assert_eq!(gate.queue_len(), 0);
    assert_eq!(gate.running(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_of_one_waiter_preserves_fifo_for_the_rest() {
    let gate = gate(1, 5, 5);
    let permit = gate.acquire().await.expect("first acquire");

    let mut impatient = spawn_acquire(&gate);
    assert_pending!(impatient.poll());

    // The second waiter enqueues three seconds later, so only the first
    // one's timer fires at the five-second mark.
    tokio::time::advance(Duration::from_secs(3)).await;
    let mut patient = spawn_acquire(&gate);
    assert_pending!(patient.poll());

    tokio::time::advance(Duration::from_secs(3)).await;
    let rejection = assert_ready!(impatient.poll()).expect_err("head should time out");
    assert_eq!(rejection.reason, RejectReason::QueueTimeout);
    assert_eq!(gate.queue_len(), 1);

    drop(permit);
    assert_ready_ok!(patient.poll());
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn abandoned_waiter_is_skipped_on_grant() {
    let gate = gate(1, 5, 60);
    let permit = gate.acquire().await.expect("first acquire");

    let mut abandoned = spawn_acquire(&gate);
    assert_pending!(abandoned.poll());
    let mut still_waiting = spawn_acquire(&gate);
    assert_pending!(still_waiting.poll());

    // Caller disconnects while queued.
    drop(abandoned);

    drop(permit);
    let granted = assert_ready_ok!(still_waiting.poll());
    assert_eq!(gate.running(), 1);
    drop(granted);
}

#[tokio::test]
async fn abandoned_waiter_frees_queue_capacity() {
    let gate = gate(1, 1, 60);
    let permit = gate.acquire().await.expect("first acquire");

    let mut abandoned = spawn_acquire(&gate);
    assert_pending!(abandoned.poll());
    assert_eq!(gate.queue_len(), 1);

    // Dropping the queued acquire vacates its queue slot at once; the next
    // arrival queues instead of being rejected QueueFull.
    drop(abandoned);
    assert_eq!(gate.queue_len(), 0);

    let mut waiting = spawn_acquire(&gate);
    assert_pending!(waiting.poll());
    assert_eq!(gate.queue_len(), 1);

    drop(permit);
    assert_ready_ok!(waiting.poll());
}

#[tokio::test]
async fn abandoning_every_waiter_frees_the_slot() {
    let gate = gate(1, 5, 60);
    let permit = gate.acquire().await.expect("first acquire");

    let mut abandoned = spawn_acquire(&gate);
    assert_pending!(abandoned.poll());
    drop(abandoned);

    drop(permit);
    assert_eq!(gate.running(), 0);
    assert_eq!(gate.queue_len(), 0);
}

// ============================================================================
// Limit updates
// ============================================================================

#[tokio::test]
async fn raising_max_running_promotes_waiters() {
    let gate = gate(1, 5, 60);
    let _permit = gate.acquire().await.expect("first acquire");

    let mut waiting = spawn_acquire(&gate);
    assert_pending!(waiting.poll());

    gate.update_limits(limits(2, 5, 60));
    let granted = assert_ready_ok!(waiting.poll());
    assert_eq!(gate.running(), 2);
    drop(granted);
}

#[tokio::test]
async fn lowering_max_running_keeps_inflight_work() {
    let gate = gate(2, 5, 60);
    let first = gate.acquire().await.expect("first acquire");
    let _second = gate.acquire().await.expect("second acquire");

    gate.update_limits(limits(1, 5, 60));
    assert_eq!(gate.running(), 2);

    // The freed slot is not reissued while over the new ceiling.
    drop(first);
    assert_eq!(gate.running(), 1);
    let mut waiting = spawn_acquire(&gate);
    assert_pending!(waiting.poll());
}

// ============================================================================
// Defaults and spec resolution
// ============================================================================

#[test]
fn unset_limits_resolve_to_operator_defaults() {
    let resolved = GateLimits::resolve(&RequestLimitsSpec::default(), 100);
    assert_eq!(resolved.max_running, 100);
    assert_eq!(resolved.max_in_queue, 0);
    assert_eq!(resolved.max_wait, DEFAULT_MAX_WAIT_IN_QUEUE);
}

#[test]
fn negative_max_running_means_unset() {
    let spec = RequestLimitsSpec {
        max_running: -5,
        max_in_queue: -1,
        max_wait_in_queue_secs: 0,
    };
    let resolved = GateLimits::resolve(&spec, 25);
    assert_eq!(resolved.max_running, 25);
    assert_eq!(resolved.max_in_queue, 0);
}

#[test]
fn explicit_limits_resolve_verbatim() {
    let spec = RequestLimitsSpec {
        max_running: 10,
        max_in_queue: 4,
        max_wait_in_queue_secs: 7,
    };
    let resolved = GateLimits::resolve(&spec, 100);
    assert_eq!(resolved, limits(10, 4, 7));
}

// ============================================================================
// RequestGates: direction independence
// ============================================================================

#[tokio::test]
async fn saturated_write_path_does_not_block_reads() {
    let gates = RequestGates::new(GateDefaults {
        read_max_running: 1,
        write_max_running: 1,
    });

    let _write = gates.write().acquire().await.expect("write admit");
    let mut blocked_write = spawn_acquire(gates.write());
    // Default queue capacity is zero, so the spec below opens one.
    gates.apply(&RequestsSpec {
        read: RequestLimitsSpec {
            max_running: 1,
            max_in_queue: 1,
            max_wait_in_queue_secs: 60,
        },
        write: RequestLimitsSpec {
            max_running: 1,
            max_in_queue: 1,
            max_wait_in_queue_secs: 60,
        },
    });
    assert_pending!(blocked_write.poll());

    // Read admission is unaffected by write saturation.
    let read = gates.read().acquire().await.expect("read admit");
    drop(read);
    assert_eq!(gates.read().running(), 0);
    assert_eq!(gates.write().running(), 1);
}

#[tokio::test]
async fn apply_pushes_spec_limits_into_both_gates() {
    let gates = RequestGates::new(GateDefaults::default());
    gates.apply(&RequestsSpec {
        read: RequestLimitsSpec {
            max_running: 2,
            max_in_queue: 0,
            max_wait_in_queue_secs: 0,
        },
        write: RequestLimitsSpec {
            max_running: 1,
            max_in_queue: 0,
            max_wait_in_queue_secs: 0,
        },
    });

    let _r1 = gates.read().acquire().await.expect("read 1");
    let _r2 = gates.read().acquire().await.expect("read 2");
    let rejection = gates.read().acquire().await.expect_err("read over limit");
    assert_eq!(rejection.reason, RejectReason::QueueFull);

    let _w1 = gates.write().acquire().await.expect("write 1");
    assert!(gates.write().acquire().await.is_err());
}

#[test]
fn operator_defaults_differ_per_direction() {
    let defaults = GateDefaults::default();
    assert_eq!(defaults.read_max_running, DEFAULT_READ_MAX_RUNNING);
    assert_eq!(defaults.write_max_running, DEFAULT_WRITE_MAX_RUNNING);
    assert!(defaults.read_max_running > defaults.write_max_running);
}
