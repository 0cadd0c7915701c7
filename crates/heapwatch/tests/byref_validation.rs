//! Byref Validation Tests - Deferred and immediate interop validation
//!
//! These tests verify validation against a mapped segment:
//! - Backpressure forces exactly one collection per overflow
//! - The queue is always empty after a pass, even a failing one
//! - Corruption is reported with the right culprit
//! - The object after a validated one is tolerated while in transition
//!
//! ============================================================================
//! Silent corruption is the bug class under test. DO NOT WEAKEN ASSERTIONS.
//! ============================================================================

mod common;

use common::{WatchFixture, WORD};
use heapwatch::logging::{get_events, WatchEvent};
use heapwatch::object::{MethodIdentity, BIT_SBLK_IS_HASH_OR_SYNCBLKINDEX};
use heapwatch::{HeapWatchConfig, ObjectRef};
use std::sync::atomic::{AtomicUsize, Ordering};

const CALLI_MESSAGE: &str =
    "Detected managed heap corruption, likely culprit is interop call through CALLI.";

fn fill() -> MethodIdentity {
    MethodIdentity::new("App.Native", "Fill")
}

// ============================================================================
// QUEUE AND BACKPRESSURE
// ============================================================================

/// Test exceeding the limit requests exactly one collection
///
/// **Bug this finds:** Off-by-one in the limit check, lock held across the request
/// **Invariant verified:** Collection requested once pending > max
#[test]
fn test_backpressure_forces_one_collection() {
    // Arrange
    let fx = WatchFixture::with_config(HeapWatchConfig {
        max_byref_validation_entries: 2,
        ..Default::default()
    });
    let obj = fx.node();
    let validator = fx.runtime.validator();

    // Act: fill to the limit
    validator.validate_byref(obj + WORD, None, 0);
    validator.validate_byref(obj + WORD, None, 0);

    // Assert
    assert_eq!(fx.runtime.segment().collection_count(), 0);
    assert_eq!(validator.queue().len(), 2);

    // Act: exceed it
    validator.validate_byref(obj + 2 * WORD, None, 0);

    // Assert
    assert_eq!(
        fx.runtime.segment().collection_count(),
        1,
        "third enqueue must request exactly one collection"
    );
    assert!(validator.queue().is_empty(), "collection must drain the queue");
}

/// Test byrefs outside the heap are not queued
///
/// **Bug this finds:** Stack byrefs resolved as heap objects
#[test]
fn test_non_heap_byref_ignored() {
    let fx = WatchFixture::with_defaults();
    let local = 0usize;
    let validator = fx.runtime.validator();

    validator.validate_byref(&local as *const usize as usize, Some(fill()), 0);
    validator.validate_byref(0, None, 0);

    assert!(validator.queue().is_empty());
}

/// Test enqueue order is kept and the method recorded
///
/// **Bug this finds:** Entries reordered or methods dropped while growing
#[test]
fn test_queue_keeps_order_and_method() {
    let fx = WatchFixture::with_defaults();
    let a = fx.node();
    let b = fx.node();
    let validator = fx.runtime.validator();

    validator.validate_byref(a + WORD, Some(fill()), 0);
    validator.validate_byref(b + WORD, None, 0);

    let pending = validator.queue().snapshot();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].pointer, a + WORD);
    assert_eq!(pending[0].method, Some(fill()));
    assert_eq!(pending[1].pointer, b + WORD);
    assert_eq!(pending[1].method, None);
}

/// Test concurrent interop calls all land in the queue
///
/// **Bug this finds:** Lost appends under contention
#[test]
fn test_concurrent_enqueue() {
    let fx = WatchFixture::with_config(HeapWatchConfig {
        max_byref_validation_entries: 10_000,
        ..Default::default()
    });
    let obj = fx.node();
    let validator = fx.runtime.validator();

    crossbeam::scope(|s| {
        for _ in 0..4 {
            s.spawn(move |_| {
                for _ in 0..250 {
                    validator.validate_byref(obj + WORD, None, 0);
                }
            });
        }
    })
    .expect("interop threads should not panic");

    assert_eq!(validator.queue().len(), 1000);
    fx.runtime.collect();
    assert!(validator.queue().is_empty());
    assert_eq!(fx.runtime.segment().collection_count(), 0);
}

/// Test two mutators crossing the limit together both make progress
///
/// **Bug this finds:** Second requester stops the world while the first waits
/// for it to arrive, leaving both spinning forever
/// **Invariant verified:** An enqueue never blocks a mutator unboundedly
#[test]
fn test_simultaneous_backpressure_does_not_deadlock() {
    let fx = WatchFixture::with_config(HeapWatchConfig {
        max_byref_validation_entries: 2,
        ..Default::default()
    });
    let obj = fx.node();
    let runtime = &fx.runtime;

    // Each mutator counts the other as the one to wait for
    runtime.safepoint().set_total_threads(1);
    let finished = AtomicUsize::new(0);

    crossbeam::scope(|s| {
        for _ in 0..2 {
            let finished = &finished;
            s.spawn(move |_| {
                for _ in 0..200 {
                    runtime.validator().validate_byref(obj + WORD, None, 0);
                    runtime.safepoint().poll();
                }
                finished.fetch_add(1, Ordering::AcqRel);

                // Stay reachable until the other mutator is done too
                while finished.load(Ordering::Acquire) < 2 {
                    runtime.safepoint().poll();
                    std::hint::spin_loop();
                }
            });
        }
    })
    .expect("mutator threads should not panic");

    assert!(runtime.segment().collection_count() > 0);
    assert!(!runtime.safepoint().is_requested());

    runtime.safepoint().set_total_threads(0);
    runtime.collect();
    assert!(runtime.validator().queue().is_empty());
}

// ============================================================================
// CORRUPTION DETECTION
// ============================================================================

/// Test a smashed method table is fatal and names the interop method
///
/// **Bug this finds:** Corruption reported against the wrong call site
#[test]
fn test_corrupt_method_table_is_fatal() {
    let fx = WatchFixture::with_defaults();
    let obj = fx.node();
    fx.runtime.validator().validate_byref(obj + WORD, Some(fill()), 0);

    // Native code overwrote the object header
    fx.poke(obj, 0xbad0);

    let message = fx.expect_fatal(|| fx.runtime.collect());
    assert_eq!(
        message,
        "Detected managed heap corruption, likely culprit is interop call through method 'App.Native.Fill'."
    );

    let reported = get_events().into_iter().any(|event| {
        matches!(
            event,
            WatchEvent::CorruptionDetected { pointer, ref culprit }
                if pointer == obj + WORD && culprit == "App.Native.Fill"
        )
    });
    assert!(reported, "corruption event must be emitted");
}

/// Test a pass that fails still leaves the queue empty
///
/// **Bug this finds:** Stale entries revalidated on every later pass
#[test]
fn test_failed_pass_empties_queue() {
    let fx = WatchFixture::with_defaults();
    let good = fx.node();
    let bad = fx.node();
    let tail = fx.node();
    let validator = fx.runtime.validator();

    validator.validate_byref(good + WORD, None, 0);
    validator.validate_byref(tail + WORD, None, 0);
    validator.validate_byref(bad + WORD, None, 0);
    fx.poke(bad + WORD, 0x10);

    let message = fx.expect_fatal(|| fx.runtime.collect());
    assert_eq!(message, CALLI_MESSAGE);
    assert!(validator.queue().is_empty());
}

/// Test a delegate `this` names the delegate's invoke method
///
/// **Bug this finds:** Delegate calls misreported as CALLI
#[test]
fn test_delegate_names_invoke_method() {
    let fx = WatchFixture::with_defaults();
    let callback = fx.delegate();
    let obj = fx.node();
    fx.runtime.validator().validate_byref(obj + WORD, None, callback);
    fx.poke(obj, 0);

    let message = fx.expect_fatal(|| fx.runtime.collect());
    assert_eq!(
        message,
        "Detected managed heap corruption, likely culprit is interop call through method 'App.Callback.Invoke'."
    );
}

/// Test an invalid sync block index in the validated object is fatal
///
/// **Bug this finds:** Header corruption not covered by validation
#[test]
fn test_bad_sync_block_is_fatal() {
    let fx = WatchFixture::with_defaults();
    let obj = fx.node();
    let handle = ObjectRef::new(obj).expect("non-null");

    fx.runtime
        .segment()
        .set_header(handle, BIT_SBLK_IS_HASH_OR_SYNCBLKINDEX | 5)
        .expect("allocated header");
    fx.runtime.validator().validate_byref(obj + WORD, None, 0);
    fx.runtime.collect();

    fx.runtime
        .segment()
        .set_header(handle, BIT_SBLK_IS_HASH_OR_SYNCBLKINDEX | 4000)
        .expect("allocated header");
    fx.runtime.validator().validate_byref(obj + WORD, None, 0);
    let message = fx.expect_fatal(|| fx.runtime.collect());
    assert_eq!(message, CALLI_MESSAGE);
}

/// Test interior byrefs into arrays resolve to the array
///
/// **Bug this finds:** Containing object lookup stopping at the wrong object
#[test]
fn test_interior_array_byref() {
    let fx = WatchFixture::with_defaults();
    let first = fx.node();
    let bytes = fx.byte_array(300);
    let refs = fx.reference_array(8);
    fx.poke(refs + 2 * WORD + 3 * WORD, first);

    let validator = fx.runtime.validator();
    validator.validate_byref(bytes + 2 * WORD + 200, None, 0);
    validator.validate_byref(refs + 2 * WORD + 7 * WORD, None, 0);
    fx.runtime.collect();
    assert!(validator.queue().is_empty());
}

/// Test a byref one past the last element of the newest object is skipped
///
/// **Bug this finds:** End-of-span byref at the allocation top reported as
/// corruption of a healthy heap
#[test]
fn test_past_the_end_byref_is_skipped() {
    let fx = WatchFixture::with_defaults();
    let bytes = fx.byte_array(8);
    let past_end = bytes + 2 * WORD + 8;
    assert_eq!(past_end, fx.runtime.segment().top());

    let validator = fx.runtime.validator();
    validator.validate_byref(past_end, Some(fill()), 0);
    assert_eq!(validator.queue().len(), 1);

    fx.runtime.collect();
    assert!(validator.queue().is_empty());
}

// ============================================================================
// NEXT OBJECT TOLERANCE
// ============================================================================

/// Test the following object may be free, null or transitional
///
/// **Bug this finds:** False corruption reports during a background sweep
#[test]
fn test_next_object_in_transition_is_tolerated() {
    let fx = WatchFixture::with_config(HeapWatchConfig {
        transitional_headers: vec![0xdead_0000],
        ..Default::default()
    });
    let obj = fx.node();
    let next = fx.node();
    let validator = fx.runtime.validator();

    // Free
    fx.runtime
        .segment()
        .make_free(ObjectRef::new(next).expect("non-null"))
        .expect("sizable object");
    validator.validate_byref(obj + WORD, None, 0);
    fx.runtime.collect();

    // Null
    fx.poke(next, 0);
    validator.validate_byref(obj + WORD, None, 0);
    fx.runtime.collect();

    // Configured transitional marker
    fx.poke(next, 0xdead_0000);
    validator.validate_byref(obj + WORD, None, 0);
    fx.runtime.collect();

    // Anything else is corruption
    fx.poke(next, 0xbad0);
    validator.validate_byref(obj + WORD, None, 0);
    let message = fx.expect_fatal(|| fx.runtime.collect());
    assert_eq!(message, CALLI_MESSAGE);
}

/// Test the following object's sync block is not checked
///
/// **Bug this finds:** Dead neighbour's released sync block reported as corruption
#[test]
fn test_next_object_sync_block_ignored() {
    let fx = WatchFixture::with_defaults();
    let obj = fx.node();
    let next = fx.node();
    fx.runtime
        .segment()
        .set_header(
            ObjectRef::new(next).expect("non-null"),
            BIT_SBLK_IS_HASH_OR_SYNCBLKINDEX | 4000,
        )
        .expect("allocated header");

    fx.runtime.validator().validate_byref(obj + WORD, None, 0);
    fx.runtime.collect();
}

// ============================================================================
// IMMEDIATE VALIDATION
// ============================================================================

/// Test immediate validation skips the next object during a background GC
///
/// **Bug this finds:** Racing with the sweeper on the neighbour's header
#[test]
fn test_immediate_validation_and_concurrent_gc() {
    let fx = WatchFixture::with_defaults();
    let obj = fx.node();
    let next = fx.node();
    fx.poke(next, 0xbad0);
    let validator = fx.runtime.validator();

    fx.runtime.segment().set_concurrent_gc(true);
    validator.validate(obj, Some(fill()), 0);

    fx.runtime.segment().set_concurrent_gc(false);
    let message = fx.expect_fatal(|| validator.validate(obj, Some(fill()), 0));
    assert_eq!(
        message,
        "Detected managed heap corruption, likely culprit is interop call through method 'App.Native.Fill'."
    );
}

/// Test immediate validation of null is a no-op
///
/// **Bug this finds:** Null pinned arguments reported as corruption
#[test]
fn test_immediate_null_is_ignored() {
    let fx = WatchFixture::with_defaults();
    fx.runtime.validator().validate(0, None, 0);
    fx.runtime.validator().log_pinned_argument(Some(&fill()), 0);
}

/// Test pinned argument tracing reports the object size
///
/// **Bug this finds:** Size computed from the wrong method table
#[test]
fn test_log_pinned_argument() {
    let fx = WatchFixture::with_defaults();
    let bytes = fx.byte_array(100);

    // Trace events are below the default retention level; this must not panic
    fx.runtime.validator().log_pinned_argument(Some(&fill()), bytes);
    fx.runtime.validator().log_pinned_argument(None, bytes);

    assert_eq!(
        heapwatch::validation::object_size(fx.runtime.segment().as_ref(), bytes),
        Some(128)
    );
}
