//! Shadow-stack behavior observed through the record stream: pop
//! coalescing, seeding, and cooperative stack switching.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use mneme::{
    AllocatorKind, CaptureReader, CaptureStats, CodeDescriptor, CodeId, CollectSink, Record, ShadowFrame, ThreadId,
    TrackedEvent, Tracker, TrackerBuilder,
};
use pretty_assertions::assert_eq;

static TRACKER_LOCK: Mutex<()> = Mutex::new(());

fn tracker_lock() -> MutexGuard<'static, ()> {
    TRACKER_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn collect_capture(
    configure: impl FnOnce(TrackerBuilder) -> TrackerBuilder,
    session: impl FnOnce(&Tracker),
) -> (Vec<u8>, CaptureStats) {
    let _serialized = tracker_lock();
    let sink = CollectSink::new();
    let handle = sink.handle();
    let builder = configure(TrackerBuilder::with_sink(Box::new(sink)).memory_interval_ms(0));
    let tracker = builder.start().expect("tracker failed to start");
    session(&tracker);
    let stats = tracker.finish().expect("tracker failed to close");
    let bytes = handle.lock().unwrap().clone();
    (bytes, stats)
}

#[test]
fn long_pop_runs_chain_in_batches_of_sixteen() {
    const DEPTH: usize = 40;
    let (bytes, _) = collect_capture(
        |builder| builder,
        |tracker| {
            let code = tracker.intern_code(&CodeDescriptor::flat("nest", "deep.py", 1));
            tracker.on_thread_start(ThreadId(1), "main");
            for _ in 0..DEPTH {
                tracker.on_frame_enter(code, false);
            }
            for _ in 0..DEPTH {
                tracker.on_frame_leave();
            }
            // The coalesced pops flush ahead of the next event.
            tracker.record_allocation(AllocatorKind::Malloc, 0x1000, 1);
        },
    );

    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    let mut pushes = 0u32;
    let mut pops = Vec::new();
    while let Some((_, record)) = reader.next_record().unwrap() {
        match record {
            Record::FramePush(_) => pushes += 1,
            Record::FramePop { count } => pops.push(count),
            _ => {}
        }
    }
    assert_eq!(pushes, 40);
    assert_eq!(pops, vec![16, 16, 8]);
}

#[test]
fn pending_pops_flush_at_teardown() {
    const DEPTH: usize = 20;
    // The last thread action is a leave, so the coalesced pops are still
    // pending when the tracker closes; teardown must put them on the wire.
    let (bytes, _) = collect_capture(
        |builder| builder,
        |tracker| {
            let code = tracker.intern_code(&CodeDescriptor::flat("nest", "deep.py", 1));
            tracker.on_thread_start(ThreadId(1), "main");
            for _ in 0..DEPTH {
                tracker.on_frame_enter(code, false);
            }
            for _ in 0..DEPTH {
                tracker.on_frame_leave();
            }
        },
    );

    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    let mut depth: i64 = 0;
    let mut pops = Vec::new();
    while let Some((_, record)) = reader.next_record().unwrap() {
        match record {
            Record::FramePush(_) => depth += 1,
            Record::FramePop { count } => {
                depth -= i64::from(count);
                pops.push(count);
            }
            _ => {}
        }
        assert!(depth >= 0, "stream prefix drove the stack depth negative");
    }
    assert_eq!(pops, vec![16, 4]);
    assert_eq!(depth, 0, "teardown left pops unflushed");
    assert_eq!(reader.outcome(), Some(mneme::CaptureOutcome::Complete));
}

#[test]
fn pop_of_untracked_frames_is_clamped() {
    // Leaves without matching enters (frames predating the tracker) must
    // not emit pops the replayed stack cannot absorb.
    let (bytes, _) = collect_capture(
        |builder| builder,
        |tracker| {
            let code = tracker.intern_code(&CodeDescriptor::flat("f", "m.py", 1));
            tracker.on_thread_start(ThreadId(1), "main");
            tracker.on_frame_leave();
            tracker.on_frame_leave();
            tracker.on_frame_enter(code, false);
            tracker.record_allocation(AllocatorKind::Malloc, 0x10, 1);
        },
    );
    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    // Replay validates that no pop underflows; reaching the end is the
    // assertion.
    while reader.next_record().unwrap().is_some() {}
    assert_eq!(reader.outcome().is_some(), true);
}

#[test]
fn stack_switch_replaces_the_chain_atomically() {
    let (bytes, _) = collect_capture(
        |builder| builder,
        |tracker| {
            let caller = tracker.intern_code(&CodeDescriptor::flat("caller", "app.py", 1));
            let callee = tracker.intern_code(&CodeDescriptor::flat("callee", "app.py", 5));
            let task = tracker.intern_code(&CodeDescriptor::flat("task_body", "tasks.py", 12));
            tracker.on_thread_start(ThreadId(1), "main");
            tracker.on_frame_enter(caller, true);
            tracker.on_frame_enter(callee, false);
            tracker.on_stack_switch(&[ShadowFrame::at_entry(task, true)]);
            tracker.record_allocation(AllocatorKind::Malloc, 0x3000, 99);
        },
    );

    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    let mut allocation = None;
    while let Some(event) = reader.next_event().unwrap() {
        if let TrackedEvent::Allocation(event) = event {
            allocation = Some(event);
        }
    }
    let allocation = allocation.expect("allocation missing from capture");
    let names: Vec<String> = reader
        .resolve_stack(allocation.stack)
        .into_iter()
        .map(|frame| frame.function_name)
        .collect();
    assert_eq!(names, vec!["task_body".to_owned()]);
}

#[test]
fn unseeded_thread_is_seeded_from_the_host_chain() {
    let seeded_code: Arc<OnceLock<CodeId>> = Arc::new(OnceLock::new());
    let provider_code = Arc::clone(&seeded_code);
    let (bytes, _) = collect_capture(
        |builder| {
            builder.stack_provider(Box::new(move || {
                provider_code
                    .get()
                    .map(|&code| vec![ShadowFrame::at_entry(code, true)])
                    .unwrap_or_default()
            }))
        },
        |tracker| {
            let code = tracker.intern_code(&CodeDescriptor::flat("pre_existing", "boot.py", 2));
            seeded_code.set(code).unwrap();
            tracker.on_thread_start(ThreadId(9), "early-thread");
            // No frame activity: the first allocation must seed the stack.
            tracker.record_allocation(AllocatorKind::Malloc, 0x4000, 16);
        },
    );

    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    let mut allocation = None;
    while let Some(event) = reader.next_event().unwrap() {
        if let TrackedEvent::Allocation(event) = event {
            allocation = Some(event);
        }
    }
    let allocation = allocation.expect("allocation missing from capture");
    assert_eq!(allocation.tid, ThreadId(9));
    let names: Vec<String> = reader
        .resolve_stack(allocation.stack)
        .into_iter()
        .map(|frame| frame.function_name)
        .collect();
    assert_eq!(names, vec!["pre_existing".to_owned()]);
}

#[test]
fn push_pop_balance_matches_replayed_depth() {
    // Invariant: per thread, pushes minus coalesced pops equal the
    // replayed stack depth for every stream prefix (never negative).
    let (bytes, _) = collect_capture(
        |builder| builder,
        |tracker| {
            let code = tracker.intern_code(&CodeDescriptor::flat("f", "m.py", 1));
            tracker.on_thread_start(ThreadId(1), "main");
            for _ in 0..3 {
                tracker.on_frame_enter(code, false);
                tracker.on_frame_enter(code, false);
                tracker.on_frame_leave();
                tracker.record_allocation(AllocatorKind::Malloc, 0x10, 1);
                tracker.on_frame_leave();
            }
            tracker.record_allocation(AllocatorKind::Malloc, 0x20, 2);
        },
    );

    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    let mut depth: i64 = 0;
    while let Some((_, record)) = reader.next_record().unwrap() {
        match record {
            Record::FramePush(_) => depth += 1,
            Record::FramePop { count } => depth -= i64::from(count),
            _ => {}
        }
        assert!(depth >= 0, "stream prefix drove the stack depth negative");
    }
    assert_eq!(depth, 0);
}
