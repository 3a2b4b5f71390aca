//! End-to-end capture tests: record with a tracker, replay with the
//! reader, and check the stream survives truncation and rejects
//! corruption.
//!
//! The tracker is a process-global singleton, so every test that starts
//! one holds the file-local lock for the duration of its session.

use std::sync::{Mutex, MutexGuard};

use mneme::{
    AllocatorKind, CaptureOutcome, CaptureReader, CaptureStats, CodeDescriptor, CollectSink, FileFormat,
    ReadErrorKind, Record, ThreadId, TrackedEvent, Tracker, TrackerBuilder, TrackerError,
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

/// The canonical two-function session used by several tests.
fn record_basic_session(tracker: &Tracker) {
    let main_code = tracker.intern_code(&CodeDescriptor::flat("main", "app.py", 1));
    let work_code = tracker.intern_code(&CodeDescriptor::flat("work", "app.py", 10));
    tracker.on_thread_start(ThreadId(1), "MainThread");
    tracker.on_frame_enter(main_code, true);
    tracker.on_frame_enter(work_code, false);
    tracker.record_allocation(AllocatorKind::Calloc, 0x1000, 1234);
    tracker.on_frame_leave();
    tracker.record_allocation(AllocatorKind::Malloc, 0x2000, 64);
    tracker.record_allocation(AllocatorKind::Free, 0x1000, 0);
}

#[test]
fn capture_replays_into_resolved_events() {
    let (bytes, stats) = collect_capture(|builder| builder, record_basic_session);
    assert_eq!(stats.n_allocations, 3);
    assert_eq!(stats.n_frames, 2);

    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    assert_eq!(reader.header().file_format, FileFormat::AllAllocations);
    assert_eq!(reader.header().n_allocations, 3);
    assert_eq!(reader.header().n_frames, 2);

    let mut events = Vec::new();
    while let Some(event) = reader.next_event().unwrap() {
        events.push(event);
    }
    assert_eq!(reader.outcome(), Some(CaptureOutcome::Complete));
    assert_eq!(events.len(), 3);

    let TrackedEvent::Allocation(calloc) = &events[0] else {
        panic!("expected an allocation event, got {:?}", events[0]);
    };
    assert_eq!(calloc.tid, ThreadId(1));
    assert_eq!(calloc.kind, AllocatorKind::Calloc);
    assert_eq!(calloc.address, 0x1000);
    assert_eq!(calloc.size, 1234);
    let frames = reader.resolve_stack(calloc.stack);
    let names: Vec<&str> = frames.iter().map(|frame| frame.function_name.as_str()).collect();
    assert_eq!(names, vec!["main", "work"]);
    assert_eq!(frames[0].line, 1);
    assert!(frames[0].is_entry);

    let TrackedEvent::Allocation(malloc) = &events[1] else {
        panic!("expected an allocation event, got {:?}", events[1]);
    };
    let malloc_frames = reader.resolve_stack(malloc.stack);
    let malloc_names: Vec<&str> = malloc_frames.iter().map(|frame| frame.function_name.as_str()).collect();
    assert_eq!(malloc_names, vec!["main"]);

    assert_eq!(reader.thread_name(ThreadId(1)), Some("MainThread"));
}

#[test]
fn interning_is_stable_across_repeat_descriptors() {
    let (bytes, _) = collect_capture(
        |builder| builder,
        |tracker| {
            let first = tracker.intern_code(&CodeDescriptor::flat("f", "m.py", 1));
            let second = tracker.intern_code(&CodeDescriptor::flat("f", "m.py", 1));
            let third = tracker.intern_code(&CodeDescriptor::flat("g", "m.py", 9));
            assert_eq!(first, second);
            assert_ne!(first, third);
            tracker.on_thread_start(ThreadId(1), "main");
            tracker.on_frame_enter(first, false);
            tracker.record_allocation(AllocatorKind::Malloc, 0x10, 1);
        },
    );
    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    let mut code_objects = 0;
    while let Some((_, record)) = reader.next_record().unwrap() {
        if matches!(record, Record::CodeObject { .. }) {
            code_objects += 1;
        }
    }
    assert_eq!(code_objects, 2);
}

#[test]
fn truncated_capture_yields_every_complete_record() {
    let (bytes, _) = collect_capture(|builder| builder, record_basic_session);

    let mut full = CaptureReader::from_bytes(bytes.clone()).unwrap();
    let mut full_records = Vec::new();
    while let Some((_, record)) = full.next_record().unwrap() {
        full_records.push(record);
    }
    assert_eq!(full.outcome(), Some(CaptureOutcome::Complete));

    let cut = bytes.len() - 17;
    let mut truncated = CaptureReader::from_bytes(bytes[..cut].to_vec()).unwrap();
    let mut truncated_records = Vec::new();
    while let Some((_, record)) = truncated.next_record().unwrap() {
        truncated_records.push(record);
    }
    assert_eq!(truncated.outcome(), Some(CaptureOutcome::Truncated));
    assert!(truncated_records.len() < full_records.len());
    assert_eq!(truncated_records[..], full_records[..truncated_records.len()]);
}

#[test]
fn unknown_tag_is_a_structural_error_with_offset() {
    let (bytes, _) = collect_capture(|builder| builder, record_basic_session);
    // Splice a bogus record in front of the 2-byte trailer.
    let splice_at = bytes.len() - 2;
    let mut corrupt = bytes[..splice_at].to_vec();
    corrupt.extend_from_slice(&[0xee, 0x03, 1, 2, 3]);
    corrupt.extend_from_slice(&bytes[splice_at..]);

    let mut reader = CaptureReader::from_bytes(corrupt).unwrap();
    let error = loop {
        match reader.next_record() {
            Ok(Some(_)) => {}
            Ok(None) => panic!("corrupt record was not detected"),
            Err(error) => break error,
        }
    };
    assert_eq!(error.offset, splice_at as u64);
    assert!(matches!(error.kind, ReadErrorKind::Wire(_)), "unexpected error: {error}");
}

#[test]
fn zero_count_pop_and_underflow_are_rejected() {
    let (bytes, _) = collect_capture(|builder| builder, record_basic_session);
    let splice_at = bytes.len() - 2;

    // FRAME_POP with count=0 is invalid by construction.
    let mut zero_pop = bytes[..splice_at].to_vec();
    zero_pop.extend_from_slice(&[6, 1, 0]);
    zero_pop.extend_from_slice(&bytes[splice_at..]);
    let mut reader = CaptureReader::from_bytes(zero_pop).unwrap();
    let error = loop {
        match reader.next_record() {
            Ok(Some(_)) => {}
            Ok(None) => panic!("zero-count pop was not detected"),
            Err(error) => break error,
        }
    };
    assert!(matches!(error.kind, ReadErrorKind::EmptyPop), "unexpected error: {error}");

    // A pop run deeper than the replayed stack underflows.
    let mut underflow = bytes[..splice_at].to_vec();
    underflow.extend_from_slice(&[6, 1, 5]);
    underflow.extend_from_slice(&bytes[splice_at..]);
    let mut reader = CaptureReader::from_bytes(underflow).unwrap();
    let error = loop {
        match reader.next_record() {
            Ok(Some(_)) => {}
            Ok(None) => panic!("pop underflow was not detected"),
            Err(error) => break error,
        }
    };
    assert!(
        matches!(error.kind, ReadErrorKind::PopUnderflow { tid: 1 }),
        "unexpected error: {error}"
    );
}

#[test]
fn thread_rename_reemits_the_name_record() {
    let (bytes, _) = collect_capture(
        |builder| builder,
        |tracker| {
            let code = tracker.intern_code(&CodeDescriptor::flat("f", "m.py", 1));
            tracker.on_thread_start(ThreadId(7), "worker-initial");
            tracker.on_frame_enter(code, false);
            tracker.record_allocation(AllocatorKind::Malloc, 0x10, 8);
            tracker.on_thread_start(ThreadId(7), "worker-renamed");
            tracker.record_allocation(AllocatorKind::Malloc, 0x20, 8);
        },
    );
    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    let mut names = Vec::new();
    while let Some((_, record)) = reader.next_record().unwrap() {
        if let Record::ThreadName(name) = record {
            names.push(name);
        }
    }
    assert_eq!(names, vec!["worker-initial".to_owned(), "worker-renamed".to_owned()]);
    assert_eq!(reader.thread_name(ThreadId(7)), Some("worker-renamed"));
}

#[test]
fn aggregated_capture_round_trips_rows() {
    let (bytes, stats) = collect_capture(
        |builder| builder.aggregate(true),
        |tracker| {
            let code = tracker.intern_code(&CodeDescriptor::flat("hot", "app.py", 3));
            tracker.on_thread_start(ThreadId(1), "main");
            tracker.on_frame_enter(code, false);
            tracker.record_allocation(AllocatorKind::Malloc, 0x1000, 100);
            tracker.record_allocation(AllocatorKind::Malloc, 0x2000, 50);
            tracker.record_allocation(AllocatorKind::Free, 0x2000, 0);
        },
    );
    assert_eq!(stats.n_allocations, 3);

    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    assert_eq!(reader.header().file_format, FileFormat::AggregatedAllocations);
    let report = reader.high_water_report().unwrap();
    assert_eq!(report.rows.len(), 1);
    let row = &report.rows[0];
    assert_eq!(row.bytes_in_high_water_mark, 150);
    assert_eq!(row.n_allocations_in_high_water_mark, 2);
    assert_eq!(row.bytes_leaked, 100);
    assert_eq!(row.n_allocations_leaked, 1);
    let frames = reader.resolve_stack(row.location.stack);
    assert_eq!(frames[0].function_name, "hot");

    let mut reader = CaptureReader::from_bytes({
        let (bytes, _) = collect_capture(
            |builder| builder.aggregate(true),
            |tracker| {
                tracker.on_thread_start(ThreadId(1), "main");
                tracker.record_allocation(AllocatorKind::Malloc, 0x1, 1);
            },
        );
        bytes
    })
    .unwrap();
    let error = reader.temporal_report().unwrap_err();
    assert!(
        matches!(error.kind, ReadErrorKind::WrongFileFormat(_)),
        "unexpected error: {error}"
    );
}

#[test]
fn whole_stream_aggregation_matches_event_replay() {
    let (bytes, _) = collect_capture(|builder| builder, record_basic_session);
    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    let report = reader.high_water_report().unwrap();

    assert_eq!(report.high_water_bytes, 1234 + 64);
    let leaked: u64 = report.rows.iter().map(|row| row.bytes_leaked).sum();
    assert_eq!(leaked, 64);
    let peak: u64 = report.rows.iter().map(|row| row.bytes_in_high_water_mark).sum();
    assert_eq!(peak, 1234 + 64);
}

#[cfg(target_os = "linux")]
#[test]
fn native_traces_attach_instruction_pointers_and_memory_maps() {
    let (bytes, _) = collect_capture(
        |builder| builder.native_traces(true),
        |tracker| {
            tracker.on_thread_start(ThreadId(1), "main");
            tracker.record_allocation(AllocatorKind::Malloc, 0x9000, 256);
        },
    );

    let mut reader = CaptureReader::from_bytes(bytes).unwrap();
    assert!(reader.header().native_traces);
    let mut allocation = None;
    while let Some(event) = reader.next_event().unwrap() {
        if let TrackedEvent::Allocation(event) = event {
            allocation = Some(event);
        }
    }
    let allocation = allocation.expect("allocation missing from capture");
    // The unwinder degrades to an empty capture on exotic stacks; when it
    // produced frames, the reader must resolve the whole chain.
    if allocation.native_stack != mneme::NativeStackId::NONE {
        let ips = reader.resolve_native_stack(allocation.native_stack);
        assert!(!ips.is_empty());
        assert!(ips.iter().all(|&ip| ip != 0));
    }
    assert!(
        !reader.memory_maps().is_empty(),
        "native captures end with a memory-map section"
    );
}

#[test]
fn second_tracker_is_rejected_while_one_is_active() {
    let _serialized = tracker_lock();
    let sink = CollectSink::new();
    let tracker = TrackerBuilder::with_sink(Box::new(sink))
        .memory_interval_ms(0)
        .start()
        .unwrap();
    let error = TrackerBuilder::with_sink(Box::new(CollectSink::new()))
        .memory_interval_ms(0)
        .start()
        .unwrap_err();
    assert!(matches!(error, TrackerError::AlreadyActive), "unexpected error: {error}");
    tracker.finish().unwrap();
}

#[test]
fn existing_output_file_is_a_setup_error() {
    let _serialized = tracker_lock();
    let path = std::env::temp_dir().join(format!("mneme-exists-{}.bin", std::process::id()));
    std::fs::write(&path, b"already here").unwrap();
    let error = TrackerBuilder::new(&path).memory_interval_ms(0).start().unwrap_err();
    assert!(matches!(error, TrackerError::OutputExists(_)), "unexpected error: {error}");
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn compressed_capture_round_trips_with_plain_header() {
    let _serialized = tracker_lock();
    let path = std::env::temp_dir().join(format!("mneme-compressed-{}.bin", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let tracker = TrackerBuilder::new(&path)
        .compress(true)
        .memory_interval_ms(0)
        .start()
        .unwrap();
    record_basic_session(&tracker);
    let stats = tracker.finish().unwrap();
    assert_eq!(stats.n_allocations, 3);

    let raw = std::fs::read(&path).unwrap();
    assert!(raw.starts_with(b"magic=memray\n"), "header must stay uncompressed");

    let mut reader = CaptureReader::open(&path).unwrap();
    assert_eq!(reader.header().n_allocations, 3);
    let mut allocations = 0;
    while let Some(event) = reader.next_event().unwrap() {
        if matches!(event, TrackedEvent::Allocation(_)) {
            allocations += 1;
        }
    }
    assert_eq!(allocations, 3);
    assert_eq!(reader.outcome(), Some(CaptureOutcome::Complete));
    std::fs::remove_file(&path).unwrap();
}
