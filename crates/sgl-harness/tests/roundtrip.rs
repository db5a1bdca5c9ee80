use std::cell::Cell;
use std::time::Duration;

use nvme_sgl::{
    CompletionCallback, IoCompletion, IoDevice, NamespaceInfo, SgCursor, SubmitError,
};
use nvme_sim::{DeviceConfig, FaultPlan, SharedArena, SimBus, SimDevice};
use sgl_harness::{
    run_device, shapes, writev_readv, FailureKind, IoDirection, RunOptions, RunSummary,
    ShapeOutcome, ShapeStatus, SkipReason, VerifyError, VerifyOptions, SHAPES,
};

const ARENA_SIZE: usize = 32 * 1024 * 1024;

fn attach(config: DeviceConfig) -> (SharedArena, SimDevice) {
    let mut bus = SimBus::new(SharedArena::new(ARENA_SIZE));
    bus.add_device(config);
    let arena = bus.arena();
    let (_, device) = bus.attach_all().pop().unwrap();
    (arena, device.unwrap())
}

fn statuses(opts: &RunOptions, config: DeviceConfig) -> Vec<ShapeStatus> {
    let (mut arena, mut device) = attach(config);
    let report = run_device(&mut device, &mut arena, opts);
    assert!(report.error.is_none(), "{:?}", report.error);
    report.shapes.into_iter().map(|s| s.status).collect()
}

#[test]
fn every_shape_round_trips_on_a_512_byte_namespace() {
    let (mut arena, mut device) = attach(DeviceConfig::default());
    let baseline = arena.live_allocations();

    for shape in &SHAPES {
        let outcome = writev_readv(&mut device, &mut arena, shape, &VerifyOptions::default());
        assert_eq!(outcome.unwrap(), ShapeOutcome::Passed, "shape {}", shape.id);
        // Request buffers are returned whatever the shape.
        assert_eq!(arena.live_allocations(), baseline, "shape {}", shape.id);
    }
}

#[test]
fn sub_block_requests_fail_on_4k_namespace() {
    let got = statuses(
        &RunOptions::default(),
        DeviceConfig {
            sector_size: 4096,
            ..DeviceConfig::default()
        },
    );
    assert_eq!(got.len(), 6);
    assert!(got[1..5].iter().all(|s| *s == ShapeStatus::Passed), "{got:?}");

    // 2 KiB + 4 KiB + 12 KiB is four and a half blocks: only four are transferred, so the last
    // 2 KiB of the 12 KiB segment read back as zero.
    let ShapeStatus::Failed { kind, message } = &got[0] else {
        panic!("expected failure, got {:?}", got[0]);
    };
    assert_eq!(*kind, FailureKind::DataIntegrity);
    assert!(message.contains("segment 2 byte 0x2800"), "{message}");

    // 512 bytes is zero blocks, which the device refuses.
    let ShapeStatus::Failed { kind, message } = &got[5] else {
        panic!("expected failure, got {:?}", got[5]);
    };
    assert_eq!(*kind, FailureKind::Submission);
    assert!(message.starts_with("writev Failed"), "{message}");
}

#[test]
fn zero_block_request_is_a_submission_failure() {
    let (mut arena, mut device) = attach(DeviceConfig {
        sector_size: 4096,
        ..DeviceConfig::default()
    });
    let err = writev_readv(
        &mut device,
        &mut arena,
        shapes::by_id(6).unwrap(),
        &VerifyOptions::default(),
    )
    .unwrap_err();
    assert!(
        matches!(
            err,
            VerifyError::Submit {
                op: IoDirection::Write,
                source: SubmitError::ZeroLength
            }
        ),
        "{err}"
    );
}

#[test]
fn requests_past_the_namespace_end_are_skipped() {
    // Room for 16 blocks past BASE_LBA_START: 8 KiB fits exactly, 256 KiB does not.
    let got = statuses(
        &RunOptions::default(),
        DeviceConfig {
            namespace_blocks: 0x10_0010,
            ..DeviceConfig::default()
        },
    );
    assert!(matches!(
        got[1],
        ShapeStatus::Skipped {
            reason: SkipReason::CapacityExceeded {
                lba_end: 0x10_01f8,
                namespace_blocks: 0x10_0010
            }
        }
    ));
    assert_eq!(got[2], ShapeStatus::Passed);
    assert!(matches!(
        got[4],
        ShapeStatus::Skipped {
            reason: SkipReason::CapacityExceeded { .. }
        }
    ));
    assert_eq!(got[5], ShapeStatus::Passed);
}

#[test]
fn failed_writes_do_not_stop_the_device() {
    let got = statuses(
        &RunOptions::default(),
        DeviceConfig {
            faults: FaultPlan {
                fail_writes: true,
                ..FaultPlan::default()
            },
            ..DeviceConfig::default()
        },
    );
    assert_eq!(got.len(), 6);
    for status in got {
        let ShapeStatus::Failed { kind, message } = status else {
            panic!("expected failure, got {status:?}");
        };
        assert_eq!(kind, FailureKind::Completion);
        assert!(message.starts_with("writev Failed"), "{message}");
    }
}

#[test]
fn corrupted_read_data_is_caught() {
    let (mut arena, mut device) = attach(DeviceConfig {
        faults: FaultPlan {
            corrupt_reads: true,
            ..FaultPlan::default()
        },
        ..DeviceConfig::default()
    });
    let err = writev_readv(
        &mut device,
        &mut arena,
        shapes::by_id(4).unwrap(),
        &VerifyOptions::default(),
    )
    .unwrap_err();
    assert!(
        matches!(
            err,
            VerifyError::DataMismatch {
                segment: 0,
                offset: 0,
                expected: 0x5a,
                found: 0xa5
            }
        ),
        "{err}"
    );
}

#[test]
fn missing_completion_times_out() {
    let (mut arena, mut device) = attach(DeviceConfig {
        faults: FaultPlan {
            drop_completions: true,
            ..FaultPlan::default()
        },
        ..DeviceConfig::default()
    });
    let opts = VerifyOptions {
        completion_timeout: Duration::from_millis(20),
        ..VerifyOptions::default()
    };
    let err = writev_readv(&mut device, &mut arena, shapes::by_id(3).unwrap(), &opts).unwrap_err();
    assert!(
        matches!(
            err,
            VerifyError::Timeout {
                op: IoDirection::Write,
                ..
            }
        ),
        "{err}"
    );
}

#[test]
fn device_without_namespace_stops_early() {
    let (mut arena, mut device) = attach(DeviceConfig {
        namespace_blocks: 0,
        ..DeviceConfig::default()
    });
    let report = run_device(&mut device, &mut arena, &RunOptions::default());
    assert!(report.shapes.is_empty());
    assert_eq!(
        report.error.as_ref().map(|e| e.kind),
        Some(FailureKind::NamespaceUnavailable)
    );
    assert!(report.failed());
}

#[test]
fn repeated_runs_reuse_the_same_lbas() {
    let (mut arena, mut device) = attach(DeviceConfig::default());
    let baseline = arena.live_allocations();
    let opts = RunOptions {
        repeat: 3,
        shapes: vec![SHAPES[0], SHAPES[1]],
        ..RunOptions::default()
    };
    let report = run_device(&mut device, &mut arena, &opts);

    assert_eq!(report.shapes.len(), 6);
    assert_eq!(
        report.shapes.iter().map(|s| s.iteration).collect::<Vec<_>>(),
        [0, 0, 1, 1, 2, 2]
    );
    assert!(report.shapes.iter().all(|s| s.status == ShapeStatus::Passed));
    assert_eq!(arena.live_allocations(), baseline);

    let mut summary = RunSummary::default();
    summary.push(report);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.totals.passed, 6);
}

/// Device that records submissions and completes them immediately.
struct CountingDevice {
    ns: NamespaceInfo,
    submissions: Cell<u32>,
    pending: Vec<CompletionCallback>,
}

impl IoDevice for CountingDevice {
    fn name(&self) -> &str {
        "counting"
    }

    fn default_namespace(&self) -> Option<NamespaceInfo> {
        Some(self.ns)
    }

    fn submit_writev(
        &mut self,
        _nsid: u32,
        _lba: u64,
        _lba_count: u32,
        callback: CompletionCallback,
        cursor: &mut dyn SgCursor,
    ) -> Result<(), SubmitError> {
        cursor.reset(0);
        while !cursor.next_span().is_end() {}
        self.submissions.set(self.submissions.get() + 1);
        self.pending.push(callback);
        Ok(())
    }

    fn submit_readv(
        &mut self,
        nsid: u32,
        lba: u64,
        lba_count: u32,
        callback: CompletionCallback,
        cursor: &mut dyn SgCursor,
    ) -> Result<(), SubmitError> {
        self.submit_writev(nsid, lba, lba_count, callback, cursor)
    }

    fn process_completions(&mut self, _max_completions: u32) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let n = pending.len();
        for cb in pending {
            cb(&IoCompletion::SUCCESS);
        }
        n
    }

    fn detach(&mut self) {
        self.pending.clear();
    }
}

#[test]
fn capacity_skip_submits_nothing() {
    let mut arena = SharedArena::new(ARENA_SIZE);
    let mut device = CountingDevice {
        ns: NamespaceInfo {
            id: 1,
            sector_size: 512,
            size_blocks: 0x10_0000,
        },
        submissions: Cell::new(0),
        pending: Vec::new(),
    };
    let report = run_device(&mut device, &mut arena, &RunOptions::default());

    assert_eq!(report.shapes.len(), 6);
    assert!(report.shapes.iter().all(|s| matches!(
        s.status,
        ShapeStatus::Skipped {
            reason: SkipReason::CapacityExceeded { .. }
        }
    )));
    assert_eq!(device.submissions.get(), 0);
    assert_eq!(arena.live_allocations(), 0);
    assert!(!report.failed());
}
