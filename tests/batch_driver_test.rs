//! Integration tests for the automated measurement loop: timeouts, hardware
//! failures, cancellation and pause from another task.

use async_trait::async_trait;
use lab_daq::data::storage::MemorySink;
use lab_daq::error::DaqError;
use lab_daq::experiment::{
    BatchDriver, BatchSequencer, BatchStatus, InFlightStep, OutputNaming, StepApplier, StepPolicy,
};
use lab_daq::hardware::capabilities::{CapabilityKind, Device, ParamValue};
use lab_daq::hardware::registry::{DeviceDescriptor, DeviceHandle, DeviceRegistry};
use lab_daq::hardware::DummyDevice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

async fn open(dummy: DummyDevice) -> (Arc<DummyDevice>, DeviceHandle) {
    let dummy = Arc::new(dummy);
    let shared = Arc::clone(&dummy);
    let mut registry = DeviceRegistry::new();
    registry.register_factory(
        dummy.kind(),
        Arc::new(move |_: &DeviceDescriptor| {
            let device: Arc<dyn Device> = shared.clone();
            Ok(device)
        }),
    );
    registry
        .load(vec![DeviceDescriptor::dummy("dev", dummy.kind())])
        .unwrap();
    let handle = registry.open_device("dev").await.unwrap();
    (dummy, handle)
}

struct Fixture {
    _dir: TempDir,
    sink: Arc<MemorySink>,
    dummy: Arc<DummyDevice>,
    seq: BatchSequencer,
}

async fn fixture(policy: StepPolicy, dummy: DummyDevice) -> Fixture {
    let dir = tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let (dummy, handle) = open(dummy).await;
    let mut seq = BatchSequencer::new();
    seq.configure(policy, handle, OutputNaming::new(dir.path(), "S1", "run"), sink.clone())
        .unwrap();
    seq.batch_ready().unwrap();
    Fixture {
        _dir: dir,
        sink,
        dummy,
        seq,
    }
}

fn sweep() -> StepPolicy {
    StepPolicy::LinearSweep {
        start: 0.0,
        stop: 1.0,
        step: 0.25,
    }
}

#[tokio::test]
async fn runs_to_completion() {
    let mut f = fixture(sweep(), DummyDevice::new(CapabilityKind::Smu, "SMU")).await;

    let status = BatchDriver::default().run(&mut f.seq).await.unwrap();

    assert_eq!(status, BatchStatus::Completed);
    assert_eq!(f.dummy.measure_count(), 5);
    assert_eq!(f.sink.step_count(), 5);
    assert_eq!(f.sink.rows(&f.seq.run().summary_path).len(), 6);
    assert_eq!(f.dummy.option("value").await, Some(ParamValue::Number(1.0)));
}

#[tokio::test]
async fn measurement_timeout_fails_the_run() {
    let slow = DummyDevice::new(CapabilityKind::Smu, "SMU").with_latency(Duration::from_secs(5));
    let mut f = fixture(sweep(), slow).await;

    let result = BatchDriver::new(Duration::from_millis(50)).run(&mut f.seq).await;

    assert!(matches!(result, Err(DaqError::HardwareTimeout(_))));
    assert_eq!(f.seq.status(), BatchStatus::Failed);
    assert_eq!(f.seq.current_step(), 0);
    assert!(f.dummy.was_aborted());
}

#[tokio::test]
async fn hardware_error_is_resumable() {
    let mut f = fixture(sweep(), DummyDevice::new(CapabilityKind::Smu, "SMU")).await;
    f.dummy.inject_measure_failure();

    let driver = BatchDriver::default();
    let result = driver.run(&mut f.seq).await;
    assert!(matches!(result, Err(DaqError::Hardware(_))));
    assert_eq!(f.seq.status(), BatchStatus::Failed);

    // The driver restarts a failed run at the step that failed.
    assert_eq!(driver.run(&mut f.seq).await.unwrap(), BatchStatus::Completed);
    let indices: Vec<usize> = f.seq.summary_rows().iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn persist_retries_recover() {
    let mut f = fixture(sweep(), DummyDevice::new(CapabilityKind::Smu, "SMU")).await;
    f.sink.fail_next(2);

    let status = BatchDriver::default()
        .with_persist_retries(2)
        .run(&mut f.seq)
        .await
        .unwrap();

    assert_eq!(status, BatchStatus::Completed);
    assert_eq!(f.seq.summary_rows().len(), 5);
}

#[tokio::test]
async fn persist_failure_without_retries_keeps_step() {
    let mut f = fixture(sweep(), DummyDevice::new(CapabilityKind::Smu, "SMU")).await;
    f.sink.fail_next(1);

    let driver = BatchDriver::default();
    let result = driver.run(&mut f.seq).await;
    assert!(matches!(result, Err(DaqError::Persist(_))));
    assert_eq!(f.seq.status(), BatchStatus::Running);
    assert_eq!(f.seq.in_flight().map(|s| s.index), Some(0));

    assert_eq!(driver.run(&mut f.seq).await.unwrap(), BatchStatus::Completed);
    assert_eq!(f.sink.rows(&f.seq.run().summary_path).len(), 6);
    assert_eq!(f.dummy.measure_count(), 5);
}

#[tokio::test]
async fn rerun_after_persist_failure_stores_kept_data_without_measuring() {
    let policy = StepPolicy::RepeatN {
        count: 1,
        wait_seconds: 0.0,
    };
    let mut f = fixture(policy, DummyDevice::new(CapabilityKind::Smu, "SMU")).await;
    f.sink.fail_next(1);

    let driver = BatchDriver::default();
    assert!(matches!(driver.run(&mut f.seq).await, Err(DaqError::Persist(_))));
    assert_eq!(f.dummy.measure_count(), 1);
    assert_eq!(f.sink.step_count(), 0);

    assert_eq!(driver.run(&mut f.seq).await.unwrap(), BatchStatus::Completed);
    assert_eq!(f.dummy.measure_count(), 1);
    assert_eq!(f.sink.step_count(), 1);
}

#[tokio::test]
async fn cancel_from_another_task() {
    let slow = DummyDevice::new(CapabilityKind::Lockin, "Lockin").with_latency(Duration::from_millis(30));
    let policy = StepPolicy::RepeatN {
        count: 100,
        wait_seconds: 0.0,
    };
    let mut f = fixture(policy, slow).await;
    let summary = f.seq.run().summary_path.clone();

    let driver = BatchDriver::default();
    let control = driver.control();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        control.cancel();
    });

    let status = driver.run(&mut f.seq).await.unwrap();
    assert_eq!(status, BatchStatus::Idle);
    let completed = f.dummy.measure_count();
    assert!(completed < 100);
    // A step measured when the cancel arrived gets no row.
    let rows = f.sink.rows(&summary).len().saturating_sub(1);
    assert!(rows <= completed);
}

#[tokio::test]
async fn pause_holds_the_loop_until_resumed() {
    let policy = StepPolicy::RepeatN {
        count: 3,
        wait_seconds: 0.0,
    };
    let mut f = fixture(policy, DummyDevice::new(CapabilityKind::Smu, "SMU")).await;

    let driver = BatchDriver::default();
    let control = driver.control();
    control.pause();

    let remote = control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        remote.resume();
    });

    let started = std::time::Instant::now();
    let status = driver.run(&mut f.seq).await.unwrap();
    assert_eq!(status, BatchStatus::Completed);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

/// Applier counting its calls, the way an IV runner would drive the bias.
struct CountingApplier {
    applied: AtomicUsize,
    finished: AtomicUsize,
}

#[async_trait]
impl StepApplier for CountingApplier {
    async fn apply(&self, device: &dyn Device, step: &InFlightStep) -> anyhow::Result<()> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        device.configure(&step.parameters.to_options()).await
    }

    async fn finish(&self, _device: &dyn Device) -> anyhow::Result<()> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn custom_applier_runs_each_step_and_finishes_once() {
    let mut f = fixture(sweep(), DummyDevice::new(CapabilityKind::Smu, "SMU")).await;
    let applier = Arc::new(CountingApplier {
        applied: AtomicUsize::new(0),
        finished: AtomicUsize::new(0),
    });
    f.seq.set_applier(applier.clone()).unwrap();

    BatchDriver::default().run(&mut f.seq).await.unwrap();

    assert_eq!(applier.applied.load(Ordering::SeqCst), 5);
    assert_eq!(applier.finished.load(Ordering::SeqCst), 1);
}
