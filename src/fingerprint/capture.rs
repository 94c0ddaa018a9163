//! Sequential capture protocol over a `FingerprintDevice`.
//!
//! init → enumerate → open → query parameters → settle → poll, with the device
//! closed and the SDK terminated exactly once on every exit path, panics included.

use crate::common::config::FingerprintConfig;
use crate::common::{BiometricError, Result};
use crate::fingerprint::bitmap;
use crate::fingerprint::device::{
    read_u32_parameter, AcquireStatus, DeviceHandle, FingerprintDevice, CODE_ALREADY_INITIALIZED, CODE_OK,
    PARAM_IMAGE_BYTES, PARAM_IMAGE_HEIGHT, PARAM_IMAGE_WIDTH,
};
use chrono::{DateTime, Local};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Ready { width: u32, height: u32, image_bytes: u32 },
    Attempt { index: u32, max: u32 },
    Busy { code: i32 },
    Retry { code: i32 },
    Saved { path: PathBuf, width: u32, height: u32, tries: u32 },
    Error { message: String, last_code: Option<i32> },
}

impl CaptureEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CaptureEvent::Ready { .. } => "ready",
            CaptureEvent::Attempt { .. } => "attempt",
            CaptureEvent::Busy { .. } => "busy",
            CaptureEvent::Retry { .. } => "retry",
            CaptureEvent::Saved { .. } => "saved",
            CaptureEvent::Error { .. } => "error",
        }
    }
}

/// Receives progress events. Failures are logged by the protocol and otherwise ignored.
pub trait CaptureEventSink {
    fn deliver(&mut self, event: CaptureEvent) -> anyhow::Result<()>;
}

impl CaptureEventSink for () {
    fn deliver(&mut self, _event: CaptureEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

impl CaptureEventSink for mpsc::Sender<CaptureEvent> {
    fn deliver(&mut self, event: CaptureEvent) -> anyhow::Result<()> {
        self.send(event)
            .map_err(|e| anyhow::anyhow!("event receiver dropped: {}", e))
    }
}

/// Adapts a closure into a sink.
pub struct CallbackSink<F>(pub F);

impl<F> CaptureEventSink for CallbackSink<F>
where
    F: FnMut(&CaptureEvent) -> anyhow::Result<()>,
{
    fn deliver(&mut self, event: CaptureEvent) -> anyhow::Result<()> {
        (self.0)(&event)
    }
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub max_tries: u32,
    pub try_interval: Duration,
    pub settle_delay: Duration,
    pub output_dir: PathBuf,
}

impl CaptureSettings {
    pub fn from_config(config: &FingerprintConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_tries: config.max_tries,
            try_interval: Duration::from_millis(config.try_interval_ms),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            output_dir: output_dir.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedImage {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub tries: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Saved(CapturedImage),
    Failed { reason: String, last_code: Option<i32> },
}

impl CaptureOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, CaptureOutcome::Saved(_))
    }
}

/// Initialised SDK, optionally with an open device. Dropping it releases both.
struct SdkSession<'d, D: FingerprintDevice + ?Sized> {
    device: &'d mut D,
    handle: Option<DeviceHandle>,
}

impl<'d, D: FingerprintDevice + ?Sized> SdkSession<'d, D> {
    fn init(device: &'d mut D) -> std::result::Result<Self, i32> {
        let code = device.init();
        if code != CODE_OK && code != CODE_ALREADY_INITIALIZED {
            return Err(code);
        }
        Ok(Self { device, handle: None })
    }

    fn open_first(&mut self) -> Option<DeviceHandle> {
        self.handle = self.device.open(0);
        self.handle
    }
}

impl<D: FingerprintDevice + ?Sized> Drop for SdkSession<'_, D> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let code = self.device.close(handle);
            if code != CODE_OK {
                tracing::warn!("Closing fingerprint device returned {}", code);
            }
        }
        let code = self.device.terminate();
        if code != CODE_OK {
            tracing::warn!("Terminating fingerprint SDK returned {}", code);
        }
    }
}

fn emit<S: CaptureEventSink + ?Sized>(sink: &mut S, event: CaptureEvent) {
    let name = event.name();
    match panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Dropping {} event: {}", name, e),
        Err(_) => tracing::warn!("Event sink panicked on {} event", name),
    }
}

fn fail<S: CaptureEventSink + ?Sized>(sink: &mut S, reason: String, last_code: Option<i32>) -> CaptureOutcome {
    tracing::warn!("Fingerprint capture failed: {}", reason);
    emit(
        sink,
        CaptureEvent::Error {
            message: reason.clone(),
            last_code,
        },
    );
    CaptureOutcome::Failed { reason, last_code }
}

/// Run one capture. Device-level failures come back as `CaptureOutcome::Failed`;
/// only file system errors while writing the bitmap are returned as `Err`.
pub fn capture<D, S>(device: &mut D, settings: &CaptureSettings, sink: &mut S) -> Result<CaptureOutcome>
where
    D: FingerprintDevice + ?Sized,
    S: CaptureEventSink + ?Sized,
{
    let mut session = match SdkSession::init(device) {
        Ok(session) => session,
        Err(code) => return Ok(fail(sink, format!("SDK init returned {}", code), Some(code))),
    };

    let count = session.device.device_count();
    if count <= 0 {
        return Ok(fail(sink, format!("no device (count={})", count), None));
    }

    let Some(handle) = session.open_first() else {
        return Ok(fail(sink, "opening device 0 failed".to_string(), None));
    };

    let (image_bytes, width, height) = match read_geometry(&mut *session.device, handle) {
        Ok(params) => params,
        Err(code) => {
            return Ok(fail(sink, format!("reading device parameters returned {}", code), Some(code)));
        }
    };

    let pixel_count = width as usize * height as usize;
    let mut buffer = vec![0u8; image_bytes as usize];
    tracing::info!("Fingerprint reader ready: {}x{}, {} bytes", width, height, image_bytes);
    emit(sink, CaptureEvent::Ready { width, height, image_bytes });
    if !settings.settle_delay.is_zero() {
        thread::sleep(settings.settle_delay);
    }

    let mut last_code = None;
    for attempt in 1..=settings.max_tries {
        emit(sink, CaptureEvent::Attempt { index: attempt, max: settings.max_tries });
        let code = session.device.acquire_image(handle, &mut buffer);
        last_code = Some(code);
        tracing::debug!("Acquire attempt {}/{} returned {}", attempt, settings.max_tries, code);

        match AcquireStatus::from_code(code) {
            AcquireStatus::Success => {
                if buffer.len() < pixel_count {
                    return Ok(fail(
                        sink,
                        format!("payload too small {}/{}", buffer.len(), pixel_count),
                        Some(code),
                    ));
                }
                let path = unique_capture_path(&settings.output_dir, Local::now());
                if let Err(e) = bitmap::write_gray8(&path, &buffer[..pixel_count], width, height) {
                    fail(sink, format!("saving bitmap failed: {}", e), Some(code));
                    return Err(e);
                }
                tracing::info!("Saved fingerprint to {} after {} tries", path.display(), attempt);
                emit(
                    sink,
                    CaptureEvent::Saved {
                        path: path.clone(),
                        width,
                        height,
                        tries: attempt,
                    },
                );
                return Ok(CaptureOutcome::Saved(CapturedImage {
                    path,
                    width,
                    height,
                    tries: attempt,
                }));
            }
            AcquireStatus::Busy => emit(sink, CaptureEvent::Busy { code }),
            AcquireStatus::Transient => emit(sink, CaptureEvent::Retry { code }),
            AcquireStatus::Fatal(code) => {
                return Ok(fail(sink, format!("acquire returned {}", code), Some(code)));
            }
        }

        if !settings.try_interval.is_zero() {
            thread::sleep(settings.try_interval);
        }
    }

    Ok(fail(sink, "max tries exceeded".to_string(), last_code))
}

/// `(image bytes, width, height)`, or the first failing status code.
fn read_geometry<D: FingerprintDevice + ?Sized>(
    device: &mut D,
    handle: DeviceHandle,
) -> std::result::Result<(u32, u32, u32), i32> {
    let image_bytes = read_u32_parameter(device, handle, PARAM_IMAGE_BYTES)?;
    let width = read_u32_parameter(device, handle, PARAM_IMAGE_WIDTH)?;
    let height = read_u32_parameter(device, handle, PARAM_IMAGE_HEIGHT)?;
    Ok((image_bytes, width, height))
}

/// Run `capture` on a worker thread. The device comes back with the outcome,
/// so a second capture cannot start on it while this one is in flight.
pub fn spawn_capture<D, S>(mut device: D, settings: CaptureSettings, mut sink: S) -> JoinHandle<(D, Result<CaptureOutcome>)>
where
    D: FingerprintDevice + Send + 'static,
    S: CaptureEventSink + Send + 'static,
{
    thread::spawn(move || {
        let outcome = capture(&mut device, &settings, &mut sink);
        (device, outcome)
    })
}

/// `<dir>/YYYYMMDDHHMM.bmp`, or `_1`, `_2`, ... appended when that name is taken.
pub fn unique_capture_path(dir: &Path, now: DateTime<Local>) -> PathBuf {
    let stem = now.format("%Y%m%d%H%M").to_string();
    let mut path = dir.join(format!("{}.bmp", stem));
    let mut suffix = 1;
    while path.exists() {
        path = dir.join(format!("{}_{}.bmp", stem, suffix));
        suffix += 1;
    }
    path
}

/// Map a failed outcome into an error for callers that need a hard failure.
pub fn require_saved(outcome: CaptureOutcome) -> Result<CapturedImage> {
    match outcome {
        CaptureOutcome::Saved(image) => Ok(image),
        CaptureOutcome::Failed { reason, last_code: Some(code) } => {
            tracing::warn!("Fingerprint capture failed: {}", reason);
            Err(BiometricError::Device { operation: "fingerprint capture", code })
        }
        CaptureOutcome::Failed { reason, last_code: None } => {
            Err(BiometricError::Other(anyhow::anyhow!("fingerprint capture failed: {}", reason)))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    pub struct Counters {
        pub init: AtomicUsize,
        pub terminate: AtomicUsize,
        pub open: AtomicUsize,
        pub close: AtomicUsize,
        pub acquire: AtomicUsize,
    }

    impl Counters {
        pub fn get(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    /// Device whose acquire codes come from a script; the last code repeats.
    pub struct ScriptedDevice {
        pub counters: Arc<Counters>,
        pub init_code: i32,
        pub count: i32,
        pub open_ok: bool,
        pub param_error: Option<i32>,
        pub width: u32,
        pub height: u32,
        pub image_bytes: u32,
        pub codes: VecDeque<i32>,
        pub panic_on_acquire: bool,
        pub fill: u8,
    }

    impl ScriptedDevice {
        pub fn new(codes: &[i32]) -> Self {
            Self {
                counters: Arc::new(Counters::default()),
                init_code: 0,
                count: 1,
                open_ok: true,
                param_error: None,
                width: 6,
                height: 4,
                image_bytes: 24,
                codes: codes.iter().copied().collect(),
                panic_on_acquire: false,
                fill: 0x80,
            }
        }
    }

    impl FingerprintDevice for ScriptedDevice {
        fn init(&mut self) -> i32 {
            self.counters.init.fetch_add(1, Ordering::SeqCst);
            self.init_code
        }

        fn terminate(&mut self) -> i32 {
            self.counters.terminate.fetch_add(1, Ordering::SeqCst);
            0
        }

        fn device_count(&mut self) -> i32 {
            self.count
        }

        fn open(&mut self, _index: i32) -> Option<DeviceHandle> {
            self.counters.open.fetch_add(1, Ordering::SeqCst);
            if self.open_ok {
                DeviceHandle::new(0xdead)
            } else {
                None
            }
        }

        fn close(&mut self, _handle: DeviceHandle) -> i32 {
            self.counters.close.fetch_add(1, Ordering::SeqCst);
            0
        }

        fn get_parameter(&mut self, _handle: DeviceHandle, code: i32, buf: &mut [u8]) -> std::result::Result<usize, i32> {
            if let Some(err) = self.param_error {
                return Err(err);
            }
            let value = match code {
                PARAM_IMAGE_WIDTH => self.width,
                PARAM_IMAGE_HEIGHT => self.height,
                PARAM_IMAGE_BYTES => self.image_bytes,
                _ => return Err(-1),
            };
            buf[..4].copy_from_slice(&value.to_le_bytes());
            Ok(4)
        }

        fn acquire_image(&mut self, _handle: DeviceHandle, buf: &mut [u8]) -> i32 {
            self.counters.acquire.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_acquire {
                panic!("driver crashed");
            }
            let code = if self.codes.len() > 1 {
                self.codes.pop_front().unwrap_or(0)
            } else {
                self.codes.front().copied().unwrap_or(0)
            };
            if code == 0 {
                buf.fill(self.fill);
            }
            code
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn settings(dir: &Path, max_tries: u32) -> CaptureSettings {
        CaptureSettings {
            max_tries,
            try_interval: Duration::ZERO,
            settle_delay: Duration::ZERO,
            output_dir: dir.to_path_buf(),
        }
    }

    fn released_once(counters: &Counters) {
        assert_eq!(Counters::get(&counters.close), 1);
        assert_eq!(Counters::get(&counters.terminate), 1);
    }

    #[test]
    fn exhausting_retries_reports_and_closes() {
        let dir = tempdir().unwrap();
        let mut device = ScriptedDevice::new(&[-8]);
        let counters = Arc::clone(&device.counters);

        let outcome = capture(&mut device, &settings(dir.path(), 5), &mut ()).unwrap();
        assert_eq!(
            outcome,
            CaptureOutcome::Failed {
                reason: "max tries exceeded".into(),
                last_code: Some(-8)
            }
        );
        assert_eq!(Counters::get(&counters.acquire), 5);
        released_once(&counters);
    }

    #[test]
    fn events_follow_protocol_order() {
        let dir = tempdir().unwrap();
        let mut device = ScriptedDevice::new(&[-12, -8, 0]);
        let mut events = Vec::new();
        let mut sink = CallbackSink(|event: &CaptureEvent| -> anyhow::Result<()> {
            events.push(event.name());
            Ok(())
        });

        let outcome = capture(&mut device, &settings(dir.path(), 10), &mut sink).unwrap();
        assert_eq!(
            events,
            vec!["ready", "attempt", "busy", "attempt", "retry", "attempt", "saved"]
        );

        let CaptureOutcome::Saved(image) = outcome else {
            panic!("capture did not save");
        };
        assert_eq!(image.tries, 3);
        let decoded = image::open(&image.path).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (6, 4));
        assert!(decoded.pixels().all(|p| p[0] == 0x80));
    }

    #[test]
    fn fatal_code_stops_immediately() {
        let dir = tempdir().unwrap();
        let mut device = ScriptedDevice::new(&[-12, -3, 0]);
        let counters = Arc::clone(&device.counters);

        let outcome = capture(&mut device, &settings(dir.path(), 10), &mut ()).unwrap();
        assert!(matches!(outcome, CaptureOutcome::Failed { last_code: Some(-3), .. }));
        assert_eq!(Counters::get(&counters.acquire), 2);
        released_once(&counters);
    }

    #[test]
    fn parameter_failure_still_closes_device() {
        let dir = tempdir().unwrap();
        let mut device = ScriptedDevice::new(&[0]);
        device.param_error = Some(-5);
        let counters = Arc::clone(&device.counters);

        let outcome = capture(&mut device, &settings(dir.path(), 3), &mut ()).unwrap();
        assert!(matches!(outcome, CaptureOutcome::Failed { last_code: Some(-5), .. }));
        assert_eq!(Counters::get(&counters.acquire), 0);
        released_once(&counters);
    }

    #[test]
    fn init_and_enumeration_failures() {
        let dir = tempdir().unwrap();

        let mut device = ScriptedDevice::new(&[0]);
        device.init_code = -1;
        let counters = Arc::clone(&device.counters);
        assert!(!capture(&mut device, &settings(dir.path(), 3), &mut ()).unwrap().is_saved());
        assert_eq!(Counters::get(&counters.terminate), 0);

        // Already-initialised is accepted.
        let mut device = ScriptedDevice::new(&[0]);
        device.init_code = 1;
        assert!(capture(&mut device, &settings(dir.path(), 3), &mut ()).unwrap().is_saved());

        let mut device = ScriptedDevice::new(&[0]);
        device.count = 0;
        let counters = Arc::clone(&device.counters);
        assert!(!capture(&mut device, &settings(dir.path(), 3), &mut ()).unwrap().is_saved());
        assert_eq!(Counters::get(&counters.open), 0);
        assert_eq!(Counters::get(&counters.terminate), 1);

        let mut device = ScriptedDevice::new(&[0]);
        device.open_ok = false;
        let counters = Arc::clone(&device.counters);
        assert!(!capture(&mut device, &settings(dir.path(), 3), &mut ()).unwrap().is_saved());
        assert_eq!(Counters::get(&counters.close), 0);
        assert_eq!(Counters::get(&counters.terminate), 1);
    }

    #[test]
    fn undersized_buffer_is_rejected() {
        let dir = tempdir().unwrap();
        let mut device = ScriptedDevice::new(&[0]);
        device.image_bytes = 10;
        let counters = Arc::clone(&device.counters);
        let (mut tx, rx) = mpsc::channel::<CaptureEvent>();
        let outcome = capture(&mut device, &settings(dir.path(), 3), &mut tx).unwrap();
        assert_eq!(
            outcome,
            CaptureOutcome::Failed {
                reason: "payload too small 10/24".into(),
                last_code: Some(0)
            }
        );
        drop(tx);
        let names: Vec<&str> = rx.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["ready", "attempt", "error"]);
        assert_eq!(Counters::get(&counters.acquire), 1);
        released_once(&counters);
    }

    #[test]
    fn panic_inside_poll_loop_still_releases() {
        let dir = tempdir().unwrap();
        let mut device = ScriptedDevice::new(&[0]);
        device.panic_on_acquire = true;
        let counters = Arc::clone(&device.counters);

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = capture(&mut device, &settings(dir.path(), 3), &mut ());
        }));
        assert!(result.is_err());
        released_once(&counters);
    }

    #[test]
    fn broken_sinks_do_not_abort_capture() {
        let dir = tempdir().unwrap();

        let mut device = ScriptedDevice::new(&[-12, 0]);
        let mut failing = CallbackSink(|_: &CaptureEvent| -> anyhow::Result<()> { Err(anyhow::anyhow!("ui gone")) });
        assert!(capture(&mut device, &settings(dir.path(), 5), &mut failing).unwrap().is_saved());

        let mut device = ScriptedDevice::new(&[-12, 0]);
        let mut panicking = CallbackSink(|_: &CaptureEvent| -> anyhow::Result<()> { panic!("ui bug") });
        assert!(capture(&mut device, &settings(dir.path(), 5), &mut panicking).unwrap().is_saved());

        let (tx, rx) = mpsc::channel::<CaptureEvent>();
        drop(rx);
        let mut device = ScriptedDevice::new(&[0]);
        let mut closed = tx;
        assert!(capture(&mut device, &settings(dir.path(), 5), &mut closed).unwrap().is_saved());
    }

    #[test]
    fn background_capture_streams_events() {
        let dir = tempdir().unwrap();
        let device = ScriptedDevice::new(&[-8, 0]);
        let (tx, rx) = mpsc::channel::<CaptureEvent>();

        let handle = spawn_capture(device, settings(dir.path(), 5), tx);
        let (device, outcome) = handle.join().unwrap();
        assert!(outcome.unwrap().is_saved());
        released_once(&device.counters);

        let names: Vec<_> = rx.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["ready", "attempt", "retry", "attempt", "saved"]);
    }

    #[test]
    fn capture_paths_get_numeric_suffixes() {
        let dir = tempdir().unwrap();
        let now = Local::now();
        let first = unique_capture_path(dir.path(), now);
        assert!(first.file_name().unwrap().to_string_lossy().ends_with(".bmp"));
        std::fs::write(&first, b"x").unwrap();

        let second = unique_capture_path(dir.path(), now);
        assert!(second.to_string_lossy().ends_with("_1.bmp"));
        std::fs::write(&second, b"x").unwrap();
        assert!(unique_capture_path(dir.path(), now).to_string_lossy().ends_with("_2.bmp"));
    }
}
