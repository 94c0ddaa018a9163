use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use triguard::common::config::FingerprintConfig;
use triguard::core::{
    EnrollmentSettings, EnrollmentState, EnrollmentStateMachine, FaceObservation, FaceRect, FrameObservationSource,
    LivenessGate, LivenessVerdict, MultiFacePolicy,
};
use triguard::fingerprint::device::{DeviceHandle, PARAM_IMAGE_BYTES, PARAM_IMAGE_HEIGHT, PARAM_IMAGE_WIDTH};
use triguard::fingerprint::{capture, CaptureEvent, CaptureOutcome, CaptureSettings, FingerprintDevice};
use triguard::login::{run_enrollment, FrameFeed};
use triguard::storage::{Gallery, GalleryMap};

/// A frame is the single face the detector should report.
#[derive(Clone)]
struct Frame {
    embedding: Vec<f32>,
    confidence: f32,
}

struct Detector;

impl FrameObservationSource for Detector {
    type Frame = Frame;

    fn detect(&mut self, frame: &Frame) -> triguard::Result<Vec<FaceObservation>> {
        Ok(vec![FaceObservation {
            bbox: FaceRect::new(10, 10, 110, 110),
            detection_confidence: frame.confidence,
            embedding: frame.embedding.clone(),
            liveness: None,
        }])
    }
}

struct AlwaysReal;

impl LivenessGate<Frame> for AlwaysReal {
    fn classify(&mut self, _frame: &Frame, _bbox: &FaceRect) -> triguard::Result<LivenessVerdict> {
        Ok(LivenessVerdict::Real)
    }
}

struct SpacedFeed {
    start: Instant,
    spacing: Duration,
    frames: VecDeque<Frame>,
    sent: u32,
}

impl FrameFeed for SpacedFeed {
    type Frame = Frame;

    fn now(&self) -> Instant {
        self.start
    }

    fn next_frame(&mut self) -> triguard::Result<Option<(Frame, Instant)>> {
        let Some(frame) = self.frames.pop_front() else {
            return Ok(None);
        };
        self.sent += 1;
        Ok(Some((frame, self.start + self.spacing * self.sent)))
    }
}

fn settings(duplicate_threshold: f32) -> EnrollmentSettings {
    EnrollmentSettings {
        required_frames: 5,
        confidence_threshold: 0.6,
        frame_interval: Duration::from_millis(500),
        detection_time_limit: Duration::from_secs(10),
        duplicate_threshold,
        multi_face: MultiFacePolicy::Largest,
    }
}

fn feed_of(embedding: &[f32]) -> SpacedFeed {
    // Neighbouring frames differ by well under 1e-6.
    let frames = (0..5)
        .map(|i| {
            let mut e = embedding.to_vec();
            e[0] += i as f32 * 1e-7;
            Frame {
                embedding: e,
                confidence: 0.8,
            }
        })
        .collect();
    SpacedFeed {
        start: Instant::now(),
        spacing: Duration::from_millis(600),
        frames,
        sent: 0,
    }
}

fn enroll(gallery: &Arc<Gallery>, name: &str, embedding: &[f32], duplicate_threshold: f32) -> EnrollmentState {
    let mut feed = feed_of(embedding);
    let mut machine = EnrollmentStateMachine::new(
        name,
        false,
        settings(duplicate_threshold),
        Arc::clone(gallery),
        Detector,
        AlwaysReal,
        feed.now(),
    )
    .unwrap();
    run_enrollment(&mut machine, &mut feed, |_, _| Ok(())).unwrap()
}

#[test]
fn five_spaced_frames_enroll_the_averaged_face() {
    let gallery = Arc::new(Gallery::in_memory(GalleryMap::new()));
    let input = [0.6f32, 0.8, 0.0];

    let state = enroll(&gallery, "bob", &input, 0.8);
    assert_eq!(state, EnrollmentState::Succeeded { identity: "bob".into() });

    let stored = gallery.get("bob").unwrap();
    for (got, want) in stored.iter().zip(input.iter()) {
        assert!((got - want).abs() < 1e-5, "{:?} vs {:?}", stored, input);
    }
}

#[test]
fn similar_face_is_reported_as_duplicate() {
    let mut existing = GalleryMap::new();
    existing.insert("alice".to_string(), vec![1.0, 0.0, 0.0]);
    let gallery = Arc::new(Gallery::in_memory(existing));

    let similar = [0.9f32, (1.0f32 - 0.81).sqrt(), 0.0];
    match enroll(&gallery, "bob", &similar, 0.8) {
        EnrollmentState::Duplicate { identity, similarity } => {
            assert_eq!(identity, "alice");
            assert!((similarity - 0.9).abs() < 1e-4);
        }
        other => panic!("expected duplicate, got {:?}", other),
    }
    assert_eq!(gallery.len(), 1);
    assert!(!gallery.contains("bob"));
}

/// Reader that never gets a clean image.
struct FlakyReader {
    open: bool,
    acquires: u32,
}

impl FingerprintDevice for FlakyReader {
    fn init(&mut self) -> i32 {
        0
    }

    fn terminate(&mut self) -> i32 {
        0
    }

    fn device_count(&mut self) -> i32 {
        1
    }

    fn open(&mut self, _index: i32) -> Option<DeviceHandle> {
        self.open = true;
        DeviceHandle::new(1)
    }

    fn close(&mut self, _handle: DeviceHandle) -> i32 {
        self.open = false;
        0
    }

    fn get_parameter(&mut self, _handle: DeviceHandle, code: i32, buf: &mut [u8]) -> Result<usize, i32> {
        let value: u32 = match code {
            PARAM_IMAGE_WIDTH => 8,
            PARAM_IMAGE_HEIGHT => 8,
            PARAM_IMAGE_BYTES => 64,
            _ => return Err(-1),
        };
        buf[..4].copy_from_slice(&value.to_le_bytes());
        Ok(4)
    }

    fn acquire_image(&mut self, _handle: DeviceHandle, _buf: &mut [u8]) -> i32 {
        self.acquires += 1;
        -8
    }
}

#[test]
fn capture_gives_up_after_max_tries_and_closes_the_reader() {
    let tmp = TempDir::new().unwrap();
    let config = FingerprintConfig {
        max_tries: 4,
        try_interval_ms: 0,
        settle_delay_ms: 0,
        ..FingerprintConfig::default()
    };
    let settings = CaptureSettings::from_config(&config, tmp.path());
    let mut reader = FlakyReader { open: false, acquires: 0 };
    let mut events: Vec<CaptureEvent> = Vec::new();
    let mut sink = triguard::fingerprint::CallbackSink(|event: &CaptureEvent| {
        events.push(event.clone());
        Ok(())
    });

    let outcome = capture(&mut reader, &settings, &mut sink).unwrap();
    assert_eq!(
        outcome,
        CaptureOutcome::Failed {
            reason: "max tries exceeded".into(),
            last_code: Some(-8)
        }
    );
    assert_eq!(reader.acquires, 4);
    assert!(!reader.open);

    let names: Vec<&str> = events.iter().map(CaptureEvent::name).collect();
    assert_eq!(names.first(), Some(&"ready"));
    assert_eq!(names.last(), Some(&"error"));
    assert_eq!(names.iter().filter(|n| **n == "attempt").count(), 4);
    assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
}
