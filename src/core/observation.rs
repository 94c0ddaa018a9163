//! Per-frame face observations and the collaborator seams that produce them.

use crate::common::Result;
use crate::core::matcher::Embedding;

/// Integer bounding box in frame coordinates, `(x1, y1)` inclusive to `(x2, y2)` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl FaceRect {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y2 - self.y1).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    Real,
    Fake,
}

#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub bbox: FaceRect,
    pub detection_confidence: f32,
    /// Unit-norm embedding.
    pub embedding: Embedding,
    /// Set when the detector already ran a liveness check.
    pub liveness: Option<LivenessVerdict>,
}

/// Wraps the external face detector/embedder.
pub trait FrameObservationSource {
    type Frame;

    fn detect(&mut self, frame: &Self::Frame) -> Result<Vec<FaceObservation>>;
}

/// Wraps the external anti-spoofing classifier.
pub trait LivenessGate<F> {
    fn classify(&mut self, frame: &F, bbox: &FaceRect) -> Result<LivenessVerdict>;
}

impl<T: FrameObservationSource + ?Sized> FrameObservationSource for &mut T {
    type Frame = T::Frame;

    fn detect(&mut self, frame: &Self::Frame) -> Result<Vec<FaceObservation>> {
        (**self).detect(frame)
    }
}

impl<F, T: LivenessGate<F> + ?Sized> LivenessGate<F> for &mut T {
    fn classify(&mut self, frame: &F, bbox: &FaceRect) -> Result<LivenessVerdict> {
        (**self).classify(frame, bbox)
    }
}

/// What to do with frames that contain several faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiFacePolicy {
    /// Keep the face with the largest box area.
    #[default]
    Largest,
    /// Ignore the frame entirely.
    Reject,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameRejection {
    NoFace,
    MultipleFaces(usize),
    LowConfidence(f32),
    Spoof,
}

/// Outcome of running one frame through detection and the liveness/confidence gate.
#[derive(Debug, Clone)]
pub enum Screening {
    Passed(FaceObservation),
    Rejected(FrameRejection),
}

/// Largest face by box area; ties go to the first one reported.
pub fn select_largest(faces: Vec<FaceObservation>) -> Option<FaceObservation> {
    let mut best: Option<FaceObservation> = None;
    for face in faces {
        match &best {
            Some(current) if face.bbox.area() <= current.bbox.area() => {}
            _ => best = Some(face),
        }
    }
    best
}

pub(crate) fn screen_frame<D, L>(
    source: &mut D,
    liveness: &mut L,
    frame: &D::Frame,
    policy: MultiFacePolicy,
    confidence_threshold: f32,
) -> Result<Screening>
where
    D: FrameObservationSource,
    L: LivenessGate<D::Frame>,
{
    let faces = source.detect(frame)?;
    let face_count = faces.len();
    if face_count > 1 && policy == MultiFacePolicy::Reject {
        return Ok(Screening::Rejected(FrameRejection::MultipleFaces(face_count)));
    }

    let Some(face) = select_largest(faces) else {
        return Ok(Screening::Rejected(FrameRejection::NoFace));
    };

    if face.detection_confidence <= confidence_threshold {
        return Ok(Screening::Rejected(FrameRejection::LowConfidence(face.detection_confidence)));
    }

    let verdict = match face.liveness {
        Some(verdict) => verdict,
        None => liveness.classify(frame, &face.bbox)?,
    };
    if verdict == LivenessVerdict::Fake {
        return Ok(Screening::Rejected(FrameRejection::Spoof));
    }

    Ok(Screening::Passed(face))
}
