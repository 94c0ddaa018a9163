//! Frame-driven face enrollment.
//!
//! The machine is fed one frame per tick. Frames pass through detection, the
//! confidence/liveness gate and a minimum spacing rule before their embedding is
//! collected. Once enough embeddings are in, their mean is checked against the
//! gallery: a close match ends the session as `Duplicate`, otherwise the
//! identity is committed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::config::EnrollmentConfig;
use crate::common::{BiometricError, Result};
use crate::core::matcher::{find_best_match, mean_embedding, Embedding};
use crate::core::observation::{
    screen_frame, FaceRect, FrameObservationSource, FrameRejection, LivenessGate, MultiFacePolicy,
    Screening,
};
use crate::storage::{CommitOutcome, EnrolledIdentity, Gallery};

#[derive(Debug, Clone)]
pub struct EnrollmentSettings {
    pub required_frames: usize,
    pub confidence_threshold: f32,
    pub frame_interval: Duration,
    pub detection_time_limit: Duration,
    pub duplicate_threshold: f32,
    pub multi_face: MultiFacePolicy,
}

impl From<&EnrollmentConfig> for EnrollmentSettings {
    fn from(config: &EnrollmentConfig) -> Self {
        Self {
            required_frames: config.required_frames,
            confidence_threshold: config.confidence_threshold,
            frame_interval: config.frame_interval(),
            detection_time_limit: config.detection_time_limit(),
            duplicate_threshold: config.duplicate_threshold,
            multi_face: if config.reject_multiple_faces {
                MultiFacePolicy::Reject
            } else {
                MultiFacePolicy::Largest
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollmentState {
    Collecting,
    Succeeded { identity: String },
    Duplicate { identity: String, similarity: f32 },
    TimedOut,
    Cancelled,
    Aborted { reason: String },
}

impl EnrollmentState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EnrollmentState::Collecting)
    }
}

/// Side effects of a single tick, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollmentEffect {
    Rejected(FrameRejection),
    /// Frame passed the gate but arrived before `frame_interval` elapsed.
    TooSoon,
    Collected { collected: usize, required: usize },
    /// The identity is in the gallery; the caller should store the crop of `face`.
    Committed { identity: EnrolledIdentity, face: FaceRect },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentStep {
    pub state: EnrollmentState,
    pub effects: Vec<EnrollmentEffect>,
}

pub struct EnrollmentStateMachine<D, L> {
    name: String,
    settings: EnrollmentSettings,
    gallery: Arc<Gallery>,
    source: D,
    liveness: L,
    collected: Vec<Embedding>,
    started_at: Instant,
    last_collected_at: Option<Instant>,
    state: EnrollmentState,
}

impl<D, L> EnrollmentStateMachine<D, L>
where
    D: FrameObservationSource,
    L: LivenessGate<D::Frame>,
{
    /// Start a session for `name`. Fails without starting if the name is empty,
    /// or already enrolled and `replace` is false.
    pub fn new(
        name: &str,
        replace: bool,
        settings: EnrollmentSettings,
        gallery: Arc<Gallery>,
        source: D,
        liveness: L,
        started_at: Instant,
    ) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(BiometricError::InvalidInput("enrollment name must not be empty".into()));
        }
        if !replace && gallery.contains(name) {
            return Err(BiometricError::InvalidInput(format!("{} already has an enrolled face", name)));
        }
        if settings.required_frames == 0 {
            return Err(BiometricError::InvalidInput("required_frames must be at least 1".into()));
        }

        tracing::info!(
            "Starting face enrollment for {} ({} frames, {:?} limit)",
            name,
            settings.required_frames,
            settings.detection_time_limit
        );

        Ok(Self {
            name: name.to_string(),
            collected: Vec::with_capacity(settings.required_frames),
            settings,
            gallery,
            source,
            liveness,
            started_at,
            last_collected_at: None,
            state: EnrollmentState::Collecting,
        })
    }

    pub fn state(&self) -> &EnrollmentState {
        &self.state
    }

    pub fn collected(&self) -> usize {
        self.collected.len()
    }

    pub fn cancel(&mut self) -> &EnrollmentState {
        if !self.state.is_terminal() {
            tracing::info!("Enrollment for {} cancelled", self.name);
            self.state = EnrollmentState::Cancelled;
        }
        &self.state
    }

    /// Feed one frame observed at `now`.
    ///
    /// A detector, liveness or gallery storage failure moves the session to
    /// `Aborted` and is returned as the error; the session is not retried.
    pub fn tick(&mut self, frame: &D::Frame, now: Instant) -> Result<EnrollmentStep> {
        let mut effects = Vec::new();
        if self.state.is_terminal() {
            return Ok(self.step(effects));
        }

        if now.saturating_duration_since(self.started_at) > self.settings.detection_time_limit {
            tracing::info!(
                "Enrollment for {} timed out with {}/{} frames",
                self.name,
                self.collected.len(),
                self.settings.required_frames
            );
            self.state = EnrollmentState::TimedOut;
            return Ok(self.step(effects));
        }

        let screening = match screen_frame(
            &mut self.source,
            &mut self.liveness,
            frame,
            self.settings.multi_face,
            self.settings.confidence_threshold,
        ) {
            Ok(screening) => screening,
            Err(e) => {
                tracing::error!("Enrollment for {} aborted: {}", self.name, e);
                self.state = EnrollmentState::Aborted { reason: e.to_string() };
                return Err(e);
            }
        };

        let face = match screening {
            Screening::Passed(face) => face,
            Screening::Rejected(reason) => {
                tracing::debug!("Frame rejected: {:?}", reason);
                effects.push(EnrollmentEffect::Rejected(reason));
                return Ok(self.step(effects));
            }
        };

        if let Some(last) = self.last_collected_at {
            if now.saturating_duration_since(last) < self.settings.frame_interval {
                effects.push(EnrollmentEffect::TooSoon);
                return Ok(self.step(effects));
            }
        }

        self.collected.push(face.embedding);
        self.last_collected_at = Some(now);
        effects.push(EnrollmentEffect::Collected {
            collected: self.collected.len(),
            required: self.settings.required_frames,
        });
        tracing::debug!(
            "Collected face embedding {}/{}",
            self.collected.len(),
            self.settings.required_frames
        );

        if self.collected.len() >= self.settings.required_frames {
            if let Err(e) = self.finish(face.bbox, &mut effects) {
                tracing::error!("Enrollment for {} aborted at commit: {}", self.name, e);
                self.state = EnrollmentState::Aborted { reason: e.to_string() };
                return Err(e);
            }
        }

        Ok(self.step(effects))
    }

    fn finish(&mut self, face: FaceRect, effects: &mut Vec<EnrollmentEffect>) -> Result<()> {
        let averaged = mean_embedding(&self.collected);
        let threshold = self.settings.duplicate_threshold;

        let snapshot = self.gallery.snapshot();
        let others = snapshot.iter().filter(|(name, _)| **name != self.name);
        let conflict = find_best_match(&averaged, others, threshold);

        let conflict = if conflict.is_match() {
            Some(conflict)
        } else {
            let identity = EnrolledIdentity {
                name: self.name.clone(),
                embedding: averaged,
            };
            match self.gallery.commit_unique(identity.clone(), threshold)? {
                CommitOutcome::Committed => {
                    effects.push(EnrollmentEffect::Committed { identity, face });
                    None
                }
                CommitOutcome::Duplicate(found) => Some(found),
            }
        };

        self.state = match conflict {
            Some(found) => {
                let identity = found.identity.unwrap_or_default();
                tracing::info!(
                    "Enrollment for {} rejected: duplicate of {} ({:.3})",
                    self.name,
                    identity,
                    found.similarity
                );
                EnrollmentState::Duplicate {
                    identity,
                    similarity: found.similarity,
                }
            }
            None => {
                tracing::info!("Enrolled face for {}", self.name);
                EnrollmentState::Succeeded { identity: self.name.clone() }
            }
        };
        Ok(())
    }

    fn step(&self, effects: Vec<EnrollmentEffect>) -> EnrollmentStep {
        EnrollmentStep {
            state: self.state.clone(),
            effects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observation::testing::*;
    use crate::core::observation::LivenessVerdict;
    use crate::storage::{GalleryMap, GalleryStore};

    fn settings() -> EnrollmentSettings {
        EnrollmentSettings {
            required_frames: 3,
            confidence_threshold: 0.6,
            frame_interval: Duration::from_millis(500),
            detection_time_limit: Duration::from_secs(10),
            duplicate_threshold: 0.8,
            multi_face: MultiFacePolicy::Largest,
        }
    }

    fn machine(
        gallery: Arc<Gallery>,
        t0: Instant,
    ) -> EnrollmentStateMachine<ScriptedDetector, ScriptedLiveness> {
        EnrollmentStateMachine::new(
            "alice",
            false,
            settings(),
            gallery,
            ScriptedDetector,
            ScriptedLiveness::default(),
            t0,
        )
        .unwrap()
    }

    fn at(t0: Instant, millis: u64) -> Instant {
        t0 + Duration::from_millis(millis)
    }

    #[test]
    fn frames_closer_than_interval_are_not_collected() {
        let gallery = Arc::new(Gallery::in_memory(GalleryMap::new()));
        let t0 = Instant::now();
        let mut m = machine(gallery, t0);
        let frame = ScriptedFrame::face(unit(&[1.0, 0.0]), 0.9, LivenessVerdict::Real);

        m.tick(&frame, at(t0, 0)).unwrap();
        let step = m.tick(&frame, at(t0, 200)).unwrap();
        assert_eq!(step.effects, vec![EnrollmentEffect::TooSoon]);
        assert_eq!(m.collected(), 1);

        m.tick(&frame, at(t0, 500)).unwrap();
        assert_eq!(m.collected(), 2);
    }

    #[test]
    fn fake_and_weak_frames_never_count() {
        let gallery = Arc::new(Gallery::in_memory(GalleryMap::new()));
        let t0 = Instant::now();
        let mut m = machine(gallery, t0);

        let fake = ScriptedFrame::face(unit(&[1.0, 0.0]), 0.9, LivenessVerdict::Fake);
        let weak = ScriptedFrame::face(unit(&[1.0, 0.0]), 0.6, LivenessVerdict::Real);
        for i in 0..10 {
            m.tick(&fake, at(t0, i * 600)).unwrap();
            m.tick(&weak, at(t0, i * 600 + 300)).unwrap();
            m.tick(&ScriptedFrame::empty(), at(t0, i * 600 + 400)).unwrap();
        }
        assert_eq!(m.collected(), 0);
        assert_eq!(m.state(), &EnrollmentState::Collecting);
    }

    #[test]
    fn times_out_without_valid_frames() {
        let gallery = Arc::new(Gallery::in_memory(GalleryMap::new()));
        let t0 = Instant::now();
        let mut m = machine(Arc::clone(&gallery), t0);

        let mut t = 0;
        while t <= 10_000 {
            let step = m.tick(&ScriptedFrame::empty(), at(t0, t)).unwrap();
            assert_eq!(step.state, EnrollmentState::Collecting);
            t += 100;
        }
        let step = m.tick(&ScriptedFrame::empty(), at(t0, 10_001)).unwrap();
        assert_eq!(step.state, EnrollmentState::TimedOut);

        // Terminal states are sticky.
        let real = ScriptedFrame::face(unit(&[1.0, 0.0]), 0.9, LivenessVerdict::Real);
        assert_eq!(m.tick(&real, at(t0, 10_100)).unwrap().state, EnrollmentState::TimedOut);
        assert!(gallery.is_empty());
    }

    #[test]
    fn commits_after_required_frames() {
        let gallery = Arc::new(Gallery::in_memory(GalleryMap::new()));
        let t0 = Instant::now();
        let mut m = machine(Arc::clone(&gallery), t0);
        let frame = ScriptedFrame::face(unit(&[3.0, 4.0]), 0.9, LivenessVerdict::Real);

        m.tick(&frame, at(t0, 0)).unwrap();
        m.tick(&frame, at(t0, 600)).unwrap();
        let step = m.tick(&frame, at(t0, 1200)).unwrap();

        assert_eq!(step.state, EnrollmentState::Succeeded { identity: "alice".into() });
        assert!(matches!(
            step.effects.last(),
            Some(EnrollmentEffect::Committed { face, .. }) if *face == FaceRect::new(0, 0, 100, 100)
        ));
        let stored = gallery.get("alice").unwrap();
        assert!((stored[0] - 0.6).abs() < 1e-6 && (stored[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn duplicate_face_is_not_committed() {
        let mut existing = GalleryMap::new();
        existing.insert("bob".to_string(), unit(&[1.0, 0.0]));
        let gallery = Arc::new(Gallery::in_memory(existing));
        let t0 = Instant::now();
        let mut m = machine(Arc::clone(&gallery), t0);
        let frame = ScriptedFrame::face(unit(&[0.95, 0.05]), 0.9, LivenessVerdict::Real);

        m.tick(&frame, at(t0, 0)).unwrap();
        m.tick(&frame, at(t0, 600)).unwrap();
        let step = m.tick(&frame, at(t0, 1200)).unwrap();

        match step.state {
            EnrollmentState::Duplicate { identity, similarity } => {
                assert_eq!(identity, "bob");
                assert!(similarity > 0.8);
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert_eq!(gallery.len(), 1);
        assert!(!gallery.contains("alice"));
    }

    #[test]
    fn detector_failure_aborts_the_session() {
        let gallery = Arc::new(Gallery::in_memory(GalleryMap::new()));
        let t0 = Instant::now();
        let mut m = machine(gallery, t0);
        let broken = ScriptedFrame { detector_fails: true, ..ScriptedFrame::default() };

        assert!(m.tick(&broken, at(t0, 0)).is_err());
        assert!(matches!(m.state(), EnrollmentState::Aborted { .. }));
    }

    /// Gallery backend whose writes always fail.
    struct FullDisk;

    impl GalleryStore for FullDisk {
        fn load(&self) -> Result<GalleryMap> {
            Ok(GalleryMap::new())
        }

        fn save(&self, _gallery: &GalleryMap) -> Result<()> {
            Err(BiometricError::Storage("disk full".into()))
        }
    }

    #[test]
    fn failed_commit_aborts_instead_of_collecting_more() {
        let gallery = Arc::new(Gallery::open(Box::new(FullDisk)).unwrap());
        let t0 = Instant::now();
        let mut m = machine(Arc::clone(&gallery), t0);
        let frame = ScriptedFrame::face(unit(&[1.0, 0.0]), 0.9, LivenessVerdict::Real);

        m.tick(&frame, at(t0, 0)).unwrap();
        m.tick(&frame, at(t0, 600)).unwrap();
        assert!(matches!(m.tick(&frame, at(t0, 1200)), Err(BiometricError::Storage(_))));
        assert!(matches!(m.state(), EnrollmentState::Aborted { reason } if reason.contains("disk full")));

        let step = m.tick(&frame, at(t0, 1800)).unwrap();
        assert!(matches!(step.state, EnrollmentState::Aborted { .. }));
        assert!(step.effects.is_empty());
        assert_eq!(m.collected(), 3);
        assert!(gallery.is_empty());
    }

    #[test]
    fn cancel_is_terminal_and_idempotent() {
        let gallery = Arc::new(Gallery::in_memory(GalleryMap::new()));
        let t0 = Instant::now();
        let mut m = machine(gallery, t0);
        assert_eq!(m.cancel(), &EnrollmentState::Cancelled);
        let real = ScriptedFrame::face(unit(&[1.0, 0.0]), 0.9, LivenessVerdict::Real);
        assert_eq!(m.tick(&real, at(t0, 0)).unwrap().state, EnrollmentState::Cancelled);
        assert_eq!(m.collected(), 0);
    }

    #[test]
    fn constructor_rejects_bad_names() {
        let mut existing = GalleryMap::new();
        existing.insert("alice".to_string(), unit(&[1.0, 0.0]));
        let gallery = Arc::new(Gallery::in_memory(existing));
        let t0 = Instant::now();

        let empty = EnrollmentStateMachine::new(
            " ", false, settings(), Arc::clone(&gallery), ScriptedDetector, ScriptedLiveness::default(), t0,
        );
        assert!(matches!(empty, Err(BiometricError::InvalidInput(_))));

        let taken = EnrollmentStateMachine::new(
            "alice", false, settings(), Arc::clone(&gallery), ScriptedDetector, ScriptedLiveness::default(), t0,
        );
        assert!(taken.is_err());

        let replace = EnrollmentStateMachine::new(
            "alice", true, settings(), gallery, ScriptedDetector, ScriptedLiveness::default(), t0,
        );
        assert!(replace.is_ok());
    }
}
