//! Frame-driven face verification against a claimed identity.
//!
//! Each passing frame is matched against the whole gallery. A hit only counts
//! when it names the claimed identity and at least `debounce_interval` has
//! passed since the previous hit, so a burst of near-identical frames cannot
//! authenticate on its own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::config::VerificationConfig;
use crate::common::{BiometricError, Result};
use crate::core::matcher::find_best_match;
use crate::core::observation::{
    screen_frame, FrameObservationSource, FrameRejection, LivenessGate, MultiFacePolicy, Screening,
};
use crate::storage::Gallery;

#[derive(Debug, Clone)]
pub struct VerificationSettings {
    pub similarity_threshold: f32,
    pub confidence_threshold: f32,
    pub debounce_interval: Duration,
    /// Accept once the hit count is strictly greater than this.
    pub required_hits: u32,
    pub detection_time_limit: Duration,
    pub multi_face: MultiFacePolicy,
}

impl From<&VerificationConfig> for VerificationSettings {
    fn from(config: &VerificationConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            confidence_threshold: config.confidence_threshold,
            debounce_interval: config.debounce_interval(),
            required_hits: config.required_hits,
            detection_time_limit: config.detection_time_limit(),
            multi_face: if config.reject_multiple_faces {
                MultiFacePolicy::Reject
            } else {
                MultiFacePolicy::Largest
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationState {
    Watching,
    Accepted { similarity: f32 },
    Rejected,
    TimedOut,
    Aborted { reason: String },
}

impl VerificationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, VerificationState::Watching)
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, VerificationState::Accepted { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationEffect {
    Rejected(FrameRejection),
    /// Face passed the gate but matched nobody above the threshold.
    NoMatch,
    /// Face matched an identity other than the claimed one; hits were reset.
    OtherIdentity { identity: String, similarity: f32 },
    /// Matched the claimed identity inside the debounce window.
    Debounced { similarity: f32 },
    Hit { hits: u32, similarity: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationStep {
    pub state: VerificationState,
    pub effects: Vec<VerificationEffect>,
}

pub struct VerificationStateMachine<D, L> {
    target: String,
    settings: VerificationSettings,
    gallery: Arc<Gallery>,
    source: D,
    liveness: L,
    consecutive_hits: u32,
    started_at: Instant,
    last_hit_at: Instant,
    state: VerificationState,
}

impl<D, L> VerificationStateMachine<D, L>
where
    D: FrameObservationSource,
    L: LivenessGate<D::Frame>,
{
    /// Start verifying `target`, which must already be enrolled.
    pub fn new(
        target: &str,
        settings: VerificationSettings,
        gallery: Arc<Gallery>,
        source: D,
        liveness: L,
        started_at: Instant,
    ) -> Result<Self> {
        if !gallery.contains(target) {
            return Err(BiometricError::UserNotFound(format!("{} has no enrolled face", target)));
        }

        tracing::info!(
            "Starting face verification for {} (threshold {:.2}, {} hits)",
            target,
            settings.similarity_threshold,
            settings.required_hits + 1
        );

        Ok(Self {
            target: target.to_string(),
            settings,
            gallery,
            source,
            liveness,
            consecutive_hits: 0,
            started_at,
            last_hit_at: started_at,
            state: VerificationState::Watching,
        })
    }

    pub fn state(&self) -> &VerificationState {
        &self.state
    }

    pub fn hits(&self) -> u32 {
        self.consecutive_hits
    }

    pub fn cancel(&mut self) -> &VerificationState {
        if !self.state.is_terminal() {
            self.state = VerificationState::Rejected;
        }
        &self.state
    }

    pub fn tick(&mut self, frame: &D::Frame, now: Instant) -> Result<VerificationStep> {
        let mut effects = Vec::new();
        if self.state.is_terminal() {
            return Ok(self.step(effects));
        }

        if now.saturating_duration_since(self.started_at) > self.settings.detection_time_limit {
            tracing::info!(
                "Verification for {} timed out after {} hit(s)",
                self.target,
                self.consecutive_hits
            );
            self.state = VerificationState::TimedOut;
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
                tracing::error!("Verification for {} aborted: {}", self.target, e);
                self.state = VerificationState::Aborted { reason: e.to_string() };
                return Err(e);
            }
        };

        // A spoofed frame is dropped here, before the debounce clock is looked at,
        // so it neither spends the window nor clears earlier hits.
        let face = match screening {
            Screening::Passed(face) => face,
            Screening::Rejected(reason) => {
                effects.push(VerificationEffect::Rejected(reason));
                return Ok(self.step(effects));
            }
        };

        let snapshot = self.gallery.snapshot();
        let result = find_best_match(&face.embedding, snapshot.iter(), self.settings.similarity_threshold);

        match result.identity {
            None => effects.push(VerificationEffect::NoMatch),
            Some(identity) if identity != self.target => {
                tracing::debug!("Frame matched {} instead of {}", identity, self.target);
                self.consecutive_hits = 0;
                effects.push(VerificationEffect::OtherIdentity {
                    identity,
                    similarity: result.similarity,
                });
            }
            Some(_) => {
                if now.saturating_duration_since(self.last_hit_at) >= self.settings.debounce_interval {
                    self.consecutive_hits += 1;
                    self.last_hit_at = now;
                    tracing::debug!(
                        "Hit {} for {} ({:.3})",
                        self.consecutive_hits,
                        self.target,
                        result.similarity
                    );
                    effects.push(VerificationEffect::Hit {
                        hits: self.consecutive_hits,
                        similarity: result.similarity,
                    });

                    if self.consecutive_hits > self.settings.required_hits {
                        tracing::info!("Verified {} ({:.3})", self.target, result.similarity);
                        self.state = VerificationState::Accepted {
                            similarity: result.similarity,
                        };
                    }
                } else {
                    effects.push(VerificationEffect::Debounced {
                        similarity: result.similarity,
                    });
                }
            }
        }

        Ok(self.step(effects))
    }

    fn step(&self, effects: Vec<VerificationEffect>) -> VerificationStep {
        VerificationStep {
            state: self.state.clone(),
            effects,
        }
    }
}
