//! Stacked-factor login: password, then face, then fingerprint.
//!
//! Registration enrolls each factor separately and flips the matching flag on
//! the user record. Login requires all three and stops at the first failure.
//! Usernames are trimmed here; the stores below take names as given.

use crate::common::{BiometricError, Result};
use crate::core::enrollment::{EnrollmentEffect, EnrollmentSettings, EnrollmentState, EnrollmentStateMachine};
use crate::core::observation::{FaceRect, FrameObservationSource, LivenessGate};
use crate::core::verification::{VerificationSettings, VerificationState, VerificationStateMachine};
use crate::fingerprint::capture::CaptureEventSink;
use crate::fingerprint::device::FingerprintDevice;
use crate::fingerprint::matcher::MatchVerdict;
use crate::fingerprint::service::FingerprintService;
use crate::storage::{Gallery, UserStore};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Source of timestamped frames for the tick loops.
pub trait FrameFeed {
    type Frame;

    fn now(&self) -> Instant;

    /// `None` once the feed is exhausted; the running session is then cancelled.
    fn next_frame(&mut self) -> Result<Option<(Self::Frame, Instant)>>;
}

/// Drive an enrollment session until it reaches a terminal state.
///
/// `on_commit` receives the frame and face box of the commit, for storing a crop.
/// Its error is returned as-is; the gallery entry has already been written.
pub fn run_enrollment<D, L, F, C>(
    machine: &mut EnrollmentStateMachine<D, L>,
    feed: &mut F,
    mut on_commit: C,
) -> Result<EnrollmentState>
where
    D: FrameObservationSource,
    L: LivenessGate<D::Frame>,
    F: FrameFeed<Frame = D::Frame>,
    C: FnMut(&D::Frame, &FaceRect) -> Result<()>,
{
    loop {
        let Some((frame, now)) = feed.next_frame()? else {
            return Ok(machine.cancel().clone());
        };

        let step = machine.tick(&frame, now)?;
        for effect in &step.effects {
            match effect {
                EnrollmentEffect::Collected { collected, required } => {
                    tracing::info!("Captured face sample {}/{}", collected, required);
                }
                EnrollmentEffect::Committed { face, .. } => on_commit(&frame, face)?,
                _ => {}
            }
        }

        if step.state.is_terminal() {
            return Ok(step.state);
        }
    }
}

pub fn run_verification<D, L, F>(machine: &mut VerificationStateMachine<D, L>, feed: &mut F) -> Result<VerificationState>
where
    D: FrameObservationSource,
    L: LivenessGate<D::Frame>,
    F: FrameFeed<Frame = D::Frame>,
{
    loop {
        let Some((frame, now)) = feed.next_frame()? else {
            return Ok(machine.cancel().clone());
        };
        let step = machine.tick(&frame, now)?;
        if step.state.is_terminal() {
            return Ok(step.state);
        }
    }
}

/// The face half of a login: runs a verification session for a user.
pub trait FaceFactor {
    fn verify(&mut self, username: &str, gallery: Arc<Gallery>) -> Result<VerificationState>;
}

/// Camera-side collaborators bundled for repeated verification sessions.
pub struct FaceCheck<D, L, F> {
    pub source: D,
    pub liveness: L,
    pub feed: F,
    pub settings: VerificationSettings,
}

impl<D, L, F> FaceFactor for FaceCheck<D, L, F>
where
    D: FrameObservationSource,
    L: LivenessGate<D::Frame>,
    F: FrameFeed<Frame = D::Frame>,
{
    fn verify(&mut self, username: &str, gallery: Arc<Gallery>) -> Result<VerificationState> {
        let mut machine = VerificationStateMachine::new(
            username,
            self.settings.clone(),
            gallery,
            &mut self.source,
            &mut self.liveness,
            self.feed.now(),
        )?;
        run_verification(&mut machine, &mut self.feed)
    }
}

/// The fingerprint half of a login.
pub trait FingerprintFactor {
    fn verify(&mut self, template: &Path) -> Result<MatchVerdict>;
}

impl<D: FingerprintDevice> FingerprintFactor for FingerprintService<D> {
    fn verify(&mut self, template: &Path) -> Result<MatchVerdict> {
        FingerprintService::verify(self, template, &mut ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Factor {
    Password,
    Face,
    Fingerprint,
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Factor::Password => "password",
            Factor::Face => "face",
            Factor::Fingerprint => "fingerprint",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Granted,
    Denied { factor: Factor, reason: String },
}

impl LoginOutcome {
    fn denied(factor: Factor, reason: impl Into<String>) -> Self {
        LoginOutcome::Denied {
            factor,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationStatus {
    pub face: bool,
    pub fingerprint: bool,
}

impl RegistrationStatus {
    pub fn is_complete(&self) -> bool {
        self.face && self.fingerprint
    }
}

pub struct LoginFlow {
    users: UserStore,
    gallery: Arc<Gallery>,
}

impl LoginFlow {
    pub fn new(users: UserStore, gallery: Arc<Gallery>) -> Self {
        Self { users, gallery }
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub fn gallery(&self) -> Arc<Gallery> {
        Arc::clone(&self.gallery)
    }

    pub fn add_user(&mut self, username: &str, password: &str) -> Result<()> {
        self.users.add_user(username.trim(), password)
    }

    fn require_user(&self, username: &str) -> Result<()> {
        if self.users.user_exists(username) {
            Ok(())
        } else {
            Err(BiometricError::UserNotFound(username.to_string()))
        }
    }

    pub fn status(&self, username: &str) -> Result<RegistrationStatus> {
        let username = username.trim();
        let record = self
            .users
            .get(username)
            .ok_or_else(|| BiometricError::UserNotFound(username.to_string()))?;
        Ok(RegistrationStatus {
            face: record.face_registered,
            fingerprint: record.fingerprint_registered,
        })
    }

    /// Enroll the user's face under their username, replacing any earlier enrollment.
    pub fn enroll_face<D, L, F, C>(
        &mut self,
        username: &str,
        settings: EnrollmentSettings,
        source: D,
        liveness: L,
        feed: &mut F,
        on_commit: C,
    ) -> Result<EnrollmentState>
    where
        D: FrameObservationSource,
        L: LivenessGate<D::Frame>,
        F: FrameFeed<Frame = D::Frame>,
        C: FnMut(&D::Frame, &FaceRect) -> Result<()>,
    {
        let username = username.trim();
        self.require_user(username)?;
        let mut machine = EnrollmentStateMachine::new(
            username,
            true,
            settings,
            Arc::clone(&self.gallery),
            source,
            liveness,
            feed.now(),
        )?;

        let state = run_enrollment(&mut machine, feed, on_commit)?;
        if matches!(state, EnrollmentState::Succeeded { .. }) {
            self.users.set_face_registered(username, true)?;
        }
        Ok(state)
    }

    pub fn enroll_fingerprint<D: FingerprintDevice, S: CaptureEventSink + ?Sized>(
        &mut self,
        username: &str,
        service: &mut FingerprintService<D>,
        sink: &mut S,
    ) -> Result<PathBuf> {
        let username = username.trim();
        self.require_user(username)?;
        let template = service.enroll(username, sink)?;
        self.users.set_fingerprint(username, &template)?;
        Ok(template)
    }

    /// Password, then face, then fingerprint. Input and device errors propagate;
    /// a factor that simply does not match is reported as `Denied`.
    pub fn login<Fa: FaceFactor, Fp: FingerprintFactor>(
        &self,
        username: &str,
        password: &str,
        face: &mut Fa,
        fingerprint: &mut Fp,
    ) -> Result<LoginOutcome> {
        let username = username.trim();
        if !self.users.verify_password(username, password) {
            tracing::info!("Login for {} denied at password", username);
            return Ok(LoginOutcome::denied(Factor::Password, "invalid username or password"));
        }

        let status = self.status(username)?;
        if !status.face {
            return Ok(LoginOutcome::denied(Factor::Face, "no enrolled face"));
        }
        match face.verify(username, Arc::clone(&self.gallery))? {
            VerificationState::Accepted { similarity } => {
                tracing::info!("Face verified for {} ({:.3})", username, similarity);
            }
            other => {
                tracing::info!("Login for {} denied at face: {:?}", username, other);
                return Ok(LoginOutcome::denied(Factor::Face, describe_face_failure(&other)));
            }
        }

        let template = match self.users.get(username).and_then(|r| r.fingerprint_path.clone()) {
            Some(path) if path.exists() => path,
            _ => return Ok(LoginOutcome::denied(Factor::Fingerprint, "no enrolled fingerprint")),
        };
        let verdict = fingerprint.verify(&template)?;
        if !verdict.ok {
            tracing::info!("Login for {} denied at fingerprint: {}", username, verdict.detail);
            return Ok(LoginOutcome::denied(Factor::Fingerprint, verdict.detail));
        }

        tracing::info!("Login granted for {}", username);
        Ok(LoginOutcome::Granted)
    }

    /// Delete the user record, their gallery entry and fingerprint template.
    pub fn delete_user(&mut self, username: &str) -> Result<bool> {
        let username = username.trim();
        let Some(record) = self.users.delete_user(username)? else {
            return Ok(false);
        };

        self.gallery.remove(username)?;
        if let Some(path) = record.fingerprint_path {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!("Could not remove fingerprint template {}: {}", path.display(), e);
                }
            }
        }
        Ok(true)
    }
}

fn describe_face_failure(state: &VerificationState) -> String {
    match state {
        VerificationState::TimedOut => "face not verified before the time limit".to_string(),
        VerificationState::Rejected => "face verification cancelled".to_string(),
        VerificationState::Aborted { reason } => format!("face verification aborted: {}", reason),
        other => format!("unexpected face state {:?}", other),
    }
}
