use crate::common::config::FingerprintConfig;
use crate::common::{BiometricError, Result};
use crate::fingerprint::capture::{capture, require_saved, CaptureEventSink, CaptureSettings};
use crate::fingerprint::device::FingerprintDevice;
use crate::fingerprint::matcher::{FingerprintMatcher, MatchVerdict};
use std::fs;
use std::path::{Path, PathBuf};

/// Capture, enrollment and verification on one reader.
///
/// Templates are stored as `<templates_dir>/<username>.bmp` and overwritten on
/// re-enrollment. The service owns the device, so captures never overlap.
pub struct FingerprintService<D> {
    device: D,
    capture: CaptureSettings,
    templates_dir: PathBuf,
    matcher: Box<dyn FingerprintMatcher>,
    threshold: usize,
    ratio: f32,
}

impl<D: FingerprintDevice> FingerprintService<D> {
    pub fn new(
        device: D,
        config: &FingerprintConfig,
        capture_dir: impl Into<PathBuf>,
        templates_dir: impl Into<PathBuf>,
        matcher: Box<dyn FingerprintMatcher>,
    ) -> Result<Self> {
        let templates_dir = templates_dir.into();
        fs::create_dir_all(&templates_dir)?;
        Ok(Self {
            device,
            capture: CaptureSettings::from_config(config, capture_dir),
            templates_dir,
            matcher,
            threshold: config.match_threshold,
            ratio: config.ratio,
        })
    }

    pub fn template_path(&self, username: &str) -> Result<PathBuf> {
        if username.trim().is_empty() || username.contains(|c: char| c == '/' || c == '\\') || username.starts_with('.') {
            return Err(BiometricError::InvalidInput(format!("invalid username {:?}", username)));
        }
        Ok(self.templates_dir.join(format!("{}.bmp", username)))
    }

    pub fn has_template(&self, username: &str) -> bool {
        self.template_path(username).map(|p| p.exists()).unwrap_or(false)
    }

    /// Capture one image into the scratch directory.
    pub fn capture_once<S: CaptureEventSink + ?Sized>(&mut self, sink: &mut S) -> Result<PathBuf> {
        let outcome = capture(&mut self.device, &self.capture, sink)?;
        Ok(require_saved(outcome)?.path)
    }

    pub fn enroll<S: CaptureEventSink + ?Sized>(&mut self, username: &str, sink: &mut S) -> Result<PathBuf> {
        let destination = self.template_path(username)?;
        let captured = self.capture_once(sink)?;

        if destination.exists() {
            fs::remove_file(&destination)?;
        }
        move_file(&captured, &destination)?;
        tracing::info!("Enrolled fingerprint for {} at {}", username, destination.display());
        Ok(destination)
    }

    /// Capture a live image and compare it with `enrolled`.
    pub fn verify<S: CaptureEventSink + ?Sized>(&mut self, enrolled: &Path, sink: &mut S) -> Result<MatchVerdict> {
        let live = self.capture_once(sink)?;
        let verdict = self.matcher.verify(&live, enrolled, self.threshold, self.ratio);
        tracing::info!("Fingerprint verification: {}", verdict.detail);

        if let Err(e) = fs::remove_file(&live) {
            tracing::warn!("Could not remove live capture {}: {}", live.display(), e);
        }
        Ok(verdict)
    }

    /// Verify against `username`'s stored template.
    pub fn verify_user<S: CaptureEventSink + ?Sized>(&mut self, username: &str, sink: &mut S) -> Result<MatchVerdict> {
        let template = self.template_path(username)?;
        if !template.exists() {
            return Err(BiometricError::UserNotFound(format!("no enrolled fingerprint for {}", username)));
        }
        self.verify(&template, sink)
    }

    /// Delete the stored template. Returns whether one existed.
    pub fn remove(&self, username: &str) -> Result<bool> {
        let path = self.template_path(username)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        tracing::info!("Removed fingerprint template for {}", username);
        Ok(true)
    }

    pub fn into_device(self) -> D {
        self.device
    }
}

/// Rename, falling back to copy + delete across file systems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)?;
    Ok(())
}
