// Core modules
pub mod common;
pub mod core;
pub mod camera;
pub mod storage;
pub mod fingerprint;
pub mod login;

// Re-export commonly used types
pub use common::{BiometricError, Config, Paths, Result};
pub use core::{
    cosine_similarity, find_best_match, mean_embedding, Embedding, EnrollmentStateMachine, FaceObservation, FaceRect,
    FrameObservationSource, LivenessGate, LivenessVerdict, VerificationStateMachine,
};
pub use camera::Camera;
pub use storage::{Gallery, UserStore};
pub use fingerprint::{DescriptorMatcher, FingerprintDevice, FingerprintMatcher, FingerprintService};
pub use login::{FrameFeed, LoginFlow, LoginOutcome};
