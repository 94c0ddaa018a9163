pub mod analyzer;
pub mod detector;
pub mod enrollment;
pub mod liveness;
pub mod matcher;
pub mod observation;
pub mod onnx;
pub mod recognizer;
pub mod verification;

pub use analyzer::FaceAnalyzer;
pub use detector::{Detection, FaceDetector};
pub use enrollment::{EnrollmentEffect, EnrollmentSettings, EnrollmentState, EnrollmentStateMachine, EnrollmentStep};
pub use liveness::SpoofClassifier;
pub use matcher::{cosine_similarity, find_best_match, mean_embedding, Embedding, MatchResult};
pub use observation::{
    FaceObservation, FaceRect, FrameObservationSource, FrameRejection, LivenessGate, LivenessVerdict, MultiFacePolicy,
};
pub use recognizer::FaceRecognizer;
pub use verification::{
    VerificationEffect, VerificationSettings, VerificationState, VerificationStateMachine, VerificationStep,
};
