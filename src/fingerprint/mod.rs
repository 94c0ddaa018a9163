pub mod bitmap;
pub mod capture;
pub mod device;
pub mod matcher;
pub mod service;

pub use capture::{
    capture, spawn_capture, CallbackSink, CaptureEvent, CaptureEventSink, CaptureOutcome, CaptureSettings,
    CapturedImage,
};
pub use device::{AcquireStatus, DeviceHandle, FingerprintDevice};
#[cfg(feature = "zkfinger")]
pub use device::ZkFingerDevice;
pub use matcher::{DescriptorMatcher, FingerprintMatcher, MatchVerdict};
pub use service::FingerprintService;
