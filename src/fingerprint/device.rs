//! Narrow view of the fingerprint reader SDK.
//!
//! Every call returns the SDK's raw status code so the capture protocol can
//! classify it. The native binding lives behind the `zkfinger` feature; tests
//! drive the protocol with scripted devices.

use std::num::NonZeroUsize;

pub const PARAM_IMAGE_WIDTH: i32 = 1;
pub const PARAM_IMAGE_HEIGHT: i32 = 2;
pub const PARAM_IMAGE_BYTES: i32 = 106;

pub const CODE_OK: i32 = 0;
pub const CODE_ALREADY_INITIALIZED: i32 = 1;
pub const CODE_BUSY: i32 = -12;
pub const CODE_RETRY: i32 = -8;

/// Opaque handle returned by `open`; never null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle(NonZeroUsize);

impl DeviceHandle {
    pub fn new(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    pub fn raw(&self) -> usize {
        self.0.get()
    }
}

/// Classification of an acquire return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    Success,
    /// No finger on the sensor.
    Busy,
    Transient,
    Fatal(i32),
}

impl AcquireStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            CODE_OK => AcquireStatus::Success,
            CODE_BUSY => AcquireStatus::Busy,
            CODE_RETRY => AcquireStatus::Transient,
            other => AcquireStatus::Fatal(other),
        }
    }
}

pub trait FingerprintDevice {
    fn init(&mut self) -> i32;
    fn terminate(&mut self) -> i32;
    fn device_count(&mut self) -> i32;
    fn open(&mut self, index: i32) -> Option<DeviceHandle>;
    fn close(&mut self, handle: DeviceHandle) -> i32;
    /// Fill `buf` with parameter `code`; returns the number of bytes written or the status code.
    fn get_parameter(&mut self, handle: DeviceHandle, code: i32, buf: &mut [u8]) -> Result<usize, i32>;
    fn acquire_image(&mut self, handle: DeviceHandle, buf: &mut [u8]) -> i32;
}

impl<D: FingerprintDevice + ?Sized> FingerprintDevice for Box<D> {
    fn init(&mut self) -> i32 {
        (**self).init()
    }
    fn terminate(&mut self) -> i32 {
        (**self).terminate()
    }
    fn device_count(&mut self) -> i32 {
        (**self).device_count()
    }
    fn open(&mut self, index: i32) -> Option<DeviceHandle> {
        (**self).open(index)
    }
    fn close(&mut self, handle: DeviceHandle) -> i32 {
        (**self).close(handle)
    }
    fn get_parameter(&mut self, handle: DeviceHandle, code: i32, buf: &mut [u8]) -> Result<usize, i32> {
        (**self).get_parameter(handle, code, buf)
    }
    fn acquire_image(&mut self, handle: DeviceHandle, buf: &mut [u8]) -> i32 {
        (**self).acquire_image(handle, buf)
    }
}

/// Read an unsigned little-endian integer parameter.
pub fn read_u32_parameter<D: FingerprintDevice + ?Sized>(
    device: &mut D,
    handle: DeviceHandle,
    code: i32,
) -> Result<u32, i32> {
    let mut buf = [0u8; 4];
    let written = device.get_parameter(handle, code, &mut buf)?;
    let mut bytes = [0u8; 4];
    let n = written.min(4);
    bytes[..n].copy_from_slice(&buf[..n]);
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(feature = "zkfinger")]
pub use zk::ZkFingerDevice;

#[cfg(feature = "zkfinger")]
mod zk {
    #![allow(non_snake_case)]

    use super::{DeviceHandle, FingerprintDevice};
    use std::os::raw::{c_int, c_uchar, c_uint, c_void};

    #[link(name = "zkfp")]
    extern "C" {
        fn ZKFPM_Init() -> c_int;
        fn ZKFPM_Terminate() -> c_int;
        fn ZKFPM_GetDeviceCount() -> c_int;
        fn ZKFPM_OpenDevice(index: c_int) -> *mut c_void;
        fn ZKFPM_CloseDevice(handle: *mut c_void) -> c_int;
        fn ZKFPM_GetParameters(handle: *mut c_void, code: c_int, value: *mut c_uchar, size: *mut c_uint) -> c_int;
        fn ZKFPM_AcquireFingerprintImage(handle: *mut c_void, image: *mut c_uchar, size: c_uint) -> c_int;
    }

    /// ZKTeco reader through `libzkfp`.
    #[derive(Debug, Default)]
    pub struct ZkFingerDevice;

    impl FingerprintDevice for ZkFingerDevice {
        fn init(&mut self) -> i32 {
            unsafe { ZKFPM_Init() }
        }

        fn terminate(&mut self) -> i32 {
            unsafe { ZKFPM_Terminate() }
        }

        fn device_count(&mut self) -> i32 {
            unsafe { ZKFPM_GetDeviceCount() }
        }

        fn open(&mut self, index: i32) -> Option<DeviceHandle> {
            let raw = unsafe { ZKFPM_OpenDevice(index) };
            DeviceHandle::new(raw as usize)
        }

        fn close(&mut self, handle: DeviceHandle) -> i32 {
            unsafe { ZKFPM_CloseDevice(handle.raw() as *mut c_void) }
        }

        fn get_parameter(&mut self, handle: DeviceHandle, code: i32, buf: &mut [u8]) -> Result<usize, i32> {
            let mut size = buf.len() as c_uint;
            // SAFETY: `buf` is valid for `size` bytes and the SDK writes at most `size`.
            let ret = unsafe { ZKFPM_GetParameters(handle.raw() as *mut c_void, code, buf.as_mut_ptr(), &mut size) };
            if ret == 0 {
                Ok((size as usize).min(buf.len()))
            } else {
                Err(ret)
            }
        }

        fn acquire_image(&mut self, handle: DeviceHandle, buf: &mut [u8]) -> i32 {
            // SAFETY: as above, the SDK fills at most `buf.len()` bytes.
            unsafe { ZKFPM_AcquireFingerprintImage(handle.raw() as *mut c_void, buf.as_mut_ptr(), buf.len() as c_uint) }
        }
    }
}
