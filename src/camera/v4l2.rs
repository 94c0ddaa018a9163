use crate::common::config::CameraConfig;
use crate::common::{BiometricError, Result};
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma};
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

pub struct Camera {
    device: Device,
    config: CameraConfig,
}

/// A running mmap stream; frames are pulled one at a time by the tick loop.
pub struct CameraSession<'a> {
    stream: Stream<'a>,
    format: Format,
    mirror: bool,
}

impl Camera {
    pub fn open(config: &CameraConfig) -> Result<Self> {
        let index = config.device_index;
        let device = Device::new(index as usize)
            .map_err(|e| BiometricError::Camera(format!("Failed to open camera {}: {}", index, e)))?;

        let caps = device
            .query_caps()
            .map_err(|e| BiometricError::Camera(format!("Failed to query capabilities: {}", e)))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            tracing::warn!("Device {} may not support standard video capture", index);
        }

        let mut fmt = device
            .format()
            .map_err(|e| BiometricError::Camera(format!("Failed to get format: {}", e)))?;
        fmt.width = config.width;
        fmt.height = config.height;
        // IR cameras deliver GREY; anything else is asked for MJPG.
        if fmt.fourcc.repr != *b"GREY" {
            fmt.fourcc = FourCC::new(b"MJPG");
        }
        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("Could not set {}x{} {}: {}", fmt.width, fmt.height, fmt.fourcc, e);
        }

        let actual = device
            .format()
            .map_err(|e| BiometricError::Camera(format!("Failed to get final format: {}", e)))?;
        if actual.width != config.width || actual.height != config.height {
            tracing::warn!(
                "Camera resolution {}x{} differs from requested {}x{}",
                actual.width,
                actual.height,
                config.width,
                config.height
            );
        }
        tracing::info!("Opened {} at {}x{} {}", caps.card, actual.width, actual.height, actual.fourcc);

        Ok(Self {
            device,
            config: config.clone(),
        })
    }

    pub fn start_session(&self) -> Result<CameraSession<'_>> {
        let format = self
            .device
            .format()
            .map_err(|e| BiometricError::Camera(format!("Failed to get format: {}", e)))?;
        let mut stream = Stream::with_buffers(&self.device, Type::VideoCapture, 4)
            .map_err(|e| BiometricError::Camera(format!("Failed to create stream: {}", e)))?;

        for i in 0..self.config.warmup_frames {
            stream
                .next()
                .map_err(|e| BiometricError::Camera(format!("Failed to capture warmup frame {}: {}", i, e)))?;
            std::thread::sleep(Duration::from_millis(self.config.warmup_delay_ms));
        }
        tracing::debug!("Camera warmed up");

        Ok(CameraSession {
            stream,
            format,
            mirror: self.config.mirror,
        })
    }
}

impl CameraSession<'_> {
    pub fn capture_frame(&mut self) -> Result<DynamicImage> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| BiometricError::Camera(format!("Failed to capture: {}", e)))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };

        let frame = decode_frame(&self.format.fourcc.repr, data, self.format.width, self.format.height)?;
        Ok(if self.mirror { frame.fliph() } else { frame })
    }
}

pub fn decode_frame(fourcc: &[u8; 4], data: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    match fourcc {
        b"GREY" => {
            let pixels = (width * height) as usize;
            if data.len() < pixels {
                return Err(BiometricError::Camera(format!(
                    "Short GREY frame: {} bytes for {}x{}",
                    data.len(),
                    width,
                    height
                )));
            }
            let buffer = ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data[..pixels].to_vec())
                .ok_or_else(|| BiometricError::Camera("Failed to create grayscale image buffer".into()))?;
            Ok(DynamicImage::ImageLuma8(buffer))
        }
        b"MJPG" => Ok(image::load_from_memory_with_format(data, ImageFormat::Jpeg)?),
        other => Err(BiometricError::Camera(format!(
            "Unsupported pixel format {}",
            String::from_utf8_lossy(other)
        ))),
    }
}
