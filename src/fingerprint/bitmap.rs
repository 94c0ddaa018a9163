//! 8-bit grayscale Windows bitmap writer.
//!
//! Layout: 14-byte file header, 40-byte BITMAPINFOHEADER, 256-entry identity
//! palette, then rows bottom-up, each padded to a multiple of four bytes.

use crate::common::{BiometricError, Result};
use std::fs;
use std::path::Path;

const FILE_HEADER_LEN: u32 = 14;
const INFO_HEADER_LEN: u32 = 40;
const PALETTE_LEN: u32 = 256 * 4;
const PIXELS_PER_METER: u32 = 2835;

pub fn row_stride(width: u32) -> u32 {
    (width + 3) & !3
}

/// Encode the first `width * height` bytes of `pixels` (row-major, top row first).
pub fn encode_gray8(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let needed = width as usize * height as usize;
    if pixels.len() < needed {
        return Err(BiometricError::InvalidInput(format!(
            "Insufficient raw data: {} < {}",
            pixels.len(),
            needed
        )));
    }

    let stride = row_stride(width);
    let padding = (stride - width) as usize;
    let pixel_array_size = stride * height;
    let off_bits = FILE_HEADER_LEN + INFO_HEADER_LEN + PALETTE_LEN;
    let file_size = off_bits + pixel_array_size;

    let mut out = Vec::with_capacity(file_size as usize);

    out.extend_from_slice(b"BM");
    out.extend_from_slice(&file_size.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&off_bits.to_le_bytes());

    out.extend_from_slice(&INFO_HEADER_LEN.to_le_bytes());
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // planes
    out.extend_from_slice(&8u16.to_le_bytes()); // bits per pixel
    out.extend_from_slice(&0u32.to_le_bytes()); // BI_RGB
    out.extend_from_slice(&pixel_array_size.to_le_bytes());
    out.extend_from_slice(&PIXELS_PER_METER.to_le_bytes());
    out.extend_from_slice(&PIXELS_PER_METER.to_le_bytes());
    out.extend_from_slice(&256u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());

    for i in 0..=255u8 {
        out.extend_from_slice(&[i, i, i, 0]);
    }

    let width = width as usize;
    for row in pixels[..needed].chunks_exact(width.max(1)).rev() {
        out.extend_from_slice(row);
        out.extend(std::iter::repeat(0u8).take(padding));
    }

    Ok(out)
}

pub fn write_gray8(path: &Path, pixels: &[u8], width: u32, height: u32) -> Result<()> {
    let encoded = encode_gray8(pixels, width, height)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, encoded)?;
    Ok(())
}
