//! Covert provenance channel: LSB steganography over raw pixel buffers.
//!
//! The payload is the message plus a `|||END|||` sentinel, expanded to bits
//! MSB-first and written one bit per byte into the least-significant bit of
//! the carrier, in a single fixed raster order. Extraction walks the same
//! order, regroups LSBs into 8-bit characters, and stops as soon as the
//! running text contains the sentinel. Embed and extract are exact inverses
//! because neither ever reorders the buffer.
//!
//! The channel is format-simple by design: it operates on the flat raw byte
//! buffer with no per-channel semantics, so it survives only lossless
//! re-encoding (PNG). That trade-off is accepted — transform-domain schemes
//! would survive recompression but cost a frequency-domain round trip per
//! request.

use std::io::Cursor;

use crate::error::EngineError;

/// Terminator appended to every covert payload.
pub const SENTINEL: &str = "|||END|||";

/// Usable message bytes for a carrier of `carrier_len` bytes.
pub fn capacity(carrier_len: usize) -> usize {
    (carrier_len / 8).saturating_sub(SENTINEL.len())
}

/// Write `message` (plus sentinel) into the low bit plane of `carrier`.
///
/// All-or-nothing: the capacity check happens before any mutation, so a
/// too-large payload leaves the carrier untouched and fails with
/// [`EngineError::PayloadTooLarge`] rather than truncating silently.
pub fn embed(carrier: &mut [u8], message: &str) -> Result<(), EngineError> {
    let payload = format!("{message}{SENTINEL}");
    let needed = payload.len() * 8;
    if needed > carrier.len() {
        return Err(EngineError::PayloadTooLarge {
            needed,
            available: carrier.len(),
        });
    }
    let mut index = 0;
    for byte in payload.bytes() {
        for shift in (0..8).rev() {
            let bit = (byte >> shift) & 1;
            carrier[index] = (carrier[index] & 0xFE) | bit;
            index += 1;
        }
    }
    Ok(())
}

/// Recover a payload from the low bit plane of `carrier`.
///
/// Returns `None` when the sentinel never appears — the expected "no
/// watermark present" outcome, not a failure.
pub fn extract(carrier: &[u8]) -> Option<String> {
    let mut text = String::new();
    let mut acc = 0u8;
    let mut bits = 0u8;
    for byte in carrier {
        acc = (acc << 1) | (byte & 1);
        bits += 1;
        if bits == 8 {
            text.push(acc as char);
            acc = 0;
            bits = 0;
            if text.ends_with(SENTINEL) {
                text.truncate(text.len() - SENTINEL.len());
                return Some(text);
            }
        }
    }
    None
}

/// Decode a raster image, covert-mark its raw RGB buffer, and re-encode as
/// PNG (lossless, so the bit plane survives).
pub fn mark_image(image_bytes: &[u8], message: &str) -> Result<Vec<u8>, EngineError> {
    let decoded = image::load_from_memory(image_bytes)
        .map_err(|e| EngineError::MarkingFailed(format!("not a valid raster image: {e}")))?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut raw = rgb.into_raw();
    embed(&mut raw, message)?;
    let marked = image::RgbImage::from_raw(width, height, raw)
        .ok_or_else(|| EngineError::MarkingFailed("pixel buffer length mismatch".into()))?;
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(marked)
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|e| EngineError::MarkingFailed(format!("PNG encode: {e}")))?;
    Ok(out)
}

/// Decode a raster image and scan its raw RGB buffer for a covert payload.
pub fn read_image(image_bytes: &[u8]) -> Result<Option<String>, EngineError> {
    let decoded = image::load_from_memory(image_bytes)
        .map_err(|e| EngineError::InvalidImage(e.to_string()))?;
    let raw = decoded.to_rgb8().into_raw();
    Ok(extract(&raw))
}
