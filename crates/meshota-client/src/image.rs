//! Firmware image identification and integrity.
//!
//! An image as served over the air is the firmware body followed by a
//! four-byte little-endian CRC-32 of the body. The trailer is fetched and
//! written last, so a slot never holds a complete image that has not been
//! checked.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Length of the integrity trailer appended to every image.
pub const TRAILER_LEN: u32 = 4;

/// Manufacturer id that matches every device in an image announcement.
pub const WILDCARD_MANUFACTURER: u16 = 0xFFFF;

/// Image type that matches every device in an image announcement.
pub const WILDCARD_IMAGE_TYPE: u16 = 0xFFFF;

/// Identifies one firmware build: who made it, what it runs on, and which
/// release it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageKey {
    /// Manufacturer code.
    pub manufacturer_id: u16,
    /// Manufacturer-specific image type.
    pub image_type: u16,
    /// Firmware version.
    pub file_version: u32,
}

impl ImageKey {
    /// Whether `other` names the same product line, ignoring the version.
    #[must_use]
    pub fn same_product(&self, other: &ImageKey) -> bool {
        self.manufacturer_id == other.manufacturer_id && self.image_type == other.image_type
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}:{:04X} v{:#010X}",
            self.manufacturer_id, self.image_type, self.file_version
        )
    }
}

/// An image a server has offered for download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// Manufacturer code.
    pub manufacturer_id: u16,
    /// Manufacturer-specific image type.
    pub image_type: u16,
    /// Firmware version of the offered image.
    pub firmware_version: u32,
    /// Size in bytes, including the integrity trailer.
    pub total_size: u32,
}

impl ImageDescriptor {
    /// Key used in block requests for this image.
    #[must_use]
    pub fn key(&self) -> ImageKey {
        ImageKey {
            manufacturer_id: self.manufacturer_id,
            image_type: self.image_type,
            file_version: self.firmware_version,
        }
    }

    /// Length of the firmware body, excluding the trailer.
    #[must_use]
    pub fn body_len(&self) -> u32 {
        self.total_size.saturating_sub(TRAILER_LEN)
    }
}

impl fmt::Display for ImageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.key(), self.total_size)
    }
}

/// CRC-32 of `bytes`.
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Extend a running CRC-32 with `bytes`.
///
/// `extend_crc32(crc32(a), b) == crc32(a ++ b)`, and the CRC of nothing is
/// zero, so a transfer can start from `0` and fold blocks in as they land.
#[must_use]
pub fn extend_crc32(running: u32, bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(running);
    hasher.update(bytes);
    hasher.finalize()
}

/// Decode a complete trailer into the expected body CRC.
#[must_use]
pub fn decode_trailer(trailer: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = trailer.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Append the integrity trailer to `body`, producing a servable image.
#[must_use]
pub fn seal_image(body: &[u8]) -> Vec<u8> {
    let mut image = Vec::with_capacity(body.len().saturating_add(4));
    image.extend_from_slice(body);
    image.extend_from_slice(&crc32(body).to_le_bytes());
    image
}
