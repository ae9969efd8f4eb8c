//! Test fixture builders.

use meshota_client::{ClientConfig, ImageDescriptor};

/// Deterministic firmware body of `len` bytes.
pub fn test_body(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i.wrapping_mul(31).wrapping_add(7) % 251) as u8)
        .collect()
}

/// Default configuration with a fixed jitter seed.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        rng_seed: 7,
        ..ClientConfig::default()
    }
}

/// Descriptor of a sealed image for the product `config` describes.
pub fn descriptor_for(config: &ClientConfig, version: u32, sealed: &[u8]) -> ImageDescriptor {
    ImageDescriptor {
        manufacturer_id: config.manufacturer_id,
        image_type: config.image_type,
        firmware_version: version,
        total_size: u32::try_from(sealed.len()).unwrap_or(u32::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshota_client::image::{crc32, decode_trailer, seal_image};

    #[test]
    fn test_sealed_body_carries_its_checksum() {
        let body = test_body(1000);
        let sealed = seal_image(&body);
        assert_eq!(sealed.len(), 1004);
        assert_eq!(decode_trailer(&sealed[1000..]), Some(crc32(&body)));

        let image = descriptor_for(&test_config(), 2, &sealed);
        assert_eq!(image.body_len(), 1000);
    }
}
