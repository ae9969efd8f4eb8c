//! Client configuration.
//!
//! Everything here is read-only once a client is built. The settings store
//! is seeded from [`ClientConfig::known_server`] but owns the value after
//! that.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::KnownServer;
use crate::error::{OtaError, OtaResult};
use crate::image::{ImageKey, TRAILER_LEN};

/// OTA client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Manufacturer code of this device.
    pub manufacturer_id: u16,
    /// Image type of this device.
    pub image_type: u16,
    /// Version of the running firmware.
    pub current_version: u32,
    /// Hardware revision reported in image queries.
    pub hardware_version: Option<u16>,
    /// Attempts per network phase before it is abandoned.
    pub max_retries: u8,
    /// Busy polls allowed for a single storage operation.
    pub max_flash_busy_polls: u16,
    /// Delay between discovery windows.
    pub discovery_period: Duration,
    /// Delay of the first discovery window after storage is ready.
    pub startup_delay: Duration,
    /// Delay of the next window after a server had nothing to offer.
    pub no_image_cooldown: Duration,
    /// Time to wait for a unicast response.
    pub response_timeout: Duration,
    /// Duration of a broadcast locate search.
    pub locate_timeout: Duration,
    /// Re-poll period for a busy storage device.
    pub busy_poll_interval: Duration,
    /// Upper bound on a peer-requested deferral.
    pub max_wait_for_data: Duration,
    /// Maximum data bytes per block.
    pub block_size: u8,
    /// Download with page requests instead of block requests.
    pub page_requests: bool,
    /// Bytes covered by one page request.
    pub page_size: u16,
    /// Requested spacing between block responses within a page.
    pub response_spacing: Duration,
    /// Minimum bytes per storage write; `0` writes every chunk as it lands.
    pub flash_write_unit: u32,
    /// Minimum committed bytes between two checkpoints.
    pub checkpoint_interval: u32,
    /// Capacity of an image slot.
    pub max_image_size: u32,
    /// Establish a link key with servers that lack one.
    pub require_link_key: bool,
    /// Default server, contacted before any broadcast search.
    pub known_server: Option<KnownServer>,
    /// Seed for the announcement jitter draw.
    pub rng_seed: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            manufacturer_id: 0x1014,
            image_type: 0x0000,
            current_version: 0x0000_0001,
            hardware_version: None,
            max_retries: 3,
            max_flash_busy_polls: 20,
            discovery_period: Duration::from_secs(60),
            startup_delay: Duration::from_secs(1),
            no_image_cooldown: Duration::from_secs(300),
            response_timeout: Duration::from_secs(3),
            locate_timeout: Duration::from_secs(5),
            busy_poll_interval: Duration::from_millis(10),
            max_wait_for_data: Duration::from_secs(600),
            block_size: 64,
            page_requests: false,
            page_size: 256,
            response_spacing: Duration::from_millis(20),
            flash_write_unit: 0,
            checkpoint_interval: 1024,
            max_image_size: 512 * 1024,
            require_link_key: true,
            known_server: None,
            rng_seed: 0x5EED,
        }
    }
}

impl ClientConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> OtaResult<()> {
        if self.max_retries == 0 {
            return Err(OtaError::invalid_configuration(
                "max_retries must be greater than 0",
            ));
        }
        if self.max_flash_busy_polls == 0 {
            return Err(OtaError::invalid_configuration(
                "max_flash_busy_polls must be greater than 0",
            ));
        }
        if self.block_size == 0 {
            return Err(OtaError::invalid_configuration(
                "block_size must be greater than 0",
            ));
        }
        if self.page_requests && u32::from(self.page_size) < u32::from(self.block_size) {
            return Err(OtaError::invalid_configuration(
                "page_size must be at least block_size",
            ));
        }
        if self.max_image_size <= TRAILER_LEN {
            return Err(OtaError::invalid_configuration(
                "max_image_size must be larger than the image trailer",
            ));
        }
        for (name, value) in [
            ("discovery_period", self.discovery_period),
            ("response_timeout", self.response_timeout),
            ("locate_timeout", self.locate_timeout),
            ("busy_poll_interval", self.busy_poll_interval),
        ] {
            if value.is_zero() {
                return Err(OtaError::invalid_configuration(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration. Missing fields take their
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or the result is invalid.
    pub fn from_json_str(json: &str) -> OtaResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or its content is invalid.
    pub fn from_json_file(path: impl AsRef<Path>) -> OtaResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Key describing the running firmware.
    #[must_use]
    pub fn own_key(&self) -> ImageKey {
        ImageKey {
            manufacturer_id: self.manufacturer_id,
            image_type: self.image_type,
            file_version: self.current_version,
        }
    }

    /// Time to wait for the responses to one page request.
    ///
    /// The server spaces its block responses, so the wait grows with the
    /// number of blocks in the page.
    #[must_use]
    pub fn page_timeout(&self, page_len: u32) -> Duration {
        let blocks = page_len.div_ceil(u32::from(self.block_size.max(1)));
        self.response_timeout
            .saturating_add(self.response_spacing.saturating_mul(blocks))
    }

    /// Create a new config builder.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for `ClientConfig`.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the product identity and running version.
    #[must_use]
    pub fn product(mut self, manufacturer_id: u16, image_type: u16, current_version: u32) -> Self {
        self.config.manufacturer_id = manufacturer_id;
        self.config.image_type = image_type;
        self.config.current_version = current_version;
        self
    }

    /// Set the hardware revision.
    #[must_use]
    pub fn hardware_version(mut self, version: u16) -> Self {
        self.config.hardware_version = Some(version);
        self
    }

    /// Set the per-phase network retry budget.
    #[must_use]
    pub fn max_retries(mut self, retries: u8) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the busy-poll budget for storage operations.
    #[must_use]
    pub fn max_flash_busy_polls(mut self, polls: u16) -> Self {
        self.config.max_flash_busy_polls = polls;
        self
    }

    /// Set the delay between discovery windows.
    #[must_use]
    pub fn discovery_period(mut self, period: Duration) -> Self {
        self.config.discovery_period = period;
        self
    }

    /// Set the delay of the first discovery window.
    #[must_use]
    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.config.startup_delay = delay;
        self
    }

    /// Set the cooldown after a server had no image.
    #[must_use]
    pub fn no_image_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.no_image_cooldown = cooldown;
        self
    }

    /// Set the unicast response timeout.
    #[must_use]
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Set the broadcast search duration.
    #[must_use]
    pub fn locate_timeout(mut self, timeout: Duration) -> Self {
        self.config.locate_timeout = timeout;
        self
    }

    /// Set the maximum data bytes per block.
    #[must_use]
    pub fn block_size(mut self, size: u8) -> Self {
        self.config.block_size = size;
        self
    }

    /// Download with page requests of `page_size` bytes.
    #[must_use]
    pub fn page_requests(mut self, page_size: u16) -> Self {
        self.config.page_requests = true;
        self.config.page_size = page_size;
        self
    }

    /// Set the minimum storage write size.
    #[must_use]
    pub fn flash_write_unit(mut self, unit: u32) -> Self {
        self.config.flash_write_unit = unit;
        self
    }

    /// Set the minimum committed bytes between checkpoints.
    #[must_use]
    pub fn checkpoint_interval(mut self, interval: u32) -> Self {
        self.config.checkpoint_interval = interval;
        self
    }

    /// Set the slot capacity.
    #[must_use]
    pub fn max_image_size(mut self, size: u32) -> Self {
        self.config.max_image_size = size;
        self
    }

    /// Enable or disable link key establishment.
    #[must_use]
    pub fn require_link_key(mut self, required: bool) -> Self {
        self.config.require_link_key = required;
        self
    }

    /// Set the default server.
    #[must_use]
    pub fn known_server(mut self, server: KnownServer) -> Self {
        self.config.known_server = Some(server);
        self
    }

    /// Set the seed of the announcement jitter draw.
    #[must_use]
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.config.rng_seed = seed;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> OtaResult<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.block_size, 64);
        assert!(!config.page_requests);
    }

    #[test]
    fn test_validation_rejects_zero_retries() {
        let result = ClientConfig::builder().max_retries(0).build();
        assert!(matches!(result, Err(OtaError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_validation_rejects_small_page() {
        let result = ClientConfig::builder()
            .block_size(64)
            .page_requests(32)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let result = ClientConfig::builder()
            .response_timeout(Duration::ZERO)
            .build();
        let err = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("response_timeout"));
    }

    #[test]
    fn test_json_uses_defaults_for_missing_fields() -> OtaResult<()> {
        let config = ClientConfig::from_json_str(r#"{ "manufacturer_id": 4660, "block_size": 48 }"#)?;
        assert_eq!(config.manufacturer_id, 0x1234);
        assert_eq!(config.block_size, 48);
        assert_eq!(config.max_retries, ClientConfig::default().max_retries);
        Ok(())
    }

    #[test]
    fn test_json_rejects_invalid_values() {
        assert!(ClientConfig::from_json_str(r#"{ "block_size": 0 }"#).is_err());
        assert!(ClientConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_page_timeout_grows_with_blocks() {
        let config = ClientConfig::default();
        let short = config.page_timeout(64);
        let long = config.page_timeout(256);
        assert!(long > short);
        assert_eq!(
            long,
            config.response_timeout + config.response_spacing * 4
        );
    }
}
