//! Settings store seeded from configuration.

use tracing::debug;

use crate::adapters::SettingsStore;
use crate::address::KnownServer;
use crate::config::ClientConfig;

/// In-memory settings, initialised from [`ClientConfig::known_server`].
#[derive(Debug, Default, Clone)]
pub struct MemorySettings {
    known_server: Option<KnownServer>,
}

impl MemorySettings {
    /// Settings holding the configured default server.
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            known_server: config.known_server,
        }
    }
}

impl SettingsStore for MemorySettings {
    fn known_server(&self) -> Option<KnownServer> {
        self.known_server
    }

    fn store_known_server(&mut self, server: Option<KnownServer>) {
        debug!(?server, "Known server updated");
        self.known_server = server;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Endpoint, ExtendedAddress};

    #[test]
    fn test_seeded_from_config() {
        let server = KnownServer {
            extended_address: ExtendedAddress(7),
            endpoint: Some(Endpoint(1)),
        };
        let config = ClientConfig {
            known_server: Some(server),
            ..ClientConfig::default()
        };

        let mut settings = MemorySettings::from_config(&config);
        assert_eq!(settings.known_server(), Some(server));

        settings.store_known_server(None);
        assert_eq!(settings.known_server(), None);
    }
}
