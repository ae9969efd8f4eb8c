//! Unit tests for the OTA client crate

mod config_tests {
    use meshota_client::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_builder_sets_fields() -> anyhow::Result<()> {
        let config = ClientConfig::builder()
            .product(0x1234, 0x0002, 7)
            .hardware_version(3)
            .max_retries(5)
            .block_size(48)
            .page_requests(192)
            .discovery_period(Duration::from_secs(30))
            .require_link_key(false)
            .build()?;

        assert_eq!(config.manufacturer_id, 0x1234);
        assert_eq!(config.image_type, 0x0002);
        assert_eq!(config.current_version, 7);
        assert_eq!(config.hardware_version, Some(3));
        assert_eq!(config.max_retries, 5);
        assert!(config.page_requests);
        assert_eq!(config.page_size, 192);
        assert!(!config.require_link_key);
        Ok(())
    }

    #[test]
    fn test_config_file_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ota.json");
        let config = ClientConfig::builder()
            .known_server(KnownServer {
                extended_address: ExtendedAddress(0x00124B00_0000_0001),
                endpoint: Some(Endpoint(8)),
            })
            .flash_write_unit(256)
            .build()?;
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;

        let loaded = ClientConfig::from_json_file(&path)?;
        assert_eq!(loaded, config);
        Ok(())
    }

    #[test]
    fn test_missing_config_file_is_io_error() {
        let result = ClientConfig::from_json_file("/nonexistent/ota.json");
        assert!(matches!(result, Err(OtaError::Io(_))));
    }

    #[test]
    fn test_invalid_config_rejected_by_client() {
        let config = ClientConfig {
            block_size: 0,
            ..ClientConfig::default()
        };
        let result = meshota_test_helpers::prelude::Harness::new(
            config,
            meshota_test_helpers::prelude::SimWorld::new(),
        );
        assert!(matches!(result, Err(OtaError::InvalidConfiguration(_))));
    }
}

mod protocol_tests {
    use meshota_client::image::{WILDCARD_IMAGE_TYPE, WILDCARD_MANUFACTURER};
    use meshota_client::prelude::*;
    use std::time::Duration;

    fn own() -> ImageKey {
        ImageKey {
            manufacturer_id: 0x1014,
            image_type: 0x0001,
            file_version: 5,
        }
    }

    fn notify(payload: NotifyPayload) -> ImageNotify {
        ImageNotify {
            query_jitter: 100,
            payload,
        }
    }

    #[test]
    fn test_announcement_matching() {
        let own = own();
        assert!(notify(NotifyPayload::JitterOnly).concerns(&own));
        assert!(
            notify(NotifyPayload::Manufacturer {
                manufacturer_id: WILDCARD_MANUFACTURER
            })
            .concerns(&own)
        );
        assert!(
            !notify(NotifyPayload::Manufacturer {
                manufacturer_id: 0xBEEF
            })
            .concerns(&own)
        );
        assert!(
            notify(NotifyPayload::ImageType {
                manufacturer_id: 0x1014,
                image_type: WILDCARD_IMAGE_TYPE,
            })
            .concerns(&own)
        );
        assert!(
            !notify(NotifyPayload::ImageType {
                manufacturer_id: 0x1014,
                image_type: 0x0002,
            })
            .concerns(&own)
        );
    }

    #[test]
    fn test_announced_version_must_differ() {
        let own = own();
        let same = notify(NotifyPayload::NewVersion { key: own });
        assert!(!same.concerns(&own));

        let newer = notify(NotifyPayload::NewVersion {
            key: ImageKey {
                file_version: 6,
                ..own
            },
        });
        assert!(newer.concerns(&own));
    }

    #[test]
    fn test_upgrade_delay() {
        let key = own();
        let later = UpgradeEndResponse {
            key,
            current_time: 1_000,
            upgrade_time: 1_060,
        };
        assert_eq!(later.upgrade_delay(), Some(Duration::from_secs(60)));

        let past = UpgradeEndResponse {
            upgrade_time: 10,
            ..later
        };
        assert_eq!(past.upgrade_delay(), Some(Duration::ZERO));

        let on_command = UpgradeEndResponse {
            upgrade_time: UpgradeEndResponse::WAIT_FOR_COMMAND,
            ..later
        };
        assert_eq!(on_command.upgrade_delay(), None);
    }

    #[test]
    fn test_status_display_carries_code() {
        assert_eq!(UpgradeStatus::Abort.code(), 0x95);
        assert_eq!(UpgradeStatus::InvalidImage.to_string(), "InvalidImage(0x96)");
        assert_eq!(UpgradeStatus::from_code(0x7E), Some(UpgradeStatus::NotAuthorized));
    }
}

mod slot_tests {
    use meshota_client::prelude::*;

    #[test]
    fn test_slot_other() {
        assert_eq!(Slot::A.other(), Slot::B);
        assert_eq!(Slot::B.other(), Slot::A);
        assert_eq!(format!("{}", Slot::B), "B");
    }
}

mod client_tests {
    //! The engine driven by hand over minimal recording adapters.

    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use meshota_client::prelude::*;
    use meshota_client::retry::RetryKind;

    #[derive(Default)]
    struct Record {
        sent: Vec<Request>,
        storage: Vec<(StorageTicket, &'static str)>,
        timers: Vec<(TimerToken, Duration)>,
    }

    type Shared = Rc<RefCell<Record>>;

    struct RecordingTransport(Shared);

    impl Transport for RecordingTransport {
        fn send(&mut self, _: Destination, request: Request) -> Result<(), TransportError> {
            self.0.borrow_mut().sent.push(request);
            Ok(())
        }

        fn has_link_key(&self, _: ExtendedAddress) -> bool {
            false
        }
    }

    struct RecordingStorage(Shared);

    impl RecordingStorage {
        fn log(&self, ticket: StorageTicket, op: &'static str) {
            self.0.borrow_mut().storage.push((ticket, op));
        }
    }

    impl ImageStorage for RecordingStorage {
        fn init(&mut self, ticket: StorageTicket) {
            self.log(ticket, "init");
        }
        fn erase_slot(&mut self, ticket: StorageTicket, _: Slot, _: u32) {
            self.log(ticket, "erase");
        }
        fn write_chunk(&mut self, ticket: StorageTicket, _: Slot, _: u32, _: &[u8]) {
            self.log(ticket, "write");
        }
        fn checksum(&mut self, ticket: StorageTicket, _: Slot, _: u32) {
            self.log(ticket, "checksum");
        }
        fn verify_checksum(&mut self, ticket: StorageTicket, _: Slot, _: u32, _: u32) {
            self.log(ticket, "verify");
        }
        fn switch_active(&mut self, ticket: StorageTicket, _: Slot, _: Slot) {
            self.log(ticket, "switch");
        }
        fn active_slot(&self) -> Slot {
            Slot::A
        }
    }

    struct RecordingTimer(Shared);

    impl TimerService for RecordingTimer {
        fn arm(&mut self, token: TimerToken, after: Duration) {
            self.0.borrow_mut().timers.push((token, after));
        }
        fn disarm(&mut self, token: TimerToken) {
            self.0.borrow_mut().timers.retain(|(t, _)| *t != token);
        }
    }

    fn client(config: ClientConfig) -> anyhow::Result<(OtaClient, Shared)> {
        let record = Shared::default();
        let adapters = Adapters {
            transport: Box::new(RecordingTransport(record.clone())),
            storage: Box::new(RecordingStorage(record.clone())),
            recovery: Box::new(MemoryRecoveryStore::new()),
            settings: Box::new(MemorySettings::from_config(&config)),
            timer: Box::new(RecordingTimer(record.clone())),
        };
        Ok((OtaClient::new(config, adapters)?, record))
    }

    fn last_timer(record: &Shared) -> anyhow::Result<(TimerToken, Duration)> {
        record
            .borrow()
            .timers
            .last()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no timer armed"))
    }

    fn last_ticket(record: &Shared) -> anyhow::Result<StorageTicket> {
        record
            .borrow()
            .storage
            .last()
            .map(|(ticket, _)| *ticket)
            .ok_or_else(|| anyhow::anyhow!("no storage operation"))
    }

    fn ready(client: &mut OtaClient, record: &Shared) -> anyhow::Result<()> {
        client.handle(ClientEvent::Start);
        let ticket = last_ticket(record)?;
        client.handle(ClientEvent::StorageDone(StorageCompletion {
            ticket,
            outcome: StorageOutcome::Done,
        }));
        Ok(())
    }

    #[test]
    fn test_start_waits_for_storage_then_window() -> anyhow::Result<()> {
        let config = ClientConfig::default();
        let startup = config.startup_delay;
        let (mut client, record) = client(config)?;
        assert_eq!(client.phase(), ClientPhase::Stopped);

        client.handle(ClientEvent::Start);
        assert_eq!(client.phase(), ClientPhase::InitializingStorage);
        assert_eq!(record.borrow().storage.len(), 1);

        // A second start changes nothing.
        client.handle(ClientEvent::Start);
        assert_eq!(record.borrow().storage.len(), 1);

        let ticket = last_ticket(&record)?;
        client.handle(ClientEvent::StorageDone(StorageCompletion {
            ticket,
            outcome: StorageOutcome::Done,
        }));
        assert_eq!(client.phase(), ClientPhase::AwaitingDiscoveryWindow);
        assert_eq!(last_timer(&record)?.1, startup);
        Ok(())
    }

    #[test]
    fn test_window_starts_broadcast_search() -> anyhow::Result<()> {
        let (mut client, record) = client(ClientConfig::default())?;
        ready(&mut client, &record)?;

        let (token, _) = last_timer(&record)?;
        client.handle(ClientEvent::TimerFired(token));
        assert_eq!(client.phase(), ClientPhase::BroadcastingLocate);
        assert!(matches!(
            record.borrow().sent.last(),
            Some(Request::Locate { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_configured_server_is_resolved_first() -> anyhow::Result<()> {
        let config = ClientConfig::builder()
            .known_server(KnownServer {
                extended_address: ExtendedAddress(0x55),
                endpoint: None,
            })
            .build()?;
        let (mut client, record) = client(config)?;
        ready(&mut client, &record)?;

        let (token, _) = last_timer(&record)?;
        client.handle(ClientEvent::TimerFired(token));
        assert_eq!(client.phase(), ClientPhase::ResolvingAddress);
        assert_eq!(
            record.borrow().sent.last(),
            Some(&Request::ResolveShortAddress {
                extended: ExtendedAddress(0x55)
            })
        );
        Ok(())
    }

    #[test]
    fn test_stale_events_are_discarded() -> anyhow::Result<()> {
        let (mut client, record) = client(ClientConfig::default())?;
        client.handle(ClientEvent::Start);
        let ticket = last_ticket(&record)?;

        // Unknown ticket, unknown timer and an unsolicited response.
        client.handle(ClientEvent::StorageDone(StorageCompletion {
            ticket: StorageTicket(ticket.0.wrapping_add(9)),
            outcome: StorageOutcome::Done,
        }));
        client.handle(ClientEvent::TimerFired(TimerToken(999)));
        client.handle(ClientEvent::Response {
            source: ShortAddress(0x1234),
            response: Response::LocateComplete,
        });
        assert_eq!(client.phase(), ClientPhase::InitializingStorage);
        assert!(record.borrow().sent.is_empty());
        Ok(())
    }

    #[test]
    fn test_busy_storage_is_polled_then_fails() -> anyhow::Result<()> {
        let config = ClientConfig::builder().max_flash_busy_polls(2).build()?;
        let (mut client, record) = client(config.clone())?;
        let faults = Rc::new(RefCell::new(Vec::new()));
        let sink = faults.clone();
        client.on_notification(move |n| sink.borrow_mut().push(n.clone()));
        client.handle(ClientEvent::Start);

        let busy = |client: &mut OtaClient, record: &Shared| -> anyhow::Result<()> {
            let ticket = last_ticket(record)?;
            client.handle(ClientEvent::StorageDone(StorageCompletion {
                ticket,
                outcome: StorageOutcome::Busy,
            }));
            Ok(())
        };

        busy(&mut client, &record)?;
        assert_eq!(
            client.session().retries().get(RetryKind::Flash).remaining(),
            1
        );
        let (token, after) = last_timer(&record)?;
        assert_eq!(after, config.busy_poll_interval);
        client.handle(ClientEvent::TimerFired(token));
        assert_eq!(record.borrow().storage.len(), 2);

        busy(&mut client, &record)?;
        assert_eq!(client.phase(), ClientPhase::Stopped);
        assert_eq!(*faults.borrow(), vec![ClientNotification::HardwareFault]);
        Ok(())
    }

    #[test]
    fn test_stop_notifies_once() -> anyhow::Result<()> {
        let (mut client, record) = client(ClientConfig::default())?;
        let seen = Rc::new(RefCell::new(0usize));
        let counter = seen.clone();
        client.on_notification(move |n| {
            if *n == ClientNotification::Stopped {
                *counter.borrow_mut() += 1;
            }
        });
        ready(&mut client, &record)?;

        client.handle(ClientEvent::Stop);
        client.handle(ClientEvent::Stop);
        assert_eq!(client.phase(), ClientPhase::Stopped);
        assert_eq!(*seen.borrow(), 1);
        assert!(record.borrow().timers.is_empty());
        Ok(())
    }
}
