//! Download, finalization and failure handling against the simulator.

use std::time::Duration;

use anyhow::Result;
use meshota_client::image::{crc32, seal_image};
use meshota_client::prelude::*;
use meshota_test_helpers::prelude::*;
use tracing_test::traced_test;

const SERVER: u64 = 0xA1;

fn world_serving(body: &[u8]) -> SimWorld {
    SimWorld::new().with_server(SimServer::new(0x1111, SERVER).serving(2, body))
}

fn server_ends(h: &Harness) -> Vec<UpgradeStatus> {
    h.world()
        .server(SERVER)
        .map(|s| s.ends.clone())
        .unwrap_or_default()
}

fn aborted(h: &Harness) -> Option<AbortReason> {
    h.notifications().iter().find_map(|n| match n {
        ClientNotification::DownloadAborted { reason, .. } => Some(*reason),
        _ => None,
    })
}

fn block_requests_at(h: &Harness, offset: u32) -> Vec<Duration> {
    h.world()
        .sent
        .iter()
        .filter_map(|(at, _, r)| match r {
            Request::ImageBlock(b) if b.offset == offset => Some(*at),
            _ => None,
        })
        .collect()
}

#[test]
#[traced_test]
fn test_block_download_activates_verified_image() -> Result<()> {
    let body = test_body(10_000);
    let sealed = seal_image(&body);
    let mut h = Harness::new(test_config(), world_serving(&body))?;
    h.start();

    assert!(h.run_until_finished(5_000));
    assert_eq!(h.phase(), ClientPhase::AwaitingDiscoveryWindow);

    {
        let world = h.world();
        assert_eq!(world.flash.active, Slot::B);
        assert_eq!(world.flash.contents(Slot::B), sealed.as_slice());
        assert_eq!(world.flash.contents(Slot::A), &[] as &[u8]);
        assert_eq!(world.checkpoint, None);
        assert!(world.checkpoint_saves >= 9);

        let expected: Vec<u32> = (0..10_000).step_by(64).chain([10_000]).collect();
        assert_eq!(world.block_offsets(), expected);
    }
    assert_eq!(server_ends(&h), vec![UpgradeStatus::Success]);

    let image = must_some(
        h.world().server(SERVER).and_then(SimServer::descriptor),
        "server offers an image",
    );
    assert!(h.notified(|n| *n
        == ClientNotification::DownloadStarted {
            image,
            resumed_from: 0,
        }));
    assert!(h.notified(|n| *n
        == ClientNotification::DownloadFinished {
            image,
            upgrade_delay: Some(Duration::ZERO),
            acknowledged: true,
        }));
    assert!(logs_contain("Download finished"));
    Ok(())
}

#[test]
fn test_upgrade_delay_comes_from_acknowledgement() -> Result<()> {
    let body = test_body(300);
    let mut world = world_serving(&body);
    if let Some(server) = world.server_mut(SERVER) {
        server.upgrade_after_secs = 30;
    }
    let mut h = Harness::new(test_config(), world)?;
    h.start();

    assert!(h.run_until_finished(500));
    assert!(h.notified(|n| matches!(
        n,
        ClientNotification::DownloadFinished {
            upgrade_delay: Some(delay),
            acknowledged: true,
            ..
        } if *delay == Duration::from_secs(30)
    )));
    Ok(())
}

#[test]
fn test_unacknowledged_end_still_finishes() -> Result<()> {
    let body = test_body(300);
    let mut world = world_serving(&body);
    if let Some(server) = world.server_mut(SERVER) {
        server.acknowledges_end = false;
    }
    let mut h = Harness::new(test_config(), world)?;
    h.start();

    assert!(h.run_until_finished(500));
    assert_eq!(h.world().flash.active, Slot::B);
    assert_eq!(
        server_ends(&h),
        vec![UpgradeStatus::Success; usize::from(test_config().max_retries)]
    );
    assert!(h.notified(|n| matches!(
        n,
        ClientNotification::DownloadFinished {
            upgrade_delay: None,
            acknowledged: false,
            ..
        }
    )));
    Ok(())
}

#[test]
fn test_wait_for_data_defers_request() -> Result<()> {
    let body = test_body(10_000);
    let mut world = world_serving(&body);
    if let Some(server) = world.server_mut(SERVER) {
        server.not_ready_at.insert(640);
    }
    let mut h = Harness::new(test_config(), world)?;
    h.start();

    assert!(h.run_until(10_000, |h| h.phase() == ClientPhase::Finalizing));
    let checksum = h.client().session().progress().map(|p| p.running_checksum);
    assert_eq!(checksum, Some(crc32(&body)));

    assert!(h.run_until_finished(10_000));
    let &[first, second] = block_requests_at(&h, 640).as_slice() else {
        anyhow::bail!("offset 640 should be requested exactly twice");
    };
    assert!(second - first >= Duration::from_millis(250));
    assert_eq!(
        h.world().flash.contents(Slot::B),
        seal_image(&body).as_slice()
    );
    Ok(())
}

#[test]
fn test_wait_for_data_is_capped() -> Result<()> {
    let body = test_body(2_000);
    let mut world = world_serving(&body);
    if let Some(server) = world.server_mut(SERVER) {
        server.not_ready_at.insert(640);
    }
    let config = ClientConfig {
        max_wait_for_data: Duration::from_millis(100),
        ..test_config()
    };
    let mut h = Harness::new(config, world)?;
    h.start();

    assert!(h.run_until_finished(2_000));
    let &[first, second] = block_requests_at(&h, 640).as_slice() else {
        anyhow::bail!("offset 640 should be requested exactly twice");
    };
    assert!(second - first < Duration::from_millis(250));
    Ok(())
}

#[test]
fn test_page_download_backfills_missing_block() -> Result<()> {
    let body = test_body(1_000);
    let mut world = world_serving(&body);
    if let Some(server) = world.server_mut(SERVER) {
        server.page_drops.insert(128);
    }
    let config = ClientConfig {
        page_requests: true,
        ..test_config()
    };
    let mut h = Harness::new(config, world)?;
    h.start();

    assert!(h.run_until_finished(2_000));
    let world = h.world();
    assert_eq!(world.flash.active, Slot::B);
    assert_eq!(world.flash.contents(Slot::B), seal_image(&body).as_slice());

    let pages: Vec<u32> = world
        .sent
        .iter()
        .filter_map(|(_, _, r)| match r {
            Request::ImagePage(p) => Some(p.offset),
            _ => None,
        })
        .collect();
    assert_eq!(pages, vec![0, 256, 512, 768]);

    let gaps = world.sent_count(|r| matches!(r, Request::ImageBlock(b) if b.offset == 128));
    assert_eq!(gaps, 1);
    Ok(())
}

#[test]
fn test_unanswered_page_is_requested_again() -> Result<()> {
    let body = test_body(600);
    let config = ClientConfig {
        page_requests: true,
        ..test_config()
    };
    let mut h = Harness::new(config, world_serving(&body))?;
    h.start();

    // The query is out; the next request to the server is the first page.
    assert!(h.run_until(500, |h| h.phase() == ClientPhase::Negotiating));
    if let Some(server) = h.world_mut().server_mut(SERVER) {
        server.drop_next = 1;
    }
    assert!(h.run_until_finished(2_000));
    let first_pages = h
        .world()
        .sent_count(|r| matches!(r, Request::ImagePage(p) if p.offset == 0));
    assert_eq!(first_pages, 2);
    Ok(())
}

#[test]
fn test_write_unit_batches_blocks() -> Result<()> {
    let body = test_body(10_000);
    let config = ClientConfig {
        flash_write_unit: 256,
        ..test_config()
    };
    let mut h = Harness::new(config, world_serving(&body))?;
    h.start();

    assert!(h.run_until_finished(5_000));
    let world = h.world();
    // 39 full units, the 16 byte tail and the trailer.
    assert_eq!(world.flash.count(StorageOp::Write), 41);
    assert_eq!(world.flash.contents(Slot::B), seal_image(&body).as_slice());
    Ok(())
}

#[test]
fn test_busy_storage_is_polled() -> Result<()> {
    let body = test_body(1_000);
    let mut world = world_serving(&body);
    world.flash.busy_next = 5;
    let mut h = Harness::new(test_config(), world)?;
    h.start();

    assert!(h.run_until_finished(2_000));
    assert_eq!(h.world().flash.active, Slot::B);
    Ok(())
}

#[test]
#[traced_test]
fn test_storage_stuck_busy_aborts_download() -> Result<()> {
    let body = test_body(4_000);
    let mut h = Harness::new(test_config(), world_serving(&body))?;
    h.start();

    assert!(h.run_until(2_000, |h| h.world().block_offsets().len() >= 10));
    let polls = u32::from(h.client().config().max_flash_busy_polls);
    h.world_mut().flash.busy_next = polls;

    assert!(h.run_until(2_000, |h| aborted(h).is_some()));
    assert_eq!(aborted(&h), Some(AbortReason::StorageFault));
    assert!(h.notified(|n| *n == ClientNotification::StorageFault(StorageOp::Write)));
    assert_eq!(h.world().flash.active, Slot::A);
    assert_eq!(h.world().checkpoint, None);
    assert_eq!(server_ends(&h), vec![UpgradeStatus::Abort]);
    assert_eq!(h.phase(), ClientPhase::AwaitingDiscoveryWindow);
    assert!(logs_contain("Download aborted, previous image stays active"));
    Ok(())
}

#[test]
fn test_failed_init_reports_hardware_fault() -> Result<()> {
    let body = test_body(1_000);
    let mut world = world_serving(&body);
    world.flash.fail_next = Some(StorageOp::Init);
    let mut h = Harness::new(test_config(), world)?;
    h.start();

    assert!(h.run_until(10, |h| h.notified(|n| *n == ClientNotification::HardwareFault)));
    assert_eq!(h.phase(), ClientPhase::Stopped);
    assert!(h.world().sent.is_empty());
    Ok(())
}

#[test]
fn test_erase_failure_is_a_storage_fault() -> Result<()> {
    let body = test_body(1_000);
    let mut world = world_serving(&body);
    world.flash.fail_next = Some(StorageOp::Erase);
    let mut h = Harness::new(test_config(), world)?;
    h.start();

    assert!(h.run_until(500, |h| aborted(h).is_some()));
    assert_eq!(aborted(&h), Some(AbortReason::StorageFault));
    assert!(h.notified(|n| *n == ClientNotification::StorageFault(StorageOp::Erase)));
    assert!(h.world().block_offsets().is_empty());
    Ok(())
}

#[test]
#[traced_test]
fn test_trailer_mismatch_rejects_image() -> Result<()> {
    let body = test_body(1_000);
    let mut world = world_serving(&body);
    if let Some(server) = world.server_mut(SERVER) {
        server.corrupt_trailer = true;
    }
    let mut h = Harness::new(test_config(), world)?;
    h.start();

    assert!(h.run_until(2_000, |h| aborted(h).is_some()));
    assert_eq!(aborted(&h), Some(AbortReason::IntegrityFailure));
    let world = h.world();
    assert_eq!(world.flash.active, Slot::A);
    assert_eq!(world.flash.count(StorageOp::Verify), 0);
    assert_eq!(world.flash.count(StorageOp::Switch), 0);
    assert_eq!(world.checkpoint, None);
    drop(world);
    assert_eq!(server_ends(&h), vec![UpgradeStatus::InvalidImage]);
    assert!(logs_contain("Image checksum mismatch"));
    Ok(())
}

#[test]
fn test_storage_verification_failure_rejects_image() -> Result<()> {
    let body = test_body(1_000);
    let mut world = world_serving(&body);
    world.flash.corrupt_writes = true;
    let mut h = Harness::new(test_config(), world)?;
    h.start();

    assert!(h.run_until(2_000, |h| aborted(h).is_some()));
    assert_eq!(aborted(&h), Some(AbortReason::IntegrityFailure));
    assert_eq!(h.world().flash.count(StorageOp::Verify), 1);
    assert_eq!(h.world().flash.count(StorageOp::Switch), 0);
    assert_eq!(h.world().flash.active, Slot::A);
    assert_eq!(server_ends(&h), vec![UpgradeStatus::InvalidImage]);
    assert!(!h.notified(|n| matches!(n, ClientNotification::DownloadFinished { .. })));
    Ok(())
}

#[test]
fn test_server_abort_discards_download() -> Result<()> {
    let body = test_body(4_000);
    let mut world = world_serving(&body);
    if let Some(server) = world.server_mut(SERVER) {
        server.abort_at.insert(2_048);
    }
    let mut h = Harness::new(test_config(), world)?;
    h.start();

    assert!(h.run_until(2_000, |h| aborted(h).is_some()));
    assert_eq!(aborted(&h), Some(AbortReason::ServerAborted));
    assert_eq!(h.world().checkpoint, None);
    assert!(server_ends(&h).is_empty());
    assert_eq!(h.world().flash.active, Slot::A);
    Ok(())
}

#[test]
fn test_stop_mid_download_keeps_checkpoint() -> Result<()> {
    let body = test_body(4_000);
    let mut h = Harness::new(test_config(), world_serving(&body))?;
    h.start();

    assert!(h.run_until(2_000, |h| h
        .world()
        .block_offsets()
        .last()
        .is_some_and(|&o| o >= 1_600)));
    h.stop();

    assert_eq!(h.phase(), ClientPhase::Stopped);
    assert!(h.notified(|n| *n == ClientNotification::Stopped));
    let checkpoint = must_some(h.world().checkpoint, "checkpoint saved on stop");
    assert!(checkpoint.offset >= 1_536 && checkpoint.offset <= 1_600);
    let committed = must_some(
        body.get(..usize::try_from(checkpoint.offset)?),
        "checkpoint within body",
    );
    assert_eq!(checkpoint.checksum, crc32(committed));

    // Nothing moves once stopped.
    let sent = h.world().sent.len();
    h.run_for(Duration::from_secs(120));
    assert_eq!(h.world().sent.len(), sent);
    Ok(())
}

#[test]
fn test_announcements_do_not_disturb_download() -> Result<()> {
    let body = test_body(2_000);
    let mut other = SimServer::new(0x2222, 0xB2).serving(3, &body);
    other.answers_locate = false;
    let world = world_serving(&body).with_server(other);
    let mut h = Harness::new(test_config(), world)?;
    h.start();

    assert!(h.run_until(2_000, |h| h.phase() == ClientPhase::TransferringBlocks));
    let notify = must_some(h.world().new_version_notify(0xB2), "announcer has an image");
    h.world_mut().announce(0xB2, notify);

    assert!(h.run_until_finished(2_000));
    assert!(h.client().session().registry().queued().next().is_none());
    assert_eq!(
        h.world()
            .sent
            .iter()
            .filter(|(_, d, _)| matches!(d, Destination::Unicast { address, .. } if *address == ShortAddress(0x2222)))
            .count(),
        0
    );
    Ok(())
}
