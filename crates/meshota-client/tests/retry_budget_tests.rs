//! Retry budget boundaries per phase: one failure short of the budget
//! recovers, a full budget of failures falls back.

use anyhow::Result;
use meshota_client::prelude::*;
use meshota_test_helpers::prelude::*;

const SERVER: u64 = 0xA1;
const BODY_LEN: usize = 3_000;
const STALL_AT: u32 = 640;

struct Case {
    name: &'static str,
    /// Makes the next `n` attempts go unanswered.
    arm: fn(&mut SimWorld, u32),
    attempts: fn(&Harness) -> usize,
    succeeded: fn(&Harness) -> bool,
    fell_back: fn(&Harness) -> bool,
}

fn sent_named(h: &Harness, name: &str) -> usize {
    h.world().sent_count(|r| r.name() == name)
}

fn blocks_at(h: &Harness, offset: u32) -> usize {
    h.world()
        .sent_count(|r| matches!(r, Request::ImageBlock(b) if b.offset == offset))
}

fn server_found(h: &Harness) -> bool {
    h.notified(|n| matches!(n, ClientNotification::ServerFound(_)))
}

fn download_started(h: &Harness) -> bool {
    h.notified(|n| matches!(n, ClientNotification::DownloadStarted { .. }))
}

fn download_finished(h: &Harness) -> bool {
    h.notified(|n| matches!(n, ClientNotification::DownloadFinished { .. }))
}

fn unreachable_abort(h: &Harness) -> bool {
    h.notified(|n| {
        matches!(
            n,
            ClientNotification::DownloadAborted {
                reason: AbortReason::ServerUnreachable,
                ..
            }
        )
    })
}

fn lose(world: &mut SimWorld, name: &'static str, n: u32) {
    world.lose_requests.insert(name, n);
}

fn silence(world: &mut SimWorld, offset: u32, n: u32) {
    if let Some(server) = world.server_mut(SERVER) {
        server.silent_at.insert(offset, n);
    }
}

fn cases() -> Vec<Case> {
    vec![
        Case {
            name: "resolving endpoint",
            arm: |w, n| lose(w, "resolve-endpoint", n),
            attempts: |h| sent_named(h, "resolve-endpoint"),
            succeeded: server_found,
            fell_back: |h| {
                h.phase() == ClientPhase::AwaitingDiscoveryWindow
                    && sent_named(h, "resolve-endpoint") > 0
                    && !server_found(h)
            },
        },
        Case {
            name: "establishing key",
            arm: |w, n| lose(w, "request-link-key", n),
            attempts: |h| sent_named(h, "request-link-key"),
            succeeded: server_found,
            fell_back: |h| {
                h.phase() == ClientPhase::AwaitingDiscoveryWindow
                    && sent_named(h, "request-link-key") > 0
                    && !server_found(h)
            },
        },
        Case {
            name: "negotiating",
            arm: |w, n| lose(w, "query-next-image", n),
            attempts: |h| sent_named(h, "query-next-image"),
            succeeded: download_started,
            fell_back: |h| {
                h.notified(|n| matches!(n, ClientNotification::ServerLost(_)))
                    && !download_started(h)
            },
        },
        Case {
            name: "transferring blocks",
            arm: |w, n| silence(w, STALL_AT, n),
            attempts: |h| blocks_at(h, STALL_AT),
            succeeded: download_finished,
            fell_back: unreachable_abort,
        },
        Case {
            name: "fetching trailer",
            arm: |w, n| silence(w, BODY_LEN as u32, n),
            attempts: |h| blocks_at(h, BODY_LEN as u32),
            succeeded: download_finished,
            fell_back: unreachable_abort,
        },
    ]
}

fn harness_for(case: &Case, failures: u32) -> Result<Harness> {
    let body = test_body(BODY_LEN);
    let mut world = SimWorld::new().with_server(SimServer::new(0x1111, SERVER).serving(2, &body));
    (case.arm)(&mut world, failures);
    let mut h = Harness::new(test_config(), world)?;
    h.start();
    Ok(h)
}

#[test]
fn test_one_failure_short_of_budget_recovers() -> Result<()> {
    let budget = u32::from(test_config().max_retries);

    for case in cases() {
        let mut h = harness_for(&case, budget - 1)?;
        let settled = h.run_until(20_000, |h| (case.succeeded)(h) || (case.fell_back)(h));

        assert!(settled, "{}: never settled", case.name);
        assert!((case.succeeded)(&h), "{}: did not recover", case.name);
        assert!(!(case.fell_back)(&h), "{}: fell back early", case.name);
        assert_eq!((case.attempts)(&h), budget as usize, "{}", case.name);
    }
    Ok(())
}

#[test]
fn test_full_budget_of_failures_falls_back() -> Result<()> {
    let budget = u32::from(test_config().max_retries);

    for case in cases() {
        let mut h = harness_for(&case, budget)?;
        let settled = h.run_until(20_000, |h| (case.fell_back)(h));

        assert!(settled, "{}: never fell back", case.name);
        assert!(!(case.succeeded)(&h), "{}: succeeded anyway", case.name);
        assert_eq!((case.attempts)(&h), budget as usize, "{}", case.name);
    }
    Ok(())
}
