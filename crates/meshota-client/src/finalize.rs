//! Finalization.
//!
//! Runs once every body byte has been received:
//!
//! ```text
//! Flush ─▶ FetchTrailer ─▶ WriteTrailer ─▶ Verify ─▶ Switch ─▶ ReportEnd
//! ```
//!
//! The trailer is compared with the running checksum before anything else
//! is touched, then storage checks the slot on its own. The active slot only
//! changes at `Switch`; every failure before it leaves the running image
//! selected.

use tracing::{debug, info, warn};

use crate::adapters::StorageOutcome;
use crate::address::ShortAddress;
use crate::client::{Ctx, Transition, retry};
use crate::event::{AbortReason, ClientNotification};
use crate::image::{TRAILER_LEN, decode_trailer};
use crate::phase::ClientPhase;
use crate::protocol::{
    ImageBlockResponse, Request, Response, UpgradeEndRequest, UpgradeEndResponse, UpgradeStatus,
    wait_for_data_delay,
};
use crate::session::{FinalizeStep, StorageRequest};
use crate::transfer;

pub(crate) fn begin(ctx: &mut Ctx<'_>) -> Transition {
    ctx.session.finalize = FinalizeStep::Flush;
    ctx.session.trailer.clear();
    debug!("Body received, finalizing");
    issue(ctx)
}

/// Start the current step.
pub(crate) fn issue(ctx: &mut Ctx<'_>) -> Transition {
    let (Some(body), Some(slot)) = (
        ctx.session.progress.as_ref().map(|p| p.sub_image_length),
        ctx.session.target_slot,
    ) else {
        return Transition::Window(ctx.config.discovery_period);
    };

    match ctx.session.finalize {
        FinalizeStep::Flush => {
            if ctx.session.staging.is_empty() {
                step(ctx, FinalizeStep::FetchTrailer)
            } else {
                transfer::write_staged(ctx);
                Transition::Stay
            }
        }
        FinalizeStep::FetchTrailer => {
            let have = u32::try_from(ctx.session.trailer.len()).unwrap_or(TRAILER_LEN);
            transfer::send_block_request(
                ctx,
                body.saturating_add(have),
                TRAILER_LEN.saturating_sub(have),
            )
        }
        FinalizeStep::WriteTrailer => {
            let bytes = ctx.session.trailer.to_vec();
            ctx.storage(StorageRequest::Write {
                slot,
                offset: body,
                bytes,
            });
            Transition::Stay
        }
        FinalizeStep::Verify => {
            let expected = ctx
                .session
                .progress
                .as_ref()
                .map_or(0, |p| p.running_checksum);
            ctx.storage(StorageRequest::Verify {
                slot,
                len: body,
                expected,
            });
            Transition::Stay
        }
        FinalizeStep::Switch => {
            let from = ctx.adapters.storage.active_slot();
            info!(%from, to = %slot, "Image verified, switching slots");
            ctx.storage(StorageRequest::Switch { from, to: slot });
            Transition::Stay
        }
        FinalizeStep::ReportEnd => {
            let Some((destination, key)) = transfer::server_route(ctx) else {
                return complete(ctx, None);
            };
            ctx.request(
                destination,
                Request::UpgradeEnd(UpgradeEndRequest {
                    status: UpgradeStatus::Success,
                    key,
                }),
                ctx.config.response_timeout,
            );
            Transition::Stay
        }
    }
}

fn step(ctx: &mut Ctx<'_>, next: FinalizeStep) -> Transition {
    ctx.session.finalize = next;
    issue(ctx)
}

pub(crate) fn on_response(ctx: &mut Ctx<'_>, source: ShortAddress, response: Response) -> Transition {
    if !transfer::from_active_server(ctx, source) {
        return Transition::Stay;
    }
    match (ctx.session.finalize, response) {
        (
            FinalizeStep::FetchTrailer,
            Response::ImageBlock(ImageBlockResponse::Success { key, offset, data }),
        ) => {
            if !transfer::for_current_image(ctx, &key) {
                return Transition::Stay;
            }
            on_trailer_block(ctx, offset, &data)
        }
        (
            FinalizeStep::FetchTrailer,
            Response::ImageBlock(ImageBlockResponse::WaitForData {
                current_time,
                request_time,
                minimum_block_delay_ms,
            }),
        ) => transfer::defer(
            ctx,
            wait_for_data_delay(current_time, request_time, minimum_block_delay_ms),
        ),
        (FinalizeStep::FetchTrailer, Response::ImageBlock(ImageBlockResponse::Abort)) => {
            warn!("Server aborted the download");
            transfer::abort(ctx, AbortReason::ServerAborted)
        }
        (FinalizeStep::ReportEnd, Response::UpgradeEnd(answer)) => {
            if !transfer::for_current_image(ctx, &answer.key) {
                return Transition::Stay;
            }
            ctx.settle();
            complete(ctx, Some(answer))
        }
        (_, Response::Default { status }) => {
            debug!(%status, step = ?ctx.session.finalize, "Finalization request failed");
            retry(ClientPhase::Finalizing, ctx)
        }
        _ => Transition::Stay,
    }
}

fn on_trailer_block(ctx: &mut Ctx<'_>, offset: u32, data: &[u8]) -> Transition {
    let Some(body) = ctx.session.progress.as_ref().map(|p| p.sub_image_length) else {
        return Transition::Stay;
    };
    let have = u32::try_from(ctx.session.trailer.len()).unwrap_or(TRAILER_LEN);
    let expected = body.saturating_add(have);
    if offset < expected {
        debug!(offset, expected, "Discarding duplicate trailer block");
        return Transition::Stay;
    }
    if offset > expected || data.is_empty() {
        debug!(offset, expected, len = data.len(), "Unexpected trailer block");
        return retry(ClientPhase::Finalizing, ctx);
    }

    ctx.settle();
    for &byte in data {
        if ctx.session.trailer.push(byte).is_err() {
            break;
        }
    }
    if ctx.session.trailer.len() < ctx.session.trailer.capacity() {
        return issue(ctx);
    }

    let running = ctx
        .session
        .progress
        .as_ref()
        .map_or(0, |p| p.running_checksum);
    match decode_trailer(&ctx.session.trailer) {
        Some(expected) if expected == running => step(ctx, FinalizeStep::WriteTrailer),
        trailer => {
            warn!(?trailer, running, "Image checksum mismatch");
            transfer::abort(ctx, AbortReason::IntegrityFailure)
        }
    }
}

pub(crate) fn on_storage(
    ctx: &mut Ctx<'_>,
    request: StorageRequest,
    outcome: StorageOutcome,
) -> Transition {
    match (ctx.session.finalize, request, outcome) {
        (FinalizeStep::Flush, StorageRequest::Write { offset, bytes, .. }, StorageOutcome::Done) => {
            transfer::commit(ctx, offset, &bytes);
            step(ctx, FinalizeStep::FetchTrailer)
        }
        (FinalizeStep::WriteTrailer, StorageRequest::Write { .. }, StorageOutcome::Done) => {
            if let Some(progress) = ctx.session.progress.as_mut() {
                progress.commit_trailer();
            }
            step(ctx, FinalizeStep::Verify)
        }
        (FinalizeStep::Verify, StorageRequest::Verify { .. }, StorageOutcome::Done) => {
            step(ctx, FinalizeStep::Switch)
        }
        (FinalizeStep::Verify, StorageRequest::Verify { .. }, StorageOutcome::Mismatch) => {
            warn!("Storage rejected the written image");
            transfer::abort(ctx, AbortReason::IntegrityFailure)
        }
        (FinalizeStep::Switch, StorageRequest::Switch { to, .. }, StorageOutcome::Done) => {
            info!(active = %to, "Active image switched");
            // Nothing left to resume once the new image boots.
            ctx.clear_checkpoint();
            step(ctx, FinalizeStep::ReportEnd)
        }
        (_, request, _) => transfer::storage_fault(ctx, request.op()),
    }
}

/// The server stopped answering.
pub(crate) fn exhausted(ctx: &mut Ctx<'_>) -> Transition {
    match ctx.session.finalize {
        FinalizeStep::ReportEnd => {
            warn!("Upgrade end not acknowledged, image is active regardless");
            complete(ctx, None)
        }
        _ => transfer::abort(ctx, AbortReason::ServerUnreachable),
    }
}

/// Stop requested while finalizing.
///
/// Before the switch the download can still resume from a checkpoint.
/// After it the new image is active and only the acknowledgement is
/// missing, so the download counts as finished.
pub(crate) fn interrupt(ctx: &mut Ctx<'_>) {
    if ctx.session.finalize == FinalizeStep::ReportEnd {
        warn!("Stopped before upgrade end was acknowledged, image is active regardless");
        finish(ctx, None);
    } else {
        ctx.save_checkpoint();
    }
}

/// The new image is active.
fn complete(ctx: &mut Ctx<'_>, answer: Option<UpgradeEndResponse>) -> Transition {
    finish(ctx, answer);
    ctx.session.registry.take_active();
    Transition::Window(ctx.config.discovery_period)
}

fn finish(ctx: &mut Ctx<'_>, answer: Option<UpgradeEndResponse>) {
    ctx.clear_checkpoint();
    let upgrade_delay = answer.as_ref().and_then(UpgradeEndResponse::upgrade_delay);
    if let Some(image) = ctx.session.image {
        info!(%image, ?upgrade_delay, "Download finished");
        ctx.notify(ClientNotification::DownloadFinished {
            image,
            upgrade_delay,
            acknowledged: answer.is_some(),
        });
    }
}
