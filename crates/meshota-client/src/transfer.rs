//! Image transfer.
//!
//! Data is requested strictly in order: the next request goes out only
//! after the previous bytes were staged, and while a write is in flight
//! nothing is requested at all. Block mode asks for one block at a time.
//! Page mode asks for a page and collects the block responses the server
//! streams back; if the page stops short, the missing ranges are fetched
//! with block requests before the next page.

use tracing::{debug, trace, warn};

use crate::adapters::{StorageOp, StorageOutcome};
use crate::address::ShortAddress;
use crate::client::{Ctx, Transition, issue, retry};
use crate::config::ClientConfig;
use crate::event::{AbortReason, ClientNotification};
use crate::image::ImageKey;
use crate::phase::ClientPhase;
use crate::progress::PageWindow;
use crate::protocol::{
    Destination, ImageBlockRequest, ImageBlockResponse, ImagePageRequest, Request, Response,
    UpgradeEndRequest, UpgradeStatus, wait_for_data_delay,
};
use crate::retry::RetryKind;
use crate::session::{StorageRequest, TimerPurpose};

/// Transfer phase selected by the configuration.
pub(crate) fn entry_phase(config: &ClientConfig) -> ClientPhase {
    if config.page_requests {
        ClientPhase::TransferringPages
    } else {
        ClientPhase::TransferringBlocks
    }
}

pub(crate) fn request_block(ctx: &mut Ctx<'_>) -> Transition {
    let Some(body) = body_len(ctx) else {
        return Transition::Window(ctx.config.discovery_period);
    };
    let next = ctx.session.staging.next_offset();
    if next >= body {
        return Transition::Enter(ClientPhase::Finalizing);
    }
    let len = (body - next).min(u32::from(ctx.config.block_size));
    send_block_request(ctx, next, len)
}

pub(crate) fn request_page(ctx: &mut Ctx<'_>) -> Transition {
    if ctx
        .session
        .page
        .as_ref()
        .is_some_and(PageWindow::received_any)
    {
        return Transition::Enter(ClientPhase::BackfillingGaps);
    }
    let (Some(body), Some((destination, key))) = (body_len(ctx), server_route(ctx)) else {
        return Transition::Window(ctx.config.discovery_period);
    };
    let next = ctx.session.staging.next_offset();
    if next >= body {
        return Transition::Enter(ClientPhase::Finalizing);
    }

    let len = (body - next).min(u32::from(ctx.config.page_size));
    ctx.session.page = Some(PageWindow::new(next, len));
    let request = ImagePageRequest {
        key,
        offset: next,
        max_data_size: ctx.config.block_size,
        page_size: u16::try_from(len).unwrap_or(u16::MAX),
        response_spacing_ms: u16::try_from(ctx.config.response_spacing.as_millis())
            .unwrap_or(u16::MAX),
    };
    let timeout = ctx.config.page_timeout(len);
    ctx.request(destination, Request::ImagePage(request), timeout);
    Transition::Stay
}

pub(crate) fn request_gap(ctx: &mut Ctx<'_>) -> Transition {
    let Some(gap) = ctx.session.page.as_ref().and_then(PageWindow::first_gap) else {
        return complete_page(ClientPhase::BackfillingGaps, ctx);
    };
    let len = gap.end.saturating_sub(gap.start).min(u32::from(ctx.config.block_size));
    trace!(offset = gap.start, len, "Backfilling gap");
    send_block_request(ctx, gap.start, len)
}

/// Request `len` bytes at `offset` from the active server.
pub(crate) fn send_block_request(ctx: &mut Ctx<'_>, offset: u32, len: u32) -> Transition {
    let Some((destination, key)) = server_route(ctx) else {
        return Transition::Window(ctx.config.discovery_period);
    };
    let request = ImageBlockRequest {
        key,
        offset,
        max_data_size: u8::try_from(len).unwrap_or(u8::MAX),
    };
    ctx.request(
        destination,
        Request::ImageBlock(request),
        ctx.config.response_timeout,
    );
    Transition::Stay
}

pub(crate) fn on_response(
    phase: ClientPhase,
    ctx: &mut Ctx<'_>,
    source: ShortAddress,
    response: Response,
) -> Transition {
    if !from_active_server(ctx, source) {
        return Transition::Stay;
    }
    match response {
        Response::ImageBlock(ImageBlockResponse::Success { key, offset, data }) => {
            if !for_current_image(ctx, &key) {
                return Transition::Stay;
            }
            match phase {
                ClientPhase::TransferringBlocks => on_block(ctx, offset, &data),
                _ => on_page_block(phase, ctx, offset, &data),
            }
        }
        Response::ImageBlock(ImageBlockResponse::WaitForData {
            current_time,
            request_time,
            minimum_block_delay_ms,
        }) => defer(
            ctx,
            wait_for_data_delay(current_time, request_time, minimum_block_delay_ms),
        ),
        Response::ImageBlock(ImageBlockResponse::Abort) => {
            warn!("Server aborted the download");
            abort(ctx, AbortReason::ServerAborted)
        }
        Response::Default { status } => {
            debug!(%status, "Block request failed");
            retry(phase, ctx)
        }
        _ => Transition::Stay,
    }
}

fn on_block(ctx: &mut Ctx<'_>, offset: u32, data: &[u8]) -> Transition {
    let Some(body) = body_len(ctx) else {
        return Transition::Stay;
    };
    let expected = ctx.session.staging.next_offset();
    if offset < expected {
        trace!(offset, expected, "Discarding duplicate block");
        return Transition::Stay;
    }
    if offset > expected || data.is_empty() {
        debug!(offset, expected, len = data.len(), "Unexpected block");
        return retry(ClientPhase::TransferringBlocks, ctx);
    }

    let room = usize::try_from(body.saturating_sub(expected)).unwrap_or(usize::MAX);
    let accepted = data.get(..room).unwrap_or(data);
    ctx.settle();
    ctx.session.retries.get_mut(RetryKind::Request).reset();
    ctx.session.staging.stage(accepted);
    trace!(offset, len = accepted.len(), "Block received");
    after_receive(ClientPhase::TransferringBlocks, ctx)
}

fn on_page_block(phase: ClientPhase, ctx: &mut Ctx<'_>, offset: u32, data: &[u8]) -> Transition {
    let Some(page) = ctx.session.page.as_mut() else {
        return Transition::Stay;
    };
    let fresh = page.fill(offset, data);
    let complete = page.is_complete();
    if fresh == 0 {
        trace!(offset, "Discarding duplicate page block");
        return Transition::Stay;
    }
    ctx.session.retries.get_mut(RetryKind::Request).reset();
    trace!(offset, fresh, "Page block received");

    if complete {
        ctx.settle();
        return complete_page(phase, ctx);
    }
    if phase == ClientPhase::BackfillingGaps {
        ctx.settle();
        return request_gap(ctx);
    }
    Transition::Stay
}

/// A page request went unanswered for its whole window.
pub(crate) fn on_page_timeout(ctx: &mut Ctx<'_>) -> Transition {
    let partial = ctx
        .session
        .page
        .as_ref()
        .is_some_and(PageWindow::received_any);
    if partial {
        ctx.settle();
        debug!("Page incomplete, backfilling");
        return Transition::Enter(ClientPhase::BackfillingGaps);
    }
    retry(ClientPhase::TransferringPages, ctx)
}

fn complete_page(phase: ClientPhase, ctx: &mut Ctx<'_>) -> Transition {
    if let Some(page) = ctx.session.page.take() {
        trace!(start = page.start(), len = page.len(), "Page complete");
        ctx.session.staging.stage(&page.into_bytes());
    }
    after_receive(phase, ctx)
}

/// Write what is staged if a write is due, otherwise ask for more.
fn after_receive(phase: ClientPhase, ctx: &mut Ctx<'_>) -> Transition {
    let body_done = body_len(ctx).is_some_and(|body| ctx.session.staging.next_offset() >= body);
    let staging = &ctx.session.staging;
    if staging.is_ready(ctx.config.flash_write_unit) || (body_done && !staging.is_empty()) {
        write_staged(ctx);
        return Transition::Stay;
    }
    if body_done {
        return Transition::Enter(ClientPhase::Finalizing);
    }
    continue_transfer(phase, ctx)
}

fn continue_transfer(phase: ClientPhase, ctx: &mut Ctx<'_>) -> Transition {
    match phase {
        ClientPhase::BackfillingGaps => Transition::Enter(ClientPhase::TransferringPages),
        _ => issue(phase, ctx),
    }
}

/// Hand every staged byte to storage.
pub(crate) fn write_staged(ctx: &mut Ctx<'_>) {
    let Some(slot) = ctx.session.target_slot else {
        return;
    };
    let (offset, bytes) = ctx.session.staging.take();
    trace!(offset, len = bytes.len(), "Writing staged bytes");
    ctx.storage(StorageRequest::Write {
        slot,
        offset,
        bytes,
    });
}

pub(crate) fn on_storage(
    phase: ClientPhase,
    ctx: &mut Ctx<'_>,
    request: StorageRequest,
    outcome: StorageOutcome,
) -> Transition {
    match (request, outcome) {
        (StorageRequest::Write { offset, bytes, .. }, StorageOutcome::Done) => {
            commit(ctx, offset, &bytes);
            let body_done = ctx
                .session
                .progress
                .as_ref()
                .is_some_and(|p| p.is_body_complete());
            if body_done && ctx.session.staging.is_empty() {
                return Transition::Enter(ClientPhase::Finalizing);
            }
            continue_transfer(phase, ctx)
        }
        (request, _) => storage_fault(ctx, request.op()),
    }
}

/// Fold bytes confirmed by storage into the progress, checkpointing when due.
pub(crate) fn commit(ctx: &mut Ctx<'_>, offset: u32, bytes: &[u8]) {
    let interval = ctx.config.checkpoint_interval;
    let Some(progress) = ctx.session.progress.as_mut() else {
        return;
    };
    progress.commit_body(bytes);
    trace!(
        offset,
        committed = progress.current_file_offset,
        remaining = progress.remaining_bytes,
        "Write committed"
    );
    if progress.checkpoint_due(interval) {
        ctx.save_checkpoint();
    }
}

/// Honour a server's request to slow down.
pub(crate) fn defer(ctx: &mut Ctx<'_>, delay: std::time::Duration) -> Transition {
    let delay = delay.min(ctx.config.max_wait_for_data);
    ctx.settle();
    debug!(?delay, "Server not ready, deferring");
    ctx.arm(TimerPurpose::PeerDeferral, delay);
    Transition::Stay
}

/// A storage operation of the download failed.
pub(crate) fn storage_fault(ctx: &mut Ctx<'_>, op: StorageOp) -> Transition {
    ctx.notify(ClientNotification::StorageFault(op));
    abort(ctx, AbortReason::StorageFault)
}

/// Abandon the download. The previously active image is untouched.
pub(crate) fn abort(ctx: &mut Ctx<'_>, reason: AbortReason) -> Transition {
    ctx.settle();
    match reason {
        AbortReason::ServerUnreachable => {
            ctx.save_checkpoint();
            if let Some(server) = ctx.session.server() {
                ctx.notify(ClientNotification::ServerLost(server.extended_address));
            }
        }
        AbortReason::ServerAborted => ctx.clear_checkpoint(),
        AbortReason::StorageFault => {
            ctx.clear_checkpoint();
            report(ctx, UpgradeStatus::Abort);
        }
        AbortReason::IntegrityFailure => {
            ctx.clear_checkpoint();
            report(ctx, UpgradeStatus::InvalidImage);
        }
    }

    warn!(
        ?reason,
        active = %ctx.adapters.storage.active_slot(),
        "Download aborted, previous image stays active"
    );
    if let Some(image) = ctx.session.image {
        ctx.notify(ClientNotification::DownloadAborted { image, reason });
    }
    Transition::Window(ctx.config.discovery_period)
}

/// Tell the server how the download ended, without waiting for an answer.
fn report(ctx: &mut Ctx<'_>, status: UpgradeStatus) {
    if let Some((destination, key)) = server_route(ctx) {
        ctx.post(
            destination,
            Request::UpgradeEnd(UpgradeEndRequest { status, key }),
        );
    }
}

/// Destination of the active server and key of the image being downloaded.
pub(crate) fn server_route(ctx: &Ctx<'_>) -> Option<(Destination, ImageKey)> {
    let server = ctx.session.server()?;
    let image = ctx.session.image?;
    Some((
        Destination::Unicast {
            address: server.short_address,
            endpoint: Some(server.endpoint),
        },
        image.key(),
    ))
}

pub(crate) fn from_active_server(ctx: &Ctx<'_>, source: ShortAddress) -> bool {
    let active = ctx.session.active_short() == Some(source);
    if !active {
        debug!(%source, "Ignoring response from inactive server");
    }
    active
}

pub(crate) fn for_current_image(ctx: &Ctx<'_>, key: &ImageKey) -> bool {
    let current = ctx.session.image.is_some_and(|image| image.key() == *key);
    if !current {
        debug!(%key, "Ignoring block for another image");
    }
    current
}

fn body_len(ctx: &Ctx<'_>) -> Option<u32> {
    ctx.session.progress.as_ref().map(|p| p.sub_image_length)
}
