//! Image negotiation.
//!
//! The client asks the resolved server for an image newer than the one it
//! runs. An acceptable offer prepares the inactive slot: either the partial
//! image from a matching checkpoint is checked and kept, or the slot is
//! erased. The transfer starts once storage has confirmed.

use tracing::{debug, info, warn};

use crate::address::{ServerIdentity, ShortAddress};
use crate::adapters::StorageOutcome;
use crate::client::{Ctx, Transition, retry};
use crate::config::ClientConfig;
use crate::discovery;
use crate::event::ClientNotification;
use crate::image::{ImageDescriptor, TRAILER_LEN};
use crate::phase::ClientPhase;
use crate::progress::{TransferProgress, WriteBuffer};
use crate::protocol::{Destination, QueryNextImageRequest, Request, Response, UpgradeStatus};
use crate::session::StorageRequest;
use crate::slot::Slot;
use crate::transfer;

pub(crate) fn query(ctx: &mut Ctx<'_>) -> Transition {
    let Some(server) = ctx.session.server() else {
        return discovery::drop_candidate(ctx);
    };
    let request = QueryNextImageRequest {
        key: ctx.config.own_key(),
        hardware_version: ctx.config.hardware_version,
    };
    ctx.request(
        Destination::Unicast {
            address: server.short_address,
            endpoint: Some(server.endpoint),
        },
        Request::QueryNextImage(request),
        ctx.config.response_timeout,
    );
    Transition::Stay
}

pub(crate) fn on_response(ctx: &mut Ctx<'_>, source: ShortAddress, response: Response) -> Transition {
    let Some(server) = ctx.session.server() else {
        return Transition::Stay;
    };
    if source != server.short_address {
        debug!(%source, "Ignoring response from inactive server");
        return Transition::Stay;
    }

    match response {
        Response::QueryNextImage(answer) => match (answer.status, answer.image) {
            (UpgradeStatus::Success, Some(image)) => {
                ctx.settle();
                offer(ctx, server, image)
            }
            (UpgradeStatus::NoImageAvailable, _) => {
                ctx.settle();
                remember(ctx, server);
                info!(%server, "No image available");
                Transition::Window(ctx.config.no_image_cooldown)
            }
            (UpgradeStatus::NotAuthorized, _) => {
                ctx.settle();
                warn!(%server, "Server refused this client");
                ctx.session.registry.blacklist_active();
                discovery::next_candidate(ctx)
            }
            (status, _) => {
                debug!(%status, "Unusable query answer");
                retry(ClientPhase::Negotiating, ctx)
            }
        },
        Response::Default { status } => {
            debug!(%status, "Query failed");
            retry(ClientPhase::Negotiating, ctx)
        }
        _ => Transition::Stay,
    }
}

/// The server stopped answering queries.
pub(crate) fn exhausted(ctx: &mut Ctx<'_>) -> Transition {
    if let Some(server) = ctx.session.server() {
        ctx.notify(ClientNotification::ServerLost(server.extended_address));
    }
    discovery::drop_candidate(ctx)
}

fn offer(ctx: &mut Ctx<'_>, server: ServerIdentity, image: ImageDescriptor) -> Transition {
    remember(ctx, server);
    if let Err(reason) = check_offer(ctx.config, &image) {
        info!(%image, reason, "Offer rejected");
        if image.firmware_version == ctx.config.current_version && ctx.session.resume_hint.is_some() {
            ctx.clear_checkpoint();
        }
        return Transition::Window(ctx.config.no_image_cooldown);
    }

    let target = ctx.adapters.storage.active_slot().other();
    ctx.session.image = Some(image);
    ctx.session.target_slot = Some(target);

    match ctx.session.resume_hint {
        Some(checkpoint)
            if checkpoint.image == image
                && checkpoint.offset > 0
                && checkpoint.offset <= image.body_len() =>
        {
            info!(
                offset = checkpoint.offset,
                "Checking partial image before resuming"
            );
            ctx.storage(StorageRequest::Checksum {
                slot: target,
                len: checkpoint.offset,
            });
        }
        stale => {
            if stale.is_some() {
                info!("Checkpoint does not match the offer, starting over");
                ctx.clear_checkpoint();
            }
            erase(ctx, target, &image);
        }
    }
    Transition::Stay
}

pub(crate) fn on_storage(
    ctx: &mut Ctx<'_>,
    request: StorageRequest,
    outcome: StorageOutcome,
) -> Transition {
    let (Some(image), Some(slot)) = (ctx.session.image, ctx.session.target_slot) else {
        return Transition::Window(ctx.config.discovery_period);
    };

    match (request, outcome) {
        (StorageRequest::Checksum { len, .. }, StorageOutcome::Checksum(actual)) => {
            match ctx.session.resume_hint.take() {
                Some(checkpoint) if checkpoint.offset == len && checkpoint.checksum == actual => {
                    start_transfer(ctx, image, TransferProgress::resume(&image, len, actual))
                }
                _ => {
                    warn!("Partial image does not match checkpoint, starting over");
                    ctx.clear_checkpoint();
                    erase(ctx, slot, &image);
                    Transition::Stay
                }
            }
        }
        (StorageRequest::Checksum { .. }, _) => {
            warn!("Could not check partial image, starting over");
            ctx.clear_checkpoint();
            erase(ctx, slot, &image);
            Transition::Stay
        }
        (StorageRequest::Erase { .. }, StorageOutcome::Done) => {
            start_transfer(ctx, image, TransferProgress::new(&image))
        }
        (request, _) => transfer::storage_fault(ctx, request.op()),
    }
}

fn start_transfer(ctx: &mut Ctx<'_>, image: ImageDescriptor, progress: TransferProgress) -> Transition {
    let resumed_from = progress.current_file_offset;
    ctx.session.staging = WriteBuffer::at(resumed_from);
    ctx.session.progress = Some(progress);
    info!(%image, resumed_from, "Download started");
    ctx.notify(ClientNotification::DownloadStarted {
        image,
        resumed_from,
    });
    Transition::Enter(transfer::entry_phase(ctx.config))
}

fn erase(ctx: &mut Ctx<'_>, slot: Slot, image: &ImageDescriptor) {
    debug!(%slot, len = image.total_size, "Erasing target slot");
    ctx.storage(StorageRequest::Erase {
        slot,
        len: image.total_size,
    });
}

fn remember(ctx: &mut Ctx<'_>, server: ServerIdentity) {
    let known = Some(server.into());
    if ctx.adapters.settings.known_server() != known {
        ctx.adapters.settings.store_known_server(known);
    }
}

/// Why an offer cannot be downloaded, if it cannot.
pub(crate) fn check_offer(config: &ClientConfig, image: &ImageDescriptor) -> Result<(), &'static str> {
    if image.manufacturer_id != config.manufacturer_id {
        return Err("manufacturer mismatch");
    }
    if image.image_type != config.image_type {
        return Err("image type mismatch");
    }
    if image.firmware_version == config.current_version {
        return Err("already running this version");
    }
    if image.total_size <= TRAILER_LEN {
        return Err("image too small");
    }
    if image.total_size > config.max_image_size {
        return Err("image larger than slot");
    }
    Ok(())
}
