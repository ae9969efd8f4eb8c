//! Server discovery.
//!
//! A discovery cycle starts when the window timer fires. A remembered server
//! is looked up by address first; otherwise a broadcast search fills the
//! candidate queue and each candidate is resolved in turn:
//!
//! 1. IEEE address, which is checked against the blacklist
//! 2. server endpoint, unless already known
//! 3. link key, when required and not yet installed
//!
//! A candidate that passes all three is handed to negotiation.

use rand::Rng;
use tracing::{debug, info, warn};

use crate::address::{Endpoint, ShortAddress};
use crate::client::{Ctx, Transition, retry};
use crate::event::ClientNotification;
use crate::phase::ClientPhase;
use crate::protocol::{Destination, ImageNotify, Request, Response};
use crate::registry::ServerCandidate;

/// The discovery window opened.
pub(crate) fn on_window(ctx: &mut Ctx<'_>) -> Transition {
    ctx.session.registry.begin_cycle();
    if ctx.session.registry.has_priority() {
        ctx.session.registry.promote_next();
        return Transition::Enter(ClientPhase::ResolvingIdentity);
    }

    match ctx.adapters.settings.known_server() {
        Some(server) => {
            info!(server = %server.extended_address, "Discovery cycle started, contacting known server");
            ctx.session.known_target = Some(server);
            Transition::Enter(ClientPhase::ResolvingAddress)
        }
        None => {
            info!("Discovery cycle started, searching for servers");
            Transition::Enter(ClientPhase::BroadcastingLocate)
        }
    }
}

pub(crate) fn broadcast_locate(ctx: &mut Ctx<'_>) -> Transition {
    let key = ctx.config.own_key();
    ctx.request(
        Destination::Broadcast,
        Request::Locate { key },
        ctx.config.locate_timeout,
    );
    Transition::Stay
}

pub(crate) fn on_locate_response(ctx: &mut Ctx<'_>, response: Response) -> Transition {
    match response {
        Response::LocateCandidate { short, endpoint } => {
            let candidate = ServerCandidate::new(short).with_endpoint(endpoint);
            if ctx.session.registry.enqueue(candidate) {
                debug!(address = %short, "Candidate queued");
            }
            Transition::Stay
        }
        Response::LocateComplete => on_search_complete(ctx),
        _ => Transition::Stay,
    }
}

/// The broadcast search ended, by completion message or timeout.
pub(crate) fn on_search_complete(ctx: &mut Ctx<'_>) -> Transition {
    ctx.settle();
    debug!(
        candidates = ctx.session.registry.waiting(),
        "Search complete"
    );
    next_candidate(ctx)
}

/// Move on to the next waiting candidate, or end the cycle.
pub(crate) fn next_candidate(ctx: &mut Ctx<'_>) -> Transition {
    match ctx.session.registry.promote_next() {
        Some(candidate) => {
            debug!(address = %candidate.short_address, "Trying next candidate");
            Transition::Enter(ClientPhase::ResolvingIdentity)
        }
        None => {
            info!("No server candidates left");
            Transition::Window(ctx.config.discovery_period)
        }
    }
}

pub(crate) fn request_address(ctx: &mut Ctx<'_>) -> Transition {
    let Some(target) = ctx.session.known_target else {
        return Transition::Enter(ClientPhase::BroadcastingLocate);
    };
    ctx.request(
        Destination::Broadcast,
        Request::ResolveShortAddress {
            extended: target.extended_address,
        },
        ctx.config.response_timeout,
    );
    Transition::Stay
}

pub(crate) fn on_address_response(ctx: &mut Ctx<'_>, response: Response) -> Transition {
    let Some(target) = ctx.session.known_target else {
        return Transition::Stay;
    };
    match response {
        Response::AddressResolved { short, extended } if extended == target.extended_address => {
            ctx.settle();
            ctx.session.registry.activate(ServerCandidate {
                short_address: short,
                extended_address: Some(extended),
                endpoint: target.endpoint,
            });
            advance(ctx)
        }
        Response::AddressNotFound => retry(ClientPhase::ResolvingAddress, ctx),
        _ => Transition::Stay,
    }
}

/// The remembered server no longer resolves: forget it and search.
pub(crate) fn address_exhausted(ctx: &mut Ctx<'_>) -> Transition {
    if let Some(target) = ctx.session.known_target.take() {
        warn!(server = %target.extended_address, "Known server unreachable, forgetting it");
        ctx.adapters.settings.store_known_server(None);
        ctx.notify(ClientNotification::ServerLost(target.extended_address));
    }
    Transition::Enter(ClientPhase::BroadcastingLocate)
}

pub(crate) fn request_identity(ctx: &mut Ctx<'_>) -> Transition {
    let Some(short) = ctx.session.active_short() else {
        return next_candidate(ctx);
    };
    ctx.request(
        unicast(short, None),
        Request::ResolveExtendedAddress { short },
        ctx.config.response_timeout,
    );
    Transition::Stay
}

pub(crate) fn on_identity_response(ctx: &mut Ctx<'_>, response: Response) -> Transition {
    let Some(active) = ctx.session.active_short() else {
        return Transition::Stay;
    };
    match response {
        Response::AddressResolved { short, extended } if short == active => {
            ctx.settle();
            if ctx.session.registry.is_blacklisted(extended) {
                info!(%extended, "Candidate is blacklisted, skipping");
                return drop_candidate(ctx);
            }
            if let Some(candidate) = ctx.session.registry.active_mut() {
                candidate.extended_address = Some(extended);
            }
            advance(ctx)
        }
        Response::AddressNotFound => retry(ClientPhase::ResolvingIdentity, ctx),
        _ => Transition::Stay,
    }
}

pub(crate) fn request_endpoint(ctx: &mut Ctx<'_>) -> Transition {
    let Some(short) = ctx.session.active_short() else {
        return next_candidate(ctx);
    };
    ctx.request(
        unicast(short, None),
        Request::ResolveEndpoint { short },
        ctx.config.response_timeout,
    );
    Transition::Stay
}

pub(crate) fn on_endpoint_response(ctx: &mut Ctx<'_>, response: Response) -> Transition {
    let Some(active) = ctx.session.active_short() else {
        return Transition::Stay;
    };
    match response {
        Response::EndpointResolved { short, endpoint } if short == active => {
            ctx.settle();
            if let Some(candidate) = ctx.session.registry.active_mut() {
                candidate.endpoint = Some(endpoint);
            }
            advance(ctx)
        }
        Response::EndpointNotFound { short } if short == active => {
            retry(ClientPhase::ResolvingEndpoint, ctx)
        }
        _ => Transition::Stay,
    }
}

pub(crate) fn request_key(ctx: &mut Ctx<'_>) -> Transition {
    let Some(partner) = ctx.session.registry.active().and_then(|c| c.extended_address) else {
        return drop_candidate(ctx);
    };
    ctx.request(
        Destination::TrustCenter,
        Request::RequestLinkKey { partner },
        ctx.config.response_timeout,
    );
    Transition::Stay
}

pub(crate) fn on_key_response(ctx: &mut Ctx<'_>, response: Response) -> Transition {
    let Some(active) = ctx.session.registry.active().and_then(|c| c.extended_address) else {
        return Transition::Stay;
    };
    match response {
        Response::LinkKey {
            partner,
            established: true,
        } if partner == active => {
            ctx.settle();
            ctx.session.key_established = Some(partner);
            advance(ctx)
        }
        Response::LinkKey {
            partner,
            established: false,
        } if partner == active => retry(ClientPhase::EstablishingKey, ctx),
        _ => Transition::Stay,
    }
}

/// No key could be obtained: the server is refused for the rest of the cycle.
pub(crate) fn key_exhausted(ctx: &mut Ctx<'_>) -> Transition {
    ctx.session.registry.blacklist_active();
    next_candidate(ctx)
}

/// Give up on the active candidate.
pub(crate) fn drop_candidate(ctx: &mut Ctx<'_>) -> Transition {
    if let Some(candidate) = ctx.session.registry.take_active() {
        debug!(address = %candidate.short_address, "Candidate dropped");
    }
    next_candidate(ctx)
}

/// Pick the next resolution step for the active candidate.
fn advance(ctx: &mut Ctx<'_>) -> Transition {
    let Some(active) = ctx.session.registry.active().copied() else {
        return next_candidate(ctx);
    };
    let Some(extended) = active.extended_address else {
        return Transition::Enter(ClientPhase::ResolvingIdentity);
    };
    if active.endpoint.is_none() {
        return Transition::Enter(ClientPhase::ResolvingEndpoint);
    }
    let keyed = ctx.session.key_established == Some(extended)
        || ctx.adapters.transport.has_link_key(extended);
    if ctx.config.require_link_key && !keyed {
        return Transition::Enter(ClientPhase::EstablishingKey);
    }

    // A pending announcement redirects before negotiation starts.
    if !ctx.session.registry.has_priority() {
        if let Some(identity) = active.identity() {
            info!(server = %identity, "Upgrade server found");
            ctx.notify(ClientNotification::ServerFound(identity));
        }
    }
    Transition::Enter(ClientPhase::Negotiating)
}

/// An unsolicited image announcement arrived.
pub(crate) fn on_image_notify(
    phase: ClientPhase,
    ctx: &mut Ctx<'_>,
    source: ShortAddress,
    endpoint: Endpoint,
    notify: ImageNotify,
) -> Transition {
    if !notify.concerns(&ctx.config.own_key()) {
        debug!(%source, "Announcement does not concern this device");
        return Transition::Stay;
    }
    let draw: u8 = ctx.rng.random_range(1..=100);
    if draw > notify.query_jitter {
        debug!(%source, draw, jitter = notify.query_jitter, "Announcement skipped by jitter");
        return Transition::Stay;
    }

    let candidate = ServerCandidate::new(source).with_endpoint(Some(endpoint));
    match phase {
        ClientPhase::Stopped | ClientPhase::Negotiating => {
            debug!(%source, %phase, "Announcement ignored");
            Transition::Stay
        }
        p if p.is_download() => {
            debug!(%source, "Announcement ignored during download");
            Transition::Stay
        }
        ClientPhase::AwaitingDiscoveryWindow => {
            info!(%source, "Server announced, starting discovery");
            ctx.disarm();
            ctx.session.registry.begin_cycle();
            ctx.session.registry.prioritize(candidate);
            ctx.session.registry.promote_next();
            Transition::Enter(ClientPhase::ResolvingIdentity)
        }
        _ => {
            if ctx.session.registry.prioritize(candidate) {
                info!(%source, "Server announced, queued with priority");
            }
            Transition::Stay
        }
    }
}

fn unicast(address: ShortAddress, endpoint: Option<Endpoint>) -> Destination {
    Destination::Unicast { address, endpoint }
}
