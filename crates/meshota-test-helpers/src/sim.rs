//! Deterministic simulation of everything around the client.
//!
//! A [`SimWorld`] holds a virtual clock, an event queue ordered by due time,
//! a set of upgrade servers, a dual-slot flash device and the persistent
//! stores. The adapter types at the bottom of this module implement the
//! client's collaborator traits over a shared world; every answer they
//! produce is queued as a [`ClientEvent`] for later delivery.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;

use meshota_client::adapters::{
    Checkpoint, ImageStorage, RecoveryStore, SettingsStore, StorageCompletion, StorageOp,
    StorageOutcome, StorageTicket, TimerService, TimerToken, Transport,
};
use meshota_client::address::{Endpoint, ExtendedAddress, KnownServer, ShortAddress};
use meshota_client::error::{OtaResult, TransportError};
use meshota_client::event::ClientEvent;
use meshota_client::image::{ImageDescriptor, crc32, seal_image};
use meshota_client::protocol::{
    Destination, ImageBlockResponse, ImageNotify, NotifyPayload, QueryNextImageResponse, Request,
    Response, UpgradeEndResponse, UpgradeStatus,
};
use meshota_client::{ClientConfig, Slot};

/// A simulated upgrade server.
#[derive(Debug, Clone)]
pub struct SimServer {
    /// Network address.
    pub short: ShortAddress,
    /// IEEE address.
    pub extended: ExtendedAddress,
    /// Endpoint of the server cluster.
    pub endpoint: Endpoint,
    /// Offered image and its sealed bytes.
    pub image: Option<(ImageDescriptor, Vec<u8>)>,
    /// Whether queries from the client are served.
    pub authorized: bool,
    /// Whether the server answers broadcast searches.
    pub answers_locate: bool,
    /// Whether the locate answer names the endpoint.
    pub announces_endpoint: bool,
    /// Whether endpoint lookups succeed.
    pub has_endpoint: bool,
    /// Whether the node answers anything at all.
    pub online: bool,
    /// Number of upcoming requests addressed to this node to drop silently.
    pub drop_next: u32,
    /// Block offsets left unanswered, with how many more times.
    pub silent_at: BTreeMap<u32, u32>,
    /// Block offsets answered once with wait-for-data.
    pub not_ready_at: BTreeSet<u32>,
    /// Block offsets answered once with a server abort.
    pub abort_at: BTreeSet<u32>,
    /// Block offsets left out of page responses once.
    pub page_drops: BTreeSet<u32>,
    /// Serve a trailer that does not match the body.
    pub corrupt_trailer: bool,
    /// Whether upgrade-end reports are acknowledged.
    pub acknowledges_end: bool,
    /// Upgrade time offset returned in the acknowledgement, in seconds.
    pub upgrade_after_secs: u32,
    /// Upgrade-end statuses received.
    pub ends: Vec<UpgradeStatus>,
}

impl SimServer {
    /// A reachable, authorized server with nothing to offer.
    pub fn new(short: u16, extended: u64) -> Self {
        Self {
            short: ShortAddress(short),
            extended: ExtendedAddress(extended),
            endpoint: Endpoint(1),
            image: None,
            authorized: true,
            answers_locate: true,
            announces_endpoint: false,
            has_endpoint: true,
            online: true,
            drop_next: 0,
            silent_at: BTreeMap::new(),
            not_ready_at: BTreeSet::new(),
            abort_at: BTreeSet::new(),
            page_drops: BTreeSet::new(),
            corrupt_trailer: false,
            acknowledges_end: true,
            upgrade_after_secs: 0,
            ends: Vec::new(),
        }
    }

    /// Offer `body` as firmware `version` of the default product.
    #[must_use]
    pub fn serving(self, version: u32, body: &[u8]) -> Self {
        let config = ClientConfig::default();
        let sealed = seal_image(body);
        let image = crate::fixtures::descriptor_for(&config, version, &sealed);
        self.serving_image(image, sealed)
    }

    /// Offer an arbitrary image.
    #[must_use]
    pub fn serving_image(mut self, image: ImageDescriptor, sealed: Vec<u8>) -> Self {
        self.image = Some((image, sealed));
        self
    }

    /// Offered image descriptor.
    pub fn descriptor(&self) -> Option<ImageDescriptor> {
        self.image.as_ref().map(|(image, _)| *image)
    }

    fn block(&self, offset: u32, max: u8) -> Option<Vec<u8>> {
        let (image, bytes) = self.image.as_ref()?;
        let start = usize::try_from(offset).ok()?;
        let end = (start + usize::from(max)).min(bytes.len());
        let mut data = bytes.get(start..end)?.to_vec();
        if self.corrupt_trailer {
            let body = usize::try_from(image.body_len()).ok()?;
            for (i, byte) in data.iter_mut().enumerate() {
                if start + i >= body {
                    *byte ^= 0xFF;
                }
            }
        }
        Some(data)
    }
}

/// A simulated dual-slot flash device.
#[derive(Debug, Clone)]
pub struct SimFlash {
    /// Slot contents.
    pub slots: [Vec<u8>; 2],
    /// Slot booted from.
    pub active: Slot,
    /// Number of upcoming operations answered with busy.
    pub busy_next: u32,
    /// Next operation of this kind fails.
    pub fail_next: Option<StorageOp>,
    /// Flip a bit in every written chunk.
    pub corrupt_writes: bool,
    /// Operations started, busy ones included.
    pub log: Vec<StorageOp>,
    /// Time an operation takes to complete.
    pub latency: Duration,
}

impl Default for SimFlash {
    fn default() -> Self {
        Self {
            slots: [Vec::new(), Vec::new()],
            active: Slot::A,
            busy_next: 0,
            fail_next: None,
            corrupt_writes: false,
            log: Vec::new(),
            latency: Duration::from_millis(2),
        }
    }
}

impl SimFlash {
    /// Contents of `slot`.
    pub fn contents(&self, slot: Slot) -> &[u8] {
        &self.slots[slot.index()]
    }

    /// Number of started operations of kind `op`.
    pub fn count(&self, op: StorageOp) -> usize {
        self.log.iter().filter(|&&o| o == op).count()
    }

    fn prefix(&self, slot: Slot, len: u32) -> Vec<u8> {
        let mut bytes = self.slots[slot.index()].clone();
        bytes.resize(len as usize, 0xFF);
        bytes
    }

    fn run(&mut self, op: StorageOp, apply: impl FnOnce(&mut Self) -> StorageOutcome) -> StorageOutcome {
        self.log.push(op);
        if self.busy_next > 0 {
            self.busy_next -= 1;
            return StorageOutcome::Busy;
        }
        if self.fail_next == Some(op) {
            self.fail_next = None;
            return StorageOutcome::Failed;
        }
        apply(self)
    }
}

/// Simulated network, flash, persistence and clock.
#[derive(Debug, Default)]
pub struct SimWorld {
    /// Virtual time.
    pub now: Duration,
    seq: u64,
    queue: BTreeMap<(Duration, u64), ClientEvent>,
    timers: BTreeMap<TimerToken, (Duration, u64)>,
    /// Upgrade servers.
    pub servers: Vec<SimServer>,
    /// Image flash.
    pub flash: SimFlash,
    /// Persisted checkpoint.
    pub checkpoint: Option<Checkpoint>,
    /// Number of checkpoint saves.
    pub checkpoint_saves: usize,
    /// Persisted known server.
    pub settings: Option<KnownServer>,
    /// Every request the client sent, with its send time.
    pub sent: Vec<(Duration, Destination, Request)>,
    /// Installed link keys.
    pub link_keys: BTreeSet<ExtendedAddress>,
    /// Whether the trust center hands out keys.
    pub grant_keys: bool,
    /// One-way network latency.
    pub latency: Duration,
    /// Whether a broadcast search ends with an explicit completion.
    pub locate_completes: bool,
    /// Error returned by every send, when set.
    pub send_error: Option<TransportError>,
    /// Requests lost in the network, by request name, with how many more.
    pub lose_requests: BTreeMap<&'static str, u32>,
}

impl SimWorld {
    /// An empty world with a trust center that grants keys.
    pub fn new() -> Self {
        Self {
            grant_keys: true,
            latency: Duration::from_millis(5),
            locate_completes: true,
            ..Self::default()
        }
    }

    /// Add a server.
    #[must_use]
    pub fn with_server(mut self, server: SimServer) -> Self {
        self.servers.push(server);
        self
    }

    /// Server with IEEE address `extended`.
    pub fn server(&self, extended: u64) -> Option<&SimServer> {
        self.servers.iter().find(|s| s.extended.0 == extended)
    }

    /// Mutable server with IEEE address `extended`.
    pub fn server_mut(&mut self, extended: u64) -> Option<&mut SimServer> {
        self.servers.iter_mut().find(|s| s.extended.0 == extended)
    }

    /// Number of sent requests matching `pred`.
    pub fn sent_count(&self, pred: impl Fn(&Request) -> bool) -> usize {
        self.sent.iter().filter(|(_, _, r)| pred(r)).count()
    }

    /// Offsets of every block request, in send order.
    pub fn block_offsets(&self) -> Vec<u32> {
        self.sent
            .iter()
            .filter_map(|(_, _, r)| match r {
                Request::ImageBlock(b) => Some(b.offset),
                Request::ImagePage(p) => Some(p.offset),
                _ => None,
            })
            .collect()
    }

    /// Queue `event` for delivery after `delay`.
    pub fn schedule(&mut self, delay: Duration, event: ClientEvent) -> (Duration, u64) {
        self.seq += 1;
        let key = (self.now + delay, self.seq);
        self.queue.insert(key, event);
        key
    }

    /// Queue an image announcement from the server with IEEE address `extended`.
    pub fn announce(&mut self, extended: u64, notify: ImageNotify) {
        let Some(server) = self.server(extended) else {
            return;
        };
        let event = ClientEvent::ImageNotify {
            source: server.short,
            endpoint: server.endpoint,
            notify,
        };
        let latency = self.latency;
        self.schedule(latency, event);
    }

    /// Announcement of a new version, always acted on.
    pub fn new_version_notify(&self, extended: u64) -> Option<ImageNotify> {
        let image = self.server(extended)?.descriptor()?;
        Some(ImageNotify {
            query_jitter: 100,
            payload: NotifyPayload::NewVersion { key: image.key() },
        })
    }

    /// Remove and return the next due event, advancing the clock.
    pub fn pop(&mut self) -> Option<ClientEvent> {
        let (&key, _) = self.queue.iter().next()?;
        let event = self.queue.remove(&key)?;
        self.now = self.now.max(key.0);
        if let ClientEvent::TimerFired(token) = &event {
            self.timers.remove(token);
        }
        Some(event)
    }

    /// Due time of the next event.
    pub fn next_due(&self) -> Option<Duration> {
        self.queue.keys().next().map(|k| k.0)
    }

    /// Drop everything in flight, as a power loss would.
    pub fn power_loss(&mut self) {
        self.queue.clear();
        self.timers.clear();
    }

    fn respond(&mut self, source: ShortAddress, delay: Duration, response: Response) {
        self.schedule(delay, ClientEvent::Response { source, response });
    }

    fn complete(&mut self, ticket: StorageTicket, outcome: StorageOutcome) {
        let latency = self.flash.latency;
        self.schedule(
            latency,
            ClientEvent::StorageDone(StorageCompletion { ticket, outcome }),
        );
    }

    fn deliver(&mut self, destination: Destination, request: Request) {
        if let Some(left) = self.lose_requests.get_mut(request.name()) {
            if *left > 0 {
                *left -= 1;
                return;
            }
        }
        let latency = self.latency;
        let round_trip = latency * 2;
        match (destination, request) {
            (Destination::Broadcast, Request::Locate { .. }) => {
                let answers: Vec<_> = self
                    .servers
                    .iter()
                    .filter(|s| s.online && s.answers_locate)
                    .map(|s| (s.short, s.announces_endpoint.then_some(s.endpoint)))
                    .collect();
                for (short, endpoint) in answers {
                    self.respond(short, round_trip, Response::LocateCandidate { short, endpoint });
                }
                if self.locate_completes {
                    self.respond(ShortAddress::TRUST_CENTER, round_trip * 2, Response::LocateComplete);
                }
            }
            (Destination::Broadcast, Request::ResolveShortAddress { extended }) => {
                if let Some(server) = self.answering(|s| s.extended == extended) {
                    let short = server.short;
                    self.respond(short, round_trip, Response::AddressResolved { short, extended });
                }
            }
            (Destination::Unicast { address, .. }, request) => self.unicast(address, request),
            (Destination::TrustCenter, Request::RequestLinkKey { partner }) => {
                let established = self.grant_keys;
                if established {
                    self.link_keys.insert(partner);
                }
                self.respond(
                    ShortAddress::TRUST_CENTER,
                    round_trip,
                    Response::LinkKey {
                        partner,
                        established,
                    },
                );
            }
            _ => {}
        }
    }

    fn unicast(&mut self, address: ShortAddress, request: Request) {
        let now_secs = u32::try_from(self.now.as_secs()).unwrap_or(u32::MAX);
        let latency = self.latency;
        let round_trip = latency * 2;
        let Some(server) = self.answering(|s| s.short == address) else {
            return;
        };
        let short = server.short;

        let response = match request {
            Request::ResolveExtendedAddress { .. } => Response::AddressResolved {
                short,
                extended: server.extended,
            },
            Request::ResolveEndpoint { .. } => {
                if server.has_endpoint {
                    Response::EndpointResolved {
                        short,
                        endpoint: server.endpoint,
                    }
                } else {
                    Response::EndpointNotFound { short }
                }
            }
            Request::QueryNextImage(_) => Response::QueryNextImage(if !server.authorized {
                QueryNextImageResponse::refuse(UpgradeStatus::NotAuthorized)
            } else {
                match server.descriptor() {
                    Some(image) => QueryNextImageResponse::offer(image),
                    None => QueryNextImageResponse::refuse(UpgradeStatus::NoImageAvailable),
                }
            }),
            Request::ImageBlock(block) => {
                if let Some(left) = server.silent_at.get_mut(&block.offset) {
                    if *left > 0 {
                        *left -= 1;
                        return;
                    }
                }
                if server.not_ready_at.remove(&block.offset) {
                    Response::ImageBlock(ImageBlockResponse::WaitForData {
                        current_time: now_secs,
                        request_time: now_secs,
                        minimum_block_delay_ms: 250,
                    })
                } else if server.abort_at.remove(&block.offset) {
                    Response::ImageBlock(ImageBlockResponse::Abort)
                } else {
                    match server.block(block.offset, block.max_data_size) {
                        Some(data) => Response::ImageBlock(ImageBlockResponse::Success {
                            key: block.key,
                            offset: block.offset,
                            data,
                        }),
                        None => Response::Default {
                            status: UpgradeStatus::MalformedCommand,
                        },
                    }
                }
            }
            Request::ImagePage(page) => {
                let spacing = Duration::from_millis(u64::from(page.response_spacing_ms));
                let step = u32::from(page.max_data_size.max(1));
                let end = page.offset + u32::from(page.page_size);
                let mut blocks = Vec::new();
                let mut offset = page.offset;
                while offset < end {
                    let len = step.min(end - offset) as u8;
                    if !server.page_drops.remove(&offset) {
                        if let Some(data) = server.block(offset, len) {
                            blocks.push((offset, data));
                        }
                    }
                    offset += step;
                }
                let key = page.key;
                let mut delay = round_trip;
                for (offset, data) in blocks {
                    self.respond(
                        short,
                        delay,
                        Response::ImageBlock(ImageBlockResponse::Success { key, offset, data }),
                    );
                    delay += spacing;
                }
                return;
            }
            Request::UpgradeEnd(end) => {
                server.ends.push(end.status);
                if end.status != UpgradeStatus::Success || !server.acknowledges_end {
                    return;
                }
                Response::UpgradeEnd(UpgradeEndResponse {
                    key: end.key,
                    current_time: now_secs,
                    upgrade_time: now_secs.saturating_add(server.upgrade_after_secs),
                })
            }
            _ => return,
        };
        self.respond(short, round_trip, response);
    }

    /// Server matching `pred` that is online and not dropping this request.
    fn answering(&mut self, pred: impl Fn(&SimServer) -> bool) -> Option<&mut SimServer> {
        let server = self.servers.iter_mut().find(|s| pred(s))?;
        (server.online && take_drop(server)).then_some(server)
    }
}

fn take_drop(server: &mut SimServer) -> bool {
    if server.drop_next > 0 {
        server.drop_next -= 1;
        return false;
    }
    true
}

/// Shared handle on a world.
pub type SharedWorld = Rc<RefCell<SimWorld>>;

/// [`Transport`] over a simulated network.
#[derive(Debug, Clone)]
pub struct SimTransport(pub SharedWorld);

impl Transport for SimTransport {
    fn send(&mut self, destination: Destination, request: Request) -> Result<(), TransportError> {
        let mut world = self.0.borrow_mut();
        let now = world.now;
        world.sent.push((now, destination, request.clone()));
        if let Some(error) = world.send_error {
            return Err(error);
        }
        world.deliver(destination, request);
        Ok(())
    }

    fn has_link_key(&self, partner: ExtendedAddress) -> bool {
        self.0.borrow().link_keys.contains(&partner)
    }
}

/// [`ImageStorage`] over a simulated flash device.
#[derive(Debug, Clone)]
pub struct SimStorage(pub SharedWorld);

impl SimStorage {
    fn op(&self, ticket: StorageTicket, op: StorageOp, apply: impl FnOnce(&mut SimFlash) -> StorageOutcome) {
        let mut world = self.0.borrow_mut();
        let outcome = world.flash.run(op, apply);
        world.complete(ticket, outcome);
    }
}

impl ImageStorage for SimStorage {
    fn init(&mut self, ticket: StorageTicket) {
        self.op(ticket, StorageOp::Init, |_| StorageOutcome::Done);
    }

    fn erase_slot(&mut self, ticket: StorageTicket, slot: Slot, len: u32) {
        self.op(ticket, StorageOp::Erase, |flash| {
            flash.slots[slot.index()] = vec![0xFF; len as usize];
            StorageOutcome::Done
        });
    }

    fn write_chunk(&mut self, ticket: StorageTicket, slot: Slot, offset: u32, bytes: &[u8]) {
        self.op(ticket, StorageOp::Write, |flash| {
            let corrupt = flash.corrupt_writes;
            let contents = &mut flash.slots[slot.index()];
            let start = offset as usize;
            let end = start + bytes.len();
            if contents.len() < end {
                contents.resize(end, 0xFF);
            }
            contents[start..end].copy_from_slice(bytes);
            if corrupt && !bytes.is_empty() {
                contents[start] ^= 0x01;
            }
            StorageOutcome::Done
        });
    }

    fn checksum(&mut self, ticket: StorageTicket, slot: Slot, len: u32) {
        self.op(ticket, StorageOp::Checksum, |flash| {
            StorageOutcome::Checksum(crc32(&flash.prefix(slot, len)))
        });
    }

    fn verify_checksum(&mut self, ticket: StorageTicket, slot: Slot, len: u32, expected: u32) {
        self.op(ticket, StorageOp::Verify, |flash| {
            if crc32(&flash.prefix(slot, len)) == expected {
                StorageOutcome::Done
            } else {
                StorageOutcome::Mismatch
            }
        });
    }

    fn switch_active(&mut self, ticket: StorageTicket, from: Slot, to: Slot) {
        self.op(ticket, StorageOp::Switch, |flash| {
            if flash.active != from {
                return StorageOutcome::Failed;
            }
            flash.active = to;
            StorageOutcome::Done
        });
    }

    fn active_slot(&self) -> Slot {
        self.0.borrow().flash.active
    }
}

/// [`RecoveryStore`] persisted in the world.
#[derive(Debug, Clone)]
pub struct SimRecovery(pub SharedWorld);

impl RecoveryStore for SimRecovery {
    fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> OtaResult<()> {
        let mut world = self.0.borrow_mut();
        world.checkpoint = Some(*checkpoint);
        world.checkpoint_saves += 1;
        Ok(())
    }

    fn load_checkpoint(&self) -> OtaResult<Option<Checkpoint>> {
        Ok(self.0.borrow().checkpoint)
    }

    fn clear_checkpoint(&mut self) -> OtaResult<()> {
        self.0.borrow_mut().checkpoint = None;
        Ok(())
    }
}

/// [`SettingsStore`] persisted in the world.
#[derive(Debug, Clone)]
pub struct SimSettings(pub SharedWorld);

impl SettingsStore for SimSettings {
    fn known_server(&self) -> Option<KnownServer> {
        self.0.borrow().settings
    }

    fn store_known_server(&mut self, server: Option<KnownServer>) {
        self.0.borrow_mut().settings = server;
    }
}

/// [`TimerService`] on the world's virtual clock.
#[derive(Debug, Clone)]
pub struct SimTimer(pub SharedWorld);

impl TimerService for SimTimer {
    fn arm(&mut self, token: TimerToken, after: Duration) {
        let mut world = self.0.borrow_mut();
        let key = world.schedule(after, ClientEvent::TimerFired(token));
        world.timers.insert(token, key);
    }

    fn disarm(&mut self, token: TimerToken) {
        let mut world = self.0.borrow_mut();
        if let Some(key) = world.timers.remove(&token) {
            world.queue.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_pop_in_due_order() {
        let mut world = SimWorld::new();
        world.schedule(Duration::from_millis(30), ClientEvent::Stop);
        world.schedule(Duration::from_millis(10), ClientEvent::Start);
        assert_eq!(world.pop(), Some(ClientEvent::Start));
        assert_eq!(world.now, Duration::from_millis(10));
        assert_eq!(world.pop(), Some(ClientEvent::Stop));
        assert_eq!(world.pop(), None);
    }

    #[test]
    fn test_disarmed_timer_never_fires() {
        let world = Rc::new(RefCell::new(SimWorld::new()));
        let mut timer = SimTimer(world.clone());
        timer.arm(TimerToken(1), Duration::from_secs(1));
        timer.disarm(TimerToken(1));
        assert_eq!(world.borrow_mut().pop(), None);
    }

    #[test]
    fn test_busy_flash_does_nothing() {
        let world = Rc::new(RefCell::new(SimWorld::new()));
        world.borrow_mut().flash.busy_next = 1;
        let mut storage = SimStorage(world.clone());
        storage.erase_slot(StorageTicket(1), Slot::B, 16);
        assert!(world.borrow().flash.contents(Slot::B).is_empty());
        storage.erase_slot(StorageTicket(2), Slot::B, 16);
        assert_eq!(world.borrow().flash.contents(Slot::B), &[0xFF; 16]);
    }
}
