//! Drives an [`OtaClient`] through a [`SimWorld`].

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use meshota_client::adapters::{Adapters, RecoveryStore};
use meshota_client::error::OtaResult;
use meshota_client::event::{ClientEvent, ClientNotification};
use meshota_client::{ClientConfig, ClientPhase, OtaClient};

use crate::sim::{SharedWorld, SimRecovery, SimSettings, SimStorage, SimTimer, SimTransport, SimWorld};

type RecoveryFactory = Box<dyn Fn() -> Box<dyn RecoveryStore>>;

/// A client wired to a simulated world.
pub struct Harness {
    world: SharedWorld,
    config: ClientConfig,
    client: OtaClient,
    notifications: Rc<RefCell<Vec<ClientNotification>>>,
    recovery: Option<RecoveryFactory>,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl Harness {
    /// Build a stopped client over `world`.
    ///
    /// The configured known server seeds the world's settings unless they
    /// already hold one.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ClientConfig, world: SimWorld) -> OtaResult<Self> {
        Self::build(config, world, None)
    }

    /// Like [`Harness::new`], persisting checkpoints through stores built by
    /// `recovery` instead of the world.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_recovery(
        config: ClientConfig,
        world: SimWorld,
        recovery: impl Fn() -> Box<dyn RecoveryStore> + 'static,
    ) -> OtaResult<Self> {
        Self::build(config, world, Some(Box::new(recovery)))
    }

    fn build(config: ClientConfig, mut world: SimWorld, recovery: Option<RecoveryFactory>) -> OtaResult<Self> {
        if world.settings.is_none() {
            world.settings = config.known_server;
        }
        let world = Rc::new(RefCell::new(world));
        let notifications = Rc::new(RefCell::new(Vec::new()));
        let client = Self::client_over(&config, &world, &notifications, recovery.as_ref())?;
        Ok(Self {
            world,
            config,
            client,
            notifications,
            recovery,
        })
    }

    fn client_over(
        config: &ClientConfig,
        world: &SharedWorld,
        notifications: &Rc<RefCell<Vec<ClientNotification>>>,
        recovery: Option<&RecoveryFactory>,
    ) -> OtaResult<OtaClient> {
        let adapters = Adapters {
            transport: Box::new(SimTransport(world.clone())),
            storage: Box::new(SimStorage(world.clone())),
            recovery: match recovery {
                Some(factory) => factory(),
                None => Box::new(SimRecovery(world.clone())),
            },
            settings: Box::new(SimSettings(world.clone())),
            timer: Box::new(SimTimer(world.clone())),
        };
        let mut client = OtaClient::new(config.clone(), adapters)?;
        let sink = notifications.clone();
        client.on_notification(move |n| sink.borrow_mut().push(n.clone()));
        Ok(client)
    }

    /// The client.
    pub fn client(&self) -> &OtaClient {
        &self.client
    }

    /// Current client phase.
    pub fn phase(&self) -> ClientPhase {
        self.client.phase()
    }

    /// Shared world.
    pub fn world(&self) -> std::cell::Ref<'_, SimWorld> {
        self.world.borrow()
    }

    /// Mutable access to the world between steps.
    pub fn world_mut(&self) -> std::cell::RefMut<'_, SimWorld> {
        self.world.borrow_mut()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.world.borrow().now
    }

    /// Notifications received so far.
    pub fn notifications(&self) -> Vec<ClientNotification> {
        self.notifications.borrow().clone()
    }

    /// Whether any notification matches `pred`.
    pub fn notified(&self, pred: impl Fn(&ClientNotification) -> bool) -> bool {
        self.notifications.borrow().iter().any(pred)
    }

    /// Deliver an event immediately.
    pub fn handle(&mut self, event: ClientEvent) {
        self.client.handle(event);
    }

    /// Start the client.
    pub fn start(&mut self) {
        self.handle(ClientEvent::Start);
    }

    /// Stop the client.
    pub fn stop(&mut self) {
        self.handle(ClientEvent::Stop);
    }

    /// Deliver the next due event. Returns `false` when nothing is queued.
    pub fn step(&mut self) -> bool {
        let event = self.world.borrow_mut().pop();
        match event {
            Some(event) => {
                self.client.handle(event);
                true
            }
            None => false,
        }
    }

    /// Step until `pred` holds, for at most `max_steps` events.
    pub fn run_until(&mut self, max_steps: usize, mut pred: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..max_steps {
            if pred(self) {
                return true;
            }
            if !self.step() {
                break;
            }
        }
        pred(self)
    }

    /// Step until a download finished.
    pub fn run_until_finished(&mut self, max_steps: usize) -> bool {
        self.run_until(max_steps, |h| {
            h.notified(|n| matches!(n, ClientNotification::DownloadFinished { .. }))
        })
    }

    /// Deliver every event due within `span` of virtual time.
    pub fn run_for(&mut self, span: Duration) {
        let until = self.now() + span;
        loop {
            let due = self.world.borrow().next_due();
            match due {
                Some(due) if due <= until => {
                    self.step();
                }
                _ => break,
            }
        }
        let mut world = self.world.borrow_mut();
        world.now = world.now.max(until);
    }

    /// Simulate a power loss: everything in flight is lost, persistent state
    /// (flash, checkpoint, settings) survives, and a fresh client is built.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be rebuilt.
    pub fn reset(&mut self) -> OtaResult<()> {
        debug!(now = ?self.now(), phase = %self.client.phase(), "Simulated power loss");
        self.world.borrow_mut().power_loss();
        self.client = Self::client_over(
            &self.config,
            &self.world,
            &self.notifications,
            self.recovery.as_ref(),
        )?;
        Ok(())
    }
}
