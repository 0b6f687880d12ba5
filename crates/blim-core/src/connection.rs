//! Connection state machine.
//!
//! A [`Connection`] owns one link to a peripheral, the topology discovered
//! over it, the cancellation scope bounding every dependent task, and the
//! subscription workers. It can be reused across connect cycles:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//! ```
//!
//! The state lock is only held to check and snapshot; dialing, discovery
//! and remote (un)subscribe calls run without it.
//!
//! Teardown always runs in this order: cancel the connection scope and the
//! subscription workers, wait for the workers to exit, unsubscribe remotely,
//! drain and close pipelines, release the session.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use blim_types::uuid::{normalize_uuid, uuid_key};
use blim_types::{Record, StreamMode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::adapter::{
    DiscoveredCharacteristic, DiscoveredDescriptor, DiscoveredService, GattAdapter, GattSession,
    NotificationHandler,
};
use crate::config::{ConnectOptions, ConnectionConfig};
use crate::error::{DescriptorError, Error, ResourceKind, Result};
use crate::events::{ConnectionEvent, EventDispatcher, EventReceiver};
use crate::gatt::{Characteristic, Descriptor, Link, Service};
use crate::pipeline::NotificationPipeline;
use crate::pool::{PoolStats, ValuePool};
use crate::scope::{CancelCause, CancelScope};
use crate::subscription::{Subscription, SubscriptionId, SubscriptionManager};
use crate::validation::{SubscribeTarget, Validated, validate_targets};

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

struct State {
    link: LinkState,
    address: Option<String>,
    services: BTreeMap<String, Service>,
    scope: CancelScope,
}

/// A (re)usable connection to one peripheral.
pub struct Connection {
    adapter: Arc<dyn GattAdapter>,
    config: ConnectionConfig,
    state: RwLock<State>,
    link: Arc<Link>,
    pool: Arc<ValuePool>,
    subscriptions: SubscriptionManager,
    events: EventDispatcher,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("Connection")
            .field("state", &state.link)
            .field("address", &state.address)
            .field("services", &state.services.len())
            .finish()
    }
}

/// Descriptors read for characteristics seen for the first time.
type FreshDescriptors = HashMap<(String, String), Vec<Descriptor>>;

/// Topology built from one discovery. Nothing in it is visible through the
/// connection until [`StagedTopology::commit`] runs at the state flip.
struct StagedTopology {
    services: BTreeMap<String, Service>,
    /// New handles for characteristics carried over from an earlier cycle.
    handles: HashMap<(String, String), DiscoveredCharacteristic>,
    characteristics: usize,
}

impl StagedTopology {
    /// Handle a characteristic will use on the new session.
    fn handle(
        &self,
        key: &(String, String),
        characteristic: &Characteristic,
    ) -> Option<DiscoveredCharacteristic> {
        self.handles
            .get(key)
            .cloned()
            .or_else(|| characteristic.handle())
    }

    /// Refresh reused characteristics, reopen their pipelines and record
    /// which ones have notifications enabled on the new session.
    fn commit(
        self,
        enabled: &HashSet<(String, String)>,
        capacity: usize,
    ) -> BTreeMap<String, Service> {
        let mut handles = self.handles;
        for service in self.services.values() {
            for characteristic in service.characteristics() {
                let key = (service.uuid().to_string(), characteristic.uuid().to_string());
                if let Some(handle) = handles.remove(&key) {
                    characteristic.refresh_handle(handle);
                }
                let pipeline = characteristic.pipeline();
                if pipeline.is_closed()
                    && let Err(err) = pipeline.reset(capacity)
                {
                    warn!(uuid = characteristic.uuid(), error = %err, "failed to reopen pipeline");
                }
                characteristic.set_notifying(enabled.contains(&key));
            }
        }
        self.services
    }
}

impl Connection {
    /// Create a disconnected connection with the default configuration.
    pub fn new(adapter: Arc<dyn GattAdapter>) -> Self {
        Self::build(adapter, ConnectionConfig::default())
    }

    /// Create a disconnected connection with a custom configuration.
    pub fn with_config(adapter: Arc<dyn GattAdapter>, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(adapter, config))
    }

    fn build(adapter: Arc<dyn GattAdapter>, config: ConnectionConfig) -> Self {
        Self {
            adapter,
            config,
            state: RwLock::new(State {
                link: LinkState::Disconnected,
                address: None,
                services: BTreeMap::new(),
                scope: CancelScope::new(),
            }),
            link: Arc::new(Link::new()),
            pool: Arc::new(ValuePool::new()),
            subscriptions: SubscriptionManager::new(),
            events: EventDispatcher::default(),
            monitor: Mutex::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        self.read().link
    }

    /// Address of the current (or last) peer.
    pub fn address(&self) -> Option<String> {
        self.read().address.clone()
    }

    /// Connected and the link has not been lost.
    pub fn is_connected(&self) -> bool {
        let state = self.read();
        state.link == LinkState::Connected && !state.scope.is_cancelled()
    }

    /// Scope of the current connect cycle. Cancelled on disconnect, and with
    /// a not-connected cause when the link drops on its own.
    pub fn connection_scope(&self) -> CancelScope {
        self.read().scope.clone()
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Discovered services ordered by UUID.
    pub fn services(&self) -> Vec<Service> {
        self.read().services.values().cloned().collect()
    }

    /// Look up a service by UUID (any spelling).
    pub fn service(&self, uuid: &str) -> Result<Service> {
        self.read()
            .services
            .get(&normalize_uuid(uuid))
            .cloned()
            .ok_or_else(|| Error::service_not_found(uuid))
    }

    /// Look up a characteristic by service and characteristic UUID.
    pub fn characteristic(
        &self,
        service: &str,
        characteristic: &str,
    ) -> Result<Arc<Characteristic>> {
        self.service(service)?.characteristic(characteristic)
    }

    /// Find a characteristic by UUID in whichever service holds it.
    pub fn find_characteristic(&self, uuid: &str) -> Result<Arc<Characteristic>> {
        let key = normalize_uuid(uuid);
        self.read()
            .services
            .values()
            .find_map(|service| service.characteristic_map().get(&key).cloned())
            .ok_or_else(|| Error::NotFound {
                resource: ResourceKind::Characteristic,
                uuids: vec![uuid.to_string()],
            })
    }

    fn all_characteristics(&self) -> Vec<Arc<Characteristic>> {
        self.read()
            .services
            .values()
            .flat_map(|service| service.characteristics().cloned())
            .collect()
    }

    /// Connect to `address`, discover its profile and enable the requested
    /// notifications.
    ///
    /// On reconnect, characteristics are matched by UUID: their live handle
    /// is refreshed and closed pipelines are reset, so existing
    /// `Arc<Characteristic>`s stay valid. Any failure leaves the connection
    /// disconnected and retryable.
    ///
    /// # Errors
    ///
    /// - an already-connected [`Error::Connection`] unless disconnected
    /// - [`Error::Timeout`] if dialing exceeds `connect_timeout`
    /// - [`Error::Validation`] if a subscribe target does not check out
    /// - adapter errors from dialing, discovery or enabling notifications
    #[tracing::instrument(level = "debug", skip_all, fields(address = %address))]
    pub async fn connect(&self, address: &str, options: ConnectOptions) -> Result<()> {
        options.validate()?;
        {
            let mut state = self.write();
            if state.link != LinkState::Disconnected {
                return Err(Error::already_connected().context(format!("connect to {address}")));
            }
            state.link = LinkState::Connecting;
        }

        let result = self.establish(address, &options).await;
        if result.is_err() {
            self.write().link = LinkState::Disconnected;
        }
        result
    }

    async fn establish(&self, address: &str, options: &ConnectOptions) -> Result<()> {
        let session = timeout(options.connect_timeout, self.adapter.dial(address))
            .await
            .map_err(|_| Error::timeout(format!("connect {address}"), options.connect_timeout))??;
        debug!("link established");

        match self.bring_up(address, session.clone(), options).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Err(cancel_err) = session.cancel_connection().await {
                    warn!(error = %cancel_err, "failed to release session after connect failure");
                }
                Err(err)
            }
        }
    }

    async fn bring_up(
        &self,
        address: &str,
        session: Arc<dyn GattSession>,
        options: &ConnectOptions,
    ) -> Result<()> {
        let profile = session
            .discover_profile()
            .await
            .map_err(|e| e.context("service discovery"))?;

        let known: HashSet<(String, String)> = self
            .read()
            .services
            .values()
            .flat_map(|service| {
                service
                    .characteristics()
                    .map(|c| (service.uuid().to_string(), c.uuid().to_string()))
            })
            .collect();
        let fresh = self
            .read_descriptors(session.as_ref(), &profile, &known, options)
            .await;

        let staged = self.stage_topology(profile, fresh);
        let (services, characteristics) = (staged.services.len(), staged.characteristics);
        debug!(services, characteristics, "topology staged");

        let mut enabled = HashSet::new();
        if !options.subscribe_targets.is_empty() {
            let targets = validate_targets(&staged.services, &options.subscribe_targets, true)
                .map_err(|failure| {
                    Error::Validation(failure).context("connect subscribe targets")
                })?;
            for (key, characteristic) in &targets {
                let Some(handle) = staged.handle(key, characteristic) else {
                    continue;
                };
                subscribe_remote(session.as_ref(), characteristic, &handle).await?;
                enabled.insert(key.clone());
            }
        }

        let scope = CancelScope::new();
        {
            let mut state = self.write();
            state.services = staged.commit(&enabled, self.config.pipeline_capacity);
            state.link = LinkState::Connected;
            state.address = Some(address.to_string());
            state.scope = scope.clone();
        }
        self.link.set(Some(session.clone()));
        self.spawn_link_monitor(address, session.as_ref(), scope);

        info!(services, characteristics, "connected");
        self.events.send(ConnectionEvent::Connected {
            address: address.to_string(),
            services,
            characteristics,
        });
        Ok(())
    }

    /// Read descriptors of characteristics not seen in an earlier cycle.
    async fn read_descriptors(
        &self,
        session: &dyn GattSession,
        profile: &[DiscoveredService],
        known: &HashSet<(String, String)>,
        options: &ConnectOptions,
    ) -> FreshDescriptors {
        let mut fresh = FreshDescriptors::new();
        for service in profile {
            let service_key = uuid_key(&service.uuid);
            for characteristic in &service.characteristics {
                let key = (service_key.clone(), uuid_key(&characteristic.uuid));
                if known.contains(&key) {
                    continue;
                }
                let mut descriptors = Vec::with_capacity(characteristic.descriptors.len());
                for descriptor in &characteristic.descriptors {
                    let read_timeout = options.descriptor_read_timeout;
                    descriptors.push(read_descriptor(session, descriptor, read_timeout).await);
                }
                fresh.insert(key, descriptors);
            }
        }
        fresh
    }

    /// Match a discovered profile against the current topology without
    /// touching it. Characteristics already known by UUID keep their `Arc`.
    fn stage_topology(
        &self,
        profile: Vec<DiscoveredService>,
        mut fresh: FreshDescriptors,
    ) -> StagedTopology {
        let state = self.read();
        let mut staged = StagedTopology {
            services: BTreeMap::new(),
            handles: HashMap::new(),
            characteristics: 0,
        };

        for discovered in profile {
            let service_key = uuid_key(&discovered.uuid);
            let existing = state.services.get(&service_key);
            let mut characteristics = BTreeMap::new();

            for handle in discovered.characteristics {
                let key = uuid_key(&handle.uuid);
                let reused = existing.and_then(|s| s.characteristic_map().get(&key).cloned());
                let characteristic = match reused {
                    Some(characteristic) => {
                        staged.handles.insert((service_key.clone(), key.clone()), handle);
                        characteristic
                    }
                    None => {
                        let descriptors = fresh
                            .remove(&(service_key.clone(), key.clone()))
                            .unwrap_or_default();
                        Arc::new(self.new_characteristic(handle, descriptors))
                    }
                };
                characteristics.insert(key, characteristic);
            }

            staged.characteristics += characteristics.len();
            staged
                .services
                .insert(service_key.clone(), Service::new(service_key, characteristics));
        }
        staged
    }

    fn new_characteristic(
        &self,
        handle: DiscoveredCharacteristic,
        descriptors: Vec<Descriptor>,
    ) -> Characteristic {
        Characteristic::new(
            handle,
            descriptors,
            self.link.clone(),
            NotificationPipeline::new(self.config.pipeline_capacity, self.pool.clone()),
        )
        .with_default_timeouts(self.config.read_timeout, self.config.write_timeout)
    }

    fn spawn_link_monitor(&self, address: &str, session: &dyn GattSession, scope: CancelScope) {
        let lost = session.link_lost();
        let events = self.events.clone();
        let address = address.to_string();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                _ = lost.cancelled() => {
                    warn!(%address, "link lost");
                    let cause = CancelCause::link_lost(format!("link to {address} lost"));
                    scope.cancel_with_cause(cause);
                    events.send(ConnectionEvent::LinkLost {
                        address,
                        reason: "link lost".to_string(),
                    });
                }
            }
        });
        let previous = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Tear the connection down. Succeeds without doing anything when not
    /// connected.
    ///
    /// Remote unsubscribe failures are logged and never stop teardown.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn disconnect(&self) -> Result<()> {
        let (scope, address) = {
            let mut state = self.write();
            if state.link != LinkState::Connected {
                return Ok(());
            }
            state.link = LinkState::Disconnecting;
            (state.scope.clone(), state.address.clone().unwrap_or_default())
        };

        scope.cancel();
        let cancelled = self.subscriptions.cancel_all().await;
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }
        debug!(cancelled, "subscription workers stopped");

        let characteristics = self.all_characteristics();
        let session = self.link.session();
        if let Some(session) = &session
            && let Err(err) =
                unsubscribe_remote(session.as_ref(), &characteristics, "teardown unsubscribe").await
        {
            warn!(error = %err, "continuing teardown");
        }
        for characteristic in &characteristics {
            characteristic.set_notifying(false);
            characteristic.pipeline().drain_and_close();
        }

        self.link.set(None);
        if let Some(session) = session
            && let Err(err) = session.cancel_connection().await
        {
            warn!(error = %err, "failed to release session");
        }

        self.write().link = LinkState::Disconnected;
        info!(%address, "disconnected");
        self.events.send(ConnectionEvent::Disconnected { address });
        Ok(())
    }

    /// Snapshot what a connected-only operation needs.
    fn connected_snapshot(
        &self,
        targets: &[SubscribeTarget],
        require_notify: bool,
        what: &str,
    ) -> Result<(Validated, CancelScope)> {
        let state = self.read();
        if state.link != LinkState::Connected {
            return Err(Error::not_connected().context(what.to_string()));
        }
        if let Some(cause) = state.scope.cause() {
            return Err(cause.into_error().context(what.to_string()));
        }
        let validated = validate_targets(&state.services, targets, require_notify)
            .map_err(|failure| {
                Error::Validation(failure).context(format!("{what} validation failed"))
            })?;
        Ok((validated, state.scope.clone()))
    }

    /// `scope` still belongs to the live connect cycle.
    fn cycle_is_live(state: &State, scope: &CancelScope) -> bool {
        state.link == LinkState::Connected && !scope.is_cancelled()
    }

    /// Error for an operation whose connect cycle ended while it ran.
    fn cycle_ended(scope: &CancelScope, what: &str) -> Error {
        scope
            .cause()
            .map(CancelCause::into_error)
            .unwrap_or(Error::Cancelled)
            .context(what.to_string())
    }

    fn session(&self, what: &str) -> Result<Arc<dyn GattSession>> {
        self.link
            .session()
            .ok_or_else(|| Error::not_connected().context(what.to_string()))
    }

    /// Subscribe `callback` to the union of `targets`.
    ///
    /// All targets are validated before anything else happens; any problem
    /// fails the whole call. Remote notifications are enabled where needed
    /// and one worker is started. A `max_rate` of zero uses the configured
    /// batch period; it is ignored for [`StreamMode::EveryUpdate`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] for an empty target list
    /// - a not-connected [`Error::Connection`]
    /// - [`Error::Validation`] listing every missing or non-notifying target
    #[tracing::instrument(level = "debug", skip_all, fields(mode = %mode, targets = targets.len()))]
    pub async fn subscribe<F>(
        &self,
        targets: &[SubscribeTarget],
        mode: StreamMode,
        max_rate: Duration,
        callback: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(&Record) + Send + Sync + 'static,
    {
        if targets.is_empty() {
            return Err(Error::invalid_config("at least one subscribe target is required"));
        }
        let (validated, scope) = self.connected_snapshot(targets, true, "subscription")?;
        if validated.is_empty() {
            return Err(Error::invalid_config("no characteristics available to subscribe"));
        }

        let session = self.session("subscription")?;
        let enabled = enable_remote(session.as_ref(), validated.values()).await?;

        let characteristics: Vec<Arc<Characteristic>> = validated.into_values().collect();
        let count = characteristics.len();

        let period = match mode {
            StreamMode::EveryUpdate => self.config.every_update_tick,
            _ if max_rate.is_zero() => self.config.batch_period,
            _ => max_rate,
        };
        let id = self.subscriptions.next_id();
        // Start under the state lock so a concurrent disconnect either sees
        // the worker or makes this check fail.
        let started = {
            let state = self.read();
            if Self::cycle_is_live(&state, &scope) {
                self.subscriptions.start(Subscription {
                    id,
                    mode,
                    period,
                    characteristics,
                    scope: scope.child(),
                    callback: Arc::new(callback),
                });
                true
            } else {
                false
            }
        };
        if !started {
            rollback_remote(session.as_ref(), &enabled).await;
            return Err(Self::cycle_ended(&scope, "subscription"));
        }
        info!(%id, characteristics = count, ?period, "subscription started");
        Ok(id)
    }

    /// Stop one subscription's worker and wait for it to exit. Remote
    /// notifications stay enabled. Returns `false` for unknown ids.
    pub async fn cancel_subscription(&self, id: SubscriptionId) -> bool {
        self.subscriptions.cancel(id).await
    }

    /// Ids of subscriptions whose worker is still running.
    pub fn active_subscriptions(&self) -> Vec<SubscriptionId> {
        self.subscriptions.active()
    }

    /// Unsubscribe remotely.
    ///
    /// `None` stops every worker, disables every notification and drains the
    /// pipelines (which stay open). `Some(targets)` only disables
    /// notifications for the validated targets; use
    /// [`Connection::cancel_subscription`] to stop individual workers.
    ///
    /// # Errors
    ///
    /// - a not-connected [`Error::Connection`]
    /// - [`Error::Validation`] for unknown targets
    /// - [`Error::Aggregate`] listing per-characteristic failures
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn unsubscribe(&self, targets: Option<&[SubscribeTarget]>) -> Result<()> {
        match targets {
            Some(targets) => self.disable_notifications(targets).await,
            None => {
                self.connected_snapshot(&[], false, "unsubscribe")?;
                let session = self.session("unsubscribe")?;
                let cancelled = self.subscriptions.cancel_all().await;
                debug!(cancelled, "subscription workers stopped");

                let characteristics = self.all_characteristics();
                let result =
                    unsubscribe_remote(session.as_ref(), &characteristics, "unsubscribe").await;
                for characteristic in &characteristics {
                    characteristic.pipeline().drain();
                }
                result
            }
        }
    }

    /// Enable remote notifications without starting a worker. Values then
    /// reach pipelines, cached values and direct subscribers.
    pub async fn enable_notifications(&self, targets: &[SubscribeTarget]) -> Result<()> {
        let (validated, scope) = self.connected_snapshot(targets, true, "enable notifications")?;
        let session = self.session("enable notifications")?;
        let enabled = enable_remote(session.as_ref(), validated.values()).await?;
        let live = Self::cycle_is_live(&self.read(), &scope);
        if !live {
            rollback_remote(session.as_ref(), &enabled).await;
            return Err(Self::cycle_ended(&scope, "enable notifications"));
        }
        Ok(())
    }

    /// Disable remote notifications for `targets`.
    pub async fn disable_notifications(&self, targets: &[SubscribeTarget]) -> Result<()> {
        let (validated, _) = self.connected_snapshot(targets, false, "unsubscribe")?;
        let session = self.session("unsubscribe")?;
        let characteristics: Vec<_> = validated.into_values().collect();
        unsubscribe_remote(session.as_ref(), &characteristics, "unsubscribe").await
    }

    /// Feed `data` through the same path as an adapter notification.
    pub fn simulate_notification(
        &self,
        service: &str,
        characteristic: &str,
        data: &[u8],
    ) -> Result<()> {
        self.characteristic(service, characteristic)?
            .process_notification(data);
        Ok(())
    }
}

fn notification_handler(characteristic: &Arc<Characteristic>) -> NotificationHandler {
    let weak = Arc::downgrade(characteristic);
    Arc::new(move |data: &[u8]| {
        if let Some(characteristic) = weak.upgrade() {
            characteristic.process_notification(data);
        }
    })
}

async fn subscribe_remote(
    session: &dyn GattSession,
    characteristic: &Arc<Characteristic>,
    handle: &DiscoveredCharacteristic,
) -> Result<()> {
    session
        .subscribe(handle, notification_handler(characteristic))
        .await
        .map_err(|e| e.context(format!("subscribe to {}", characteristic.uuid())))?;
    debug!(uuid = characteristic.uuid(), "notifications enabled");
    Ok(())
}

/// Enable notifications on every characteristic not already notifying.
/// Returns the characteristics this call enabled.
async fn enable_remote<'a>(
    session: &dyn GattSession,
    characteristics: impl IntoIterator<Item = &'a Arc<Characteristic>>,
) -> Result<Vec<Arc<Characteristic>>> {
    let mut enabled = Vec::new();
    for characteristic in characteristics {
        if characteristic.is_notifying() {
            continue;
        }
        let Some(handle) = characteristic.handle() else {
            continue;
        };
        subscribe_remote(session, characteristic, &handle).await?;
        characteristic.set_notifying(true);
        enabled.push(characteristic.clone());
    }
    Ok(enabled)
}

/// Undo [`enable_remote`] for a connect cycle that ended meanwhile. The
/// session is usually gone by then, so failures are only logged.
async fn rollback_remote(session: &dyn GattSession, enabled: &[Arc<Characteristic>]) {
    for characteristic in enabled {
        characteristic.set_notifying(false);
        let Some(handle) = characteristic.handle() else {
            continue;
        };
        if let Err(err) = session.unsubscribe(&handle).await {
            debug!(uuid = characteristic.uuid(), error = %err, "rollback unsubscribe failed");
        }
    }
}

/// Disable notifications on every notifying characteristic, attempting all
/// of them and aggregating failures.
async fn unsubscribe_remote(
    session: &dyn GattSession,
    characteristics: &[Arc<Characteristic>],
    operation: &str,
) -> Result<()> {
    let mut failures = Vec::new();
    for characteristic in characteristics {
        if !characteristic.is_notifying() {
            continue;
        }
        let Some(handle) = characteristic.handle() else {
            continue;
        };
        match session.unsubscribe(&handle).await {
            Ok(()) => characteristic.set_notifying(false),
            Err(err) => failures.push(format!("{}: {err}", characteristic.uuid())),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Aggregate {
            operation: operation.to_string(),
            failures,
        })
    }
}

async fn read_descriptor(
    session: &dyn GattSession,
    discovered: &DiscoveredDescriptor,
    read_timeout: Duration,
) -> Descriptor {
    let uuid = uuid_key(&discovered.uuid);
    if let Some(value) = &discovered.value {
        return Descriptor::new(&uuid, Some(Bytes::copy_from_slice(value)), None);
    }
    if read_timeout.is_zero() {
        return Descriptor::new(&uuid, None, None);
    }
    match timeout(read_timeout, session.read_descriptor(discovered)).await {
        Ok(Ok(value)) => Descriptor::new(&uuid, Some(Bytes::from(value)), None),
        Ok(Err(err)) => {
            debug!(%uuid, error = %err, "descriptor read failed");
            Descriptor::new(&uuid, None, Some(DescriptorError::Read(err.to_string())))
        }
        Err(_) => {
            debug!(%uuid, ?read_timeout, "descriptor read timed out");
            Descriptor::new(&uuid, None, Some(DescriptorError::Timeout(read_timeout)))
        }
    }
}
