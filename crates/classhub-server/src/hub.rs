//! The session registry.
//!
//! One task owns every mutation. Connections talk to it through a single
//! ordered command channel, so the commands of one connection are applied in
//! the order it issued them. The state sits behind a `RwLock` only so that
//! reporting code can read it from other tasks.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use classhub_core::{
    ClientId, ConnectionId, Group, Identity, Message, RecipientSelector, RoutedMessage,
    UnitId,
};

use crate::client::ClientHandle;
use crate::error::HubError;

/// Classification sets of one unit's members.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnitMembers {
    pub all: BTreeSet<ClientId>,
    pub teachers: BTreeSet<ClientId>,
    pub students: BTreeSet<ClientId>,
    pub devices: BTreeSet<ClientId>,
    pub local_controllers: BTreeSet<ClientId>,
}

impl UnitMembers {
    fn insert(&mut self, client: &ClientHandle) {
        let id = client.id.clone();
        if client.is_device() {
            self.devices.insert(id.clone());
            if client.is_local_control() {
                self.local_controllers.insert(id.clone());
            }
        } else {
            match client.identity {
                Identity::Teacher => {
                    self.teachers.insert(id.clone());
                }
                Identity::Student => {
                    self.students.insert(id.clone());
                }
                Identity::Unclassified => {}
            }
        }
        self.all.insert(id);
    }

    fn remove(&mut self, id: &ClientId) {
        self.all.remove(id);
        self.teachers.remove(id);
        self.students.remove(id);
        self.devices.remove(id);
        self.local_controllers.remove(id);
    }

    fn group(&self, group: Group) -> &BTreeSet<ClientId> {
        match group {
            Group::All => &self.all,
            Group::Teachers => &self.teachers,
            Group::Students => &self.students,
            Group::Devices => &self.devices,
        }
    }

    /// Members matched by a `to` selector. Individual ids outside the unit
    /// are ignored.
    pub fn select(&self, selector: &RecipientSelector) -> BTreeSet<ClientId> {
        if selector.includes(Group::All) {
            return self.all.clone();
        }
        let mut out = BTreeSet::new();
        for group in &selector.groups {
            out.extend(self.group(*group).iter().cloned());
        }
        for raw in &selector.individuals {
            let id = ClientId::from_raw(raw.as_str());
            if self.all.contains(&id) {
                out.insert(id);
            }
        }
        out
    }
}

/// Registry contents. `clients[id]` exists iff `id` is in
/// `units[client.unit_id].all`.
#[derive(Debug, Default)]
pub struct HubState {
    clients: HashMap<ClientId, Arc<ClientHandle>>,
    units: HashMap<UnitId, UnitMembers>,
}

impl HubState {
    fn insert(&mut self, client: Arc<ClientHandle>) {
        self.units
            .entry(client.unit_id.clone())
            .or_default()
            .insert(&client);
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove the entry for `id` if it belongs to connection `conn_id`.
    fn remove(&mut self, id: &ClientId, conn_id: &ConnectionId) -> Option<Arc<ClientHandle>> {
        if self.clients.get(id).map(|c| &c.conn_id) != Some(conn_id) {
            return None;
        }
        let client = self.clients.remove(id)?;
        if let Some(members) = self.units.get_mut(&client.unit_id) {
            members.remove(id);
            if members.all.is_empty() {
                self.units.remove(&client.unit_id);
            }
        }
        client.cancel_registration();
        client.close_outbound();
        Some(client)
    }

    pub fn members(&self, unit: &UnitId) -> Option<&UnitMembers> {
        self.units.get(unit)
    }
}

/// Recipients of a message: a copy of the matched set with the sender
/// removed. Registration and handwriting messages have no recipients.
pub fn route(state: &HubState, routed: &RoutedMessage) -> Vec<ClientId> {
    let Some(members) = state.members(&routed.unit) else {
        return Vec::new();
    };
    let mut recipients = match &routed.message {
        Message::Ordinary(m) => members.select(&RecipientSelector::parse(&m.to)),
        Message::ModuleStatus(m) => members.select(&RecipientSelector::parse(&m.to)),
        Message::UserOnline(_)
        | Message::UserOffline(_)
        | Message::DeviceOnline(_)
        | Message::DeviceOffline(_)
        | Message::UnitControl(_)
        | Message::ChatText(_) => members.all.clone(),
        Message::Register(_)
        | Message::LocalRegisterAdd(_)
        | Message::LocalRegisterReplace(_)
        | Message::PullInk(_)
        | Message::EndPullInk(_) => return Vec::new(),
    };
    recipients.remove(&routed.sender);
    recipients.into_iter().collect()
}

enum HubCommand {
    Register {
        client: Arc<ClientHandle>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        client_id: ClientId,
        conn_id: ConnectionId,
        ack: oneshot::Sender<bool>,
    },
    EndUnit {
        unit_id: UnitId,
        ack: oneshot::Sender<usize>,
    },
    Dispatch(RoutedMessage),
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub command_queue: usize,
    pub ink_capacity: usize,
    /// How long a dispatch waits on one recipient's full queue.
    pub send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_queue: 1024,
            ink_capacity: 256,
            send_timeout: Duration::from_secs(1),
        }
    }
}

/// The owning task.
pub struct Hub {
    rx: mpsc::Receiver<HubCommand>,
    state: Arc<RwLock<HubState>>,
    ink_tx: broadcast::Sender<RoutedMessage>,
    send_timeout: Duration,
}

/// Cheap handle used by connections and readers.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    state: Arc<RwLock<HubState>>,
    ink_tx: broadcast::Sender<RoutedMessage>,
}

impl Hub {
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.command_queue.max(1));
        let (ink_tx, _) = broadcast::channel(config.ink_capacity.max(1));
        let state = Arc::new(RwLock::new(HubState::default()));
        let hub = Self {
            rx,
            state: state.clone(),
            ink_tx: ink_tx.clone(),
            send_timeout: config.send_timeout,
        };
        (hub, HubHandle { tx, state, ink_tx })
    }

    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config);
        (handle, tokio::spawn(hub.run()))
    }

    /// Runs until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                HubCommand::Register { client, ack } => {
                    self.register(client);
                    let _ = ack.send(());
                }
                HubCommand::Unregister {
                    client_id,
                    conn_id,
                    ack,
                } => {
                    let removed = self.unregister(&client_id, &conn_id);
                    let _ = ack.send(removed);
                }
                HubCommand::EndUnit { unit_id, ack } => {
                    let evicted = self.end_unit(&unit_id);
                    let _ = ack.send(evicted);
                }
                HubCommand::Dispatch(routed) => self.dispatch(routed).await,
            }
        }
        info!("hub stopped");
    }

    /// Insert `client`, first evicting any other live connection with the
    /// same id. Re-registering the same connection is a no-op.
    fn register(&self, client: Arc<ClientHandle>) {
        let mut state = self.state.write();
        if let Some(existing) = state.clients.get(&client.id).cloned() {
            if existing.conn_id == client.conn_id {
                return;
            }
            existing.notify_eviction();
            state.remove(&existing.id, &existing.conn_id);
            info!(
                client_id = %client.id,
                unit_id = %existing.unit_id,
                evicted_conn = %existing.conn_id,
                "forced logout of previous connection"
            );
        }
        debug!(client_id = %client.id, unit_id = %client.unit_id, "client joined hub");
        state.insert(client);
    }

    fn unregister(&self, client_id: &ClientId, conn_id: &ConnectionId) -> bool {
        let removed = self.state.write().remove(client_id, conn_id);
        if let Some(client) = &removed {
            debug!(client_id = %client_id, unit_id = %client.unit_id, "client left hub");
        }
        removed.is_some()
    }

    fn end_unit(&self, unit_id: &UnitId) -> usize {
        let mut state = self.state.write();
        let Some(members) = state.units.get(unit_id).cloned() else {
            return 0;
        };
        let mut evicted = 0;
        for id in &members.all {
            let Some(conn_id) = state.clients.get(id).map(|c| c.conn_id.clone()) else {
                continue;
            };
            if state.remove(id, &conn_id).is_some() {
                evicted += 1;
            }
        }
        state.units.remove(unit_id);
        info!(unit_id = %unit_id, evicted, "unit ended");
        evicted
    }

    async fn dispatch(&self, routed: RoutedMessage) {
        if matches!(routed.message, Message::PullInk(_) | Message::EndPullInk(_)) {
            // No subscribers is not an error.
            let _ = self.ink_tx.send(routed);
            return;
        }

        let targets: Vec<(ClientId, mpsc::Sender<String>)> = {
            let state = self.state.read();
            route(&state, &routed)
                .into_iter()
                .filter_map(|id| {
                    let tx = state.clients.get(&id)?.sender()?;
                    Some((id, tx))
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let payload = match routed.message.encode() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(act = %routed.message.act(), %error, "failed to encode message");
                return;
            }
        };

        let receivers = targets.len();
        for (client_id, tx) in targets {
            match tx.send_timeout(payload.clone(), self.send_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    let error = HubError::QueueFull { client_id };
                    warn!(unit_id = %routed.unit, act = %routed.message.act(), %error, "message dropped");
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(client_id = %client_id, "recipient closed during dispatch");
                }
            }
        }
        debug!(
            unit_id = %routed.unit,
            client_id = %routed.sender,
            act = %routed.message.act(),
            receivers,
            "dispatched"
        );
    }
}

impl HubHandle {
    /// Add a connection, evicting an older one with the same id. Resolves
    /// once the Hub has applied it.
    pub async fn register(&self, client: Arc<ClientHandle>) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.send(HubCommand::Register { client, ack }).await?;
        done.await.map_err(|_| HubError::Stopped)
    }

    /// Remove `client` if it is still the registered connection for its id.
    pub async fn unregister(&self, client: &ClientHandle) -> Result<bool, HubError> {
        self.unregister_conn(&client.id, &client.conn_id).await
    }

    pub async fn unregister_conn(
        &self,
        client_id: &ClientId,
        conn_id: &ConnectionId,
    ) -> Result<bool, HubError> {
        let (ack, done) = oneshot::channel();
        self.send(HubCommand::Unregister {
            client_id: client_id.clone(),
            conn_id: conn_id.clone(),
            ack,
        })
        .await?;
        done.await.map_err(|_| HubError::Stopped)
    }

    /// Evict every member of `unit_id`. Returns how many were removed.
    pub async fn end_unit(&self, unit_id: UnitId) -> Result<usize, HubError> {
        let (ack, done) = oneshot::channel();
        self.send(HubCommand::EndUnit { unit_id, ack }).await?;
        done.await.map_err(|_| HubError::Stopped)
    }

    pub async fn dispatch(&self, routed: RoutedMessage) -> Result<(), HubError> {
        self.send(HubCommand::Dispatch(routed)).await
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.tx.send(command).await.map_err(|_| HubError::Stopped)
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<ClientHandle>> {
        self.state.read().clients.get(id).cloned()
    }

    pub fn exists(&self, id: &ClientId) -> bool {
        self.state.read().clients.contains_key(id)
    }

    pub fn list(&self) -> Vec<Arc<ClientHandle>> {
        self.state.read().clients.values().cloned().collect()
    }

    /// Live clients of one unit, ordered by id.
    pub fn list_unit(&self, unit: &UnitId) -> Vec<Arc<ClientHandle>> {
        let state = self.state.read();
        let Some(members) = state.members(unit) else {
            return Vec::new();
        };
        members
            .all
            .iter()
            .filter_map(|id| state.clients.get(id).cloned())
            .collect()
    }

    pub fn unit_members(&self, unit: &UnitId) -> Option<UnitMembers> {
        self.state.read().members(unit).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.state.read().clients.len()
    }

    /// Handwriting subscribe/unsubscribe requests.
    pub fn subscribe_ink(&self) -> broadcast::Receiver<RoutedMessage> {
        self.ink_tx.subscribe()
    }
}

#[cfg(test)]
impl HubHandle {
    /// Every command sent before this one has been applied once it returns.
    pub(crate) async fn settle(&self) {
        let _ = self
            .unregister_conn(&ClientId::from_raw(""), &ConnectionId::new())
            .await;
    }
}
