//! Per-connection state shared between the connection's own tasks, the Hub
//! and the reporting endpoints.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use classhub_core::protocol::{DeviceOnline, LocalDeviceItem, LocalUserItem, UserOnline};
use classhub_core::{
    Capabilities, ClientId, ConnectionId, Identity, Message, Notice, Principal, UnitId, UnitInfo,
};

/// One live connection.
///
/// Registration is a one-way edge: once `is_registered()` returns true it
/// never goes back. The outbound sender is dropped exactly once, when the
/// Hub removes the client, which ends the write pump.
pub struct ClientHandle {
    pub id: ClientId,
    pub conn_id: ConnectionId,
    pub unit_id: UnitId,
    pub identity: Identity,
    pub principal: Principal,
    pub unit_info: Arc<UnitInfo>,
    capabilities: RwLock<Capabilities>,
    registered: AtomicBool,
    registered_at: AtomicI64,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    /// One queue slot held back for the forced-logout notice.
    eviction_slot: Mutex<Option<mpsc::OwnedPermit<String>>>,
    local_users: RwLock<BTreeMap<String, LocalUserItem>>,
    local_devices: RwLock<BTreeMap<String, LocalDeviceItem>>,
    registration: CancellationToken,
}

impl ClientHandle {
    pub fn new(
        principal: Principal,
        identity: Identity,
        unit_info: Arc<UnitInfo>,
        outbound_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(outbound_capacity.max(1) + 1);
        let eviction_slot = tx.clone().try_reserve_owned().ok();
        let client = Arc::new(Self {
            id: principal.client_id(),
            conn_id: ConnectionId::new(),
            unit_id: unit_info.unit_id.clone(),
            identity,
            principal,
            unit_info,
            capabilities: RwLock::new(Capabilities::default()),
            registered: AtomicBool::new(false),
            registered_at: AtomicI64::new(0),
            outbound: Mutex::new(Some(tx)),
            eviction_slot: Mutex::new(eviction_slot),
            local_users: RwLock::new(BTreeMap::new()),
            local_devices: RwLock::new(BTreeMap::new()),
            registration: CancellationToken::new(),
        });
        (client, rx)
    }

    pub fn is_user(&self) -> bool {
        self.principal.is_user()
    }

    pub fn is_device(&self) -> bool {
        self.principal.is_device()
    }

    pub fn is_local_control(&self) -> bool {
        self.principal.is_local_control()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Unix seconds of the first successful registration, 0 before that.
    pub fn registered_at(&self) -> i64 {
        self.registered_at.load(Ordering::Acquire)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.read().clone()
    }

    /// Take the unregistered -> registered edge. Returns false if the
    /// client was already registered, in which case nothing changes.
    pub fn mark_registered(&self, declared: Capabilities, now: i64) -> bool {
        if self
            .registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        {
            let mut caps = self.capabilities.write();
            caps.vi = declared.vi;
            caps.hw = declared.hw;
            if !declared.os.is_empty() {
                caps.os = declared.os;
            }
            if !declared.dt.is_empty() {
                caps.dt = declared.dt;
            }
        }
        self.registered_at.store(now, Ordering::Release);
        self.registration.cancel();
        true
    }

    /// Presence event announcing this client to its unit.
    pub fn online_message(&self) -> Message {
        let caps = self.capabilities();
        match &self.principal {
            Principal::User(user) => Message::UserOnline(UserOnline {
                uid: user.uid.clone(),
                nm: user.nickname.clone(),
                sex: user.sex.to_string(),
                idt: self.identity.code().to_string(),
                os: caps.os,
                vi: caps.vi,
                hw: caps.hw,
            }),
            Principal::Device(_) => Message::DeviceOnline(DeviceOnline {
                did: self.id.to_string(),
                nm: self.id.to_string(),
                dt: caps.dt,
                vi: caps.vi,
                hw: caps.hw,
            }),
        }
    }

    /// Token cancelled on registration or teardown; drives the countdown.
    pub fn registration_token(&self) -> CancellationToken {
        self.registration.clone()
    }

    pub fn cancel_registration(&self) {
        self.registration.cancel();
    }

    /// Clone of the outbound sender, `None` once the client was removed.
    pub fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.outbound.lock().clone()
    }

    /// Best-effort enqueue that never waits. Returns false if the queue is
    /// full or closed.
    pub fn try_send(&self, text: String) -> bool {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.try_send(text).is_ok(),
            None => false,
        }
    }

    pub fn notify(&self, notice: Notice) {
        if !self.try_send(notice.to_json()) {
            debug!(client_id = %self.id, errmsg = %notice.errmsg, "notice dropped");
        }
    }

    /// Deliver the forced-logout notice through the reserved slot, so it
    /// arrives even when the regular queue is full.
    pub fn notify_eviction(&self) {
        let notice = Notice::forced_logout();
        match self.eviction_slot.lock().take() {
            Some(permit) => {
                permit.send(notice.to_json());
            }
            None => {
                if !self.try_send(notice.to_json()) {
                    warn!(client_id = %self.id, conn_id = %self.conn_id, "eviction notice dropped");
                }
            }
        }
    }

    /// Drop the outbound sender. Returns false if it was already gone.
    pub fn close_outbound(&self) -> bool {
        // The reserved slot holds a sender too; the queue only closes once
        // both are gone.
        self.eviction_slot.lock().take();
        self.outbound.lock().take().is_some()
    }

    pub fn add_local(&self, users: Vec<LocalUserItem>, devices: Vec<LocalDeviceItem>) {
        let mut local_users = self.local_users.write();
        for user in users {
            local_users.insert(user.uid.clone(), user);
        }
        drop(local_users);
        let mut local_devices = self.local_devices.write();
        for device in devices {
            local_devices.insert(device.did.clone(), device);
        }
    }

    pub fn replace_local(&self, users: Vec<LocalUserItem>, devices: Vec<LocalDeviceItem>) {
        *self.local_users.write() = users.into_iter().map(|u| (u.uid.clone(), u)).collect();
        *self.local_devices.write() = devices.into_iter().map(|d| (d.did.clone(), d)).collect();
    }

    pub fn remove_local_user(&self, uid: &str) -> bool {
        self.local_users.write().remove(uid).is_some()
    }

    pub fn remove_local_device(&self, did: &str) -> bool {
        self.local_devices.write().remove(did).is_some()
    }

    pub fn local_users(&self) -> Vec<LocalUserItem> {
        self.local_users.read().values().cloned().collect()
    }

    pub fn local_devices(&self) -> Vec<LocalDeviceItem> {
        self.local_devices.read().values().cloned().collect()
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("conn_id", &self.conn_id)
            .field("unit_id", &self.unit_id)
            .field("registered", &self.is_registered())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use classhub_core::{DevicePrincipal, UserPrincipal};

    pub fn unit(id: &str) -> Arc<UnitInfo> {
        Arc::new(UnitInfo {
            unit_id: UnitId::from_raw(id),
            status: "1".into(),
            ..Default::default()
        })
    }

    pub fn user(uid: &str, identity: Identity, unit_id: &str) -> (Arc<ClientHandle>, mpsc::Receiver<String>) {
        let principal = Principal::User(UserPrincipal {
            uid: uid.into(),
            nickname: format!("nick-{uid}"),
            name: format!("name-{uid}"),
            sex: 1,
            avatar: String::new(),
        });
        ClientHandle::new(principal, identity, unit(unit_id), 16)
    }

    pub fn device(id: &str, device_type: i64, unit_id: &str) -> (Arc<ClientHandle>, mpsc::Receiver<String>) {
        let principal = Principal::Device(DevicePrincipal {
            client_id: id.into(),
            device_type,
            ..Default::default()
        });
        ClientHandle::new(principal, Identity::Unclassified, unit(unit_id), 16)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use classhub_core::principal::LOCAL_CONTROL_DEVICE_TYPE;

    #[test]
    fn registers_once() {
        let (client, _rx) = user("7", Identity::Student, "u1");
        let token = client.registration_token();
        assert!(!client.is_registered());

        let caps = Capabilities {
            vi: "1".into(),
            hw: "0".into(),
            os: "ios".into(),
            dt: String::new(),
        };
        assert!(client.mark_registered(caps, 100));
        assert!(client.is_registered());
        assert!(token.is_cancelled());
        assert_eq!(client.registered_at(), 100);

        assert!(!client.mark_registered(Capabilities::default(), 200));
        assert_eq!(client.registered_at(), 100);
        assert_eq!(client.capabilities().os, "ios");
    }

    #[test]
    fn user_online_carries_identity_code() {
        let (client, _rx) = user("7", Identity::Teacher, "u1");
        client.mark_registered(
            Capabilities {
                vi: "1".into(),
                hw: "1".into(),
                os: "android".into(),
                dt: String::new(),
            },
            1,
        );
        let Message::UserOnline(online) = client.online_message() else {
            panic!("expected UserOnline");
        };
        assert_eq!(online.uid, "7");
        assert_eq!(online.nm, "nick-7");
        assert_eq!(online.idt, "1");
        assert_eq!(online.sex, "1");
        assert_eq!(online.os, "android");
    }

    #[test]
    fn device_online_names_itself() {
        let (client, _rx) = device("pad-3", 4, "u1");
        client.mark_registered(
            Capabilities {
                dt: "4".into(),
                ..Default::default()
            },
            1,
        );
        let Message::DeviceOnline(online) = client.online_message() else {
            panic!("expected DeviceOnline");
        };
        assert_eq!(online.did, "pad-3");
        assert_eq!(online.nm, "pad-3");
        assert_eq!(online.dt, "4");
    }

    #[test]
    fn local_registry_add_replace_remove() {
        let (client, _rx) = device("nds", LOCAL_CONTROL_DEVICE_TYPE, "u1");
        let item = |uid: &str| LocalUserItem {
            uid: uid.into(),
            ..Default::default()
        };
        client.add_local(vec![item("1"), item("2")], vec![]);
        client.add_local(vec![item("3")], vec![]);
        assert_eq!(client.local_users().len(), 3);

        client.replace_local(
            vec![item("9")],
            vec![LocalDeviceItem {
                did: "d1".into(),
                ..Default::default()
            }],
        );
        let uids: Vec<String> = client.local_users().into_iter().map(|u| u.uid).collect();
        assert_eq!(uids, vec!["9"]);
        assert!(client.remove_local_device("d1"));
        assert!(!client.remove_local_device("d1"));
        assert!(client.local_devices().is_empty());
    }

    #[test]
    fn local_registry_reads_during_mutation() {
        let (client, _rx) = device("nds", LOCAL_CONTROL_DEVICE_TYPE, "u1");
        let writer = {
            let client = client.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let item = LocalUserItem {
                        uid: i.to_string(),
                        ..Default::default()
                    };
                    if i % 50 == 0 {
                        client.replace_local(vec![item], vec![]);
                    } else {
                        client.add_local(vec![item], vec![]);
                    }
                }
            })
        };
        let reader = {
            let client = client.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let users = client.local_users();
                    assert!(users.len() <= 50);
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(client.local_users().len(), 50);
    }

    #[tokio::test]
    async fn eviction_notice_gets_through_a_full_queue() {
        let (client, mut rx) = {
            let (template, _) = user("7", Identity::Student, "u1");
            ClientHandle::new(template.principal.clone(), Identity::Student, template.unit_info.clone(), 1)
        };
        assert!(client.try_send("backlog".into()));
        assert!(!client.try_send("overflow".into()));

        client.notify_eviction();
        client.close_outbound();

        assert_eq!(rx.recv().await.unwrap(), "backlog");
        assert_eq!(rx.recv().await.unwrap(), r#"{"errcode":1,"errmsg":"forced logout"}"#);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_outbound_once_ends_receiver() {
        let (client, mut rx) = user("7", Identity::Student, "u1");
        client.notify(Notice::error("bad"));
        assert!(client.close_outbound());
        assert!(!client.close_outbound());
        assert!(!client.try_send("late".into()));

        let first = rx.recv().await.unwrap();
        assert!(first.contains("bad"));
        assert!(rx.recv().await.is_none());
    }
}
