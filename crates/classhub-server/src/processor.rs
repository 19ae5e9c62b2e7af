//! Interprets decoded messages for one connection.
//!
//! Runs on the connection's read task, one message at a time, so a slow
//! store call only ever stalls the connection that caused it.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use classhub_core::protocol::{
    ChatText, DeviceOffline, DeviceOnline, LocalRegister, ModuleStatus, Ordinary, Register,
    UnitControl, UnitStat, UserOffline, UserOnline, MAX_CHAT_CHARS,
};
use classhub_core::{Capabilities, Message, Notice, RoutedMessage, SceneId};
use classhub_store::{SceneRecord, UnitStore};

use crate::client::ClientHandle;
use crate::error::ProcessError;
use crate::hub::HubHandle;

/// What the read loop does after a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The client has been logged out; stop reading.
    Terminate,
}

type Outcome = Result<Flow, ProcessError>;

pub struct Processor {
    client: Arc<ClientHandle>,
    hub: HubHandle,
    store: Arc<dyn UnitStore>,
    scene_id: SceneId,
    current_module: String,
}

impl Processor {
    pub fn new(
        client: Arc<ClientHandle>,
        hub: HubHandle,
        store: Arc<dyn UnitStore>,
        scene_id: SceneId,
    ) -> Self {
        Self {
            client,
            hub,
            store,
            scene_id,
            current_module: String::new(),
        }
    }

    pub fn client(&self) -> &Arc<ClientHandle> {
        &self.client
    }

    pub fn scene_id(&self) -> SceneId {
        self.scene_id
    }

    pub fn current_module(&self) -> &str {
        &self.current_module
    }

    /// Handle one text frame.
    pub async fn process(&mut self, raw: &str) -> Flow {
        let message = match Message::decode(raw) {
            Ok(message) => message,
            Err(error) => {
                warn!(client_id = %self.client.id, kind = error.error_kind(), %error, "dropping frame");
                return Flow::Continue;
            }
        };
        let act = message.act();

        match self.handle(message).await {
            Ok(flow) => flow,
            Err(ProcessError::Rejected(reason)) => {
                debug!(client_id = %self.client.id, %act, %reason, "message rejected");
                self.client.notify(Notice::error(reason));
                Flow::Continue
            }
            Err(ProcessError::Store(error)) => {
                error!(
                    client_id = %self.client.id,
                    unit_id = %self.client.unit_id,
                    %act,
                    kind = error.error_kind(),
                    %error,
                    "store call failed"
                );
                self.logout("store failure").await;
                Flow::Terminate
            }
            Err(ProcessError::Hub(error)) => {
                warn!(client_id = %self.client.id, %act, %error, "hub unavailable");
                Flow::Terminate
            }
        }
    }

    async fn handle(&mut self, message: Message) -> Outcome {
        match message {
            Message::Register(register) => self.register(register).await,
            Message::LocalRegisterAdd(items) => self.local_register(items, false).await,
            Message::LocalRegisterReplace(items) => self.local_register(items, true).await,
            Message::Ordinary(ordinary) => self.ordinary(ordinary).await,
            Message::ModuleStatus(status) => self.module_status(status).await,
            Message::UserOffline(offline) => self.user_offline(offline).await,
            Message::DeviceOffline(offline) => self.device_offline(offline).await,
            Message::UnitControl(control) => self.unit_control(control).await,
            Message::ChatText(chat) => self.chat(chat).await,
            ink @ (Message::PullInk(_) | Message::EndPullInk(_)) => {
                self.forward(ink).await?;
                Ok(Flow::Continue)
            }
            Message::UserOnline(_) | Message::DeviceOnline(_) => {
                debug!(client_id = %self.client.id, "ignoring client-sent presence event");
                Ok(Flow::Continue)
            }
        }
    }

    async fn register(&mut self, register: Register) -> Outcome {
        let device_without_type = self.client.is_device() && register.dt.is_empty();
        let user_with_type = self.client.is_user() && !register.dt.is_empty();
        if device_without_type || user_with_type {
            return Err(ProcessError::rejected(
                "register message does not match the connection kind",
            ));
        }

        let declared = Capabilities {
            vi: register.vi,
            hw: register.hw,
            os: register.os,
            dt: register.dt,
        };
        if !self.client.mark_registered(declared, now()) {
            return Ok(Flow::Continue);
        }
        info!(client_id = %self.client.id, unit_id = %self.client.unit_id, "client registered");
        self.forward(self.client.online_message()).await?;
        Ok(Flow::Continue)
    }

    async fn local_register(&mut self, items: LocalRegister, replace: bool) -> Outcome {
        if !self.client.is_local_control() {
            return Err(ProcessError::rejected(
                "local registration is only accepted from a local controller",
            ));
        }

        let now = now();
        let LocalRegister { mut usr, mut dev } = items;
        for user in &mut usr {
            user.registered_at = now;
        }
        for device in &mut dev {
            device.registered_at = now;
        }
        if replace {
            self.client.replace_local(usr.clone(), dev.clone());
        } else {
            self.client.add_local(usr.clone(), dev.clone());
        }
        debug!(
            client_id = %self.client.id,
            users = usr.len(),
            devices = dev.len(),
            replace,
            "local terminals registered"
        );

        for user in usr {
            self.forward(Message::UserOnline(UserOnline {
                uid: user.uid,
                nm: user.nm,
                sex: user.sex,
                idt: user.idt,
                os: user.os,
                vi: user.vi,
                hw: user.hw,
            }))
            .await?;
        }
        for device in dev {
            self.forward(Message::DeviceOnline(DeviceOnline {
                nm: device.did.clone(),
                did: device.did,
                dt: device.dt,
                vi: device.vi,
                hw: device.hw,
            }))
            .await?;
        }
        Ok(Flow::Continue)
    }

    async fn ordinary(&mut self, ordinary: Ordinary) -> Outcome {
        if ordinary.to.trim().is_empty() {
            return Err(ProcessError::rejected("No field 'to', discard message."));
        }
        self.forward(Message::Ordinary(ordinary)).await?;
        Ok(Flow::Continue)
    }

    async fn module_status(&mut self, mut status: ModuleStatus) -> Outcome {
        if status.to.trim().is_empty() {
            return Err(ProcessError::rejected("No field 'to', discard message."));
        }
        let module = if status.module.is_empty() {
            self.current_module.clone()
        } else {
            status.module.clone()
        };
        if module.is_empty() {
            return Err(ProcessError::rejected(
                "Field 'mod' not set and no current module, discard the instruction.",
            ));
        }
        self.current_module.clone_from(&module);

        let scene = self.current_scene()?;
        let now = now();
        status.created_at = now;
        let unit = &self.client.unit_id;
        self.store
            .append_module_history(unit, scene, &module, &status)?;

        let snapshot = match self.store.module_snapshot(unit, scene, &module)? {
            None => {
                if status.module.is_empty() {
                    return Err(ProcessError::rejected(
                        "Field 'mod' or 'to' not exists, can't be init, discard the instruction.",
                    ));
                }
                ModuleStatus {
                    updated_at: now,
                    ..status.clone()
                }
            }
            Some(mut current) => {
                let Value::Object(incoming) = &status.msg else {
                    return Err(ProcessError::rejected(
                        "Field 'msg' is not an object, discard the instruction.",
                    ));
                };
                current.updated_at = now;
                current.to.clone_from(&status.to);
                current.msg = merge_module_payload(std::mem::take(&mut current.msg), incoming);
                current
            }
        };
        self.store
            .put_module_snapshot(unit, scene, &module, &snapshot)?;

        self.forward(Message::ModuleStatus(status)).await?;
        Ok(Flow::Continue)
    }

    async fn user_offline(&mut self, offline: UserOffline) -> Outcome {
        let is_self = offline.uid == self.client.id.as_str();
        if !is_self && self.client.is_local_control() {
            self.client.remove_local_user(&offline.uid);
        }
        self.forward(Message::UserOffline(offline)).await?;
        if is_self {
            self.logout("offline").await;
            return Ok(Flow::Terminate);
        }
        Ok(Flow::Continue)
    }

    async fn device_offline(&mut self, offline: DeviceOffline) -> Outcome {
        let is_self = offline.did == self.client.id.as_str();
        if !is_self && self.client.is_local_control() {
            self.client.remove_local_device(&offline.did);
        }
        self.forward(Message::DeviceOffline(offline)).await?;
        if is_self {
            self.logout("offline").await;
            return Ok(Flow::Terminate);
        }
        Ok(Flow::Continue)
    }

    async fn unit_control(&mut self, control: UnitControl) -> Outcome {
        let unit = self.client.unit_id.clone();
        match control.stat() {
            Some(UnitStat::Start) => {
                self.current_scene()?;
                self.store.put_scene_record(&SceneRecord {
                    start_time: Some(now()),
                    ..SceneRecord::new(unit.clone(), self.scene_id)
                })?;
                info!(unit_id = %unit, scene_id = self.scene_id, "scene started");
            }
            Some(UnitStat::End) => {
                self.current_scene()?;
                let mut record = self
                    .store
                    .scene_record(&unit, self.scene_id)?
                    .unwrap_or_else(|| SceneRecord::new(unit.clone(), self.scene_id));
                record.end_time = Some(now());
                self.store.put_scene_record(&record)?;
                let next = self.store.incr_scene_id(&unit)?;
                info!(unit_id = %unit, ended = self.scene_id, next, "scene ended");
                self.scene_id = next;
                self.logout("unit ended").await;
                return Ok(Flow::Terminate);
            }
            Some(UnitStat::Other(_)) | None => {}
        }
        self.forward(Message::UnitControl(control)).await?;
        Ok(Flow::Continue)
    }

    async fn chat(&mut self, mut chat: ChatText) -> Outcome {
        let Some(text) = chat.text() else {
            return Err(ProcessError::rejected("chat message has no text"));
        };
        if text.chars().count() > MAX_CHAT_CHARS {
            return Err(ProcessError::rejected("chat message too long"));
        }
        chat.created_at = now();
        self.forward(Message::ChatText(chat.clone())).await?;
        let scene = self.current_scene()?;
        self.store.append_chat(&self.client.unit_id, scene, &chat)?;
        Ok(Flow::Continue)
    }

    /// Re-read the unit's scene before a write; another member may have
    /// ended the previous one since this connection last looked.
    fn current_scene(&mut self) -> Result<SceneId, ProcessError> {
        let scene = self.store.init_scene_id(&self.client.unit_id)?;
        if scene != self.scene_id {
            debug!(client_id = %self.client.id, from = self.scene_id, to = scene, "scene moved on");
            self.scene_id = scene;
        }
        Ok(scene)
    }

    async fn forward(&self, message: Message) -> Result<(), ProcessError> {
        let routed = RoutedMessage::new(self.client.id.clone(), self.client.unit_id.clone(), message);
        self.hub.dispatch(routed).await?;
        Ok(())
    }

    async fn logout(&self, reason: &str) {
        info!(client_id = %self.client.id, unit_id = %self.client.unit_id, reason, "logging out");
        if let Err(error) = self.hub.unregister(&self.client).await {
            warn!(client_id = %self.client.id, %error, "logout did not reach the hub");
        }
    }
}

/// Fold an incoming module payload into the stored one. A different
/// non-null `nm` replaces the payload, anything else is a shallow merge.
pub fn merge_module_payload(current: Value, incoming: &Map<String, Value>) -> Value {
    let Value::Object(mut current) = current else {
        return Value::Object(incoming.clone());
    };
    let renamed = incoming
        .get("nm")
        .is_some_and(|nm| !nm.is_null() && current.get("nm") != Some(nm));
    if renamed {
        return Value::Object(incoming.clone());
    }
    for (key, value) in incoming {
        current.insert(key.clone(), value.clone());
    }
    Value::Object(current)
}

fn now() -> i64 {
    Utc::now().timestamp()
}
