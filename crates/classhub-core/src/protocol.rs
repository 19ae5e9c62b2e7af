//! Wire protocol spoken over the classroom channel.
//!
//! Every frame is a JSON object whose `act` field selects the variant.
//! Decoding reads the tag first, then decodes the whole frame into the
//! variant's payload type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::ids::{ClientId, UnitId};

/// Longest accepted chat text, in characters.
pub const MAX_CHAT_CHARS: usize = 100;

/// Discriminator carried in the `act` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Act {
    Register,
    LocalRegisterAdd,
    LocalRegisterReplace,
    Ordinary,
    ModuleStatus,
    UserOnline,
    UserOffline,
    DeviceOnline,
    DeviceOffline,
    UnitControl,
    PullInk,
    EndPullInk,
    ChatText,
}

impl Act {
    pub fn code(self) -> &'static str {
        match self {
            Self::Register => "1",
            Self::LocalRegisterAdd => "2",
            Self::LocalRegisterReplace => "3",
            Self::Ordinary => "6",
            Self::ModuleStatus => "7",
            Self::UserOnline => "8",
            Self::UserOffline => "9",
            Self::DeviceOnline => "10",
            Self::DeviceOffline => "11",
            Self::UnitControl => "12",
            Self::PullInk => "13",
            Self::EndPullInk => "14",
            Self::ChatText => "15",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "1" => Self::Register,
            "2" => Self::LocalRegisterAdd,
            "3" => Self::LocalRegisterReplace,
            "6" => Self::Ordinary,
            "7" => Self::ModuleStatus,
            "8" => Self::UserOnline,
            "9" => Self::UserOffline,
            "10" => Self::DeviceOnline,
            "11" => Self::DeviceOffline,
            "12" => Self::UnitControl,
            "13" => Self::PullInk,
            "14" => Self::EndPullInk,
            "15" => Self::ChatText,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Act {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// act=1. Capability declaration; `dt` is only sent by devices.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Register {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(default)]
    pub vi: String,
    #[serde(default)]
    pub hw: String,
}

/// A human terminal observed by a local controller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalUserItem {
    pub uid: String,
    #[serde(default)]
    pub nm: String,
    #[serde(default)]
    pub sex: String,
    #[serde(default)]
    pub idt: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub vi: String,
    #[serde(default)]
    pub hw: String,
    /// Server-assigned, unix seconds.
    #[serde(skip)]
    pub registered_at: i64,
}

/// A device terminal observed by a local controller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalDeviceItem {
    pub did: String,
    #[serde(default)]
    pub nm: String,
    #[serde(default)]
    pub dt: String,
    #[serde(default)]
    pub vi: String,
    #[serde(default)]
    pub hw: String,
    /// Server-assigned, unix seconds.
    #[serde(skip)]
    pub registered_at: i64,
}

/// act=2 / act=3.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalRegister {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usr: Vec<LocalUserItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dev: Vec<LocalDeviceItem>,
}

/// act=6. Opaque application payload addressed by `to`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ordinary {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub msg: Value,
}

/// act=7. State of a pedagogical module; also the stored snapshot shape.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleStatus {
    #[serde(rename = "mod", default)]
    pub module: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub msg: Value,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub updated_at: i64,
}

/// act=8.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserOnline {
    pub uid: String,
    #[serde(default)]
    pub nm: String,
    #[serde(default)]
    pub sex: String,
    #[serde(default)]
    pub idt: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub vi: String,
    #[serde(default)]
    pub hw: String,
}

/// act=9.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserOffline {
    pub uid: String,
}

/// act=10.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceOnline {
    pub did: String,
    #[serde(default)]
    pub nm: String,
    #[serde(default)]
    pub dt: String,
    #[serde(default)]
    pub vi: String,
    #[serde(default)]
    pub hw: String,
}

/// act=11.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceOffline {
    pub did: String,
}

/// Session transition requested by a UnitControl message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitStat {
    Start,
    End,
    Other(String),
}

/// act=12. `msg.stat` carries the transition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitControl {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub msg: Value,
}

impl UnitControl {
    pub fn stat(&self) -> Option<UnitStat> {
        let raw = match self.msg.get("stat")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(match raw.as_str() {
            "1" => UnitStat::Start,
            "2" => UnitStat::End,
            _ => UnitStat::Other(raw),
        })
    }
}

/// act=13 / act=14. Handwriting stream subscription.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InkRequest {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub get: String,
}

/// act=15. Text lives in `msg.c`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatText {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub msg: Value,
    #[serde(default)]
    pub created_at: i64,
}

impl ChatText {
    pub fn text(&self) -> Option<&str> {
        self.msg.get("c").and_then(Value::as_str)
    }
}

/// A decoded protocol message.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "act")]
pub enum Message {
    #[serde(rename = "1")]
    Register(Register),
    #[serde(rename = "2")]
    LocalRegisterAdd(LocalRegister),
    #[serde(rename = "3")]
    LocalRegisterReplace(LocalRegister),
    #[serde(rename = "6")]
    Ordinary(Ordinary),
    #[serde(rename = "7")]
    ModuleStatus(ModuleStatus),
    #[serde(rename = "8")]
    UserOnline(UserOnline),
    #[serde(rename = "9")]
    UserOffline(UserOffline),
    #[serde(rename = "10")]
    DeviceOnline(DeviceOnline),
    #[serde(rename = "11")]
    DeviceOffline(DeviceOffline),
    #[serde(rename = "12")]
    UnitControl(UnitControl),
    #[serde(rename = "13")]
    PullInk(InkRequest),
    #[serde(rename = "14")]
    EndPullInk(InkRequest),
    #[serde(rename = "15")]
    ChatText(ChatText),
}

/// Only the tag, read before the payload.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    act: Value,
}

fn payload<T: DeserializeOwned>(act: Act, raw: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(raw).map_err(|source| ProtocolError::Malformed {
        act: act.code().to_string(),
        source,
    })
}

impl Message {
    /// Decode a text frame: tag first, then the full payload.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        let code = match envelope.act {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => return Err(ProtocolError::MissingAct),
        };
        let act = Act::from_code(&code).ok_or(ProtocolError::UnknownAct(code))?;

        Ok(match act {
            Act::Register => Self::Register(payload(act, raw)?),
            Act::LocalRegisterAdd => Self::LocalRegisterAdd(payload(act, raw)?),
            Act::LocalRegisterReplace => Self::LocalRegisterReplace(payload(act, raw)?),
            Act::Ordinary => Self::Ordinary(payload(act, raw)?),
            Act::ModuleStatus => Self::ModuleStatus(payload(act, raw)?),
            Act::UserOnline => Self::UserOnline(payload(act, raw)?),
            Act::UserOffline => Self::UserOffline(payload(act, raw)?),
            Act::DeviceOnline => Self::DeviceOnline(payload(act, raw)?),
            Act::DeviceOffline => Self::DeviceOffline(payload(act, raw)?),
            Act::UnitControl => Self::UnitControl(payload(act, raw)?),
            Act::PullInk => Self::PullInk(payload(act, raw)?),
            Act::EndPullInk => Self::EndPullInk(payload(act, raw)?),
            Act::ChatText => Self::ChatText(payload(act, raw)?),
        })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn act(&self) -> Act {
        match self {
            Self::Register(_) => Act::Register,
            Self::LocalRegisterAdd(_) => Act::LocalRegisterAdd,
            Self::LocalRegisterReplace(_) => Act::LocalRegisterReplace,
            Self::Ordinary(_) => Act::Ordinary,
            Self::ModuleStatus(_) => Act::ModuleStatus,
            Self::UserOnline(_) => Act::UserOnline,
            Self::UserOffline(_) => Act::UserOffline,
            Self::DeviceOnline(_) => Act::DeviceOnline,
            Self::DeviceOffline(_) => Act::DeviceOffline,
            Self::UnitControl(_) => Act::UnitControl,
            Self::PullInk(_) => Act::PullInk,
            Self::EndPullInk(_) => Act::EndPullInk,
            Self::ChatText(_) => Act::ChatText,
        }
    }
}

/// A message annotated by the server with its sender and unit, ready for
/// routing. The annotations never reach the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutedMessage {
    pub sender: ClientId,
    pub unit: UnitId,
    pub message: Message,
}

impl RoutedMessage {
    pub fn new(sender: ClientId, unit: UnitId, message: Message) -> Self {
        Self {
            sender,
            unit,
            message,
        }
    }
}

/// Inline error payload pushed to a single connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub errcode: i32,
    pub errmsg: String,
}

impl Notice {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            errcode: 1,
            errmsg: message.into(),
        }
    }

    pub fn forced_logout() -> Self {
        Self::error("forced logout")
    }

    pub fn to_json(&self) -> String {
        // Two plain fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_register_from_device() {
        let msg = Message::decode(r#"{"act":"1","dt":"3","vi":"1","hw":"0"}"#).unwrap();
        let Message::Register(reg) = msg else {
            panic!("expected register");
        };
        assert_eq!(reg.dt, "3");
        assert_eq!(reg.vi, "1");
        assert_eq!(reg.hw, "0");
        assert!(reg.os.is_empty());
    }

    #[test]
    fn decode_accepts_numeric_tag() {
        let msg = Message::decode(r#"{"act":9,"uid":"42"}"#).unwrap();
        assert_eq!(msg.act(), Act::UserOffline);
    }

    #[test]
    fn decode_distinguishes_add_and_replace() {
        let add = Message::decode(r#"{"act":"2","usr":[{"uid":"s1","nm":"Ann"}]}"#).unwrap();
        let replace = Message::decode(r#"{"act":"3","dev":[{"did":"d1","dt":"4"}]}"#).unwrap();
        assert_eq!(add.act(), Act::LocalRegisterAdd);
        assert_eq!(replace.act(), Act::LocalRegisterReplace);
        let Message::LocalRegisterReplace(local) = replace else {
            panic!("expected replace");
        };
        assert!(local.usr.is_empty());
        assert_eq!(local.dev[0].did, "d1");
    }

    #[test]
    fn unknown_act_is_unrecognized() {
        let err = Message::decode(r#"{"act":"4"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownAct(ref a) if a == "4"));
    }

    #[test]
    fn missing_act_is_unrecognized() {
        let err = Message::decode(r#"{"to":"A"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingAct));
    }

    #[test]
    fn malformed_payload_is_unrecognized() {
        let err = Message::decode(r#"{"act":"6","to":5}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { ref act, .. } if act == "6"));
    }

    #[test]
    fn garbage_is_unrecognized() {
        let err = Message::decode("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn encode_emits_string_tag() {
        let msg = Message::UserOffline(UserOffline { uid: "7".into() });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"act": "9", "uid": "7"}));
    }

    #[test]
    fn module_status_uses_mod_field() {
        let msg = Message::decode(r#"{"act":"7","mod":"quiz","to":"S","msg":{"nm":"q1"}}"#).unwrap();
        let Message::ModuleStatus(status) = msg else {
            panic!("expected module status");
        };
        assert_eq!(status.module, "quiz");
        let value: Value = serde_json::to_value(Message::ModuleStatus(status)).unwrap();
        assert_eq!(value["mod"], "quiz");
        assert!(value.get("updated_at").is_none());
    }

    #[test]
    fn local_items_never_carry_registration_time_on_the_wire() {
        let item = LocalUserItem {
            uid: "s1".into(),
            registered_at: 1_700_000_000,
            ..Default::default()
        };
        let value = serde_json::to_value(&item).unwrap();
        assert!(value.get("registered_at").is_none());
    }

    #[test]
    fn unit_control_stat_parsing() {
        let start = UnitControl {
            from: String::new(),
            msg: json!({"stat": "1"}),
        };
        let end = UnitControl {
            from: String::new(),
            msg: json!({"stat": 2}),
        };
        let other = UnitControl {
            from: String::new(),
            msg: json!({"stat": "9"}),
        };
        let missing = UnitControl::default();
        assert_eq!(start.stat(), Some(UnitStat::Start));
        assert_eq!(end.stat(), Some(UnitStat::End));
        assert_eq!(other.stat(), Some(UnitStat::Other("9".into())));
        assert_eq!(missing.stat(), None);
    }

    #[test]
    fn chat_text_reads_c_field() {
        let chat = ChatText {
            msg: json!({"c": "hello"}),
            ..Default::default()
        };
        assert_eq!(chat.text(), Some("hello"));
        let chat = ChatText {
            msg: json!({"c": 5}),
            ..Default::default()
        };
        assert_eq!(chat.text(), None);
    }

    #[test]
    fn every_variant_survives_encode_then_decode() {
        let samples = vec![
            Message::Register(Register {
                dt: String::new(),
                os: "ios".into(),
                vi: "1".into(),
                hw: "1".into(),
            }),
            Message::LocalRegisterAdd(LocalRegister {
                usr: vec![LocalUserItem {
                    uid: "s1".into(),
                    nm: "Ann".into(),
                    idt: "2".into(),
                    ..Default::default()
                }],
                dev: vec![],
            }),
            Message::LocalRegisterReplace(LocalRegister {
                usr: vec![],
                dev: vec![LocalDeviceItem {
                    did: "pad-1".into(),
                    dt: "4".into(),
                    ..Default::default()
                }],
            }),
            Message::Ordinary(Ordinary {
                from: "1".into(),
                to: "T|S".into(),
                msg: json!({"k": [1, 2]}),
            }),
            Message::ModuleStatus(ModuleStatus {
                module: "vote".into(),
                from: "1".into(),
                to: "A".into(),
                msg: json!({"nm": "v1", "n": 3}),
                ..Default::default()
            }),
            Message::UserOnline(UserOnline {
                uid: "42".into(),
                nm: "Bo".into(),
                sex: "1".into(),
                idt: "1".into(),
                os: "android".into(),
                vi: "1".into(),
                hw: "0".into(),
            }),
            Message::UserOffline(UserOffline { uid: "42".into() }),
            Message::DeviceOnline(DeviceOnline {
                did: "pad-1".into(),
                nm: "pad-1".into(),
                dt: "4".into(),
                vi: "0".into(),
                hw: "1".into(),
            }),
            Message::DeviceOffline(DeviceOffline { did: "pad-1".into() }),
            Message::UnitControl(UnitControl {
                from: "1".into(),
                msg: json!({"stat": "1"}),
            }),
            Message::PullInk(InkRequest {
                from: "1".into(),
                get: "pad-1".into(),
            }),
            Message::EndPullInk(InkRequest {
                from: "1".into(),
                get: "pad-1".into(),
            }),
            Message::ChatText(ChatText {
                from: "42".into(),
                msg: json!({"c": "hi"}),
                created_at: 0,
            }),
        ];

        for sample in samples {
            let wire = sample.encode().unwrap();
            let decoded = Message::decode(&wire).unwrap();
            assert_eq!(decoded, sample, "wire: {wire}");
        }
    }

    #[test]
    fn notice_shape() {
        let value: Value = serde_json::from_str(&Notice::forced_logout().to_json()).unwrap();
        assert_eq!(value, json!({"errcode": 1, "errmsg": "forced logout"}));
    }
}
