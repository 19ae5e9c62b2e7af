//! Authenticated principals and their classification inside a unit.

use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, UnitId};

/// Device type reported by the token service for classroom controllers
/// that proxy presence for local terminals.
pub const LOCAL_CONTROL_DEVICE_TYPE: i64 = 1;

/// Role of a participant within a unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum Identity {
    #[default]
    Unclassified,
    Teacher,
    Student,
}

impl Identity {
    pub fn code(self) -> u8 {
        match self {
            Self::Unclassified => 0,
            Self::Teacher => 1,
            Self::Student => 2,
        }
    }

    /// Parse the directory's string code ("1" teacher, "2" student).
    pub fn from_code_str(raw: &str) -> Self {
        match raw.trim() {
            "1" => Self::Teacher,
            "2" => Self::Student,
            _ => Self::Unclassified,
        }
    }
}

impl From<u8> for Identity {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::Teacher,
            2 => Self::Student,
            _ => Self::Unclassified,
        }
    }
}

impl From<Identity> for u8 {
    fn from(identity: Identity) -> Self {
        identity.code()
    }
}

/// A human participant as resolved from a bearer token.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPrincipal {
    pub uid: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sex: i64,
    #[serde(default)]
    pub avatar: String,
}

/// A device terminal as resolved from a bearer token.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicePrincipal {
    pub client_id: String,
    #[serde(default)]
    pub device_type: i64,
    #[serde(default)]
    pub classroom_id: String,
    #[serde(default)]
    pub classroom_title: String,
}

/// Who is on the other end of a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    User(UserPrincipal),
    Device(DevicePrincipal),
}

impl Principal {
    /// Registry key: user id for humans, client id for devices.
    pub fn client_id(&self) -> ClientId {
        match self {
            Self::User(u) => ClientId::from_raw(u.uid.as_str()),
            Self::Device(d) => ClientId::from_raw(d.client_id.as_str()),
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Self::Device(_))
    }

    pub fn is_local_control(&self) -> bool {
        matches!(self, Self::Device(d) if d.device_type == LOCAL_CONTROL_DEVICE_TYPE)
    }
}

/// Capability flags declared by a terminal when it registers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Video-interactive flag.
    pub vi: String,
    /// Handwriting flag.
    pub hw: String,
    /// Operating system, humans only.
    pub os: String,
    /// Device type, devices only.
    pub dt: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassroomInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// Unit metadata as returned by the unit directory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitInfo {
    #[serde(default)]
    pub course_id: String,
    pub unit_id: UnitId,
    #[serde(default)]
    pub title: String,
    /// "1" while the unit is in progress.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub classroom: Vec<ClassroomInfo>,
}

impl UnitInfo {
    pub fn is_in_progress(&self) -> bool {
        self.status == "1"
    }

    /// First classroom id, the one reported in rosters.
    pub fn primary_classroom(&self) -> &str {
        self.classroom.first().map(|c| c.id.as_str()).unwrap_or_default()
    }
}
