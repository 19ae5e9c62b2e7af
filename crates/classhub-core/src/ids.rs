use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier assigned by an external system (user id, device client id,
/// unit id). Wrapped so the different kinds can't be mixed up.
macro_rules! external_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

external_id!(ClientId);
external_id!(UnitId);

/// Identifier minted per live connection. Two connections of the same
/// `ClientId` always carry different `ConnectionId`s.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scene counter within a unit. Starts at 1 and only grows.
pub type SceneId = i64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_has_prefix() {
        let id = ConnectionId::new();
        assert!(id.as_str().starts_with("conn_"), "got: {id}");
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn client_id_preserves_raw_value() {
        let id = ClientId::from_raw("10086");
        assert_eq!(id.as_str(), "10086");
        assert_eq!(id.to_string(), "10086");
    }

    #[test]
    fn unit_id_serializes_transparently() {
        let id = UnitId::from_raw("u-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"u-42\"");
        let parsed: UnitId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
