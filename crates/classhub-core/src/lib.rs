//! Shared types for the classroom hub: identifiers, principals, the wire
//! protocol and recipient selectors.

pub mod errors;
pub mod ids;
pub mod principal;
pub mod protocol;
pub mod selector;

pub use errors::ProtocolError;
pub use ids::{ClientId, ConnectionId, SceneId, UnitId};
pub use principal::{
    Capabilities, DevicePrincipal, Identity, Principal, UnitInfo, UserPrincipal,
};
pub use protocol::{Act, Message, Notice, RoutedMessage};
pub use selector::{Group, RecipientSelector};
