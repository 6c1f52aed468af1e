//! The layered secure-channel (TLS) protocol.
//!
//! Built entirely on the reactor's scheduling primitives and the
//! [`Transport`](crate::transport::Transport) /
//! [`Protocol`](crate::transport::Protocol) seams; no sockets in here.

mod channel;
mod engine;
mod flow;
mod state;

pub use channel::{ChannelConfig, SecureChannel, upgrade_to_secure};
pub use engine::{PeerInfo, TlsRole};
pub use state::{AppState, ChannelState};
