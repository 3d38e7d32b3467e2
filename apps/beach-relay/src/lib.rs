//! Rendezvous relay for WebRTC signaling.
//!
//! Peers open a WebSocket to the signaling endpoint, identify themselves
//! once, receive the ids of everyone already connected, and then exchange
//! envelopes addressed by id. The relay stamps each envelope with the
//! sender's id and forwards it untouched otherwise.

pub mod cli;
pub mod config;
pub mod echo;
pub mod envelope;
pub mod registry;
pub mod server;
pub mod session;
pub mod telemetry;

pub use config::{RelayConfig, ServeArgs, SessionSettings};
pub use envelope::{DecodeError, Envelope};
pub use registry::{PeerRegistry, PeerSender, RegistryError, SessionToken};
pub use server::{router, serve, RelayState};
