//! # Weft Core
//!
//! Session manager for a weft mesh overlay node: the authenticated,
//! encrypted, stateful channel between two peers identified by their
//! long-lived public keys.
//!
//! This crate provides:
//! - Session lifecycle (creation, ping/pong handshake, re-key, termination)
//! - Nonce-ordered replay protection with an out-of-order window
//! - Ordered encrypt/decrypt pipelines over a shared crypto worker pool
//! - Session indexing by handle and by peer key, with admission policy
//! - Wire codecs for handshake and traffic packets
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       SessionTable                          │
//! │   (indexes, admission policy, handshake dispatch, sweep)   │
//! ├────────────────────────────────────────────────────────────┤
//! │       SessionInfo        │         Conn / Listener          │
//! │  (keys, nonces, window)  │   (application send/recv/mtu)   │
//! ├────────────────────────────────────────────────────────────┤
//! │    send / recv workers over the shared CryptoPool           │
//! │        (head-of-line ordered commit, init gate)            │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The switch/routing layer, DHT, and datagram adaptation are external
//! collaborators: the router feeds [`SessionTable::handle_protocol_packet`]
//! and [`SessionTable::handle_traffic`], and consumes the encoded packets
//! the table emits on its output channel.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod conn;
pub mod error;
pub mod latch;
pub mod pool;
pub mod session;
pub mod table;
pub mod window;
pub mod wire;

mod pipeline;

pub use config::{PoolConfig, SessionConfig};
pub use conn::{Conn, SessionListener};
pub use error::{Result, SessionError, WireError};
pub use latch::Latch;
pub use pool::CryptoPool;
pub use session::{FlowKeyMessage, MIN_SESSION_MTU, SessionInfo, SessionSnapshot};
pub use table::{AllowPolicy, SessionTable};
pub use window::{NONCE_WINDOW, NONCE_WINDOW_CAP, NonceWindow};
pub use wire::{ProtocolPacket, SessionPing, TrafficPacket};
