//! Federated chat-room homeserver core: the rooms storage and streaming
//! subsystem. Everything hangs off one ordered key-value store with
//! transactional writes and monotonic commit versions; local clients and
//! remote servers are both synchronised from the per-room super-stream.

pub mod authz;
pub mod config;
pub mod error;
pub mod federation;
pub mod keys;
pub mod lock;
pub mod logging;
pub mod notifier;
pub mod rooms;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{Result, RoomservError};
pub use rooms::RoomsDb;
