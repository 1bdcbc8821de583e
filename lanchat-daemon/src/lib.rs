//! LanChat node: control and file listeners, connection registry, transfer workers and the
//! event gateway around `lanchat-core`.

pub mod config;
pub mod console;
mod control;
pub mod error;
pub mod framing;
pub mod gateway;
mod node;
mod poller;
pub mod registry;
pub mod store;
mod transfer;

pub use config::{Cli, Config};
pub use control::{CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT};
pub use error::NodeError;
pub use node::{ConnectTarget, Node};
pub use transfer::{TransferFailure, TRANSFER_TIMEOUT};
