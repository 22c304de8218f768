//! Two-party Ethereum state channel engine.
//!
//! Channels are kept off chain as a free balance plus installed apps. Every
//! change goes through a two-party [`protocol`] run that produces commitments
//! both owners have signed, and the [`watcher`] answers on-chain disputes
//! with the latest of them.

pub mod app_instance;
pub mod apps;
pub mod chain;
pub mod challenge;
pub mod commitments;
pub mod config;
pub mod error;
pub mod free_balance;
pub mod lock;
pub mod logging;
pub mod messaging;
pub mod middleware;
pub mod outcome;
pub mod protocol;
pub mod signer;
pub mod state_channel;
pub mod store;
pub mod types;
pub mod watcher;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use protocol::ProtocolRunner;
pub use signer::ChannelSigner;
pub use state_channel::StateChannel;
pub use store::Store;
pub use watcher::Watcher;
