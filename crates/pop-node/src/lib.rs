//! # pop-node
//!
//! Wiring for the PoP mining client.
//!
//! [`Node`] opens the store, the header tracker and the operation manager and
//! connects them through the chain event bus. Transports are supplied by the
//! embedder: a `HeaderCodec` and `HeaderSource` for the followed chain and a
//! `ChainAdapter` per mined chain.

pub mod config;
mod node;

pub use config::{NodeConfig, Overrides};
pub use node::Node;
