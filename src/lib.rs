// ABOUTME: Library root for site-bridge, a two-host website migration bridge
// ABOUTME: Exposes the key codec, handshake, packaging, restore, rewrite and server modules

pub mod archive;
pub mod cleanup;
pub mod config;
pub mod credentials;
pub mod error;
pub mod guard;
pub mod handshake;
pub mod key;
pub mod packager;
pub mod remote;
pub mod restore;
pub mod rewrite;
pub mod sequencer;
pub mod server;
pub mod site;
pub mod store;
pub mod types;

pub use error::{BridgeError, Result};

/// Protocol version reported in handshake responses.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
