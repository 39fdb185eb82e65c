// ABOUTME: Outbound side of the bridge protocol
// ABOUTME: Wire models, the HTTP client and transport diagnostics

pub mod client;
pub mod diagnostics;
pub mod models;

pub use client::RemoteClient;
