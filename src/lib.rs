//! Realtime English <-> Thai speech-to-speech interpretation.
//!
//! - [`voice`]: the client conversation engine and everything under it
//! - [`gateway`]: the relay server that holds the upstream credential
//! - [`config`]: TOML configuration shared by both

pub mod config;
pub mod gateway;
pub mod voice;
