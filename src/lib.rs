//! GhostTube - anonymized media collection.
//!
//! Discovers publicly hosted media through a privacy-preserving search
//! surface and retrieves it with an external fetch tool, with every request
//! egressing through a Tor SOCKS proxy whose identity is rotated on demand.

pub mod cli;
pub mod collect;
pub mod config;
pub mod fetch;
pub mod http_client;
pub mod privacy;
pub mod search;
