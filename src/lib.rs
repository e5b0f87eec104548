//! Listing harvester: marketplace listing discovery, keyword extraction,
//! and cross-catalog search link generation.

pub mod browser;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod notify;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod stages;
pub mod store;
pub mod translate;

#[cfg(test)]
pub(crate) mod testing;
