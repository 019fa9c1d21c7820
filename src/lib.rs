//! Gaxy — a reverse proxy for Google Analytics and Google Tag Manager.
//!
//! First-party pages load tracking scripts and emit beacons through a domain
//! they control; gaxy rewrites the script bodies so follow-up requests also
//! flow through the proxy, enriches beacons from request headers, caches
//! immutable script assets, and rate-limits per client.

pub mod application;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod server;

pub use application::Application;
pub use config::Settings;
pub use error::{Error, Result};
