//! ipapi-proxy Library
//!
//! Caching, request-coalescing proxy for the ip-api.com geolocation service.
//! This module exposes the components for use in integration tests and as a
//! library.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use adapters::inbound::{HttpLimits, HttpServer};
pub use adapters::outbound::{IpApiConfig, IpApiFetcher};
pub use application::{BatchConfig, Batcher};
pub use config::{load_config, Config, ConfigError};
pub use domain::entities::{FailureKind, LookupFailure, LookupKey, LookupResult};
pub use domain::ports::{FetchError, Fetcher};
pub use domain::value_objects::{Fields, Language};
pub use infrastructure::{BoundedCache, LookupCache, ShutdownController};
