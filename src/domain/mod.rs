//! Domain Layer
//!
//! Lookup keys, results and the ports the application layer depends on.

pub mod entities;
pub mod ports;
pub mod value_objects;

pub use entities::{FailureKind, LookupFailure, LookupKey, LookupResult};
pub use value_objects::{Fields, Language};
