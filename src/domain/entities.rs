//! Domain Entities - Core business objects
//!
//! These entities represent the core concepts of the lookup proxy:
//! what a caller asks for and what it gets back.

use crate::domain::value_objects::{Fields, Language};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

/// Normalized identity of a single lookup.
///
/// Two requests for the same address with the same field set and language
/// produce equal keys and therefore share cache entries and in-flight
/// upstream fetches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey {
    /// Address being resolved
    pub ip: IpAddr,
    /// Fields requested by the caller
    pub fields: Fields,
    /// Response language
    pub lang: Language,
}

impl LookupKey {
    pub fn new(ip: IpAddr, fields: Fields, lang: Language) -> Self {
        Self { ip, fields, lang }
    }

    /// Key with the default field set and English responses.
    pub fn for_ip(ip: IpAddr) -> Self {
        Self::new(ip, Fields::DEFAULT, Language::English)
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?fields={}&lang={}", self.ip, self.fields, self.lang)
    }
}

/// Why a lookup did not produce a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Query was malformed and never reached the upstream
    Invalid,
    /// Upstream answered for this key with a failure (private range, reserved range, ...)
    Rejected,
    /// Upstream answered the batch but left this key out
    Missing,
    /// The whole upstream call failed
    Unavailable,
    /// Caller stopped waiting
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Rejected => "rejected",
            Self::Missing => "missing",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
        }
    }
}

/// A failed lookup with a human readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl LookupFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Render the failure as an upstream-style record:
    /// `{"status":"fail","message":...,"query":...}`.
    pub fn to_record(&self, query: &str) -> Bytes {
        #[derive(Serialize)]
        struct FailRecord<'a> {
            status: &'static str,
            message: &'a str,
            query: &'a str,
        }

        let record = FailRecord {
            status: "fail",
            message: &self.message,
            query,
        };
        // Serializing a struct of strings cannot fail.
        Bytes::from(serde_json::to_vec(&record).unwrap_or_default())
    }
}

impl fmt::Display for LookupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Outcome of resolving a [`LookupKey`].
///
/// Successful payloads are the serialized JSON record as returned to
/// clients. `Bytes` makes cloning for every waiter and cache hit cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Success(Bytes),
    Failure(LookupFailure),
}

impl LookupResult {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure(LookupFailure::new(kind, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success(_) => None,
            Self::Failure(f) => Some(f.kind),
        }
    }

    /// JSON body for this result as seen by a client that asked for `query`.
    pub fn to_record(&self, query: &str) -> Bytes {
        match self {
            Self::Success(payload) => payload.clone(),
            Self::Failure(failure) => failure.to_record(query),
        }
    }
}
