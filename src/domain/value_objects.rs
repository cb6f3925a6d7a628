//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Response fields known to the upstream service, with their mask bits.
///
/// The names match the JSON keys of the upstream record, so a field name
/// doubles as the key to keep when trimming a response.
const FIELD_BITS: &[(&str, u32)] = &[
    ("country", 1),
    ("countryCode", 2),
    ("region", 4),
    ("regionName", 8),
    ("city", 16),
    ("zip", 32),
    ("lat", 64),
    ("lon", 128),
    ("timezone", 256),
    ("isp", 512),
    ("org", 1024),
    ("as", 2048),
    ("reverse", 4096),
    ("query", 8192),
    ("status", 16384),
    ("message", 32768),
    ("mobile", 65536),
    ("proxy", 131072),
    ("district", 524288),
    ("continent", 1048576),
    ("continentCode", 2097152),
    ("asname", 4194304),
    ("currency", 8388608),
    ("hosting", 16777216),
    ("offset", 33554432),
];

/// Set of response fields requested for a lookup.
///
/// Stored as the upstream's numeric mask so that `fields=country,city` and
/// `fields=17` normalize to the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fields(u32);

impl Fields {
    /// `status,message,country,countryCode,region,regionName,city,zip,lat,lon,timezone,isp,org,as,query`
    pub const DEFAULT: Fields = Fields(61439);

    /// Fields the proxy always needs from the upstream to classify a record.
    pub const CONTROL: Fields = Fields(8192 | 16384 | 32768);

    /// Every field the upstream knows about.
    pub const ALL: Fields = Fields(66846719);

    pub fn from_mask(mask: u32) -> Self {
        Self(mask & Self::ALL.0)
    }

    pub fn mask(&self) -> u32 {
        self.0
    }

    /// Parse a `fields` query parameter.
    ///
    /// Accepts either a numeric mask or a comma separated list of field
    /// names. Returns `None` if a name is not recognized.
    ///
    /// # Examples
    /// ```
    /// use ipapi_proxy::domain::value_objects::Fields;
    ///
    /// assert_eq!(Fields::parse("country,city"), Fields::parse("17"));
    /// assert!(Fields::parse("planet").is_none());
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Some(Self::DEFAULT);
        }
        if let Ok(mask) = s.parse::<u32>() {
            return Some(Self::from_mask(mask));
        }

        let mut mask = 0;
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let (_, bit) = FIELD_BITS.iter().find(|(n, _)| *n == name)?;
            mask |= bit;
        }
        Some(Self(mask))
    }

    pub fn union(self, other: Fields) -> Fields {
        Fields(self.0 | other.0)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        FIELD_BITS
            .iter()
            .any(|(n, bit)| *n == name && self.0 & bit != 0)
    }

    /// Field names included in this set.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        FIELD_BITS
            .iter()
            .filter(move |(_, bit)| self.0 & bit != 0)
            .map(|(name, _)| *name)
    }
}

impl Default for Fields {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Response language supported by the upstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    English,
    German,
    Spanish,
    PortugueseBrazil,
    French,
    Japanese,
    ChineseSimplified,
    Russian,
}

impl Language {
    /// Parse a language code.
    ///
    /// Unknown codes fall back to English, which is also what the upstream
    /// does, so they share a cache entry with explicit `en` lookups.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "de" => Self::German,
            "es" => Self::Spanish,
            "pt-BR" => Self::PortugueseBrazil,
            "fr" => Self::French,
            "ja" => Self::Japanese,
            "zh-CN" => Self::ChineseSimplified,
            "ru" => Self::Russian,
            _ => Self::English,
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            Self::English => "en",
            Self::German => "de",
            Self::Spanish => "es",
            Self::PortugueseBrazil => "pt-BR",
            Self::French => "fr",
            Self::Japanese => "ja",
            Self::ChineseSimplified => "zh-CN",
            Self::Russian => "ru",
        }
    }
}

impl Default for Language {
    fn default() -> Self {
        Self::English
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}
