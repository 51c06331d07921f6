//! Codec derivation options.
//!
//! A [`Config`] is part of a codec's identity: the same schema type derived
//! under two configurations yields two different codecs.  The only field that
//! does not affect layout is `log_level`, which [`Config::cache_key`] strips.
//!
//! Configurations are plain data and can be stored next to a persisted buffer:
//!
//! ```
//! use contig::config::{Config, IntWidth};
//!
//! let cfg = Config::from_json(r#"{ "expansion_budget": 2, "offset_width": "u16" }"#)?;
//! assert_eq!(cfg.expansion_budget, 2);
//! assert_eq!(cfg.offset_width, IntWidth::U16);
//! assert!(cfg.dereference); // unspecified fields keep their defaults
//! # Ok::<(), serde_json::Error>(())
//! ```

use serde::{Deserialize, Serialize};

use crate::layout::Layout;

/// Default bound on nested indirection unrolling.
pub const DEFAULT_EXPANSION_BUDGET: u32 = 8;

// ── IntWidth ─────────────────────────────────────────────────────────────────

/// Width of a stored unsigned integer (lengths, offsets, discriminants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntWidth {
    U8,
    U16,
    U32,
    U64,
}

impl IntWidth {
    /// Width of a machine address / `usize` on this target.
    pub const NATIVE: IntWidth = match std::mem::size_of::<usize>() {
        2 => IntWidth::U16,
        4 => IntWidth::U32,
        _ => IntWidth::U64,
    };

    #[inline]
    pub const fn size(self) -> usize {
        match self {
            IntWidth::U8  => 1,
            IntWidth::U16 => 2,
            IntWidth::U32 => 4,
            IntWidth::U64 => 8,
        }
    }

    /// Largest value the width can hold.
    #[inline]
    pub const fn max_value(self) -> u64 {
        match self {
            IntWidth::U8  => u8::MAX as u64,
            IntWidth::U16 => u16::MAX as u64,
            IntWidth::U32 => u32::MAX as u64,
            IntWidth::U64 => u64::MAX,
        }
    }

    #[inline]
    pub const fn layout(self) -> Layout {
        Layout::new(self.size(), self.size())
    }
}

// ── LogLevel ─────────────────────────────────────────────────────────────────

/// Upper bound on the diagnostics the crate emits through `tracing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Whether an event at `level` passes this bound.
    pub fn enabled(self, level: tracing::Level) -> bool {
        let rank = match level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN  => LogLevel::Warn,
            tracing::Level::INFO  => LogLevel::Info,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::TRACE => LogLevel::Trace,
        };
        self >= rank
    }
}

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Expand records and unions field by field; when off they are stored as
    /// opaque static images.
    pub recurse: bool,
    /// Follow pointers and slices; when off their raw headers are stored.
    pub dereference: bool,
    /// How many nested indirections are fully expanded before falling back
    /// to a raw header.
    pub expansion_budget: u32,
    /// Width of stored sequence lengths.
    pub length_width: IntWidth,
    /// Width of stored offsets (record field offsets and offset tables).
    pub offset_width: IntWidth,
    /// Permit a schema type to reappear on its own derivation path.
    pub allow_recursive_rereference: bool,
    /// Store pointers of unknown length as raw addresses instead of failing.
    pub serialize_unknown_pointers_as_address: bool,
    /// Fail instead of falling back when the expansion budget runs out.
    pub error_on_zero_budget: bool,
    /// Fail whenever a raw, non-portable address would be stored.
    pub error_on_unsafe_conversion: bool,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recurse:                               true,
            dereference:                           true,
            expansion_budget:                      DEFAULT_EXPANSION_BUDGET,
            length_width:                          IntWidth::NATIVE,
            offset_width:                          IntWidth::U32,
            allow_recursive_rereference:           true,
            serialize_unknown_pointers_as_address: false,
            error_on_zero_budget:                  false,
            error_on_unsafe_conversion:            false,
            log_level:                             LogLevel::Warn,
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// The configuration with every layout-neutral field normalised, used to
    /// memoize codecs.
    pub fn cache_key(&self) -> Config {
        Config { log_level: LogLevel::Off, ..self.clone() }
    }

    /// Length value reserved to mark an absent optional sequence.
    #[inline]
    pub fn length_sentinel(&self) -> u64 {
        self.length_width.max_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip_keeps_every_field() {
        let cfg = Config {
            recurse:          false,
            expansion_budget: 3,
            length_width:     IntWidth::U16,
            log_level:        LogLevel::Trace,
            ..Config::default()
        };
        let text = cfg.to_json().unwrap();
        assert_eq!(Config::from_json(&text).unwrap(), cfg);
    }

    #[test]
    fn empty_json_is_default() {
        assert_eq!(Config::from_json("{}").unwrap(), Config::default());
    }

    #[test]
    fn cache_key_ignores_log_level() {
        let quiet = Config { log_level: LogLevel::Off, ..Config::default() };
        let loud  = Config { log_level: LogLevel::Trace, ..Config::default() };
        assert_eq!(quiet.cache_key(), loud.cache_key());
    }

    #[test]
    fn log_level_bounds() {
        assert!(LogLevel::Debug.enabled(tracing::Level::WARN));
        assert!(!LogLevel::Warn.enabled(tracing::Level::DEBUG));
        assert!(!LogLevel::Off.enabled(tracing::Level::ERROR));
    }
}
