//! Payload Value Extraction

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// First signed decimal literal in a payload. Exponents are not recognised.
const NUMBER_PATTERN: &str = r"-?\d+(?:\.\d+)?";

fn number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(NUMBER_PATTERN).expect("number pattern is valid"))
}

/// Linear transform applied to every extracted value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Scale factor (default: 1.0)
    pub multiplier: f64,
    /// Added after scaling (default: 0.0)
    pub offset: f64,
}

impl Transform {
    /// Create a transform
    pub fn new(multiplier: f64, offset: f64) -> Self {
        Self { multiplier, offset }
    }

    /// Apply `value * multiplier + offset`
    pub fn apply(&self, value: f64) -> f64 {
        value * self.multiplier + self.offset
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            offset: 0.0,
        }
    }
}

/// Extract the first numeric literal from a payload and apply the transform.
///
/// Returns `None` when the payload contains no number, or when the
/// transformed value is not finite.
pub fn extract(payload: &[u8], transform: &Transform) -> Option<f64> {
    let text = String::from_utf8_lossy(payload);
    let found = number_regex().find(&text)?;
    let raw: f64 = found.as_str().parse().ok()?;
    let value = transform.apply(raw);
    value.is_finite().then_some(value)
}
