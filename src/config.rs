use serde::Deserialize;

use crate::error::ConfigError;

// ─── Defaults ────────────────────────────────────────────────────

/// Rotation period of every window
const DEFAULT_WINDOW_MS: i64 = 1000;

/// Side of the L×L bucket matrix (addressable latencies 0..L²-1)
const DEFAULT_BUCKET_LEN: usize = 256;

/// Largest accepted side; 2^16 already addresses ~50 days in ms
const MAX_BUCKET_LEN: usize = 1 << 16;

// ─── Public types ────────────────────────────────────────────────

/// What to do with an event whose start or end time is missing (≤ 0).
///
/// Such events never reach the latency buckets. The only question is
/// whether they still show up in the request/success/failure totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UntimedPolicy {
    /// Count the outcome in the totals, without a latency sample.
    #[default]
    Count,
    /// Drop the outcome from the window entirely.
    Skip,
}

/// Raw window configuration, as deserialized from whatever the host
/// runtime loads its settings from.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    /// Milliseconds between two histogram rotations
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,

    /// Bucket matrix side; rounded up to the next power of two
    #[serde(default = "default_bucket_len")]
    pub bucket_len: usize,

    #[serde(default)]
    pub untimed: UntimedPolicy,
}

fn default_window_ms() -> i64 {
    DEFAULT_WINDOW_MS
}
fn default_bucket_len() -> usize {
    DEFAULT_BUCKET_LEN
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            bucket_len: DEFAULT_BUCKET_LEN,
            untimed: UntimedPolicy::default(),
        }
    }
}

/// Validated configuration. Building windows from it cannot fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub(crate) window_ms: i64,
    /// log2 of the bucket matrix side
    pub(crate) shift: u32,
    pub(crate) untimed: UntimedPolicy,
}

// ─── Impl ────────────────────────────────────────────────────────

impl WindowConfig {
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        if self.window_ms <= 0 {
            return Err(ConfigError::NonPositiveWindow(self.window_ms));
        }
        Ok(Settings {
            window_ms: self.window_ms,
            shift: bucket_shift(self.bucket_len)?,
            untimed: self.untimed,
        })
    }
}

impl Settings {
    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Effective (power of two) bucket matrix side.
    pub fn bucket_len(&self) -> usize {
        1 << self.shift
    }

    pub fn untimed(&self) -> UntimedPolicy {
        self.untimed
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            shift: DEFAULT_BUCKET_LEN.trailing_zeros(),
            untimed: UntimedPolicy::default(),
        }
    }
}

/// Rounds `len` up to a power of two and returns its exponent.
pub(crate) fn bucket_shift(len: usize) -> Result<u32, ConfigError> {
    if len == 0 {
        return Err(ConfigError::ZeroBucketLength);
    }
    match len.checked_next_power_of_two() {
        Some(side) if side <= MAX_BUCKET_LEN => Ok(side.trailing_zeros()),
        _ => Err(ConfigError::BucketLengthTooLarge(len)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = WindowConfig::default().validate().unwrap();
        assert_eq!(settings.window_ms(), 1000);
        assert_eq!(settings.bucket_len(), 256);
        assert_eq!(settings.untimed(), UntimedPolicy::Count);
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn bucket_len_rounds_up_to_power_of_two() {
        assert_eq!(bucket_shift(1), Ok(0));
        assert_eq!(bucket_shift(200), Ok(8));
        assert_eq!(bucket_shift(256), Ok(8));
        assert_eq!(bucket_shift(257), Ok(9));
    }

    #[test]
    fn zero_bucket_len_is_rejected() {
        let config = WindowConfig {
            bucket_len: 0,
            ..WindowConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroBucketLength));
    }

    #[test]
    fn oversized_bucket_len_is_rejected() {
        assert_eq!(
            bucket_shift(MAX_BUCKET_LEN + 1),
            Err(ConfigError::BucketLengthTooLarge(MAX_BUCKET_LEN + 1))
        );
    }

    #[test]
    fn non_positive_window_is_rejected() {
        let config = WindowConfig {
            window_ms: 0,
            ..WindowConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveWindow(0)));
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: WindowConfig =
            serde_json::from_str(r#"{ "window_ms": 500, "untimed": "skip" }"#).unwrap();
        assert_eq!(config.window_ms, 500);
        assert_eq!(config.bucket_len, 256);
        assert_eq!(config.untimed, UntimedPolicy::Skip);
    }
}
