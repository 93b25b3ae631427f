//! Connection status and reconnect pacing.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

// ============================================================================
// PullStatus
// ============================================================================

/// Connection status reported to the host application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullStatus {
    /// No connection.
    #[default]
    Offline,
    /// A connector is connecting.
    Connecting,
    /// The active connector is connected.
    Online,
}

impl fmt::Display for PullStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offline => "offline",
            Self::Connecting => "connecting",
            Self::Online => "online",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Largest random addition to a backoff delay, as a fraction of it.
const MAX_JITTER: f64 = 0.2;

/// Base delay before connection attempt `attempt`.
#[must_use]
pub fn base_delay(attempt: u32) -> Duration {
    match attempt {
        0 => Duration::from_millis(500),
        1..=2 => Duration::from_secs(15),
        3..=4 => Duration::from_secs(45),
        5..=9 => Duration::from_secs(600),
        _ => Duration::from_secs(3600),
    }
}

/// Base delay plus up to 20 % jitter.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = base_delay(attempt);
    let jitter = rand::rng().random_range(0.0..=MAX_JITTER);
    base.mul_f64(1.0 + jitter)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_steps() {
        assert_eq!(base_delay(0), Duration::from_millis(500));
        assert_eq!(base_delay(1), Duration::from_secs(15));
        assert_eq!(base_delay(2), Duration::from_secs(15));
        assert_eq!(base_delay(3), Duration::from_secs(45));
        assert_eq!(base_delay(4), Duration::from_secs(45));
        assert_eq!(base_delay(5), Duration::from_secs(600));
        assert_eq!(base_delay(9), Duration::from_secs(600));
        assert_eq!(base_delay(10), Duration::from_secs(3600));
        assert_eq!(base_delay(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_jitter_is_bounded() {
        for attempt in 0..12 {
            let base = base_delay(attempt);
            for _ in 0..50 {
                let delay = backoff_delay(attempt);
                assert!(delay >= base);
                assert!(delay <= base.mul_f64(1.0 + MAX_JITTER));
            }
        }
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(PullStatus::default(), PullStatus::Offline);
        assert_eq!(PullStatus::Online.to_string(), "online");
        assert_eq!(
            serde_json::to_string(&PullStatus::Connecting).expect("serialize"),
            "\"connecting\""
        );
    }
}
