use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Process-wide booking rules, loaded once and injected into each operation.
/// May be replaced between requests; last write wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Active bookings a student may hold per calendar month, across branches.
    pub max_bookings_per_month: u32,
    /// Students may cancel without penalty up to this many hours before start.
    pub cancellation_hours: i64,
    /// When false, students may only book slots at their home branch.
    pub allow_cross_branch_booking: bool,
    /// Lifetime of a priority-reschedule grant.
    pub priority_grant_days: i64,
    /// Lifetime of an administrative monthly-limit bypass.
    pub monthly_bypass_days: i64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_bookings_per_month: 1,
            cancellation_hours: 24,
            allow_cross_branch_booking: true,
            priority_grant_days: 7,
            monthly_bypass_days: 30,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl SystemConfig {
    /// Read configuration from `ROTA_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_bookings_per_month: env_parse("ROTA_MAX_BOOKINGS_PER_MONTH", d.max_bookings_per_month),
            cancellation_hours: env_parse("ROTA_CANCELLATION_HOURS", d.cancellation_hours),
            allow_cross_branch_booking: env_parse(
                "ROTA_ALLOW_CROSS_BRANCH_BOOKING",
                d.allow_cross_branch_booking,
            ),
            priority_grant_days: env_parse("ROTA_PRIORITY_GRANT_DAYS", d.priority_grant_days),
            monthly_bypass_days: env_parse("ROTA_MONTHLY_BYPASS_DAYS", d.monthly_bypass_days),
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> io::Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
