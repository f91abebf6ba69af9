//! Bounded-wait values shared by every blocking call in the runtime.
use std::{
    fmt,
    str::FromStr,
    time::{Duration, Instant},
};

use serde::{Deserialize, Deserializer};

use crate::{constants::DEFAULT_TIMEOUT, error::ConfigError};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A normalized `(seconds, nanoseconds)` duration.
///
/// A zero timeout means "do not wait": every bounded wait that receives it
/// reports the value it currently observes and returns immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timeout {
    secs: u64,
    nanos: u32,
}

impl Timeout {
    /// Do not wait.
    pub const ZERO: Timeout = Timeout { secs: 0, nanos: 0 };

    /// Applied whenever a caller does not supply its own timeout.
    pub const DEFAULT: Timeout = Timeout::from_duration(DEFAULT_TIMEOUT);

    /// Builds a timeout, carrying whole seconds out of `nanos`.
    pub const fn new(secs: u64, nanos: u64) -> Self {
        Self {
            secs: secs.saturating_add(nanos / NANOS_PER_SEC),
            nanos: (nanos % NANOS_PER_SEC) as u32,
        }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self::new(secs, 0)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self::new(millis / 1_000, (millis % 1_000) * 1_000_000)
    }

    pub const fn from_duration(duration: Duration) -> Self {
        Self {
            secs: duration.as_secs(),
            nanos: duration.subsec_nanos(),
        }
    }

    pub const fn secs(&self) -> u64 {
        self.secs
    }

    pub const fn nanos(&self) -> u32 {
        self.nanos
    }

    pub const fn is_zero(&self) -> bool {
        self.secs == 0 && self.nanos == 0
    }

    pub const fn as_duration(&self) -> Duration {
        Duration::new(self.secs, self.nanos)
    }

    /// Fixes the timeout to an absolute point measured from now.
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.as_duration())
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::from_duration(duration)
    }
}

impl From<Timeout> for Duration {
    fn from(timeout: Timeout) -> Self {
        timeout.as_duration()
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_duration())
    }
}

/// Parses `<number>[ns|us|ms|s|m|h]`; a bare number is read as seconds.
impl FromStr for Timeout {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(ConfigError::InvalidDuration(raw.to_string()));
        }

        const UNITS: [(&str, u64); 6] = [
            ("ns", 1),
            ("us", 1_000),
            ("ms", 1_000_000),
            ("s", NANOS_PER_SEC),
            ("m", 60 * NANOS_PER_SEC),
            ("h", 3_600 * NANOS_PER_SEC),
        ];

        let (amount, nanos_per_unit) = UNITS
            .iter()
            .find_map(|(suffix, scale)| {
                value.strip_suffix(suffix).map(|rest| (rest.trim(), *scale))
            })
            .unwrap_or((value, NANOS_PER_SEC));

        let amount: u64 = amount
            .parse()
            .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;

        let total = u128::from(amount) * u128::from(nanos_per_unit);
        let secs = u64::try_from(total / u128::from(NANOS_PER_SEC))
            .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;
        let nanos = (total % u128::from(NANOS_PER_SEC)) as u64;
        Ok(Timeout::new(secs, nanos))
    }
}

impl<'de> Deserialize<'de> for Timeout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An absolute point in time derived from a [`Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline `duration` from now. Durations too large to represent never expire.
    pub fn after(duration: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(duration),
        }
    }

    /// Time left before the deadline, saturating at zero.
    pub fn remaining(&self) -> Duration {
        match self.at {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}
