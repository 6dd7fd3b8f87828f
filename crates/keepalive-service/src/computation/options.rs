use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// A duration that may also be infinite.
///
/// In configuration files this is written as a humantime string such as `"2s"` or `"1m 30s"`,
/// or as the literal `"infinite"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Timeout {
    Finite(Duration),
    /// The mechanism governed by this timeout never fires on its own.
    #[default]
    Infinite,
}

impl Timeout {
    pub fn from_secs(secs: u64) -> Self {
        Self::Finite(Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::Finite(Duration::from_millis(millis))
    }

    /// Returns the finite duration, or `None` for [`Timeout::Infinite`].
    pub fn finite(self) -> Option<Duration> {
        match self {
            Self::Finite(duration) => Some(duration),
            Self::Infinite => None,
        }
    }

    pub fn is_infinite(self) -> bool {
        matches!(self, Self::Infinite)
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::Finite(duration)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finite(duration) => write!(f, "{}", humantime::format_duration(*duration)),
            Self::Infinite => f.write_str("infinite"),
        }
    }
}

impl Serialize for Timeout {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct TimeoutVisitor;

impl de::Visitor<'_> for TimeoutVisitor {
    type Value = Timeout;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a duration like `2s` or the string `infinite`")
    }

    fn visit_str<E>(self, value: &str) -> Result<Timeout, E>
    where
        E: de::Error,
    {
        let value = value.trim();
        if value.eq_ignore_ascii_case("infinite") {
            return Ok(Timeout::Infinite);
        }
        humantime::parse_duration(value)
            .map(Timeout::Finite)
            .map_err(|err| E::custom(format_args!("invalid duration `{value}`: {err}")))
    }
}

impl<'de> Deserialize<'de> for Timeout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(TimeoutVisitor)
    }
}

/// Per-computation lifecycle configuration.
///
/// Options are fixed for the whole lifetime of a computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ComputationOptions {
    /// Whether the computation keeps its output around after it was produced.
    pub caching_enabled: bool,

    /// How long the cached output is retained after the last use.
    pub output_release_time: Timeout,

    /// How long the computation stays pinned after the last use.
    pub keep_alive_time: Timeout,
}

impl Default for ComputationOptions {
    fn default() -> Self {
        Self {
            caching_enabled: false,
            output_release_time: Timeout::Infinite,
            keep_alive_time: Timeout::from_secs(1),
        }
    }
}

impl ComputationOptions {
    /// Options for a computation whose output is released `after` its last use.
    pub fn cached(output_release_time: impl Into<Timeout>) -> Self {
        Self {
            caching_enabled: true,
            output_release_time: output_release_time.into(),
            keep_alive_time: Timeout::Infinite,
        }
    }

    /// Options for an uncached computation that is pinned for `keep_alive_time` after its last use.
    pub fn uncached(keep_alive_time: impl Into<Timeout>) -> Self {
        Self {
            caching_enabled: false,
            output_release_time: Timeout::Infinite,
            keep_alive_time: keep_alive_time.into(),
        }
    }

    /// Options under which neither lifecycle mechanism ever fires.
    pub fn pinned_forever() -> Self {
        Self {
            caching_enabled: true,
            output_release_time: Timeout::Infinite,
            keep_alive_time: Timeout::Infinite,
        }
    }

    /// Selects which lifecycle bucket governs a computation with these options.
    pub fn pin_policy(&self) -> PinPolicy {
        if self.caching_enabled {
            if let Timeout::Finite(after) = self.output_release_time {
                return PinPolicy::PinByOutputRelease(after);
            }
        }
        match self.keep_alive_time {
            Timeout::Finite(after) => PinPolicy::PinByKeepAlive(after),
            Timeout::Infinite => PinPolicy::NoPin,
        }
    }
}

/// The lifecycle mechanism that applies to one computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PinPolicy {
    /// The cached output is released this long after the last use.
    PinByOutputRelease(Duration),
    /// The computation is pinned this long after the last use.
    PinByKeepAlive(Duration),
    /// No scheduling happens at all.
    NoPin,
}
