use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parses a humantime duration string (`"5m"`, `"30s"`, ...). An empty string
/// deserializes to `Duration::ZERO`, which callers treat as "disabled".
pub fn deserialize_humantime_duration<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: String = Deserialize::deserialize(d)?;
    if raw.trim().is_empty() {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}

pub fn deserialize_optional_humantime_duration<'de, D>(
    d: D,
) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Deserialize::deserialize(d)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => humantime::parse_duration(raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

pub fn serialize_humantime_duration<S>(duration: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    humantime::format_duration(*duration).to_string().serialize(s)
}

pub fn serialize_optional_humantime_duration<S>(
    duration: &Option<Duration>,
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match duration {
        Some(duration) => humantime::format_duration(*duration).to_string().serialize(s),
        None => s.serialize_none(),
    }
}
