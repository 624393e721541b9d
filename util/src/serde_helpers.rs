use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use serde::de::{Error, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub fn load_json_from_file<T, P>(path: P) -> Result<T>
where
    for<'de> T: Deserialize<'de>,
    P: AsRef<Path>,
{
    let data = std::fs::read_to_string(path)?;
    let de = &mut serde_json::Deserializer::from_str(&data);
    serde_path_to_error::deserialize(de).map_err(Into::into)
}

pub fn save_json_to_file<T, P>(value: &T, path: P) -> Result<()>
where
    T: Serialize,
    P: AsRef<Path>,
{
    let data = serde_json::to_string_pretty(value)?;
    std::fs::write(path, data)?;
    Ok(())
}

/// Human readable durations like `5s` or `1m 30s`.
pub mod humantime {
    use std::time::Duration;

    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&::humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a duration")
            }

            fn visit_str<E: Error>(self, v: &str) -> Result<Duration, E> {
                ::humantime::parse_duration(v)
                    .map_err(|_e| E::invalid_value(serde::de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_str(DurationVisitor)
    }
}

/// Values that are stored as strings in human readable formats.
pub mod string {
    use super::*;

    pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let value = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        value.parse().map_err(D::Error::custom)
    }
}
