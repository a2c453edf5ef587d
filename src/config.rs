//! Serde plumbing shared by the per-transport configuration structs, so
//! hosts can embed them in their own configuration files. Durations are
//! written as seconds, fractional values allowed.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub mod duration_secs {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "{} is not a valid duration in seconds",
                seconds
            )));
        }
        Ok(Duration::from_secs_f64(seconds))
    }
}

pub mod opt_duration_secs {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let seconds = Option::<f64>::deserialize(deserializer)?;
        match seconds {
            None => Ok(None),
            Some(seconds) if seconds.is_finite() && seconds >= 0.0 => {
                Ok(Some(Duration::from_secs_f64(seconds)))
            }
            Some(seconds) => Err(serde::de::Error::custom(format!(
                "{} is not a valid duration in seconds",
                seconds
            ))),
        }
    }
}
