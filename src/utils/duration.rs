//! Duration strings as written in Kubernetes objects and configuration.
//!
//! Values follow the Go `time.ParseDuration` grammar (`300ms`, `1.5s`, `1h30m`).
//! The words `infinity` and `infinite` disable a timeout outright.

use std::time::Duration;

/// Interpreted timeout value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum TimeoutSetting {
    /// Not specified; Envoy's default applies
    #[default]
    Default,
    /// Explicitly disabled
    Disabled,
    /// A concrete positive duration
    Value(Duration),
}

impl TimeoutSetting {
    pub fn is_default(&self) -> bool {
        matches!(self, TimeoutSetting::Default)
    }

    /// Envoy expresses a disabled timeout as a zero duration.
    pub fn as_envoy_duration(&self) -> Option<envoy_types::pb::google::protobuf::Duration> {
        match self {
            TimeoutSetting::Default => None,
            TimeoutSetting::Disabled => Some(envoy_types::pb::google::protobuf::Duration {
                seconds: 0,
                nanos: 0,
            }),
            TimeoutSetting::Value(d) => Some(to_proto_duration(*d)),
        }
    }
}

/// Parse a timeout string. An empty string yields [`TimeoutSetting::Default`].
pub fn parse_timeout(value: &str) -> Result<TimeoutSetting, String> {
    let trimmed = value.trim();
    match trimmed {
        "" => Ok(TimeoutSetting::Default),
        "infinity" | "infinite" => Ok(TimeoutSetting::Disabled),
        other => {
            let duration = parse_duration(other)?;
            if duration.is_zero() {
                Ok(TimeoutSetting::Disabled)
            } else {
                Ok(TimeoutSetting::Value(duration))
            }
        }
    }
}

/// Parse a Go style duration string.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let input = value.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if input.starts_with('-') {
        return Err(format!("negative duration {input:?} is not allowed"));
    }
    let mut rest = input.strip_prefix('+').unwrap_or(input);
    if rest == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos: u128 = 0;
    while !rest.is_empty() {
        let number_len =
            rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(tail.len());
        if unit_len == 0 {
            return Err(format!("missing unit in duration {input:?}"));
        }
        let (unit, remainder) = tail.split_at(unit_len);

        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            other => return Err(format!("unknown unit {other:?} in duration {input:?}")),
        };

        let (whole, fraction) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(format!("invalid duration {input:?}"));
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| format!("invalid duration {input:?}"))?
        };
        total_nanos += whole * scale;

        if !fraction.is_empty() {
            if fraction.contains('.') {
                return Err(format!("invalid duration {input:?}"));
            }
            let mut divisor: u128 = 1;
            let mut digits: u128 = 0;
            for c in fraction.chars().take(18) {
                digits = digits * 10 + u128::from(c.to_digit(10).unwrap_or(0));
                divisor *= 10;
            }
            total_nanos += digits * scale / divisor;
        }

        rest = remainder;
    }

    let secs = u64::try_from(total_nanos / 1_000_000_000)
        .map_err(|_| format!("duration {input:?} is out of range"))?;
    let nanos = (total_nanos % 1_000_000_000) as u32;
    Ok(Duration::new(secs, nanos))
}

/// Convert a std duration into the protobuf representation.
pub fn to_proto_duration(d: Duration) -> envoy_types::pb::google::protobuf::Duration {
    envoy_types::pb::google::protobuf::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_units() {
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("invalid-timeout").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn timeout_settings() {
        assert_eq!(parse_timeout("").unwrap(), TimeoutSetting::Default);
        assert_eq!(parse_timeout("infinity").unwrap(), TimeoutSetting::Disabled);
        assert_eq!(parse_timeout("infinite").unwrap(), TimeoutSetting::Disabled);
        assert_eq!(parse_timeout("0s").unwrap(), TimeoutSetting::Disabled);
        assert_eq!(
            parse_timeout("1m").unwrap(),
            TimeoutSetting::Value(Duration::from_secs(60))
        );
        assert!(parse_timeout("invalid-timeout").is_err());
    }

    #[test]
    fn envoy_representation() {
        assert!(TimeoutSetting::Default.as_envoy_duration().is_none());
        let disabled = TimeoutSetting::Disabled.as_envoy_duration().unwrap();
        assert_eq!((disabled.seconds, disabled.nanos), (0, 0));
        let value = TimeoutSetting::Value(Duration::from_millis(2500)).as_envoy_duration().unwrap();
        assert_eq!((value.seconds, value.nanos), (2, 500_000_000));
    }
}
