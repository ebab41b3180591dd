//! Shared time and config-file helpers used across the engine.
//!
//! Duration strings follow the `\d+(us|ms|s|m|h|d)` grammar; mixed units sum,
//! so `"10m30s"` parses to 630 seconds. Timestamps are UTC unix seconds as
//! `f64` throughout the controller; metric rows scale to seconds, trace rows
//! to microseconds.

use std::sync::LazyLock;

use chrono::DateTime;
use regex::Regex;
use serde_yaml::Value;

use crate::error::OxnError;

/// Grammar for duration strings with units.
pub const TIME_STRING_FORMAT: &str = r"(\d+)(us|ms|s|m|h|d)";

static TIME_STRING_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(TIME_STRING_FORMAT).expect("time string regex is valid"));

/// Seconds per unit for duration-string conversion.
fn unit_seconds(unit: &str) -> f64 {
    match unit {
        "us" => 1e-6,
        "ms" => 1e-3,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        "d" => 86400.0,
        _ => unreachable!("regex only captures known units"),
    }
}

/// Validate that a time string has at least one value-unit pair.
pub fn validate_time_string(time_string: &str) -> bool {
    TIME_STRING_REGEX.is_match(time_string)
}

/// Convert a time string with units to seconds. Mixed units sum.
///
/// Unmatched input yields 0.0; callers that need to reject unit-less strings
/// validate with [`validate_time_string`] first.
pub fn time_string_to_seconds(time_string: &str) -> f64 {
    TIME_STRING_REGEX
        .captures_iter(time_string)
        .map(|capture| {
            let value: f64 = capture[1].parse().expect("regex captures digits only");
            value * unit_seconds(&capture[2])
        })
        .sum()
}

/// Convert seconds to milliseconds.
pub fn to_milliseconds(seconds: f64) -> f64 {
    seconds * 1e3
}

/// Convert seconds to microseconds.
pub fn to_microseconds(seconds: f64) -> f64 {
    seconds * 1e6
}

/// Current UTC time as unix seconds with sub-second precision.
pub fn utc_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Human-readable version of a unix timestamp in seconds.
pub fn humanize_utc_timestamp(timestamp: f64) -> String {
    let micros = (timestamp * 1e6).round() as i64;
    match DateTime::from_timestamp_micros(micros) {
        Some(datetime) => datetime.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        None => format!("{timestamp}"),
    }
}

/// Add or replace an environment variable for a service in a compose file.
///
/// The `environment` section must be the list form (`NAME=value` entries).
pub fn add_env_variable(
    compose_file_path: &str,
    service_name: &str,
    variable_name: &str,
    variable_value: &str,
) -> Result<(), OxnError> {
    let mut compose = read_yaml(compose_file_path)?;
    let environment = service_environment(&mut compose, service_name)?;
    let entry = Value::String(format!("{variable_name}={variable_value}"));
    let prefix = format!("{variable_name}=");
    let existing = environment
        .iter_mut()
        .find(|item| item.as_str().is_some_and(|s| s.starts_with(&prefix)));
    match existing {
        Some(item) => *item = entry,
        None => environment.push(entry),
    }
    write_yaml(compose_file_path, &compose)
}

/// Remove an environment variable entry (`NAME=value`) from a service in a
/// compose file. A missing entry is not an error.
pub fn remove_env_variable(
    compose_file_path: &str,
    service_name: &str,
    variable_name: &str,
    variable_value: &str,
) -> Result<(), OxnError> {
    let mut compose = read_yaml(compose_file_path)?;
    let environment = service_environment(&mut compose, service_name)?;
    let entry = format!("{variable_name}={variable_value}");
    environment.retain(|item| item.as_str() != Some(entry.as_str()));
    write_yaml(compose_file_path, &compose)
}

fn read_yaml(path: &str) -> Result<Value, OxnError> {
    let contents = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&contents)
        .map_err(|e| OxnError::validation_explained(format!("File {path} is not valid YAML"), e.to_string()))
}

fn write_yaml(path: &str, value: &Value) -> Result<(), OxnError> {
    let contents = serde_yaml::to_string(value)
        .map_err(|e| OxnError::validation_explained(format!("Cannot serialize YAML for {path}"), e.to_string()))?;
    std::fs::write(path, contents)?;
    Ok(())
}

fn service_environment<'a>(
    compose: &'a mut Value,
    service_name: &str,
) -> Result<&'a mut Vec<Value>, OxnError> {
    let service = compose
        .get_mut("services")
        .and_then(|services| services.get_mut(service_name))
        .ok_or_else(|| {
            OxnError::validation_explained(
                "Cannot modify compose file",
                format!("Service {service_name} not found in compose file"),
            )
        })?;
    let mapping = service.as_mapping_mut().ok_or_else(|| {
        OxnError::validation_explained(
            "Cannot modify compose file",
            format!("Service {service_name} is not a mapping"),
        )
    })?;
    let key = Value::String("environment".into());
    if !mapping.contains_key(&key) {
        mapping.insert(key.clone(), Value::Sequence(Vec::new()));
    }
    match mapping.get_mut(&key) {
        Some(Value::Sequence(seq)) => Ok(seq),
        _ => Err(OxnError::validation_explained(
            "Cannot modify compose file",
            format!("Environment field for {service_name} is not a list"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_unit() {
        assert_eq!(time_string_to_seconds("30s"), 30.0);
        assert_eq!(time_string_to_seconds("2m"), 120.0);
        assert_eq!(time_string_to_seconds("1h"), 3600.0);
        assert_eq!(time_string_to_seconds("1d"), 86400.0);
    }

    #[test]
    fn parses_sub_second_units() {
        assert_eq!(time_string_to_seconds("500ms"), 0.5);
        assert!((time_string_to_seconds("250us") - 0.00025).abs() < 1e-12);
    }

    #[test]
    fn mixed_units_sum() {
        assert_eq!(time_string_to_seconds("10m30s"), 630.0);
        assert_eq!(time_string_to_seconds("1h30m"), 5400.0);
    }

    #[test]
    fn zero_duration_is_accepted() {
        assert!(validate_time_string("0m"));
        assert_eq!(time_string_to_seconds("0m"), 0.0);
    }

    #[test]
    fn unitless_strings_are_rejected() {
        assert!(!validate_time_string("30"));
        assert!(!validate_time_string(""));
        assert!(!validate_time_string("fast"));
    }

    #[test]
    fn scales_to_milliseconds_and_microseconds() {
        assert_eq!(to_milliseconds(1.5), 1500.0);
        assert_eq!(to_microseconds(1.5), 1_500_000.0);
    }

    #[test]
    fn humanizes_timestamps() {
        let rendered = humanize_utc_timestamp(0.0);
        assert_eq!(rendered, "1970-01-01 00:00:00.000000");
    }

    #[test]
    fn adds_and_replaces_env_variables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("compose.yml");
        std::fs::write(
            &path,
            "services:\n  frontend:\n    image: frontend:latest\n",
        )
        .expect("write compose");
        let path = path.to_str().expect("utf-8 path");

        add_env_variable(path, "frontend", "OTEL_METRIC_EXPORT_INTERVAL", "5000")
            .expect("add env var");
        let contents = std::fs::read_to_string(path).expect("read compose");
        assert!(contents.contains("OTEL_METRIC_EXPORT_INTERVAL=5000"));

        add_env_variable(path, "frontend", "OTEL_METRIC_EXPORT_INTERVAL", "10000")
            .expect("replace env var");
        let contents = std::fs::read_to_string(path).expect("read compose");
        assert!(contents.contains("OTEL_METRIC_EXPORT_INTERVAL=10000"));
        assert!(!contents.contains("OTEL_METRIC_EXPORT_INTERVAL=5000"));
    }

    #[test]
    fn removes_env_variables_by_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("compose.yml");
        std::fs::write(
            &path,
            "services:\n  frontend:\n    environment:\n      - A=1\n      - B=2\n",
        )
        .expect("write compose");
        let path = path.to_str().expect("utf-8 path");

        remove_env_variable(path, "frontend", "A", "1").expect("remove env var");
        let contents = std::fs::read_to_string(path).expect("read compose");
        assert!(!contents.contains("A=1"));
        assert!(contents.contains("B=2"));
    }

    #[test]
    fn unknown_service_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("compose.yml");
        std::fs::write(&path, "services:\n  frontend:\n    image: x\n").expect("write compose");
        let result = add_env_variable(path.to_str().expect("utf-8 path"), "backend", "A", "1");
        assert!(result.is_err());
    }
}
