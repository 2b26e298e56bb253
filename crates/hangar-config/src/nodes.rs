//! Helper functions for extracting values from KDL nodes.

use kdl::{KdlNode, KdlValue};
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

/// Look a setting up as a property (`key=value`) or as a child node
/// (`key value`), property first.
pub(crate) fn setting<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlValue> {
    if let Some(value) = node.get(name) {
        return Some(value);
    }
    node.children()?
        .nodes()
        .iter()
        .find(|child| child.name().value() == name)
        .and_then(first_arg)
}

pub(crate) fn string_setting(node: &KdlNode, name: &str) -> ConfigResult<Option<String>> {
    match setting(node, name) {
        None => Ok(None),
        Some(value) => value
            .as_string()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| invalid(name, "expected a string")),
    }
}

pub(crate) fn u32_setting(node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
    match setting(node, name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u32::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| invalid(name, "expected a non-negative integer")),
    }
}

pub(crate) fn f64_setting(node: &KdlNode, name: &str) -> ConfigResult<Option<f64>> {
    match setting(node, name) {
        None => Ok(None),
        Some(value) => value
            .as_float()
            .or_else(|| value.as_integer().map(|i| i as f64))
            .map(Some)
            .ok_or_else(|| invalid(name, "expected a number")),
    }
}

pub(crate) fn duration_setting(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    match string_setting(node, name)? {
        None => Ok(None),
        Some(raw) => parse_duration(&raw)
            .map(Some)
            .ok_or_else(|| invalid(name, &format!("invalid duration '{}'", raw))),
    }
}

/// Parse durations like `500ms`, `5s`, `10m`, `1h`.
pub(crate) fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit())?;
    let (number, unit) = raw.split_at(split);
    let number: u64 = number.parse().ok()?;

    match unit {
        "ms" => Some(Duration::from_millis(number)),
        "s" => Some(Duration::from_secs(number)),
        "m" => Some(Duration::from_secs(number * 60)),
        "h" => Some(Duration::from_secs(number * 3600)),
        _ => None,
    }
}

pub(crate) fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}
