//! Inline tag syntax: `# HYPERSHELL[:] k1:v1 k2:v2 ...` trailing a task's
//! argument line, plus `--tag`/`-t` command-line tags at submission time.
//!
//! Grounded on `original_source/data/model.py`'s `split_argline` and
//! `ensure_valid_tag`: keys and bare (string) values match
//! `^[A-Za-z0-9_.+-]+$`, capped at 120 bytes, empty value is the bare-tag
//! case (`TagValue::String(String::new())`).

use std::sync::LazyLock;

use regex::Regex;

use crate::model::{TagMap, TagValue};

const MAX_TAG_LEN: usize = 120;
const PREFIX_PLAIN: &str = "# HYPERSHELL";
const PREFIX_COLON: &str = "# HYPERSHELL:";

static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.+-]+$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("invalid tag key: {0:?}")]
    InvalidKey(String),

    #[error("invalid tag value: {0:?}")]
    InvalidValue(String),

    #[error("tag exceeds {MAX_TAG_LEN} bytes: {0:?}")]
    TooLong(String),
}

fn ensure_token(token: &str) -> Result<(), TagError> {
    if token.len() > MAX_TAG_LEN {
        return Err(TagError::TooLong(token.to_string()));
    }
    if !TOKEN_PATTERN.is_match(token) {
        return Err(TagError::InvalidKey(token.to_string()));
    }
    Ok(())
}

/// Validate a single `key:value` (or bare `key`) tag pair and return it.
pub fn ensure_valid_tag(key: &str, value: &str) -> Result<(String, TagValue), TagError> {
    ensure_token(key)?;
    if value.is_empty() {
        return Ok((key.to_string(), TagValue::String(String::new())));
    }
    if value.len() > MAX_TAG_LEN {
        return Err(TagError::TooLong(value.to_string()));
    }
    let parsed = parse_scalar(value);
    if let TagValue::String(ref s) = parsed {
        if !TOKEN_PATTERN.is_match(s) {
            return Err(TagError::InvalidValue(value.to_string()));
        }
    }
    Ok((key.to_string(), parsed))
}

fn parse_scalar(raw: &str) -> TagValue {
    match raw {
        "true" => return TagValue::Bool(true),
        "false" => return TagValue::Bool(false),
        "null" | "none" => return TagValue::Null,
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return TagValue::Int(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return TagValue::Float(f);
    }
    TagValue::String(raw.to_string())
}

/// Parse one `k:v` / bare `k` token from a space-separated tag list.
fn parse_token(token: &str) -> Result<(String, TagValue), TagError> {
    match token.split_once(':') {
        Some((k, v)) => ensure_valid_tag(k, v),
        None => ensure_valid_tag(token, ""),
    }
}

/// Split a raw task argument line into `(args, tags)`, pulling a trailing
/// `# HYPERSHELL[:] k:v ...` comment off the line if present. Lines with no
/// such comment return an empty tag map.
pub fn split_argline(line: &str) -> Result<(String, TagMap), TagError> {
    let trimmed = line.trim_end();
    let marker = if let Some(idx) = trimmed.find(PREFIX_COLON) {
        Some((idx, PREFIX_COLON.len()))
    } else {
        trimmed.find(PREFIX_PLAIN).map(|idx| (idx, PREFIX_PLAIN.len()))
    };

    let Some((idx, prefix_len)) = marker else {
        return Ok((trimmed.to_string(), TagMap::new()));
    };

    let args = trimmed[..idx].trim_end().to_string();
    let rest = trimmed[idx + prefix_len..].trim();

    let mut tags = TagMap::new();
    for token in rest.split_whitespace() {
        let (k, v) = parse_token(token)?;
        tags.insert(k, v);
    }
    Ok((args, tags))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_line_has_no_tags() {
        let (args, tags) = split_argline("echo hello").unwrap();
        assert_eq!(args, "echo hello");
        assert!(tags.is_empty());
    }

    #[test]
    fn colon_marker_parses_key_value_pairs() {
        let (args, tags) = split_argline("echo hi  # HYPERSHELL: stage:build retries:3").unwrap();
        assert_eq!(args, "echo hi");
        assert_eq!(tags.get("stage"), Some(&TagValue::String("build".to_string())));
        assert_eq!(tags.get("retries"), Some(&TagValue::Int(3)));
    }

    #[test]
    fn bare_key_is_empty_string_tag() {
        let (_, tags) = split_argline("echo hi # HYPERSHELL priority").unwrap();
        assert_eq!(tags.get("priority"), Some(&TagValue::String(String::new())));
    }

    #[test]
    fn boolean_and_float_values_are_typed() {
        let (_, tags) =
            split_argline("echo hi # HYPERSHELL: urgent:true weight:2.5").unwrap();
        assert_eq!(tags.get("urgent"), Some(&TagValue::Bool(true)));
        assert_eq!(tags.get("weight"), Some(&TagValue::Float(2.5)));
    }

    #[test]
    fn invalid_key_is_rejected() {
        let err = split_argline("echo hi # HYPERSHELL: bad key:v").unwrap_err();
        assert!(matches!(err, TagError::InvalidKey(_)));
    }

    #[test]
    fn oversized_token_is_rejected() {
        let long = "a".repeat(MAX_TAG_LEN + 1);
        let err = ensure_valid_tag(&long, "v").unwrap_err();
        assert!(matches!(err, TagError::TooLong(_)));
    }
}
