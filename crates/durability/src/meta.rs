//! Text metadata for persisted history.
//!
//! Newline-separated `key:value` lines, one file per persisted entry plus
//! one `state.meta` per root. A `version` line guards both formats; a
//! mismatched version token fails the parse.

use std::collections::HashMap;

use histree_core::{Error, Result};

/// Current entry metadata version token
pub const ENTRY_META_VERSION: u32 = 1;

/// Current state metadata version token
pub const STATE_META_VERSION: u32 = 1;

/// Metadata describing one persisted snapshot entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Generation the snapshot was captured at.
    pub generation: u64,
    /// Payload-byte estimate recorded at capture time.
    pub bytes: usize,
    /// Wall-clock milliseconds of the capture.
    pub timestamp_ms: u64,
}

/// Metadata describing one persisted root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateMetadata {
    /// Generation of the live snapshot.
    pub live_generation: u64,
    /// Undo stack generations, oldest first.
    pub undo_generations: Vec<u64>,
    /// Redo stack generations, oldest first.
    pub redo_generations: Vec<u64>,
    /// Whether retention was manual when the state was written.
    pub manual_gc: bool,
    /// Configured RAM cache entries.
    pub ram_cache_entries: usize,
}

fn encode_lines(pairs: &[(&str, String)]) -> String {
    let mut text = String::new();
    for (key, value) in pairs {
        text.push_str(key);
        text.push(':');
        text.push_str(value);
        text.push('\n');
    }
    text
}

fn parse_lines(text: &str, context: &str) -> Result<HashMap<String, String>> {
    let mut values = HashMap::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(Error::MalformedInput(format!("{context}: invalid line")));
        };
        values.insert(key.to_string(), value.to_string());
    }
    Ok(values)
}

fn require_field<T: std::str::FromStr>(
    values: &HashMap<String, String>,
    key: &str,
    context: &str,
) -> Result<T> {
    let raw = values
        .get(key)
        .ok_or_else(|| Error::MalformedInput(format!("{context}: missing {key}")))?;
    raw.parse::<T>()
        .map_err(|_| Error::MalformedInput(format!("{context}: invalid {key}")))
}

fn join_generations(generations: &[u64]) -> String {
    generations
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_generations(raw: &str, context: &str) -> Result<Vec<u64>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|token| {
            token.parse::<u64>().map_err(|_| {
                Error::MalformedInput(format!("{context}: invalid generation list"))
            })
        })
        .collect()
}

/// Encode entry metadata as `key:value` text.
pub fn encode_entry_meta(meta: &EntryMetadata) -> String {
    encode_lines(&[
        ("version", ENTRY_META_VERSION.to_string()),
        ("generation", meta.generation.to_string()),
        ("bytes", meta.bytes.to_string()),
        ("timestamp_ms", meta.timestamp_ms.to_string()),
    ])
}

/// Parse entry metadata, validating the version token.
pub fn parse_entry_meta(text: &str) -> Result<EntryMetadata> {
    let context = "entry metadata";
    let values = parse_lines(text, context)?;
    let version: u32 = require_field(&values, "version", context)?;
    if version != ENTRY_META_VERSION {
        return Err(Error::MalformedInput(format!(
            "{context}: unsupported version {version}"
        )));
    }
    Ok(EntryMetadata {
        generation: require_field(&values, "generation", context)?,
        bytes: require_field(&values, "bytes", context)?,
        timestamp_ms: require_field(&values, "timestamp_ms", context)?,
    })
}

/// Encode state metadata as `key:value` text.
pub fn encode_state_meta(meta: &StateMetadata) -> String {
    encode_lines(&[
        ("version", STATE_META_VERSION.to_string()),
        ("live_generation", meta.live_generation.to_string()),
        ("undo", join_generations(&meta.undo_generations)),
        ("redo", join_generations(&meta.redo_generations)),
        ("manual_gc", if meta.manual_gc { "1" } else { "0" }.to_string()),
        ("ram_cache_entries", meta.ram_cache_entries.to_string()),
    ])
}

/// Parse state metadata, validating the version token.
pub fn parse_state_meta(text: &str) -> Result<StateMetadata> {
    let context = "state metadata";
    let values = parse_lines(text, context)?;
    let version: u32 = require_field(&values, "version", context)?;
    if version != STATE_META_VERSION {
        return Err(Error::MalformedInput(format!(
            "{context}: unsupported version {version}"
        )));
    }
    let undo_raw = values
        .get("undo")
        .ok_or_else(|| Error::MalformedInput(format!("{context}: missing undo")))?;
    let redo_raw = values
        .get("redo")
        .ok_or_else(|| Error::MalformedInput(format!("{context}: missing redo")))?;
    let manual: u32 = require_field(&values, "manual_gc", context)?;
    Ok(StateMetadata {
        live_generation: require_field(&values, "live_generation", context)?,
        undo_generations: parse_generations(undo_raw, context)?,
        redo_generations: parse_generations(redo_raw, context)?,
        manual_gc: manual != 0,
        ram_cache_entries: require_field(&values, "ram_cache_entries", context)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_meta_round_trip() {
        let meta = EntryMetadata {
            generation: 42,
            bytes: 1024,
            timestamp_ms: 1_700_000_000_000,
        };
        let text = encode_entry_meta(&meta);
        assert_eq!(parse_entry_meta(&text).unwrap(), meta);
    }

    #[test]
    fn test_state_meta_round_trip() {
        let meta = StateMetadata {
            live_generation: 9,
            undo_generations: vec![1, 3, 5],
            redo_generations: vec![7],
            manual_gc: true,
            ram_cache_entries: 8,
        };
        let text = encode_state_meta(&meta);
        assert_eq!(parse_state_meta(&text).unwrap(), meta);
    }

    #[test]
    fn test_state_meta_empty_stacks() {
        let meta = StateMetadata {
            live_generation: 1,
            ..StateMetadata::default()
        };
        let text = encode_state_meta(&meta);
        let parsed = parse_state_meta(&text).unwrap();
        assert!(parsed.undo_generations.is_empty());
        assert!(parsed.redo_generations.is_empty());
    }

    #[test]
    fn test_version_mismatch_fails() {
        let meta = EntryMetadata::default();
        let text = encode_entry_meta(&meta).replace("version:1", "version:99");
        assert!(matches!(
            parse_entry_meta(&text),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_missing_field_fails() {
        let text = "version:1\ngeneration:5\n";
        assert!(parse_entry_meta(text).is_err());
    }

    #[test]
    fn test_invalid_line_fails() {
        let text = "version:1\nno-colon-here\n";
        assert!(matches!(
            parse_entry_meta(text),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_invalid_generation_list_fails() {
        let meta = StateMetadata {
            undo_generations: vec![1, 2],
            ..StateMetadata::default()
        };
        let text = encode_state_meta(&meta).replace("undo:1,2", "undo:1,x");
        assert!(parse_state_meta(&text).is_err());
    }
}
