//! Sensitive field masking.
//!
//! # Responsibilities
//! - Hold the process-wide set of masked field names
//! - Redact context values written under a masked key
//! - Redact masked string fields inside serialized JSON bodies
//!
//! # Design Decisions
//! - Field names compare case-insensitively, in context keys and in body keys
//! - The set is swapped atomically; readers never lock
//! - The body scanner never parses JSON: it works on raw text so truncated
//!   or malformed bodies are still redacted instead of rejected

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use arc_swap::ArcSwap;

/// Replacement written in place of any masked value.
pub const MASK: &str = "******";

static MASKED_FIELDS: LazyLock<ArcSwap<HashSet<String>>> =
    LazyLock::new(|| ArcSwap::from_pointee(HashSet::new()));

/// Register field names whose values must never be emitted.
pub fn register_masked_fields<I, S>(fields: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let added: Vec<String> = fields
        .into_iter()
        .map(|f| f.as_ref().to_ascii_lowercase())
        .collect();
    MASKED_FIELDS.rcu(|current| {
        let mut next = HashSet::clone(current);
        next.extend(added.iter().cloned());
        next
    });
}

/// Check whether `field` is registered as masked.
pub fn is_masked(field: &str) -> bool {
    MASKED_FIELDS.load().contains(&field.to_ascii_lowercase())
}

/// Snapshot of the registered masked field names.
pub fn masked_fields() -> Arc<HashSet<String>> {
    MASKED_FIELDS.load_full()
}

/// Redact the string value of every `fields` occurrence in a serialized JSON text.
pub fn filter<I, S>(input: &str, fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut output = input.to_string();
    for field in fields {
        output = filter_field(&output, field.as_ref());
    }
    output
}

fn filter_field(input: &str, field: &str) -> String {
    if field.is_empty() {
        return input.to_string();
    }
    let pattern = format!("\"{}\"", field.to_ascii_lowercase());
    // ASCII lowercasing keeps byte offsets, so matches index into `input` directly
    let haystack = input.to_ascii_lowercase();
    let bytes = input.as_bytes();
    let mut output = String::with_capacity(input.len());
    let mut copied = 0;
    let mut search_from = 0;

    while let Some(found) = haystack[search_from..].find(&pattern) {
        let key_end = search_from + found + pattern.len();
        search_from = key_end;

        let Some(open) = find_value_start(bytes, key_end) else {
            continue;
        };
        let close = find_value_end(bytes, open + 1);

        output.push_str(&input[copied..=open]);
        output.push_str(MASK);
        copied = close;
        search_from = close;
    }

    output.push_str(&input[copied..]);
    output
}

/// Locate the opening quote of the value following a key, skipping one `:`.
fn find_value_start(bytes: &[u8], from: usize) -> Option<usize> {
    let mut colon_seen = false;
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\r' | b'\n' => {}
            b':' if !colon_seen => colon_seen = true,
            b'"' if colon_seen => return Some(i),
            _ => return None,
        }
        i += 1;
    }
    None
}

/// Locate the closing quote of a string value, or the end of input if unterminated.
fn find_value_end(bytes: &[u8], from: usize) -> usize {
    let mut escaped = false;
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            _ if escaped => escaped = false,
            b'\\' => escaped = true,
            b'"' => return i,
            _ => {}
        }
        i += 1;
    }
    bytes.len()
}
