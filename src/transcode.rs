//! Legacy caption transcoding
//!
//! Converts the pipe-delimited `key:value` caption format found in archive
//! images into clean comma-separated display text. Pure text transform, no
//! I/O.

/// Convert a legacy pipe-delimited description to clean text.
///
/// Segments are split on `|` (leading/trailing pipes are insignificant).
/// Each non-empty segment must carry a `key:value` pair; the trimmed value is
/// kept and the key discarded. Segments without a colon are dropped entirely.
/// Only the FIRST colon in a segment delimits key from value, so values that
/// themselves contain colons (timestamps, ratios) survive intact.
///
/// Total function: any input yields a (possibly empty) string.
pub fn transcode(input: &str) -> String {
    let mut cleaned: Vec<&str> = Vec::new();

    for part in input.trim_matches('|').split('|') {
        if part.trim().is_empty() {
            continue;
        }
        if let Some((_key, value)) = part.split_once(':') {
            cleaned.push(value.trim());
        }
    }

    cleaned.join(", ")
}
