//! Filename sanitisation for exported artifacts.
//!
//! Titles arrive from the caller and end up as the last segment of an object
//! storage key, so they are reduced to a conservative ASCII alphabet before
//! use. The transformation is idempotent: feeding its output back in yields
//! the same string.

/// Stem used when a title is absent or sanitises to nothing.
pub const FALLBACK_STEM: &str = "presentation";

/// Extension appended to exported PDF filenames.
pub const PDF_EXTENSION: &str = "pdf";

const MAX_FILENAME_LEN: usize = 120;
const REPLACEMENT: char = '_';

/// Reduce `input` to `[A-Za-z0-9._-]`, replacing everything else with `_`.
///
/// Runs of `_` or `.` collapse to a single character (so `..` never
/// survives), leading `.`/`_` and trailing `.`/`_` are trimmed, and the result
/// is capped at 120 bytes. An empty result falls back to [`FALLBACK_STEM`].
pub fn sanitize_filename(input: &str) -> String {
    let mut output = String::with_capacity(input.len().min(MAX_FILENAME_LEN));

    for ch in input.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || ch == '-' || ch == '.' {
            ch
        } else {
            REPLACEMENT
        };

        if (mapped == REPLACEMENT || mapped == '.') && output.ends_with(mapped) {
            continue;
        }
        output.push(mapped);
    }

    let trimmed = output
        .trim_start_matches(['.', REPLACEMENT])
        .trim_end_matches(['.', REPLACEMENT]);

    let capped = if trimmed.len() > MAX_FILENAME_LEN {
        // Every remaining character is ASCII, so byte slicing is safe.
        trimmed[..MAX_FILENAME_LEN].trim_end_matches(['.', REPLACEMENT])
    } else {
        trimmed
    };

    if capped.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        capped.to_string()
    }
}

/// Build the suggested filename for a PDF export from an optional title.
///
/// The stem is shortened so that the whole name, extension included, stays
/// within the sanitizer's cap and passes through it unchanged.
pub fn export_filename(title: Option<&str>) -> String {
    let stem = sanitize_filename(title.unwrap_or(FALLBACK_STEM));
    let budget = MAX_FILENAME_LEN - PDF_EXTENSION.len() - 1;
    let stem = if stem.len() > budget {
        stem[..budget].trim_end_matches(['.', REPLACEMENT])
    } else {
        stem.as_str()
    };
    format!("{stem}.{PDF_EXTENSION}")
}
