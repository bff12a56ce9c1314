/// Normalize extracted document text: trim every line and drop blank ones.
///
/// Extractors produce marker lines (`=== PAGE 1 ===`, `--- TABLE 1 ---`)
/// interleaved with content lines, so the cleaned form is a dense block of
/// single-newline-separated lines.
pub fn clean_text(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn clamp_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
