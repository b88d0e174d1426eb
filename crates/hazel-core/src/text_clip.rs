//! Bounded text clipping for prompt and context assembly.

/// Marker appended when [`clip_text`] drops trailing content.
pub const TRUNCATION_MARKER: &str = "\n\n[...truncated by Hazel...]";

/// Trims `text` and bounds it to `max_bytes`, cutting on a char boundary.
///
/// Budgets below 32 bytes are cut without the truncation marker. A zero budget
/// disables clipping.
pub fn clip_text(text: &str, max_bytes: usize) -> String {
    let trimmed = text.trim();
    if max_bytes == 0 || trimmed.len() <= max_bytes {
        return trimmed.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    let head = &trimmed[..cut];
    if max_bytes < 32 {
        return head.to_string();
    }
    format!("{head}{TRUNCATION_MARKER}")
}
