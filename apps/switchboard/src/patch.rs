use agent_proto::TextPatch;

/// Computes the minimal suffix patch that transforms `previous` into `current`.
///
/// Offsets and lengths are expressed in UTF-16 code units because the observer
/// clients index strings that way. Returns `None` when the strings are equal.
pub fn compute_patch(previous: &str, current: &str) -> Option<TextPatch> {
    if previous == current {
        return None;
    }

    // Fast path: pure append. The common case by far, since turn content
    // accumulates and entries are only ever rewritten in place mid-stream.
    if let Some(appended) = current.strip_prefix(previous) {
        return Some(TextPatch {
            offset: utf16_len(previous),
            patch: appended.to_string(),
            total_length: utf16_len(current),
        });
    }

    // Slow path: walk both strings char by char to find the first point of
    // divergence, accumulating the UTF-16 offset as we go. Splitting inside a
    // surrogate pair is impossible because we advance by whole chars.
    let mut offset = 0usize;
    let mut byte_offset = 0usize;
    let mut prev_chars = previous.chars();
    let mut curr_chars = current.chars();
    loop {
        match (prev_chars.next(), curr_chars.next()) {
            (Some(a), Some(b)) if a == b => {
                offset += a.len_utf16();
                byte_offset += a.len_utf8();
            }
            _ => break,
        }
    }

    Some(TextPatch {
        offset,
        patch: current[byte_offset..].to_string(),
        total_length: utf16_len(current),
    })
}

/// Length of `s` in UTF-16 code units.
pub fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

/// Applies `patch` to `base`, truncating at the patch offset and appending the
/// replacement text. The offset is in UTF-16 code units.
pub fn apply_patch(base: &str, patch: &TextPatch) -> String {
    let byte_offset = utf16_to_byte_offset(base, patch.offset);
    let mut result = String::with_capacity(byte_offset + patch.patch.len());
    result.push_str(&base[..byte_offset]);
    result.push_str(&patch.patch);
    result
}

fn utf16_to_byte_offset(s: &str, utf16_offset: usize) -> usize {
    let mut units = 0usize;
    for (byte_idx, ch) in s.char_indices() {
        if units >= utf16_offset {
            return byte_idx;
        }
        units += ch.len_utf16();
    }
    s.len()
}
