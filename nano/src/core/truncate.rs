//! Byte-budget truncation for text handed back to the model.

/// Text cut down to a byte budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capped {
    pub text: String,
    /// Bytes dropped from the end of the original text.
    pub truncated_bytes: usize,
}

impl Capped {
    pub fn was_truncated(&self) -> bool {
        self.truncated_bytes > 0
    }
}

/// Keep at most `limit` bytes of `text`, never splitting a UTF-8 character.
pub fn cap_text(text: &str, limit: usize) -> Capped {
    if text.len() <= limit {
        return Capped {
            text: text.to_string(),
            truncated_bytes: 0,
        };
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    Capped {
        text: text[..end].to_string(),
        truncated_bytes: text.len() - end,
    }
}

/// Cap `text` and append a bracketed notice when anything was dropped.
pub fn cap_with_notice(text: &str, limit: usize, label: &str) -> Capped {
    let capped = cap_text(text, limit);
    if !capped.was_truncated() {
        return capped;
    }
    let mut out = capped.text;
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&truncation_notice(label, capped.truncated_bytes));
    Capped {
        text: out,
        truncated_bytes: capped.truncated_bytes,
    }
}

pub fn truncation_notice(label: &str, bytes: usize) -> String {
    format!("[{label} truncated {bytes} bytes]")
}
