//! Human-readable pattern form: `[[[l, a, b], [l, a, b], ...], ...]`, one
//! inner list per row.

use super::{CodecError, Pattern, PATTERN_SIZE, PATTERN_VALUES};

pub(super) fn format_pattern(pattern: &Pattern) -> String {
    let mut out = String::with_capacity(PATTERN_VALUES * 12);
    out.push('[');
    for row in 0..PATTERN_SIZE {
        if row > 0 {
            out.push_str(", ");
        }
        out.push('[');
        for col in 0..PATTERN_SIZE {
            if col > 0 {
                out.push_str(", ");
            }
            let [l, a, b] = pattern.cell(row, col);
            out.push_str(&format!("[{l:.6}, {a:.6}, {b:.6}]"));
        }
        out.push(']');
    }
    out.push(']');
    out
}

pub(super) fn parse_pattern(text: &str) -> Result<Pattern, CodecError> {
    let mut values = Vec::with_capacity(PATTERN_VALUES);
    let tokens = text
        .split(|c: char| c == '[' || c == ']' || c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty());
    for token in tokens {
        let value: f32 = token.parse().map_err(|_| {
            CodecError::CorruptPattern(format!(
                "invalid input syntax for image pattern: {token:?}"
            ))
        })?;
        values.push(value);
    }
    if values.len() != PATTERN_VALUES {
        return Err(CodecError::CorruptPattern(format!(
            "invalid input syntax for image pattern: expected {PATTERN_VALUES} numbers, found {}",
            values.len()
        )));
    }
    Pattern::from_values(values)
}
