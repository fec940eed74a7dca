//! Best-effort repair of structured model output.
//!
//! Narrow contract: raw text in, parsed JSON (or `None`) out. Nothing in here
//! knows what the JSON is for.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Parse `raw` as JSON, repairing common damage first if needed.
///
/// Handles markdown code fences, prose before and after the payload, output
/// truncated mid-string or mid-container, and trailing commas.
pub fn repair_json(raw: &str) -> Option<Value> {
    let body = strip_fences(raw);
    if let Ok(value) = serde_json::from_str(body.trim()) {
        return Some(value);
    }

    let start = body.find(['{', '['])?;
    let candidate = &body[start..];

    // A complete payload followed by trailing prose.
    if let Some(end) = complete_prefix(candidate) {
        if let Ok(value) = serde_json::from_str(&strip_trailing_commas(&candidate[..end])) {
            return Some(value);
        }
    }

    let balanced = balance(candidate);
    serde_json::from_str(&strip_trailing_commas(&balanced)).ok()
}

/// Repair and deserialize into `T`.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let value = repair_json(raw)?;
    serde_json::from_value(value).ok()
}

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[open + 3..];
    // Skip the language tag line.
    let after = match after.find('\n') {
        Some(newline) => &after[newline + 1..],
        None => after,
    };
    match after.find("```") {
        Some(close) => &after[..close],
        None => after,
    }
}

/// Length of the first complete top-level JSON container, if it closes.
fn complete_prefix(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Close an unterminated string and any open containers.
fn balance(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut out = String::with_capacity(text.len() + 8);

    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(c);
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                } else {
                    // Stray closer; drop it.
                    continue;
                }
            }
            _ => {}
        }
        out.push(c);
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    // A dangling separator or an object key without a value cannot be
    // completed; cut back to the last complete element.
    loop {
        let len = out.trim_end().len();
        out.truncate(len);
        if out.ends_with(',') || out.ends_with(':') {
            out.pop();
            continue;
        }
        if stack.last() == Some(&'}') && out.ends_with('"') {
            if let Some(key_start) = last_string_start(&out) {
                let before = out[..key_start].trim_end();
                if before.ends_with('{') || before.ends_with(',') {
                    let keep = before.len();
                    out.truncate(keep);
                    continue;
                }
            }
        }
        break;
    }

    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Byte index of the opening quote of the string literal ending `text`.
fn last_string_start(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = bytes.len().checked_sub(2)?;
    loop {
        if bytes[i] == b'"' && (i == 0 || bytes[i - 1] != b'\\') {
            return Some(i);
        }
        i = i.checked_sub(1)?;
    }
}

fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = text.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}
