//! Outgoing-text shaping for chat channels.
//!
//! Reasoning blocks are stripped end-to-end, a minimal Markdown subset
//! (bold, italic, inline code, fenced code) converts to Telegram HTML, and
//! long messages split at newline boundaries under the platform cap.

/// Telegram message length cap.
pub const TEXT_CHUNK_LIMIT: usize = 4096;

/// Remove `<think>...</think>` blocks so only the visible reply remains.
/// Applying this twice yields the same result as once.
pub fn strip_think_blocks(text: &str) -> String {
    if !text.contains("<think>") {
        return text.trim().to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find("<think>") {
            Some(open) => {
                out.push_str(&rest[..open]);
                match rest[open..].find("</think>") {
                    Some(close) => {
                        rest = &rest[open + close + "</think>".len()..];
                    }
                    None => {
                        // Unterminated block swallows the tail.
                        break;
                    }
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out.trim().to_string()
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Convert the supported Markdown subset to Telegram HTML. Everything else
/// is escaped verbatim, so raw marker characters never break the render.
pub fn markdown_to_html(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < n {
        // Fenced code block.
        if chars[i..].starts_with(&['`', '`', '`']) {
            if let Some(close) = find_sub(&chars, i + 3, &['`', '`', '`']) {
                let code: String = chars[i + 3..close].iter().collect();
                out.push_str("<pre>");
                out.push_str(&escape_html(code.trim()));
                out.push_str("</pre>");
                i = close + 3;
                continue;
            }
        }
        // Inline code.
        if chars[i] == '`' {
            if let Some(close) = find_char(&chars, i + 1, '`') {
                let code: String = chars[i + 1..close].iter().collect();
                out.push_str("<code>");
                out.push_str(&escape_html(&code));
                out.push_str("</code>");
                i = close + 1;
                continue;
            }
        }
        // Bold: ** or __.
        if i + 1 < n && (chars[i] == '*' || chars[i] == '_') && chars[i + 1] == chars[i] {
            let delim = [chars[i], chars[i]];
            if let Some(close) = find_sub(&chars, i + 2, &delim) {
                let inner: String = chars[i + 2..close].iter().collect();
                out.push_str("<b>");
                out.push_str(&markdown_to_html(&inner));
                out.push_str("</b>");
                i = close + 2;
                continue;
            }
        }
        // Italic: single * or _ with a same-line close.
        if chars[i] == '*' || chars[i] == '_' {
            let marker = chars[i];
            if let Some(close) = find_italic_close(&chars, i + 1, marker) {
                let inner: String = chars[i + 1..close].iter().collect();
                out.push_str("<i>");
                out.push_str(&escape_html(&inner));
                out.push_str("</i>");
                i = close + 1;
                continue;
            }
        }
        let mut buf = [0u8; 4];
        out.push_str(&escape_html(chars[i].encode_utf8(&mut buf)));
        i += 1;
    }
    out
}

fn find_sub(chars: &[char], from: usize, needle: &[char]) -> Option<usize> {
    if from >= chars.len() {
        return None;
    }
    (from..=chars.len().saturating_sub(needle.len()))
        .find(|&i| chars[i..].starts_with(needle))
}

fn find_char(chars: &[char], from: usize, needle: char) -> Option<usize> {
    chars[from.min(chars.len())..]
        .iter()
        .position(|&c| c == needle)
        .map(|p| from + p)
}

fn find_italic_close(chars: &[char], from: usize, marker: char) -> Option<usize> {
    for (offset, &c) in chars[from.min(chars.len())..].iter().enumerate() {
        if c == '\n' {
            return None;
        }
        if c == marker {
            // Empty emphasis is not markup.
            return if offset == 0 { None } else { Some(from + offset) };
        }
    }
    None
}

/// Strip control characters and cap the length; first line of defense
/// against prompt injection through odd encodings.
pub fn sanitize_incoming(text: &str, max_len: usize) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let mut trimmed = cleaned.trim().to_string();
    if trimmed.chars().count() > max_len {
        trimmed = trimmed.chars().take(max_len).collect();
    }
    trimmed
}

/// Split long output at newline boundaries under `limit`; the remainder
/// splits hard when a single line exceeds it.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if rest.chars().count() <= limit {
            chunks.push(rest.to_string());
            break;
        }
        let mut cut = byte_index_at_char(rest, limit);
        if let Some(nl) = rest[..cut].rfind('\n') {
            // Prefer the newline when it is not pathologically early.
            if nl > cut / 2 {
                cut = nl + 1;
            }
        }
        chunks.push(rest[..cut].trim_end_matches('\n').to_string());
        rest = rest[cut..].trim_start_matches('\n');
    }
    chunks
}

fn byte_index_at_char(s: &str, chars: usize) -> usize {
    s.char_indices()
        .nth(chars)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_blocks_removed() {
        let text = "before <think>secret reasoning</think> after";
        assert_eq!(strip_think_blocks(text), "before  after");
    }

    #[test]
    fn think_strip_is_idempotent() {
        let text = "a <think>x</think> b";
        let once = strip_think_blocks(text);
        assert_eq!(strip_think_blocks(&once), once);
    }

    #[test]
    fn unterminated_think_swallows_tail() {
        assert_eq!(strip_think_blocks("visible <think>oops"), "visible");
    }

    #[test]
    fn bold_italic_code_convert() {
        assert_eq!(markdown_to_html("**b**"), "<b>b</b>");
        assert_eq!(markdown_to_html("*i*"), "<i>i</i>");
        assert_eq!(markdown_to_html("`c < d`"), "<code>c &lt; d</code>");
        assert_eq!(
            markdown_to_html("```\nlet x = 1;\n```"),
            "<pre>let x = 1;</pre>"
        );
    }

    #[test]
    fn visible_text_equals_source_with_markers_stripped() {
        let source = "say **hello** to `world`";
        let html = markdown_to_html(source);
        let visible = html
            .replace("<b>", "")
            .replace("</b>", "")
            .replace("<code>", "")
            .replace("</code>", "");
        let stripped = source.replace("**", "").replace('`', "");
        assert_eq!(visible, stripped);
    }

    #[test]
    fn raw_angle_brackets_escaped() {
        assert_eq!(markdown_to_html("a <tag> b"), "a &lt;tag&gt; b");
    }

    #[test]
    fn chunking_respects_newlines() {
        let text = format!("{}\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].chars().all(|c| c == 'a'));
        assert!(chunks[1].chars().all(|c| c == 'b'));
    }

    #[test]
    fn oversized_line_splits_hard() {
        let text = "x".repeat(250);
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
    }

    #[test]
    fn sanitize_drops_control_chars() {
        assert_eq!(sanitize_incoming("a\u{0007}b\ncd", 100), "ab\ncd");
    }
}
