use regex::Regex;
use std::sync::OnceLock;

fn fenced_block_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?s)```.*?```").expect("invalid fenced block regex"))
}

/// Strips fenced code blocks and stray backticks from model output and trims
/// the result. Applying it twice gives the same text as applying it once.
pub fn clean(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let without_blocks = fenced_block_regex().replace_all(text, "");
    without_blocks.replace('`', "").trim().to_string()
}

/// Keeps at most `max_chars` characters from the end of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let skip = total - max_chars;
    match text.char_indices().nth(skip) {
        Some((index, _)) => &text[index..],
        None => "",
    }
}
