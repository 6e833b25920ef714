use once_cell::sync::Lazy;
use regex::Regex;

static VERSION_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/v\d+(/|$)").expect("invalid version segment regex"));

/// Normalises a user-entered API base URL. A trailing `#` means "use as is";
/// otherwise trailing slashes are dropped and `/v1` is appended when no
/// version segment is present.
pub fn normalize_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Some(verbatim) = trimmed.strip_suffix('#') {
        return verbatim.to_string();
    }

    let without_slash = trimmed.trim_end_matches('/');
    if VERSION_SEGMENT_RE.is_match(without_slash) {
        without_slash.to_string()
    } else {
        format!("{without_slash}/v1")
    }
}

/// `{base}/{path}` over the normalised base URL.
pub(crate) fn endpoint_url(base_url: &str, path: &str) -> String {
    let base = normalize_base_url(base_url);
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_v1_when_missing() {
        assert_eq!(
            normalize_base_url("  https://example.com/  "),
            "https://example.com/v1"
        );
    }

    #[test]
    fn keeps_existing_version() {
        assert_eq!(
            normalize_base_url("https://example.com/v2/"),
            "https://example.com/v2"
        );
        assert_eq!(
            normalize_base_url("https://ark.example.com/api/v3"),
            "https://ark.example.com/api/v3"
        );
    }

    #[test]
    fn respects_hash_suffix() {
        assert_eq!(
            normalize_base_url("https://example.com/custom#"),
            "https://example.com/custom"
        );
    }

    #[test]
    fn builds_endpoint_urls() {
        assert_eq!(
            endpoint_url("https://example.com", "chat/completions"),
            "https://example.com/v1/chat/completions"
        );
    }
}
