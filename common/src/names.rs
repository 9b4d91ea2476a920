//! Agent and chain name sanitization.

/// Normalize a user-supplied name: lowercase, strip anything outside
/// `[a-z0-9-]`, collapse runs of hyphens, trim leading/trailing hyphens.
/// Returns `None` when nothing usable remains.
pub fn sanitize_name(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut last_hyphen = true;
    for ch in raw.chars() {
        let ch = ch.to_ascii_lowercase();
        let mapped = match ch {
            'a'..='z' | '0'..='9' => Some(ch),
            '-' | '_' | ' ' => Some('-'),
            _ => None,
        };
        match mapped {
            Some('-') => {
                if !last_hyphen {
                    out.push('-');
                    last_hyphen = true;
                }
            }
            Some(c) => {
                out.push(c);
                last_hyphen = false;
            }
            None => {}
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::sanitize_name;
    use pretty_assertions::assert_eq;

    #[test]
    fn lowercases_and_strips() {
        assert_eq!(
            sanitize_name("My Cool Agent!"),
            Some("my-cool-agent".to_string())
        );
    }

    #[test]
    fn collapses_hyphen_runs() {
        assert_eq!(sanitize_name("a--_-b"), Some("a-b".to_string()));
    }

    #[test]
    fn rejects_names_with_nothing_usable() {
        assert_eq!(sanitize_name("!!!"), None);
        assert_eq!(sanitize_name("---"), None);
        assert_eq!(sanitize_name(""), None);
    }

    #[test]
    fn keeps_already_clean_names() {
        assert_eq!(sanitize_name("scout-2"), Some("scout-2".to_string()));
    }
}
