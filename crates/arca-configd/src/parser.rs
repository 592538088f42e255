//! Tokeniser and `set`/`delete` command parsing supporting the session
//! core (§4.7).

use crate::error::{Error, Result};

/// Split `line` on space/tab outside of double-quoted spans. An unmatched
/// quote fails `Validation`. Empty quoted strings are omitted. Consecutive
/// delimiters collapse.
pub fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_current = false;

    for ch in line.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_current = true;
                if !in_quotes {
                    tokens.push(std::mem::take(&mut current));
                    has_current = false;
                }
            }
            ' ' | '\t' if !in_quotes => {
                if has_current {
                    tokens.push(std::mem::take(&mut current));
                    has_current = false;
                }
            }
            c => {
                current.push(c);
                has_current = true;
            }
        }
    }

    if in_quotes {
        return Err(Error::Validation(format!(
            "unterminated quoted string in {line:?}"
        )));
    }
    if has_current {
        tokens.push(current);
    }

    Ok(tokens.into_iter().filter(|t| !t.is_empty()).collect())
}

/// True if `token` needs quoting when re-emitted (contains whitespace).
fn needs_quoting(token: &str) -> bool {
    token.chars().any(char::is_whitespace)
}

fn quote_if_needed(token: &str) -> String {
    if needs_quoting(token) {
        format!("\"{token}\"")
    } else {
        token.to_string()
    }
}

/// Rejoin tokens with single spaces, requoting any token containing
/// whitespace.
#[must_use]
pub fn normalize_config_path(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| quote_if_needed(t))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Prepend `base_path` to `args` (copying, never mutating the caller's
/// slice) and return `"set " + normalised`.
#[must_use]
pub fn parse_set_command(args: &[String], base_path: &[String]) -> String {
    let mut full: Vec<String> = base_path.to_vec();
    full.extend(args.iter().cloned());
    format!("set {}", normalize_config_path(&full))
}

/// Prepend `base_path` to `args` and return `"set " + normalised`, the same
/// shape used to build the prefix to delete.
#[must_use]
pub fn parse_delete_command(args: &[String], base_path: &[String]) -> String {
    let mut full: Vec<String> = base_path.to_vec();
    full.extend(args.iter().cloned());
    format!("set {}", normalize_config_path(&full))
}

/// A prefix match requires a whitespace boundary: `"set system host-name
/// router1"` matches prefix `"set system host-name"` but `"set system
/// host-name2"` does not.
#[must_use]
pub fn matches_prefix(line: &str, prefix: &str) -> bool {
    if line == prefix {
        return true;
    }
    match line.strip_prefix(prefix) {
        Some(rest) => rest.starts_with(' ') || rest.starts_with('\t'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_empty_returns_empty() {
        assert_eq!(tokenize("").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn tokenize_splits_on_space_and_tab() {
        assert_eq!(
            tokenize("system\thost-name\tr1").unwrap(),
            vec!["system", "host-name", "r1"]
        );
    }

    #[test]
    fn tokenize_collapses_consecutive_delimiters() {
        assert_eq!(
            tokenize("a   b\t\tc").unwrap(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn tokenize_honors_quoted_spans() {
        assert_eq!(
            tokenize(r#"set description "hello world""#).unwrap(),
            vec!["set", "description", "hello world"]
        );
    }

    #[test]
    fn tokenize_omits_empty_quoted_strings() {
        assert_eq!(tokenize(r#"set description """#).unwrap(), vec!["set", "description"]);
    }

    #[test]
    fn tokenize_unterminated_quote_fails_validation() {
        let err = tokenize(r#"set description "unterminated"#).unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn normalize_requotes_whitespace_tokens() {
        let tokens = vec!["system".to_string(), "host name".to_string()];
        assert_eq!(normalize_config_path(&tokens), r#"system "host name""#);
    }

    #[test]
    fn parse_set_command_prepends_base_path_without_mutating_it() {
        let base = vec!["system".to_string()];
        let args = vec!["host-name".to_string(), "r1".to_string()];
        let line = parse_set_command(&args, &base);
        assert_eq!(line, "set system host-name r1");
        assert_eq!(base, vec!["system".to_string()]);
    }

    #[test]
    fn matches_prefix_requires_whitespace_boundary() {
        assert!(matches_prefix(
            "set system host-name router1",
            "set system host-name"
        ));
        assert!(!matches_prefix(
            "set system host-name2 router1",
            "set system host-name"
        ));
        assert!(matches_prefix("set system host-name", "set system host-name"));
    }

    #[test]
    fn tokenize_then_normalize_is_identity_on_well_formed_lines() {
        let line = r#"set description "hello world" simple"#;
        let tokens = tokenize(line).unwrap();
        let rebuilt = format!("set {}", normalize_config_path(&tokens[1..].to_vec()));
        assert_eq!(rebuilt, line);
    }
}
