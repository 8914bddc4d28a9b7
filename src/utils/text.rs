use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

static VALID_USERNAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-zA-Z_\-=./]+$").expect("valid username regex"));

const PLACEHOLDER: &str = "__";

/// A short random lowercase-letter string, used to disambiguate virtual-user
/// localparts and room aliases.
pub fn random_lower(len: usize) -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .cycle()
        .take(len)
        .map(|b| (b'a' + (b % 26)) as char)
        .collect()
}

/// Returns true when `name` only contains characters a Matrix localpart
/// accepts from us.
pub fn is_valid_username(name: &str) -> bool {
    VALID_USERNAME.is_match(name)
}

/// Replace every character outside the localpart alphabet with a fixed
/// two-character placeholder.
pub fn sanitize_username(name: &str) -> String {
    if is_valid_username(name) {
        return name.to_string();
    }
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '=' | '.' | '/') {
                c.to_string()
            } else {
                PLACEHOLDER.to_string()
            }
        })
        .collect()
}

/// Room aliases cannot carry whitespace.
pub fn sanitize_alias(alias: &str) -> String {
    alias
        .chars()
        .map(|c| {
            if c.is_whitespace() {
                PLACEHOLDER.to_string()
            } else {
                c.to_string()
            }
        })
        .collect()
}

/// `@user:server` -> `user` when configured to drop homeserver suffixes.
pub fn strip_homeserver_suffix(name: &str) -> String {
    match name.split_once(':') {
        Some((local, _)) => local.to_string(),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn random_lower_is_lowercase_ascii() {
        let s = random_lower(4);
        assert_eq!(s.len(), 4);
        assert!(s.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test_case("alice", "alice")]
    #[test_case("al ice", "al__ice")]
    #[test_case("ali@ce!", "ali__ce__")]
    #[test_case("a.b-c_d=e/f", "a.b-c_d=e/f")]
    fn sanitize_username_cases(input: &str, expected: &str) {
        assert_eq!(sanitize_username(input), expected);
    }

    #[test]
    fn sanitize_alias_replaces_whitespace() {
        assert_eq!(sanitize_alias("my chan\tname"), "my__chan__name");
    }

    #[test]
    fn strip_homeserver_suffix_keeps_localpart() {
        assert_eq!(strip_homeserver_suffix("alice:example.org"), "alice");
        assert_eq!(strip_homeserver_suffix("alice"), "alice");
    }
}
