use rand::distributions::Alphanumeric;
use rand::Rng;
use subtle::ConstantTimeEq;

/// Opaque agent/session credential: 32 random alphanumeric characters.
pub fn generate_token() -> String {
    random_string(32)
}

pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Constant-time string comparison for tokens and API keys.
pub fn secure_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_long_and_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn secure_compare_checks_content_and_length() {
        assert!(secure_compare("abc", "abc"));
        assert!(!secure_compare("abc", "abd"));
        assert!(!secure_compare("abc", "abcd"));
        assert!(!secure_compare("", "x"));
    }
}
