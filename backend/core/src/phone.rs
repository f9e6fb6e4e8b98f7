//! E.164 helpers.

/// `+` followed by 1–15 digits, first digit non-zero.
pub fn is_e164(number: &str) -> bool {
    let Some(digits) = number.strip_prefix('+') else {
        return false;
    };
    !digits.is_empty()
        && digits.len() <= 15
        && !digits.starts_with('0')
        && digits.chars().all(|c| c.is_ascii_digit())
}

/// Strip everything but ASCII digits.
pub fn normalize_digits(number: &str) -> String {
    number.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_e164() {
        assert!(is_e164("+15551234567"));
        assert!(!is_e164("15551234567"));
        assert!(!is_e164("+0555"));
        assert!(!is_e164("+1555abc"));
        assert!(!is_e164("+1234567890123456"));
    }

    #[test]
    fn normalizes_formatting() {
        assert_eq!(normalize_digits("+1 (555) 123-4567"), "15551234567");
    }
}
