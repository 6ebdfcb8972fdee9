//! Common validation rules shared across request payloads.

use validator::ValidationError;

/// Length of login OTPs and 2FA codes.
pub const CODE_DIGITS: usize = 6;

/// Validates a one-time code: exactly six ASCII digits.
pub fn is_six_digit_code(code: &str) -> bool {
    code.len() == CODE_DIGITS && code.chars().all(|c| c.is_ascii_digit())
}

/// Validates an E.164 phone number.
///
/// Requirements:
/// - Leading `+`
/// - 8-15 digits after the prefix
pub fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    let Some(digits) = phone.strip_prefix('+') else {
        return Err(ValidationError::new("phone_missing_country_prefix"));
    };
    if !(8..=15).contains(&digits.len()) {
        return Err(ValidationError::new("phone_invalid_length"));
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::new("phone_invalid_characters"));
    }
    Ok(())
}

/// Loose e-mail shape check used for contacts that may be either a phone or an address.
pub fn looks_like_email(contact: &str) -> bool {
    match contact.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

/// Normalizes a contact for use as a lookup key.
pub fn normalize_contact(contact: &str) -> String {
    let trimmed = contact.trim();
    if looks_like_email(trimmed) {
        trimmed.to_ascii_lowercase()
    } else {
        trimmed.chars().filter(|c| !c.is_whitespace()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_digit_code_accepts_only_digits() {
        assert!(is_six_digit_code("012345"));
        assert!(!is_six_digit_code("12345"));
        assert!(!is_six_digit_code("1234567"));
        assert!(!is_six_digit_code("12a456"));
        assert!(!is_six_digit_code("１２３４５６"));
    }

    #[test]
    fn phone_rejects_missing_prefix() {
        assert!(validate_phone("2348012345678").is_err());
    }

    #[test]
    fn phone_rejects_letters_and_bad_length() {
        assert!(validate_phone("+23480abc5678").is_err());
        assert!(validate_phone("+1234").is_err());
    }

    #[test]
    fn phone_accepts_valid() {
        assert!(validate_phone("+2348012345678").is_ok());
    }

    #[test]
    fn contact_normalization() {
        assert_eq!(normalize_contact(" Alice@Example.COM "), "alice@example.com");
        assert_eq!(normalize_contact("+234 801 234 5678"), "+2348012345678");
        assert!(!looks_like_email("+2348012345678"));
    }
}
