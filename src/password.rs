//! Password generation for rotated service accounts
//!
//! Passwords are drawn from OS randomness and encoded with the standard
//! base64 alphabet. A formatter lets operators wrap the random part in fixed
//! text (`corp-{{PASSWORD}}`) to satisfy directory complexity rules.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Placeholder replaced by random characters
pub const PASSWORD_FIELD: &str = "{{PASSWORD}}";

/// Prepended when no formatter is set so every password mixes character classes
pub const COMPLEXITY_PREFIX: &str = "?@09AZ";

/// Shortest random run we are willing to emit
const MIN_RANDOM_LENGTH: usize = 8;

/// Shortest total password length
pub const MIN_PASSWORD_LENGTH: usize = COMPLEXITY_PREFIX.len() + MIN_RANDOM_LENGTH;

/// Password generation errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PasswordError {
    #[error("it's not possible to generate a secure password of length {length}, the minimum is {min}")]
    TooShort { length: usize, min: usize },

    #[error("{formatter:?} must contain the password field {PASSWORD_FIELD}")]
    MissingField { formatter: String },

    #[error("system random number generator failed")]
    Rng,
}

/// Check that a policy can produce passwords without generating one
pub fn validate_policy(formatter: &str, length: usize) -> Result<(), PasswordError> {
    if length < MIN_PASSWORD_LENGTH {
        return Err(PasswordError::TooShort {
            length,
            min: MIN_PASSWORD_LENGTH,
        });
    }
    if !formatter.is_empty() && !formatter.contains(PASSWORD_FIELD) {
        return Err(PasswordError::MissingField {
            formatter: formatter.to_string(),
        });
    }
    Ok(())
}

/// Generate a password.
///
/// Without a formatter the result is exactly `length` characters, starting
/// with [`COMPLEXITY_PREFIX`]. With one, every `{{PASSWORD}}` becomes its own
/// run of `length` random characters and the literal text is kept as is.
pub fn generate_password(formatter: &str, length: usize) -> Result<String, PasswordError> {
    validate_policy(formatter, length)?;

    if formatter.is_empty() {
        let mut password = String::with_capacity(length);
        password.push_str(COMPLEXITY_PREFIX);
        password.push_str(&random_string(length - COMPLEXITY_PREFIX.len())?);
        return Ok(password);
    }

    let mut password = formatter.to_string();
    while password.contains(PASSWORD_FIELD) {
        password = password.replacen(PASSWORD_FIELD, &random_string(length)?, 1);
    }
    Ok(password)
}

/// `len` characters from the base64 alphabet
fn random_string(len: usize) -> Result<String, PasswordError> {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes).map_err(|_| PasswordError::Rng)?;

    // every 3 bytes yield 4 characters, so `len` bytes always cover `len` characters
    let mut encoded = STANDARD.encode(&bytes);
    encoded.truncate(len);
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lengths_without_formatter() {
        for length in 0..200 {
            let result = generate_password("", length);
            if length < MIN_PASSWORD_LENGTH {
                assert_eq!(
                    result,
                    Err(PasswordError::TooShort {
                        length,
                        min: MIN_PASSWORD_LENGTH
                    })
                );
                continue;
            }
            let password = result.unwrap();
            assert_eq!(password.len(), length);
            assert!(password.starts_with(COMPLEXITY_PREFIX));
        }
    }

    #[test]
    fn test_passwords_differ() {
        let a = generate_password("", 32).unwrap();
        let b = generate_password("", 32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_formatter_positions() {
        let length = MIN_PASSWORD_LENGTH;

        for formatter in [
            "hello{{PASSWORD}}world",
            "{{PASSWORD}}helloworld",
            "helloworld{{PASSWORD}}",
        ] {
            let password = generate_password(formatter, length).unwrap();
            assert_eq!(password.len(), "helloworld".len() + length, "{formatter}");
            assert!(!password.contains(PASSWORD_FIELD));
            assert!(!password.starts_with(COMPLEXITY_PREFIX));
        }

        let password = generate_password("hello{{PASSWORD}}world", length).unwrap();
        assert!(password.starts_with("hello"));
        assert!(password.ends_with("world"));
    }

    #[test]
    fn test_formatter_without_field() {
        assert_eq!(
            generate_password("helloworld", 30),
            Err(PasswordError::MissingField {
                formatter: "helloworld".to_string()
            })
        );
    }

    #[test]
    fn test_each_field_gets_full_length() {
        let password = generate_password("{{PASSWORD}}-{{PASSWORD}}", 20).unwrap();
        assert_eq!(password.len(), 41);
        let (left, right) = password.split_at(20);
        assert_eq!(&right[..1], "-");
        assert_ne!(left, &right[1..]);

        let password = generate_password("corp-{{PASSWORD}}", 14).unwrap();
        assert_eq!(password.len(), "corp-".len() + 14);
        assert!(password.starts_with("corp-"));
    }

    #[test]
    fn test_short_length_rejected_with_formatter() {
        let result = generate_password("hello{{PASSWORD}}world{{PASSWORD}}", MIN_RANDOM_LENGTH);
        assert!(matches!(result, Err(PasswordError::TooShort { .. })));
        assert!(validate_policy("x-{{PASSWORD}}", MIN_PASSWORD_LENGTH).is_ok());
    }
}
