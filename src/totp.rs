// see [RFC 6238 - TOTP: Time-Based One-Time Password Algorithm](https://www.rfc-editor.org/rfc/rfc6238)
use crate::Error;
use chrono::Utc;
use totp_rs::{Algorithm, Secret, TOTP};

pub const DIGITS: usize = 6;
pub const STEP_SECONDS: u64 = 30;

fn normalize_secret(secret: &str) -> String {
    secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .collect::<String>()
        .to_uppercase()
}

fn make_totp(secret: &str) -> Result<TOTP, Error> {
    let bytes = Secret::Encoded(normalize_secret(secret))
        .to_bytes()
        .map_err(|err| Error::TotpSecret {
            reason: format!("{err:?}"),
        })?;
    if bytes.is_empty() {
        return Err(Error::TotpSecret {
            reason: "empty secret".to_string(),
        });
    }
    // authenticator apps routinely hand out 80 bits secrets, `new` would refuse them
    Ok(TOTP::new_unchecked(
        Algorithm::SHA1,
        DIGITS,
        1,
        STEP_SECONDS,
        bytes,
    ))
}

/// Code for the base32 `secret` at unix time `timestamp`.
pub fn totp_at(secret: &str, timestamp: u64) -> Result<String, Error> {
    Ok(make_totp(secret)?.generate(timestamp))
}

pub fn totp_now(secret: &str) -> Result<String, Error> {
    let now = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
    totp_at(secret, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // base32 of the ascii "12345678901234567890" used by the RFC test vectors
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn test_rfc6238_sha1_vectors() {
        assert_eq!(totp_at(RFC_SECRET, 59).unwrap(), "287082");
        assert_eq!(totp_at(RFC_SECRET, 1111111109).unwrap(), "081804");
        assert_eq!(totp_at(RFC_SECRET, 1234567890).unwrap(), "005924");
    }

    #[test]
    fn test_short_secret_is_stable_within_window() {
        let secret = "JQ3GCDISNYQBSKTW";
        let a = totp_at(secret, 1_700_000_010).unwrap();
        let b = totp_at(secret, 1_700_000_019).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), DIGITS);
        assert!(a.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_secret_normalization() {
        assert_eq!(
            totp_at("gezd gnbv gy3t qojq gezd gnbv gy3t qojq", 59).unwrap(),
            "287082"
        );
    }

    #[test]
    fn test_now_matches_current_window() {
        let secret = "JQ3GCDISNYQBSKTW";
        let code = totp_now(secret).unwrap();
        let now = Utc::now().timestamp() as u64;
        // tolerate a window boundary between both calls
        let candidates = [
            totp_at(secret, now).unwrap(),
            totp_at(secret, now.saturating_sub(STEP_SECONDS)).unwrap(),
        ];
        assert!(candidates.contains(&code));
    }

    #[test]
    fn test_malformed_secret() {
        assert!(matches!(
            totp_at("not-base32!", 59),
            Err(Error::TotpSecret { .. })
        ));
        assert!(matches!(totp_at("", 59), Err(Error::TotpSecret { .. })));
    }
}
