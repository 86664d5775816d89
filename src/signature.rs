//! HMAC-SHA256 request signatures
//!
//! Both the management API (`X-Signature-256`) and webhooks
//! (`X-Hub-Signature-256`) carry `sha256=<hex digest of the raw body>`.

use crate::error::{HotifyError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Header signed with the global API secret
pub const API_SIGNATURE_HEADER: &str = "x-signature-256";

/// Header signed with a service's webhook secret (GitHub convention)
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-hub-signature-256";

const PREFIX: &str = "sha256=";

/// Compute the header value for `body`
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("{}{}", PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Check a header value against the body. The comparison is constant-time.
pub fn verify(secret: &str, body: &[u8], header: Option<&str>) -> Result<()> {
    let Some(header) = header else {
        debug!("Missing signature header");
        return Err(HotifyError::Signature);
    };

    let digest = header
        .strip_prefix(PREFIX)
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
        .ok_or(HotifyError::Signature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    mac.verify_slice(&digest).map_err(|_| HotifyError::Signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_format() {
        let sig = sign("secret", b"payload");
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let sig = sign("Jefe", b"what do ya want for nothing?");
        assert_eq!(
            sig,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify_accepts_matching_signature() {
        let body = br#"{"name":"app"}"#;
        let sig = sign("secret", body);
        assert!(verify("secret", body, Some(&sig)).is_ok());
    }

    #[test]
    fn test_verify_rejects_altered_body() {
        let sig = sign("secret", br#"{"name":"app"}"#);
        assert!(matches!(
            verify("secret", br#"{"name":"evil"}"#, Some(&sig)),
            Err(HotifyError::Signature)
        ));
    }

    #[test]
    fn test_verify_rejects_wrong_secret_and_bad_headers() {
        let body = b"";
        let sig = sign("secret", body);
        assert!(verify("other", body, Some(&sig)).is_err());
        assert!(verify("secret", body, None).is_err());
        assert!(verify("secret", body, Some("sha256=zz")).is_err());
        assert!(verify("secret", body, Some(sig.trim_start_matches("sha256="))).is_err());
    }
}
