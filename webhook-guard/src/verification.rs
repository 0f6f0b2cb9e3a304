use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// How the vendor encodes the digest in its signature header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureEncoding {
    #[default]
    Hex,
    Base64,
}

impl SignatureEncoding {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hex" => Some(Self::Hex),
            "base64" => Some(Self::Base64),
            _ => None,
        }
    }
}

fn hmac_digest(secret: &[u8], body: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, including empty ones.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return Vec::new(),
    };
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

/// Lowercase hex HMAC-SHA256 of `body` keyed with `secret`.
pub fn compute_signature(secret: &str, body: &[u8]) -> String {
    hex::encode(hmac_digest(secret.as_bytes(), body))
}

/// Verify a hex-encoded HMAC-SHA256 signature over the raw request body.
///
/// `body` must be the exact bytes received. Re-serializing a parsed JSON
/// value is not byte-stable and will break verification.
pub fn verify_signature(body: &[u8], secret: &str, signature: &str) -> bool {
    let computed = compute_signature(secret, body);
    constant_time_eq(computed.as_bytes(), signature.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Shared-secret verifier built once from configuration.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    encoding: SignatureEncoding,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, encoding: SignatureEncoding) -> Self {
        Self {
            secret: secret.into(),
            encoding,
        }
    }

    pub fn has_secret(&self) -> bool {
        !self.secret.is_empty()
    }

    pub fn verify(&self, body: &[u8], signature: &str) -> bool {
        match self.encoding {
            SignatureEncoding::Hex => verify_signature(body, &self.secret, signature),
            SignatureEncoding::Base64 => {
                let digest = hmac_digest(self.secret.as_bytes(), body);
                let computed = base64::engine::general_purpose::STANDARD.encode(digest);
                constant_time_eq(computed.as_bytes(), signature.as_bytes())
            }
        }
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"a":1}"#;

    #[test]
    fn known_digest_for_test_secret() {
        let sig = compute_signature("whsec_test", BODY);
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert!(verify_signature(BODY, "whsec_test", &sig));
        assert!(!verify_signature(BODY, "wrong", &sig));
    }

    #[test]
    fn rfc4231_vector() {
        // RFC 4231 test case 2
        let sig = compute_signature("Jefe", b"what do ya want for nothing?");
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn flipped_body_byte_fails() {
        let sig = compute_signature("secret", BODY);
        for i in 0..BODY.len() {
            let mut tampered = BODY.to_vec();
            tampered[i] ^= 0x01;
            assert!(!verify_signature(&tampered, "secret", &sig), "byte {i}");
        }
    }

    #[test]
    fn flipped_signature_char_fails() {
        let sig = compute_signature("secret", BODY);
        for i in 0..sig.len() {
            let mut bytes = sig.clone().into_bytes();
            bytes[i] = if bytes[i] == b'0' { b'1' } else { b'0' };
            let tampered = String::from_utf8(bytes).unwrap();
            assert!(!verify_signature(BODY, "secret", &tampered), "char {i}");
        }
    }

    #[test]
    fn uppercase_hex_is_rejected() {
        let sig = compute_signature("secret", BODY).to_uppercase();
        assert!(!verify_signature(BODY, "secret", &sig));
    }

    #[test]
    fn empty_secret_and_body_are_deterministic() {
        let a = compute_signature("", b"");
        let b = compute_signature("", b"");
        assert_eq!(a, b);
        assert!(verify_signature(b"", "", &a));
        assert!(!verify_signature(b"", "", ""));
        assert!(!verify_signature(b"", "", "not-a-signature"));
    }

    #[test]
    fn reserialized_body_does_not_verify() {
        let raw = br#"{"b": 2, "a": 1}"#;
        let sig = compute_signature("secret", raw);
        let value: serde_json::Value = serde_json::from_slice(raw).unwrap();
        let reserialized = serde_json::to_vec(&value).unwrap();
        assert!(verify_signature(raw, "secret", &sig));
        assert!(!verify_signature(&reserialized, "secret", &sig));
    }

    #[test]
    fn verifier_hex_and_base64() {
        let hex_verifier = SignatureVerifier::new("secret", SignatureEncoding::Hex);
        assert!(hex_verifier.verify(BODY, &compute_signature("secret", BODY)));

        let b64_verifier = SignatureVerifier::new("secret", SignatureEncoding::Base64);
        let digest = hmac_digest(b"secret", BODY);
        let b64 = base64::engine::general_purpose::STANDARD.encode(digest);
        assert!(b64_verifier.verify(BODY, &b64));
        assert!(!b64_verifier.verify(BODY, &compute_signature("secret", BODY)));
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let verifier = SignatureVerifier::new("super-secret", SignatureEncoding::Hex);
        assert!(!format!("{verifier:?}").contains("super-secret"));
    }

    #[test]
    fn encoding_parse() {
        assert_eq!(SignatureEncoding::parse("HEX"), Some(SignatureEncoding::Hex));
        assert_eq!(SignatureEncoding::parse("base64"), Some(SignatureEncoding::Base64));
        assert_eq!(SignatureEncoding::parse("sha1"), None);
    }
}
