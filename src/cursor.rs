//! Signed, expiring pagination cursors.
//!
//! A cursor is `base64url(json!({data, signature}))` where `signature` is
//! HMAC-SHA256 over the deterministically serialized payload. Decoding
//! verifies size, signature (constant-time), and expiry before the payload
//! is ever surfaced; error messages never echo payload contents.

use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum encoded cursor size accepted by decode.
pub const MAX_CURSOR_BYTES: usize = 10 * 1024;

/// Recommended minimum secret length; shorter secrets log a warning.
const MIN_SECRET_BYTES: usize = 32;

/// Cursor payload carried between list calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CursorPayload {
    /// Offset/limit continuation.
    pub fn at_offset(offset: u64, limit: u64) -> Self {
        Self {
            offset: Some(offset),
            limit: Some(limit),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SignedCursor {
    data: String,
    signature: String,
}

/// Encoder/decoder bound to one process secret.
#[derive(Clone)]
pub struct CursorCodec {
    secret: Vec<u8>,
}

impl CursorCodec {
    /// Build a codec from a configured secret, generating a random 32-byte
    /// secret when none is supplied.
    pub fn new(configured_secret: Option<&str>) -> Self {
        let secret = match configured_secret {
            Some(s) => {
                if s.len() < MIN_SECRET_BYTES {
                    tracing::warn!(
                        length = s.len(),
                        "cursor secret is shorter than {} bytes",
                        MIN_SECRET_BYTES
                    );
                }
                s.as_bytes().to_vec()
            }
            None => {
                use rand::RngCore;
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                bytes
            }
        };
        Self { secret }
    }

    /// Encode a payload, stamping `expires_at` from `ttl_ms` when the
    /// payload does not carry one already.
    pub fn encode(&self, mut payload: CursorPayload, ttl_ms: u64) -> Result<String> {
        if payload.expires_at.is_none() {
            payload.expires_at = Some(Utc::now() + Duration::milliseconds(ttl_ms as i64));
        }

        let data = serde_json::to_string(&payload)?;
        let signature = self.sign(data.as_bytes());
        let signed = SignedCursor { data, signature };
        let bytes = serde_json::to_vec(&signed)?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Decode and verify a cursor.
    pub fn decode(&self, cursor: &str) -> Result<CursorPayload> {
        if cursor.len() > MAX_CURSOR_BYTES {
            return Err(Error::CursorInvalid("cursor exceeds size limit".into()));
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|_| Error::CursorInvalid("malformed encoding".into()))?;
        let signed: SignedCursor = serde_json::from_slice(&bytes)
            .map_err(|_| Error::CursorInvalid("malformed cursor structure".into()))?;

        if signed.signature.is_empty() {
            return Err(Error::CursorInvalid("missing signature".into()));
        }
        self.verify(signed.data.as_bytes(), &signed.signature)?;

        let payload: CursorPayload = serde_json::from_str(&signed.data)
            .map_err(|_| Error::CursorInvalid("malformed payload".into()))?;

        if let Some(expires_at) = payload.expires_at {
            if expires_at < Utc::now() {
                return Err(Error::CursorInvalid("cursor expired".into()));
            }
        }

        Ok(payload)
    }

    fn sign(&self, data: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(data);
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    fn verify(&self, data: &[u8], signature: &str) -> Result<()> {
        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| Error::CursorInvalid("malformed signature".into()))?;
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(data);
        // Mac::verify_slice is constant-time
        mac.verify_slice(&provided)
            .map_err(|_| Error::CursorInvalid("signature mismatch".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn codec() -> CursorCodec {
        CursorCodec::new(Some("an-adequately-long-test-secret-0123456789"))
    }

    #[test]
    fn test_round_trip() {
        let codec = codec();
        let encoded = codec
            .encode(CursorPayload::at_offset(100, 50), 60_000)
            .unwrap();
        let decoded = codec.decode(&encoded).unwrap();

        assert_eq!(decoded.offset, Some(100));
        assert_eq!(decoded.limit, Some(50));
        let expires = decoded.expires_at.unwrap();
        let delta = (expires - Utc::now()).num_milliseconds();
        assert!((55_000..=65_000).contains(&delta), "delta was {}", delta);
    }

    #[test]
    fn test_base64url_alphabet() {
        let codec = codec();
        let encoded = codec
            .encode(CursorPayload::at_offset(100, 50), 60_000)
            .unwrap();
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('='));
    }

    #[test]
    fn test_tampered_data_rejected() {
        let codec = codec();
        let encoded = codec
            .encode(CursorPayload::at_offset(1, 10), 60_000)
            .unwrap();

        let mut bytes = URL_SAFE_NO_PAD.decode(&encoded).unwrap();
        // Flip a byte inside the JSON body
        let mid = bytes.len() / 2;
        bytes[mid] = bytes[mid].wrapping_add(1);
        let tampered = URL_SAFE_NO_PAD.encode(&bytes);

        let err = codec.decode(&tampered).unwrap_err();
        let msg = err.to_string();
        assert!(!msg.contains("offset"), "error echoed payload: {}", msg);
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let ours = codec();
        let theirs = CursorCodec::new(Some("a-different-32-byte-secret-value!!"));
        let encoded = theirs
            .encode(CursorPayload::at_offset(5, 5), 60_000)
            .unwrap();
        assert!(ours.decode(&encoded).is_err());
    }

    #[test]
    fn test_oversized_cursor_rejected() {
        let codec = codec();
        let huge = "A".repeat(MAX_CURSOR_BYTES + 1);
        let err = codec.decode(&huge).unwrap_err();
        assert!(err.to_string().contains("size limit"));
    }

    #[test]
    fn test_expired_cursor_rejected() {
        let codec = codec();
        let payload = CursorPayload {
            offset: Some(0),
            expires_at: Some(Utc::now() - Duration::seconds(1)),
            ..Default::default()
        };
        let encoded = codec.encode(payload, 60_000).unwrap();
        let err = codec.decode(&encoded).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_garbage_rejected() {
        let codec = codec();
        assert!(codec.decode("not base64url !!!").is_err());
        assert!(codec
            .decode(&URL_SAFE_NO_PAD.encode(b"{\"data\":\"x\"}"))
            .is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_round_trip_preserves_payload(
            offset in 0u64..1_000_000,
            limit in 1u64..1_000,
            last_id in "[a-z0-9-]{0,40}",
        ) {
            let codec = codec();
            let payload = CursorPayload {
                offset: Some(offset),
                limit: Some(limit),
                last_id: if last_id.is_empty() { None } else { Some(last_id.clone()) },
                ..Default::default()
            };
            let encoded = codec.encode(payload.clone(), 60_000).unwrap();
            let decoded = codec.decode(&encoded).unwrap();

            proptest::prop_assert_eq!(decoded.offset, payload.offset);
            proptest::prop_assert_eq!(decoded.limit, payload.limit);
            proptest::prop_assert_eq!(decoded.last_id, payload.last_id);
            proptest::prop_assert!(!encoded.contains('+') && !encoded.contains('/'));
        }
    }
}
