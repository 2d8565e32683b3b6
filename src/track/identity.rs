//! Client identity: a long-lived pseudonymous identifier for a browser,
//! carried in a persistent cookie.
//!
//! The identifier is a store-allocated i64, base-36 encoded for compactness,
//! optionally wrapped by an authenticating codec. Any decode failure is
//! treated by callers exactly like an absent cookie: a fresh identity is
//! issued, the request is never rejected.

use hmac::{Hmac, Mac};
use http::header::{HeaderMap, HeaderValue, COOKIE};
use sha2::Sha256;

/// Cookie holding the client identity.
pub const CLIENT_ID_COOKIE: &str = "webtrack_client";

/// Ten years, approximating a permanent anonymous identifier.
const COOKIE_MAX_AGE_SECS: u64 = 10 * 365 * 24 * 60 * 60;

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("value is not a valid base-36 id: {0}")]
    Base36(#[from] std::num::ParseIntError),

    #[error("cookie authentication failed")]
    BadSignature,

    #[error("cookie value is malformed")]
    Malformed,
}

/// Encode a client id the way Go's strconv.FormatInt(id, 36) does.
pub fn encode_client_id(id: i64) -> String {
    let mut magnitude = id.unsigned_abs();
    let mut digits = Vec::new();
    loop {
        digits.push(BASE36_DIGITS[(magnitude % 36) as usize]);
        magnitude /= 36;
        if magnitude == 0 {
            break;
        }
    }
    if id < 0 {
        digits.push(b'-');
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

pub fn decode_client_id(value: &str) -> Result<i64, CodecError> {
    Ok(i64::from_str_radix(value, 36)?)
}

/// Transforms cookie values on the way in and out of the Set-Cookie /
/// Cookie headers. The authenticated implementation rejects tampered
/// values; the passthrough implementation stores the plain value.
pub trait CookieCodec: Send + Sync {
    fn encode(&self, name: &str, plain: &str) -> Result<String, CodecError>;
    fn decode(&self, name: &str, value: &str) -> Result<String, CodecError>;
}

/// Stores the plain value unchanged.
pub struct PassthroughCodec;

impl CookieCodec for PassthroughCodec {
    fn encode(&self, _name: &str, plain: &str) -> Result<String, CodecError> {
        Ok(plain.to_string())
    }

    fn decode(&self, _name: &str, value: &str) -> Result<String, CodecError> {
        Ok(value.to_string())
    }
}

/// Appends an HMAC-SHA256 tag bound to the cookie name, rejecting values
/// whose tag does not verify. Wire form: `<plain>.<base64url(tag)>`.
pub struct HmacCodec {
    key: Vec<u8>,
}

impl HmacCodec {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac(&self, name: &str, plain: &str) -> Result<HmacSha256, CodecError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|_| CodecError::Malformed)?;
        mac.update(name.as_bytes());
        mac.update(b"\0");
        mac.update(plain.as_bytes());
        Ok(mac)
    }
}

impl CookieCodec for HmacCodec {
    fn encode(&self, name: &str, plain: &str) -> Result<String, CodecError> {
        use base64::Engine;
        let tag = self.mac(name, plain)?.finalize().into_bytes();
        let tag_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(tag);
        Ok(format!("{plain}.{tag_b64}"))
    }

    fn decode(&self, name: &str, value: &str) -> Result<String, CodecError> {
        use base64::Engine;
        let (plain, tag_b64) = value.rsplit_once('.').ok_or(CodecError::Malformed)?;
        let tag = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| CodecError::Malformed)?;
        self.mac(name, plain)?
            .verify_slice(&tag)
            .map_err(|_| CodecError::BadSignature)?;
        Ok(plain.to_string())
    }
}

/// Extract the named cookie's raw value from the request headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else { continue };
        for pair in value.split(';') {
            if let Some((k, v)) = pair.trim().split_once('=') {
                if k == name {
                    return Some(v.to_string());
                }
            }
        }
    }
    None
}

/// Resolve the client identity from the request cookies.
///
/// Ok(None) means no cookie was present; Err means a cookie was present but
/// could not be decoded. Callers treat both as "no identity yet".
pub fn client_id_from_request(
    headers: &HeaderMap,
    codec: &dyn CookieCodec,
) -> Result<Option<i64>, CodecError> {
    let Some(raw) = cookie_value(headers, CLIENT_ID_COOKIE) else {
        return Ok(None);
    };
    let plain = codec.decode(CLIENT_ID_COOKIE, &raw)?;
    Ok(Some(decode_client_id(&plain)?))
}

/// Build the Set-Cookie header value issuing a client identity.
pub fn make_client_id_cookie(
    id: i64,
    codec: &dyn CookieCodec,
) -> Result<HeaderValue, CodecError> {
    let value = codec.encode(CLIENT_ID_COOKIE, &encode_client_id(id))?;
    let cookie = format!("{CLIENT_ID_COOKIE}={value}; Path=/; Max-Age={COOKIE_MAX_AGE_SECS}");
    HeaderValue::from_str(&cookie).map_err(|_| CodecError::Malformed)
}

/// Build the Set-Cookie header value deleting the client identity.
pub fn clear_client_id_cookie() -> HeaderValue {
    HeaderValue::from_static("webtrack_client=; Path=/; Max-Age=0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_round_trip() {
        for id in [0, 1, 35, 36, 1234567, i64::MAX, -1, -36, i64::MIN] {
            let encoded = encode_client_id(id);
            assert_eq!(decode_client_id(&encoded).unwrap(), id, "id {id}");
        }
    }

    #[test]
    fn base36_matches_known_values() {
        assert_eq!(encode_client_id(0), "0");
        assert_eq!(encode_client_id(35), "z");
        assert_eq!(encode_client_id(36), "10");
        assert_eq!(encode_client_id(-35), "-z");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_client_id("").is_err());
        assert!(decode_client_id("hello world").is_err());
        assert!(decode_client_id("1.5").is_err());
    }

    #[test]
    fn cookie_round_trip_passthrough() {
        let codec = PassthroughCodec;
        for id in [0, 42, i64::MAX] {
            let encoded = codec
                .encode(CLIENT_ID_COOKIE, &encode_client_id(id))
                .unwrap();
            let plain = codec.decode(CLIENT_ID_COOKIE, &encoded).unwrap();
            assert_eq!(decode_client_id(&plain).unwrap(), id);
        }
    }

    #[test]
    fn cookie_round_trip_hmac() {
        let codec = HmacCodec::new(b"test-secret".to_vec());
        for id in [0, 42, i64::MAX] {
            let encoded = codec
                .encode(CLIENT_ID_COOKIE, &encode_client_id(id))
                .unwrap();
            let plain = codec.decode(CLIENT_ID_COOKIE, &encoded).unwrap();
            assert_eq!(decode_client_id(&plain).unwrap(), id);
        }
    }

    #[test]
    fn hmac_codec_rejects_tampered_values() {
        let codec = HmacCodec::new(b"test-secret".to_vec());
        let encoded = codec.encode(CLIENT_ID_COOKIE, "zz").unwrap();

        // Flip the payload while keeping the tag.
        let tampered = encoded.replacen("zz", "z1", 1);
        assert!(matches!(
            codec.decode(CLIENT_ID_COOKIE, &tampered),
            Err(CodecError::BadSignature)
        ));

        // No tag at all.
        assert!(matches!(
            codec.decode(CLIENT_ID_COOKIE, "zz"),
            Err(CodecError::Malformed)
        ));

        // Wrong key.
        let other = HmacCodec::new(b"other-secret".to_vec());
        assert!(other.decode(CLIENT_ID_COOKIE, &encoded).is_err());
    }

    #[test]
    fn cookie_value_finds_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("a=1; webtrack_client=k3; b=2"),
        );
        assert_eq!(cookie_value(&headers, CLIENT_ID_COOKIE).as_deref(), Some("k3"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn client_id_resolution() {
        let codec = PassthroughCodec;

        let headers = HeaderMap::new();
        assert!(matches!(
            client_id_from_request(&headers, &codec),
            Ok(None)
        ));

        let mut headers = HeaderMap::new();
        let set_cookie = make_client_id_cookie(1234567, &codec).unwrap();
        let pair = set_cookie
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();
        headers.insert(COOKIE, HeaderValue::from_str(&pair).unwrap());
        assert!(matches!(
            client_id_from_request(&headers, &codec),
            Ok(Some(1234567))
        ));

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("webtrack_client=not base36!"),
        );
        assert!(client_id_from_request(&headers, &codec).is_err());
    }
}
