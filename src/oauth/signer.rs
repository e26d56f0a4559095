// =============================================================================
// OAuth 1.0a request signing — RFC 5849, HMAC-SHA1
// =============================================================================
//
// Signature base string:
//
//   METHOD & percent(base_url) & percent(k1=v1&k2=v2...)
//
// where the parameter string is every oauth_* and query parameter, percent-
// encoded, sorted by encoded key (then encoded value), and joined with '&'.
// Signing key = percent(consumer_secret) '&' percent(token_secret).
//
// Nonce: 32 bytes of CSPRNG, base64url without padding. Timestamp: integer
// seconds. Given fixed nonce and timestamp the output header is
// byte-deterministic, which the tests pin against a published RFC-era
// reference vector.
// =============================================================================

use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD as B64_URL};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Percent-encode per RFC 3986 §2.3: only ALPHA / DIGIT / '-' / '.' / '_' /
/// '~' pass through.
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(*byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// 32 random bytes, base64url-encoded without padding.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    B64_URL.encode(bytes)
}

/// Integer-seconds timestamp for the oauth_timestamp parameter.
pub fn generate_timestamp() -> String {
    chrono::Utc::now().timestamp().to_string()
}

/// The inputs of one signature, fully explicit so signing is a pure function.
#[derive(Debug, Clone)]
pub struct SigningInput<'a> {
    pub method: &'a str,
    /// Scheme + host + path, no query string.
    pub base_url: &'a str,
    /// All parameters: oauth_* plus request query/body parameters.
    pub params: Vec<(String, String)>,
    pub consumer_secret: &'a str,
    /// Empty string before an access token exists (request-token leg).
    pub token_secret: &'a str,
}

/// The normalized parameter string: encoded pairs sorted by key then value.
fn parameter_string(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// The signature base string for `input`.
pub fn signature_base_string(input: &SigningInput<'_>) -> String {
    format!(
        "{}&{}&{}",
        input.method.to_uppercase(),
        percent_encode(input.base_url),
        percent_encode(&parameter_string(&input.params))
    )
}

/// HMAC-SHA1 signature, base64-encoded.
pub fn sign(input: &SigningInput<'_>) -> String {
    let base = signature_base_string(input);
    let key = format!(
        "{}&{}",
        percent_encode(input.consumer_secret),
        percent_encode(input.token_secret)
    );
    let mut mac = HmacSha1::new_from_slice(key.as_bytes()).expect("HMAC accepts any key size");
    mac.update(base.as_bytes());
    B64.encode(mac.finalize().into_bytes())
}

/// Assemble the `Authorization: OAuth ...` header value from oauth_*
/// parameters (everything else travels in the query string).
pub fn authorization_header(oauth_params: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = oauth_params
        .iter()
        .filter(|(k, _)| k.starts_with("oauth_"))
        .cloned()
        .collect();
    pairs.sort();
    let joined = pairs
        .into_iter()
        .map(|(k, v)| format!("{k}=\"{}\"", percent_encode(&v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("OAuth {joined}")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encoding_matrix() {
        assert_eq!(percent_encode("abcXYZ019-._~"), "abcXYZ019-._~");
        assert_eq!(percent_encode("a b"), "a%20b");
        assert_eq!(percent_encode("a+b"), "a%2Bb");
        assert_eq!(percent_encode("a/b?c=d&e"), "a%2Fb%3Fc%3Dd%26e");
        assert_eq!(percent_encode("ä"), "%C3%A4");
    }

    #[test]
    fn nonce_is_unique_and_url_safe() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_ne!(a, b);
        assert!(!a.contains('='));
        assert!(!a.contains('+'));
        assert!(!a.contains('/'));
        // 32 bytes → 43 base64url chars without padding.
        assert_eq!(a.len(), 43);
    }

    fn reference_input() -> SigningInput<'static> {
        // Published HMAC-SHA1 reference vector (Twitter API signing guide).
        let params = vec![
            ("status".to_string(), "Hello Ladies + Gentlemen, a signed OAuth request!".to_string()),
            ("include_entities".to_string(), "true".to_string()),
            ("oauth_consumer_key".to_string(), "xvz1evFS4wEEPTGEFPHBog".to_string()),
            (
                "oauth_nonce".to_string(),
                "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg".to_string(),
            ),
            ("oauth_signature_method".to_string(), "HMAC-SHA1".to_string()),
            ("oauth_timestamp".to_string(), "1318622958".to_string()),
            (
                "oauth_token".to_string(),
                "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb".to_string(),
            ),
            ("oauth_version".to_string(), "1.0".to_string()),
        ];
        SigningInput {
            method: "post",
            base_url: "https://api.twitter.com/1/statuses/update.json",
            params,
            consumer_secret: "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw",
            token_secret: "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE",
        }
    }

    #[test]
    fn base_string_matches_reference_vector() {
        let base = signature_base_string(&reference_input());
        assert!(base.starts_with(
            "POST&https%3A%2F%2Fapi.twitter.com%2F1%2Fstatuses%2Fupdate.json&"
        ));
        assert!(base.contains("include_entities%3Dtrue"));
        // The status value is double-encoded inside the base string.
        assert!(base.contains("status%3DHello%2520Ladies%2520%252B%2520Gentlemen"));
    }

    #[test]
    fn signature_matches_reference_vector() {
        assert_eq!(sign(&reference_input()), "tnnArxj06cWHq44gCs1OSKk/jLY=");
    }

    #[test]
    fn signing_is_deterministic() {
        let input = reference_input();
        assert_eq!(sign(&input), sign(&input));
    }

    #[test]
    fn parameter_order_does_not_matter() {
        let mut input = reference_input();
        input.params.reverse();
        assert_eq!(sign(&input), "tnnArxj06cWHq44gCs1OSKk/jLY=");
    }

    #[test]
    fn header_includes_only_oauth_params() {
        let params = vec![
            ("oauth_consumer_key".to_string(), "ck".to_string()),
            ("oauth_signature".to_string(), "a+b/c=".to_string()),
            ("status".to_string(), "leak?".to_string()),
        ];
        let header = authorization_header(&params);
        assert!(header.starts_with("OAuth "));
        assert!(header.contains("oauth_consumer_key=\"ck\""));
        assert!(header.contains("oauth_signature=\"a%2Bb%2Fc%3D\""));
        assert!(!header.contains("status"));
    }

    #[test]
    fn empty_token_secret_still_signs() {
        let input = SigningInput {
            method: "GET",
            base_url: "https://api.etrade.com/oauth/request_token",
            params: vec![("oauth_consumer_key".to_string(), "key".to_string())],
            consumer_secret: "secret",
            token_secret: "",
        };
        let sig = sign(&input);
        assert!(!sig.is_empty());
    }
}
