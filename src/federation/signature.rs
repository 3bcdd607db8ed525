//! HTTP Signatures for ActivityPub
//!
//! Signing of outgoing fetches and deliveries, and verification of
//! inbound deliveries, per:
//! https://docs.joinmastodon.org/spec/security/

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Maximum accepted clock skew for the Date header
const MAX_DATE_SKEW_SECONDS: i64 = 300;

/// Headers to add to a signed request
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    /// Host header value the signature covers
    pub host: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
    /// Signature header value
    pub signature: String,
}

/// Sign an HTTP request as a local actor
///
/// # Arguments
/// * `method` - HTTP method (e.g., "GET", "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (adds a signed Digest)
/// * `private_key_pem` - RSA private key in PKCS#8 or PKCS#1 PEM
/// * `key_id` - Full URL to the public key (actor#main-key)
pub fn sign_request(
    method: &str,
    url: &url::Url,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignedHeaders, AppError> {
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(AppError::Validation("Missing host in URL".to_string())),
    };

    let path_and_query = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(generate_digest);

    let mut signed_names = vec!["(request-target)", "host", "date"];
    let mut signing_parts = vec![
        format!("(request-target): {} {}", method.to_lowercase(), path_and_query),
        format!("host: {host}"),
        format!("date: {date}"),
    ];
    if let Some(digest) = &digest {
        signed_names.push("digest");
        signing_parts.push(format!("digest: {digest}"));
    }
    let signing_string = signing_parts.join("\n");

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid private key: {e}")))?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let signature = signing_key.sign_with_rng(&mut rand::thread_rng(), signing_string.as_bytes());

    let signature = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        signed_names.join(" "),
        BASE64.encode(signature.to_bytes())
    );

    Ok(SignedHeaders {
        host,
        date,
        digest,
        signature,
    })
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct SignatureParams {
    /// Key ID (URL to public key)
    pub key_id: String,
    pub algorithm: Option<String>,
    /// Signed header names, lowercased
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

impl SignatureParams {
    /// Actor IRI the key belongs to (key ID without fragment)
    pub fn key_owner(&self) -> &str {
        key_owner(&self.key_id)
    }
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<SignatureParams, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_string()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(str::to_ascii_lowercase)
                        .collect::<Vec<_>>(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(SignatureParams {
        key_id: key_id.ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?,
        algorithm,
        // Absent `headers` means only Date is signed
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| AppError::Validation("Missing signature".to_string()))?,
    })
}

/// Read and parse the Signature header of a request
pub fn signature_params(headers: &http::HeaderMap) -> Result<SignatureParams, AppError> {
    let header = headers
        .get("signature")
        .ok_or(AppError::Unauthorized)?
        .to_str()
        .map_err(|_| AppError::Validation("Invalid Signature header".to_string()))?;
    parse_signature_header(header)
}

/// Verify an inbound request signature
///
/// # Arguments
/// * `method` - HTTP method
/// * `path_and_query` - Request target as received
/// * `headers` - All request headers
/// * `body` - Request body (its Digest must be signed and match)
/// * `public_key_pem` - Sender's RSA public key
///
/// # Errors
/// - `AppError::Validation` for structurally unusable headers
/// - `AppError::InvalidSignature` if the signature does not verify
pub fn verify_signature(
    method: &str,
    path_and_query: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), AppError> {
    let params = signature_params(headers)?;

    if let Some(algorithm) = &params.algorithm {
        if algorithm != "rsa-sha256" && algorithm != "hs2019" {
            return Err(AppError::Validation(format!(
                "Unsupported signature algorithm: {algorithm}"
            )));
        }
    }

    for required in ["(request-target)", "date"] {
        if !params.headers.iter().any(|h| h == required) {
            return Err(AppError::Validation(format!(
                "Signed headers must include: {required}"
            )));
        }
    }

    let date = DateTime::parse_from_rfc2822(header_value(headers, "date")?)
        .map_err(|_| AppError::Validation("Invalid Date format".to_string()))?;
    if (Utc::now().timestamp() - date.timestamp()).abs() > MAX_DATE_SKEW_SECONDS {
        return Err(AppError::Validation(
            "Date header too old or in future".to_string(),
        ));
    }

    if let Some(body) = body {
        if !params.headers.iter().any(|h| h == "digest") {
            return Err(AppError::Validation(
                "Signed headers must include: digest".to_string(),
            ));
        }
        if header_value(headers, "digest")? != generate_digest(body) {
            return Err(AppError::InvalidSignature);
        }
    }

    let signing_string = params
        .headers
        .iter()
        .map(|name| match name.as_str() {
            "(request-target)" => Ok(format!(
                "(request-target): {} {}",
                method.to_lowercase(),
                path_and_query
            )),
            other => header_value(headers, other).map(|value| format!("{other}: {value}")),
        })
        .collect::<Result<Vec<_>, _>>()?
        .join("\n");

    let signature_bytes = BASE64
        .decode(&params.signature)
        .map_err(|_| AppError::Validation("Invalid signature encoding".to_string()))?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| AppError::InvalidSignature)?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_key_pem))
        .map_err(|e| AppError::Validation(format!("Invalid public key: {e}")))?;

    VerifyingKey::<Sha256>::new(public_key)
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature)
}

fn header_value<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("Missing {name} header")))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("Invalid {name} header")))
}

/// Actor IRI for a key ID (`https://x/users/a#main-key` -> `https://x/users/a`)
pub fn key_owner(key_id: &str) -> &str {
    key_id.split('#').next().unwrap_or(key_id)
}

/// Whether a signature key ID belongs to the given actor
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    key_owner(key_id) == key_owner(actor_id)
}

/// SHA-256 digest header value for a body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Generate an RSA keypair for a new local actor
///
/// # Returns
/// `(private_key_pem, public_key_pem)`, PKCS#8 / SPKI encoded
pub fn generate_keypair(bits: usize) -> Result<(String, String), AppError> {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Key generation failed: {e}")))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Key encoding failed: {e}")))?
        .to_string();
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Key encoding failed: {e}")))?;

    Ok((private_pem, public_pem))
}
