//! Session token verification.
//!
//! Validates session tokens against the key set of a [`VerificationContext`]
//! and maps the verified claims to a [`Session`].
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Audience must equal the context's environment ID
//! - Expiry is enforced with zero leeway: a token whose `exp` is the current
//!   second is already expired
//! - `sub`, `exp` and `aud` are required
//! - Consumer-facing errors are generic; per-key detail is logged at debug

use crate::error::{InvalidTokenError, KeyFailure, Result};
use crate::jwks::Jwk;
use crate::jwt::{peek_kid, SessionClaims, REQUIRED_CLAIMS};
use crate::types::{Session, VerificationContext};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::str::FromStr;
use tracing::instrument;

/// Length of a raw Ed25519 public key.
const ED25519_PUBLIC_KEY_LEN: usize = 32;

/// Failure reason for a token that is expired at verification time.
const EXPIRED_REASON: &str = "ExpiredSignature";

/// Verify `token` against `context` at the current system time.
///
/// See [`verify_token_at`].
///
/// # Errors
///
/// Returns `SessionError::InvalidToken` for any token [`verify_token_at`]
/// rejects.
pub async fn verify_token(context: &VerificationContext, token: &str) -> Result<Session> {
    verify_token_at(context, token, Utc::now()).await
}

/// Verify `token` against `context` as of `now` and extract the session.
///
/// The token is expired when `now` has reached its `exp`, the same boundary
/// as [`Session::is_expired_at`].
///
/// If the token names a key ID present in the key set, only that key is
/// tried. Otherwise every key is tried in listed order and the first failure
/// is reported if all of them fail. An unknown key ID triggers at most one
/// early refetch of the key set.
///
/// # Errors
///
/// Returns `SessionError::InvalidToken` if the token is malformed, its
/// signature does not verify, its audience does not match, it has expired,
/// or a required claim is missing.
#[instrument(skip_all, fields(environment_id = %context.environment_id))]
pub async fn verify_token_at(
    context: &VerificationContext,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Session> {
    let kid = peek_kid(token)?;
    let mut keys = context.key_set.keys().await;

    if let Some(kid) = kid.as_deref() {
        if !contains_kid(&keys, kid) {
            tracing::debug!(target: "session.verifier", kid = %kid, "Key ID not in key set, refetching");
            if let Some(refreshed) = context.key_set.refresh_for_unknown_kid().await {
                keys = refreshed;
            }
        }
    }

    let candidates: Vec<&Jwk> = match kid.as_deref() {
        Some(kid) if contains_kid(&keys, kid) => keys
            .iter()
            .filter(|jwk| jwk.kid.as_deref() == Some(kid))
            .take(1)
            .collect(),
        _ => keys.iter().collect(),
    };

    if candidates.is_empty() {
        tracing::debug!(target: "session.verifier", "Key set has no keys");
        return Err(InvalidTokenError::new("no verification keys available").into());
    }

    let mut failures = Vec::new();
    for jwk in candidates {
        let verified = verify_with_key(token, jwk, &context.environment_id)
            .and_then(|claims| claims.into_session().map_err(|e| e.reason))
            .and_then(|session| {
                if session.is_expired_at(now) {
                    Err(EXPIRED_REASON.to_string())
                } else {
                    Ok(session)
                }
            });

        match verified {
            Ok(session) => {
                tracing::debug!(
                    target: "session.verifier",
                    kid = ?jwk.kid,
                    "Token verified successfully"
                );
                return Ok(session);
            }
            Err(reason) => {
                tracing::debug!(
                    target: "session.verifier",
                    kid = ?jwk.kid,
                    reason = %reason,
                    "Token verification against key failed"
                );
                failures.push(KeyFailure {
                    kid: jwk.kid.clone(),
                    reason,
                });
            }
        }
    }

    Err(InvalidTokenError::from_key_failures(failures)
        .unwrap_or_else(|| InvalidTokenError::new("no verification keys available"))
        .into())
}

fn contains_kid(keys: &[Jwk], kid: &str) -> bool {
    keys.iter().any(|jwk| jwk.kid.as_deref() == Some(kid))
}

/// Verify the signature, audience and required claims against one key.
///
/// Expiry is checked by the caller against its own clock.
fn verify_with_key(
    token: &str,
    jwk: &Jwk,
    environment_id: &str,
) -> std::result::Result<SessionClaims, String> {
    let (decoding_key, algorithm) = decoding_key(jwk)?;

    let mut validation = Validation::new(algorithm);
    validation.leeway = 0;
    validation.validate_exp = false;
    validation.set_audience(&[environment_id]);
    validation.set_required_spec_claims(&REQUIRED_CLAIMS);

    decode::<SessionClaims>(token, &decoding_key, &validation)
        .map(|data| data.claims)
        .map_err(|e| e.to_string())
}

/// Build the decoding key and algorithm for a JWK.
fn decoding_key(jwk: &Jwk) -> std::result::Result<(DecodingKey, Algorithm), String> {
    let algorithm = match jwk.alg.as_deref() {
        Some(alg) => {
            Some(Algorithm::from_str(alg).map_err(|_| format!("unsupported algorithm {alg}"))?)
        }
        None => None,
    };

    match jwk.kty.as_str() {
        "OKP" => {
            if jwk.crv.as_deref().is_some_and(|crv| crv != "Ed25519") {
                return Err("unsupported OKP curve".to_string());
            }
            let x = jwk.x.as_deref().ok_or("JWK missing x field")?;
            let bytes = URL_SAFE_NO_PAD
                .decode(x)
                .map_err(|_| "invalid public key encoding".to_string())?;
            if bytes.len() != ED25519_PUBLIC_KEY_LEN {
                return Err(format!(
                    "invalid Ed25519 public key length {}",
                    bytes.len()
                ));
            }
            Ok((
                DecodingKey::from_ed_der(&bytes),
                algorithm.unwrap_or(Algorithm::EdDSA),
            ))
        }
        "RSA" => {
            let n = jwk.n.as_deref().ok_or("JWK missing n field")?;
            let e = jwk.e.as_deref().ok_or("JWK missing e field")?;
            let key = DecodingKey::from_rsa_components(n, e).map_err(|e| e.to_string())?;
            Ok((key, algorithm.unwrap_or(Algorithm::RS256)))
        }
        "EC" => {
            let x = jwk.x.as_deref().ok_or("JWK missing x field")?;
            let y = jwk.y.as_deref().ok_or("JWK missing y field")?;
            let default_alg = match jwk.crv.as_deref() {
                Some("P-256") | None => Algorithm::ES256,
                Some("P-384") => Algorithm::ES384,
                Some(_) => return Err("unsupported EC curve".to_string()),
            };
            let key = DecodingKey::from_ec_components(x, y).map_err(|e| e.to_string())?;
            Ok((key, algorithm.unwrap_or(default_alg)))
        }
        other => Err(format!("unsupported key type {other}")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn okp(x: Option<&str>) -> Jwk {
        Jwk {
            kty: "OKP".to_string(),
            kid: Some("k1".to_string()),
            crv: Some("Ed25519".to_string()),
            x: x.map(ToString::to_string),
            y: None,
            n: None,
            e: None,
            alg: Some("EdDSA".to_string()),
            key_use: Some("sig".to_string()),
        }
    }

    #[test]
    fn test_okp_key_defaults_to_eddsa() {
        let mut jwk = okp(Some(&URL_SAFE_NO_PAD.encode([7u8; 32])));
        jwk.alg = None;

        let (_, alg) = decoding_key(&jwk).unwrap();
        assert_eq!(alg, Algorithm::EdDSA);
    }

    #[test]
    fn test_okp_key_rejects_bad_material() {
        assert!(decoding_key(&okp(None)).is_err());
        assert!(decoding_key(&okp(Some("!!!"))).is_err());

        let short = URL_SAFE_NO_PAD.encode([7u8; 16]);
        let err = decoding_key(&okp(Some(&short))).err().unwrap();
        assert!(err.contains("length"));
    }

    #[test]
    fn test_unsupported_key_type_and_algorithm() {
        let mut jwk = okp(Some(&URL_SAFE_NO_PAD.encode([7u8; 32])));
        jwk.kty = "oct".to_string();
        assert!(decoding_key(&jwk).err().unwrap().contains("unsupported key type"));

        let mut jwk = okp(Some(&URL_SAFE_NO_PAD.encode([7u8; 32])));
        jwk.alg = Some("none".to_string());
        assert!(decoding_key(&jwk).is_err());
    }

    #[test]
    fn test_ec_key_algorithm_follows_curve() {
        let jwk = Jwk {
            kty: "EC".to_string(),
            kid: None,
            crv: Some("P-521".to_string()),
            x: Some("AA".to_string()),
            y: Some("AA".to_string()),
            n: None,
            e: None,
            alg: None,
            key_use: None,
        };
        assert!(decoding_key(&jwk).err().unwrap().contains("curve"));
    }

    #[test]
    fn test_rsa_key_requires_components() {
        let jwk = Jwk {
            kty: "RSA".to_string(),
            kid: Some("rsa-1".to_string()),
            crv: None,
            x: None,
            y: None,
            n: Some("sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri".to_string()),
            e: None,
            alg: None,
            key_use: None,
        };
        assert!(decoding_key(&jwk).err().unwrap().contains("missing e"));
    }
}
