//! Deterministic cryptographic fixtures for testing
//!
//! Provides reproducible Ed25519 keypairs that sign session tokens and
//! publish themselves as JWKs. All fixtures are deterministic based on seed
//! values.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde_json::json;
use session_core::jwks::Jwk;

/// Deterministic Ed25519 signing key with a key ID.
pub struct TestKeypair {
    kid: String,
    public_key: Vec<u8>,
    encoding_key: EncodingKey,
}

impl TestKeypair {
    /// Generate the keypair for `seed`, published under `kid`.
    ///
    /// The same seed always produces the same keypair.
    pub fn new(seed: u8, kid: &str) -> Self {
        let seed_bytes = seed_bytes(seed);
        let key_pair = Ed25519KeyPair::from_seed_unchecked(&seed_bytes)
            .expect("Failed to generate test keypair");

        Self {
            kid: kid.to_string(),
            public_key: key_pair.public_key().as_ref().to_vec(),
            encoding_key: EncodingKey::from_ed_der(&build_pkcs8_from_seed(&seed_bytes)),
        }
    }

    /// Key ID.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Raw public key, base64url encoded.
    pub fn public_key_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.public_key)
    }

    /// The public key as a JWK.
    pub fn jwk(&self) -> Jwk {
        serde_json::from_value(self.jwk_json()).expect("JWK fixture must deserialize")
    }

    /// The public key as a JWK JSON object.
    pub fn jwk_json(&self) -> serde_json::Value {
        json!({
            "kty": "OKP",
            "kid": self.kid,
            "crv": "Ed25519",
            "x": self.public_key_b64(),
            "alg": "EdDSA",
            "use": "sig",
        })
    }

    /// Sign `claims` with a `kid` header.
    pub fn sign(&self, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.typ = Some("JWT".to_string());
        header.kid = Some(self.kid.clone());
        encode(&header, claims, &self.encoding_key).expect("Failed to sign test token")
    }

    /// Sign `claims` without a `kid` header.
    pub fn sign_without_kid(&self, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.typ = Some("JWT".to_string());
        encode(&header, claims, &self.encoding_key).expect("Failed to sign test token")
    }
}

/// JWKS listing JSON for `keypairs`, in order.
pub fn jwks_json(keypairs: &[&TestKeypair]) -> serde_json::Value {
    json!({
        "keys": keypairs.iter().map(|kp| kp.jwk_json()).collect::<Vec<_>>(),
    })
}

/// Deterministic 32-byte seed derived from `seed`.
fn seed_bytes(seed: u8) -> [u8; 32] {
    let mut seed_bytes = [0u8; 32];
    seed_bytes[0] = seed;
    // Fill rest with deterministic pattern
    for (i, byte) in seed_bytes.iter_mut().enumerate().skip(1) {
        *byte = seed.wrapping_mul(i as u8).wrapping_add(i as u8);
    }
    seed_bytes
}

/// Build PKCS#8 v1 document from Ed25519 seed
///
/// This is a test-only utility. Production code never holds signing keys.
pub fn build_pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
    // SEQUENCE { INTEGER 0, SEQUENCE { OID 1.3.101.112 }, OCTET STRING { OCTET STRING seed } }
    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&[0x02, 0x01, 0x00]);
    pkcs8.extend_from_slice(&[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70]);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(seed);
    pkcs8
}
