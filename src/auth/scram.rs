//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677), without channel binding.
//!
//! The exchange is modelled as two values:
//!
//! ```ignore
//! let scram = ScramSha256::new("replicator");
//! send_sasl_initial("SCRAM-SHA-256", scram.client_first());
//! let (client_final, verifier) = scram.client_final("secret", &server_first)?;
//! send_sasl_response(client_final);
//! verifier.verify(&server_final)?;
//! ```

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{ReplicationError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const MECHANISM: &str = "SCRAM-SHA-256";
/// base64("n,,"): GS2 header for "no channel binding".
const GS2_HEADER_B64: &str = "biws";

fn auth_err(msg: impl Into<String>) -> ReplicationError {
    ReplicationError::Auth(msg.into())
}

/// First half of the exchange: holds the client nonce.
#[derive(Debug, Clone)]
pub struct ScramSha256 {
    nonce: String,
    first_bare: String,
}

/// Second half: checks the server's proof that it knows the password.
#[derive(Debug, Clone)]
pub struct ScramVerifier {
    server_key: Vec<u8>,
    auth_message: String,
}

/// Parsed server-first-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFirst {
    pub nonce: String,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl ScramSha256 {
    pub fn new(username: &str) -> Self {
        let mut raw = [0u8; 18];
        rand::rng().fill_bytes(&mut raw);
        Self::with_nonce(username, &B64.encode(raw))
    }

    pub(crate) fn with_nonce(username: &str, nonce: &str) -> Self {
        // PostgreSQL ignores the SASL user name, but it must be well formed.
        let user = username.replace('=', "=3D").replace(',', "=2C");
        Self {
            nonce: nonce.to_string(),
            first_bare: format!("n={user},r={nonce}"),
        }
    }

    /// client-first-message, GS2 header included.
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.first_bare)
    }

    /// Build client-final-message for `server_first` and the verifier for
    /// the server's reply.
    pub fn client_final(self, password: &str, server_first: &str) -> Result<(String, ScramVerifier)> {
        let sf = ServerFirst::parse(server_first)?;
        if !sf.nonce.starts_with(&self.nonce) || sf.nonce.len() == self.nonce.len() {
            return Err(auth_err("SCRAM nonce mismatch: server nonce must extend client nonce"));
        }

        let without_proof = format!("c={GS2_HEADER_B64},r={}", sf.nonce);
        let auth_message = format!("{},{server_first},{without_proof}", self.first_bare);

        let salted = hi(password.as_bytes(), &sf.salt, sf.iterations)?;
        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key = Sha256::digest(&client_key);
        let signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let verifier = ScramVerifier {
            server_key: hmac(&salted, b"Server Key")?,
            auth_message,
        };
        Ok((format!("{without_proof},p={}", B64.encode(proof)), verifier))
    }
}

impl ServerFirst {
    pub fn parse(msg: &str) -> Result<Self> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for attr in msg.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v.to_string()),
                Some(("s", v)) => {
                    salt = Some(
                        B64.decode(v)
                            .map_err(|e| auth_err(format!("SCRAM invalid salt base64: {e}")))?,
                    );
                }
                Some(("i", v)) => iterations = v.parse::<u32>().ok().filter(|&i| i > 0),
                _ => {}
            }
        }

        Ok(Self {
            nonce: nonce.ok_or_else(|| auth_err("SCRAM server-first missing nonce (r=)"))?,
            salt: salt.ok_or_else(|| auth_err("SCRAM server-first missing salt (s=)"))?,
            iterations: iterations
                .ok_or_else(|| auth_err("SCRAM server-first missing or invalid iteration count (i=)"))?,
        })
    }
}

impl ScramVerifier {
    /// Check server-final-message. Comparison is constant time.
    pub fn verify(&self, server_final: &str) -> Result<()> {
        let mut signature = None;
        for attr in server_final.split(',') {
            match attr.split_once('=') {
                Some(("e", err)) => return Err(auth_err(format!("SCRAM server error: {err}"))),
                Some(("v", v)) => signature = Some(v.trim()),
                _ => {}
            }
        }
        let signature = signature.ok_or_else(|| auth_err("SCRAM server-final missing signature (v=)"))?;
        let signature = B64
            .decode(signature)
            .map_err(|e| auth_err(format!("SCRAM invalid server signature base64: {e}")))?;

        let mut mac = new_mac(&self.server_key)?;
        mac.update(self.auth_message.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| auth_err("SCRAM server signature mismatch"))
    }
}

fn new_mac(key: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|e| auth_err(format!("HMAC key: {e}")))
}

fn hmac(key: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let mut mac = new_mac(key)?;
    mac.update(msg);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// `Hi()` from RFC 5802, i.e. PBKDF2-HMAC-SHA-256 with one output block.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>> {
    let prf = new_mac(password)?;

    let mut mac = prf.clone();
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u = mac.finalize().into_bytes();
    let mut out = u.to_vec();

    for _ in 1..iterations {
        let mut mac = prf.clone();
        mac.update(&u);
        u = mac.finalize().into_bytes();
        for (o, x) in out.iter_mut().zip(u.iter()) {
            *o ^= x;
        }
    }
    Ok(out)
}
