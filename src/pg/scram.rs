//! SCRAM-SHA-256 authentication implementation.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) for PostgreSQL,
//! without channel binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const MECHANISM: &str = "SCRAM-SHA-256";

/// `n,,` (no channel binding, no authzid), base64 encoded.
const GS2_HEADER_B64: &str = "biws";

/// SCRAM authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    #[error("invalid server message")]
    InvalidServerMessage,
    #[error("invalid salt encoding")]
    InvalidSalt,
    #[error("invalid iteration count")]
    InvalidIterations,
    #[error("missing {0} in server message")]
    Missing(&'static str),
    #[error("server nonce verification failed")]
    NonceVerificationFailed,
    #[error("invalid server signature")]
    InvalidServerSignature,
    #[error("server signature verification failed")]
    ServerSignatureVerificationFailed,
    #[error("server reported error: {0}")]
    Server(String),
    #[error("SCRAM exchange out of order")]
    InvalidState,
}

enum State {
    Initial,
    /// client-final sent; waiting for the server signature
    ClientFinalSent {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

/// SCRAM-SHA-256 client state machine.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    state: State,
}

impl ScramClient {
    /// Create a new SCRAM client with a random nonce.
    pub fn new(username: &str, password: &str) -> Self {
        // 18 random bytes, base64 encoded (24 chars)
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, BASE64.encode(nonce_bytes))
    }

    pub(crate) fn with_nonce(username: &str, password: &str, client_nonce: String) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            state: State::Initial,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", escape_saslname(&self.username), self.client_nonce)
    }

    /// The initial client message (client-first-message).
    ///
    /// Format: `n,,n=<username>,r=<client-nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Process the server's first message and produce the client's final message.
    ///
    /// Server message format: `r=<nonce>,s=<salt>,i=<iterations>`
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        if !matches!(self.state, State::Initial) {
            return Err(ScramError::InvalidState);
        }
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .ok()
                        .filter(|&i| i > 0)
                        .ok_or(ScramError::InvalidIterations)?,
                );
            } else if let Some(value) = part.strip_prefix("e=") {
                return Err(ScramError::Server(value.to_string()));
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::Missing("nonce"))?;
        let salt = salt.ok_or(ScramError::Missing("salt"))?;
        let iterations = iterations.ok_or(ScramError::Missing("iteration count"))?;

        // The server must extend our nonce, not replace it
        if combined_nonce.len() <= self.client_nonce.len()
            || !combined_nonce.starts_with(&self.client_nonce)
        {
            return Err(ScramError::NonceVerificationFailed);
        }

        let salted_password = hi(&self.password, &salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c={},r={}", GS2_HEADER_B64, combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let client_proof = xor_bytes(&client_key, &client_signature);

        self.state = State::ClientFinalSent {
            salted_password,
            auth_message,
        };

        Ok(format!("{},p={}", client_final_without_proof, BASE64.encode(client_proof)).into_bytes())
    }

    /// Verify the server's final message (server signature).
    ///
    /// Server message format: `v=<verifier>`
    pub fn verify_server_final(&mut self, server_msg: &[u8]) -> Result<(), ScramError> {
        let State::ClientFinalSent {
            salted_password,
            auth_message,
        } = &self.state
        else {
            return Err(ScramError::InvalidState);
        };

        let server_final =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::Server(err.to_string()));
        }
        let verifier_b64 = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or(ScramError::InvalidServerSignature)?;
        let server_signature = BASE64
            .decode(verifier_b64)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected_signature = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if server_signature != expected_signature {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }

        self.state = State::Done;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Done)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::InvalidState)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::InvalidState)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (out, (x, y)) in result.iter_mut().zip(a.iter().zip(b)) {
        *out = x ^ y;
    }
    result
}

/// `,` and `=` are reserved in SCRAM attribute values.
///
/// The server ignores this name and uses the one from the startup packet.
fn escape_saslname(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}
