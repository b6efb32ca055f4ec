//! Authentication for the control connection.
//!
//! Credentials for AUTHENTICATE (password, cookie, SAFECOOKIE
//! challenge/response) plus generation of the `HashedControlPassword`
//! value handed to a daemon we launch ourselves (OpenPGP S2K, the `16:`
//! format the daemon's own `--hash-password` produces).

use std::path::Path;

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::{Result, TorError};

type HmacSha256 = Hmac<Sha256>;

/// Credentials for authenticating a control connection.
#[derive(Debug, Clone, Default)]
pub enum AuthCredential {
    /// No authentication (NULL method).
    #[default]
    None,
    /// Password for the HASHEDPASSWORD method.
    Password(String),
    /// Cookie file path; contents are read and sent as hex.
    CookieFile(std::path::PathBuf),
    /// SAFECOOKIE challenge/response using the given cookie file.
    SafeCookie {
        /// Path to the cookie file.
        cookie_path: std::path::PathBuf,
    },
}

/// Read the 32-byte authentication cookie from a file.
pub fn read_cookie_file(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path).map_err(|e| {
        TorError::AuthenticationFailed(format!(
            "failed to read cookie file '{}': {}",
            path.display(),
            e
        ))
    })?;

    if data.len() != 32 {
        return Err(TorError::AuthenticationFailed(format!(
            "cookie file has invalid length {} (expected 32)",
            data.len()
        )));
    }

    Ok(data)
}

/// Generate a random client nonce for SAFECOOKIE authentication.
pub fn generate_client_nonce() -> [u8; 32] {
    use rand::Rng;
    let mut nonce = [0u8; 32];
    rand::rng().fill(&mut nonce);
    nonce
}

/// Compute the server-to-controller hash for SAFECOOKIE.
pub fn compute_server_hash(cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    safecookie_hmac(
        b"Tor safe cookie authentication server-to-controller hash",
        cookie,
        client_nonce,
        server_nonce,
    )
}

/// Compute the controller-to-server hash for SAFECOOKIE.
pub fn compute_client_hash(cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    safecookie_hmac(
        b"Tor safe cookie authentication controller-to-server hash",
        cookie,
        client_nonce,
        server_nonce,
    )
}

fn safecookie_hmac(key: &[u8], cookie: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(cookie);
    mac.update(client_nonce);
    mac.update(server_nonce);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&mac.finalize().into_bytes());
    hash
}

/// Verify the server's half of the SAFECOOKIE exchange.
pub fn verify_server_hash(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
    expected_hash: &[u8],
) -> bool {
    let computed = compute_server_hash(cookie, client_nonce, server_nonce);
    constant_time_compare(&computed, expected_hash)
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Parse the AUTHCHALLENGE reply: `SERVERHASH=<hex> SERVERNONCE=<hex>`.
pub fn parse_authchallenge_response(text: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut server_hash = None;
    let mut server_nonce = None;

    for part in text.split_whitespace() {
        if let Some(hash) = part.strip_prefix("SERVERHASH=") {
            server_hash = Some(hex::decode(hash).map_err(|e| {
                TorError::Protocol(format!("invalid SERVERHASH hex: {}", e))
            })?);
        } else if let Some(nonce) = part.strip_prefix("SERVERNONCE=") {
            server_nonce = Some(hex::decode(nonce).map_err(|e| {
                TorError::Protocol(format!("invalid SERVERNONCE hex: {}", e))
            })?);
        }
    }

    let server_hash =
        server_hash.ok_or_else(|| TorError::Protocol("missing SERVERHASH".to_string()))?;
    let server_nonce =
        server_nonce.ok_or_else(|| TorError::Protocol("missing SERVERNONCE".to_string()))?;

    if server_hash.len() != 32 || server_nonce.len() != 32 {
        return Err(TorError::Protocol(format!(
            "bad AUTHCHALLENGE field lengths: hash {}, nonce {}",
            server_hash.len(),
            server_nonce.len()
        )));
    }

    Ok((server_hash, server_nonce))
}

/// Format cookie bytes for the AUTHENTICATE command.
pub fn format_cookie_hex(cookie: &[u8]) -> String {
    hex::encode_upper(cookie)
}

// S2K count specifier used by the daemon for hashed control passwords:
// (16 + (0x60 & 15)) << ((0x60 >> 4) + 6) = 65536 bytes of salted input.
const S2K_SPECIFIER: u8 = 0x60;

/// Generate a random control password (16 bytes, hex-encoded).
pub fn generate_password() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Hash a control password into the daemon's `16:` S2K format, with a
/// fresh random salt.
pub fn hash_password(password: &str) -> String {
    use rand::Rng;
    let mut salt = [0u8; 8];
    rand::rng().fill(&mut salt);
    hash_password_with_salt(password, &salt)
}

fn hash_password_with_salt(password: &str, salt: &[u8; 8]) -> String {
    let count = (16usize + usize::from(S2K_SPECIFIER & 15))
        << ((S2K_SPECIFIER >> 4) + 6);

    let mut block = Vec::with_capacity(salt.len() + password.len());
    block.extend_from_slice(salt);
    block.extend_from_slice(password.as_bytes());

    let mut hasher = Sha1::new();
    let mut remaining = count;
    while remaining > 0 {
        if remaining >= block.len() {
            hasher.update(&block);
            remaining -= block.len();
        } else {
            hasher.update(&block[..remaining]);
            remaining = 0;
        }
    }
    let digest = hasher.finalize();

    format!(
        "16:{}{:02X}{}",
        hex::encode_upper(salt),
        S2K_SPECIFIER,
        hex::encode_upper(digest)
    )
}
