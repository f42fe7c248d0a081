//! Session token generation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;

/// Number of random bytes in a token.
pub const TOKEN_RANDOM_LEN: usize = 32;

/// Number of token characters that may appear in logs.
const LOG_PREFIX_LEN: usize = 8;

/// Generates an unguessable single-use session token.
///
/// 32 bytes from the OS CSPRNG, URL-safe base64 without padding (43 chars).
pub fn generate_token() -> String {
    let mut data = [0u8; TOKEN_RANDOM_LEN];
    rand::rngs::OsRng.fill_bytes(&mut data);
    URL_SAFE_NO_PAD.encode(data)
}

/// Returns the part of a token that is safe to log.
pub fn token_prefix(token: &str) -> &str {
    token.get(..LOG_PREFIX_LEN).unwrap_or(token)
}
