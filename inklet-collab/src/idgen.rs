//! Token generation for record ids and session access codes.
//!
//! An explicit dependency handed to the repository rather than a
//! process-global engine, so tests can inspect or swap it. Randomness
//! comes from v4 UUIDs (OS entropy, drawn once per token).

use uuid::Uuid;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 6;

/// Issues unique-enough tokens: UUID strings for record ids, short
/// alphanumeric codes for joining sessions. Collisions on access codes
/// are possible and handled by the caller (retryable error).
#[derive(Debug, Default, Clone)]
pub struct IdGen;

impl IdGen {
    pub fn new() -> Self {
        Self
    }

    /// Hyphenated v4 UUID for user and document records.
    pub fn record_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Six uppercase-alphanumeric characters, e.g. `C7JKFN`.
    pub fn access_code(&self) -> String {
        Uuid::new_v4()
            .into_bytes()
            .iter()
            .take(CODE_LEN)
            .map(|b| CODE_ALPHABET[(b % CODE_ALPHABET.len() as u8) as usize] as char)
            .collect()
    }
}
