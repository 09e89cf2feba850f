use std::time::{Duration, Instant};

use rand::RngCore;
use sha2::{Digest, Sha256};

const LOCKOUT_DURATION: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    Success { bearer_token: String },
    Failed,
    LockedOut { retry_after_seconds: u64 },
}

fn random_hex(bytes: usize) -> String {
    let mut data = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut data);
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time(-ish) comparison over the SHA-256 of each input, so
/// length differences never short-circuit the byte loop.
pub fn constant_time_equals(a: &str, b: &str) -> bool {
    let hash_a = sha256_hex(a);
    let hash_b = sha256_hex(b);

    let max_size = hash_a.len().max(hash_b.len());
    let mut diff = (hash_a.len() ^ hash_b.len()) as u8;

    let a_bytes = hash_a.as_bytes();
    let b_bytes = hash_b.as_bytes();
    for i in 0..max_size {
        let lhs = a_bytes.get(i).copied().unwrap_or(0);
        let rhs = b_bytes.get(i).copied().unwrap_or(0);
        diff |= lhs ^ rhs;
    }

    diff == 0
}

/// A random six-digit pairing code, zero-padded.
pub fn generate_pairing_code() -> String {
    let mut value = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut value);
    let value = u32::from_ne_bytes(value) % 1_000_000;
    format!("{value:06}")
}

/// Single-use pairing code plus the lockout/attempt bookkeeping and the
/// set of bearer-token hashes minted from successful verifications.
pub struct PairingState {
    code: Option<String>,
    failed_attempts: u32,
    max_attempts: u32,
    locked_until: Option<Instant>,
    token_hashes: Vec<String>,
}

impl PairingState {
    pub fn new(code: String, max_attempts: u32) -> Self {
        Self {
            code: Some(code),
            failed_attempts: 0,
            max_attempts,
            locked_until: None,
            token_hashes: Vec::new(),
        }
    }

    pub fn token_hashes(&self) -> &[String] {
        &self.token_hashes
    }

    pub fn verify(&mut self, code: &str) -> PairingOutcome {
        self.verify_at(code, Instant::now())
    }

    pub fn verify_at(&mut self, code: &str, now: Instant) -> PairingOutcome {
        if let Some(locked_until) = self.locked_until {
            if now < locked_until {
                return PairingOutcome::LockedOut {
                    retry_after_seconds: (locked_until - now).as_secs(),
                };
            }
        }

        if let Some(expected) = &self.code {
            if constant_time_equals(expected, code) {
                self.failed_attempts = 0;
                self.locked_until = None;

                let token = random_hex(16);
                self.token_hashes.push(sha256_hex(&token));
                self.code = None;

                return PairingOutcome::Success {
                    bearer_token: token,
                };
            }
        }

        self.failed_attempts += 1;
        if self.failed_attempts >= self.max_attempts {
            self.locked_until = Some(now + LOCKOUT_DURATION);
            return PairingOutcome::LockedOut {
                retry_after_seconds: LOCKOUT_DURATION.as_secs(),
            };
        }

        PairingOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_six_digit_zero_padded_code() {
        let code = generate_pairing_code();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn successful_verify_clears_code_and_returns_bearer_token() {
        let mut state = PairingState::new("123456".to_string(), 5);
        match state.verify("123456") {
            PairingOutcome::Success { bearer_token } => {
                assert_eq!(bearer_token.len(), 32);
                assert_eq!(state.token_hashes().len(), 1);
            }
            other => panic!("expected success, got {other:?}"),
        }
        // Code has been consumed; a second verify with the same code fails.
        assert_eq!(state.verify("123456"), PairingOutcome::Failed);
    }

    #[test]
    fn locks_out_after_max_attempts() {
        let mut state = PairingState::new("123456".to_string(), 3);
        assert_eq!(state.verify("000000"), PairingOutcome::Failed);
        assert_eq!(state.verify("000000"), PairingOutcome::Failed);
        match state.verify("000000") {
            PairingOutcome::LockedOut { retry_after_seconds } => {
                assert_eq!(retry_after_seconds, 300);
            }
            other => panic!("expected lockout, got {other:?}"),
        }
    }

    #[test]
    fn lockout_blocks_even_the_correct_code() {
        let mut state = PairingState::new("123456".to_string(), 1);
        let _ = state.verify("wrong");
        match state.verify("123456") {
            PairingOutcome::LockedOut { .. } => {}
            other => panic!("expected lockout, got {other:?}"),
        }
    }

    #[test]
    fn constant_time_equals_ignores_length_difference_in_short_circuit() {
        assert!(constant_time_equals("abc", "abc"));
        assert!(!constant_time_equals("abc", "abcd"));
        assert!(!constant_time_equals("", "anything"));
    }
}
