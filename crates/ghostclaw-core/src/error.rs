use thiserror::Error;

/// Error kinds surfaced by the security & sandboxing core. The core never
/// panics or aborts on untrusted input — every failure surfaces as one of
/// these, and the caller decides whether to log, retry, or surface to a user.
#[derive(Debug, Error)]
pub enum Error {
    /// A tool policy layer denied the request. Carries the blocking layer's
    /// trace label and a human reason. Not retryable with the same request.
    #[error("denied by {blocked_by}: {reason}")]
    PolicyDenied { blocked_by: String, reason: String },

    /// The action tracker's sliding-hour window is exhausted.
    #[error("rate limit exceeded: {count}/{max_per_hour} actions in the last hour")]
    RateLimited { count: u32, max_per_hour: u32 },

    /// `validate_path` rejected the input: null byte, workspace escape,
    /// symlink escape, or a forbidden-path match.
    #[error("invalid path: {0}")]
    PathInvalid(String),

    /// Approval was explicitly denied, or the socket round-trip failed —
    /// fail-closed. `ApprovalTimeout` is folded into this at the manager
    /// boundary per the approval engine's fail-closed contract.
    #[error("approval denied: {0}")]
    ApprovalDenied(String),

    /// The sandbox's container runtime is missing, or create/start failed.
    #[error("sandbox runtime unavailable: {0}")]
    SandboxRuntimeUnavailable(String),

    /// AEAD verification failed, a nonce/ciphertext was too short, or
    /// base64 decoding failed.
    #[error("crypto error: {0}")]
    CryptoError(String),

    /// Pairing is in lockout; carries remaining seconds.
    #[error("pairing locked out, retry after {retry_after_seconds}s")]
    PairingLockedOut { retry_after_seconds: u64 },

    /// Pairing code did not match; not yet locked out.
    #[error("pairing code mismatch")]
    PairingFailed,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
