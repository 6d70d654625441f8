use thiserror::Error;

/// Failures surfaced across the engine's call boundary.
///
/// Authorization and integrity failures are deliberately distinct: a
/// fingerprint mismatch is detected before any cipher work and callers may
/// want to message it differently, but both are fatal for the current
/// machine.
#[derive(Debug, Error)]
pub enum ProtectError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Decryption produced content that failed validation under both
    /// cipher paths.
    #[error("could not decrypt payload")]
    Integrity,

    /// The fingerprint embedded in a protected container does not match
    /// the machine performing the decryption.
    #[error("hardware fingerprint does not match this machine")]
    Authorization,

    /// The input is not a usable PE image: bad magic, wrong architecture,
    /// missing required structures, or out-of-range addresses.
    #[error("unsupported or corrupt image: {0}")]
    Format(&'static str),

    /// The anti-tamper gate tripped before any protected work began.
    #[error("debugger detected, refusing to continue")]
    TamperDetected,

    /// None of the hardware identity sources yielded a value.
    #[error("hardware identity unavailable: {0}")]
    Fingerprint(&'static str),

    /// Spawn / allocate / write / thread-context failure while driving a
    /// host process.
    #[error("host process failure: {0}")]
    Process(String),
}

pub type Result<T> = std::result::Result<T, ProtectError>;
