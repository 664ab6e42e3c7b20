use std::path::PathBuf;

use thiserror::Error;

pub const CRYPT_E_HASH_VALUE: u32 = 0x8009_1007;
pub const TRUST_E_NOSIGNATURE: u32 = 0x800B_0100;
pub const TRUST_E_SUBJECT_NOT_TRUSTED: u32 = 0x800B_0004;
pub const CERT_E_UNTRUSTEDROOT: u32 = 0x800B_0109;
pub const TRUST_E_BAD_DIGEST: u32 = 0x8009_6010;

/// Payload verification failures. None of these are retried: a
/// cryptographic mismatch does not change on a second attempt.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("{algorithm} mismatch for {}: expected {expected}, got {actual}", path.display())]
    HashMismatch {
        path: PathBuf,
        algorithm: &'static str,
        expected: String,
        actual: String,
    },
    #[error("unsupported hash length {length}; expected a SHA-1, SHA-256 or SHA-512 hex digest")]
    UnsupportedHash { length: usize },
    #[error("{} is not signed by a trusted publisher: {reason}", path.display())]
    Unsigned { path: PathBuf, reason: String },
    #[error("no certificate in the signing chain of {} matches the expected publisher", path.display())]
    CertificateMismatch { path: PathBuf },
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("catalog {} does not vouch for {}: {reason}", catalog.display(), path.display())]
    Catalog {
        path: PathBuf,
        catalog: PathBuf,
        reason: String,
    },
    #[error("catalog #{0} was not acquired before verification")]
    MissingCatalog(usize),
    #[error("{} declares no hash, certificate or catalog", path.display())]
    Unverifiable { path: PathBuf },
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl VerificationError {
    /// HRESULT-shaped code reported across the engine pipes.
    pub fn code(&self) -> u32 {
        match self {
            Self::HashMismatch { .. } | Self::UnsupportedHash { .. } => CRYPT_E_HASH_VALUE,
            Self::Unsigned { .. } => TRUST_E_NOSIGNATURE,
            Self::CertificateMismatch { .. } | Self::InvalidCertificate(_) => CERT_E_UNTRUSTEDROOT,
            Self::Catalog { .. } | Self::MissingCatalog(_) => TRUST_E_BAD_DIGEST,
            Self::Unverifiable { .. } => TRUST_E_SUBJECT_NOT_TRUSTED,
            Self::Io { source, .. } => 0x8007_0000 | (source.raw_os_error().unwrap_or(31) as u32 & 0xFFFF),
        }
    }
}
