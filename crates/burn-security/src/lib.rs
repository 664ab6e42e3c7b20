mod certificate;
mod error;
mod hash;
mod trust;
mod verify;

pub use certificate::{chain_matches, CertificateInfo};
pub use error::{
    VerificationError, CERT_E_UNTRUSTEDROOT, CRYPT_E_HASH_VALUE, TRUST_E_BAD_DIGEST,
    TRUST_E_NOSIGNATURE, TRUST_E_SUBJECT_NOT_TRUSTED,
};
pub use hash::{hash_file, hash_hex, hash_reader, verify_hash_file, HashAlgorithm};
pub use trust::{PowerShellTrustProvider, TrustProvider};
pub use verify::PayloadVerifier;

#[cfg(test)]
mod tests;
