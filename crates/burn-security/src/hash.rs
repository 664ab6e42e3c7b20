use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::VerificationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Picks the algorithm from the length of a hex digest.
    pub fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            40 => Some(Self::Sha1),
            64 => Some(Self::Sha256),
            128 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

pub fn hash_hex(bytes: &[u8], algorithm: HashAlgorithm) -> String {
    match algorithm {
        HashAlgorithm::Sha1 => hex::encode(Sha1::digest(bytes)),
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
        HashAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
    }
}

pub fn hash_reader<R: Read>(reader: R, algorithm: HashAlgorithm) -> std::io::Result<String> {
    match algorithm {
        HashAlgorithm::Sha1 => digest_reader::<Sha1, _>(reader),
        HashAlgorithm::Sha256 => digest_reader::<Sha256, _>(reader),
        HashAlgorithm::Sha512 => digest_reader::<Sha512, _>(reader),
    }
}

fn digest_reader<D: Digest, R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = D::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String, VerificationError> {
    let file = File::open(path).map_err(|source| VerificationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    hash_reader(BufReader::new(file), algorithm).map_err(|source| VerificationError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Recomputes the file digest with the algorithm implied by `expected_hex`
/// and requires an exact (case-insensitive) match.
pub fn verify_hash_file(path: &Path, expected_hex: &str) -> Result<(), VerificationError> {
    let expected = expected_hex.trim();
    let algorithm = HashAlgorithm::from_hex_len(expected.len()).ok_or_else(|| {
        VerificationError::UnsupportedHash {
            length: expected.len(),
        }
    })?;
    let actual = hash_file(path, algorithm)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(VerificationError::HashMismatch {
            path: path.to_path_buf(),
            algorithm: algorithm.as_str(),
            expected: expected.to_ascii_lowercase(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_follows_digest_length() {
        assert_eq!(HashAlgorithm::from_hex_len(40), Some(HashAlgorithm::Sha1));
        assert_eq!(HashAlgorithm::from_hex_len(64), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_hex_len(128), Some(HashAlgorithm::Sha512));
        assert_eq!(HashAlgorithm::from_hex_len(32), None);
    }

    #[test]
    fn known_digests() {
        assert_eq!(
            hash_hex(b"abc", HashAlgorithm::Sha1),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            hash_hex(b"abc", HashAlgorithm::Sha256),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data = vec![7_u8; 200 * 1024];
        let streamed =
            hash_reader(data.as_slice(), HashAlgorithm::Sha512).expect("hashing must succeed");
        assert_eq!(streamed, hash_hex(&data, HashAlgorithm::Sha512));
    }
}
