use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use burn_core::Verification;

use super::*;

struct FakeTrust {
    chain: Vec<CertificateInfo>,
    catalog_ok: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeTrust {
    fn new(chain: Vec<CertificateInfo>, catalog_ok: bool) -> Arc<Self> {
        Arc::new(Self {
            chain,
            catalog_ok,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl TrustProvider for FakeTrust {
    fn authenticode_chain(&self, _path: &Path) -> Result<Vec<CertificateInfo>, VerificationError> {
        self.calls.lock().expect("calls lock").push("authenticode".to_string());
        Ok(self.chain.clone())
    }

    fn verify_catalog_member(&self, catalog: &Path, path: &Path) -> Result<(), VerificationError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(format!("catalog:{}", catalog.display()));
        if self.catalog_ok {
            Ok(())
        } else {
            Err(VerificationError::Catalog {
                path: path.to_path_buf(),
                catalog: catalog.to_path_buf(),
                reason: "not listed".to_string(),
            })
        }
    }
}

fn write_temp(name: &str, contents: &[u8]) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("burn-security-{name}-{nanos}"));
    std::fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("payload.bin");
    std::fs::write(&path, contents).expect("write payload");
    path
}

fn publisher() -> CertificateInfo {
    CertificateInfo {
        public_key_id: vec![0xAB; 20],
        thumbprint: vec![0xCD; 20],
    }
}

#[test]
fn hash_only_payload_passes_with_matching_digest() {
    let path = write_temp("hash-ok", b"abc");
    let verifier = PayloadVerifier::new(FakeTrust::new(Vec::new(), false));
    let verification = Verification {
        hash: Some("a9993e364706816aba3e25717850c26c9cd0d89d".to_string()),
        ..Verification::default()
    };
    verifier
        .verify(&path, &verification)
        .expect("matching sha1 must verify");
}

#[test]
fn hash_only_payload_fails_with_wrong_digest() {
    let path = write_temp("hash-bad", b"abd");
    let verifier = PayloadVerifier::new(FakeTrust::new(Vec::new(), false));
    let verification = Verification {
        hash: Some("a9993e364706816aba3e25717850c26c9cd0d89d".to_string()),
        ..Verification::default()
    };
    let err = verifier
        .verify(&path, &verification)
        .expect_err("tampered payload must fail");
    assert!(matches!(err, VerificationError::HashMismatch { .. }));
    assert_eq!(err.code(), CRYPT_E_HASH_VALUE);
}

#[test]
fn certificate_failure_does_not_fall_back_to_hash() {
    let path = write_temp("cert-priority", b"abc");
    let trust = FakeTrust::new(vec![publisher()], false);
    let verifier = PayloadVerifier::new(trust.clone());
    let verification = Verification {
        certificate_public_key_id: Some("11".repeat(20)),
        hash: Some("a9993e364706816aba3e25717850c26c9cd0d89d".to_string()),
        ..Verification::default()
    };
    let err = verifier
        .verify(&path, &verification)
        .expect_err("wrong publisher must fail even with a correct hash");
    assert!(matches!(err, VerificationError::CertificateMismatch { .. }));
    assert_eq!(trust.calls(), vec!["authenticode".to_string()]);
}

#[test]
fn certificate_match_skips_hash() {
    let path = write_temp("cert-ok", b"anything");
    let verifier = PayloadVerifier::new(FakeTrust::new(vec![publisher()], false));
    let verification = Verification {
        certificate_public_key_id: Some("ab".repeat(20)),
        certificate_thumbprint: Some("CD".repeat(20)),
        hash: Some("00".repeat(20)),
        ..Verification::default()
    };
    verifier
        .verify(&path, &verification)
        .expect("trusted publisher must verify");
}

#[test]
fn catalog_requires_acquired_catalog_path() {
    let path = write_temp("catalog-missing", b"abc");
    let verifier = PayloadVerifier::new(FakeTrust::new(Vec::new(), true));
    let verification = Verification {
        catalog: Some(1),
        ..Verification::default()
    };
    let err = verifier
        .verify(&path, &verification)
        .expect_err("unacquired catalog must fail");
    assert!(matches!(err, VerificationError::MissingCatalog(1)));
}

#[test]
fn catalog_is_checked_before_hash() {
    let path = write_temp("catalog-priority", b"abc");
    let trust = FakeTrust::new(Vec::new(), false);
    let verifier = PayloadVerifier::new(trust.clone());
    verifier.set_catalog_path(0, "/cache/bundle.cat");
    let verification = Verification {
        catalog: Some(0),
        hash: Some("a9993e364706816aba3e25717850c26c9cd0d89d".to_string()),
        ..Verification::default()
    };
    let err = verifier
        .verify(&path, &verification)
        .expect_err("catalog failure must not fall back to hash");
    assert!(matches!(err, VerificationError::Catalog { .. }));
    assert_eq!(trust.calls(), vec!["catalog:/cache/bundle.cat".to_string()]);
}

#[test]
fn payload_without_verification_is_rejected() {
    let path = write_temp("unverifiable", b"abc");
    let verifier = PayloadVerifier::new(FakeTrust::new(Vec::new(), true));
    let err = verifier
        .verify(&path, &Verification::default())
        .expect_err("nothing to verify must fail");
    assert!(matches!(err, VerificationError::Unverifiable { .. }));
}

#[test]
fn chain_output_rejects_non_hex_lines() {
    let err = trust::parse_chain_output("not-hex\n").expect_err("must fail");
    assert!(matches!(err, VerificationError::InvalidCertificate(_)));
    assert!(trust::parse_chain_output("\n  \n")
        .expect("blank output parses")
        .is_empty());
}
