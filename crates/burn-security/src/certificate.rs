use sha1::Sha1;
use sha2::Digest;
use x509_certificate::X509Certificate;

use crate::error::VerificationError;

/// The identities of one certificate in a signing chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// SHA-1 of the subject public key.
    pub public_key_id: Vec<u8>,
    /// SHA-1 of the DER encoding.
    pub thumbprint: Vec<u8>,
}

impl CertificateInfo {
    pub fn from_der(der: &[u8]) -> Result<Self, VerificationError> {
        let certificate = X509Certificate::from_der(der)
            .map_err(|err| VerificationError::InvalidCertificate(err.to_string()))?;
        Ok(Self {
            public_key_id: Sha1::digest(certificate.public_key_data()).to_vec(),
            thumbprint: Sha1::digest(der).to_vec(),
        })
    }
}

/// True when some element of `chain` carries the expected public key id and,
/// if one is given, the expected thumbprint on that same element.
pub fn chain_matches(
    chain: &[CertificateInfo],
    public_key_id_hex: &str,
    thumbprint_hex: Option<&str>,
) -> Result<bool, VerificationError> {
    let public_key_id = decode_identifier(public_key_id_hex)?;
    let thumbprint = thumbprint_hex.map(decode_identifier).transpose()?;
    Ok(chain.iter().any(|certificate| {
        certificate.public_key_id == public_key_id
            && thumbprint
                .as_ref()
                .map_or(true, |expected| &certificate.thumbprint == expected)
    }))
}

fn decode_identifier(value: &str) -> Result<Vec<u8>, VerificationError> {
    hex::decode(value.trim()).map_err(|err| {
        VerificationError::InvalidCertificate(format!("identifier '{value}' is not hex: {err}"))
    })
}
