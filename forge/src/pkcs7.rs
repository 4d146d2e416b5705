//! PKCS#7 policy payload verification
//!
//! Policy payloads arrive as PKCS#7 SignedData. The trust anchor is not a
//! certificate store but a single SHA-256 fingerprint burned into the
//! device: verification selects the embedded certificate matching that
//! fingerprint and uses the signer's own `signingTime` attribute as the
//! validity clock, because the device has no reliable clock of its own.
//! That substitution is sound only because the chain terminates at the
//! fingerprinted certificate.

use chrono::{TimeZone, Utc};
use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedData, SignerIdentifier, SignerInfo};
use der::asn1::{ObjectIdentifier, OctetString};
use der::{Decode, Encode, Tag, Tagged};
use sha2::{Digest, Sha256};
use tracing::{debug, error};
use x509_cert::Certificate;

use crate::error::{FastbootError, Result};
use crate::security::verify_cert_signature;
use crate::signature::{DigestAlgorithm, OID_SHA256_WITH_RSA};

pub const OID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
pub const OID_PKCS9_CONTENT_TYPE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");
pub const OID_PKCS9_MESSAGE_DIGEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");
pub const OID_PKCS9_SIGNING_TIME: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.5");
pub const OID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
pub const OID_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

fn verification<E: std::fmt::Display>(err: E) -> FastbootError {
    FastbootError::Verification(err.to_string())
}

/// Verify a PKCS#7 blob against the trusted root fingerprint and return
/// the signed payload.
pub fn verify_pkcs7(root_cert_sha256: &[u8], pkcs7: &[u8]) -> Result<Vec<u8>> {
    if root_cert_sha256.len() != 32 {
        error!("Invalid SHA256 length for trusted certificate");
        return Err(FastbootError::InvalidParameter);
    }

    let content_info = ContentInfo::from_der(pkcs7).map_err(|e| {
        error!("Failed to read PKCS7");
        verification(e)
    })?;
    if content_info.content_type != OID_SIGNED_DATA {
        return Err(FastbootError::Verification(format!(
            "unsupported PKCS7 content type {}",
            content_info.content_type
        )));
    }
    let signed_data: SignedData = content_info
        .content
        .decode_as()
        .map_err(verification)?;

    let certificates = embedded_certificates(&signed_data)?;
    let trusted = certificates
        .iter()
        .find(|cert| {
            cert.to_der()
                .is_ok_and(|der| Sha256::digest(&der).as_slice() == root_cert_sha256)
        })
        .ok_or_else(|| {
            error!("Could not find the root certificate");
            FastbootError::Verification("root certificate not found".into())
        })?;

    let signer = signed_data
        .signer_infos
        .0
        .iter()
        .next()
        .ok_or_else(|| FastbootError::Verification("no signer info".into()))?;
    let signing_time = signing_time(signer)?;

    let signer_cert = find_signer_cert(signer, &certificates)?;
    let trusted_der = trusted.to_der().map_err(verification)?;
    let signer_is_root = signer_cert.to_der().map_err(verification)? == trusted_der;
    if !signer_is_root {
        let root_key = crate::security::rsa_public_key_of(trusted)?;
        verify_cert_signature(signer_cert, &root_key)?;
    }
    check_validity(trusted, signing_time)?;
    check_validity(signer_cert, signing_time)?;

    verify_signer(signer, signer_cert, &signed_data)
}

fn embedded_certificates(signed_data: &SignedData) -> Result<Vec<Certificate>> {
    let Some(set) = &signed_data.certificates else {
        return Ok(Vec::new());
    };
    Ok(set
        .0
        .iter()
        .filter_map(|choice| match choice {
            CertificateChoices::Certificate(cert) => Some(cert.clone()),
            _ => None,
        })
        .collect())
}

fn find_signer_cert<'a>(
    signer: &SignerInfo,
    certificates: &'a [Certificate],
) -> Result<&'a Certificate> {
    let SignerIdentifier::IssuerAndSerialNumber(isn) = &signer.sid else {
        return Err(FastbootError::Verification(
            "unsupported signer identifier".into(),
        ));
    };
    let issuer_der = isn.issuer.to_der().map_err(verification)?;
    certificates
        .iter()
        .find(|cert| {
            cert.tbs_certificate.serial_number == isn.serial_number
                && cert
                    .tbs_certificate
                    .issuer
                    .to_der()
                    .is_ok_and(|der| der == issuer_der)
        })
        .ok_or_else(|| FastbootError::Verification("signer certificate not found".into()))
}

/// Extract the signer's `signingTime` attribute as Unix time.
///
/// UTCTime carries a two-digit year: values below 70 land in 20yy,
/// everything else in 19yy. No timezone handling.
fn signing_time(signer: &SignerInfo) -> Result<i64> {
    let attrs = signer
        .signed_attrs
        .as_ref()
        .ok_or_else(|| FastbootError::Verification("no signed attributes".into()))?;
    let value = attrs
        .iter()
        .find(|attr| attr.oid == OID_PKCS9_SIGNING_TIME)
        .and_then(|attr| attr.values.iter().next())
        .ok_or_else(|| {
            error!("Could not find signing time");
            FastbootError::Verification("signing time not found".into())
        })?;
    if value.tag() != Tag::UtcTime {
        error!("Unsupported signing time type {}", value.tag());
        return Err(FastbootError::Verification("bad signing time type".into()));
    }

    // "YYmmddHHMMSS", optionally 'Z' terminated
    let raw = value.value();
    let digits = raw.strip_suffix(b"Z").unwrap_or(raw);
    if digits.len() < 12 || !digits[..12].iter().all(u8::is_ascii_digit) {
        return Err(FastbootError::Verification("malformed signing time".into()));
    }
    let field = |at: usize| ((digits[at] - b'0') * 10 + (digits[at + 1] - b'0')) as u32;

    let mut year = 1900 + field(0) as i32;
    if year < 1970 {
        year += 100;
    }

    let time = Utc
        .with_ymd_and_hms(year, field(2), field(4), field(6), field(8), field(10))
        .single()
        .ok_or_else(|| FastbootError::Verification("malformed signing time".into()))?;
    debug!(
        "signing time {} -> unix {}",
        time.format("%Y-%m-%d %H:%M:%S"),
        time.timestamp()
    );
    Ok(time.timestamp())
}

fn check_validity(cert: &Certificate, at: i64) -> Result<()> {
    let validity = &cert.tbs_certificate.validity;
    let not_before = validity.not_before.to_unix_duration().as_secs() as i64;
    let not_after = validity.not_after.to_unix_duration().as_secs() as i64;
    if at < not_before || at > not_after {
        return Err(FastbootError::Verification(
            "certificate expired at signing time".into(),
        ));
    }
    Ok(())
}

/// Check the content digest and the signature over the signed attributes,
/// then hand back the payload.
fn verify_signer(
    signer: &SignerInfo,
    signer_cert: &Certificate,
    signed_data: &SignedData,
) -> Result<Vec<u8>> {
    if signer.digest_alg.oid != OID_SHA256 {
        return Err(FastbootError::Verification(
            "unsupported signer digest algorithm".into(),
        ));
    }
    match signer.signature_algorithm.oid {
        OID_RSA_ENCRYPTION | OID_SHA256_WITH_RSA => {}
        oid => {
            return Err(FastbootError::Verification(format!(
                "unsupported signature algorithm {oid}"
            )))
        }
    }

    let attrs = signer
        .signed_attrs
        .as_ref()
        .ok_or_else(|| FastbootError::Verification("no signed attributes".into()))?;

    let payload = signed_data
        .encap_content_info
        .econtent
        .as_ref()
        .ok_or_else(|| FastbootError::Verification("detached content not supported".into()))?
        .decode_as::<OctetString>()
        .map_err(verification)?;

    let content_type = attrs
        .iter()
        .find(|attr| attr.oid == OID_PKCS9_CONTENT_TYPE)
        .and_then(|attr| attr.values.iter().next())
        .and_then(|any| any.decode_as::<ObjectIdentifier>().ok());
    if content_type != Some(signed_data.encap_content_info.econtent_type) {
        error!("PKCS7 verification failed");
        return Err(FastbootError::Verification("content type mismatch".into()));
    }

    let message_digest = attrs
        .iter()
        .find(|attr| attr.oid == OID_PKCS9_MESSAGE_DIGEST)
        .and_then(|attr| attr.values.iter().next())
        .and_then(|any| any.decode_as::<OctetString>().ok())
        .ok_or_else(|| FastbootError::Verification("message digest attribute missing".into()))?;
    if Sha256::digest(payload.as_bytes()).as_slice() != message_digest.as_bytes() {
        error!("PKCS7 verification failed");
        return Err(FastbootError::Verification("payload digest mismatch".into()));
    }

    let attrs_der = attrs.to_der().map_err(verification)?;
    let digest = DigestAlgorithm::Sha256.digest_parts(&[&attrs_der]);
    let key = crate::security::rsa_public_key_of(signer_cert)?;
    key.verify(
        DigestAlgorithm::Sha256.rsa_scheme(),
        &digest,
        signer.signature.as_bytes(),
    )
    .map_err(|_| {
        error!("PKCS7 verification failed");
        FastbootError::Verification("signature mismatch".into())
    })?;

    Ok(payload.as_bytes().to_vec())
}
