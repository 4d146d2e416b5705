//! Verified boot
//!
//! Boot images are attested against the OEM certificate. A signature by
//! the OEM key is GREEN; a valid signature by an embedded certificate is
//! GREEN when the OEM key endorses that certificate and YELLOW when only
//! the device owner does; everything else is RED.

use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use tracing::debug;
use x509_cert::Certificate;

use der::Decode;
use der::Encode;

use crate::bootimg::BootImgHeader;
use crate::device::Firmware;
use crate::error::{FastbootError, Result};
use crate::signature::{parse_boot_signature, BootSignature, DigestAlgorithm};

/// UEFI 2.4 §3.3: secure boot mode means `SetupMode` = 0 and
/// `SecureBoot` = 1.
pub const SETUP_MODE_VAR: &str = "SetupMode";
pub const SECURE_BOOT_VAR: &str = "SecureBoot";

/// One byte read back by the BIOS at ExitBootServices: 1 when the boot
/// state is green, 0 otherwise.
pub const OS_SECURE_BOOT_VAR: &str = "OsSecureBoot";

/// Maximum boot-target string length copied out of the signature.
pub const BOOT_TARGET_SIZE: usize = 32;

/// Attestation color of a verified boot image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    /// Signed by the OEM key, directly or via an endorsed certificate
    Green,
    /// Signed by a certificate the OEM never endorsed
    Yellow,
    /// Device unlocked; verification skipped by the boot path
    Orange,
    /// Verification failed
    Red,
}

/// Result of boot-image verification.
pub struct BootVerification {
    pub state: BootState,
    /// The `target` authenticated attribute, when a signature parsed
    pub target: Option<String>,
    /// The certificate that verified the image, on GREEN/YELLOW
    pub verifier_cert: Option<Certificate>,
}

impl BootVerification {
    fn red() -> Self {
        Self {
            state: BootState::Red,
            target: None,
            verifier_cert: None,
        }
    }
}

/// Extract the RSA public key of a certificate; non-RSA keys are
/// rejected.
pub(crate) fn rsa_public_key_of(cert: &Certificate) -> Result<RsaPublicKey> {
    let spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| FastbootError::Verification(e.to_string()))?;
    RsaPublicKey::from_public_key_der(&spki)
        .map_err(|e| FastbootError::Verification(format!("not an RSA public key: {e}")))
}

/// Verify the image digest (content plus authenticated attributes)
/// against `cert`.
fn check_bootimage(bootimage: &[u8], sig: &BootSignature, cert: &Certificate) -> Result<()> {
    let algorithm = DigestAlgorithm::from_oid(&sig.algorithm)
        .ok_or_else(|| FastbootError::Verification("unsupported digest algorithm".into()))?;
    let digest = algorithm.digest_parts(&[bootimage, &sig.attributes_der]);
    let key = rsa_public_key_of(cert)?;
    key.verify(algorithm.rsa_scheme(), &digest, &sig.signature)
        .map_err(|_| FastbootError::Verification("signature mismatch".into()))
}

/// Verify that `cert` itself is signed by `signer_key`. Only SHA-256 and
/// SHA-512 certificate signatures are accepted.
pub fn verify_cert_signature(cert: &Certificate, signer_key: &RsaPublicKey) -> Result<()> {
    let algorithm = match DigestAlgorithm::from_oid(&cert.signature_algorithm.oid) {
        Some(alg @ (DigestAlgorithm::Sha256 | DigestAlgorithm::Sha512)) => alg,
        _ => {
            return Err(FastbootError::Verification(
                "Unsupported digest algorithm".into(),
            ))
        }
    };
    let tbs = cert
        .tbs_certificate
        .to_der()
        .map_err(|e| FastbootError::Verification(e.to_string()))?;
    let digest = algorithm.digest_parts(&[&tbs]);
    let signature = cert
        .signature
        .as_bytes()
        .ok_or_else(|| FastbootError::Verification("unaligned certificate signature".into()))?;
    signer_key
        .verify(algorithm.rsa_scheme(), &digest, signature)
        .map_err(|_| FastbootError::Verification("certificate signature mismatch".into()))
}

/// Verify an Android boot image (image content with the signature record
/// appended) against the OEM DER certificate.
pub fn verify_boot_image(bootimage: &[u8], oem_cert_der: &[u8]) -> BootVerification {
    let Ok(header) = BootImgHeader::parse(bootimage) else {
        debug!("bad boot image data");
        return BootVerification::red();
    };

    let image_size = header.image_size() as usize;
    if image_size > bootimage.len() {
        debug!("boot image larger than its buffer");
        return BootVerification::red();
    }

    let sig = match parse_boot_signature(&bootimage[image_size..]) {
        Ok(sig) => sig,
        Err(_) => {
            debug!("boot image signature invalid or missing");
            return BootVerification::red();
        }
    };
    let mut target: String = sig.target.chars().take(BOOT_TARGET_SIZE).collect();
    target.truncate(target.trim_end_matches('\0').len());

    let Ok(oem_cert) = Certificate::from_der(oem_cert_der) else {
        debug!("Failed to get OEM certificate");
        return BootVerification::red();
    };

    let content = &bootimage[..image_size];
    if check_bootimage(content, &sig, &oem_cert).is_ok() {
        return BootVerification {
            state: BootState::Green,
            target: Some(target),
            verifier_cert: Some(oem_cert),
        };
    }

    let Some(embedded) = sig.certificate.as_ref() else {
        debug!("Bootimage verification failure");
        return BootVerification {
            state: BootState::Red,
            target: Some(target),
            verifier_cert: None,
        };
    };

    debug!("Bootimage does not verify against the OEM key, trying included certificate");
    if check_bootimage(content, &sig, embedded).is_err() {
        return BootVerification {
            state: BootState::Red,
            target: Some(target),
            verifier_cert: None,
        };
    }

    let endorsed = rsa_public_key_of(&oem_cert)
        .and_then(|oem_key| verify_cert_signature(embedded, &oem_key))
        .is_ok();
    let state = if endorsed {
        debug!("Embedded certificate verified by OEM key");
        BootState::Green
    } else {
        BootState::Yellow
    };

    BootVerification {
        state,
        target: Some(target),
        verifier_cert: Some(embedded.clone()),
    }
}

/// SHA-256 over the DER `RSAPublicKey` of a certificate: the device
/// root-of-trust hash.
pub fn compute_pub_key_hash(cert: &Certificate) -> Result<[u8; 32]> {
    let key = rsa_public_key_of(cert)?;
    let der = key
        .to_pkcs1_der()
        .map_err(|e| FastbootError::Verification(e.to_string()))?;
    Ok(Sha256::digest(der.as_bytes()).into())
}

/// UEFI secure boot state, per the firmware's global variables.
pub fn is_efi_secure_boot_enabled(firmware: &mut dyn Firmware) -> bool {
    matches!(firmware.nv_get(SETUP_MODE_VAR).as_deref(), Some([0]))
        && matches!(firmware.nv_get(SECURE_BOOT_VAR).as_deref(), Some([1]))
}

/// Record the OS secure-boot decision for the BIOS to pick up.
pub fn set_os_secure_boot(firmware: &mut dyn Firmware, secure: bool) -> Result<()> {
    debug!("Setting os secure boot to {}", secure as u8);
    firmware.nv_set(OS_SECURE_BOOT_VAR, &[secure as u8])
}
