//! Boot signature parsing
//!
//! An Android verified-boot signature trails the last section of a boot
//! image: an ASN.1 SEQUENCE holding a format version, an optional
//! embedded certificate, the signature algorithm, the authenticated
//! attributes (`target`, `length`), and the RSA signature itself. The raw
//! DER of the authenticated attributes is kept because it is part of the
//! signed digest.

use der::asn1::{Any, ObjectIdentifier, OctetString};
use der::{Decode, Encode, Reader, SliceReader, Tag, Tagged};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use x509_cert::Certificate;

use crate::bootimg::BOOT_SIGNATURE_MAX_SIZE;
use crate::error::{FastbootError, Result};

pub const OID_SHA1_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.5");
pub const OID_SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
pub const OID_SHA512_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");

/// Digest half of an `<hash>WithRSAEncryption` signature algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        match *oid {
            OID_SHA1_WITH_RSA => Some(Self::Sha1),
            OID_SHA256_WITH_RSA => Some(Self::Sha256),
            OID_SHA512_WITH_RSA => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Digest a concatenation of byte slices.
    pub fn digest_parts(self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }
        match self {
            Self::Sha1 => run::<Sha1>(parts),
            Self::Sha256 => run::<Sha256>(parts),
            Self::Sha512 => run::<Sha512>(parts),
        }
    }

    /// The `<hash>WithRSAEncryption` OID of this algorithm.
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            Self::Sha1 => OID_SHA1_WITH_RSA,
            Self::Sha256 => OID_SHA256_WITH_RSA,
            Self::Sha512 => OID_SHA512_WITH_RSA,
        }
    }

    /// The matching RSA PKCS#1 v1.5 verification scheme.
    pub fn rsa_scheme(self) -> rsa::Pkcs1v15Sign {
        match self {
            Self::Sha1 => rsa::Pkcs1v15Sign::new::<Sha1>(),
            Self::Sha256 => rsa::Pkcs1v15Sign::new::<Sha256>(),
            Self::Sha512 => rsa::Pkcs1v15Sign::new::<Sha512>(),
        }
    }
}

/// Parsed boot signature.
pub struct BootSignature {
    pub format_version: u32,
    pub certificate: Option<Certificate>,
    pub algorithm: ObjectIdentifier,
    /// `target` authenticated attribute
    pub target: String,
    /// `length` authenticated attribute: the signed image size
    pub length: u64,
    /// Raw DER of the AuthenticatedAttributes SEQUENCE
    pub attributes_der: Vec<u8>,
    pub signature: Vec<u8>,
    /// Total encoded size of the signature record
    pub total_size: usize,
}

fn bad_signature<E: std::fmt::Display>(err: E) -> FastbootError {
    FastbootError::Verification(format!("invalid boot signature: {err}"))
}

/// Parse the boot signature at the start of `data` (the bytes following
/// the boot image content). At most [`BOOT_SIGNATURE_MAX_SIZE`] bytes are
/// considered.
pub fn parse_boot_signature(data: &[u8]) -> Result<BootSignature> {
    let window = &data[..data.len().min(BOOT_SIGNATURE_MAX_SIZE)];
    let mut reader = SliceReader::new(window).map_err(bad_signature)?;

    let mut parsed = reader
        .sequence(|r| {
            let format_version = u32::decode(r)?;

            // The element after the version is either the embedded
            // certificate or the algorithm identifier; both are
            // SEQUENCEs, so try the certificate first.
            let second = Any::decode(r)?;
            let (certificate, algorithm_any) = match Certificate::from_der(&second.to_der()?) {
                Ok(cert) => (Some(cert), Any::decode(r)?),
                Err(_) => (None, second),
            };
            let algorithm =
                x509_cert::spki::AlgorithmIdentifierOwned::from_der(&algorithm_any.to_der()?)?;

            let attributes_any = Any::decode(r)?;
            let attributes_der = attributes_any.to_der()?;

            let signature = OctetString::decode(r)?;

            Ok(BootSignature {
                format_version,
                certificate,
                algorithm: algorithm.oid,
                target: String::new(),
                length: 0,
                attributes_der,
                signature: signature.as_bytes().to_vec(),
                total_size: 0,
            })
        })
        .map_err(bad_signature)?;

    if parsed.format_version != 1 {
        return Err(FastbootError::Verification(format!(
            "unsupported boot signature version {}",
            parsed.format_version
        )));
    }

    let (target, length) = parse_attributes(&parsed.attributes_der)?;
    parsed.target = target;
    parsed.length = length;
    parsed.total_size = u32::from(reader.position()) as usize;
    Ok(parsed)
}

fn parse_attributes(der_bytes: &[u8]) -> Result<(String, u64)> {
    let mut reader = SliceReader::new(der_bytes).map_err(bad_signature)?;
    reader
        .sequence(|r| {
            let target_any = Any::decode(r)?;
            let target = match target_any.tag() {
                Tag::PrintableString | Tag::Utf8String | Tag::Ia5String | Tag::OctetString => {
                    core::str::from_utf8(target_any.value())
                        .map_err(|_| Tag::PrintableString.value_error())?
                        .to_string()
                }
                tag => return Err(tag.value_error()),
            };
            let length = u64::decode(r)?;
            Ok((target, length))
        })
        .map_err(bad_signature)
}
