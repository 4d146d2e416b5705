//! In-memory collaborators and fixture builders shared by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::OnceLock;

use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use x509_cert::Certificate;

use crate::bootimg::BOOT_MAGIC;
use crate::device::{
    BlockIo, BootTarget, Device, EspFilesystem, Firmware, GptService, LogicalUnit, PartitionInfo,
    RecvStatus, Transport, UiEventSource, LINUX_DATA_GUID,
};
use crate::error::{FastbootError, Result};
use crate::signature::DigestAlgorithm;

// ----------------------------------------------------------------------
// Device fakes

pub struct MemDisk {
    pub data: Vec<u8>,
    block_size: u64,
    erase_supported: bool,
}

impl MemDisk {
    pub fn new(blocks: u64, block_size: u64, erase_supported: bool) -> Self {
        Self {
            data: vec![0u8; (blocks * block_size) as usize],
            block_size,
            erase_supported,
        }
    }
}

impl BlockIo for MemDisk {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.data.len() as u64 / self.block_size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset as usize + buf.len();
        if end > self.data.len() {
            return Err(FastbootError::InvalidParameter);
        }
        buf.copy_from_slice(&self.data[offset as usize..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset as usize + data.len();
        if end > self.data.len() {
            return Err(FastbootError::InvalidParameter);
        }
        self.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn erase_blocks(&mut self, first_lba: u64, last_lba: u64) -> Result<()> {
        if !self.erase_supported {
            return Err(FastbootError::Unsupported);
        }
        let start = (first_lba * self.block_size) as usize;
        let end = ((last_lba + 1) * self.block_size) as usize;
        self.data[start..end].fill(0xFF);
        Ok(())
    }
}

pub struct MemGpt {
    pub parts: Vec<PartitionInfo>,
    pub disk: MemDisk,
    pub factory_disk: MemDisk,
    refresh_count: Rc<Cell<usize>>,
}

impl GptService for MemGpt {
    fn list_partitions(&mut self, unit: LogicalUnit) -> Result<Vec<PartitionInfo>> {
        match unit {
            LogicalUnit::User => Ok(self.parts.clone()),
            LogicalUnit::Factory => Ok(Vec::new()),
        }
    }

    fn find_partition(&mut self, label: &str, _unit: LogicalUnit) -> Result<PartitionInfo> {
        self.parts
            .iter()
            .find(|p| p.name == label)
            .cloned()
            .ok_or_else(|| FastbootError::NotFound(format!("partition {label}")))
    }

    fn create(
        &mut self,
        _start_lba: u64,
        partitions: Vec<PartitionInfo>,
        unit: LogicalUnit,
    ) -> Result<()> {
        if unit == LogicalUnit::User {
            self.parts = partitions;
        }
        Ok(())
    }

    fn refresh(&mut self) -> Result<()> {
        self.refresh_count.set(self.refresh_count.get() + 1);
        Ok(())
    }

    fn disk(&mut self, unit: LogicalUnit) -> &mut dyn BlockIo {
        match unit {
            LogicalUnit::User => &mut self.disk,
            LogicalUnit::Factory => &mut self.factory_disk,
        }
    }
}

pub struct MemEsp {
    files: Rc<RefCell<HashMap<String, Vec<u8>>>>,
}

impl EspFilesystem for MemEsp {
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.files
            .borrow_mut()
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }
}

pub struct MemFirmware {
    pub vars: HashMap<String, Vec<u8>>,
    pub battery_mv: Option<u32>,
}

impl Default for MemFirmware {
    fn default() -> Self {
        Self {
            vars: HashMap::new(),
            battery_mv: Some(4000),
        }
    }
}

impl Firmware for MemFirmware {
    fn nv_get(&mut self, name: &str) -> Option<Vec<u8>> {
        self.vars.get(name).cloned()
    }

    fn nv_set(&mut self, name: &str, value: &[u8]) -> Result<()> {
        self.vars.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn disable_watchdog(&mut self) -> Result<()> {
        Ok(())
    }

    fn battery_voltage_mv(&mut self) -> Option<u32> {
        self.battery_mv
    }
}

/// Handles into the fakes that stay readable after the `Device` is moved
/// into a session.
pub struct DeviceProbe {
    pub esp_files: Rc<RefCell<HashMap<String, Vec<u8>>>>,
    pub refresh_count: Rc<Cell<usize>>,
}

/// A device over an 8 MiB in-memory disk (512-byte blocks).
pub fn probe_device(parts: Vec<PartitionInfo>, erase_supported: bool) -> (Device, DeviceProbe) {
    let refresh_count = Rc::new(Cell::new(0));
    let esp_files = Rc::new(RefCell::new(HashMap::new()));
    let device = Device {
        gpt: Box::new(MemGpt {
            parts,
            disk: MemDisk::new(16384, 512, erase_supported),
            factory_disk: MemDisk::new(2048, 512, erase_supported),
            refresh_count: refresh_count.clone(),
        }),
        esp: Box::new(MemEsp {
            files: esp_files.clone(),
        }),
        firmware: Box::new(MemFirmware::default()),
    };
    (
        device,
        DeviceProbe {
            esp_files,
            refresh_count,
        },
    )
}

pub fn test_device() -> Device {
    probe_device(Vec::new(), false).0
}

pub fn test_device_with_parts(parts: Vec<PartitionInfo>) -> Device {
    probe_device(parts, false).0
}

pub fn test_device_with(parts: Vec<PartitionInfo>, erase_supported: bool) -> Device {
    probe_device(parts, erase_supported).0
}

pub fn device_with_firmware(firmware: MemFirmware) -> Device {
    let (mut device, _) = probe_device(Vec::new(), false);
    device.firmware = Box::new(firmware);
    device
}

pub fn test_part(name: &str, first: u64, last: u64) -> PartitionInfo {
    PartitionInfo {
        name: name.into(),
        type_guid: LINUX_DATA_GUID,
        unique_guid: uuid::Uuid::nil(),
        first_lba: first,
        last_lba: last,
        attributes: 0,
    }
}

// ----------------------------------------------------------------------
// Transport and UI fakes

pub struct ScriptedTransport {
    incoming: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
    timeout_when_empty: bool,
}

impl Transport for ScriptedTransport {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<RecvStatus> {
        let Some(mut message) = self.incoming.pop_front() else {
            if self.timeout_when_empty {
                return Ok(RecvStatus::Timeout);
            }
            return Err(FastbootError::Transport("host disconnected".into()));
        };
        let len = message.len().min(buf.len());
        buf[..len].copy_from_slice(&message[..len]);
        if message.len() > len {
            self.incoming.push_front(message.split_off(len));
        }
        Ok(RecvStatus::Received(len))
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.sent.push(data.to_vec());
        Ok(())
    }

    fn close(&mut self) {}
}

/// One scripted host interaction; each element is one bulk write.
pub fn script(messages: &[&[u8]]) -> ScriptedTransport {
    ScriptedTransport {
        incoming: messages.iter().map(|m| m.to_vec()).collect(),
        sent: Vec::new(),
        timeout_when_empty: false,
    }
}

/// A transport that never produces data, for UI-driven exits.
pub fn idle_transport() -> ScriptedTransport {
    ScriptedTransport {
        incoming: VecDeque::new(),
        sent: Vec::new(),
        timeout_when_empty: true,
    }
}

pub struct NullUi;

impl UiEventSource for NullUi {
    fn poll_target(&mut self) -> Option<BootTarget> {
        None
    }
}

pub struct ScriptedUi {
    remaining: usize,
    target: BootTarget,
}

impl ScriptedUi {
    /// Yield `target` on the poll after `polls` empty ones.
    pub fn after(polls: usize, target: BootTarget) -> Self {
        Self {
            remaining: polls,
            target,
        }
    }
}

impl UiEventSource for ScriptedUi {
    fn poll_target(&mut self) -> Option<BootTarget> {
        if self.remaining == 0 {
            Some(self.target)
        } else {
            self.remaining -= 1;
            None
        }
    }
}

/// Render sent buffers as readable reply strings (code plus payload up
/// to the NUL padding).
pub fn frames_of(sent: &[Vec<u8>]) -> Vec<String> {
    sent.iter()
        .map(|frame| {
            let end = frame.iter().position(|&b| b == 0).unwrap_or(frame.len());
            String::from_utf8_lossy(&frame[..end]).into_owned()
        })
        .collect()
}

// ----------------------------------------------------------------------
// Binary format fixtures

/// Assemble a boot image: header page plus page-aligned kernel, ramdisk,
/// and second-stage sections.
pub fn build_boot_image(page_size: u32, kernel: &[u8], ramdisk: &[u8], second: &[u8]) -> Vec<u8> {
    let page = page_size as usize;
    let align = |n: usize| n.div_ceil(page) * page;
    let total = page + align(kernel.len()) + align(ramdisk.len()) + align(second.len());

    let mut image = vec![0u8; total];
    image[..8].copy_from_slice(BOOT_MAGIC);
    image[8..12].copy_from_slice(&(kernel.len() as u32).to_le_bytes());
    image[16..20].copy_from_slice(&(ramdisk.len() as u32).to_le_bytes());
    image[24..28].copy_from_slice(&(second.len() as u32).to_le_bytes());
    image[36..40].copy_from_slice(&page_size.to_le_bytes());

    let mut cursor = page;
    image[cursor..cursor + kernel.len()].copy_from_slice(kernel);
    cursor += align(kernel.len());
    image[cursor..cursor + ramdisk.len()].copy_from_slice(ramdisk);
    cursor += align(ramdisk.len());
    image[cursor..cursor + second.len()].copy_from_slice(second);
    image
}

/// A minimal valid ext4 superblock (340 bytes, to be written at offset
/// 1024 of a partition).
pub fn ext4_superblock(log_block_size: u32, blocks: u64) -> Vec<u8> {
    let mut sb = vec![0u8; 340];
    sb[4..8].copy_from_slice(&(blocks as u32).to_le_bytes());
    sb[24..28].copy_from_slice(&log_block_size.to_le_bytes());
    sb[56..58].copy_from_slice(&0xEF53u16.to_le_bytes());
    sb[58..60].copy_from_slice(&1u16.to_le_bytes());
    sb[336..340].copy_from_slice(&((blocks >> 32) as u32).to_le_bytes());
    sb
}

/// A minimal SquashFS superblock (48 bytes).
pub fn squashfs_superblock(bytes_used: u64) -> Vec<u8> {
    let mut sb = vec![0u8; 48];
    sb[0..4].copy_from_slice(&0x7371_7368u32.to_le_bytes());
    sb[40..48].copy_from_slice(&bytes_used.to_le_bytes());
    sb
}

/// Encode a GPT-bin stream for `flash:gpt`.
pub fn encode_gpt_bin(start_lba: u64, parts: &[PartitionInfo]) -> Vec<u8> {
    let mut out = vec![0u8; 24];
    out[0..4].copy_from_slice(&crate::flash::GPT_BIN_MAGIC.to_le_bytes());
    out[8..16].copy_from_slice(&start_lba.to_le_bytes());
    out[16..20].copy_from_slice(&(parts.len() as u32).to_le_bytes());

    for part in parts {
        let mut record = vec![0u8; 128];
        for (i, unit) in part.name.encode_utf16().take(36).enumerate() {
            record[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        record[72..88].copy_from_slice(&part.type_guid.to_bytes_le());
        record[88..104].copy_from_slice(&part.unique_guid.to_bytes_le());
        record[104..112].copy_from_slice(&part.first_lba.to_le_bytes());
        record[112..120].copy_from_slice(&part.last_lba.to_le_bytes());
        record[120..128].copy_from_slice(&part.attributes.to_le_bytes());
        out.extend_from_slice(&record);
    }
    out
}

/// Encode `raw` (a whole number of blocks) as a sparse image, using
/// don't-care chunks for zero blocks and fill chunks for repeated
/// 4-byte patterns, with a trailing crc32 chunk.
pub fn sparse_encode(raw: &[u8], blk_sz: u32) -> Vec<u8> {
    assert_eq!(raw.len() % blk_sz as usize, 0);
    let blocks = raw.len() / blk_sz as usize;

    let mut chunks = Vec::new();
    for block in raw.chunks(blk_sz as usize) {
        if block.iter().all(|&b| b == 0) {
            chunks.push(chunk_header(0xCAC3, 1, 12));
        } else if block.chunks(4).all(|w| w == &block[..4]) {
            let mut chunk = chunk_header(0xCAC2, 1, 16);
            chunk.extend_from_slice(&block[..4]);
            chunks.push(chunk);
        } else {
            let mut chunk = chunk_header(0xCAC1, 1, 12 + blk_sz);
            chunk.extend_from_slice(block);
            chunks.push(chunk);
        }
    }
    let mut crc = chunk_header(0xCAC4, 0, 16);
    crc.extend_from_slice(&[0u8; 4]);
    chunks.push(crc);

    let mut out = vec![0u8; 28];
    out[0..4].copy_from_slice(&crate::sparse::SPARSE_MAGIC.to_le_bytes());
    out[4..6].copy_from_slice(&1u16.to_le_bytes()); // major
    out[8..10].copy_from_slice(&28u16.to_le_bytes());
    out[10..12].copy_from_slice(&12u16.to_le_bytes());
    out[12..16].copy_from_slice(&blk_sz.to_le_bytes());
    out[16..20].copy_from_slice(&(blocks as u32).to_le_bytes());
    out[20..24].copy_from_slice(&(chunks.len() as u32).to_le_bytes());
    for chunk in chunks {
        out.extend_from_slice(&chunk);
    }
    out
}

fn chunk_header(chunk_type: u16, blocks: u32, total_sz: u32) -> Vec<u8> {
    let mut header = vec![0u8; 12];
    header[0..2].copy_from_slice(&chunk_type.to_le_bytes());
    header[4..8].copy_from_slice(&blocks.to_le_bytes());
    header[8..12].copy_from_slice(&total_sz.to_le_bytes());
    header
}

// ----------------------------------------------------------------------
// DER fixtures

fn der_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![len as u8];
    }
    let bytes: Vec<u8> = len
        .to_be_bytes()
        .into_iter()
        .skip_while(|&b| b == 0)
        .collect();
    let mut out = vec![0x80 | bytes.len() as u8];
    out.extend(bytes);
    out
}

fn wrap_sequence(content: &[u8]) -> Vec<u8> {
    let mut out = vec![0x30];
    out.extend(der_length(content.len()));
    out.extend_from_slice(content);
    out
}

/// Encode the `{target, length}` authenticated attributes.
pub fn encode_attributes(target: &str, length: u64) -> Vec<u8> {
    use der::asn1::PrintableString;
    use der::Encode;

    let mut content = PrintableString::new(target).unwrap().to_der().unwrap();
    content.extend(length.to_der().unwrap());
    wrap_sequence(&content)
}

/// Encode a boot signature record around pre-encoded attributes.
pub fn encode_boot_signature(
    certificate: Option<&Certificate>,
    algorithm: der::asn1::ObjectIdentifier,
    attributes_der: &[u8],
    signature: &[u8],
) -> Vec<u8> {
    use der::asn1::OctetString;
    use der::Encode;

    let mut content = 1u8.to_der().unwrap();
    if let Some(cert) = certificate {
        content.extend(cert.to_der().unwrap());
    }
    let alg = x509_cert::spki::AlgorithmIdentifierOwned {
        oid: algorithm,
        parameters: None,
    };
    content.extend(alg.to_der().unwrap());
    content.extend_from_slice(attributes_der);
    content.extend(OctetString::new(signature.to_vec()).unwrap().to_der().unwrap());
    wrap_sequence(&content)
}

// ----------------------------------------------------------------------
// Keys, certificates, and signed fixtures

static OEM_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
static SECOND_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

/// The test OEM signing key (generated once per test run).
pub fn oem_key() -> RsaPrivateKey {
    OEM_KEY
        .get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
        .clone()
}

/// An independent second key for embedded-certificate scenarios.
pub fn second_key() -> RsaPrivateKey {
    SECOND_KEY
        .get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
        .clone()
}

/// Mint a certificate for `subject` signed by `signer`. `issuer: None`
/// builds a self-signed root; `Some(label)` a leaf issued under that
/// name.
pub fn make_cert(
    signer: &RsaPrivateKey,
    subject: &RsaPublicKey,
    issuer: Option<&str>,
) -> Certificate {
    use rsa::pkcs8::EncodePublicKey;
    use std::str::FromStr;
    use std::time::Duration;
    use x509_cert::builder::{Builder, CertificateBuilder, Profile};
    use x509_cert::name::Name;
    use x509_cert::serial_number::SerialNumber;
    use x509_cert::time::Validity;

    let spki_der = subject.to_public_key_der().unwrap();
    let spki =
        x509_cert::spki::SubjectPublicKeyInfoOwned::try_from(spki_der.as_bytes()).unwrap();

    let key_tag = hex::encode(&Sha256::digest(spki_der.as_bytes())[..6]);
    let subject_name = Name::from_str(&format!("CN=k{key_tag},O=Forge,C=US")).unwrap();
    let profile = match issuer {
        None => Profile::Root,
        Some(label) => Profile::Leaf {
            issuer: Name::from_str(&format!("CN={label},O=Forge,C=US")).unwrap(),
            enable_key_agreement: false,
            enable_key_encipherment: false,
        },
    };

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(signer.clone());
    let builder = CertificateBuilder::new(
        profile,
        SerialNumber::new(&[1]).unwrap(),
        Validity::from_now(Duration::from_secs(365 * 24 * 3600)).unwrap(),
        subject_name,
        spki,
        &signing_key,
    )
    .unwrap();
    builder.build::<rsa::pkcs1v15::Signature>().unwrap()
}

/// Append a boot signature over `image`, optionally embedding a
/// certificate, and return the verifiable buffer.
pub fn sign_boot_image(
    image: &[u8],
    key: &RsaPrivateKey,
    embedded_cert: Option<&Certificate>,
    algorithm: DigestAlgorithm,
) -> Vec<u8> {
    let attributes = encode_attributes("/boot", image.len() as u64);
    let digest = algorithm.digest_parts(&[image, &attributes]);
    let signature = key.sign(algorithm.rsa_scheme(), &digest).unwrap();
    let record = encode_boot_signature(embedded_cert, algorithm.oid(), &attributes, &signature);

    let mut out = image.to_vec();
    out.extend(record);
    out
}

/// Build a PKCS#7 SignedData blob over `payload`, signed by
/// `signer_key` under `signer_cert`, with `extra_certs` also included.
pub fn build_pkcs7(
    payload: &[u8],
    signer_key: &RsaPrivateKey,
    signer_cert: &Certificate,
    extra_certs: &[Certificate],
    signing_time: &str,
) -> Vec<u8> {
    use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
    use cms::content_info::{CmsVersion, ContentInfo};
    use cms::signed_data::{
        CertificateSet, EncapsulatedContentInfo, SignedData, SignerInfo, SignerInfos,
    };
    use der::asn1::{Any, ObjectIdentifier, OctetString, SetOfVec};
    use der::{Encode, Tag};
    use x509_cert::attr::Attribute;

    const OID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");

    let attr = |oid: ObjectIdentifier, value: Any| Attribute {
        oid,
        values: SetOfVec::try_from(vec![value]).unwrap(),
    };

    let signed_attrs = SetOfVec::try_from(vec![
        attr(
            crate::pkcs7::OID_PKCS9_CONTENT_TYPE,
            Any::encode_from(&OID_DATA).unwrap(),
        ),
        attr(
            crate::pkcs7::OID_PKCS9_SIGNING_TIME,
            Any::new(Tag::UtcTime, signing_time.as_bytes().to_vec()).unwrap(),
        ),
        attr(
            crate::pkcs7::OID_PKCS9_MESSAGE_DIGEST,
            Any::encode_from(&OctetString::new(Sha256::digest(payload).to_vec()).unwrap())
                .unwrap(),
        ),
    ])
    .unwrap();

    let attrs_der = signed_attrs.to_der().unwrap();
    let signature = signer_key
        .sign(
            rsa::Pkcs1v15Sign::new::<Sha256>(),
            &Sha256::digest(&attrs_der),
        )
        .unwrap();

    let sha256_alg = x509_cert::spki::AlgorithmIdentifierOwned {
        oid: crate::pkcs7::OID_SHA256,
        parameters: None,
    };
    let signer_info = SignerInfo {
        version: CmsVersion::V1,
        sid: cms::signed_data::SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: signer_cert.tbs_certificate.issuer.clone(),
            serial_number: signer_cert.tbs_certificate.serial_number.clone(),
        }),
        digest_alg: sha256_alg.clone(),
        signed_attrs: Some(signed_attrs),
        signature_algorithm: x509_cert::spki::AlgorithmIdentifierOwned {
            oid: crate::pkcs7::OID_RSA_ENCRYPTION,
            parameters: None,
        },
        signature: OctetString::new(signature).unwrap(),
        unsigned_attrs: None,
    };

    let mut choices = vec![CertificateChoices::Certificate(signer_cert.clone())];
    choices.extend(
        extra_certs
            .iter()
            .map(|cert| CertificateChoices::Certificate(cert.clone())),
    );

    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::try_from(vec![sha256_alg]).unwrap(),
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: OID_DATA,
            econtent: Some(
                Any::encode_from(&OctetString::new(payload.to_vec()).unwrap()).unwrap(),
            ),
        },
        certificates: Some(CertificateSet(SetOfVec::try_from(choices).unwrap())),
        crls: None,
        signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info]).unwrap()),
    };

    let content_info = ContentInfo {
        content_type: crate::pkcs7::OID_SIGNED_DATA,
        content: Any::encode_from(&signed_data).unwrap(),
    };
    content_info.to_der().unwrap()
}
