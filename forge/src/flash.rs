//! Flash engine
//!
//! `flash` resolves a label to either a special handler (GPT table
//! rewrite, bootloader, zImage splice, ESP file write, ...) or an
//! ordinary GPT partition write, expanding sparse images on the fly. All
//! partition writes flow through [`PartitionWriter`], which refuses any
//! byte outside the resolved partition.

use tracing::{debug, error, info, warn};

use crate::bootimg::{BootImgHeader, KERNEL_SIZE_OFFSET};
use crate::device::{
    BlockIo, Device, HandoffImage, LogicalUnit, PartitionInfo, ESP_GUID,
};
use crate::error::{FastbootError, Result};
use crate::pkcs7;
use crate::sparse;

/// GPT-bin stream magic.
pub const GPT_BIN_MAGIC: u32 = 0x0EAD_0EAD;

const GPT_BIN_HEADER_LEN: usize = 24;
const GPT_BIN_PART_LEN: usize = 128;

/// Largest MBR boot-code blob accepted by `flash:mbr`.
pub const MBR_CODE_SIZE: usize = 440;

/// Android fs_mgr reads this many leading bytes to decide whether a
/// partition was wiped.
const FS_MGR_SIZE: u64 = 4096;

const FILL_CHUNK: usize = 1024 * 1024;

/// The label whitelisted for `flash` while the device is locked.
pub const ACTION_AUTHORIZATION: &str = "authorization";

/// Signed-policy configuration: the burned-in root fingerprint and the
/// action applied to a verified payload.
pub struct Policy {
    pub root_cert_sha256: [u8; 32],
    pub action: Box<dyn FnMut(&[u8]) -> Result<()>>,
}

/// What the caller must do after a successful flash.
#[derive(Default, Debug)]
pub struct FlashResult {
    /// The partition table changed; partition variables must be rebuilt.
    pub refresh_partition_vars: bool,
    /// The session must stop and hand this image to the caller.
    pub handoff: Option<HandoffImage>,
}

/// Bounded sequential writer over one partition's byte range.
pub struct PartitionWriter<'a> {
    disk: &'a mut dyn BlockIo,
    start: u64,
    end: u64,
    offset: u64,
}

impl<'a> PartitionWriter<'a> {
    pub fn new(disk: &'a mut dyn BlockIo, part: &PartitionInfo) -> Self {
        let block_size = disk.block_size();
        Self {
            start: part.start_byte(block_size),
            end: part.end_byte(block_size),
            offset: part.start_byte(block_size),
            disk,
        }
    }

    fn check(&self, size: u64) -> Result<()> {
        let fits = self.offset >= self.start
            && self
                .offset
                .checked_add(size)
                .is_some_and(|end| end <= self.end);
        if !fits {
            error!(
                "Attempt to write outside of partition [{} {}] [{} {}]",
                self.start,
                self.end,
                self.offset,
                self.offset.saturating_add(size)
            );
            return Err(FastbootError::InvalidParameter);
        }
        Ok(())
    }

    /// Write `data` at the cursor and advance.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check(data.len() as u64)?;
        self.disk.write_at(self.offset, data)?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Write `size` bytes of a repeated 4-byte pattern.
    pub fn fill(&mut self, pattern: u32, size: u64) -> Result<()> {
        self.check(size)?;
        let mut remaining = size;
        let chunk: Vec<u8> = pattern
            .to_le_bytes()
            .iter()
            .copied()
            .cycle()
            .take(FILL_CHUNK.min(size as usize))
            .collect();
        while remaining > 0 {
            let len = (chunk.len() as u64).min(remaining) as usize;
            self.disk.write_at(self.offset, &chunk[..len])?;
            self.offset += len as u64;
            remaining -= len as u64;
        }
        Ok(())
    }

    /// Advance the cursor without writing.
    pub fn skip(&mut self, size: u64) -> Result<()> {
        self.check(size)?;
        self.offset += size;
        Ok(())
    }

    /// Bytes left between the cursor and the end of the partition.
    pub fn remaining(&self) -> u64 {
        self.end - self.offset
    }
}

/// Labels handled outside the ordinary partition path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SpecialLabel {
    Gpt,
    GptGpp1,
    EfiRun,
    Mbr,
    Sfu,
    Ifwi,
    OemVars,
    ZImage,
    Authorization,
    EspFile(String),
}

impl SpecialLabel {
    fn resolve(label: &str, allow_debug: bool, policy_enabled: bool) -> Option<Self> {
        if allow_debug {
            if let Some(path) = label.strip_prefix("/ESP/") {
                return Some(SpecialLabel::EspFile(path.to_string()));
            }
        }
        match label {
            "gpt" => Some(SpecialLabel::Gpt),
            "gpt-gpp1" => Some(SpecialLabel::GptGpp1),
            "efirun" if allow_debug => Some(SpecialLabel::EfiRun),
            "mbr" if allow_debug => Some(SpecialLabel::Mbr),
            "sfu" => Some(SpecialLabel::Sfu),
            "ifwi" => Some(SpecialLabel::Ifwi),
            "oemvars" => Some(SpecialLabel::OemVars),
            "zimage" => Some(SpecialLabel::ZImage),
            ACTION_AUTHORIZATION if policy_enabled => Some(SpecialLabel::Authorization),
            _ => None,
        }
    }
}

/// Dispatch a downloaded blob to the handler for `label`.
pub fn flash(
    device: &mut Device,
    policy: Option<&mut Policy>,
    data: &[u8],
    label: &str,
    allow_debug: bool,
) -> Result<FlashResult> {
    match SpecialLabel::resolve(label, allow_debug, policy.is_some()) {
        Some(SpecialLabel::EspFile(path)) => {
            device.esp.write_file(&path, data)?;
            Ok(FlashResult::default())
        }
        Some(SpecialLabel::Gpt) => {
            flash_gpt(device, data, LogicalUnit::User)?;
            Ok(FlashResult {
                refresh_partition_vars: true,
                handoff: None,
            })
        }
        Some(SpecialLabel::GptGpp1) => {
            flash_gpt(device, data, LogicalUnit::Factory)?;
            Ok(FlashResult::default())
        }
        Some(SpecialLabel::EfiRun) => Ok(FlashResult {
            refresh_partition_vars: false,
            handoff: Some(HandoffImage::Efi(data.to_vec())),
        }),
        Some(SpecialLabel::Mbr) => {
            flash_mbr(device, data)?;
            Ok(FlashResult::default())
        }
        Some(SpecialLabel::Sfu) => {
            device.esp.write_file("BIOSUPDATE.fv", data)?;
            Ok(FlashResult::default())
        }
        Some(SpecialLabel::Ifwi) => {
            device.esp.write_file("ifwi.bin", data)?;
            Ok(FlashResult::default())
        }
        Some(SpecialLabel::OemVars) => {
            flash_oemvars(device, data)?;
            Ok(FlashResult::default())
        }
        Some(SpecialLabel::ZImage) => {
            flash_zimage(device, data)?;
            Ok(FlashResult::default())
        }
        Some(SpecialLabel::Authorization) => {
            let policy = policy.expect("authorization label requires a policy");
            let payload = pkcs7::verify_pkcs7(&policy.root_cert_sha256, data)?;
            (policy.action)(&payload)?;
            Ok(FlashResult::default())
        }
        None => flash_partition(device, data, label),
    }
}

/// Flash a blob into the partition named `label`, expanding sparse
/// images chunk by chunk.
pub fn flash_partition(device: &mut Device, data: &[u8], label: &str) -> Result<FlashResult> {
    let part = device.gpt.find_partition(label, LogicalUnit::User)?;
    let disk = device.gpt.disk(LogicalUnit::User);
    let mut writer = PartitionWriter::new(disk, &part);

    if sparse::is_sparse_image(data) {
        sparse::write_sparse(&mut writer, data)?;
    } else {
        writer.write(data)?;
    }

    if part.type_guid != ESP_GUID {
        device.gpt.refresh()?;
    }

    Ok(FlashResult::default())
}

fn flash_gpt(device: &mut Device, data: &[u8], unit: LogicalUnit) -> Result<()> {
    let (start_lba, partitions) = parse_gpt_bin(data)?;
    device.gpt.create(start_lba, partitions, unit)
}

/// Validate and split a GPT-bin stream into its partition records.
fn parse_gpt_bin(data: &[u8]) -> Result<(u64, Vec<PartitionInfo>)> {
    if data.len() < GPT_BIN_HEADER_LEN {
        error!("Invalid gpt binary");
        return Err(FastbootError::InvalidParameter);
    }

    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let start_lba = u64::from_le_bytes(data[8..16].try_into().unwrap());
    let npart = u32::from_le_bytes(data[16..20].try_into().unwrap()) as usize;

    if magic != GPT_BIN_MAGIC || data.len() != GPT_BIN_HEADER_LEN + npart * GPT_BIN_PART_LEN {
        error!("Invalid gpt binary");
        return Err(FastbootError::InvalidParameter);
    }

    let mut partitions = Vec::with_capacity(npart);
    for record in data[GPT_BIN_HEADER_LEN..].chunks_exact(GPT_BIN_PART_LEN) {
        let units: Vec<u16> = record[..72]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&u| u != 0)
            .collect();
        let name = String::from_utf16(&units).map_err(|_| FastbootError::InvalidParameter)?;

        partitions.push(PartitionInfo {
            name,
            type_guid: uuid::Uuid::from_bytes_le(record[72..88].try_into().unwrap()),
            unique_guid: uuid::Uuid::from_bytes_le(record[88..104].try_into().unwrap()),
            first_lba: u64::from_le_bytes(record[104..112].try_into().unwrap()),
            last_lba: u64::from_le_bytes(record[112..120].try_into().unwrap()),
            attributes: u64::from_le_bytes(record[120..128].try_into().unwrap()),
        });
    }

    Ok((start_lba, partitions))
}

fn flash_mbr(device: &mut Device, data: &[u8]) -> Result<()> {
    if data.len() > MBR_CODE_SIZE {
        return Err(FastbootError::InvalidParameter);
    }
    device.gpt.disk(LogicalUnit::User).write_at(0, data)
}

/// Apply a `key=value` stream to firmware NV storage. Blank lines and
/// `#` comments are skipped.
fn flash_oemvars(device: &mut Device, data: &[u8]) -> Result<()> {
    let text = std::str::from_utf8(data).map_err(|_| FastbootError::InvalidParameter)?;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            error!("malformed oemvars line: {line}");
            return Err(FastbootError::InvalidParameter);
        };
        device.firmware.nv_set(key.trim(), value.trim().as_bytes())?;
    }
    Ok(())
}

/// Splice a new kernel into the boot image already on the `boot`
/// partition, keeping the original header, ramdisk, and second stage.
fn flash_zimage(device: &mut Device, kernel: &[u8]) -> Result<()> {
    let part = device
        .gpt
        .find_partition("boot", LogicalUnit::User)
        .inspect_err(|_| error!("Unable to get information on the boot partition"))?;
    let disk = device.gpt.disk(LogicalUnit::User);
    let block_size = disk.block_size();
    let partlen = part.size_bytes(block_size) as usize;

    let mut image = Vec::new();
    image
        .try_reserve_exact(partlen)
        .map_err(|_| FastbootError::OutOfMemory)?;
    image.resize(partlen, 0);
    disk.read_at(part.start_byte(block_size), &mut image)?;

    let header = BootImgHeader::parse(&image).map_err(|_| {
        error!("boot partition does not contain a valid bootimage");
        FastbootError::Unsupported
    })?;

    let new_size = header.image_size() - header.kernel_size as u64
        + header.page_align(kernel.len() as u64);
    if new_size > partlen as u64 {
        error!("Kernel image is too large to fit in the boot partition");
        return Err(FastbootError::InvalidParameter);
    }

    let page = header.page_size as u64;
    let old_ramdisk = header.ramdisk_offset() as usize;
    let old_second = old_ramdisk + header.page_align(header.ramdisk_size as u64) as usize;
    let ramdisk = image
        .get(old_ramdisk..old_ramdisk + header.ramdisk_size as usize)
        .ok_or(FastbootError::InvalidParameter)?;
    let second = image
        .get(old_second..old_second + header.second_size as usize)
        .ok_or(FastbootError::InvalidParameter)?;

    let mut spliced = vec![0u8; new_size as usize];
    spliced[..page as usize].copy_from_slice(&image[..page as usize]);
    spliced[KERNEL_SIZE_OFFSET..KERNEL_SIZE_OFFSET + 4]
        .copy_from_slice(&(kernel.len() as u32).to_le_bytes());

    let mut cursor = page as usize;
    spliced[cursor..cursor + kernel.len()].copy_from_slice(kernel);
    cursor = (page + header.page_align(kernel.len() as u64)) as usize;

    spliced[cursor..cursor + ramdisk.len()].copy_from_slice(ramdisk);
    cursor += header.page_align(header.ramdisk_size as u64) as usize;

    spliced[cursor..cursor + second.len()].copy_from_slice(second);

    let mut writer = PartitionWriter::new(device.gpt.disk(LogicalUnit::User), &part);
    writer.write(&spliced)
}

/// Erase the partition named `label`.
///
/// After a hardware erase the leading bytes are zero-filled so fs_mgr's
/// wipe detection sees all-zeros; without hardware erase the whole range
/// is zero-filled.
pub fn erase_by_label(device: &mut Device, label: &str) -> Result<()> {
    let part = device
        .gpt
        .find_partition(label, LogicalUnit::User)
        .inspect_err(|_| error!("Failed to get partition {label}"))?;
    let disk = device.gpt.disk(LogicalUnit::User);
    let block_size = disk.block_size();

    match disk.erase_blocks(part.first_lba, part.last_lba) {
        Ok(()) => {
            let min_end = part.first_lba + FS_MGR_SIZE / block_size + 1;
            zero_fill(disk, part.first_lba, min_end.min(part.last_lba))?;
        }
        Err(err) => {
            debug!("hardware erase unavailable ({err}), falling back to filling with zeros");
            zero_fill(disk, part.first_lba, part.last_lba)?;
        }
    }

    if part.type_guid != ESP_GUID {
        device.gpt.refresh()?;
    }
    Ok(())
}

/// Zero an inclusive LBA range.
fn zero_fill(disk: &mut dyn BlockIo, first_lba: u64, last_lba: u64) -> Result<()> {
    let block_size = disk.block_size();
    let zeros = vec![0u8; FILL_CHUNK];
    let mut offset = first_lba * block_size;
    let end = (last_lba + 1) * block_size;
    while offset < end {
        let len = ((end - offset) as usize).min(zeros.len());
        disk.write_at(offset, &zeros[..len])?;
        offset += len as u64;
    }
    Ok(())
}

/// Wipe user data across the `userdata`/`data` naming difference; a
/// missing partition is logged and skipped.
pub fn wipe_userdata(device: &mut Device) -> Result<()> {
    for label in ["userdata", "data"] {
        match erase_by_label(device, label) {
            Ok(()) => {
                info!("Erased {label}");
                return Ok(());
            }
            Err(FastbootError::NotFound(_)) => continue,
            Err(err) => return Err(err),
        }
    }
    warn!("no userdata partition to wipe");
    Ok(())
}
