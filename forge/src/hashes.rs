//! Partition hashing for `oem get-hashes`
//!
//! A partition's hashable length is autodetected from its filesystem
//! superblock (ext4 or SquashFS). When a dm-verity header sits directly
//! after the filesystem, the Merkle tree and verity metadata are included
//! in the hashed range. Boot partitions hash the boot image plus its
//! trailing signature.

use digest::DynDigest;
use md5::Md5;
use sha1::Sha1;
use tracing::{debug, error};

use crate::bootimg::{BootImgHeader, BOOT_SIGNATURE_MAX_SIZE};
use crate::device::{BlockIo, Device, LogicalUnit, PartitionInfo};
use crate::error::{FastbootError, Result};
use crate::signature::parse_boot_signature;

const EXT4_SB_OFFSET: u64 = 1024;
const EXT4_SB_LEN: usize = 340;
const EXT4_SUPER_MAGIC: u16 = 0xEF53;
const EXT4_VALID_FS: u16 = 0x0001;

const SQUASHFS_MAGIC: u32 = 0x7371_7368;
const SQUASHFS_SB_LEN: usize = 48;
const SQUASHFS_PADDING: u64 = 4096;

const VERITY_METADATA_SIZE: u64 = 32768;
const VERITY_MAGIC: u32 = 0xB001_B001;
const VERITY_BLOCK_SIZE: u64 = 4096;
const VERITY_HASH_SIZE: u64 = 32;
const VERITY_HASHES_PER_BLOCK: u64 = VERITY_BLOCK_SIZE / VERITY_HASH_SIZE;

const HASH_CHUNK: usize = 1024 * 1024;

/// Largest partition considered for a boot-image hash.
const MAX_BOOT_PARTITION: u64 = 100 * 1024 * 1024;

/// Digest selection for hash reports. SHA-1 is the wire default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha1,
    Md5,
}

impl HashAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Self::Sha1),
            "md5" => Some(Self::Md5),
            _ => None,
        }
    }

    fn hasher(self) -> Box<dyn DynDigest> {
        match self {
            Self::Sha1 => Box::new(Sha1::default()),
            Self::Md5 => Box::new(Md5::default()),
        }
    }
}

/// One hash report line pair: the hashed target and its hex digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashReport {
    pub target: String,
    pub hex: String,
}

/// Read `buf.len()` bytes at `offset` within the partition, refusing
/// reads past its end.
fn read_partition(
    disk: &mut dyn BlockIo,
    part: &PartitionInfo,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    let partlen = part.size_bytes(disk.block_size());
    if offset + buf.len() as u64 > partlen {
        error!(
            "attempt to read outside of partition {}, (len {} offset {} partition len {})",
            part.name,
            buf.len(),
            offset,
            partlen
        );
        return Err(FastbootError::InvalidParameter);
    }
    disk.read_at(part.start_byte(disk.block_size()) + offset, buf)
}

/// Number of verity-tree blocks at one level above `data_size` bytes.
fn verity_tree_blocks(data_size: u64, level: u32) -> u64 {
    let mut blocks = data_size.div_ceil(VERITY_BLOCK_SIZE);
    for _ in 0..=level {
        blocks = blocks.div_ceil(VERITY_HASHES_PER_BLOCK);
    }
    blocks
}

/// Total byte size of the Merkle tree over `data_size` bytes: levels are
/// stacked bottom-up until a single block remains.
pub fn verity_tree_size(data_size: u64) -> u64 {
    let mut verity_blocks = 0;
    let mut levels = 0;
    loop {
        let level_blocks = verity_tree_blocks(data_size, levels);
        levels += 1;
        verity_blocks += level_blocks;
        if level_blocks <= 1 {
            break;
        }
    }
    let tree_size = verity_blocks * VERITY_BLOCK_SIZE;
    debug!("verity tree size {tree_size}");
    tree_size
}

fn ext4_len(disk: &mut dyn BlockIo, part: &PartitionInfo) -> Result<u64> {
    let mut sb = [0u8; EXT4_SB_LEN];
    read_partition(disk, part, EXT4_SB_OFFSET, &mut sb)?;

    let magic = u16::from_le_bytes(sb[56..58].try_into().unwrap());
    let state = u16::from_le_bytes(sb[58..60].try_into().unwrap());
    if magic != EXT4_SUPER_MAGIC {
        return Err(FastbootError::Unsupported);
    }
    if state & EXT4_VALID_FS != EXT4_VALID_FS {
        debug!("Ext4 invalid FS [{state:02x}]");
        return Err(FastbootError::Unsupported);
    }

    let log_block_size = u32::from_le_bytes(sb[24..28].try_into().unwrap());
    let blocks_lo = u32::from_le_bytes(sb[4..8].try_into().unwrap()) as u64;
    let blocks_hi = u32::from_le_bytes(sb[336..340].try_into().unwrap()) as u64;
    let block_size = 1024u64 << log_block_size;
    Ok(block_size * ((blocks_hi << 32) | blocks_lo))
}

fn squashfs_len(disk: &mut dyn BlockIo, part: &PartitionInfo) -> Result<u64> {
    let mut sb = [0u8; SQUASHFS_SB_LEN];
    read_partition(disk, part, 0, &mut sb)?;

    let magic = u32::from_le_bytes(sb[0..4].try_into().unwrap());
    if magic != SQUASHFS_MAGIC {
        return Err(FastbootError::Unsupported);
    }
    let bytes_used = u64::from_le_bytes(sb[40..48].try_into().unwrap());
    Ok(bytes_used.div_ceil(SQUASHFS_PADDING) * SQUASHFS_PADDING)
}

/// Look for a dm-verity header directly after the filesystem; when
/// present, return the extra bytes (tree plus metadata) to hash.
fn verity_extension(disk: &mut dyn BlockIo, part: &PartitionInfo, fs_len: u64) -> Result<u64> {
    let mut header = [0u8; 8];
    if read_partition(disk, part, fs_len, &mut header).is_err() {
        debug!("no room for a verity header");
        return Ok(0);
    }
    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != VERITY_MAGIC {
        debug!("verity magic not found");
        return Ok(0);
    }
    let protocol_version = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if protocol_version != 0 {
        debug!("verity protocol version unsupported {protocol_version}");
        return Err(FastbootError::Unsupported);
    }
    Ok(verity_tree_size(fs_len) + VERITY_METADATA_SIZE)
}

/// Stream `len` partition bytes through the digest in 1 MiB chunks.
fn hash_range(
    disk: &mut dyn BlockIo,
    part: &PartitionInfo,
    len: u64,
    algorithm: HashAlgorithm,
) -> Result<String> {
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; HASH_CHUNK];
    let mut offset = 0;
    while offset < len {
        let chunk = ((len - offset) as usize).min(HASH_CHUNK);
        read_partition(disk, part, offset, &mut buffer[..chunk])?;
        hasher.update(&buffer[..chunk]);
        offset += chunk as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash the filesystem on `label`, with verity accounting.
pub fn filesystem_hash(
    device: &mut Device,
    label: &str,
    algorithm: HashAlgorithm,
) -> Result<HashReport> {
    let part = device.gpt.find_partition(label, LogicalUnit::User)?;
    let disk = device.gpt.disk(LogicalUnit::User);

    let fs_len = match ext4_len(disk, &part) {
        Ok(len) => {
            debug!("Ext4 filesystem found");
            len
        }
        Err(_) => match squashfs_len(disk, &part) {
            Ok(len) => {
                debug!("SquashFS filesystem found");
                len
            }
            Err(_) => {
                error!("{label} partition does not contain a supported filesystem");
                return Err(FastbootError::Unsupported);
            }
        },
    };

    let total = fs_len + verity_extension(disk, &part, fs_len)?;
    debug!("filesystem size {total}");
    if total > part.size_bytes(disk.block_size()) {
        return Err(FastbootError::InvalidParameter);
    }

    Ok(HashReport {
        target: format!("/{}", part.name),
        hex: hash_range(disk, &part, total, algorithm)?,
    })
}

/// Hash the boot image on `label`, including its trailing signature.
pub fn boot_image_hash(
    device: &mut Device,
    label: &str,
    algorithm: HashAlgorithm,
) -> Result<HashReport> {
    let part = device.gpt.find_partition(label, LogicalUnit::User)?;
    let disk = device.gpt.disk(LogicalUnit::User);
    let partlen = part.size_bytes(disk.block_size());
    if partlen > MAX_BOOT_PARTITION {
        error!("partition too large to contain a boot image");
        return Err(FastbootError::InvalidParameter);
    }

    let mut data = vec![0u8; partlen as usize];
    read_partition(disk, &part, 0, &mut data)?;

    let header = BootImgHeader::parse(&data).map_err(|err| {
        error!("bad boot magic");
        err
    })?;
    let mut len = header.image_size() as usize;
    if len > data.len() {
        error!("boot image too big");
        return Err(FastbootError::InvalidParameter);
    }

    let window = &data[len..data.len().min(len + BOOT_SIGNATURE_MAX_SIZE)];
    match parse_boot_signature(window) {
        Ok(sig) => len += sig.total_size,
        Err(_) => debug!("boot image doesn't seem to have a signature"),
    }
    debug!("total boot image size {len}");

    let mut hasher = algorithm.hasher();
    hasher.update(&data[..len]);
    Ok(HashReport {
        target: format!("/{}", part.name),
        hex: hex::encode(hasher.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LINUX_DATA_GUID;
    use crate::testutil::{
        build_boot_image, ext4_superblock, squashfs_superblock, test_device_with_parts,
    };
    use sha1::{Digest, Sha1};

    fn part(name: &str, first: u64, last: u64) -> PartitionInfo {
        PartitionInfo {
            name: name.into(),
            type_guid: LINUX_DATA_GUID,
            unique_guid: uuid::Uuid::nil(),
            first_lba: first,
            last_lba: last,
            attributes: 0,
        }
    }

    #[test]
    fn test_verity_tree_size_known_values() {
        // 64 MiB: 16384 data blocks -> 128 level-0 blocks + 1 root block
        assert_eq!(verity_tree_size(64 * 1024 * 1024), 129 * 4096);
        // tiny filesystem still costs one block
        assert_eq!(verity_tree_size(4096), 4096);
    }

    #[test]
    fn test_ext4_hash_without_verity() {
        let mut device = test_device_with_parts(vec![part("system", 0, 127)]);
        // 8 blocks of 1 KiB
        let sb = ext4_superblock(0, 8);
        device.gpt.disk(LogicalUnit::User).write_at(1024, &sb).unwrap();

        let report = filesystem_hash(&mut device, "system", HashAlgorithm::Sha1).unwrap();
        assert_eq!(report.target, "/system");

        let disk = device.gpt.disk(LogicalUnit::User);
        let mut raw = vec![0u8; 8192];
        disk.read_at(0, &mut raw).unwrap();
        assert_eq!(report.hex, hex::encode(Sha1::digest(&raw)));
    }

    #[test]
    fn test_verity_header_extends_range() {
        // partition of 128 KiB; fs is 8 KiB, verity adds 4 KiB tree + 32 KiB metadata
        let mut device = test_device_with_parts(vec![part("system", 0, 255)]);
        {
            let disk = device.gpt.disk(LogicalUnit::User);
            let fill: Vec<u8> = (0..256 * 512u32).map(|i| (i % 251) as u8).collect();
            disk.write_at(0, &fill).unwrap();
            disk.write_at(1024, &ext4_superblock(0, 8)).unwrap();
            let mut verity = 0xB001_B001u32.to_le_bytes().to_vec();
            verity.extend_from_slice(&0u32.to_le_bytes());
            disk.write_at(8192, &verity).unwrap();
        }

        let report = filesystem_hash(&mut device, "system", HashAlgorithm::Sha1).unwrap();

        let expected_len = 8192 + 4096 + 32768;
        let disk = device.gpt.disk(LogicalUnit::User);
        let mut raw = vec![0u8; expected_len];
        disk.read_at(0, &mut raw).unwrap();
        assert_eq!(report.hex, hex::encode(Sha1::digest(&raw)));
    }

    #[test]
    fn test_verity_bad_protocol_version_fails() {
        let mut device = test_device_with_parts(vec![part("system", 0, 255)]);
        let disk = device.gpt.disk(LogicalUnit::User);
        disk.write_at(1024, &ext4_superblock(0, 8)).unwrap();
        let mut verity = 0xB001_B001u32.to_le_bytes().to_vec();
        verity.extend_from_slice(&7u32.to_le_bytes());
        disk.write_at(8192, &verity).unwrap();

        assert!(filesystem_hash(&mut device, "system", HashAlgorithm::Sha1).is_err());
    }

    #[test]
    fn test_squashfs_len_pads_to_4k() {
        let mut device = test_device_with_parts(vec![part("system", 0, 127)]);
        device
            .gpt
            .disk(LogicalUnit::User)
            .write_at(0, &squashfs_superblock(5000))
            .unwrap();

        let report = filesystem_hash(&mut device, "system", HashAlgorithm::Md5).unwrap();

        let disk = device.gpt.disk(LogicalUnit::User);
        let mut raw = vec![0u8; 8192];
        disk.read_at(0, &mut raw).unwrap();
        assert_eq!(report.hex, hex::encode(md5::Md5::digest(&raw)));
    }

    #[test]
    fn test_unknown_filesystem_rejected() {
        let mut device = test_device_with_parts(vec![part("system", 0, 127)]);
        assert!(filesystem_hash(&mut device, "system", HashAlgorithm::Sha1).is_err());
    }

    #[test]
    fn test_hash_is_deterministic() {
        let mut device = test_device_with_parts(vec![part("system", 0, 127)]);
        device
            .gpt
            .disk(LogicalUnit::User)
            .write_at(1024, &ext4_superblock(0, 8))
            .unwrap();

        let first = filesystem_hash(&mut device, "system", HashAlgorithm::Sha1).unwrap();
        let second = filesystem_hash(&mut device, "system", HashAlgorithm::Sha1).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_boot_image_hash_covers_image_bytes() {
        let image = build_boot_image(2048, &[0xAA; 1000], &[0xBB; 100], &[]);
        let mut device = test_device_with_parts(vec![part("boot", 0, 63)]);
        device
            .gpt
            .disk(LogicalUnit::User)
            .write_at(0, &image)
            .unwrap();

        let report = boot_image_hash(&mut device, "boot", HashAlgorithm::Sha1).unwrap();
        assert_eq!(report.target, "/boot");
        assert_eq!(report.hex, hex::encode(Sha1::digest(&image)));

        // blank partition has no boot magic
        let mut blank = test_device_with_parts(vec![part("boot", 0, 63)]);
        assert!(boot_image_hash(&mut blank, "boot", HashAlgorithm::Sha1).is_err());
    }

    #[test]
    fn test_hash_algorithm_names() {
        assert_eq!(HashAlgorithm::from_name("sha1"), Some(HashAlgorithm::Sha1));
        assert_eq!(HashAlgorithm::from_name("md5"), Some(HashAlgorithm::Md5));
        assert_eq!(HashAlgorithm::from_name("crc32"), None);
    }
}
