//! Device collaborator interfaces
//!
//! The protocol core never touches hardware directly. Everything the
//! firmware environment provides — the bulk transport, the partitioned
//! disks, the EFI system partition filesystem, non-volatile variable
//! storage, the boot-menu event source — is injected behind the traits in
//! this module, so the same core runs under a USB device controller in the
//! bootloader and against plain files in `forged`.

use uuid::{uuid, Uuid};

use crate::error::{FastbootError, Result};

/// GPT partition type of a Linux data filesystem, reported as `ext4`.
pub const LINUX_DATA_GUID: Uuid = uuid!("0fc63daf-8483-4772-8e79-3d69d8477de4");

/// GPT partition type of the EFI system partition, reported as `vfat`.
pub const ESP_GUID: Uuid = uuid!("c12a7328-f81f-11d2-ba4b-00a0c93ec93b");

/// NV variable holding the one-byte lock state (0 locked, 1 unlocked).
pub const OEM_LOCK_VAR: &str = "OEMLock";

/// NV variable gating `flashing unlock` (absent or 1 means allowed).
pub const UNLOCK_ABILITY_VAR: &str = "UnlockAbility";

/// NV variable holding the off-mode-charge flag.
pub const OFF_MODE_CHARGE_VAR: &str = "OffModeCharge";

/// Device authorization state; orders as `Locked < Unlocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockState {
    Locked,
    Unlocked,
}

impl LockState {
    pub fn as_str(self) -> &'static str {
        match self {
            LockState::Locked => "locked",
            LockState::Unlocked => "unlocked",
        }
    }
}

/// Where the bootloader should go once the fastboot session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootTarget {
    Unknown,
    Normal,
    Recovery,
    Fastboot,
}

/// Logical unit of a multi-LUN storage device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalUnit {
    User,
    Factory,
}

/// Image handed back to the caller when the session stops.
#[derive(Debug, Clone)]
pub enum HandoffImage {
    /// Android boot image received via `download` + `boot`
    Boot(Vec<u8>),
    /// EFI executable to chain-load
    Efi(Vec<u8>),
}

/// One GPT partition as resolved by the GPT service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub name: String,
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
}

impl PartitionInfo {
    /// Byte offset of the first partition byte on disk.
    pub fn start_byte(&self, block_size: u64) -> u64 {
        self.first_lba * block_size
    }

    /// Byte offset one past the last partition byte on disk.
    pub fn end_byte(&self, block_size: u64) -> u64 {
        (self.last_lba + 1) * block_size
    }

    pub fn size_bytes(&self, block_size: u64) -> u64 {
        self.end_byte(block_size) - self.start_byte(block_size)
    }
}

/// Raw LBA-addressed disk access.
pub trait BlockIo {
    fn block_size(&self) -> u64;

    fn total_blocks(&self) -> u64;

    /// Read `buf.len()` bytes at an absolute byte offset.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at an absolute byte offset.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Hardware block erase of an inclusive LBA range. Implementations
    /// without erase support return `Unsupported`; callers fall back to
    /// zero-filling.
    fn erase_blocks(&mut self, first_lba: u64, last_lba: u64) -> Result<()> {
        let _ = (first_lba, last_lba);
        Err(FastbootError::Unsupported)
    }
}

/// Partition table access for one or more logical units.
pub trait GptService {
    /// Enumerate the partitions of a logical unit.
    fn list_partitions(&mut self, unit: LogicalUnit) -> Result<Vec<PartitionInfo>>;

    /// Resolve a partition by label. `NotFound` if absent.
    fn find_partition(&mut self, label: &str, unit: LogicalUnit) -> Result<PartitionInfo>;

    /// Rewrite the partition table of a logical unit.
    fn create(
        &mut self,
        start_lba: u64,
        partitions: Vec<PartitionInfo>,
        unit: LogicalUnit,
    ) -> Result<()>;

    /// Re-read the table after on-disk contents changed.
    fn refresh(&mut self) -> Result<()>;

    /// Flush any cached table state to disk.
    fn sync(&mut self) {}

    /// The disk backing a logical unit.
    fn disk(&mut self, unit: LogicalUnit) -> &mut dyn BlockIo;
}

/// The EFI system partition filesystem, write-only by file name.
pub trait EspFilesystem {
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()>;
}

/// Firmware services: NV variable storage, watchdog, battery gauge.
pub trait Firmware {
    /// Read a non-volatile variable.
    fn nv_get(&mut self, name: &str) -> Option<Vec<u8>>;

    /// Write a non-volatile variable.
    fn nv_set(&mut self, name: &str, value: &[u8]) -> Result<()>;

    /// Disable the firmware watchdog. Best effort; `Unsupported` is
    /// tolerated by callers.
    fn disable_watchdog(&mut self) -> Result<()> {
        Err(FastbootError::Unsupported)
    }

    /// Current battery voltage in millivolts, if the platform has a gauge.
    fn battery_voltage_mv(&mut self) -> Option<u32> {
        None
    }
}

/// Boot-menu / key-press event source polled by the main loop.
pub trait UiEventSource {
    /// A user-selected boot target, if any.
    fn poll_target(&mut self) -> Option<BootTarget>;
}

/// Outcome of one blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// `n` bytes landed in the caller's buffer.
    Received(usize),
    /// No progress; the caller polls other event sources and retries.
    Timeout,
}

/// Byte-level bulk transport to the host.
///
/// `recv` into the state-selected buffer stands for the firmware
/// transport's posted read plus its rx completion; a returned `send` is
/// the tx completion. Both block; a disconnect surfaces as
/// [`FastbootError::Transport`] and ends the session.
pub trait Transport {
    fn open(&mut self) -> Result<()>;

    fn recv(&mut self, buf: &mut [u8]) -> Result<RecvStatus>;

    fn send(&mut self, data: &[u8]) -> Result<()>;

    fn close(&mut self);
}

/// The collaborators a session operates on.
pub struct Device {
    pub gpt: Box<dyn GptService>,
    pub esp: Box<dyn EspFilesystem>,
    pub firmware: Box<dyn Firmware>,
}

impl Device {
    /// Current lock state from NV storage; missing or garbage reads as
    /// locked.
    pub fn lock_state(&mut self) -> LockState {
        match self.firmware.nv_get(OEM_LOCK_VAR).as_deref() {
            Some([1]) => LockState::Unlocked,
            _ => LockState::Locked,
        }
    }

    pub fn set_lock_state(&mut self, state: LockState) -> Result<()> {
        let byte = match state {
            LockState::Locked => 0u8,
            LockState::Unlocked => 1u8,
        };
        self.firmware.nv_set(OEM_LOCK_VAR, &[byte])
    }

    /// Whether the OEM allows `flashing unlock` on this device.
    pub fn unlock_ability(&mut self) -> bool {
        !matches!(self.firmware.nv_get(UNLOCK_ABILITY_VAR).as_deref(), Some([0]))
    }
}
