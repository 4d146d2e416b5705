//! File-backed collaborators for `forged`
//!
//! The daemon runs the protocol core against plain files: a disk image
//! for block I/O, a directory for the ESP, a JSON file for firmware NV
//! variables, and a TCP listener as the bulk transport.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::DeviceProfile;
use crate::device::{
    BlockIo, BootTarget, Device, EspFilesystem, Firmware, GptService, LogicalUnit, PartitionInfo,
    RecvStatus, Transport, UiEventSource,
};
use crate::error::{FastbootError, Result};

const RECV_TIMEOUT: Duration = Duration::from_millis(500);

fn flash_err(err: std::io::Error) -> FastbootError {
    FastbootError::Flash(err.to_string())
}

/// A disk image file exposed as LBA-addressed block storage.
pub struct FileDisk {
    file: File,
    block_size: u64,
    blocks: u64,
}

impl FileDisk {
    /// Open or create the image, sized to `blocks * block_size`.
    pub fn open(path: &Path, block_size: u64, blocks: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = block_size * blocks;
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        Ok(Self {
            file,
            block_size,
            blocks,
        })
    }
}

impl BlockIo for FileDisk {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.blocks
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.block_size * self.blocks {
            return Err(FastbootError::InvalidParameter);
        }
        self.file.seek(SeekFrom::Start(offset)).map_err(flash_err)?;
        self.file.read_exact(buf).map_err(flash_err)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.block_size * self.blocks {
            return Err(FastbootError::InvalidParameter);
        }
        self.file.seek(SeekFrom::Start(offset)).map_err(flash_err)?;
        self.file.write_all(data).map_err(flash_err)
    }
}

/// GPT service backed by the device profile's partition table.
pub struct ProfileGpt {
    user: FileDisk,
    factory: FileDisk,
    parts: Vec<PartitionInfo>,
}

impl ProfileGpt {
    pub fn open(profile: &DeviceProfile, image: &Path) -> Result<Self> {
        let factory_path = image.with_extension("factory.img");
        Ok(Self {
            user: FileDisk::open(image, profile.block_size, profile.disk_blocks)?,
            factory: FileDisk::open(&factory_path, profile.block_size, 2_048)?,
            parts: profile.partition_table(),
        })
    }
}

impl GptService for ProfileGpt {
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
        start_lba: u64,
        partitions: Vec<PartitionInfo>,
        unit: LogicalUnit,
    ) -> Result<()> {
        info!(
            "rewriting {unit:?} partition table: {} entries from LBA {start_lba}",
            partitions.len()
        );
        if unit == LogicalUnit::User {
            self.parts = partitions;
        }
        Ok(())
    }

    fn refresh(&mut self) -> Result<()> {
        debug!("partition table refresh requested");
        Ok(())
    }

    fn disk(&mut self, unit: LogicalUnit) -> &mut dyn BlockIo {
        match unit {
            LogicalUnit::User => &mut self.user,
            LogicalUnit::Factory => &mut self.factory,
        }
    }
}

/// ESP filesystem as a host directory.
pub struct DirEsp {
    root: PathBuf,
}

impl DirEsp {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl EspFilesystem for DirEsp {
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|part| part == "..") {
            return Err(FastbootError::InvalidParameter);
        }
        let target = self.root.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, data)?;
        info!("wrote {} bytes to {}", data.len(), target.display());
        Ok(())
    }
}

/// Firmware NV storage persisted as a JSON map of hex strings.
pub struct JsonFirmware {
    path: PathBuf,
    vars: HashMap<String, String>,
}

impl JsonFirmware {
    pub fn open(path: PathBuf) -> Result<Self> {
        let vars = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|err| FastbootError::Flash(format!("corrupt NV store: {err}")))?,
            Err(err) if err.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, vars })
    }

    fn persist(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.vars)
            .map_err(|err| FastbootError::Flash(err.to_string()))?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl Firmware for JsonFirmware {
    fn nv_get(&mut self, name: &str) -> Option<Vec<u8>> {
        self.vars.get(name).and_then(|value| hex::decode(value).ok())
    }

    fn nv_set(&mut self, name: &str, value: &[u8]) -> Result<()> {
        self.vars.insert(name.to_string(), hex::encode(value));
        self.persist()
    }

    fn disable_watchdog(&mut self) -> Result<()> {
        Ok(())
    }
}

/// fastboot-over-TCP transport: one host connection at a time.
pub struct TcpTransport {
    listener: TcpListener,
    conn: Option<TcpStream>,
}

impl TcpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!("listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            conn: None,
        })
    }

    fn connection(&mut self) -> Result<&mut TcpStream> {
        if self.conn.is_none() {
            let (stream, peer) = self
                .listener
                .accept()
                .map_err(|err| FastbootError::Transport(err.to_string()))?;
            info!("host connected from {peer}");
            stream
                .set_read_timeout(Some(RECV_TIMEOUT))
                .map_err(|err| FastbootError::Transport(err.to_string()))?;
            self.conn = Some(stream);
        }
        Ok(self.conn.as_mut().unwrap())
    }
}

impl Transport for TcpTransport {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<RecvStatus> {
        let conn = self.connection()?;
        match conn.read(buf) {
            Ok(0) => Err(FastbootError::Transport("host disconnected".into())),
            Ok(len) => Ok(RecvStatus::Received(len)),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(RecvStatus::Timeout)
            }
            Err(err) => Err(FastbootError::Transport(err.to_string())),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        let conn = self.connection()?;
        conn.write_all(data)
            .map_err(|err| FastbootError::Transport(err.to_string()))
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// Headless event source; the daemon has no boot menu.
pub struct NoUi;

impl UiEventSource for NoUi {
    fn poll_target(&mut self) -> Option<BootTarget> {
        None
    }
}

/// Assemble the device collaborators for one daemon session.
pub fn open_device(
    profile: &DeviceProfile,
    image: &Path,
    esp_dir: &Path,
    nv_path: &Path,
) -> Result<Device> {
    if profile.partitions.is_empty() {
        warn!("device profile has no partitions; only special labels will flash");
    }
    Ok(Device {
        gpt: Box::new(ProfileGpt::open(profile, image)?),
        esp: Box::new(DirEsp::new(esp_dir.to_path_buf())),
        firmware: Box::new(JsonFirmware::open(nv_path.to_path_buf())?),
    })
}
