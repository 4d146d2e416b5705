//! Fastboot session: protocol state machine and command handlers
//!
//! One `Session` owns everything a host interaction touches: the variable
//! and command registries, the download buffer, the reply queue, and the
//! protocol state pair (`state`, `next_state`). The main loop polls the
//! boot-menu event source and the transport until the host issues a
//! reboot-class command or the user picks a boot target.

use std::collections::VecDeque;

use tracing::{debug, error, info, warn};

use crate::commands::{builtin_registry, CmdKind, CommandRegistry, CommandSpec};
use crate::device::{
    BootTarget, Device, HandoffImage, LockState, LogicalUnit, RecvStatus, Transport,
    UiEventSource, ESP_GUID, LINUX_DATA_GUID,
};
use crate::error::{FastbootError, Result};
use crate::flash::{self, Policy, ACTION_AUTHORIZATION};
use crate::hashes::{self, HashAlgorithm};
use crate::protocol::{data_reply, split_command, ReplyCode, ReplyFrame, MAGIC_LENGTH};
use crate::security::is_efi_secure_boot_enabled;
use crate::vars::{VarGetter, VarStore};

/// Default cap on `download` requests.
pub const DEFAULT_MAX_DOWNLOAD_SIZE: usize = 0x1000_0000;

const DATA_PROGRESS_THRESHOLD: usize = 5 * 1024 * 1024;

/// Protocol state. `next_state` latches where the machine goes once the
/// current transmission completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Offline,
    Complete,
    Command,
    StartDownload,
    Download,
    Tx,
    Stopping,
    Stopped,
    Error,
}

/// Static session parameters supplied by the embedder.
pub struct SessionConfig {
    pub product: String,
    pub variant: Option<String>,
    pub bootloader_version: String,
    pub max_download_size: usize,
    /// Enables the `/ESP/`, `mbr`, and `efirun` labels (engineering
    /// builds only).
    pub allow_debug_labels: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            product: "forge".to_string(),
            variant: None,
            bootloader_version: env!("CARGO_PKG_VERSION").to_string(),
            max_download_size: DEFAULT_MAX_DOWNLOAD_SIZE,
            allow_debug_labels: false,
        }
    }
}

/// How the session ended and what to boot next.
#[derive(Debug)]
pub struct Outcome {
    pub target: BootTarget,
    pub image: Option<HandoffImage>,
}

pub struct Session {
    config: SessionConfig,
    device: Device,
    policy: Option<Policy>,
    vars: VarStore,
    commands: CommandRegistry,

    state: SessionState,
    next_state: SessionState,
    tx_queue: VecDeque<ReplyFrame>,
    command_line: String,

    dlbuffer: Vec<u8>,
    dlsize: usize,
    received: usize,
    last_received: usize,

    stop_target: BootTarget,
    stop_image: Option<HandoffImage>,
    transport_error: Option<String>,
}

impl Session {
    pub fn new(config: SessionConfig, device: Device) -> Self {
        Self {
            config,
            device,
            policy: None,
            vars: VarStore::new(),
            commands: builtin_registry(),
            state: SessionState::Offline,
            next_state: SessionState::Complete,
            tx_queue: VecDeque::new(),
            command_line: String::new(),
            dlbuffer: Vec::new(),
            dlsize: 0,
            received: 0,
            last_received: 0,
            stop_target: BootTarget::Unknown,
            stop_image: None,
            transport_error: None,
        }
    }

    /// Enable signed-policy handling; registers `authorization` in the
    /// locked-flash whitelist.
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    /// Publish a static variable.
    pub fn publish(&mut self, name: &str, value: &str) -> Result<()> {
        self.vars.publish(name, value)
    }

    /// Publish a dynamic variable.
    pub fn publish_dynamic(&mut self, name: &str, getter: VarGetter) -> Result<()> {
        self.vars.publish_dynamic(name, getter)
    }

    /// Register an additional command before the session runs.
    pub fn register_command(&mut self, spec: CommandSpec) {
        self.commands.register(spec);
    }

    /// Run the session until the host or the user ends it.
    pub fn run(
        &mut self,
        transport: &mut dyn Transport,
        ui: &mut dyn UiEventSource,
    ) -> Result<Outcome> {
        self.stop_target = BootTarget::Unknown;
        self.stop_image = None;
        self.transport_error = None;

        if let Err(err) = self.init() {
            error!("Fastboot library initialization failed");
            self.teardown();
            return Err(err);
        }

        if let Err(err) = transport.open() {
            error!("Failed to initialize transport layer: {err}");
            self.teardown();
            return Err(err);
        }
        self.state = self.next_state;

        let mut ui_target = None;
        loop {
            if let Some(target) = ui.poll_target() {
                ui_target = Some(target);
                break;
            }

            match self.state {
                SessionState::Offline => self.state = self.next_state,
                SessionState::Complete => self.read_command(transport),
                SessionState::Command => self.run_pending_command(transport),
                SessionState::StartDownload => {
                    self.received = 0;
                    self.last_received = 0;
                    self.state = SessionState::Download;
                }
                SessionState::Download => self.read_download(transport),
                SessionState::Tx => self.flush_tx(transport),
                SessionState::Stopping => self.state = SessionState::Stopped,
                SessionState::Stopped => break,
                SessionState::Error => break,
            }
        }

        transport.close();

        if let Some(message) = self.transport_error.take() {
            self.teardown();
            return Err(FastbootError::Transport(message));
        }

        let target = if self.stop_target != BootTarget::Unknown {
            self.stop_target
        } else {
            ui_target.unwrap_or(BootTarget::Unknown)
        };
        let outcome = Outcome {
            target,
            image: self.stop_image.take(),
        };
        self.teardown();
        Ok(outcome)
    }

    /// Schedule the end of the session, optionally carrying an image to
    /// the caller.
    pub fn stop(&mut self, image: Option<HandoffImage>, target: BootTarget) {
        self.stop_target = target;
        self.stop_image = image;
        if self.state == SessionState::Complete {
            self.state = SessionState::Stopped;
        } else {
            self.next_state = SessionState::Stopping;
        }
    }

    // ------------------------------------------------------------------
    // Initialization and teardown

    fn init(&mut self) -> Result<()> {
        if let Err(err) = self.device.firmware.disable_watchdog() {
            if !matches!(err, FastbootError::Unsupported) {
                warn!("Couldn't disable watchdog timer: {err}");
            }
        }

        if self.commands.is_empty() {
            self.commands = builtin_registry();
        }

        let product = self.config.product.clone();
        self.publish("product", &product)?;
        if let Some(variant) = self.config.variant.clone() {
            self.publish("variant", &variant)?;
        }
        let version = self.config.bootloader_version.clone();
        self.publish("version-bootloader", &version)?;
        self.publish("max-download-size", &format!("0x{:X}", self.config.max_download_size))?;

        self.publish_dynamic(
            "battery-voltage",
            Box::new(|device| device.firmware.battery_voltage_mv().map(|mv| format!("{mv}mV"))),
        )?;
        self.publish_dynamic(
            "unlocked",
            Box::new(|device| {
                Some(if device.lock_state() == LockState::Unlocked { "yes" } else { "no" }.into())
            }),
        )?;
        self.publish_dynamic(
            "secure",
            Box::new(|device| {
                Some(if is_efi_secure_boot_enabled(device.firmware.as_mut()) { "yes" } else { "no" }.into())
            }),
        )?;

        self.publish_partition_vars()?;

        self.state = SessionState::Offline;
        self.next_state = SessionState::Complete;
        Ok(())
    }

    /// Undo everything `init` built; also called on init failure to
    /// unwind partial state.
    fn teardown(&mut self) {
        self.dlbuffer = Vec::new();
        self.dlsize = 0;
        self.received = 0;
        self.tx_queue.clear();
        self.vars.clear();
        self.commands.clear();
        self.state = SessionState::Offline;
        self.next_state = SessionState::Complete;
    }

    fn publish_partition_vars(&mut self) -> Result<()> {
        let partitions = match self.device.gpt.list_partitions(LogicalUnit::User) {
            Ok(partitions) => partitions,
            Err(_) => return Ok(()),
        };

        let block_size = self.device.gpt.disk(LogicalUnit::User).block_size();
        for part in partitions {
            let size = part.size_bytes(block_size);
            let ptype = if part.type_guid == LINUX_DATA_GUID {
                "ext4"
            } else if part.type_guid == ESP_GUID {
                "vfat"
            } else {
                "none"
            };

            self.publish_one_partition(&part.name, size, ptype)?;
            // stay compatible with userdata/data naming
            if part.name == "data" {
                self.publish_one_partition("userdata", size, ptype)?;
            } else if part.name == "userdata" {
                self.publish_one_partition("data", size, ptype)?;
            }
        }
        Ok(())
    }

    fn publish_one_partition(&mut self, name: &str, size: u64, ptype: &str) -> Result<()> {
        self.publish(&format!("partition-size:{name}"), &format!("0x{size:X}"))?;
        self.publish(&format!("partition-type:{name}"), ptype)?;
        self.publish(&format!("has-slot:{name}"), "no")
    }

    fn refresh_partition_vars(&mut self) -> Result<()> {
        self.vars.clean_partition_vars();
        self.publish_partition_vars()
    }

    // ------------------------------------------------------------------
    // Replies

    fn transport_failed(&mut self, message: String) {
        error!("transport failure: {message}");
        self.transport_error = Some(message);
        self.state = SessionState::Error;
    }

    fn send_raw(&mut self, transport: &mut dyn Transport, bytes: &[u8]) {
        if let Err(err) = transport.send(bytes) {
            self.transport_failed(err.to_string());
        }
    }

    fn ack(&mut self, transport: &mut dyn Transport, code: ReplyCode, message: &str) {
        let frame = ReplyFrame::new(code, message);
        debug!("SENT {}", frame.display());
        self.state = self.next_state;
        self.send_raw(transport, frame.as_bytes());
    }

    fn ack_buffered(&mut self, code: ReplyCode, message: &str) {
        self.tx_queue.push_back(ReplyFrame::new(code, message));
        self.state = SessionState::Tx;
    }

    /// Queue an `INFO` reply; always buffered so ordering before the
    /// terminal reply is structural.
    fn reply_info(&mut self, message: &str) {
        self.ack_buffered(ReplyCode::Info, message);
    }

    fn reply_okay(&mut self, transport: &mut dyn Transport, message: &str) {
        if self.state == SessionState::Tx {
            self.ack_buffered(ReplyCode::Okay, message);
        } else {
            self.ack(transport, ReplyCode::Okay, message);
        }
    }

    fn reply_fail(&mut self, transport: &mut dyn Transport, message: &str) {
        if self.state == SessionState::Tx {
            self.ack_buffered(ReplyCode::Fail, message);
        } else {
            self.ack(transport, ReplyCode::Fail, message);
        }
    }

    fn flush_tx(&mut self, transport: &mut dyn Transport) {
        while self.state == SessionState::Tx {
            let Some(frame) = self.tx_queue.pop_front() else {
                self.state = self.next_state;
                break;
            };
            if self.tx_queue.is_empty() {
                self.state = self.next_state;
            }
            self.send_raw(transport, frame.as_bytes());
            if self.transport_error.is_some() {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Receive paths

    fn read_command(&mut self, transport: &mut dyn Transport) {
        let mut buffer = [0u8; MAGIC_LENGTH];
        match transport.recv(&mut buffer) {
            Ok(RecvStatus::Received(len)) => {
                if len == 0 || len >= MAGIC_LENGTH {
                    self.reply_fail(transport, "Inappropriate command buffer or length");
                    return;
                }
                let line = String::from_utf8_lossy(&buffer[..len])
                    .trim_end_matches('\0')
                    .to_string();
                debug!("GOT {line}");
                self.command_line = line;
                self.state = SessionState::Command;
            }
            Ok(RecvStatus::Timeout) => {}
            Err(err) => self.transport_failed(err.to_string()),
        }
    }

    fn read_download(&mut self, transport: &mut dyn Transport) {
        let status = transport.recv(&mut self.dlbuffer[self.received..self.dlsize]);
        match status {
            Ok(RecvStatus::Received(len)) => {
                self.received += len;
                if self.received / DATA_PROGRESS_THRESHOLD
                    > self.last_received / DATA_PROGRESS_THRESHOLD
                {
                    debug!(
                        "RX {} MiB / {} MiB",
                        self.received / (1024 * 1024),
                        self.dlsize / (1024 * 1024)
                    );
                }
                self.last_received = self.received;
                if self.received >= self.dlsize {
                    self.state = SessionState::Command;
                    self.reply_okay(transport, "");
                }
            }
            Ok(RecvStatus::Timeout) => {}
            Err(err) => self.transport_failed(err.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Dispatch

    fn run_pending_command(&mut self, transport: &mut dyn Transport) {
        if self.state != SessionState::Command {
            return;
        }

        let line = std::mem::take(&mut self.command_line);
        match split_command(&line) {
            Ok(args) => self.dispatch_root(transport, &args),
            Err(err) => {
                error!("Failed to split fastboot command line");
                self.reply_fail(transport, &err.to_string());
            }
        }
        self.received = 0;
        self.last_received = 0;

        if self.state == SessionState::Tx {
            self.flush_tx(transport);
        }
    }

    fn dispatch_root(&mut self, transport: &mut dyn Transport, args: &[&str]) {
        let Some((min_state, kind)) = self
            .commands
            .find(args[0])
            .map(|spec| (spec.min_state, spec.kind.clone()))
        else {
            error!("unknown command '{}'", args[0]);
            self.reply_fail(transport, &FastbootError::UnknownCommand.to_string());
            return;
        };
        self.dispatch(transport, min_state, &kind, args);
    }

    fn dispatch(
        &mut self,
        transport: &mut dyn Transport,
        min_state: LockState,
        kind: &CmdKind,
        args: &[&str],
    ) {
        let current = self.device.lock_state();
        if min_state > current {
            self.reply_fail(
                transport,
                &FastbootError::NotAllowed(current.as_str()).to_string(),
            );
            return;
        }

        match kind {
            CmdKind::Group(group) => {
                if args.len() < 2 {
                    self.reply_fail(transport, "Invalid parameter");
                    return;
                }
                let Some((min_state, kind)) = group
                    .find(args[1])
                    .map(|spec| (spec.min_state, spec.kind.clone()))
                else {
                    error!("unknown command '{} {}'", args[0], args[1]);
                    self.reply_fail(transport, &FastbootError::UnknownCommand.to_string());
                    return;
                };
                self.dispatch(transport, min_state, &kind, &args[1..]);
            }
            CmdKind::Download => self.cmd_download(transport, args),
            CmdKind::Flash => self.cmd_flash(transport, args),
            CmdKind::Erase => self.cmd_erase(transport, args),
            CmdKind::Getvar => self.cmd_getvar(transport, args),
            CmdKind::Boot => self.cmd_boot(transport),
            CmdKind::Continue => self.reboot(transport, BootTarget::Normal, "Continuing ..."),
            CmdKind::Reboot => self.reboot(transport, BootTarget::Normal, "Rebooting ..."),
            CmdKind::RebootBootloader => {
                self.reboot(transport, BootTarget::Fastboot, "Rebooting to bootloader ...")
            }
            CmdKind::FlashingLock => self.cmd_flashing_lock(transport),
            CmdKind::FlashingUnlock => self.cmd_flashing_unlock(transport),
            CmdKind::FlashingGetUnlockAbility => {
                let ability = self.device.unlock_ability();
                self.reply_info(&format!("{}", ability as u8));
                self.reply_okay(transport, "");
            }
            CmdKind::OemGetHashes => self.cmd_oem_get_hashes(transport, args),
            CmdKind::OemOffModeCharge => self.cmd_oem_off_mode_charge(transport, args),
        }
    }

    // ------------------------------------------------------------------
    // Handlers

    fn cmd_download(&mut self, transport: &mut dyn Transport, args: &[&str]) {
        if args.len() != 2 {
            self.reply_fail(transport, "Invalid parameter");
            return;
        }
        let size = usize::from_str_radix(args[1], 16).unwrap_or(0);

        info!("Receiving {size} bytes ...");
        if size == 0 {
            self.reply_fail(transport, "no data to download");
            return;
        }
        if size > self.config.max_download_size {
            self.reply_fail(transport, "data too large");
            return;
        }

        if size > self.dlbuffer.len() {
            self.dlbuffer = Vec::new();
            let mut grown = Vec::new();
            if grown.try_reserve_exact(size).is_err() {
                error!("Failed to allocate download buffer ({size:#x} bytes)");
                self.reply_fail(transport, "Memory allocation failure");
                self.dlsize = 0;
                return;
            }
            grown.resize(size, 0);
            self.dlbuffer = grown;
        }
        self.dlsize = size;

        self.state = SessionState::StartDownload;
        let reply = data_reply(size);
        self.send_raw(transport, &reply);
    }

    fn cmd_flash(&mut self, transport: &mut dyn Transport, args: &[&str]) {
        if args.len() != 2 {
            self.reply_fail(transport, "Invalid parameter");
            return;
        }
        let label = args[1];

        let current = self.device.lock_state();
        let whitelisted = self.policy.is_some() && label == ACTION_AUTHORIZATION;
        if current == LockState::Locked && !whitelisted {
            error!("Flash {label} is prohibited in {} state.", current.as_str());
            self.reply_fail(
                transport,
                &FastbootError::Prohibited(current.as_str()).to_string(),
            );
            return;
        }

        info!("Flashing {label} ...");
        let result = flash::flash(
            &mut self.device,
            self.policy.as_mut(),
            &self.dlbuffer[..self.dlsize],
            label,
            self.config.allow_debug_labels,
        );
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                self.reply_fail(transport, &format!("Flash failure: {err}"));
                return;
            }
        };

        self.device.gpt.sync();

        if result.refresh_partition_vars {
            if let Err(err) = self.refresh_partition_vars() {
                self.reply_fail(
                    transport,
                    &format!("Failed to publish partition variables, {err}"),
                );
                return;
            }
        }
        if let Some(image) = result.handoff {
            self.stop(Some(image), BootTarget::Unknown);
        }

        info!("Flash done.");
        self.reply_okay(transport, "");
    }

    fn cmd_erase(&mut self, transport: &mut dyn Transport, args: &[&str]) {
        if args.len() != 2 {
            self.reply_fail(transport, "Invalid parameter");
            return;
        }
        info!("Erasing {} ...", args[1]);
        if let Err(err) = flash::erase_by_label(&mut self.device, args[1]) {
            self.reply_fail(transport, &format!("Erase failure: {err}"));
            return;
        }
        info!("Erase done.");
        self.reply_okay(transport, "");
    }

    fn cmd_getvar(&mut self, transport: &mut dyn Transport, args: &[&str]) {
        if args.len() != 2 {
            self.reply_fail(transport, "Invalid parameter");
            return;
        }

        if args[1] == "all" {
            let names: Vec<String> = self.vars.names().map(str::to_string).collect();
            for name in names {
                let value = self.vars.value_of(&name, &mut self.device).unwrap_or_default();
                self.reply_info(&format!("{name}: {value}"));
            }
            self.reply_okay(transport, "");
            return;
        }

        let value = self.vars.value_of(args[1], &mut self.device).unwrap_or_default();
        self.reply_okay(transport, &value);
    }

    fn cmd_boot(&mut self, transport: &mut dyn Transport) {
        let image = (self.dlsize > 0)
            .then(|| HandoffImage::Boot(self.dlbuffer[..self.dlsize].to_vec()));
        self.stop(image, BootTarget::Unknown);
        info!("Booting received image ...");
        self.reply_okay(transport, "");
    }

    fn reboot(&mut self, transport: &mut dyn Transport, target: BootTarget, message: &str) {
        self.stop(None, target);
        info!("{message}");
        self.reply_okay(transport, "");
    }

    fn cmd_flashing_lock(&mut self, transport: &mut dyn Transport) {
        if self.device.lock_state() == LockState::Locked {
            self.reply_info("Device already locked");
            self.reply_okay(transport, "");
            return;
        }
        if let Err(err) = flash::wipe_userdata(&mut self.device) {
            self.reply_fail(transport, &format!("Failed to wipe user data: {err}"));
            return;
        }
        if let Err(err) = self.device.set_lock_state(LockState::Locked) {
            self.reply_fail(transport, &format!("Failed to change device state: {err}"));
            return;
        }
        info!("Device now locked");
        self.reply_info("Device now locked");
        self.reply_okay(transport, "");
    }

    fn cmd_flashing_unlock(&mut self, transport: &mut dyn Transport) {
        if self.device.lock_state() == LockState::Unlocked {
            self.reply_info("Device already unlocked");
            self.reply_okay(transport, "");
            return;
        }
        if !self.device.unlock_ability() {
            self.reply_fail(transport, "Unlocking device not allowed");
            return;
        }
        if let Err(err) = flash::wipe_userdata(&mut self.device) {
            self.reply_fail(transport, &format!("Failed to wipe user data: {err}"));
            return;
        }
        if let Err(err) = self.device.set_lock_state(LockState::Unlocked) {
            self.reply_fail(transport, &format!("Failed to change device state: {err}"));
            return;
        }
        info!("Device now unlocked");
        self.reply_info("Device now unlocked");
        self.reply_okay(transport, "");
    }

    fn cmd_oem_get_hashes(&mut self, transport: &mut dyn Transport, args: &[&str]) {
        let algorithm = match args.len() {
            1 => HashAlgorithm::default(),
            2 => match HashAlgorithm::from_name(args[1]) {
                Some(algorithm) => algorithm,
                None => {
                    self.reply_fail(transport, "Unsupported hash algorithm");
                    return;
                }
            },
            _ => {
                self.reply_fail(transport, "Invalid parameter");
                return;
            }
        };

        let reports = [
            hashes::boot_image_hash(&mut self.device, "boot", algorithm),
            hashes::boot_image_hash(&mut self.device, "recovery", algorithm),
            hashes::filesystem_hash(&mut self.device, "system", algorithm),
        ];
        for report in reports {
            match report {
                Ok(report) => {
                    self.reply_info(&format!("target: {}", report.target));
                    self.reply_info(&format!("hash: {}", report.hex));
                }
                Err(err) => debug!("hash target skipped: {err}"),
            }
        }
        self.reply_okay(transport, "");
    }

    fn cmd_oem_off_mode_charge(&mut self, transport: &mut dyn Transport, args: &[&str]) {
        if args.len() != 2 {
            self.reply_fail(transport, "Invalid parameter");
            return;
        }
        let value = match args[1] {
            "0" => 0u8,
            "1" => 1u8,
            _ => {
                self.reply_fail(transport, "Invalid parameter");
                return;
            }
        };
        if let Err(err) = self
            .device
            .firmware
            .nv_set(crate::device::OFF_MODE_CHARGE_VAR, &[value])
        {
            self.reply_fail(transport, &format!("Failed to persist setting: {err}"));
            return;
        }
        self.reply_okay(transport, "");
    }
}
