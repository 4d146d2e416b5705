//! Forged - fastboot device daemon
//!
//! Runs the Forge protocol core against a file-backed disk image over
//! TCP, so host tooling (`fastboot -s tcp:...`) can be exercised without
//! hardware. Reboot-to-bootloader starts a fresh session; any other boot
//! target ends the process.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use forge::config::DeviceProfile;
use forge::platform::{open_device, NoUi, TcpTransport};
use forge::security::{verify_boot_image, BootState};
use forge::{BootTarget, HandoffImage, LockState, Session};

#[derive(Parser)]
#[command(name = "forged")]
#[command(about = "Forge fastboot device daemon")]
struct Args {
    /// Device profile
    #[arg(long, default_value = "forged.yaml")]
    config: PathBuf,

    /// Disk image backing the USER logical unit
    #[arg(long, default_value = "forge-disk.img")]
    image: PathBuf,

    /// Directory standing in for the EFI system partition
    #[arg(long, default_value = "esp")]
    esp_dir: PathBuf,

    /// Firmware NV variable store
    #[arg(long, default_value = "forge-nv.json")]
    nv: PathBuf,

    /// Listen address for fastboot-over-TCP
    #[arg(long, default_value = "127.0.0.1:5554")]
    listen: String,

    /// Start with the device unlocked
    #[arg(long)]
    unlocked: bool,

    /// OEM certificate (DER) used to attest a `boot`-command image
    #[arg(long)]
    oem_cert: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting Forge fastboot daemon");

    let profile =
        DeviceProfile::load(&args.config).with_context(|| "failed to load device profile")?;
    let oem_cert = args
        .oem_cert
        .as_ref()
        .map(std::fs::read)
        .transpose()
        .with_context(|| "failed to read OEM certificate")?;

    let mut transport =
        TcpTransport::bind(args.listen.as_str()).with_context(|| "failed to bind listener")?;

    loop {
        let device = open_device(&profile, &args.image, &args.esp_dir, &args.nv)
            .with_context(|| "failed to open device backends")?;
        let mut session = Session::new(profile.session_config(), device);
        if args.unlocked {
            session
                .device_mut()
                .set_lock_state(LockState::Unlocked)
                .ok();
        }

        let outcome = session
            .run(&mut transport, &mut NoUi)
            .with_context(|| "fastboot session failed")?;

        match outcome.target {
            BootTarget::Fastboot => {
                info!("rebooting back into fastboot");
                continue;
            }
            target => {
                info!("session ended, boot target {target:?}");
                if let Some(HandoffImage::Boot(image)) = &outcome.image {
                    attest(image, oem_cert.as_deref());
                }
                return Ok(());
            }
        }
    }
}

/// Report what the boot path would decide about a handed-off image.
fn attest(image: &[u8], oem_cert: Option<&[u8]>) {
    let Some(cert) = oem_cert else {
        info!("received a {} byte boot image (no OEM certificate configured)", image.len());
        return;
    };
    let verdict = verify_boot_image(image, cert);
    match verdict.state {
        BootState::Green => info!(target: "attest", "boot image GREEN (target {:?})", verdict.target),
        BootState::Yellow => info!(target: "attest", "boot image YELLOW (target {:?})", verdict.target),
        BootState::Orange => info!(target: "attest", "boot image ORANGE"),
        BootState::Red => info!(target: "attest", "boot image RED"),
    }
}
