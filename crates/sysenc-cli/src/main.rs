//! sysenc: system drive encryption CLI
//!
//! Drive commands (operate on `--drive N`, default 0):
//!   probe                      - show the partition layout of the drive
//!   install                    - write the rescue disk, boot loader and header
//!   encrypt / decrypt          - transform the system area in the foreground
//!   status / abort             - read the state file, request a pause
//!   change-password            - re-wrap the master keys under a new password
//!   rescue create|verify|inspect
//!   hidden-os candidate|prepare|clone|phase|reset
//!   decoy-wipe start|status
//!   uninstall / fingerprint
//!
//! Volume commands:
//!   format <target>            - create a standard encrypted FAT volume
//!   open <target>              - unlock a volume and print its header

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sysenc_core::config::SysencConfig;
use sysenc_core::{EncryptionAlgorithm, Prf, WipeAlgorithm};
use sysenc_crypto::KdfParams;
use sysenc_disk::{BlockDevice, FileDevice};
use sysenc_engine::environment::logical_sector_size;
use sysenc_engine::{
    open_volume, spawn_format, BootEncryption, HiddenOsCreationPhase, Host, SetupResult,
    SetupStatus, StateFile, TransformFailure, VolumeOptions,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sysenc",
    version,
    about = "System drive encryption",
    long_about = "sysenc: encrypt the system drive in place, manage its pre-boot loader and rescue disk, and create encrypted volumes"
)]
struct Cli {
    /// Path to sysenc.toml configuration file
    #[arg(long, short = 'c', env = "SYSENC_CONFIG", default_value = "/etc/sysenc/config.toml")]
    config: PathBuf,

    /// System drive number (0 = first drive in the device template)
    #[arg(long, short = 'd', env = "SYSENC_DRIVE", default_value_t = 0)]
    drive: u32,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "SYSENC_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "SYSENC_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the partition layout of the system drive
    Probe {
        /// Print the layout as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a standard encrypted volume on a device or container file
    ///
    /// The password is read from SYSENC_PASSWORD or prompted for.
    Format {
        /// Device or container file
        target: PathBuf,
        /// Create (or truncate) a container file of this many bytes
        #[arg(long)]
        size: Option<u64>,
        #[arg(long)]
        algorithm: Option<EncryptionAlgorithm>,
        #[arg(long)]
        prf: Option<Prf>,
        #[arg(long)]
        pim: Option<u32>,
        /// Sectors per cluster (0 = pick from the volume size)
        #[arg(long)]
        cluster_size: Option<u32>,
        /// Skip writing the encrypted free space
        #[arg(long)]
        quick: bool,
    },

    /// Unlock a standard volume and print its header
    Open {
        target: PathBuf,
        #[arg(long, default_value_t = 0)]
        pim: u32,
        /// Try only this PRF
        #[arg(long)]
        prf: Option<Prf>,
    },

    /// Prepare the boot volume header, write and verify the rescue disk
    /// image, then install the boot loader
    Install {
        /// Encrypt the whole drive instead of the system partition only
        #[arg(long)]
        whole_drive: bool,
        /// The drive holds a hidden operating system
        #[arg(long)]
        hidden_system: bool,
        /// Require a CD/DVD recorder for burning the rescue disk
        #[arg(long)]
        burn_rescue: bool,
        #[arg(long)]
        algorithm: Option<EncryptionAlgorithm>,
        #[arg(long)]
        prf: Option<Prf>,
        #[arg(long)]
        pim: Option<u32>,
        /// Where to write the rescue disk image (default: config boot.rescue_iso)
        #[arg(long)]
        rescue: Option<PathBuf>,
    },

    /// Encrypt (or resume encrypting) the system area in the foreground
    Encrypt {
        /// Overwrite plaintext before it is replaced
        #[arg(long, default_value = "none")]
        wipe: WipeAlgorithm,
        /// Replace unreadable sectors with encrypted zeros instead of stopping
        #[arg(long)]
        zero_unreadable: bool,
        #[arg(long, default_value_t = 0)]
        pim: u32,
    },

    /// Decrypt (or resume decrypting) the system area in the foreground;
    /// the boot loader is removed once the drive is plaintext
    Decrypt {
        /// Skip unreadable sectors instead of stopping
        #[arg(long)]
        discard_unreadable: bool,
        #[arg(long, default_value_t = 0)]
        pim: u32,
    },

    /// Show the persisted encryption state of the drive
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Ask a running encrypt, decrypt, clone or wipe to pause at its next
    /// checkpoint
    Abort,

    /// Re-wrap the master keys under a new password
    ///
    /// Passwords are read from SYSENC_PASSWORD and SYSENC_NEW_PASSWORD or
    /// prompted for.
    #[command(name = "change-password")]
    ChangePassword {
        #[arg(long, default_value_t = 0)]
        pim: u32,
        #[arg(long)]
        new_pim: Option<u32>,
        #[arg(long)]
        new_prf: Option<Prf>,
        /// Random overwrite passes for the old header (default: config)
        #[arg(long)]
        wipe_passes: Option<u32>,
    },

    /// Rescue disk images
    Rescue {
        #[command(subcommand)]
        action: RescueAction,
    },

    /// Hidden operating system creation
    #[command(name = "hidden-os")]
    HiddenOs {
        #[command(subcommand)]
        action: HiddenOsAction,
    },

    /// Overwrite the decoy system partition after the hidden OS was cloned
    #[command(name = "decoy-wipe")]
    DecoyWipe {
        #[command(subcommand)]
        action: DecoyWipeAction,
    },

    /// Remove the boot loader and volume header from a plaintext drive
    Uninstall,

    /// Check that the installed boot loader is the expected one
    Fingerprint,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum RescueAction {
    /// Write a fresh rescue disk image for the installed drive
    Create {
        /// Output path (default: config boot.rescue_iso)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        pim: u32,
    },
    /// Check that a rescue image holds the keys of this drive
    Verify {
        path: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        pim: u32,
    },
    /// Describe a rescue image without a password
    Inspect { path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum HiddenOsAction {
    /// Show the partition that would hold the hidden system
    Candidate,
    /// Create the hidden volume header behind the system partition
    Prepare {
        #[arg(long)]
        algorithm: Option<EncryptionAlgorithm>,
        #[arg(long)]
        prf: Option<Prf>,
        #[arg(long)]
        pim: Option<u32>,
    },
    /// Copy the running system into the hidden volume in the foreground
    Clone {
        #[arg(long, default_value_t = 0)]
        pim: u32,
    },
    /// Show or set the creation phase
    Phase {
        #[arg(long)]
        set: Option<HiddenOsCreationPhase>,
    },
    /// Forget the hidden OS creation settings
    Reset,
}

#[derive(Subcommand, Debug)]
enum DecoyWipeAction {
    /// Wipe (or resume wiping) the decoy system partition in the foreground
    Start { algorithm: WipeAlgorithm },
    Status,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SysencConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);
    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        drive = cli.drive,
        "sysenc starting"
    );

    match cli.command {
        Commands::Probe { json } => cmd_probe(&config, cli.drive, json),
        Commands::Format {
            target,
            size,
            algorithm,
            prf,
            pim,
            cluster_size,
            quick,
        } => {
            let mut options = VolumeOptions::from_config(&config);
            if let Some(a) = algorithm {
                options.algorithm = a;
            }
            if let Some(p) = prf {
                options.prf = p;
            }
            if let Some(p) = pim {
                options.pim = p;
            }
            if let Some(c) = cluster_size {
                options.cluster_size = c;
            }
            options.format.quick_format |= quick;
            cmd_format(&target, size, options)
        }
        Commands::Open { target, pim, prf } => cmd_open(&config, &target, pim, prf),
        Commands::Install {
            whole_drive,
            hidden_system,
            burn_rescue,
            algorithm,
            prf,
            pim,
            rescue,
        } => {
            let request = InstallRequest {
                system_partition_only: !whole_drive,
                hidden_system,
                burn_rescue,
                algorithm: algorithm.unwrap_or(config.encryption.algorithm),
                prf: prf.unwrap_or(config.encryption.prf),
                pim: pim.unwrap_or(config.encryption.pim),
                rescue: rescue.unwrap_or_else(|| config.boot.rescue_iso.clone()),
            };
            cmd_install(&config, cli.drive, &request)
        }
        Commands::Encrypt {
            wipe,
            zero_unreadable,
            pim,
        } => cmd_encrypt(&config, cli.drive, wipe, zero_unreadable, pim),
        Commands::Decrypt {
            discard_unreadable,
            pim,
        } => cmd_decrypt(&config, cli.drive, discard_unreadable, pim),
        Commands::Status { json } => cmd_status(&config, json),
        Commands::Abort => cmd_abort(&config),
        Commands::ChangePassword {
            pim,
            new_pim,
            new_prf,
            wipe_passes,
        } => {
            let mut be = open_drive(&config, cli.drive)?;
            let old = read_password("Current password: ", "SYSENC_PASSWORD", false)?;
            let new = read_password("New password: ", "SYSENC_NEW_PASSWORD", true)?;
            let prf = new_prf
                .or(be.state().prf)
                .unwrap_or(config.encryption.prf);
            be.change_password(
                &old,
                pim,
                &new,
                prf,
                new_pim.unwrap_or(pim),
                wipe_passes.unwrap_or(config.encryption.header_wipe_passes),
            )
            .context("changing password")?;
            println!("Password changed.");
            println!("  Create a new rescue disk: the old one still opens with the old password.");
            Ok(())
        }
        Commands::Rescue { action } => cmd_rescue(&config, cli.drive, action),
        Commands::HiddenOs { action } => cmd_hidden_os(&config, cli.drive, action),
        Commands::DecoyWipe { action } => cmd_decoy_wipe(&config, cli.drive, action),
        Commands::Uninstall => {
            let mut be = open_drive(&config, cli.drive)?;
            be.deinstall().context("removing the boot loader")?;
            println!("Boot loader and volume header removed from drive {}", cli.drive);
            Ok(())
        }
        Commands::Fingerprint => {
            let mut be = open_drive(&config, cli.drive)?;
            be.check_bootloader_fingerprint()
                .context("checking the boot loader")?;
            match be.installed_boot_loader_version()? {
                Some(v) => println!("Boot loader OK (version {v})"),
                None => println!("Boot loader OK"),
            }
            Ok(())
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stderr keeps stdout for command output and progress bars
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn open_drive(config: &SysencConfig, drive: u32) -> Result<BootEncryption> {
    BootEncryption::new(config.clone(), drive, Host::local(config))
        .with_context(|| format!("opening system drive {drive}"))
}

/// Read a password from `env_var`, or prompt on the terminal.
fn read_password(prompt: &str, env_var: &str, confirm: bool) -> Result<SecretString> {
    if let Ok(password) = std::env::var(env_var) {
        return Ok(SecretString::from(password));
    }
    let password = rpassword::prompt_password(prompt).context("reading password")?;
    if password.is_empty() {
        bail!("empty password");
    }
    if confirm {
        let again = rpassword::prompt_password("Repeat password: ").context("reading password")?;
        if again != password {
            bail!("passwords do not match");
        }
    }
    Ok(SecretString::from(password))
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Route worker progress into a bar.
fn attach_progress(be: &mut BootEncryption, prefix: &str) -> ProgressBar {
    let pb = make_progress_bar(0, prefix);
    let bar = pb.clone();
    be.set_progress(move |done, total, phase| {
        bar.set_length(total);
        bar.set_position(done);
        bar.set_message(phase.to_string());
    });
    pb
}

fn wait_for_worker(be: &BootEncryption, pb: &ProgressBar) {
    while be.query_status().setup_in_progress {
        std::thread::sleep(Duration::from_millis(200));
    }
    pb.finish_and_clear();
}

fn report_setup(what: &str, result: std::result::Result<SetupResult, TransformFailure>) -> Result<()> {
    match result {
        Ok(SetupResult::Completed) => {
            println!("{what} complete.");
            Ok(())
        }
        Ok(SetupResult::Aborted) => {
            println!("{what} paused. Run the same command again to resume.");
            Ok(())
        }
        Ok(SetupResult::InProgress) => {
            println!("{what} still running.");
            Ok(())
        }
        Err(failure) if failure.is_interruption() => {
            println!(
                "{what} interrupted at {}. Run the same command again to resume.",
                fmt_bytes(failure.confirmed_offset)
            );
            Ok(())
        }
        Err(failure) => Err(anyhow::Error::new(failure).context(format!("{what} failed"))),
    }
}

// ── `sysenc probe` ────────────────────────────────────────────────────────────

fn cmd_probe(config: &SysencConfig, drive: u32, json: bool) -> Result<()> {
    let mut be = open_drive(config, drive)?;
    let cfg = be
        .system_drive_configuration()
        .context("probing the system drive")?;
    if json {
        println!("{}", serde_json::to_string_pretty(cfg)?);
        return Ok(());
    }
    println!("Drive {} ({})", cfg.drive_number, cfg.device_path.display());
    println!("  style:       {:?}", cfg.style);
    println!("  size:        {}", fmt_bytes(cfg.drive_size));
    println!("  sector size: {}", cfg.sector_size);
    println!("  unallocated: {} (after system: {})",
        fmt_bytes(cfg.total_unallocated_space),
        fmt_bytes(cfg.initial_unallocated_space));
    println!("  partitions:");
    for p in &cfg.partitions {
        let marker = if p.number == cfg.system_partition.number { "*" } else { " " };
        let mount = p
            .mount_point
            .as_ref()
            .map(|m| format!(" on {}", m.display()))
            .unwrap_or_default();
        println!(
            "   {marker}{:>3}  {:<12} {:>10} @ {:<12} {:?}{}{mount}",
            p.number,
            p.device_path.display(),
            fmt_bytes(p.length),
            p.start_offset,
            p.kind,
            if p.bootable { " boot" } else { "" },
        );
    }
    if cfg.extra_boot_partition_present {
        println!("  note: a separate boot partition is present");
    }
    Ok(())
}

// ── `sysenc format` / `sysenc open` ───────────────────────────────────────────

fn cmd_format(target: &Path, size: Option<u64>, options: VolumeOptions) -> Result<()> {
    let dev = match size {
        Some(size) => FileDevice::create_container(target, size, 512)?,
        None => FileDevice::open(target, logical_sector_size(target))?,
    };
    let password = read_password("Volume password: ", "SYSENC_PASSWORD", true)?;

    let pb = make_progress_bar(0, "format");
    let bar = pb.clone();
    let worker = spawn_format(Box::new(dev), password, options, move |done, total| {
        bar.set_length(total);
        bar.set_position(done);
    })?;
    let created = worker
        .join()?
        .with_context(|| format!("formatting {}", target.display()))?;
    pb.finish_and_clear();

    println!("Volume created: {}", target.display());
    println!("  size:      {}", fmt_bytes(created.layout.total));
    println!("  data area: {} at offset {}", fmt_bytes(created.layout.data_length), created.layout.data_start);
    println!(
        "  fs:        {:?}, {} clusters of {} sectors",
        created.filesystem.fat_type, created.filesystem.cluster_count, created.filesystem.cluster_size
    );
    Ok(())
}

fn cmd_open(config: &SysencConfig, target: &Path, pim: u32, prf: Option<Prf>) -> Result<()> {
    let mut dev = FileDevice::open_read_only(target, logical_sector_size(target))?;
    let password = read_password("Volume password: ", "SYSENC_PASSWORD", false)?;
    let header = open_volume(
        &mut dev,
        &password,
        pim,
        prf,
        &KdfParams::from(&config.encryption),
    )
    .with_context(|| format!("opening {}", target.display()))?;
    let fields = header.fields();
    println!("Volume: {} ({})", target.display(), fmt_bytes(dev.len()));
    println!("  version:   {}", fields.version);
    println!("  cipher:    {}-{}", fields.algorithm, fields.mode);
    println!("  prf:       {}", fields.prf);
    println!("  kind:      {:?}", fields.kind);
    println!("  data:      {} at offset {}",
        fmt_bytes(fields.geometry.volume_size),
        fields.geometry.encrypted_area_start);
    Ok(())
}

// ── `sysenc install` ──────────────────────────────────────────────────────────

struct InstallRequest {
    system_partition_only: bool,
    hidden_system: bool,
    burn_rescue: bool,
    algorithm: EncryptionAlgorithm,
    prf: Prf,
    pim: u32,
    rescue: PathBuf,
}

fn cmd_install(config: &SysencConfig, drive: u32, request: &InstallRequest) -> Result<()> {
    let mut be = open_drive(config, drive)?;
    be.check_requirements(request.system_partition_only, request.burn_rescue)
        .context("checking requirements")?;
    let password = read_password("New password: ", "SYSENC_PASSWORD", true)?;

    let spinner = make_spinner("install");
    spinner.set_message("deriving header keys");
    be.prepare_installation(
        request.system_partition_only,
        &password,
        request.algorithm,
        config.encryption.mode,
        request.prf,
        request.pim,
        &request.rescue,
    )
    .context("preparing the volume header")?;

    spinner.set_message("verifying rescue disk image");
    be.verify_rescue_disk_image(&request.rescue)
        .context("verifying the rescue disk image")?;

    spinner.set_message("installing boot loader");
    be.install(request.hidden_system, request.prf)
        .context("installing the boot loader")?;
    spinner.finish_and_clear();

    println!("Boot loader installed on drive {drive}");
    println!("  rescue disk: {}", request.rescue.display());
    println!("  Burn the rescue disk and reboot once before running `sysenc encrypt`.");
    Ok(())
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

// ── `sysenc encrypt` / `sysenc decrypt` ──────────────────────────────────────

fn cmd_encrypt(
    config: &SysencConfig,
    drive: u32,
    wipe: WipeAlgorithm,
    zero_unreadable: bool,
    pim: u32,
) -> Result<()> {
    let mut be = open_drive(config, drive)?;
    let password = read_password("Password: ", "SYSENC_PASSWORD", false)?;
    be.unlock(&password, pim).context("opening the boot volume header")?;

    let pb = attach_progress(&mut be, "encrypt");
    be.start_encryption(wipe, zero_unreadable)
        .context("starting encryption")?;
    pb.println("Run `sysenc abort` from another shell to pause; progress is kept.");
    wait_for_worker(&be, &pb);
    report_setup("Encryption", be.check_encryption_setup_result())
}

fn cmd_decrypt(config: &SysencConfig, drive: u32, discard_unreadable: bool, pim: u32) -> Result<()> {
    let mut be = open_drive(config, drive)?;
    let password = read_password("Password: ", "SYSENC_PASSWORD", false)?;
    be.unlock(&password, pim).context("opening the boot volume header")?;

    let pb = attach_progress(&mut be, "decrypt");
    be.start_decryption(discard_unreadable)
        .context("starting decryption")?;
    pb.println("Run `sysenc abort` from another shell to pause; progress is kept.");
    wait_for_worker(&be, &pb);
    report_setup("Decryption", be.check_encryption_setup_result())?;
    if be.state().status == SetupStatus::Uninstalled {
        println!("  Boot loader removed; the drive is plaintext.");
    }
    Ok(())
}

// ── `sysenc status` / `sysenc abort` ─────────────────────────────────────────

fn cmd_status(config: &SysencConfig, json: bool) -> Result<()> {
    let path = &config.drive.state_file;
    if !path.exists() {
        println!("No encryption state at {} (drive not set up)", path.display());
        return Ok(());
    }
    let state = StateFile::load(path)
        .with_context(|| format!("reading state file: {}", path.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    let total = state.area_len();
    let done = state.encrypted_bytes();
    println!("Drive {}: {:?}", state.drive_number, state.status);
    if let Some(fw) = state.firmware {
        println!("  firmware:   {fw:?}");
    }
    if let (Some(alg), Some(prf)) = (state.algorithm, state.prf) {
        println!("  cipher:     {alg}, {prf}");
    }
    if total > 0 {
        println!(
            "  encrypted:  {} / {} ({:.1}%)",
            fmt_bytes(done),
            fmt_bytes(total),
            done as f64 * 100.0 / total as f64
        );
    }
    if let Some(direction) = state.direction {
        println!("  direction:  {direction:?}");
    }
    if state.hidden_os_phase != HiddenOsCreationPhase::None {
        println!("  hidden OS:  {}", state.hidden_os_phase);
    }
    if state.decoy_wipe.total > 0 {
        println!(
            "  decoy wipe: {} / {} ({})",
            fmt_bytes(state.decoy_wipe.offset),
            fmt_bytes(state.decoy_wipe.total),
            state.decoy_wipe.algorithm
        );
    }
    if let Some(err) = &state.last_error {
        println!("  last error: {err}");
    }
    Ok(())
}

fn cmd_abort(config: &SysencConfig) -> Result<()> {
    StateFile::request_abort(&config.drive.state_file).context("requesting abort")?;
    println!("Abort requested; the running operation pauses at its next checkpoint.");
    Ok(())
}

// ── `sysenc rescue` ───────────────────────────────────────────────────────────

fn cmd_rescue(config: &SysencConfig, drive: u32, action: RescueAction) -> Result<()> {
    match action {
        RescueAction::Create { output, pim } => {
            let path = output.unwrap_or_else(|| config.boot.rescue_iso.clone());
            let mut be = open_drive(config, drive)?;
            let password = read_password("Password: ", "SYSENC_PASSWORD", false)?;
            be.unlock(&password, pim).context("opening the boot volume header")?;
            be.create_rescue_disk_image(&path, &password, pim)
                .context("writing the rescue disk image")?;
            println!("Rescue disk image written: {}", path.display());
        }
        RescueAction::Verify { path, pim } => {
            let path = path.unwrap_or_else(|| config.boot.rescue_iso.clone());
            let mut be = open_drive(config, drive)?;
            let password = read_password("Password: ", "SYSENC_PASSWORD", false)?;
            be.unlock(&password, pim).context("opening the boot volume header")?;
            be.verify_rescue_disk_image_with_password(&path, &password, pim)
                .context("verifying the rescue disk image")?;
            println!("Rescue disk matches drive {drive}: {}", path.display());
        }
        RescueAction::Inspect { path } => {
            println!("{}", BootEncryption::inspect_rescue_disk_image(&path)?);
        }
    }
    Ok(())
}

// ── `sysenc hidden-os` / `sysenc decoy-wipe` ─────────────────────────────────

fn cmd_hidden_os(config: &SysencConfig, drive: u32, action: HiddenOsAction) -> Result<()> {
    let mut be = open_drive(config, drive)?;
    match action {
        HiddenOsAction::Candidate => {
            be.check_requirements_hidden_os()
                .context("checking hidden OS requirements")?;
            let p = be.partition_for_hidden_os()?;
            println!(
                "Hidden OS partition: {} (#{}, {})",
                p.device_path.display(),
                p.number,
                fmt_bytes(p.length)
            );
        }
        HiddenOsAction::Prepare { algorithm, prf, pim } => {
            be.check_requirements_hidden_os()
                .context("checking hidden OS requirements")?;
            let password = read_password("Hidden OS password: ", "SYSENC_PASSWORD", true)?;
            let layout = be.prepare_hidden_os_creation(
                &password,
                algorithm.unwrap_or(config.encryption.algorithm),
                config.encryption.mode,
                prf.unwrap_or(config.encryption.prf),
                pim.unwrap_or(config.encryption.pim),
            )?;
            println!("Hidden volume prepared in partition #{}", layout.partition_number);
            println!("  header: offset {}", layout.header_offset);
            println!("  data:   {} at offset {}", fmt_bytes(layout.data_length), layout.data_start);
        }
        HiddenOsAction::Clone { pim } => {
            let password = read_password("Hidden OS password: ", "SYSENC_PASSWORD", false)?;
            be.unlock_hidden_os(&password, pim)
                .context("opening the hidden volume header")?;
            let pb = attach_progress(&mut be, "clone");
            be.start_hidden_os_clone().context("starting the clone")?;
            wait_for_worker(&be, &pb);
            report_setup("Hidden OS clone", be.check_encryption_setup_result())?;
        }
        HiddenOsAction::Phase { set: None } => {
            println!("{}", be.hidden_os_creation_phase());
        }
        HiddenOsAction::Phase { set: Some(phase) } => {
            be.set_hidden_os_creation_phase(phase)?;
            println!("Hidden OS creation phase: {phase}");
        }
        HiddenOsAction::Reset => {
            be.wipe_hidden_os_creation_config()?;
            println!("Hidden OS creation settings cleared.");
        }
    }
    Ok(())
}

fn cmd_decoy_wipe(config: &SysencConfig, drive: u32, action: DecoyWipeAction) -> Result<()> {
    let mut be = open_drive(config, drive)?;
    match action {
        DecoyWipeAction::Start { algorithm } => {
            let pb = attach_progress(&mut be, "wipe");
            be.start_decoy_os_wipe(algorithm)
                .context("starting the decoy wipe")?;
            pb.println("Run `sysenc abort` from another shell to pause; progress is kept.");
            wait_for_worker(&be, &pb);
            report_setup("Decoy wipe", be.check_decoy_os_wipe_result())
        }
        DecoyWipeAction::Status => {
            let wipe = be.decoy_os_wipe_status();
            println!("Decoy wipe ({}):", wipe.algorithm);
            println!("  progress: {} / {}", fmt_bytes(wipe.offset), fmt_bytes(wipe.total));
            if let Some(err) = &wipe.last_error {
                println!("  last error: {err}");
            }
            Ok(())
        }
    }
}

// ── `sysenc config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &SysencConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_drive_commands() {
        let cli = Cli::try_parse_from([
            "sysenc", "--drive", "1", "encrypt", "--wipe", "dod3", "--zero-unreadable",
        ])
        .unwrap();
        assert_eq!(cli.drive, 1);
        match cli.command {
            Commands::Encrypt {
                wipe,
                zero_unreadable,
                pim,
            } => {
                assert_eq!(wipe, WipeAlgorithm::Dod3);
                assert!(zero_unreadable);
                assert_eq!(pim, 0);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["sysenc", "hidden-os", "phase", "--set", "wiping-decoy"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::HiddenOs {
                action: HiddenOsAction::Phase {
                    set: Some(HiddenOsCreationPhase::WipingDecoy)
                }
            }
        ));
    }

    #[test]
    fn rejects_unknown_algorithms() {
        assert!(Cli::try_parse_from(["sysenc", "decoy-wipe", "start", "shred9"]).is_err());
        assert!(Cli::try_parse_from(["sysenc", "install", "--prf", "md5"]).is_err());
    }

    #[test]
    fn fmt_bytes_units() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(64 * 1024), "64.0 KB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024 / 2), "1.5 MB");
    }

    #[test]
    fn format_then_open_a_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let mut config = SysencConfig::default();
        config.encryption.pim = 1;
        config.encryption.argon2_mem_cost_kib = 64;
        config.encryption.argon2_time_cost = 1;
        config.encryption.argon2_parallelism = 1;

        let dev = FileDevice::create_container(&path, 2 * 1024 * 1024, 512).unwrap();
        let worker = spawn_format(
            Box::new(dev),
            SecretString::from("container pw"),
            VolumeOptions::from_config(&config),
            |_, _| {},
        )
        .unwrap();
        let created = worker.join().unwrap().unwrap();
        assert_eq!(created.layout.total, 2 * 1024 * 1024);

        let mut dev = FileDevice::open_read_only(&path, 512).unwrap();
        let header = open_volume(
            &mut dev,
            &SecretString::from("container pw"),
            1,
            None,
            &KdfParams::from(&config.encryption),
        )
        .unwrap();
        assert_eq!(header.fields().geometry.volume_size, created.layout.data_length);
    }
}
