use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};
use zeroize::Zeroizing;

use sealbox_crypto::{
    fingerprint_from_bundle, CryptoBox, FileStorage, ImportMode, PreKeyBundle, Storage,
    INITIAL_PREKEY_COUNT, PREKEY_REPLENISH_THRESHOLD,
};

mod config;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "sealbox", about = "Inspect and maintain a sealbox key store")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Store directory, overrides config
    #[arg(short, long)]
    store: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the store if needed and print its fingerprint
    Init,
    /// Print the local identity fingerprint
    Fingerprint,
    /// Generate one-time pre-keys and print their bundles
    Prekeys {
        #[arg(long, default_value_t = 0)]
        start: u16,
        #[arg(long, default_value_t = INITIAL_PREKEY_COUNT)]
        count: u16,
    },
    /// Print the last-resort pre-key bundle, creating it if needed
    LastResort,
    /// List the pre-key ids currently in the pool
    ListPrekeys,
    /// Fingerprint of the identity that published a hex-encoded bundle
    BundleFingerprint { bundle: String },
    /// Write the identity, private key included, to a file
    ExportIdentity { out: PathBuf },
    /// Open the store with an identity previously exported
    ImportIdentity {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = ModeArg::FailIfPresent)]
        mode: ModeArg,
    },
    /// List saved sessions
    Sessions,
    /// Delete a saved session
    DeleteSession { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    FailIfPresent,
    Overwrite,
    Migrate,
}

impl From<ModeArg> for ImportMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::FailIfPresent => ImportMode::FailIfPresent,
            ModeArg::Overwrite => ImportMode::OverwriteExisting,
            ModeArg::Migrate => ImportMode::MigratePreserveSessions,
        }
    }
}

#[derive(Serialize)]
struct BundleOut {
    id: u16,
    bundle: String,
}

impl From<&PreKeyBundle> for BundleOut {
    fn from(bundle: &PreKeyBundle) -> Self {
        Self {
            id: bundle.prekey_id,
            bundle: hex::encode(bundle.to_bytes()),
        }
    }
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sealbox=info,sealbox_crypto=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)
            .with_context(|| format!("invalid config file: {}", config_path))?
    } else {
        CliConfig::default()
    };

    // CLI overrides
    if let Some(store) = args.store {
        config.store_dir = store;
    }

    // Needs no store
    if let Command::BundleFingerprint { bundle } = &args.command {
        return print_bundle_fingerprint(bundle);
    }

    let cbox = match &args.command {
        Command::ImportIdentity { file, mode } => {
            let bytes = Zeroizing::new(
                fs::read(file).with_context(|| format!("failed to read {}", file.display()))?,
            );
            CryptoBox::open_with_identity_in(
                open_storage(&config.store_dir)?,
                &bytes,
                (*mode).into(),
                config.session,
            )?
        }
        _ => CryptoBox::open_with_config(&config.store_dir, config.session)
            .with_context(|| format!("failed to open store: {}", config.store_dir))?,
    };

    run(&cbox, args.command)?;
    cbox.close();
    Ok(())
}

fn open_storage(dir: &str) -> Result<Arc<dyn Storage>> {
    let storage =
        FileStorage::open(dir).with_context(|| format!("failed to open store: {}", dir))?;
    Ok(Arc::new(storage))
}

fn run(cbox: &CryptoBox, command: Command) -> Result<()> {
    match command {
        Command::Init | Command::Fingerprint | Command::ImportIdentity { .. } => {
            println!("{}", cbox.local_fingerprint());
        }
        Command::Prekeys { start, count } => {
            let bundles = cbox.new_prekeys(start, count)?;
            let out: Vec<BundleOut> = bundles.iter().map(BundleOut::from).collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
            info!(start, count, "published pre-keys");
        }
        Command::LastResort => {
            let bundle = cbox.new_last_resort_prekey()?;
            println!("{}", serde_json::to_string_pretty(&BundleOut::from(&bundle))?);
        }
        Command::ListPrekeys => {
            let ids = cbox.prekey_ids()?;
            if ids.len() < PREKEY_REPLENISH_THRESHOLD {
                warn!(remaining = ids.len(), "pre-key pool is running low");
            }
            println!("{}", serde_json::to_string(&ids)?);
        }
        Command::ExportIdentity { out } => {
            let bytes = Zeroizing::new(cbox.copy_identity()?);
            fs::write(&out, &*bytes).with_context(|| format!("failed to write {}", out.display()))?;
            info!(path = %out.display(), "exported identity");
        }
        Command::Sessions => {
            for id in cbox.session_ids()? {
                println!("{id}");
            }
        }
        Command::DeleteSession { id } => {
            cbox.delete_session(&id)?;
        }
        Command::BundleFingerprint { bundle } => print_bundle_fingerprint(&bundle)?,
    }
    Ok(())
}

fn print_bundle_fingerprint(bundle: &str) -> Result<()> {
    let bytes = hex::decode(bundle.trim()).context("bundle is not valid hex")?;
    let fingerprint = fingerprint_from_bundle(&bytes).context("invalid bundle")?;
    println!("{fingerprint}");
    Ok(())
}
