use std::io::BufRead as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr as _;
use mdmsim::{run_connect_workers, ConnectWorkerData};
use mdmsim_device::{AttestationCa, Device, MdmClient};
use mdmsim_store::KvStore;

#[derive(Parser)]
#[command(name = "mdmsim")]
#[command(about = "Simulated Apple MDM device fleet", version)]
struct Cli {
    /// Database file path.
    #[arg(long = "db", global = true, default_value = "mdmsim.db")]
    db: PathBuf,

    /// Comma-separated list of device UUIDs, '-' to read from stdin, or
    /// 'all' for all devices.
    #[arg(long = "uuids", global = true)]
    uuids: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List created devices
    DevicesList,

    /// Create new devices
    DevicesCreate {
        /// Number of devices.
        #[arg(short = 'n', default_value_t = 1)]
        number: usize,
    },

    /// Devices connect to MDM
    DevicesConnect {
        /// Number of workers (concurrency).
        #[arg(short = 'w', default_value_t = 1)]
        workers: usize,

        /// Number of iterations of connects.
        #[arg(short = 'i', default_value_t = 1)]
        iterations: usize,
    },

    /// Send another TokenUpdate to the MDM server
    DevicesTokenupdate {
        /// Additional text inside the token update values.
        #[arg(long = "addl", default_value = "")]
        addl: String,
    },

    /// List device profiles
    DevicesProfilesList,

    /// Install profiles onto devices (i.e. enroll)
    DevicesProfilesInstall {
        /// Profile to install.
        #[arg(short = 'f')]
        file: PathBuf,

        /// Path to the fake attestation CA certificate in PEM format.
        #[arg(long = "cert")]
        cert: Option<PathBuf>,

        /// Path to the fake attestation CA private key.
        #[arg(long = "key")]
        key: Option<PathBuf>,

        /// Password for the fake attestation CA private key.
        #[arg(long = "pass", default_value = "")]
        pass: String,
    },

    /// Remove profiles from devices
    DevicesProfilesRemove {
        /// Profile identifier.
        #[arg(short = 'i')]
        id: String,
    },

    /// Print the Mdm-Signature header for a file
    DevicesMdmSignature {
        /// Path to the file to sign.
        #[arg(short = 'f')]
        file: PathBuf,
    },

    /// Display version
    Version,
}

fn resolve_uuids(uuids: &Option<String>, db: &KvStore) -> color_eyre::eyre::Result<Vec<String>> {
    let Some(uuids) = uuids else {
        return Ok(Vec::new());
    };
    match uuids.as_str() {
        "all" => Device::list(db),
        "-" => {
            let stdin = std::io::stdin();
            let mut out = Vec::new();
            for line in stdin.lock().lines() {
                let line = line.wrap_err("reading UUIDs from stdin")?;
                if !line.trim().is_empty() {
                    out.push(line.trim().to_string());
                }
            }
            Ok(out)
        }
        list => Ok(list.split(',').map(str::to_string).collect()),
    }
}

fn require_uuids(uuids: &[String], subcommand: &str) -> color_eyre::eyre::Result<()> {
    if uuids.is_empty() {
        color_eyre::eyre::bail!("no device UUIDs supplied, use --uuids for {subcommand}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if matches!(cli.command, Commands::Version) {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let db = KvStore::open(&cli.db)
        .wrap_err_with(|| format!("opening database {}", cli.db.display()))?;
    let uuids = resolve_uuids(&cli.uuids, &db)?;
    let http = reqwest::Client::new();

    match cli.command {
        Commands::DevicesList => {
            if !uuids.is_empty() {
                color_eyre::eyre::bail!("cannot supply UUIDs for devices-list");
            }
            for udid in Device::list(&db)? {
                println!("{udid}");
            }
        }

        Commands::DevicesCreate { number } => {
            if !uuids.is_empty() {
                color_eyre::eyre::bail!("cannot supply UUIDs for devices-create");
            }
            println!("creating {number} device(s)");
            for _ in 0..number {
                let device = Device::new("", db.clone());
                device.save()?;
                println!("{}", device.udid);
            }
        }

        Commands::DevicesConnect {
            workers,
            iterations,
        } => {
            require_uuids(&uuids, "devices-connect")?;

            let mut data = Vec::new();
            for udid in &uuids {
                let device = match Device::load(udid, db.clone()) {
                    Ok(device) => device,
                    Err(e) => {
                        tracing::error!(udid = %udid, error = %e, "skipping device");
                        continue;
                    }
                };
                let client = match MdmClient::new(device.clone(), http.clone()) {
                    Ok(client) => client,
                    Err(e) => {
                        tracing::error!(udid = %udid, error = %e, "skipping device");
                        continue;
                    }
                };
                data.push(ConnectWorkerData { device, client });
            }

            let stats = run_connect_workers(data, workers, iterations).await;
            println!("{stats}");
        }

        Commands::DevicesTokenupdate { addl } => {
            require_uuids(&uuids, "devices-tokenupdate")?;
            for udid in &uuids {
                println!("{udid}");
                let result = async {
                    let device = Device::load(udid, db.clone())?;
                    let client = MdmClient::new(device, http.clone())?;
                    client.token_update(&addl).await
                }
                .await;
                if let Err(e) = result {
                    tracing::error!(udid = %udid, error = %e, "token update failed");
                }
            }
        }

        Commands::DevicesProfilesList => {
            require_uuids(&uuids, "devices-profiles-list")?;
            for udid in &uuids {
                println!("profiles for UUID: {udid}");
                let device = match Device::load(udid, db.clone()) {
                    Ok(device) => device,
                    Err(e) => {
                        tracing::error!(udid = %udid, error = %e, "skipping device");
                        continue;
                    }
                };
                for profile_id in device.profile_store().list_uuids()? {
                    println!("{profile_id}");
                }
            }
        }

        Commands::DevicesProfilesInstall {
            file,
            cert,
            key,
            pass,
        } => {
            require_uuids(&uuids, "devices-profiles-install")?;

            let attestation_ca = match (&cert, &key) {
                (Some(cert), Some(key)) => Some(
                    AttestationCa::load(cert, key, &pass)
                        .wrap_err("loading attestation CA")?,
                ),
                (None, None) => None,
                _ => color_eyre::eyre::bail!(
                    "attestation CA requires both --cert and --key"
                ),
            };

            let blob = std::fs::read(&file)
                .wrap_err_with(|| format!("reading profile {}", file.display()))?;

            for udid in &uuids {
                println!("{udid}");
                let result = async {
                    let mut device = Device::load(udid, db.clone())?;
                    device
                        .install_profile(&http, attestation_ca.as_ref(), &blob, false)
                        .await
                }
                .await;
                if let Err(e) = result {
                    tracing::error!(udid = %udid, error = %e, "profile install failed");
                }
            }
        }

        Commands::DevicesProfilesRemove { id } => {
            require_uuids(&uuids, "devices-profiles-remove")?;
            for udid in &uuids {
                println!("{udid}");
                let result = Device::load(udid, db.clone())
                    .and_then(|mut device| device.remove_profile(&id));
                if let Err(e) = result {
                    tracing::error!(udid = %udid, error = %e, "profile remove failed");
                }
            }
        }

        Commands::DevicesMdmSignature { file } => {
            require_uuids(&uuids, "devices-mdm-signature")?;
            let body = std::fs::read(&file)
                .wrap_err_with(|| format!("reading {}", file.display()))?;

            for udid in &uuids {
                let result = Device::load(udid, db.clone())
                    .and_then(|device| MdmClient::new(device, http.clone()))
                    .and_then(|client| client.mdm_signature(&body));
                match result {
                    Ok(signature) => {
                        if uuids.len() > 1 {
                            println!("{udid}\t{signature}");
                        } else {
                            println!("{signature}");
                        }
                    }
                    Err(e) => tracing::error!(udid = %udid, error = %e, "signing failed"),
                }
            }
        }

        Commands::Version => unreachable!("handled before opening the database"),
    }

    Ok(())
}
