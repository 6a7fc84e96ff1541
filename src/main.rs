use std::path::PathBuf;

use clap::Parser;
use log::{error, info};

mod config;
mod dispatch;
mod manager;
mod messages;
mod mqtt;
mod normalizer;
mod registry;
mod store;
mod tracker;

/// Wi-Fi presence for Home Assistant from UniFi client connect/disconnect webhooks.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Delete the record of discovered devices and exit
    #[arg(long)]
    remove_store: bool,

    /// Print the discovered devices and exit
    #[arg(long, conflicts_with = "remove_store")]
    list: bool,

    /// Discovery store to use with --list or --remove-store instead of the
    /// one named in the config file
    #[arg(long)]
    store: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = Args::parse();

    if args.remove_store || args.list {
        let path = match args.store {
            Some(path) => path,
            None => config::storage_path_from(&args.config)?,
        };
        let store = store::DiscoveryStore::new(path);
        if args.remove_store {
            if let Err(err) = store.remove().await {
                error!("Could not remove discovery data: {:#}", err);
            }
        } else {
            let snapshot = store.load().await;
            for mac in &snapshot.macs {
                match snapshot.ips.get(mac) {
                    Some(ip) => println!("{mac}\t{ip}"),
                    None => println!("{mac}"),
                }
            }
        }
        return Ok(());
    }

    let config = config::AppConfig::load(&args.config)?;
    info!("Known devices: {:?}", config.known_devices());

    let core = manager::Manager::new(config);
    core.run_loop().await?;

    Ok(())
}
