use std::sync::Arc;

use identirust::config::{ConfigOverrides, IdentConfig, ServerOverrides, StorageOverrides};
use identirust::{Identirust, MemoryStore, PersistentOpenOptions, PersistentStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"identirust_server - Contact identity reconciliation service

USAGE:
    identirust_server [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to config file (TOML)
    -l, --listen <ADDR>     Override listen address [default: 127.0.0.1:3000]
    -d, --data-dir <DIR>    RocksDB directory (in-memory store when omitted)
        --repair            Repair the RocksDB directory before opening
    -h, --help              Print help

ENVIRONMENT:
    IDENTIRUST_CONFIG                     Path to config file
    IDENTIRUST_SERVER__LISTEN             Listen address
    IDENTIRUST_STORAGE__DATA_DIR          RocksDB directory
    IDENTIRUST_RECONCILE__LOCK_TIMEOUT_MS Lock wait before a request fails
    RUST_LOG                              Log filter [default: info]

CONFIG FILE (identirust.toml):
    [server]
    listen = "0.0.0.0:3000"

    [storage]
    data_dir = "/var/lib/identirust"
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Build CLI overrides
    let mut overrides = ConfigOverrides::default();

    if let Some(listen) = parse_arg("--listen").or_else(|| parse_arg("-l")) {
        overrides.server = Some(ServerOverrides {
            listen: Some(listen.parse()?),
        });
    }

    let mut storage_overrides = StorageOverrides::default();
    if let Some(data_dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        storage_overrides.data_dir = Some(data_dir.into());
    }
    if has_flag("--repair") {
        storage_overrides.repair = Some(true);
    }
    if storage_overrides.data_dir.is_some() || storage_overrides.repair.is_some() {
        overrides.storage = Some(storage_overrides);
    }

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("IDENTIRUST_CONFIG").ok());
    let config = IdentConfig::load(config_path.as_deref(), overrides)?;

    let identirust = match &config.storage.data_dir {
        Some(path) => {
            let store = PersistentStore::open_with_options(
                path,
                PersistentOpenOptions {
                    repair: config.storage.repair,
                    cache_capacity: config.storage.cache_capacity,
                },
            )?;
            Identirust::with_store_and_tuning(store, config.reconcile.clone())
        }
        None => {
            info!("using in-memory store");
            Identirust::with_store_and_tuning(MemoryStore::new(), config.reconcile.clone())
        }
    };

    identirust::server::serve(Arc::new(identirust), config.server.listen).await
}
