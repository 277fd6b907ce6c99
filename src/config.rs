/// Configuration Loading
///
/// TOML config file loaded through the `config` crate into a process-wide
/// global, with a typed settings view carrying defaults for everything
/// the daemon wires together.

use std::error::Error;

pub use config::Config;
pub use once_cell::sync::OnceCell;

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

pub fn init_global_config(path: &str) -> Result<(), Box<dyn Error>> {
    let config = Config::builder()
        .add_source(config::File::with_name(path))
        .build()?;
    GLOBAL_CONFIG.set(config).map_err(|_| "Config already set")?;
    Ok(())
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// Typed view over the raw config, with defaults for optional keys.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Depth beyond which a connected block is assumed permanent.
    pub reorg_safety_limit: u32,
    /// Poll cadence of the bitcoind block monitor.
    pub poll_interval_secs: u64,
    pub rpc_host: String,
    pub rpc_user: String,
    pub rpc_pass: String,
    /// RocksDB directory for the confirm-hint cache.
    pub hint_cache_path: String,
    /// Fallback minimum final CLTV expiry for undecodable requests.
    pub min_final_cltv_fallback: u64,
}

impl Settings {
    pub fn from_config(config: &Config) -> Result<Self, Box<dyn Error>> {
        let hint_cache_path = config
            .get_string("paths.hint_cache_path")
            .unwrap_or_else(|_| "~/.lnwatch/hints".to_string());
        let hint_cache_path = shellexpand::tilde(&hint_cache_path).into_owned();

        Ok(Self {
            reorg_safety_limit: config.get_int("chain.reorg_safety_limit").unwrap_or(6) as u32,
            poll_interval_secs: config.get_int("chain.poll_interval_secs").unwrap_or(10) as u64,
            rpc_host: config.get_string("rpc.host")?,
            rpc_user: config.get_string("rpc.user")?,
            rpc_pass: config.get_string("rpc.pass")?,
            hint_cache_path,
            min_final_cltv_fallback: config
                .get_int("invoices.min_final_cltv_fallback")
                .unwrap_or(40) as u64,
        })
    }
}
