use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use fluxd_consensus::Network;
use fluxd_log::{log_debug, Format, Level, LogConfig};

pub const DEFAULT_KEYPOOL_SIZE: usize = 100;
pub const DEFAULT_WALLET_NAME: &str = "wallet";

const KNOWN_KEYS: [&str; 9] = [
    "testnet",
    "regtest",
    "wallet",
    "keypool",
    "rescan",
    "disableprivatekeys",
    "loglevel",
    "logformat",
    "logtimestamps",
];

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, error: std::io::Error },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, error } => {
                write!(f, "failed to read {}: {error}", path.display())
            }
            ConfigError::Invalid(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug)]
pub struct WalletConfig {
    pub network: Network,
    pub wallet_name: String,
    pub keypool_size: usize,
    pub rescan_on_import: bool,
    pub disable_private_keys: bool,
    pub log: LogConfig,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            wallet_name: DEFAULT_WALLET_NAME.to_string(),
            keypool_size: DEFAULT_KEYPOOL_SIZE,
            rescan_on_import: true,
            disable_private_keys: false,
            log: LogConfig::default(),
        }
    }
}

impl WalletConfig {
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Reads a `flux.conf`-style file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let Some(conf) = load_conf(path)? else {
            return Ok(config);
        };
        let invalid = |key: &str, raw: &str| {
            ConfigError::Invalid(format!("invalid {key} value '{raw}' in {}", path.display()))
        };
        for key in conf.keys().filter(|key| !KNOWN_KEYS.contains(&key.as_str())) {
            log_debug!("ignoring unknown key '{key}' in {}", path.display());
        }
        let last = |key: &str| conf.get(key).and_then(|values| values.last());
        let flag = |key: &str| -> Result<Option<bool>, ConfigError> {
            match last(key) {
                Some(raw) => parse_conf_bool(raw).map(Some).ok_or_else(|| invalid(key, raw)),
                None => Ok(None),
            }
        };

        if flag("regtest")? == Some(true) {
            config.network = Network::Regtest;
        } else if flag("testnet")? == Some(true) {
            config.network = Network::Testnet;
        }
        if let Some(name) = last("wallet") {
            if name.is_empty() {
                return Err(invalid("wallet", name));
            }
            config.wallet_name = name.clone();
        }
        if let Some(raw) = last("keypool") {
            config.keypool_size = raw.parse().map_err(|_| invalid("keypool", raw))?;
        }
        if let Some(value) = flag("rescan")? {
            config.rescan_on_import = value;
        }
        if let Some(value) = flag("disableprivatekeys")? {
            config.disable_private_keys = value;
        }
        if let Some(raw) = last("loglevel") {
            config.log.level = Level::parse(raw).ok_or_else(|| invalid("loglevel", raw))?;
        }
        if let Some(raw) = last("logformat") {
            config.log.format = Format::parse(raw).ok_or_else(|| invalid("logformat", raw))?;
        }
        if let Some(value) = flag("logtimestamps")? {
            config.log.timestamps = value;
        }
        Ok(config)
    }
}

fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                error,
            })
        }
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let line = raw_line
            .split(['#', ';'])
            .next()
            .unwrap_or_default()
            .trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .map_or((line, "1"), |(key, value)| (key.trim(), value.trim()));
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_conf(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("flux.conf");
        fs::write(&path, contents).expect("write conf");
        (dir, path)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = WalletConfig::load(&dir.path().join("absent.conf")).expect("load");
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.keypool_size, DEFAULT_KEYPOOL_SIZE);
        assert!(config.rescan_on_import);
        assert!(!config.disable_private_keys);
    }

    #[test]
    fn last_value_wins_and_bare_keys_enable() {
        let (_dir, path) = write_conf(
            "# wallet settings\nregtest\nkeypool=5 ; small\nkeypool=7\nwallet=cold\nrescan=no\nDisablePrivateKeys=1\nloglevel=debug\nlogformat=json\n",
        );
        let config = WalletConfig::load(&path).expect("load");
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.keypool_size, 7);
        assert_eq!(config.wallet_name, "cold");
        assert!(!config.rescan_on_import);
        assert!(config.disable_private_keys);
        assert_eq!(config.log.level, Level::Debug);
        assert_eq!(config.log.format, Format::Json);
    }

    #[test]
    fn malformed_value_names_key_and_file() {
        let (_dir, path) = write_conf("keypool=lots\n");
        let err = WalletConfig::load(&path).expect_err("invalid keypool");
        let message = err.to_string();
        assert!(message.contains("keypool"), "{message}");
        assert!(message.contains("flux.conf"), "{message}");
    }
}
