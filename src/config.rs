//! TOML configuration, modeled closely on `lianad`'s `Config`: custom
//! (de)serialization helpers for types `serde` doesn't know natively, a
//! flattened mutually-exclusive auth block, and a hand-written `ConfigError`.

use std::convert::TryFrom;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::money::Money;
use crate::policy::{Policy, PolicyConfig, PolicyConfigError};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9735";
pub const DEFAULT_VENDING_POOL_SIZE: usize = crate::vending::DEFAULT_POOL_SIZE;
pub const DEFAULT_ACCOUNTING_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_ACCOUNTING_TICK_SECS: u64 = 1;
pub const DEFAULT_MIN_CONFIRMATIONS: u32 = 1;

fn deserialize_fromstr<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: FromStr,
    T::Err: fmt::Display,
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    T::from_str(&s).map_err(de::Error::custom)
}

fn serialize_to_string<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: fmt::Display,
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<log::LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    log::LevelFilter::from_str(&s).map_err(de::Error::custom)
}

fn serialize_log_level<S>(level: &log::LevelFilter, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&level.to_string())
}

fn default_log_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

fn default_listen_addr() -> SocketAddr {
    DEFAULT_LISTEN_ADDR.parse().expect("valid default addr")
}

fn default_vending_pool_size() -> usize {
    DEFAULT_VENDING_POOL_SIZE
}

fn default_accounting_interval_secs() -> u64 {
    DEFAULT_ACCOUNTING_INTERVAL_SECS
}

fn default_accounting_tick_secs() -> u64 {
    DEFAULT_ACCOUNTING_TICK_SECS
}

fn default_min_confirmations() -> u32 {
    DEFAULT_MIN_CONFIRMATIONS
}

fn deserialize_money_opt<'de, D>(deserializer: D) -> Result<Option<Money>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    s.map(|s| Money::parse(&s).map_err(de::Error::custom))
        .transpose()
}

fn serialize_money_opt<S>(value: &Option<Money>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(m) => serializer.serialize_str(&m.format()),
        None => serializer.serialize_none(),
    }
}

/// Raw shape of the mutually-exclusive bitcoind auth fields in the TOML
/// file; never constructed directly outside of (de)serialization.
#[derive(Debug, Deserialize, Serialize)]
struct RawBitcoindAuth {
    cookie_path: Option<PathBuf>,
    rpc_user: Option<String>,
    rpc_password: Option<String>,
}

pub enum BitcoindRpcAuth {
    CookieFile(PathBuf),
    UserPass(String, String),
}

// Hand-written to avoid ever printing rpc_password.
impl fmt::Debug for BitcoindRpcAuth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BitcoindRpcAuth::CookieFile(p) => f.debug_tuple("CookieFile").field(p).finish(),
            BitcoindRpcAuth::UserPass(user, _) => {
                f.debug_tuple("UserPass").field(user).field(&"<redacted>").finish()
            }
        }
    }
}

fn deserialize_rpc_auth<'de, D>(deserializer: D) -> Result<BitcoindRpcAuth, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = RawBitcoindAuth::deserialize(deserializer)?;
    match (raw.cookie_path, raw.rpc_user, raw.rpc_password) {
        (Some(path), None, None) => Ok(BitcoindRpcAuth::CookieFile(path)),
        (None, Some(user), Some(pass)) => Ok(BitcoindRpcAuth::UserPass(user, pass)),
        _ => Err(de::Error::custom(
            "bitcoind auth must be exactly one of `cookie_path` or `rpc_user`+`rpc_password`",
        )),
    }
}

fn serialize_rpc_auth<S>(auth: &BitcoindRpcAuth, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let raw = match auth {
        BitcoindRpcAuth::CookieFile(path) => RawBitcoindAuth {
            cookie_path: Some(path.clone()),
            rpc_user: None,
            rpc_password: None,
        },
        BitcoindRpcAuth::UserPass(user, pass) => RawBitcoindAuth {
            cookie_path: None,
            rpc_user: Some(user.clone()),
            rpc_password: Some(pass.clone()),
        },
    };
    raw.serialize(serializer)
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BitcoindConfig {
    #[serde(flatten, deserialize_with = "deserialize_rpc_auth", serialize_with = "serialize_rpc_auth")]
    pub rpc_auth: BitcoindRpcAuth,
    pub addr: SocketAddr,
}

#[derive(Deserialize, Serialize)]
pub struct Config {
    pub data_dir: Option<PathBuf>,

    #[serde(
        default = "default_log_level",
        deserialize_with = "deserialize_log_level",
        serialize_with = "serialize_log_level"
    )]
    pub log_level: log::LevelFilter,

    #[serde(
        default = "default_listen_addr",
        deserialize_with = "deserialize_fromstr",
        serialize_with = "serialize_to_string"
    )]
    pub listen_addr: SocketAddr,

    #[serde(default = "default_vending_pool_size")]
    pub vending_pool_size: usize,

    #[serde(
        default,
        deserialize_with = "deserialize_money_opt",
        serialize_with = "serialize_money_opt"
    )]
    pub max_balance: Option<Money>,

    #[serde(default = "default_accounting_interval_secs")]
    pub accounting_interval_secs: u64,

    #[serde(default = "default_accounting_tick_secs")]
    pub accounting_tick_secs: u64,

    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u32,

    pub bitcoind: BitcoindConfig,

    #[serde(default, rename = "policy")]
    pub policies: Vec<PolicyConfig>,
}

#[derive(Debug)]
pub enum ConfigError {
    DatadirNotFound,
    FileNotFound,
    ReadingFile(String),
    BadPolicy(PolicyConfigError),
    Unexpected(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::DatadirNotFound => write!(f, "could not locate a home directory to default the data directory into"),
            ConfigError::FileNotFound => write!(f, "configuration file not found"),
            ConfigError::ReadingFile(e) => write!(f, "error reading configuration file: {}", e),
            ConfigError::BadPolicy(e) => write!(f, "invalid policy in configuration: {}", e),
            ConfigError::Unexpected(e) => write!(f, "unexpected configuration error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound,
            _ => ConfigError::ReadingFile(e.to_string()),
        }
    }
}

/// `~/.oc` on Linux/macOS (matches the app's own data dir convention),
/// `dirs::config_dir()/Oc` elsewhere.
pub fn config_folder_path() -> Result<PathBuf, ConfigError> {
    #[cfg(target_os = "linux")]
    {
        dirs::home_dir()
            .map(|d| d.join(".oc"))
            .ok_or(ConfigError::DatadirNotFound)
    }
    #[cfg(not(target_os = "linux"))]
    {
        dirs::config_dir()
            .map(|d| d.join("Oc"))
            .ok_or(ConfigError::DatadirNotFound)
    }
}

impl Config {
    pub fn from_file(custom_path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let path = match custom_path {
            Some(p) => p,
            None => config_folder_path()?.join("oc.toml"),
        };
        let contents = fs::read(&path)?;
        let config: Config =
            toml::from_slice(&contents).map_err(|e| ConfigError::ReadingFile(e.to_string()))?;
        Ok(config)
    }

    /// Validated policies, parsed from the raw TOML representation.
    pub fn policies(&self) -> Result<Vec<Policy>, ConfigError> {
        self.policies
            .iter()
            .cloned()
            .map(Policy::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ConfigError::BadPolicy)
    }

    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(d) => Ok(d.clone()),
            None => Ok(config_folder_path()?),
        }
    }
}
