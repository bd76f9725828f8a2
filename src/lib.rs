//! A daemon implementing a peer-to-peer paid-service protocol: nodes
//! expose named services and charge other nodes per request, settling via
//! Bitcoin. This crate is the protocol core — framing, identity recovery,
//! coin-binding, policy, and the durable per-peer ledger — plus a couple of
//! demonstration service handlers.

pub mod accounting;
pub mod config;
pub mod datadir;
pub mod db;
pub mod dispatch;
pub mod ident;
pub mod ledger;
pub mod money;
pub mod msg;
pub mod peer;
pub mod pipeline;
pub mod policy;
pub mod selection;
pub mod vending;
pub mod wallet;

use std::fmt;
use std::net::TcpListener;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use accounting::{AccountingMessage, BillingRegistry};
use config::{BitcoindRpcAuth, Config, ConfigError};
use datadir::DataDirectory;
use db::DbError;
use dispatch::Registry;
use ident::{Credential, CredentialError};
use ledger::Ledger;
use peer::PeerRegistry;
use vending::VendingPool;
use wallet::{BitcoindWallet, Wallet, WalletError};

/// Set up a panic hook that prints a backtrace, since the stdlib does not
/// yet expose one through the default hook in a way our log format can use.
pub fn setup_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let bt = backtrace::Backtrace::new();
        log::error!("panic: {}\n{:?}", info, bt);
    }));
}

#[derive(Debug, Clone, Copy)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

pub const VERSION: Version = Version { major: 0, minor: 1 };

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}-dev", self.major, self.minor)
    }
}

#[derive(Debug)]
pub enum StartupError {
    Io(std::io::Error),
    DatadirCreation(std::io::Error),
    Credential(CredentialError),
    Database(DbError),
    Config(ConfigError),
    Wallet(WalletError),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StartupError::Io(e) => write!(f, "i/o error during startup: {}", e),
            StartupError::DatadirCreation(e) => write!(f, "could not create data directory: {}", e),
            StartupError::Credential(e) => write!(f, "could not set up identity: {}", e),
            StartupError::Database(e) => write!(f, "could not set up database: {}", e),
            StartupError::Config(e) => write!(f, "invalid configuration: {}", e),
            StartupError::Wallet(e) => write!(f, "could not reach the wallet: {}", e),
        }
    }
}

impl std::error::Error for StartupError {}

impl From<std::io::Error> for StartupError {
    fn from(e: std::io::Error) -> Self {
        StartupError::Io(e)
    }
}
impl From<CredentialError> for StartupError {
    fn from(e: CredentialError) -> Self {
        StartupError::Credential(e)
    }
}
impl From<DbError> for StartupError {
    fn from(e: DbError) -> Self {
        StartupError::Database(e)
    }
}
impl From<ConfigError> for StartupError {
    fn from(e: ConfigError) -> Self {
        StartupError::Config(e)
    }
}
impl From<WalletError> for StartupError {
    fn from(e: WalletError) -> Self {
        StartupError::Wallet(e)
    }
}

/// Everything the admission pipeline and the periodic accounting thread
/// need, wired up once at startup and shared read-only (aside from the
/// internally-synchronized stores) across every connection thread.
pub struct Core {
    pub config: Config,
    pub credential: Credential,
    pub peers: PeerRegistry,
    pub ledger: Arc<Ledger>,
    pub vending: Arc<VendingPool>,
    pub wallet: Arc<dyn Wallet>,
    pub policies: Vec<policy::Policy>,
    pub dispatch: Registry,
    pub billing: Arc<BillingRegistry>,
}

fn setup_wallet(config: &Config) -> Result<Arc<dyn Wallet>, StartupError> {
    let auth = &config.bitcoind.rpc_auth;
    let addr = config.bitcoind.addr.to_string();
    let wallet = match auth {
        BitcoindRpcAuth::CookieFile(path) => BitcoindWallet::new(&addr, Some(path), None)?,
        BitcoindRpcAuth::UserPass(user, pass) => {
            BitcoindWallet::new(&addr, None, Some((user.clone(), pass.clone())))?
        }
    };
    Ok(Arc::new(wallet))
}

impl Core {
    /// Build a `Core` from a config and a datadir, optionally overriding
    /// the wallet (tests substitute a `FakeWallet`) and supplying a closure
    /// that installs demonstration or production handlers onto the
    /// dispatch registry.
    pub fn new(
        config: Config,
        data_dir: &DataDirectory,
        wallet: Option<Arc<dyn Wallet>>,
        install_handlers: impl FnOnce(Registry, Arc<VendingPool>, Arc<dyn Wallet>) -> Registry,
    ) -> Result<Core, StartupError> {
        data_dir.init().map_err(StartupError::DatadirCreation)?;

        let credential = Credential::init_or_load(&data_dir.node_id_priv_path())?;

        // Three independent connections share one sqlite file: `db::open`
        // runs schema/version setup once, the other two just need the same
        // WAL + busy-timeout pragmas so cross-connection writers wait
        // instead of bouncing off SQLITE_BUSY.
        let peers_conn = db::open(&data_dir.sqlite_db_file_path())?;
        let ledger_conn = rusqlite::Connection::open(&data_dir.sqlite_db_file_path())?;
        db::configure_connection(&ledger_conn)?;
        let vending_conn = rusqlite::Connection::open(&data_dir.sqlite_db_file_path())?;
        db::configure_connection(&vending_conn)?;

        let wallet = match wallet {
            Some(w) => w,
            None => setup_wallet(&config)?,
        };

        let policies = config.policies()?;
        let vending = Arc::new(VendingPool::new(vending_conn, config.vending_pool_size));
        let dispatch = install_handlers(Registry::new(), vending.clone(), wallet.clone());

        Ok(Core {
            peers: PeerRegistry::new(peers_conn),
            ledger: Arc::new(Ledger::new(ledger_conn)),
            vending,
            wallet,
            policies,
            dispatch,
            billing: Arc::new(BillingRegistry::new()),
            config,
            credential,
        })
    }
}

impl From<rusqlite::Error> for StartupError {
    fn from(e: rusqlite::Error) -> Self {
        StartupError::Database(DbError::from(e))
    }
}

/// Owns the running server's threads and exposes the lifecycle the `ocd`
/// binary drives: `start`, `is_alive`, `stop`.
pub struct DaemonHandle {
    shutdown: Arc<AtomicBool>,
    accounting_sender: mpsc::Sender<AccountingMessage>,
    accounting_handle: Option<thread::JoinHandle<()>>,
    server_handle: Option<thread::JoinHandle<()>>,
}

impl DaemonHandle {
    pub fn start(
        config: Config,
        data_dir: DataDirectory,
        wallet: Option<Arc<dyn Wallet>>,
        install_handlers: impl FnOnce(Registry, Arc<VendingPool>, Arc<dyn Wallet>) -> Registry,
    ) -> Result<DaemonHandle, StartupError> {
        let listen_addr = config.listen_addr;
        let tick = Duration::from_secs(config.accounting_tick_secs);

        let core = Arc::new(Core::new(config, &data_dir, wallet, install_handlers)?);

        let (accounting_sender, accounting_receiver) = mpsc::channel();
        let accounting_ledger = core.ledger.clone();
        let accounting_billing = core.billing.clone();
        let accounting_handle = thread::Builder::new()
            .name("oc-accounting".to_string())
            .spawn(move || accounting::run(accounting_ledger, accounting_billing, tick, accounting_receiver))
            .map_err(StartupError::Io)?;

        let listener = TcpListener::bind(listen_addr)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let server_core = core.clone();
        let server_shutdown = shutdown.clone();
        let server_handle = thread::Builder::new()
            .name("oc-server".to_string())
            .spawn(move || pipeline::serve(server_core, listener, server_shutdown))
            .map_err(StartupError::Io)?;

        Ok(DaemonHandle {
            shutdown,
            accounting_sender,
            accounting_handle: Some(accounting_handle),
            server_handle: Some(server_handle),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.accounting_handle
            .as_ref()
            .map_or(false, |h| !h.is_finished())
            && self.server_handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.accounting_sender.send(AccountingMessage::Shutdown);
        if let Some(h) = self.server_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.accounting_handle.take() {
            let _ = h.join();
        }
    }
}
