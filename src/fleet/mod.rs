//! # Fleet engine
//!
//! Ties the AT channel, the tracked-port set and the registry together into the
//! background loops and the request boundary.
//!
//! - [`discovery`] admits ready USB modems into the [`ports::PortRegistry`] and drops
//!   vanished ones.
//! - [`telemetry`] runs the AT battery on every tracked port and upserts SIM records.
//! - [`balance`] refreshes prepaid balances over USSD.
//! - [`sms`] lists and stores the messages of one SIM on request.
//! - [`guard`] rechecks a port's ICCID before balance or SMS work trusts it.
//! - [`gateway`] is the read/trigger surface used by the CLI.
//! - [`control`] exposes the gateway of a running bridge on a local socket.
//!
//! Every hardware session holds the port's lock from open to close, so two loops never
//! talk to one modem at once while different modems proceed independently.

pub mod balance;
pub mod control;
pub mod discovery;
pub mod gateway;
pub mod guard;
pub mod ports;
pub mod sms;
pub mod supervisor;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};

use crate::config::Config;
use crate::metrics;
use crate::modem::link::LinkProvider;
use crate::storage::repository::Registry;
use crate::storage::sled_store::SledStore;
use balance::BalancePoller;
use control::ControlServer;
use discovery::Discovery;
use gateway::Gateway;
use ports::{PortAccess, PortRegistry};
use sms::SmsRetriever;
use supervisor::Supervisor;
use telemetry::TelemetryPoller;

/// Services shared by every loop, constructed once at startup.
#[derive(Clone)]
pub struct Fleet {
    pub config: Arc<Config>,
    pub ports: Arc<PortRegistry>,
    pub access: Arc<PortAccess>,
    pub registry: Registry,
}

impl Fleet {
    pub fn new(config: Arc<Config>, provider: Arc<dyn LinkProvider>, registry: Registry) -> Self {
        let access = PortAccess::new(
            provider,
            config.serial.baud_rate,
            config.connect_policy(),
            config.command_timeout(),
        );
        Self {
            config,
            ports: Arc::new(PortRegistry::new()),
            access: Arc::new(access),
            registry,
        }
    }
}

/// The assembled bridge: fleet services plus the registry store they write to.
pub struct Bridge {
    fleet: Fleet,
    store: Arc<SledStore>,
}

impl Bridge {
    /// Open the sled registry under `storage.data_dir` and build the fleet on `provider`.
    pub fn open(config: Config, provider: Arc<dyn LinkProvider>) -> Result<Self> {
        let store = Arc::new(SledStore::open(SledStore::path_in(&config.storage.data_dir))?);
        let registry = Registry::new(store.clone(), store.clone(), config.store_policy());
        let fleet = Fleet::new(Arc::new(config), provider, registry);
        Ok(Self { fleet, store })
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub fn gateway(&self) -> Gateway {
        Gateway::new(self.fleet.registry.clone(), SmsRetriever::new(self.fleet.clone()))
    }

    /// Spawn the discovery, telemetry and balance loops.
    pub fn start(&self) -> Supervisor {
        let polling = &self.fleet.config.polling;
        let backoff = self.fleet.config.iteration_backoff();
        let mut sup = Supervisor::new();

        let discovery = Discovery::new(self.fleet.clone());
        sup.spawn(
            "discovery",
            Duration::from_millis(polling.discovery_interval_ms),
            backoff,
            move || {
                let d = discovery.clone();
                async move { d.run_once().await.map(|_| ()) }
            },
        );

        let telemetry = TelemetryPoller::new(self.fleet.clone());
        sup.spawn(
            "telemetry",
            Duration::from_millis(polling.telemetry_interval_ms),
            backoff,
            move || {
                let t = telemetry.clone();
                async move { t.run_once().await.map(|_| ()) }
            },
        );

        let balance = BalancePoller::new(self.fleet.clone());
        sup.spawn(
            "balance",
            Duration::from_millis(polling.balance_interval_ms),
            backoff,
            move || {
                let b = balance.clone();
                async move { b.run_once().await.map(|_| ()) }
            },
        );

        sup
    }

    /// Run every loop and the control endpoint until Ctrl-C, then stop them and flush
    /// the registry.
    pub async fn run(self) -> Result<()> {
        info!("Bridge '{}' starting", self.fleet.config.bridge.name);
        let control_cfg = &self.fleet.config.control;
        let control = if control_cfg.enabled {
            Some(ControlServer::bind(&control_cfg.listen, self.gateway()).await?)
        } else {
            None
        };
        let supervisor = self.start();
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");
        if let Some(control) = control {
            control.shutdown().await;
        }
        supervisor.shutdown().await;
        if let Err(e) = self.store.flush() {
            warn!("registry flush failed: {}", e);
        }
        info!("Bridge stopped | {}", metrics::snapshot());
        Ok(())
    }
}
