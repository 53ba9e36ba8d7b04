//! Discovery loop: keeps the tracked-port set in line with the host's serial interfaces.
//!
//! Per enumerated port: `unseen -> probing -> tracked -> (evicted)`. A port is only
//! tracked once `AT` answers `OK` and `AT+CPIN?` reports a ready SIM; anything less
//! leaves it unseen and it is probed again next tick.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info};

use super::ports::TrackedPort;
use super::Fleet;
use crate::modem::decode::{self, SimReadiness};
use crate::modem::link::PortInfo;
use crate::modem::{AtChannel, AT, CPIN};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryCycle {
    pub candidates: usize,
    pub admitted: Vec<String>,
    pub evicted: Vec<String>,
}

/// `AT` then `AT+CPIN?`.
pub async fn probe(channel: &mut AtChannel) -> SimReadiness {
    if !channel.command(AT).await.is_ok() {
        return SimReadiness::Unknown;
    }
    decode::sim_readiness(channel.command(CPIN).await.text())
}

#[derive(Clone)]
pub struct Discovery {
    fleet: Fleet,
}

impl Discovery {
    pub fn new(fleet: Fleet) -> Self {
        Self { fleet }
    }

    /// Enumerated ports whose description passes the USB filter.
    pub fn candidates(&self) -> Result<Vec<PortInfo>> {
        let filter = &self.fleet.config.serial.usb_filter;
        let ports = self
            .fleet
            .access
            .provider()
            .enumerate()
            .context("serial port enumeration failed")?;
        Ok(ports.into_iter().filter(|p| p.matches(filter)).collect())
    }

    pub async fn run_once(&self) -> Result<DiscoveryCycle> {
        let candidates = self.candidates()?;
        let present: HashSet<String> = candidates.iter().map(|p| p.device_path.clone()).collect();
        let evicted = self.fleet.ports.retain(&present).await;

        let mut admitted = Vec::new();
        for port in &candidates {
            if self.fleet.ports.contains(&port.device_path).await {
                continue;
            }
            if let Some(readiness) = self.probe_port(&port.device_path).await {
                if readiness.is_ready() {
                    let tracked = TrackedPort {
                        port_id: port.device_path.clone(),
                        description: port.description.clone(),
                        readiness,
                        added_at: Utc::now(),
                    };
                    if self.fleet.ports.track(tracked).await {
                        admitted.push(port.device_path.clone());
                    }
                } else {
                    debug!("{}: not ready ({})", port.device_path, readiness);
                }
            }
        }
        if !admitted.is_empty() || !evicted.is_empty() {
            info!(
                "discovery: {} candidate(s), admitted {:?}, evicted {:?}",
                candidates.len(),
                admitted,
                evicted
            );
        }
        Ok(DiscoveryCycle {
            candidates: candidates.len(),
            admitted,
            evicted,
        })
    }

    /// Single open attempt; `None` when another session holds the port.
    async fn probe_port(&self, port_id: &str) -> Option<SimReadiness> {
        match self.fleet.access.try_session(port_id).await? {
            Ok(mut session) => Some(probe(&mut session).await),
            Err(e) => {
                let readiness = SimReadiness::from_open_error(&e);
                debug!("{}: probe open failed ({}): {}", port_id, readiness, e);
                Some(readiness)
            }
        }
    }
}
