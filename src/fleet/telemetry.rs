//! Telemetry poller: runs the AT battery on every tracked port and writes the results to
//! the SIM record of the ICCID found there.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::time::sleep;

use super::guard::IdentityGuard;
use super::Fleet;
use crate::metrics;
use crate::modem::decode::{self, SimReadiness};
use crate::modem::{AtChannel, ChannelError, CCID, CIMI, COPS, CPIN, CREG, CSQ};
use crate::storage::{SimFilter, SimUpdate, TelemetrySnapshot};

/// Result of one battery on one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Battery {
    /// `AT+CPIN?` unanswered or not ready; the rest was skipped.
    NotReady {
        readiness: SimReadiness,
        cpin: Option<String>,
    },
    /// The SIM answered everything but its ICCID, so there is no record to write.
    NoIccid { snapshot: TelemetrySnapshot },
    Complete {
        iccid: String,
        snapshot: TelemetrySnapshot,
    },
}

/// Run `{CPIN?, CREG?, COPS?, CCID, CSQ, <network info>, CIMI}` in order.
///
/// The first unanswered command stops the battery so a stuck modem is not held for
/// the remaining deadlines; what was read so far is still returned.
pub async fn run_battery(channel: &mut AtChannel, network_info_command: &str) -> Battery {
    let mut timings = BTreeMap::new();

    let cpin = channel.command(CPIN).await;
    timings.insert(CPIN.to_string(), cpin.elapsed.as_millis() as u64);
    let readiness = decode::sim_readiness(cpin.text());
    if !readiness.is_ready() {
        return Battery::NotReady {
            readiness,
            cpin: decode::cpin_payload(cpin.text()),
        };
    }

    let steps = [CREG, COPS, CCID, CSQ, network_info_command, CIMI];
    let mut answers: [Option<String>; 6] = Default::default();
    for (answer, command) in answers.iter_mut().zip(steps) {
        let exchange = channel.command(command).await;
        timings.insert(command.to_string(), exchange.elapsed.as_millis() as u64);
        if exchange.response.is_none() {
            warn!("{}: {} unanswered, battery stopped", channel.port_id(), command);
            break;
        }
        *answer = exchange.response;
    }
    let [creg, cops, ccid, csq, netinfo, cimi] = answers;

    let snapshot = TelemetrySnapshot {
        imsi: decode::imsi(cimi.as_deref()),
        registration_status: decode::registration(creg.as_deref()),
        signal_quality: decode::signal_quality(csq.as_deref()),
        operator_info: decode::operator(cops.as_deref()),
        network_info: decode::network_info(netinfo.as_deref()),
        cpin: decode::cpin_payload(cpin.text()),
        exchange_timings: timings,
    };
    match decode::iccid(ccid.as_deref()) {
        Some(iccid) => Battery::Complete { iccid, snapshot },
        None => Battery::NoIccid { snapshot },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetryCycle {
    pub polled: usize,
    pub evicted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortOutcome {
    Polled,
    Evicted,
    Skipped,
}

#[derive(Clone)]
pub struct TelemetryPoller {
    fleet: Fleet,
    guard: IdentityGuard,
}

impl TelemetryPoller {
    pub fn new(fleet: Fleet) -> Self {
        let guard = IdentityGuard::new(fleet.registry.clone());
        Self { fleet, guard }
    }

    pub async fn run_once(&self) -> Result<TelemetryCycle> {
        let ports = self.fleet.ports.port_ids().await;
        let pacing = Duration::from_millis(self.fleet.config.polling.port_pacing_ms);
        let mut cycle = TelemetryCycle::default();
        for (i, port_id) in ports.iter().enumerate() {
            if i > 0 {
                sleep(pacing).await;
            }
            match self.poll_port(port_id).await? {
                PortOutcome::Polled => cycle.polled += 1,
                PortOutcome::Evicted => cycle.evicted += 1,
                PortOutcome::Skipped => cycle.skipped += 1,
            }
        }
        if !ports.is_empty() {
            debug!(
                "telemetry cycle: polled={} evicted={} skipped={} | {}",
                cycle.polled,
                cycle.evicted,
                cycle.skipped,
                metrics::snapshot()
            );
        }
        Ok(cycle)
    }

    async fn poll_port(&self, port_id: &str) -> Result<PortOutcome> {
        let mut session = match self.fleet.access.session(port_id).await {
            Ok(s) => s,
            Err(ChannelError::NotFound(_)) => {
                self.fleet.ports.evict(port_id, "device node gone").await;
                return Ok(PortOutcome::Evicted);
            }
            Err(e) => {
                warn!("{}: skipped this cycle: {}", port_id, e);
                return Ok(PortOutcome::Skipped);
            }
        };
        let battery = run_battery(&mut session, &self.fleet.config.commands.network_info).await;
        drop(session);

        match battery {
            Battery::NotReady { readiness, .. } => {
                let reason = format!("SIM not ready ({})", readiness);
                self.fleet.ports.evict(port_id, &reason).await;
                Ok(PortOutcome::Evicted)
            }
            Battery::NoIccid { .. } => {
                warn!("{}: ICCID unreadable, nothing written", port_id);
                Ok(PortOutcome::Skipped)
            }
            Battery::Complete { iccid, snapshot } => {
                self.release_other_claims(port_id, &iccid).await?;
                let update = SimUpdate {
                    telemetry: Some(snapshot),
                    bind_port: Some(port_id.to_string()),
                    balance: None,
                };
                let record = self.fleet.registry.upsert_sim(&iccid, &update).await?;
                info!(
                    "{}: {} {} csq={:?}",
                    port_id,
                    record.iccid,
                    record.registration_status,
                    record.signal_quality
                );
                Ok(PortOutcome::Polled)
            }
        }
    }

    /// Any other record still bound to `port_id` is stale now that `iccid` sits there.
    async fn release_other_claims(&self, port_id: &str, iccid: &str) -> Result<()> {
        let claims = self
            .fleet
            .registry
            .find_sims(&SimFilter::by_port(port_id), 0, usize::MAX)
            .await?;
        for stale in claims.iter().filter(|r| r.iccid != iccid) {
            metrics::inc_identity_mismatches();
            self.guard.evict(&stale.iccid, port_id).await?;
        }
        Ok(())
    }
}
