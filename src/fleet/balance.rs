//! Balance poller: refreshes the prepaid balance of bound, registered SIMs over USSD.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::time::sleep;

use super::guard::{GuardOutcome, IdentityGuard};
use super::Fleet;
use crate::logutil::escape_log;
use crate::modem::ussd;
use crate::storage::{BalanceUpdate, SimFilter, SimRecord, SimUpdate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceOutcome {
    Updated(Box<SimRecord>),
    /// Left for the next cycle.
    Skipped(&'static str),
    IdentityMismatch { found: String },
}

#[derive(Clone)]
pub struct BalancePoller {
    fleet: Fleet,
    guard: IdentityGuard,
}

impl BalancePoller {
    pub fn new(fleet: Fleet) -> Self {
        let guard = IdentityGuard::new(fleet.registry.clone());
        Self { fleet, guard }
    }

    /// Query every SIM on a tracked port whose balance is missing or older than the
    /// refresh window. Records still bound to vanished ports do not take batch slots.
    pub async fn run_once(&self) -> Result<Vec<(String, BalanceOutcome)>> {
        let polling = &self.fleet.config.polling;
        let window = chrono::Duration::seconds(polling.balance_refresh_secs as i64);
        let tracked: BTreeSet<String> = self.fleet.ports.port_ids().await.into_iter().collect();
        if tracked.is_empty() {
            return Ok(Vec::new());
        }
        let due = SimFilter::balance_due(Utc::now() - window, tracked);
        let sims = self.fleet.registry.find_sims(&due, 0, polling.balance_batch).await?;
        let pacing = Duration::from_millis(polling.port_pacing_ms);
        let mut results = Vec::with_capacity(sims.len());
        for (i, record) in sims.iter().enumerate() {
            if i > 0 {
                sleep(pacing).await;
            }
            let outcome = self.query(record).await?;
            results.push((record.iccid.clone(), outcome));
        }
        Ok(results)
    }

    pub async fn query(&self, record: &SimRecord) -> Result<BalanceOutcome> {
        let Some(port_id) = record.com_port.as_deref() else {
            return Ok(BalanceOutcome::Skipped("no port"));
        };
        if !self.fleet.ports.contains(port_id).await {
            debug!("{}: {} not tracked, balance deferred", record.iccid, port_id);
            return Ok(BalanceOutcome::Skipped("port not tracked"));
        }
        let mut session = match self.fleet.access.session(port_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!("{}: balance skipped: {}", port_id, e);
                return Ok(BalanceOutcome::Skipped("connect failed"));
            }
        };
        match self.guard.verify(&mut session, record).await? {
            GuardOutcome::Confirmed => {}
            GuardOutcome::Mismatch { found } => return Ok(BalanceOutcome::IdentityMismatch { found }),
            GuardOutcome::Unreadable => return Ok(BalanceOutcome::Skipped("iccid unreadable")),
        }

        let commands = &self.fleet.config.commands;
        let exchange = session
            .execute(
                &ussd::balance_command(&commands.ussd_balance_code),
                Duration::from_millis(commands.ussd_timeout_ms),
                ussd::TERMINALS,
            )
            .await;
        drop(session);

        let Some(raw) = exchange.response else {
            warn!("{}: no USSD answer for {}", port_id, record.iccid);
            return Ok(BalanceOutcome::Skipped("no answer"));
        };
        if !ussd::is_answer(&raw) {
            warn!("{}: USSD refused: {}", port_id, escape_log(&raw));
            return Ok(BalanceOutcome::Skipped("refused"));
        }
        let payload = ussd::payload(&raw);
        let info = ussd::decode_balance(&payload);
        let update = SimUpdate {
            balance: Some(BalanceUpdate {
                balance: info.balance,
                raw: payload,
                phone_number: info.phone,
            }),
            ..SimUpdate::default()
        };
        let stored = self.fleet.registry.upsert_sim(&record.iccid, &update).await?;
        info!(
            "{}: balance {} phone {}",
            stored.iccid,
            stored.balance.as_deref().unwrap_or("?"),
            stored.phone_number.as_deref().unwrap_or("?")
        );
        Ok(BalanceOutcome::Updated(Box::new(stored)))
    }
}
