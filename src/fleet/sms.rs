//! On-demand SMS retrieval for one SIM.

use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use super::guard::{GuardOutcome, IdentityGuard};
use super::Fleet;
use crate::logutil::escape_log;
use crate::modem::sms::{parse_listing, resolve_sender, SmsEntry};
use crate::modem::{ChannelError, CMGF_TEXT, CMGL_ALL, CPMS_SIM, CSCS_GSM, CSCS_QUERY, DEFAULT_TERMINALS};
use crate::storage::{SmsRecord, StoreError, SMS_SCHEMA_VERSION};

#[derive(Debug, Error)]
pub enum SmsError {
    #[error("no SIM with ICCID {0}")]
    SimNotFound(String),
    #[error("SIM {0} is not bound to a port")]
    NoPort(String),
    #[error(transparent)]
    Connect(#[from] ChannelError),
    #[error("port {port} now holds {found}, not {iccid}")]
    IdentityMismatch {
        iccid: String,
        port: String,
        found: String,
    },
    #[error("ICCID unreadable on {0}")]
    IccidUnreadable(String),
    #[error("{command} failed: {}", .response.as_deref().unwrap_or("no response"))]
    CommandFailed {
        command: String,
        response: Option<String>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmsReport {
    pub iccid: String,
    pub phone_number: Option<String>,
    /// Messages as stored, senders decoded.
    pub messages: Vec<SmsEntry>,
    /// Messages whose sender could not be decoded; not stored.
    pub rejected: usize,
}

#[derive(Clone)]
pub struct SmsRetriever {
    fleet: Fleet,
    guard: IdentityGuard,
}

impl SmsRetriever {
    pub fn new(fleet: Fleet) -> Self {
        let guard = IdentityGuard::new(fleet.registry.clone());
        Self { fleet, guard }
    }

    pub async fn retrieve(&self, iccid: &str) -> Result<SmsReport, SmsError> {
        let record = self
            .fleet
            .registry
            .find_sim(iccid)
            .await?
            .ok_or_else(|| SmsError::SimNotFound(iccid.to_string()))?;
        let port_id = record
            .com_port
            .clone()
            .ok_or_else(|| SmsError::NoPort(iccid.to_string()))?;

        let mut session = self.fleet.access.session(&port_id).await?;
        match self.guard.verify(&mut session, &record).await? {
            GuardOutcome::Confirmed => {}
            GuardOutcome::Mismatch { found } => {
                return Err(SmsError::IdentityMismatch {
                    iccid: iccid.to_string(),
                    port: port_id,
                    found,
                })
            }
            GuardOutcome::Unreadable => return Err(SmsError::IccidUnreadable(port_id)),
        }

        let list_timeout = Duration::from_millis(self.fleet.config.commands.sms_list_timeout_ms);
        let mut listing = String::new();
        for command in [CSCS_QUERY, CSCS_GSM, CMGF_TEXT, CPMS_SIM, CMGL_ALL] {
            let exchange = if command == CMGL_ALL {
                session.execute(command, list_timeout, DEFAULT_TERMINALS).await
            } else {
                session.command(command).await
            };
            if !exchange.is_ok() {
                warn!(
                    "{}: {} failed: {}",
                    port_id,
                    command,
                    escape_log(exchange.text().unwrap_or("<no response>"))
                );
                return Err(SmsError::CommandFailed {
                    command: command.to_string(),
                    response: exchange.response,
                });
            }
            if command == CMGL_ALL {
                listing = exchange.response.unwrap_or_default();
            }
        }
        drop(session);

        let mut messages = Vec::new();
        let mut rejected = 0;
        for mut entry in parse_listing(&listing) {
            match resolve_sender(&entry.sender) {
                Ok(sender) => entry.sender = sender,
                Err(e) => {
                    warn!("{}: message {} not stored: {}", iccid, entry.index, e);
                    rejected += 1;
                    continue;
                }
            }
            let now = Utc::now();
            let stored = SmsRecord {
                schema_version: SMS_SCHEMA_VERSION,
                sim_identity: record.sms_identity().to_string(),
                iccid: record.iccid.clone(),
                sender: entry.sender.clone(),
                time: entry.time.clone(),
                content: entry.content.clone(),
                status: entry.status.clone(),
                modem_index: entry.index.clone(),
                first_seen_at: now,
                updated_at: now,
            };
            self.fleet.registry.upsert_sms(&stored).await?;
            messages.push(entry);
        }
        info!(
            "{}: {} message(s) retrieved, {} rejected",
            iccid,
            messages.len(),
            rejected
        );
        Ok(SmsReport {
            iccid: record.iccid.clone(),
            phone_number: record.phone_number.clone(),
            messages,
            rejected,
        })
    }
}
