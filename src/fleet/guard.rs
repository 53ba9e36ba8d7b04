//! Identity guard: a port recorded against an ICCID may silently host another SIM after
//! a swap. Before trusting a port on behalf of a record, the live ICCID is read back and
//! compared; a mismatch releases the stale binding so rediscovery can take over.

use log::{info, warn};

use crate::metrics;
use crate::modem::{decode, AtChannel, CCID};
use crate::storage::repository::Registry;
use crate::storage::{SimRecord, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    Confirmed,
    /// The port holds a different SIM; the record was unbound from it.
    Mismatch { found: String },
    /// The ICCID could not be read; nothing was changed.
    Unreadable,
}

#[derive(Clone)]
pub struct IdentityGuard {
    registry: Registry,
}

impl IdentityGuard {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub async fn verify(&self, channel: &mut AtChannel, record: &SimRecord) -> Result<GuardOutcome, StoreError> {
        let exchange = channel.command(CCID).await;
        let Some(found) = decode::iccid(exchange.text()) else {
            warn!("{}: ICCID unreadable, expected {}", channel.port_id(), record.iccid);
            return Ok(GuardOutcome::Unreadable);
        };
        if found == record.iccid {
            return Ok(GuardOutcome::Confirmed);
        }
        metrics::inc_identity_mismatches();
        warn!(
            "{}: holds ICCID {} but registry expected {}",
            channel.port_id(),
            found,
            record.iccid
        );
        self.evict(&record.iccid, channel.port_id()).await?;
        Ok(GuardOutcome::Mismatch { found })
    }

    /// Clear `port` from the record of `iccid` and append it to its port history.
    pub async fn evict(&self, iccid: &str, port: &str) -> Result<bool, StoreError> {
        let released = self.registry.release_port(iccid, port).await?;
        if released {
            info!("Released stale binding {} -> {}", iccid, port);
        }
        Ok(released)
    }
}
