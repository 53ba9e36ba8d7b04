//! Request boundary over the registry and the SMS retriever.
//!
//! Callers get a record, a page or a not-found/failure signal; hardware, decode and
//! store errors are logged here and never passed through.

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::sms::{SmsError, SmsReport, SmsRetriever};
use crate::storage::repository::Registry;
use crate::storage::{SimFilter, SimRecord};

pub const DEFAULT_PAGE: usize = 100;
pub const MAX_PAGE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayError {
    #[error("not found")]
    NotFound,
    #[error("request failed")]
    Failed,
    #[error("malformed request")]
    BadRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimQuery {
    pub com_port: Option<String>,
    #[serde(default)]
    pub skip: usize,
    pub limit: Option<usize>,
}

impl SimQuery {
    /// Requested page size clamped to `1..=MAX_PAGE`.
    pub fn page_size(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimPage {
    pub items: Vec<SimRecord>,
    /// Matching records in total, ignoring pagination.
    pub count: usize,
}

#[derive(Clone)]
pub struct Gateway {
    registry: Registry,
    retriever: SmsRetriever,
}

impl Gateway {
    pub fn new(registry: Registry, retriever: SmsRetriever) -> Self {
        Self { registry, retriever }
    }

    pub async fn sim(&self, iccid: &str) -> Result<SimRecord, GatewayError> {
        match self.registry.find_sim(iccid).await {
            Ok(Some(r)) => Ok(r),
            Ok(None) => Err(GatewayError::NotFound),
            Err(e) => {
                warn!("sim {} lookup failed: {}", iccid, e);
                Err(GatewayError::Failed)
            }
        }
    }

    pub async fn sims(&self, query: &SimQuery) -> Result<SimPage, GatewayError> {
        let filter = SimFilter {
            com_port: query.com_port.clone(),
            ..SimFilter::default()
        };
        let fetched = async {
            let items = self.registry.find_sims(&filter, query.skip, query.page_size()).await?;
            let count = self.registry.count_sims(&filter).await?;
            Ok::<_, crate::storage::StoreError>(SimPage { items, count })
        };
        fetched.await.map_err(|e| {
            warn!("sim listing failed: {}", e);
            GatewayError::Failed
        })
    }

    pub async fn sms(&self, iccid: &str) -> Result<SmsReport, GatewayError> {
        self.retriever.retrieve(iccid).await.map_err(|e| {
            warn!("sms for {} unavailable: {}", iccid, e);
            match e {
                SmsError::SimNotFound(_) | SmsError::NoPort(_) => GatewayError::NotFound,
                _ => GatewayError::Failed,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::SimQuery;

    #[test]
    fn page_size_is_clamped() {
        assert_eq!(SimQuery::default().page_size(), 100);
        let q = |limit| SimQuery {
            limit: Some(limit),
            ..SimQuery::default()
        };
        assert_eq!(q(0).page_size(), 1);
        assert_eq!(q(5000).page_size(), 1000);
        assert_eq!(q(25).page_size(), 25);
    }
}
