//! Retrying facade over the registry stores.
//!
//! Loops talk to the registry only through [`Registry`]. Every call runs under the store
//! retry policy: transient failures back off exponentially, permanent ones and exhausted
//! budgets are returned to the caller for that single operation.

use std::sync::Arc;

use log::error;

use super::{SimFilter, SimRecord, SimStore, SimUpdate, SmsRecord, SmsStore, StoreError};
use crate::retry::{self, RetryPolicy};

#[derive(Clone)]
pub struct Registry {
    sims: Arc<dyn SimStore>,
    sms: Arc<dyn SmsStore>,
    policy: RetryPolicy,
}

impl Registry {
    pub fn new(sims: Arc<dyn SimStore>, sms: Arc<dyn SmsStore>, policy: RetryPolicy) -> Self {
        Self { sims, sms, policy }
    }

    async fn call<T, F>(&self, label: &str, op: F) -> Result<T, StoreError>
    where
        F: Fn() -> Result<T, StoreError>,
    {
        retry::run(&self.policy, label, |_| {
            let out = op();
            async move { out }
        })
        .await
        .map_err(|e| {
            let inner = e.into_inner();
            error!("registry {} failed: {}", label, inner);
            inner
        })
    }

    pub async fn find_sim(&self, iccid: &str) -> Result<Option<SimRecord>, StoreError> {
        self.call("find_one", || self.sims.find_one(iccid)).await
    }

    pub async fn find_sims(
        &self,
        filter: &SimFilter,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<SimRecord>, StoreError> {
        self.call("find", || self.sims.find(filter, skip, limit)).await
    }

    pub async fn count_sims(&self, filter: &SimFilter) -> Result<usize, StoreError> {
        self.call("count", || self.sims.count(filter)).await
    }

    pub async fn upsert_sim(&self, iccid: &str, update: &SimUpdate) -> Result<SimRecord, StoreError> {
        self.call("upsert", || self.sims.upsert(iccid, update)).await
    }

    pub async fn release_port(&self, iccid: &str, port: &str) -> Result<bool, StoreError> {
        self.call("release_port", || self.sims.release_port(iccid, port)).await
    }

    pub async fn upsert_sms(&self, record: &SmsRecord) -> Result<bool, StoreError> {
        self.call("upsert_sms", || self.sms.upsert_sms(record)).await
    }

    pub async fn list_sms(&self, identity: &str) -> Result<Vec<SmsRecord>, StoreError> {
        self.call("list_sms", || self.sms.list_sms(identity)).await
    }

    pub async fn count_sms(&self) -> Result<usize, StoreError> {
        self.call("count_sms", || self.sms.count_sms()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// SIM store failing transiently a fixed number of times before answering.
    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
        permanent: bool,
    }

    impl Flaky {
        fn new(failures: u32, permanent: bool) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                permanent,
            }
        }

        fn gate(&self) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.permanent {
                return Err(StoreError::SchemaMismatch {
                    entity: "sim",
                    expected: 1,
                    found: 2,
                });
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            Ok(())
        }
    }

    impl SimStore for Flaky {
        fn find_one(&self, _iccid: &str) -> Result<Option<SimRecord>, StoreError> {
            self.gate().map(|_| None)
        }
        fn find(&self, _f: &SimFilter, _s: usize, _l: usize) -> Result<Vec<SimRecord>, StoreError> {
            self.gate().map(|_| Vec::new())
        }
        fn count(&self, _f: &SimFilter) -> Result<usize, StoreError> {
            self.gate().map(|_| 0)
        }
        fn upsert(&self, iccid: &str, update: &SimUpdate) -> Result<SimRecord, StoreError> {
            self.gate()?;
            let mut r = SimRecord::new(iccid, chrono::Utc::now());
            r.apply(update, chrono::Utc::now());
            Ok(r)
        }
        fn release_port(&self, _iccid: &str, _port: &str) -> Result<bool, StoreError> {
            self.gate().map(|_| false)
        }
    }

    impl SmsStore for Flaky {
        fn upsert_sms(&self, _r: &SmsRecord) -> Result<bool, StoreError> {
            self.gate().map(|_| true)
        }
        fn list_sms(&self, _identity: &str) -> Result<Vec<SmsRecord>, StoreError> {
            self.gate().map(|_| Vec::new())
        }
        fn count_sms(&self) -> Result<usize, StoreError> {
            self.gate().map(|_| 0)
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::exponential(8, Duration::from_millis(250), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let store = Arc::new(Flaky::new(3, false));
        let registry = Registry::new(store.clone(), store.clone(), policy());
        let r = registry.upsert_sim("8984", &SimUpdate::default()).await.unwrap();
        assert_eq!(r.iccid, "8984");
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reaches_the_caller() {
        let store = Arc::new(Flaky::new(100, false));
        let registry = Registry::new(store.clone(), store.clone(), policy());
        let err = registry.find_sim("8984").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let store = Arc::new(Flaky::new(0, true));
        let registry = Registry::new(store.clone(), store.clone(), policy());
        assert!(registry.count_sms().await.is_err());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }
}
