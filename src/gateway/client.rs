use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::errors::GatewayError;
use super::retry::RetryPolicy;
use super::store::{Mutation, MutationKind, RemoteStore, StoreError};
use crate::config::EngineConfig;
use crate::observability::GatewayMetrics;
use crate::workflow::EntityId;

/// One logical call through the gateway.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub entity_id: EntityId,
    pub mutation: Mutation,
    /// Overrides the gateway's default timeout for this call.
    pub timeout: Option<Duration>,
}

impl GatewayRequest {
    pub fn new(entity_id: EntityId, kind: MutationKind, patch: serde_json::Value) -> Self {
        Self {
            entity_id,
            mutation: Mutation::new(kind, patch),
            timeout: None,
        }
    }

    pub fn fetch(entity_id: EntityId) -> Self {
        Self::new(entity_id, MutationKind::FetchStatus, serde_json::Value::Null)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayResponse {
    pub entity_id: EntityId,
    pub record: Option<serde_json::Value>,
    pub attempts: u32,
}

/// The only path from the core to the remote store.
///
/// Holds no entity data between calls. A timed-out call is abandoned locally;
/// the store may still apply it.
pub struct ActionGateway {
    store: Arc<dyn RemoteStore>,
    default_timeout: Duration,
    retry: RetryPolicy,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    metrics: Arc<GatewayMetrics>,
}

impl std::fmt::Debug for ActionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionGateway")
            .field("default_timeout", &self.default_timeout)
            .field("retry", &self.retry)
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

impl ActionGateway {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            default_timeout: Self::DEFAULT_TIMEOUT,
            retry: RetryPolicy::none(),
            limiter: None,
            metrics: Arc::new(GatewayMetrics::new()),
        }
    }

    pub fn from_config(store: Arc<dyn RemoteStore>, config: &EngineConfig) -> Self {
        let gateway = Self::new(store)
            .with_timeout(Duration::from_millis(config.gateway_timeout_ms))
            .with_retry(RetryPolicy::from(&config.retry));

        match config.rate_limit_per_second.and_then(NonZeroU32::new) {
            Some(per_second) => gateway.with_rate_limit(per_second),
            None => gateway,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Caps store calls per second across every caller of this gateway.
    ///
    /// The quota is shared, so one large batch can slow unrelated batches
    /// down. Give a batch its own gateway when it needs its own budget.
    pub fn with_rate_limit(mut self, per_second: NonZeroU32) -> Self {
        self.limiter = Some(Arc::new(RateLimiter::direct(Quota::per_second(per_second))));
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub async fn invoke(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.invoke_cancellable(request, &CancellationToken::new()).await
    }

    /// Like `invoke`, but gives up with `GatewayError::Cancelled` as soon as
    /// `cancel` fires, including while waiting between retries.
    pub async fn invoke_cancellable(
        &self,
        request: GatewayRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, GatewayError> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let entity_id = &request.entity_id;
        let mutation = &request.mutation;

        debug!(
            entity.id = %entity_id,
            kind = ?mutation.kind,
            timeout_ms = timeout.as_millis() as u64,
            "Invoking remote store"
        );

        let attempts = self.retry.run(|attempt| async move {
            if attempt > 1 {
                self.metrics.record_retry();
            }
            self.attempt(entity_id, mutation, timeout)
                .await
                .map(|record| (record, attempt))
        });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = attempts => result,
        };

        if matches!(outcome, Err(GatewayError::Cancelled)) {
            self.metrics.record_outcome(&outcome);
        }
        if let Err(error) = &outcome {
            warn!(entity.id = %entity_id, reason = error.reason(), error = %error, "Remote call failed");
        }

        outcome.map(|(record, attempts)| GatewayResponse {
            entity_id: entity_id.clone(),
            record,
            attempts,
        })
    }

    async fn attempt(
        &self,
        entity_id: &EntityId,
        mutation: &Mutation,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, GatewayError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        self.metrics.record_call();
        let outcome = match tokio::time::timeout(timeout, self.store.apply(entity_id, mutation)).await {
            Ok(Ok(ack)) => Ok(ack.record),
            Ok(Err(error)) => Err(translate(entity_id, error)),
            Err(_) => Err(GatewayError::Timeout {
                after_ms: timeout.as_millis() as u64,
            }),
        };
        self.metrics.record_outcome(&outcome);
        outcome
    }
}

fn translate(entity_id: &EntityId, error: StoreError) -> GatewayError {
    match error {
        StoreError::NotFound(_) => GatewayError::NotFound {
            entity_id: entity_id.clone(),
        },
        StoreError::Rejected { code, message } => GatewayError::Rejected { code, message },
        StoreError::Unavailable(message) => GatewayError::NetworkFailure { message },
        StoreError::Misconfigured(reason) => GatewayError::Misconfigured { reason },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::store::{MockRemoteStore, StoreAck};
    use crate::gateway::{InMemoryStore, StoreFailure};
    use serde_json::json;

    fn update(id: &str) -> GatewayRequest {
        GatewayRequest::new(id.into(), MutationKind::Update, json!({"note": "x"}))
    }

    #[tokio::test]
    async fn test_success_passes_record_through() {
        let mut store = MockRemoteStore::new();
        store
            .expect_apply()
            .withf(|id, mutation| id.as_str() == "b-1" && mutation.kind == MutationKind::Update)
            .times(1)
            .returning(|id, mutation| {
                Ok(StoreAck {
                    entity_id: id.clone(),
                    record: Some(mutation.patch.clone()),
                })
            });

        let gateway = ActionGateway::new(Arc::new(store));
        let response = gateway.invoke(update("b-1")).await.unwrap();

        assert_eq!(response.record, Some(json!({"note": "x"})));
        assert_eq!(response.attempts, 1);
        assert_eq!(gateway.metrics().get_stats().successes, 1);
    }

    #[tokio::test]
    async fn test_store_errors_are_translated() {
        let mut store = MockRemoteStore::new();
        store
            .expect_apply()
            .returning(|id, _| Err(StoreError::NotFound(id.clone())));
        let gateway = ActionGateway::new(Arc::new(store));

        let error = gateway.invoke(update("gone")).await.unwrap_err();
        assert_eq!(error, GatewayError::NotFound { entity_id: "gone".into() });
    }

    #[tokio::test]
    async fn test_unavailable_store_is_network_failure() {
        let mut store = MockRemoteStore::new();
        store
            .expect_apply()
            .times(1)
            .returning(|_, _| Err(StoreError::Unavailable("connection reset".into())));
        let gateway = ActionGateway::new(Arc::new(store));

        let error = gateway.invoke(update("b-1")).await.unwrap_err();
        assert_eq!(error.reason(), "network");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_times_out() {
        let store = InMemoryStore::new().with_records(["b-1"]);
        store.fail_always("b-1", StoreFailure::Hang);
        let gateway = ActionGateway::new(Arc::new(store)).with_timeout(Duration::from_millis(250));

        let error = gateway.invoke(update("b-1")).await.unwrap_err();
        assert_eq!(error, GatewayError::Timeout { after_ms: 250 });
        assert_eq!(gateway.metrics().get_stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_overrides_default() {
        let store = InMemoryStore::new().with_records(["b-1"]);
        store.fail_always("b-1", StoreFailure::Hang);
        let gateway = ActionGateway::new(Arc::new(store));

        let error = gateway
            .invoke(update("b-1").with_timeout(Duration::from_millis(40)))
            .await
            .unwrap_err();
        assert_eq!(error, GatewayError::Timeout { after_ms: 40 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_call() {
        let store = InMemoryStore::new().with_records(["b-1"]);
        store.fail_always("b-1", StoreFailure::Hang);
        let gateway = ActionGateway::new(Arc::new(store));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let error = gateway.invoke_cancellable(update("b-1"), &cancel).await.unwrap_err();
        assert_eq!(error, GatewayError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_is_retried_when_enabled() {
        let store = Arc::new(InMemoryStore::new().with_records(["b-1"]));
        store.fail_next("b-1", StoreFailure::Unavailable("reset".into()));
        let gateway = ActionGateway::new(store.clone())
            .with_retry(RetryPolicy::with_retries(2, Duration::from_millis(5)));

        let response = gateway.invoke(update("b-1")).await.unwrap();
        assert_eq!(response.attempts, 2);
        assert_eq!(store.call_count(&"b-1".into()), 2);
        assert_eq!(gateway.metrics().get_stats().retries, 1);
    }

    #[tokio::test]
    async fn test_fetch_returns_stored_record() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_record("lic-4", json!({"plan": "pro"}));
        store.fail_always("lic-4", StoreFailure::Unavailable("down".into()));
        let gateway = ActionGateway::new(store.clone());

        assert!(gateway.invoke(GatewayRequest::fetch("lic-4".into())).await.is_err());

        store.clear_failures(&"lic-4".into());
        let response = gateway.invoke(GatewayRequest::fetch("lic-4".into())).await.unwrap();
        assert_eq!(response.record, Some(json!({"plan": "pro"})));
        assert_eq!(store.calls()[1].1, MutationKind::FetchStatus);
    }

    #[tokio::test]
    async fn test_from_config_applies_engine_settings() {
        let config = EngineConfig {
            gateway_timeout_ms: 1_500,
            rate_limit_per_second: Some(2),
            ..EngineConfig::default()
        };
        let store = Arc::new(InMemoryStore::new().with_records(["a", "b", "c"]));
        let gateway = ActionGateway::from_config(store.clone(), &config);
        assert_eq!(gateway.default_timeout(), Duration::from_millis(1_500));

        for id in ["a", "b", "c"] {
            gateway.invoke(update(id)).await.unwrap();
        }
        assert_eq!(store.calls().len(), 3);
        assert_eq!(gateway.metrics().get_stats().total_calls, 3);
    }
}
