//! Background Health Monitor (C6): a periodic scheduler that probes
//! every enabled server, writes the result through the repository
//! (C3), and emits an event per probe for subscribers. Also exposes an
//! on-demand `refresh(path)` that probes a single server synchronously
//! (SPEC_FULL.md §4.6).

pub mod probe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gateway_core::config::HealthMonitorConfig;
use gateway_core::model::{HeaderTemplate, HealthStatus, ServerRecord};
use gateway_core::repository::ServerRepository;
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::probe::probe;

#[derive(Debug, thiserror::Error)]
pub enum HealthMonitorError {
    #[error("server not registered: {0}")]
    NotFound(String),
    #[error(transparent)]
    Repository(#[from] gateway_core::error::RepositoryError),
    #[error("health monitor is shutting down")]
    Cancelled,
}

/// Broadcast to every subscriber after a probe (scheduled or on-demand)
/// completes and has been persisted.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub path: String,
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
}

/// Per-server backoff bookkeeping: widen the probe interval after
/// repeated failures, reset on the first success.
struct BackoffState {
    consecutive_failures: u32,
    current_interval: Duration,
    next_check: Instant,
}

pub struct HealthMonitor {
    repository: Arc<dyn ServerRepository>,
    client: reqwest::Client,
    config: HealthMonitorConfig,
    semaphore: Arc<Semaphore>,
    backoff: Mutex<HashMap<String, BackoffState>>,
    events: broadcast::Sender<HealthEvent>,
    cancellation: CancellationToken,
}

impl HealthMonitor {
    pub fn new(repository: Arc<dyn ServerRepository>, config: HealthMonitorConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_probes));
        Self {
            repository,
            client: reqwest::Client::new(),
            semaphore,
            backoff: Mutex::new(HashMap::new()),
            config,
            events,
            cancellation: CancellationToken::new(),
        }
    }

    /// Subscribe to probe results as they happen.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// A token that `run` watches; cancelling it stops the periodic
    /// loop after the in-flight tick's probes finish.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }

    /// Runs the periodic probe loop until cancelled. Intended to be
    /// spawned as a long-lived background task alongside the server.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => {
                    info!("health monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    Arc::clone(&self).run_tick().await;
                }
            }
        }
    }

    async fn run_tick(self: Arc<Self>) {
        let servers = match self.repository.list().await {
            Ok(servers) => servers,
            Err(e) => {
                warn!(error = %e, "health monitor failed to list servers");
                return;
            }
        };

        let now = Instant::now();
        let due: Vec<ServerRecord> = {
            let backoff = self.backoff.lock().await;
            servers
                .into_iter()
                .filter(|s| s.enabled)
                .filter(|s| {
                    backoff
                        .get(s.path.as_str())
                        .map(|state| now >= state.next_check)
                        .unwrap_or(true)
                })
                .collect()
        };

        if due.is_empty() {
            return;
        }

        let mut tasks = tokio::task::JoinSet::new();
        for server in due {
            let this = Arc::clone(&self);
            tasks.spawn(async move { this.probe_and_record(server).await });
        }
        while let Some(outcome) = tasks.join_next().await {
            if let Err(e) = outcome {
                warn!(error = %e, "health probe task panicked");
            }
        }
    }

    async fn probe_and_record(&self, server: ServerRecord) {
        let path = server.path.as_str().to_string();
        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            return;
        };

        let headers = resolve_headers(&server.headers);
        let status = tokio::select! {
            _ = self.cancellation.cancelled() => {
                drop(permit);
                return;
            }
            status = probe_with_retry(
                &self.client,
                &server.proxy_pass_url,
                &headers,
                self.config.probe_timeout,
            ) => status,
        };
        drop(permit);

        self.record_result(&path, status).await;
    }

    /// Probe a single server on demand and return the classification
    /// synchronously, independent of the periodic schedule.
    pub async fn refresh(&self, path: &str) -> Result<HealthStatus, HealthMonitorError> {
        let server = self
            .repository
            .get(path)
            .await?
            .ok_or_else(|| HealthMonitorError::NotFound(path.to_string()))?;

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HealthMonitorError::Cancelled)?;
        let headers = resolve_headers(&server.headers);
        let status = probe_with_retry(
            &self.client,
            &server.proxy_pass_url,
            &headers,
            self.config.probe_timeout,
        )
        .await;
        drop(permit);

        self.record_result(path, status).await;
        Ok(status)
    }

    async fn record_result(&self, path: &str, status: HealthStatus) {
        self.update_backoff(path, status).await;

        let checked_at = Utc::now();
        if let Err(e) = self
            .repository
            .update_health(path, status, checked_at)
            .await
        {
            warn!(path, error = %e, "failed to persist health result");
        }

        let _ = self.events.send(HealthEvent {
            path: path.to_string(),
            status,
            checked_at,
        });
    }

    async fn update_backoff(&self, path: &str, status: HealthStatus) {
        let mut backoff = self.backoff.lock().await;
        let base_interval = self.config.interval;
        let max_interval = self.config.max_backoff_interval;
        let threshold = self.config.max_consecutive_failures_before_backoff;

        let state = backoff.entry(path.to_string()).or_insert_with(|| BackoffState {
            consecutive_failures: 0,
            current_interval: base_interval,
            next_check: Instant::now(),
        });

        match status {
            HealthStatus::Unhealthy => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= threshold {
                    state.current_interval = (state.current_interval * 2).min(max_interval);
                }
            }
            HealthStatus::Healthy | HealthStatus::HealthyAuthExpired => {
                state.consecutive_failures = 0;
                state.current_interval = base_interval;
            }
            HealthStatus::Unknown => {}
        }
        state.next_check = Instant::now() + state.current_interval;
    }
}

/// Idempotent probes may retry with exponential backoff (base 1s,
/// factor 2, max 3 attempts) since a retry can't duplicate side
/// effects the way a forwarded client call could.
async fn probe_with_retry(
    client: &reqwest::Client,
    url: &Url,
    headers: &reqwest::header::HeaderMap,
    timeout: Duration,
) -> HealthStatus {
    const MAX_ATTEMPTS: u32 = 3;
    let mut delay = Duration::from_secs(1);
    for attempt in 0..MAX_ATTEMPTS {
        let status = probe(client, url, headers, timeout).await;
        if status != HealthStatus::Unhealthy || attempt + 1 == MAX_ATTEMPTS {
            return status;
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
    HealthStatus::Unhealthy
}

fn resolve_headers(templates: &[HeaderTemplate]) -> reqwest::header::HeaderMap {
    let mut map = reqwest::header::HeaderMap::new();
    for template in templates {
        let value = template.resolve();
        let name = reqwest::header::HeaderName::from_bytes(template.name.as_bytes());
        let header_value = reqwest::header::HeaderValue::from_str(&value);
        match (name, header_value) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(header = %template.name, "skipping header with invalid name or value"),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_core::error::RepositoryError;
    use gateway_core::model::{RecordPath, Transport};
    use gateway_core::repository::Precondition;
    use mockito::Server;
    use std::collections::BTreeSet;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as TokioMutex;

    /// A minimal in-memory `ServerRepository` stand-in so these tests
    /// exercise the monitor's scheduling/backoff logic without pulling
    /// in the filesystem or tantivy backends.
    #[derive(Default)]
    struct FakeRepository {
        records: TokioMutex<HashMap<String, ServerRecord>>,
        health_writes: StdMutex<Vec<(String, HealthStatus)>>,
    }

    #[async_trait]
    impl ServerRepository for FakeRepository {
        async fn get(&self, path: &str) -> Result<Option<ServerRecord>, RepositoryError> {
            Ok(self.records.lock().await.get(path).cloned())
        }

        async fn list(&self) -> Result<Vec<ServerRecord>, RepositoryError> {
            Ok(self.records.lock().await.values().cloned().collect())
        }

        async fn put(
            &self,
            record: ServerRecord,
            _precondition: Precondition,
        ) -> Result<(), RepositoryError> {
            self.records
                .lock()
                .await
                .insert(record.path.as_str().to_string(), record);
            Ok(())
        }

        async fn delete(&self, path: &str) -> Result<(), RepositoryError> {
            self.records.lock().await.remove(path);
            Ok(())
        }

        async fn toggle(&self, _path: &str, _enabled: bool) -> Result<ServerRecord, RepositoryError> {
            unimplemented!("not exercised by health monitor tests")
        }

        async fn update_health(
            &self,
            path: &str,
            status: HealthStatus,
            checked_at: DateTime<Utc>,
        ) -> Result<ServerRecord, RepositoryError> {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(path)
                .ok_or_else(|| RepositoryError::NotFound {
                    kind: gateway_core::model::RecordKind::Server,
                    path: path.to_string(),
                })?;
            record.health_status = status;
            record.last_checked_time = Some(checked_at);
            self.health_writes
                .lock()
                .unwrap()
                .push((path.to_string(), status));
            Ok(record.clone())
        }

        async fn rate(
            &self,
            _path: &str,
            _rating: u8,
        ) -> Result<ServerRecord, gateway_core::repository::RatingOutcome> {
            unimplemented!("not exercised by health monitor tests")
        }
    }

    fn sample_server(path: &str, url: &str) -> ServerRecord {
        ServerRecord {
            path: RecordPath::new(path).unwrap(),
            server_name: "Current Time".to_string(),
            description: "returns the current time".to_string(),
            proxy_pass_url: Url::parse(url).unwrap(),
            supported_transports: BTreeSet::from([Transport::StreamableHttp]),
            tags: BTreeSet::new(),
            headers: vec![],
            tool_list: vec![],
            resource_list: vec![],
            num_stars: Default::default(),
            license: None,
            is_python: false,
            enabled: true,
            health_status: HealthStatus::Unknown,
            last_checked_time: None,
        }
    }

    #[tokio::test]
    async fn refresh_probes_and_persists_result() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
            .expect(2)
            .create_async()
            .await;

        let url = format!("{}/mcp", server.url());
        let repo = Arc::new(FakeRepository::default());
        repo.put(sample_server("/currenttime", &url), Precondition::Any)
            .await
            .unwrap();

        let monitor = HealthMonitor::new(repo.clone(), HealthMonitorConfig::default());
        let status = monitor.refresh("/currenttime").await.unwrap();
        assert_eq!(status, HealthStatus::Healthy);

        let fetched = repo.get("/currenttime").await.unwrap().unwrap();
        assert_eq!(fetched.health_status, HealthStatus::Healthy);
        assert!(fetched.last_checked_time.is_some());
    }

    #[tokio::test]
    async fn refresh_unknown_server_errors() {
        let repo = Arc::new(FakeRepository::default());
        let monitor = HealthMonitor::new(repo, HealthMonitorConfig::default());
        let result = monitor.refresh("/missing").await;
        assert!(matches!(result, Err(HealthMonitorError::NotFound(_))));
    }

    #[tokio::test]
    async fn backoff_widens_after_consecutive_failures_and_resets_on_success() {
        let repo = Arc::new(FakeRepository::default());
        repo.put(
            sample_server("/flaky", "http://127.0.0.1:1/mcp"),
            Precondition::Any,
        )
        .await
        .unwrap();

        let mut config = HealthMonitorConfig::default();
        config.interval = Duration::from_secs(60);
        config.max_consecutive_failures_before_backoff = 1;
        let monitor = HealthMonitor::new(repo, config);

        monitor.update_backoff("/flaky", HealthStatus::Unhealthy).await;
        let widened = {
            let backoff = monitor.backoff.lock().await;
            backoff.get("/flaky").unwrap().current_interval
        };
        assert!(widened > Duration::from_secs(60));

        monitor.update_backoff("/flaky", HealthStatus::Healthy).await;
        let reset = {
            let backoff = monitor.backoff.lock().await;
            backoff.get("/flaky").unwrap().current_interval
        };
        assert_eq!(reset, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn subscribers_receive_an_event_per_probe() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
            .expect(2)
            .create_async()
            .await;
        let url = format!("{}/mcp", server.url());

        let repo = Arc::new(FakeRepository::default());
        repo.put(sample_server("/currenttime", &url), Precondition::Any)
            .await
            .unwrap();
        let monitor = HealthMonitor::new(repo, HealthMonitorConfig::default());
        let mut events = monitor.subscribe();

        monitor.refresh("/currenttime").await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.path, "/currenttime");
        assert_eq!(event.status, HealthStatus::Healthy);
    }
}
