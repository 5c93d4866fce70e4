//! Per-PLC links and the manager owning all of them.
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{PlantConfig, PlcConfig};
use crate::connection::{self, Connection, Settings};
use crate::modbus::{self, Operation, Response};

/// Backoff before retry `n` (0-based) is this times `2^n`.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
/// Backoff between attempts never grows past this.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
/// How many response times the rolling average covers.
const RESPONSE_TIME_WINDOW: usize = 100;
/// Attempts at a single request while the PLC reports itself busy.
const BUSY_ATTEMPTS: usize = 3;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no PLC `{0}` is configured")]
    UnknownPlc(String),
    #[error("the circuit breaker for `{0}` is open")]
    CircuitOpen(String),
    #[error("`{0}` did not respond in {1} attempts")]
    Timeout(String, u32),
    #[error("`{0}` responded to function {1} with exception {2} ({3})")]
    Exception(String, u8, u8, &'static str),
    #[error("communication with `{0}` failed")]
    Connection(String, #[source] connection::Error),
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Error,
    CircuitOpen,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct Metrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
    pub last_error: Option<String>,
    pub last_error_time: Option<jiff::Timestamp>,
    #[serde(skip)]
    response_times: VecDeque<Duration>,
}

impl Metrics {
    fn record_success(&mut self, elapsed: Duration) {
        self.successful_requests += 1;
        if self.response_times.len() == RESPONSE_TIME_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed);
        let total: Duration = self.response_times.iter().sum();
        self.average_response_time_ms =
            total.as_secs_f64() * 1000.0 / self.response_times.len() as f64;
    }

    fn record_failure(&mut self, error: &dyn std::error::Error) {
        self.failed_requests += 1;
        self.last_error = Some(error.to_string());
        self.last_error_time = Some(jiff::Timestamp::now());
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct PlcStatus {
    pub plc_id: String,
    pub host: String,
    pub port: u16,
    pub state: ConnectionState,
    pub connected: bool,
    pub circuit_open: bool,
    pub failure_count: u32,
    pub uptime_seconds: f64,
    pub metrics: Metrics,
}

/// Everything needed to talk to one PLC: its connection, circuit breaker and metrics.
pub struct PlcLink {
    config: PlcConfig,
    connection: Connection,
    breaker: Mutex<CircuitBreaker>,
    metrics: Mutex<Metrics>,
    state: Mutex<ConnectionState>,
    permits: tokio::sync::Semaphore,
    created: Instant,
}

impl PlcLink {
    pub fn new(config: PlcConfig, args: &connection::Args) -> Self {
        let settings =
            Settings::new(config.socket_address(), config.unit_id, config.timeout(), args);
        debug!(
            message = "PLC link initialized",
            plc_id = %config.id,
            address = %settings.address,
            max_connections = config.max_concurrent_connections,
        );
        Self {
            breaker: Mutex::new(CircuitBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_timeout(),
            )),
            connection: Connection::new(settings),
            metrics: Mutex::default(),
            state: Mutex::new(ConnectionState::Disconnected),
            permits: tokio::sync::Semaphore::new(config.max_concurrent_connections.max(1)),
            created: Instant::now(),
            config,
        }
    }

    pub fn config(&self) -> &PlcConfig {
        &self.config
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Run an operation, retrying timeouts and connection failures with exponential backoff.
    ///
    /// Exception responses are returned as errors without retrying: the PLC has answered, it
    /// just did not like the request.
    pub async fn execute(&self, operation: Operation) -> Result<Response, Error> {
        let plc_id = &self.config.id;
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).total_requests += 1;
        let can_attempt = self.breaker.lock().unwrap_or_else(|e| e.into_inner()).can_attempt();
        if !can_attempt {
            warn!(message = "request blocked by the circuit breaker", plc_id = %plc_id);
            self.set_state(ConnectionState::CircuitOpen);
            let error = Error::CircuitOpen(plc_id.clone());
            self.metrics.lock().unwrap_or_else(|e| e.into_inner()).record_failure(&error);
            return Err(error);
        }
        let _permit = self.permits.acquire().await;
        let start = Instant::now();
        let attempts = self.config.retries.max(1);
        let mut error = Error::Timeout(plc_id.clone(), attempts);
        for attempt in 0..attempts {
            match self.connection.send_retrying(operation.clone(), BUSY_ATTEMPTS).await {
                Ok(Some(response)) => match response.exception_code() {
                    None => {
                        self.record_success(start.elapsed());
                        return Ok(response);
                    }
                    Some(code) => {
                        // The link itself is healthy.
                        self.breaker.lock().unwrap_or_else(|e| e.into_inner()).record_success();
                        self.set_state(ConnectionState::Connected);
                        let error = Error::Exception(
                            plc_id.clone(),
                            operation.function_code(),
                            code,
                            modbus::exception_name(code),
                        );
                        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).record_failure(&error);
                        return Err(error);
                    }
                },
                Ok(None) => error = Error::Timeout(plc_id.clone(), attempts),
                Err(e) => error = Error::Connection(plc_id.clone(), e),
            }
            debug!(
                message = "attempt failed",
                plc_id = %plc_id,
                attempt,
                error = (&error as &dyn std::error::Error),
            );
            if attempt + 1 < attempts {
                tokio::time::sleep(retry_delay(attempt)).await;
            }
        }
        self.record_failure(&error);
        Err(error)
    }

    fn record_success(&self, elapsed: Duration) {
        self.breaker.lock().unwrap_or_else(|e| e.into_inner()).record_success();
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).record_success(elapsed);
        self.set_state(ConnectionState::Connected);
    }

    fn record_failure(&self, error: &Error) {
        let open = {
            let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
            breaker.record_failure();
            breaker.is_open()
        };
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).record_failure(error);
        self.set_state(if open { ConnectionState::CircuitOpen } else { ConnectionState::Error });
        warn!(
            message = "operation failed",
            plc_id = %self.config.id,
            error = (error as &dyn std::error::Error),
        );
    }

    /// Read a single holding register to find out whether the PLC is reachable.
    pub async fn ping(&self) -> Result<(), Error> {
        match self.execute(Operation::ReadHoldings { address: 0, count: 1 }).await {
            Ok(_) | Err(Error::Exception(..)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn status(&self) -> PlcStatus {
        let breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        let connected = self.connection.is_connected();
        let state = match *self.state.lock().unwrap_or_else(|e| e.into_inner()) {
            _ if breaker.is_open() => ConnectionState::CircuitOpen,
            ConnectionState::Connected if !connected => ConnectionState::Disconnected,
            ConnectionState::CircuitOpen => ConnectionState::Error,
            state => state,
        };
        PlcStatus {
            plc_id: self.config.id.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            state,
            connected,
            circuit_open: breaker.is_open(),
            failure_count: breaker.failure_count(),
            uptime_seconds: self.created.elapsed().as_secs_f64(),
            metrics: self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }

    pub async fn shutdown(self) {
        info!(message = "shutting down PLC link", plc_id = %self.config.id);
        self.connection.close().await;
    }
}

/// Owns a [`PlcLink`] for every configured PLC.
pub struct ConnectionManager {
    links: BTreeMap<String, Arc<PlcLink>>,
}

impl ConnectionManager {
    pub fn new(config: &PlantConfig, args: &connection::Args) -> Self {
        let links = config
            .plcs()
            .map(|plc| (plc.id.clone(), Arc::new(PlcLink::new(plc.clone(), args))))
            .collect::<BTreeMap<_, _>>();
        info!(message = "connection manager ready", plcs = links.len());
        Self { links }
    }

    pub fn link(&self, plc_id: &str) -> Result<&Arc<PlcLink>, Error> {
        self.links.get(plc_id).ok_or_else(|| Error::UnknownPlc(plc_id.to_string()))
    }

    pub fn plc_ids(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(String::as_str)
    }

    pub async fn execute(&self, plc_id: &str, operation: Operation) -> Result<Response, Error> {
        self.link(plc_id)?.execute(operation).await
    }

    pub fn status(&self, plc_id: &str) -> Result<PlcStatus, Error> {
        Ok(self.link(plc_id)?.status())
    }

    pub fn statuses(&self) -> Vec<PlcStatus> {
        self.links.values().map(|link| link.status()).collect()
    }

    pub async fn ping(&self, plc_id: &str) -> Result<(), Error> {
        self.link(plc_id)?.ping().await
    }

    /// Ping every PLC concurrently. Failures end up in each link's status.
    pub async fn ping_all(&self) {
        let pings = self.links.values().map(|link| async move {
            if let Err(e) = link.ping().await {
                debug!(
                    message = "health check failed",
                    plc_id = %link.config().id,
                    error = (&e as &dyn std::error::Error)
                );
            }
        });
        futures::future::join_all(pings).await;
    }

    /// Ping each PLC on its own `health_check_interval` until `shutdown` resolves.
    pub async fn monitor(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) {
        let loops = self.links.values().map(|link| {
            let link = Arc::clone(link);
            async move {
                let mut interval = tokio::time::interval(link.config().health_check_interval());
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let _ = link.ping().await;
                    let status = link.status();
                    info!(
                        message = "health check",
                        plc_id = %status.plc_id,
                        state = %status.state,
                        avg_ms = status.metrics.average_response_time_ms,
                    );
                }
            }
        });
        tokio::select! {
            _ = futures::future::join_all(loops) => {}
            _ = shutdown => {}
        }
    }

    pub async fn shutdown(self) {
        let closing = self.links.into_values().filter_map(|link| Arc::into_inner(link));
        futures::future::join_all(closing.map(PlcLink::shutdown)).await;
    }
}

/// Exponential backoff after the `attempt`th failed attempt, counting from zero.
fn retry_delay(attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| RETRY_BASE_DELAY.checked_mul(factor))
        .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
}
