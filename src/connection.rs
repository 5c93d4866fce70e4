use crate::modbus::{self, ModbusTCPCodec, Request};
use futures::{SinkExt as _, StreamExt as _};
use std::collections::{BTreeMap, VecDeque};
use std::pin;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::SendError;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("connecting to `{0}` did not complete within {1:?}")]
    ConnectTimeout(String, Duration),
    #[error("scheduling a request failed")]
    ScheduleRequest(#[source] SendError<modbus::Request>),
    #[error("the PLC could not be reached")]
    Unreachable(#[source] Arc<Error>),
}

/// What became of a request handed to the worker.
#[derive(Debug)]
pub enum Outcome {
    Response(modbus::Response),
    TimedOut,
    Failed(Arc<Error>),
}

#[derive(Default)]
pub struct ResponseTracker {
    responses: Mutex<BTreeMap<u16, Outcome>>,
    change_notify: Notify,
}

impl ResponseTracker {
    fn settle(&self, transaction_id: u16, outcome: Outcome) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(transaction_id, outcome);
        self.change_notify.notify_waiters();
        drop(guard);
    }

    pub fn mark_timeout(&self, transaction_id: u16) {
        self.settle(transaction_id, Outcome::TimedOut);
    }

    pub fn mark_failed(&self, transaction_id: u16, error: Arc<Error>) {
        self.settle(transaction_id, Outcome::Failed(error));
    }

    pub fn add_response(&self, response: modbus::Response) {
        self.settle(response.transaction_id, Outcome::Response(response));
    }

    pub async fn wait_for(&self, transaction_id: u16) -> Outcome {
        loop {
            let mut notified = pin::pin!(self.change_notify.notified());
            // Register interest before looking, so a settlement in between is not lost.
            notified.as_mut().enable();
            {
                let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(v) = guard.remove(&transaction_id) {
                    return v;
                }
            }
            notified.await;
        }
    }

    /// Forget an outcome nobody is going to wait for anymore.
    fn discard(&self, transaction_id: u16) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&transaction_id);
    }
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Override the response timeout configured for each PLC.
    ///
    /// If a response isn't received in this amount of time, the request is considered failed
    /// and, depending on the PLC's `retries`, attempted again.
    #[arg(long)]
    pub read_timeout: Option<humantime::Duration>,

    /// Give up connecting or sending out a request after this amount of time.
    #[arg(long, default_value = "3s")]
    pub send_timeout: humantime::Duration,

    /// Reconnect to the PLC after the specified number of reads time out in a row.
    #[arg(long, default_value = "3")]
    pub reconnect_after_timeouts: usize,

    /// The amount of additional time to wait after receiving a server busy exception.
    ///
    /// Gateways in front of PLCs respond with an exception code 6 while another request is
    /// in progress. Give the device this amount of time to finish before retrying.
    #[arg(long, default_value = "25ms")]
    pub server_busy_retry_delay: humantime::Duration,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            read_timeout: None,
            send_timeout: Duration::from_secs(3).into(),
            reconnect_after_timeouts: 3,
            server_busy_retry_delay: Duration::from_millis(25).into(),
        }
    }
}

/// Everything a connection needs to know about the PLC on the other end.
#[derive(Clone, Debug)]
pub struct Settings {
    /// `host:port`.
    pub address: String,
    pub unit_id: u8,
    pub read_timeout: Duration,
    pub send_timeout: Duration,
    pub reconnect_after_timeouts: usize,
    pub server_busy_retry_delay: Duration,
}

impl Settings {
    pub fn new(address: String, unit_id: u8, read_timeout: Duration, args: &Args) -> Self {
        Self {
            address,
            unit_id,
            read_timeout: args.read_timeout.map(Into::into).unwrap_or(read_timeout),
            send_timeout: *args.send_timeout,
            reconnect_after_timeouts: args.reconnect_after_timeouts,
            server_busy_retry_delay: *args.server_busy_retry_delay,
        }
    }
}

/// A Modbus TCP link to one PLC.
///
/// The socket is owned by a spawned worker which connects lazily, on the first request, and
/// again after the link breaks.
pub struct Connection {
    request_queue: tokio::sync::mpsc::UnboundedSender<modbus::Request>,
    worker: tokio::task::JoinHandle<()>,
    response_tracker: Arc<ResponseTracker>,
    connected: Arc<AtomicBool>,
    transaction_id_generator: AtomicU16,
    settings: Settings,
}

impl Connection {
    pub fn new(settings: Settings) -> Connection {
        let (request_queue, jobs) = tokio::sync::mpsc::unbounded_channel();
        let response_tracker: Arc<ResponseTracker> = Default::default();
        let connected = Arc::new(AtomicBool::new(false));
        let worker = TcpWorker {
            reconnect_countdown: settings.reconnect_after_timeouts,
            settings: settings.clone(),
            responses: Arc::clone(&response_tracker),
            connected: Arc::clone(&connected),
            inflight: VecDeque::with_capacity(8),
        }
        .spawn(jobs);
        Self {
            request_queue,
            worker,
            response_tracker,
            connected,
            transaction_id_generator: AtomicU16::new(0),
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a single request and wait for its outcome. `Ok(None)` means the request timed out.
    pub async fn send(
        &self,
        operation: modbus::Operation,
    ) -> Result<Option<modbus::Response>, Error> {
        let transaction_id = self.new_transaction_id();
        let request =
            modbus::Request { unit_id: self.settings.unit_id, transaction_id, operation };
        self.request_queue.send(request).map_err(Error::ScheduleRequest)?;
        // The worker reports timeouts on its own; this only guards against it going away.
        let backstop = self.settings.send_timeout * 2 + self.settings.read_timeout;
        match tokio::time::timeout(backstop, self.response_tracker.wait_for(transaction_id)).await
        {
            Ok(Outcome::Response(response)) => Ok(Some(response)),
            Ok(Outcome::TimedOut) => Ok(None),
            Ok(Outcome::Failed(error)) => Err(Error::Unreachable(error)),
            Err(_) => {
                self.response_tracker.discard(transaction_id);
                Ok(None)
            }
        }
    }

    /// [`Self::send`] but retries timeouts and `Server Busy` exceptions, up to `attempts` times
    /// in total.
    pub async fn send_retrying(
        &self,
        operation: modbus::Operation,
        attempts: usize,
    ) -> Result<Option<modbus::Response>, Error> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            let Some(response) = self.send(operation.clone()).await? else {
                continue;
            };
            if response.is_server_busy() {
                self.handle_server_busy().await;
                last = Some(response);
                continue;
            }
            return Ok(Some(response));
        }
        Ok(last)
    }

    pub async fn handle_server_busy(&self) {
        tokio::time::sleep(self.settings.server_busy_retry_delay).await;
    }

    /// Stop accepting requests and wait for the outstanding ones to settle.
    pub async fn close(self) {
        drop(self.request_queue);
        if let Err(e) = self.worker.await {
            warn!(
                message = "connection worker did not exit cleanly",
                error = (&e as &dyn std::error::Error)
            );
        }
    }
}

struct TcpWorker {
    settings: Settings,
    responses: Arc<ResponseTracker>,
    connected: Arc<AtomicBool>,
    /// Outstanding requests in the order they were sent out, with their timeout instants.
    ///
    /// Only the front deadline is armed, so timeouts are reported in sending order. We don't
    /// expect more than a handful of requests in flight, so linear scans are plenty good.
    inflight: VecDeque<(u16, Instant)>,
    reconnect_countdown: usize,
}

type TcpIo = Framed<TcpStream, ModbusTCPCodec>;

impl TcpWorker {
    fn spawn(self, jobs: UnboundedReceiver<modbus::Request>) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn(self.main_loop(jobs))
    }

    async fn main_loop(mut self, mut jobs: UnboundedReceiver<modbus::Request>) {
        let mut pending_send: Option<Request> = None;
        'reconnect: loop {
            self.connected.store(false, Ordering::Relaxed);
            // If we are reconnecting and had any in-flight requests, it is only proper to report
            // them as timed out.
            for (transaction_id, _) in self.inflight.drain(..) {
                self.responses.mark_timeout(transaction_id);
            }
            // Stay disconnected until there is something to send.
            let first = match pending_send.take() {
                Some(req) => req,
                None => match jobs.recv().await {
                    Some(req) => req,
                    None => return,
                },
            };
            let io = match self.connect().await {
                Ok(io) => io,
                Err(e) => {
                    warn!(
                        message = "could not connect",
                        address = %self.settings.address,
                        error = (&e as &dyn std::error::Error)
                    );
                    self.responses.mark_failed(first.transaction_id, Arc::new(e));
                    continue 'reconnect;
                }
            };
            self.connected.store(true, Ordering::Relaxed);
            let (mut io_sink, mut io_source) = io.split();
            let mut recv_time = pin::pin!(tokio::time::sleep_until(Instant::now()));
            let mut next_job = Some(first);
            let mut closing = false;
            loop {
                if let Some(req) = next_job.take() {
                    let transaction_id = req.transaction_id;
                    let sent =
                        tokio::time::timeout(self.settings.send_timeout, io_sink.send(req.clone()))
                            .await;
                    match sent {
                        Ok(Ok(())) => {
                            let deadline = Instant::now() + self.settings.read_timeout;
                            self.inflight.push_back((transaction_id, deadline));
                            recv_time.as_mut().reset(self.inflight[0].1);
                        }
                        Ok(Err(e)) => {
                            warn!(
                                message = "sending request failed, will reconnect",
                                error = (&e as &dyn std::error::Error)
                            );
                            pending_send = Some(req);
                            continue 'reconnect;
                        }
                        Err(_) => {
                            warn!("sending a request timed out, will reconnect");
                            self.responses.mark_timeout(transaction_id);
                            continue 'reconnect;
                        }
                    }
                }
                if closing && self.inflight.is_empty() {
                    if let Err(e) = io_sink.close().await {
                        debug!(message = "shutdown failed", error = (&e as &dyn std::error::Error));
                    }
                    return;
                }
                tokio::select! {
                    biased;
                    response = io_source.next() => {
                        match response {
                            None => {
                                info!(message = "the PLC closed the connection, will reconnect");
                                continue 'reconnect;
                            }
                            Some(Err(e)) => {
                                warn!(
                                    message = "receiving failed, will reconnect",
                                    error = (&e as &dyn std::error::Error)
                                );
                                continue 'reconnect;
                            }
                            Some(Ok(response)) => self.handle_response(response, recv_time.as_mut()),
                        }
                    }
                    _ = &mut recv_time, if !self.inflight.is_empty() => {
                        if !self.handle_timeout(recv_time.as_mut()) {
                            continue 'reconnect;
                        }
                    }
                    job = jobs.recv(), if !closing => {
                        match job {
                            None => closing = true,
                            Some(req) => next_job = Some(req),
                        }
                    }
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<TcpIo, Error> {
        let address = &self.settings.address;
        info!(message = "connecting...", address);
        let connecting = async {
            let addresses = tokio::net::lookup_host(address)
                .await
                .map_err(|e| Error::LookupHost(e, address.to_string()))?
                .collect::<Vec<_>>();
            debug!(message = "resolved", ?addresses);
            TcpStream::connect(&*addresses)
                .await
                .map_err(|e| Error::Connect(e, address.to_string()))
        };
        let socket = tokio::time::timeout(self.settings.send_timeout, connecting)
            .await
            .map_err(|_| Error::ConnectTimeout(address.to_string(), self.settings.send_timeout))??;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected", address);
        self.reconnect_countdown = self.settings.reconnect_after_timeouts;
        Ok(Framed::new(socket, ModbusTCPCodec {}))
    }

    fn handle_response(
        &mut self,
        response: modbus::Response,
        recv_time: pin::Pin<&mut tokio::time::Sleep>,
    ) {
        trace!(message = "decoded a response", transaction = response.transaction_id);
        let inflight_index =
            self.inflight.iter().position(|(id, _)| *id == response.transaction_id);
        let Some(inflight_index) = inflight_index else {
            debug!(
                message = "a response we were not expecting",
                transaction = response.transaction_id
            );
            return;
        };
        self.inflight.remove(inflight_index);
        self.reconnect_countdown = self.settings.reconnect_after_timeouts;
        self.responses.add_response(response);
        if let Some((_, timeout)) = self.inflight.front() {
            recv_time.reset(*timeout);
        }
    }

    fn handle_timeout(&mut self, request_timeout: pin::Pin<&mut tokio::time::Sleep>) -> bool {
        let Some((transaction_id, _)) = self.inflight.pop_front() else {
            return true;
        };
        debug!(
            message = "an inflight request timed out",
            transaction_id,
            reconnect_countdown = self.reconnect_countdown
        );
        self.responses.mark_timeout(transaction_id);
        if let Some(new_count) = self.reconnect_countdown.checked_sub(1) {
            self.reconnect_countdown = new_count;
        } else {
            return false;
        };
        if let Some((_, timeout)) = self.inflight.front() {
            request_timeout.reset(*timeout);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::{ModbusServerCodec, Operation, Response, ResponseKind};
    use tokio::net::TcpListener;

    fn settings(address: String) -> Settings {
        Settings {
            address,
            unit_id: 1,
            read_timeout: Duration::from_millis(200),
            send_timeout: Duration::from_millis(500),
            reconnect_after_timeouts: 3,
            server_busy_retry_delay: Duration::from_millis(1),
        }
    }

    /// Answers every request by running `respond` over it, or stays silent on `None`.
    async fn serve_once(
        respond: impl Fn(&Request) -> Option<ResponseKind> + Send + 'static,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, ModbusServerCodec {});
            while let Some(Ok(incoming)) = framed.next().await {
                let modbus::Incoming::Request(req) = incoming else { continue };
                if let Some(kind) = respond(&req) {
                    let response =
                        Response { unit_id: req.unit_id, transaction_id: req.transaction_id, kind };
                    framed.send(response).await.unwrap();
                }
            }
        });
        address
    }

    #[tokio::test]
    async fn round_trip() {
        let address = serve_once(|_| Some(ResponseKind::Words { function: 3, values: vec![7, 8] })).await;
        let connection = Connection::new(settings(address));
        let response = connection
            .send(Operation::ReadHoldings { address: 0, count: 2 })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.kind, ResponseKind::Words { function: 3, values: vec![7, 8] });
        assert!(connection.is_connected());
        connection.close().await;
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let address = serve_once(|_| None).await;
        let connection = Connection::new(settings(address));
        let response = connection.send(Operation::ReadHoldings { address: 0, count: 1 }).await;
        assert!(matches!(response, Ok(None)));
    }

    #[tokio::test]
    async fn busy_is_retried_then_reported() {
        let address = serve_once(|_| Some(ResponseKind::Exception { function: 3, code: 6 })).await;
        let connection = Connection::new(settings(address));
        let response = connection
            .send_retrying(Operation::ReadHoldings { address: 0, count: 1 }, 3)
            .await
            .unwrap()
            .unwrap();
        assert!(response.is_server_busy());
    }

    #[tokio::test]
    async fn unreachable_plc_is_an_error() {
        // Bind and drop to find a port with nothing listening on it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let connection = Connection::new(settings(address));
        let response = connection.send(Operation::ReadHoldings { address: 0, count: 1 }).await;
        assert!(matches!(response, Err(Error::Unreachable(_))), "{response:?}");
        assert!(!connection.is_connected());
    }
}
