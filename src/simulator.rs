//! A Modbus TCP server backed by an in-memory register bank.
//!
//! The bank is seeded from a tag table: every record with a numeric source column starts out
//! holding that value. Records live at protocol address `register - 1`, which is where a client
//! using relative addressing looks for them. Valve commands echo into their feedback tags, so
//! opening a simulated valve makes it report open.
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::modbus::{self, Incoming, ModbusServerCodec, Operation, Response, ResponseKind};
use crate::table::{TagRecord, TagTable};
use crate::tags::{DataType, Value};

/// Every protocol address of every table.
pub const FULL_SIZE: usize = 1 << 16;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not listen on {1}")]
    Bind(#[source] std::io::Error, String),
    #[error("could not determine the listening address")]
    LocalAddr(#[source] std::io::Error),
    #[error("could not accept a connection")]
    Accept(#[source] std::io::Error),
    #[error("the simulator task failed")]
    Join(#[source] tokio::task::JoinError),
}

/// A valve command and the feedback tags that follow it.
#[derive(Clone, Debug, PartialEq)]
struct Echo {
    command: u16,
    command_type: DataType,
    open: Option<(u16, DataType)>,
    close: Option<(u16, DataType)>,
}

fn protocol_address(record: &TagRecord) -> Option<u16> {
    u16::try_from(record.register.checked_sub(1)?).ok()
}

#[derive(Clone, Debug)]
pub struct RegisterBank {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holdings: Vec<u16>,
    inputs: Vec<u16>,
    echoes: Vec<Echo>,
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new(FULL_SIZE)
    }
}

impl RegisterBank {
    /// A zeroed bank with `size` entries in each table.
    pub fn new(size: usize) -> Self {
        let size = size.min(FULL_SIZE);
        Self {
            coils: vec![false; size],
            discrete_inputs: vec![false; size],
            holdings: vec![0; size],
            inputs: vec![0; size],
            echoes: Vec::new(),
        }
    }

    pub fn from_table(table: &TagTable) -> Self {
        let mut bank = Self::default();
        let mut seeded = 0;
        for record in table.records() {
            let Some(address) = protocol_address(record) else {
                warn!(
                    message = "record has no protocol address",
                    tag = %record.name,
                    register = record.register
                );
                continue;
            };
            let number = record.default_value().unwrap_or(0.0);
            match record.data_type.value_from_f64(number) {
                Ok(value) => {
                    if bank.write_value(address, value) {
                        seeded += 1;
                    }
                }
                Err(e) => warn!(
                    message = "could not seed record",
                    tag = %record.name,
                    error = (&e as &dyn std::error::Error),
                ),
            }
        }
        bank.echoes = Self::find_echoes(table);
        info!(message = "register bank seeded", records = seeded, valves = bank.echoes.len());
        bank
    }

    /// Pair valve commands with their feedback tags, both as `NAME_FEEDBACK_OPEN` and as the
    /// document's `STR`/`OPEN_FB`/`CLOSE_FB` group members.
    fn find_echoes(table: &TagTable) -> Vec<Echo> {
        let located = |record: Option<&TagRecord>| {
            let record = record?;
            Some((protocol_address(record)?, record.data_type))
        };
        let mut echoes = Vec::new();
        for record in table.records() {
            let open = located(table.find(&format!("{}_FEEDBACK_OPEN", record.name)));
            let close = located(table.find(&format!("{}_FEEDBACK_CLOSE", record.name)));
            if open.is_none() && close.is_none() {
                continue;
            }
            if let Some((command, command_type)) = located(Some(record)) {
                echoes.push(Echo { command, command_type, open, close });
            }
        }
        for group in table.valve_groups() {
            let Some((command, command_type)) =
                located(group.member("STR").or_else(|| group.member("STR_CMD")))
            else {
                continue;
            };
            let open = located(group.member("OPEN_FB"));
            let close = located(group.member("CLOSE_FB"));
            if open.is_some() || close.is_some() {
                echoes.push(Echo { command, command_type, open, close });
            }
        }
        echoes
    }

    fn range(len: usize, address: u16, count: usize) -> Result<std::ops::Range<usize>, u8> {
        let start = usize::from(address);
        let end = start + count;
        if end > len {
            return Err(modbus::ILLEGAL_DATA_ADDRESS);
        }
        Ok(start..end)
    }

    pub fn holdings(&self, address: u16, count: usize) -> Option<&[u16]> {
        let range = Self::range(self.holdings.len(), address, count).ok()?;
        Some(&self.holdings[range])
    }

    pub fn set_holdings(&mut self, address: u16, values: &[u16]) -> bool {
        let Ok(range) = Self::range(self.holdings.len(), address, values.len()) else {
            return false;
        };
        self.holdings[range].copy_from_slice(values);
        true
    }

    pub fn read_value(&self, address: u16, data_type: DataType) -> Option<Value> {
        let words = self.holdings(address, usize::from(data_type.register_count()))?;
        data_type.from_words(words)
    }

    pub fn write_value(&mut self, address: u16, value: Value) -> bool {
        self.set_holdings(address, &value.to_words())
    }

    pub fn set_input(&mut self, address: u16, value: u16) -> bool {
        match self.inputs.get_mut(usize::from(address)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.coils.get(usize::from(address)).copied()
    }

    pub fn set_discrete_input(&mut self, address: u16, value: bool) -> bool {
        match self.discrete_inputs.get_mut(usize::from(address)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn update_feedback(&mut self, written: std::ops::Range<usize>) {
        let touched = self
            .echoes
            .iter()
            .filter(|echo| written.contains(&usize::from(echo.command)))
            .cloned()
            .collect::<Vec<_>>();
        for echo in touched {
            let Some(command) = self.read_value(echo.command, echo.command_type) else {
                continue;
            };
            let open = command.as_f64() != 0.0;
            for (target, state) in [(echo.open, open), (echo.close, !open)] {
                let Some((address, data_type)) = target else { continue };
                if let Ok(value) = data_type.value_from_f64(if state { 1.0 } else { 0.0 }) {
                    self.write_value(address, value);
                }
            }
            debug!(message = "valve feedback updated", command = echo.command, open);
        }
    }

    /// Requests must ask for between one and `max` items.
    fn quantity(count: usize, max: u16) -> Result<usize, u8> {
        if count == 0 || count > usize::from(max) {
            return Err(modbus::ILLEGAL_DATA_VALUE);
        }
        Ok(count)
    }

    /// Carry out an operation, returning the response or an exception code.
    pub fn apply(&mut self, operation: &Operation) -> Result<ResponseKind, u8> {
        let function = operation.function_code();
        let count = match operation {
            Operation::ReadCoils { count, .. } | Operation::ReadDiscreteInputs { count, .. } => {
                Self::quantity(usize::from(*count), modbus::MAX_READ_BITS)?
            }
            Operation::ReadHoldings { count, .. } | Operation::ReadInputs { count, .. } => {
                Self::quantity(usize::from(*count), modbus::MAX_READ_REGISTERS)?
            }
            Operation::WriteHoldings { values, .. } => {
                Self::quantity(values.len(), modbus::MAX_WRITE_REGISTERS)?
            }
            Operation::WriteCoil { .. } | Operation::WriteHolding { .. } => 1,
        };
        Ok(match operation {
            Operation::ReadCoils { address, .. } => {
                let range = Self::range(self.coils.len(), *address, count)?;
                ResponseKind::Bits { function, values: self.coils[range].to_vec() }
            }
            Operation::ReadDiscreteInputs { address, .. } => {
                let range = Self::range(self.discrete_inputs.len(), *address, count)?;
                ResponseKind::Bits { function, values: self.discrete_inputs[range].to_vec() }
            }
            Operation::ReadHoldings { address, .. } => {
                let range = Self::range(self.holdings.len(), *address, count)?;
                ResponseKind::Words { function, values: self.holdings[range].to_vec() }
            }
            Operation::ReadInputs { address, .. } => {
                let range = Self::range(self.inputs.len(), *address, count)?;
                ResponseKind::Words { function, values: self.inputs[range].to_vec() }
            }
            Operation::WriteCoil { address, value } => {
                let range = Self::range(self.coils.len(), *address, count)?;
                self.coils[range.start] = *value;
                ResponseKind::WriteCoil { address: *address, value: *value }
            }
            Operation::WriteHolding { address, value } => {
                let range = Self::range(self.holdings.len(), *address, count)?;
                self.holdings[range.start] = *value;
                self.update_feedback(range);
                ResponseKind::WriteHolding { address: *address, value: *value }
            }
            Operation::WriteHoldings { address, values } => {
                let range = Self::range(self.holdings.len(), *address, count)?;
                self.holdings[range.clone()].copy_from_slice(values);
                self.update_feedback(range);
                let count = u16::try_from(count).map_err(|_| modbus::ILLEGAL_DATA_VALUE)?;
                ResponseKind::WriteHoldings { address: *address, count }
            }
        })
    }
}

pub struct Simulator {
    bank: Arc<Mutex<RegisterBank>>,
    unit_id: Option<u8>,
}

impl Simulator {
    pub fn new(bank: RegisterBank) -> Self {
        Self { bank: Arc::new(Mutex::new(bank)), unit_id: None }
    }

    /// Only answer requests addressed to `unit_id`; others are ignored.
    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    pub fn bank(&self) -> Arc<Mutex<RegisterBank>> {
        Arc::clone(&self.bank)
    }

    /// Serve connections from `listener` until `shutdown` is cancelled.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        let mut incoming = TcpListenerStream::new(listener);
        let tracker = TaskTracker::new();
        let result = loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                stream = incoming.next() => stream,
            };
            let stream = match stream {
                None => break Ok(()),
                Some(Err(e)) => break Err(Error::Accept(e)),
                Some(Ok(stream)) => stream,
            };
            let peer = stream.peer_addr().ok();
            debug!(message = "client connected", peer = ?peer);
            tracker.spawn(handle_client(
                stream,
                Arc::clone(&self.bank),
                self.unit_id,
                shutdown.clone(),
            ));
        };
        shutdown.cancel();
        tracker.close();
        tracker.wait().await;
        info!(message = "simulator stopped");
        result
    }

    /// Listen on `address` and serve in the background.
    pub async fn start(self, address: &str) -> Result<RunningSimulator, Error> {
        let listener =
            TcpListener::bind(address).await.map_err(|e| Error::Bind(e, address.to_string()))?;
        let local_addr = listener.local_addr().map_err(Error::LocalAddr)?;
        info!(message = "simulator listening", address = %local_addr);
        let bank = self.bank();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.serve(listener, shutdown.clone()));
        Ok(RunningSimulator { local_addr, bank, shutdown, task })
    }
}

pub struct RunningSimulator {
    local_addr: SocketAddr,
    bank: Arc<Mutex<RegisterBank>>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<Result<(), Error>>,
}

impl RunningSimulator {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn bank(&self) -> Arc<Mutex<RegisterBank>> {
        Arc::clone(&self.bank)
    }

    pub async fn stop(self) -> Result<(), Error> {
        self.shutdown.cancel();
        self.task.await.map_err(Error::Join)?
    }
}

async fn handle_client(
    stream: TcpStream,
    bank: Arc<Mutex<RegisterBank>>,
    unit_id: Option<u8>,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, ModbusServerCodec {});
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => return,
            incoming = framed.next() => incoming,
        };
        let incoming = match incoming {
            None => return,
            Some(Err(e)) => {
                debug!(
                    message = "client connection failed",
                    error = (&e as &dyn std::error::Error)
                );
                return;
            }
            Some(Ok(incoming)) => incoming,
        };
        let response = match incoming {
            Incoming::Request(request) => {
                if unit_id.is_some_and(|id| id != request.unit_id) {
                    debug!(
                        message = "ignoring request for another unit",
                        unit_id = request.unit_id
                    );
                    continue;
                }
                let kind = bank
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .apply(&request.operation)
                    .unwrap_or_else(|code| ResponseKind::Exception {
                        function: request.operation.function_code(),
                        code,
                    });
                Response { unit_id: request.unit_id, transaction_id: request.transaction_id, kind }
            }
            Incoming::Rejected { unit_id, transaction_id, function, code } => Response {
                unit_id,
                transaction_id,
                kind: ResponseKind::Exception { function, code },
            },
        };
        if let Err(e) = framed.send(response).await {
            debug!(message = "could not respond", error = (&e as &dyn std::error::Error));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_tables_with_bounds() {
        let mut bank = RegisterBank::new(10);
        assert_eq!(
            bank.apply(&Operation::WriteHoldings { address: 8, values: vec![1, 2] }),
            Ok(ResponseKind::WriteHoldings { address: 8, count: 2 })
        );
        assert_eq!(
            bank.apply(&Operation::ReadHoldings { address: 8, count: 2 }),
            Ok(ResponseKind::Words { function: 3, values: vec![1, 2] })
        );
        assert_eq!(
            bank.apply(&Operation::ReadHoldings { address: 9, count: 2 }),
            Err(modbus::ILLEGAL_DATA_ADDRESS)
        );
        assert_eq!(
            bank.apply(&Operation::WriteCoil { address: 3, value: true }),
            Ok(ResponseKind::WriteCoil { address: 3, value: true })
        );
        assert_eq!(bank.coil(3), Some(true));
        assert_eq!(
            bank.apply(&Operation::ReadCoils { address: 2, count: 3 }),
            Ok(ResponseKind::Bits { function: 1, values: vec![false, true, false] })
        );
        assert!(bank.set_input(4, 77));
        assert_eq!(
            bank.apply(&Operation::ReadInputs { address: 4, count: 1 }),
            Ok(ResponseKind::Words { function: 4, values: vec![77] })
        );
        assert!(bank.set_discrete_input(0, true));
        assert_eq!(
            bank.apply(&Operation::ReadDiscreteInputs { address: 0, count: 1 }),
            Ok(ResponseKind::Bits { function: 2, values: vec![true] })
        );
        assert!(!bank.set_input(10, 1));
    }

    #[test]
    fn rejects_quantities_outside_protocol_limits() {
        let mut bank = RegisterBank::default();
        for operation in [
            Operation::ReadHoldings { address: 0, count: 0 },
            Operation::ReadHoldings { address: 0, count: 126 },
            Operation::ReadInputs { address: 0, count: 200 },
            Operation::ReadCoils { address: 0, count: 0 },
            Operation::ReadDiscreteInputs { address: 0, count: 2001 },
            Operation::WriteHoldings { address: 0, values: Vec::new() },
            Operation::WriteHoldings { address: 0, values: vec![0; 124] },
        ] {
            assert_eq!(bank.apply(&operation), Err(modbus::ILLEGAL_DATA_VALUE), "{operation:?}");
        }
        let ResponseKind::Words { values, .. } =
            bank.apply(&Operation::ReadHoldings { address: 0, count: 125 }).unwrap()
        else {
            panic!("expected registers");
        };
        assert_eq!(values.len(), 125);
        let ResponseKind::Bits { values, .. } =
            bank.apply(&Operation::ReadCoils { address: 0, count: 2000 }).unwrap()
        else {
            panic!("expected bits");
        };
        assert_eq!(values.len(), 2000);
        assert_eq!(
            bank.apply(&Operation::WriteHoldings { address: 0, values: vec![7; 123] }),
            Ok(ResponseKind::WriteHoldings { address: 0, count: 123 })
        );
    }

    #[test]
    fn seeds_from_table_sources() {
        let table = TagTable::parse(
            "- 0x2254, 8789, PT_RX04, Signal Tag, 1, float 32, bar, 0, 10, Analog, , , 1.25\n\
             - 0x2256, 8791, LT_RX04, Signal Tag, 2, uint16, %, 0, 100, Analog, , , 40\n",
        )
        .unwrap();
        let bank = RegisterBank::from_table(&table);
        assert_eq!(bank.read_value(8788, DataType::Float32), Some(Value::F32(1.25)));
        assert_eq!(bank.holdings(8790, 1), Some(&[40u16][..]));
    }

    #[test]
    fn valve_commands_echo_into_feedback() {
        let mut bank = RegisterBank::from_table(&TagTable::builtin());
        let open = TagTable::builtin().find("XV_HWS_R4_FEEDBACK_OPEN").unwrap().register as u16 - 1;
        let close = TagTable::builtin().find("XV_HWS_R4_FEEDBACK_CLOSE").unwrap().register as u16 - 1;
        let command = 6507 - 1;
        bank.apply(&Operation::WriteHoldings { address: command, values: Value::F32(1.0).to_words() })
            .unwrap();
        assert_eq!(bank.read_value(open, DataType::Float32), Some(Value::F32(1.0)));
        assert_eq!(bank.read_value(close, DataType::Float32), Some(Value::F32(0.0)));
        bank.apply(&Operation::WriteHoldings { address: command, values: Value::F32(0.0).to_words() })
            .unwrap();
        assert_eq!(bank.read_value(open, DataType::Float32), Some(Value::F32(0.0)));
        assert_eq!(bank.read_value(close, DataType::Float32), Some(Value::F32(1.0)));
    }

    #[test]
    fn document_valve_groups_echo() {
        let table = TagTable::parse(
            "- 0x1966, 6502, XV_A_STR, Variable, 1, float 32, , , , Digital, STOP, START, 0\n\
             - 0x1968, 6504, XV_A_OPEN_FB, Signal Tag, 2, float 32, , , , Digital, NO, YES, 0\n\
             - 0x196A, 6506, XV_A_CLOSE_FB, Signal Tag, 3, float 32, , , , Digital, NO, YES, 1\n",
        )
        .unwrap();
        let mut bank = RegisterBank::from_table(&table);
        bank.apply(&Operation::WriteHoldings { address: 6501, values: Value::F32(1.0).to_words() })
            .unwrap();
        assert_eq!(bank.read_value(6503, DataType::Float32), Some(Value::F32(1.0)));
        assert_eq!(bank.read_value(6505, DataType::Float32), Some(Value::F32(0.0)));
    }
}
