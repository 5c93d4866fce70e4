use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Largest number of registers a single read may request.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Largest number of coils or discrete inputs a single read may request.
pub const MAX_READ_BITS: u16 = 2000;
/// Largest number of registers a single multiple-register write may carry.
pub const MAX_WRITE_REGISTERS: u16 = 123;

pub const ILLEGAL_FUNCTION: u8 = 1;
pub const ILLEGAL_DATA_ADDRESS: u8 = 2;
pub const ILLEGAL_DATA_VALUE: u8 = 3;
pub const SERVER_DEVICE_FAILURE: u8 = 4;
pub const SERVER_BUSY: u8 = 6;

/// The one-byte count field of a PDU. Payloads too long for it cannot be framed.
fn byte_count(len: usize) -> Result<u8, std::io::Error> {
    u8::try_from(len).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("a payload of {len} bytes does not fit in a Modbus PDU"),
        )
    })
}

pub fn exception_name(code: u8) -> &'static str {
    match code {
        ILLEGAL_FUNCTION => "illegal function",
        ILLEGAL_DATA_ADDRESS => "illegal data address",
        ILLEGAL_DATA_VALUE => "illegal data value",
        SERVER_DEVICE_FAILURE => "server device failure",
        5 => "acknowledge",
        SERVER_BUSY => "server device busy",
        10 => "gateway path unavailable",
        11 => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

/// A Modbus operation. Addresses are protocol (0-based) addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ReadCoils { address: u16, count: u16 },
    ReadDiscreteInputs { address: u16, count: u16 },
    ReadHoldings { address: u16, count: u16 },
    ReadInputs { address: u16, count: u16 },
    WriteCoil { address: u16, value: bool },
    WriteHolding { address: u16, value: u16 },
    WriteHoldings { address: u16, values: Vec<u16> },
}

impl Operation {
    pub fn function_code(&self) -> u8 {
        match self {
            Operation::ReadCoils { .. } => 1,
            Operation::ReadDiscreteInputs { .. } => 2,
            Operation::ReadHoldings { .. } => 3,
            Operation::ReadInputs { .. } => 4,
            Operation::WriteCoil { .. } => 5,
            Operation::WriteHolding { .. } => 6,
            Operation::WriteHoldings { .. } => 16,
        }
    }

    fn encode_pdu(&self, dst: &mut BytesMut) -> Result<(), std::io::Error> {
        dst.put_u8(self.function_code());
        match self {
            Operation::ReadCoils { address, count }
            | Operation::ReadDiscreteInputs { address, count }
            | Operation::ReadHoldings { address, count }
            | Operation::ReadInputs { address, count } => {
                dst.put_u16(*address);
                dst.put_u16(*count);
            }
            Operation::WriteCoil { address, value } => {
                dst.put_u16(*address);
                dst.put_u16(if *value { 0xFF00 } else { 0x0000 });
            }
            Operation::WriteHolding { address, value } => {
                dst.put_u16(*address);
                dst.put_u16(*value);
            }
            Operation::WriteHoldings { address, values } => {
                let bytes = byte_count(values.len() * 2)?;
                dst.put_u16(*address);
                dst.put_u16(u16::from(bytes) / 2);
                dst.put_u8(bytes);
                for value in values {
                    dst.put_u16(*value);
                }
            }
        }
        Ok(())
    }

    fn pdu_len(&self) -> usize {
        match self {
            Operation::WriteHoldings { values, .. } => 6 + 2 * values.len(),
            _ => 5,
        }
    }

    /// Parse a request PDU. `Err` carries the exception code to answer with.
    fn decode_pdu(pdu: &[u8]) -> Result<Self, u8> {
        let [function, a0, a1, b0, b1, rest @ ..] = pdu else {
            return Err(if pdu.first().is_some_and(|f| !matches!(*f, 1..=6 | 16)) {
                ILLEGAL_FUNCTION
            } else {
                ILLEGAL_DATA_VALUE
            });
        };
        let address = u16::from_be_bytes([*a0, *a1]);
        let word = u16::from_be_bytes([*b0, *b1]);
        Ok(match function {
            1 => Operation::ReadCoils { address, count: word },
            2 => Operation::ReadDiscreteInputs { address, count: word },
            3 => Operation::ReadHoldings { address, count: word },
            4 => Operation::ReadInputs { address, count: word },
            5 => match word {
                0xFF00 => Operation::WriteCoil { address, value: true },
                0x0000 => Operation::WriteCoil { address, value: false },
                _ => return Err(ILLEGAL_DATA_VALUE),
            },
            6 => Operation::WriteHolding { address, value: word },
            16 => {
                let [byte_count, data @ ..] = rest else { return Err(ILLEGAL_DATA_VALUE) };
                if usize::from(*byte_count) != data.len() || data.len() != 2 * usize::from(word) {
                    return Err(ILLEGAL_DATA_VALUE);
                }
                let values = data
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Operation::WriteHoldings { address, values }
            }
            _ => return Err(ILLEGAL_FUNCTION),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_server_busy(&self) -> bool {
        self.exception_code() == Some(SERVER_BUSY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    Exception { function: u8, code: u8 },
    /// Coil or discrete input states, padded with `false` to a whole number of bytes.
    Bits { function: u8, values: Vec<bool> },
    Words { function: u8, values: Vec<u16> },
    WriteCoil { address: u16, value: bool },
    WriteHolding { address: u16, value: u16 },
    WriteHoldings { address: u16, count: u16 },
}

impl ResponseKind {
    fn encode_pdu(&self, dst: &mut BytesMut) -> Result<(), std::io::Error> {
        match self {
            ResponseKind::Exception { function, code } => {
                dst.put_u8(function | 0x80);
                dst.put_u8(*code);
            }
            ResponseKind::Bits { function, values } => {
                dst.put_u8(*function);
                dst.put_u8(byte_count(values.len().div_ceil(8))?);
                for chunk in values.chunks(8) {
                    let byte = chunk.iter().enumerate().fold(0u8, |acc, (i, bit)| {
                        acc | (u8::from(*bit) << i)
                    });
                    dst.put_u8(byte);
                }
            }
            ResponseKind::Words { function, values } => {
                dst.put_u8(*function);
                dst.put_u8(byte_count(values.len() * 2)?);
                for value in values {
                    dst.put_u16(*value);
                }
            }
            ResponseKind::WriteCoil { address, value } => {
                dst.put_u8(5);
                dst.put_u16(*address);
                dst.put_u16(if *value { 0xFF00 } else { 0x0000 });
            }
            ResponseKind::WriteHolding { address, value } => {
                dst.put_u8(6);
                dst.put_u16(*address);
                dst.put_u16(*value);
            }
            ResponseKind::WriteHoldings { address, count } => {
                dst.put_u8(16);
                dst.put_u16(*address);
                dst.put_u16(*count);
            }
        }
        Ok(())
    }

    fn pdu_len(&self) -> usize {
        match self {
            ResponseKind::Exception { .. } => 2,
            ResponseKind::Bits { values, .. } => 2 + values.len().div_ceil(8),
            ResponseKind::Words { values, .. } => 2 + 2 * values.len(),
            _ => 5,
        }
    }

    fn decode_pdu(pdu: &[u8]) -> Option<Self> {
        let [function, rest @ ..] = pdu else { return None };
        let function = *function;
        if function & 0x80 != 0 {
            let [code, ..] = rest else { return None };
            return Some(ResponseKind::Exception { function: function & 0x7F, code: *code });
        }
        Some(match function {
            1 | 2 => {
                let [_byte_count, data @ ..] = rest else { return None };
                let values = data
                    .iter()
                    .flat_map(|byte| (0..8).map(move |i| byte & (1 << i) != 0))
                    .collect();
                ResponseKind::Bits { function, values }
            }
            3 | 4 => {
                // The MBAP length already delimits the payload, so the byte count is not
                // consulted beyond requiring whole registers.
                let [_byte_count, data @ ..] = rest else { return None };
                if data.len() % 2 != 0 {
                    return None;
                }
                let values =
                    data.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
                ResponseKind::Words { function, values }
            }
            5 | 6 | 16 => {
                let [a0, a1, b0, b1, ..] = rest else { return None };
                let address = u16::from_be_bytes([*a0, *a1]);
                let word = u16::from_be_bytes([*b0, *b1]);
                match function {
                    5 => ResponseKind::WriteCoil { address, value: word == 0xFF00 },
                    6 => ResponseKind::WriteHolding { address, value: word },
                    _ => ResponseKind::WriteHoldings { address, count: word },
                }
            }
            _ => return None,
        })
    }
}

fn put_header(dst: &mut BytesMut, transaction_id: u16, unit_id: u8, pdu_len: usize) {
    dst.reserve(7 + pdu_len);
    dst.put_u16(transaction_id);
    dst.put_u16(0);
    dst.put_u16((pdu_len + 1) as u16);
    dst.put_u8(unit_id);
}

struct Frame {
    transaction_id: u16,
    unit_id: u8,
    pdu: Vec<u8>,
}

/// Split the next MBAP frame off `src`, skipping bytes until something that looks like a header
/// with protocol id 0 comes along.
fn next_frame(src: &mut BytesMut) -> Option<Frame> {
    loop {
        trace!(message = "attempt at decoding", buffer = ?src);
        let Some((header, remainder)) = src.split_first_chunk::<7>() else {
            return None;
        };
        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let proto = u16::from_be_bytes([header[2], header[3]]);
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let unit_id = header[6];
        if proto != 0 || !(2..=254).contains(&length) {
            src.advance(1);
            continue;
        }
        let Some((pdu, _)) = remainder.split_at_checked(length - 1) else {
            return None;
        };
        let pdu = pdu.to_vec();
        src.advance(6 + length);
        return Some(Frame { transaction_id, unit_id, pdu });
    }
}

/// Client side of Modbus TCP: sends requests, receives responses.
pub struct ModbusTCPCodec {}

impl Encoder<&Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        put_header(dst, req.transaction_id, req.unit_id, req.operation.pdu_len());
        if let Err(e) = req.operation.encode_pdu(dst) {
            dst.truncate(start);
            return Err(e);
        }
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(frame) = next_frame(src) {
            match ResponseKind::decode_pdu(&frame.pdu) {
                Some(kind) => {
                    return Ok(Some(Response {
                        unit_id: frame.unit_id,
                        transaction_id: frame.transaction_id,
                        kind,
                    }));
                }
                None => trace!(message = "dropping malformed response", pdu = ?frame.pdu),
            }
        }
        Ok(None)
    }
}

impl Encoder<Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Request>::encode(self, &req, dst)
    }
}

/// A request as seen by a server: either a well-formed operation or one that must be answered
/// with an exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Request(Request),
    Rejected { unit_id: u8, transaction_id: u16, function: u8, code: u8 },
}

/// Server side of Modbus TCP, used by the simulator.
pub struct ModbusServerCodec {}

impl Encoder<&Response> for ModbusServerCodec {
    type Error = std::io::Error;
    fn encode(&mut self, resp: &Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        put_header(dst, resp.transaction_id, resp.unit_id, resp.kind.pdu_len());
        if let Err(e) = resp.kind.encode_pdu(dst) {
            dst.truncate(start);
            return Err(e);
        }
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Encoder<Response> for ModbusServerCodec {
    type Error = std::io::Error;
    fn encode(&mut self, resp: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Response>::encode(self, &resp, dst)
    }
}

impl Decoder for ModbusServerCodec {
    type Item = Incoming;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = next_frame(src) else {
            return Ok(None);
        };
        Ok(Some(match Operation::decode_pdu(&frame.pdu) {
            Ok(operation) => Incoming::Request(Request {
                unit_id: frame.unit_id,
                transaction_id: frame.transaction_id,
                operation,
            }),
            Err(code) => Incoming::Rejected {
                unit_id: frame.unit_id,
                transaction_id: frame.transaction_id,
                function: frame.pdu.first().copied().unwrap_or(0) & 0x7F,
                code,
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_request(operation: Operation) -> BytesMut {
        let mut buffer = BytesMut::new();
        let request = Request { unit_id: 1, transaction_id: 0x0102, operation };
        ModbusTCPCodec {}.encode(&request, &mut buffer).unwrap();
        buffer
    }

    #[test]
    fn read_holdings_frame() {
        let buffer = encode_request(Operation::ReadHoldings { address: 8788, count: 2 });
        assert_eq!(&buffer[..], &[0x01, 0x02, 0, 0, 0, 6, 1, 3, 0x22, 0x54, 0, 2]);
    }

    #[test]
    fn write_holdings_frame() {
        let buffer = encode_request(Operation::WriteHoldings {
            address: 6750,
            values: vec![0x4248, 0x0000],
        });
        assert_eq!(
            &buffer[..],
            &[0x01, 0x02, 0, 0, 0, 11, 1, 16, 0x1A, 0x5E, 0, 2, 4, 0x42, 0x48, 0, 0]
        );
    }

    #[test]
    fn server_decodes_what_client_encodes() {
        let operations = [
            Operation::ReadCoils { address: 3, count: 10 },
            Operation::WriteCoil { address: 3, value: true },
            Operation::WriteHolding { address: 7, value: 0xBEEF },
            Operation::WriteHoldings { address: 9, values: vec![1, 2, 3] },
        ];
        for operation in operations {
            let mut buffer = encode_request(operation.clone());
            let incoming = ModbusServerCodec {}.decode(&mut buffer).unwrap();
            let Some(Incoming::Request(request)) = incoming else { panic!("{incoming:?}") };
            assert_eq!(request.operation, operation);
            assert_eq!(request.transaction_id, 0x0102);
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn decodes_words_and_exceptions() {
        let mut buffer = BytesMut::from(
            &[0, 7, 0, 0, 0, 7, 1, 3, 4, 0x3F, 0x80, 0, 0, 0, 8, 0, 0, 0, 3, 1, 0x83, 2][..],
        );
        let mut codec = ModbusTCPCodec {};
        let first = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(first.transaction_id, 7);
        assert_eq!(first.kind, ResponseKind::Words { function: 3, values: vec![0x3F80, 0] });
        let second = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(second.exception_code(), Some(ILLEGAL_DATA_ADDRESS));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn resyncs_after_garbage() {
        let mut buffer = BytesMut::from(&[0xFF, 0, 9, 0, 0, 0, 3, 1, 0x86, 6][..]);
        let response = ModbusTCPCodec {}.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(response.transaction_id, 9);
        assert!(response.is_server_busy());
    }

    #[test]
    fn waits_for_complete_frame() {
        let mut buffer = BytesMut::from(&[0, 1, 0, 0, 0, 7, 1, 3, 4, 0x3F][..]);
        assert_eq!(ModbusTCPCodec {}.decode(&mut buffer).unwrap(), None);
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn bits_are_packed_lsb_first() {
        let mut buffer = BytesMut::new();
        let response = Response {
            unit_id: 1,
            transaction_id: 1,
            kind: ResponseKind::Bits { function: 1, values: vec![true, false, true] },
        };
        ModbusServerCodec {}.encode(&response, &mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0, 1, 0, 0, 0, 4, 1, 1, 1, 0b101]);
        let decoded = ModbusTCPCodec {}.decode(&mut buffer).unwrap().unwrap();
        let ResponseKind::Bits { values, .. } = decoded.kind else { panic!() };
        assert_eq!(&values[..3], &[true, false, true]);
        assert_eq!(values.len(), 8);
    }

    #[test]
    fn oversized_payloads_are_not_framed() {
        let mut buffer = BytesMut::from(&[0xAA][..]);
        let response = Response {
            unit_id: 1,
            transaction_id: 1,
            kind: ResponseKind::Words { function: 3, values: vec![0; 200] },
        };
        assert!(ModbusServerCodec {}.encode(&response, &mut buffer).is_err());
        assert_eq!(&buffer[..], &[0xAA]);
        let request = Request {
            unit_id: 1,
            transaction_id: 1,
            operation: Operation::WriteHoldings { address: 0, values: vec![0; 128] },
        };
        assert!(ModbusTCPCodec {}.encode(&request, &mut buffer).is_err());
        assert_eq!(&buffer[..], &[0xAA]);
    }

    #[test]
    fn unknown_function_is_rejected() {
        let mut buffer = BytesMut::from(&[0, 4, 0, 0, 0, 6, 1, 0x2B, 0, 0, 0, 0][..]);
        let incoming = ModbusServerCodec {}.decode(&mut buffer).unwrap();
        assert_eq!(
            incoming,
            Some(Incoming::Rejected {
                unit_id: 1,
                transaction_id: 4,
                function: 0x2B,
                code: ILLEGAL_FUNCTION
            })
        );
    }
}
