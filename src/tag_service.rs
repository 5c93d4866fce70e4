//! Reading and writing tags by name.
//!
//! Tag names are resolved through the plant configuration to a data model address, which the
//! PLC's addressing scheme turns into a Modbus table and protocol address. Values are encoded
//! big-endian, both within and across registers.
use std::sync::Arc;

use tracing::debug;

use crate::config::{AddressingScheme, PlantConfig, PlcConfig, RegisterConfig};
use crate::modbus::{Operation, Response, ResponseKind};
use crate::plc::{self, ConnectionManager};
use crate::tags::{DataType, RegisterKind, Value, ValueError};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display, strum::EnumString,
)]
pub enum ErrorKind {
    Configuration,
    Validation,
    AddressResolution,
    Encoding,
    Connection,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no PLC `{0}` is configured")]
    UnknownPlc(String),
    #[error("the PLC id must not be empty")]
    EmptyPlcId,
    #[error("the tag name must not be empty")]
    EmptyTagName,
    #[error("no tags were requested")]
    NothingRequested,
    #[error("tag `{1}` is not configured on `{0}`{2}")]
    UnknownTag(String, String, String),
    #[error("tag `{0}` has address {1}, which has no Modbus protocol address")]
    AddressOutOfRange(String, u32),
    #[error("tag `{0}` is read-only")]
    ReadOnly(String),
    #[error("tag `{0}` lives in the {1} table, which cannot be written")]
    NotWritableTable(String, RegisterKind),
    #[error("cannot convert {1:?} to a number for tag `{0}`")]
    NotNumeric(String, String),
    #[error("{1} is not a finite number (tag `{0}`)")]
    NotFinite(String, f64),
    #[error("value {1} is below the minimum {2} of tag `{0}`")]
    BelowMinimum(String, f64, f64),
    #[error("value {1} is above the maximum {2} of tag `{0}`")]
    AboveMaximum(String, f64, f64),
    #[error("digital tag `{0}` requires 0 or 1, got {1}")]
    NotDigital(String, f64),
    #[error("tag `{0}` is stored as {2} and requires a whole number, got {1}")]
    NotWhole(String, f64, DataType),
    #[error("could not encode {1} for tag `{0}`")]
    Encode(String, f64, #[source] ValueError),
    #[error("tag `{0}` needs {1} registers to decode as {2}, the PLC returned {3}")]
    ShortResponse(String, usize, DataType, usize),
    #[error("the PLC sent an unexpected response for tag `{0}`")]
    UnexpectedResponse(String),
    #[error("could not access tag `{0}`")]
    Plc(String, #[source] plc::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownPlc(_) | Error::AddressOutOfRange(..) => ErrorKind::Configuration,
            Error::Plc(_, plc::Error::UnknownPlc(_)) => ErrorKind::Configuration,
            Error::EmptyPlcId
            | Error::EmptyTagName
            | Error::NothingRequested
            | Error::ReadOnly(_)
            | Error::NotWritableTable(..)
            | Error::NotNumeric(..)
            | Error::NotFinite(..)
            | Error::BelowMinimum(..)
            | Error::AboveMaximum(..)
            | Error::NotDigital(..)
            | Error::NotWhole(..) => ErrorKind::Validation,
            Error::UnknownTag(..) => ErrorKind::AddressResolution,
            Error::Encode(..) | Error::ShortResponse(..) | Error::UnexpectedResponse(_) => {
                ErrorKind::Encoding
            }
            Error::Plc(..) => ErrorKind::Connection,
        }
    }

    /// Full message including the chain of causes.
    pub fn describe(&self) -> String {
        let mut message = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(e) = cause {
            message.push_str(": ");
            message.push_str(&e.to_string());
            cause = e.source();
        }
        message
    }
}

/// A value to be written, as it arrives from the command line or a procedure file.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum Input {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Input {
    /// Interpret command line text: numbers as numbers, `true`/`false`/`on`/`off` as 1 and 0.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        if let Ok(n) = trimmed.parse::<f64>() {
            return Input::Number(n);
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "true" | "on" => Input::Bool(true),
            "false" | "off" => Input::Bool(false),
            _ => Input::Text(text.to_string()),
        }
    }

    pub fn to_number(&self) -> Option<f64> {
        match self {
            Input::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Input::Number(n) => Some(*n),
            Input::Text(t) => t.trim().parse().ok(),
        }
    }
}

impl std::fmt::Display for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Input::Bool(b) => b.fmt(f),
            Input::Number(n) => n.fmt(f),
            Input::Text(t) => t.fmt(f),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OverallStatus {
    Success,
    PartialSuccess,
    Failed,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct TagReadResult {
    pub tag_name: String,
    pub status: Status,
    pub data: Option<Value>,
    pub registers: Option<Vec<u16>>,
    pub error_type: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub timestamp: jiff::Timestamp,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct TagWriteResult {
    pub tag_name: String,
    pub status: Status,
    pub data: Input,
    /// The registers sent to the PLC.
    pub registers: Option<Vec<u16>>,
    pub error_type: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub timestamp: jiff::Timestamp,
}

pub trait TagResult {
    fn is_success(&self) -> bool;
}

impl TagResult for TagReadResult {
    fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

impl TagResult for TagWriteResult {
    fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct BulkResponse<R> {
    pub plc_id: String,
    pub total_requested: usize,
    pub successful_count: usize,
    pub failed_count: usize,
    pub results: Vec<R>,
    pub overall_status: OverallStatus,
    pub timestamp: jiff::Timestamp,
}

impl<R: TagResult> BulkResponse<R> {
    fn new(plc_id: &str, results: Vec<R>) -> Self {
        let successful_count = results.iter().filter(|r| r.is_success()).count();
        let failed_count = results.len() - successful_count;
        let overall_status = if failed_count == 0 {
            OverallStatus::Success
        } else if successful_count > 0 {
            OverallStatus::PartialSuccess
        } else {
            OverallStatus::Failed
        };
        Self {
            plc_id: plc_id.to_string(),
            total_requested: results.len(),
            successful_count,
            failed_count,
            results,
            overall_status,
            timestamp: jiff::Timestamp::now(),
        }
    }
}

/// Turn a 1-based data model address into the Modbus table and 0-based protocol address.
///
/// A table named in the register configuration takes precedence over the one implied by an
/// absolute address.
pub fn translate_address(
    scheme: AddressingScheme,
    address: u32,
    configured: Option<RegisterKind>,
) -> Option<(RegisterKind, u16)> {
    let (implied, pdu) = match scheme {
        AddressingScheme::Relative => (RegisterKind::HoldingRegister, address.checked_sub(1)?),
        AddressingScheme::Absolute => match address {
            40001..=49999 => (RegisterKind::HoldingRegister, address - 40001),
            30001..=39999 => (RegisterKind::InputRegister, address - 30001),
            10001..=19999 => (RegisterKind::DiscreteInput, address - 10001),
            1..=9999 => (RegisterKind::Coil, address - 1),
            _ => (RegisterKind::HoldingRegister, address),
        },
    };
    Some((configured.unwrap_or(implied), u16::try_from(pdu).ok()?))
}

/// Check a value against a register's configuration before it is encoded.
pub fn validate_write(tag: &str, register: &RegisterConfig, input: &Input) -> Result<f64, Error> {
    if register.readonly {
        return Err(Error::ReadOnly(tag.to_string()));
    }
    let number =
        input.to_number().ok_or_else(|| Error::NotNumeric(tag.to_string(), input.to_string()))?;
    if !number.is_finite() {
        return Err(Error::NotFinite(tag.to_string(), number));
    }
    if let Some(min) = register.min_value {
        if number < min {
            return Err(Error::BelowMinimum(tag.to_string(), number, min));
        }
    }
    if let Some(max) = register.max_value {
        if number > max {
            return Err(Error::AboveMaximum(tag.to_string(), number, max));
        }
    }
    if register.is_digital() && number != 0.0 && number != 1.0 {
        return Err(Error::NotDigital(tag.to_string(), number));
    }
    if register.stored_as.is_integer() && number.fract() != 0.0 {
        return Err(Error::NotWhole(tag.to_string(), number, register.stored_as));
    }
    Ok(number)
}

struct Resolved<'a> {
    plc: &'a PlcConfig,
    address: u32,
    register: &'a RegisterConfig,
    kind: RegisterKind,
    pdu: u16,
}

/// High level tag access on top of a [`ConnectionManager`].
#[derive(Clone)]
pub struct TagService {
    config: Arc<PlantConfig>,
    manager: Arc<ConnectionManager>,
}

impl TagService {
    pub fn new(config: Arc<PlantConfig>, manager: Arc<ConnectionManager>) -> Self {
        Self { config, manager }
    }

    pub fn config(&self) -> &PlantConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Close every PLC connection, unless another clone of this service still uses them.
    pub async fn shutdown(self) {
        if let Some(manager) = Arc::into_inner(self.manager) {
            manager.shutdown().await;
        }
    }

    fn resolve(&self, plc_id: &str, tag: &str) -> Result<Resolved<'_>, Error> {
        if plc_id.trim().is_empty() {
            return Err(Error::EmptyPlcId);
        }
        if tag.trim().is_empty() {
            return Err(Error::EmptyTagName);
        }
        let plc = self.config.plc(plc_id).map_err(|_| Error::UnknownPlc(plc_id.to_string()))?;
        let Some(address) = self.config.address_of(plc_id, tag) else {
            let names = self.config.tag_names(plc_id);
            let hint = match names.len() {
                0 => String::from(", which has no tags"),
                n if n <= 10 => format!(". Available tags: {}", names.join(", ")),
                n => format!(". Available tags: {} (and {} more)", names[..10].join(", "), n - 10),
            };
            return Err(Error::UnknownTag(plc_id.to_string(), tag.to_string(), hint));
        };
        let register = self
            .config
            .register(plc_id, address)
            .ok_or_else(|| Error::UnknownTag(plc_id.to_string(), tag.to_string(), String::new()))?;
        let (kind, pdu) = translate_address(plc.addressing_scheme, address, register.register_type)
            .ok_or_else(|| Error::AddressOutOfRange(tag.to_string(), address))?;
        debug!(message = "resolved tag", plc_id, tag, address, pdu, kind = %kind);
        Ok(Resolved { plc, address, register, kind, pdu })
    }

    async fn execute(
        &self,
        tag: &str,
        plc_id: &str,
        operation: Operation,
    ) -> Result<Response, Error> {
        self.manager.execute(plc_id, operation).await.map_err(|e| Error::Plc(tag.to_string(), e))
    }

    /// Read and decode a tag's current value, returning it with the raw registers.
    pub async fn read_value(&self, plc_id: &str, tag: &str) -> Result<(Value, Vec<u16>), Error> {
        let resolved = self.resolve(plc_id, tag)?;
        let count = resolved.register.stored_as.register_count();
        let operation = match resolved.kind {
            RegisterKind::HoldingRegister => {
                Operation::ReadHoldings { address: resolved.pdu, count }
            }
            RegisterKind::InputRegister => Operation::ReadInputs { address: resolved.pdu, count },
            RegisterKind::Coil => Operation::ReadCoils { address: resolved.pdu, count: 1 },
            RegisterKind::DiscreteInput => {
                Operation::ReadDiscreteInputs { address: resolved.pdu, count: 1 }
            }
        };
        let response = self.execute(tag, &resolved.plc.id, operation).await?;
        match response.kind {
            ResponseKind::Words { values, .. } => {
                let decode_as = resolved.register.decode_as();
                let value = decode_as.from_words(&values).ok_or_else(|| {
                    Error::ShortResponse(
                        tag.to_string(),
                        usize::from(decode_as.register_count()),
                        decode_as,
                        values.len(),
                    )
                })?;
                let registers = values.into_iter().take(usize::from(count)).collect();
                Ok((value, registers))
            }
            ResponseKind::Bits { values, .. } => {
                let bit =
                    *values.first().ok_or_else(|| Error::UnexpectedResponse(tag.to_string()))?;
                Ok((Value::U16(u16::from(bit)), vec![u16::from(bit)]))
            }
            _ => Err(Error::UnexpectedResponse(tag.to_string())),
        }
    }

    /// Validate, encode and write a value, returning the registers sent.
    pub async fn write_value(
        &self,
        plc_id: &str,
        tag: &str,
        input: &Input,
    ) -> Result<Vec<u16>, Error> {
        let resolved = self.resolve(plc_id, tag)?;
        if !resolved.kind.is_writable() {
            return Err(Error::NotWritableTable(tag.to_string(), resolved.kind));
        }
        if self.config.is_critical(&resolved.plc.id, resolved.address) {
            tracing::info!(
                message = "writing a critical tag",
                plc_id,
                tag,
                address = resolved.address
            );
        }
        let number = validate_write(tag, resolved.register, input)?;
        let (operation, registers) = match resolved.kind {
            RegisterKind::Coil => {
                if number != 0.0 && number != 1.0 {
                    return Err(Error::NotDigital(tag.to_string(), number));
                }
                let on = number == 1.0;
                (Operation::WriteCoil { address: resolved.pdu, value: on }, vec![u16::from(on)])
            }
            _ => {
                let value = resolved
                    .register
                    .encode_as()
                    .value_from_f64(number)
                    .map_err(|e| Error::Encode(tag.to_string(), number, e))?;
                let words = value.to_words();
                (Operation::WriteHoldings { address: resolved.pdu, values: words.clone() }, words)
            }
        };
        let response = self.execute(tag, &resolved.plc.id, operation).await?;
        match response.kind {
            ResponseKind::WriteCoil { .. } | ResponseKind::WriteHoldings { .. } => Ok(registers),
            _ => Err(Error::UnexpectedResponse(tag.to_string())),
        }
    }

    pub async fn read_tag(&self, plc_id: &str, tag: &str) -> TagReadResult {
        let timestamp = jiff::Timestamp::now();
        match self.read_value(plc_id, tag).await {
            Ok((value, registers)) => TagReadResult {
                tag_name: tag.to_string(),
                status: Status::Success,
                data: Some(value),
                registers: Some(registers),
                error_type: None,
                error_message: None,
                timestamp,
            },
            Err(e) => {
                debug!(
                    message = "read failed",
                    plc_id,
                    tag,
                    error = (&e as &dyn std::error::Error)
                );
                TagReadResult {
                    tag_name: tag.to_string(),
                    status: Status::Error,
                    data: None,
                    registers: None,
                    error_type: Some(e.kind()),
                    error_message: Some(e.describe()),
                    timestamp,
                }
            }
        }
    }

    pub async fn write_tag(&self, plc_id: &str, tag: &str, input: &Input) -> TagWriteResult {
        let timestamp = jiff::Timestamp::now();
        match self.write_value(plc_id, tag, input).await {
            Ok(registers) => TagWriteResult {
                tag_name: tag.to_string(),
                status: Status::Success,
                data: input.clone(),
                registers: Some(registers),
                error_type: None,
                error_message: None,
                timestamp,
            },
            Err(e) => {
                debug!(
                    message = "write failed",
                    plc_id,
                    tag,
                    error = (&e as &dyn std::error::Error)
                );
                TagWriteResult {
                    tag_name: tag.to_string(),
                    status: Status::Error,
                    data: input.clone(),
                    registers: None,
                    error_type: Some(e.kind()),
                    error_message: Some(e.describe()),
                    timestamp,
                }
            }
        }
    }

    fn check_bulk(&self, plc_id: &str, count: usize) -> Result<(), Error> {
        if plc_id.trim().is_empty() {
            return Err(Error::EmptyPlcId);
        }
        if count == 0 {
            return Err(Error::NothingRequested);
        }
        self.config.plc(plc_id).map_err(|_| Error::UnknownPlc(plc_id.to_string()))?;
        Ok(())
    }

    /// Read several tags concurrently. Blank tag names are dropped.
    pub async fn read_tags(
        &self,
        plc_id: &str,
        tags: &[String],
    ) -> Result<BulkResponse<TagReadResult>, Error> {
        let tags = tags.iter().filter(|t| !t.trim().is_empty()).collect::<Vec<_>>();
        self.check_bulk(plc_id, tags.len())?;
        let reads = tags.iter().map(|tag| self.read_tag(plc_id, tag));
        let results = futures::future::join_all(reads).await;
        let response = BulkResponse::new(plc_id, results);
        debug!(
            message = "bulk read complete",
            plc_id,
            requested = response.total_requested,
            failed = response.failed_count,
        );
        Ok(response)
    }

    /// Write several tags concurrently. Entries with blank tag names are dropped.
    pub async fn write_tags(
        &self,
        plc_id: &str,
        writes: &[(String, Input)],
    ) -> Result<BulkResponse<TagWriteResult>, Error> {
        let writes = writes.iter().filter(|(t, _)| !t.trim().is_empty()).collect::<Vec<_>>();
        self.check_bulk(plc_id, writes.len())?;
        let futures = writes.iter().map(|(tag, input)| self.write_tag(plc_id, tag, input));
        let results = futures::future::join_all(futures).await;
        let response = BulkResponse::new(plc_id, results);
        debug!(
            message = "bulk write complete",
            plc_id,
            requested = response.total_requested,
            failed = response.failed_count,
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::PointType;

    fn register(stored_as: DataType) -> RegisterConfig {
        RegisterConfig {
            name: "T".to_string(),
            register_type: None,
            stored_as,
            decode_as: None,
            encode_as: None,
            readonly: false,
            critical: false,
            min_value: None,
            max_value: None,
            tag_type: None,
            description: String::new(),
        }
    }

    #[test]
    fn absolute_addresses_imply_tables() {
        use AddressingScheme::Absolute;
        assert_eq!(translate_address(Absolute, 40001, None), Some((RegisterKind::HoldingRegister, 0)));
        assert_eq!(translate_address(Absolute, 49999, None), Some((RegisterKind::HoldingRegister, 9998)));
        assert_eq!(translate_address(Absolute, 30010, None), Some((RegisterKind::InputRegister, 9)));
        assert_eq!(translate_address(Absolute, 10001, None), Some((RegisterKind::DiscreteInput, 0)));
        assert_eq!(translate_address(Absolute, 1, None), Some((RegisterKind::Coil, 0)));
        assert_eq!(translate_address(Absolute, 20000, None), Some((RegisterKind::HoldingRegister, 20000)));
        assert_eq!(translate_address(Absolute, 0, None), Some((RegisterKind::HoldingRegister, 0)));
        assert_eq!(translate_address(Absolute, 70000, None), None);
        assert_eq!(
            translate_address(Absolute, 6447, Some(RegisterKind::HoldingRegister)),
            Some((RegisterKind::HoldingRegister, 6446))
        );
    }

    #[test]
    fn relative_addresses_are_one_based() {
        use AddressingScheme::Relative;
        assert_eq!(translate_address(Relative, 8789, None), Some((RegisterKind::HoldingRegister, 8788)));
        assert_eq!(translate_address(Relative, 60529, None), Some((RegisterKind::HoldingRegister, 60528)));
        assert_eq!(translate_address(Relative, 5, Some(RegisterKind::Coil)), Some((RegisterKind::Coil, 4)));
        assert_eq!(translate_address(Relative, 0, None), None);
    }

    #[test]
    fn write_validation() {
        let mut reg = register(DataType::Uint16);
        reg.min_value = Some(0.0);
        reg.max_value = Some(100.0);
        assert_eq!(validate_write("T", &reg, &Input::Number(42.0)).unwrap(), 42.0);
        assert!(matches!(validate_write("T", &reg, &Input::Number(101.0)), Err(Error::AboveMaximum(..))));
        assert!(matches!(validate_write("T", &reg, &Input::Number(-1.0)), Err(Error::BelowMinimum(..))));
        assert!(matches!(validate_write("T", &reg, &Input::Number(1.5)), Err(Error::NotWhole(..))));
        assert!(matches!(
            validate_write("T", &reg, &Input::Text("lots".into())),
            Err(Error::NotNumeric(..))
        ));
        assert!(matches!(validate_write("T", &reg, &Input::Number(f64::NAN)), Err(Error::NotFinite(..))));

        reg.readonly = true;
        let err = validate_write("T", &reg, &Input::Number(1.0)).unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut digital = register(DataType::Float32);
        digital.tag_type = Some(PointType::Digital);
        assert_eq!(validate_write("T", &digital, &Input::Bool(true)).unwrap(), 1.0);
        assert!(matches!(validate_write("T", &digital, &Input::Number(0.5)), Err(Error::NotDigital(..))));
        let analog = register(DataType::Float32);
        assert_eq!(validate_write("T", &analog, &Input::Number(0.5)).unwrap(), 0.5);
    }

    #[test]
    fn input_parsing() {
        assert_eq!(Input::parse("12.5"), Input::Number(12.5));
        assert_eq!(Input::parse(" ON "), Input::Bool(true));
        assert_eq!(Input::parse("false"), Input::Bool(false));
        assert_eq!(Input::parse("open"), Input::Text("open".to_string()));
        assert_eq!(Input::Text(" 3 ".into()).to_number(), Some(3.0));
        let yaml: Vec<Input> = serde_yaml::from_str("[1, true, '2.5', x]").unwrap();
        assert_eq!(
            yaml,
            vec![
                Input::Number(1.0),
                Input::Bool(true),
                Input::Text("2.5".into()),
                Input::Text("x".into())
            ]
        );
    }

    #[derive(Debug)]
    struct Outcome(bool);
    impl TagResult for Outcome {
        fn is_success(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn overall_status() {
        let all = BulkResponse::new("p", vec![Outcome(true), Outcome(true)]);
        assert_eq!(all.overall_status, OverallStatus::Success);
        let some = BulkResponse::new("p", vec![Outcome(true), Outcome(false)]);
        assert_eq!(some.overall_status, OverallStatus::PartialSuccess);
        assert_eq!((some.successful_count, some.failed_count), (1, 1));
        let none = BulkResponse::new("p", vec![Outcome(false)]);
        assert_eq!(none.overall_status, OverallStatus::Failed);
    }

    #[test]
    fn error_kinds() {
        assert_eq!(Error::UnknownPlc("p".into()).kind(), ErrorKind::Configuration);
        assert_eq!(
            Error::UnknownTag("p".into(), "t".into(), String::new()).kind(),
            ErrorKind::AddressResolution
        );
        assert_eq!(Error::UnexpectedResponse("t".into()).kind(), ErrorKind::Encoding);
        assert_eq!(
            Error::Plc("t".into(), plc::Error::CircuitOpen("p".into())).kind(),
            ErrorKind::Connection
        );
    }
}
