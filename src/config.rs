//! Plant configuration: which PLCs exist, how to reach them and what their registers hold.
//!
//! ```yaml
//! plcs:
//!   reactor04:
//!     host: 10.0.4.20
//!     addressing_scheme: relative
//! registers:
//!   reactor04:
//!     8789: { name: PT_R4, stored_as: float32, readonly: true, tag_type: analog }
//! ```
//!
//! A PLC without an entry under `registers` gets the built-in Reactor 04 catalog.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tags::{DataType, PointType, RegisterKind, TagIndex};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the plant configuration at {1:?}")]
    ReadFile(#[source] std::io::Error, PathBuf),
    #[error("could not parse the plant configuration")]
    Parse(#[source] serde_yaml::Error),
    #[error("a PLC has an empty identifier")]
    EmptyPlcId,
    #[error("PLC `{0}` has no host")]
    EmptyHost(String),
    #[error("PLC `{0}` has port 0")]
    ZeroPort(String),
    #[error("PLC `{0}` has a circuit breaker threshold of 0")]
    ZeroBreakerThreshold(String),
    #[error("PLC `{0}` has an invalid timeout of {1}s")]
    BadTimeout(String, f64),
    #[error("registers are configured for `{0}`, which is not a configured PLC")]
    RegistersWithoutPlc(String),
    #[error("tag `{1}` is configured more than once for PLC `{0}`")]
    DuplicateTagName(String, String),
    #[error("register {1} of PLC `{0}` has no name")]
    UnnamedRegister(String, u32),
    #[error("tag `{1}` of PLC `{0}` has min_value {2} above max_value {3}")]
    InvalidRange(String, String, f64, f64),
    #[error("no PLC `{0}` is configured")]
    UnknownPlc(String),
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AddressingScheme {
    /// Data model addresses encode the table: 40001 and up are holding registers, etc.
    #[default]
    Absolute,
    /// Every address is a 1-based offset into the configured register table.
    Relative,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlcConfig {
    #[serde(skip)]
    pub id: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    /// Seconds.
    pub timeout: f64,
    pub retries: u32,
    pub description: String,
    pub vendor: String,
    pub model: String,
    pub addressing_scheme: AddressingScheme,
    pub max_concurrent_connections: usize,
    /// Seconds.
    pub health_check_interval: u64,
    pub circuit_breaker_threshold: u32,
    /// Seconds.
    pub circuit_breaker_timeout: u64,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            host: String::new(),
            port: 502,
            unit_id: 1,
            timeout: 3.0,
            retries: 3,
            description: String::new(),
            vendor: "generic".to_string(),
            model: String::new(),
            addressing_scheme: AddressingScheme::Absolute,
            max_concurrent_connections: 5,
            health_check_interval: 30,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: 60,
        }
    }
}

impl PlcConfig {
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Falls back to the default timeout if the configured one is not a valid duration.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout)
            .unwrap_or_else(|_| Duration::from_secs_f64(PlcConfig::default().timeout))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_timeout)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.id.trim().is_empty() {
            return Err(Error::EmptyPlcId);
        }
        if self.host.trim().is_empty() {
            return Err(Error::EmptyHost(self.id.clone()));
        }
        if self.port == 0 {
            return Err(Error::ZeroPort(self.id.clone()));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(Error::ZeroBreakerThreshold(self.id.clone()));
        }
        if !(self.timeout > 0.0 && Duration::try_from_secs_f64(self.timeout).is_ok()) {
            return Err(Error::BadTimeout(self.id.clone(), self.timeout));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterConfig {
    pub name: String,
    /// When absent, absolute addressing infers the table from the address and relative
    /// addressing uses holding registers.
    #[serde(default)]
    pub register_type: Option<RegisterKind>,
    #[serde(default = "default_stored_as")]
    pub stored_as: DataType,
    /// Defaults to `stored_as`.
    #[serde(default)]
    pub decode_as: Option<DataType>,
    /// Defaults to `stored_as`.
    #[serde(default)]
    pub encode_as: Option<DataType>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default)]
    pub tag_type: Option<PointType>,
    #[serde(default)]
    pub description: String,
}

fn default_stored_as() -> DataType {
    DataType::Uint16
}

impl RegisterConfig {
    pub fn decode_as(&self) -> DataType {
        self.decode_as.unwrap_or(self.stored_as)
    }

    pub fn encode_as(&self) -> DataType {
        self.encode_as.unwrap_or(self.stored_as)
    }

    pub fn is_digital(&self) -> bool {
        self.tag_type == Some(PointType::Digital)
    }

    fn from_catalog(tag: TagIndex) -> Self {
        Self {
            name: tag.name().to_string(),
            register_type: Some(RegisterKind::HoldingRegister),
            stored_as: tag.data_type(),
            decode_as: None,
            encode_as: None,
            readonly: !tag.mode().is_writable(),
            critical: false,
            min_value: None,
            max_value: None,
            tag_type: Some(tag.point_type()),
            description: tag.description().to_string(),
        }
    }
}

/// Register map of one PLC, keyed by data model address.
pub type RegisterMap = BTreeMap<u32, RegisterConfig>;

pub fn builtin_register_map() -> RegisterMap {
    TagIndex::all()
        .map(|tag| (u32::from(tag.address()), RegisterConfig::from_catalog(tag)))
        .collect()
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlantConfig {
    #[serde(default)]
    plcs: BTreeMap<String, PlcConfig>,
    #[serde(default)]
    registers: BTreeMap<String, RegisterMap>,
}

impl PlantConfig {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let config: PlantConfig = serde_yaml::from_str(text).map_err(Error::Parse)?;
        config.finish()
    }

    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let text =
            std::fs::read_to_string(path).map_err(|e| Error::ReadFile(e, path.to_path_buf()))?;
        let config = Self::parse(&text)?;
        tracing::debug!(
            message = "loaded plant configuration",
            path = ?path,
            plcs = config.plcs.len()
        );
        Ok(config)
    }

    /// Configuration for PLCs added programmatically, each with the built-in catalog.
    pub fn from_plcs(plcs: impl IntoIterator<Item = (String, PlcConfig)>) -> Result<Self, Error> {
        let config = Self { plcs: plcs.into_iter().collect(), registers: BTreeMap::new() };
        config.finish()
    }

    fn finish(mut self) -> Result<Self, Error> {
        for (id, plc) in self.plcs.iter_mut() {
            plc.id = id.clone();
            plc.validate()?;
        }
        for (id, registers) in &self.registers {
            if !self.plcs.contains_key(id) {
                return Err(Error::RegistersWithoutPlc(id.clone()));
            }
            let mut names = std::collections::BTreeSet::new();
            for (address, register) in registers {
                if register.name.trim().is_empty() {
                    return Err(Error::UnnamedRegister(id.clone(), *address));
                }
                if !names.insert(register.name.as_str()) {
                    return Err(Error::DuplicateTagName(id.clone(), register.name.clone()));
                }
                if let (Some(min), Some(max)) = (register.min_value, register.max_value) {
                    if min > max {
                        let name = register.name.clone();
                        return Err(Error::InvalidRange(id.clone(), name, min, max));
                    }
                }
            }
        }
        for id in self.plcs.keys() {
            if !self.registers.contains_key(id) {
                tracing::debug!(message = "using the built-in catalog", plc_id = %id);
                self.registers.insert(id.clone(), builtin_register_map());
            }
        }
        Ok(self)
    }

    pub fn plcs(&self) -> impl Iterator<Item = &PlcConfig> {
        self.plcs.values()
    }

    pub fn plc(&self, plc_id: &str) -> Result<&PlcConfig, Error> {
        self.plcs.get(plc_id).ok_or_else(|| Error::UnknownPlc(plc_id.to_string()))
    }

    pub fn registers(&self, plc_id: &str) -> Option<&RegisterMap> {
        self.registers.get(plc_id)
    }

    pub fn register(&self, plc_id: &str, address: u32) -> Option<&RegisterConfig> {
        self.registers.get(plc_id)?.get(&address)
    }

    pub fn address_of(&self, plc_id: &str, tag: &str) -> Option<u32> {
        self.registers
            .get(plc_id)?
            .iter()
            .find(|(_, register)| register.name == tag)
            .map(|(address, _)| *address)
    }

    /// Registers missing from the configuration are treated as writable.
    pub fn is_readonly(&self, plc_id: &str, address: u32) -> bool {
        self.register(plc_id, address).is_some_and(|r| r.readonly)
    }

    pub fn is_critical(&self, plc_id: &str, address: u32) -> bool {
        self.register(plc_id, address).is_some_and(|r| r.critical)
    }

    /// Sorted tag names configured for a PLC.
    pub fn tag_names(&self, plc_id: &str) -> Vec<&str> {
        let mut names = self
            .registers
            .get(plc_id)
            .map(|r| r.values().map(|r| r.name.as_str()).collect::<Vec<_>>())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "config::Args")]
pub struct Args {
    /// Plant configuration file listing the PLCs and their registers.
    #[arg(long, short = 'c', default_value = "plant.yaml")]
    pub config: PathBuf,
}

impl Args {
    pub fn load(&self) -> Result<PlantConfig, Error> {
        PlantConfig::from_path(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
plcs:
  reactor04:
    host: 10.0.4.20
    addressing_scheme: relative
    timeout: 1.5
  utilities:
    host: 10.0.9.2
    port: 5020
registers:
  utilities:
    40001: { name: CHW_SUPPLY_TEMP, stored_as: float32, readonly: true, tag_type: analog }
    40010:
      name: CHW_PUMP_SP
      stored_as: uint16
      min_value: 0
      max_value: 100
      critical: true
"#;

    #[test]
    fn loads_with_defaults() {
        let config = PlantConfig::parse(CONFIG).unwrap();
        let reactor = config.plc("reactor04").unwrap();
        assert_eq!(reactor.id, "reactor04");
        assert_eq!(reactor.port, 502);
        assert_eq!(reactor.unit_id, 1);
        assert_eq!(reactor.retries, 3);
        assert_eq!(reactor.addressing_scheme, AddressingScheme::Relative);
        assert_eq!(reactor.timeout(), Duration::from_millis(1500));
        assert_eq!(reactor.circuit_breaker_timeout(), Duration::from_secs(60));
        let utilities = config.plc("utilities").unwrap();
        assert_eq!(utilities.socket_address(), "10.0.9.2:5020");
        assert_eq!(utilities.addressing_scheme, AddressingScheme::Absolute);
        assert!(matches!(config.plc("nope"), Err(Error::UnknownPlc(_))));
    }

    #[test]
    fn register_lookups() {
        let config = PlantConfig::parse(CONFIG).unwrap();
        assert_eq!(config.address_of("utilities", "CHW_PUMP_SP"), Some(40010));
        assert!(config.is_readonly("utilities", 40001));
        assert!(!config.is_readonly("utilities", 40010));
        assert!(config.is_critical("utilities", 40010));
        assert!(!config.is_critical("utilities", 49999));
        let temp = config.register("utilities", 40001).unwrap();
        assert_eq!(temp.decode_as(), DataType::Float32);
        assert_eq!(temp.encode_as(), DataType::Float32);
        assert_eq!(config.tag_names("utilities"), vec!["CHW_PUMP_SP", "CHW_SUPPLY_TEMP"]);
    }

    #[test]
    fn falls_back_to_catalog() {
        let config = PlantConfig::parse(CONFIG).unwrap();
        assert_eq!(config.address_of("reactor04", "PT_R4"), Some(8789));
        assert!(config.is_readonly("reactor04", 8789));
        let agitator = config.register("reactor04", 60529).unwrap();
        assert_eq!(agitator.stored_as, DataType::Float32);
        assert!(agitator.is_digital());
        assert!(!agitator.readonly);
    }

    #[test]
    fn rejects_invalid_configurations() {
        let bad_range = r#"
plcs: { a: { host: h } }
registers: { a: { 1: { name: X, min_value: 5, max_value: 1 } } }
"#;
        assert!(matches!(PlantConfig::parse(bad_range), Err(Error::InvalidRange(..))));
        let duplicate = r#"
plcs: { a: { host: h } }
registers: { a: { 1: { name: X }, 2: { name: X } } }
"#;
        assert!(matches!(PlantConfig::parse(duplicate), Err(Error::DuplicateTagName(..))));
        let orphan = "plcs: { a: { host: h } }\nregisters: { b: { 1: { name: X } } }\n";
        assert!(matches!(PlantConfig::parse(orphan), Err(Error::RegistersWithoutPlc(_))));
        assert!(matches!(
            PlantConfig::parse("plcs: { a: { host: h, port: 0 } }"),
            Err(Error::ZeroPort(_))
        ));
        assert!(matches!(PlantConfig::parse("plcs: { a: { port: 1 } }"), Err(Error::EmptyHost(_))));
        assert!(matches!(PlantConfig::parse("plcs: { '': { host: h } }"), Err(Error::EmptyPlcId)));
        assert!(matches!(
            PlantConfig::parse("plcs: { a: { host: h, colour: red } }"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn rejects_timeouts_too_large_for_a_duration() {
        for timeout in ["1e30", ".inf", "-1", "0"] {
            let text = format!("plcs: {{ a: {{ host: h, timeout: {timeout} }} }}");
            assert!(
                matches!(PlantConfig::parse(&text), Err(Error::BadTimeout(..))),
                "timeout {timeout}"
            );
        }
        let plc = PlcConfig { timeout: 1e30, ..PlcConfig::default() };
        assert_eq!(plc.timeout(), Duration::from_secs(3));
    }

    #[test]
    fn large_retry_counts_load() {
        let config = PlantConfig::parse("plcs: { a: { host: h, retries: 4294967295 } }").unwrap();
        assert_eq!(config.plc("a").unwrap().retries, u32::MAX);
    }

    #[test]
    fn reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, CONFIG.as_bytes()).unwrap();
        let config = PlantConfig::from_path(file.path()).unwrap();
        assert_eq!(config.plcs().count(), 2);
        let missing = PlantConfig::from_path(Path::new("/nonexistent/plant.yaml"));
        assert!(matches!(missing, Err(Error::ReadFile(..))));
    }
}
