//! The configuration, procedure and tag table files shipped with the repository.
use std::path::PathBuf;

use plant_control_tools::config::{AddressingScheme, PlantConfig};
use plant_control_tools::integrity::{self, FindingKind, Severity};
use plant_control_tools::procedure::ProcedureSet;
use plant_control_tools::simulator::RegisterBank;
use plant_control_tools::table::TagTable;
use plant_control_tools::tags::{DataType, Value};

fn path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(name)
}

#[test]
fn plant_configuration_loads() {
    let config = PlantConfig::from_path(&path("plant.yaml")).unwrap();
    let reactor = config.plc("reactor04").unwrap();
    assert_eq!(reactor.addressing_scheme, AddressingScheme::Relative);
    assert_eq!(reactor.socket_address(), "127.0.0.1:5020");
    assert!(config.address_of("reactor04", "PT_R4").is_some());

    let boiler = config.plc("boiler01").unwrap();
    assert_eq!(boiler.unit_id, 3);
    assert_eq!(boiler.retries, 3);
    let setpoint = config.address_of("boiler01", "BOILER_SETPOINT").unwrap();
    assert!(config.is_critical("boiler01", setpoint));
    assert!(config.is_readonly("boiler01", 40001));
    let flue = config.register("boiler01", 30001).unwrap();
    assert_eq!(flue.stored_as, DataType::Float32);
    assert_eq!(config.register("boiler01", 1).unwrap().register_type, None);
    assert_eq!(config.tag_names("boiler01").len(), 6);
}

#[test]
fn procedures_load_against_the_plant() {
    let config = PlantConfig::from_path(&path("plant.yaml")).unwrap();
    let set = ProcedureSet::from_path(&path("procedures.yaml"), &config).unwrap();
    assert_eq!(set.names().collect::<Vec<_>>(), ["heat_up", "read_sensors"]);
    assert_eq!(set.get("heat_up").unwrap().steps.len(), 8);
}

#[test]
fn sample_table_is_consistent() {
    let table = TagTable::from_path(&path("tables/reactor04.md")).unwrap();
    assert_eq!(table.valve_groups().len(), 2);
    assert!(table.valve_groups().iter().all(|g| g.missing().is_empty()));
    assert_eq!(table.vfd_groups().len(), 1);
    assert_eq!(table.sensors().count(), 5);

    let report = integrity::check(&table);
    assert_eq!(report.reference_offset, Some(1));
    assert!(!report.has_errors(), "{:?}", report.findings);
    assert_eq!(report.count(Severity::Warning), 3);
    assert!(report.findings.iter().all(|f| f.kind == FindingKind::MissingStateLabels));
}

#[test]
fn simulator_seeds_the_sample_table() {
    let table = TagTable::from_path(&path("tables/reactor04.md")).unwrap();
    let mut bank = RegisterBank::from_table(&table);
    let pressure = table.find("PT_RX04").unwrap();
    assert_eq!(
        bank.read_value(pressure.address as u16, DataType::Float32),
        Some(Value::F32(1.2))
    );

    let start = table.find("XV_HWS_RX04_STR").unwrap();
    let open = table.find("XV_HWS_RX04_OPEN_FB").unwrap();
    let close = table.find("XV_HWS_RX04_CLOSE_FB").unwrap();
    assert_eq!(bank.read_value(close.address as u16, DataType::Float32), Some(Value::F32(1.0)));
    let words = Value::F32(1.0).to_words();
    let operation = plant_control_tools::modbus::Operation::WriteHoldings {
        address: start.address as u16,
        values: words,
    };
    bank.apply(&operation).unwrap();
    assert_eq!(bank.read_value(open.address as u16, DataType::Float32), Some(Value::F32(1.0)));
    assert_eq!(bank.read_value(close.address as u16, DataType::Float32), Some(Value::F32(0.0)));
}
