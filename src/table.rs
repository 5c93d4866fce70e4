//! Tag tables in the reactor reference document's layout.
//!
//! The document is markdown: prose runbook notes interleaved with bullet lists of
//! comma-separated tag rows such as
//!
//! ```text
//! - 0x1966, 6502, XV_HWS_RX04_STR, Signal Tag, 12, float 32, , , , Digital, STOP, START, 0
//! ```
//!
//! The columns are: hexadecimal address, decimal register, tag name, class, index, declared
//! type, engineering unit, range low, range high, point type, off label, on label and source.
//! Only the first six are required.
use std::path::{Path, PathBuf};

use crate::tags::{DataType, PointType, TagIndex};

pub const VALVE_SUFFIXES: [&str; 9] =
    ["STR", "RST", "STR_AM", "OPEN_FB", "CLOSE_FB", "STR_ON", "STR_CMD", "STS", "AM"];

pub const VFD_SUFFIXES: [&str; 8] = ["SP", "AM", "AUTO", "STR", "RST", "FB", "AMP", "REF"];

pub const SENSOR_PREFIXES: [&str; 5] = ["PT", "TT", "TE", "LT", "FT"];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the tag table at {1:?}")]
    ReadFile(#[source] std::io::Error, PathBuf),
    #[error("line {0}: could not split the row into fields")]
    SplitRow(usize, #[source] csv::Error),
    #[error("line {0}: the row has {1} fields but at least 6 are required")]
    TooFewFields(usize, usize),
    #[error("line {0}: {1:?} is not a valid {2}")]
    InvalidField(usize, String, &'static str),
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum TagClass {
    Variable,
    #[strum(serialize = "Signal Tag")]
    #[serde(rename = "Signal Tag")]
    SignalTag,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct TagRecord {
    /// 1-based line in the source text.
    pub line: usize,
    pub address: u32,
    pub register: u32,
    pub name: String,
    pub class: TagClass,
    pub index: u32,
    pub data_type: DataType,
    pub unit: Option<String>,
    pub range_low: Option<f64>,
    pub range_high: Option<f64>,
    pub point_type: PointType,
    pub off_label: Option<String>,
    pub on_label: Option<String>,
    pub source: Option<String>,
}

impl TagRecord {
    pub fn is_match(&self, pattern: &str) -> bool {
        let pattern = pattern.to_uppercase();
        if self.name.to_uppercase().contains(&pattern) {
            return true;
        }
        if let Some(source) = &self.source {
            if source.to_uppercase().contains(&pattern) {
                return true;
            }
        }
        if self.register.to_string().contains(&pattern) {
            return true;
        }
        if format!("0X{:X}", self.address).contains(&pattern) {
            return true;
        }
        return false;
    }

    /// The source column parsed as a number, when it holds a default value rather than a
    /// reference to an upstream block.
    pub fn default_value(&self) -> Option<f64> {
        self.source.as_deref()?.parse().ok()
    }

    fn parse(line: usize, record: &csv::StringRecord) -> Result<Self, Error> {
        if record.len() < 6 {
            return Err(Error::TooFewFields(line, record.len()));
        }
        let field = |i: usize| record.get(i).filter(|v| !v.is_empty());
        let invalid = |i: usize, what| Error::InvalidField(line, record[i].to_string(), what);
        let hex = record[0].trim_start_matches("0x").trim_start_matches("0X");
        let number = |i: usize| -> Result<Option<f64>, Error> {
            field(i).map(|v| v.parse::<f64>().map_err(|_| invalid(i, "number"))).transpose()
        };
        Ok(TagRecord {
            line,
            address: u32::from_str_radix(hex, 16).map_err(|_| invalid(0, "hexadecimal address"))?,
            register: record[1].parse().map_err(|_| invalid(1, "register number"))?,
            name: field(2).ok_or_else(|| invalid(2, "tag name"))?.to_string(),
            class: record[3].parse().map_err(|_| invalid(3, "tag class"))?,
            index: record[4].parse().map_err(|_| invalid(4, "index"))?,
            data_type: record[5].parse().map_err(|_| invalid(5, "data type"))?,
            unit: field(6).map(String::from),
            range_low: number(7)?,
            range_high: number(8)?,
            point_type: field(9)
                .map(|v| v.parse().map_err(|_| invalid(9, "point type")))
                .transpose()?
                .unwrap_or_default(),
            off_label: field(10).map(String::from),
            on_label: field(11).map(String::from),
            source: field(12).map(String::from),
        })
    }
}

/// Tags sharing a base name, keyed by their suffix.
#[derive(Debug)]
pub struct TagGroup<'a> {
    pub name: String,
    pub members: Vec<(&'static str, &'a TagRecord)>,
    expected: &'static [&'static str],
}

impl<'a> TagGroup<'a> {
    pub fn member(&self, suffix: &str) -> Option<&'a TagRecord> {
        self.members.iter().find(|(s, _)| *s == suffix).map(|(_, r)| *r)
    }

    /// Expected suffixes without a member in this group.
    pub fn missing(&self) -> Vec<&'static str> {
        self.expected.iter().copied().filter(|s| self.member(s).is_none()).collect()
    }
}

/// Split `name` into its base and the longest matching suffix from `suffixes`.
pub fn split_suffix<'n>(
    name: &'n str,
    suffixes: &[&'static str],
) -> Option<(&'n str, &'static str)> {
    suffixes
        .iter()
        .filter_map(|suffix| {
            let base = name.strip_suffix(suffix)?.strip_suffix('_')?;
            (!base.is_empty()).then_some((base, *suffix))
        })
        .max_by_key(|(_, suffix)| suffix.len())
}

#[derive(Clone, Debug, Default)]
pub struct TagTable {
    records: Vec<TagRecord>,
}

impl TagTable {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut records = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line_number = number + 1;
            let line = line.trim();
            let line = line
                .strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .unwrap_or(line)
                .trim_start();
            let first = line.split(',').next().unwrap_or("").trim();
            if !(first.starts_with("0x") || first.starts_with("0X")) {
                continue;
            }
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .trim(csv::Trim::All)
                .from_reader(line.as_bytes());
            let mut row = csv::StringRecord::new();
            reader.read_record(&mut row).map_err(|e| Error::SplitRow(line_number, e))?;
            records.push(TagRecord::parse(line_number, &row)?);
        }
        tracing::debug!(message = "parsed tag table", records = records.len());
        Ok(Self { records })
    }

    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let text =
            std::fs::read_to_string(path).map_err(|e| Error::ReadFile(e, path.to_path_buf()))?;
        Self::parse(&text)
    }

    /// The compiled-in Reactor 04 catalog as table records.
    ///
    /// Hexadecimal addresses are protocol addresses, one below the register number.
    pub fn builtin() -> Self {
        let records = TagIndex::all()
            .enumerate()
            .map(|(position, tag)| {
                let digital = tag.point_type() == PointType::Digital;
                TagRecord {
                    line: position + 1,
                    address: u32::from(tag.address()) - 1,
                    register: u32::from(tag.address()),
                    name: tag.name().to_string(),
                    class: if tag.mode().is_writable() {
                        TagClass::Variable
                    } else {
                        TagClass::SignalTag
                    },
                    index: position as u32 + 1,
                    data_type: tag.data_type(),
                    unit: tag.unit().map(String::from),
                    range_low: None,
                    range_high: None,
                    point_type: tag.point_type(),
                    off_label: digital.then(|| "OFF".to_string()),
                    on_label: digital.then(|| "ON".to_string()),
                    source: None,
                }
            })
            .collect();
        Self { records }
    }

    pub fn records(&self) -> &[TagRecord] {
        &self.records
    }

    pub fn find(&self, name: &str) -> Option<&TagRecord> {
        self.records.iter().find(|r| r.name.eq_ignore_ascii_case(name))
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn groups<'a>(
        &'a self,
        suffixes: &'static [&'static str],
        belongs: impl Fn(&str) -> bool,
    ) -> Vec<TagGroup<'a>> {
        let mut groups: Vec<TagGroup<'a>> = Vec::new();
        for record in &self.records {
            if !belongs(&record.name) {
                continue;
            }
            let Some((base, suffix)) = split_suffix(&record.name, suffixes) else {
                continue;
            };
            match groups.iter_mut().find(|g| g.name == base) {
                Some(group) => group.members.push((suffix, record)),
                None => groups.push(TagGroup {
                    name: base.to_string(),
                    members: vec![(suffix, record)],
                    expected: suffixes,
                }),
            }
        }
        groups
    }

    /// Valve groups: `XV_` tags ending in one of the nine valve suffixes.
    pub fn valve_groups(&self) -> Vec<TagGroup<'_>> {
        self.groups(&VALVE_SUFFIXES, |name| name.starts_with("XV_"))
    }

    /// Drive groups: tags with a `VFD` name segment ending in one of the drive suffixes.
    pub fn vfd_groups(&self) -> Vec<TagGroup<'_>> {
        self.groups(&VFD_SUFFIXES, |name| name.split('_').any(|part| part == "VFD"))
    }

    pub fn sensors(&self) -> impl Iterator<Item = &TagRecord> {
        self.records.iter().filter(|r| {
            r.point_type == PointType::Analog
                && SENSOR_PREFIXES.iter().any(|p| {
                    r.name
                        .strip_prefix(p)
                        .is_some_and(|rest| rest.is_empty() || rest.starts_with('_'))
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = "\
# Reactor 04

Heating: open HWS and HWR before starting the agitator.

- 0x1966, 6502, XV_HWS_RX04_STR, Signal Tag, 12, float 32, , , , Digital, STOP, START, 0
- 0x1968, 6504, XV_HWS_RX04_STR_AM, Variable, 13, float 32, , , , Digital, MAN, AUTO, 1
* 0x196A, 6506, XV_HWS_RX04_AM, Variable, 14, float 32, , , , Digital, MAN, AUTO, B12.AM
0x2255, 8789, PT_RX04, Signal Tag, 40, float 32, bar, 0, 10, Analog, , , AI_04.OUT
- 0x1A00, 6656, AG_VFD_RX04_SP, Variable, 50, float 32, %, 0, 100, Analog, , , 40
";

    #[test]
    fn parses_rows_and_skips_prose() {
        let table = TagTable::parse(DOCUMENT).unwrap();
        assert_eq!(table.records().len(), 5);
        let first = &table.records()[0];
        assert_eq!(first.line, 5);
        assert_eq!(first.address, 0x1966);
        assert_eq!(first.register, 6502);
        assert_eq!(first.class, TagClass::SignalTag);
        assert_eq!(first.data_type, DataType::Float32);
        assert_eq!(first.point_type, PointType::Digital);
        assert_eq!(first.on_label.as_deref(), Some("START"));
        assert_eq!(first.default_value(), Some(0.0));
        let pt = table.find("pt_rx04").unwrap();
        assert_eq!(pt.unit.as_deref(), Some("bar"));
        assert_eq!(pt.range_high, Some(10.0));
        assert_eq!(pt.default_value(), None);
    }

    #[test]
    fn reports_line_of_bad_row() {
        let err = TagTable::parse("text\n\n- 0x10, 16, X, Nonsense, 1, float 32\n").unwrap_err();
        assert!(matches!(err, Error::InvalidField(3, _, "tag class")), "{err:?}");
        let err = TagTable::parse("- 0x10, 16, X\n").unwrap_err();
        assert!(matches!(err, Error::TooFewFields(1, 3)), "{err:?}");
        let err = TagTable::parse("- 0xZZ, 16, X, Variable, 1, float 32\n").unwrap_err();
        assert!(matches!(err, Error::InvalidField(1, _, "hexadecimal address")), "{err:?}");
    }

    #[test]
    fn suffix_prefers_longest_match() {
        assert_eq!(split_suffix("XV_A_STR_AM", &VALVE_SUFFIXES), Some(("XV_A", "STR_AM")));
        assert_eq!(split_suffix("XV_A_AM", &VALVE_SUFFIXES), Some(("XV_A", "AM")));
        assert_eq!(split_suffix("XV_A_STR_CMD", &VALVE_SUFFIXES), Some(("XV_A", "STR_CMD")));
        assert_eq!(split_suffix("XV_A_OPEN", &VALVE_SUFFIXES), None);
        assert_eq!(split_suffix("_AM", &VALVE_SUFFIXES), None);
    }

    #[test]
    fn groups_and_sensors() {
        let table = TagTable::parse(DOCUMENT).unwrap();
        let valves = table.valve_groups();
        assert_eq!(valves.len(), 1);
        assert_eq!(valves[0].name, "XV_HWS_RX04");
        assert_eq!(valves[0].members.len(), 3);
        assert_eq!(valves[0].missing(), vec!["RST", "OPEN_FB", "CLOSE_FB", "STR_ON", "STR_CMD", "STS"]);
        let drives = table.vfd_groups();
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].member("SP").map(|r| r.register), Some(6656));
        let sensors = table.sensors().map(|r| r.name.as_str()).collect::<Vec<_>>();
        assert_eq!(sensors, vec!["PT_RX04"]);
    }

    #[test]
    fn builtin_matches_catalog() {
        let table = TagTable::builtin();
        assert_eq!(table.records().len(), TagIndex::all().count());
        let pt = table.find("PT_R4").unwrap();
        assert_eq!(pt.register, 8789);
        assert_eq!(pt.address, 8788);
        assert_eq!(pt.class, TagClass::SignalTag);
        assert!(table.find("AG_SWITCH_ON_R4").unwrap().is_match("ag_switch"));
        assert!(table.sensors().any(|r| r.name == "TE_MASS_UPPER_R4"));
    }
}
