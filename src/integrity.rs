//! Consistency checks over a tag table.
use std::collections::BTreeMap;

use crate::table::TagTable;
use crate::tags::PointType;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FindingKind {
    /// The register column disagrees with the address column under the table's usual offset.
    OffsetMismatch { address: u32, register: u32, expected: i64 },
    DuplicateName { lines: Vec<usize> },
    MissingValveSuffix { group: String, suffix: &'static str },
    MissingStateLabels,
}

impl std::fmt::Display for FindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FindingKind::OffsetMismatch { address, register, expected } => f.write_fmt(
                format_args!("0x{address:X} maps to register {register}, expected {expected}"),
            ),
            FindingKind::DuplicateName { lines } => {
                let lines = lines.iter().map(|l| l.to_string()).collect::<Vec<_>>();
                f.write_fmt(format_args!("name is used on lines {}", lines.join(", ")))
            }
            FindingKind::MissingValveSuffix { group, suffix } => {
                f.write_fmt(format_args!("valve {group} has no {group}_{suffix} tag"))
            }
            FindingKind::MissingStateLabels => {
                f.write_str("digital point lacks an on or off state label")
            }
        }
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub line: Option<usize>,
    pub tag: String,
    #[serde(flatten)]
    pub kind: FindingKind,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct Report {
    /// Most common `register - address` difference in the table.
    pub reference_offset: Option<i64>,
    pub findings: Vec<Finding>,
}

impl Report {
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }
}

pub fn check(table: &TagTable) -> Report {
    let mut report = Report::default();
    report.reference_offset = reference_offset(table);
    check_offsets(table, &mut report);
    check_unique_names(table, &mut report);
    check_valve_groups(table, &mut report);
    check_state_labels(table, &mut report);
    report.findings.sort_by_key(|f| f.line);
    tracing::debug!(
        message = "checked tag table",
        errors = report.count(Severity::Error),
        warnings = report.count(Severity::Warning),
    );
    report
}

fn offset_of(address: u32, register: u32) -> i64 {
    i64::from(register) - i64::from(address)
}

/// The offset shared by most rows. Ties go to whichever offset appears first.
fn reference_offset(table: &TagTable) -> Option<i64> {
    let mut counts = BTreeMap::<i64, (usize, usize)>::new();
    for (position, record) in table.records().iter().enumerate() {
        let offset = offset_of(record.address, record.register);
        let entry = counts.entry(offset).or_insert((0, position));
        entry.0 += 1;
    }
    counts
        .into_iter()
        .max_by(|(_, (ca, fa)), (_, (cb, fb))| ca.cmp(cb).then(fb.cmp(fa)))
        .map(|(offset, _)| offset)
}

fn check_offsets(table: &TagTable, report: &mut Report) {
    let Some(reference) = report.reference_offset else {
        return;
    };
    for record in table.records() {
        if offset_of(record.address, record.register) != reference {
            report.findings.push(Finding {
                severity: Severity::Error,
                line: Some(record.line),
                tag: record.name.clone(),
                kind: FindingKind::OffsetMismatch {
                    address: record.address,
                    register: record.register,
                    expected: i64::from(record.address) + reference,
                },
            });
        }
    }
}

fn check_unique_names(table: &TagTable, report: &mut Report) {
    // Lookups ignore ASCII case, so names differing only in case collide.
    let mut lines = BTreeMap::<String, (&str, Vec<usize>)>::new();
    for record in table.records() {
        lines
            .entry(record.name.to_ascii_uppercase())
            .or_insert_with(|| (record.name.as_str(), Vec::new()))
            .1
            .push(record.line);
    }
    for (name, lines) in lines.into_values() {
        if lines.len() > 1 {
            report.findings.push(Finding {
                severity: Severity::Error,
                line: Some(lines[1]),
                tag: name.to_string(),
                kind: FindingKind::DuplicateName { lines },
            });
        }
    }
}

fn check_valve_groups(table: &TagTable, report: &mut Report) {
    for group in table.valve_groups() {
        let line = group.members.iter().map(|(_, r)| r.line).min();
        for suffix in group.missing() {
            report.findings.push(Finding {
                severity: Severity::Error,
                line,
                tag: group.name.clone(),
                kind: FindingKind::MissingValveSuffix { group: group.name.clone(), suffix },
            });
        }
    }
}

fn check_state_labels(table: &TagTable, report: &mut Report) {
    for record in table.records() {
        if record.point_type == PointType::Digital
            && (record.on_label.is_none() || record.off_label.is_none())
        {
            report.findings.push(Finding {
                severity: Severity::Warning,
                line: Some(record.line),
                tag: record.name.clone(),
                kind: FindingKind::MissingStateLabels,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::VALVE_SUFFIXES;

    fn valve_rows(base: &str, first_register: u32) -> String {
        VALVE_SUFFIXES
            .iter()
            .enumerate()
            .map(|(i, suffix)| {
                let register = first_register + 2 * i as u32;
                format!(
                    "- 0x{:X}, {register}, {base}_{suffix}, Variable, {i}, float 32, , , , Digital, OFF, ON, 0\n",
                    register
                )
            })
            .collect()
    }

    #[test]
    fn complete_table_is_clean() {
        let table = TagTable::parse(&valve_rows("XV_HWS_RX04", 6502)).unwrap();
        let report = check(&table);
        assert_eq!(report.reference_offset, Some(0));
        assert!(report.findings.is_empty(), "{:?}", report.findings);
        assert!(!report.has_errors());
    }

    #[test]
    fn offset_outlier_is_reported_with_expected_register() {
        let mut text = valve_rows("XV_HWS_RX04", 6502);
        text.push_str("- 0x1A00, 6700, PT_RX04, Signal Tag, 40, float 32, bar, , , Analog\n");
        let report = check(&TagTable::parse(&text).unwrap());
        assert_eq!(report.findings.len(), 1);
        let finding = &report.findings[0];
        assert_eq!(finding.tag, "PT_RX04");
        assert_eq!(finding.line, Some(10));
        assert_eq!(
            finding.kind,
            FindingKind::OffsetMismatch { address: 0x1A00, register: 6700, expected: 0x1A00 }
        );
        assert!(report.has_errors());
    }

    #[test]
    fn duplicates_and_missing_suffixes() {
        let mut text = valve_rows("XV_CWS_RX04", 6550);
        // A second copy of the document repeats one row and drops the rest of its group.
        text.push_str("- 0x1986, 6534, XV_CWR_RX04_STR, Variable, 1, float 32, , , , Digital, OFF, ON\n");
        text.push_str("- 0x1996, 6550, XV_CWS_RX04_STR, Variable, 1, float 32, , , , Digital, OFF, ON\n");
        let report = check(&TagTable::parse(&text).unwrap());
        let duplicate = report
            .findings
            .iter()
            .find(|f| matches!(f.kind, FindingKind::DuplicateName { .. }))
            .unwrap();
        assert_eq!(duplicate.tag, "XV_CWS_RX04_STR");
        assert_eq!(duplicate.kind, FindingKind::DuplicateName { lines: vec![1, 11] });
        let missing = report
            .findings
            .iter()
            .filter(|f| matches!(f.kind, FindingKind::MissingValveSuffix { .. }))
            .count();
        assert_eq!(missing, 8);
    }

    #[test]
    fn names_differing_only_in_case_are_duplicates() {
        let text = "- 0x10, 16, FBV_RX04, Variable, 1, float 32, , , , Digital, OFF, ON\n\
                    - 0x12, 18, fbv_rx04, Variable, 2, float 32, , , , Digital, OFF, ON\n";
        let report = check(&TagTable::parse(text).unwrap());
        assert_eq!(report.findings.len(), 1, "{:?}", report.findings);
        assert_eq!(report.findings[0].tag, "FBV_RX04");
        assert_eq!(report.findings[0].kind, FindingKind::DuplicateName { lines: vec![1, 2] });
        assert!(report.has_errors());
    }

    #[test]
    fn digital_without_labels_is_a_warning() {
        let text = "- 0x10, 16, FBV_RX04, Variable, 1, float 32, , , , Digital\n";
        let report = check(&TagTable::parse(text).unwrap());
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].severity, Severity::Warning);
        assert!(!report.has_errors());
    }

    #[test]
    fn builtin_catalog_is_consistent() {
        let report = check(&TagTable::builtin());
        assert_eq!(report.reference_offset, Some(1));
        assert!(!report.has_errors(), "{:?}", report.findings);
    }

    #[test]
    fn empty_table_has_no_reference() {
        let report = check(&TagTable::default());
        assert_eq!(report.reference_offset, None);
        assert!(report.findings.is_empty());
    }
}
