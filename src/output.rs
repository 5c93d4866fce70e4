use std::io::Write as _;
use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone, Debug, Default)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    pub format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("could not encode the field {0:?} as CSV")]
    SerializeCsv(String),
}

impl Args {
    pub fn to_output(&self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<dyn std::io::Write>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        Ok(Output::new(self.clone(), io))
    }
}

pub struct Output {
    args: Args,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_records: bool },
    Table { comfy: comfy_table::Table, footer: Vec<String> },
    Jsonl,
}

impl Output {
    pub fn new(args: Args, io: Box<dyn std::io::Write>) -> Self {
        let formatter = match args.format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy, footer: Vec::new() }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_records: false },
        };
        Self { args, io, formatter }
    }

    /// Column names. Must come before any row.
    pub fn table_headers(&mut self, hdrs: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                debug_assert!(!*written_records, "csv headers must be written first");
                *written_records = true;
                self.write_csv_row(&hdrs)?;
            }
            Formatter::Table { comfy, .. } => {
                comfy.set_header(hdrs);
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    fn write_csv_row<V: std::ops::Deref<Target = str>>(
        &mut self,
        values: &[V],
    ) -> Result<(), Error> {
        // Quoting at most doubles a field, plus the quotes themselves.
        let max_len = 2 + 2 * values.iter().map(|v| v.len()).max().unwrap_or(0);
        let mut output = vec![0; max_len];
        let mut writer = csv_core::Writer::new();
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                let (WriteResult::InputEmpty, ob) = writer.delimiter(&mut output) else {
                    return Err(Error::SerializeCsv(value.to_string()));
                };
                self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
            }
            let (WriteResult::InputEmpty, _, ob) = writer.field(value.as_bytes(), &mut output)
            else {
                return Err(Error::SerializeCsv(value.to_string()));
            };
            self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))?;
        }
        let (WriteResult::InputEmpty, ob) = writer.terminator(&mut output) else {
            return Err(Error::SerializeCsv(String::new()));
        };
        self.io.write_all(&output[..ob]).map_err(|e| self.write_error(e))
    }

    /// One row: table cells for `table` and `csv`, a JSON record for `jsonl`.
    ///
    /// JSON lines are flushed as they are written so long-running commands can be followed.
    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                *written_records = true;
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy, .. } => {
                comfy.add_row(table_row());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?;
                self.io.flush().map_err(|e| self.write_error(e))?;
            }
        }
        Ok(())
    }

    /// An overall outcome: a line under the table, a final record in `jsonl`. CSV output only
    /// carries rows.
    pub fn summary<R: serde::Serialize>(
        &mut self,
        text: impl FnOnce() -> String,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { .. } => {}
            Formatter::Table { footer, .. } => footer.push(text()),
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?;
            }
        }
        Ok(())
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.args.output {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.into()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy, footer } = &self.formatter {
            let mut text = String::new();
            if comfy.header().is_some() || comfy.row_iter().next().is_some() {
                text.push_str(&format!("{comfy}\n"));
            }
            for line in footer {
                text.push_str(line);
                text.push('\n');
            }
            self.io.write_all(text.as_bytes()).map_err(|e| self.write_error(e))?;
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Shared(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);

    impl std::io::Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn render(format: Format) -> String {
        let buffer = Shared::default();
        let args = Args { output: None, format };
        let mut output = Output::new(args, Box::new(buffer.clone()));
        output.table_headers(vec!["tag", "value"]).unwrap();
        output
            .result(
                || vec!["PT_R4".to_string(), "1.5".to_string()],
                || serde_json::json!({"tag": "PT_R4", "value": 1.5}),
            )
            .unwrap();
        output
            .result(
                || vec!["NOTE".to_string(), "a, \"b\"".to_string()],
                || serde_json::json!({"tag": "NOTE"}),
            )
            .unwrap();
        output.summary(|| "2 tags".to_string(), || serde_json::json!({"count": 2})).unwrap();
        output.commit().unwrap();
        let bytes = buffer.0.borrow().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn csv_quotes_fields() {
        assert_eq!(render(Format::Csv), "tag,value\nPT_R4,1.5\nNOTE,\"a, \"\"b\"\"\"\n");
    }

    #[test]
    fn jsonl_has_summary() {
        assert_eq!(
            render(Format::Jsonl),
            "{\"tag\":\"PT_R4\",\"value\":1.5}\n{\"tag\":\"NOTE\"}\n{\"count\":2}\n"
        );
    }

    #[test]
    fn table_has_footer() {
        let text = render(Format::Table);
        assert!(text.contains("PT_R4"));
        assert!(text.trim_end().ends_with("2 tags"));
    }
}
