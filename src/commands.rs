use std::sync::Arc;

use crate::config::{self, PlantConfig};
use crate::connection;
use crate::plc::ConnectionManager;

fn connect(
    config: &config::Args,
    connection: &connection::Args,
) -> Result<(Arc<PlantConfig>, Arc<ConnectionManager>), config::Error> {
    let plant = Arc::new(config.load()?);
    let manager = Arc::new(ConnectionManager::new(&plant, connection));
    Ok((plant, manager))
}

fn registers_hex(registers: Option<&[u16]>) -> String {
    registers
        .unwrap_or_default()
        .iter()
        .map(|w| format!("{w:04X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub mod tags {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use crate::output;
    use crate::table::{self, TagTable};

    #[derive(clap::ValueEnum, Clone, Copy, Debug)]
    pub enum Group {
        Valves,
        Vfds,
        Sensors,
    }

    /// List and search the built-in Reactor 04 catalog or a tag table document.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only show tags whose name, source, register or address contains this text.
        filter: Option<String>,
        /// Tag table document to list instead of the built-in catalog.
        #[arg(long, short = 't')]
        table: Option<PathBuf>,
        /// Only show members of valve groups, drive groups or analog sensors.
        #[arg(long, short = 'g', value_enum)]
        group: Option<Group>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the tag table")]
        LoadTable(#[source] table::Error),
        #[error("could not output the tags")]
        Output(#[source] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let table = match &args.table {
            Some(path) => TagTable::from_path(path).map_err(Error::LoadTable)?,
            None => TagTable::builtin(),
        };
        let members: Option<BTreeSet<&str>> = args.group.map(|group| match group {
            Group::Valves => table
                .valve_groups()
                .iter()
                .flat_map(|g| g.members.iter().map(|&(_, r)| r.name.as_str()))
                .collect(),
            Group::Vfds => table
                .vfd_groups()
                .iter()
                .flat_map(|g| g.members.iter().map(|&(_, r)| r.name.as_str()))
                .collect(),
            Group::Sensors => table.sensors().map(|r| r.name.as_str()).collect(),
        });
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec![
                "Register", "Address", "Name", "Class", "Type", "Unit", "Range", "Point",
                "Labels", "Source",
            ])
            .map_err(Error::Output)?;
        for record in table.records() {
            if let Some(pattern) = &args.filter {
                if !record.is_match(pattern) {
                    continue;
                }
            }
            if members.as_ref().is_some_and(|m| !m.contains(record.name.as_str())) {
                continue;
            }
            output
                .result(
                    || {
                        let range = match (record.range_low, record.range_high) {
                            (None, None) => String::new(),
                            (low, high) => format!(
                                "{}..{}",
                                low.map(|v| v.to_string()).unwrap_or_default(),
                                high.map(|v| v.to_string()).unwrap_or_default()
                            ),
                        };
                        let labels = match (&record.off_label, &record.on_label) {
                            (None, None) => String::new(),
                            (off, on) => format!(
                                "{}/{}",
                                off.as_deref().unwrap_or(""),
                                on.as_deref().unwrap_or("")
                            ),
                        };
                        vec![
                            record.register.to_string(),
                            format!("0x{:04X}", record.address),
                            record.name.clone(),
                            record.class.to_string(),
                            record.data_type.to_string(),
                            record.unit.clone().unwrap_or_default(),
                            range,
                            record.point_type.to_string(),
                            labels,
                            record.source.clone().unwrap_or_default(),
                        ]
                    },
                    || record,
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}

pub mod check {
    use std::path::PathBuf;

    use crate::integrity::{self, Severity};
    use crate::output;
    use crate::table::{self, TagTable};

    /// Check a tag table document for offset mismatches, duplicates and incomplete groups.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Tag table document to check. The built-in catalog is checked if omitted.
        table: Option<PathBuf>,
        /// Fail when there are warnings, not only errors.
        #[arg(long)]
        deny_warnings: bool,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the tag table")]
        LoadTable(#[source] table::Error),
        #[error("could not output the findings")]
        Output(#[source] output::Error),
        #[error("the tag table has {0} errors and {1} warnings")]
        Failed(usize, usize),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let table = match &args.table {
            Some(path) => TagTable::from_path(path).map_err(Error::LoadTable)?,
            None => TagTable::builtin(),
        };
        let report = integrity::check(&table);
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers(vec!["Severity", "Line", "Tag", "Finding"]).map_err(Error::Output)?;
        for finding in &report.findings {
            output
                .result(
                    || {
                        vec![
                            finding.severity.to_string(),
                            finding.line.map(|l| l.to_string()).unwrap_or_default(),
                            finding.tag.clone(),
                            finding.kind.to_string(),
                        ]
                    },
                    || finding,
                )
                .map_err(Error::Output)?;
        }
        let errors = report.count(Severity::Error);
        let warnings = report.count(Severity::Warning);
        output
            .summary(
                || {
                    let offset = report
                        .reference_offset
                        .map(|o| o.to_string())
                        .unwrap_or_else(|| "none".to_string());
                    format!(
                        "{} records checked, register offset {offset}: {errors} errors, {warnings} warnings",
                        table.records().len()
                    )
                },
                || {
                    serde_json::json!({
                        "records": table.records().len(),
                        "reference_offset": report.reference_offset,
                        "errors": errors,
                        "warnings": warnings,
                    })
                },
            )
            .map_err(Error::Output)?;
        output.commit().map_err(Error::Output)?;
        if errors > 0 || (args.deny_warnings && warnings > 0) {
            return Err(Error::Failed(errors, warnings));
        }
        Ok(())
    }
}

pub mod read {
    use crate::tag_service::{self, TagService};
    use crate::{config, connection, output};

    /// Read tags from a configured PLC.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Identifier of the PLC in the plant configuration.
        plc_id: String,
        /// Names of the tags to read.
        #[arg(required = true)]
        tags: Vec<String>,
        #[clap(flatten)]
        config: config::Args,
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the plant configuration")]
        LoadConfig(#[source] config::Error),
        #[error("could not read the tags")]
        Request(#[source] tag_service::Error),
        #[error("could not output the results")]
        Output(#[source] output::Error),
        #[error("{0} of {1} tags could not be read")]
        Failed(usize, usize),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let (plant, manager) =
            super::connect(&args.config, &args.connection).map_err(Error::LoadConfig)?;
        let service = TagService::new(plant, manager);
        let response = service.read_tags(&args.plc_id, &args.tags).await;
        service.shutdown().await;
        let response = response.map_err(Error::Request)?;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec!["Tag", "Status", "Value", "Registers", "Error"])
            .map_err(Error::Output)?;
        for result in &response.results {
            output
                .result(
                    || {
                        vec![
                            result.tag_name.clone(),
                            result.status.to_string(),
                            result.data.map(|v| v.to_string()).unwrap_or_default(),
                            super::registers_hex(result.registers.as_deref()),
                            result.error_message.clone().unwrap_or_default(),
                        ]
                    },
                    || result,
                )
                .map_err(Error::Output)?;
        }
        output
            .summary(
                || {
                    format!(
                        "{}: {} of {} read from {}",
                        response.overall_status,
                        response.successful_count,
                        response.total_requested,
                        response.plc_id
                    )
                },
                || {
                    serde_json::json!({
                        "plc_id": response.plc_id,
                        "overall_status": response.overall_status,
                        "total_requested": response.total_requested,
                        "successful_count": response.successful_count,
                        "failed_count": response.failed_count,
                        "timestamp": response.timestamp,
                    })
                },
            )
            .map_err(Error::Output)?;
        output.commit().map_err(Error::Output)?;
        if response.failed_count > 0 {
            return Err(Error::Failed(response.failed_count, response.total_requested));
        }
        Ok(())
    }
}

pub mod write {
    use crate::tag_service::{self, Input, TagService};
    use crate::{config, connection, output};

    /// Write tags on a configured PLC.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Identifier of the PLC in the plant configuration.
        plc_id: String,
        /// `TAG=VALUE` pairs. Values are numbers, or `on`/`off`/`true`/`false` for digital tags.
        #[arg(required = true, value_parser = parse_assignment)]
        assignments: Vec<(String, Input)>,
        #[clap(flatten)]
        config: config::Args,
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    fn parse_assignment(text: &str) -> Result<(String, Input), String> {
        let Some((tag, value)) = text.split_once('=') else {
            return Err(format!("`{text}` is not of the form TAG=VALUE"));
        };
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(format!("`{text}` does not name a tag"));
        }
        Ok((tag.to_string(), Input::parse(value)))
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the plant configuration")]
        LoadConfig(#[source] config::Error),
        #[error("could not write the tags")]
        Request(#[source] tag_service::Error),
        #[error("could not output the results")]
        Output(#[source] output::Error),
        #[error("{0} of {1} tags could not be written")]
        Failed(usize, usize),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let (plant, manager) =
            super::connect(&args.config, &args.connection).map_err(Error::LoadConfig)?;
        let service = TagService::new(plant, manager);
        let response = service.write_tags(&args.plc_id, &args.assignments).await;
        service.shutdown().await;
        let response = response.map_err(Error::Request)?;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec!["Tag", "Status", "Value", "Registers", "Error"])
            .map_err(Error::Output)?;
        for result in &response.results {
            output
                .result(
                    || {
                        vec![
                            result.tag_name.clone(),
                            result.status.to_string(),
                            result.data.to_string(),
                            super::registers_hex(result.registers.as_deref()),
                            result.error_message.clone().unwrap_or_default(),
                        ]
                    },
                    || result,
                )
                .map_err(Error::Output)?;
        }
        output
            .summary(
                || {
                    format!(
                        "{}: {} of {} written to {}",
                        response.overall_status,
                        response.successful_count,
                        response.total_requested,
                        response.plc_id
                    )
                },
                || {
                    serde_json::json!({
                        "plc_id": response.plc_id,
                        "overall_status": response.overall_status,
                        "total_requested": response.total_requested,
                        "successful_count": response.successful_count,
                        "failed_count": response.failed_count,
                        "timestamp": response.timestamp,
                    })
                },
            )
            .map_err(Error::Output)?;
        output.commit().map_err(Error::Output)?;
        if response.failed_count > 0 {
            return Err(Error::Failed(response.failed_count, response.total_requested));
        }
        Ok(())
    }

}

pub mod procedure {
    use std::path::PathBuf;
    use std::sync::Arc;

    use futures::StreamExt as _;

    use crate::plc::ConnectionManager;
    use crate::procedure::{self, Event, ExecutionStatus, Executor, ProcedureSet};
    use crate::tag_service::TagService;
    use crate::{config, connection, output};

    #[derive(clap::Subcommand)]
    pub enum Action {
        /// List the procedures in the file.
        List,
        /// Show the steps of a procedure.
        Show { name: String },
        /// Run a procedure against the configured PLCs.
        Run {
            name: String,
            /// Stop the run after executing this many steps.
            #[arg(long, default_value_t = procedure::DEFAULT_STEP_BUDGET)]
            step_budget: usize,
        },
    }

    /// Load, inspect and run operator procedures.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Procedure file.
        #[arg(long, short = 'p', default_value = "procedures.yaml")]
        procedures: PathBuf,
        #[command(subcommand)]
        action: Action,
        #[clap(flatten)]
        config: config::Args,
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the plant configuration")]
        LoadConfig(#[source] config::Error),
        #[error("could not load the procedures")]
        LoadProcedures(#[source] procedure::Error),
        #[error("there is no procedure named `{0}`")]
        UnknownProcedure(String),
        #[error("could not output the results")]
        Output(#[source] output::Error),
        #[error("could not listen for interrupts")]
        Signal(#[source] std::io::Error),
        #[error("procedure `{0}` was interrupted")]
        Interrupted(String),
        #[error("procedure `{0}` failed")]
        Failed(String),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let plant = Arc::new(args.config.load().map_err(Error::LoadConfig)?);
        let set = ProcedureSet::from_path(&args.procedures, &plant).map_err(Error::LoadProcedures)?;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        match &args.action {
            Action::List => {
                output
                    .table_headers(vec!["Procedure", "Steps", "Description"])
                    .map_err(Error::Output)?;
                for procedure in set.iter() {
                    output
                        .result(
                            || {
                                vec![
                                    procedure.name.clone(),
                                    procedure.steps.len().to_string(),
                                    procedure.description.clone(),
                                ]
                            },
                            || procedure,
                        )
                        .map_err(Error::Output)?;
                }
            }
            Action::Show { name } => {
                let procedure =
                    set.get(name).ok_or_else(|| Error::UnknownProcedure(name.clone()))?;
                output
                    .table_headers(vec!["#", "Step", "Type", "Details"])
                    .map_err(Error::Output)?;
                for (index, step) in procedure.steps.iter().enumerate() {
                    output
                        .result(
                            || {
                                vec![
                                    index.to_string(),
                                    step.name.clone(),
                                    step.action.kind().to_string(),
                                    step.action.to_string(),
                                ]
                            },
                            || step,
                        )
                        .map_err(Error::Output)?;
                }
            }
            Action::Run { name, step_budget } => {
                let procedure =
                    set.get(name).ok_or_else(|| Error::UnknownProcedure(name.clone()))?;
                let manager = Arc::new(ConnectionManager::new(&plant, &args.connection));
                let service = TagService::new(plant, manager);
                let executor = Executor::new(service.clone()).with_step_budget(*step_budget);
                let outcome = run_procedure(&executor, procedure, &mut output).await;
                drop(executor);
                service.shutdown().await;
                let status = outcome?;
                output.commit().map_err(Error::Output)?;
                if status == ExecutionStatus::Failed {
                    return Err(Error::Failed(name.clone()));
                }
                return Ok(());
            }
        }
        output.commit().map_err(Error::Output)
    }

    async fn run_procedure(
        executor: &Executor,
        procedure: &procedure::Procedure,
        output: &mut output::Output,
    ) -> Result<ExecutionStatus, Error> {
        output
            .table_headers(vec!["Step", "Type", "Status", "Result", "Time (ms)"])
            .map_err(Error::Output)?;
        let events = executor.events(procedure);
        futures::pin_mut!(events);
        let mut interrupt = std::pin::pin!(tokio::signal::ctrl_c());
        loop {
            let event = tokio::select! {
                event = events.next() => event,
                signal = &mut interrupt => {
                    signal.map_err(Error::Signal)?;
                    return Err(Error::Interrupted(procedure.name.clone()));
                }
            };
            match event {
                None => return Ok(ExecutionStatus::Failed),
                Some(Event::Step(step)) => output
                    .result(
                        || {
                            vec![
                                step.step_name.clone(),
                                step.step_type.to_string(),
                                step.status.to_string(),
                                match (&step.data, &step.error_message) {
                                    (_, Some(message)) => message.clone(),
                                    (Some(data), None) => data.to_string(),
                                    (None, None) => String::new(),
                                },
                                step.execution_time_ms.to_string(),
                            ]
                        },
                        || &step,
                    )
                    .map_err(Error::Output)?,
                Some(Event::Finished(result)) => {
                    output
                        .summary(
                            || {
                                let mut text = format!(
                                    "{} {}: {} of {} steps succeeded in {} ms",
                                    result.procedure_name,
                                    result.status,
                                    result.successful_steps,
                                    result.total_steps,
                                    result.execution_time_ms
                                );
                                if let Some(message) = &result.error_message {
                                    text.push_str(&format!(" ({message})"));
                                }
                                text
                            },
                            || {
                                serde_json::json!({
                                    "procedure_name": result.procedure_name,
                                    "status": result.status,
                                    "total_steps": result.total_steps,
                                    "successful_steps": result.successful_steps,
                                    "failed_steps": result.failed_steps,
                                    "execution_time_ms": result.execution_time_ms,
                                    "error_message": result.error_message,
                                    "variables": result.variables,
                                })
                            },
                        )
                        .map_err(Error::Output)?;
                    return Ok(result.status);
                }
            }
        }
    }
}

pub mod health {
    use std::sync::Arc;

    use crate::health::{HealthService, ServiceHealth};
    use crate::{config, connection, output};

    /// Ping the configured PLCs and report their health.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Keep probing every PLC on its health check interval until interrupted, then report.
        #[arg(long)]
        monitor: bool,
        #[clap(flatten)]
        config: config::Args,
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the plant configuration")]
        LoadConfig(#[source] config::Error),
        #[error("could not output the report")]
        Output(#[source] output::Error),
        #[error("the plant is {0}")]
        Unhealthy(ServiceHealth),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let (_, manager) =
            super::connect(&args.config, &args.connection).map_err(Error::LoadConfig)?;
        let health = HealthService::new(Arc::clone(&manager));
        if args.monitor {
            let interrupted = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(
                        message = "could not listen for interrupts",
                        error = (&e as &dyn std::error::Error)
                    );
                }
            };
            Arc::clone(&manager).monitor(interrupted).await;
        }
        let report = health.check().await;
        drop(health);
        if let Some(manager) = Arc::into_inner(manager) {
            manager.shutdown().await;
        }
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec![
                "PLC", "Status", "State", "Address", "Success", "Avg (ms)", "Last error",
            ])
            .map_err(Error::Output)?;
        for plc in &report.plcs {
            output
                .result(
                    || {
                        vec![
                            plc.plc_id.clone(),
                            plc.status.to_string(),
                            plc.state.to_string(),
                            format!("{}:{}", plc.host, plc.port),
                            format!("{:.0}%", plc.success_rate * 100.0),
                            plc.response_time_ms.map(|t| format!("{t:.1}")).unwrap_or_default(),
                            plc.last_error.clone().unwrap_or_default(),
                        ]
                    },
                    || plc,
                )
                .map_err(Error::Output)?;
        }
        output
            .summary(
                || {
                    format!(
                        "{}: {} up, {} degraded, {} down",
                        report.overall_status,
                        report.healthy_plcs,
                        report.degraded_plcs,
                        report.unhealthy_plcs
                    )
                },
                || {
                    serde_json::json!({
                        "overall_status": report.overall_status,
                        "total_plcs": report.total_plcs,
                        "healthy_plcs": report.healthy_plcs,
                        "degraded_plcs": report.degraded_plcs,
                        "unhealthy_plcs": report.unhealthy_plcs,
                        "service_uptime_seconds": report.service_uptime_seconds,
                        "performance": report.performance,
                        "timestamp": report.timestamp,
                    })
                },
            )
            .map_err(Error::Output)?;
        output.commit().map_err(Error::Output)?;
        if report.overall_status == ServiceHealth::Unhealthy {
            return Err(Error::Unhealthy(report.overall_status));
        }
        Ok(())
    }
}

pub mod simulate {
    use std::path::PathBuf;

    use crate::simulator::{self, RegisterBank, Simulator};
    use crate::table::{self, TagTable};

    /// Serve a tag table over Modbus TCP from memory.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Tag table document whose source values seed the registers. Defaults to the built-in
        /// catalog, all zero.
        #[arg(long, short = 't')]
        table: Option<PathBuf>,
        #[arg(long, short = 'l', default_value = "127.0.0.1:5020")]
        listen: String,
        /// Only answer requests for this unit.
        #[arg(long)]
        unit_id: Option<u8>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the tag table")]
        LoadTable(#[source] table::Error),
        #[error("could not run the simulator")]
        Simulator(#[source] simulator::Error),
        #[error("could not listen for interrupts")]
        Signal(#[source] std::io::Error),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let table = match &args.table {
            Some(path) => TagTable::from_path(path).map_err(Error::LoadTable)?,
            None => TagTable::builtin(),
        };
        let mut simulator = Simulator::new(RegisterBank::from_table(&table));
        if let Some(unit_id) = args.unit_id {
            simulator = simulator.with_unit_id(unit_id);
        }
        let running = simulator.start(&args.listen).await.map_err(Error::Simulator)?;
        eprintln!("serving {} tags on {}", table.records().len(), running.local_addr());
        let interrupted = tokio::signal::ctrl_c().await.map_err(Error::Signal);
        running.stop().await.map_err(Error::Simulator)?;
        interrupted
    }
}
