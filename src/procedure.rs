//! Operator-authored procedures: bounded sequences of tag reads, writes, waits and checks.
//!
//! ```yaml
//! procedures:
//!   open_hot_water:
//!     description: Open the hot water supply and wait for the valve to report open
//!     steps:
//!       - { name: open, type: write, plc_id: reactor04, register: XV_HWS_R4, value: 1 }
//!       - name: confirm
//!         type: loop
//!         plc_id: reactor04
//!         condition: XV_HWS_R4_FEEDBACK_OPEN == 1
//!         max_iterations: 10
//!         delay_seconds: 0.5
//! ```
//!
//! Everything a step refers to is checked when the file is loaded, so a procedure that loads
//! only fails at run time if the PLC does.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use futures::Stream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PlantConfig;
use crate::tag_service::{Input, Status, TagService};
use crate::tags::Value;

/// How many steps a single run may execute before it is stopped. Conditions can jump
/// backwards, so a procedure is not otherwise guaranteed to finish.
pub const DEFAULT_STEP_BUDGET: usize = 1000;

#[derive(thiserror::Error, Debug)]
pub enum ConditionError {
    #[error("could not compile the condition pattern")]
    Pattern(#[source] regex::Error),
    #[error("`{0}` is not of the form `TAG operator value`, e.g. `TE_MASS_UPPER_R4 > 50`")]
    Syntax(String),
    #[error("operator `{0}` needs a numeric value, got `{1}`")]
    NotNumeric(Operator, String),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the procedure file at {1:?}")]
    ReadFile(#[source] std::io::Error, PathBuf),
    #[error("could not parse the procedure file")]
    Parse(#[source] serde_yaml::Error),
    #[error("procedure `{0}` has no steps")]
    NoSteps(String),
    #[error("step {1} of procedure `{0}` has no name")]
    MissingName(String, usize),
    #[error("step `{1}` of procedure `{0}` has no type")]
    MissingType(String, String),
    #[error("step `{1}` of procedure `{0}` has type `{2}`, expected one of read, write, condition, wait, loop")]
    UnknownType(String, String, String),
    #[error("procedure `{0}` has more than one step named `{1}`")]
    DuplicateStep(String, String),
    #[error("{2} step `{1}` of procedure `{0}` is missing `{3}`")]
    MissingField(String, String, StepKind, &'static str),
    #[error("step `{1}` of procedure `{0}` refers to unknown PLC `{2}`")]
    UnknownPlc(String, String, String),
    #[error("step `{1}` of procedure `{0}` refers to tag `{3}`, which PLC `{2}` does not have{4}")]
    UnknownTag(String, String, String, String, String),
    #[error("step `{1}` of procedure `{0}` writes to read-only tag `{3}` of PLC `{2}`")]
    ReadOnlyTarget(String, String, String, String),
    #[error("step `{1}` of procedure `{0}` has an invalid condition")]
    Condition(String, String, #[source] ConditionError),
    #[error("wait step `{1}` of procedure `{0}` has an invalid wait of {2} seconds")]
    InvalidWait(String, String, f64),
    #[error("loop step `{1}` of procedure `{0}` must allow a positive number of iterations, not {2}")]
    NonPositiveIterations(String, String, i64),
    #[error("loop step `{1}` of procedure `{0}` has an invalid delay of {2} seconds")]
    InvalidDelay(String, String, f64),
    #[error("step `{1}` of procedure `{0}` jumps to `{2}`, which is not a step of this procedure")]
    UnknownTarget(String, String, String),
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display, strum::EnumString,
)]
pub enum Operator {
    #[strum(serialize = "==")]
    #[serde(rename = "==")]
    Eq,
    #[strum(serialize = "!=")]
    #[serde(rename = "!=")]
    Ne,
    #[strum(serialize = "<")]
    #[serde(rename = "<")]
    Lt,
    #[strum(serialize = ">")]
    #[serde(rename = ">")]
    Gt,
    #[strum(serialize = "<=")]
    #[serde(rename = "<=")]
    Le,
    #[strum(serialize = ">=")]
    #[serde(rename = ">=")]
    Ge,
}

impl Operator {
    fn is_ordering(self) -> bool {
        matches!(self, Operator::Lt | Operator::Gt | Operator::Le | Operator::Ge)
    }
}

/// `TAG operator value`, compared numerically when the value is a number.
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub tag: String,
    pub operator: Operator,
    pub operand: String,
}

static CONDITION: LazyLock<Result<regex::Regex, regex::Error>> =
    LazyLock::new(|| regex::Regex::new(r"^(\w+)\s*(==|!=|<=|>=|<|>)\s*(.+)$"));

impl std::str::FromStr for Condition {
    type Err = ConditionError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let re = CONDITION.as_ref().map_err(|e| ConditionError::Pattern(e.clone()))?;
        let syntax = || ConditionError::Syntax(text.to_string());
        let captures = re.captures(text.trim()).ok_or_else(syntax)?;
        let operator = captures[2].parse::<Operator>().map_err(|_| syntax())?;
        let operand = captures[3].trim().to_string();
        if operand.is_empty() {
            return Err(syntax());
        }
        if operator.is_ordering() && operand.parse::<f64>().is_err() {
            return Err(ConditionError::NotNumeric(operator, operand));
        }
        Ok(Self { tag: captures[1].to_string(), operator, operand })
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.tag, self.operator, self.operand)
    }
}

impl serde::Serialize for Condition {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl Condition {
    pub fn evaluate(&self, value: &Value) -> Result<bool, ConditionError> {
        if let Ok(operand) = self.operand.parse::<f64>() {
            // Compare at the precision the PLC stores.
            let operand = match value {
                Value::F32(_) => f64::from(operand as f32),
                _ => operand,
            };
            let value = value.as_f64();
            return Ok(match self.operator {
                Operator::Eq => value == operand,
                Operator::Ne => value != operand,
                Operator::Lt => value < operand,
                Operator::Gt => value > operand,
                Operator::Le => value <= operand,
                Operator::Ge => value >= operand,
            });
        }
        let text = value.to_string();
        match self.operator {
            Operator::Eq => Ok(text == self.operand),
            Operator::Ne => Ok(text != self.operand),
            operator => Err(ConditionError::NotNumeric(operator, self.operand.clone())),
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepKind {
    Read,
    Write,
    Condition,
    Wait,
    Loop,
}

/// A step to continue with, resolved to its position when the procedure is loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub name: String,
    pub index: usize,
}

impl serde::Serialize for Target {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    Read {
        plc_id: String,
        register: String,
        store_as: Option<String>,
    },
    Write {
        plc_id: String,
        register: String,
        value: Input,
    },
    Condition {
        plc_id: String,
        condition: Condition,
        if_true: Target,
        if_false: Target,
    },
    Wait {
        #[serde(serialize_with = "serialize_seconds")]
        seconds: Duration,
    },
    Loop {
        plc_id: String,
        condition: Condition,
        max_iterations: u32,
        #[serde(serialize_with = "serialize_seconds")]
        delay_seconds: Duration,
    },
}

fn serialize_seconds<S: serde::Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64())
}

impl Action {
    pub fn kind(&self) -> StepKind {
        match self {
            Action::Read { .. } => StepKind::Read,
            Action::Write { .. } => StepKind::Write,
            Action::Condition { .. } => StepKind::Condition,
            Action::Wait { .. } => StepKind::Wait,
            Action::Loop { .. } => StepKind::Loop,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Read { plc_id, register, store_as: None } => write!(f, "{plc_id}/{register}"),
            Action::Read { plc_id, register, store_as: Some(var) } => {
                write!(f, "{plc_id}/{register} as {var}")
            }
            Action::Write { plc_id, register, value } => {
                write!(f, "{plc_id}/{register} := {value}")
            }
            Action::Condition { plc_id, condition, if_true, if_false } => write!(
                f,
                "{plc_id}: {condition} ? {} : {}",
                if_true.name, if_false.name
            ),
            Action::Wait { seconds } => write!(f, "{}s", seconds.as_secs_f64()),
            Action::Loop { plc_id, condition, max_iterations, delay_seconds } => write!(
                f,
                "{plc_id}: until {condition}, {max_iterations} polls {}s apart",
                delay_seconds.as_secs_f64()
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Step {
    pub name: String,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Procedure {
    pub name: String,
    pub description: String,
    pub steps: Vec<Step>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    procedures: BTreeMap<String, RawProcedure>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProcedure {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(serde::Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawStep {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    description: Option<String>,
    plc_id: Option<String>,
    register: Option<String>,
    store_as: Option<String>,
    value: Option<Input>,
    condition: Option<String>,
    if_true: Option<String>,
    if_false: Option<String>,
    seconds: Option<f64>,
    max_iterations: Option<i64>,
    delay_seconds: Option<f64>,
}

/// Checks one procedure against the plant configuration while it is being loaded.
struct Loader<'a> {
    config: &'a PlantConfig,
    procedure: &'a str,
}

impl Loader<'_> {
    fn required<T>(
        &self,
        step: &str,
        kind: StepKind,
        field: &'static str,
        value: Option<T>,
    ) -> Result<T, Error> {
        value.ok_or_else(|| {
            Error::MissingField(self.procedure.to_string(), step.to_string(), kind, field)
        })
    }

    fn check_tag(&self, step: &str, plc_id: &str, tag: &str) -> Result<(), Error> {
        if self.config.plc(plc_id).is_err() {
            return Err(Error::UnknownPlc(
                self.procedure.to_string(),
                step.to_string(),
                plc_id.to_string(),
            ));
        }
        if self.config.address_of(plc_id, tag).is_none() {
            let names = self.config.tag_names(plc_id);
            let hint = if names.is_empty() {
                String::new()
            } else {
                let shown = &names[..names.len().min(10)];
                format!(". Available tags include: {}", shown.join(", "))
            };
            return Err(Error::UnknownTag(
                self.procedure.to_string(),
                step.to_string(),
                plc_id.to_string(),
                tag.to_string(),
                hint,
            ));
        }
        Ok(())
    }

    fn condition(&self, step: &str, plc_id: &str, text: &str) -> Result<Condition, Error> {
        let condition = text.parse::<Condition>().map_err(|e| {
            Error::Condition(self.procedure.to_string(), step.to_string(), e)
        })?;
        self.check_tag(step, plc_id, &condition.tag)?;
        Ok(condition)
    }

    fn step(&self, name: String, kind: StepKind, raw: RawStep) -> Result<Step, Error> {
        let step = name.as_str();
        let action = match kind {
            StepKind::Read => {
                let register = self.required(step, kind, "register", raw.register)?;
                let plc_id = self.required(step, kind, "plc_id", raw.plc_id)?;
                self.check_tag(step, &plc_id, &register)?;
                Action::Read { plc_id, register, store_as: raw.store_as }
            }
            StepKind::Write => {
                let register = self.required(step, kind, "register", raw.register)?;
                let plc_id = self.required(step, kind, "plc_id", raw.plc_id)?;
                let value = self.required(step, kind, "value", raw.value)?;
                self.check_tag(step, &plc_id, &register)?;
                let readonly = self
                    .config
                    .address_of(&plc_id, &register)
                    .is_some_and(|address| self.config.is_readonly(&plc_id, address));
                if readonly {
                    return Err(Error::ReadOnlyTarget(
                        self.procedure.to_string(),
                        name,
                        plc_id,
                        register,
                    ));
                }
                Action::Write { plc_id, register, value }
            }
            StepKind::Condition => {
                let condition = self.required(step, kind, "condition", raw.condition)?;
                let plc_id = self.required(step, kind, "plc_id", raw.plc_id)?;
                let if_true = self.required(step, kind, "if_true", raw.if_true)?;
                let if_false = self.required(step, kind, "if_false", raw.if_false)?;
                let condition = self.condition(step, &plc_id, &condition)?;
                // Indices are filled in once every step name is known.
                Action::Condition {
                    plc_id,
                    condition,
                    if_true: Target { name: if_true, index: 0 },
                    if_false: Target { name: if_false, index: 0 },
                }
            }
            StepKind::Wait => {
                let seconds = self.required(step, kind, "seconds", raw.seconds)?;
                let wait = Duration::try_from_secs_f64(seconds).ok().filter(|d| !d.is_zero());
                let Some(wait) = wait else {
                    return Err(Error::InvalidWait(self.procedure.to_string(), name, seconds));
                };
                Action::Wait { seconds: wait }
            }
            StepKind::Loop => {
                let condition = self.required(step, kind, "condition", raw.condition)?;
                let plc_id = self.required(step, kind, "plc_id", raw.plc_id)?;
                let max_iterations =
                    self.required(step, kind, "max_iterations", raw.max_iterations)?;
                let max_iterations = u32::try_from(max_iterations)
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| {
                        Error::NonPositiveIterations(
                            self.procedure.to_string(),
                            name.clone(),
                            max_iterations,
                        )
                    })?;
                let delay = raw.delay_seconds.unwrap_or(1.0);
                let Ok(delay_seconds) = Duration::try_from_secs_f64(delay) else {
                    return Err(Error::InvalidDelay(self.procedure.to_string(), name, delay));
                };
                let condition = self.condition(step, &plc_id, &condition)?;
                Action::Loop {
                    plc_id,
                    condition,
                    max_iterations,
                    delay_seconds,
                }
            }
        };
        Ok(Step { name, action })
    }

    fn procedure(&self, raw: RawProcedure) -> Result<Procedure, Error> {
        let procedure = self.procedure;
        if raw.steps.is_empty() {
            return Err(Error::NoSteps(procedure.to_string()));
        }
        let mut steps = Vec::with_capacity(raw.steps.len());
        let mut names = BTreeSet::new();
        for (index, mut raw_step) in raw.steps.into_iter().enumerate() {
            let name = raw_step
                .name
                .take()
                .filter(|n| !n.trim().is_empty())
                .ok_or_else(|| Error::MissingName(procedure.to_string(), index))?;
            let kind = raw_step
                .kind
                .take()
                .ok_or_else(|| Error::MissingType(procedure.to_string(), name.clone()))?;
            let kind = kind.parse::<StepKind>().map_err(|_| {
                Error::UnknownType(procedure.to_string(), name.clone(), kind.clone())
            })?;
            if !names.insert(name.clone()) {
                return Err(Error::DuplicateStep(procedure.to_string(), name));
            }
            steps.push(self.step(name, kind, raw_step)?);
        }
        let positions = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect::<BTreeMap<_, _>>();
        for step in &mut steps {
            if let Action::Condition { if_true, if_false, .. } = &mut step.action {
                for target in [if_true, if_false] {
                    target.index = *positions.get(&target.name).ok_or_else(|| {
                        Error::UnknownTarget(
                            procedure.to_string(),
                            step.name.clone(),
                            target.name.clone(),
                        )
                    })?;
                }
            }
        }
        let description = raw.description.unwrap_or_else(|| format!("Procedure {procedure}"));
        Ok(Procedure { name: procedure.to_string(), description, steps })
    }
}

/// Every procedure of a file, validated against the plant configuration.
#[derive(Clone, Debug, Default)]
pub struct ProcedureSet {
    procedures: BTreeMap<String, Procedure>,
}

impl ProcedureSet {
    pub fn parse(text: &str, config: &PlantConfig) -> Result<Self, Error> {
        let file: RawFile = serde_yaml::from_str(text).map_err(Error::Parse)?;
        let mut procedures = BTreeMap::new();
        for (name, raw) in file.procedures {
            let loader = Loader { config, procedure: &name };
            let procedure = loader.procedure(raw)?;
            debug!(message = "loaded procedure", procedure = %name, steps = procedure.steps.len());
            procedures.insert(name, procedure);
        }
        Ok(Self { procedures })
    }

    pub fn from_path(path: &Path, config: &PlantConfig) -> Result<Self, Error> {
        let text =
            std::fs::read_to_string(path).map_err(|e| Error::ReadFile(e, path.to_path_buf()))?;
        let set = Self::parse(&text, config)?;
        info!(message = "loaded procedures", path = ?path, count = set.procedures.len());
        Ok(set)
    }

    pub fn get(&self, name: &str) -> Option<&Procedure> {
        self.procedures.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Procedure> {
        self.procedures.values()
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum StepData {
    Value(Value),
    Written(Input),
    Condition(bool),
    Seconds(f64),
    Message(String),
}

impl std::fmt::Display for StepData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepData::Value(v) => v.fmt(f),
            StepData::Written(v) => v.fmt(f),
            StepData::Condition(v) => v.fmt(f),
            StepData::Seconds(v) => write!(f, "{v}s"),
            StepData::Message(v) => v.fmt(f),
        }
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct StepResult {
    pub step_name: String,
    pub step_type: StepKind,
    pub status: Status,
    pub data: Option<StepData>,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct ExecutionResult {
    pub procedure_name: String,
    pub status: ExecutionStatus,
    pub total_steps: usize,
    pub successful_steps: usize,
    pub failed_steps: usize,
    pub execution_time_ms: u64,
    pub step_results: Vec<StepResult>,
    pub error_message: Option<String>,
    /// Values saved by read steps with `store_as`.
    pub variables: BTreeMap<String, Value>,
}

/// Progress of a run: every executed step, then the final result.
#[derive(Clone, Debug)]
pub enum Event {
    Step(StepResult),
    Finished(ExecutionResult),
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub struct Executor {
    tags: TagService,
    step_budget: usize,
}

impl Executor {
    pub fn new(tags: TagService) -> Self {
        Self { tags, step_budget: DEFAULT_STEP_BUDGET }
    }

    pub fn with_step_budget(mut self, step_budget: usize) -> Self {
        self.step_budget = step_budget;
        self
    }

    /// Run a procedure to completion.
    pub async fn run(&self, procedure: &Procedure) -> ExecutionResult {
        use futures::StreamExt;
        let events = self.events(procedure);
        futures::pin_mut!(events);
        let mut finished = None;
        while let Some(event) = events.next().await {
            if let Event::Finished(result) = event {
                finished = Some(result);
            }
        }
        // The stream always ends with `Finished`.
        finished.unwrap_or_else(|| ExecutionResult {
            procedure_name: procedure.name.clone(),
            status: ExecutionStatus::Failed,
            total_steps: 0,
            successful_steps: 0,
            failed_steps: 0,
            execution_time_ms: 0,
            step_results: Vec::new(),
            error_message: None,
            variables: BTreeMap::new(),
        })
    }

    /// Run a procedure, reporting each step as it completes.
    pub fn events<'a>(&'a self, procedure: &'a Procedure) -> impl Stream<Item = Event> + 'a {
        async_stream::stream! {
            info!(message = "starting procedure", procedure = %procedure.name);
            let start = Instant::now();
            let mut variables = BTreeMap::new();
            let mut step_results = Vec::new();
            let mut status = ExecutionStatus::Completed;
            let mut error_message = None;
            let mut index = 0;
            while let Some(step) = procedure.steps.get(index) {
                if step_results.len() == self.step_budget {
                    warn!(
                        message = "step budget exhausted",
                        procedure = %procedure.name,
                        step = %step.name,
                        budget = self.step_budget,
                    );
                    status = ExecutionStatus::Failed;
                    error_message = Some(format!(
                        "stopped before step `{}` after executing {} steps",
                        step.name, self.step_budget
                    ));
                    break;
                }
                let step_start = Instant::now();
                let outcome = self.execute(step, &mut variables).await;
                let execution_time_ms = millis(step_start.elapsed());
                let result = match outcome {
                    Ok((data, next)) => {
                        index = next.unwrap_or(index + 1);
                        StepResult {
                            step_name: step.name.clone(),
                            step_type: step.action.kind(),
                            status: Status::Success,
                            data: Some(data),
                            error_message: None,
                            execution_time_ms,
                        }
                    }
                    Err(message) => {
                        warn!(
                            message = "step failed",
                            procedure = %procedure.name,
                            step = %step.name,
                            error = %message,
                        );
                        status = ExecutionStatus::Failed;
                        error_message = Some(message.clone());
                        StepResult {
                            step_name: step.name.clone(),
                            step_type: step.action.kind(),
                            status: Status::Error,
                            data: None,
                            error_message: Some(message),
                            execution_time_ms,
                        }
                    }
                };
                step_results.push(result.clone());
                yield Event::Step(result);
                if status == ExecutionStatus::Failed {
                    break;
                }
            }
            let successful_steps =
                step_results.iter().filter(|r| r.status == Status::Success).count();
            let result = ExecutionResult {
                procedure_name: procedure.name.clone(),
                status,
                total_steps: step_results.len(),
                successful_steps,
                failed_steps: step_results.len() - successful_steps,
                execution_time_ms: millis(start.elapsed()),
                step_results,
                error_message,
                variables,
            };
            info!(
                message = "procedure finished",
                procedure = %procedure.name,
                status = %result.status,
                steps = result.total_steps,
            );
            yield Event::Finished(result);
        }
    }

    /// Execute a step, returning its data and the index of the step to jump to, if any.
    async fn execute(
        &self,
        step: &Step,
        variables: &mut BTreeMap<String, Value>,
    ) -> Result<(StepData, Option<usize>), String> {
        match &step.action {
            Action::Read { plc_id, register, store_as } => {
                let (value, _) =
                    self.tags.read_value(plc_id, register).await.map_err(|e| e.describe())?;
                if let Some(var) = store_as {
                    variables.insert(var.clone(), value);
                }
                Ok((StepData::Value(value), None))
            }
            Action::Write { plc_id, register, value } => {
                self.tags.write_value(plc_id, register, value).await.map_err(|e| e.describe())?;
                Ok((StepData::Written(value.clone()), None))
            }
            Action::Condition { plc_id, condition, if_true, if_false } => {
                let (value, _) = self
                    .tags
                    .read_value(plc_id, &condition.tag)
                    .await
                    .map_err(|e| format!("could not read the condition tag: {}", e.describe()))?;
                let holds = condition.evaluate(&value).map_err(|e| e.to_string())?;
                let target = if holds { if_true } else { if_false };
                debug!(
                    message = "condition evaluated",
                    step = %step.name,
                    %value,
                    holds,
                    next = %target.name
                );
                Ok((StepData::Condition(holds), Some(target.index)))
            }
            Action::Wait { seconds } => {
                tokio::time::sleep(*seconds).await;
                Ok((StepData::Seconds(seconds.as_secs_f64()), None))
            }
            Action::Loop { plc_id, condition, max_iterations, delay_seconds } => {
                for iteration in 1..=*max_iterations {
                    let (value, _) = self
                        .tags
                        .read_value(plc_id, &condition.tag)
                        .await
                        .map_err(|e| format!("could not read the loop tag: {}", e.describe()))?;
                    if condition.evaluate(&value).map_err(|e| e.to_string())? {
                        let message = format!("condition met after {iteration} iterations");
                        return Ok((StepData::Message(message), None));
                    }
                    if iteration < *max_iterations {
                        tokio::time::sleep(*delay_seconds).await;
                    }
                }
                Err(format!("condition `{condition}` not met after {max_iterations} iterations"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddressingScheme, PlcConfig};

    fn plant() -> PlantConfig {
        let plc = PlcConfig {
            host: "127.0.0.1".to_string(),
            addressing_scheme: AddressingScheme::Relative,
            ..PlcConfig::default()
        };
        PlantConfig::from_plcs([("reactor04".to_string(), plc)]).unwrap()
    }

    const PROCEDURES: &str = r#"
procedures:
  heat_up:
    description: Open hot water and wait for the mass to warm
    steps:
      - { name: open_supply, type: write, plc_id: reactor04, register: XV_HWS_R4, value: 1 }
      - { name: open_return, type: write, plc_id: reactor04, register: XV_HWR_R4, value: true }
      - name: settle
        type: wait
        seconds: 2
      - name: check
        type: condition
        plc_id: reactor04
        condition: TE_MASS_UPPER_R4 >= 60
        if_true: done
        if_false: settle
      - { name: done, type: read, plc_id: reactor04, register: TE_MASS_UPPER_R4, store_as: temp }
  pressure:
    steps:
      - name: wait_for_pressure
        type: loop
        plc_id: reactor04
        condition: PT_R4 < 1.5
        max_iterations: 5
"#;

    fn parse_err(text: &str) -> Error {
        ProcedureSet::parse(text, &plant()).unwrap_err()
    }

    fn single(steps: &str) -> String {
        format!("procedures:\n  p:\n    steps:\n{steps}")
    }

    #[test]
    fn loads_procedures() {
        let set = ProcedureSet::parse(PROCEDURES, &plant()).unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["heat_up", "pressure"]);
        let heat_up = set.get("heat_up").unwrap();
        assert_eq!(heat_up.steps.len(), 5);
        assert_eq!(heat_up.steps[1].action.kind(), StepKind::Write);
        match &heat_up.steps[3].action {
            Action::Condition { condition, if_true, if_false, .. } => {
                assert_eq!(condition.tag, "TE_MASS_UPPER_R4");
                assert_eq!(condition.operator, Operator::Ge);
                assert_eq!((if_true.index, if_false.index), (4, 2));
            }
            other => panic!("unexpected {other:?}"),
        }
        let pressure = set.get("pressure").unwrap();
        assert_eq!(pressure.description, "Procedure pressure");
        match &pressure.steps[0].action {
            Action::Loop { delay_seconds, max_iterations, .. } => {
                assert_eq!(*delay_seconds, Duration::from_secs(1));
                assert_eq!(*max_iterations, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_steps() {
        assert!(matches!(parse_err("procedures:\n  p:\n    steps: []\n"), Error::NoSteps(_)));
        assert!(matches!(
            parse_err(&single("      - { type: wait, seconds: 1 }\n")),
            Error::MissingName(_, 0)
        ));
        assert!(matches!(
            parse_err(&single("      - { name: a, type: jump }\n")),
            Error::UnknownType(..)
        ));
        assert!(matches!(
            parse_err(&single("      - { name: a, type: wait, seconds: 1 }\n      - { name: a, type: wait, seconds: 1 }\n")),
            Error::DuplicateStep(..)
        ));
        assert!(matches!(
            parse_err(&single("      - { name: a, type: read, plc_id: reactor04 }\n")),
            Error::MissingField(_, _, StepKind::Read, "register")
        ));
        assert!(matches!(
            parse_err(&single("      - { name: a, type: read, plc_id: reactor05, register: PT_R4 }\n")),
            Error::UnknownPlc(..)
        ));
        assert!(matches!(
            parse_err(&single("      - { name: a, type: read, plc_id: reactor04, register: PT_R5 }\n")),
            Error::UnknownTag(..)
        ));
        assert!(matches!(
            parse_err(&single("      - { name: a, type: write, plc_id: reactor04, register: PT_R4, value: 1 }\n")),
            Error::ReadOnlyTarget(..)
        ));
        assert!(matches!(
            parse_err(&single("      - { name: a, type: wait, seconds: 0 }\n")),
            Error::InvalidWait(..)
        ));
        assert!(matches!(
            parse_err(&single("      - { name: a, type: wait, seconds: 1e30 }\n")),
            Error::InvalidWait(..)
        ));
        assert!(matches!(
            parse_err(&single("      - { name: a, type: loop, plc_id: reactor04, condition: PT_R4 > 1, max_iterations: 2, delay_seconds: 1e30 }\n")),
            Error::InvalidDelay(..)
        ));
        assert!(matches!(
            parse_err(&single("      - { name: a, type: loop, plc_id: reactor04, condition: PT_R4 > 1, max_iterations: 2, delay_seconds: -1 }\n")),
            Error::InvalidDelay(..)
        ));
        assert!(matches!(
            parse_err(&single("      - { name: a, type: loop, plc_id: reactor04, condition: PT_R4 > 1, max_iterations: 0 }\n")),
            Error::NonPositiveIterations(..)
        ));
        assert!(matches!(
            parse_err(&single("      - { name: a, type: condition, plc_id: reactor04, condition: PT_R4 > 1, if_true: a, if_false: b }\n")),
            Error::UnknownTarget(..)
        ));
        assert!(matches!(
            parse_err(&single("      - { name: a, type: condition, plc_id: reactor04, condition: PT_R4 > high, if_true: a, if_false: a }\n")),
            Error::Condition(_, _, ConditionError::NotNumeric(Operator::Gt, _))
        ));
        assert!(matches!(parse_err("steps: []\n"), Error::Parse(_)));
    }

    #[test]
    fn parses_conditions() {
        let c: Condition = "TE_MASS_UPPER_R4>=60.5".parse().unwrap();
        assert_eq!(c.tag, "TE_MASS_UPPER_R4");
        assert_eq!(c.operator, Operator::Ge);
        assert_eq!(c.operand, "60.5");
        assert_eq!(c.to_string(), "TE_MASS_UPPER_R4 >= 60.5");
        let c: Condition = "AG_IS_ON_R4 != running ".parse().unwrap();
        assert_eq!((c.operator, c.operand.as_str()), (Operator::Ne, "running"));
        assert!(matches!("PT_R4".parse::<Condition>(), Err(ConditionError::Syntax(_))));
        assert!(matches!("PT-R4 > 1".parse::<Condition>(), Err(ConditionError::Syntax(_))));
        assert!(matches!("PT_R4 => 1".parse::<Condition>(), Err(ConditionError::Syntax(_))));
        assert!(matches!("PT_R4 < x".parse::<Condition>(), Err(ConditionError::NotNumeric(..))));
    }

    #[test]
    fn evaluates_conditions() {
        let c: Condition = "PT_R4 < 1.5".parse().unwrap();
        assert!(c.evaluate(&Value::F32(1.2)).unwrap());
        assert!(!c.evaluate(&Value::F32(1.5)).unwrap());
        let c: Condition = "PT_R4 == 0.1".parse().unwrap();
        assert!(c.evaluate(&Value::F32(0.1)).unwrap());
        let c: Condition = "LT_R4 == 7".parse().unwrap();
        assert!(c.evaluate(&Value::U16(7)).unwrap());
        let c: Condition = "LT_R4 == seven".parse().unwrap();
        assert!(!c.evaluate(&Value::U16(7)).unwrap());
        let c: Condition = "LT_R4 != seven".parse().unwrap();
        assert!(c.evaluate(&Value::U16(7)).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_run_without_a_plc() {
        let config = std::sync::Arc::new(plant());
        let manager = std::sync::Arc::new(crate::plc::ConnectionManager::new(
            &config,
            &crate::connection::Args::default(),
        ));
        let executor = Executor::new(TagService::new(config.clone(), manager));
        let set = ProcedureSet::parse(
            &single("      - { name: a, type: wait, seconds: 5 }\n      - { name: b, type: wait, seconds: 0.5 }\n"),
            &config,
        )
        .unwrap();
        let result = executor.run(set.get("p").unwrap()).await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.total_steps, 2);
        assert_eq!(result.successful_steps, 2);
        assert_eq!(result.step_results[0].data, Some(StepData::Seconds(5.0)));
        assert!(result.execution_time_ms >= 5500);
    }

    #[tokio::test(start_paused = true)]
    async fn step_budget_stops_cycles() {
        let config = std::sync::Arc::new(plant());
        let manager = std::sync::Arc::new(crate::plc::ConnectionManager::new(
            &config,
            &crate::connection::Args::default(),
        ));
        let executor = Executor::new(TagService::new(config.clone(), manager)).with_step_budget(3);
        let set = ProcedureSet::parse(
            &single("      - { name: a, type: wait, seconds: 1 }\n      - { name: b, type: wait, seconds: 1 }\n      - { name: c, type: wait, seconds: 1 }\n      - { name: d, type: wait, seconds: 1 }\n"),
            &config,
        )
        .unwrap();
        let result = executor.run(set.get("p").unwrap()).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.total_steps, 3);
        assert_eq!(result.failed_steps, 0);
        assert!(result.error_message.unwrap().contains("`d`"));
    }
}
