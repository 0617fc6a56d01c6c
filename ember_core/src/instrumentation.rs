use crate::coverage::CoverageError;
use crate::dbt::DbtInstrumentation;
use crate::state::{self, StateError};
use crate::supervisor::ForkServerError;
use bincode::{Decode, Encode};
use log::{debug, warn};
use nix::unistd::Pid;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::fmt;
use std::io::{self, Seek, SeekFrom, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InstrumentationError {
    #[error("Unknown instrumentation kind {0:?}")]
    UnknownKind(String),
    #[error("Invalid instrumentation options: {0}")]
    Options(String),
    #[error("Command line is empty")]
    EmptyCommand,
    #[error("Failed to launch target: {0}")]
    Launch(#[source] io::Error),
    #[error("Failed to deliver input: {0}")]
    Input(#[source] io::Error),
    #[error("Cannot merge {ours} state with {theirs} state")]
    Incompatible {
        ours: &'static str,
        theirs: &'static str,
    },
    #[error(transparent)]
    ForkServer(#[from] ForkServerError),
    #[error(transparent)]
    Coverage(#[from] CoverageError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Classification of the most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum FuzzResult {
    Normal,
    Crash,
    Hang,
    Other,
}

impl FuzzResult {
    /// Classifies a child that ran to completion. Exiting with any code is
    /// normal; dying from a signal is a crash.
    pub fn from_exit_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        if status.code().is_some() {
            FuzzResult::Normal
        } else if status.signal().is_some() {
            FuzzResult::Crash
        } else {
            FuzzResult::Other
        }
    }
}

impl fmt::Display for FuzzResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FuzzResult::Normal => "normal",
            FuzzResult::Crash => "crash",
            FuzzResult::Hang => "hang",
            FuzzResult::Other => "other",
        };
        f.write_str(name)
    }
}

/// A way of running the target and observing what it did.
///
/// Every operation on a live backend either succeeds or leaves the backend
/// as it was before the call, so a failed `enable` can simply be retried.
pub trait Instrumentation: Send {
    fn kind(&self) -> InstrumentationKind;

    /// Runs the target once on `input` and returns the pid that executed it.
    /// `command_line` is split on whitespace; `@@` stands for a file that
    /// holds the input.
    fn enable(&mut self, command_line: &str, input: &[u8]) -> Result<Pid, InstrumentationError>;

    /// Whether the last run reached a location no earlier run reached.
    fn is_new_path(&self) -> bool;

    /// Outcome of the last run, `None` before the first one.
    fn fuzz_result(&self) -> Option<FuzzResult>;

    fn get_state(&self) -> Result<Vec<u8>, InstrumentationError>;

    /// Replaces the backend's knowledge with a blob from [`get_state`].
    /// Nothing changes if the blob is rejected.
    ///
    /// [`get_state`]: Instrumentation::get_state
    fn set_state(&mut self, state: &[u8]) -> Result<(), InstrumentationError>;

    /// A fresh backend knowing everything `self` and `other` know. Neither
    /// input is modified.
    fn merge(
        &self,
        other: &dyn Instrumentation,
    ) -> Result<Box<dyn Instrumentation>, InstrumentationError>;

    /// Releases processes and shared resources. Calling it twice is harmless.
    fn cleanup(&mut self);

    fn as_any(&self) -> &dyn Any;

    fn help(&self) -> &'static str {
        self.kind().help()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentationKind {
    /// Fork server with a shared coverage map.
    Dbt,
    /// One process per run, classified by how it exits.
    ReturnCode,
}

impl InstrumentationKind {
    pub fn name(self) -> &'static str {
        match self {
            InstrumentationKind::Dbt => "dbt",
            InstrumentationKind::ReturnCode => "return_code",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            InstrumentationKind::Dbt => DbtInstrumentation::HELP,
            InstrumentationKind::ReturnCode => ReturnCodeInstrumentation::HELP,
        }
    }
}

impl FromStr for InstrumentationKind {
    type Err = InstrumentationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dbt" => Ok(InstrumentationKind::Dbt),
            "return_code" => Ok(InstrumentationKind::ReturnCode),
            other => Err(InstrumentationError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for InstrumentationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Builds a backend from its options string, restoring `prior_state` if one
/// is given.
pub fn create(
    kind: InstrumentationKind,
    options: &str,
    prior_state: Option<&[u8]>,
) -> Result<Box<dyn Instrumentation>, InstrumentationError> {
    let mut backend: Box<dyn Instrumentation> = match kind {
        InstrumentationKind::Dbt => Box::new(DbtInstrumentation::new(parse_options(options)?)?),
        InstrumentationKind::ReturnCode => {
            Box::new(ReturnCodeInstrumentation::new(parse_options(options)?))
        }
    };
    if let Some(blob) = prior_state {
        backend.set_state(blob)?;
    }
    debug!("created {kind} instrumentation");
    Ok(backend)
}

/// Parses a JSON options object. Blank means all defaults.
pub(crate) fn parse_options<T>(options: &str) -> Result<T, InstrumentationError>
where
    T: DeserializeOwned + Default,
{
    if options.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(options).map_err(|e| InstrumentationError::Options(e.to_string()))
}

/// Temp file holding the current input.
///
/// Targets get it both as `@@` and as stdin. The stdin handle shares the file
/// offset with this one, so rewinding here rewinds the target's stdin too.
#[derive(Debug)]
pub(crate) struct InputFile {
    file: NamedTempFile,
}

impl InputFile {
    pub(crate) fn new() -> Result<Self, InstrumentationError> {
        let file = NamedTempFile::new().map_err(InstrumentationError::Input)?;
        Ok(Self { file })
    }

    /// Replaces the contents with `input` and rewinds.
    pub(crate) fn store(&mut self, input: &[u8]) -> Result<(), InstrumentationError> {
        let file = self.file.as_file_mut();
        let write = |f: &mut std::fs::File| -> io::Result<()> {
            f.set_len(0)?;
            f.seek(SeekFrom::Start(0))?;
            f.write_all(input)?;
            f.flush()?;
            f.seek(SeekFrom::Start(0))?;
            Ok(())
        };
        write(file).map_err(InstrumentationError::Input)
    }

    pub(crate) fn stdin(&self) -> Result<Stdio, InstrumentationError> {
        let shared = self
            .file
            .as_file()
            .try_clone()
            .map_err(InstrumentationError::Input)?;
        Ok(Stdio::from(shared))
    }

    /// Splits `command_line` into argv, substituting `@@` with this file.
    pub(crate) fn argv(&self, command_line: &str) -> Result<Vec<String>, InstrumentationError> {
        let path = self.file.path().to_string_lossy();
        let argv: Vec<String> = command_line
            .split_whitespace()
            .map(|part| part.replace("@@", &path))
            .collect();
        if argv.is_empty() {
            return Err(InstrumentationError::EmptyCommand);
        }
        Ok(argv)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ReturnCodeOptions {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

pub(crate) fn default_timeout_ms() -> u64 {
    2000
}

impl Default for ReturnCodeOptions {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Encode, Decode, Debug, Clone, Default, PartialEq, Eq)]
struct ReturnCodeState {
    last_result: Option<FuzzResult>,
    executions: u64,
}

/// Launches a fresh process for every run and only looks at how it ended.
/// There is no coverage, so no run is ever a new path.
pub struct ReturnCodeInstrumentation {
    options: ReturnCodeOptions,
    state: ReturnCodeState,
    input_file: Option<InputFile>,
}

impl ReturnCodeInstrumentation {
    const VARIANT: &'static str = "return_code";
    const VERSION: u16 = 1;

    pub const HELP: &'static str = "\
return_code - runs the target once per input and classifies its exit
Options (JSON object):
  timeout-ms   milliseconds before a run is killed and reported as a hang (default 2000)
";

    pub fn new(options: ReturnCodeOptions) -> Self {
        Self {
            options,
            state: ReturnCodeState::default(),
            input_file: None,
        }
    }

    pub fn executions(&self) -> u64 {
        self.state.executions
    }

    fn wait_with_timeout(&self, child: &mut Child) -> Result<Option<ExitStatus>, io::Error> {
        let timeout = Duration::from_millis(self.options.timeout_ms);
        let start_time = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if start_time.elapsed() > timeout {
                debug!("target {} timed out, killing", child.id());
                if let Err(e) = child.kill() {
                    warn!("failed to kill timed-out target {}: {e}", child.id());
                }
                child.wait()?;
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Instrumentation for ReturnCodeInstrumentation {
    fn kind(&self) -> InstrumentationKind {
        InstrumentationKind::ReturnCode
    }

    fn enable(&mut self, command_line: &str, input: &[u8]) -> Result<Pid, InstrumentationError> {
        let input_file = match &mut self.input_file {
            Some(file) => file,
            empty => empty.insert(InputFile::new()?),
        };
        input_file.store(input)?;
        let argv = input_file.argv(command_line)?;

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(input_file.stdin()?)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(InstrumentationError::Launch)?;
        let pid = Pid::from_raw(child.id() as i32);

        let result = match self.wait_with_timeout(&mut child) {
            Ok(Some(status)) => FuzzResult::from_exit_status(status),
            Ok(None) => FuzzResult::Hang,
            Err(e) => {
                warn!("error waiting for target {pid}: {e}");
                FuzzResult::Other
            }
        };
        self.state.last_result = Some(result);
        self.state.executions += 1;
        Ok(pid)
    }

    fn is_new_path(&self) -> bool {
        false
    }

    fn fuzz_result(&self) -> Option<FuzzResult> {
        self.state.last_result
    }

    fn get_state(&self) -> Result<Vec<u8>, InstrumentationError> {
        Ok(state::encode(Self::VARIANT, Self::VERSION, &self.state)?)
    }

    fn set_state(&mut self, blob: &[u8]) -> Result<(), InstrumentationError> {
        self.state = state::decode(Self::VARIANT, Self::VERSION, blob)?;
        Ok(())
    }

    fn merge(
        &self,
        other: &dyn Instrumentation,
    ) -> Result<Box<dyn Instrumentation>, InstrumentationError> {
        let Some(other) = other.as_any().downcast_ref::<ReturnCodeInstrumentation>() else {
            return Err(InstrumentationError::Incompatible {
                ours: self.kind().name(),
                theirs: other.kind().name(),
            });
        };
        let mut merged = ReturnCodeInstrumentation::new(self.options.clone());
        merged.state.executions = self.state.executions + other.state.executions;
        Ok(Box::new(merged))
    }

    fn cleanup(&mut self) {
        self.input_file = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
