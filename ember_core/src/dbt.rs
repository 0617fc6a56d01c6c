//! Fork-server backend with a shared coverage map.
//!
//! The target (optionally under a binary translator given as `emulator`) is
//! launched once with the command channel on the well-known descriptors and
//! the coverage segment named in its environment. Every `enable` after that
//! costs one fork in the primed process.

use crate::channel::Channel;
use crate::coverage::{CoverageRegion, MAP_SIZE, NewBits, VirginMap};
use crate::instrumentation::{
    FuzzResult, InputFile, Instrumentation, InstrumentationError, InstrumentationKind,
    default_timeout_ms,
};
use crate::protocol::{FORKSRV_FD, FORKSRV_REPLY_FD};
use crate::state::{self, StateError};
use crate::supervisor::ForkServerClient;
use crate::tracer::TraceConfig;
use bincode::{Decode, Encode};
use log::{debug, info, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Deserialize;
use std::any::Any;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DbtOptions {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_handshake_ms")]
    pub handshake_timeout_ms: u64,
    /// Percentage of the map that records, clamped by the target to `1..=100`.
    #[serde(default)]
    pub inst_ratio: Option<u32>,
    #[serde(default)]
    pub instrument_libraries: bool,
    /// Program and arguments placed in front of the target command line.
    #[serde(default)]
    pub emulator: Vec<String>,
}

fn default_handshake_ms() -> u64 {
    10_000
}

impl Default for DbtOptions {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            handshake_timeout_ms: default_handshake_ms(),
            inst_ratio: None,
            instrument_libraries: false,
            emulator: Vec::new(),
        }
    }
}

#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
struct DbtState {
    virgin: Vec<u8>,
    last_result: Option<FuzzResult>,
    new_path: bool,
    executions: u64,
}

/// A running primed process.
#[derive(Debug)]
struct PrimedTarget {
    command_line: String,
    process: Child,
    client: ForkServerClient,
}

impl PrimedTarget {
    fn shutdown(mut self) {
        if let Some(child) = self.client.child() {
            let _ = kill(child, Signal::SIGKILL);
        }
        if let Err(e) = self.client.exit() {
            debug!("fork server did not take the exit command: {e}");
        }
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

pub struct DbtInstrumentation {
    options: DbtOptions,
    region: Option<CoverageRegion>,
    virgin: VirginMap,
    input_file: Option<InputFile>,
    target: Option<PrimedTarget>,
    last_result: Option<FuzzResult>,
    new_path: bool,
    executions: u64,
}

impl DbtInstrumentation {
    const VARIANT: &'static str = "dbt";
    const VERSION: u16 = 1;

    pub const HELP: &'static str = "\
dbt - fork server with edge coverage in a shared memory map
Options (JSON object):
  timeout-ms             milliseconds before a run is killed and reported as a hang (default 2000)
  handshake-timeout-ms   milliseconds to wait for the target's fork server (default 10000)
  inst-ratio             percentage of the coverage map that records, 1-100 (default 100)
  instrument-libraries   record edges in shared libraries too (default false)
  emulator               argv prefix that runs the target, e.g. [\"qemu-x86_64\"] (default none)
";

    pub fn new(options: DbtOptions) -> Result<Self, InstrumentationError> {
        Ok(Self {
            options,
            region: Some(CoverageRegion::create(MAP_SIZE)?),
            virgin: VirginMap::new(MAP_SIZE),
            input_file: None,
            target: None,
            last_result: None,
            new_path: false,
            executions: 0,
        })
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    /// Locations seen by any run so far.
    pub fn locations_seen(&self) -> usize {
        self.virgin.count_seen()
    }

    /// Pid of the primed process, if one is running.
    pub fn server_pid(&self) -> Option<Pid> {
        self.target
            .as_ref()
            .map(|target| Pid::from_raw(target.process.id() as i32))
    }

    fn trace_config(&self) -> TraceConfig {
        TraceConfig {
            shm_id: self.region.as_ref().and_then(CoverageRegion::id),
            inst_ratio: self.options.inst_ratio.map(|ratio| ratio.clamp(1, 100)),
            instrument_libraries: self.options.instrument_libraries,
        }
    }

    fn launch(
        &self,
        command_line: &str,
        input_file: &InputFile,
    ) -> Result<PrimedTarget, InstrumentationError> {
        let mut argv = self.options.emulator.clone();
        argv.extend(input_file.argv(command_line)?);

        let (parent, child) = Channel::open()
            .map_err(InstrumentationError::Launch)?
            .split();
        let command_fd = child.read.as_raw_fd();
        let reply_fd = child.write.as_raw_fd();

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(self.trace_config().env_vars())
            .stdin(input_file.stdin()?)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Runs between fork and exec: only async-signal-safe calls.
        unsafe {
            command.pre_exec(move || install_channel(command_fd, reply_fd));
        }
        let mut process = command.spawn().map_err(InstrumentationError::Launch)?;
        drop(child);

        let handshake = Duration::from_millis(self.options.handshake_timeout_ms);
        match ForkServerClient::connect(
            parent.write.into_file(),
            parent.read.into_file(),
            Some(handshake),
        ) {
            Ok(client) => {
                info!("fork server up for {command_line:?} (pid {})", process.id());
                Ok(PrimedTarget {
                    command_line: command_line.to_string(),
                    process,
                    client,
                })
            }
            Err(e) => {
                let _ = process.kill();
                let _ = process.wait();
                Err(e.into())
            }
        }
    }

    fn shutdown_target(&mut self) {
        if let Some(target) = self.target.take() {
            debug!("stopping fork server for {:?}", target.command_line);
            target.shutdown();
        }
    }
}

/// Places the channel ends at the fork-server descriptors, without
/// close-on-exec. Both ends are first copied above those numbers so that
/// installing one never closes the other.
fn install_channel(command_fd: RawFd, reply_fd: RawFd) -> io::Result<()> {
    let command_fd = lift_fd(command_fd)?;
    let reply_fd = lift_fd(reply_fd)?;
    install_fd(command_fd, FORKSRV_FD)?;
    install_fd(reply_fd, FORKSRV_REPLY_FD)
}

fn lift_fd(fd: RawFd) -> io::Result<RawFd> {
    let lifted = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, FORKSRV_REPLY_FD + 1) };
    if lifted < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(lifted)
    }
}

fn install_fd(fd: RawFd, target: RawFd) -> io::Result<()> {
    if unsafe { libc::dup2(fd, target) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl Instrumentation for DbtInstrumentation {
    fn kind(&self) -> InstrumentationKind {
        InstrumentationKind::Dbt
    }

    fn enable(&mut self, command_line: &str, input: &[u8]) -> Result<Pid, InstrumentationError> {
        if self
            .target
            .as_ref()
            .is_some_and(|target| target.command_line != command_line)
        {
            self.shutdown_target();
        }
        if self.region.is_none() {
            self.region = Some(CoverageRegion::create(MAP_SIZE)?);
        }
        let mut input_file = match self.input_file.take() {
            Some(file) => file,
            None => InputFile::new()?,
        };
        let launched = match self.target.take() {
            Some(target) => Ok(target),
            None => self.launch(command_line, &input_file),
        };
        let stored = input_file.store(input);
        self.input_file = Some(input_file);
        let mut target = launched?;
        if let Err(e) = stored {
            self.target = Some(target);
            return Err(e);
        }

        if let Some(region) = self.region.as_mut() {
            region.clear();
        }

        let timeout = Duration::from_millis(self.options.timeout_ms);
        let run = target
            .client
            .fork_run()
            .and_then(|pid| Ok((pid, target.client.get_status_with_timeout(Some(timeout))?)));
        let (pid, status) = match run {
            Ok(run) => run,
            Err(e) => {
                warn!("fork server failed, it will be relaunched: {e}");
                target.shutdown();
                return Err(e.into());
            }
        };
        self.target = Some(target);

        let result = if status.timed_out {
            FuzzResult::Hang
        } else if status.status.signal().is_some() {
            FuzzResult::Crash
        } else if status.status.exit_code().is_some() {
            FuzzResult::Normal
        } else {
            FuzzResult::Other
        };

        let trace = self.region.as_ref().map(CoverageRegion::as_slice).unwrap_or(&[]);
        self.new_path = self.virgin.has_new_bits(trace) == NewBits::NewLocation;
        self.last_result = Some(result);
        self.executions += 1;
        debug!("run {pid}: {result}, new path: {}", self.new_path);
        Ok(pid)
    }

    fn is_new_path(&self) -> bool {
        self.new_path
    }

    fn fuzz_result(&self) -> Option<FuzzResult> {
        self.last_result
    }

    fn get_state(&self) -> Result<Vec<u8>, InstrumentationError> {
        let snapshot = DbtState {
            virgin: self.virgin.as_bytes().to_vec(),
            last_result: self.last_result,
            new_path: self.new_path,
            executions: self.executions,
        };
        Ok(state::encode(Self::VARIANT, Self::VERSION, &snapshot)?)
    }

    fn set_state(&mut self, blob: &[u8]) -> Result<(), InstrumentationError> {
        let snapshot: DbtState = state::decode(Self::VARIANT, Self::VERSION, blob)?;
        if snapshot.virgin.len() != MAP_SIZE {
            return Err(StateError::Invalid(format!(
                "coverage map has {} bytes, expected {MAP_SIZE}",
                snapshot.virgin.len()
            ))
            .into());
        }
        self.virgin = VirginMap::from_bytes(snapshot.virgin);
        self.last_result = snapshot.last_result;
        self.new_path = snapshot.new_path;
        self.executions = snapshot.executions;
        Ok(())
    }

    fn merge(
        &self,
        other: &dyn Instrumentation,
    ) -> Result<Box<dyn Instrumentation>, InstrumentationError> {
        let Some(other) = other.as_any().downcast_ref::<DbtInstrumentation>() else {
            return Err(InstrumentationError::Incompatible {
                ours: self.kind().name(),
                theirs: other.kind().name(),
            });
        };
        let mut merged = DbtInstrumentation::new(self.options.clone())?;
        merged.virgin = self.virgin.merge(&other.virgin);
        merged.executions = self.executions + other.executions;
        Ok(Box::new(merged))
    }

    fn cleanup(&mut self) {
        self.shutdown_target();
        self.input_file = None;
        self.region = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for DbtInstrumentation {
    fn drop(&mut self) {
        self.cleanup();
    }
}
