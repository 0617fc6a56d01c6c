//! Fuzzer side of the fork-server command channel.

use crate::protocol::{self, Command, HELLO, WaitStatusWord};
use log::{debug, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    /// A command byte is out and its reply has not been read yet.
    AwaitingCommandAck,
    ChildRunning,
    AwaitingStatus,
    /// The primed process stopped answering. Only relaunching helps.
    Dead,
}

#[derive(Error, Debug)]
pub enum ForkServerError {
    #[error("Fork server sent {found:#x} instead of the hello sentinel")]
    BadHello { found: i32 },
    #[error("Fork server did not say hello within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Fork server is gone: {0}")]
    TargetDied(#[source] io::Error),
    #[error("{command:?} cannot be issued while the fork server is {state:?}")]
    OutOfOrder {
        command: Command,
        state: SupervisorState,
    },
    #[error("Fork server reported invalid child pid {0}")]
    InvalidPid(i32),
    #[error("Failed to wait for the fork server: {0}")]
    Poll(#[source] io::Error),
}

/// Outcome of one `GET_STATUS` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStatus {
    pub status: WaitStatusWord,
    /// The child was killed because it outlived its time budget.
    pub timed_out: bool,
}

#[derive(Debug)]
pub struct ForkServerClient {
    commands: File,
    replies: File,
    state: SupervisorState,
    child: Option<Pid>,
}

impl ForkServerClient {
    /// Waits for the hello sentinel on `replies`, at most `timeout` if given.
    pub fn connect(
        commands: File,
        mut replies: File,
        timeout: Option<Duration>,
    ) -> Result<Self, ForkServerError> {
        if let Some(budget) = timeout {
            if !wait_readable(&replies, budget).map_err(ForkServerError::Poll)? {
                return Err(ForkServerError::HandshakeTimeout(budget));
            }
        }
        let hello = protocol::read_i32(&mut replies).map_err(ForkServerError::TargetDied)?;
        if hello != HELLO {
            return Err(ForkServerError::BadHello { found: hello });
        }
        debug!("fork server: handshake complete");
        Ok(Self {
            commands,
            replies,
            state: SupervisorState::Idle,
            child: None,
        })
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Pid of the child started by the last `FORK_RUN`, until it is reaped.
    pub fn child(&self) -> Option<Pid> {
        self.child
    }

    /// Starts one run. Only valid when idle.
    pub fn fork_run(&mut self) -> Result<Pid, ForkServerError> {
        self.expect_state(Command::ForkRun, SupervisorState::Idle)?;
        self.send(Command::ForkRun)?;

        let raw = self.read_reply()?;
        if raw <= 0 {
            self.state = SupervisorState::Dead;
            return Err(ForkServerError::InvalidPid(raw));
        }
        let pid = Pid::from_raw(raw);
        self.child = Some(pid);
        self.state = SupervisorState::ChildRunning;
        Ok(pid)
    }

    /// Reaps the running child, blocking until it exits.
    pub fn get_status(&mut self) -> Result<WaitStatusWord, ForkServerError> {
        self.get_status_with_timeout(None).map(|run| run.status)
    }

    /// Reaps the running child. If `timeout` elapses first, the child is
    /// killed and the status of the killed child is returned.
    pub fn get_status_with_timeout(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<RunStatus, ForkServerError> {
        self.expect_state(Command::GetStatus, SupervisorState::ChildRunning)?;
        self.send(Command::GetStatus)?;
        self.state = SupervisorState::AwaitingStatus;

        let mut timed_out = false;
        if let Some(budget) = timeout {
            let ready = wait_readable(&self.replies, budget).map_err(|e| {
                self.state = SupervisorState::Dead;
                ForkServerError::Poll(e)
            })?;
            if !ready {
                timed_out = true;
                if let Some(child) = self.child {
                    debug!("fork server: child {child} timed out, killing");
                    if let Err(e) = kill(child, Signal::SIGKILL) {
                        warn!("fork server: failed to kill child {child}: {e}");
                    }
                }
            }
        }

        let raw = self.read_reply()?;
        self.child = None;
        self.state = SupervisorState::Idle;
        Ok(RunStatus {
            status: WaitStatusWord(raw),
            timed_out,
        })
    }

    /// Asks the primed process to terminate. The server drops the channel
    /// without replying.
    pub fn exit(mut self) -> Result<(), ForkServerError> {
        self.expect_state(Command::Exit, SupervisorState::Idle)?;
        self.send(Command::Exit)
    }

    fn expect_state(
        &self,
        command: Command,
        expected: SupervisorState,
    ) -> Result<(), ForkServerError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ForkServerError::OutOfOrder {
                command,
                state: self.state,
            })
        }
    }

    fn send(&mut self, command: Command) -> Result<(), ForkServerError> {
        self.state = SupervisorState::AwaitingCommandAck;
        protocol::write_command(&mut self.commands, command).map_err(|e| {
            self.state = SupervisorState::Dead;
            ForkServerError::TargetDied(e)
        })
    }

    fn read_reply(&mut self) -> Result<i32, ForkServerError> {
        protocol::read_i32(&mut self.replies).map_err(|e| {
            self.state = SupervisorState::Dead;
            ForkServerError::TargetDied(e)
        })
    }
}

/// Returns `false` if nothing became readable on `file` within `budget`.
fn wait_readable(file: &File, budget: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = remaining.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let mut pfd = libc::pollfd {
            fd: file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        match unsafe { libc::poll(&mut pfd, 1, millis) } {
            0 => return Ok(false),
            n if n > 0 => return Ok(true),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }
}
