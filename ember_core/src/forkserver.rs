//! Primed-process side of the fork server.
//!
//! The target calls [`ForkServer::run`] once at its entry point. In the primed
//! parent the call never returns: it answers commands, forks one child per
//! run and mirrors translation work reported by that child. The only path
//! that returns is the fork child, which then runs the target normally.

use crate::channel::{ChannelRole, Pipe};
use crate::protocol::{self, Command, FORKSRV_FD, FORKSRV_REPLY_FD, HELLO};
use crate::tsl::{self, TranslationCache, TslProducer};
use log::{debug, trace};
use nix::unistd::{ForkResult, Pid, fork};
use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;
use thiserror::Error;

/// Fatal conditions on the server side. Each one ends the primed process.
#[derive(Error, Debug)]
pub enum ServerFault {
    #[error("Command channel failed: {0}")]
    Channel(#[source] io::Error),
    #[error("Failed to create translation sync pipe: {0}")]
    Pipe(#[source] io::Error),
    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::Error),
    #[error("Failed to reap child: {0}")]
    Wait(#[source] io::Error),
    #[error("Protocol violation: {0}")]
    Protocol(&'static str),
}

impl ServerFault {
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerFault::Channel(_) | ServerFault::Wait(_) => 1,
            ServerFault::Pipe(_) => 3,
            ServerFault::Fork(_) => 4,
            ServerFault::Protocol(_) => 5,
        }
    }
}

/// Handed to the fork child when it is released to run the target.
#[derive(Debug)]
pub struct ForkChild {
    /// Zero-based index of this run within the primed process' lifetime.
    pub iteration: u64,
    /// Channel for reporting translations back to the primed parent.
    pub sync: TslProducer,
}

#[derive(Debug)]
pub enum ServeOutcome {
    /// Nobody answered the hello; run the target once, unsupervised.
    Standalone,
    /// This process is a fork child and should run the target.
    Child(ForkChild),
    /// The supervisor asked the primed process to stop.
    Terminate(i32),
}

pub struct ForkServer<C: TranslationCache> {
    commands: File,
    replies: File,
    cache: C,
    last_child: Option<Pid>,
    iteration: u64,
}

impl<C: TranslationCache> ForkServer<C> {
    pub fn new(commands: File, replies: File, cache: C) -> Self {
        Self {
            commands,
            replies,
            cache,
            last_child: None,
            iteration: 0,
        }
    }

    /// Takes over the descriptors a supervisor leaves at the well-known
    /// numbers. Returns `None` if they were not inherited.
    pub fn from_inherited(cache: C) -> Option<Self> {
        for fd in [FORKSRV_FD, FORKSRV_REPLY_FD] {
            if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
                return None;
            }
        }
        // Both descriptors are open and nothing else in this process owns them.
        let (commands, replies) = unsafe {
            (
                File::from_raw_fd(FORKSRV_FD),
                File::from_raw_fd(FORKSRV_REPLY_FD),
            )
        };
        Some(Self::new(commands, replies, cache))
    }

    /// Serves commands until this process has to leave the loop. Never exits
    /// the process itself; see [`ForkServer::run`] for that.
    pub fn serve(mut self) -> Result<ServeOutcome, ServerFault> {
        if protocol::write_i32(&mut self.replies, HELLO).is_err() {
            debug!("fork server: no supervisor attached, running standalone");
            return Ok(ServeOutcome::Standalone);
        }

        loop {
            let command = match protocol::read_command(&mut self.commands) {
                Ok(command) => command,
                Err(e) => return Err(ServerFault::Channel(e)),
            };

            match command {
                Some(Command::ForkRun) => {
                    if let Some(child) = self.fork_run()? {
                        return Ok(ServeOutcome::Child(child));
                    }
                }
                Some(Command::GetStatus) => self.relay_status()?,
                // Only the combined fork+run is implemented.
                Some(Command::Exit) | Some(Command::Run) | Some(Command::Fork) => {
                    return Ok(ServeOutcome::Terminate(0));
                }
                None => return Err(ServerFault::Protocol("unknown command")),
            }
        }
    }

    /// Serves commands and exits the process on anything but a released fork
    /// child. Returns `None` when no supervisor is attached.
    pub fn run(self) -> Option<ForkChild> {
        match self.serve() {
            Ok(ServeOutcome::Standalone) => None,
            Ok(ServeOutcome::Child(child)) => Some(child),
            Ok(ServeOutcome::Terminate(code)) => std::process::exit(code),
            Err(fault) => {
                debug!("fork server: {fault}");
                std::process::exit(fault.exit_code())
            }
        }
    }

    fn fork_run(&mut self) -> Result<Option<ForkChild>, ServerFault> {
        let pipe = Pipe::open().map_err(ServerFault::Pipe)?;
        let iteration = self.iteration;
        self.iteration += 1;

        match unsafe { fork() }.map_err(ServerFault::Fork)? {
            ForkResult::Child => {
                let sync = pipe.into_end(ChannelRole::ChildWrite).into_file();
                Ok(Some(ForkChild {
                    iteration,
                    sync: TslProducer::new(sync),
                }))
            }
            ForkResult::Parent { child } => {
                let reader = pipe.into_end(ChannelRole::ParentRead).into_file();
                self.last_child = Some(child);
                protocol::write_i32(&mut self.replies, child.as_raw())
                    .map_err(ServerFault::Channel)?;

                let stats = tsl::service(reader, &mut self.cache);
                trace!("fork server: child {child} done, translation sync {stats:?}");
                Ok(None)
            }
        }
    }

    fn relay_status(&mut self) -> Result<(), ServerFault> {
        let child = self
            .last_child
            .take()
            .ok_or(ServerFault::Protocol("status requested with no child to reap"))?;
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(child.as_raw(), &mut status, 0) };
        if rc < 0 {
            return Err(ServerFault::Wait(io::Error::last_os_error()));
        }
        protocol::write_i32(&mut self.replies, status).map_err(ServerFault::Channel)
    }
}
