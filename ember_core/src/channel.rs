//! Pipes with an explicit owner role.
//!
//! Every pipe end is tagged with the side that keeps it once the process
//! tree has been split, so the irrelevant end is dropped (and closed) at
//! exactly one place instead of through ad-hoc `close` calls.

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Which side of a spawn keeps a pipe end, and in which direction it flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    ParentRead,
    ParentWrite,
    ChildRead,
    ChildWrite,
}

impl ChannelRole {
    pub fn is_read(self) -> bool {
        matches!(self, ChannelRole::ParentRead | ChannelRole::ChildRead)
    }

    pub fn is_parent(self) -> bool {
        matches!(self, ChannelRole::ParentRead | ChannelRole::ParentWrite)
    }
}

/// One unidirectional pipe, both ends still open.
#[derive(Debug)]
pub struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    /// Opens a close-on-exec pipe. Descriptors that must survive an `exec`
    /// are re-bound with `dup2`, which clears the flag on the copy.
    pub fn open() -> io::Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        Ok(Self { read, write })
    }

    /// Keeps the end matching `role` and closes the other one.
    pub fn into_end(self, role: ChannelRole) -> PipeEnd {
        let fd = if role.is_read() { self.read } else { self.write };
        PipeEnd { role, fd }
    }

    /// Splits the pipe so that data flows from the side owning `writer` to
    /// the side owning the returned read end.
    fn split(self, writer: ChannelRole, reader: ChannelRole) -> (PipeEnd, PipeEnd) {
        (
            PipeEnd { role: writer, fd: self.write },
            PipeEnd { role: reader, fd: self.read },
        )
    }
}

/// An owned pipe end and the role it was assigned.
#[derive(Debug)]
pub struct PipeEnd {
    role: ChannelRole,
    fd: OwnedFd,
}

impl PipeEnd {
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn into_file(self) -> File {
        File::from(self.fd)
    }

    pub fn into_owned_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsRawFd for PipeEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// The ends of a bidirectional channel held by one side.
#[derive(Debug)]
pub struct ChannelHalf {
    pub read: PipeEnd,
    pub write: PipeEnd,
}

/// Two pipes forming a bidirectional channel between a parent and a child.
#[derive(Debug)]
pub struct Channel {
    downstream: Pipe,
    upstream: Pipe,
}

impl Channel {
    pub fn open() -> io::Result<Self> {
        Ok(Self {
            downstream: Pipe::open()?,
            upstream: Pipe::open()?,
        })
    }

    /// Returns `(parent, child)` halves. The parent writes downstream and
    /// reads upstream; the child does the opposite.
    pub fn split(self) -> (ChannelHalf, ChannelHalf) {
        let (parent_write, child_read) = self
            .downstream
            .split(ChannelRole::ParentWrite, ChannelRole::ChildRead);
        let (child_write, parent_read) = self
            .upstream
            .split(ChannelRole::ChildWrite, ChannelRole::ParentRead);
        (
            ChannelHalf { read: parent_read, write: parent_write },
            ChannelHalf { read: child_read, write: child_write },
        )
    }
}
