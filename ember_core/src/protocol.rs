//! Wire-level vocabulary shared by both ends of the command channel.
//!
//! The protocol is closed and versionless: the supervisor and the primed
//! process must agree on the byte values below ahead of time.

use std::io::{self, Read, Write};

/// Descriptor on which the primed process reads commands from the supervisor.
pub const FORKSRV_FD: i32 = 198;
/// Descriptor on which the primed process writes replies to the supervisor.
pub const FORKSRV_REPLY_FD: i32 = FORKSRV_FD + 1;

/// Sentinel the primed process writes once it is ready to take commands.
pub const HELLO: i32 = 0x4141_4141;

/// A single-byte command sent from the supervisor to the primed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Terminate the primed process.
    Exit = 0,
    /// Run the target once without forking. Only kept for compatibility.
    Run = 1,
    /// Fork without running. Only kept for compatibility.
    Fork = 2,
    /// Fork a fresh child and let it run the target.
    ForkRun = 3,
    /// Reap the most recent child and relay its raw wait status.
    GetStatus = 4,
}

impl Command {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Command::Exit),
            1 => Some(Command::Run),
            2 => Some(Command::Fork),
            3 => Some(Command::ForkRun),
            4 => Some(Command::GetStatus),
            _ => None,
        }
    }
}

/// Raw status word as produced by `waitpid(2)` in the primed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStatusWord(pub i32);

impl WaitStatusWord {
    pub fn raw(self) -> i32 {
        self.0
    }

    /// Exit code if the child terminated through `exit`.
    pub fn exit_code(self) -> Option<i32> {
        if libc::WIFEXITED(self.0) {
            Some(libc::WEXITSTATUS(self.0))
        } else {
            None
        }
    }

    /// Signal number if the child was terminated by a signal.
    pub fn signal(self) -> Option<i32> {
        if libc::WIFSIGNALED(self.0) {
            Some(libc::WTERMSIG(self.0))
        } else {
            None
        }
    }

    pub fn is_clean_exit(self) -> bool {
        self.exit_code() == Some(0)
    }
}

/// Reads one native-endian 4-byte integer. A short read surfaces as
/// `UnexpectedEof`.
pub fn read_i32<R: Read + ?Sized>(reader: &mut R) -> io::Result<i32> {
    let mut word = [0u8; 4];
    reader.read_exact(&mut word)?;
    Ok(i32::from_ne_bytes(word))
}

pub fn write_i32<W: Write + ?Sized>(writer: &mut W, value: i32) -> io::Result<()> {
    writer.write_all(&value.to_ne_bytes())?;
    writer.flush()
}

/// Reads one command byte. `Ok(None)` means the byte was not a known command.
pub fn read_command<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<Command>> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    Ok(Command::from_byte(byte[0]))
}

pub fn write_command<W: Write + ?Sized>(writer: &mut W, command: Command) -> io::Result<()> {
    writer.write_all(&[command.as_byte()])?;
    writer.flush()
}
