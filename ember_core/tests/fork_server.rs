//! Drives a real fork server in a forked copy of the test process.

use ember_core::protocol::{self, Command, HELLO};
use ember_core::{
    BlockKey, Channel, ChannelHalf, ForkChild, ForkServer, ForkServerClient, NullCache,
    ServeOutcome, TranslationCache,
};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use std::io::Write;
use std::sync::{Mutex, MutexGuard};

// Forking while other test threads allocate is not safe.
static FORK_LOCK: Mutex<()> = Mutex::new(());

/// Blocks translated by the primed process. Only ever touched in forked
/// servers and their children, each of which has its own copy.
static TRANSLATED: Mutex<Vec<BlockKey>> = Mutex::new(Vec::new());

fn translated() -> MutexGuard<'static, Vec<BlockKey>> {
    TRANSLATED.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keeps translations in process memory, so fork children inherit them.
struct InheritedCache;

impl TranslationCache for InheritedCache {
    type Block = BlockKey;

    fn lookup(&self, key: &BlockKey) -> Option<BlockKey> {
        translated().iter().find(|block| *block == key).copied()
    }

    fn translate(&mut self, key: &BlockKey) -> Option<BlockKey> {
        translated().push(*key);
        Some(*key)
    }

    fn is_invalid(&self, _block: &BlockKey) -> bool {
        false
    }

    fn chain(&mut self, _source: &BlockKey, _exit_slot: u32, _target: &BlockKey) {}
}

/// Released fork children exit with `10 * iteration`.
fn exit_with_iteration(child: ForkChild) -> i32 {
    10 * child.iteration as i32
}

fn spawn_server() -> (Pid, ChannelHalf) {
    spawn_server_with(NullCache, exit_with_iteration)
}

/// Forks a process serving on a fresh channel and returns it with the
/// supervisor's half. A released fork child exits with what `release`
/// returns for it.
fn spawn_server_with<C: TranslationCache>(
    cache: C,
    release: fn(ForkChild) -> i32,
) -> (Pid, ChannelHalf) {
    let (parent, server) = Channel::open().unwrap().split();
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            drop(parent);
            let commands = server.read.into_file();
            let replies = server.write.into_file();
            let served = ForkServer::new(commands, replies, cache).serve();
            let code = match served {
                Ok(ServeOutcome::Child(child)) => release(child),
                Ok(ServeOutcome::Terminate(code)) => code,
                Ok(ServeOutcome::Standalone) => 50,
                Err(fault) => fault.exit_code(),
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => (child, parent),
    }
}

fn server_exit_code(pid: Pid) -> i32 {
    match waitpid(pid, None).unwrap() {
        WaitStatus::Exited(_, code) => code,
        other => panic!("fork server ended with {other:?}"),
    }
}

#[test]
fn runs_are_reported_in_order() {
    let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (server_pid, parent) = spawn_server();

    let mut client =
        ForkServerClient::connect(parent.write.into_file(), parent.read.into_file(), None).unwrap();
    for iteration in 0..3 {
        let child = client.fork_run().unwrap();
        assert_ne!(child, server_pid);
        let status = client.get_status().unwrap();
        assert_eq!(status.exit_code(), Some(10 * iteration));
    }
    client.exit().unwrap();
    assert_eq!(server_exit_code(server_pid), 0);
}

#[test]
fn clean_exit_is_relayed_as_a_zero_status_word() {
    let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (server_pid, parent) = spawn_server();

    let mut client =
        ForkServerClient::connect(parent.write.into_file(), parent.read.into_file(), None).unwrap();
    client.fork_run().unwrap();
    let status = client.get_status().unwrap();
    assert_eq!(status.raw(), 0);
    assert!(status.is_clean_exit());
    client.exit().unwrap();
    assert_eq!(server_exit_code(server_pid), 0);
}

const WARM_PC: u64 = 0x4000;

/// The first child asks for a translation; every child reports whether the
/// block was already in the cache it inherited by exiting with 11 (warm) or
/// 10 (cold).
fn request_then_report(mut child: ForkChild) -> i32 {
    let block = BlockKey::new(WARM_PC, 0, 0);
    let warm = translated().contains(&block);
    if child.iteration == 0 {
        child.sync.request(block, None);
    }
    if warm { 11 } else { 10 }
}

#[test]
fn translations_reach_the_next_child() {
    let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (server_pid, parent) = spawn_server_with(InheritedCache, request_then_report);

    let mut client =
        ForkServerClient::connect(parent.write.into_file(), parent.read.into_file(), None).unwrap();
    let mut codes = Vec::new();
    for _ in 0..3 {
        client.fork_run().unwrap();
        codes.push(client.get_status().unwrap().exit_code());
    }
    assert_eq!(codes, vec![Some(10), Some(11), Some(11)]);
    client.exit().unwrap();
    assert_eq!(server_exit_code(server_pid), 0);
}

#[test]
fn legacy_commands_stop_the_server() {
    let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    for command in [Command::Exit, Command::Run, Command::Fork] {
        let (server_pid, parent) = spawn_server();

        let mut replies = parent.read.into_file();
        assert_eq!(protocol::read_i32(&mut replies).unwrap(), HELLO);
        let mut commands = parent.write.into_file();
        commands.write_all(&[command.as_byte()]).unwrap();
        assert_eq!(server_exit_code(server_pid), 0, "{command:?}");
    }
}

#[test]
fn protocol_violations_end_the_server() {
    let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    for raw in [Command::GetStatus.as_byte(), 0x7f] {
        let (server_pid, parent) = spawn_server();

        let mut replies = parent.read.into_file();
        assert_eq!(protocol::read_i32(&mut replies).unwrap(), HELLO);
        let mut commands = parent.write.into_file();
        commands.write_all(&[raw]).unwrap();
        assert_eq!(server_exit_code(server_pid), 5, "command byte {raw:#x}");
    }
}

#[test]
fn closed_command_channel_ends_the_server() {
    let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (server_pid, parent) = spawn_server();

    let mut replies = parent.read.into_file();
    assert_eq!(protocol::read_i32(&mut replies).unwrap(), HELLO);
    drop(parent.write);
    assert_eq!(server_exit_code(server_pid), 1);
}
