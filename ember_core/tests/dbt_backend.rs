//! End-to-end runs of the fork-server backend against `forkserver_target`.

use ember_core::instrumentation::{self, InstrumentationKind};
use ember_core::{DbtInstrumentation, DbtOptions, FuzzResult, Instrumentation};

const TARGET: &str = env!("CARGO_BIN_EXE_forkserver_target");

fn backend(timeout_ms: u64) -> DbtInstrumentation {
    DbtInstrumentation::new(DbtOptions {
        timeout_ms,
        ..DbtOptions::default()
    })
    .unwrap()
}

#[test]
fn first_run_is_new_and_repeats_are_not() {
    let mut dbt = backend(2000);
    let first = dbt.enable(TARGET, b"hello").unwrap();
    assert_eq!(dbt.fuzz_result(), Some(FuzzResult::Normal));
    assert!(dbt.is_new_path());

    let second = dbt.enable(TARGET, b"hello").unwrap();
    assert_ne!(first, second);
    assert_eq!(dbt.fuzz_result(), Some(FuzzResult::Normal));
    assert!(!dbt.is_new_path());

    dbt.enable(TARGET, b"Fxyz").unwrap();
    assert!(dbt.is_new_path());
    assert_eq!(dbt.executions(), 3);
}

#[test]
fn primed_process_survives_between_runs() {
    let mut dbt = backend(2000);
    dbt.enable(TARGET, b"a").unwrap();
    let server = dbt.server_pid();
    assert!(server.is_some());
    dbt.enable(TARGET, b"b").unwrap();
    assert_eq!(dbt.server_pid(), server);

    dbt.cleanup();
    assert!(dbt.server_pid().is_none());
    dbt.cleanup();
}

#[test]
fn crashes_and_hangs_are_classified() {
    let mut dbt = backend(300);
    dbt.enable(TARGET, b"FUZZ").unwrap();
    assert_eq!(dbt.fuzz_result(), Some(FuzzResult::Crash));
    assert!(dbt.is_new_path());

    dbt.enable(TARGET, b"HANG").unwrap();
    assert_eq!(dbt.fuzz_result(), Some(FuzzResult::Hang));

    // The primed process keeps serving after a killed run.
    dbt.enable(TARGET, b"ok").unwrap();
    assert_eq!(dbt.fuzz_result(), Some(FuzzResult::Normal));
}

#[test]
fn restored_state_remembers_coverage() {
    let mut original = backend(2000);
    original.enable(TARGET, b"FU").unwrap();
    let blob = original.get_state().unwrap();

    let mut restored =
        instrumentation::create(InstrumentationKind::Dbt, "", Some(blob.as_slice())).unwrap();
    restored.enable(TARGET, b"FU").unwrap();
    original.enable(TARGET, b"FU").unwrap();
    assert!(!restored.is_new_path());
    assert_eq!(restored.is_new_path(), original.is_new_path());

    restored.enable(TARGET, b"FUZ").unwrap();
    assert!(restored.is_new_path());
}

#[test]
fn merged_backend_knows_both_histories() {
    let mut left = backend(2000);
    left.enable(TARGET, b"F").unwrap();
    let mut right = backend(2000);
    right.enable(TARGET, b"FUZ").unwrap();

    let mut merged = left.merge(&right).unwrap();
    merged.enable(TARGET, b"FUZ").unwrap();
    assert!(!merged.is_new_path());
    assert_eq!(merged.kind(), InstrumentationKind::Dbt);

    // Inputs are untouched by the merge.
    left.enable(TARGET, b"FUZ").unwrap();
    assert!(left.is_new_path());
}

#[test]
fn command_change_relaunches_the_target() {
    let mut dbt = backend(2000);
    dbt.enable(TARGET, b"a").unwrap();
    let first = dbt.server_pid();
    dbt.enable(&format!("{TARGET} extra-arg"), b"a").unwrap();
    assert_ne!(dbt.server_pid(), first);
}
