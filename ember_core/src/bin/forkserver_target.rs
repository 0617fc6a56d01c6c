//! Small target that speaks the fork-server protocol and records synthetic
//! coverage. Used by the integration tests and for trying out a setup by hand.
//!
//! Reads its input from stdin. Each leading byte matching `FUZZ` reaches one
//! more location; the full word aborts, and a `HANG` prefix sleeps.

use ember_core::tsl::{BlockKey, ChainEdge, NullCache, TslProducer};
use ember_core::{ForkServer, TraceConfig, Tracer};
use log::error;
use std::io::Read;
use std::time::Duration;

const ENTRY_PC: u64 = 0x1000;
const MAGIC: &[u8] = b"FUZZ";

fn main() {
    env_logger::init();

    let config = match TraceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid trace configuration: {e}");
            std::process::exit(e.exit_code());
        }
    };
    let mut tracer = match Tracer::setup(&config, 0..u64::MAX) {
        Ok(tracer) => tracer,
        Err(e) => {
            error!("tracer setup failed: {e}");
            std::process::exit(e.exit_code());
        }
    };

    let mut sync = ForkServer::from_inherited(NullCache)
        .and_then(|server| server.run())
        .map_or_else(TslProducer::inactive, |child| child.sync);

    let mut input = Vec::new();
    if std::io::stdin().read_to_end(&mut input).is_err() {
        std::process::exit(2);
    }

    let mut visit = |pc: u64, from: Option<u64>| {
        tracer.record(pc);
        let edge = from.map(|source| ChainEdge {
            source: BlockKey::new(source, 0, 0),
            exit_slot: 0,
        });
        sync.request(BlockKey::new(pc, 0, 0), edge);
    };

    visit(ENTRY_PC, None);
    let mut last = ENTRY_PC;
    let matched = input
        .iter()
        .zip(MAGIC)
        .take_while(|(got, want)| got == want)
        .count();
    for i in 0..matched {
        let pc = 0x2000 + 0x100 * i as u64;
        visit(pc, Some(last));
        last = pc;
    }

    if matched == MAGIC.len() {
        std::process::abort();
    }
    if input.starts_with(b"HANG") {
        std::thread::sleep(Duration::from_secs(30));
    }
}
