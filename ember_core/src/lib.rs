pub mod channel;
pub mod config;
pub mod coverage;
pub mod dbt;
pub mod forkserver;
pub mod instrumentation;
pub mod mutator;
pub mod protocol;
pub mod state;
pub mod supervisor;
pub mod tracer;
pub mod tsl;

pub use channel::{Channel, ChannelHalf, ChannelRole, Pipe, PipeEnd};
pub use config::EmberConfig;
pub use coverage::{CoverageError, CoverageRegion, MAP_SIZE, NewBits, VirginMap};
pub use dbt::{DbtInstrumentation, DbtOptions};
pub use forkserver::{ForkChild, ForkServer, ServeOutcome, ServerFault};
pub use instrumentation::{
    FuzzResult, Instrumentation, InstrumentationError, InstrumentationKind,
    ReturnCodeInstrumentation, ReturnCodeOptions,
};
pub use mutator::{HavocMutator, HavocOptions, MutateFlags, Mutator, MutatorError, MutatorKind};
pub use protocol::{Command, FORKSRV_FD, FORKSRV_REPLY_FD, HELLO, WaitStatusWord};
pub use state::{Checkpoint, StateError};
pub use supervisor::{ForkServerClient, ForkServerError, RunStatus, SupervisorState};
pub use tracer::{SetupError, TraceConfig, Tracer};
pub use tsl::{BlockKey, ChainEdge, NullCache, SyncRecord, SyncStats, TranslationCache, TslProducer};
