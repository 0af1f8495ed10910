//! Engine Client (C1, spec §4.1 Design Notes "global engine client").

pub mod client;
pub mod mock;

pub use client::{BollardEngine, CreateOutcome, EngineClient, DEFAULT_CALL_TIMEOUT};
