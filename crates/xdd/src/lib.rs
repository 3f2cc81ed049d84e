//! # xdd
//!
//! The persistence and consistency core of a conversational specification
//! authoring tool. A project's requirements catalog lives in an artifact
//! directory (conventionally `.xdd/`) as human-readable YAML, versioned by an
//! append-only changelog and reconstructed by deterministic event replay.
//!
//! ## Guarantees
//!
//! - **Single writer** — A lock file with an OS advisory lock serializes
//!   writers across processes, with stale-holder detection for crashed ones.
//! - **Atomic commits** — Every write stages a full copy of the artifact
//!   directory and publishes it with a rename, so readers never observe a
//!   torn state and a failed commit leaves the prior state untouched.
//! - **Replayable history** — The changelog is the authoritative store;
//!   `specification.yaml` is a regenerated view. Periodic snapshots
//!   short-circuit replay without ever diverging from it.
//!
//! ## Write flow
//!
//! 1. Acquire the artifact lock ([`lock::RootLock`]).
//! 2. Read the current state ([`repository::SpecsRepository::read_specification`]).
//! 3. Produce a new state plus the events that explain it (typically via the
//!    [`generator`] collaborator).
//! 4. Commit both in one copy-on-write transaction
//!    ([`repository::SpecsRepository::write_specification_and_changelog`]).
//! 5. Release the lock.
//!
//! [`repository::SpecsRepository::safe_operation`] wraps the whole sequence
//! so lock and transaction are released on every exit path.
//!
//! ## Modules
//!
//! - [`types`] — Domain types: identifiers, requirements, events, the
//!   specification value
//! - [`ident`] — Collision-resistant identifier minting
//! - [`lock`] — Artifact-root lock with stale-holder takeover
//! - [`txn`] — Copy-on-write multi-file transactions
//! - [`changelog`] — Event log, snapshot store, and the load protocol
//! - [`replay`] — The pure event reducer
//! - [`repository`] — The façade composing the above
//! - [`config`] — `xdd.toml` configuration loading
//! - [`generator`] — Structured-generator client (LLM collaborator)

/// Event log, snapshot store, and the snapshot-plus-replay load protocol.
pub mod changelog;

/// Configuration file (`xdd.toml`) loading and defaults.
pub mod config;

/// Structured-generator client for an OpenAI-compatible chat endpoint.
pub mod generator;

/// Collision-resistant identifier minting.
pub mod ident;

/// Artifact-root lock with stale-holder takeover.
pub mod lock;

/// The pure event reducer.
pub mod replay;

/// Repository façade: read state, commit state + events atomically.
pub mod repository;

/// Copy-on-write multi-file transactions.
pub mod txn;

/// Domain types shared across the crate.
pub mod types;


/// Diagnostic sink injected by the caller.
///
/// The core never logs on its own: stale-lock takeovers, snapshot-corruption
/// fallbacks, and non-fatal commit cleanup failures go through whatever
/// reporter the caller supplies.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// A reporter that discards everything. Handy default for tests and callers
/// that do their own logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}
