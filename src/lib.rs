//! Remote provisioning primitives.
//!
//! Bosun is a small combinator library for composing idempotent, retryable,
//! partially-cached provisioning plans that run over a single remote
//! command-and-file-transfer channel (a [Communicator]). Callers build a tree
//! of [Action]s (units of side-effecting remote work) and [Checker]s
//! (side-effect-free predicates over remote state), then apply the tree once
//! against an [ExecContext].
//!
//! # Program flow
//!
//! 1. The caller constructs a [Communicator] (see [reference] for an
//!    SSH-backed implementation) and establishes the connection with
//!    [network::connect_with_retry].
//!
//! 2. The caller builds an [ExecContext] carrying the communicator, the
//!    output sinks, the sudo flag, and the per-run idempotency cache.
//!
//! 3. The caller assembles a plan from the combinators in [action], [cache],
//!    [run], and [transfer], e.g. "upload this manifest, then if the service
//!    exists restart it, then run these commands exactly once per run".
//!
//! 4. The caller applies the plan. The tree is evaluated synchronously, top
//!    to bottom, left to right; the first error aborts the remaining work.
//!
//! # Guarantees
//!
//! * A failing step aborts the rest of the plan without corrupting the
//!   success cache: [cache::DoOnce] records a key only after the guarded
//!   action succeeds, so a failed step is retried rather than skipped.
//!
//! * Output from a remote command is streamed to the caller's sink one
//!   complete line at a time, as the command produces it, and every buffered
//!   line is flushed before the command call returns.
//!
//! * The external contract is single-threaded and deterministic. The only
//!   internal concurrency is the pair of stream-drain tasks inside the
//!   command runner, which are joined before the runner returns.
//!
//! [Communicator]: network::Communicator

pub mod action;
pub mod cache;
pub mod context;
pub mod network;
pub mod output;
#[cfg(feature = "openssh")]
pub mod reference;
pub mod run;
pub mod transfer;

#[cfg(test)]
pub(crate) mod fixtures;

#[doc(inline)]
pub use action::{Action, Checker};

#[doc(inline)]
pub use context::ExecContext;
