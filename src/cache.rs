//! The per-run idempotency cache and its guard combinators.
//!
//! Provisioning plans routinely reference the same expensive step more than
//! once. [DoOnce] guards such a step behind a caller-chosen key: the step
//! runs until it succeeds once, and from then on the key is trusted for the
//! remainder of the run. [CheckOnce] does the same for expensive remote
//! probes, memoizing their boolean result.
//!
//! The cache lives inside the [ExecContext] and dies with it; nothing
//! persists across separate applies. Keys must be stable across retries of
//! the same logical step.
//!
//! # Success is sticky, failure is not
//!
//! A key is present in the cache **iff** the guarded operation previously
//! completed successfully. A failed attempt never inserts its key, so a later
//! [DoOnce] under the same key attempts the operation again. This is what
//! makes a plan re-entrant within one apply: expensive idempotent steps are
//! not double-run, while transiently failing steps are retried.

use crate::action::{Action, Checker};
use crate::context::ExecContext;
use anyhow::Result;
use std::env;

/// Name of the environment variable controlling the idempotency cache.
///
/// Unset, or set to anything unparseable, means enabled. Disabling the cache
/// makes every [DoOnce]/[CheckOnce] behave as if the cache were always empty,
/// which forces re-execution and keeps test runs deterministic.
pub const CACHE_ENV_VAR: &str = "BOSUN_CACHE";

/// A value stored in the per-run cache.
///
/// Guards store [Flag]s; callers may stash opaque payloads (e.g. a join token
/// obtained earlier in the run) as [Text].
///
/// [Flag]: CacheValue::Flag
/// [Text]: CacheValue::Text
#[derive(Clone, Debug, PartialEq)]
pub enum CacheValue {
    Flag(bool),
    Text(String),
}

impl CacheValue {
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            CacheValue::Flag(flag) => Some(*flag),
            CacheValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CacheValue::Flag(_) => None,
            CacheValue::Text(text) => Some(text),
        }
    }
}

/// Reads the cache toggle from the process environment.
pub(crate) fn cache_enabled_from_env() -> bool {
    match env::var(CACHE_ENV_VAR) {
        Ok(value) => parse_bool(&value).unwrap_or(true),
        Err(_) => true,
    }
}

/// Parses standard boolean strings, case-insensitively: `1`, `t`, `true`,
/// `y`, `yes`, `on` and their negative counterparts.
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "y" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "n" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Runs the wrapped action at most once successfully per provisioning run.
///
/// If caching is enabled and the key is already present, apply is a no-op
/// returning `Ok` immediately; the earlier success is trusted and the action
/// is neither re-run nor re-checked. Otherwise the action runs: success
/// inserts the key, failure propagates without inserting it.
pub struct DoOnce {
    key: String,
    action: Box<dyn Action>,
}

impl DoOnce {
    pub fn new(key: impl Into<String>, action: impl Action + 'static) -> Self {
        DoOnce {
            key: key.into(),
            action: Box::new(action),
        }
    }
}

impl Action for DoOnce {
    fn apply(&self, ctx: &mut ExecContext) -> Result<()> {
        if ctx.cache_enabled() && ctx.cache_get(&self.key).is_some() {
            return Ok(());
        }

        // A failure returns here, leaving the key absent so the next DoOnce
        // under this key attempts the action again.
        self.action.apply(ctx)?;

        ctx.cache_put(&self.key, CacheValue::Flag(true));
        Ok(())
    }
}

/// Memoizes a checker's boolean result under a key for the remainder of the
/// run. Errors are never memoized.
pub struct CheckOnce {
    key: String,
    checker: Box<dyn Checker>,
}

impl CheckOnce {
    pub fn new(key: impl Into<String>, checker: impl Checker + 'static) -> Self {
        CheckOnce {
            key: key.into(),
            checker: Box::new(checker),
        }
    }
}

impl Checker for CheckOnce {
    fn check(&self, ctx: &mut ExecContext) -> Result<bool> {
        if ctx.cache_enabled() {
            if let Some(value) = ctx.cache_get(&self.key) {
                if let Some(result) = value.as_flag() {
                    return Ok(result);
                }
            }
        }

        let result = self.checker.check(ctx)?;
        ctx.cache_put(&self.key, CacheValue::Flag(result));
        Ok(result)
    }
}

/// An action that removes a cache entry, forcing the next guard under that
/// key to execute again.
pub struct Invalidate {
    key: String,
}

impl Invalidate {
    pub fn new(key: impl Into<String>) -> Self {
        Invalidate { key: key.into() }
    }
}

impl Action for Invalidate {
    fn apply(&self, ctx: &mut ExecContext) -> Result<()> {
        let _ = ctx.cache_remove(&self.key);
        Ok(())
    }
}
