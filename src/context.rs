//! The per-run execution context.

use crate::cache::{cache_enabled_from_env, CacheValue};
use crate::network::Communicator;
use crate::output::OutputSink;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything an [Action] or [Checker] needs to do its work.
///
/// Constructed once when a provisioning apply begins and passed by mutable
/// reference to every action; discarded when the apply returns, taking the
/// idempotency cache with it. There is no cross-invocation persistence.
///
/// Immutable after construction except for the cache map, which the cache
/// accessors mutate in place. The context is exclusively owned by one
/// in-flight apply; it is not designed for concurrent reuse.
///
/// [Action]: crate::action::Action
/// [Checker]: crate::action::Checker
pub struct ExecContext {
    user_output: Box<dyn OutputSink>,
    exec_output: Box<dyn OutputSink>,
    communicator: Arc<dyn Communicator>,
    use_sudo: bool,
    cache: HashMap<String, CacheValue>,
    cache_enabled: bool,
}

impl ExecContext {
    pub fn builder() -> ExecContextBuilder {
        ExecContextBuilder::new()
    }

    /// The sink for operator-visible text, e.g. streamed command output.
    pub fn user_output(&self) -> &dyn OutputSink {
        self.user_output.as_ref()
    }

    /// The sink for command echo and other debug chatter. May differ from
    /// [Self::user_output].
    pub fn exec_output(&self) -> &dyn OutputSink {
        self.exec_output.as_ref()
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.communicator
    }

    /// Whether commands run with the platform's privilege-escalation prefix.
    pub fn use_sudo(&self) -> bool {
        self.use_sudo
    }

    /// Whether [DoOnce]/[CheckOnce] guards consult the cache at all.
    ///
    /// [DoOnce]: crate::cache::DoOnce
    /// [CheckOnce]: crate::cache::CheckOnce
    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    pub fn cache_get(&self, key: &str) -> Option<&CacheValue> {
        self.cache.get(key)
    }

    pub fn cache_put(&mut self, key: impl Into<String>, value: CacheValue) {
        let _ = self.cache.insert(key.into(), value);
    }

    pub fn cache_remove(&mut self, key: &str) -> Option<CacheValue> {
        self.cache.remove(key)
    }
}

/// Assembles an [ExecContext].
///
/// # Panics
///
/// [Self::build] panics if the communicator or either output sink is missing.
/// An incomplete context indicates a bug in the calling code, not a runtime
/// condition, so it is not modeled as a recoverable error.
pub struct ExecContextBuilder {
    user_output: Option<Box<dyn OutputSink>>,
    exec_output: Option<Box<dyn OutputSink>>,
    communicator: Option<Arc<dyn Communicator>>,
    use_sudo: bool,
    cache_enabled: Option<bool>,
}

impl ExecContextBuilder {
    pub fn new() -> Self {
        ExecContextBuilder {
            user_output: None,
            exec_output: None,
            communicator: None,
            use_sudo: false,
            cache_enabled: None,
        }
    }

    pub fn user_output(mut self, sink: impl OutputSink + 'static) -> Self {
        self.user_output = Some(Box::new(sink));
        self
    }

    pub fn exec_output(mut self, sink: impl OutputSink + 'static) -> Self {
        self.exec_output = Some(Box::new(sink));
        self
    }

    pub fn communicator(mut self, communicator: Arc<dyn Communicator>) -> Self {
        self.communicator = Some(communicator);
        self
    }

    pub fn use_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }

    /// Overrides the environment-derived cache toggle. Without this, the
    /// toggle is read from [CACHE_ENV_VAR] at build time (default: enabled).
    ///
    /// [CACHE_ENV_VAR]: crate::cache::CACHE_ENV_VAR
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = Some(enabled);
        self
    }

    pub fn build(self) -> ExecContext {
        ExecContext {
            user_output: self
                .user_output
                .expect("cannot build an ExecContext without a user output sink"),
            exec_output: self
                .exec_output
                .expect("cannot build an ExecContext without an exec output sink"),
            communicator: self
                .communicator
                .expect("cannot build an ExecContext without a communicator"),
            use_sudo: self.use_sudo,
            cache: HashMap::new(),
            cache_enabled: self.cache_enabled.unwrap_or_else(cache_enabled_from_env),
        }
    }
}

impl Default for ExecContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
