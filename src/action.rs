//! Composable units of remote work.
//!
//! An [Action] does something; a [Checker] tests something. Both are applied
//! against an [ExecContext], and both propagate the first error they
//! encounter without doing further work. Combinators in this module compose
//! them into larger plans: sequencing, conditionals, and boolean logic.
//!
//! # Errors are not `false`
//!
//! A [Checker] returning `Ok(false)` is a normal negative result. An `Err`
//! from any operand short-circuits the enclosing combinator immediately and
//! is never coerced to `false`. No combinator retries anything; retry
//! semantics are opt-in via [DoOnce]'s retry-on-failure property or a
//! caller-supplied wrapper.
//!
//! [DoOnce]: crate::cache::DoOnce

use crate::context::ExecContext;
use anyhow::Result;

/// A composable unit of side-effecting remote work.
pub trait Action {
    fn apply(&self, ctx: &mut ExecContext) -> Result<()>;
}

/// A composable predicate over remote state.
///
/// Checkers are read-only by contract: they must not mutate remote state.
/// Nothing enforces this; it is a documented constraint on implementations.
pub trait Checker {
    fn check(&self, ctx: &mut ExecContext) -> Result<bool>;
}

impl<F> Action for F
where
    F: Fn(&mut ExecContext) -> Result<()>,
{
    fn apply(&self, ctx: &mut ExecContext) -> Result<()> {
        self(ctx)
    }
}

impl<F> Checker for F
where
    F: Fn(&mut ExecContext) -> Result<bool>,
{
    fn check(&self, ctx: &mut ExecContext) -> Result<bool> {
        self(ctx)
    }
}

/// Applies each action in order, stopping at the first error.
pub struct Sequence {
    actions: Vec<Box<dyn Action>>,
}

impl Sequence {
    pub fn new(actions: Vec<Box<dyn Action>>) -> Self {
        Sequence { actions }
    }
}

impl Action for Sequence {
    fn apply(&self, ctx: &mut ExecContext) -> Result<()> {
        for action in &self.actions {
            action.apply(ctx)?;
        }
        Ok(())
    }
}

/// Applies an action only if a condition holds.
///
/// A checker error propagates without the action running; a `false` result
/// is a successful no-op.
pub struct If {
    condition: Box<dyn Checker>,
    then: Box<dyn Action>,
}

impl If {
    pub fn new(condition: impl Checker + 'static, then: impl Action + 'static) -> Self {
        If {
            condition: Box::new(condition),
            then: Box::new(then),
        }
    }
}

impl Action for If {
    fn apply(&self, ctx: &mut ExecContext) -> Result<()> {
        if self.condition.check(ctx)? {
            self.then.apply(ctx)
        } else {
            Ok(())
        }
    }
}

/// As [If], but a `false` condition runs the alternative action instead.
pub struct IfElse {
    condition: Box<dyn Checker>,
    then: Box<dyn Action>,
    otherwise: Box<dyn Action>,
}

impl IfElse {
    pub fn new(
        condition: impl Checker + 'static,
        then: impl Action + 'static,
        otherwise: impl Action + 'static,
    ) -> Self {
        IfElse {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }
}

impl Action for IfElse {
    fn apply(&self, ctx: &mut ExecContext) -> Result<()> {
        if self.condition.check(ctx)? {
            self.then.apply(ctx)
        } else {
            self.otherwise.apply(ctx)
        }
    }
}

/// True only if every checker is true. Short-circuits on the first `false`
/// or error.
pub struct And {
    checkers: Vec<Box<dyn Checker>>,
}

impl And {
    pub fn new(checkers: Vec<Box<dyn Checker>>) -> Self {
        And { checkers }
    }
}

impl Checker for And {
    fn check(&self, ctx: &mut ExecContext) -> Result<bool> {
        for checker in &self.checkers {
            if !checker.check(ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// True if any checker is true. Short-circuits on the first `true` or error;
/// false only if all operands are false.
pub struct Or {
    checkers: Vec<Box<dyn Checker>>,
}

impl Or {
    pub fn new(checkers: Vec<Box<dyn Checker>>) -> Self {
        Or { checkers }
    }
}

impl Checker for Or {
    fn check(&self, ctx: &mut ExecContext) -> Result<bool> {
        for checker in &self.checkers {
            if checker.check(ctx)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Logical negation. Errors propagate unchanged.
pub struct Not {
    checker: Box<dyn Checker>,
}

impl Not {
    pub fn new(checker: impl Checker + 'static) -> Self {
        Not {
            checker: Box::new(checker),
        }
    }
}

impl Checker for Not {
    fn check(&self, ctx: &mut ExecContext) -> Result<bool> {
        Ok(!self.checker.check(ctx)?)
    }
}

/// The action that does nothing. Useful as an explicit else branch.
pub struct Nothing;

impl Action for Nothing {
    fn apply(&self, _ctx: &mut ExecContext) -> Result<()> {
        Ok(())
    }
}
