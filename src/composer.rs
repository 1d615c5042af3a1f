//! Inter-skill call routing.
//!
//! Every top-level invocation gets a [`CallContext`]; each nested call
//! extends it with the callee's name, which is how cycles and runaway
//! chains are caught before any code runs.

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SkillError};
use crate::registry::SkillRegistry;
use crate::runtime::{Sandbox, SkillInvoker};

/// Default bound on nested calls
pub const DEFAULT_MAX_DEPTH: usize = 5;

/// Active call stack of one top-level invocation
///
/// Contexts are values: [`CallContext::enter`] returns an extended copy and
/// never touches the parent. The deadline and cancel token are shared by the
/// whole chain.
#[derive(Debug, Clone)]
pub struct CallContext {
    stack: Vec<String>,
    max_depth: usize,
    deadline: Option<Deadline>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl CallContext {
    pub fn new(max_depth: usize) -> Self {
        Self {
            stack: Vec::new(),
            max_depth,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Give the chain a wall-clock budget starting now
    pub fn with_timeout(mut self, budget: Duration) -> Self {
        self.deadline = Some(Deadline {
            at: Instant::now() + budget,
            budget,
        });
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Set a budget only if the chain has none yet
    pub fn ensure_timeout(self, budget: Duration) -> Self {
        if self.deadline.is_some() {
            self
        } else {
            self.with_timeout(budget)
        }
    }

    /// Context for a call to `name` from the current frame
    pub fn enter(&self, name: &str) -> Result<CallContext> {
        if self.stack.iter().any(|s| s == name) {
            return Err(SkillError::CircularDependency(self.chain_with(name)));
        }
        if self.stack.len() >= self.max_depth {
            return Err(SkillError::MaxDepthExceeded {
                max_depth: self.max_depth,
                chain: self.chain_with(name),
            });
        }
        let mut next = self.clone();
        next.stack.push(name.to_string());
        Ok(next)
    }

    fn chain_with(&self, name: &str) -> Vec<String> {
        let mut chain = self.stack.clone();
        chain.push(name.to_string());
        chain
    }

    /// Fail if the chain was cancelled or ran out of time
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SkillError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline.at {
                return Err(SkillError::Timeout(deadline.budget));
            }
        }
        Ok(())
    }

    pub fn stack(&self) -> &[String] {
        &self.stack
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Skill currently executing, if any
    pub fn current(&self) -> Option<&str> {
        self.stack.last().map(String::as_str)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|d| d.at)
    }

    pub fn budget(&self) -> Option<Duration> {
        self.deadline.map(|d| d.budget)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.at.saturating_duration_since(Instant::now()))
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Runs skills by name, routing nested calls back through the registry
#[derive(Clone)]
pub struct Composer {
    registry: SkillRegistry,
    sandbox: Sandbox,
    max_depth: usize,
}

impl Composer {
    pub fn new(registry: SkillRegistry, max_depth: usize) -> Self {
        let sandbox = registry.sandbox().clone();
        Self {
            registry,
            sandbox,
            max_depth,
        }
    }

    /// Fresh top-level context carrying the sandbox time budget
    pub fn root_context(&self) -> CallContext {
        CallContext::new(self.max_depth).with_timeout(self.sandbox.config().timeout)
    }

    pub fn run(&self, name: &str, args: Value) -> Result<Value> {
        self.invoke(name, args, &self.root_context())
    }

    pub fn run_with_cancel(&self, name: &str, args: Value, token: CancellationToken) -> Result<Value> {
        let ctx = self.root_context().with_cancel(token);
        self.invoke(name, args, &ctx)
    }

    /// Call `name` from the frame described by `ctx`
    pub fn invoke(&self, name: &str, args: Value, ctx: &CallContext) -> Result<Value> {
        let inner = ctx.enter(name)?;
        let skill = self
            .registry
            .get(name)
            .ok_or_else(|| SkillError::NotFound(name.to_string()))?;

        debug!(skill = %name, depth = inner.depth(), "Invoking skill");
        let invoker: Arc<dyn SkillInvoker> = Arc::new(self.clone());
        self.sandbox.execute(&skill, args, inner, invoker)
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

impl SkillInvoker for Composer {
    fn invoke(&self, name: &str, args: Value, ctx: &CallContext) -> Result<Value> {
        Composer::invoke(self, name, args, ctx)
    }
}
