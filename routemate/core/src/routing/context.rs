//! Routing Context
//!
//! A nested stack of routing intents for one unit of work. The top of the
//! stack is the effective intent; an empty stack means `WRITE`.
//!
//! Two ways to carry a context:
//!
//! - An explicit [`RoutingContext`] value owned by the caller and passed to
//!   [`Router::determine_target`](super::router::Router::determine_target).
//!   [`RoutingContext::enter`] returns a guard that pops on drop.
//! - A task-local stack installed with [`scope`]. [`enter_current`] pushes
//!   onto it and the returned [`ScopedIntent`] pops on drop. Spawned tasks do
//!   not inherit the stack.
//!
//! ```text
//! enter(READ) ──► [READ]
//!   enter(read2) ──► [read2, READ]     current = read2
//!   drop ──► [READ]                    current = READ
//! drop ──► []                          current = none (WRITE)
//! ```

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Reserved intent string for the primary (write) path
pub const WRITE: &str = "WRITE";

/// Reserved intent string for the replica (read) path
pub const READ: &str = "READ";

static DEFAULT_INTENT: RoutingIntent = RoutingIntent::Write;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised when manipulating a routing context
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntentError {
    /// The intent was empty or whitespace only
    #[error("routing intent must not be empty or blank")]
    InvalidIntent,

    /// No task-local routing scope is installed for the current task
    #[error("no routing scope is active for the current task")]
    NoScope,
}

// ============================================================================
// Routing Intent
// ============================================================================

/// What the caller intends to do with the backend it is about to use
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RoutingIntent {
    /// Route to the primary
    Write,
    /// Route to a healthy replica, or the primary if none is healthy
    Read,
    /// Route to this backend key directly, bypassing balancing and health
    Backend(String),
}

impl RoutingIntent {
    /// Parse an intent string. `"WRITE"` and `"READ"` are reserved
    /// (case-sensitive); any other non-blank string is a backend key.
    pub fn parse(raw: &str) -> Result<Self, IntentError> {
        if raw.trim().is_empty() {
            return Err(IntentError::InvalidIntent);
        }
        Ok(match raw {
            WRITE => Self::Write,
            READ => Self::Read,
            key => Self::Backend(key.to_string()),
        })
    }

    /// Explicit backend intent, rejecting blank keys
    pub fn backend(key: impl Into<String>) -> Result<Self, IntentError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(IntentError::InvalidIntent);
        }
        Ok(Self::Backend(key))
    }

    /// String form of the intent
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Write => WRITE,
            Self::Read => READ,
            Self::Backend(key) => key,
        }
    }

    fn validate(&self) -> Result<(), IntentError> {
        match self {
            Self::Backend(key) if key.trim().is_empty() => Err(IntentError::InvalidIntent),
            _ => Ok(()),
        }
    }
}

impl FromStr for RoutingIntent {
    type Err = IntentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RoutingIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Routing Context
// ============================================================================

/// Stack of routing intents for one unit of work
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingContext {
    stack: Vec<RoutingIntent>,
}

impl RoutingContext {
    /// Create an empty context (effective intent `WRITE`)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an intent
    pub fn push(&mut self, intent: RoutingIntent) -> Result<(), IntentError> {
        intent.validate()?;
        self.stack.push(intent);
        Ok(())
    }

    /// Parse and push an intent string
    pub fn push_str(&mut self, raw: &str) -> Result<(), IntentError> {
        self.push(RoutingIntent::parse(raw)?)
    }

    /// Pop the most recent intent. Popping an empty stack is a no-op.
    pub fn pop(&mut self) -> Option<RoutingIntent> {
        self.stack.pop()
    }

    /// Top of the stack, if any
    #[must_use]
    pub fn current(&self) -> Option<&RoutingIntent> {
        self.stack.last()
    }

    /// Top of the stack, or `WRITE` when empty
    #[must_use]
    pub fn effective(&self) -> &RoutingIntent {
        self.current().unwrap_or(&DEFAULT_INTENT)
    }

    /// Copy of the stack, most recent first
    #[must_use]
    pub fn snapshot(&self) -> Vec<RoutingIntent> {
        self.stack.iter().rev().cloned().collect()
    }

    /// Number of intents on the stack
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Whether the stack is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Push `intent` and return a guard that pops it when dropped.
    ///
    /// The guard derefs to the context, so scopes nest by calling `enter`
    /// on the guard itself.
    pub fn enter(&mut self, intent: RoutingIntent) -> Result<ContextGuard<'_>, IntentError> {
        self.push(intent)?;
        Ok(ContextGuard { ctx: self })
    }
}

/// Pops one intent from the borrowed context on drop
#[derive(Debug)]
pub struct ContextGuard<'a> {
    ctx: &'a mut RoutingContext,
}

impl Deref for ContextGuard<'_> {
    type Target = RoutingContext;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl DerefMut for ContextGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.ctx.pop();
    }
}

// ============================================================================
// Task-Local Context
// ============================================================================

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

struct TaskStack {
    id: u64,
    ctx: RefCell<RoutingContext>,
}

tokio::task_local! {
    static CURRENT: TaskStack;
}

/// Run `fut` with a fresh task-local routing stack
pub async fn scope<F: Future>(fut: F) -> F::Output {
    let stack = TaskStack {
        id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
        ctx: RefCell::new(RoutingContext::new()),
    };
    CURRENT.scope(stack, fut).await
}

/// Push onto the task-local stack; the returned guard pops on drop.
///
/// Fails with [`IntentError::NoScope`] outside of [`scope`]. The guard only
/// ever pops the stack of the scope that created it: dropped anywhere else
/// it leaves the local stack untouched and logs a warning.
pub fn enter_current(intent: RoutingIntent) -> Result<ScopedIntent, IntentError> {
    let scope_id = CURRENT
        .try_with(|stack| stack.ctx.borrow_mut().push(intent).map(|()| stack.id))
        .map_err(|_| IntentError::NoScope)??;
    Ok(ScopedIntent { scope_id })
}

/// Top of the task-local stack, `None` when empty or outside a scope
#[must_use]
pub fn current_intent() -> Option<RoutingIntent> {
    with_current(|ctx| ctx.current().cloned()).flatten()
}

/// Copy of the task-local stack, most recent first
#[must_use]
pub fn current_snapshot() -> Vec<RoutingIntent> {
    with_current(RoutingContext::snapshot).unwrap_or_default()
}

/// Borrow the task-local context, `None` outside a scope
pub fn with_current<R>(f: impl FnOnce(&RoutingContext) -> R) -> Option<R> {
    CURRENT.try_with(|stack| f(&stack.ctx.borrow())).ok()
}

/// Pops one intent from the task-local stack on drop
#[derive(Debug)]
#[must_use = "the intent is popped as soon as the guard is dropped"]
pub struct ScopedIntent {
    scope_id: u64,
}

impl Drop for ScopedIntent {
    fn drop(&mut self) {
        let owned = CURRENT
            .try_with(|stack| {
                if stack.id == self.scope_id {
                    stack.ctx.borrow_mut().pop();
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if !owned {
            tracing::warn!(
                scope = self.scope_id,
                "Scoped intent dropped outside its scope, local stack left untouched"
            );
        }
    }
}
