//! Action callables and the per-module action table.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};

use crate::error::ModuleError;

/// Keyword arguments passed to an action.
pub type ActionArgs = Map<String, Value>;
/// What an action produces.
pub type ActionResult = Result<Value, ModuleError>;

pub type SyncActionFn = Arc<dyn Fn(ActionArgs) -> ActionResult + Send + Sync>;
pub type AsyncActionFn = Arc<dyn Fn(ActionArgs) -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// A named operation a module offers. The variant is fixed when the table is
/// built, so callers know up front whether to run it inline or spawn it.
#[derive(Clone)]
pub enum Action {
    Sync(SyncActionFn),
    Async(AsyncActionFn),
}

impl Action {
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }

    /// Run to completion, converting panics into [`ModuleError::Panicked`].
    ///
    /// Async actions are cancelled once `deadline` elapses. A synchronous
    /// action cannot be preempted, so overrunning the deadline only logs.
    pub async fn invoke(
        &self,
        module: &str,
        action: &str,
        args: ActionArgs,
        deadline: Option<Duration>,
    ) -> ActionResult {
        match self {
            Self::Sync(f) => {
                let started = Instant::now();
                let result = run_sync(f, args);
                warn_if_overrun(module, action, started, deadline);
                result
            }
            Self::Async(f) => run_async(f.clone(), args, deadline).await,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Action::Sync"),
            Self::Async(_) => f.write_str("Action::Async"),
        }
    }
}

/// Name → action lookup built once when a module attaches.
#[derive(Clone, Default)]
pub struct ActionTable {
    entries: HashMap<String, Action>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActionArgs) -> ActionResult + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Action::Sync(Arc::new(f)));
        self
    }

    pub fn asynchronous<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActionArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        let f = Arc::new(f);
        self.entries.insert(
            name.into(),
            Action::Async(Arc::new(move |args| f(args).boxed())),
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Action names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ActionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionTable")
            .field("actions", &self.names())
            .finish()
    }
}

pub(crate) fn run_sync(f: &SyncActionFn, args: ActionArgs) -> ActionResult {
    catch_unwind(AssertUnwindSafe(|| f(args)))
        .unwrap_or_else(|payload| Err(ModuleError::Panicked(panic_message(payload.as_ref()))))
}

pub(crate) async fn run_async(
    f: AsyncActionFn,
    args: ActionArgs,
    deadline: Option<Duration>,
) -> ActionResult {
    // Building the future runs user code too.
    let fut = match catch_unwind(AssertUnwindSafe(|| f(args))) {
        Ok(fut) => fut,
        Err(payload) => return Err(ModuleError::Panicked(panic_message(payload.as_ref()))),
    };
    let guarded = AssertUnwindSafe(fut).catch_unwind().map(|outcome| {
        outcome.unwrap_or_else(|payload| Err(ModuleError::Panicked(panic_message(payload.as_ref()))))
    });
    match deadline {
        Some(limit) => tokio::time::timeout(limit, guarded)
            .await
            .unwrap_or_else(|_| Err(ModuleError::TimedOut(limit.as_millis() as u64))),
        None => guarded.await,
    }
}

pub(crate) fn warn_if_overrun(module: &str, action: &str, started: Instant, deadline: Option<Duration>) {
    if let Some(limit) = deadline {
        let elapsed = started.elapsed();
        if elapsed > limit {
            tracing::warn!(
                category = "actions",
                module = %module,
                action = %action,
                elapsed_ms = elapsed.as_millis() as u64,
                limit_ms = limit.as_millis() as u64,
                "Synchronous action overran its deadline"
            );
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
