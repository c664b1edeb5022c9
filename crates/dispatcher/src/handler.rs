//! Job handlers keyed by class name.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use durq_core::{ExecutionError, Job};

/// Async job handler. Errors and panics are recorded as execution failures.
pub type JobHandler = Arc<dyn Fn(Job) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Maps job class names to handlers.
///
/// Lookup order: exact class name, then the longest matching category
/// pattern (`mail.*` matches `mail.digest`), then the `*` wildcard.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a class name or pattern, replacing any previous one.
    pub fn register<F, Fut>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |job| handler(job).boxed());
        self.handlers.insert(pattern.into(), handler);
    }

    pub fn with_handler<F, Fut>(mut self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(pattern, handler);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn get(&self, class_name: &str) -> Option<&JobHandler> {
        if let Some(handler) = self.handlers.get(class_name) {
            return Some(handler);
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = class_name.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler);
        if category.is_some() {
            return category;
        }

        self.handlers.get("*")
    }

    /// Run the handler for `job`.
    pub async fn execute(&self, job: Job) -> Result<(), ExecutionError> {
        let handler = self
            .get(&job.class_name)
            .cloned()
            .ok_or_else(|| ExecutionError::new(format!("no handler for job class {}", job.class_name)))?;

        match AssertUnwindSafe(handler(job)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(ExecutionError::new(format!("{error:#}"))),
            Err(payload) => Err(ExecutionError::new(format!(
                "handler panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut patterns: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        patterns.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
