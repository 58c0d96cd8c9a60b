use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::JobFailure;
use crate::worker::JobContext;

/// A job body. Handlers receive the decoded argument bytes and a context for
/// progress/notification side channels, and return the result bytes the
/// submitter's future resolves to.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext, args: Vec<u8>) -> std::result::Result<Vec<u8>, JobFailure>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Vec<u8>, JobFailure>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext, args: Vec<u8>) -> std::result::Result<Vec<u8>, JobFailure> {
        (self.f)(ctx, args).await
    }
}

/// Maps registered function names to handlers. Both the submitter and the
/// worker must agree on the names; the payload carries the name, never code.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            crate::worker::shell::SHELL_JOB,
            Arc::new(crate::worker::shell::ShellJob),
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register a plain async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(JobContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<u8>, JobFailure>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler { f }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_fn_and_invoke() {
        let mut registry = JobRegistry::new();
        registry.register_fn("double", |_ctx, args| async move {
            let n: u32 = bincode::deserialize(&args).unwrap();
            Ok(bincode::serialize(&(n * 2)).unwrap())
        });

        let handler = registry.get("double").expect("registered");
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let out = handler
            .run(JobContext::new(tx), bincode::serialize(&21u32).unwrap())
            .await
            .unwrap();
        let doubled: u32 = bincode::deserialize(&out).unwrap();
        assert_eq!(doubled, 42);
    }

    #[test]
    fn unknown_name_is_none() {
        let registry = JobRegistry::with_builtins();
        assert!(registry.get("no_such_job").is_none());
        assert!(registry.get(crate::worker::shell::SHELL_JOB).is_some());
    }
}
