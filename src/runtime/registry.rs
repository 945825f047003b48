//! Workflow and activity registries.
//!
//! Registries are built once at startup and shared immutably with the worker
//! pools; registration conflicts are rejected at build time. Handlers take
//! and return string payloads; the typed `register` adapters run inputs and
//! outputs through the JSON codec so user code works with plain Rust types.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{ActivityContext, Codec, Json, WorkflowContext};

/// Error produced when a registry cannot be built.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate registration: {0}")]
    DuplicateName(String),
}

/// Handler invoked by the executor for one workflow instance.
///
/// The returned future is the workflow's root coroutine: the executor polls
/// it manually and it must therefore never block outside durable futures.
pub trait WorkflowHandler: Send + Sync {
    fn invoke(&self, ctx: WorkflowContext, input: String) -> BoxFuture<'static, Result<String, String>>;
}

/// Handler invoked by the activity worker pool. Activities may perform real
/// I/O and use the full async runtime.
pub trait ActivityHandler: Send + Sync {
    fn invoke(&self, ctx: ActivityContext, input: String) -> BoxFuture<'static, Result<String, String>>;
}

struct FnWorkflow<F>(F);

impl<F, Fut> WorkflowHandler for FnWorkflow<F>
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    fn invoke(&self, ctx: WorkflowContext, input: String) -> BoxFuture<'static, Result<String, String>> {
        Box::pin((self.0)(ctx, input))
    }
}

struct FnActivity<F>(F);

impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    fn invoke(&self, ctx: ActivityContext, input: String) -> BoxFuture<'static, Result<String, String>> {
        Box::pin((self.0)(ctx, input))
    }
}

/// Immutable name → handler map.
pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, Arc<H>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Registry<H> {
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        self.inner.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Builder collecting registrations; conflicts surface at [`build`].
///
/// [`build`]: RegistryBuilder::build
pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    duplicates: Vec<String>,
}

impl<H: ?Sized> RegistryBuilder<H> {
    fn add(mut self, name: &str, handler: Arc<H>) -> Self {
        if self.map.insert(name.to_string(), handler).is_some() {
            self.duplicates.push(name.to_string());
        }
        self
    }

    pub fn build(self) -> Result<Registry<H>, RegistryError> {
        if let Some(name) = self.duplicates.into_iter().next() {
            return Err(RegistryError::DuplicateName(name));
        }
        Ok(Registry {
            inner: Arc::new(self.map),
        })
    }
}

pub type WorkflowRegistry = Registry<dyn WorkflowHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type WorkflowRegistryBuilder = RegistryBuilder<dyn WorkflowHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        RegistryBuilder {
            map: HashMap::new(),
            duplicates: Vec::new(),
        }
    }
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        RegistryBuilder {
            map: HashMap::new(),
            duplicates: Vec::new(),
        }
    }
}

impl WorkflowRegistryBuilder {
    /// Register a typed workflow function under `name`.
    pub fn register<F, Fut, I, O>(self, name: &str, f: F) -> Self
    where
        F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, String>> + Send + 'static,
        I: DeserializeOwned + Send + 'static,
        O: Serialize + 'static,
    {
        let handler = FnWorkflow(move |ctx: WorkflowContext, input: String| {
            let decoded = Json::decode::<I>(&input).map(|i| f(ctx, i));
            async move {
                match decoded {
                    Ok(fut) => match fut.await {
                        Ok(output) => {
                            Json::encode(&output).map_err(|e| format!("serialization: {e}"))
                        }
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(format!("serialization: {e}")),
                }
            }
        });
        self.add(name, Arc::new(handler))
    }

    /// Register a workflow taking and returning raw string payloads.
    pub fn register_raw<F, Fut>(self, name: &str, f: F) -> Self
    where
        F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.add(name, Arc::new(FnWorkflow(f)))
    }
}

impl ActivityRegistryBuilder {
    /// Register a typed activity function under `name`.
    pub fn register<F, Fut, I, O>(self, name: &str, f: F) -> Self
    where
        F: Fn(ActivityContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, String>> + Send + 'static,
        I: DeserializeOwned + Send + 'static,
        O: Serialize + 'static,
    {
        let handler = FnActivity(move |ctx: ActivityContext, input: String| {
            let decoded = Json::decode::<I>(&input).map(|i| f(ctx, i));
            async move {
                match decoded {
                    Ok(fut) => match fut.await {
                        Ok(output) => {
                            Json::encode(&output).map_err(|e| format!("serialization: {e}"))
                        }
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(format!("serialization: {e}")),
                }
            }
        });
        self.add(name, Arc::new(handler))
    }

    /// Register an activity taking and returning raw string payloads.
    pub fn register_raw<F, Fut>(self, name: &str, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.add(name, Arc::new(FnActivity(f)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_workflow_names_are_rejected() {
        let result = WorkflowRegistry::builder()
            .register("w", |_ctx: WorkflowContext, _input: String| async move {
                Ok("".to_string())
            })
            .register("w", |_ctx: WorkflowContext, _input: String| async move {
                Ok("".to_string())
            })
            .build();
        assert!(matches!(result, Err(RegistryError::DuplicateName(n)) if n == "w"));
    }

    #[test]
    fn registered_names_resolve() {
        let reg = ActivityRegistry::builder()
            .register("add", |_ctx, (a, b): (i64, i64)| async move { Ok(a + b) })
            .build()
            .unwrap();
        assert!(reg.has("add"));
        assert!(!reg.has("sub"));
        assert_eq!(reg.len(), 1);
    }
}
