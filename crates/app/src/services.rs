//! Service registry — named async handlers callable from automations.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;

use senses_domain::error::{AlreadyExistsError, NotFoundError, SensesError};

/// A registered service: takes its call data, reports whether it acted.
pub type ServiceHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<bool, SensesError>> + Send + Sync>;

/// Wrap an async closure into a [`ServiceHandler`].
pub fn service_handler<F, Fut>(handler: F) -> ServiceHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, SensesError>> + Send + 'static,
{
    Arc::new(move |data| Box::pin(handler(data)))
}

/// Registry of services keyed by dotted name (`device.set_state`).
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: RwLock<BTreeMap<String, ServiceHandler>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::AlreadyExists`] when the name is taken.
    pub fn register(&self, name: impl Into<String>, handler: ServiceHandler) -> Result<(), SensesError> {
        let name = name.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&name) {
            return Err(AlreadyExistsError {
                entity: "Service",
                id: name,
            }
            .into());
        }
        tracing::debug!(service = %name, "service registered");
        handlers.insert(name, handler);
        Ok(())
    }

    /// Call the service `name` with `data`.
    ///
    /// # Errors
    ///
    /// Returns [`SensesError::NotFound`] for an unknown service, or whatever
    /// the handler returns.
    #[tracing::instrument(skip(self, data))]
    pub async fn call(&self, name: &str, data: Value) -> Result<bool, SensesError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| NotFoundError {
                entity: "Service",
                id: name.to_string(),
            })?;
        handler(data).await
    }

    /// Registered service names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
