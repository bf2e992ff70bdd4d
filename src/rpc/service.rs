//! Service Registration & Dispatch
//!
//! Methods are registered as typed async closures. The registry stores each
//! method behind a uniform handler signature — raw argument bytes in, raw
//! reply bytes out — with the typed decode/encode folded into the wrapper at
//! registration time. Dispatch is a name lookup, `"Service.Method"`, split
//! on the last dot.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::codec::CodecKind;

type HandlerFn = Arc<
    dyn Fn(CodecKind, Vec<u8>) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>>
        + Send
        + Sync,
>;

/// One registered method: its handler plus a call counter.
pub struct Method {
    name: String,
    handler: HandlerFn,
    calls: AtomicU64,
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method").field("name", &self.name).finish()
    }
}

impl Method {
    /// Times this method has been invoked since registration.
    pub fn num_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decodes the arguments, runs the handler, encodes the reply.
    pub async fn invoke(&self, kind: CodecKind, args: Vec<u8>) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(kind, args).await
    }
}

/// A named bundle of methods, built with [`Service::method`] and registered
/// on a server.
pub struct Service {
    name: String,
    methods: DashMap<String, Arc<Method>>,
}

impl Service {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            methods: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a typed method. The argument and reply types only need serde
    /// bounds; the wrapper handles codec-specific bytes.
    pub fn method<A, R, F, Fut>(self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped: HandlerFn = Arc::new(move |kind: CodecKind, bytes: Vec<u8>| {
            let handler = handler.clone();
            Box::pin(async move {
                let args: A = kind.decode(&bytes)?;
                let reply = handler(args).await?;
                kind.encode(&reply)
            }) as Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>>
        });

        self.methods.insert(
            name.to_string(),
            Arc::new(Method {
                name: format!("{}.{}", self.name, name),
                handler: wrapped,
                calls: AtomicU64::new(0),
            }),
        );
        self
    }

    pub fn get_method(&self, name: &str) -> Option<Arc<Method>> {
        self.methods.get(name).map(|entry| entry.value().clone())
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// All services known to one server.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Registers a service under its name. Re-registering a name is an
    /// error.
    pub fn register(&self, service: Service) -> Result<()> {
        let name = service.name().to_string();
        match self.services.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(anyhow!("rpc server: service already defined: {}", name))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::info!("registered service {}", name);
                slot.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    /// Resolves `"Service.Method"`, splitting on the last dot.
    pub fn find(&self, service_method: &str) -> Result<Arc<Method>> {
        let Some(dot) = service_method.rfind('.') else {
            return Err(anyhow!(
                "rpc server: service/method request ill-formed: {}",
                service_method
            ));
        };
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);

        let Some(service) = self.services.get(service_name) else {
            return Err(anyhow!("rpc server: can't find service {}", service_name));
        };
        service
            .get_method(method_name)
            .ok_or_else(|| anyhow!("rpc server: can't find method {}", method_name))
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
