//! Method registry.
//!
//! Maps method names to local handlers. Registration swaps in a new map
//! snapshot, so the reader loop never blocks on a lock and handlers may be
//! added while the endpoint is running.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::caller::Caller;
use crate::error::HandlerError;
use crate::protocol::CorrelationId;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

/// A locally callable method.
///
/// Implemented for closures through [`MethodRegistry::register`] and
/// [`MethodRegistry::register_async`]; implement it directly for handlers
/// that carry their own state.
pub trait MethodHandler: Send + Sync + 'static {
    fn call(&self, ctx: CallContext) -> HandlerFuture;
}

/// Everything a handler receives for one inbound call.
#[derive(Debug)]
pub struct CallContext {
    id: CorrelationId,
    method: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    caller: Caller,
}

impl CallContext {
    pub(crate) fn new(
        id: CorrelationId,
        method: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        caller: Caller,
    ) -> Self {
        Self {
            id,
            method,
            args,
            kwargs,
            caller,
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    /// Decode positional argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| HandlerError::new(format!("missing positional argument {}", index)))?;
        T::deserialize(value)
            .map_err(|e| HandlerError::new(format!("invalid argument {}: {}", index, e)))
    }

    /// Decode named argument `name`, if present.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        match self.kwargs.get(name) {
            None => Ok(None),
            Some(value) => T::deserialize(value)
                .map(Some)
                .map_err(|e| HandlerError::new(format!("invalid argument '{}': {}", name, e))),
        }
    }

    /// Handle for calling back into the peer while this call is in flight.
    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    pub fn into_parts(self) -> (Vec<Value>, Map<String, Value>) {
        (self.args, self.kwargs)
    }
}

fn to_result<V: Serialize>(value: V) -> Result<Value, HandlerError> {
    Ok(serde_json::to_value(value)?)
}

struct SyncHandler<F, V> {
    f: F,
    _output: PhantomData<fn() -> V>,
}

impl<F, V> MethodHandler for SyncHandler<F, V>
where
    F: Fn(CallContext) -> Result<V, HandlerError> + Send + Sync + 'static,
    V: Serialize + 'static,
{
    fn call(&self, ctx: CallContext) -> HandlerFuture {
        let result = (self.f)(ctx).and_then(to_result);
        Box::pin(std::future::ready(result))
    }
}

struct AsyncHandler<F, Fut, V> {
    f: F,
    _output: PhantomData<fn() -> (Fut, V)>,
}

impl<F, Fut, V> MethodHandler for AsyncHandler<F, Fut, V>
where
    F: Fn(CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, HandlerError>> + Send + 'static,
    V: Serialize + 'static,
{
    fn call(&self, ctx: CallContext) -> HandlerFuture {
        let fut = (self.f)(ctx);
        Box::pin(async move { fut.await.and_then(to_result) })
    }
}

type MethodMap = HashMap<String, Arc<dyn MethodHandler>>;

/// Name -> handler table, cheap to clone and safe to share across tasks.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: Arc<ArcSwap<MethodMap>>,
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        let name = name.into();
        log::debug!(target: "crosspulse::registry", "Registering method '{}'", name);
        self.methods.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(name.clone(), Arc::clone(&handler));
            next
        });
    }

    /// Register a synchronous handler.
    pub fn register<F, V>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(CallContext) -> Result<V, HandlerError> + Send + Sync + 'static,
        V: Serialize + 'static,
    {
        self.register_handler(
            name,
            Arc::new(SyncHandler {
                f,
                _output: PhantomData,
            }),
        );
    }

    /// Register a handler that returns a future.
    pub fn register_async<F, Fut, V>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, HandlerError>> + Send + 'static,
        V: Serialize + 'static,
    {
        self.register_handler(
            name,
            Arc::new(AsyncHandler {
                f,
                _output: PhantomData,
            }),
        );
    }

    /// Remove `name`. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let previous = self.methods.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(name);
            next
        });
        previous.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods.load().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.load().contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.load().is_empty()
    }
}
