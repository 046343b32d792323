//! Contract with the reactive-state host.
//!
//! The host owns observables and their values. It exposes each one to the
//! plugin as an [`Observable`]: read-only cells can only be inspected,
//! writable cells also accept `set`. Every `set` carries a [`SetOrigin`],
//! which the host hands back unchanged to [`ObservablePlugin::on_change`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use persist_codec::Value;
use thiserror::Error;

use crate::error::PersistResult;

/// Failure raised by a caller-supplied `to_json`/`from_json` transform.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransformError(pub String);

/// Failure raised by a host observable refusing a value.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ObservableError(pub String);

/// Domain ↔ stored value transform.
pub type Transform = Arc<dyn Fn(Value) -> Result<Value, TransformError> + Send + Sync>;

/// Persistence-related options read from an observable.
#[derive(Clone, Default)]
pub struct PersistOptions {
    /// Generic identity, persisted only when `persisted` is set.
    pub key: Option<String>,
    /// Persistence identity; overrides `key`.
    pub persist_key: Option<String>,
    pub persisted: bool,
    pub to_json: Option<Transform>,
    pub from_json: Option<Transform>,
}

impl PersistOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_persist_key(mut self, key: impl Into<String>) -> Self {
        self.persist_key = Some(key.into());
        self
    }

    pub fn persisted(mut self, persisted: bool) -> Self {
        self.persisted = persisted;
        self
    }

    pub fn with_to_json<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, TransformError> + Send + Sync + 'static,
    {
        self.to_json = Some(Arc::new(f));
        self
    }

    pub fn with_from_json<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, TransformError> + Send + Sync + 'static,
    {
        self.from_json = Some(Arc::new(f));
        self
    }

    /// Storage key for this observable, if it is persisted at all.
    ///
    /// `persist_key` wins; otherwise `key` counts only when `persisted` is
    /// set. Empty strings are treated as absent.
    pub fn persistence_key(&self) -> Option<&str> {
        match non_empty(&self.persist_key) {
            Some(key) => Some(key),
            None if self.persisted => non_empty(&self.key),
            None => None,
        }
    }
}

fn non_empty(key: &Option<String>) -> Option<&str> {
    key.as_deref().filter(|k| !k.is_empty())
}

impl fmt::Debug for PersistOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistOptions")
            .field("key", &self.key)
            .field("persist_key", &self.persist_key)
            .field("persisted", &self.persisted)
            .field("to_json", &self.to_json.is_some())
            .field("from_json", &self.from_json.is_some())
            .finish()
    }
}

/// Why a value is being set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOrigin {
    /// Application code changed the value.
    User,
    /// The plugin is writing back a value loaded from storage.
    Restore,
}

pub trait ReadableObservable: Send + Sync {
    fn options(&self) -> &PersistOptions;
    fn get(&self) -> Value;
}

pub trait WritableObservable: ReadableObservable {
    /// Replace the value. Hosts must pass `origin` through to `on_change`.
    fn set(&self, value: Value, origin: SetOrigin) -> Result<(), ObservableError>;
}

/// An observable as seen by plugins.
#[derive(Clone)]
pub enum Observable {
    ReadOnly(Arc<dyn ReadableObservable>),
    Writable(Arc<dyn WritableObservable>),
}

impl Observable {
    pub fn options(&self) -> &PersistOptions {
        match self {
            Observable::ReadOnly(cell) => cell.options(),
            Observable::Writable(cell) => cell.options(),
        }
    }

    pub fn get(&self) -> Value {
        match self {
            Observable::ReadOnly(cell) => cell.get(),
            Observable::Writable(cell) => cell.get(),
        }
    }

    pub fn as_writable(&self) -> Option<&Arc<dyn WritableObservable>> {
        match self {
            Observable::Writable(cell) => Some(cell),
            Observable::ReadOnly(_) => None,
        }
    }
}

/// Boxed future alias for plugin hooks.
pub type PluginFuture<'a> = Pin<Box<dyn Future<Output = PersistResult<()>> + Send + 'a>>;

/// Hook set a host invokes on observable lifecycle events.
pub trait ObservablePlugin: Send + Sync {
    /// Called once when an observable is instantiated.
    fn on_create(&self, observable: &Observable) -> PersistResult<()>;

    /// Called once per committed mutation, after the value is visible.
    fn on_change<'a>(
        &'a self,
        observable: &'a Observable,
        value: &'a Value,
        origin: SetOrigin,
    ) -> PluginFuture<'a>;
}
