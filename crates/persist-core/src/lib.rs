//! persist-core — persistence plugin for observable state.
//!
//! Restores observable values from a key-value [`Storage`] on startup and
//! writes every user change back.
//!
//! # Architecture
//!
//! - [`MetaStore`] tracks which storage keys hold persisted values and is
//!   itself stored under one reserved key, so a restore needs no key
//!   listing from the backend.
//! - [`PersistPlugin`] implements the host's [`ObservablePlugin`] hooks:
//!   `restore` loads and stages values, `on_create` applies them once,
//!   `on_change` writes new values through.
//!
//! Values are encoded with a [`persist_codec::Codec`], by default the
//! graph-preserving [`persist_codec::GraphCodec`].

pub mod config;
pub mod error;
pub mod meta;
pub mod observable;
pub mod plugin;
pub mod storage;

pub use config::{DEFAULT_META_KEY, PersistConfig};
pub use error::{PersistError, PersistResult};
pub use meta::MetaStore;
pub use observable::{
    Observable, ObservableError, ObservablePlugin, PersistOptions, PluginFuture,
    ReadableObservable, SetOrigin, Transform, TransformError, WritableObservable,
};
pub use persist_codec::{Codec, CodecError, GraphCodec, SharedValue, Value};
pub use plugin::PersistPlugin;
pub use storage::{MemoryStorage, Storage, StorageError, StorageFuture};
