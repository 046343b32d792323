//! PersistPlugin — restores observables from storage and writes changes back.
//!
//! # Lifecycle
//!
//! 1. [`PersistPlugin::restore`] reads the meta record, then every key it
//!    lists, and stages the decoded values.
//! 2. `on_create` hands a staged value to the first writable observable that
//!    resolves to its key and drops it from the staging map. Observables
//!    created before restore completes are queued and resolved at the end of
//!    `restore`.
//! 3. `on_change` encodes the new value, writes it under the observable's
//!    key, and adds the key to the meta record the first time it is written.
//!
//! Restored values are set with [`SetOrigin::Restore`]; the change they
//! trigger is never written back.
//!
//! Hosts that cannot queue may instead await [`PersistPlugin::restored`]
//! before attaching the plugin, so no observable is created mid-restore.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use persist_codec::{Codec, GraphCodec, Value};
use tracing::{debug, info, warn};

use crate::config::PersistConfig;
use crate::error::{PersistError, PersistResult};
use crate::meta::MetaStore;
use crate::observable::{
    Observable, ObservablePlugin, PluginFuture, SetOrigin, WritableObservable,
};
use crate::storage::Storage;

/// Log a per-key event at `info` when verbose, `debug` otherwise.
macro_rules! key_event {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+)
        } else {
            debug!($($arg)+)
        }
    };
}

#[derive(Default)]
struct PluginState {
    meta: MetaStore,
    /// Values awaiting their observable. `None` until the first restore completes.
    staged: Option<HashMap<String, Value>>,
    /// Writable observables created before restore completed, by key.
    pending: HashMap<String, Arc<dyn WritableObservable>>,
    /// Keys written before restore completed. Their stored value is newer
    /// than anything restore may stage for them.
    written_early: HashSet<String>,
}

/// Persistence plugin bridging observable lifecycle events to a [`Storage`].
pub struct PersistPlugin<S> {
    storage: S,
    codec: Arc<dyn Codec>,
    config: PersistConfig,
    state: Mutex<PluginState>,
    /// Held while the meta record is computed and written, so an older
    /// record never lands after a newer one.
    meta_write: tokio::sync::Mutex<()>,
}

impl<S: Storage> PersistPlugin<S> {
    /// Plugin with the default configuration and [`GraphCodec`].
    pub fn new(storage: S) -> Self {
        Self::build(storage, PersistConfig::default(), Arc::new(GraphCodec))
    }

    pub fn with_config(storage: S, config: PersistConfig) -> PersistResult<Self> {
        Self::with_codec(storage, config, Arc::new(GraphCodec))
    }

    pub fn with_codec(
        storage: S,
        config: PersistConfig,
        codec: Arc<dyn Codec>,
    ) -> PersistResult<Self> {
        config.validate()?;
        Ok(Self::build(storage, config, codec))
    }

    fn build(storage: S, config: PersistConfig, codec: Arc<dyn Codec>) -> Self {
        Self {
            storage,
            codec,
            config,
            state: Mutex::new(PluginState::default()),
            meta_write: tokio::sync::Mutex::new(()),
        }
    }

    /// Build a plugin and run [`restore`](Self::restore) before returning it.
    pub async fn restored(storage: S, config: PersistConfig) -> PersistResult<Self> {
        let plugin = Self::with_config(storage, config)?;
        plugin.restore().await?;
        Ok(plugin)
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PluginState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the meta record and every value it lists, then resolve queued
    /// observables.
    ///
    /// Any malformed record or value fails the whole restore. If several
    /// queued observables fail to take their value, all are attempted and
    /// the first error is returned.
    pub async fn restore(&self) -> PersistResult<()> {
        let meta_key = self.config.meta_key.as_str();
        let raw = self.read(meta_key).await?;
        let mut meta = MetaStore::load(raw.as_deref(), self.codec.as_ref())?;

        let mut staged = HashMap::new();
        for key in meta.keys() {
            match self.read(key).await? {
                Some(raw) => {
                    let value = self.codec.decode(&raw).map_err(|source| PersistError::Codec {
                        key: key.to_string(),
                        source,
                    })?;
                    staged.insert(key.to_string(), value);
                }
                None => debug!(%key, "meta lists key with no stored value"),
            }
        }
        let loaded = meta.len();

        let meta_guard = self.meta_write.lock().await;
        let (ready, unrecorded, record) = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let unrecorded: Vec<String> = state
                .meta
                .keys()
                .filter(|key| meta.add(key))
                .map(str::to_string)
                .collect();
            for key in state.written_early.drain() {
                staged.remove(&key);
                state.pending.remove(&key);
            }
            let ready: Vec<_> = state
                .pending
                .drain()
                .filter_map(|(key, cell)| staged.remove(&key).map(|value| (key, cell, value)))
                .collect();

            let record = if unrecorded.is_empty() {
                None
            } else {
                Some(meta.serialize(self.codec.as_ref())?)
            };
            state.meta = meta;
            state.staged = Some(staged);
            (ready, unrecorded, record)
        };

        // Queued observables are applied even if the merged record cannot be
        // written: their entries have already left `pending` and `staged`.
        let mut first_error = None;
        if let Some(record) = record {
            match self.write(meta_key, record).await {
                Ok(()) => debug!(
                    added = unrecorded.len(),
                    "meta record merged with keys written during restore"
                ),
                Err(e) => {
                    let mut state = self.lock();
                    for key in &unrecorded {
                        state.meta.discard(key);
                    }
                    warn!(error = %e, "failed to merge early keys into meta record");
                    first_error = Some(e);
                }
            }
        }
        drop(meta_guard);

        info!(keys = loaded, queued = ready.len(), "restore complete");

        for (key, cell, value) in ready {
            if let Err(e) = self.apply(&key, cell.as_ref(), value) {
                warn!(%key, error = %e, "failed to restore queued observable");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// True once a restore has completed.
    pub fn is_restored(&self) -> bool {
        self.lock().staged.is_some()
    }

    /// Keys currently recorded in the meta record, sorted.
    pub fn meta_keys(&self) -> Vec<String> {
        self.lock().meta.keys().map(str::to_string).collect()
    }

    /// Keys with a loaded value not yet claimed by an observable, sorted.
    pub fn staged_keys(&self) -> Vec<String> {
        let state = self.lock();
        let mut keys: Vec<String> = state
            .staged
            .iter()
            .flat_map(|staged| staged.keys().cloned())
            .collect();
        keys.sort();
        keys
    }

    /// Keys of observables queued until restore completes, sorted.
    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().pending.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Set a loaded value on `cell`. The staged entry is already gone, so a
    /// failure here never causes a second attempt.
    fn apply(&self, key: &str, cell: &dyn WritableObservable, stored: Value) -> PersistResult<()> {
        let value = match &cell.options().from_json {
            Some(from_json) => from_json(stored).map_err(|e| PersistError::Transform {
                key: key.to_string(),
                message: e.to_string(),
            })?,
            None => stored,
        };
        cell.set(value, SetOrigin::Restore)
            .map_err(|source| PersistError::Observable {
                key: key.to_string(),
                source,
            })?;
        key_event!(self.config.verbose, %key, "observable restored");
        Ok(())
    }

    async fn persist_change(
        &self,
        observable: &Observable,
        value: &Value,
        origin: SetOrigin,
    ) -> PersistResult<()> {
        if origin == SetOrigin::Restore {
            return Ok(());
        }
        let Some(cell) = observable.as_writable() else {
            return Ok(());
        };
        let options = cell.options();
        let Some(key) = options.persistence_key() else {
            return Ok(());
        };

        let stored = match &options.to_json {
            Some(to_json) => to_json(value.clone()).map_err(|e| PersistError::Transform {
                key: key.to_string(),
                message: e.to_string(),
            })?,
            None => value.clone(),
        };
        let serialized = self
            .codec
            .encode(&stored)
            .map_err(|source| PersistError::Codec {
                key: key.to_string(),
                source,
            })?;

        self.write(key, serialized).await?;
        key_event!(self.config.verbose, %key, "value persisted");
        self.record_key(key).await
    }

    /// Add `key` to the meta record after its value was written.
    async fn record_key(&self, key: &str) -> PersistResult<()> {
        {
            let state = self.lock();
            if state.staged.is_some() && state.meta.has(key) {
                return Ok(());
            }
        }

        let _meta_guard = self.meta_write.lock().await;
        let record = {
            let mut state = self.lock();
            if state.staged.is_none() {
                // Restore merges this key into the stored record.
                state.written_early.insert(key.to_string());
                state.meta.add(key);
                return Ok(());
            }
            if !state.meta.add(key) {
                return Ok(());
            }
            match state.meta.serialize(self.codec.as_ref()) {
                Ok(record) => record,
                Err(e) => {
                    state.meta.discard(key);
                    return Err(e);
                }
            }
        };

        if let Err(e) = self.write(&self.config.meta_key, record).await {
            // Retried by the next change to this key.
            self.lock().meta.discard(key);
            warn!(%key, error = %e, "meta record write failed");
            return Err(e);
        }
        debug!(%key, "meta record updated");
        Ok(())
    }

    async fn read(&self, key: &str) -> PersistResult<Option<String>> {
        self.storage
            .get_item(key)
            .await
            .map_err(|source| PersistError::Storage {
                key: key.to_string(),
                source,
            })
    }

    async fn write(&self, key: &str, value: String) -> PersistResult<()> {
        self.storage
            .set_item(key, value)
            .await
            .map_err(|source| PersistError::Storage {
                key: key.to_string(),
                source,
            })
    }
}

impl<S: Storage> ObservablePlugin for PersistPlugin<S> {
    fn on_create(&self, observable: &Observable) -> PersistResult<()> {
        let Some(cell) = observable.as_writable() else {
            return Ok(());
        };
        let Some(key) = cell.options().persistence_key() else {
            return Ok(());
        };

        let staged = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.staged.as_mut() {
                Some(staged) => staged.remove(key),
                None => {
                    state.pending.insert(key.to_string(), Arc::clone(cell));
                    debug!(%key, "observable queued until restore completes");
                    return Ok(());
                }
            }
        };

        match staged {
            Some(value) => self.apply(key, cell.as_ref(), value),
            None => Ok(()),
        }
    }

    fn on_change<'a>(
        &'a self,
        observable: &'a Observable,
        value: &'a Value,
        origin: SetOrigin,
    ) -> PluginFuture<'a> {
        Box::pin(self.persist_change(observable, value, origin))
    }
}
