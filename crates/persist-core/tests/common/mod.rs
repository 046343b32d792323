//! Minimal reactive host used by the integration tests.
//!
//! Cells queue a change event on every `set`; [`Host::flush`] delivers the
//! queued events to the plugin, the way a host would after committing a
//! mutation.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Weak};

use persist_core::{
    Observable, ObservableError, ObservablePlugin, PersistOptions, PersistResult,
    ReadableObservable, SetOrigin, Value, WritableObservable,
};

type EventQueue = Arc<Mutex<Vec<(Observable, Value, SetOrigin)>>>;

pub struct Host {
    plugin: Arc<dyn ObservablePlugin>,
    events: EventQueue,
}

impl Host {
    pub fn new(plugin: Arc<dyn ObservablePlugin>) -> Self {
        Self {
            plugin,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Instantiate a writable cell and announce it to the plugin.
    pub fn cell(&self, options: PersistOptions, initial: impl Into<Value>) -> Arc<Cell> {
        let events = self.events.clone();
        let cell = Arc::new_cyclic(|me| Cell {
            me: me.clone(),
            options,
            value: Mutex::new(initial.into()),
            events,
        });
        self.plugin
            .on_create(&Observable::Writable(cell.clone()))
            .expect("on_create failed");
        cell
    }

    /// Instantiate a derived, read-only cell and announce it to the plugin.
    pub fn derived(&self, options: PersistOptions, source: &Arc<Cell>) -> Arc<Derived> {
        let derived = Arc::new(Derived {
            options,
            source: source.clone(),
        });
        self.plugin
            .on_create(&Observable::ReadOnly(derived.clone()))
            .expect("on_create failed");
        derived
    }

    /// Deliver queued change events, in order.
    pub async fn flush(&self) -> PersistResult<()> {
        let events: Vec<_> = std::mem::take(&mut *self.events.lock().unwrap());
        for (observable, value, origin) in events {
            self.plugin.on_change(&observable, &value, origin).await?;
        }
        Ok(())
    }

    /// Set a value as application code would and deliver the change.
    pub async fn update(&self, cell: &Arc<Cell>, value: impl Into<Value>) -> PersistResult<()> {
        cell.set(value.into(), SetOrigin::User)
            .expect("cell rejected value");
        self.flush().await
    }

    pub fn queued_events(&self) -> Vec<SetOrigin> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, origin)| *origin)
            .collect()
    }
}

pub struct Cell {
    me: Weak<Cell>,
    options: PersistOptions,
    value: Mutex<Value>,
    events: EventQueue,
}

impl ReadableObservable for Cell {
    fn options(&self) -> &PersistOptions {
        &self.options
    }

    fn get(&self) -> Value {
        self.value.lock().unwrap().clone()
    }
}

impl WritableObservable for Cell {
    fn set(&self, value: Value, origin: SetOrigin) -> Result<(), ObservableError> {
        *self.value.lock().unwrap() = value.clone();
        if let Some(me) = self.me.upgrade() {
            self.events
                .lock()
                .unwrap()
                .push((Observable::Writable(me), value, origin));
        }
        Ok(())
    }
}

pub struct Derived {
    options: PersistOptions,
    source: Arc<Cell>,
}

impl ReadableObservable for Derived {
    fn options(&self) -> &PersistOptions {
        &self.options
    }

    fn get(&self) -> Value {
        self.source.get()
    }
}
