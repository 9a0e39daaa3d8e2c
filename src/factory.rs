// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Shim factory registry
//!
//! The entry point the controller uses to instantiate shims: a
//! process-wide, lock-protected, ordered collection of factories keyed
//! by unique name. The registry owns no flow state.

use crate::error::ShimError;
use crate::ipcp::{IpcpId, ShimInstance, UpstreamPort};
use crate::name::AppName;
use std::sync::{Arc, Mutex};

/// Lifecycle hooks every shim family implements per factory name.
pub trait ShimFactory: Send + Sync {
    /// Instantiates a shim IPCP.
    fn create(
        &self,
        name: &AppName,
        id: IpcpId,
        upstream_port: UpstreamPort,
    ) -> Result<Arc<dyn ShimInstance>, ShimError>;

    /// Releases an instance previously returned by [`ShimFactory::create`],
    /// tearing down its flows and registrations first.
    fn destroy(&self, instance: Arc<dyn ShimInstance>) -> Result<(), ShimError>;

    /// Number of live instances created through this factory.
    fn instance_count(&self) -> usize;
}

/// Identifies one registered factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactoryHandle(u64);

struct FactoryEntry {
    handle: FactoryHandle,
    name: String,
    factory: Arc<dyn ShimFactory>,
}

/// The registry proper.
#[derive(Default)]
pub struct FactoryRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    factories: Vec<FactoryEntry>,
    next_handle: u64,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`; fails with
    /// [`ShimError::NameConflict`] if the name is taken.
    pub fn register(
        &self,
        name: &str,
        factory: Arc<dyn ShimFactory>,
    ) -> Result<FactoryHandle, ShimError> {
        let mut state = self.state.lock().unwrap();
        if state.factories.iter().any(|entry| entry.name == name) {
            return Err(ShimError::NameConflict(name.to_string()));
        }
        state.next_handle += 1;
        let handle = FactoryHandle(state.next_handle);
        state.factories.push(FactoryEntry {
            handle,
            name: name.to_string(),
            factory,
        });
        log::info!("factory '{name}' registered");
        Ok(handle)
    }

    /// Unregisters a factory; succeeds only once all its instances are
    /// destroyed.
    pub fn unregister(&self, handle: FactoryHandle) -> Result<(), ShimError> {
        let mut state = self.state.lock().unwrap();
        let pos = state
            .factories
            .iter()
            .position(|entry| entry.handle == handle)
            .ok_or_else(|| ShimError::NotFound("factory handle".to_string()))?;
        if state.factories[pos].factory.instance_count() != 0 {
            return Err(ShimError::WrongState(format!(
                "factory '{}' still has live instances",
                state.factories[pos].name
            )));
        }
        let entry = state.factories.remove(pos);
        log::info!("factory '{}' unregistered", entry.name);
        Ok(())
    }

    /// Looks a factory up by name.
    pub fn find(&self, name: &str) -> Option<FactoryHandle> {
        let state = self.state.lock().unwrap();
        state
            .factories
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.handle)
    }

    /// Creates an instance through the factory behind `handle`.
    pub fn create(
        &self,
        handle: FactoryHandle,
        name: &AppName,
        id: IpcpId,
        upstream_port: UpstreamPort,
    ) -> Result<Arc<dyn ShimInstance>, ShimError> {
        let factory = self.factory(handle)?;
        factory.create(name, id, upstream_port)
    }

    /// Destroys an instance through the factory behind `handle`.
    pub fn destroy(
        &self,
        handle: FactoryHandle,
        instance: Arc<dyn ShimInstance>,
    ) -> Result<(), ShimError> {
        let factory = self.factory(handle)?;
        factory.destroy(instance)
    }

    fn factory(&self, handle: FactoryHandle) -> Result<Arc<dyn ShimFactory>, ShimError> {
        let state = self.state.lock().unwrap();
        state
            .factories
            .iter()
            .find(|entry| entry.handle == handle)
            .map(|entry| entry.factory.clone())
            .ok_or_else(|| ShimError::NotFound("factory handle".to_string()))
    }
}
