//! Process-wide table of saga correlation maps.
//!
//! Filled eagerly while sagas are registered at startup; lookups during
//! dispatch only read.

use std::any::{type_name, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use simplebus_core::{ConfigError, CorrelationMap, Saga};

/// A saga type name and the Rust type that claimed it.
#[derive(Debug)]
struct Registered {
    saga: TypeId,
    type_name: &'static str,
    map: Arc<CorrelationMap>,
}

impl Registered {
    fn claim<S: Saga>(&self) -> Result<Arc<CorrelationMap>, ConfigError> {
        if self.saga != TypeId::of::<S>() {
            return Err(ConfigError::SagaTypeConflict {
                saga_type: S::SAGA_TYPE,
                registered: self.type_name,
                conflicting: type_name::<S>(),
            });
        }
        Ok(Arc::clone(&self.map))
    }
}

/// Correlation maps keyed by saga type.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    maps: DashMap<&'static str, Registered>,
}

impl CorrelationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and stores the map of saga `S`.
    ///
    /// Registering the same saga type again returns the map built the first
    /// time; concurrent first registrations store exactly one map.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] reported by [`CorrelationMap::build`], or
    /// [`ConfigError::SagaTypeConflict`] if a different Rust type already
    /// registered under `S::SAGA_TYPE`.
    pub fn register<S: Saga>(&self) -> Result<Arc<CorrelationMap>, ConfigError> {
        if let Some(existing) = self.maps.get(S::SAGA_TYPE) {
            return existing.claim::<S>();
        }
        let built = Arc::new(CorrelationMap::build::<S>()?);
        self.maps
            .entry(S::SAGA_TYPE)
            .or_insert_with(|| Registered {
                saga: TypeId::of::<S>(),
                type_name: type_name::<S>(),
                map: built,
            })
            .claim::<S>()
    }

    /// Map of a registered saga type.
    #[must_use]
    pub fn get(&self, saga_type: &str) -> Option<Arc<CorrelationMap>> {
        self.maps.get(saga_type).map(|entry| Arc::clone(&entry.map))
    }

    /// Number of registered saga types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}
