//! Family registry.
//!
//! Holds every registered [`Family`] keyed by its numeric id. Ids are handed
//! out monotonically starting above the control family and are never reused,
//! even after the family that held one is unregistered. The control family is
//! registered by [`Registry::new`] and cannot be removed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::{debug, info};

use crate::control;
use crate::family::Family;
use crate::message::FamilyId;

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("family {0:?} is already registered")]
    DuplicateFamily(String),

    #[error("no family with id {0:#06x}")]
    UnknownFamily(FamilyId),

    #[error("no family named {0:?}")]
    NotFound(String),

    #[error("family {0:#06x} is reserved and cannot be unregistered")]
    ReservedFamily(FamilyId),

    #[error("family id space is exhausted")]
    IdsExhausted,
}

struct RegistryInner {
    families: BTreeMap<FamilyId, Arc<Family>>,
    names: HashMap<String, FamilyId>,
    next_id: u32,
}

impl RegistryInner {
    fn insert(&mut self, id: FamilyId, family: Family) {
        self.names.insert(family.name().to_string(), id);
        self.families.insert(id, Arc::new(family));
    }
}

/// Shared, thread-safe family registry.
///
/// Clones share the same underlying table.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
}

/// Non-owning handle held by the control family's handlers.
#[derive(Clone)]
pub(crate) struct RegistryRef(Weak<RwLock<RegistryInner>>);

impl RegistryRef {
    pub(crate) fn upgrade(&self) -> Option<Registry> {
        self.0.upgrade().map(|inner| Registry { inner })
    }
}

impl Registry {
    /// Create a registry holding only the control family.
    pub fn new() -> Self {
        let inner = Arc::new(RwLock::new(RegistryInner {
            families: BTreeMap::new(),
            names: HashMap::new(),
            next_id: u32::from(control::CONTROL_FAMILY_ID) + 1,
        }));
        let registry = Self { inner };
        let control = control::family(registry.downgrade());
        registry
            .write()
            .insert(control::CONTROL_FAMILY_ID, control);
        registry
    }

    pub(crate) fn downgrade(&self) -> RegistryRef {
        RegistryRef(Arc::downgrade(&self.inner))
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a family and return its freshly allocated id.
    pub fn register(&self, family: Family) -> Result<FamilyId, RegistryError> {
        let mut inner = self.write();
        if inner.names.contains_key(family.name()) {
            return Err(RegistryError::DuplicateFamily(family.name().to_string()));
        }
        let id = FamilyId::try_from(inner.next_id).map_err(|_| RegistryError::IdsExhausted)?;
        inner.next_id += 1;
        info!(
            family = family.name(),
            id,
            version = family.version(),
            "registered family"
        );
        inner.insert(id, family);
        Ok(id)
    }

    /// Remove a family. Its id is never handed out again.
    pub fn unregister(&self, id: FamilyId) -> Result<(), RegistryError> {
        if id == control::CONTROL_FAMILY_ID {
            return Err(RegistryError::ReservedFamily(id));
        }
        let mut inner = self.write();
        let family = inner
            .families
            .remove(&id)
            .ok_or(RegistryError::UnknownFamily(id))?;
        inner.names.remove(family.name());
        info!(family = family.name(), id, "unregistered family");
        Ok(())
    }

    /// Look up a family id by name.
    pub fn resolve(&self, name: &str) -> Result<FamilyId, RegistryError> {
        let id = self.read().names.get(name).copied();
        debug!(name, ?id, "resolve family");
        id.ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Fetch a registered family. The returned handle stays valid after the
    /// registry lock is released.
    pub fn get(&self, id: FamilyId) -> Option<Arc<Family>> {
        self.read().families.get(&id).cloned()
    }

    /// Snapshot of every registered family, ordered by id.
    pub fn families(&self) -> Vec<(FamilyId, Arc<Family>)> {
        self.read()
            .families
            .iter()
            .map(|(id, family)| (*id, Arc::clone(family)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().families.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("Registry")
            .field("families", &inner.names)
            .field("next_id", &inner.next_id)
            .finish()
    }
}
