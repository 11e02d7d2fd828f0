//! Live device inventory.
//!
//! The cache never enumerates hardware itself. Reserved "all-X" groups and
//! typed group creation ask an [`Inventory`] which entities currently exist.

use std::collections::BTreeMap;
use std::fmt::Debug;

use parking_lot::RwLock;

use crate::types::{EntityGroup, EntityId, EntityRef};

/// Answers which entities currently exist.
///
/// Implementations may be slow (device enumeration); callers never hold a
/// cache lock while calling into an inventory.
pub trait Inventory: Send + Sync + Debug {
    /// Returns the live entities of one kind, ordered by id.
    fn entities(&self, group: EntityGroup) -> Vec<EntityRef>;

    /// Returns `true` if the entity currently exists.
    fn contains(&self, entity: EntityRef) -> bool {
        self.entities(entity.group).contains(&entity)
    }
}

/// An inventory backed by an in-memory table.
///
/// Entities can be added and removed at runtime to model hot-plug.
#[derive(Debug, Default)]
pub struct StaticInventory {
    entities: RwLock<BTreeMap<EntityGroup, Vec<EntityId>>>,
}

impl StaticInventory {
    /// Creates an empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an inventory with `gpus` GPUs and `switches` switches,
    /// numbered from zero.
    #[must_use]
    pub fn with_devices(gpus: u32, switches: u32) -> Self {
        let inventory = Self::new();
        for id in 0..gpus {
            inventory.add(EntityRef::gpu(id));
        }
        for id in 0..switches {
            inventory.add(EntityRef::switch(id));
        }
        inventory
    }

    /// Adds an entity. Returns `false` if it was already present.
    pub fn add(&self, entity: EntityRef) -> bool {
        let mut entities = self.entities.write();
        let ids = entities.entry(entity.group).or_default();
        match ids.binary_search(&entity.id) {
            Ok(_) => false,
            Err(pos) => {
                ids.insert(pos, entity.id);
                true
            }
        }
    }

    /// Removes an entity. Returns `false` if it was not present.
    pub fn remove(&self, entity: EntityRef) -> bool {
        let mut entities = self.entities.write();
        let Some(ids) = entities.get_mut(&entity.group) else {
            return false;
        };
        match ids.binary_search(&entity.id) {
            Ok(pos) => {
                ids.remove(pos);
                true
            }
            Err(_) => false,
        }
    }
}

impl Inventory for StaticInventory {
    fn entities(&self, group: EntityGroup) -> Vec<EntityRef> {
        self.entities
            .read()
            .get(&group)
            .map(|ids| ids.iter().map(|id| EntityRef::new(group, *id)).collect())
            .unwrap_or_default()
    }

    fn contains(&self, entity: EntityRef) -> bool {
        self.entities
            .read()
            .get(&entity.group)
            .is_some_and(|ids| ids.binary_search(&entity.id).is_ok())
    }
}
