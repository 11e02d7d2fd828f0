//! Entity groups and field groups.
//!
//! Both kinds live in their own [`Namespace`] with the same handle
//! allocation, name uniqueness and ceiling rules. Entity groups can also be
//! addressed through a reserved [`GroupHandle::AllOfKind`] handle, which is
//! resolved against the live [`Inventory`] on every call instead of a
//! stored member list.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::LimitsConfig;
use crate::error::{CacheError, Result};
use crate::inventory::Inventory;
use crate::registry::FieldRegistry;
use crate::types::{EntityGroup, EntityRef, FieldId};

/// Lowest wire id taken by reserved group handles.
const RESERVED_FLOOR: u32 = 0x7fff_fffb;

/// Identifier of an explicit entity group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a field group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldGroupId(pub u32);

impl fmt::Display for FieldGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A dynamic "every entity of some kind" group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservedGroup {
    /// Every GPU.
    AllGpus,
    /// Every switch.
    AllSwitches,
    /// Every GPU instance.
    AllInstances,
    /// Every compute instance.
    AllComputeInstances,
    /// Every entity of every kind.
    AllEntities,
}

impl ReservedGroup {
    /// All reserved groups.
    pub const ALL: [Self; 5] = [
        Self::AllGpus,
        Self::AllSwitches,
        Self::AllInstances,
        Self::AllComputeInstances,
        Self::AllEntities,
    ];

    /// Returns the wire handle.
    #[must_use]
    pub const fn wire_id(self) -> u32 {
        match self {
            Self::AllGpus => 0x7fff_ffff,
            Self::AllSwitches => 0x7fff_fffe,
            Self::AllInstances => 0x7fff_fffd,
            Self::AllComputeInstances => 0x7fff_fffc,
            Self::AllEntities => 0x7fff_fffb,
        }
    }

    /// Returns the canonical group name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AllGpus => "all_gpus",
            Self::AllSwitches => "all_switches",
            Self::AllInstances => "all_instances",
            Self::AllComputeInstances => "all_compute_instances",
            Self::AllEntities => "all_entities",
        }
    }

    /// Entity kinds this group expands to, in enumeration order.
    #[must_use]
    pub fn entity_groups(self) -> &'static [EntityGroup] {
        match self {
            Self::AllGpus => &[EntityGroup::Gpu],
            Self::AllSwitches => &[EntityGroup::Switch],
            Self::AllInstances => &[EntityGroup::GpuInstance],
            Self::AllComputeInstances => &[EntityGroup::ComputeInstance],
            Self::AllEntities => &EntityGroup::ALL,
        }
    }
}

/// Addresses an entity group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupHandle {
    /// A group created by a caller.
    Explicit(GroupId),
    /// A reserved group resolved against the live inventory.
    AllOfKind(ReservedGroup),
}

impl GroupHandle {
    /// Decodes a wire handle.
    #[must_use]
    pub fn from_wire(raw: u32) -> Self {
        ReservedGroup::ALL
            .into_iter()
            .find(|r| r.wire_id() == raw)
            .map_or(Self::Explicit(GroupId(raw)), Self::AllOfKind)
    }

    /// Encodes the handle for the wire.
    #[must_use]
    pub const fn to_wire(self) -> u32 {
        match self {
            Self::Explicit(id) => id.0,
            Self::AllOfKind(reserved) => reserved.wire_id(),
        }
    }
}

impl From<GroupId> for GroupHandle {
    fn from(id: GroupId) -> Self {
        Self::Explicit(id)
    }
}

impl From<ReservedGroup> for GroupHandle {
    fn from(reserved: ReservedGroup) -> Self {
        Self::AllOfKind(reserved)
    }
}

impl fmt::Display for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit(id) => write!(f, "{id}"),
            Self::AllOfKind(reserved) => f.write_str(reserved.name()),
        }
    }
}

/// Initial membership of a newly created entity group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    /// No members.
    Empty,
    /// Every GPU present at creation time.
    DefaultGpus,
    /// Every switch present at creation time.
    DefaultSwitches,
    /// Every GPU instance present at creation time.
    DefaultInstances,
    /// Every compute instance present at creation time.
    DefaultComputeInstances,
    /// Every entity present at creation time.
    DefaultEverything,
}

impl GroupType {
    /// The reserved group whose live members seed this type.
    #[must_use]
    pub const fn seed(self) -> Option<ReservedGroup> {
        match self {
            Self::Empty => None,
            Self::DefaultGpus => Some(ReservedGroup::AllGpus),
            Self::DefaultSwitches => Some(ReservedGroup::AllSwitches),
            Self::DefaultInstances => Some(ReservedGroup::AllInstances),
            Self::DefaultComputeInstances => Some(ReservedGroup::AllComputeInstances),
            Self::DefaultEverything => Some(ReservedGroup::AllEntities),
        }
    }
}

/// Name and members of an entity group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// The group handle.
    pub handle: GroupHandle,
    /// The group name.
    pub name: String,
    /// Current members.
    pub members: Vec<EntityRef>,
}

/// Name and members of a field group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldGroupInfo {
    /// The field group id.
    pub id: FieldGroupId,
    /// The group name.
    pub name: String,
    /// Member fields.
    pub fields: Vec<FieldId>,
}

#[derive(Debug, Clone)]
struct NamedGroup<M> {
    name: String,
    members: Vec<M>,
}

/// One kind of group: handle allocation plus name and size rules.
#[derive(Debug)]
struct Namespace<M> {
    kind: &'static str,
    max_groups: usize,
    max_members: usize,
    max_name_length: usize,
    next_id: u32,
    groups: BTreeMap<u32, NamedGroup<M>>,
}

impl<M: Copy + PartialEq + fmt::Display> Namespace<M> {
    fn new(kind: &'static str, max_groups: usize, max_members: usize, max_name_length: usize) -> Self {
        Self {
            kind,
            max_groups,
            max_members,
            max_name_length,
            next_id: 1,
            groups: BTreeMap::new(),
        }
    }

    fn create(&mut self, name: &str, members: Vec<M>) -> Result<u32> {
        if name.is_empty() {
            return Err(CacheError::bad_param(format!("{} name cannot be empty", self.kind)));
        }
        if name.len() > self.max_name_length {
            return Err(CacheError::bad_param(format!(
                "{} name exceeds {} bytes",
                self.kind, self.max_name_length
            )));
        }
        if self.groups.values().any(|g| g.name == name) {
            return Err(CacheError::DuplicateKey {
                key: format!("{} name {name}", self.kind),
            });
        }
        if self.groups.len() >= self.max_groups {
            return Err(CacheError::MaxLimit {
                what: self.kind,
                limit: self.max_groups,
            });
        }
        if members.len() > self.max_members {
            return Err(CacheError::MaxLimit {
                what: "group members",
                limit: self.max_members,
            });
        }
        for (i, member) in members.iter().enumerate() {
            if members[..i].contains(member) {
                return Err(CacheError::DuplicateKey {
                    key: format!("member {member}"),
                });
            }
        }

        let id = self.allocate();
        self.groups.insert(
            id,
            NamedGroup {
                name: name.to_string(),
                members,
            },
        );
        Ok(id)
    }

    fn allocate(&mut self) -> u32 {
        while self.groups.contains_key(&self.next_id) {
            self.advance();
        }
        let id = self.next_id;
        self.advance();
        id
    }

    fn advance(&mut self) {
        self.next_id = if self.next_id + 1 >= RESERVED_FLOOR { 1 } else { self.next_id + 1 };
    }

    fn get(&self, id: u32) -> Result<&NamedGroup<M>> {
        self.groups
            .get(&id)
            .ok_or_else(|| CacheError::bad_param(format!("unknown {} {id}", self.kind)))
    }

    fn get_mut(&mut self, id: u32) -> Result<&mut NamedGroup<M>> {
        let kind = self.kind;
        self.groups
            .get_mut(&id)
            .ok_or_else(|| CacheError::bad_param(format!("unknown {kind} {id}")))
    }

    fn destroy(&mut self, id: u32) -> Result<NamedGroup<M>> {
        self.groups
            .remove(&id)
            .ok_or_else(|| CacheError::bad_param(format!("unknown {} {id}", self.kind)))
    }

    fn add(&mut self, id: u32, member: M) -> Result<()> {
        let max_members = self.max_members;
        let group = self.get_mut(id)?;
        if group.members.contains(&member) {
            return Err(CacheError::DuplicateKey {
                key: format!("member {member}"),
            });
        }
        if group.members.len() >= max_members {
            return Err(CacheError::MaxLimit {
                what: "group members",
                limit: max_members,
            });
        }
        group.members.push(member);
        Ok(())
    }

    fn remove(&mut self, id: u32, member: M) -> Result<()> {
        let group = self.get_mut(id)?;
        let pos = group
            .members
            .iter()
            .position(|m| *m == member)
            .ok_or_else(|| CacheError::bad_param(format!("{member} is not a member of group {id}")))?;
        group.members.remove(pos);
        Ok(())
    }

    fn ids(&self) -> Vec<u32> {
        self.groups.keys().copied().collect()
    }
}

/// Directory of entity groups and field groups.
///
/// Each namespace has its own lock. Inventory calls never run under either.
#[derive(Debug)]
pub struct GroupDirectory {
    entity_groups: RwLock<Namespace<EntityRef>>,
    field_groups: RwLock<Namespace<FieldId>>,
    inventory: Arc<dyn Inventory>,
    registry: Arc<FieldRegistry>,
}

impl GroupDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new(limits: &LimitsConfig, inventory: Arc<dyn Inventory>, registry: Arc<FieldRegistry>) -> Self {
        Self {
            entity_groups: RwLock::new(Namespace::new(
                "entity group",
                limits.max_entity_groups,
                limits.max_entities_per_group,
                limits.max_group_name_length,
            )),
            field_groups: RwLock::new(Namespace::new(
                "field group",
                limits.max_field_groups,
                limits.max_fields_per_field_group,
                limits.max_group_name_length,
            )),
            inventory,
            registry,
        }
    }

    /// Creates an entity group seeded according to `group_type`.
    ///
    /// # Errors
    ///
    /// Fails with `DuplicateKey`, `MaxLimit` or `BadParam` as for
    /// [`GroupDirectory::create_group_with_members`].
    pub fn create_group(&self, name: &str, group_type: GroupType) -> Result<GroupId> {
        let members = group_type
            .seed()
            .map(|reserved| self.live_members(reserved))
            .unwrap_or_default();
        self.insert_group(name, members)
    }

    /// Creates an entity group with explicit initial members.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::DuplicateKey` if the name or a member repeats,
    /// `CacheError::MaxLimit` if the group or member ceiling is reached and
    /// `CacheError::BadParam` for an invalid name or an entity that does
    /// not exist.
    pub fn create_group_with_members(&self, name: &str, members: &[EntityRef]) -> Result<GroupId> {
        if let Some(missing) = members.iter().find(|e| !self.inventory.contains(**e)) {
            return Err(CacheError::bad_param(format!("entity {missing} does not exist")));
        }
        self.insert_group(name, members.to_vec())
    }

    fn insert_group(&self, name: &str, members: Vec<EntityRef>) -> Result<GroupId> {
        let count = members.len();
        let id = GroupId(self.entity_groups.write().create(name, members)?);
        info!(group_id = %id, name, members = count, "created entity group");
        Ok(id)
    }

    /// Destroys an entity group.
    ///
    /// Callers check for referencing watches first.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` if the group does not exist.
    pub fn destroy_group(&self, id: GroupId) -> Result<()> {
        let group = self.entity_groups.write().destroy(id.0)?;
        info!(group_id = %id, name = %group.name, "destroyed entity group");
        Ok(())
    }

    /// Adds an entity to a group.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::DuplicateKey` if already a member,
    /// `CacheError::MaxLimit` when full and `CacheError::BadParam` for an
    /// unknown group or entity.
    pub fn add_entity(&self, id: GroupId, entity: EntityRef) -> Result<()> {
        if !self.inventory.contains(entity) {
            return Err(CacheError::bad_param(format!("entity {entity} does not exist")));
        }
        self.entity_groups.write().add(id.0, entity)?;
        debug!(group_id = %id, entity = %entity, "added entity to group");
        Ok(())
    }

    /// Removes an entity from a group.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` for an unknown group or non-member.
    pub fn remove_entity(&self, id: GroupId, entity: EntityRef) -> Result<()> {
        self.entity_groups.write().remove(id.0, entity)?;
        debug!(group_id = %id, entity = %entity, "removed entity from group");
        Ok(())
    }

    /// Returns the members of a group in order.
    ///
    /// Reserved handles are resolved against the live inventory.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` for an unknown explicit group.
    pub fn resolve_members(&self, handle: GroupHandle) -> Result<Vec<EntityRef>> {
        match handle {
            GroupHandle::Explicit(id) => Ok(self.entity_groups.read().get(id.0)?.members.clone()),
            GroupHandle::AllOfKind(reserved) => Ok(self.live_members(reserved)),
        }
    }

    fn live_members(&self, reserved: ReservedGroup) -> Vec<EntityRef> {
        reserved
            .entity_groups()
            .iter()
            .flat_map(|group| self.inventory.entities(*group))
            .collect()
    }

    /// Returns `true` if the handle names a live group.
    #[must_use]
    pub fn contains_group(&self, handle: GroupHandle) -> bool {
        match handle {
            GroupHandle::Explicit(id) => self.entity_groups.read().groups.contains_key(&id.0),
            GroupHandle::AllOfKind(_) => true,
        }
    }

    /// Lists explicit entity groups.
    #[must_use]
    pub fn list_groups(&self) -> Vec<GroupId> {
        self.entity_groups.read().ids().into_iter().map(GroupId).collect()
    }

    /// Returns name and members of an entity group.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` for an unknown explicit group.
    pub fn group_info(&self, handle: GroupHandle) -> Result<GroupInfo> {
        match handle {
            GroupHandle::Explicit(id) => {
                let groups = self.entity_groups.read();
                let group = groups.get(id.0)?;
                Ok(GroupInfo {
                    handle,
                    name: group.name.clone(),
                    members: group.members.clone(),
                })
            }
            GroupHandle::AllOfKind(reserved) => Ok(GroupInfo {
                handle,
                name: reserved.name().to_string(),
                members: self.live_members(reserved),
            }),
        }
    }

    /// Creates a field group.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::UnknownField` for an unregistered field,
    /// `CacheError::DuplicateKey` for a repeated name or field and
    /// `CacheError::MaxLimit` if a ceiling is reached.
    pub fn create_field_group(&self, name: &str, fields: &[FieldId]) -> Result<FieldGroupId> {
        for field in fields {
            self.registry.describe(*field)?;
        }
        let id = FieldGroupId(self.field_groups.write().create(name, fields.to_vec())?);
        info!(field_group_id = %id, name, fields = fields.len(), "created field group");
        Ok(id)
    }

    /// Destroys a field group.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` if the field group does not exist.
    pub fn destroy_field_group(&self, id: FieldGroupId) -> Result<()> {
        let group = self.field_groups.write().destroy(id.0)?;
        info!(field_group_id = %id, name = %group.name, "destroyed field group");
        Ok(())
    }

    /// Adds a field to a field group.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::UnknownField`, `CacheError::DuplicateKey`,
    /// `CacheError::MaxLimit` or `CacheError::BadParam` for an unknown group.
    pub fn add_field(&self, id: FieldGroupId, field: FieldId) -> Result<()> {
        self.registry.describe(field)?;
        self.field_groups.write().add(id.0, field)
    }

    /// Removes a field from a field group.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` for an unknown group or non-member.
    pub fn remove_field(&self, id: FieldGroupId, field: FieldId) -> Result<()> {
        self.field_groups.write().remove(id.0, field)
    }

    /// Returns the fields of a field group in order.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` if the field group does not exist.
    pub fn field_group_fields(&self, id: FieldGroupId) -> Result<Vec<FieldId>> {
        Ok(self.field_groups.read().get(id.0)?.members.clone())
    }

    /// Returns `true` if the field group exists.
    #[must_use]
    pub fn contains_field_group(&self, id: FieldGroupId) -> bool {
        self.field_groups.read().groups.contains_key(&id.0)
    }

    /// Lists field groups.
    #[must_use]
    pub fn list_field_groups(&self) -> Vec<FieldGroupId> {
        self.field_groups.read().ids().into_iter().map(FieldGroupId).collect()
    }

    /// Returns name and fields of a field group.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::BadParam` if the field group does not exist.
    pub fn field_group_info(&self, id: FieldGroupId) -> Result<FieldGroupInfo> {
        let groups = self.field_groups.read();
        let group = groups.get(id.0)?;
        Ok(FieldGroupInfo {
            id,
            name: group.name.clone(),
            fields: group.members.clone(),
        })
    }
}
