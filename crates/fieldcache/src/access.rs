//! Field read authorization.

use std::collections::HashSet;
use std::fmt::Debug;

use crate::types::{FieldId, FieldKey};

/// Decides whether the caller may read a field on an entity.
///
/// Consulted by every query path; a denied key reads as
/// [`SampleStatus::NotPermissioned`](crate::types::SampleStatus).
pub trait AccessPolicy: Send + Sync + Debug {
    /// Returns `true` if the key may be read.
    fn permits(&self, key: FieldKey) -> bool;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn permits(&self, _key: FieldKey) -> bool {
        true
    }
}

/// Denies listed fields everywhere and listed keys individually.
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    fields: HashSet<FieldId>,
    keys: HashSet<FieldKey>,
}

impl DenyList {
    /// Creates an empty deny list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Denies a field on every entity.
    #[must_use]
    pub fn deny_field(mut self, field: FieldId) -> Self {
        self.fields.insert(field);
        self
    }

    /// Denies one field on one entity.
    #[must_use]
    pub fn deny_key(mut self, key: FieldKey) -> Self {
        self.keys.insert(key);
        self
    }
}

impl AccessPolicy for DenyList {
    fn permits(&self, key: FieldKey) -> bool {
        !self.fields.contains(&key.field) && !self.keys.contains(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityRef;

    #[test]
    fn deny_list_blocks_fields_and_keys() {
        let blocked = FieldKey::new(EntityRef::gpu(1), FieldId(150));
        let policy = DenyList::new().deny_field(FieldId(54)).deny_key(blocked);

        assert!(!policy.permits(FieldKey::new(EntityRef::gpu(0), FieldId(54))));
        assert!(!policy.permits(blocked));
        assert!(policy.permits(FieldKey::new(EntityRef::gpu(0), FieldId(150))));
        assert!(AllowAll.permits(blocked));
    }
}
