//! Role bindings for users and data sources.
//!
//! Roles on a data source say who may request access to it; roles on a user say
//! what the user is entitled to. Names are unique per object.
use crate::error::ControlPlaneResult;
use crate::model::{ObjectRef, ObjectType};
use crate::store::InspektorStore;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone)]
pub struct RoleStore {
    store: Arc<dyn InspektorStore>,
}

impl RoleStore {
    pub fn new(store: Arc<dyn InspektorStore>) -> Self {
        Self { store }
    }

    /// Attach `names` to `object`; names already attached are left alone.
    pub async fn add_roles(&self, object: ObjectRef, names: &[String]) -> ControlPlaneResult<()> {
        self.store.insert_roles(object, names).await?;
        Ok(())
    }

    pub async fn roles_for(&self, object: ObjectRef) -> ControlPlaneResult<Vec<String>> {
        Ok(self.store.roles_for_object(object).await?)
    }

    /// Replace every role of `object` with `names`.
    pub async fn sync_roles(&self, object: ObjectRef, names: &[String]) -> ControlPlaneResult<()> {
        tracing::debug!(object_id = object.id, object_type = %object.kind, count = names.len(), "sync roles");
        self.store.replace_roles(object, names).await?;
        Ok(())
    }

    /// Ids of objects of `kind` holding at least one of `names`.
    pub async fn objects_with_any_role(
        &self,
        kind: ObjectType,
        names: &[String],
    ) -> ControlPlaneResult<Vec<i64>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.store.object_ids_for_roles(kind, names).await?)
    }

    pub async fn all_role_names(&self) -> ControlPlaneResult<Vec<String>> {
        Ok(self.store.distinct_role_names().await?)
    }

    /// True when `a` and `b` share at least one role.
    pub async fn has_common_role(&self, a: ObjectRef, b: ObjectRef) -> ControlPlaneResult<bool> {
        let left: HashSet<String> = self.roles_for(a).await?.into_iter().collect();
        let right = self.roles_for(b).await?;
        Ok(right.iter().any(|name| left.contains(name)))
    }
}
