//! First-boot defaults.
//!
//! Creates the `admin` user (with role `admin`) and an empty integration
//! document when they are missing. Safe to run on every start.
use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::integration::{INTEGRATION_CONFIG_KEY, IntegrationConfig};
use crate::model::{ObjectRef, UserMeta};
use crate::store::{InspektorStore, StoreError};

pub const ADMIN_USER: &str = "admin";
pub const ADMIN_ROLE: &str = "admin";

/// Hash a password with bcrypt off the async runtime.
pub async fn hash_password(password: &str) -> ControlPlaneResult<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
        .await
        .map_err(|err| ControlPlaneError::Internal(anyhow::anyhow!("hash task failed: {err}")))?
        .map_err(|err| ControlPlaneError::Internal(anyhow::anyhow!("hash password: {err}")))
}

pub async fn seed_defaults(
    store: &dyn InspektorStore,
    admin_password: &str,
) -> ControlPlaneResult<()> {
    let empty = serde_json::to_string(&IntegrationConfig::default())
        .map_err(|err| ControlPlaneError::Internal(err.into()))?;
    if store
        .kv_compare_and_swap(INTEGRATION_CONFIG_KEY, None, &empty)
        .await?
    {
        tracing::info!("initialized integration config");
    }

    match store.get_user_by_name(ADMIN_USER).await {
        Ok(_) => return Ok(()),
        Err(StoreError::NotFound(_)) => {}
        Err(err) => return Err(err.into()),
    }
    let password_hash = hash_password(admin_password).await?;
    let user = match store
        .create_user(ADMIN_USER, &password_hash, UserMeta::default())
        .await
    {
        Ok(user) => user,
        // Another replica seeded first.
        Err(StoreError::Conflict(_)) => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    store
        .insert_roles(ObjectRef::user(user.id), &[ADMIN_ROLE.to_string()])
        .await?;
    tracing::info!(user_id = user.id, "seeded default admin user");
    Ok(())
}
