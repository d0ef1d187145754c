//! Credential rotation.
//!
//! The record's password is the desired one; the previous-password
//! annotation holds the last password known to work on both the BMC and
//! the aggregation service. Both are ciphertext. A rotation only moves the
//! annotation forward once both sides accepted the new password, and any
//! failure rolls the record back to the previous password.

use serde_json::json;
use tracing::{debug, info, warn};

use super::{bmc, EngineError, ReconcileContext};
use crate::redfish::types::{Account, ACCOUNTS};
use crate::redfish::{Method, RedfishApi, RedfishApiExt};
use crate::state::records::{BmcRecord, PREVIOUS_PASSWORD_ANNOTATION};
use crate::state::ResourceStoreExt;
use crate::task_monitor::OperationKind;

/// Rotate the BMC password if the record asks for a new one.
pub async fn rotate_if_needed(ctx: &ReconcileContext, record: &BmcRecord) -> Result<(), EngineError> {
    let desired_ciphertext = record.spec.credentials.password.as_str();
    if desired_ciphertext.is_empty() {
        return Ok(());
    }

    let Some(previous_ciphertext) = record.meta.annotations.get(PREVIOUS_PASSWORD_ANNOTATION)
    else {
        // First sight: the current password is the known-good one.
        let mut seeded = record.clone();
        seeded.meta.annotations.insert(
            PREVIOUS_PASSWORD_ANNOTATION.to_string(),
            desired_ciphertext.to_string(),
        );
        ctx.store.update(&seeded).await?;
        debug!(bmc = %record.meta.name, "Previous password initialized");
        return Ok(());
    };

    // Nothing is written unless both passwords decrypt.
    let previous = ctx.cipher.decrypt(previous_ciphertext)?;
    let desired = ctx.cipher.decrypt(desired_ciphertext)?;
    if previous == desired {
        return Ok(());
    }

    info!(bmc = %record.meta.name, "Password change requested, rotating");
    match rotate(ctx, record, &previous, &desired).await {
        Ok(()) => {
            let current = ctx.cipher.encrypt(&desired)?;
            commit(ctx, &record.meta.name, &current, true).await?;
            info!(bmc = %record.meta.name, "Password rotated");
            Ok(())
        }
        Err(e) => {
            warn!(bmc = %record.meta.name, error = %e, "Password rotation failed, rolling back");
            let restored = ctx.cipher.encrypt(&previous)?;
            commit(ctx, &record.meta.name, &restored, false).await?;
            Err(e)
        }
    }
}

async fn rotate(
    ctx: &ReconcileContext,
    record: &BmcRecord,
    previous: &str,
    desired: &str,
) -> Result<(), EngineError> {
    let username = record.spec.credentials.username.as_str();
    let direct = ctx
        .connector
        .connect(&record.spec.address, username, previous)?;

    set_bmc_password(ctx, direct.as_ref(), username, desired).await?;

    if let Err(e) = set_source_password(ctx, record, username, desired).await {
        // The BMC already took the new password; put the old one back so
        // the aggregation service keeps working.
        let restored = ctx
            .connector
            .connect(&record.spec.address, username, desired)
            .map_err(EngineError::from);
        match restored {
            Ok(api) => {
                if let Err(restore_error) =
                    set_bmc_password(ctx, api.as_ref(), username, previous).await
                {
                    warn!(bmc = %record.meta.name, error = %restore_error, "Could not restore BMC password");
                }
            }
            Err(restore_error) => {
                warn!(bmc = %record.meta.name, error = %restore_error, "Could not reconnect to restore BMC password");
            }
        }
        return Err(e);
    }

    Ok(())
}

async fn set_bmc_password(
    ctx: &ReconcileContext,
    api: &dyn RedfishApi,
    username: &str,
    password: &str,
) -> Result<(), EngineError> {
    let mut account_path = None;
    for member in api.list_members(ACCOUNTS).await? {
        let account: Account = api.get_as(&member.odata_id).await?;
        if account.user_name.as_deref() == Some(username) {
            account_path = Some(member.odata_id);
            break;
        }
    }
    let account_path = account_path
        .ok_or_else(|| EngineError::Invalid(format!("no account named {username} on BMC")))?;

    ctx.monitor
        .execute(
            api,
            Method::Patch,
            &account_path,
            Some(&json!({ "Password": password })),
            OperationKind::UpdateCredentials,
        )
        .await?;
    Ok(())
}

async fn set_source_password(
    ctx: &ReconcileContext,
    record: &BmcRecord,
    username: &str,
    password: &str,
) -> Result<(), EngineError> {
    let source = match &record.status.aggregation_source {
        Some(path) => path.clone(),
        None => {
            let system_id = record
                .system_id()
                .ok_or_else(|| EngineError::Invalid("BMC has no system".to_string()))?;
            bmc::source_for_system(ctx, system_id)
                .await?
                .map(|(path, _)| path)
                .ok_or_else(|| EngineError::Invalid("no aggregation source for BMC".to_string()))?
        }
    };

    ctx.monitor
        .execute(
            ctx.api(),
            Method::Patch,
            &source,
            Some(&json!({ "UserName": username, "Password": password })),
            OperationKind::UpdateCredentials,
        )
        .await?;
    Ok(())
}

/// Store `ciphertext` as the record password, and as the previous
/// password when the rotation succeeded.
async fn commit(
    ctx: &ReconcileContext,
    bmc: &str,
    ciphertext: &str,
    succeeded: bool,
) -> Result<(), EngineError> {
    let Some(mut record) = ctx.load_bmc(bmc).await? else {
        return Ok(());
    };
    record.spec.credentials.password = ciphertext.to_string();
    if succeeded {
        record.meta.annotations.insert(
            PREVIOUS_PASSWORD_ANNOTATION.to_string(),
            ciphertext.to_string(),
        );
    }
    ctx.store.update(&record).await?;
    Ok(())
}
