use lessor_common::InstanceState;
use serde_json::{json, Value};

use crate::error::LifecycleError;
use crate::registry::InstanceKey;
use crate::store::Records;

/// Move `key` to `to` when the transition is allowed (idempotent). `fields` are merged
/// into the record alongside the new state. The write only lands if the record is still
/// in the state that was checked. Returns false when the record is missing, already in
/// `to`, the transition is not allowed, or another writer moved it first.
pub async fn transition(
    records: &Records,
    key: &InstanceKey,
    to: InstanceState,
    fields: Value,
    reason: &str,
) -> Result<bool, LifecycleError> {
    let Some(current) = records.get_instance(&key.agreement_id, key.network).await? else {
        tracing::warn!("⚠️ [state_machine] {} -> {}: no record for {}", reason, to, key);
        return Ok(false);
    };

    if current.state == to {
        return Ok(false);
    }
    if !current.state.can_transition_to(to) {
        tracing::warn!(
            "⚠️ [state_machine] {}: refusing {} -> {} for {}",
            reason,
            current.state,
            to,
            key
        );
        return Ok(false);
    }

    let mut patch = match fields {
        Value::Object(map) => Value::Object(map),
        _ => json!({}),
    };
    patch["state"] = json!(to);

    let changed = records
        .update_instance_from(&key.agreement_id, key.network, current.state, patch)
        .await?;
    if changed {
        tracing::info!(
            "🔄 [state_machine] {}: {} -> {} ({})",
            key,
            current.state,
            to,
            reason
        );
    } else {
        tracing::debug!(
            "[state_machine] {}: {} -> {} lost to a concurrent update of {}",
            reason,
            current.state,
            to,
            key
        );
    }
    Ok(changed)
}

/// Creating -> Active. `fields` may carry a new `agreement_id`, which re-keys the record
/// from the placeholder to the marketplace-assigned id.
pub async fn creating_to_active(
    records: &Records,
    placeholder: &InstanceKey,
    fields: Value,
) -> Result<bool, LifecycleError> {
    transition(records, placeholder, InstanceState::Active, fields, "rental acquired").await
}

pub async fn mark_create_failed(
    records: &Records,
    key: &InstanceKey,
    details: &str,
) -> Result<bool, LifecycleError> {
    transition(
        records,
        key,
        InstanceState::CreateFailed,
        json!({ "details": details }),
        "creation failed",
    )
    .await
}

pub async fn mark_terminating(records: &Records, key: &InstanceKey, reason: &str) -> Result<bool, LifecycleError> {
    transition(records, key, InstanceState::Terminating, Value::Null, reason).await
}

/// Final state after teardown, or None when this call did not move the record
/// (missing, already terminal, or finalized concurrently).
pub async fn mark_torn_down(
    records: &Records,
    key: &InstanceKey,
    failed_phases: &[String],
) -> Result<Option<InstanceState>, LifecycleError> {
    let Some(current) = records.get_instance(&key.agreement_id, key.network).await? else {
        return Ok(None);
    };
    if current.state.is_terminal() {
        return Ok(None);
    }

    let (to, fields) = if failed_phases.is_empty() {
        (InstanceState::Terminated, Value::Null)
    } else {
        let details = format!("teardown failed in phase(s): {}", failed_phases.join(", "));
        if current.state.can_transition_to(InstanceState::Error) {
            (InstanceState::Error, json!({ "details": details }))
        } else {
            (InstanceState::Terminated, json!({ "details": details }))
        }
    };

    let changed = transition(records, key, to, fields, "teardown finished").await?;
    Ok(changed.then_some(to))
}

pub async fn retry_creation(records: &Records, key: &InstanceKey) -> Result<bool, LifecycleError> {
    transition(
        records,
        key,
        InstanceState::Creating,
        json!({ "details": null }),
        "retry requested",
    )
    .await
}
