//! Finalization protocol
//!
//! The finalizer token goes on before the first reconcile and comes off
//! only after the controller reported the external resource as terminated.
//! Releasing is one store call; the store removes the object once no
//! finalizer is left. Nothing about a partial finalize is remembered: the
//! next pass starts over.

use super::{Controller, Outcome, ReconcileContext};
use crate::crd::{DesiredObject, Phase, ResourceStatus};
use crate::domain::ports::ObjectStore;
use crate::error::Result;
use tracing::{debug, info};

/// Finalizer token owned by this operator
pub const FINALIZER: &str = "kit.k8s.sh/finalizer";

/// Add the token unless present. Returns whether it was added.
pub async fn ensure_finalizer(
    ctx: &ReconcileContext,
    store: &dyn ObjectStore,
    object: &DesiredObject,
) -> Result<bool> {
    if object.has_finalizer(FINALIZER) {
        return Ok(false);
    }

    let key = object.key();
    ctx.call("AddFinalizer", store.add_finalizer(&key, FINALIZER))
        .await?;
    debug!(key = %object.key(), "Finalizer added");
    Ok(true)
}

/// Run `finalize` and, once it reports [`Outcome::Terminated`], record the
/// status and release the token. Errors and waits keep the token.
pub async fn finalize_object(
    controller: &dyn Controller,
    ctx: &ReconcileContext,
    store: &dyn ObjectStore,
    object: &DesiredObject,
) -> Result<Outcome> {
    let outcome = controller.finalize(ctx, object).await?;
    if outcome != Outcome::Terminated || !object.has_finalizer(FINALIZER) {
        return Ok(outcome);
    }

    let key = object.key();
    let already_recorded = object
        .status()
        .is_some_and(|s| s.same_as(Phase::Terminated, None));
    if !already_recorded {
        let status = ResourceStatus::new(Phase::Terminated, None);
        match ctx
            .call("UpdateStatus", store.update_status(&key, &status))
            .await
        {
            Err(e) if e.is_not_found() => return Ok(outcome),
            other => other?,
        }
    }

    ctx.call("RemoveFinalizer", store.remove_finalizer(&key, FINALIZER))
        .await?;
    info!(%key, "Finalizer released");
    Ok(outcome)
}
