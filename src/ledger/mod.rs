//! Clearing ledger: allocation engine, settlement poster, and the unit of
//! work both commit through

pub mod allocation;
pub mod changeset;
pub mod core;
pub mod notes;
pub mod settlement;

pub use allocation::AllocationEngine;
pub use changeset::{ChangeSet, VersionedWrite, WorkingSet};
pub use self::core::ClearingService;
pub use notes::NoteManager;
pub use settlement::SettlementPoster;

use crate::traits::{PaymentStatusNotifier, TenantAccessResolver};
use crate::types::{ClearingError, ClearingResult, StatusNotification, TenantAccess};

/// Resolve the caller's tenant scope, refusing callers with none assigned
pub(crate) async fn require_tenant_access(
    resolver: &dyn TenantAccessResolver,
) -> ClearingResult<TenantAccess> {
    resolver.current_access().await?.ok_or_else(|| {
        ClearingError::Conflict(
            "User has no tenant access (board/employer) assigned for allocation".to_string(),
        )
    })
}

/// Deliver queued notifications after a successful commit. Best effort: a
/// failed delivery is logged and never unwinds the committed change set.
pub(crate) async fn dispatch_notifications(
    notifier: &dyn PaymentStatusNotifier,
    notifications: &[StatusNotification],
) {
    for notification in notifications {
        if let Err(err) = notifier
            .notify(notification.request_id, notification.status)
            .await
        {
            tracing::warn!(
                notification_id = %notification.id,
                request_id = notification.request_id,
                status = notification.status.as_str(),
                "payment status notification failed: {err}"
            );
        }
    }
}
