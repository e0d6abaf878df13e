//! Debit/credit adjustment notes: tenant-scoped bookkeeping annotations
//! against payment requests
//!
//! Notes never touch the balance triads or vouchers, so they write through
//! plain storage calls rather than the versioned change set.

use std::sync::Arc;

use crate::traits::{ClearingStorage, TenantAccessResolver};
use crate::types::*;
use crate::utils::validation::validate_positive_amount;

/// Hard cap on list sizes, matching the query surface the notes back
const MAX_LIST_LIMIT: usize = 200;

/// Manager for debit/credit notes over a [`ClearingStorage`] backend
pub struct NoteManager<S: ClearingStorage> {
    storage: S,
    tenants: Arc<dyn TenantAccessResolver>,
}

impl<S: ClearingStorage> NoteManager<S> {
    pub fn new(storage: S, tenants: Arc<dyn TenantAccessResolver>) -> Self {
        Self { storage, tenants }
    }

    /// Create a note stamped with the caller's tenant scope
    pub async fn create(&mut self, request: &DrcrNoteRequest) -> ClearingResult<DrcrNote> {
        let tenant = self.require_tenant_access().await?;
        let now = chrono::Utc::now().naive_utc();
        let note = DrcrNote {
            note_id: self.storage.reserve_note_id().await?,
            request_id: request.request_id,
            voucher_type: required_trimmed("voucherType", &request.voucher_type)?,
            narration: trim_to_none(request.narration.as_deref()),
            amount: validated_amount(&request.amount)?,
            description: trim_to_none(request.description.as_deref()),
            created_by: trim_to_none(request.created_by.as_deref())
                .or_else(|| Some("system".to_string())),
            board_id: tenant.board_id,
            employer_id: tenant.employer_id,
            toli_id: resolve_toli(request.toli_id, tenant.toli_id, None)?,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_note(&note).await?;
        Ok(note)
    }

    /// Notes for the caller's tenant, newest update first, optionally
    /// filtered by request and voucher type. The limit is clamped to
    /// 1..=200.
    pub async fn list(
        &self,
        request_id: Option<i64>,
        voucher_type: Option<&str>,
        limit: usize,
    ) -> ClearingResult<Vec<DrcrNote>> {
        let tenant = self.require_tenant_access().await?;
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        self.storage
            .search_notes(
                tenant.board_id,
                tenant.employer_id,
                request_id,
                trim_to_none(voucher_type).as_deref(),
                limit,
            )
            .await
    }

    /// Get a note; a note outside the caller's tenant scope is not found
    pub async fn get(&self, note_id: i64) -> ClearingResult<DrcrNote> {
        let tenant = self.require_tenant_access().await?;
        self.storage
            .find_note(note_id, tenant.board_id, tenant.employer_id)
            .await?
            .ok_or_else(|| {
                ClearingError::NotFound(format!("Debit/credit note not found: {note_id}"))
            })
    }

    /// Update a note in place. `created_by` is only overwritten when the
    /// payload supplies one.
    pub async fn update(
        &mut self,
        note_id: i64,
        request: &DrcrNoteRequest,
    ) -> ClearingResult<DrcrNote> {
        let tenant = self.require_tenant_access().await?;
        let mut note = self
            .storage
            .find_note(note_id, tenant.board_id, tenant.employer_id)
            .await?
            .ok_or_else(|| {
                ClearingError::NotFound(format!("Debit/credit note not found: {note_id}"))
            })?;
        note.request_id = request.request_id;
        note.voucher_type = required_trimmed("voucherType", &request.voucher_type)?;
        note.narration = trim_to_none(request.narration.as_deref());
        note.amount = validated_amount(&request.amount)?;
        note.description = trim_to_none(request.description.as_deref());
        note.toli_id = resolve_toli(request.toli_id, tenant.toli_id, note.toli_id)?;
        if let Some(created_by) = trim_to_none(request.created_by.as_deref()) {
            note.created_by = Some(created_by);
        }
        note.updated_at = chrono::Utc::now().naive_utc();
        self.storage.update_note(&note).await?;
        Ok(note)
    }

    /// Delete a note within the caller's tenant scope
    pub async fn delete(&mut self, note_id: i64) -> ClearingResult<()> {
        let tenant = self.require_tenant_access().await?;
        if self
            .storage
            .find_note(note_id, tenant.board_id, tenant.employer_id)
            .await?
            .is_none()
        {
            return Err(ClearingError::NotFound(format!(
                "Debit/credit note not found: {note_id}"
            )));
        }
        self.storage.delete_note(note_id).await
    }

    async fn require_tenant_access(&self) -> ClearingResult<TenantAccess> {
        self.tenants.current_access().await?.ok_or_else(|| {
            ClearingError::Conflict(
                "User has no tenant access (board/employer) to manage debit/credit notes"
                    .to_string(),
            )
        })
    }
}

/// The tenant's toli wins; a payload naming a different one is a conflict.
/// Without a tenant toli the payload's value applies, else the current one
/// is kept.
fn resolve_toli(
    requested: Option<i64>,
    tenant: Option<i64>,
    current: Option<i64>,
) -> ClearingResult<Option<i64>> {
    match tenant {
        Some(tenant_toli) => {
            if requested.is_some_and(|r| r != tenant_toli) {
                return Err(ClearingError::Conflict(
                    "Toli mismatch with tenant access".to_string(),
                ));
            }
            Ok(Some(tenant_toli))
        }
        None => Ok(requested.or(current)),
    }
}

fn validated_amount(amount: &bigdecimal::BigDecimal) -> ClearingResult<bigdecimal::BigDecimal> {
    validate_positive_amount("amount", amount)?;
    Ok(amount.clone())
}

fn required_trimmed(field: &str, value: &str) -> ClearingResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ClearingError::Validation(format!(
            "{field} must not be blank"
        )));
    }
    Ok(trimmed.to_string())
}

fn trim_to_none(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{MemoryStorage, StaticTenantAccess};
    use bigdecimal::BigDecimal;

    fn tenant() -> TenantAccess {
        TenantAccess::new(10, 20, None)
    }

    fn manager(storage: MemoryStorage) -> NoteManager<MemoryStorage> {
        NoteManager::new(storage, Arc::new(StaticTenantAccess::new(tenant())))
    }

    fn note_request(request_id: i64, voucher_type: &str, amount: i64) -> DrcrNoteRequest {
        DrcrNoteRequest {
            request_id,
            voucher_type: voucher_type.to_string(),
            narration: None,
            amount: BigDecimal::from(amount),
            description: None,
            toli_id: None,
            created_by: None,
        }
    }

    #[tokio::test]
    async fn create_trims_fields_and_defaults_created_by() {
        let mut manager = manager(MemoryStorage::new());
        let note = manager
            .create(&DrcrNoteRequest {
                narration: Some("  late fee  ".to_string()),
                description: Some("   ".to_string()),
                voucher_type: " DEBIT ".to_string(),
                ..note_request(100, "DEBIT", 50)
            })
            .await
            .unwrap();

        assert_eq!(note.voucher_type, "DEBIT");
        assert_eq!(note.narration.as_deref(), Some("late fee"));
        assert_eq!(note.description, None);
        assert_eq!(note.created_by.as_deref(), Some("system"));
        assert_eq!(note.board_id, 10);
        assert_eq!(note.employer_id, 20);
    }

    #[tokio::test]
    async fn non_positive_amount_and_blank_type_are_rejected() {
        let mut manager = manager(MemoryStorage::new());
        let err = manager
            .create(&note_request(100, "DEBIT", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::Validation(_)));

        let err = manager
            .create(&note_request(100, "   ", 50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClearingError::Validation(_)));
    }

    #[tokio::test]
    async fn toli_from_tenant_access_wins() {
        let storage = MemoryStorage::new();
        let mut manager = NoteManager::new(
            storage,
            Arc::new(StaticTenantAccess::new(TenantAccess::new(10, 20, Some(7)))),
        );

        let note = manager.create(&note_request(100, "CREDIT", 25)).await.unwrap();
        assert_eq!(note.toli_id, Some(7));

        let err = manager
            .create(&DrcrNoteRequest {
                toli_id: Some(8),
                ..note_request(100, "CREDIT", 25)
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Conflict: Toli mismatch with tenant access");
    }

    #[tokio::test]
    async fn notes_are_invisible_outside_their_tenant() {
        let storage = MemoryStorage::new();
        let mut owner = manager(storage.clone());
        let note = owner.create(&note_request(100, "DEBIT", 50)).await.unwrap();

        let stranger = NoteManager::new(
            storage,
            Arc::new(StaticTenantAccess::new(TenantAccess::new(99, 88, None))),
        );
        let err = stranger.get(note.note_id).await.unwrap_err();
        assert!(matches!(err, ClearingError::NotFound(_)));
        assert!(stranger.list(None, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_keeps_created_by_unless_supplied() {
        let mut manager = manager(MemoryStorage::new());
        let note = manager
            .create(&DrcrNoteRequest {
                created_by: Some("clerk".to_string()),
                ..note_request(100, "DEBIT", 50)
            })
            .await
            .unwrap();

        let updated = manager
            .update(
                note.note_id,
                &DrcrNoteRequest {
                    description: Some("adjusted".to_string()),
                    ..note_request(100, "DEBIT", 75)
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.amount, BigDecimal::from(75));
        assert_eq!(updated.created_by.as_deref(), Some("clerk"));
        assert_eq!(updated.description.as_deref(), Some("adjusted"));
    }

    #[tokio::test]
    async fn list_filters_by_request_and_case_insensitive_type() {
        let mut manager = manager(MemoryStorage::new());
        manager.create(&note_request(100, "DEBIT", 10)).await.unwrap();
        manager.create(&note_request(100, "CREDIT", 20)).await.unwrap();
        manager.create(&note_request(101, "DEBIT", 30)).await.unwrap();

        let debits = manager.list(Some(100), Some("debit"), 50).await.unwrap();
        assert_eq!(debits.len(), 1);
        assert_eq!(debits[0].amount, BigDecimal::from(10));

        // Newest first; zero limit is clamped up to one row
        let all = manager.list(None, None, 0).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].request_id, 101);
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let mut manager = manager(MemoryStorage::new());
        let note = manager.create(&note_request(100, "DEBIT", 50)).await.unwrap();
        manager.delete(note.note_id).await.unwrap();

        let err = manager.get(note.note_id).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Not found: Debit/credit note not found: {}", note.note_id)
        );
    }

    #[tokio::test]
    async fn caller_without_tenant_access_is_refused() {
        let mut manager = NoteManager::new(
            MemoryStorage::new(),
            Arc::new(StaticTenantAccess::absent()),
        );
        let err = manager
            .create(&note_request(100, "DEBIT", 50))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Conflict: User has no tenant access (board/employer) to manage debit/credit notes"
        );
    }
}
