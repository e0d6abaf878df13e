//! Allocation engine: applying bank-transaction funds against payment
//! requests
//!
//! A batch is processed as one atomic unit of work. Later items observe
//! earlier items' staged effects, and a request that becomes fully funded
//! mid-batch triggers settlement inside the same commit.

use std::sync::Arc;

use crate::ledger::changeset::WorkingSet;
use crate::ledger::settlement;
use crate::ledger::{dispatch_notifications, require_tenant_access};
use crate::status::StatusCache;
use crate::traits::{ClearingStorage, PaymentStatusNotifier, TenantAccessResolver};
use crate::types::*;
use crate::utils::validation::{normalize_idempotency_key, validate_positive_amount};

/// Allocation engine over a [`ClearingStorage`] backend
pub struct AllocationEngine<S: ClearingStorage> {
    storage: S,
    statuses: StatusCache,
    tenants: Arc<dyn TenantAccessResolver>,
    notifier: Arc<dyn PaymentStatusNotifier>,
}

impl<S: ClearingStorage> AllocationEngine<S> {
    pub fn new(
        storage: S,
        statuses: StatusCache,
        tenants: Arc<dyn TenantAccessResolver>,
        notifier: Arc<dyn PaymentStatusNotifier>,
    ) -> Self {
        Self {
            storage,
            statuses,
            tenants,
            notifier,
        }
    }

    /// Apply a batch of allocations atomically.
    ///
    /// Either every item lands (with any settlements it triggered) or the
    /// ledger is untouched. Results come back in batch order.
    pub async fn apply_allocations(
        &mut self,
        batch: &[AllocationRequest],
    ) -> ClearingResult<Vec<AllocationResult>> {
        if batch.is_empty() {
            return Err(ClearingError::Validation(
                "Allocation batch must not be empty".to_string(),
            ));
        }
        let tenant = require_tenant_access(self.tenants.as_ref()).await?;

        let mut work = WorkingSet::new(&self.storage);
        let mut notifications = Vec::new();
        let mut results = Vec::with_capacity(batch.len());
        for item in batch {
            let result =
                apply_one(&mut work, &self.statuses, &tenant, item, &mut notifications).await?;
            results.push(result);
        }

        let changes = work.into_change_set();
        if !changes.is_empty() {
            self.storage.apply(changes).await?;
        }
        dispatch_notifications(self.notifier.as_ref(), &notifications).await;
        Ok(results)
    }

    /// Apply allocations in the legacy wire shape: a bare object yields a
    /// bare object, a list yields a list.
    pub async fn apply_allocation_input(
        &mut self,
        input: AllocationInput,
    ) -> ClearingResult<AllocationOutput> {
        match input {
            AllocationInput::Batch(items) => {
                let results = self.apply_allocations(&items).await?;
                Ok(AllocationOutput::Batch(results))
            }
            AllocationInput::Single(item) => {
                let mut results = self.apply_allocations(std::slice::from_ref(&item)).await?;
                Ok(AllocationOutput::Single(Box::new(results.remove(0))))
            }
        }
    }
}

/// Apply a single allocation instruction into the working set
async fn apply_one<S: ClearingStorage>(
    work: &mut WorkingSet<'_, S>,
    statuses: &StatusCache,
    tenant: &TenantAccess,
    item: &AllocationRequest,
    notifications: &mut Vec<StatusNotification>,
) -> ClearingResult<AllocationResult> {
    validate_positive_amount("requestedAmount", &item.requested_amount)?;
    validate_positive_amount("allocatedAmount", &item.allocated_amount)?;

    // Idempotency replay: the same key with the same payload returns the
    // stored allocation untouched; a different payload is a misuse.
    let idempotency_key = normalize_idempotency_key(item.idempotency_key.as_deref());
    if let Some(key) = &idempotency_key {
        if let Some(existing) = work.allocation_by_idempotency_key(key).await? {
            if existing.request_id != item.request_id
                || existing.bank_txn_id != item.bank_txn_id
                || existing.allocated_amount != item.allocated_amount
            {
                return Err(ClearingError::Conflict(
                    "Idempotency key already used for a different allocation payload".to_string(),
                ));
            }
            return Ok(AllocationResult {
                allocation_id: existing.allocation_id,
                request_id: existing.request_id,
                bank_txn_id: existing.bank_txn_id,
                allocated_amount: existing.allocated_amount,
                remaining_amount: None,
                status_id: existing.status_id,
                status: existing.status,
            });
        }
    }

    if work
        .allocation_for_pair(item.request_id, item.bank_txn_id)
        .await?
        .is_some()
    {
        return Err(ClearingError::Conflict(
            "Allocation already exists for this request and bank transaction".to_string(),
        ));
    }

    let mut txn = work
        .bank_transaction(item.bank_txn_id)
        .await?
        .ok_or_else(|| {
            ClearingError::NotFound(format!("Bank transaction not found: {}", item.bank_txn_id))
        })?;
    if !tenant.covers(txn.board_id, txn.employer_id) {
        return Err(ClearingError::Conflict(format!(
            "Tenant mismatch for bank transaction {}",
            txn.bank_txn_id
        )));
    }
    if txn.remaining_amount < item.allocated_amount {
        return Err(ClearingError::Conflict(format!(
            "Insufficient funds on bank transaction {}: remaining {}, requested {}",
            txn.bank_txn_id, txn.remaining_amount, item.allocated_amount
        )));
    }
    txn.apply_allocation(&item.allocated_amount);
    txn.status_id = Some(
        statuses
            .require_id(status_domain::BANK_TRANSACTION, txn.status.as_str())
            .await?,
    );
    let txn_remaining = txn.remaining_amount.clone();
    work.stage_bank_transaction(txn);

    let allocation_id = work.reserve_allocation_id().await?;
    let now = chrono::Utc::now().naive_utc();
    let allocation = PaymentAllocation {
        allocation_id,
        request_id: item.request_id,
        bank_txn_id: item.bank_txn_id,
        allocated_amount: item.allocated_amount.clone(),
        allocation_date: item
            .allocation_date
            .unwrap_or_else(|| chrono::Utc::now().date_naive()),
        allocated_by: item.allocated_by.clone(),
        idempotency_key,
        voucher_id: None,
        status: AllocationStatus::Allocated,
        status_id: Some(
            statuses
                .require_id(
                    status_domain::PAYMENT_ALLOCATION,
                    AllocationStatus::Allocated.as_str(),
                )
                .await?,
        ),
        board_id: tenant.board_id,
        employer_id: tenant.employer_id,
        toli_id: tenant.toli_id,
        created_at: now,
        updated_at: now,
    };
    work.stage_new_allocation(allocation.clone());

    // Upsert the per-request settlement tracker. The total is fixed by the
    // first allocation; every later instruction must agree with it.
    let mut settlement_row = match work.settlement_for_request(item.request_id).await? {
        Some(existing) => {
            if !tenant.covers(existing.board_id, existing.employer_id) {
                return Err(ClearingError::Conflict(format!(
                    "Tenant mismatch for request settlement {}",
                    item.request_id
                )));
            }
            if existing.total_amount != item.requested_amount {
                return Err(ClearingError::Conflict(format!(
                    "Request total mismatch for request {}: expected {}, got {}",
                    item.request_id, existing.total_amount, item.requested_amount
                )));
            }
            existing
        }
        None => RequestSettlement::new(item.request_id, item.requested_amount.clone(), tenant),
    };
    settlement_row.apply_allocation(&item.allocated_amount)?;
    settlement_row.status_id = Some(
        statuses
            .require_id(
                status_domain::REQUEST_SETTLEMENT,
                settlement_row.status.as_str(),
            )
            .await?,
    );
    let fully_allocated = settlement_row.is_fully_allocated();
    let unsettled = settlement_row.voucher_id.is_none();
    work.stage_settlement(settlement_row);

    if fully_allocated && unsettled {
        // Fully funded: post the voucher in the same unit of work, consuming
        // every allocation still unlinked for this request
        let unlinked = work.unlinked_allocations(item.request_id).await?;
        let breakdown: Vec<AllocationBreakdown> = unlinked
            .iter()
            .map(|row| AllocationBreakdown {
                bank_txn_id: row.bank_txn_id,
                amount: row.allocated_amount.clone(),
            })
            .collect();
        let total_amount = breakdown.iter().map(|entry| &entry.amount).sum();
        tracing::debug!(
            request_id = item.request_id,
            allocations = breakdown.len(),
            "request fully funded, posting settlement"
        );
        let instruction = SettlementRequest {
            request_id: item.request_id,
            total_amount,
            idempotency_key: None,
            allocations: breakdown,
        };
        let posted = settlement::post_into(work, statuses, tenant, &instruction).await?;
        if let Some(notification) = posted.notification {
            notifications.push(notification);
        }
    } else {
        let status = if fully_allocated {
            ReconciliationStatus::Reconciled
        } else {
            ReconciliationStatus::Partial
        };
        notifications.push(StatusNotification::new(item.request_id, status));
    }

    Ok(AllocationResult {
        allocation_id,
        request_id: item.request_id,
        bank_txn_id: item.bank_txn_id,
        allocated_amount: item.allocated_amount.clone(),
        remaining_amount: Some(txn_remaining),
        status_id: allocation.status_id,
        status: allocation.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{MemoryStorage, StaticStatusSource, StaticTenantAccess};
    use bigdecimal::BigDecimal;
    use chrono::NaiveDate;
    use std::str::FromStr;

    fn tenant() -> TenantAccess {
        TenantAccess::new(10, 20, Some(30))
    }

    fn engine(storage: MemoryStorage) -> AllocationEngine<MemoryStorage> {
        AllocationEngine::new(
            storage,
            StatusCache::new(Arc::new(StaticStatusSource::with_defaults())),
            Arc::new(StaticTenantAccess::new(tenant())),
            Arc::new(crate::utils::LoggingNotifier),
        )
    }

    async fn seed_txn(storage: &mut MemoryStorage, id: i64, amount: i64) {
        let txn = BankTransaction::new(
            id,
            5,
            BigDecimal::from(amount),
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            &tenant(),
        );
        storage.insert_bank_transaction(&txn).await.unwrap();
    }

    fn request(request_id: i64, bank_txn_id: i64, requested: i64, allocated: i64) -> AllocationRequest {
        AllocationRequest {
            request_id,
            bank_txn_id,
            requested_amount: BigDecimal::from(requested),
            allocated_amount: BigDecimal::from(allocated),
            allocation_date: Some(NaiveDate::from_ymd_opt(2025, 3, 2).unwrap()),
            allocated_by: Some("clerk".to_string()),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn caller_without_tenant_access_is_refused() {
        let mut storage = MemoryStorage::new();
        seed_txn(&mut storage, 1, 500).await;
        let mut engine = AllocationEngine::new(
            storage,
            StatusCache::new(Arc::new(StaticStatusSource::with_defaults())),
            Arc::new(StaticTenantAccess::absent()),
            Arc::new(crate::utils::LoggingNotifier),
        );
        let err = engine
            .apply_allocations(&[request(100, 1, 300, 200)])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Conflict: User has no tenant access (board/employer) assigned for allocation"
        );
    }

    #[tokio::test]
    async fn two_requests_share_one_bank_transaction() {
        let mut storage = MemoryStorage::new();
        seed_txn(&mut storage, 1, 500).await;

        let mut engine = engine(storage.clone());
        let results = engine
            .apply_allocations(&[request(100, 1, 300, 100), request(101, 1, 400, 80)])
            .await
            .unwrap();

        assert_eq!(results[0].remaining_amount, Some(BigDecimal::from(400)));
        assert_eq!(results[1].remaining_amount, Some(BigDecimal::from(320)));

        let txn = storage.get_bank_transaction(1).await.unwrap().unwrap();
        assert_eq!(txn.allocated_amount, BigDecimal::from(180));
        assert_eq!(txn.remaining_amount, BigDecimal::from(320));
        assert_eq!(txn.status, BankTxnStatus::PartiallyAllocated);
        assert!(!txn.is_settled);
    }

    #[tokio::test]
    async fn partial_funding_tracks_settlement_remainder() {
        let mut storage = MemoryStorage::new();
        seed_txn(&mut storage, 1, 300).await;
        seed_txn(&mut storage, 2, 400).await;

        // One request drawing from two bank transactions
        let mut engine = engine(storage.clone());
        engine
            .apply_allocations(&[request(100, 1, 300, 150), request(100, 2, 300, 100)])
            .await
            .unwrap();

        let settlement = storage
            .find_settlement_for_request(100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settlement.allocated_amount, BigDecimal::from(250));
        assert_eq!(settlement.remaining_amount, BigDecimal::from(50));
        assert_eq!(settlement.status, SettlementStatus::Allocated);
        assert!(settlement.voucher_id.is_none());

        let txn1 = storage.get_bank_transaction(1).await.unwrap().unwrap();
        assert_eq!(txn1.remaining_amount, BigDecimal::from(150));
        let txn2 = storage.get_bank_transaction(2).await.unwrap().unwrap();
        assert_eq!(txn2.remaining_amount, BigDecimal::from(300));
    }

    #[tokio::test]
    async fn full_funding_posts_a_voucher_in_the_same_commit() {
        let mut storage = MemoryStorage::new();
        seed_txn(&mut storage, 1, 300).await;
        seed_txn(&mut storage, 2, 400).await;

        let mut engine = engine(storage.clone());
        engine
            .apply_allocations(&[request(100, 1, 450, 150), request(100, 2, 450, 300)])
            .await
            .unwrap();

        let settlement = storage
            .find_settlement_for_request(100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settlement.status, SettlementStatus::Settled);
        let voucher_id = settlement.voucher_id.unwrap();

        let voucher = storage.get_voucher(voucher_id).await.unwrap().unwrap();
        assert_eq!(voucher.status, VoucherStatus::Posted);
        assert_eq!(voucher.voucher_number, "REQ-100");
        assert_eq!(voucher.total_debit, BigDecimal::from(450));
        assert_eq!(voucher.total_debit, voucher.total_credit);

        // One debit plus one credit per consumed allocation
        let lines = storage.get_voucher_lines(voucher_id).await.unwrap();
        assert_eq!(lines.len(), 3);

        for row in storage.find_allocations_for_request(100).await.unwrap() {
            assert_eq!(row.voucher_id, Some(voucher_id));
            assert_eq!(row.status, AllocationStatus::Settled);
        }
    }

    #[tokio::test]
    async fn duplicate_pair_fails_the_whole_batch() {
        let mut storage = MemoryStorage::new();
        seed_txn(&mut storage, 1, 500).await;

        let mut engine = engine(storage.clone());
        let err = engine
            .apply_allocations(&[request(100, 1, 300, 100), request(100, 1, 300, 50)])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Conflict: Allocation already exists for this request and bank transaction"
        );

        // Atomic: the first item did not land either
        let txn = storage.get_bank_transaction(1).await.unwrap().unwrap();
        assert_eq!(txn.remaining_amount, BigDecimal::from(500));
        assert!(storage
            .find_allocations_for_request(100)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn insufficient_funds_carries_both_amounts() {
        let mut storage = MemoryStorage::new();
        seed_txn(&mut storage, 1, 500).await;

        let mut engine = engine(storage);
        let err = engine
            .apply_allocations(&[request(100, 1, 600, 600)])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Conflict: Insufficient funds on bank transaction 1: remaining 500, requested 600"
        );
    }

    #[tokio::test]
    async fn insufficient_funds_keeps_decimal_scale_in_the_message() {
        let mut storage = MemoryStorage::new();
        let txn = BankTransaction::new(
            1,
            5,
            BigDecimal::from_str("25.00").unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            &tenant(),
        );
        storage.insert_bank_transaction(&txn).await.unwrap();

        let mut engine = engine(storage);
        let mut item = request(100, 1, 30, 30);
        item.requested_amount = BigDecimal::from_str("30.00").unwrap();
        item.allocated_amount = BigDecimal::from_str("30.00").unwrap();
        let err = engine
            .apply_allocations(std::slice::from_ref(&item))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Conflict: Insufficient funds on bank transaction 1: remaining 25.00, requested 30.00"
        );
    }

    #[tokio::test]
    async fn bank_transaction_of_another_tenant_is_a_conflict() {
        let mut storage = MemoryStorage::new();
        let foreign = BankTransaction::new(
            1,
            5,
            BigDecimal::from(500),
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            &TenantAccess::new(99, 88, None),
        );
        storage.insert_bank_transaction(&foreign).await.unwrap();

        let mut engine = engine(storage.clone());
        let err = engine
            .apply_allocations(&[request(100, 1, 300, 100)])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Conflict: Tenant mismatch for bank transaction 1"
        );

        // Nothing was staged against the foreign row
        let txn = storage.get_bank_transaction(1).await.unwrap().unwrap();
        assert_eq!(txn.remaining_amount, BigDecimal::from(500));
    }

    #[tokio::test]
    async fn unknown_bank_transaction_is_not_found() {
        let mut engine = engine(MemoryStorage::new());
        let err = engine
            .apply_allocations(&[request(100, 77, 300, 100)])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Not found: Bank transaction not found: 77");
    }

    #[tokio::test]
    async fn idempotency_key_replays_without_reapplying() {
        let mut storage = MemoryStorage::new();
        seed_txn(&mut storage, 1, 500).await;

        let mut item = request(100, 1, 300, 200);
        item.idempotency_key = Some("alloc-100-1".to_string());

        let mut engine = engine(storage.clone());
        let first = engine
            .apply_allocations(std::slice::from_ref(&item))
            .await
            .unwrap();
        let replay = engine
            .apply_allocations(std::slice::from_ref(&item))
            .await
            .unwrap();

        assert_eq!(replay[0].allocation_id, first[0].allocation_id);
        assert_eq!(replay[0].remaining_amount, None);

        // Balances unchanged, still a single allocation row
        let txn = storage.get_bank_transaction(1).await.unwrap().unwrap();
        assert_eq!(txn.remaining_amount, BigDecimal::from(300));
        assert_eq!(
            storage
                .find_allocations_for_request(100)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn idempotency_key_with_different_payload_is_a_conflict() {
        let mut storage = MemoryStorage::new();
        seed_txn(&mut storage, 1, 500).await;
        seed_txn(&mut storage, 2, 500).await;

        let mut first = request(100, 1, 300, 200);
        first.idempotency_key = Some("alloc-key".to_string());
        let mut second = request(101, 2, 300, 100);
        second.idempotency_key = Some("alloc-key".to_string());

        let mut engine = engine(storage);
        engine
            .apply_allocations(std::slice::from_ref(&first))
            .await
            .unwrap();
        let err = engine
            .apply_allocations(std::slice::from_ref(&second))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Conflict: Idempotency key already used for a different allocation payload"
        );
    }

    #[tokio::test]
    async fn request_total_must_match_the_existing_settlement() {
        let mut storage = MemoryStorage::new();
        seed_txn(&mut storage, 1, 500).await;
        seed_txn(&mut storage, 2, 500).await;

        let mut engine = engine(storage);
        engine
            .apply_allocations(&[request(100, 1, 300, 100)])
            .await
            .unwrap();
        let err = engine
            .apply_allocations(&[request(100, 2, 350, 100)])
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Request total mismatch for request 100"));
    }

    #[tokio::test]
    async fn single_object_input_yields_a_single_object() {
        let mut storage = MemoryStorage::new();
        seed_txn(&mut storage, 1, 500).await;

        let mut engine = engine(storage);
        let input: AllocationInput = serde_json::from_str(
            r#"{"requestId": 100, "bankTxnId": 1, "requestedAmount": "300", "allocatedAmount": "200"}"#,
        )
        .unwrap();
        match engine.apply_allocation_input(input).await.unwrap() {
            AllocationOutput::Single(result) => {
                assert_eq!(result.request_id, 100);
                assert_eq!(result.remaining_amount, Some(BigDecimal::from(300)));
            }
            AllocationOutput::Batch(_) => panic!("expected single-object output"),
        }
    }
}
