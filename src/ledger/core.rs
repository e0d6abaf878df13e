//! Clearing service facade tying the engines, status cache, and
//! collaborators together over one storage backend

use std::sync::Arc;

use crate::ledger::allocation::AllocationEngine;
use crate::ledger::notes::NoteManager;
use crate::ledger::settlement::SettlementPoster;
use crate::status::StatusCache;
use crate::traits::{
    ClearingStorage, PaymentStatusNotifier, StatusSource, TenantAccessResolver,
};
use crate::types::*;
use crate::utils::validation::validate_positive_amount;

/// Facade over the clearing ledger.
///
/// Owns the allocation engine and settlement poster, shares one status cache
/// between them, and exposes read-side queries against the same storage.
pub struct ClearingService<S: ClearingStorage + Clone> {
    storage: S,
    statuses: StatusCache,
    allocations: AllocationEngine<S>,
    settlements: SettlementPoster<S>,
    notes: NoteManager<S>,
}

impl<S: ClearingStorage + Clone> ClearingService<S> {
    pub fn new(
        storage: S,
        status_source: Arc<dyn StatusSource>,
        tenants: Arc<dyn TenantAccessResolver>,
        notifier: Arc<dyn PaymentStatusNotifier>,
    ) -> Self {
        let statuses = StatusCache::new(status_source);
        let allocations = AllocationEngine::new(
            storage.clone(),
            statuses.clone(),
            tenants.clone(),
            notifier.clone(),
        );
        let settlements = SettlementPoster::new(
            storage.clone(),
            statuses.clone(),
            tenants.clone(),
            notifier,
        );
        let notes = NoteManager::new(storage.clone(), tenants);
        Self {
            storage,
            statuses,
            allocations,
            settlements,
            notes,
        }
    }

    /// Preload the status cache; failures fall back to lazy fills
    pub async fn warm_status_cache(&self) {
        self.statuses.warm().await;
    }

    /// Register an incoming bank-ledger movement with its full amount
    /// available to allocate
    pub async fn register_bank_transaction(
        &mut self,
        txn: &BankTransaction,
    ) -> ClearingResult<()> {
        validate_positive_amount("amount", &txn.amount)?;
        if !txn.balances_consistent() {
            return Err(ClearingError::Validation(format!(
                "Inconsistent balances on bank transaction {}",
                txn.bank_txn_id
            )));
        }
        self.storage.insert_bank_transaction(txn).await
    }

    /// Apply a batch of allocations as one atomic unit of work
    pub async fn apply_allocations(
        &mut self,
        batch: &[AllocationRequest],
    ) -> ClearingResult<Vec<AllocationResult>> {
        self.allocations.apply_allocations(batch).await
    }

    /// Apply allocations in the legacy wire shape (bare object or list)
    pub async fn apply_allocation_input(
        &mut self,
        input: AllocationInput,
    ) -> ClearingResult<AllocationOutput> {
        self.allocations.apply_allocation_input(input).await
    }

    /// Post a settlement voucher for a funded request
    pub async fn post_settlement(
        &mut self,
        request: &SettlementRequest,
    ) -> ClearingResult<SettlementResult> {
        self.settlements.post_settlement(request).await
    }

    /// Create a debit/credit note against a request
    pub async fn create_note(&mut self, request: &DrcrNoteRequest) -> ClearingResult<DrcrNote> {
        self.notes.create(request).await
    }

    /// Notes for the caller's tenant, newest update first
    pub async fn list_notes(
        &self,
        request_id: Option<i64>,
        voucher_type: Option<&str>,
        limit: usize,
    ) -> ClearingResult<Vec<DrcrNote>> {
        self.notes.list(request_id, voucher_type, limit).await
    }

    /// Get a debit/credit note within the caller's tenant scope
    pub async fn note(&self, note_id: i64) -> ClearingResult<DrcrNote> {
        self.notes.get(note_id).await
    }

    /// Update a debit/credit note in place
    pub async fn update_note(
        &mut self,
        note_id: i64,
        request: &DrcrNoteRequest,
    ) -> ClearingResult<DrcrNote> {
        self.notes.update(note_id, request).await
    }

    /// Delete a debit/credit note
    pub async fn delete_note(&mut self, note_id: i64) -> ClearingResult<()> {
        self.notes.delete(note_id).await
    }

    /// Look up a bank transaction with its balance triad
    pub async fn bank_transaction(
        &self,
        bank_txn_id: i64,
    ) -> ClearingResult<Option<BankTransaction>> {
        self.storage.get_bank_transaction(bank_txn_id).await
    }

    /// All allocations recorded against a request, oldest first
    pub async fn allocations_for_request(
        &self,
        request_id: i64,
    ) -> ClearingResult<Vec<PaymentAllocation>> {
        self.storage.find_allocations_for_request(request_id).await
    }

    /// The settlement tracker for a request, if any allocation has touched it
    pub async fn request_settlement(
        &self,
        request_id: i64,
    ) -> ClearingResult<Option<RequestSettlement>> {
        self.storage.find_settlement_for_request(request_id).await
    }

    /// A voucher header with its lines in posting order
    pub async fn voucher(
        &self,
        voucher_id: i64,
    ) -> ClearingResult<Option<(VoucherHeader, Vec<VoucherLine>)>> {
        match self.storage.get_voucher(voucher_id).await? {
            Some(header) => {
                let lines = self.storage.get_voucher_lines(voucher_id).await?;
                Ok(Some((header, lines)))
            }
            None => Ok(None),
        }
    }

    /// Reconciliation state of a request as reported to the payment service
    pub async fn reconciliation_status(
        &self,
        request_id: i64,
    ) -> ClearingResult<Option<ReconciliationStatus>> {
        Ok(self
            .storage
            .find_settlement_for_request(request_id)
            .await?
            .map(|s| {
                if s.is_fully_allocated() {
                    ReconciliationStatus::Reconciled
                } else {
                    ReconciliationStatus::Partial
                }
            }))
    }
}
