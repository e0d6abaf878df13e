//! Traits for storage abstraction and external collaborators

use async_trait::async_trait;

use crate::ledger::changeset::ChangeSet;
use crate::types::*;

/// Storage abstraction for the clearing ledger.
///
/// This trait allows the clearing core to work with any storage backend
/// (PostgreSQL, MySQL, SQLite, in-memory, etc.) by implementing these
/// methods. Reads are plain point/filter lookups; all writes flow through
/// [`apply`](ClearingStorage::apply), which must commit a whole
/// [`ChangeSet`] atomically or not at all.
#[async_trait]
pub trait ClearingStorage: Send + Sync {
    /// Insert a freshly claimed bank transaction
    async fn insert_bank_transaction(&mut self, txn: &BankTransaction) -> ClearingResult<()>;

    /// Get a bank transaction by id
    async fn get_bank_transaction(&self, bank_txn_id: i64) -> ClearingResult<Option<BankTransaction>>;

    /// Get a payment allocation by id
    async fn get_allocation(&self, allocation_id: i64) -> ClearingResult<Option<PaymentAllocation>>;

    /// Find the allocation created under the given idempotency key, if any
    async fn find_allocation_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> ClearingResult<Option<PaymentAllocation>>;

    /// Find the unique allocation for a (request, bank transaction) pair
    async fn find_allocation_for_pair(
        &self,
        request_id: i64,
        bank_txn_id: i64,
    ) -> ClearingResult<Option<PaymentAllocation>>;

    /// All allocations for a request, ordered by allocation id ascending
    async fn find_allocations_for_request(
        &self,
        request_id: i64,
    ) -> ClearingResult<Vec<PaymentAllocation>>;

    /// Allocations for a request not yet consumed by any voucher, ordered by
    /// allocation id ascending (FIFO consumption order)
    async fn find_unlinked_allocations(
        &self,
        request_id: i64,
    ) -> ClearingResult<Vec<PaymentAllocation>>;

    /// Find the settlement tracker for a request
    async fn find_settlement_for_request(
        &self,
        request_id: i64,
    ) -> ClearingResult<Option<RequestSettlement>>;

    /// Get a voucher header by id
    async fn get_voucher(&self, voucher_id: i64) -> ClearingResult<Option<VoucherHeader>>;

    /// Find a voucher by its natural key within the tenant scope
    async fn find_voucher_by_number(
        &self,
        board_id: i64,
        employer_id: i64,
        voucher_number: &str,
    ) -> ClearingResult<Option<VoucherHeader>>;

    /// Lines of a voucher, ordered by line number
    async fn get_voucher_lines(&self, voucher_id: i64) -> ClearingResult<Vec<VoucherLine>>;

    /// Get a debit/credit note within the tenant scope
    async fn find_note(
        &self,
        note_id: i64,
        board_id: i64,
        employer_id: i64,
    ) -> ClearingResult<Option<DrcrNote>>;

    /// Notes for a tenant, newest update first (then id descending),
    /// optionally filtered by request and case-insensitive voucher type,
    /// capped at `limit` rows
    async fn search_notes(
        &self,
        board_id: i64,
        employer_id: i64,
        request_id: Option<i64>,
        voucher_type: Option<&str>,
        limit: usize,
    ) -> ClearingResult<Vec<DrcrNote>>;

    /// Insert a new debit/credit note
    async fn insert_note(&mut self, note: &DrcrNote) -> ClearingResult<()>;

    /// Overwrite an existing debit/credit note
    async fn update_note(&mut self, note: &DrcrNote) -> ClearingResult<()>;

    /// Delete a debit/credit note
    async fn delete_note(&mut self, note_id: i64) -> ClearingResult<()>;

    /// Reserve the next allocation id from the storage sequence
    async fn reserve_allocation_id(&self) -> ClearingResult<i64>;

    /// Reserve the next debit/credit note id from the storage sequence
    async fn reserve_note_id(&self) -> ClearingResult<i64>;

    /// Reserve the next voucher id from the storage sequence
    async fn reserve_voucher_id(&self) -> ClearingResult<i64>;

    /// Commit a change set atomically.
    ///
    /// Every versioned write must still match the version read at load time
    /// (compare-and-swap; the committed row carries `version + 1`), new
    /// allocations must not violate pair or idempotency-key uniqueness,
    /// voucher links may only be set on still-unlinked rows, and voucher
    /// numbers must be unused within their tenant scope. On any failure
    /// nothing is applied and a [`ClearingError::Conflict`] is returned.
    async fn apply(&mut self, changes: ChangeSet) -> ClearingResult<()>;
}

/// Resolves the caller's tenant scope (board/employer/toli).
///
/// Called once per engine invocation; `None` means the caller has no
/// accessible tenant and the operation fails fast.
#[async_trait]
pub trait TenantAccessResolver: Send + Sync {
    async fn current_access(&self) -> ClearingResult<Option<TenantAccess>>;
}

/// One `status_master` row as loaded from a [`StatusSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub domain: String,
    pub code: String,
    pub id: i32,
}

/// Backing source for status-code lookups, typically the `status_master`
/// table. Consumed through [`StatusCache`](crate::status::StatusCache);
/// never mutates ledger state.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Load a single status id, `None` when the domain/code pair is unknown
    async fn load_status_id(&self, domain: &str, code: &str) -> ClearingResult<Option<i32>>;

    /// Load every active status row, used to warm the cache
    async fn load_all(&self) -> ClearingResult<Vec<StatusEntry>>;
}

/// Outbound call informing the external payment-status service of a
/// partial or full reconciliation.
///
/// Strictly best-effort: the engines dispatch notifications only after the
/// financial mutation has committed, and a failure here is logged and
/// swallowed, never rolled back into the ledger.
#[async_trait]
pub trait PaymentStatusNotifier: Send + Sync {
    async fn notify(
        &self,
        request_id: i64,
        status: ReconciliationStatus,
    ) -> Result<(), NotifyError>;
}
