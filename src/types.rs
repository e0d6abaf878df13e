//! Core types and data structures for the clearing system

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status lookup domains, matching the `status_master` rows the
/// [`StatusCache`](crate::status::StatusCache) resolves against.
pub mod status_domain {
    pub const BANK_TRANSACTION: &str = "bank_transaction";
    pub const PAYMENT_ALLOCATION: &str = "payment_allocation";
    pub const REQUEST_SETTLEMENT: &str = "request_settlement";
    pub const VOUCHER_HEADER: &str = "voucher_header";
}

/// Tenant scope (board/employer/toli) stamped onto every balance-bearing row.
///
/// Resolved once per engine invocation through
/// [`TenantAccessResolver`](crate::traits::TenantAccessResolver); there is no
/// ambient/thread-local tenant state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantAccess {
    pub board_id: i64,
    pub employer_id: i64,
    pub toli_id: Option<i64>,
}

impl TenantAccess {
    pub fn new(board_id: i64, employer_id: i64, toli_id: Option<i64>) -> Self {
        Self {
            board_id,
            employer_id,
            toli_id,
        }
    }

    /// Whether this access covers the given board/employer pair
    pub fn covers(&self, board_id: i64, employer_id: i64) -> bool {
        self.board_id == board_id && self.employer_id == employer_id
    }
}

/// Allocation lifecycle of a bank transaction's funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BankTxnStatus {
    Unallocated,
    PartiallyAllocated,
    Settled,
}

impl BankTxnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BankTxnStatus::Unallocated => "UNALLOCATED",
            BankTxnStatus::PartiallyAllocated => "PARTIALLY_ALLOCATED",
            BankTxnStatus::Settled => "SETTLED",
        }
    }
}

/// Lifecycle of a payment allocation row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStatus {
    Allocated,
    Settled,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Allocated => "ALLOCATED",
            AllocationStatus::Settled => "SETTLED",
        }
    }
}

/// Lifecycle of a request settlement: `Created -> Allocated -> Settled`,
/// monotonic, never transitions backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Created,
    Allocated,
    Settled,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Created => "CREATED",
            SettlementStatus::Allocated => "ALLOCATED",
            SettlementStatus::Settled => "SETTLED",
        }
    }
}

/// Lifecycle of a voucher header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoucherStatus {
    Created,
    Posted,
}

impl VoucherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoucherStatus::Created => "CREATED",
            VoucherStatus::Posted => "POSTED",
        }
    }
}

/// Debit/credit side of a voucher line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrCrFlag {
    #[serde(rename = "DR")]
    Debit,
    #[serde(rename = "CR")]
    Credit,
}

impl DrCrFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrCrFlag::Debit => "DR",
            DrCrFlag::Credit => "CR",
        }
    }
}

/// Reconciliation outcome reported to the external payment-status service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationStatus {
    Partial,
    Reconciled,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::Partial => "PARTIAL",
            ReconciliationStatus::Reconciled => "RECONCILED",
        }
    }
}

/// A single incoming bank-ledger movement with a remaining balance available
/// to allocate against payment requests.
///
/// Invariant: `allocated_amount + remaining_amount == amount`, both non
/// negative. `amount` is fixed at creation; the allocation engine is the
/// only mutator of the balance triad. `version` backs optimistic
/// concurrency: the value read at load time must still match at commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankTransaction {
    pub bank_txn_id: i64,
    pub bank_account_id: i64,
    /// Bank statement reference, when known
    pub txn_ref: Option<String>,
    pub txn_date: NaiveDate,
    /// Face value of the movement, fixed at creation
    pub amount: BigDecimal,
    pub allocated_amount: BigDecimal,
    pub remaining_amount: BigDecimal,
    pub is_settled: bool,
    pub status: BankTxnStatus,
    pub status_id: Option<i32>,
    pub board_id: i64,
    pub employer_id: i64,
    pub toli_id: Option<i64>,
    /// Optimistic concurrency stamp, bumped by the storage on every write
    pub version: u64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl BankTransaction {
    /// Create a new, fully unallocated bank transaction
    pub fn new(
        bank_txn_id: i64,
        bank_account_id: i64,
        amount: BigDecimal,
        txn_date: NaiveDate,
        tenant: &TenantAccess,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            bank_txn_id,
            bank_account_id,
            txn_ref: None,
            txn_date,
            allocated_amount: BigDecimal::from(0),
            remaining_amount: amount.clone(),
            amount,
            is_settled: false,
            status: BankTxnStatus::Unallocated,
            status_id: None,
            board_id: tenant.board_id,
            employer_id: tenant.employer_id,
            toli_id: tenant.toli_id,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an allocation delta to the balance triad and derive the status.
    /// The caller has already verified `amount <= remaining_amount`.
    pub fn apply_allocation(&mut self, amount: &BigDecimal) {
        self.allocated_amount += amount;
        self.remaining_amount -= amount;
        self.is_settled = self.remaining_amount == BigDecimal::from(0);
        self.status = if self.is_settled {
            BankTxnStatus::Settled
        } else {
            BankTxnStatus::PartiallyAllocated
        };
        self.updated_at = chrono::Utc::now().naive_utc();
    }

    /// Check the `allocated + remaining == amount` invariant
    pub fn balances_consistent(&self) -> bool {
        &self.allocated_amount + &self.remaining_amount == self.amount
            && self.allocated_amount >= BigDecimal::from(0)
            && self.remaining_amount >= BigDecimal::from(0)
    }
}

/// Aggregate balance tracker for a payment request across all of its
/// allocations, keyed by the unique `request_id`.
///
/// Created lazily on the first allocation against the request; `total_amount`
/// is immutable once set and `voucher_id` is set exactly once by the
/// settlement poster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSettlement {
    pub request_id: i64,
    pub board_id: i64,
    pub employer_id: i64,
    pub toli_id: Option<i64>,
    pub total_amount: BigDecimal,
    pub allocated_amount: BigDecimal,
    pub remaining_amount: BigDecimal,
    pub voucher_id: Option<i64>,
    pub status: SettlementStatus,
    pub status_id: Option<i32>,
    pub version: u64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl RequestSettlement {
    /// Create a settlement tracker with nothing allocated yet
    pub fn new(request_id: i64, total_amount: BigDecimal, tenant: &TenantAccess) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            request_id,
            board_id: tenant.board_id,
            employer_id: tenant.employer_id,
            toli_id: tenant.toli_id,
            allocated_amount: BigDecimal::from(0),
            remaining_amount: total_amount.clone(),
            total_amount,
            voucher_id: None,
            status: SettlementStatus::Created,
            status_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add an allocated amount to the triad, rejecting over-allocation
    pub fn apply_allocation(&mut self, amount: &BigDecimal) -> ClearingResult<()> {
        let allocated = &self.allocated_amount + amount;
        if allocated > self.total_amount {
            return Err(ClearingError::Conflict(format!(
                "Allocations exceed request total for request {}",
                self.request_id
            )));
        }
        self.remaining_amount = &self.total_amount - &allocated;
        self.allocated_amount = allocated;
        self.status = if self.remaining_amount == BigDecimal::from(0) {
            SettlementStatus::Settled
        } else {
            SettlementStatus::Allocated
        };
        self.updated_at = chrono::Utc::now().naive_utc();
        Ok(())
    }

    /// Whether the request is fully funded
    pub fn is_fully_allocated(&self) -> bool {
        self.remaining_amount == BigDecimal::from(0)
    }

    /// Check the `allocated + remaining == total` invariant
    pub fn balances_consistent(&self) -> bool {
        &self.allocated_amount + &self.remaining_amount == self.total_amount
            && self.allocated_amount >= BigDecimal::from(0)
            && self.remaining_amount >= BigDecimal::from(0)
    }
}

/// A monetary link between one bank transaction and one payment request.
///
/// The (request_id, bank_txn_id) pair is unique, the amount is immutable,
/// and an allocation is atomic: once `voucher_id` is set the row is linked
/// and can never be re-linked or partially consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAllocation {
    pub allocation_id: i64,
    pub request_id: i64,
    pub bank_txn_id: i64,
    pub allocated_amount: BigDecimal,
    pub allocation_date: NaiveDate,
    pub allocated_by: Option<String>,
    /// Caller-supplied retry token, unique when present
    pub idempotency_key: Option<String>,
    /// Set exactly once when the allocation is consumed by a voucher
    pub voucher_id: Option<i64>,
    pub status: AllocationStatus,
    pub status_id: Option<i32>,
    pub board_id: i64,
    pub employer_id: i64,
    pub toli_id: Option<i64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl PaymentAllocation {
    /// Whether the allocation has already been consumed by a voucher
    pub fn is_linked(&self) -> bool {
        self.voucher_id.is_some()
    }
}

/// Header of an immutable, balanced double-entry voucher.
///
/// `voucher_number` is the natural idempotency key for settlement, unique
/// within the (board_id, employer_id) tenant scope. For every posted voucher
/// `total_debit == total_credit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherHeader {
    pub voucher_id: i64,
    pub voucher_number: String,
    pub request_id: i64,
    pub board_id: i64,
    pub employer_id: i64,
    pub total_debit: BigDecimal,
    pub total_credit: BigDecimal,
    pub status: VoucherStatus,
    pub status_id: Option<i32>,
    pub posted_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl VoucherHeader {
    pub fn new(
        voucher_id: i64,
        voucher_number: String,
        request_id: i64,
        board_id: i64,
        employer_id: i64,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            voucher_id,
            voucher_number,
            request_id,
            board_id,
            employer_id,
            total_debit: BigDecimal::from(0),
            total_credit: BigDecimal::from(0),
            status: VoucherStatus::Created,
            status_id: None,
            posted_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single append-only debit or credit row of a voucher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherLine {
    pub voucher_id: i64,
    /// 1-based position within the voucher
    pub line_no: u32,
    pub dr_cr: DrCrFlag,
    /// General-ledger source bucket (e.g. EMPLOYEE_PAYABLE, BANK_CLEARING)
    pub gl_source: String,
    pub amount: BigDecimal,
    pub bank_txn_id: Option<i64>,
    pub allocation_id: Option<i64>,
    /// Which dimension the line is keyed by (REQUEST or BANK_TXN)
    pub dimension_source: String,
    pub created_at: NaiveDateTime,
}

impl VoucherLine {
    /// Create a debit line keyed by the request dimension
    pub fn debit(voucher_id: i64, line_no: u32, gl_source: &str, amount: BigDecimal) -> Self {
        Self {
            voucher_id,
            line_no,
            dr_cr: DrCrFlag::Debit,
            gl_source: gl_source.to_string(),
            amount,
            bank_txn_id: None,
            allocation_id: None,
            dimension_source: "REQUEST".to_string(),
            created_at: chrono::Utc::now().naive_utc(),
        }
    }

    /// Create a credit line keyed by the bank-transaction dimension
    pub fn credit(
        voucher_id: i64,
        line_no: u32,
        gl_source: &str,
        amount: BigDecimal,
        bank_txn_id: i64,
        allocation_id: i64,
    ) -> Self {
        Self {
            voucher_id,
            line_no,
            dr_cr: DrCrFlag::Credit,
            gl_source: gl_source.to_string(),
            amount,
            bank_txn_id: Some(bank_txn_id),
            allocation_id: Some(allocation_id),
            dimension_source: "BANK_TXN".to_string(),
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

/// A manual debit/credit adjustment note against a payment request.
///
/// Notes are bookkeeping annotations, not balance-bearing ledger rows: they
/// never touch the allocation triads or vouchers. Scoped to the
/// (board_id, employer_id) tenant on every access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrcrNote {
    pub note_id: i64,
    pub request_id: i64,
    /// DR/CR voucher classification, e.g. "DEBIT" or "CREDIT"
    pub voucher_type: String,
    pub narration: Option<String>,
    pub amount: BigDecimal,
    pub description: Option<String>,
    pub created_by: Option<String>,
    pub board_id: i64,
    pub employer_id: i64,
    pub toli_id: Option<i64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Create/update payload for a debit/credit note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrcrNoteRequest {
    pub request_id: i64,
    pub voucher_type: String,
    #[serde(default)]
    pub narration: Option<String>,
    pub amount: BigDecimal,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub toli_id: Option<i64>,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// One allocation instruction: apply `allocated_amount` from a bank
/// transaction against a payment request whose total is `requested_amount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequest {
    pub request_id: i64,
    pub bank_txn_id: i64,
    /// Total amount of the payment request; fixes the settlement total on
    /// first allocation and must match it afterwards
    pub requested_amount: BigDecimal,
    pub allocated_amount: BigDecimal,
    #[serde(default)]
    pub allocation_date: Option<NaiveDate>,
    #[serde(default)]
    pub allocated_by: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Per-item outcome of an allocation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    pub allocation_id: i64,
    pub request_id: i64,
    pub bank_txn_id: i64,
    pub allocated_amount: BigDecimal,
    /// Bank transaction balance left after this allocation; absent on an
    /// idempotent replay, which reports the stored allocation untouched
    pub remaining_amount: Option<BigDecimal>,
    pub status_id: Option<i32>,
    pub status: AllocationStatus,
}

/// Wire input for the allocation operation. The legacy contract accepts a
/// bare allocation object as well as a batch list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AllocationInput {
    Batch(Vec<AllocationRequest>),
    Single(Box<AllocationRequest>),
}

/// Wire output for the allocation operation, mirroring [`AllocationInput`]:
/// a single-object request yields a single object, never a one-element list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AllocationOutput {
    Batch(Vec<AllocationResult>),
    Single(Box<AllocationResult>),
}

/// One breakdown entry of a settlement: how much of the request's total came
/// from a given bank transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationBreakdown {
    pub bank_txn_id: i64,
    pub amount: BigDecimal,
}

/// Settlement instruction: post the fully-funded request as a voucher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRequest {
    pub request_id: i64,
    pub total_amount: BigDecimal,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub allocations: Vec<AllocationBreakdown>,
}

/// Outcome of a settlement call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResult {
    pub voucher_id: i64,
    pub voucher_status: VoucherStatus,
    pub total_debit: BigDecimal,
    pub total_credit: BigDecimal,
    pub message: String,
}

/// A queued best-effort notification to the external payment-status service,
/// dispatched only after the enclosing change set has committed.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusNotification {
    pub id: Uuid,
    pub request_id: i64,
    pub status: ReconciliationStatus,
}

impl StatusNotification {
    pub fn new(request_id: i64, status: ReconciliationStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            status,
        }
    }
}

/// Error raised by a [`PaymentStatusNotifier`](crate::traits::PaymentStatusNotifier)
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct NotifyError(pub String);

/// Errors that can occur in the clearing system
#[derive(Debug, thiserror::Error)]
pub enum ClearingError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for clearing operations
pub type ClearingResult<T> = Result<T, ClearingError>;
