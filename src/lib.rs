//! # clearing-core
//!
//! A bank-settlement clearing library: allocates incoming bank-transaction
//! funds against payment requests and settles fully-funded requests as
//! immutable, balanced double-entry vouchers.
//!
//! ## Features
//!
//! - Allocation engine with three-way balance triads on bank transactions
//!   and request settlements
//! - Atomic batch allocation: later items see earlier items' effects, and
//!   the whole batch commits or none of it does
//! - Automatic settlement posting when a request becomes fully funded
//! - Idempotent retries via caller-supplied keys and natural voucher numbers
//! - Optimistic concurrency on every balance-bearing row
//! - Best-effort post-commit notification of the external payment service
//! - Pluggable storage, tenant resolution, status master, and notifier
//!   behind async traits
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use bigdecimal::BigDecimal;
//! use chrono::NaiveDate;
//! use clearing_core::ledger::ClearingService;
//! use clearing_core::types::{AllocationRequest, BankTransaction, TenantAccess};
//! use clearing_core::utils::{
//!     LoggingNotifier, MemoryStorage, StaticStatusSource, StaticTenantAccess,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tenant = TenantAccess::new(1, 2, None);
//! let mut service = ClearingService::new(
//!     MemoryStorage::new(),
//!     Arc::new(StaticStatusSource::with_defaults()),
//!     Arc::new(StaticTenantAccess::new(tenant.clone())),
//!     Arc::new(LoggingNotifier),
//! );
//! service.warm_status_cache().await;
//!
//! let txn = BankTransaction::new(
//!     1,
//!     10,
//!     BigDecimal::from(500),
//!     NaiveDate::from_ymd_opt(2025, 3, 1).ok_or("bad date")?,
//!     &tenant,
//! );
//! service.register_bank_transaction(&txn).await?;
//!
//! let results = service
//!     .apply_allocations(&[AllocationRequest {
//!         request_id: 100,
//!         bank_txn_id: 1,
//!         requested_amount: BigDecimal::from(300),
//!         allocated_amount: BigDecimal::from(200),
//!         allocation_date: None,
//!         allocated_by: None,
//!         idempotency_key: None,
//!     }])
//!     .await?;
//! assert_eq!(results[0].remaining_amount, Some(BigDecimal::from(300)));
//! # Ok(())
//! # }
//! ```

pub mod ledger;
pub mod status;
pub mod traits;
pub mod types;
pub mod utils;

pub use ledger::{AllocationEngine, ClearingService, NoteManager, SettlementPoster};
pub use status::StatusCache;
pub use traits::{
    ClearingStorage, PaymentStatusNotifier, StatusEntry, StatusSource, TenantAccessResolver,
};
pub use types::{ClearingError, ClearingResult};
pub use utils::MemoryStorage;
