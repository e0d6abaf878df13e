//! Atomic unit of work: staged overlay reads and all-or-nothing commits
//!
//! An engine call builds one [`WorkingSet`] over the storage, stages every
//! mutation in memory (so later batch items observe earlier items' effects),
//! and finally hands the accumulated [`ChangeSet`] to
//! [`ClearingStorage::apply`] in a single atomic commit. Any error before or
//! during the commit leaves the ledger untouched.

use std::collections::{BTreeMap, HashMap};

use crate::traits::ClearingStorage;
use crate::types::*;

/// A record write guarded by optimistic concurrency.
///
/// `expected_version` is the version read at load time; `None` means the
/// record is new and must not exist yet. Storage compares-and-swaps: the
/// stored version must still equal `expected_version`, and the committed row
/// carries `expected_version + 1` (or 0 for inserts).
#[derive(Debug, Clone)]
pub struct VersionedWrite<T> {
    pub record: T,
    pub expected_version: Option<u64>,
}

/// All writes staged by one engine invocation
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub bank_transactions: Vec<VersionedWrite<BankTransaction>>,
    pub settlements: Vec<VersionedWrite<RequestSettlement>>,
    pub new_allocations: Vec<PaymentAllocation>,
    /// Existing allocation rows consumed by a voucher in this unit of work
    pub linked_allocations: Vec<PaymentAllocation>,
    pub new_vouchers: Vec<VoucherHeader>,
    pub voucher_lines: Vec<VoucherLine>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.bank_transactions.is_empty()
            && self.settlements.is_empty()
            && self.new_allocations.is_empty()
            && self.linked_allocations.is_empty()
            && self.new_vouchers.is_empty()
            && self.voucher_lines.is_empty()
    }
}

struct Tracked<T> {
    record: T,
    /// Version read from storage; `None` for records created in this unit
    loaded_version: Option<u64>,
    dirty: bool,
}

/// Read-through overlay over the storage for a single engine call.
///
/// Reads consult staged state first, then fall through to the storage;
/// writes only ever touch the staged state until
/// [`into_change_set`](WorkingSet::into_change_set) is committed.
pub struct WorkingSet<'a, S: ClearingStorage> {
    storage: &'a S,
    bank_txns: HashMap<i64, Tracked<BankTransaction>>,
    settlements: HashMap<i64, Tracked<RequestSettlement>>,
    new_allocations: BTreeMap<i64, PaymentAllocation>,
    linked_existing: BTreeMap<i64, PaymentAllocation>,
    new_vouchers: Vec<VoucherHeader>,
    voucher_lines: Vec<VoucherLine>,
}

impl<'a, S: ClearingStorage> WorkingSet<'a, S> {
    pub fn new(storage: &'a S) -> Self {
        Self {
            storage,
            bank_txns: HashMap::new(),
            settlements: HashMap::new(),
            new_allocations: BTreeMap::new(),
            linked_existing: BTreeMap::new(),
            new_vouchers: Vec::new(),
            voucher_lines: Vec::new(),
        }
    }

    /// Load a bank transaction, preferring the staged working copy
    pub async fn bank_transaction(
        &mut self,
        bank_txn_id: i64,
    ) -> ClearingResult<Option<BankTransaction>> {
        if let Some(tracked) = self.bank_txns.get(&bank_txn_id) {
            return Ok(Some(tracked.record.clone()));
        }
        match self.storage.get_bank_transaction(bank_txn_id).await? {
            Some(txn) => {
                let version = txn.version;
                self.bank_txns.insert(
                    bank_txn_id,
                    Tracked {
                        record: txn.clone(),
                        loaded_version: Some(version),
                        dirty: false,
                    },
                );
                Ok(Some(txn))
            }
            None => Ok(None),
        }
    }

    /// Stage a mutated bank transaction; it must have been loaded through
    /// this working set so the version read at load time is known.
    pub fn stage_bank_transaction(&mut self, txn: BankTransaction) {
        let loaded_version = self
            .bank_txns
            .get(&txn.bank_txn_id)
            .and_then(|t| t.loaded_version)
            .unwrap_or(txn.version);
        self.bank_txns.insert(
            txn.bank_txn_id,
            Tracked {
                record: txn,
                loaded_version: Some(loaded_version),
                dirty: true,
            },
        );
    }

    /// Load the settlement tracker for a request, staged copy first
    pub async fn settlement_for_request(
        &mut self,
        request_id: i64,
    ) -> ClearingResult<Option<RequestSettlement>> {
        if let Some(tracked) = self.settlements.get(&request_id) {
            return Ok(Some(tracked.record.clone()));
        }
        match self.storage.find_settlement_for_request(request_id).await? {
            Some(settlement) => {
                let version = settlement.version;
                self.settlements.insert(
                    request_id,
                    Tracked {
                        record: settlement.clone(),
                        loaded_version: Some(version),
                        dirty: false,
                    },
                );
                Ok(Some(settlement))
            }
            None => Ok(None),
        }
    }

    /// Stage a settlement. A row never seen by this working set is treated
    /// as a creation and committed as an insert.
    pub fn stage_settlement(&mut self, settlement: RequestSettlement) {
        let loaded_version = self
            .settlements
            .get(&settlement.request_id)
            .and_then(|t| t.loaded_version);
        self.settlements.insert(
            settlement.request_id,
            Tracked {
                record: settlement,
                loaded_version,
                dirty: true,
            },
        );
    }

    /// Find an allocation by idempotency key, staged rows included
    pub async fn allocation_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> ClearingResult<Option<PaymentAllocation>> {
        let staged = self
            .new_allocations
            .values()
            .chain(self.linked_existing.values())
            .find(|a| a.idempotency_key.as_deref() == Some(key));
        if let Some(found) = staged {
            return Ok(Some(found.clone()));
        }
        self.storage.find_allocation_by_idempotency_key(key).await
    }

    /// Find the unique allocation for a (request, bank transaction) pair,
    /// staged rows included
    pub async fn allocation_for_pair(
        &mut self,
        request_id: i64,
        bank_txn_id: i64,
    ) -> ClearingResult<Option<PaymentAllocation>> {
        let staged = self
            .new_allocations
            .values()
            .chain(self.linked_existing.values())
            .find(|a| a.request_id == request_id && a.bank_txn_id == bank_txn_id);
        if let Some(found) = staged {
            return Ok(Some(found.clone()));
        }
        self.storage
            .find_allocation_for_pair(request_id, bank_txn_id)
            .await
    }

    /// All unlinked allocations for a request in FIFO order (allocation id
    /// ascending), merging storage rows with staged ones and skipping rows
    /// already linked in this unit of work.
    pub async fn unlinked_allocations(
        &mut self,
        request_id: i64,
    ) -> ClearingResult<Vec<PaymentAllocation>> {
        let mut rows: BTreeMap<i64, PaymentAllocation> = BTreeMap::new();
        for row in self.storage.find_unlinked_allocations(request_id).await? {
            if !self.linked_existing.contains_key(&row.allocation_id) {
                rows.insert(row.allocation_id, row);
            }
        }
        for row in self.new_allocations.values() {
            if row.request_id == request_id && !row.is_linked() {
                rows.insert(row.allocation_id, row.clone());
            }
        }
        Ok(rows.into_values().collect())
    }

    /// Stage a freshly created allocation row
    pub fn stage_new_allocation(&mut self, allocation: PaymentAllocation) {
        self.new_allocations
            .insert(allocation.allocation_id, allocation);
    }

    /// Stage a voucher link on an allocation. Rows created earlier in this
    /// unit of work are updated in place; rows loaded from storage become
    /// link updates in the change set.
    pub fn stage_allocation_link(&mut self, allocation: PaymentAllocation) {
        if self.new_allocations.contains_key(&allocation.allocation_id) {
            self.new_allocations
                .insert(allocation.allocation_id, allocation);
        } else {
            self.linked_existing
                .insert(allocation.allocation_id, allocation);
        }
    }

    /// Find a voucher by natural key within the tenant scope, staged first
    pub async fn voucher_by_number(
        &mut self,
        board_id: i64,
        employer_id: i64,
        voucher_number: &str,
    ) -> ClearingResult<Option<VoucherHeader>> {
        let staged = self.new_vouchers.iter().find(|v| {
            v.board_id == board_id
                && v.employer_id == employer_id
                && v.voucher_number == voucher_number
        });
        if let Some(found) = staged {
            return Ok(Some(found.clone()));
        }
        self.storage
            .find_voucher_by_number(board_id, employer_id, voucher_number)
            .await
    }

    /// Stage a new voucher header
    pub fn stage_new_voucher(&mut self, voucher: VoucherHeader) {
        self.new_vouchers.push(voucher);
    }

    /// Stage voucher lines, appended in order
    pub fn stage_voucher_lines(&mut self, lines: Vec<VoucherLine>) {
        self.voucher_lines.extend(lines);
    }

    /// Reserve the next allocation id from the storage sequence
    pub async fn reserve_allocation_id(&self) -> ClearingResult<i64> {
        self.storage.reserve_allocation_id().await
    }

    /// Reserve the next voucher id from the storage sequence
    pub async fn reserve_voucher_id(&self) -> ClearingResult<i64> {
        self.storage.reserve_voucher_id().await
    }

    /// Collapse the staged state into a change set for one atomic commit
    pub fn into_change_set(self) -> ChangeSet {
        let bank_transactions = self
            .bank_txns
            .into_values()
            .filter(|t| t.dirty)
            .map(|t| VersionedWrite {
                record: t.record,
                expected_version: t.loaded_version,
            })
            .collect();
        let settlements = self
            .settlements
            .into_values()
            .filter(|t| t.dirty)
            .map(|t| VersionedWrite {
                record: t.record,
                expected_version: t.loaded_version,
            })
            .collect();
        ChangeSet {
            bank_transactions,
            settlements,
            new_allocations: self.new_allocations.into_values().collect(),
            linked_allocations: self.linked_existing.into_values().collect(),
            new_vouchers: self.new_vouchers,
            voucher_lines: self.voucher_lines,
        }
    }
}
