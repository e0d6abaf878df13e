//! In-memory storage implementation for testing and development

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use crate::ledger::changeset::{ChangeSet, VersionedWrite};
use crate::traits::ClearingStorage;
use crate::types::*;

#[derive(Debug, Default)]
struct Store {
    bank_txns: HashMap<i64, BankTransaction>,
    allocations: BTreeMap<i64, PaymentAllocation>,
    settlements: HashMap<i64, RequestSettlement>,
    vouchers: HashMap<i64, VoucherHeader>,
    voucher_lines: Vec<VoucherLine>,
    notes: HashMap<i64, DrcrNote>,
}

/// In-memory [`ClearingStorage`] with real compare-and-swap semantics.
///
/// All state sits behind a single lock, so [`apply`](ClearingStorage::apply)
/// validates and commits a change set while holding one write guard: either
/// every write lands or none does, exactly like the database transaction it
/// stands in for.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    inner: Arc<RwLock<Store>>,
    next_allocation_id: Arc<AtomicI64>,
    next_voucher_id: Arc<AtomicI64>,
    next_note_id: Arc<AtomicI64>,
}

impl MemoryStorage {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Store::default())),
            next_allocation_id: Arc::new(AtomicI64::new(1)),
            next_voucher_id: Arc::new(AtomicI64::new(1)),
            next_note_id: Arc::new(AtomicI64::new(1)),
        }
    }

    /// Clear all data (useful for testing)
    pub fn clear(&self) {
        *self.inner.write().unwrap() = Store::default();
    }

    fn check_bank_write(
        store: &Store,
        write: &VersionedWrite<BankTransaction>,
    ) -> ClearingResult<()> {
        let id = write.record.bank_txn_id;
        match write.expected_version {
            Some(expected) => match store.bank_txns.get(&id) {
                Some(stored) if stored.version == expected => Ok(()),
                Some(_) => Err(ClearingError::Conflict(format!(
                    "Concurrent update detected on bank transaction {id}"
                ))),
                None => Err(ClearingError::NotFound(format!(
                    "Bank transaction not found: {id}"
                ))),
            },
            None if store.bank_txns.contains_key(&id) => Err(ClearingError::Conflict(format!(
                "Bank transaction {id} already exists"
            ))),
            None => Ok(()),
        }
    }

    fn check_settlement_write(
        store: &Store,
        write: &VersionedWrite<RequestSettlement>,
    ) -> ClearingResult<()> {
        let id = write.record.request_id;
        match write.expected_version {
            Some(expected) => match store.settlements.get(&id) {
                Some(stored) if stored.version == expected => Ok(()),
                Some(_) => Err(ClearingError::Conflict(format!(
                    "Concurrent update detected on request settlement {id}"
                ))),
                None => Err(ClearingError::NotFound(format!(
                    "Request settlement not found for request {id}"
                ))),
            },
            None if store.settlements.contains_key(&id) => Err(ClearingError::Conflict(format!(
                "Request settlement already exists for request {id}"
            ))),
            None => Ok(()),
        }
    }

    fn check_new_allocation(store: &Store, row: &PaymentAllocation) -> ClearingResult<()> {
        if store.allocations.contains_key(&row.allocation_id) {
            return Err(ClearingError::Conflict(format!(
                "Allocation id {} already exists",
                row.allocation_id
            )));
        }
        let pair_taken = store
            .allocations
            .values()
            .any(|a| a.request_id == row.request_id && a.bank_txn_id == row.bank_txn_id);
        if pair_taken {
            return Err(ClearingError::Conflict(
                "Allocation already exists for this request and bank transaction".to_string(),
            ));
        }
        if let Some(key) = row.idempotency_key.as_deref() {
            let key_taken = store
                .allocations
                .values()
                .any(|a| a.idempotency_key.as_deref() == Some(key));
            if key_taken {
                return Err(ClearingError::Conflict(format!(
                    "Idempotency key {key} already used"
                )));
            }
        }
        Ok(())
    }

    fn check_allocation_link(store: &Store, row: &PaymentAllocation) -> ClearingResult<()> {
        match store.allocations.get(&row.allocation_id) {
            Some(stored) if stored.voucher_id.is_none() => Ok(()),
            Some(stored) => Err(ClearingError::Conflict(format!(
                "Allocation {} is already linked to voucher {}",
                row.allocation_id,
                stored.voucher_id.unwrap_or_default()
            ))),
            None => Err(ClearingError::NotFound(format!(
                "Allocation not found: {}",
                row.allocation_id
            ))),
        }
    }

    fn check_new_voucher(store: &Store, voucher: &VoucherHeader) -> ClearingResult<()> {
        if store.vouchers.contains_key(&voucher.voucher_id) {
            return Err(ClearingError::Conflict(format!(
                "Voucher id {} already exists",
                voucher.voucher_id
            )));
        }
        let number_taken = store.vouchers.values().any(|v| {
            v.board_id == voucher.board_id
                && v.employer_id == voucher.employer_id
                && v.voucher_number == voucher.voucher_number
        });
        if number_taken {
            return Err(ClearingError::Conflict(format!(
                "Voucher number {} already exists for this tenant",
                voucher.voucher_number
            )));
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClearingStorage for MemoryStorage {
    async fn insert_bank_transaction(&mut self, txn: &BankTransaction) -> ClearingResult<()> {
        let mut store = self.inner.write().unwrap();
        if store.bank_txns.contains_key(&txn.bank_txn_id) {
            return Err(ClearingError::Conflict(format!(
                "Bank transaction {} already exists",
                txn.bank_txn_id
            )));
        }
        store.bank_txns.insert(txn.bank_txn_id, txn.clone());
        Ok(())
    }

    async fn get_bank_transaction(
        &self,
        bank_txn_id: i64,
    ) -> ClearingResult<Option<BankTransaction>> {
        Ok(self.inner.read().unwrap().bank_txns.get(&bank_txn_id).cloned())
    }

    async fn get_allocation(&self, allocation_id: i64) -> ClearingResult<Option<PaymentAllocation>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .allocations
            .get(&allocation_id)
            .cloned())
    }

    async fn find_allocation_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> ClearingResult<Option<PaymentAllocation>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .allocations
            .values()
            .find(|a| a.idempotency_key.as_deref() == Some(idempotency_key))
            .cloned())
    }

    async fn find_allocation_for_pair(
        &self,
        request_id: i64,
        bank_txn_id: i64,
    ) -> ClearingResult<Option<PaymentAllocation>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .allocations
            .values()
            .find(|a| a.request_id == request_id && a.bank_txn_id == bank_txn_id)
            .cloned())
    }

    async fn find_allocations_for_request(
        &self,
        request_id: i64,
    ) -> ClearingResult<Vec<PaymentAllocation>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .allocations
            .values()
            .filter(|a| a.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn find_unlinked_allocations(
        &self,
        request_id: i64,
    ) -> ClearingResult<Vec<PaymentAllocation>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .allocations
            .values()
            .filter(|a| a.request_id == request_id && a.voucher_id.is_none())
            .cloned()
            .collect())
    }

    async fn find_settlement_for_request(
        &self,
        request_id: i64,
    ) -> ClearingResult<Option<RequestSettlement>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .settlements
            .get(&request_id)
            .cloned())
    }

    async fn get_voucher(&self, voucher_id: i64) -> ClearingResult<Option<VoucherHeader>> {
        Ok(self.inner.read().unwrap().vouchers.get(&voucher_id).cloned())
    }

    async fn find_voucher_by_number(
        &self,
        board_id: i64,
        employer_id: i64,
        voucher_number: &str,
    ) -> ClearingResult<Option<VoucherHeader>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .vouchers
            .values()
            .find(|v| {
                v.board_id == board_id
                    && v.employer_id == employer_id
                    && v.voucher_number == voucher_number
            })
            .cloned())
    }

    async fn get_voucher_lines(&self, voucher_id: i64) -> ClearingResult<Vec<VoucherLine>> {
        let mut lines: Vec<VoucherLine> = self
            .inner
            .read()
            .unwrap()
            .voucher_lines
            .iter()
            .filter(|l| l.voucher_id == voucher_id)
            .cloned()
            .collect();
        lines.sort_by_key(|l| l.line_no);
        Ok(lines)
    }

    async fn find_note(
        &self,
        note_id: i64,
        board_id: i64,
        employer_id: i64,
    ) -> ClearingResult<Option<DrcrNote>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .notes
            .get(&note_id)
            .filter(|n| n.board_id == board_id && n.employer_id == employer_id)
            .cloned())
    }

    async fn search_notes(
        &self,
        board_id: i64,
        employer_id: i64,
        request_id: Option<i64>,
        voucher_type: Option<&str>,
        limit: usize,
    ) -> ClearingResult<Vec<DrcrNote>> {
        let mut notes: Vec<DrcrNote> = self
            .inner
            .read()
            .unwrap()
            .notes
            .values()
            .filter(|n| n.board_id == board_id && n.employer_id == employer_id)
            .filter(|n| request_id.is_none_or(|id| n.request_id == id))
            .filter(|n| {
                voucher_type.is_none_or(|vt| n.voucher_type.eq_ignore_ascii_case(vt))
            })
            .cloned()
            .collect();
        notes.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(b.note_id.cmp(&a.note_id))
        });
        notes.truncate(limit);
        Ok(notes)
    }

    async fn insert_note(&mut self, note: &DrcrNote) -> ClearingResult<()> {
        let mut store = self.inner.write().unwrap();
        if store.notes.contains_key(&note.note_id) {
            return Err(ClearingError::Conflict(format!(
                "Debit/credit note {} already exists",
                note.note_id
            )));
        }
        store.notes.insert(note.note_id, note.clone());
        Ok(())
    }

    async fn update_note(&mut self, note: &DrcrNote) -> ClearingResult<()> {
        let mut store = self.inner.write().unwrap();
        if !store.notes.contains_key(&note.note_id) {
            return Err(ClearingError::NotFound(format!(
                "Debit/credit note not found: {}",
                note.note_id
            )));
        }
        store.notes.insert(note.note_id, note.clone());
        Ok(())
    }

    async fn delete_note(&mut self, note_id: i64) -> ClearingResult<()> {
        let mut store = self.inner.write().unwrap();
        if store.notes.remove(&note_id).is_none() {
            return Err(ClearingError::NotFound(format!(
                "Debit/credit note not found: {note_id}"
            )));
        }
        Ok(())
    }

    async fn reserve_allocation_id(&self) -> ClearingResult<i64> {
        Ok(self.next_allocation_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn reserve_note_id(&self) -> ClearingResult<i64> {
        Ok(self.next_note_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn reserve_voucher_id(&self) -> ClearingResult<i64> {
        Ok(self.next_voucher_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn apply(&mut self, changes: ChangeSet) -> ClearingResult<()> {
        let mut store = self.inner.write().unwrap();

        // Validate everything before touching anything
        for write in &changes.bank_transactions {
            Self::check_bank_write(&store, write)?;
        }
        for write in &changes.settlements {
            Self::check_settlement_write(&store, write)?;
        }
        for row in &changes.new_allocations {
            Self::check_new_allocation(&store, row)?;
        }
        for row in &changes.linked_allocations {
            Self::check_allocation_link(&store, row)?;
        }
        for voucher in &changes.new_vouchers {
            Self::check_new_voucher(&store, voucher)?;
        }

        for write in changes.bank_transactions {
            let mut record = write.record;
            record.version = write.expected_version.map_or(0, |v| v + 1);
            store.bank_txns.insert(record.bank_txn_id, record);
        }
        for write in changes.settlements {
            let mut record = write.record;
            record.version = write.expected_version.map_or(0, |v| v + 1);
            store.settlements.insert(record.request_id, record);
        }
        for row in changes.new_allocations {
            store.allocations.insert(row.allocation_id, row);
        }
        for row in changes.linked_allocations {
            store.allocations.insert(row.allocation_id, row);
        }
        for voucher in changes.new_vouchers {
            store.vouchers.insert(voucher.voucher_id, voucher);
        }
        store.voucher_lines.extend(changes.voucher_lines);
        Ok(())
    }
}
