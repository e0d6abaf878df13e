//! Settlement/voucher posting: converting a fully-funded request into an
//! immutable, balanced double-entry voucher

use std::collections::BTreeMap;
use std::sync::Arc;

use bigdecimal::BigDecimal;

use crate::ledger::changeset::WorkingSet;
use crate::ledger::{dispatch_notifications, require_tenant_access};
use crate::status::StatusCache;
use crate::traits::{ClearingStorage, PaymentStatusNotifier, TenantAccessResolver};
use crate::types::*;
use crate::utils::validation::{normalize_idempotency_key, validate_breakdown};

/// Natural-key prefix used when the caller supplies no idempotency key
const VOUCHER_KEY_PREFIX: &str = "REQ-";
/// GL source of the single debit line (what the request owes)
const DR_GL_SOURCE: &str = "EMPLOYEE_PAYABLE";
/// GL source of the credit lines (where the funds came from)
const CR_GL_SOURCE: &str = "BANK_CLEARING";

/// Outcome of posting a settlement into a working set
pub(crate) struct PostedSettlement {
    pub result: SettlementResult,
    /// Absent on an idempotent replay, which commits nothing
    pub notification: Option<StatusNotification>,
}

/// Settlement poster: loads or creates the voucher for a request, consumes
/// its unlinked allocations, and finalizes the settlement state.
pub struct SettlementPoster<S: ClearingStorage> {
    storage: S,
    statuses: StatusCache,
    tenants: Arc<dyn TenantAccessResolver>,
    notifier: Arc<dyn PaymentStatusNotifier>,
}

impl<S: ClearingStorage> SettlementPoster<S> {
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

    /// Post a settlement as one atomic unit of work.
    ///
    /// Everything up to the commit can fail without leaving a trace; the
    /// best-effort status notification goes out only after the commit.
    pub async fn post_settlement(
        &mut self,
        request: &SettlementRequest,
    ) -> ClearingResult<SettlementResult> {
        let tenant = require_tenant_access(self.tenants.as_ref()).await?;
        let mut work = WorkingSet::new(&self.storage);
        let posted = post_into(&mut work, &self.statuses, &tenant, request).await?;
        let changes = work.into_change_set();
        if !changes.is_empty() {
            self.storage.apply(changes).await?;
        }
        if let Some(notification) = posted.notification {
            dispatch_notifications(self.notifier.as_ref(), &[notification]).await;
        }
        Ok(posted.result)
    }
}

/// Post a settlement into an already-open working set.
///
/// Used directly by [`SettlementPoster::post_settlement`] and by the
/// allocation engine when a request becomes fully funded mid-batch, so the
/// voucher lands in the same atomic commit as the allocations that funded it.
pub(crate) async fn post_into<S: ClearingStorage>(
    work: &mut WorkingSet<'_, S>,
    statuses: &StatusCache,
    tenant: &TenantAccess,
    request: &SettlementRequest,
) -> ClearingResult<PostedSettlement> {
    let mut settlement = work
        .settlement_for_request(request.request_id)
        .await?
        .ok_or_else(|| {
            ClearingError::NotFound(format!(
                "Request settlement not found for request {}",
                request.request_id
            ))
        })?;
    if !tenant.covers(settlement.board_id, settlement.employer_id) {
        return Err(ClearingError::Conflict(format!(
            "Tenant mismatch for request settlement {}",
            request.request_id
        )));
    }

    validate_breakdown(&request.total_amount, &request.allocations)?;

    let voucher_number = normalize_idempotency_key(request.idempotency_key.as_deref())
        .unwrap_or_else(|| format!("{VOUCHER_KEY_PREFIX}{}", request.request_id));

    // Natural-key idempotency: an existing voucher means this settlement has
    // already been posted, so replay it without touching anything.
    if let Some(existing) = work
        .voucher_by_number(tenant.board_id, tenant.employer_id, &voucher_number)
        .await?
    {
        return Ok(PostedSettlement {
            result: SettlementResult {
                voucher_id: existing.voucher_id,
                voucher_status: existing.status,
                total_debit: existing.total_debit,
                total_credit: existing.total_credit,
                message: "Idempotent request - returning existing voucher".to_string(),
            },
            notification: None,
        });
    }

    // voucher_id is set exactly once; a settlement already pointing at a
    // voucher cannot be re-pointed through a different natural key
    if let Some(linked_voucher) = settlement.voucher_id {
        return Err(ClearingError::Conflict(format!(
            "Request {} is already settled by voucher {linked_voucher}",
            request.request_id
        )));
    }

    // A request's funds may span several bank transactions; fold the
    // breakdown down to one required amount per transaction
    let mut required_per_txn: BTreeMap<i64, BigDecimal> = BTreeMap::new();
    for entry in &request.allocations {
        let required = required_per_txn
            .entry(entry.bank_txn_id)
            .or_insert_with(|| BigDecimal::from(0));
        *required += &entry.amount;
    }

    let voucher_id = work.reserve_voucher_id().await?;
    let mut voucher = VoucherHeader::new(
        voucher_id,
        voucher_number,
        request.request_id,
        tenant.board_id,
        tenant.employer_id,
    );

    let mut lines = vec![VoucherLine::debit(
        voucher_id,
        1,
        DR_GL_SOURCE,
        request.total_amount.clone(),
    )];
    let mut line_no = 1u32;

    let settled_allocation_status_id = statuses
        .require_id(status_domain::PAYMENT_ALLOCATION, AllocationStatus::Settled.as_str())
        .await?;
    let unlinked = work.unlinked_allocations(request.request_id).await?;

    for (bank_txn_id, required) in &required_per_txn {
        let candidates: Vec<&PaymentAllocation> = unlinked
            .iter()
            .filter(|a| a.bank_txn_id == *bank_txn_id)
            .collect();
        let available: BigDecimal = candidates.iter().map(|a| &a.allocated_amount).sum();
        if &available < required {
            return Err(ClearingError::Conflict(format!(
                "Not enough unlinked allocations for bank transaction {bank_txn_id}"
            )));
        }

        // Consume whole rows oldest-first; an allocation is atomic and can
        // never be split across voucher boundaries
        let mut outstanding = required.clone();
        for row in candidates {
            if outstanding == BigDecimal::from(0) {
                break;
            }
            if row.allocated_amount > outstanding {
                return Err(ClearingError::Conflict(format!(
                    "Cannot partially consume allocation {}",
                    row.allocation_id
                )));
            }
            outstanding -= &row.allocated_amount;

            let mut linked = row.clone();
            linked.voucher_id = Some(voucher_id);
            linked.status = AllocationStatus::Settled;
            linked.status_id = Some(settled_allocation_status_id);
            linked.updated_at = chrono::Utc::now().naive_utc();

            line_no += 1;
            lines.push(VoucherLine::credit(
                voucher_id,
                line_no,
                CR_GL_SOURCE,
                linked.allocated_amount.clone(),
                linked.bank_txn_id,
                linked.allocation_id,
            ));
            work.stage_allocation_link(linked);
        }
        if outstanding != BigDecimal::from(0) {
            return Err(ClearingError::Conflict(format!(
                "Unlinked allocations for bank transaction {bank_txn_id} leave {outstanding} unconsumed"
            )));
        }
    }

    // Balanced by construction: one debit for the total, credits summing to
    // the same consumed total
    voucher.total_debit = request.total_amount.clone();
    voucher.total_credit = request.total_amount.clone();
    voucher.status = VoucherStatus::Posted;
    voucher.status_id = Some(
        statuses
            .require_id(status_domain::VOUCHER_HEADER, VoucherStatus::Posted.as_str())
            .await?,
    );
    let now = chrono::Utc::now().naive_utc();
    voucher.posted_at = Some(now);
    voucher.updated_at = now;
    work.stage_new_voucher(voucher);
    work.stage_voucher_lines(lines);

    settlement.voucher_id = Some(voucher_id);
    settlement.status = if settlement.is_fully_allocated() {
        SettlementStatus::Settled
    } else {
        SettlementStatus::Allocated
    };
    settlement.status_id = Some(
        statuses
            .require_id(status_domain::REQUEST_SETTLEMENT, settlement.status.as_str())
            .await?,
    );
    settlement.updated_at = now;
    let reconciliation = if settlement.is_fully_allocated() {
        ReconciliationStatus::Reconciled
    } else {
        ReconciliationStatus::Partial
    };
    work.stage_settlement(settlement);

    tracing::info!(
        voucher_id,
        request_id = request.request_id,
        "voucher posted for request settlement"
    );

    Ok(PostedSettlement {
        result: SettlementResult {
            voucher_id,
            voucher_status: VoucherStatus::Posted,
            total_debit: request.total_amount.clone(),
            total_credit: request.total_amount.clone(),
            message: "Voucher created".to_string(),
        },
        notification: Some(StatusNotification::new(request.request_id, reconciliation)),
    })
}
