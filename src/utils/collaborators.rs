//! Fixed-value collaborator implementations for tests and development

use async_trait::async_trait;
use std::collections::HashMap;

use crate::traits::{PaymentStatusNotifier, StatusEntry, StatusSource, TenantAccessResolver};
use crate::types::*;

/// [`StatusSource`] backed by a fixed in-memory table
#[derive(Debug, Clone, Default)]
pub struct StaticStatusSource {
    entries: HashMap<(String, String), i32>,
}

impl StaticStatusSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table covering every domain/code pair this crate writes
    pub fn with_defaults() -> Self {
        let mut source = Self::new();
        let defaults: [(&str, &str); 10] = [
            (status_domain::BANK_TRANSACTION, "UNALLOCATED"),
            (status_domain::BANK_TRANSACTION, "PARTIALLY_ALLOCATED"),
            (status_domain::BANK_TRANSACTION, "SETTLED"),
            (status_domain::PAYMENT_ALLOCATION, "ALLOCATED"),
            (status_domain::PAYMENT_ALLOCATION, "SETTLED"),
            (status_domain::REQUEST_SETTLEMENT, "CREATED"),
            (status_domain::REQUEST_SETTLEMENT, "ALLOCATED"),
            (status_domain::REQUEST_SETTLEMENT, "SETTLED"),
            (status_domain::VOUCHER_HEADER, "CREATED"),
            (status_domain::VOUCHER_HEADER, "POSTED"),
        ];
        for (i, (domain, code)) in defaults.into_iter().enumerate() {
            source.insert(domain, code, (i + 1) as i32);
        }
        source
    }

    pub fn insert(&mut self, domain: &str, code: &str, id: i32) {
        self.entries
            .insert((domain.to_string(), code.to_string()), id);
    }
}

#[async_trait]
impl StatusSource for StaticStatusSource {
    async fn load_status_id(&self, domain: &str, code: &str) -> ClearingResult<Option<i32>> {
        Ok(self
            .entries
            .get(&(domain.to_string(), code.to_string()))
            .copied())
    }

    async fn load_all(&self) -> ClearingResult<Vec<StatusEntry>> {
        Ok(self
            .entries
            .iter()
            .map(|((domain, code), id)| StatusEntry {
                domain: domain.clone(),
                code: code.clone(),
                id: *id,
            })
            .collect())
    }
}

/// [`TenantAccessResolver`] returning one fixed tenant scope
#[derive(Debug, Clone)]
pub struct StaticTenantAccess {
    access: Option<TenantAccess>,
}

impl StaticTenantAccess {
    pub fn new(access: TenantAccess) -> Self {
        Self {
            access: Some(access),
        }
    }

    /// A resolver for a caller with no tenant assignment
    pub fn absent() -> Self {
        Self { access: None }
    }
}

#[async_trait]
impl TenantAccessResolver for StaticTenantAccess {
    async fn current_access(&self) -> ClearingResult<Option<TenantAccess>> {
        Ok(self.access.clone())
    }
}

/// [`PaymentStatusNotifier`] that only logs the outbound call
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl PaymentStatusNotifier for LoggingNotifier {
    async fn notify(
        &self,
        request_id: i64,
        status: ReconciliationStatus,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            request_id,
            status = status.as_str(),
            "payment status notification"
        );
        Ok(())
    }
}
