//! Validation utilities

use bigdecimal::BigDecimal;

use crate::types::*;

/// Validate that a named amount is strictly positive
pub fn validate_positive_amount(field: &str, amount: &BigDecimal) -> ClearingResult<()> {
    if *amount <= BigDecimal::from(0) {
        Err(ClearingError::Validation(format!(
            "{field} must be greater than zero"
        )))
    } else {
        Ok(())
    }
}

/// Trim an idempotency key; blank keys are treated as absent
pub fn normalize_idempotency_key(key: Option<&str>) -> Option<String> {
    key.map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// Validate a settlement breakdown: non-empty, positive amounts, and an
/// exact decimal match between the entry sum and the settlement total.
pub fn validate_breakdown(
    total_amount: &BigDecimal,
    breakdown: &[AllocationBreakdown],
) -> ClearingResult<()> {
    if breakdown.is_empty() {
        return Err(ClearingError::Validation(
            "Settlement must contain at least one allocation breakdown entry".to_string(),
        ));
    }
    for entry in breakdown {
        validate_positive_amount("breakdown amount", &entry.amount)?;
    }
    let sum: BigDecimal = breakdown.iter().map(|entry| &entry.amount).sum();
    if &sum != total_amount {
        return Err(ClearingError::Validation(format!(
            "Allocation breakdown sums to {sum}, expected {total_amount}"
        )));
    }
    Ok(())
}
