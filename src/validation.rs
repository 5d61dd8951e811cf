use crate::config::ListingPolicy;
use crate::error::{LifecycleError, LifecycleResult};
use crate::models::ListingContent;

/// Field-level checks shared by create and update. The first failing field
/// is reported.
pub fn validate_content(
    operation: &'static str,
    content: &ListingContent,
    policy: &ListingPolicy,
) -> LifecycleResult<()> {
    check_len(operation, "make", &content.make, policy.make_len)?;
    check_len(operation, "model", &content.model, policy.model_len)?;

    if !(policy.min_year..=policy.max_year).contains(&content.year) {
        return Err(LifecycleError::validation(
            operation,
            format!(
                "year must be between {} and {}",
                policy.min_year, policy.max_year
            ),
        ));
    }
    if let Some(mileage) = content.mileage
        && mileage > policy.max_mileage
    {
        return Err(LifecycleError::validation(
            operation,
            format!("mileage must not exceed {}", policy.max_mileage),
        ));
    }
    if content.price_cents == 0 || content.price_cents > policy.max_price_cents {
        return Err(LifecycleError::validation(
            operation,
            format!(
                "price must be greater than 0 and at most {}",
                format_cents(policy.max_price_cents)
            ),
        ));
    }
    if let Some(description) = &content.description
        && description.chars().count() > policy.max_description_len
    {
        return Err(LifecycleError::validation(
            operation,
            format!(
                "description must not exceed {} characters",
                policy.max_description_len
            ),
        ));
    }
    Ok(())
}

fn check_len(
    operation: &'static str,
    field: &str,
    value: &str,
    (min, max): (usize, usize),
) -> LifecycleResult<()> {
    let len = value.trim().chars().count();
    if len < min || len > max {
        return Err(LifecycleError::validation(
            operation,
            format!("{field} must be between {min} and {max} characters"),
        ));
    }
    Ok(())
}

pub fn format_cents(cents: u64) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceDecision {
    Unchanged,
    /// Within the routine band; audited normally.
    Routine { change_bps: u64 },
    /// Allowed but large enough to be audited as a security event.
    Flagged { change_bps: u64 },
    Rejected { change_bps: u64 },
}

/// Relative change in basis points, rounded half-up.
pub fn change_bps(old_cents: u64, new_cents: u64) -> u64 {
    if old_cents == 0 {
        return 0;
    }
    let delta = u128::from(old_cents.abs_diff(new_cents));
    let old = u128::from(old_cents);
    ((delta * 10_000 * 2 + old) / (old * 2)) as u64
}

pub fn assess_price_change(
    old_cents: u64,
    new_cents: u64,
    is_admin: bool,
    policy: &ListingPolicy,
) -> PriceDecision {
    if old_cents == new_cents {
        return PriceDecision::Unchanged;
    }
    let change_bps = change_bps(old_cents, new_cents);
    if change_bps > policy.price_reject_bps && !is_admin {
        PriceDecision::Rejected { change_bps }
    } else if change_bps > policy.price_flag_bps {
        PriceDecision::Flagged { change_bps }
    } else {
        PriceDecision::Routine { change_bps }
    }
}

pub fn format_bps(bps: u64) -> String {
    format!("{}.{:02}%", bps / 100, bps % 100)
}
