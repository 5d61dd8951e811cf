use crate::error::{LifecycleError, LifecycleResult};
use crate::models::{Listing, ListingStatus};

/// States reachable from `from` in one step. The same state is handled
/// separately as a no-op.
pub fn allowed_targets(from: ListingStatus) -> &'static [ListingStatus] {
    use ListingStatus::*;
    match from {
        Processing => &[PendingVerification, Published, Archived, Deleted],
        PendingVerification => &[Published, Archived, Deleted],
        Published => &[Sold, Reserved, Archived, Deleted],
        Reserved => &[Published, Sold, Deleted],
        Sold => &[Archived, Deleted],
        Archived => &[Published, Deleted],
        Deleted => &[],
    }
}

pub fn can_transition(from: ListingStatus, to: ListingStatus) -> bool {
    from == to || allowed_targets(from).contains(&to)
}

/// Validates and applies `listing.status -> to`, syncing the derived flags.
///
/// Returns `Ok(false)` when `to` equals the current status (nothing touched),
/// `Ok(true)` when the listing changed. A move to DELETED also drops the media
/// references, so callers that need to wipe storage collect them first.
pub fn apply_transition(
    listing: &mut Listing,
    to: ListingStatus,
    publicly_eligible: bool,
) -> LifecycleResult<bool> {
    let from = listing.status;
    if from == to {
        return Ok(false);
    }
    if !can_transition(from, to) {
        return Err(LifecycleError::invalid_transition("update_status", from, to));
    }
    listing.status = to;
    sync_flags(listing, publicly_eligible);
    Ok(true)
}

/// Derives `active`/`available`/`sold` from the current status.
pub fn sync_flags(listing: &mut Listing, publicly_eligible: bool) {
    match listing.status {
        ListingStatus::Published => {
            listing.available = true;
            listing.sold = false;
            listing.active = publicly_eligible;
        }
        ListingStatus::Reserved => {
            listing.available = false;
            listing.sold = false;
            listing.active = true;
        }
        // active is left to the owner's visibility setting
        ListingStatus::Sold => {
            listing.sold = true;
            listing.available = false;
        }
        ListingStatus::Processing | ListingStatus::PendingVerification => {
            listing.active = false;
            listing.available = false;
            listing.sold = false;
        }
        ListingStatus::Archived => {
            listing.active = false;
            listing.available = false;
            listing.sold = false;
        }
        ListingStatus::Deleted => {
            listing.active = false;
            listing.available = false;
            listing.sold = false;
            listing.clear_media();
        }
    }
}

/// Where a listing goes once its media is READY: PUBLISHED for eligible
/// owners, PENDING_VERIFICATION otherwise. Listings past the intake states
/// keep their status and only have their flags re-derived.
pub fn settle_after_media_ready(listing: &mut Listing, publicly_eligible: bool) -> bool {
    let target = match listing.status {
        ListingStatus::Processing | ListingStatus::PendingVerification => {
            if publicly_eligible {
                ListingStatus::Published
            } else {
                ListingStatus::PendingVerification
            }
        }
        _ => listing.status,
    };
    let changed = listing.status != target;
    listing.status = target;
    sync_flags(listing, publicly_eligible);
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{ListingContent, MediaStatus};
    use serde_json::Value;

    fn listing(status: ListingStatus) -> Listing {
        let mut listing = Listing::draft(
            1,
            10,
            None,
            ListingContent {
                make: "Volvo".into(),
                model: "V70".into(),
                year: 2012,
                price_cents: 1_000_000,
                mileage: Some(180_000),
                description: None,
                specs: Value::Null,
            },
            None,
        );
        listing.status = status;
        listing.images = vec!["a".into(), "b".into()];
        listing.banner = Some("a".into());
        listing.video = Some("v".into());
        listing
    }

    #[test]
    fn every_pair_follows_the_table() {
        let table: &[(ListingStatus, &[ListingStatus])] = &[
            (
                ListingStatus::Processing,
                &[
                    ListingStatus::PendingVerification,
                    ListingStatus::Published,
                    ListingStatus::Archived,
                    ListingStatus::Deleted,
                ],
            ),
            (
                ListingStatus::PendingVerification,
                &[
                    ListingStatus::Published,
                    ListingStatus::Archived,
                    ListingStatus::Deleted,
                ],
            ),
            (
                ListingStatus::Published,
                &[
                    ListingStatus::Sold,
                    ListingStatus::Reserved,
                    ListingStatus::Archived,
                    ListingStatus::Deleted,
                ],
            ),
            (
                ListingStatus::Reserved,
                &[
                    ListingStatus::Published,
                    ListingStatus::Sold,
                    ListingStatus::Deleted,
                ],
            ),
            (
                ListingStatus::Sold,
                &[ListingStatus::Archived, ListingStatus::Deleted],
            ),
            (
                ListingStatus::Archived,
                &[ListingStatus::Published, ListingStatus::Deleted],
            ),
            (ListingStatus::Deleted, &[]),
        ];

        for (from, allowed) in table {
            for to in ListingStatus::ALL {
                let mut subject = listing(*from);
                let result = apply_transition(&mut subject, to, true);
                if *from == to {
                    assert_eq!(result.ok(), Some(false), "{from} -> {to} is a no-op");
                    assert_eq!(subject.status, *from);
                } else if allowed.contains(&to) {
                    assert_eq!(result.ok(), Some(true), "{from} -> {to} should be allowed");
                    assert_eq!(subject.status, to);
                } else {
                    let err = result.expect_err("transition outside the table");
                    assert_eq!(err.kind(), ErrorKind::InvalidTransition, "{from} -> {to}");
                    assert!(err.detail().contains(from.as_str()));
                    assert!(err.detail().contains(to.as_str()));
                    assert_eq!(subject.status, *from, "rejected moves leave the record alone");
                }
            }
        }
    }

    #[test]
    fn published_active_follows_eligibility() {
        let mut eligible = listing(ListingStatus::Processing);
        apply_transition(&mut eligible, ListingStatus::Published, true).unwrap();
        assert!(eligible.active && eligible.available && !eligible.sold);

        let mut pending = listing(ListingStatus::Processing);
        apply_transition(&mut pending, ListingStatus::Published, false).unwrap();
        assert!(!pending.active);
        assert!(pending.available);
    }

    #[test]
    fn sold_and_reserved_flags() {
        let mut subject = listing(ListingStatus::Published);
        apply_transition(&mut subject, ListingStatus::Reserved, false).unwrap();
        assert!(subject.active && !subject.available && !subject.sold);

        apply_transition(&mut subject, ListingStatus::Sold, false).unwrap();
        assert!(subject.sold && !subject.available);
        assert!(subject.active, "sold leaves the visibility toggle alone");

        apply_transition(&mut subject, ListingStatus::Archived, false).unwrap();
        assert!(!subject.sold && !subject.active && !subject.available);
    }

    #[test]
    fn deleted_clears_media() {
        let mut subject = listing(ListingStatus::Published);
        apply_transition(&mut subject, ListingStatus::Deleted, true).unwrap();
        assert!(subject.images.is_empty());
        assert!(subject.video.is_none());
        assert!(subject.banner.is_none());
        assert!(!subject.active && !subject.sold);
    }

    #[test]
    fn media_ready_settles_intake_states_only() {
        let mut intake = listing(ListingStatus::Processing);
        intake.media_status = MediaStatus::Ready;
        assert!(settle_after_media_ready(&mut intake, false));
        assert_eq!(intake.status, ListingStatus::PendingVerification);
        assert!(settle_after_media_ready(&mut intake, true));
        assert_eq!(intake.status, ListingStatus::Published);
        assert!(intake.active);

        let mut reserved = listing(ListingStatus::Reserved);
        assert!(!settle_after_media_ready(&mut reserved, false));
        assert_eq!(reserved.status, ListingStatus::Reserved);
    }
}
