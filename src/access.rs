use crate::error::{LifecycleError, LifecycleResult};
use crate::models::{Actor, Listing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    CreateListing,
    UploadFiles,
    ModifyListing,
    ChangeStatus,
    ManageMedia,
    DeleteListing,
}

impl Capability {
    fn describe(self) -> &'static str {
        match self {
            Capability::CreateListing => "create listings",
            Capability::UploadFiles => "upload files",
            Capability::ModifyListing => "update listings",
            Capability::ChangeStatus => "change listing status",
            Capability::ManageMedia => "manage listing media",
            Capability::DeleteListing => "delete listings",
        }
    }
}

/// Evaluated by the lifecycle service before every mutation.
pub trait AccessPolicy: Send + Sync {
    fn check(&self, actor: &Actor, capability: Capability, listing: Option<&Listing>) -> LifecycleResult<()>;
}

/// Owners, co-owners and admins may act on a listing; any authenticated
/// caller may create listings and stage uploads.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnershipPolicy;

impl AccessPolicy for OwnershipPolicy {
    fn check(&self, actor: &Actor, capability: Capability, listing: Option<&Listing>) -> LifecycleResult<()> {
        let Some(listing) = listing else {
            return Ok(());
        };
        if actor.is_admin() || listing.is_owned_by(actor.id) {
            return Ok(());
        }
        Err(LifecycleError::unauthorized(
            "access_check",
            format!("you can only {} you own", capability.describe()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{ListingContent, Role};
    use serde_json::Value;

    #[test]
    fn owners_co_owners_and_admins_pass() {
        let content = ListingContent {
            make: "Ford".into(),
            model: "Focus".into(),
            year: 2011,
            price_cents: 300_000,
            mileage: None,
            description: None,
            specs: Value::Null,
        };
        let listing = Listing::draft(1, 10, Some(11), content, None);
        let policy = OwnershipPolicy;

        for actor in [
            Actor::new(10, Role::User),
            Actor::new(11, Role::Dealer),
            Actor::new(99, Role::Admin),
        ] {
            assert!(policy.check(&actor, Capability::ManageMedia, Some(&listing)).is_ok());
        }
        let err = policy
            .check(&Actor::new(12, Role::User), Capability::DeleteListing, Some(&listing))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(err.detail().contains("delete listings"));
        assert!(policy.check(&Actor::new(12, Role::User), Capability::CreateListing, None).is_ok());
    }
}
