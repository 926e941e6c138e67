use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every purchased month adds this many days of access
pub const DAYS_PER_MONTH: i64 = 30;

/// Purchasable range of months per payment
pub const MIN_SUBSCRIPTION_MONTHS: i32 = 1;
pub const MAX_SUBSCRIPTION_MONTHS: i32 = 12;

/// API model for a user's subscription (entitlement window)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Expiry is derived from the end date, never stored. A row can be
    /// active and expired until the maintenance sweep deactivates it.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.end_date
    }

    /// Active and not yet expired
    pub fn grants_access_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired_at(now)
    }

    pub fn days_remaining_at(&self, now: DateTime<Utc>) -> i64 {
        if self.is_expired_at(now) {
            return 0;
        }
        (self.end_date - now).num_days()
    }
}

/// Diesel model for the subscriptions table
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::subscriptions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SubscriptionModel {
    pub id: Uuid,
    pub user_id: Uuid,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert model for new subscriptions
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::subscriptions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub is_active: bool,
}

impl From<SubscriptionModel> for Subscription {
    fn from(model: SubscriptionModel) -> Self {
        Self {
            id: model.id,
            user_id: model.user_id,
            start_date: model.start_date,
            end_date: model.end_date,
            is_active: model.is_active,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

/// The access window an activation produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitlementWindow {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

/// How an activation changed the user's entitlement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Created,
    Extended,
    Reactivated,
}

/// Access granted for `months`, kept within the purchasable range
pub fn purchased_duration(months: i32) -> Duration {
    let months = months.clamp(MIN_SUBSCRIPTION_MONTHS, MAX_SUBSCRIPTION_MONTHS);
    Duration::days(DAYS_PER_MONTH * i64::from(months))
}

/// Compute the window a successful payment of `months` grants.
///
/// An active, unexpired subscription is extended from its current end date
/// so purchases stack. Anything else (no row, deactivated, expired) starts a
/// fresh window at `now`.
pub fn next_window(
    existing: Option<&Subscription>,
    months: i32,
    now: DateTime<Utc>,
) -> (EntitlementWindow, ActivationKind) {
    let duration = purchased_duration(months);

    match existing {
        None => (
            EntitlementWindow {
                start_date: now,
                end_date: now + duration,
            },
            ActivationKind::Created,
        ),
        Some(current) if current.grants_access_at(now) => (
            EntitlementWindow {
                start_date: current.start_date,
                end_date: current.end_date + duration,
            },
            ActivationKind::Extended,
        ),
        Some(_) => (
            EntitlementWindow {
                start_date: now,
                end_date: now + duration,
            },
            ActivationKind::Reactivated,
        ),
    }
}
