//! Subscription Entitlements
//!
//! The core never owns billing state. It reads the caller's current
//! [`Subscription`] through a [`SubscriptionSource`] on every connect,
//! so an upgrade or expiry takes effect on the very next attempt.

use crate::server::Tier;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, SystemTime};

/// Entitlement snapshot supplied by the billing collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub tier: Tier,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<SystemTime>,
}

impl Subscription {
    /// Active free plan (the default for new users)
    pub fn free() -> Self {
        Self {
            tier: Tier::Free,
            active: true,
            expires_at: None,
        }
    }

    /// Active premium plan ending at `expires_at`
    pub fn premium_until(expires_at: SystemTime) -> Self {
        Self {
            tier: Tier::Premium,
            active: true,
            expires_at: Some(expires_at),
        }
    }

    /// Active premium plan for `period` from now
    pub fn premium_for(period: Duration) -> Self {
        Self::premium_until(SystemTime::now() + period)
    }

    /// Has the plan lapsed as of `now`?
    ///
    /// A plan is lapsed when it has been deactivated or its expiry instant
    /// is at or before `now`.
    pub fn is_lapsed_at(&self, now: SystemTime) -> bool {
        !self.active || self.expires_at.is_some_and(|at| at <= now)
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::free()
    }
}

/// Accessor for the caller's current subscription
pub trait SubscriptionSource: Send + Sync {
    fn current(&self) -> Subscription;
}

impl SubscriptionSource for Subscription {
    fn current(&self) -> Subscription {
        self.clone()
    }
}

/// Settable, thread-safe subscription holder
///
/// Stands in for the billing collaborator: whoever owns it can swap the
/// value at any time and the session manager sees the change on its next
/// connect.
#[derive(Debug, Default)]
pub struct SharedSubscription {
    inner: RwLock<Subscription>,
}

impl SharedSubscription {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            inner: RwLock::new(subscription),
        }
    }

    /// Replace the current subscription
    pub fn set(&self, subscription: Subscription) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = subscription;
    }
}

impl SubscriptionSource for SharedSubscription {
    fn current(&self) -> Subscription {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
