//! Admission Control
//!
//! Decides whether a subscription may use a server. Rules are checked in
//! order and the first match wins:
//!
//! 1. server not `online` → [`DenyReason::ServerUnavailable`]
//! 2. premium server, free subscription → [`DenyReason::SubscriptionRequired`]
//! 3. premium subscription inactive or past expiry → [`DenyReason::SubscriptionExpired`]
//! 4. otherwise allowed
//!
//! The check is a pure function of its inputs (the clock is an argument),
//! so it is safe to call from any thread any number of times.

use crate::server::{ServerDescriptor, Tier};
use crate::subscription::Subscription;
use serde::Serialize;
use std::time::SystemTime;

/// Why a connection was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, thiserror::Error)]
pub enum DenyReason {
    #[error("Server is not online")]
    ServerUnavailable,

    #[error("Premium subscription required")]
    SubscriptionRequired,

    #[error("Subscription expired")]
    SubscriptionExpired,
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Admission {
    Allowed,
    Denied(DenyReason),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    /// Convert into a `Result` for `?` propagation
    pub fn into_result(self) -> Result<(), DenyReason> {
        match self {
            Admission::Allowed => Ok(()),
            Admission::Denied(reason) => Err(reason),
        }
    }
}

/// Evaluate admission for `subscription` on `server` as of `now`
pub fn can_connect(
    subscription: &Subscription,
    server: &ServerDescriptor,
    now: SystemTime,
) -> Admission {
    if !server.is_online() {
        return Admission::Denied(DenyReason::ServerUnavailable);
    }

    if server.tier == Tier::Premium && subscription.tier == Tier::Free {
        return Admission::Denied(DenyReason::SubscriptionRequired);
    }

    if subscription.tier == Tier::Premium && subscription.is_lapsed_at(now) {
        return Admission::Denied(DenyReason::SubscriptionExpired);
    }

    Admission::Allowed
}
