//! Qualification gate for referred users.
//!
//! Only referred users that pass the gate count toward a referrer's tier
//! and trigger conditions. The bar itself belongs to an external
//! abuse-detection service.

use std::collections::HashSet;
use std::sync::RwLock;

use creatorpay_types::UserId;

/// Verdict source for referred users.
pub trait AbuseSignal: Send + Sync {
    /// Whether the user's account passed the activity/verification bar.
    fn is_qualified(&self, user_id: &UserId) -> bool;
}

/// Qualifies every user.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AbuseSignal for AllowAll {
    fn is_qualified(&self, _user_id: &UserId) -> bool {
        true
    }
}

/// Qualifies everyone except explicitly flagged users.
#[derive(Debug, Default)]
pub struct DenyList {
    flagged: RwLock<HashSet<UserId>>,
}

impl DenyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(&self, user_id: UserId) {
        if let Ok(mut flagged) = self.flagged.write() {
            flagged.insert(user_id);
        }
    }

    pub fn clear(&self, user_id: &UserId) {
        if let Ok(mut flagged) = self.flagged.write() {
            flagged.remove(user_id);
        }
    }
}

impl AbuseSignal for DenyList {
    fn is_qualified(&self, user_id: &UserId) -> bool {
        // A poisoned lock fails closed.
        self.flagged
            .read()
            .map(|flagged| !flagged.contains(user_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_list() {
        let list = DenyList::new();
        let user = UserId::from("u1");
        assert!(list.is_qualified(&user));
        list.flag(user.clone());
        assert!(!list.is_qualified(&user));
        list.clear(&user);
        assert!(list.is_qualified(&user));
        assert!(AllowAll.is_qualified(&user));
    }
}
