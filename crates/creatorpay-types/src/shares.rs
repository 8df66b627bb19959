//! Per-source platform-share table.
//!
//! One authoritative table of the fraction of gross revenue the platform
//! retains, per [`RevenueSource`]. Defaults:
//!
//! | Source       | Platform share |
//! |--------------|----------------|
//! | tip          | 10%            |
//! | subscription | 0%             |
//! | ad           | 35%            |
//! | affiliate    | 40%            |
//! | referral     | 55%            |

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::RevenueSource;
use crate::money::is_unit_fraction;

/// Default platform share on tips (10%).
pub const DEFAULT_TIP_SHARE: Decimal = Decimal::from_parts(10, 0, 0, false, 2);
/// Default platform share on creator subscriptions (pass-through, 0%).
pub const DEFAULT_SUBSCRIPTION_SHARE: Decimal = Decimal::ZERO;
/// Default platform share on ad revenue (35%).
pub const DEFAULT_AD_SHARE: Decimal = Decimal::from_parts(35, 0, 0, false, 2);
/// Default platform share on affiliate sales (40%).
pub const DEFAULT_AFFILIATE_SHARE: Decimal = Decimal::from_parts(40, 0, 0, false, 2);
/// Default platform share on direct referral conversions (55%).
pub const DEFAULT_REFERRAL_SHARE: Decimal = Decimal::from_parts(55, 0, 0, false, 2);

/// Platform-share fraction per revenue source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShareTable {
    pub tip: Decimal,
    pub subscription: Decimal,
    pub ad: Decimal,
    pub affiliate: Decimal,
    pub referral: Decimal,
}

impl Default for ShareTable {
    fn default() -> Self {
        Self {
            tip: DEFAULT_TIP_SHARE,
            subscription: DEFAULT_SUBSCRIPTION_SHARE,
            ad: DEFAULT_AD_SHARE,
            affiliate: DEFAULT_AFFILIATE_SHARE,
            referral: DEFAULT_REFERRAL_SHARE,
        }
    }
}

impl ShareTable {
    /// Platform share for an earning source. Withdrawals carry no share.
    pub fn share_for(&self, source: RevenueSource) -> Decimal {
        match source {
            RevenueSource::Tip => self.tip,
            RevenueSource::Subscription => self.subscription,
            RevenueSource::Ad => self.ad,
            RevenueSource::Affiliate => self.affiliate,
            RevenueSource::Referral => self.referral,
            RevenueSource::PlatformWithdrawal => Decimal::ZERO,
        }
    }

    /// Returns the first source whose fraction lies outside `[0, 1]`.
    pub fn invalid_source(&self) -> Option<RevenueSource> {
        RevenueSource::ALL
            .into_iter()
            .find(|src| !is_unit_fraction(self.share_for(*src)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_table() {
        let table = ShareTable::default();
        assert_eq!(table.share_for(RevenueSource::Tip), dec!(0.10));
        assert_eq!(table.share_for(RevenueSource::Subscription), dec!(0));
        assert_eq!(table.share_for(RevenueSource::Ad), dec!(0.35));
        assert_eq!(table.share_for(RevenueSource::Affiliate), dec!(0.40));
        assert_eq!(table.share_for(RevenueSource::Referral), dec!(0.55));
        assert!(table.invalid_source().is_none());
    }

    #[test]
    fn test_invalid_fraction_detected() {
        let table = ShareTable {
            ad: dec!(1.2),
            ..ShareTable::default()
        };
        assert_eq!(table.invalid_source(), Some(RevenueSource::Ad));
    }
}
