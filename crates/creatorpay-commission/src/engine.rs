//! Allocation of a single revenue event.
//!
//! The split is computed in this order:
//!
//! 1. The creator keeps `gross × (1 − share(source))`, rounded half-even to
//!    the minor unit. The rest is the platform share.
//! 2. An active referrer earns `gross × tier.commission_rate`, the tier's
//!    per-referral bonus, and the tier's one-off bonus if it was not paid yet.
//! 3. Active bonus rules fire in priority order. Non-recurring rules that the
//!    referrer already received are skipped.
//! 4. The platform retains whatever is left. Referral payouts come out of
//!    the platform side, so the retained amount may go negative.
//!
//! Every amount handed to a party becomes exactly one [`EntryDraft`], and the
//! sum of the drafts plus the retained amount must equal the gross.

use std::collections::HashSet;

use creatorpay_types::event::RawEvent;
use creatorpay_types::ledger::{EntryDraft, RevenueSource};
use creatorpay_types::money::{apply_rate, is_minor_exact, is_unit_fraction, round_minor};
use creatorpay_types::referral::{ReferralBonusRule, ReferralTier, ReferrerStats};
use creatorpay_types::shares::ShareTable;
use creatorpay_types::{RuleId, UserId};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::triggers;
use crate::{CommissionError, Result};

/// Referrer resolution result supplied by the caller.
#[derive(Clone, Debug, PartialEq)]
pub enum ReferrerState {
    /// The event has no referrer.
    None,
    /// The referrer exists, is active, and has a resolved tier.
    Active {
        referrer_id: UserId,
        tier: ReferralTier,
        stats: ReferrerStats,
        /// Tier levels whose one-off tier bonus was already paid.
        reached_tiers: HashSet<u32>,
    },
    /// The referrer is deleted, deactivated, or otherwise ineligible.
    Inactive { referrer_id: UserId, reason: String },
}

impl ReferrerState {
    pub fn referrer_id(&self) -> Option<&UserId> {
        match self {
            ReferrerState::None => None,
            ReferrerState::Active { referrer_id, .. } | ReferrerState::Inactive { referrer_id, .. } => {
                Some(referrer_id)
            }
        }
    }
}

/// Everything the engine needs besides the event itself.
#[derive(Clone, Copy, Debug)]
pub struct CommissionContext<'a> {
    pub shares: &'a ShareTable,
    pub referrer: &'a ReferrerState,
    /// Active bonus rules. Sorted by the engine, so any order is accepted.
    pub rules: &'a [ReferralBonusRule],
    /// Non-recurring rules already granted to the referrer.
    pub granted: &'a HashSet<RuleId>,
}

/// A bonus rule that fired for this event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BonusAward {
    pub rule_id: RuleId,
    pub rule_name: String,
    pub amount: Decimal,
    pub is_recurring: bool,
    /// Index into [`Allocation::drafts`] of the entry paying this bonus.
    pub draft_index: usize,
}

/// A one-off tier bonus paid with this event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TierBonus {
    pub tier_level: u32,
    pub amount: Decimal,
    pub draft_index: usize,
}

/// Kinds of ledger anomaly raised during allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// The referrer could not be paid; its share stayed with the platform.
    InactiveReferrer,
    /// The creator was attributed as their own referrer.
    SelfReferral,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::InactiveReferrer => "inactive_referrer",
            AnomalyKind::SelfReferral => "self_referral",
        }
    }
}

/// Something the caller should record and surface, without failing the event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub creator_id: UserId,
    pub referrer_id: UserId,
    pub detail: String,
    /// Amount kept by the platform instead of being paid out.
    pub amount: Decimal,
}

/// The outcome of allocating one event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Allocation {
    pub gross: Decimal,
    pub creator_net: Decimal,
    /// Commission, per-referral bonus and tier bonus paid to the referrer.
    pub referrer_net: Decimal,
    pub bonuses: Vec<BonusAward>,
    pub platform_retained: Decimal,
    /// Non-recurring rules that fired and must be recorded as granted.
    pub consumed_rules: Vec<RuleId>,
    pub tier_bonus_paid: Option<TierBonus>,
    pub anomaly: Option<Anomaly>,
    /// Ledger entries to append, creator entry first.
    pub drafts: Vec<EntryDraft>,
}

impl Allocation {
    /// Sum of all bonus rule awards.
    pub fn bonus_total(&self) -> Decimal {
        self.bonuses.iter().map(|b| b.amount).sum()
    }
}

/// Allocate a raw event between creator, referrer and platform.
///
/// # Errors
///
/// - [`CommissionError::Validation`] for withdrawals, non-positive or
///   sub-cent amounts, and share or commission fractions outside `[0, 1]`
/// - [`CommissionError::Overflow`] on arithmetic overflow
/// - [`CommissionError::LedgerInconsistency`] if the parts do not add back up
pub fn evaluate(event: &RawEvent, ctx: &CommissionContext<'_>) -> Result<Allocation> {
    validate_event(event, ctx)?;

    let gross = event.gross_amount;
    let share = ctx.shares.share_for(event.source);
    let creator_draft = EntryDraft::earning(
        event.creator_id.clone(),
        event.source,
        gross,
        share,
        event.occurred_at,
    )
    .ok_or(CommissionError::Overflow)?;
    let creator_net = creator_draft.net_amount;
    let platform_share = gross.checked_sub(creator_net).ok_or(CommissionError::Overflow)?;

    let mut allocation = Allocation {
        gross,
        creator_net,
        referrer_net: Decimal::ZERO,
        bonuses: Vec::new(),
        platform_retained: Decimal::ZERO,
        consumed_rules: Vec::new(),
        tier_bonus_paid: None,
        anomaly: None,
        drafts: vec![creator_draft],
    };

    match ctx.referrer {
        ReferrerState::None => {}
        ReferrerState::Inactive {
            referrer_id,
            reason,
        } => {
            allocation.anomaly = Some(Anomaly {
                kind: AnomalyKind::InactiveReferrer,
                creator_id: event.creator_id.clone(),
                referrer_id: referrer_id.clone(),
                detail: reason.clone(),
                amount: platform_share,
            });
        }
        ReferrerState::Active { referrer_id, .. } if *referrer_id == event.creator_id => {
            allocation.anomaly = Some(Anomaly {
                kind: AnomalyKind::SelfReferral,
                creator_id: event.creator_id.clone(),
                referrer_id: referrer_id.clone(),
                detail: "creator attributed to itself".to_string(),
                amount: platform_share,
            });
        }
        ReferrerState::Active {
            referrer_id,
            tier,
            stats,
            reached_tiers,
        } => {
            pay_referrer(&mut allocation, event, referrer_id, tier, reached_tiers)?;
            pay_bonus_rules(&mut allocation, event, referrer_id, stats, ctx)?;
        }
    }

    let bonus_total = allocation.bonus_total();
    allocation.platform_retained = gross
        .checked_sub(creator_net)
        .and_then(|v| v.checked_sub(allocation.referrer_net))
        .and_then(|v| v.checked_sub(bonus_total))
        .ok_or(CommissionError::Overflow)?;

    check_conservation(&allocation)?;

    tracing::debug!(
        creator = %event.creator_id,
        source = event.source.as_str(),
        gross = %gross,
        creator_net = %allocation.creator_net,
        referrer_net = %allocation.referrer_net,
        bonuses = %bonus_total,
        platform_retained = %allocation.platform_retained,
        "event allocated"
    );

    Ok(allocation)
}

fn validate_event(event: &RawEvent, ctx: &CommissionContext<'_>) -> Result<()> {
    if event.source == RevenueSource::PlatformWithdrawal {
        return Err(CommissionError::Validation(
            "withdrawals are not revenue events".to_string(),
        ));
    }
    if event.gross_amount <= Decimal::ZERO {
        return Err(CommissionError::Validation(format!(
            "gross amount must be positive, got {}",
            event.gross_amount
        )));
    }
    if !is_minor_exact(event.gross_amount) {
        return Err(CommissionError::Validation(format!(
            "gross amount {} has sub-cent precision",
            event.gross_amount
        )));
    }
    if let Some(source) = ctx.shares.invalid_source() {
        return Err(CommissionError::Validation(format!(
            "platform share for {} is outside [0, 1]",
            source.as_str()
        )));
    }
    if event.referrer_id.as_ref() != ctx.referrer.referrer_id() {
        return Err(CommissionError::Validation(
            "resolved referrer does not match the event".to_string(),
        ));
    }
    if let ReferrerState::Active { tier, .. } = ctx.referrer {
        if !is_unit_fraction(tier.commission_rate) {
            return Err(CommissionError::Validation(format!(
                "commission rate {} of tier {} is outside [0, 1]",
                tier.commission_rate, tier.tier_level
            )));
        }
    }
    Ok(())
}

fn pay_referrer(
    allocation: &mut Allocation,
    event: &RawEvent,
    referrer_id: &UserId,
    tier: &ReferralTier,
    reached_tiers: &HashSet<u32>,
) -> Result<()> {
    let gross = event.gross_amount;

    // Recorded as a referral entry whose retained share is `1 - rate`, so the
    // net satisfies the ledger's rounding invariant against the event gross.
    let keep = Decimal::ONE
        .checked_sub(tier.commission_rate)
        .ok_or(CommissionError::Overflow)?;
    let commission = EntryDraft::earning(
        referrer_id.clone(),
        RevenueSource::Referral,
        gross,
        keep,
        event.occurred_at,
    )
    .ok_or(CommissionError::Overflow)?
    .with_memo(format!(
        "{} commission on {} from {}",
        tier.tier_name,
        event.source.as_str(),
        event.creator_id
    ));
    if commission.net_amount > Decimal::ZERO {
        add_referrer_amount(allocation, commission)?;
    }

    let per_referral = round_minor(tier.bonus_per_referral);
    if per_referral > Decimal::ZERO {
        let draft = flat_draft(referrer_id, per_referral, event.occurred_at)?
            .with_memo(format!("{} per-referral bonus", tier.tier_name));
        add_referrer_amount(allocation, draft)?;
    }

    let tier_bonus = round_minor(tier.tier_bonus);
    if tier_bonus > Decimal::ZERO && !reached_tiers.contains(&tier.tier_level) {
        let draft = flat_draft(referrer_id, tier_bonus, event.occurred_at)?
            .with_memo(format!("{} tier bonus", tier.tier_name));
        let draft_index = add_referrer_amount(allocation, draft)?;
        allocation.tier_bonus_paid = Some(TierBonus {
            tier_level: tier.tier_level,
            amount: tier_bonus,
            draft_index,
        });
    }
    Ok(())
}

fn pay_bonus_rules(
    allocation: &mut Allocation,
    event: &RawEvent,
    referrer_id: &UserId,
    stats: &ReferrerStats,
    ctx: &CommissionContext<'_>,
) -> Result<()> {
    let mut rules: Vec<&ReferralBonusRule> = ctx.rules.iter().filter(|r| r.is_active).collect();
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    for rule in rules {
        if !rule.is_recurring && ctx.granted.contains(&rule.id) {
            continue;
        }
        if !triggers::matches(&rule.trigger, stats) {
            continue;
        }
        let pct = apply_rate(event.gross_amount, rule.bonus_percentage)
            .ok_or(CommissionError::Overflow)?;
        let amount = round_minor(rule.bonus_amount)
            .checked_add(pct)
            .ok_or(CommissionError::Overflow)?;
        if amount <= Decimal::ZERO {
            continue;
        }

        let draft = flat_draft(referrer_id, amount, event.occurred_at)?
            .with_memo(format!("bonus rule {}: {}", rule.id, rule.name));
        allocation.drafts.push(draft);
        allocation.bonuses.push(BonusAward {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            amount,
            is_recurring: rule.is_recurring,
            draft_index: allocation.drafts.len() - 1,
        });
        if !rule.is_recurring {
            allocation.consumed_rules.push(rule.id);
        }
    }
    Ok(())
}

/// A referral entry paying a flat amount with no platform share.
fn flat_draft(referrer_id: &UserId, amount: Decimal, at: u64) -> Result<EntryDraft> {
    EntryDraft::earning(
        referrer_id.clone(),
        RevenueSource::Referral,
        amount,
        Decimal::ZERO,
        at,
    )
    .ok_or(CommissionError::Overflow)
}

fn add_referrer_amount(allocation: &mut Allocation, draft: EntryDraft) -> Result<usize> {
    allocation.referrer_net = allocation
        .referrer_net
        .checked_add(draft.net_amount)
        .ok_or(CommissionError::Overflow)?;
    allocation.drafts.push(draft);
    Ok(allocation.drafts.len() - 1)
}

fn check_conservation(allocation: &Allocation) -> Result<()> {
    let paid: Decimal = allocation.drafts.iter().map(|d| d.net_amount).sum();
    let expected_paid = allocation.creator_net + allocation.referrer_net + allocation.bonus_total();
    let allocated = paid + allocation.platform_retained;
    if paid != expected_paid || allocated != allocation.gross {
        tracing::error!(
            gross = %allocation.gross,
            allocated = %allocated,
            "allocation does not conserve money"
        );
        return Err(CommissionError::LedgerInconsistency {
            gross: allocation.gross,
            allocated,
        });
    }
    Ok(())
}
