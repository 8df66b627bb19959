//! Referral command handlers: codes, bindings, tiers and bonus rules.

use std::sync::Arc;

use creatorpay_referral::{config, BindOutcome};
use creatorpay_types::referral::{ReferralBonusRule, ReferralTier};
use creatorpay_types::{unix_now, UserId};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{blocking, lock, parse, Result};
use crate::events::Event;
use crate::DaemonState;

#[derive(Deserialize)]
struct ReferrerParams {
    referrer_id: UserId,
}

#[derive(Deserialize)]
struct UserParams {
    user_id: UserId,
}

#[derive(Deserialize)]
struct RegisterParams {
    referrer_id: UserId,
    code: String,
}

#[derive(Deserialize)]
struct BindParams {
    user_id: UserId,
    code: String,
}

#[derive(Deserialize)]
struct ActiveParams {
    user_id: UserId,
    is_active: bool,
}

#[derive(Deserialize)]
struct TiersParams {
    tiers: Vec<ReferralTier>,
}

#[derive(Deserialize)]
struct RuleParams {
    rule: ReferralBonusRule,
}

/// Claim a specific referral code.
pub async fn register_referral_code(state: &Arc<DaemonState>, params: &Value) -> Result {
    let RegisterParams { referrer_id, code } = parse(params)?;
    blocking(state, move |s| {
        let conn = lock(s)?;
        let code = s.resolver.register_code(&conn, &referrer_id, &code, unix_now())?;
        Ok(json!({ "referrer_id": referrer_id, "code": code }))
    })
    .await
}

/// Claim a random referral code.
pub async fn generate_referral_code(state: &Arc<DaemonState>, params: &Value) -> Result {
    let ReferrerParams { referrer_id } = parse(params)?;
    blocking(state, move |s| {
        let conn = lock(s)?;
        let code = s.resolver.generate_code(&conn, &referrer_id, unix_now())?;
        Ok(json!({ "referrer_id": referrer_id, "code": code }))
    })
    .await
}

/// Attribute a new user to the owner of a code. The first binding wins.
pub async fn bind_referral(state: &Arc<DaemonState>, params: &Value) -> Result {
    let BindParams { user_id, code } = parse(params)?;
    let event_user = user_id.clone();
    let outcome = blocking(state, move |s| {
        let conn = lock(s)?;
        Ok(s.resolver.bind(&conn, &user_id, &code, unix_now())?)
    })
    .await?;

    match outcome {
        BindOutcome::Bound {
            referrer_id,
            qualified,
        } => {
            state.event_bus.emit(Event::now(
                "ReferralBound",
                json!({ "creator_id": referrer_id, "referred_user_id": event_user, "qualified": qualified }),
            ));
            Ok(json!({ "status": "bound", "referrer_id": referrer_id, "qualified": qualified }))
        }
        BindOutcome::AlreadyBound { referrer_id } => {
            Ok(json!({ "status": "already_bound", "referrer_id": referrer_id }))
        }
    }
}

/// Who referred a user, if anyone.
pub async fn resolve_referrer(state: &Arc<DaemonState>, params: &Value) -> Result {
    let UserParams { user_id } = parse(params)?;
    blocking(state, move |s| {
        let conn = lock(s)?;
        let referrer_id = s.resolver.resolve_referrer(&conn, &user_id)?;
        Ok(json!({ "user_id": user_id, "referrer_id": referrer_id }))
    })
    .await
}

/// The tier that applies to a referrer now.
pub async fn effective_tier(state: &Arc<DaemonState>, params: &Value) -> Result {
    let ReferrerParams { referrer_id } = parse(params)?;
    blocking(state, move |s| {
        let conn = lock(s)?;
        Ok(json!(s.resolver.effective_tier(&conn, &referrer_id, unix_now())?))
    })
    .await
}

/// Aggregate counters behind tier selection and bonus triggers.
pub async fn referrer_stats(state: &Arc<DaemonState>, params: &Value) -> Result {
    let ReferrerParams { referrer_id } = parse(params)?;
    blocking(state, move |s| {
        let conn = lock(s)?;
        Ok(json!(s.resolver.stats(&conn, &referrer_id, unix_now())?))
    })
    .await
}

/// Mark an account active or deactivated.
pub async fn set_account_active(state: &Arc<DaemonState>, params: &Value) -> Result {
    let ActiveParams { user_id, is_active } = parse(params)?;
    blocking(state, move |s| {
        let conn = lock(s)?;
        s.resolver.set_account_active(&conn, &user_id, is_active, unix_now())?;
        Ok(json!({ "user_id": user_id, "is_active": is_active }))
    })
    .await
}

pub async fn get_referral_tiers(state: &Arc<DaemonState>) -> Result {
    blocking(state, |s| {
        let conn = lock(s)?;
        Ok(json!({ "tiers": config::tiers(&conn)? }))
    })
    .await
}

/// Replace the tier table.
pub async fn set_referral_tiers(state: &Arc<DaemonState>, params: &Value) -> Result {
    let TiersParams { tiers } = parse(params)?;
    blocking(state, move |s| {
        let conn = lock(s)?;
        config::replace_tiers(&conn, &tiers)?;
        Ok(json!({ "tiers": tiers.len() }))
    })
    .await
}

/// Create (id 0) or update a bonus rule.
pub async fn upsert_bonus_rule(state: &Arc<DaemonState>, params: &Value) -> Result {
    let RuleParams { rule } = parse(params)?;
    blocking(state, move |s| {
        let conn = lock(s)?;
        let rule_id = config::upsert_rule(&conn, &rule)?;
        Ok(json!({ "rule_id": rule_id }))
    })
    .await
}

/// Active rules in evaluation order.
pub async fn list_bonus_rules(state: &Arc<DaemonState>) -> Result {
    blocking(state, |s| {
        let conn = lock(s)?;
        Ok(json!({ "rules": config::active_rules(&conn)? }))
    })
    .await
}
