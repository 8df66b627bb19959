//! Referral code registration, binding and referrer resolution.
//!
//! A referred user is bound to the first referrer whose code they used.
//! Later codes from the same user are ignored. Only bindings that passed
//! the [`AbuseSignal`] gate count toward a referrer's stats.

use std::sync::Arc;

use creatorpay_commission::ReferrerState;
use creatorpay_db::queries::{entries, referrals, rules};
use creatorpay_db::DbError;
use creatorpay_types::ledger::RevenueSource;
use creatorpay_types::money::from_minor_units;
use creatorpay_types::referral::{ReferralTier, ReferrerStats};
use creatorpay_types::UserId;
use rand::RngCore;
use rusqlite::Connection;

use crate::abuse::AbuseSignal;
use crate::tiers::{select_tier, streak_days};
use crate::{ReferralError, Result};

/// Shortest accepted referral code.
pub const MIN_CODE_LEN: usize = 4;

/// Longest accepted referral code.
pub const MAX_CODE_LEN: usize = 32;

/// Random bytes in a generated code (hex-encoded to twice the length).
const GENERATED_CODE_BYTES: usize = 5;

/// Attempts at finding a free generated code.
const GENERATE_ATTEMPTS: usize = 5;

/// Result of a bind attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindOutcome {
    /// A new binding was written.
    Bound { referrer_id: UserId, qualified: bool },
    /// The user was already bound; the earlier attribution stands.
    AlreadyBound { referrer_id: UserId },
}

impl BindOutcome {
    pub fn referrer_id(&self) -> &UserId {
        match self {
            BindOutcome::Bound { referrer_id, .. } | BindOutcome::AlreadyBound { referrer_id } => {
                referrer_id
            }
        }
    }
}

/// Referral attribution over the shared database.
///
/// Methods take the connection explicitly so that callers can run them
/// inside their own transaction.
#[derive(Clone)]
pub struct ReferralResolver {
    abuse: Arc<dyn AbuseSignal>,
}

impl std::fmt::Debug for ReferralResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferralResolver").finish_non_exhaustive()
    }
}

impl ReferralResolver {
    pub fn new(abuse: Arc<dyn AbuseSignal>) -> Self {
        Self { abuse }
    }

    /// Register a referral code for a referrer.
    ///
    /// Codes are case-insensitive and stored upper-cased.
    ///
    /// # Errors
    ///
    /// - [`ReferralError::Validation`] if the code is malformed or taken
    pub fn register_code(
        &self,
        conn: &Connection,
        referrer_id: &UserId,
        code: &str,
        now: u64,
    ) -> Result<String> {
        let code = normalize_code(code)?;
        referrals::ensure_account(conn, referrer_id, now)?;
        referrals::insert_code(conn, &code, referrer_id, now).map_err(|e| match e {
            DbError::Constraint(_) => {
                ReferralError::Validation(format!("referral code {code} is already taken"))
            }
            other => other.into(),
        })?;
        tracing::info!(referrer = %referrer_id, code = %code, "referral code registered");
        Ok(code)
    }

    /// Register a fresh random code for a referrer.
    pub fn generate_code(&self, conn: &Connection, referrer_id: &UserId, now: u64) -> Result<String> {
        let mut rng = rand::thread_rng();
        for _ in 0..GENERATE_ATTEMPTS {
            let mut bytes = [0u8; GENERATED_CODE_BYTES];
            rng.fill_bytes(&mut bytes);
            let candidate = hex::encode_upper(bytes);
            match self.register_code(conn, referrer_id, &candidate, now) {
                Ok(code) => return Ok(code),
                Err(ReferralError::Validation(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ReferralError::Validation(
            "could not find a free referral code".to_string(),
        ))
    }

    /// Bind a newly signed-up user to the owner of `code`.
    ///
    /// # Errors
    ///
    /// - [`ReferralError::NotFound`] if the code is unknown
    /// - [`ReferralError::Validation`] on self-referral or a malformed code
    pub fn bind(
        &self,
        conn: &Connection,
        new_user_id: &UserId,
        code: &str,
        now: u64,
    ) -> Result<BindOutcome> {
        let code = normalize_code(code)?;
        let referrer_id = referrals::code_owner(conn, &code)?
            .ok_or_else(|| ReferralError::NotFound(format!("referral code {code}")))?;
        if referrer_id == *new_user_id {
            return Err(ReferralError::Validation(format!(
                "{new_user_id} cannot refer themselves"
            )));
        }

        if let Some(existing) = referrals::binding_for(conn, new_user_id)? {
            tracing::debug!(
                user = %new_user_id,
                referrer = %existing.referrer_id,
                ignored_code = %code,
                "user already bound, keeping first attribution"
            );
            return Ok(BindOutcome::AlreadyBound {
                referrer_id: existing.referrer_id,
            });
        }

        let qualified = self.abuse.is_qualified(new_user_id);
        referrals::ensure_account(conn, new_user_id, now)?;
        let row = referrals::BindingRow {
            referred_user_id: new_user_id.clone(),
            referrer_id: referrer_id.clone(),
            code: code.clone(),
            bound_at: now,
            qualified,
        };
        if !referrals::insert_binding_if_absent(conn, &row)? {
            let existing = referrals::binding_for(conn, new_user_id)?
                .ok_or_else(|| ReferralError::NotFound(format!("binding for {new_user_id}")))?;
            return Ok(BindOutcome::AlreadyBound {
                referrer_id: existing.referrer_id,
            });
        }

        tracing::info!(
            user = %new_user_id,
            referrer = %referrer_id,
            code = %code,
            qualified,
            "referral bound"
        );
        Ok(BindOutcome::Bound {
            referrer_id,
            qualified,
        })
    }

    /// Ask the abuse signal again and store the new verdict.
    pub fn requalify(&self, conn: &Connection, referred_user_id: &UserId) -> Result<bool> {
        let binding = referrals::binding_for(conn, referred_user_id)?
            .ok_or_else(|| ReferralError::NotFound(format!("binding for {referred_user_id}")))?;
        let qualified = self.abuse.is_qualified(referred_user_id);
        if qualified != binding.qualified {
            referrals::set_qualified(conn, referred_user_id, qualified)?;
            tracing::info!(
                user = %referred_user_id,
                referrer = %binding.referrer_id,
                qualified,
                "referral qualification changed"
            );
        }
        Ok(qualified)
    }

    /// The referrer a user is bound to, if any.
    pub fn resolve_referrer(&self, conn: &Connection, new_user_id: &UserId) -> Result<Option<UserId>> {
        Ok(referrals::binding_for(conn, new_user_id)?.map(|b| b.referrer_id))
    }

    /// Mark a referrer's account active or deactivated.
    pub fn set_account_active(
        &self,
        conn: &Connection,
        user_id: &UserId,
        is_active: bool,
        now: u64,
    ) -> Result<()> {
        referrals::upsert_account(conn, user_id, is_active, now)?;
        tracing::info!(user = %user_id, is_active, "account liveness updated");
        Ok(())
    }

    /// Aggregate counters for a referrer as of `now`.
    pub fn stats(&self, conn: &Connection, referrer_id: &UserId, now: u64) -> Result<ReferrerStats> {
        let referral_times: Vec<u64> = referrals::bindings_of(conn, referrer_id)?
            .into_iter()
            .filter(|b| b.qualified && b.bound_at <= now)
            .map(|b| b.bound_at)
            .collect();
        let commission_minor =
            entries::sum_net_minor(conn, referrer_id, &[RevenueSource::Referral], None)?;

        Ok(ReferrerStats {
            qualified_referrals: u32::try_from(referral_times.len()).unwrap_or(u32::MAX),
            lifetime_commission: from_minor_units(commission_minor),
            streak_days: streak_days(&referral_times, now),
            referral_times,
            as_of: now,
        })
    }

    /// The tier that applies to a referrer right now. Never "no tier".
    pub fn effective_tier(&self, conn: &Connection, referrer_id: &UserId, now: u64) -> Result<ReferralTier> {
        let stats = self.stats(conn, referrer_id, now)?;
        select_tier(&rules::tiers(conn)?, &stats)
    }

    /// Everything the commission engine needs to know about a referrer.
    pub fn referrer_state(&self, conn: &Connection, referrer_id: &UserId, now: u64) -> Result<ReferrerState> {
        if !referrals::is_account_active(conn, referrer_id)? {
            return Ok(ReferrerState::Inactive {
                referrer_id: referrer_id.clone(),
                reason: format!("referrer {referrer_id} is inactive or deleted"),
            });
        }
        let stats = self.stats(conn, referrer_id, now)?;
        let tier = select_tier(&rules::tiers(conn)?, &stats)?;
        let reached_tiers = rules::paid_tier_bonuses(conn, referrer_id)?;
        Ok(ReferrerState::Active {
            referrer_id: referrer_id.clone(),
            tier,
            stats,
            reached_tiers,
        })
    }
}

fn normalize_code(code: &str) -> Result<String> {
    let code = code.trim().to_ascii_uppercase();
    let valid_chars = code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if code.len() < MIN_CODE_LEN || code.len() > MAX_CODE_LEN || !valid_chars {
        return Err(ReferralError::Validation(format!(
            "referral code must be {MIN_CODE_LEN}-{MAX_CODE_LEN} letters, digits, '-' or '_'"
        )));
    }
    Ok(code)
}
