//! SQL schema definitions.

/// Complete schema for the v1 database.
pub const SCHEMA_V1: &str = r#"
-- ============================================================
-- Accounts
-- ============================================================

CREATE TABLE IF NOT EXISTS accounts (
    user_id TEXT PRIMARY KEY,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);

-- ============================================================
-- Payout requests
-- ============================================================

CREATE TABLE IF NOT EXISTS payout_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    creator_id TEXT NOT NULL,
    requested_minor INTEGER NOT NULL CHECK (requested_minor > 0),
    method TEXT NOT NULL,
    method_details TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN
        ('pending', 'approved', 'rejected', 'processing', 'completed', 'failed', 'cancelled')),
    created_at INTEGER NOT NULL,
    decided_at INTEGER,
    decided_by TEXT,
    notes TEXT,
    external_reference TEXT,
    processing_since INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_payouts_creator ON payout_requests(creator_id, created_at);
CREATE INDEX IF NOT EXISTS idx_payouts_status ON payout_requests(status, processing_since);

-- One pending/approved/processing request per creator.
CREATE UNIQUE INDEX IF NOT EXISTS ux_payout_active_per_creator
    ON payout_requests(creator_id)
    WHERE status IN ('pending', 'approved', 'processing');

CREATE TABLE IF NOT EXISTS payout_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id INTEGER NOT NULL REFERENCES payout_requests(id),
    from_status TEXT,
    to_status TEXT NOT NULL,
    actor TEXT NOT NULL,
    note TEXT,
    at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_payout_audit_request ON payout_audit(request_id, id);

-- ============================================================
-- Ledger
-- ============================================================

CREATE TABLE IF NOT EXISTS revenue_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    creator_id TEXT NOT NULL,
    source TEXT NOT NULL CHECK (source IN
        ('tip', 'subscription', 'ad', 'affiliate', 'referral', 'platform_withdrawal')),
    gross_minor INTEGER NOT NULL,
    platform_share TEXT NOT NULL,
    net_minor INTEGER NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'paid')),
    occurred_at INTEGER NOT NULL,
    payout_request_id INTEGER UNIQUE REFERENCES payout_requests(id),
    -- At most one correction per entry.
    reverses_entry_id INTEGER UNIQUE REFERENCES revenue_entries(id),
    memo TEXT
);

CREATE INDEX IF NOT EXISTS idx_entries_creator_time
    ON revenue_entries(creator_id, occurred_at, id);

CREATE TRIGGER IF NOT EXISTS revenue_entries_no_delete
BEFORE DELETE ON revenue_entries
BEGIN
    SELECT RAISE(ABORT, 'revenue entries are append-only');
END;

-- The only permitted mutation is status pending -> paid.
CREATE TRIGGER IF NOT EXISTS revenue_entries_immutable
BEFORE UPDATE ON revenue_entries
WHEN NEW.creator_id IS NOT OLD.creator_id
    OR NEW.source IS NOT OLD.source
    OR NEW.gross_minor IS NOT OLD.gross_minor
    OR NEW.platform_share IS NOT OLD.platform_share
    OR NEW.net_minor IS NOT OLD.net_minor
    OR NEW.occurred_at IS NOT OLD.occurred_at
    OR NEW.payout_request_id IS NOT OLD.payout_request_id
    OR NEW.reverses_entry_id IS NOT OLD.reverses_entry_id
    OR NEW.memo IS NOT OLD.memo
    OR NOT (OLD.status = 'pending' AND NEW.status = 'paid')
BEGIN
    SELECT RAISE(ABORT, 'revenue entries are immutable');
END;

CREATE TABLE IF NOT EXISTS balance_cache (
    creator_id TEXT PRIMARY KEY,
    total_earnings_minor INTEGER NOT NULL,
    total_payouts_minor INTEGER NOT NULL,
    computed_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_anomalies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    creator_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    detail TEXT NOT NULL,
    amount_minor INTEGER NOT NULL DEFAULT 0,
    at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_anomalies_creator ON ledger_anomalies(creator_id);

CREATE TABLE IF NOT EXISTS frozen_creators (
    creator_id TEXT PRIMARY KEY,
    reason TEXT NOT NULL,
    frozen_at INTEGER NOT NULL
);

-- ============================================================
-- Referrals
-- ============================================================

CREATE TABLE IF NOT EXISTS referral_tiers (
    tier_level INTEGER PRIMARY KEY CHECK (tier_level >= 1),
    tier_name TEXT NOT NULL,
    min_referrals INTEGER NOT NULL,
    min_commission_minor INTEGER NOT NULL,
    commission_rate TEXT NOT NULL,
    bonus_per_referral_minor INTEGER NOT NULL DEFAULT 0,
    tier_bonus_minor INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS bonus_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    rule_type TEXT NOT NULL,
    trigger_condition TEXT NOT NULL,
    bonus_amount_minor INTEGER NOT NULL DEFAULT 0,
    bonus_percentage TEXT NOT NULL DEFAULT '0',
    is_recurring INTEGER NOT NULL DEFAULT 0,
    priority INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1
);

-- Dedup ledger for non-recurring bonus rules.
CREATE TABLE IF NOT EXISTS bonus_grants (
    rule_id INTEGER NOT NULL REFERENCES bonus_rules(id),
    referrer_id TEXT NOT NULL,
    entry_id INTEGER NOT NULL REFERENCES revenue_entries(id),
    granted_at INTEGER NOT NULL,
    PRIMARY KEY (rule_id, referrer_id)
);

-- One-off tier bonuses already paid.
CREATE TABLE IF NOT EXISTS tier_bonus_grants (
    tier_level INTEGER NOT NULL,
    referrer_id TEXT NOT NULL,
    entry_id INTEGER NOT NULL REFERENCES revenue_entries(id),
    granted_at INTEGER NOT NULL,
    PRIMARY KEY (tier_level, referrer_id)
);

CREATE TABLE IF NOT EXISTS referral_codes (
    code TEXT PRIMARY KEY,
    referrer_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_codes_referrer ON referral_codes(referrer_id);

-- First attribution wins: one row per referred user, never replaced.
CREATE TABLE IF NOT EXISTS referral_bindings (
    referred_user_id TEXT PRIMARY KEY,
    referrer_id TEXT NOT NULL,
    code TEXT NOT NULL REFERENCES referral_codes(code),
    bound_at INTEGER NOT NULL,
    qualified INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_bindings_referrer ON referral_bindings(referrer_id, bound_at);
"#;
