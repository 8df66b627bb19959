//! Database query functions organized by domain.

pub mod balances;
pub mod controls;
pub mod entries;
pub mod payouts;
pub mod referrals;
pub mod rules;
