//! Payout request structures and the creator balance view.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{RequestId, TypesError, UserId};

/// Lifecycle state of a payout request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Approved,
    Rejected,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PayoutStatus {
    pub const ALL: [PayoutStatus; 7] = [
        PayoutStatus::Pending,
        PayoutStatus::Approved,
        PayoutStatus::Rejected,
        PayoutStatus::Processing,
        PayoutStatus::Completed,
        PayoutStatus::Failed,
        PayoutStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Approved => "approved",
            PayoutStatus::Rejected => "rejected",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Failed => "failed",
            PayoutStatus::Cancelled => "cancelled",
        }
    }

    /// At most one request per creator may be in an active state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PayoutStatus::Pending | PayoutStatus::Approved | PayoutStatus::Processing
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl FromStr for PayoutStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PayoutStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| TypesError::UnknownVariant {
                kind: "payout status",
                value: s.to_string(),
            })
    }
}

/// Destination rail for a payout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    BankTransfer,
    Paypal,
    Stripe,
    Crypto,
}

impl PayoutMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutMethod::BankTransfer => "bank_transfer",
            PayoutMethod::Paypal => "paypal",
            PayoutMethod::Stripe => "stripe",
            PayoutMethod::Crypto => "crypto",
        }
    }
}

impl FromStr for PayoutMethod {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bank_transfer" => Ok(PayoutMethod::BankTransfer),
            "paypal" => Ok(PayoutMethod::Paypal),
            "stripe" => Ok(PayoutMethod::Stripe),
            "crypto" => Ok(PayoutMethod::Crypto),
            other => Err(TypesError::UnknownVariant {
                kind: "payout method",
                value: other.to_string(),
            }),
        }
    }
}

/// A creator's withdrawal request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
pub struct PayoutRequest {
    pub id: RequestId,
    pub creator_id: UserId,
    #[ts(type = "string")]
    pub requested_amount: Decimal,
    pub method: PayoutMethod,
    /// Rail-specific destination (account number, email, wallet address).
    #[ts(type = "unknown")]
    pub method_details: serde_json::Value,
    pub status: PayoutStatus,
    pub created_at: u64,
    pub decided_at: Option<u64>,
    pub decided_by: Option<UserId>,
    pub notes: Option<String>,
    /// Reference assigned by the payment collaborator on dispatch.
    pub external_reference: Option<String>,
    /// When the request entered `processing`.
    pub processing_since: Option<u64>,
    /// Number of dispatch attempts.
    pub attempts: u32,
}

/// Derived balance of a creator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
pub struct Balance {
    #[ts(type = "string")]
    pub total_earnings: Decimal,
    #[ts(type = "string")]
    pub total_payouts: Decimal,
    #[ts(type = "string")]
    pub available: Decimal,
}

impl Balance {
    pub fn new(total_earnings: Decimal, total_payouts: Decimal) -> Self {
        Self {
            total_earnings,
            total_payouts,
            available: total_earnings - total_payouts,
        }
    }

    pub fn zero() -> Self {
        Self::new(Decimal::ZERO, Decimal::ZERO)
    }
}
