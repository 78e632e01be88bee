//! Core domain model for the proactive insight detector.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "finsight-core";

/// Lifetime of a freshly written insight.
pub const INSIGHT_TTL_DAYS: i64 = 7;

pub type UserId = Uuid;

pub fn insight_ttl() -> Duration {
    Duration::days(INSIGHT_TTL_DAYS)
}

/// Row of `detected_subscriptions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub merchant_name: String,
    pub amount: Decimal,
    #[serde(default)]
    pub last_charge_amount: Option<Decimal>,
    #[serde(default)]
    pub confirmed: bool,
}

impl Subscription {
    /// Most recent charge; absent means no change from the recurring amount.
    pub fn last_charge_or_current(&self) -> Decimal {
        self.last_charge_amount.unwrap_or(self.amount)
    }
}

/// Row of `transactions`. Negative amounts are outflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub amount: Decimal,
    #[serde(default)]
    pub merchant: Option<String>,
    pub transaction_date: NaiveDate,
}

impl Transaction {
    pub fn is_outflow(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    pub fn absolute_amount(&self) -> Decimal {
        self.amount.abs()
    }

    pub fn merchant_contains_ignore_case(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.merchant
            .as_deref()
            .map(|m| m.to_lowercase().contains(&needle))
            .unwrap_or(false)
    }
}

/// Active row of `user_budgets` with its `budget_spending` total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetWithSpend {
    pub id: Uuid,
    pub category: String,
    pub amount: Decimal,
    pub spent_amount: Decimal,
}

/// Everything the detectors read for a single user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRecords {
    pub subscriptions: Vec<Subscription>,
    /// Trailing-window transactions, newest first.
    pub transactions: Vec<Transaction>,
    pub budgets: Vec<BudgetWithSpend>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    SubscriptionPriceHike,
    SpendingSpike,
    BudgetOverrun,
    SavingsOpportunity,
}

impl InsightType {
    pub const ALL: [InsightType; 4] = [
        InsightType::SubscriptionPriceHike,
        InsightType::SpendingSpike,
        InsightType::BudgetOverrun,
        InsightType::SavingsOpportunity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubscriptionPriceHike => "subscription_price_hike",
            Self::SpendingSpike => "spending_spike",
            Self::BudgetOverrun => "budget_overrun",
            Self::SavingsOpportunity => "savings_opportunity",
        }
    }
}

impl fmt::Display for InsightType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InsightType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "insight type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Urgent,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSubscription {
    pub subscription_id: Uuid,
    pub merchant: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewTransactions {
    pub category: String,
    pub period: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustBudget {
    pub budget_id: Uuid,
    pub category: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub current_limit: Decimal,
    pub suggested_limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSavingsGoal {
    pub goal_name: String,
    pub monthly_amount: i64,
}

/// Corrective action offered alongside an insight.
///
/// Serializes as `{"resolution_action": ..., "resolution_data": {...}}`, the
/// same pair of columns `proactive_insights` stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "resolution_action",
    content = "resolution_data",
    rename_all = "snake_case"
)]
pub enum Resolution {
    CancelSubscription(CancelSubscription),
    ReviewTransactions(ReviewTransactions),
    AdjustBudget(AdjustBudget),
    CreateSavingsGoal(CreateSavingsGoal),
}

impl Resolution {
    pub fn action(&self) -> &'static str {
        match self {
            Self::CancelSubscription(_) => "cancel_subscription",
            Self::ReviewTransactions(_) => "review_transactions",
            Self::AdjustBudget(_) => "adjust_budget",
            Self::CreateSavingsGoal(_) => "create_savings_goal",
        }
    }

    /// Payload for the `resolution_data` column.
    pub fn data(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::CancelSubscription(d) => serde_json::to_value(d),
            Self::ReviewTransactions(d) => serde_json::to_value(d),
            Self::AdjustBudget(d) => serde_json::to_value(d),
            Self::CreateSavingsGoal(d) => serde_json::to_value(d),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelatedEntityKind {
    Subscription,
    Budget,
}

impl RelatedEntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Budget => "budget",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelatedEntity {
    pub id: Uuid,
    pub kind: RelatedEntityKind,
}

/// Identity of an insight for duplicate suppression within its live window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InsightKey {
    pub insight_type: InsightType,
    pub related_entity_id: Option<Uuid>,
}

/// Detector output before it is bound to a user and an expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsightDraft {
    pub insight_type: InsightType,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub resolution: Option<Resolution>,
    pub related_entity: Option<RelatedEntity>,
}

impl InsightDraft {
    pub fn key(&self) -> InsightKey {
        InsightKey {
            insight_type: self.insight_type,
            related_entity_id: self.related_entity.map(|e| e.id),
        }
    }
}

/// Insight ready to be written to `proactive_insights`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInsight {
    pub user_id: UserId,
    pub insight_type: InsightType,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub resolution: Option<Resolution>,
    pub related_entity: Option<RelatedEntity>,
    pub expires_at: DateTime<Utc>,
}

impl NewInsight {
    pub fn from_draft(user_id: UserId, draft: InsightDraft, inserted_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            insight_type: draft.insight_type,
            severity: draft.severity,
            title: draft.title,
            message: draft.message,
            resolution: draft.resolution,
            related_entity: draft.related_entity,
            expires_at: inserted_at + insight_ttl(),
        }
    }

    pub fn key(&self) -> InsightKey {
        InsightKey {
            insight_type: self.insight_type,
            related_entity_id: self.related_entity.map(|e| e.id),
        }
    }

    pub fn resolution_action(&self) -> Option<&'static str> {
        self.resolution.as_ref().map(Resolution::action)
    }

    pub fn resolution_data(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        self.resolution.as_ref().map(Resolution::data).transpose()
    }

    pub fn related_entity_id(&self) -> Option<Uuid> {
        self.related_entity.map(|e| e.id)
    }

    pub fn related_entity_type(&self) -> Option<&'static str> {
        self.related_entity.map(|e| e.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn draft() -> InsightDraft {
        InsightDraft {
            insight_type: InsightType::BudgetOverrun,
            severity: Severity::Warning,
            title: "Dining budget almost used".into(),
            message: "95% used".into(),
            resolution: Some(Resolution::AdjustBudget(AdjustBudget {
                budget_id: Uuid::nil(),
                category: "Dining".into(),
                current_limit: dec!(100.50),
                suggested_limit: 115,
            })),
            related_entity: Some(RelatedEntity {
                id: Uuid::nil(),
                kind: RelatedEntityKind::Budget,
            }),
        }
    }

    #[test]
    fn expiry_is_seven_days_after_insertion() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap();
        let row = NewInsight::from_draft(Uuid::new_v4(), draft(), now);
        assert_eq!((row.expires_at - now).num_seconds(), 604_800);
    }

    #[test]
    fn resolution_keeps_the_two_column_wire_shape() {
        let resolution = draft().resolution.unwrap();
        let value = serde_json::to_value(&resolution).unwrap();
        assert_eq!(value["resolution_action"], "adjust_budget");
        assert_eq!(value["resolution_data"]["category"], "Dining");
        assert_eq!(value["resolution_data"]["current_limit"], 100.5);
        assert_eq!(value["resolution_data"]["suggested_limit"], 115);

        let data = resolution.data().unwrap();
        assert_eq!(data, value["resolution_data"]);
        assert_eq!(resolution.action(), "adjust_budget");
    }

    #[test]
    fn insight_type_parses_its_own_names() {
        for t in InsightType::ALL {
            assert_eq!(t.as_str().parse::<InsightType>().unwrap(), t);
        }
        assert!("price_drop".parse::<InsightType>().is_err());
    }

    #[test]
    fn merchant_match_ignores_case_and_missing_merchant() {
        let mut tx = Transaction {
            id: Uuid::nil(),
            amount: dec!(-4.50),
            merchant: Some("Blue Bottle COFFEE".into()),
            transaction_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
        };
        assert!(tx.is_outflow());
        assert_eq!(tx.absolute_amount(), dec!(4.50));
        assert!(tx.merchant_contains_ignore_case("coffee"));
        tx.merchant = None;
        assert!(!tx.merchant_contains_ignore_case("coffee"));
    }

    #[test]
    fn missing_last_charge_means_unchanged() {
        let sub = Subscription {
            id: Uuid::nil(),
            merchant_name: "Streamly".into(),
            amount: dec!(9.99),
            last_charge_amount: None,
            confirmed: true,
        };
        assert_eq!(sub.last_charge_or_current(), dec!(9.99));
    }
}
