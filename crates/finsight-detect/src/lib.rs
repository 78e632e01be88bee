//! Heuristic detectors and the per-user analyzer that runs them.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use finsight_core::{
    AdjustBudget, CancelSubscription, CreateSavingsGoal, InsightDraft, InsightType, RelatedEntity,
    RelatedEntityKind, Resolution, ReviewTransactions, Severity, UserId, UserRecords,
};
use finsight_storage::{FinanceStore, StoreError};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use tracing::debug;

pub const CRATE_NAME: &str = "finsight-detect";

/// Thresholds for the built-in detectors. Every key is optional in a rules
/// file; missing keys keep their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub price_hike_ratio: Decimal,
    pub spike_min_transactions: usize,
    pub spike_recent_count: usize,
    pub spike_ratio: Decimal,
    pub budget_lower_pct: Decimal,
    pub budget_upper_pct: Decimal,
    pub budget_suggestion_factor: Decimal,
    pub small_charge_limit: Decimal,
    pub small_charge_keyword: String,
    pub small_charge_min_count: usize,
    pub savings_ratio: Decimal,
    pub trailing_window_days: i64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            price_hike_ratio: Decimal::new(11, 1),
            spike_min_transactions: 11,
            spike_recent_count: 7,
            spike_ratio: Decimal::new(13, 1),
            budget_lower_pct: Decimal::from(90),
            budget_upper_pct: Decimal::from(100),
            budget_suggestion_factor: Decimal::new(12, 1),
            small_charge_limit: Decimal::from(10),
            small_charge_keyword: "coffee".to_string(),
            small_charge_min_count: 10,
            savings_ratio: Decimal::new(7, 1),
            trailing_window_days: 30,
        }
    }
}

impl DetectorConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// A single heuristic over one user's records.
pub trait Detector: Send + Sync {
    fn insight_type(&self) -> InsightType;

    fn detect(&self, records: &UserRecords) -> Vec<InsightDraft>;
}

fn usd(amount: Decimal) -> String {
    format!(
        "${:.2}",
        amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    )
}

fn round_whole(value: Decimal) -> i64 {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or_default()
}

/// Sum that reports overflow instead of panicking.
fn checked_sum<'a>(values: impl IntoIterator<Item = &'a Decimal>) -> Option<Decimal> {
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, value| acc.checked_add(*value))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Confirmed subscriptions whose last charge exceeds the recurring amount
/// by more than the configured ratio.
#[derive(Debug, Clone)]
pub struct PriceHikeDetector {
    ratio: Decimal,
}

impl PriceHikeDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            ratio: config.price_hike_ratio,
        }
    }
}

impl Detector for PriceHikeDetector {
    fn insight_type(&self) -> InsightType {
        InsightType::SubscriptionPriceHike
    }

    fn detect(&self, records: &UserRecords) -> Vec<InsightDraft> {
        records
            .subscriptions
            .iter()
            .filter(|sub| sub.confirmed)
            .filter_map(|sub| {
                let current = sub.amount;
                let last = sub.last_charge_or_current();
                let Some(threshold) = current.checked_mul(self.ratio) else {
                    debug!(subscription_id = %sub.id, "skipping subscription with out-of-range amount");
                    return None;
                };
                if last <= threshold {
                    return None;
                }
                let yearly_extra = last
                    .checked_sub(current)
                    .and_then(|diff| diff.checked_mul(Decimal::from(12)))?;
                Some(InsightDraft {
                    insight_type: InsightType::SubscriptionPriceHike,
                    severity: Severity::Urgent,
                    title: format!("{} raised its price", sub.merchant_name),
                    message: format!(
                        "{} went from {} to {}. That's an extra {} per year.",
                        sub.merchant_name,
                        usd(current),
                        usd(last),
                        usd(yearly_extra)
                    ),
                    resolution: Some(Resolution::CancelSubscription(CancelSubscription {
                        subscription_id: sub.id,
                        merchant: sub.merchant_name.clone(),
                    })),
                    related_entity: Some(RelatedEntity {
                        id: sub.id,
                        kind: RelatedEntityKind::Subscription,
                    }),
                })
            })
            .collect()
    }
}

/// Recent outflows averaging well above the trailing-window average.
///
/// The "recent" slice is the newest `recent_count` outflows, not a calendar
/// week: inflows are dropped before the slice is taken.
#[derive(Debug, Clone)]
pub struct SpendingSpikeDetector {
    min_transactions: usize,
    recent_count: usize,
    ratio: Decimal,
}

impl SpendingSpikeDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            min_transactions: config.spike_min_transactions,
            recent_count: config.spike_recent_count.max(1),
            ratio: config.spike_ratio,
        }
    }
}

impl Detector for SpendingSpikeDetector {
    fn insight_type(&self) -> InsightType {
        InsightType::SpendingSpike
    }

    fn detect(&self, records: &UserRecords) -> Vec<InsightDraft> {
        if records.transactions.len() < self.min_transactions {
            return Vec::new();
        }
        let outflows = records
            .transactions
            .iter()
            .filter(|t| t.is_outflow())
            .map(|t| t.absolute_amount())
            .collect::<Vec<_>>();
        if outflows.is_empty() {
            return Vec::new();
        }

        let recent = &outflows[..self.recent_count.min(outflows.len())];
        self.spike(&outflows, recent).into_iter().collect()
    }
}

impl SpendingSpikeDetector {
    /// `None` when there is no spike or when the totals leave the range
    /// `Decimal` can represent.
    fn spike(&self, outflows: &[Decimal], recent: &[Decimal]) -> Option<InsightDraft> {
        let total = checked_sum(outflows)?;
        let recent_total = checked_sum(recent)?;
        let count = Decimal::from(outflows.len());
        let recent_count = Decimal::from(recent.len());
        if total.is_zero() {
            return None;
        }

        // recent_avg > avg * ratio, cross-multiplied to stay exact.
        let scaled_recent = recent_total.checked_mul(count)?;
        let scaled_total = recent_count.checked_mul(total)?;
        if scaled_recent <= self.ratio.checked_mul(scaled_total)? {
            return None;
        }

        let avg = total.checked_div(count)?;
        let recent_avg = recent_total.checked_div(recent_count)?;
        let increase_pct = round_whole(
            scaled_recent
                .checked_sub(scaled_total)?
                .checked_mul(Decimal::ONE_HUNDRED)?
                .checked_div(scaled_total)?,
        );

        Some(InsightDraft {
            insight_type: InsightType::SpendingSpike,
            severity: Severity::Warning,
            title: "Spending spike detected".to_string(),
            message: format!(
                "Your recent purchases average {}, {}% above your usual {} per purchase.",
                usd(recent_avg),
                increase_pct,
                usd(avg)
            ),
            resolution: Some(Resolution::ReviewTransactions(ReviewTransactions {
                category: "all".to_string(),
                period: "7_days".to_string(),
            })),
            related_entity: None,
        })
    }
}

/// Active budgets close to, but not yet over, their limit.
#[derive(Debug, Clone)]
pub struct BudgetOverrunDetector {
    lower_pct: Decimal,
    upper_pct: Decimal,
    suggestion_factor: Decimal,
}

impl BudgetOverrunDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            lower_pct: config.budget_lower_pct,
            upper_pct: config.budget_upper_pct,
            suggestion_factor: config.budget_suggestion_factor,
        }
    }
}

impl Detector for BudgetOverrunDetector {
    fn insight_type(&self) -> InsightType {
        InsightType::BudgetOverrun
    }

    fn detect(&self, records: &UserRecords) -> Vec<InsightDraft> {
        records
            .budgets
            .iter()
            .filter_map(|budget| {
                let limit = budget.amount;
                if limit <= Decimal::ZERO {
                    debug!(budget_id = %budget.id, "skipping budget without a positive limit");
                    return None;
                }
                let bounds = budget
                    .spent_amount
                    .checked_mul(Decimal::ONE_HUNDRED)
                    .zip(self.lower_pct.checked_mul(limit))
                    .zip(self.upper_pct.checked_mul(limit));
                let Some(((spent_scaled, lower), upper)) = bounds else {
                    debug!(budget_id = %budget.id, "skipping budget with out-of-range amounts");
                    return None;
                };
                if !(spent_scaled > lower && spent_scaled < upper) {
                    return None;
                }

                let pct = round_whole(spent_scaled.checked_div(limit)?);
                let suggested_limit = budget
                    .spent_amount
                    .checked_mul(self.suggestion_factor)?
                    .ceil()
                    .to_i64()?;
                Some(InsightDraft {
                    insight_type: InsightType::BudgetOverrun,
                    severity: Severity::Warning,
                    title: format!("{} budget at {}%", budget.category, pct),
                    message: format!(
                        "You've spent {} of your {} {} budget. Consider raising the limit to ${}.",
                        usd(budget.spent_amount),
                        usd(limit),
                        budget.category,
                        suggested_limit
                    ),
                    resolution: Some(Resolution::AdjustBudget(AdjustBudget {
                        budget_id: budget.id,
                        category: budget.category.clone(),
                        current_limit: limit,
                        suggested_limit,
                    })),
                    related_entity: Some(RelatedEntity {
                        id: budget.id,
                        kind: RelatedEntityKind::Budget,
                    }),
                })
            })
            .collect()
    }
}

/// Many small charges at one kind of merchant, suggesting a savings goal.
#[derive(Debug, Clone)]
pub struct SavingsOpportunityDetector {
    charge_limit: Decimal,
    keyword: String,
    min_count: usize,
    savings_ratio: Decimal,
    window_days: i64,
}

impl SavingsOpportunityDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            charge_limit: config.small_charge_limit,
            keyword: config.small_charge_keyword.to_lowercase(),
            min_count: config.small_charge_min_count,
            savings_ratio: config.savings_ratio,
            window_days: config.trailing_window_days,
        }
    }
}

impl Detector for SavingsOpportunityDetector {
    fn insight_type(&self) -> InsightType {
        InsightType::SavingsOpportunity
    }

    fn detect(&self, records: &UserRecords) -> Vec<InsightDraft> {
        let matches = records
            .transactions
            .iter()
            .filter(|t| {
                t.absolute_amount() < self.charge_limit
                    && t.merchant_contains_ignore_case(&self.keyword)
            })
            .collect::<Vec<_>>();
        if matches.len() <= self.min_count {
            return Vec::new();
        }

        let amounts = matches.iter().map(|t| t.absolute_amount()).collect::<Vec<_>>();
        let Some((total, monthly)) = checked_sum(&amounts).and_then(|total| {
            total
                .checked_mul(self.savings_ratio)
                .map(|monthly| (total, monthly))
        }) else {
            debug!("skipping savings estimate with out-of-range amounts");
            return Vec::new();
        };
        let monthly_amount = round_whole(monthly);
        let label = capitalize(&self.keyword);

        vec![InsightDraft {
            insight_type: InsightType::SavingsOpportunity,
            severity: Severity::Info,
            title: format!("{label} savings opportunity"),
            message: format!(
                "You made {} {} purchases totaling {} in the last {} days. Making it at home could save about ${} a month.",
                matches.len(),
                self.keyword,
                usd(total),
                self.window_days,
                monthly_amount
            ),
            resolution: Some(Resolution::CreateSavingsGoal(CreateSavingsGoal {
                goal_name: format!("{label} Savings"),
                monthly_amount,
            })),
            related_entity: None,
        }]
    }
}

pub fn default_detectors(config: &DetectorConfig) -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(PriceHikeDetector::new(config)),
        Box::new(SpendingSpikeDetector::new(config)),
        Box::new(BudgetOverrunDetector::new(config)),
        Box::new(SavingsOpportunityDetector::new(config)),
    ]
}

pub fn detector_for(insight_type: InsightType, config: &DetectorConfig) -> Box<dyn Detector> {
    match insight_type {
        InsightType::SubscriptionPriceHike => Box::new(PriceHikeDetector::new(config)),
        InsightType::SpendingSpike => Box::new(SpendingSpikeDetector::new(config)),
        InsightType::BudgetOverrun => Box::new(BudgetOverrunDetector::new(config)),
        InsightType::SavingsOpportunity => Box::new(SavingsOpportunityDetector::new(config)),
    }
}

/// Loads a user's records and runs every registered detector over them.
pub struct Analyzer {
    config: DetectorConfig,
    detectors: Vec<Box<dyn Detector>>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl Analyzer {
    pub fn new(config: DetectorConfig) -> Self {
        let detectors = default_detectors(&config);
        Self { config, detectors }
    }

    pub fn with_detectors(config: DetectorConfig, detectors: Vec<Box<dyn Detector>>) -> Self {
        Self { config, detectors }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn detector_types(&self) -> Vec<InsightType> {
        self.detectors.iter().map(|d| d.insight_type()).collect()
    }

    /// First day of the trailing transaction window ending at `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> NaiveDate {
        Duration::try_days(self.config.trailing_window_days)
            .and_then(|window| now.checked_sub_signed(window))
            .map_or(NaiveDate::MIN, |start| start.date_naive())
    }

    /// Any fetch failure fails the whole user; detectors never see partial data.
    pub async fn load_records(
        &self,
        store: &dyn FinanceStore,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<UserRecords, StoreError> {
        let subscriptions = store.confirmed_subscriptions(user_id).await?;
        let transactions = store
            .transactions_since(user_id, self.window_start(now))
            .await?;
        let budgets = store.active_budgets(user_id).await?;
        Ok(UserRecords {
            subscriptions,
            transactions,
            budgets,
        })
    }

    pub fn detect(&self, records: &UserRecords) -> Vec<InsightDraft> {
        self.detectors
            .iter()
            .flat_map(|detector| detector.detect(records))
            .collect()
    }

    pub async fn analyze(
        &self,
        store: &dyn FinanceStore,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<InsightDraft>, StoreError> {
        let records = self.load_records(store, user_id, now).await?;
        let drafts = self.detect(&records);
        debug!(
            %user_id,
            subscriptions = records.subscriptions.len(),
            transactions = records.transactions.len(),
            budgets = records.budgets.len(),
            insights = drafts.len(),
            "analyzed user"
        );
        Ok(drafts)
    }
}
