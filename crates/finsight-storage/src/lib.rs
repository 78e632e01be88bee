//! Data-access boundary for the insight detector: Postgres, hosted REST and
//! in-memory implementations of [`FinanceStore`], plus HTTP retry utilities.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use finsight_core::{
    BudgetWithSpend, InsightKey, InsightType, NewInsight, Subscription, Transaction, UserId,
};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "finsight-storage";

pub const DEFAULT_USER_PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("encoding insight payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("building http client: {0}")]
    Client(String),
}

/// Read access to a user's financial records plus insert-only access to
/// `proactive_insights`.
#[async_trait]
pub trait FinanceStore: Send + Sync {
    /// Every registered user, in the order the identity store returns them.
    async fn list_users(&self) -> Result<Vec<UserId>, StoreError>;

    async fn confirmed_subscriptions(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Subscription>, StoreError>;

    /// Transactions dated on or after `since`, newest first.
    async fn transactions_since(
        &self,
        user_id: UserId,
        since: NaiveDate,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn active_budgets(&self, user_id: UserId) -> Result<Vec<BudgetWithSpend>, StoreError>;

    /// Keys of the user's insights that have not yet expired at `now`.
    async fn active_insight_keys(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<HashSet<InsightKey>, StoreError>;

    /// Insert all rows or none of them.
    async fn insert_insights(&self, insights: &[NewInsight]) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

pub struct PgFinanceStore {
    pool: PgPool,
    user_page_size: i64,
}

impl PgFinanceStore {
    pub async fn connect(database_url: &str, user_page_size: usize) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool, user_page_size))
    }

    pub fn from_pool(pool: PgPool, user_page_size: usize) -> Self {
        Self {
            pool,
            user_page_size: i64::try_from(user_page_size.max(1)).unwrap_or(i64::MAX),
        }
    }

    /// Create `proactive_insights` when it does not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl FinanceStore for PgFinanceStore {
    async fn list_users(&self) -> Result<Vec<UserId>, StoreError> {
        let mut users = Vec::new();
        let mut offset = 0i64;
        loop {
            let rows = sqlx::query(
                r#"
                SELECT id
                  FROM auth.users
                 ORDER BY created_at, id
                 LIMIT $1 OFFSET $2
                "#,
            )
            .bind(self.user_page_size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

            let fetched = rows.len();
            for row in rows {
                users.push(row.try_get::<Uuid, _>("id")?);
            }
            if i64::try_from(fetched).unwrap_or(i64::MAX) < self.user_page_size {
                break;
            }
            offset += self.user_page_size;
        }
        Ok(users)
    }

    async fn confirmed_subscriptions(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, merchant_name, amount, last_charge_amount, confirmed
              FROM detected_subscriptions
             WHERE user_id = $1
               AND confirmed = TRUE
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Subscription {
                id: row.try_get("id")?,
                merchant_name: row.try_get("merchant_name")?,
                amount: row.try_get("amount")?,
                last_charge_amount: row.try_get("last_charge_amount")?,
                confirmed: row.try_get("confirmed")?,
            });
        }
        Ok(out)
    }

    async fn transactions_since(
        &self,
        user_id: UserId,
        since: NaiveDate,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, amount, merchant, transaction_date
              FROM transactions
             WHERE user_id = $1
               AND transaction_date >= $2
             ORDER BY transaction_date DESC
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Transaction {
                id: row.try_get("id")?,
                amount: row.try_get("amount")?,
                merchant: row.try_get("merchant")?,
                transaction_date: row.try_get("transaction_date")?,
            });
        }
        Ok(out)
    }

    async fn active_budgets(&self, user_id: UserId) -> Result<Vec<BudgetWithSpend>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT b.id,
                   b.category,
                   b.amount,
                   COALESCE(s.spent_amount, 0) AS spent_amount
              FROM user_budgets b
              LEFT JOIN LATERAL (
                    SELECT bs.spent_amount
                      FROM budget_spending bs
                     WHERE bs.budget_id = b.id
                     LIMIT 1
                   ) s ON TRUE
             WHERE b.user_id = $1
               AND b.is_active = TRUE
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(BudgetWithSpend {
                id: row.try_get("id")?,
                category: row.try_get("category")?,
                amount: row.try_get("amount")?,
                spent_amount: row.try_get("spent_amount")?,
            });
        }
        Ok(out)
    }

    async fn active_insight_keys(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<HashSet<InsightKey>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT insight_type, related_entity_id
              FROM proactive_insights
             WHERE user_id = $1
               AND expires_at > $2
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut keys = HashSet::with_capacity(rows.len());
        for row in rows {
            let insight_type: String = row.try_get("insight_type")?;
            let related_entity_id: Option<Uuid> = row.try_get("related_entity_id")?;
            if let Some(key) = parse_insight_key(&insight_type, related_entity_id) {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    async fn insert_insights(&self, insights: &[NewInsight]) -> Result<usize, StoreError> {
        if insights.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for insight in insights {
            sqlx::query(
                r#"
                INSERT INTO proactive_insights (
                    user_id, insight_type, severity, title, message,
                    resolution_action, resolution_data,
                    related_entity_id, related_entity_type, expires_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(insight.user_id)
            .bind(insight.insight_type.as_str())
            .bind(insight.severity.as_str())
            .bind(&insight.title)
            .bind(&insight.message)
            .bind(insight.resolution_action())
            .bind(insight.resolution_data()?)
            .bind(insight.related_entity_id())
            .bind(insight.related_entity_type())
            .bind(insight.expires_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(insights.len())
    }
}

/// Rows written by other producers may carry types this job does not know.
fn parse_insight_key(insight_type: &str, related_entity_id: Option<Uuid>) -> Option<InsightKey> {
    match insight_type.parse::<InsightType>() {
        Ok(insight_type) => Some(InsightKey {
            insight_type,
            related_entity_id,
        }),
        Err(err) => {
            debug!(%err, "ignoring insight row of foreign type");
            None
        }
    }
}

/// Store backed by the hosted BaaS: the auth admin API for users and the
/// PostgREST endpoint for tables, authenticated with the service-role key.
pub struct RestFinanceStore {
    client: reqwest::Client,
    base_url: String,
    service_key: SecretString,
    backoff: BackoffPolicy,
    user_page_size: usize,
}

#[derive(Debug, Deserialize)]
struct AdminUsersPage {
    #[serde(default)]
    users: Vec<AdminUser>,
}

#[derive(Debug, Deserialize)]
struct AdminUser {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
struct BudgetRow {
    id: Uuid,
    category: String,
    amount: Decimal,
    #[serde(default)]
    budget_spending: Option<SpendEmbed>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpendEmbed {
    Many(Vec<SpendRow>),
    One(SpendRow),
}

#[derive(Debug, Deserialize)]
struct SpendRow {
    #[serde(default)]
    spent_amount: Option<Decimal>,
}

impl BudgetRow {
    fn into_budget(self) -> BudgetWithSpend {
        let spent_amount = match self.budget_spending {
            Some(SpendEmbed::Many(rows)) => rows.into_iter().next().and_then(|r| r.spent_amount),
            Some(SpendEmbed::One(row)) => row.spent_amount,
            None => None,
        }
        .unwrap_or(Decimal::ZERO);
        BudgetWithSpend {
            id: self.id,
            category: self.category,
            amount: self.amount,
            spent_amount,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InsightKeyRow {
    insight_type: String,
    #[serde(default)]
    related_entity_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct InsightRow<'a> {
    user_id: UserId,
    insight_type: &'static str,
    severity: &'static str,
    title: &'a str,
    message: &'a str,
    resolution_action: Option<&'static str>,
    resolution_data: Option<serde_json::Value>,
    related_entity_id: Option<Uuid>,
    related_entity_type: Option<&'static str>,
    expires_at: DateTime<Utc>,
}

impl<'a> InsightRow<'a> {
    fn from_insight(insight: &'a NewInsight) -> Result<Self, StoreError> {
        Ok(Self {
            user_id: insight.user_id,
            insight_type: insight.insight_type.as_str(),
            severity: insight.severity.as_str(),
            title: &insight.title,
            message: &insight.message,
            resolution_action: insight.resolution_action(),
            resolution_data: insight.resolution_data()?,
            related_entity_id: insight.related_entity_id(),
            related_entity_type: insight.related_entity_type(),
            expires_at: insight.expires_at,
        })
    }
}

impl RestFinanceStore {
    pub fn new(
        base_url: &str,
        service_key: SecretString,
        config: HttpClientConfig,
        user_page_size: usize,
    ) -> Result<Self, StoreError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .map_err(|err| StoreError::Client(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            backoff: config.backoff,
            user_page_size: user_page_size.max(1),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let key = self.service_key.expose_secret();
        builder.header("apikey", key).bearer_auth(key)
    }

    /// Send a request, retrying transient failures when `idempotent` is set.
    async fn send<F>(
        &self,
        what: &'static str,
        idempotent: bool,
        build: F,
    ) -> Result<reqwest::Response, StoreError>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let max_retries = if idempotent { self.backoff.max_retries } else { 0 };
        let mut attempt = 0;

        loop {
            let can_retry = attempt < max_retries;
            match self.authed(build()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if !(can_retry && classify_status(status) == RetryDisposition::Retryable) {
                        let url = resp.url().to_string();
                        let body = resp.text().await.unwrap_or_default();
                        return Err(StoreError::HttpStatus {
                            status: status.as_u16(),
                            url,
                            body,
                        });
                    }
                    warn!(what, status = status.as_u16(), attempt, "retrying store request");
                }
                Err(err) => {
                    if !(can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable) {
                        return Err(StoreError::Request(err));
                    }
                    warn!(what, error = %err, attempt, "retrying store request");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl FinanceStore for RestFinanceStore {
    async fn list_users(&self) -> Result<Vec<UserId>, StoreError> {
        let url = format!("{}/auth/v1/admin/users", self.base_url);
        let mut users = Vec::new();
        let mut page = 1usize;
        loop {
            let resp = self
                .send("list_users", true, || {
                    self.client.get(&url).query(&[
                        ("page", page.to_string()),
                        ("per_page", self.user_page_size.to_string()),
                    ])
                })
                .await?;
            let batch: AdminUsersPage = resp.json().await?;
            let fetched = batch.users.len();
            users.extend(batch.users.into_iter().map(|u| u.id));
            if fetched < self.user_page_size {
                break;
            }
            page += 1;
        }
        Ok(users)
    }

    async fn confirmed_subscriptions(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Subscription>, StoreError> {
        let url = self.table_url("detected_subscriptions");
        let resp = self
            .send("confirmed_subscriptions", true, || {
                self.client.get(&url).query(&[
                    ("select", "id,merchant_name,amount,last_charge_amount,confirmed".to_string()),
                    ("user_id", format!("eq.{user_id}")),
                    ("confirmed", "eq.true".to_string()),
                ])
            })
            .await?;
        Ok(resp.json().await?)
    }

    async fn transactions_since(
        &self,
        user_id: UserId,
        since: NaiveDate,
    ) -> Result<Vec<Transaction>, StoreError> {
        let url = self.table_url("transactions");
        let resp = self
            .send("transactions_since", true, || {
                self.client.get(&url).query(&[
                    ("select", "id,amount,merchant,transaction_date".to_string()),
                    ("user_id", format!("eq.{user_id}")),
                    ("transaction_date", format!("gte.{since}")),
                    ("order", "transaction_date.desc".to_string()),
                ])
            })
            .await?;
        Ok(resp.json().await?)
    }

    async fn active_budgets(&self, user_id: UserId) -> Result<Vec<BudgetWithSpend>, StoreError> {
        let url = self.table_url("user_budgets");
        let resp = self
            .send("active_budgets", true, || {
                self.client.get(&url).query(&[
                    ("select", "id,category,amount,budget_spending(spent_amount)".to_string()),
                    ("user_id", format!("eq.{user_id}")),
                    ("is_active", "eq.true".to_string()),
                ])
            })
            .await?;
        let rows: Vec<BudgetRow> = resp.json().await?;
        Ok(rows.into_iter().map(BudgetRow::into_budget).collect())
    }

    async fn active_insight_keys(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<HashSet<InsightKey>, StoreError> {
        let url = self.table_url("proactive_insights");
        let cutoff = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        let resp = self
            .send("active_insight_keys", true, || {
                self.client.get(&url).query(&[
                    ("select", "insight_type,related_entity_id".to_string()),
                    ("user_id", format!("eq.{user_id}")),
                    ("expires_at", format!("gt.{cutoff}")),
                ])
            })
            .await?;
        let rows: Vec<InsightKeyRow> = resp.json().await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| parse_insight_key(&r.insight_type, r.related_entity_id))
            .collect())
    }

    async fn insert_insights(&self, insights: &[NewInsight]) -> Result<usize, StoreError> {
        if insights.is_empty() {
            return Ok(0);
        }
        let rows = insights
            .iter()
            .map(InsightRow::from_insight)
            .collect::<Result<Vec<_>, _>>()?;
        let url = self.table_url("proactive_insights");
        // A single array POST is applied as one statement.
        self.send("insert_insights", false, || {
            self.client
                .post(&url)
                .header("Prefer", "return=minimal")
                .json(&rows)
        })
        .await?;
        Ok(insights.len())
    }
}

#[derive(Debug, Default, Clone)]
struct MemoryState {
    users: Vec<UserId>,
    subscriptions: HashMap<UserId, Vec<Subscription>>,
    transactions: HashMap<UserId, Vec<Transaction>>,
    budgets: HashMap<UserId, Vec<(bool, BudgetWithSpend)>>,
    insights: Vec<NewInsight>,
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryFinanceStore {
    state: Mutex<MemoryState>,
}

impl MemoryFinanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user_id: UserId) {
        self.state.lock().await.users.push(user_id);
    }

    pub async fn add_subscription(&self, user_id: UserId, subscription: Subscription) {
        let mut state = self.state.lock().await;
        state.subscriptions.entry(user_id).or_default().push(subscription);
    }

    pub async fn add_transaction(&self, user_id: UserId, transaction: Transaction) {
        let mut state = self.state.lock().await;
        state.transactions.entry(user_id).or_default().push(transaction);
    }

    pub async fn add_budget(&self, user_id: UserId, budget: BudgetWithSpend, is_active: bool) {
        let mut state = self.state.lock().await;
        state.budgets.entry(user_id).or_default().push((is_active, budget));
    }

    pub async fn insights(&self) -> Vec<NewInsight> {
        self.state.lock().await.insights.clone()
    }

    pub async fn insights_for(&self, user_id: UserId) -> Vec<NewInsight> {
        self.state
            .lock()
            .await
            .insights
            .iter()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FinanceStore for MemoryFinanceStore {
    async fn list_users(&self) -> Result<Vec<UserId>, StoreError> {
        Ok(self.state.lock().await.users.clone())
    }

    async fn confirmed_subscriptions(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Subscription>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .get(&user_id)
            .map(|subs| subs.iter().filter(|s| s.confirmed).cloned().collect())
            .unwrap_or_default())
    }

    async fn transactions_since(
        &self,
        user_id: UserId,
        since: NaiveDate,
    ) -> Result<Vec<Transaction>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .transactions
            .get(&user_id)
            .map(|txs| {
                txs.iter()
                    .filter(|t| t.transaction_date >= since)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        // Stable sort keeps insertion order within a day.
        out.sort_by(|a, b| b.transaction_date.cmp(&a.transaction_date));
        Ok(out)
    }

    async fn active_budgets(&self, user_id: UserId) -> Result<Vec<BudgetWithSpend>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .budgets
            .get(&user_id)
            .map(|budgets| {
                budgets
                    .iter()
                    .filter(|(active, _)| *active)
                    .map(|(_, b)| b.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn active_insight_keys(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<HashSet<InsightKey>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .insights
            .iter()
            .filter(|i| i.user_id == user_id && i.expires_at > now)
            .map(NewInsight::key)
            .collect())
    }

    async fn insert_insights(&self, insights: &[NewInsight]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.insights.extend_from_slice(insights);
        Ok(insights.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use finsight_core::{InsightDraft, Severity};
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn tx(amount: Decimal, date: NaiveDate) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            amount,
            merchant: None,
            transaction_date: date,
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::CONFLICT), RetryDisposition::NonRetryable);
    }

    #[test]
    fn budget_spend_embed_accepts_array_object_and_absence() {
        let rows: Vec<BudgetRow> = serde_json::from_str(
            r#"[
                {"id": "00000000-0000-0000-0000-000000000001", "category": "Dining",
                 "amount": 200, "budget_spending": [{"spent_amount": 185.5}]},
                {"id": "00000000-0000-0000-0000-000000000002", "category": "Travel",
                 "amount": "500.00", "budget_spending": {"spent_amount": 12}},
                {"id": "00000000-0000-0000-0000-000000000003", "category": "Gifts",
                 "amount": 50, "budget_spending": []},
                {"id": "00000000-0000-0000-0000-000000000004", "category": "Misc",
                 "amount": 50}
            ]"#,
        )
        .unwrap();
        let budgets = rows.into_iter().map(BudgetRow::into_budget).collect::<Vec<_>>();
        assert_eq!(budgets[0].spent_amount, dec!(185.5));
        assert_eq!(budgets[1].amount, dec!(500));
        assert_eq!(budgets[1].spent_amount, dec!(12));
        assert_eq!(budgets[2].spent_amount, Decimal::ZERO);
        assert_eq!(budgets[3].spent_amount, Decimal::ZERO);
    }

    #[test]
    fn foreign_insight_types_are_ignored() {
        assert!(parse_insight_key("weekly_digest", None).is_none());
        let key = parse_insight_key("spending_spike", None).unwrap();
        assert_eq!(key.insight_type, InsightType::SpendingSpike);
    }

    #[test]
    fn insight_row_flattens_resolution_into_columns() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let insight = NewInsight::from_draft(
            Uuid::nil(),
            InsightDraft {
                insight_type: InsightType::SpendingSpike,
                severity: Severity::Warning,
                title: "Spending spike".into(),
                message: "Up 50%".into(),
                resolution: Some(finsight_core::Resolution::ReviewTransactions(
                    finsight_core::ReviewTransactions {
                        category: "all".into(),
                        period: "7_days".into(),
                    },
                )),
                related_entity: None,
            },
            now,
        );
        let value = serde_json::to_value(InsightRow::from_insight(&insight).unwrap()).unwrap();
        assert_eq!(value["insight_type"], "spending_spike");
        assert_eq!(value["severity"], "warning");
        assert_eq!(value["resolution_action"], "review_transactions");
        assert_eq!(value["resolution_data"]["period"], "7_days");
        assert!(value["related_entity_id"].is_null());
    }

    #[tokio::test]
    async fn memory_store_windows_and_orders_transactions() {
        let store = MemoryFinanceStore::new();
        let user = Uuid::new_v4();
        store.add_transaction(user, tx(dec!(-5), day(2))).await;
        store.add_transaction(user, tx(dec!(-7), day(20))).await;
        store.add_transaction(user, tx(dec!(-9), day(10))).await;
        store.add_transaction(Uuid::new_v4(), tx(dec!(-1), day(25))).await;

        let txs = store.transactions_since(user, day(5)).await.unwrap();
        let amounts = txs.iter().map(|t| t.amount).collect::<Vec<_>>();
        assert_eq!(amounts, vec![dec!(-7), dec!(-9)]);
    }

    #[tokio::test]
    async fn memory_store_filters_unconfirmed_and_inactive() {
        let store = MemoryFinanceStore::new();
        let user = Uuid::new_v4();
        for (confirmed, name) in [(true, "Streamly"), (false, "Maybe Gym")] {
            store
                .add_subscription(
                    user,
                    Subscription {
                        id: Uuid::new_v4(),
                        merchant_name: name.into(),
                        amount: dec!(10),
                        last_charge_amount: None,
                        confirmed,
                    },
                )
                .await;
        }
        for (active, category) in [(true, "Dining"), (false, "Old")] {
            store
                .add_budget(
                    user,
                    BudgetWithSpend {
                        id: Uuid::new_v4(),
                        category: category.into(),
                        amount: dec!(100),
                        spent_amount: dec!(10),
                    },
                    active,
                )
                .await;
        }

        let subs = store.confirmed_subscriptions(user).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].merchant_name, "Streamly");
        let budgets = store.active_budgets(user).await.unwrap();
        assert_eq!(budgets.len(), 1);
        assert_eq!(budgets[0].category, "Dining");
    }

    /// Minimal HTTP/1.1 responder: replies to the n-th connection with the
    /// n-th scripted `(status, body)`, repeating the last one.
    async fn scripted_server(
        script: Vec<(u16, &'static str)>,
    ) -> (String, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = script.get(n).or(script.last()).copied().unwrap();

                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                let header_end = loop {
                    let read = socket.read(&mut buf).await.unwrap_or(0);
                    if read == 0 {
                        break None;
                    }
                    request.extend_from_slice(&buf[..read]);
                    if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                        break Some(pos + 4);
                    }
                };
                if let Some(header_end) = header_end {
                    let head = String::from_utf8_lossy(&request[..header_end]).to_lowercase();
                    let content_length = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    while request.len() < header_end + content_length {
                        let read = socket.read(&mut buf).await.unwrap_or(0);
                        if read == 0 {
                            break;
                        }
                        request.extend_from_slice(&buf[..read]);
                    }
                }

                let reply = format!(
                    "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    fn rest_store(base_url: &str, max_retries: usize) -> RestFinanceStore {
        RestFinanceStore::new(
            base_url,
            SecretString::from("service-key".to_string()),
            HttpClientConfig {
                timeout: Duration::from_secs(5),
                user_agent: None,
                backoff: BackoffPolicy {
                    max_retries,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
            },
            10,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn rest_reads_retry_transient_statuses() {
        let (url, hits) = scripted_server(vec![(503, "{}"), (429, "{}"), (200, "[]")]).await;
        let store = rest_store(&url, 3);
        let subs = store.confirmed_subscriptions(Uuid::new_v4()).await.unwrap();
        assert!(subs.is_empty());
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rest_reads_report_the_last_status_once_retries_run_out() {
        let (url, hits) = scripted_server(vec![(503, "busy")]).await;
        let store = rest_store(&url, 2);
        let err = store.active_budgets(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::HttpStatus { status: 503, ref body, .. } if body == "busy"));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rest_client_errors_are_not_retried() {
        let (url, hits) = scripted_server(vec![(401, "nope"), (200, "[]")]).await;
        let store = rest_store(&url, 3);
        let err = store.confirmed_subscriptions(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::HttpStatus { status: 401, .. }));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rest_inserts_are_sent_once() {
        let (url, hits) = scripted_server(vec![(503, "{}"), (201, "")]).await;
        let store = rest_store(&url, 3);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let insight = NewInsight::from_draft(
            Uuid::new_v4(),
            InsightDraft {
                insight_type: InsightType::SpendingSpike,
                severity: Severity::Warning,
                title: "Spending spike".into(),
                message: "Up 50%".into(),
                resolution: None,
                related_entity: None,
            },
            now,
        );
        let err = store.insert_insights(&[insight]).await.unwrap_err();
        assert!(matches!(err, StoreError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
