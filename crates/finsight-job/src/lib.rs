//! Scheduled insight run: authorize, enumerate users, analyze and persist each
//! one in isolation, then report aggregate counts.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use finsight_core::{InsightDraft, InsightKey, NewInsight, UserId};
use finsight_detect::{Analyzer, DetectorConfig};
use finsight_storage::{
    FinanceStore, HttpClientConfig, PgFinanceStore, RestFinanceStore, StoreError,
};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "finsight-job";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres { database_url: String },
    Rest { base_url: String },
}

#[derive(Debug)]
pub struct JobConfig {
    pub backend: StoreBackend,
    pub service_role_key: SecretString,
    /// Accepted so a shared environment file works unchanged; never used.
    pub anon_key: Option<SecretString>,
    pub scheduler_enabled: bool,
    pub schedule_cron: String,
    pub user_timeout_secs: u64,
    pub max_concurrent_users: usize,
    pub suppress_duplicates: bool,
    pub http_timeout_secs: u64,
    pub user_page_size: usize,
    pub detector_rules: Option<PathBuf>,
}

fn parse_flag(name: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match value.as_deref() {
        None => Ok(default),
        Some("1" | "true" | "TRUE" | "True") => Ok(true),
        Some("0" | "false" | "FALSE" | "False") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            name,
            value: other.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

impl JobConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match get("FINSIGHT_STORE").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres {
                database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            },
            Some("rest") => StoreBackend::Rest {
                base_url: get("SUPABASE_URL").ok_or(ConfigError::Missing("SUPABASE_URL"))?,
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "FINSIGHT_STORE",
                    value: other.to_string(),
                })
            }
        };

        let service_role_key = get("SUPABASE_SERVICE_ROLE_KEY")
            .map(SecretString::from)
            .ok_or(ConfigError::Missing("SUPABASE_SERVICE_ROLE_KEY"))?;

        Ok(Self {
            backend,
            service_role_key,
            anon_key: get("SUPABASE_ANON_KEY").map(SecretString::from),
            scheduler_enabled: parse_flag(
                "FINSIGHT_SCHEDULER_ENABLED",
                get("FINSIGHT_SCHEDULER_ENABLED"),
                false,
            )?,
            schedule_cron: get("FINSIGHT_CRON").unwrap_or_else(|| "0 0 * * * *".to_string()),
            user_timeout_secs: parse_number(
                "FINSIGHT_USER_TIMEOUT_SECS",
                get("FINSIGHT_USER_TIMEOUT_SECS"),
                30,
            )?,
            max_concurrent_users: parse_number(
                "FINSIGHT_MAX_CONCURRENT_USERS",
                get("FINSIGHT_MAX_CONCURRENT_USERS"),
                1,
            )?,
            suppress_duplicates: parse_flag(
                "FINSIGHT_SUPPRESS_DUPLICATES",
                get("FINSIGHT_SUPPRESS_DUPLICATES"),
                true,
            )?,
            http_timeout_secs: parse_number(
                "FINSIGHT_HTTP_TIMEOUT_SECS",
                get("FINSIGHT_HTTP_TIMEOUT_SECS"),
                20,
            )?,
            user_page_size: parse_number(
                "FINSIGHT_USER_PAGE_SIZE",
                get("FINSIGHT_USER_PAGE_SIZE"),
                finsight_storage::DEFAULT_USER_PAGE_SIZE,
            )?,
            detector_rules: get("FINSIGHT_DETECTOR_RULES").map(PathBuf::from),
        })
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            per_user_timeout: Duration::from_secs(self.user_timeout_secs.max(1)),
            max_concurrent_users: self.max_concurrent_users.max(1),
            suppress_duplicates: self.suppress_duplicates,
        }
    }

    pub fn detector_config(&self) -> Result<DetectorConfig> {
        match &self.detector_rules {
            Some(path) => DetectorConfig::from_yaml_file(path),
            None => Ok(DetectorConfig::default()),
        }
    }

    pub async fn connect_store(&self) -> Result<Arc<dyn FinanceStore>> {
        match &self.backend {
            StoreBackend::Postgres { database_url } => {
                let store = PgFinanceStore::connect(database_url, self.user_page_size)
                    .await
                    .context("connecting to postgres")?;
                Ok(Arc::new(store))
            }
            StoreBackend::Rest { base_url } => {
                let key = SecretString::from(self.service_role_key.expose_secret().to_string());
                let store = RestFinanceStore::new(
                    base_url,
                    key,
                    HttpClientConfig {
                        timeout: Duration::from_secs(self.http_timeout_secs),
                        user_agent: Some(format!("finsight-job/{}", env!("CARGO_PKG_VERSION"))),
                        ..Default::default()
                    },
                    self.user_page_size,
                )
                .context("building rest store")?;
                Ok(Arc::new(store))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("failed to list users: {0}")]
    Enumeration(#[source] StoreError),
}

/// Accept only `Bearer <service key>`. The scheme is matched ignoring ASCII
/// case; the token is compared exactly, in constant time.
pub fn authorize_service_request(
    authorization: Option<&str>,
    service_key: &SecretString,
) -> Result<(), JobError> {
    let expected = service_key.expose_secret();
    let Some((scheme, token)) = authorization.and_then(|value| value.split_once(' ')) else {
        return Err(JobError::Unauthorized);
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(JobError::Unauthorized);
    }
    if !expected.is_empty() && bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(JobError::Unauthorized)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub per_user_timeout: Duration,
    pub max_concurrent_users: usize,
    pub suppress_duplicates: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            per_user_timeout: Duration::from_secs(30),
            max_concurrent_users: 1,
            suppress_duplicates: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum UserFailure {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("analysis panicked: {0}")]
    Panicked(String),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Wall-clock view of one run: the anchor instant plus the time elapsed
/// since the run began.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    anchor: DateTime<Utc>,
    started: Instant,
}

impl RunClock {
    pub fn starting_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: Instant::now(),
        }
    }

    pub fn anchor(&self) -> DateTime<Utc> {
        self.anchor
    }

    pub fn now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.started.elapsed())
            .ok()
            .and_then(|elapsed| self.anchor.checked_add_signed(elapsed))
            .unwrap_or(self.anchor)
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserOutcome {
    pub inserted: usize,
    pub suppressed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub users_processed: usize,
    pub successful: usize,
    pub errors: usize,
    pub total_insights: usize,
    pub suppressed_duplicates: usize,
    pub duration_ms: u64,
    pub failed_users: Vec<UserId>,
}

/// Drop drafts whose key already has a live insight, or repeats one earlier
/// in the same batch.
pub fn suppress_duplicates(
    drafts: Vec<InsightDraft>,
    active: &HashSet<InsightKey>,
) -> (Vec<InsightDraft>, usize) {
    let mut seen = active.clone();
    let before = drafts.len();
    let kept = drafts
        .into_iter()
        .filter(|draft| seen.insert(draft.key()))
        .collect::<Vec<_>>();
    let suppressed = before - kept.len();
    (kept, suppressed)
}

pub struct JobRunner {
    store: Arc<dyn FinanceStore>,
    analyzer: Analyzer,
    options: RunOptions,
    in_flight: Mutex<()>,
}

impl JobRunner {
    pub fn new(store: Arc<dyn FinanceStore>, analyzer: Analyzer, options: RunOptions) -> Self {
        Self {
            store,
            analyzer,
            options,
            in_flight: Mutex::new(()),
        }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub async fn run_once(&self) -> Result<RunSummary, JobError> {
        self.run_at(Utc::now()).await
    }

    /// Run unless another run holds the slot; scheduler ticks use this so
    /// runs never overlap.
    pub async fn try_run_once(&self) -> Option<Result<RunSummary, JobError>> {
        let _slot = self.in_flight.try_lock().ok()?;
        Some(self.run_at(Utc::now()).await)
    }

    /// One full pass over every user. `now` anchors the transaction window
    /// and the duplicate check; expiry is stamped from the moment each
    /// user's rows are written.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunSummary, JobError> {
        let clock = RunClock::starting_at(now);
        let run_id = Uuid::new_v4();
        let span = info_span!("insight_run", %run_id);

        async move {
            let users = self.store.list_users().await.map_err(JobError::Enumeration)?;
            info!(users = users.len(), "starting insight run");

            let outcomes = stream::iter(users)
                .map(|user_id| async move { (user_id, self.process_user(user_id, &clock).await) })
                .buffered(self.options.max_concurrent_users.max(1))
                .collect::<Vec<_>>()
                .await;

            let mut summary = RunSummary {
                run_id,
                started_at: now,
                finished_at: now,
                users_processed: outcomes.len(),
                successful: 0,
                errors: 0,
                total_insights: 0,
                suppressed_duplicates: 0,
                duration_ms: 0,
                failed_users: Vec::new(),
            };
            for (user_id, outcome) in outcomes {
                match outcome {
                    Ok(outcome) => {
                        summary.successful += 1;
                        summary.total_insights += outcome.inserted;
                        summary.suppressed_duplicates += outcome.suppressed;
                    }
                    Err(err) => {
                        warn!(%user_id, error = %err, "user analysis failed");
                        summary.errors += 1;
                        summary.failed_users.push(user_id);
                    }
                }
            }

            summary.duration_ms = clock.elapsed_ms();
            summary.finished_at = clock.now();
            info!(
                users_processed = summary.users_processed,
                successful = summary.successful,
                errors = summary.errors,
                total_insights = summary.total_insights,
                suppressed_duplicates = summary.suppressed_duplicates,
                duration_ms = summary.duration_ms,
                "insight run complete"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Analyze and persist a single user. A panic anywhere in the unit
    /// fails only this user.
    pub async fn process_user(
        &self,
        user_id: UserId,
        clock: &RunClock,
    ) -> Result<UserOutcome, UserFailure> {
        match AssertUnwindSafe(self.analyze_and_persist(user_id, clock))
            .catch_unwind()
            .instrument(info_span!("user_analysis", %user_id))
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(UserFailure::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// Reads and the duplicate lookup run under the per-user timeout. The
    /// insert is bounded by the store's own request timeout, so a write that
    /// lands is never reported as a failure.
    async fn analyze_and_persist(
        &self,
        user_id: UserId,
        clock: &RunClock,
    ) -> Result<UserOutcome, UserFailure> {
        let timeout = self.options.per_user_timeout;
        let (drafts, suppressed) =
            tokio::time::timeout(timeout, self.candidates(user_id, clock.anchor()))
                .await
                .map_err(|_| UserFailure::Timeout(timeout))??;
        if drafts.is_empty() {
            return Ok(UserOutcome {
                inserted: 0,
                suppressed,
            });
        }

        let inserted_at = clock.now();
        let rows = drafts
            .into_iter()
            .map(|draft| NewInsight::from_draft(user_id, draft, inserted_at))
            .collect::<Vec<_>>();
        let inserted = self.store.insert_insights(&rows).await?;
        Ok(UserOutcome {
            inserted,
            suppressed,
        })
    }

    /// Drafts for one user, minus those that duplicate a live insight.
    async fn candidates(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<(Vec<InsightDraft>, usize), UserFailure> {
        let drafts = self
            .analyzer
            .analyze(self.store.as_ref(), user_id, now)
            .await?;
        if !self.options.suppress_duplicates || drafts.is_empty() {
            return Ok((drafts, 0));
        }
        let active = self.store.active_insight_keys(user_id, now).await?;
        Ok(suppress_duplicates(drafts, &active))
    }
}

pub async fn build_runner(config: &JobConfig) -> Result<JobRunner> {
    let store = config.connect_store().await?;
    let analyzer = Analyzer::new(config.detector_config()?);
    Ok(JobRunner::new(store, analyzer, config.run_options()))
}

pub async fn maybe_build_scheduler(
    config: &JobConfig,
    runner: Arc<JobRunner>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(&config.schedule_cron, runner).await.map(Some)
}

pub async fn build_scheduler(cron: &str, runner: Arc<JobRunner>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let runner = Arc::clone(&runner);
        Box::pin(async move {
            match runner.try_run_once().await {
                None => warn!("previous insight run still in progress; skipping tick"),
                Some(Ok(summary)) => info!(run_id = %summary.run_id, "scheduled insight run finished"),
                Some(Err(err)) => error!(error = %err, "scheduled insight run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
