pub mod cli;
pub mod config;
pub mod cooldown;
pub mod db;
pub mod evaluator;
pub mod orchestrator;
pub mod output;
pub mod selection;
pub mod stores;
pub mod test_utils;

// Re-export audit log types for external use
pub use db::{query_audit_logs, write_audit_log, AuditLogEntry};
pub use orchestrator::{CycleOutcome, ForkOrchestrator, RunReport, StatusReport};

use forkloop_shared::{DataStore, Evaluator};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The orchestrator wired to SQLite-backed collaborators.
pub struct App {
    pub config: config::AppConfig,
    pub pool: SqlitePool,
    pub orchestrator: ForkOrchestrator,
}

impl App {
    /// Loads `AppConfig` from the environment and builds the app from it.
    pub async fn from_env() -> anyhow::Result<Self> {
        let config = config::AppConfig::load()?;
        Self::build(config).await
    }

    pub async fn build(config: config::AppConfig) -> anyhow::Result<Self> {
        info!("📍 Loaded Config: DB_URL={}", config.database_url);

        let policy = config.load_policy()?;
        let pool = db::connect(&config.database_url).await?;
        db::init_db(&pool).await?;

        let eval_timeout = Duration::from_secs(config.eval_timeout_secs);
        let evaluator: Arc<dyn Evaluator> = match &config.evaluator_url {
            Some(url) => {
                info!(endpoint = %url, "🌐 Using HTTP evaluator");
                Arc::new(evaluator::HttpEvaluator::new(url.clone(), eval_timeout)?)
            }
            None => {
                info!(seed = config.evaluator_seed, "🎲 Using seeded evaluator");
                Arc::new(evaluator::SeededEvaluator::new(config.evaluator_seed))
            }
        };

        let data_store: Arc<dyn DataStore> = Arc::new(db::SqliteDataStore::new(pool.clone()));
        let orchestrator = ForkOrchestrator::new(
            policy,
            Arc::new(stores::SqliteRunStateStore::new(pool.clone())),
            evaluator,
            Arc::new(stores::SqliteAuditTrail::new(pool.clone())),
            Arc::new(stores::StoreDirectiveSink::new(data_store)),
        )
        .with_eval_limits(config.eval_workers, eval_timeout)
        .with_lease_ttl(config.lease_ttl_secs);

        Ok(Self {
            config,
            pool,
            orchestrator,
        })
    }
}
