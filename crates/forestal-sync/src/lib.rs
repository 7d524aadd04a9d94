//! ETL orchestration: watermark, upstream fetch, normalization and upsert runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use forestal_adapters::{normalize_records, AdminPayload, GisClient, UpstreamSource};
use forestal_core::WORK_ORDERS;
use forestal_storage::{
    DocumentStore, FetchError, Filter, MemoryDocumentStore, PgDocumentStore, StoreError,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod upsert;
mod watermark;

pub use config::{mask_secret, ConfigError, StoreBackend, SyncConfig};
pub use upsert::{sync_admin_families, upsert_batch, AdminSyncReport, UpsertStats};
pub use watermark::{
    latest_work_order_date, parse_record_date, resolve_watermark, Watermark, WatermarkSource,
    SAFETY_MARGIN_DAYS,
};

pub const CRATE_NAME: &str = "forestal-sync";

/// Name of the run lock guarding concurrent ETL runs.
pub const ETL_LOCK: &str = "etl";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub from: Option<String>,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatistics {
    #[serde(rename = "totalOrdenesEnBD")]
    pub total_work_orders: u64,
    #[serde(rename = "ultimaOrdenFecha")]
    pub latest_work_order_date: String,
    #[serde(rename = "ordenesRecibidas")]
    pub work_orders_received: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EtlRunSummary {
    #[serde(skip)]
    pub run_id: Uuid,
    #[serde(skip)]
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub mensaje: String,
    pub estadisticas: RunStatistics,
    pub ordenes: UpsertStats,
    pub administrativos: AdminSyncReport,
    pub desde: Watermark,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(Box<EtlRunSummary>),
    /// Another run holds the lock.
    AlreadyRunning,
}

/// Short category for a failed run, used in error bodies.
pub fn error_kind(err: &anyhow::Error) -> &'static str {
    if let Some(fetch) = err.downcast_ref::<FetchError>() {
        return fetch.kind();
    }
    if err.downcast_ref::<StoreError>().is_some() {
        return "store";
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return "config";
    }
    "internal"
}

pub struct EtlPipeline {
    store: Arc<dyn DocumentStore>,
    source: Arc<dyn UpstreamSource>,
    epoch_date: String,
    lock_ttl: Duration,
    schedule: Option<String>,
}

impl EtlPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        source: Arc<dyn UpstreamSource>,
        epoch_date: impl Into<String>,
    ) -> Self {
        Self {
            store,
            source,
            epoch_date: epoch_date.into(),
            lock_ttl: Duration::from_secs(900),
            schedule: None,
        }
    }

    pub fn from_config(config: &SyncConfig, store: Arc<dyn DocumentStore>) -> Result<Self> {
        let client = GisClient::new(config.gis.clone()).context("building GIS client")?;
        let mut pipeline = Self::new(store, Arc::new(client), config.epoch_date.clone())
            .with_lock_ttl(config.lock_ttl);
        if config.scheduler_enabled {
            pipeline = pipeline.with_schedule(config.sync_cron.clone());
        }
        Ok(pipeline)
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_schedule(mut self, cron: impl Into<String>) -> Self {
        self.schedule = Some(cron.into());
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// One ETL run under the `etl` lock. The lock is released whatever the result.
    pub async fn run_once(&self, options: &RunOptions) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let owner = run_id.to_string();
        let acquired = self
            .store
            .try_acquire_lock(ETL_LOCK, &owner, self.lock_ttl)
            .await
            .context("acquiring etl run lock")?;
        if !acquired {
            warn!(%run_id, "another etl run holds the lock, skipping");
            return Ok(RunOutcome::AlreadyRunning);
        }

        let span = info_span!("etl_run", %run_id, from = ?options.from, force = options.force);
        let result = self.execute(run_id, options).instrument(span).await;

        if let Err(err) = self.store.release_lock(ETL_LOCK, &owner).await {
            warn!(%run_id, error = %err, "failed to release etl run lock");
        }
        match &result {
            Ok(summary) => info!(
                %run_id,
                started_at = %summary.started_at.to_rfc3339(),
                elapsed_ms = (summary.finished_at - summary.started_at).num_milliseconds(),
                received = summary.estadisticas.work_orders_received,
                inserted = summary.ordenes.inserted,
                updated = summary.ordenes.updated,
                errors = summary.ordenes.errors,
                "etl run completed"
            ),
            Err(err) => error!(%run_id, error = %format!("{err:#}"), "etl run failed"),
        }
        result.map(|summary| RunOutcome::Completed(Box::new(summary)))
    }

    async fn execute(&self, run_id: Uuid, options: &RunOptions) -> Result<EtlRunSummary> {
        let started_at = Utc::now();
        let store = self.store.as_ref();

        let watermark = resolve_watermark(store, options.from.as_deref(), options.force, &self.epoch_date)
            .await
            .context("resolving sync watermark")?;

        let raw_orders = self
            .source
            .fetch_work_orders(&watermark.since)
            .await
            .context("fetching work orders")?;
        let orders = normalize_records(raw_orders);
        let received = orders.len();
        info!(received, since = %watermark.since, "work orders fetched");

        let admin = match self.source.fetch_admin_data().await {
            Ok(value) => AdminPayload::from_json(value),
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "administrative data unavailable, continuing without it");
                AdminPayload::default()
            }
        };
        let administrativos = sync_admin_families(store, &admin).await;

        let ordenes = upsert_batch(store, &WORK_ORDERS, orders)
            .await
            .context("upserting work orders")?;

        let total_work_orders = store
            .count(WORK_ORDERS.name, &Filter::new())
            .await
            .context("counting work orders")?;
        let latest = latest_work_order_date(store)
            .await
            .context("reading latest work order date")?;

        Ok(EtlRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            success: true,
            mensaje: "Proceso ETL completado con éxito".to_string(),
            estadisticas: RunStatistics {
                total_work_orders,
                latest_work_order_date: latest.unwrap_or_else(|| "N/A".to_string()),
                work_orders_received: received,
            },
            ordenes,
            administrativos,
            desde: watermark,
        })
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        let Some(cron) = self.schedule.clone() else {
            return Ok(None);
        };

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once(&RunOptions::default()).await {
                    Ok(RunOutcome::Completed(_)) => info!("scheduled etl run finished"),
                    Ok(RunOutcome::AlreadyRunning) => info!("scheduled etl run skipped, lock held"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled etl run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(cron = %cron, "etl scheduler configured");
        Ok(Some(sched))
    }
}

/// Open the configured store; Postgres schemas are migrated on open.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn DocumentStore>> {
    match config.store {
        StoreBackend::Memory => {
            warn!("using in-memory store, data is lost on exit");
            Ok(Arc::new(MemoryDocumentStore::new()))
        }
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or(ConfigError::Missing("DATABASE_URL"))?;
            let store = PgDocumentStore::connect(url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
    }
}

pub async fn run_sync_once_from_env(options: &RunOptions) -> Result<RunOutcome> {
    let config = SyncConfig::from_env()?;
    info!(config = ?config, "loaded sync configuration");
    let store = open_store(&config).await?;
    let pipeline = EtlPipeline::from_config(&config, store)?;
    pipeline.run_once(options).await
}
