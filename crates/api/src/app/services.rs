//! Queue wiring: store, extractor, continuation transport and worker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use drainq_core::{Clock, SystemClock};
use drainq_extract::{Extractor, HeuristicExtractor, LlmConfig, LlmExtractor};
use drainq_infra::QueueConfig;
use drainq_infra::jobs::{
    ChannelSink, ContinuationSink, ContinuationWorker, HttpContinuationSink, InMemoryJobStore, JobStore,
    PostgresJobStore, QueueService, WorkerHandle,
};

/// How long a continuation post waits for its acknowledgement. The receiver drains
/// inside that request, so a slower answer only means it is busy.
const CONTINUATION_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Process settings beyond the queue tunables.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub queue: QueueConfig,
    /// Postgres connection string; in-memory store when unset.
    pub database_url: Option<String>,
    /// Base URL this service is reachable at. Continuations are posted here as fresh
    /// requests; without it they run on an in-process worker.
    pub self_url: Option<String>,
    /// LLM endpoint; heuristic extraction only when unset.
    pub llm: Option<LlmConfig>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let queue = QueueConfig::from_env().context("invalid queue configuration")?;
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let llm = match (var("LLM_API_BASE_URL"), var("LLM_API_KEY")) {
            (Some(base_url), Some(api_key)) => {
                let model = var("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
                Some(LlmConfig::new(base_url, api_key, model).with_request_timeout(queue.extract_deadline))
            }
            (Some(_), None) => anyhow::bail!("LLM_API_BASE_URL is set but LLM_API_KEY is not"),
            _ => None,
        };

        Ok(Self {
            queue,
            database_url: var("DATABASE_URL"),
            self_url: var("DRAINQ_SELF_URL"),
            llm,
        })
    }

    /// In-memory store, in-process continuations, heuristic extraction.
    pub fn in_memory(queue: QueueConfig) -> Self {
        Self {
            queue,
            ..Self::default()
        }
    }

    pub fn with_self_url(mut self, url: impl Into<String>) -> Self {
        self.self_url = Some(url.into());
        self
    }
}

/// Shared handler state.
pub struct AppServices {
    pub queue: QueueService,
}

/// Everything `main` keeps alive for the life of the server.
pub struct Wiring {
    pub services: Arc<AppServices>,
    /// Only when continuations run in-process.
    pub worker: Option<WorkerHandle>,
}

impl Wiring {
    pub async fn shutdown(self) {
        if let Some(worker) = self.worker {
            worker.shutdown().await;
        }
    }
}

/// Primary extractor from settings.
pub fn build_extractor(settings: &Settings) -> anyhow::Result<Arc<dyn Extractor>> {
    match &settings.llm {
        Some(config) => {
            let llm = LlmExtractor::new(config.clone()).context("failed to build LLM extractor")?;
            tracing::info!(model = %config.model, "using LLM extraction");
            Ok(Arc::new(llm))
        }
        None => {
            tracing::warn!("LLM_API_BASE_URL not set; using heuristic extraction only");
            Ok(Arc::new(HeuristicExtractor::new()))
        }
    }
}

pub async fn build_services(settings: Settings, primary: Arc<dyn Extractor>) -> anyhow::Result<Wiring> {
    let store = build_store(&settings).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let Some(url) = &settings.self_url else {
        tracing::warn!("no self URL; continuations run in-process and stop with this process");
        let (sink, rx) = ChannelSink::new();
        let queue = QueueService::new(store, clock, primary, Arc::new(sink), settings.queue);
        let worker = ContinuationWorker::spawn("continuations", rx, queue.chain());
        return Ok(Wiring {
            services: Arc::new(AppServices { queue }),
            worker: Some(worker),
        });
    };

    let sink = HttpContinuationSink::new(url, CONTINUATION_ACK_TIMEOUT)?;
    tracing::info!(endpoint = %sink.endpoint(), "continuations go over HTTP");
    let sink: Arc<dyn ContinuationSink> = Arc::new(sink);
    let queue = QueueService::new(store, clock, primary, sink, settings.queue);

    Ok(Wiring {
        services: Arc::new(AppServices { queue }),
        worker: None,
    })
}

async fn build_store(settings: &Settings) -> anyhow::Result<Arc<dyn JobStore>> {
    let Some(url) = &settings.database_url else {
        tracing::warn!("DATABASE_URL not set; jobs are kept in memory");
        return Ok(Arc::new(InMemoryJobStore::with_batch_limit(settings.queue.batch_limit)));
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(settings.queue.store_timeout)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresJobStore::new(pool).with_batch_limit(settings.queue.batch_limit);
    store.ensure_schema().await.context("failed to prepare job table")?;
    tracing::info!("using Postgres job store");
    Ok(Arc::new(store))
}
