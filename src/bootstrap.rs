//! Composition root: wires the pipeline, protocol server, and background
//! tasks from configuration. Services are interface-typed values owned here
//! and passed to handlers explicitly; the only process-wide state is the
//! immutable schema catalog inside its `Arc`.

use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditLog;
use crate::breaker::CircuitBreaker;
use crate::catalog::SchemaCatalog;
use crate::config::Config;
use crate::db::pool::ConnectionPool;
use crate::db::{FreshnessTracker, QueryExecutor};
use crate::error::{ConfigError, Error, Result};
use crate::llm::{AnthropicClient, LlmClient, Translator};
use crate::observability::{Observability, Thresholds};
use crate::pipeline::QueryPipeline;
use crate::ratelimit::RateLimiter;
use crate::server::resources::UiResources;
use crate::server::{AppState, start_server};
use crate::session::SessionManager;
use crate::validator::SqlValidator;

/// Initialize the tracing subscriber. `LOG_FORMAT=json` selects structured
/// output; `RUST_LOG` filters as usual.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,censusgate=debug"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Everything the binary needs to serve and to shut down cleanly.
pub struct Gateway {
    pub state: Arc<AppState>,
    pub pool: ConnectionPool,
    pub audit: Arc<AuditLog>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

/// Build the composition root from configuration.
///
/// `llm_client` lets callers (tests, doctor) substitute the provider; pass
/// `None` to construct the real client from `LLM_API_KEY`.
pub async fn build(config: &Config, llm_client: Option<Arc<dyn LlmClient>>) -> Result<Gateway> {
    let catalog = Arc::new(SchemaCatalog::acs());

    let pool = ConnectionPool::open(config.database.clone()).await?;
    let sweeper = pool.spawn_health_sweeper();

    let freshness = Arc::new(
        FreshnessTracker::load(&pool, &config.database.path, &catalog).await,
    );

    let audit = Arc::new(AuditLog::open(&config.audit)?);
    let observability = Arc::new(
        Observability::new(Thresholds::default())
            .map_err(|e| Error::Config(ConfigError::ParseError(e.to_string())))?,
    );

    let llm_breaker = Arc::new(CircuitBreaker::new("llm", config.breaker));
    let client: Arc<dyn LlmClient> = match llm_client {
        Some(client) => client,
        None => Arc::new(AnthropicClient::new(&config.llm).map_err(|_| {
            Error::Config(ConfigError::MissingRequired {
                key: "LLM_API_KEY".to_string(),
                hint: "The translator needs a credential for its external service.".to_string(),
            })
        })?),
    };
    let translator = Arc::new(Translator::new(
        client,
        Arc::clone(&llm_breaker),
        Arc::clone(&catalog),
        &config.llm,
    ));

    let sessions = Arc::new(SessionManager::new(config.session));
    let limiter = Arc::new(RateLimiter::in_memory(config.rate_limit));

    let pipeline = Arc::new(QueryPipeline::new(
        translator,
        Arc::new(SqlValidator::new(Arc::clone(&catalog), config.validator)),
        QueryExecutor::new(pool.clone(), config.database.query_timeout),
        Arc::clone(&freshness),
        Arc::clone(&audit),
        Arc::clone(&observability),
        Arc::clone(&sessions),
    ));

    let resources = Arc::new(UiResources::load(
        config.server.ui_resource_dir.as_deref(),
    ));

    // Periodic idle-session eviction.
    let eviction_sessions = Arc::clone(&sessions);
    let evictor = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = eviction_sessions.evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted, "expired sessions evicted");
            }
        }
    });

    let state = Arc::new(AppState {
        pipeline,
        catalog,
        sessions,
        limiter,
        observability,
        freshness,
        llm_breaker,
        resources,
    });

    Ok(Gateway {
        state,
        pool,
        audit,
        background: vec![sweeper, evictor],
    })
}

impl Gateway {
    /// Stop background tasks, close the pool, and flush the audit log.
    pub async fn shutdown(self) {
        for handle in &self.background {
            handle.abort();
        }
        self.pool.close();
        if let Err(e) = self.audit.flush().await {
            tracing::warn!("audit flush on shutdown failed: {e}");
        }
    }
}

/// Serve until SIGINT/SIGTERM, then drain and shut down.
pub async fn run(config: Config) -> Result<()> {
    let gateway = build(&config, None).await?;
    let (_addr, server) =
        start_server(config.server.bind_addr, Arc::clone(&gateway.state), &config.server).await?;

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");
    server.abort();
    gateway.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Preflight checks for operators: database, pool, credential, audit sink.
/// Returns true when every check passed.
pub async fn doctor(config: &Config) -> bool {
    let mut ok = true;

    let db_exists = config.database.path.exists();
    report("database file", db_exists, &config.database.path.display().to_string());
    ok &= db_exists;

    match ConnectionPool::open(config.database.clone()).await {
        Ok(pool) => {
            report("connection pool", true, &format!("{:?}", pool.health()));
            pool.close();
        }
        Err(e) => {
            report("connection pool", false, &e.to_string());
            ok = false;
        }
    }

    let has_key = config.llm.api_key.is_some();
    report(
        "LLM credential",
        has_key,
        if has_key {
            "LLM_API_KEY present"
        } else {
            "LLM_API_KEY not set; natural-language translation will be unavailable"
        },
    );
    ok &= has_key;

    match AuditLog::open(&config.audit) {
        Ok(_) => report(
            "audit sink",
            true,
            &config.audit.path.display().to_string(),
        ),
        Err(e) => {
            report("audit sink", false, &e.to_string());
            ok = false;
        }
    }

    ok
}

fn report(check: &str, passed: bool, detail: &str) {
    let mark = if passed { "ok " } else { "FAIL" };
    println!("[{mark}] {check:<18} {detail}");
}
