//! ipapi-proxy - caching, batching proxy for ip-api.com
//!
//! This is the composition root that wires together all the components.

use ipapi_proxy::adapters::inbound::{HttpLimits, HttpServer};
use ipapi_proxy::adapters::outbound::{IpApiConfig, IpApiFetcher};
use ipapi_proxy::application::{BatchConfig, Batcher};
use ipapi_proxy::config::load_config;
use ipapi_proxy::domain::ports::Fetcher;
use ipapi_proxy::infrastructure::{shutdown_signal, LookupCache, RateLimitConfig, ShutdownController};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting ipapi-proxy listen={} upstream={} cache_size={}",
        cfg.listen_addr,
        cfg.ipapi_url,
        cfg.cache_size
    );

    // ===== COMPOSITION ROOT =====

    // 1. Outbound adapter
    let fetcher = IpApiFetcher::new(IpApiConfig {
        base_url: cfg.ipapi_url.clone(),
        api_key: cfg.ipapi_key.clone(),
        timeout: Duration::from_secs(cfg.fetch_timeout_secs),
        retries: cfg.fetch_retries,
        rate_limit: Some(RateLimitConfig {
            max_requests: cfg.ipapi_rate_limit,
            ..RateLimitConfig::default()
        }),
        ..IpApiConfig::default()
    })?;
    if cfg.ipapi_key.is_some() {
        tracing::info!("api key configured, upstream budget not enforced locally");
    }
    let fetcher: Arc<dyn Fetcher> = Arc::new(fetcher);

    // 2. Cache and batcher
    let cache = Arc::new(LookupCache::new(cfg.cache_size));
    let (batcher, worker) = Batcher::spawn(
        cache,
        fetcher,
        BatchConfig {
            max_batch_size: cfg.batch_size,
            max_batch_delay: Duration::from_millis(cfg.batch_delay_ms),
        },
    );

    // 3. Shutdown coordination
    let shutdown = ShutdownController::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    // 4. Inbound adapter
    let server = HttpServer::new(
        cfg.listen_addr.clone(),
        batcher.clone(),
        HttpLimits {
            submit_timeout: Duration::from_secs(cfg.submit_timeout_secs),
            max_batch_request: cfg.max_batch_request,
        },
        shutdown.clone(),
    );
    let mut server_task = tokio::spawn(async move { server.run().await });

    tokio::select! {
        result = &mut server_task => {
            // The listener exited before any shutdown signal
            worker.abort();
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    tracing::error!("server error: {}", e);
                    Err(e)
                }
                Err(e) => Err(e.into()),
            };
        }
        _ = shutdown.wait() => {}
    }

    // Give requests already waiting on lookups a bounded time to finish
    let grace = Duration::from_secs(cfg.shutdown_grace_secs);
    let drained = shutdown.wait_for_drain(grace).await;
    if !drained {
        tracing::warn!(
            "abandoning {} queued lookups after {}s grace",
            batcher.pending_count(),
            cfg.shutdown_grace_secs
        );
    }

    match tokio::time::timeout(Duration::from_secs(1), &mut server_task).await {
        Ok(Ok(Err(e))) => tracing::error!("server error during shutdown: {}", e),
        Ok(_) => {}
        Err(_) => {
            tracing::warn!("listener did not close in time, aborting");
            server_task.abort();
        }
    }

    worker.abort();
    tracing::info!("shutdown complete");
    Ok(())
}
