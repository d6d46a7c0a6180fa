//! Herald binary entrypoint: crawlers, notifier and HTTP delivery layer.

use std::collections::HashMap;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_cache::{ContentCache, LocalBlobStore};
use herald_canon::CanonicalizerRegistry;
use herald_common::config::AppConfig;
use herald_common::db;
use herald_crawler::{Crawler, HttpSourceClient, Pipeline, Supervisor};
use herald_notifier::{DiscordSubscriber, Dispatcher, TelegramSubscriber};
use herald_store::PgStore;

use herald_api::routes::create_router;
use herald_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "herald=info,herald_api=info,herald_crawler=info,herald_canon=info,\
                 herald_cache=info,herald_notifier=info,herald_store=info,tower_http=info",
            )
        }))
        .json()
        .init();

    tracing::info!("Herald starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database and apply migrations
    let pool = db::connect(&config.database_url, config.db_max_connections).await?;
    let store = Arc::new(PgStore::new(pool));

    // Payload cache
    let cache_settings = config.cache_settings();
    tokio::fs::create_dir_all(&cache_settings.root).await?;
    let blobs = Arc::new(LocalBlobStore::new(&cache_settings.root));
    let cache = ContentCache::new(blobs, cache_settings)?;

    // Notification subscribers
    let dispatch_settings = config.dispatch_settings();
    let http = reqwest::Client::builder()
        .timeout(dispatch_settings.attempt_timeout)
        .build()?;
    let mut dispatcher = Dispatcher::new(store.clone(), dispatch_settings);
    if let (Some(token), Some(chat_id)) = (&config.telegram_bot_token, &config.telegram_chat_id) {
        dispatcher = dispatcher.subscribe(Arc::new(TelegramSubscriber::new(
            http.clone(),
            token.as_str(),
            chat_id.as_str(),
            config.public_url.as_str(),
        )));
    }
    if let Some(webhook_url) = &config.discord_webhook_url {
        dispatcher = dispatcher.subscribe(Arc::new(DiscordSubscriber::new(
            http.clone(),
            webhook_url.as_str(),
            config.public_url.as_str(),
        )));
    }
    if dispatcher.channels().is_empty() {
        tracing::warn!("No notification channel configured, new items will only be recorded");
    }

    let pipeline = Pipeline {
        canon: Arc::new(CanonicalizerRegistry::new()),
        items: store.clone(),
        states: store.clone(),
        cache: cache.clone(),
        dispatcher: Arc::new(dispatcher),
    };

    // One crawler task per enabled source
    let mut supervisor = Supervisor::new();
    let mut crawlers = HashMap::new();
    let crawl_settings = config.crawl_settings();
    let sources = config.enabled_sources();
    if sources.is_empty() {
        tracing::warn!("No source configured, set LOSTFILM_SOURCE_URL or KINOZAL_SOURCE_URL");
    }
    for (source, base_url) in sources {
        let client = HttpSourceClient::new(source, base_url.as_str(), crawl_settings.fetch_timeout)?;
        tracing::info!(source = %source, base_url = %base_url, "Source enabled");
        let crawler = Crawler::new(Arc::new(client), pipeline.clone(), crawl_settings.clone());
        crawlers.insert(source, crawler.handle());
        supervisor.spawn(format!("crawler:{}", source), move |cancel| crawler.run(cancel));
    }

    // HTTP delivery layer
    let state = AppState::new(
        store.clone(),
        store.clone(),
        cache,
        crawlers,
        config.public_url.clone(),
    );
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    tracing::info!(addr = %config.http_addr, "HTTP server listening");
    supervisor.spawn("http", move |cancel| async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        Ok::<(), anyhow::Error>(())
    });

    // Run until Ctrl+C, then stop every task
    let report = supervisor
        .run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Received shutdown signal, stopping gracefully..."),
                Err(e) => {
                    tracing::error!(error = %e, "Cannot listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;

    tracing::info!(
        finished = report.finished.len(),
        failed = report.failed.len(),
        aborted = report.aborted,
        "Herald stopped."
    );
    Ok(())
}
