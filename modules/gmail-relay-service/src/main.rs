//! Gmail Relay Service: receives Gmail Pub/Sub push notifications, resolves
//! them into new messages and forwards them to a webhook.
//!
//! Usage: `gmail-relay-service [serve|start|renew|stop|status]` (default `serve`).
//! Default listen address: http://127.0.0.1:8788/gmail-pubsub

mod auth;
mod config;
mod fetcher;
mod gmail_api;
mod gmail_types;
mod hook;
mod lifecycle;
mod push;
mod reconciler;
mod relay;
mod routes;
mod server;
mod store;

use auth::{JwtOidcVerifier, KeySource, OidcGate, PushAuthenticator};
use config::Config;
use fetcher::{FetchOptions, MessageFetcher};
use gmail_api::{GmailApi, GmailClient};
use hook::HookDispatcher;
use reconciler::{HistoryReconciler, ReconcileLimits};
use relay::{Relay, RelayOptions};
use routes::AppState;
use std::sync::Arc;
use std::time::Instant;
use store::WatchStore;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let verb = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("[GMAIL_RELAY] Invalid configuration: {}", e);
            eprintln!("gmail-relay-service: {}", e);
            std::process::exit(2);
        }
    };

    let result = match verb.as_str() {
        "serve" => serve(config).await,
        "start" => start(config).await,
        "renew" => renew(config).await,
        "stop" => stop(config).await,
        "status" => status(config),
        other => Err(format!(
            "unknown command '{}' (expected serve, start, renew, stop or status)",
            other
        )),
    };

    if let Err(e) = result {
        log::error!("[GMAIL_RELAY] {}", e);
        eprintln!("gmail-relay-service: {}", e);
        std::process::exit(1);
    }
}

fn open_store(config: &Config) -> Result<WatchStore, String> {
    WatchStore::open(&config.state_dir, &config.account).map_err(|e| {
        format!(
            "Failed to open watch state in {}: {}",
            config.state_dir.display(),
            e
        )
    })
}

fn gmail_client(config: &Config) -> Result<GmailClient, String> {
    let token = config
        .access_token
        .clone()
        .ok_or("GMAIL_ACCESS_TOKEN must be set")?;
    GmailClient::new(&config.api_base, token)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}

async fn start(config: Config) -> Result<(), String> {
    let store = open_store(&config)?;
    let api = gmail_client(&config)?;
    let state = lifecycle::start_watch(&api, &store, &config.watch, config.serve.hook.clone()).await?;
    print_json(&state)
}

async fn renew(config: Config) -> Result<(), String> {
    let store = open_store(&config)?;
    let api = gmail_client(&config)?;
    let state = lifecycle::renew_watch(&api, &store, &config.watch).await?;
    print_json(&state)
}

async fn stop(config: Config) -> Result<(), String> {
    let store = open_store(&config)?;
    let api = gmail_client(&config)?;
    let removed = lifecycle::stop_watch(&api, &store).await?;
    print_json(&serde_json::json!({ "account": config.account, "stopped": true, "stateRemoved": removed }))
}

fn status(config: Config) -> Result<(), String> {
    let store = open_store(&config)?;
    match lifecycle::watch_status(&store) {
        Some(status) => print_json(&status),
        None => Err(format!("No watch state for {}", config.account)),
    }
}

async fn serve(config: Config) -> Result<(), String> {
    let store = Arc::new(open_store(&config)?);
    let api: Arc<dyn GmailApi> = Arc::new(gmail_client(&config)?);
    let serve = &config.serve;

    if serve.save_hook {
        if let Some(hook) = serve.hook.clone() {
            match lifecycle::save_hook(&store, hook).await {
                Ok(_) => log::info!("[GMAIL_RELAY] Saved hook settings to watch state"),
                Err(e) => log::warn!("[GMAIL_RELAY] {}", e),
            }
        }
    }

    match store.get() {
        Some(state) => log::info!(
            "[GMAIL_RELAY] Watching {} from historyId {} ({})",
            state.account,
            state.history_id,
            store.path().display()
        ),
        None => log::warn!(
            "[GMAIL_RELAY] No watch state for {}; pushes are ignored until `start` runs",
            config.account
        ),
    }

    let oidc = if serve.oidc.enabled {
        if serve.oidc.expected_email.is_none() {
            log::warn!("[GMAIL_RELAY] OIDC enabled without GMAIL_RELAY_OIDC_EMAIL; any Google-signed token for this audience is accepted");
        }
        Some(OidcGate {
            verifier: Arc::new(JwtOidcVerifier::new(KeySource::Jwks(serve.oidc.jwks_url.clone()))),
            expected_email: serve.oidc.expected_email.clone(),
            audience: serve.oidc.audience.clone(),
        })
    } else {
        None
    };
    if !serve.has_auth() {
        log::warn!("[GMAIL_RELAY] No push authentication configured (loopback only)");
    }

    let relay = Relay::new(
        store.clone(),
        HistoryReconciler::new(
            api.clone(),
            store.clone(),
            ReconcileLimits {
                history_max_results: serve.history_max_results,
                resync_max_results: serve.resync_max_results,
            },
        ),
        MessageFetcher::new(api.clone(), &config.account),
        HookDispatcher::new(serve.hook_timeout),
        RelayOptions {
            hook: serve.hook.clone(),
            fetch_defaults: FetchOptions {
                include_body: serve.include_body,
                max_bytes: serve.max_bytes,
            },
            echo_payload: serve.echo_payload,
            ack_policy: serve.ack_policy,
        },
    );

    let state = Arc::new(AppState {
        relay,
        authenticator: PushAuthenticator::new(oidc, serve.shared_token.clone()),
        store: store.clone(),
        max_body_bytes: serve.max_body_bytes,
        start_time: Instant::now(),
    });
    let app = routes::build_router(state, &serve.path, serve.request_timeout);

    let addr = serve.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;
    log::info!(
        "[GMAIL_RELAY] Gmail Relay Service listening on http://{}{} (ack policy {:?})",
        addr,
        serve.path,
        serve.ack_policy
    );

    server::serve(listener, app, serve.header_timeout, shutdown_signal()).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("[GMAIL_RELAY] Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("[GMAIL_RELAY] Shutting down");
}
