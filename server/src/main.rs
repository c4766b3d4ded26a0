mod cli;
mod config;
mod routes;
mod state;

use std::sync::Arc;

use anyhow::Context;
use api::{auth::AuthGateState, server::LayerConfig};
use cli::{Args, Command, PlanSyncArgs, RunArgs};
use config::Config;
use runtime::notify_once::NotifyOnce;
use state::AppState;
use tracing::info;

/// A synchronous `main` that builds its own tokio runtime by hand, so
/// [`Config::load`]'s `set_var` calls happen before any other thread exists.
fn main() -> anyhow::Result<()> {
    let args = argh::from_env::<Args>();
    match args.cmd {
        Command::Run(run_args) => run(run_args),
        Command::PlanSync(plan_sync_args) => plan_sync(plan_sync_args),
    }
}

fn run(run_args: RunArgs) -> anyhow::Result<()> {
    // SAFETY: no other thread has been spawned yet.
    let config = unsafe { Config::load(run_args.config.as_deref(), &run_args) }
        .context("failed to load configuration")?;
    telemetry::init(config.log_format);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    rt.block_on(run_server(config))
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let pool = db::connect(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;

    let bind_addr = config.bind_addr;
    let auth = AuthGateState::new(config.jwt_hmac_secret.as_bytes());
    let state = Arc::new(AppState::new(pool, &config));
    let router = routes::build_router(state, auth);

    let shutdown = NotifyOnce::new();
    let shutdown_sender = shutdown.clone();
    let ctrl_c = runtime::task::Task::spawn("ctrl-c-listener", async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, shutting down");
            shutdown_sender.send();
        }
    });
    ctrl_c.detach();

    let (server_fut, server_url) = api::server::build_server_fut(
        bind_addr,
        router,
        LayerConfig::default(),
        "server",
        tracing::info_span!("server"),
        shutdown,
    )
    .context("failed to build server future")?;

    info!("Listening on {server_url}");
    server_fut.await;
    Ok(())
}

fn plan_sync(args: PlanSyncArgs) -> anyhow::Result<()> {
    // SAFETY: no other thread has been spawned yet.
    let config = unsafe { Config::load(args.config.as_deref(), &default_run_args()) }
        .context("failed to load configuration")?;
    telemetry::init(config.log_format);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    rt.block_on(run_plan_sync(config, args))
}

async fn run_plan_sync(config: Config, args: PlanSyncArgs) -> anyhow::Result<()> {
    let pool = db::connect(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;

    let stripe_report = plan_sync::sync_provider_catalog(&pool, "stripe", &config.stripe)
        .await
        .context("failed to sync stripe catalog")?;
    info!(upserted = stripe_report.upserted, "synced stripe plan catalog");

    let removed = plan_sync::deactivate_missing(&pool, "stripe", &stripe_report.price_ids)
        .await
        .context("failed to deactivate stale stripe plans")?;
    info!(removed, "deactivated stale stripe plans");

    if let Some(path) = args.tokenization_plan_file.as_deref() {
        let toss_report = plan_sync::sync_yaml_catalog(&pool, "toss", path)
            .await
            .context("failed to sync toss catalog")?;
        info!(upserted = toss_report.upserted, "synced toss plan catalog");

        let removed = plan_sync::deactivate_missing(&pool, "toss", &toss_report.price_ids)
            .await
            .context("failed to deactivate stale toss plans")?;
        info!(removed, "deactivated stale toss plans");
    }

    Ok(())
}

/// `plan-sync` only needs `--config`; the rest of [`RunArgs`] doesn't apply
/// to a one-shot CLI invocation, so a default stands in for `Config::load`'s
/// signature.
fn default_run_args() -> RunArgs {
    RunArgs {
        config: None,
        bind_addr: None,
        json_logs: false,
    }
}
