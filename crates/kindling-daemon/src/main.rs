mod config;
mod local;
mod logging;

use std::sync::Arc;

use anyhow::Context;
use kindling_prekeys::{
    MessageProcessingState, PniIdentityKeyIssueFlag, PreKeyContext, PreKeyManager, SystemClock,
};
use kindling_service::HttpAccountServiceClient;
use kindling_store::KeyDatabase;

use config::DaemonConfig;
use local::{Headless, StoredAccountState};

/// Command-line arguments for the daemon.
struct Args {
    config_path: Option<String>,
    db_path: Option<String>,
    once: bool,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut db_path = None;
    let mut once = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next(),
            "--db" => db_path = args.next(),
            "--once" => once = true,
            other => eprintln!("ignoring unknown argument {other:?}"),
        }
    }

    Args {
        config_path,
        db_path,
        once,
    }
}

fn load_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = match &args.config_path {
        Some(path) => {
            let mut config = DaemonConfig::from_file(path)
                .with_context(|| format!("failed to load config from {path}"))?;
            config.apply_env()?;
            config
        }
        None => DaemonConfig::from_env()?,
    };
    if let Some(db_path) = &args.db_path {
        config.store.database_path = db_path.into();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();
    let config = load_config(&args)?;
    logging::init(&config.logging)?;
    tracing::info!("kindling-daemon starting");

    if let Some(parent) = config.store.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }
    let db = KeyDatabase::open(&config.store.database_path).context("failed to open key database")?;

    let service = HttpAccountServiceClient::new(
        config.service.base_url.clone(),
        config.service.credentials(),
        config.service.request_timeout,
    )?;

    let context = PreKeyContext {
        db: db.clone(),
        service: Arc::new(service),
        // No decryption pipeline runs here, so processing is always complete
        message_processor: Arc::new(MessageProcessingState::new(true)),
        account: Arc::new(StoredAccountState::new(db.clone())),
        app: Arc::new(Headless),
        pni_key_manager: Arc::new(PniIdentityKeyIssueFlag::new(db)),
        clock: Arc::new(SystemClock),
        config: config.pre_keys.clone(),
    };
    let manager = PreKeyManager::new(context);

    tracing::info!(
        db = %config.store.database_path.display(),
        service = %config.service.base_url,
        interval = ?config.check_interval,
        "kindling-daemon ready"
    );

    if args.once {
        run_check(&manager).await;
        manager.shutdown();
        return Ok(());
    }

    let mut interval = tokio::time::interval(config.check_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => run_check(&manager).await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl-C");
                break;
            }
        }
    }

    tracing::info!("kindling-daemon shutting down");
    manager.shutdown();
    Ok(())
}

/// One health-check pass. Failures are logged; the next tick retries.
async fn run_check(manager: &PreKeyManager) {
    if let Err(e) = manager.check_pre_keys_if_necessary().await {
        tracing::warn!(error = %e, "pre-key check failed");
    }
    match manager.is_app_locked_due_to_pre_key_update_failures() {
        Ok(true) => {
            tracing::warn!("sending is locked due to pre-key update failures, rotating");
            if let Err(e) = manager.rotate_signed_pre_keys_if_needed().await {
                tracing::warn!(error = %e, "signed pre-key rotation failed");
            }
        }
        Ok(false) => tracing::debug!("pre-keys healthy"),
        Err(e) => tracing::error!(error = %e, "failed to evaluate pre-key health"),
    }
}
