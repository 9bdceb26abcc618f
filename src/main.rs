#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use sweepserv::api::{self, AppState};
use sweepserv::cleaner::Cleaner;
use sweepserv::config::Config;
use sweepserv::loops::{self, LoopContext};
use sweepserv::metrics::ServiceMetrics;
use sweepserv::queue::Queues;
use sweepserv::roomlist;
use sweepserv::router::RouterClient;
use sweepserv::sessions::SessionCache;
use sweepserv::synapse::AdminClient;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code used when repeated interrupts force an unclean shutdown.
const FORCE_QUIT_EXIT_CODE: i32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    let default_filter = if config.debug {
        "sweepserv=debug"
    } else {
        "sweepserv=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("sweepserv - Starting bridge room cleanup service");
    if config.dry_run {
        warn!("Running in dry run mode, no rooms will actually be cleaned up");
    } else {
        info!("Running in destructive mode");
    }
    if !config.postpone_deletion.is_zero() {
        info!(
            "Room deletion is postponed by {:?} after queueing",
            config.postpone_deletion
        );
    }

    let http = reqwest::Client::new();
    let admin = match &config.admin_access_token {
        Some(token) => AdminClient::new(
            http.clone(),
            &config.synapse_url,
            token.clone(),
            config.dry_run,
        )?,
        None => {
            let (Some(username), Some(password)) = (&config.admin_username, &config.admin_password)
            else {
                bail!("no admin credentials configured");
            };
            info!("Logging in to the admin API as {}", username);
            AdminClient::login_with_password(
                http.clone(),
                &config.synapse_url,
                username,
                password,
                config.dry_run,
            )
            .await?
        }
    };
    let admin = Arc::new(admin);

    let metrics = ServiceMetrics::new();
    let queues = match &config.redis_url {
        Some(url) => {
            info!("Using redis-backed queues");
            Queues::redis(url, config.dry_run, metrics.clone()).await?
        }
        None => {
            info!("Using in-memory queues");
            Queues::in_memory(metrics.clone())
        }
    };

    let sessions = Arc::new(SessionCache::new(
        admin.clone(),
        http.clone(),
        &config.synapse_url,
    )?);
    let router = RouterClient::from_config(&config, http.clone())?.map(Arc::new);
    let db = roomlist::connect_router_db(config.router_database_url.as_deref()).await?;

    let cancel = CancellationToken::new();
    let ctx = LoopContext {
        admin: admin.clone(),
        sessions,
        queues: queues.clone(),
        router,
        metrics: metrics.clone(),
        postpone: config.postpone_deletion,
        queue_sleep: config.queue_sleep,
        dry_run: config.dry_run,
    };
    let leave_loop = tokio::spawn(loops::leave_loop(ctx.clone(), cancel.clone()));
    let delete_loop = tokio::spawn(loops::delete_loop(ctx, cancel.clone()));

    let state = AppState {
        cleaner: Cleaner {
            admin,
            queues: queues.clone(),
            db,
            worker_count: config.worker_count,
        },
        queues,
        metrics,
        http,
        cancel: cancel.clone(),
        config: Arc::new(config.clone()),
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_address).await?;
    info!("Listening on {}", config.listen_address);

    let sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(watch_signals(sigterm, cancel.clone()));

    axum::serve(
        listener,
        api::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let cancel = cancel.clone();
        async move { cancel.cancelled().await }
    })
    .await?;

    leave_loop.await?;
    delete_loop.await?;
    info!("Shutdown complete");
    Ok(())
}

/// First interrupt triggers a graceful shutdown; the third one force quits.
async fn watch_signals(mut sigterm: tokio::signal::unix::Signal, cancel: CancellationToken) {
    let mut interrupts = 0u32;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        interrupts += 1;
        match interrupts {
            1 => {
                info!("Received interrupt, shutting down...");
                cancel.cancel();
            }
            2 => warn!("Received second interrupt, interrupt once more to force quit"),
            _ => {
                error!("Received third interrupt, force quitting");
                std::process::exit(FORCE_QUIT_EXIT_CODE);
            }
        }
    }
}
