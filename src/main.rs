use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rig_refinery::config::{RigConfig, Settings};
use rig_refinery::engineer::Engineer;
use rig_refinery::git::{CommitIdentity, GitRepo};
use rig_refinery::issues::FileStore;
use rig_refinery::mail::FileMailbox;
use rig_refinery::queue::MergeQueue;
use rig_refinery::runner::ShellRunner;
use rig_refinery::server::{AppState, build_router};
use rig_refinery::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rig_refinery=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env().context("invalid refinery environment")?;
    let rig = RigConfig::load(&settings.rig_path).with_context(|| {
        format!("failed to load rig config from {}", settings.rig_path.display())
    })?;

    let state_dir = settings.state_dir();
    let store = Arc::new(
        FileStore::open(state_dir.join("issues.json"), rig.issue_prefix.clone())
            .context("failed to open issue store")?,
    );
    let mailbox = Arc::new(FileMailbox::new(state_dir.join("mail")));
    let repo = GitRepo::new(
        settings.workdir.clone(),
        CommitIdentity::refinery(&rig.name),
        rig.merge_queue.git_timeout,
    );

    let queue = Arc::new(MergeQueue::new(
        store.clone(),
        rig.merge_queue.stale_claim_timeout,
    ));
    let engineer = Engineer::new(
        &rig,
        settings.workdir.clone(),
        repo.clone(),
        ShellRunner,
        store.clone(),
        store,
        mailbox,
    );

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(Worker::new(engineer, queue.clone()).run(shutdown.clone()));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                signal.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for interrupt"),
        }
    });

    let app = build_router(AppState::new(queue, repo));
    let listener = tokio::net::TcpListener::bind(settings.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen_addr))?;
    info!(
        addr = %settings.listen_addr,
        rig = %rig.name,
        workdir = %settings.workdir.display(),
        "listening"
    );

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await;
    shutdown.cancel();

    if let Err(e) = worker.await {
        error!(error = %e, "worker task failed");
    }
    served.context("server error")
}
