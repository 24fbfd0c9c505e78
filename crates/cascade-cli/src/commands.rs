//! Subcommand implementations.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use cascade_bus::{BusClient, KeyFile};
use cascade_dsl::read_rule_files;
use cascade_runner::Runner;
use cascade_worker::Worker;

use crate::echo::EchoApp;
use crate::httpserver;

/// Run the orchestration server until cancelled.
pub async fn start(
    keyfile: &KeyFile,
    rules_path: &Path,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let rules = read_rule_files(rules_path)?;
    info!(hash = %rules.hash, files = rules.files.len(), "Loaded rule files");

    let client = Arc::new(BusClient::notify(keyfile.nats_url(), keyfile.account_id()).await?);
    let runner = Runner::new(client.clone(), rules.body);

    let result = runner.run(&cancel).await;
    client.close().await?;
    result.map_err(Into::into)
}

/// Serve the console HTTP API until cancelled.
pub async fn console(
    keyfile: &KeyFile,
    address: &str,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let client = Arc::new(BusClient::notify(keyfile.nats_url(), keyfile.account_id()).await?);

    httpserver::serve(address, client.clone(), cancel).await?;
    client.close().await?;
    Ok(())
}

/// Run a worker for one app until cancelled.
pub async fn worker(
    keyfile: &KeyFile,
    app_name: &str,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let client = Arc::new(
        BusClient::worker(keyfile.nats_url(), keyfile.account_id(), app_name).await?,
    );

    let app = EchoApp::new(client.clone());
    let worker = Worker::new(client.clone(), &app);

    let result = worker.run(&cancel).await;
    client.close().await?;
    result.map_err(Into::into)
}

/// Replay a stored sequence and run the rules over it.
pub async fn replay(
    keyfile: &KeyFile,
    sequence_id: &str,
    rules_path: &Path,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let rules = read_rule_files(rules_path)?;

    let (client, replay_sequence_id) =
        BusClient::replay(keyfile.nats_url(), keyfile.account_id(), sequence_id).await?;
    let client = Arc::new(client);
    info!(
        sequence_id = %sequence_id,
        replay_sequence_id = %replay_sequence_id,
        "Replaying sequence"
    );

    let runner = Runner::new(client.clone(), rules.body);

    let result = runner.run(&cancel).await;
    client.close().await?;
    result.map_err(Into::into)
}
