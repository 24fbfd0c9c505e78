//! Worker loop implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cascade_bus::{BusClient, BusError, MsgMeta, ResultMsg};

/// A unit of work exposed by an app.
///
/// Handlers publish their own success payloads; returning an error makes the
/// worker publish a FAILURE result on the handler's behalf.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        cancel: &CancellationToken,
        msg: Arc<jetstream::Message>,
    ) -> anyhow::Result<()>;
}

/// An app is a named set of handlers.
pub trait App: Send + Sync {
    fn handlers(&self) -> HashMap<String, Arc<dyn Handler>>;
}

/// Consumes request messages for one app and runs its handlers.
pub struct Worker {
    client: Arc<BusClient>,
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Worker {
    #[must_use]
    pub fn new(client: Arc<BusClient>, app: &dyn App) -> Self {
        Self {
            client,
            handlers: app.handlers(),
        }
    }

    /// Consume requests until the token is cancelled.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), BusError> {
        let ack_wait = self.client.ack_wait();

        info!("Listening for requests");

        self.client
            .consume(cancel, |msg| self.process(cancel, msg, ack_wait))
            .await
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        msg: jetstream::Message,
        ack_wait: Duration,
    ) {
        let subject = msg.subject.clone();
        info!(subject = %subject, "Received request");

        let meta = match MsgMeta::parse(self.client.account_id(), &msg) {
            Ok(meta) => meta,
            Err(err) => {
                error!(error = %err, subject = %subject, "Unable to handle request message");
                nak(&msg).await;
                return;
            }
        };

        // Nothing can be done for a handler this worker does not have; the
        // binding is misconfigured, so retrying is pointless.
        let handler = match meta.handler_name().and_then(|name| self.handlers.get(name)) {
            Some(handler) => Arc::clone(handler),
            None => {
                warn!(handler = ?meta.handler_name(), subject = %subject, "Unknown handler call");
                if let Err(err) = msg.ack_with(AckKind::Term).await {
                    warn!(error = %err, "Unable to terminate request message");
                }
                return;
            }
        };

        let started_at = Utc::now();
        let msg = Arc::new(msg);

        if let Err(err) = run_handler(cancel, &msg, handler, ack_wait).await {
            error!(error = %err, subject = %subject, "Failed to handle request");

            let result = ResultMsg::failure(started_at, err.to_string());
            let response_subject = meta.response_subject();
            if let Err(publish_err) = self
                .client
                .publish_result(&result, &[response_subject.as_str()])
                .await
            {
                error!(error = %publish_err, subject = %subject, "Unable to send reply to request message");
                nak(&msg).await;
                return;
            }
        }

        // Have the broker confirm the ack before moving on, so a crash here
        // cannot lose it.
        if let Err(err) = msg.double_ack().await {
            error!(error = %err, subject = %subject, "Unable to acknowledge request message");
            nak(&msg).await;
            return;
        }

        debug!(subject = %subject, "Request message acknowledged");
    }
}

/// Run a handler while keeping the request's redelivery window extended.
///
/// In-progress signals fire immediately and then every two thirds of the
/// ack window, so extensions always land before the broker redelivers. A
/// failed extension is a handler failure.
async fn run_handler(
    cancel: &CancellationToken,
    msg: &Arc<jetstream::Message>,
    handler: Arc<dyn Handler>,
    ack_wait: Duration,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(ack_wait - ack_wait / 3);

    let work = handler.handle(cancel, Arc::clone(msg));
    tokio::pin!(work);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                msg.ack_with(AckKind::Progress)
                    .await
                    .map_err(|err| anyhow::anyhow!("unable to extend ack deadline: {err}"))?;
            }
            result = &mut work => return result,
        }
    }
}

async fn nak(msg: &jetstream::Message) {
    if let Err(err) = msg.ack_with(AckKind::Nak(None)).await {
        warn!(error = %err, subject = %msg.subject, "Unable to nak request message");
    }
}
