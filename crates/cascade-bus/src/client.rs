//! Broker client with JetStream and one role-specific consumer.
//!
//! Provides:
//! - Connection management with auto-reconnect and drain on close
//! - Notify, replay, and worker consumer roles
//! - Duplicate-fenced publishing
//! - Sequence aggregation via ordered history reads

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_nats::jetstream::consumer::{pull, DeliverPolicy};
use async_nats::jetstream::publish::PublishAck;
use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_nats::ConnectOptions;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::BusError;
use crate::message::MsgMeta;
use crate::result::ResultMsg;
use crate::subjects::{self, CHANNEL_NOTIFY, CHANNEL_REQUEST, SOURCE_EVENT_ID};

const MAX_RECONNECTS: usize = 5;
const RECONNECT_WAIT: Duration = Duration::from_secs(1);
const WORKER_ACK_WAIT: Duration = Duration::from_secs(60);
const NAK_DELAY: Duration = Duration::from_secs(3);
const BUNDLE_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Aggregate state of a sequence: message id to payload.
///
/// Passed to a sequence handler so it sees every message of a workflow run,
/// not just the one that triggered the delivery.
pub type MessageBundle = HashMap<String, Bytes>;

/// Callback contract for aggregated sequence deliveries.
///
/// The runner implements this; tests substitute stubs.
#[async_trait]
pub trait SequenceHandler: Send + Sync {
    async fn on_sequence(
        &self,
        cancel: &CancellationToken,
        sequence_id: &str,
        bundle: MessageBundle,
    ) -> anyhow::Result<()>;
}

/// Outcome of a publish attempt.
///
/// A publish rejected by the broker's per-subject fence is not an error:
/// some other process already won that subject, which is the intended
/// idempotence behaviour.
#[derive(Debug)]
pub enum Publication {
    /// The broker accepted and stored the message.
    Sent(PublishAck),
    /// The per-subject fence dropped the message.
    Duplicate,
}

impl Publication {
    #[must_use]
    pub fn was_sent(&self) -> bool {
        matches!(self, Self::Sent(_))
    }
}

/// Broker client owning the connection, JetStream context, and one consumer.
pub struct BusClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream: stream::Stream,
    consumer: consumer::Consumer<pull::Config>,
    account_id: String,
}

impl BusClient {
    /// Attach to the account's durable notify consumer.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConsumerMissing`] when the consumer has not been
    /// provisioned. Provisioning is external.
    pub async fn notify(url: &str, account_id: &str) -> Result<Self, BusError> {
        let (client, jetstream, stream) = connect(url, account_id).await?;

        let name = format!("{account_id}-{CHANNEL_NOTIFY}");
        let consumer = stream
            .get_consumer::<pull::Config>(&name)
            .await
            .map_err(|err| BusError::ConsumerMissing(format!("{name}: {err}")))?;

        Ok(Self {
            client,
            jetstream,
            stream,
            consumer,
            account_id: account_id.to_string(),
        })
    }

    /// Re-run a stored sequence under a fresh replay id.
    ///
    /// Fetches the sequence's retained source event, mints a replay sequence
    /// id, creates a named ephemeral consumer filtered to that id, and
    /// publishes the source event under it so the consumer delivers a fresh
    /// execution. Returns the client and the minted id.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ReplaySourceMissing`] when the sequence has no
    /// retained source event.
    pub async fn replay(
        url: &str,
        account_id: &str,
        sequence_id: &str,
    ) -> Result<(Self, String), BusError> {
        let (client, jetstream, stream) = connect(url, account_id).await?;

        let source_subject = subjects::source_event(account_id, sequence_id);
        let source = stream
            .get_last_raw_message_by_subject(&source_subject)
            .await
            .map_err(|err| BusError::ReplaySourceMissing(format!("{source_subject}: {err}")))?;
        let payload = BASE64
            .decode(&source.payload)
            .map_err(|err| BusError::Encode(format!("source event payload: {err}")))?;

        let replay_sequence_id = format!("replay-{}", &Uuid::new_v4().to_string()[..20]);

        let config = pull::Config {
            name: Some(replay_sequence_id.clone()),
            description: Some(format!("Replay request for sequence '{sequence_id}'")),
            filter_subject: subjects::sequence_filter(account_id, &replay_sequence_id),
            deliver_policy: DeliverPolicy::All,
            ..Default::default()
        };
        let consumer = stream
            .create_consumer(config)
            .await
            .map_err(|err| BusError::ConsumerSetup(err.to_string()))?;

        let bus = Self {
            client,
            jetstream,
            stream,
            consumer,
            account_id: account_id.to_string(),
        };

        bus.publish(payload, &[CHANNEL_NOTIFY, &replay_sequence_id, SOURCE_EVENT_ID])
            .await?;
        info!(replay_sequence_id = %replay_sequence_id, "Seeded replay sequence");

        Ok((bus, replay_sequence_id))
    }

    /// Create or update the durable request consumer for one app's worker.
    pub async fn worker(url: &str, account_id: &str, app_name: &str) -> Result<Self, BusError> {
        let (client, jetstream, stream) = connect(url, account_id).await?;

        // Workers come and go, so their consumers are created on demand.
        let name = format!("{account_id}-{CHANNEL_REQUEST}-{app_name}");
        let config = pull::Config {
            name: Some(name.clone()),
            durable_name: Some(name),
            filter_subject: subjects::worker_filter(account_id, app_name),
            ack_wait: WORKER_ACK_WAIT,
            ..Default::default()
        };
        let consumer = stream
            .create_consumer(config)
            .await
            .map_err(|err| BusError::ConsumerSetup(err.to_string()))?;

        Ok(Self {
            client,
            jetstream,
            stream,
            consumer,
            account_id: account_id.to_string(),
        })
    }

    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    /// Ack window of the installed consumer.
    #[must_use]
    pub fn ack_wait(&self) -> Duration {
        self.consumer.cached_info().config.ack_wait
    }

    /// Flush pending publishes and close the connection.
    pub async fn close(&self) -> Result<(), BusError> {
        self.client
            .drain()
            .await
            .map_err(|err| BusError::DrainFailed(err.to_string()))
    }

    /// Publish a payload at the subject built from `tokens`.
    ///
    /// Single pre-dotted tokens pass through as-is; otherwise tokens are
    /// joined with the account prepended. A rejection by the broker's
    /// per-subject fence returns `Ok(Publication::Duplicate)`; all other
    /// errors propagate.
    pub async fn publish(
        &self,
        payload: impl Into<Bytes>,
        tokens: &[&str],
    ) -> Result<Publication, BusError> {
        let subject = subjects::publish_subject(&self.account_id, tokens);

        let acked = match self.jetstream.publish(subject.clone(), payload.into()).await {
            Ok(ack_future) => ack_future.await,
            Err(err) => Err(err),
        };

        match acked {
            Ok(ack) => {
                debug!(subject = %subject, "Message sent");
                Ok(Publication::Sent(ack))
            }
            Err(err) if is_duplicate_fence(&err) => {
                debug!(subject = %subject, "Skipping duplicate message");
                Ok(Publication::Duplicate)
            }
            Err(err) => Err(BusError::PublishFailed(err.to_string())),
        }
    }

    /// JSON-encode a result message and publish it.
    pub async fn publish_result(
        &self,
        result: &ResultMsg,
        tokens: &[&str],
    ) -> Result<Publication, BusError> {
        let payload =
            serde_json::to_vec(result).map_err(|err| BusError::Encode(err.to_string()))?;
        self.publish(payload, tokens).await
    }

    /// Consume messages from the installed consumer.
    ///
    /// Callbacks run serially on this task. Blocks until the token is
    /// cancelled, completing the in-flight callback first.
    pub async fn consume<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut callback: F,
    ) -> Result<(), BusError>
    where
        F: FnMut(jetstream::Message) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut messages = self
            .consumer
            .messages()
            .await
            .map_err(|err| BusError::ConsumerSetup(err.to_string()))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = messages.next() => match next {
                    Some(Ok(msg)) => callback(msg).await,
                    Some(Err(err)) => warn!(error = %err, "Consumer stream error"),
                    None => break,
                },
            }
        }

        Ok(())
    }

    /// Consume whole sequences instead of individual messages.
    ///
    /// Each delivery is parsed, its sequence history aggregated into a
    /// bundle, and the bundle handed to `handler`. Unparseable messages are
    /// terminated as poison; aggregation and handler failures are nak'd for
    /// redelivery after a short delay.
    pub async fn consume_sequences(
        &self,
        cancel: &CancellationToken,
        handler: &dyn SequenceHandler,
    ) -> Result<(), BusError> {
        self.consume(cancel, |msg| self.process_sequence_message(cancel, handler, msg))
            .await
    }

    async fn process_sequence_message(
        &self,
        cancel: &CancellationToken,
        handler: &dyn SequenceHandler,
        msg: jetstream::Message,
    ) {
        let meta = match MsgMeta::parse(&self.account_id, &msg) {
            Ok(meta) => meta,
            Err(err) => {
                // A message that cannot be parsed will never parse on
                // redelivery either.
                error!(error = %err, subject = %msg.subject, "Unable to parse message");
                if let Err(err) = msg.ack_with(AckKind::Term).await {
                    warn!(error = %err, "Unable to terminate message");
                }
                return;
            }
        };

        let bundle = match self.fetch_message_bundle(cancel, &meta).await {
            Ok(bundle) => bundle,
            Err(err) => {
                error!(error = %err, sequence_id = %meta.sequence_id, "Unable to fetch message bundle");
                nak_with_delay(&msg).await;
                return;
            }
        };

        if let Err(err) = handler.on_sequence(cancel, &meta.sequence_id, bundle).await {
            error!(error = %err, sequence_id = %meta.sequence_id, "Failed to process sequence");
            nak_with_delay(&msg).await;
            return;
        }

        if let Err(err) = msg.ack().await {
            warn!(error = %err, subject = %msg.subject, "Unable to acknowledge message");
        }
    }

    /// Read back every retained message of `new_msg`'s sequence, up to and
    /// including `new_msg` itself.
    ///
    /// An ordered deliver-all consumer gives a single linearised view of the
    /// sequence, so the bundle is a well-defined prefix even while producers
    /// keep appending.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::BundleOverrun`] when the history read passes the
    /// triggering message's stream sequence without finding it: the message
    /// vanished from the stream, or the correlation is wrong.
    pub async fn fetch_message_bundle(
        &self,
        cancel: &CancellationToken,
        new_msg: &MsgMeta,
    ) -> Result<MessageBundle, BusError> {
        let config = pull::OrderedConfig {
            filter_subjects: vec![new_msg.sequence_filter()],
            deliver_policy: DeliverPolicy::All,
            ..Default::default()
        };
        let history = self
            .stream
            .create_consumer(config)
            .await
            .map_err(|err| BusError::BundleFetch(err.to_string()))?;

        let mut messages = history
            .messages()
            .await
            .map_err(|err| BusError::BundleFetch(err.to_string()))?;

        let mut bundle = MessageBundle::new();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(BusError::BundleFetch("cancelled".to_string())),
                next = timeout(BUNDLE_READ_TIMEOUT, messages.next()) => next,
            };

            let msg = match next {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(err))) => return Err(BusError::BundleFetch(err.to_string())),
                Ok(None) => {
                    return Err(BusError::BundleFetch(
                        "history ended before the triggering message".to_string(),
                    ))
                }
                Err(_) => {
                    return Err(BusError::BundleFetch(format!(
                        "no message within {}s",
                        BUNDLE_READ_TIMEOUT.as_secs()
                    )))
                }
            };

            let meta = MsgMeta::parse(&self.account_id, &msg)?;

            if meta.stream_sequence > new_msg.stream_sequence {
                return Err(BusError::BundleOverrun {
                    want: new_msg.stream_sequence,
                    have: meta.stream_sequence,
                });
            }

            bundle.insert(meta.message_id, msg.payload.clone());

            if meta.stream_sequence == new_msg.stream_sequence {
                break;
            }
        }

        Ok(bundle)
    }
}

async fn connect(
    url: &str,
    account_id: &str,
) -> Result<(async_nats::Client, jetstream::Context, stream::Stream), BusError> {
    info!(url = %url, account = %account_id, "Connecting to broker");

    let options = ConnectOptions::new()
        .retry_on_initial_connect()
        .max_reconnects(MAX_RECONNECTS)
        .reconnect_delay_callback(|_attempts| RECONNECT_WAIT)
        .event_callback(|event| async move { debug!(event = %event, "Connection event") });

    let client = async_nats::connect_with_options(url, options)
        .await
        .map_err(|err| BusError::ConnectFailed(err.to_string()))?;

    let jetstream = jetstream::new(client.clone());
    let stream = jetstream
        .get_stream(account_id)
        .await
        .map_err(|err| BusError::StreamMissing(format!("{account_id}: {err}")))?;

    Ok((client, jetstream, stream))
}

async fn nak_with_delay(msg: &jetstream::Message) {
    if let Err(err) = msg.ack_with(AckKind::Nak(Some(NAK_DELAY))).await {
        warn!(error = %err, subject = %msg.subject, "Unable to nak message");
    }
}

/// Detect the broker's per-subject fence rejection.
///
/// Matched by error code where the broker reports one, with the error text
/// as a fallback.
fn is_duplicate_fence(err: &impl std::fmt::Display) -> bool {
    let text = err.to_string();
    text.contains("10077") || text.contains("maximum messages per subject exceeded")
}
