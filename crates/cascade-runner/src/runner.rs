//! Runner implementation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cascade_bus::{
    BusClient, BusError, MessageBundle, Publication, SequenceHandler, CHANNEL_REQUEST,
};
use cascade_dsl::{eval_rules, CallBlock, OnBlock, BUNDLE_RULES_KEY};

use crate::error::RunnerError;

/// The slice of the bus a runner needs.
///
/// [`BusClient`] implements it; tests substitute a recording stub.
#[async_trait]
pub trait RunnerBus: Send + Sync {
    async fn publish(&self, payload: Bytes, tokens: &[&str]) -> Result<Publication, BusError>;

    async fn consume_sequences(
        &self,
        cancel: &CancellationToken,
        handler: &dyn SequenceHandler,
    ) -> Result<(), BusError>;
}

#[async_trait]
impl RunnerBus for BusClient {
    async fn publish(&self, payload: Bytes, tokens: &[&str]) -> Result<Publication, BusError> {
        BusClient::publish(self, payload, tokens).await
    }

    async fn consume_sequences(
        &self,
        cancel: &CancellationToken,
        handler: &dyn SequenceHandler,
    ) -> Result<(), BusError> {
        BusClient::consume_sequences(self, cancel, handler).await
    }
}

/// Evaluates rules over sequence bundles and dispatches the matched calls.
pub struct Runner {
    bus: Arc<dyn RunnerBus>,
    rules: hcl::Body,
}

impl Runner {
    #[must_use]
    pub fn new(bus: Arc<dyn RunnerBus>, rules: hcl::Body) -> Self {
        Self { bus, rules }
    }

    /// Consume sequences until the token is cancelled.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), RunnerError> {
        self.bus
            .consume_sequences(cancel, self)
            .await
            .map_err(RunnerError::Bus)
    }

    /// Rule body to evaluate for this sequence.
    ///
    /// A bundle may carry an inline rule body under the reserved key; that
    /// override is not supported yet and the loaded rules are always used.
    fn sequence_rules(&self, bundle: &MessageBundle) -> &hcl::Body {
        if bundle.contains_key(BUNDLE_RULES_KEY) {
            debug!("Bundle carries an inline rule body, using the loaded rules");
        }

        &self.rules
    }

    /// Fan out one `on` block's calls concurrently and join the failures.
    async fn dispatch_calls(&self, on: &OnBlock, sequence_id: &str) -> Result<(), RunnerError> {
        info!(on = %on.slug, calls = on.calls.len(), "Running on calls");

        let mut handles = Vec::with_capacity(on.calls.len());
        for call in &on.calls {
            let bus = Arc::clone(&self.bus);
            let call = call.clone();
            let sequence_id = sequence_id.to_string();
            handles.push(tokio::spawn(dispatch_call(bus, call, sequence_id)));
        }

        let mut errors = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(err) => errors.push(RunnerError::Join(err.to_string())),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RunnerError::OnFailed {
                on: on.slug.clone(),
                errors,
            })
        }
    }
}

#[async_trait]
impl SequenceHandler for Runner {
    async fn on_sequence(
        &self,
        _cancel: &CancellationToken,
        sequence_id: &str,
        bundle: MessageBundle,
    ) -> anyhow::Result<()> {
        let rules = self.sequence_rules(&bundle);
        let matched = eval_rules(rules, &bundle).map_err(RunnerError::Rules)?;

        debug!(sequence_id = %sequence_id, ons = matched.ons.len(), "Rule set evaluated");

        let mut failures = Vec::new();
        for on in &matched.ons {
            if let Err(err) = self.dispatch_calls(on, sequence_id).await {
                failures.push(err);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RunnerError::Sequence(failures).into())
        }
    }
}

/// Publish one call to its request subject.
///
/// The subject is deterministic from the rule text and sequence, so a
/// redelivered trigger republishes identical subjects and the broker's
/// per-subject fence absorbs them.
async fn dispatch_call(
    bus: Arc<dyn RunnerBus>,
    call: CallBlock,
    sequence_id: String,
) -> Result<(), RunnerError> {
    let Some((app, handler)) = call.task_type.split_once('_') else {
        return Err(RunnerError::MalformedTaskType {
            call: call.name.clone(),
            task_type: call.task_type.clone(),
        });
    };

    let publication = bus
        .publish(
            Bytes::from(call.inputs.clone()),
            &[CHANNEL_REQUEST, &sequence_id, &call.slug, app, handler],
        )
        .await?;

    if publication.was_sent() {
        info!(call = %call.slug, "Dispatched call");
    } else {
        debug!(call = %call.slug, "Call already dispatched");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubBus {
        published: Mutex<Vec<(String, Bytes)>>,
    }

    #[async_trait]
    impl RunnerBus for StubBus {
        async fn publish(
            &self,
            payload: Bytes,
            tokens: &[&str],
        ) -> Result<Publication, BusError> {
            self.published
                .lock()
                .unwrap()
                .push((tokens.join("."), payload));
            Ok(Publication::Duplicate)
        }

        async fn consume_sequences(
            &self,
            _cancel: &CancellationToken,
            _handler: &dyn SequenceHandler,
        ) -> Result<(), BusError> {
            Ok(())
        }
    }

    fn bundle(event: &str) -> MessageBundle {
        let mut bundle = MessageBundle::new();
        bundle.insert("event".to_string(), Bytes::from(event.as_bytes().to_vec()));
        bundle
    }

    #[tokio::test]
    async fn test_dispatches_matched_calls() {
        let rules = hcl::parse(
            r#"
            on push {
              call github_tag {
                inputs = { ref = "v1" }
              }
            }
            "#,
        )
        .unwrap();
        let bus = Arc::new(StubBus::default());
        let runner = Runner::new(bus.clone(), rules);

        runner
            .on_sequence(
                &CancellationToken::new(),
                "SEQ",
                bundle(r#"{"type":"push"}"#),
            )
            .await
            .unwrap();

        let published = bus.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "request.SEQ.push0-github_tag.github.tag");

        let inputs: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(inputs, serde_json::json!({"ref": "v1"}));
    }

    #[tokio::test]
    async fn test_malformed_task_type_does_not_block_siblings() {
        let rules = hcl::parse(
            r#"
            on push {
              call broken {}
              call github_tag {}
            }
            "#,
        )
        .unwrap();
        let bus = Arc::new(StubBus::default());
        let runner = Runner::new(bus.clone(), rules);

        let err = runner
            .on_sequence(
                &CancellationToken::new(),
                "SEQ",
                bundle(r#"{"type":"push"}"#),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("broken"));

        // The healthy sibling was still dispatched.
        let published = bus.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "request.SEQ.push0-github_tag.github.tag");
    }

    #[tokio::test]
    async fn test_non_matching_sequence_dispatches_nothing() {
        let rules = hcl::parse("on deploy { call k8s_apply {} }").unwrap();
        let bus = Arc::new(StubBus::default());
        let runner = Runner::new(bus.clone(), rules);

        runner
            .on_sequence(
                &CancellationToken::new(),
                "SEQ",
                bundle(r#"{"type":"push"}"#),
            )
            .await
            .unwrap();

        assert!(bus.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inline_rule_body_is_ignored() {
        let rules = hcl::parse("on push { call github_tag {} }").unwrap();
        let bus = Arc::new(StubBus::default());
        let runner = Runner::new(bus.clone(), rules);

        let mut state = bundle(r#"{"type":"push"}"#);
        state.insert(
            BUNDLE_RULES_KEY.to_string(),
            Bytes::from_static(b"on deploy { call k8s_apply {} }"),
        );

        runner
            .on_sequence(&CancellationToken::new(), "SEQ", state)
            .await
            .unwrap();

        let published = bus.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "request.SEQ.push0-github_tag.github.tag");
    }
}
