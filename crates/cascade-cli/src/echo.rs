//! Built-in echo app.
//!
//! Answers `echo_reply` calls with a SUCCESS result carrying the request
//! inputs back. Useful for exercising a pipeline end to end before real
//! apps are wired in.

use std::collections::HashMap;
use std::sync::Arc;

use async_nats::jetstream;
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use cascade_bus::{BusClient, MsgMeta, ResultMsg};
use cascade_worker::{App, Handler};

pub struct EchoApp {
    client: Arc<BusClient>,
}

impl EchoApp {
    #[must_use]
    pub fn new(client: Arc<BusClient>) -> Self {
        Self { client }
    }
}

impl App for EchoApp {
    fn handlers(&self) -> HashMap<String, Arc<dyn Handler>> {
        let mut handlers: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        handlers.insert(
            "reply".to_string(),
            Arc::new(ReplyHandler {
                client: self.client.clone(),
            }),
        );
        handlers
    }
}

struct ReplyHandler {
    client: Arc<BusClient>,
}

#[async_trait]
impl Handler for ReplyHandler {
    async fn handle(
        &self,
        _cancel: &CancellationToken,
        msg: Arc<jetstream::Message>,
    ) -> anyhow::Result<()> {
        let started_at = Utc::now();
        let meta = MsgMeta::parse(self.client.account_id(), &msg)?;

        let inputs = serde_json::from_slice(&msg.payload).unwrap_or(serde_json::Value::Null);
        let result = ResultMsg::success(started_at, Some(inputs));

        let response_subject = meta.response_subject();
        self.client
            .publish_result(&result, &[response_subject.as_str()])
            .await?;

        Ok(())
    }
}
