//! Parsing of raw broker messages into cascade metadata.

use async_nats::jetstream;

use crate::error::BusError;
use crate::subjects::{self, CHANNEL_NOTIFY, CHANNEL_REQUEST};

/// The channel a message was delivered on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// Events and results extending a sequence.
    Notify,
    /// Work for one handler of one app.
    Request { app: String, handler: String },
}

/// Metadata extracted from a delivered message's subject and headers.
#[derive(Debug, Clone)]
pub struct MsgMeta {
    pub account_id: String,
    pub channel: Channel,
    pub sequence_id: String,
    pub message_id: String,
    /// Position assigned by the broker within the account stream.
    pub stream_sequence: u64,
    pub num_delivered: i64,
}

impl MsgMeta {
    /// Parse a delivered JetStream message.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidMessage`] when the subject does not belong
    /// to the account, the channel token is unrecognised, or the subject has
    /// fewer tokens than its channel form requires.
    pub fn parse(account_id: &str, msg: &jetstream::Message) -> Result<Self, BusError> {
        let info = msg
            .info()
            .map_err(|err| BusError::InvalidMessage(format!("missing delivery info: {err}")))?;

        let mut meta = Self::from_subject(account_id, msg.subject.as_str())?;
        meta.stream_sequence = info.stream_sequence;
        meta.num_delivered = info.delivered;

        Ok(meta)
    }

    /// Dissect a subject without broker metadata. Pure, no I/O.
    pub fn from_subject(account_id: &str, subject: &str) -> Result<Self, BusError> {
        let tokens: Vec<&str> = subject.split('.').collect();

        if tokens.first() != Some(&account_id) {
            return Err(BusError::InvalidMessage(format!(
                "subject '{subject}' does not belong to account '{account_id}'"
            )));
        }

        let channel_token = tokens.get(1).copied().unwrap_or_default();
        let channel = match channel_token {
            CHANNEL_NOTIFY if tokens.len() >= 4 => Channel::Notify,
            CHANNEL_REQUEST if tokens.len() >= 6 => Channel::Request {
                app: tokens[4].to_string(),
                handler: tokens[5].to_string(),
            },
            CHANNEL_NOTIFY | CHANNEL_REQUEST => {
                return Err(BusError::InvalidMessage(format!(
                    "subject '{subject}' has too few tokens for the {channel_token} channel"
                )))
            }
            other => {
                return Err(BusError::InvalidMessage(format!(
                    "unrecognised channel '{other}' in subject '{subject}'"
                )))
            }
        };

        Ok(Self {
            account_id: account_id.to_string(),
            channel,
            sequence_id: tokens[2].to_string(),
            message_id: tokens[3].to_string(),
            stream_sequence: 0,
            num_delivered: 0,
        })
    }

    /// Filter matching every message of this message's sequence.
    #[must_use]
    pub fn sequence_filter(&self) -> String {
        subjects::sequence_filter(&self.account_id, &self.sequence_id)
    }

    /// Notify subject a worker publishes this request's result to.
    ///
    /// The result extends the sequence under the request's message id, so
    /// later rule evaluations see it in the bundle.
    #[must_use]
    pub fn response_subject(&self) -> String {
        subjects::notify(&self.account_id, &self.sequence_id, &self.message_id)
    }

    /// App name, for request messages.
    #[must_use]
    pub fn app_name(&self) -> Option<&str> {
        match &self.channel {
            Channel::Request { app, .. } => Some(app),
            Channel::Notify => None,
        }
    }

    /// Handler name, for request messages.
    #[must_use]
    pub fn handler_name(&self) -> Option<&str> {
        match &self.channel {
            Channel::Request { handler, .. } => Some(handler),
            Channel::Notify => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_notify_subject() {
        let meta = MsgMeta::from_subject("acct", "acct.notify.SEQ.M1").unwrap();
        assert_eq!(meta.channel, Channel::Notify);
        assert_eq!(meta.sequence_id, "SEQ");
        assert_eq!(meta.message_id, "M1");
        assert_eq!(meta.handler_name(), None);
    }

    #[test]
    fn test_parse_request_subject() {
        let meta = MsgMeta::from_subject("acct", "acct.request.SEQ.c1.github.tag").unwrap();
        assert_eq!(meta.sequence_id, "SEQ");
        assert_eq!(meta.message_id, "c1");
        assert_eq!(meta.app_name(), Some("github"));
        assert_eq!(meta.handler_name(), Some("tag"));
    }

    #[test]
    fn test_parse_rejects_foreign_account() {
        let err = MsgMeta::from_subject("acct", "other.notify.SEQ.M1").unwrap_err();
        assert!(matches!(err, BusError::InvalidMessage(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_channel() {
        let err = MsgMeta::from_subject("acct", "acct.bogus.SEQ.M1").unwrap_err();
        assert!(matches!(err, BusError::InvalidMessage(_)));
    }

    #[test]
    fn test_parse_rejects_short_notify_subject() {
        let err = MsgMeta::from_subject("acct", "acct.notify.SEQ").unwrap_err();
        assert!(matches!(err, BusError::InvalidMessage(_)));
    }

    #[test]
    fn test_parse_rejects_short_request_subject() {
        let err = MsgMeta::from_subject("acct", "acct.request.SEQ.c1.github").unwrap_err();
        assert!(matches!(err, BusError::InvalidMessage(_)));
    }

    #[test]
    fn test_response_subject_extends_the_sequence() {
        let meta = MsgMeta::from_subject("acct", "acct.request.SEQ.c1.github.tag").unwrap();
        assert_eq!(meta.response_subject(), "acct.notify.SEQ.c1");
    }

    #[test]
    fn test_sequence_filter() {
        let meta = MsgMeta::from_subject("acct", "acct.notify.SEQ.M1").unwrap();
        assert_eq!(meta.sequence_filter(), "acct.notify.SEQ.*");
    }
}
