//! Subject codec for the broker's dotted token hierarchy.
//!
//! The account is always the leading token. The second token is the channel:
//! `notify` carries events and results, `request` carries worker input.

/// Channel token for events and results.
pub const CHANNEL_NOTIFY: &str = "notify";

/// Channel token for worker input.
pub const CHANNEL_REQUEST: &str = "request";

/// Message id of the event that starts a sequence.
pub const SOURCE_EVENT_ID: &str = "event";

/// Notify subject for one message of a sequence.
#[must_use]
pub fn notify(account_id: &str, sequence_id: &str, message_id: &str) -> String {
    format!("{account_id}.{CHANNEL_NOTIFY}.{sequence_id}.{message_id}")
}

/// Subject of the event that started a sequence.
#[must_use]
pub fn source_event(account_id: &str, sequence_id: &str) -> String {
    notify(account_id, sequence_id, SOURCE_EVENT_ID)
}

/// Filter matching every message of one sequence.
#[must_use]
pub fn sequence_filter(account_id: &str, sequence_id: &str) -> String {
    format!("{account_id}.{CHANNEL_NOTIFY}.{sequence_id}.*")
}

/// Filter matching all requests for one app across sequences and handlers.
///
/// Concrete request subjects are built at publish time from their tokens;
/// only the filter form is ever needed ahead of time.
#[must_use]
pub fn worker_filter(account_id: &str, app: &str) -> String {
    format!("{account_id}.{CHANNEL_REQUEST}.*.*.{app}.*")
}

/// Build a publish subject from tokens.
///
/// Individual tokens are joined with the account prepended. A single token
/// that already contains dots is treated as a full subject and passed
/// through untouched.
#[must_use]
pub fn publish_subject(account_id: &str, tokens: &[&str]) -> String {
    if tokens.len() == 1 && tokens[0].contains('.') {
        return tokens[0].to_string();
    }

    let mut subject = String::from(account_id);
    for token in tokens {
        subject.push('.');
        subject.push_str(token);
    }
    subject
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_subject() {
        assert_eq!(notify("acct", "SEQ", "M1"), "acct.notify.SEQ.M1");
    }

    #[test]
    fn test_source_event_subject() {
        assert_eq!(source_event("acct", "SEQ"), "acct.notify.SEQ.event");
    }

    #[test]
    fn test_sequence_filter() {
        assert_eq!(sequence_filter("acct", "SEQ"), "acct.notify.SEQ.*");
    }

    #[test]
    fn test_worker_filter() {
        assert_eq!(worker_filter("acct", "github"), "acct.request.*.*.github.*");
    }

    #[test]
    fn test_publish_subject_joins_tokens() {
        let subject = publish_subject("acct", &["request", "SEQ", "slug", "github", "tag"]);
        assert_eq!(subject, "acct.request.SEQ.slug.github.tag");
    }

    #[test]
    fn test_publish_subject_passes_full_subject_through() {
        let subject = publish_subject("acct", &["other.notify.SEQ.M1"]);
        assert_eq!(subject, "other.notify.SEQ.M1");
    }

    #[test]
    fn test_publish_subject_single_plain_token_is_prefixed() {
        assert_eq!(publish_subject("acct", &["notify"]), "acct.notify");
    }
}
