//! Evaluated rule structures.

/// The matched rules of one evaluation.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    /// Matched `on` blocks in source order, calls already filtered by their
    /// `if` predicates.
    pub ons: Vec<OnBlock>,
}

/// One matched `on` block.
#[derive(Debug, Clone)]
pub struct OnBlock {
    /// The block label: an event type, optionally suffixed `_action`.
    pub event_type: String,
    pub name: String,
    pub slug: String,
    pub if_clause: bool,
    pub calls: Vec<CallBlock>,
}

/// One matched `call` block.
#[derive(Debug, Clone)]
pub struct CallBlock {
    /// `{app}_{handler}` naming the work to dispatch.
    pub task_type: String,
    pub name: String,
    pub slug: String,
    pub if_clause: bool,
    /// JSON-encoded inputs for the handler.
    pub inputs: Vec<u8>,
}

/// Join parts into a deterministic, url-safe identifier.
///
/// Lowercases and keeps letters, digits, underscores and dashes; anything
/// else collapses to a single dash. Underscores survive so task types stay
/// recognisable in subjects.
#[must_use]
pub fn slugify(parts: &[&str]) -> String {
    let joined = parts.join("-");
    let mut slug = String::with_capacity(joined.len());

    for c in joined.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }

    slug.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_joins_with_dashes() {
        assert_eq!(slugify(&["push0", "github_tag"]), "push0-github_tag");
    }

    #[test]
    fn test_slugify_lowercases() {
        assert_eq!(slugify(&["Push", "Tag"]), "push-tag");
    }

    #[test]
    fn test_slugify_collapses_invalid_runs() {
        assert_eq!(slugify(&["a b!c"]), "a-b-c");
        assert_eq!(slugify(&["  edges  "]), "edges");
    }
}
