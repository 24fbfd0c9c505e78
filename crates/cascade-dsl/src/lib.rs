//! # cascade-dsl
//!
//! The declarative rule language driving cascade's automation.
//!
//! Rules are HCL bodies of `on` blocks. Each `on` names an event type and
//! holds `call` blocks describing work to dispatch. Evaluation runs against
//! the aggregate state of one sequence and returns only the blocks whose
//! event type and `if` predicates match.

mod ast;
mod error;
mod eval;
mod rulefile;

pub use ast::{slugify, CallBlock, OnBlock, RuleSet};
pub use error::DslError;
pub use eval::{eval_rules, BUNDLE_RULES_KEY};
pub use rulefile::{read_rule_files, FileContent, RuleFiles, RULE_FILE_EXT};
