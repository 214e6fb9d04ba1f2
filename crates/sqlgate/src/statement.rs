//! Statement plans and the resource-clause rewrite pass.
//!
//! Statements may name external resources through a `USING RESOURCE '<loc>'`
//! clause. The gateway is responsible for neutralizing those references
//! before the plan reaches the shared engine; the rewrite is pure and leaves
//! plans without a recognized clause untouched.

use once_cell::sync::Lazy;
use regex::Regex;

static RESOURCE_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s+USING\s+RESOURCE\s+'([^']*)'").expect("resource clause regex is valid")
});

/// Reference to an external resource named by a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub location: String,
}

/// A lightly parsed statement as handed to the execution engine.
///
/// Parsing proper is the engine's job; this layer only extracts what it
/// needs for the rewrite pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementPlan {
    text: String,
    resources: Vec<ResourceRef>,
}

impl StatementPlan {
    pub fn parse(text: &str) -> StatementPlan {
        let resources = RESOURCE_CLAUSE
            .captures_iter(text)
            .map(|caps| ResourceRef {
                location: caps[1].to_string(),
            })
            .collect();
        StatementPlan {
            text: text.to_string(),
            resources,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn resources(&self) -> &[ResourceRef] {
        &self.resources
    }

    /// Whether the statement carries no text at all.
    ///
    /// Empty statements are valid input and complete trivially without ever
    /// reaching the engine.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Strip recognized resource clauses from a plan.
///
/// Returns a structurally equal plan when no clause is present. When clauses
/// are present the returned plan has them removed from the text and an empty
/// resource list; same input always yields the same output.
pub fn rewrite_resources(plan: &StatementPlan) -> StatementPlan {
    if plan.resources.is_empty() {
        return plan.clone();
    }
    let text = RESOURCE_CLAUSE.replace_all(&plan.text, "").into_owned();
    StatementPlan {
        text,
        resources: Vec::new(),
    }
}
