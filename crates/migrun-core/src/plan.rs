use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan document is empty")]
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationPlan {
    pub summary: String,
    #[serde(default)]
    pub transformation: Value,
    #[serde(default)]
    pub phases: Vec<PlanPhase>,
    #[serde(default)]
    pub dependencies: Vec<PlanDependency>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanPhase {
    #[serde(alias = "name")]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanDependency {
    #[serde(alias = "from")]
    pub name: String,
    #[serde(default, alias = "to")]
    pub replacement: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Plan input as handed over by the plan collaborator: structured when the
/// text is a JSON object of the expected shape, markdown otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "format", content = "plan", rename_all = "snake_case")]
pub enum PlanDocument {
    Structured(MigrationPlan),
    Markdown(String),
}

impl PlanDocument {
    pub fn from_raw(raw: &str) -> Result<Self, PlanError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PlanError::Empty);
        }
        if trimmed.starts_with('{') {
            if let Ok(plan) = serde_json::from_str::<MigrationPlan>(trimmed) {
                return Ok(PlanDocument::Structured(plan));
            }
        }
        Ok(PlanDocument::Markdown(raw.to_string()))
    }

    pub fn summary(&self) -> Option<&str> {
        match self {
            PlanDocument::Structured(plan) => Some(plan.summary.as_str()),
            PlanDocument::Markdown(text) => text
                .lines()
                .map(|line| line.trim().trim_start_matches('#').trim())
                .find(|line| !line.is_empty()),
        }
    }

    pub fn phase_count(&self) -> usize {
        match self {
            PlanDocument::Structured(plan) => plan.phases.len(),
            PlanDocument::Markdown(_) => 0,
        }
    }
}
