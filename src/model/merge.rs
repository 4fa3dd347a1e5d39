use serde::{Deserialize, Serialize};

use crate::model::OntologySchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Block,
}

impl Severity {
    /// INFO and WARN conflicts may be resolved automatically
    pub fn is_auto_resolvable(self) -> bool {
        match self {
            Severity::Info | Severity::Warn => true,
            Severity::Error | Severity::Block => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides define the property with different types
    PropertyType,
    /// The required flag changed
    RequiredChange,
    /// The unique flag changed
    UniqueChange,
    /// Added independently on both sides with different definitions
    NewProperty,
    /// Deleted on one side, modified on the other (property, link or whole entity)
    DeleteVsModify,
    /// Link cardinality differs
    LinkCardinality,
    /// Link points at a different target entity
    LinkTarget,
}

/// One field-level disagreement found by merge analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaConflict {
    pub entity_type: String,
    pub conflict_type: ConflictType,
    /// Property or link name; `None` for entity-level conflicts
    pub field_name: Option<String>,
    pub source_value: serde_json::Value,
    pub target_value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_value: Option<serde_json::Value>,
    pub severity: Severity,
    pub resolution_hint: Option<String>,
    /// Definition the engine would apply when auto-resolving
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_resolution: Option<serde_json::Value>,
}

impl SchemaConflict {
    /// `Entity.field` or just `Entity`
    pub fn location(&self) -> String {
        match &self.field_name {
            Some(field) => format!("{}.{}", self.entity_type, field),
            None => self.entity_type.clone(),
        }
    }

    pub fn is_blocking(&self) -> bool {
        !self.severity.is_auto_resolvable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStatus {
    Success,
    Conflict,
    Error,
}

/// Result of a three-way schema merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub status: MergeStatus,
    pub conflicts: Vec<SchemaConflict>,
    pub merged_schema: Option<OntologySchema>,
    pub auto_resolved: bool,
    pub resolution_log: Vec<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MergeResult {
    pub fn is_success(&self) -> bool {
        self.status == MergeStatus::Success
    }

    /// Conflicts the caller still has to resolve by hand
    pub fn blocking_conflicts(&self) -> impl Iterator<Item = &SchemaConflict> {
        self.conflicts.iter().filter(|c| c.is_blocking())
    }

    pub fn error(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: MergeStatus::Error,
            conflicts: Vec::new(),
            merged_schema: None,
            auto_resolved: false,
            resolution_log: Vec::new(),
            duration_ms,
            error: Some(message.into()),
        }
    }
}
