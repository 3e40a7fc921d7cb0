//! Domain snapshot: the unit the sync layer replaces atomically.
//!
//! Items are kept as opaque JSON values. The sync core never interprets
//! item fields; it only stores, compares and ships whole snapshots.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Pipeline stage (board column) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: String,
    pub label: String,
    pub is_deletable: bool,
}

impl Stage {
    pub fn new(id: impl Into<String>, label: impl Into<String>, is_deletable: bool) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            is_deletable,
        }
    }
}

/// Ordered items plus ordered stage configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DomainSnapshot {
    /// Work items in insertion order
    pub items: Vec<Value>,
    /// Pipeline stages in display order
    pub stages: Vec<Stage>,
}

impl DomainSnapshot {
    pub fn new(items: Vec<Value>, stages: Vec<Stage>) -> Self {
        Self { items, stages }
    }

    /// Default used when nothing has been persisted locally yet.
    pub fn seeded(created_at: chrono::DateTime<chrono::Utc>) -> Self {
        let stages = default_stages();
        let template = json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "title": "Template: Why Raleigh is Booming in 2025",
            "funnelStage": "TOF",
            "formatType": "Pros & Cons",
            "targetRuntime": 22,
            "status": stages[0].label,
            "notes": "Welcome! Data is synced to the team document.",
            "neighborhood": "Raleigh, NC",
            "createdDate": created_at.to_rfc3339(),
            "inspirationLinks": [{ "url": "" }, { "url": "" }, { "url": "" }],
            "externalDocs": [],
            "checklist": [],
            "groundingSources": [],
            "isArchived": false,
            "isTrashed": false,
        });
        Self {
            items: vec![template],
            stages,
        }
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

pub fn default_stages() -> Vec<Stage> {
    vec![
        Stage::new("backlog", "Idea Backlog", false),
        Stage::new("script", "Script", true),
        Stage::new("inspo", "Gather Inspo", true),
        Stage::new("scheduled_film", "Scheduled", true),
        Stage::new("packaging_needed", "Needs Packaging", true),
        Stage::new("editing", "In Editing", true),
        Stage::new("revisions", "Needs Revisions + Packaging", true),
        Stage::new("scheduled_post", "Scheduled", true),
        Stage::new("posted", "Posted", true),
        Stage::new("pinned", "Add Pinned Comment", true),
        Stage::new("broll", "Update B Roll Drive", true),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_snapshot_has_template_in_first_stage() {
        let snapshot = DomainSnapshot::seeded(chrono::Utc::now());
        assert_eq!(snapshot.stages.len(), 11);
        assert_eq!(snapshot.item_count(), 1);
        assert_eq!(snapshot.items[0]["status"], "Idea Backlog");
        assert!(!snapshot.stages[0].is_deletable);
    }

    #[test]
    fn test_stage_serializes_camel_case() {
        let stage = Stage::new("script", "Script", true);
        let value = serde_json::to_value(&stage).unwrap();
        assert_eq!(value, json!({ "id": "script", "label": "Script", "isDeletable": true }));
    }
}
