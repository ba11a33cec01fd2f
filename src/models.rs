use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Funnel {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StageAlertConfig {
    pub enabled: bool,
    pub max_days_in_stage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: String,
    pub funnel_id: String,
    pub name: String,
    pub position: i64,
    pub alert_config: Option<StageAlertConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    pub title: String,
    pub funnel_id: String,
    pub stage_id: String,
    pub created_at: DateTime<Utc>,
    pub last_stage_change_at: Option<DateTime<Utc>>,
    /// Set when the opportunity was created by migrating another one.
    pub source_opportunity_id: Option<String>,
}

/// One stage transition. `from_stage_id == None` marks the initial funnel entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StageHistoryEntry {
    pub id: String,
    pub opportunity_id: String,
    pub from_stage_id: Option<String>,
    pub to_stage_id: String,
    pub moved_at: DateTime<Utc>,
    pub user_id: Option<String>,
}

/// Inclusive bounds on `moved_at`. Both absent means all time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DateWindow {
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl DateWindow {
    pub fn all_time() -> Self {
        Self::default()
    }

    pub fn between(date_from: Option<DateTime<Utc>>, date_to: Option<DateTime<Utc>>) -> Self {
        Self { date_from, date_to }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.date_from.map_or(true, |from| at >= from) && self.date_to.map_or(true, |to| at <= to)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PassThroughRateData {
    pub stage_id: String,
    pub stage_name: String,
    pub entries_count: u64,
    pub exits_count: u64,
    pub pass_through_rate: f64,
    pub current_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageVelocityData {
    pub stage_id: String,
    pub average_days_in_stage: f64,
    pub total_opportunities: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunnelPassThroughData {
    pub funnel_id: String,
    pub stages: Vec<PassThroughRateData>,
    pub overall_conversion_rate: f64,
    pub average_velocity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StageAlert {
    pub opportunity_id: String,
    pub opportunity_title: String,
    pub stage_id: String,
    pub stage_name: String,
    pub days_in_stage: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FunnelAlertBoard {
    pub funnel_id: String,
    pub alerts: Vec<StageAlert>,
}

/// Everything the aggregators need for one funnel, read in a single store round trip.
#[derive(Debug, Clone, Default)]
pub struct FunnelSnapshot {
    pub funnel_id: String,
    pub stages: Vec<Stage>,
    pub opportunities: Vec<Opportunity>,
    pub history: Vec<StageHistoryEntry>,
}

impl FunnelSnapshot {
    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.id == stage_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordStageMovePayload {
    pub opportunity_id: String,
    pub from_stage_id: Option<String>,
    pub to_stage_id: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOpportunityPayload {
    pub funnel_id: String,
    pub stage_id: String,
    pub title: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateOpportunityPayload {
    pub opportunity_id: String,
    pub target_funnel_id: String,
    pub target_stage_id: String,
    pub user_id: Option<String>,
}
