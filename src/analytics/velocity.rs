use crate::history::stage_visits;
use crate::models::{DateWindow, Stage, StageHistoryEntry, StageVelocityData};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Average residency, in fractional days, of visits into `stage_id` that began
/// inside `window`. Open visits are measured up to `now`.
pub fn compute_stage_velocity(
    stage_id: &str,
    history: &[StageHistoryEntry],
    window: &DateWindow,
    now: DateTime<Utc>,
) -> StageVelocityData {
    let visits = stage_visits(stage_id, history, window);
    if visits.is_empty() {
        return StageVelocityData {
            stage_id: stage_id.to_string(),
            average_days_in_stage: 0.0,
            total_opportunities: 0,
        };
    }

    let total_days: f64 = visits.iter().map(|visit| visit.days(now)).sum();
    let distinct: HashSet<&str> = visits.iter().map(|visit| visit.opportunity_id.as_str()).collect();

    StageVelocityData {
        stage_id: stage_id.to_string(),
        average_days_in_stage: total_days / visits.len() as f64,
        total_opportunities: distinct.len() as u64,
    }
}

/// Simple mean of the per-stage averages, skipping stages nobody has entered.
pub fn compute_funnel_average_velocity(
    stages: &[Stage],
    history: &[StageHistoryEntry],
    window: &DateWindow,
    now: DateTime<Utc>,
) -> f64 {
    let observed: Vec<f64> = stages
        .iter()
        .map(|stage| compute_stage_velocity(&stage.id, history, window, now))
        .filter(|velocity| velocity.total_opportunities > 0)
        .map(|velocity| velocity.average_days_in_stage)
        .collect();

    if observed.is_empty() {
        return 0.0;
    }
    observed.iter().sum::<f64>() / observed.len() as f64
}
