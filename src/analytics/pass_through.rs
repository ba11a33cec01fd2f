use crate::analytics::velocity::compute_stage_velocity;
use crate::history::current_stages;
use crate::models::{
    DateWindow, FunnelPassThroughData, Opportunity, PassThroughRateData, Stage, StageHistoryEntry,
};
use chrono::{DateTime, Utc};

/// Entries, exits and live occupancy for one stage.
///
/// Any transition out of the stage counts as an exit, whatever its destination.
/// `current_count` ignores the window.
pub fn compute_stage_pass_through(
    stage: &Stage,
    opportunities: &[Opportunity],
    history: &[StageHistoryEntry],
    window: &DateWindow,
) -> PassThroughRateData {
    let entries_count = count_in_window(history, window, |entry| entry.to_stage_id == stage.id);
    let exits_count = count_in_window(history, window, |entry| {
        entry.from_stage_id.as_deref() == Some(stage.id.as_str())
    });
    let current_count = current_stages(opportunities, history)
        .values()
        .filter(|stage_id| **stage_id == stage.id)
        .count() as u64;

    PassThroughRateData {
        stage_id: stage.id.clone(),
        stage_name: stage.name.clone(),
        entries_count,
        exits_count,
        pass_through_rate: percentage(exits_count, entries_count),
        current_count,
    }
}

pub fn compute_funnel_pass_through(
    funnel_id: &str,
    stages: &[Stage],
    opportunities: &[Opportunity],
    history: &[StageHistoryEntry],
    window: &DateWindow,
    now: DateTime<Utc>,
) -> FunnelPassThroughData {
    let mut ordered: Vec<&Stage> = stages.iter().collect();
    ordered.sort_by_key(|stage| stage.position);

    let rates: Vec<PassThroughRateData> = ordered
        .iter()
        .map(|stage| compute_stage_pass_through(stage, opportunities, history, window))
        .collect();

    let average_velocity: f64 = ordered
        .iter()
        .map(|stage| compute_stage_velocity(&stage.id, history, window, now).average_days_in_stage)
        .sum();

    let overall_conversion_rate = match (rates.first(), rates.last()) {
        (Some(only), _) if rates.len() == 1 => only.pass_through_rate,
        (Some(first), Some(last)) => percentage(last.entries_count, first.entries_count),
        _ => 0.0,
    };

    tracing::debug!(
        funnel_id = %funnel_id,
        stages = rates.len(),
        overall_conversion_rate,
        average_velocity,
        "computed funnel pass-through"
    );

    FunnelPassThroughData {
        funnel_id: funnel_id.to_string(),
        stages: rates,
        overall_conversion_rate,
        average_velocity,
    }
}

fn count_in_window<F>(history: &[StageHistoryEntry], window: &DateWindow, predicate: F) -> u64
where
    F: Fn(&StageHistoryEntry) -> bool,
{
    history
        .iter()
        .filter(|entry| window.contains(entry.moved_at) && predicate(entry))
        .count() as u64
}

fn percentage(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    (numerator as f64 * 100.0 / denominator as f64).clamp(0.0, 100.0)
}
