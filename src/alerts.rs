use crate::models::{Opportunity, Stage, StageAlert};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

const AT_THRESHOLD_LABEL: &str = "Alert";

/// Whole days since the opportunity last changed stage, rounded up.
///
/// Falls back to `created_at` when the opportunity never moved. The absolute
/// difference is used so a reference time ahead of `now` still yields a count.
pub fn calculate_days_in_stage(opportunity: &Opportunity, now: DateTime<Utc>) -> i64 {
    let reference = opportunity.last_stage_change_at.unwrap_or(opportunity.created_at);
    let mut elapsed = now.signed_duration_since(reference);
    if elapsed < Duration::zero() {
        elapsed = -elapsed;
    }
    let whole_days = elapsed.num_days();
    if elapsed > Duration::days(whole_days) {
        whole_days + 1
    } else {
        whole_days
    }
}

pub fn should_show_alert(opportunity: &Opportunity, stage: &Stage, now: DateTime<Utc>) -> bool {
    match stage.alert_config {
        Some(config) if config.enabled => {
            calculate_days_in_stage(opportunity, now) >= i64::from(config.max_days_in_stage)
        }
        _ => false,
    }
}

pub fn get_alert_message(opportunity: &Opportunity, stage: &Stage, now: DateTime<Utc>) -> String {
    let Some(config) = stage.alert_config.filter(|config| config.enabled) else {
        return String::new();
    };
    let over_days = calculate_days_in_stage(opportunity, now) - i64::from(config.max_days_in_stage);
    match over_days {
        0 => AT_THRESHOLD_LABEL.to_string(),
        over if over > 0 => format!("{}d overdue", over),
        _ => String::new(),
    }
}

/// Recomputes the alert board from an explicit snapshot.
///
/// Alerts are ordered by stage position, then by longest residency first.
pub fn collect_alerts(stages: &[Stage], opportunities: &[Opportunity], now: DateTime<Utc>) -> Vec<StageAlert> {
    let stages_by_id: HashMap<&str, &Stage> = stages.iter().map(|stage| (stage.id.as_str(), stage)).collect();

    let mut alerts: Vec<(i64, StageAlert)> = opportunities
        .iter()
        .filter_map(|opportunity| {
            let stage = stages_by_id.get(opportunity.stage_id.as_str())?;
            if !should_show_alert(opportunity, stage, now) {
                return None;
            }
            Some((
                stage.position,
                StageAlert {
                    opportunity_id: opportunity.id.clone(),
                    opportunity_title: opportunity.title.clone(),
                    stage_id: stage.id.clone(),
                    stage_name: stage.name.clone(),
                    days_in_stage: calculate_days_in_stage(opportunity, now),
                    message: get_alert_message(opportunity, stage, now),
                },
            ))
        })
        .collect();

    alerts.sort_by(|(left_position, left), (right_position, right)| {
        left_position
            .cmp(right_position)
            .then_with(|| right.days_in_stage.cmp(&left.days_in_stage))
            .then_with(|| left.opportunity_id.cmp(&right.opportunity_id))
    });
    alerts.into_iter().map(|(_, alert)| alert).collect()
}
