//! Read-only projections over the stage history ledger.

use crate::models::{DateWindow, Opportunity, StageHistoryEntry};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

pub const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// A single residency of one opportunity in one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageVisit {
    pub opportunity_id: String,
    pub entered_at: DateTime<Utc>,
    /// `None` while the opportunity is still in the stage.
    pub exited_at: Option<DateTime<Utc>>,
}

impl StageVisit {
    pub fn days(&self, now: DateTime<Utc>) -> f64 {
        let end = self.exited_at.unwrap_or(now);
        let millis = end.signed_duration_since(self.entered_at).num_milliseconds().max(0);
        millis as f64 / MILLIS_PER_DAY as f64
    }
}

/// Orders entries by `moved_at`, keeping insertion order for ties.
pub fn chronological(entries: &[StageHistoryEntry]) -> Vec<&StageHistoryEntry> {
    let mut ordered: Vec<&StageHistoryEntry> = entries.iter().collect();
    ordered.sort_by_key(|entry| entry.moved_at);
    ordered
}

/// Current stage per opportunity: the target of its latest transition, or the
/// stage recorded on the opportunity when it has no history.
pub fn current_stages(opportunities: &[Opportunity], entries: &[StageHistoryEntry]) -> HashMap<String, String> {
    let mut current: HashMap<String, String> = opportunities
        .iter()
        .map(|opportunity| (opportunity.id.clone(), opportunity.stage_id.clone()))
        .collect();
    for entry in chronological(entries) {
        current.insert(entry.opportunity_id.clone(), entry.to_stage_id.clone());
    }
    current
}

/// Visits into `stage_id` whose entry falls inside `window`. A visit ends at the
/// opportunity's next transition, wherever it leads.
pub fn stage_visits(stage_id: &str, entries: &[StageHistoryEntry], window: &DateWindow) -> Vec<StageVisit> {
    let mut by_opportunity: HashMap<&str, Vec<&StageHistoryEntry>> = HashMap::new();
    for entry in chronological(entries) {
        by_opportunity
            .entry(entry.opportunity_id.as_str())
            .or_default()
            .push(entry);
    }

    let mut visits = Vec::new();
    for timeline in by_opportunity.values() {
        for (index, entry) in timeline.iter().enumerate() {
            if entry.to_stage_id != stage_id || !window.contains(entry.moved_at) {
                continue;
            }
            visits.push(StageVisit {
                opportunity_id: entry.opportunity_id.clone(),
                entered_at: entry.moved_at,
                exited_at: timeline.get(index + 1).map(|next| next.moved_at),
            });
        }
    }
    visits.sort_by(|a, b| {
        a.entered_at
            .cmp(&b.entered_at)
            .then_with(|| a.opportunity_id.cmp(&b.opportunity_id))
    });
    visits
}
