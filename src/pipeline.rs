use crate::alerts::collect_alerts;
use crate::analytics::{
    compute_funnel_average_velocity, compute_funnel_pass_through, compute_stage_pass_through, compute_stage_velocity,
};
use crate::config::PipelineConfig;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    CreateOpportunityPayload, DateWindow, Funnel, FunnelAlertBoard, FunnelPassThroughData, FunnelSnapshot,
    MigrateOpportunityPayload, Opportunity, PassThroughRateData, RecordStageMovePayload, Stage, StageAlertConfig,
    StageHistoryEntry, StageVelocityData,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Query facade over the pipeline store.
///
/// Every call does one store round trip on the blocking pool, then computes
/// the requested metric from that snapshot. Nothing is cached between calls.
#[derive(Debug, Clone)]
pub struct PipelineCore {
    db: Arc<Database>,
}

impl PipelineCore {
    pub fn new(db: Database) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn open(config: &PipelineConfig) -> AppResult<Self> {
        let db = Database::new(&config.database_path)?;
        tracing::info!(path = %config.database_path.display(), "opened pipeline store");
        Ok(Self::new(db))
    }

    async fn fetch<T, F>(&self, operation: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> AppResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || operation(db.as_ref()))
            .await
            .map_err(|error| AppError::Internal(format!("store task failed: {}", error)))?
    }

    pub async fn create_funnel(&self, name: &str) -> AppResult<Funnel> {
        let name = name.to_string();
        let funnel = self.fetch(move |db| db.insert_funnel(&name)).await?;
        tracing::info!(funnel_id = %funnel.id, name = %funnel.name, "created funnel");
        Ok(funnel)
    }

    pub async fn list_funnels(&self) -> AppResult<Vec<Funnel>> {
        self.fetch(|db| db.list_funnels()).await
    }

    pub async fn add_stage(
        &self,
        funnel_id: &str,
        name: &str,
        alert_config: Option<StageAlertConfig>,
    ) -> AppResult<Stage> {
        let (funnel_id, name) = (funnel_id.to_string(), name.to_string());
        let stage = self
            .fetch(move |db| db.insert_stage(&funnel_id, &name, alert_config))
            .await?;
        tracing::info!(
            funnel_id = %stage.funnel_id,
            stage_id = %stage.id,
            position = stage.position,
            "added stage"
        );
        Ok(stage)
    }

    pub async fn set_stage_alert_config(
        &self,
        stage_id: &str,
        alert_config: Option<StageAlertConfig>,
    ) -> AppResult<Stage> {
        let id = stage_id.to_string();
        self.fetch(move |db| db.update_stage_alert_config(&id, alert_config))
            .await?
            .ok_or_else(|| AppError::not_found("stage", stage_id))
    }

    pub async fn list_stages(&self, funnel_id: &str) -> AppResult<Vec<Stage>> {
        let id = funnel_id.to_string();
        self.fetch(move |db| {
            if db.get_funnel(&id)?.is_none() {
                return Err(AppError::not_found("funnel", &id));
            }
            db.list_stages(&id)
        })
        .await
    }

    pub async fn create_opportunity(&self, payload: CreateOpportunityPayload) -> AppResult<Opportunity> {
        self.create_opportunity_at(payload, Utc::now()).await
    }

    pub async fn create_opportunity_at(
        &self,
        payload: CreateOpportunityPayload,
        now: DateTime<Utc>,
    ) -> AppResult<Opportunity> {
        let (opportunity, _) = self
            .fetch(move |db| {
                db.insert_opportunity(
                    &payload.funnel_id,
                    &payload.stage_id,
                    &payload.title,
                    None,
                    payload.user_id.as_deref(),
                    now,
                )
            })
            .await?;
        tracing::info!(
            opportunity_id = %opportunity.id,
            funnel_id = %opportunity.funnel_id,
            stage_id = %opportunity.stage_id,
            "created opportunity"
        );
        Ok(opportunity)
    }

    /// Copies an opportunity into another funnel. The source is left untouched;
    /// the copy starts a fresh history and remembers where it came from.
    pub async fn migrate_opportunity(&self, payload: MigrateOpportunityPayload) -> AppResult<Opportunity> {
        self.migrate_opportunity_at(payload, Utc::now()).await
    }

    pub async fn migrate_opportunity_at(
        &self,
        payload: MigrateOpportunityPayload,
        now: DateTime<Utc>,
    ) -> AppResult<Opportunity> {
        let (migrated, _) = self
            .fetch(move |db| {
                let source = db
                    .get_opportunity(&payload.opportunity_id)?
                    .ok_or_else(|| AppError::not_found("opportunity", &payload.opportunity_id))?;
                db.insert_opportunity(
                    &payload.target_funnel_id,
                    &payload.target_stage_id,
                    &source.title,
                    Some(&source.id),
                    payload.user_id.as_deref(),
                    now,
                )
            })
            .await?;
        tracing::info!(
            opportunity_id = %migrated.id,
            source_opportunity_id = ?migrated.source_opportunity_id,
            funnel_id = %migrated.funnel_id,
            "migrated opportunity"
        );
        Ok(migrated)
    }

    pub async fn record_stage_move(&self, payload: RecordStageMovePayload) -> AppResult<StageHistoryEntry> {
        self.record_stage_move_at(payload, Utc::now()).await
    }

    pub async fn record_stage_move_at(
        &self,
        payload: RecordStageMovePayload,
        moved_at: DateTime<Utc>,
    ) -> AppResult<StageHistoryEntry> {
        let opportunity_id = payload.opportunity_id.clone();
        let result = self
            .fetch(move |db| {
                db.record_stage_move(
                    &payload.opportunity_id,
                    payload.from_stage_id.as_deref(),
                    &payload.to_stage_id,
                    payload.user_id.as_deref(),
                    moved_at,
                )
            })
            .await;

        match &result {
            Ok(entry) => tracing::info!(
                opportunity_id = %entry.opportunity_id,
                from_stage_id = ?entry.from_stage_id,
                to_stage_id = %entry.to_stage_id,
                "recorded stage move"
            ),
            Err(error) => tracing::warn!(opportunity_id = %opportunity_id, error = %error, "stage move rejected"),
        }
        result
    }

    pub async fn get_opportunity_history(&self, opportunity_id: &str) -> AppResult<Vec<StageHistoryEntry>> {
        let id = opportunity_id.to_string();
        self.fetch(move |db| {
            if db.get_opportunity(&id)?.is_none() {
                return Err(AppError::not_found("opportunity", &id));
            }
            db.list_opportunity_history(&id)
        })
        .await
    }

    pub async fn get_stage_pass_through_rate(
        &self,
        stage_id: &str,
        window: DateWindow,
    ) -> AppResult<PassThroughRateData> {
        let snapshot = self.stage_snapshot(stage_id).await?;
        let stage = snapshot_stage(&snapshot, stage_id)?;
        let rate = compute_stage_pass_through(stage, &snapshot.opportunities, &snapshot.history, &window);
        tracing::debug!(
            stage_id = %stage_id,
            entries = rate.entries_count,
            exits = rate.exits_count,
            rate = rate.pass_through_rate,
            "computed stage pass-through"
        );
        Ok(rate)
    }

    pub async fn get_funnel_pass_through_rates(
        &self,
        funnel_id: &str,
        window: DateWindow,
    ) -> AppResult<FunnelPassThroughData> {
        self.get_funnel_pass_through_rates_at(funnel_id, window, Utc::now()).await
    }

    pub async fn get_funnel_pass_through_rates_at(
        &self,
        funnel_id: &str,
        window: DateWindow,
        now: DateTime<Utc>,
    ) -> AppResult<FunnelPassThroughData> {
        let snapshot = self.funnel_snapshot(funnel_id).await?;
        Ok(compute_funnel_pass_through(
            funnel_id,
            &snapshot.stages,
            &snapshot.opportunities,
            &snapshot.history,
            &window,
            now,
        ))
    }

    pub async fn get_funnel_average_velocity(&self, funnel_id: &str, window: DateWindow) -> AppResult<f64> {
        self.get_funnel_average_velocity_at(funnel_id, window, Utc::now()).await
    }

    pub async fn get_funnel_average_velocity_at(
        &self,
        funnel_id: &str,
        window: DateWindow,
        now: DateTime<Utc>,
    ) -> AppResult<f64> {
        let snapshot = self.funnel_snapshot(funnel_id).await?;
        let average = compute_funnel_average_velocity(&snapshot.stages, &snapshot.history, &window, now);
        tracing::debug!(funnel_id = %funnel_id, average, "computed funnel average velocity");
        Ok(average)
    }

    pub async fn get_stage_velocity(&self, stage_id: &str, window: DateWindow) -> AppResult<StageVelocityData> {
        self.get_stage_velocity_at(stage_id, window, Utc::now()).await
    }

    pub async fn get_stage_velocity_at(
        &self,
        stage_id: &str,
        window: DateWindow,
        now: DateTime<Utc>,
    ) -> AppResult<StageVelocityData> {
        let snapshot = self.stage_snapshot(stage_id).await?;
        snapshot_stage(&snapshot, stage_id)?;
        let velocity = compute_stage_velocity(stage_id, &snapshot.history, &window, now);
        tracing::debug!(
            stage_id = %stage_id,
            average_days = velocity.average_days_in_stage,
            total = velocity.total_opportunities,
            "computed stage velocity"
        );
        Ok(velocity)
    }

    pub async fn list_stage_alerts(&self, funnel_id: &str) -> AppResult<FunnelAlertBoard> {
        self.list_stage_alerts_at(funnel_id, Utc::now()).await
    }

    pub async fn list_stage_alerts_at(&self, funnel_id: &str, now: DateTime<Utc>) -> AppResult<FunnelAlertBoard> {
        let snapshot = self.funnel_snapshot(funnel_id).await?;
        let alerts = collect_alerts(&snapshot.stages, &snapshot.opportunities, now);
        tracing::debug!(funnel_id = %funnel_id, alerts = alerts.len(), "computed stage alerts");
        Ok(FunnelAlertBoard {
            funnel_id: funnel_id.to_string(),
            alerts,
        })
    }

    async fn funnel_snapshot(&self, funnel_id: &str) -> AppResult<FunnelSnapshot> {
        let id = funnel_id.to_string();
        self.fetch(move |db| db.load_funnel_snapshot(&id)).await
    }

    async fn stage_snapshot(&self, stage_id: &str) -> AppResult<FunnelSnapshot> {
        let id = stage_id.to_string();
        self.fetch(move |db| db.load_stage_snapshot(&id)).await
    }
}

fn snapshot_stage<'a>(snapshot: &'a FunnelSnapshot, stage_id: &str) -> AppResult<&'a Stage> {
    snapshot
        .stage(stage_id)
        .ok_or_else(|| AppError::not_found("stage", stage_id))
}

#[cfg(test)]
mod tests {
    use super::PipelineCore;
    use crate::db::Database;
    use crate::errors::AppError;
    use crate::models::{CreateOpportunityPayload, DateWindow, MigrateOpportunityPayload, RecordStageMovePayload};
    use chrono::{Duration, Utc};

    fn core() -> (tempfile::TempDir, PipelineCore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("pipeline.db")).expect("db");
        (dir, PipelineCore::new(db))
    }

    #[tokio::test]
    async fn unknown_ids_surface_as_not_found() {
        let (_dir, core) = core();
        let window = DateWindow::all_time();

        assert!(matches!(
            core.get_stage_pass_through_rate("missing", window).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            core.get_funnel_pass_through_rates("missing", window).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            core.get_funnel_average_velocity("missing", window).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(core.get_stage_velocity("missing", window).await, Err(AppError::NotFound(_))));
        assert!(matches!(core.get_opportunity_history("missing").await, Err(AppError::NotFound(_))));
        assert!(matches!(core.list_stage_alerts("missing").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn empty_funnel_reports_zeroes() {
        let (_dir, core) = core();
        let funnel = core.create_funnel("Sales").await.expect("funnel");
        let lead = core.add_stage(&funnel.id, "Lead", None).await.expect("lead");

        let rate = core
            .get_stage_pass_through_rate(&lead.id, DateWindow::all_time())
            .await
            .expect("rate");
        assert_eq!((rate.entries_count, rate.exits_count, rate.current_count), (0, 0, 0));
        assert_eq!(rate.pass_through_rate, 0.0);

        let velocity = core.get_stage_velocity(&lead.id, DateWindow::all_time()).await.expect("velocity");
        assert_eq!(velocity.total_opportunities, 0);
        assert_eq!(
            core.get_funnel_average_velocity(&funnel.id, DateWindow::all_time())
                .await
                .expect("average"),
            0.0
        );
    }

    #[tokio::test]
    async fn migration_links_new_opportunity_to_its_source() {
        let (_dir, core) = core();
        let sales = core.create_funnel("Sales").await.expect("funnel");
        let onboarding = core.create_funnel("Onboarding").await.expect("funnel");
        let won = core.add_stage(&sales.id, "Won", None).await.expect("won");
        let kickoff = core.add_stage(&onboarding.id, "Kickoff", None).await.expect("kickoff");

        let source = core
            .create_opportunity(CreateOpportunityPayload {
                funnel_id: sales.id.clone(),
                stage_id: won.id.clone(),
                title: "Acme".to_string(),
                user_id: None,
            })
            .await
            .expect("opportunity");
        let migrated = core
            .migrate_opportunity(MigrateOpportunityPayload {
                opportunity_id: source.id.clone(),
                target_funnel_id: onboarding.id.clone(),
                target_stage_id: kickoff.id.clone(),
                user_id: Some("automation".to_string()),
            })
            .await
            .expect("migrate");

        assert_ne!(migrated.id, source.id);
        assert_eq!(migrated.source_opportunity_id.as_deref(), Some(source.id.as_str()));
        assert_eq!(migrated.title, "Acme");
        let history = core.get_opportunity_history(&migrated.id).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_stage_id, None);
        assert_eq!(history[0].user_id.as_deref(), Some("automation"));

        let untouched = core.get_opportunity_history(&source.id).await.expect("history");
        assert_eq!(untouched.len(), 1);
    }

    #[tokio::test]
    async fn alert_board_follows_recorded_moves() {
        let (_dir, core) = core();
        let funnel = core.create_funnel("Sales").await.expect("funnel");
        let config = crate::models::StageAlertConfig {
            enabled: true,
            max_days_in_stage: 3,
        };
        let lead = core.add_stage(&funnel.id, "Lead", Some(config)).await.expect("lead");
        let demo = core.add_stage(&funnel.id, "Demo", None).await.expect("demo");
        let now = Utc::now();

        let stale = core
            .create_opportunity_at(
                CreateOpportunityPayload {
                    funnel_id: funnel.id.clone(),
                    stage_id: lead.id.clone(),
                    title: "Stale".to_string(),
                    user_id: None,
                },
                now - Duration::days(8),
            )
            .await
            .expect("stale");
        let moved = core
            .create_opportunity_at(
                CreateOpportunityPayload {
                    funnel_id: funnel.id.clone(),
                    stage_id: lead.id.clone(),
                    title: "Moved".to_string(),
                    user_id: None,
                },
                now - Duration::days(8),
            )
            .await
            .expect("moved");
        core.record_stage_move_at(
            RecordStageMovePayload {
                opportunity_id: moved.id.clone(),
                from_stage_id: Some(lead.id.clone()),
                to_stage_id: demo.id.clone(),
                user_id: None,
            },
            now - Duration::days(1),
        )
        .await
        .expect("move");

        let board = core.list_stage_alerts_at(&funnel.id, now).await.expect("board");
        assert_eq!(board.alerts.len(), 1);
        assert_eq!(board.alerts[0].opportunity_id, stale.id);
        assert_eq!(board.alerts[0].message, "5d overdue");

        let set = core.set_stage_alert_config(&lead.id, None).await.expect("config");
        assert!(set.alert_config.is_none());
        let board = core.list_stage_alerts_at(&funnel.id, now).await.expect("board");
        assert!(board.alerts.is_empty());
    }
}
