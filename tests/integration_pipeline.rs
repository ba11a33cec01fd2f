use chrono::{DateTime, Duration, DurationRound, Utc};
use pipeline_analytics::db::Database;
use pipeline_analytics::models::{
    CreateOpportunityPayload, DateWindow, Funnel, Opportunity, RecordStageMovePayload, Stage, StageAlertConfig,
};
use pipeline_analytics::{AppError, PipelineCore};

struct Fixture {
    _dir: tempfile::TempDir,
    core: PipelineCore,
    funnel: Funnel,
    stages: Vec<Stage>,
    now: DateTime<Utc>,
}

async fn fixture(stage_names: &[&str]) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::new(&dir.path().join("pipeline.db")).expect("db");
    let core = PipelineCore::new(db);
    let funnel = core.create_funnel("Sales").await.expect("funnel");
    let mut stages = Vec::new();
    for name in stage_names {
        stages.push(core.add_stage(&funnel.id, name, None).await.expect("stage"));
    }
    let now = Utc::now().duration_trunc(Duration::seconds(1)).expect("trunc");
    Fixture {
        _dir: dir,
        core,
        funnel,
        stages,
        now,
    }
}

impl Fixture {
    async fn opportunity(&self, title: &str, stage: usize, days_ago: i64) -> Opportunity {
        self.core
            .create_opportunity_at(
                CreateOpportunityPayload {
                    funnel_id: self.funnel.id.clone(),
                    stage_id: self.stages[stage].id.clone(),
                    title: title.to_string(),
                    user_id: None,
                },
                self.now - Duration::days(days_ago),
            )
            .await
            .expect("opportunity")
    }

    async fn advance(&self, opportunity: &Opportunity, from: usize, to: usize, days_ago: i64) {
        self.core
            .record_stage_move_at(
                RecordStageMovePayload {
                    opportunity_id: opportunity.id.clone(),
                    from_stage_id: Some(self.stages[from].id.clone()),
                    to_stage_id: self.stages[to].id.clone(),
                    user_id: Some("rep-1".to_string()),
                },
                self.now - Duration::days(days_ago),
            )
            .await
            .expect("move");
    }
}

#[tokio::test]
async fn ten_entries_four_exits_is_forty_percent() {
    let fx = fixture(&["Lead", "Demo"]).await;
    for index in 0..10 {
        let deal = fx.opportunity(&format!("Deal {}", index), 0, 20).await;
        if index < 4 {
            fx.advance(&deal, 0, 1, 5).await;
        }
    }

    let rate = fx
        .core
        .get_stage_pass_through_rate(&fx.stages[0].id, DateWindow::all_time())
        .await
        .expect("rate");
    assert_eq!(rate.entries_count, 10);
    assert_eq!(rate.exits_count, 4);
    assert_eq!(rate.pass_through_rate, 40.0);
    assert_eq!(rate.current_count, 6);
    assert_eq!(rate.stage_name, "Lead");
}

#[tokio::test]
async fn window_bounds_are_inclusive_and_occupancy_is_live() {
    let fx = fixture(&["Lead", "Demo"]).await;
    let early = fx.opportunity("Early", 0, 30).await;
    let late = fx.opportunity("Late", 0, 3).await;
    fx.advance(&early, 0, 1, 10).await;
    fx.advance(&late, 0, 1, 1).await;

    let window = DateWindow::between(Some(fx.now - Duration::days(10)), Some(fx.now - Duration::days(3)));
    let lead = fx
        .core
        .get_stage_pass_through_rate(&fx.stages[0].id, window)
        .await
        .expect("rate");
    // entry of "Late" and exit of "Early" sit exactly on the bounds
    assert_eq!(lead.entries_count, 1);
    assert_eq!(lead.exits_count, 1);
    assert_eq!(lead.pass_through_rate, 100.0);

    let demo = fx
        .core
        .get_stage_pass_through_rate(&fx.stages[1].id, window)
        .await
        .expect("rate");
    assert_eq!(demo.entries_count, 1);
    assert_eq!(demo.current_count, 2);

    let empty = DateWindow::between(Some(fx.now + Duration::days(1)), None);
    let none = fx
        .core
        .get_stage_pass_through_rate(&fx.stages[0].id, empty)
        .await
        .expect("rate");
    assert_eq!(none.entries_count, 0);
    assert_eq!(none.pass_through_rate, 0.0);
}

#[tokio::test]
async fn funnel_velocity_is_sum_of_three_stage_averages() {
    let fx = fixture(&["Lead", "Demo", "Won"]).await;
    let first = fx.opportunity("First", 0, 20).await;
    let second = fx.opportunity("Second", 0, 12).await;
    // lead: 4 and 2 days -> 3
    fx.advance(&first, 0, 1, 16).await;
    fx.advance(&second, 0, 1, 10).await;
    // demo: 6 and 4 days -> 5
    fx.advance(&first, 1, 2, 10).await;
    fx.advance(&second, 1, 2, 6).await;
    // won: open for 10 and 6 days -> 8

    let funnel = fx
        .core
        .get_funnel_pass_through_rates_at(&fx.funnel.id, DateWindow::all_time(), fx.now)
        .await
        .expect("funnel");
    let velocities = [3.0, 5.0, 8.0];
    for (stage, expected) in fx.stages.iter().zip(velocities) {
        let velocity = fx
            .core
            .get_stage_velocity_at(&stage.id, DateWindow::all_time(), fx.now)
            .await
            .expect("velocity");
        assert!((velocity.average_days_in_stage - expected).abs() < 1e-9, "{}", stage.name);
        assert_eq!(velocity.total_opportunities, 2);
    }
    assert!((funnel.average_velocity - 16.0).abs() < 1e-9);
    assert_eq!(funnel.overall_conversion_rate, 100.0);
    assert_eq!(
        funnel.stages.iter().map(|rate| rate.stage_name.as_str()).collect::<Vec<_>>(),
        vec!["Lead", "Demo", "Won"]
    );

    let mean = fx
        .core
        .get_funnel_average_velocity_at(&fx.funnel.id, DateWindow::all_time(), fx.now)
        .await
        .expect("average");
    assert!((mean - 16.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn repeated_queries_are_idempotent() {
    let fx = fixture(&["Lead", "Demo"]).await;
    let deal = fx.opportunity("Deal", 0, 9).await;
    fx.advance(&deal, 0, 1, 4).await;

    let first = fx
        .core
        .get_funnel_pass_through_rates_at(&fx.funnel.id, DateWindow::all_time(), fx.now)
        .await
        .expect("first");
    let (second, third) = tokio::join!(
        fx.core
            .get_funnel_pass_through_rates_at(&fx.funnel.id, DateWindow::all_time(), fx.now),
        fx.core
            .get_funnel_pass_through_rates_at(&fx.funnel.id, DateWindow::all_time(), fx.now),
    );
    assert_eq!(first, second.expect("second"));
    assert_eq!(first, third.expect("third"));
}

#[tokio::test]
async fn history_is_chronological_and_moves_are_validated() {
    let fx = fixture(&["Lead", "Demo", "Won"]).await;
    let deal = fx.opportunity("Deal", 0, 9).await;
    fx.advance(&deal, 0, 1, 6).await;
    fx.advance(&deal, 1, 2, 2).await;

    let history = fx.core.get_opportunity_history(&deal.id).await.expect("history");
    let path: Vec<(Option<&str>, &str)> = history
        .iter()
        .map(|entry| (entry.from_stage_id.as_deref(), entry.to_stage_id.as_str()))
        .collect();
    assert_eq!(
        path,
        vec![
            (None, fx.stages[0].id.as_str()),
            (Some(fx.stages[0].id.as_str()), fx.stages[1].id.as_str()),
            (Some(fx.stages[1].id.as_str()), fx.stages[2].id.as_str()),
        ]
    );
    assert!(history.windows(2).all(|pair| pair[0].moved_at <= pair[1].moved_at));

    let stale = fx
        .core
        .record_stage_move(RecordStageMovePayload {
            opportunity_id: deal.id.clone(),
            from_stage_id: Some(fx.stages[0].id.clone()),
            to_stage_id: fx.stages[1].id.clone(),
            user_id: None,
        })
        .await;
    assert!(matches!(stale, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn overdue_opportunities_show_on_alert_board() {
    let fx = fixture(&["Lead"]).await;
    fx.core
        .set_stage_alert_config(
            &fx.stages[0].id,
            Some(StageAlertConfig {
                enabled: true,
                max_days_in_stage: 5,
            }),
        )
        .await
        .expect("config");
    fx.opportunity("Overdue", 0, 7).await;
    fx.opportunity("Due", 0, 5).await;
    fx.opportunity("Fresh", 0, 1).await;

    let board = fx.core.list_stage_alerts_at(&fx.funnel.id, fx.now).await.expect("board");
    let labels: Vec<(&str, &str)> = board
        .alerts
        .iter()
        .map(|alert| (alert.opportunity_title.as_str(), alert.message.as_str()))
        .collect();
    assert_eq!(labels, vec![("Overdue", "2d overdue"), ("Due", "Alert")]);
}

#[tokio::test]
async fn backdated_move_keeps_ledger_and_stage_in_step() {
    let fx = fixture(&["Lead", "Demo", "Won"]).await;
    let deal = fx.opportunity("Deal", 0, 10).await;
    fx.advance(&deal, 0, 1, 2).await;

    let backdated = fx
        .core
        .record_stage_move_at(
            RecordStageMovePayload {
                opportunity_id: deal.id.clone(),
                from_stage_id: Some(fx.stages[1].id.clone()),
                to_stage_id: fx.stages[2].id.clone(),
                user_id: None,
            },
            fx.now - Duration::days(5),
        )
        .await;
    assert!(matches!(backdated, Err(AppError::Validation(_))));

    let history = fx.core.get_opportunity_history(&deal.id).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].to_stage_id, fx.stages[1].id);

    let funnel = fx
        .core
        .get_funnel_pass_through_rates_at(&fx.funnel.id, DateWindow::all_time(), fx.now)
        .await
        .expect("funnel");
    let occupancy: Vec<u64> = funnel.stages.iter().map(|rate| rate.current_count).collect();
    assert_eq!(occupancy, vec![0, 1, 0]);
}

#[tokio::test]
async fn recorded_move_equals_its_history_row() {
    let fx = fixture(&["Lead", "Demo"]).await;
    let deal = fx.opportunity("Deal", 0, 3).await;

    let entry = fx
        .core
        .record_stage_move(RecordStageMovePayload {
            opportunity_id: deal.id.clone(),
            from_stage_id: Some(fx.stages[0].id.clone()),
            to_stage_id: fx.stages[1].id.clone(),
            user_id: Some("rep-1".to_string()),
        })
        .await
        .expect("move");

    let history = fx.core.get_opportunity_history(&deal.id).await.expect("history");
    assert_eq!(history.last(), Some(&entry));
}
