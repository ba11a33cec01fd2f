use crate::errors::{AppError, AppResult};
use crate::models::{Funnel, FunnelSnapshot, Opportunity, Stage, StageAlertConfig, StageHistoryEntry};
use chrono::{DateTime, Duration, DurationRound, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const STAGE_COLUMNS: &str = "id, funnel_id, name, position, alert_config_json";
const OPPORTUNITY_COLUMNS: &str =
    "id, title, funnel_id, stage_id, created_at, last_stage_change_at, source_opportunity_id";
const HISTORY_COLUMNS: &str = "id, opportunity_id, from_stage_id, to_stage_id, moved_at, user_id";

/// SQLite-backed store for funnels, stages, opportunities and the append-only
/// stage history ledger.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn insert_funnel(&self, name: &str) -> AppResult<Funnel> {
        let funnel = Funnel {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            created_at: stored_precision(Utc::now())?,
        };
        if funnel.name.is_empty() {
            return Err(AppError::Validation("funnel name must not be empty".to_string()));
        }

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO funnels (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![funnel.id, funnel.name, format_time(funnel.created_at)],
        )?;
        Ok(funnel)
    }

    pub fn get_funnel(&self, funnel_id: &str) -> AppResult<Option<Funnel>> {
        let conn = self.lock()?;
        select_funnel(&conn, funnel_id)
    }

    pub fn list_funnels(&self) -> AppResult<Vec<Funnel>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare("SELECT id, name, created_at FROM funnels ORDER BY created_at ASC, id ASC")?;
        let funnels = statement
            .query_map([], parse_funnel_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(funnels)
    }

    /// Appends a stage at the end of the funnel's ordering.
    pub fn insert_stage(
        &self,
        funnel_id: &str,
        name: &str,
        alert_config: Option<StageAlertConfig>,
    ) -> AppResult<Stage> {
        let conn = self.lock()?;
        if select_funnel(&conn, funnel_id)?.is_none() {
            return Err(AppError::not_found("funnel", funnel_id));
        }
        let position: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM stages WHERE funnel_id = ?1",
            [funnel_id],
            |row| row.get(0),
        )?;

        let stage = Stage {
            id: Uuid::new_v4().to_string(),
            funnel_id: funnel_id.to_string(),
            name: name.trim().to_string(),
            position,
            alert_config,
        };
        conn.execute(
            "INSERT INTO stages (id, funnel_id, name, position, alert_config_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                stage.id,
                stage.funnel_id,
                stage.name,
                stage.position,
                alert_config.map(|config| serde_json::to_string(&config)).transpose()?,
            ],
        )?;
        Ok(stage)
    }

    pub fn update_stage_alert_config(
        &self,
        stage_id: &str,
        alert_config: Option<StageAlertConfig>,
    ) -> AppResult<Option<Stage>> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE stages SET alert_config_json = ?1 WHERE id = ?2",
            params![
                alert_config.map(|config| serde_json::to_string(&config)).transpose()?,
                stage_id
            ],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        select_stage(&conn, stage_id)
    }

    pub fn get_stage(&self, stage_id: &str) -> AppResult<Option<Stage>> {
        let conn = self.lock()?;
        select_stage(&conn, stage_id)
    }

    pub fn list_stages(&self, funnel_id: &str) -> AppResult<Vec<Stage>> {
        let conn = self.lock()?;
        select_stages(&conn, funnel_id)
    }

    /// Creates an opportunity and records its initial funnel entry in one transaction.
    pub fn insert_opportunity(
        &self,
        funnel_id: &str,
        stage_id: &str,
        title: &str,
        source_opportunity_id: Option<&str>,
        user_id: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> AppResult<(Opportunity, StageHistoryEntry)> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AppError::Validation("opportunity title must not be empty".to_string()));
        }
        let created_at = stored_precision(created_at)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let stage = select_stage(&tx, stage_id)?.ok_or_else(|| AppError::not_found("stage", stage_id))?;
        if stage.funnel_id != funnel_id {
            return Err(AppError::Validation(format!(
                "stage '{}' does not belong to funnel '{}'",
                stage_id, funnel_id
            )));
        }
        if let Some(source_id) = source_opportunity_id {
            if select_opportunity(&tx, source_id)?.is_none() {
                return Err(AppError::not_found("opportunity", source_id));
            }
        }

        let opportunity = Opportunity {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            funnel_id: funnel_id.to_string(),
            stage_id: stage_id.to_string(),
            created_at,
            last_stage_change_at: None,
            source_opportunity_id: source_opportunity_id.map(ToString::to_string),
        };
        tx.execute(
            "INSERT INTO opportunities (id, title, funnel_id, stage_id, created_at, last_stage_change_at, source_opportunity_id)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)",
            params![
                opportunity.id,
                opportunity.title,
                opportunity.funnel_id,
                opportunity.stage_id,
                format_time(opportunity.created_at),
                opportunity.source_opportunity_id,
            ],
        )?;
        let entry = append_history(&tx, &opportunity.id, None, stage_id, created_at, user_id)?;
        tx.commit()?;

        Ok((opportunity, entry))
    }

    pub fn get_opportunity(&self, opportunity_id: &str) -> AppResult<Option<Opportunity>> {
        let conn = self.lock()?;
        select_opportunity(&conn, opportunity_id)
    }

    pub fn list_opportunities(&self, funnel_id: &str) -> AppResult<Vec<Opportunity>> {
        let conn = self.lock()?;
        select_opportunities(&conn, funnel_id)
    }

    /// Appends a transition and moves the opportunity, atomically.
    ///
    /// `from_stage_id == None` is only accepted as the first entry of an
    /// opportunity without history; otherwise it must name the current stage.
    pub fn record_stage_move(
        &self,
        opportunity_id: &str,
        from_stage_id: Option<&str>,
        to_stage_id: &str,
        user_id: Option<&str>,
        moved_at: DateTime<Utc>,
    ) -> AppResult<StageHistoryEntry> {
        let moved_at = stored_precision(moved_at)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let opportunity = select_opportunity(&tx, opportunity_id)?
            .ok_or_else(|| AppError::not_found("opportunity", opportunity_id))?;
        let target = select_stage(&tx, to_stage_id)?.ok_or_else(|| AppError::not_found("stage", to_stage_id))?;
        if target.funnel_id != opportunity.funnel_id {
            return Err(AppError::Validation(format!(
                "stage '{}' belongs to another funnel than opportunity '{}'",
                to_stage_id, opportunity_id
            )));
        }
        if moved_at < opportunity.created_at {
            return Err(AppError::Validation(format!(
                "move of opportunity '{}' predates its creation",
                opportunity_id
            )));
        }

        let (history_len, latest): (i64, Option<String>) = tx.query_row(
            "SELECT COUNT(*), MAX(moved_at) FROM stage_history WHERE opportunity_id = ?1",
            [opportunity_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if let Some(latest) = latest.map(|raw| parse_time(&raw)).transpose()? {
            if moved_at < latest {
                return Err(AppError::Validation(format!(
                    "move of opportunity '{}' predates its latest transition at {}",
                    opportunity_id,
                    format_time(latest)
                )));
            }
        }
        match from_stage_id {
            None if history_len > 0 => {
                return Err(AppError::Validation(format!(
                    "opportunity '{}' already entered its funnel; a source stage is required",
                    opportunity_id
                )));
            }
            Some(from) if from != opportunity.stage_id => {
                return Err(AppError::Validation(format!(
                    "opportunity '{}' is in stage '{}', not '{}'",
                    opportunity_id, opportunity.stage_id, from
                )));
            }
            Some(from) if from == to_stage_id => {
                return Err(AppError::Validation(format!(
                    "opportunity '{}' is already in stage '{}'",
                    opportunity_id, to_stage_id
                )));
            }
            _ => {}
        }

        let entry = append_history(&tx, opportunity_id, from_stage_id, to_stage_id, moved_at, user_id)?;
        tx.execute(
            "UPDATE opportunities SET stage_id = ?1, last_stage_change_at = ?2 WHERE id = ?3",
            params![to_stage_id, format_time(moved_at), opportunity_id],
        )?;
        tx.commit()?;
        Ok(entry)
    }

    pub fn list_opportunity_history(&self, opportunity_id: &str) -> AppResult<Vec<StageHistoryEntry>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {} FROM stage_history WHERE opportunity_id = ?1 ORDER BY moved_at ASC, rowid ASC",
            HISTORY_COLUMNS
        ))?;
        let entries = statement
            .query_map([opportunity_id], parse_history_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Funnel, stages, opportunities and history read under one lock.
    pub fn load_funnel_snapshot(&self, funnel_id: &str) -> AppResult<FunnelSnapshot> {
        let conn = self.lock()?;
        if select_funnel(&conn, funnel_id)?.is_none() {
            return Err(AppError::not_found("funnel", funnel_id));
        }

        let mut statement = conn.prepare(&format!(
            "SELECT {} FROM stage_history
             WHERE opportunity_id IN (SELECT id FROM opportunities WHERE funnel_id = ?1)
             ORDER BY moved_at ASC, rowid ASC",
            HISTORY_COLUMNS
        ))?;
        let history = statement
            .query_map([funnel_id], parse_history_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(FunnelSnapshot {
            funnel_id: funnel_id.to_string(),
            stages: select_stages(&conn, funnel_id)?,
            opportunities: select_opportunities(&conn, funnel_id)?,
            history,
        })
    }

    /// Snapshot of the funnel owning `stage_id`.
    pub fn load_stage_snapshot(&self, stage_id: &str) -> AppResult<FunnelSnapshot> {
        let stage = self
            .get_stage(stage_id)?
            .ok_or_else(|| AppError::not_found("stage", stage_id))?;
        self.load_funnel_snapshot(&stage.funnel_id)
    }
}

fn append_history(
    tx: &Transaction<'_>,
    opportunity_id: &str,
    from_stage_id: Option<&str>,
    to_stage_id: &str,
    moved_at: DateTime<Utc>,
    user_id: Option<&str>,
) -> AppResult<StageHistoryEntry> {
    let entry = StageHistoryEntry {
        id: Uuid::new_v4().to_string(),
        opportunity_id: opportunity_id.to_string(),
        from_stage_id: from_stage_id.map(ToString::to_string),
        to_stage_id: to_stage_id.to_string(),
        moved_at,
        user_id: user_id.map(ToString::to_string),
    };
    tx.execute(
        "INSERT INTO stage_history (id, opportunity_id, from_stage_id, to_stage_id, moved_at, user_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.id,
            entry.opportunity_id,
            entry.from_stage_id,
            entry.to_stage_id,
            format_time(entry.moved_at),
            entry.user_id,
        ],
    )?;
    Ok(entry)
}

fn select_funnel(conn: &Connection, funnel_id: &str) -> AppResult<Option<Funnel>> {
    conn.query_row(
        "SELECT id, name, created_at FROM funnels WHERE id = ?1",
        [funnel_id],
        parse_funnel_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn select_stage(conn: &Connection, stage_id: &str) -> AppResult<Option<Stage>> {
    conn.query_row(
        &format!("SELECT {} FROM stages WHERE id = ?1", STAGE_COLUMNS),
        [stage_id],
        parse_stage_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn select_stages(conn: &Connection, funnel_id: &str) -> AppResult<Vec<Stage>> {
    let mut statement = conn.prepare(&format!(
        "SELECT {} FROM stages WHERE funnel_id = ?1 ORDER BY position ASC, id ASC",
        STAGE_COLUMNS
    ))?;
    let stages = statement
        .query_map([funnel_id], parse_stage_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(stages)
}

fn select_opportunity(conn: &Connection, opportunity_id: &str) -> AppResult<Option<Opportunity>> {
    conn.query_row(
        &format!("SELECT {} FROM opportunities WHERE id = ?1", OPPORTUNITY_COLUMNS),
        [opportunity_id],
        parse_opportunity_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn select_opportunities(conn: &Connection, funnel_id: &str) -> AppResult<Vec<Opportunity>> {
    let mut statement = conn.prepare(&format!(
        "SELECT {} FROM opportunities WHERE funnel_id = ?1 ORDER BY created_at ASC, id ASC",
        OPPORTUNITY_COLUMNS
    ))?;
    let opportunities = statement
        .query_map([funnel_id], parse_opportunity_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(opportunities)
}

fn parse_funnel_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Funnel> {
    Ok(Funnel {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: parse_time(&row.get::<_, String>(2)?)?,
    })
}

fn parse_stage_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Stage> {
    Ok(Stage {
        id: row.get(0)?,
        funnel_id: row.get(1)?,
        name: row.get(2)?,
        position: row.get(3)?,
        alert_config: row
            .get::<_, Option<String>>(4)?
            .map(|raw| parse_alert_config(&raw))
            .transpose()?,
    })
}

fn parse_opportunity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Opportunity> {
    Ok(Opportunity {
        id: row.get(0)?,
        title: row.get(1)?,
        funnel_id: row.get(2)?,
        stage_id: row.get(3)?,
        created_at: parse_time(&row.get::<_, String>(4)?)?,
        last_stage_change_at: row
            .get::<_, Option<String>>(5)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        source_opportunity_id: row.get(6)?,
    })
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StageHistoryEntry> {
    Ok(StageHistoryEntry {
        id: row.get(0)?,
        opportunity_id: row.get(1)?,
        from_stage_id: row.get(2)?,
        to_stage_id: row.get(3)?,
        moved_at: parse_time(&row.get::<_, String>(4)?)?,
        user_id: row.get(5)?,
    })
}

fn parse_alert_config(raw: &str) -> rusqlite::Result<StageAlertConfig> {
    serde_json::from_str(raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(error))
    })
}

/// Timestamps are persisted with microsecond precision; values handed back to
/// callers are cut to the same precision so they compare equal to re-read rows.
fn stored_precision(at: DateTime<Utc>) -> AppResult<DateTime<Utc>> {
    at.duration_trunc(Duration::microseconds(1))
        .map_err(|error| AppError::Internal(format!("timestamp truncation failed: {}", error)))
}

/// Fixed-width timestamps so text ordering matches time ordering.
fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}
