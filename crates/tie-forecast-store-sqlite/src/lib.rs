#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tie_forecast_core::{
    format_rfc3339, normalize_participant_id, now_utc, parse_rfc3339_utc, seed_round, Actor,
    ForecastError, ForecastState, ForecastView, ParticipantProfile, Prediction,
    PredictionSubmission, ResultEntry, Score, Tie, TieId, TournamentConfig,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

const FORECAST_MIGRATION_VERSION: i64 = 1;

const SCHEMA_FORECAST_V1: &str = r"
CREATE TABLE IF NOT EXISTS tournament_config (
  config_id INTEGER PRIMARY KEY CHECK (config_id = 1),
  config_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS participants (
  participant_id TEXT PRIMARY KEY,
  email TEXT,
  password_hash TEXT,
  reset_token TEXT,
  reset_token_expires_at TEXT,
  language TEXT,
  needs_profile_completion INTEGER NOT NULL CHECK (needs_profile_completion IN (0, 1)),
  registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ties (
  tie_id INTEGER PRIMARY KEY CHECK (tie_id >= 0),
  team_a TEXT NOT NULL,
  team_b TEXT NOT NULL,
  leg1_deadline TEXT,
  leg2_deadline TEXT,
  actual_leg1_home INTEGER CHECK (actual_leg1_home >= 0 OR actual_leg1_home IS NULL),
  actual_leg1_away INTEGER CHECK (actual_leg1_away >= 0 OR actual_leg1_away IS NULL),
  actual_leg2_home INTEGER CHECK (actual_leg2_home >= 0 OR actual_leg2_home IS NULL),
  actual_leg2_away INTEGER CHECK (actual_leg2_away >= 0 OR actual_leg2_away IS NULL)
);

CREATE TABLE IF NOT EXISTS predictions (
  participant_id TEXT NOT NULL,
  tie_key TEXT NOT NULL,
  leg1_home INTEGER CHECK (leg1_home >= 0 OR leg1_home IS NULL),
  leg1_away INTEGER CHECK (leg1_away >= 0 OR leg1_away IS NULL),
  leg2_home INTEGER CHECK (leg2_home >= 0 OR leg2_home IS NULL),
  leg2_away INTEGER CHECK (leg2_away >= 0 OR leg2_away IS NULL),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (participant_id, tie_key),
  FOREIGN KEY (participant_id) REFERENCES participants(participant_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_predictions_tie_key
  ON predictions(tie_key);

CREATE TABLE IF NOT EXISTS state_extras (
  extra_key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS submission_log (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  participant_id TEXT NOT NULL,
  tie_id INTEGER NOT NULL,
  actor TEXT NOT NULL CHECK (actor IN ('participant', 'administrator')),
  leg1_home INTEGER,
  leg1_away INTEGER,
  leg2_home INTEGER,
  leg2_away INTEGER,
  as_of TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_submission_log_no_update
BEFORE UPDATE ON submission_log
BEGIN
  SELECT RAISE(FAIL, 'submission_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_submission_log_no_delete
BEFORE DELETE ON submission_log
BEGIN
  SELECT RAISE(FAIL, 'submission_log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_submission_log_participant_seq
  ON submission_log(participant_id, entry_seq);
";

/// Persistent store for tournament state.
///
/// Every write runs in its own transaction and drops the cached snapshot.
/// Commits from other connections are detected through `PRAGMA data_version`.
pub struct SqliteForecastStore {
    conn: Connection,
    snapshot: Option<CachedSnapshot>,
}

struct CachedSnapshot {
    data_version: i64,
    state: Arc<ForecastState>,
}

/// Fields accepted when creating or editing a tie.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TieDraft {
    pub team_a: String,
    pub team_b: String,
    pub leg1_deadline: Option<OffsetDateTime>,
    pub leg2_deadline: Option<OffsetDateTime>,
}

impl TieDraft {
    fn validate(&self) -> Result<(), ForecastError> {
        if self.team_a.trim().is_empty() || self.team_b.trim().is_empty() {
            return Err(ForecastError::Validation(
                "both team names MUST be provided".to_string(),
            ));
        }
        if self.team_a.trim() == self.team_b.trim() {
            return Err(ForecastError::Validation(
                "a tie needs two distinct teams".to_string(),
            ));
        }
        Ok(())
    }
}

/// Changes to an existing tie. `None` keeps the stored value; a deadline of
/// `Some(None)` is cleared, after which that leg never locks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TieEdit {
    pub team_a: Option<String>,
    pub team_b: Option<String>,
    pub leg1_deadline: Option<Option<OffsetDateTime>>,
    pub leg2_deadline: Option<Option<OffsetDateTime>>,
}

impl TieEdit {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn merged_with(&self, existing: &Tie) -> TieDraft {
        TieDraft {
            team_a: self
                .team_a
                .clone()
                .unwrap_or_else(|| existing.team_a.clone()),
            team_b: self
                .team_b
                .clone()
                .unwrap_or_else(|| existing.team_b.clone()),
            leg1_deadline: self.leg1_deadline.unwrap_or(existing.leg1_deadline),
            leg2_deadline: self.leg2_deadline.unwrap_or(existing.leg2_deadline),
        }
    }
}

/// Profile fields a participant can change. `None` leaves a field as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub language: Option<String>,
}

impl ProfileUpdate {
    fn apply(&self, profile: &mut ParticipantProfile) {
        if let Some(email) = &self.email {
            profile.email = Some(email.trim().to_string());
            profile.needs_profile_completion = false;
        }
        if let Some(hash) = &self.password_hash {
            profile.password_hash = Some(hash.clone());
        }
        if let Some(language) = &self.language {
            profile.language = Some(language.clone());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub entry_seq: i64,
    pub entry_id: Ulid,
    pub participant: String,
    pub tie_id: TieId,
    pub actor: Actor,
    pub leg1: Option<Score>,
    pub leg2: Option<Score>,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub participants: usize,
    pub ties: usize,
    pub predictions: usize,
    pub skipped_predictions: usize,
}

impl SqliteForecastStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            snapshot: None,
        })
    }

    /// Applies the schema, installs the default configuration on first run
    /// and persists the seed round when no ties exist.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_FORECAST_V1)
            .context("failed to apply forecast schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![FORECAST_MIGRATION_VERSION, now],
            )
            .context("failed to register forecast schema migration")?;

        let default_config = serde_json::to_string(&TournamentConfig::v1())
            .context("failed to serialize default config")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO tournament_config(config_id, config_json, updated_at)
                 VALUES (1, ?1, ?2)",
                params![default_config, now],
            )
            .context("failed to install default tournament config")?;

        let tie_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ties", [], |row| row.get(0))
            .context("failed to count ties")?;
        if tie_count == 0 {
            let seeded = seed_round();
            let tx = self
                .conn
                .transaction()
                .context("failed to start seed transaction")?;
            for tie in &seeded {
                insert_tie(&tx, tie)?;
            }
            tx.commit().context("failed to commit seed transaction")?;
            info!(ties = seeded.len(), "seeded empty store with default round");
        }

        self.snapshot = None;
        Ok(())
    }

    pub fn load_config(&self) -> Result<TournamentConfig> {
        load_config_from(&self.conn)
    }

    pub fn save_config(&mut self, config: &TournamentConfig) -> Result<()> {
        config.validate()?;

        let payload = serde_json::to_string(config).context("failed to serialize config")?;
        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO tournament_config(config_id, config_json, updated_at)
                 VALUES (1, ?1, ?2)
                 ON CONFLICT(config_id) DO UPDATE SET
                   config_json = excluded.config_json,
                   updated_at = excluded.updated_at",
                params![payload, now],
            )
            .context("failed to save tournament config")?;

        info!(
            scoring = %config.scoring.name,
            tiebreak = config.tiebreak.as_str(),
            "tournament config updated"
        );
        Ok(())
    }

    /// Current state, reused until the next write from any connection.
    pub fn snapshot(&mut self) -> Result<Arc<ForecastState>> {
        let data_version = self.data_version()?;
        if let Some(cached) = &self.snapshot {
            if cached.data_version == data_version {
                debug!("forecast snapshot cache hit");
                return Ok(Arc::clone(&cached.state));
            }
            debug!(
                cached = cached.data_version,
                current = data_version,
                "forecast snapshot stale after external commit"
            );
        }

        let state = Arc::new(load_state(&self.conn)?);
        debug!(
            participants = state.participants.len(),
            ties = state.ties.len(),
            "loaded forecast snapshot"
        );
        self.snapshot = Some(CachedSnapshot {
            data_version,
            state: Arc::clone(&state),
        });
        Ok(state)
    }

    fn data_version(&self) -> Result<i64> {
        self.conn
            .query_row("PRAGMA data_version", [], |row| row.get(0))
            .context("failed to read sqlite data_version")
    }

    /// Registers a participant. Registering a known id is a no-op; the
    /// capacity limit applies only to new ids.
    pub fn register_participant(&mut self, raw_id: &str) -> Result<String> {
        let participant = normalize_participant_id(raw_id)?;
        let config = self.load_config()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start registration transaction")?;

        if load_profile(&tx, &participant)?.is_some() {
            debug!(participant = %participant, "participant already registered");
            return Ok(participant);
        }

        let registered: i64 = tx
            .query_row("SELECT COUNT(*) FROM participants", [], |row| row.get(0))
            .context("failed to count participants")?;
        let registered = usize::try_from(registered).unwrap_or(usize::MAX);
        if registered >= config.max_participants {
            return Err(ForecastError::Validation(format!(
                "participant limit of {} reached",
                config.max_participants
            ))
            .into());
        }

        let now = format_rfc3339(now_utc())?;
        upsert_profile(&tx, &participant, &ParticipantProfile::incomplete(), &now)?;
        tx.commit()
            .context("failed to commit registration transaction")?;

        self.snapshot = None;
        info!(participant = %participant, "participant registered");
        Ok(participant)
    }

    pub fn update_profile(
        &mut self,
        participant: &str,
        update: &ProfileUpdate,
    ) -> Result<ParticipantProfile> {
        let participant = normalize_participant_id(participant)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start profile transaction")?;

        let mut profile = load_profile(&tx, &participant)?
            .ok_or_else(|| ForecastError::NotFound(format!("participant {participant}")))?;
        update.apply(&mut profile);

        let now = format_rfc3339(now_utc())?;
        upsert_profile(&tx, &participant, &profile, &now)?;
        tx.commit().context("failed to commit profile transaction")?;

        self.snapshot = None;
        info!(participant = %participant, "participant profile updated");
        Ok(profile)
    }

    /// Removes a participant; their predictions go with them. Returns the
    /// normalized id.
    pub fn remove_participant(&mut self, participant: &str) -> Result<String> {
        let participant = normalize_participant_id(participant)?;
        let removed = self
            .conn
            .execute(
                "DELETE FROM participants WHERE participant_id = ?1",
                params![participant],
            )
            .context("failed to remove participant")?;

        if removed == 0 {
            return Err(ForecastError::NotFound(format!("participant {participant}")).into());
        }

        self.snapshot = None;
        info!(participant = %participant, "participant removed");
        Ok(participant)
    }

    pub fn add_tie(&mut self, draft: &TieDraft) -> Result<Tie> {
        draft.validate()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start tie transaction")?;

        let max_id: Option<i64> = tx
            .query_row("SELECT MAX(tie_id) FROM ties", [], |row| row.get(0))
            .context("failed to read max tie id")?;
        let next = match max_id {
            Some(value) => u32::try_from(value)
                .ok()
                .and_then(|id| id.checked_add(1))
                .ok_or_else(|| anyhow!("tie id space exhausted at {value}"))?,
            None => 1,
        };

        let tie = tie_from_draft(TieId(next), draft, None);
        insert_tie(&tx, &tie)?;
        tx.commit().context("failed to commit tie transaction")?;

        self.snapshot = None;
        info!(tie_id = %tie.id, team_a = %tie.team_a, team_b = %tie.team_b, "tie added");
        Ok(tie)
    }

    /// Applies the given changes to a tie. Omitted fields, including
    /// deadlines, keep their stored values; recorded results are kept.
    pub fn edit_tie(&mut self, tie_id: TieId, edit: &TieEdit) -> Result<Tie> {
        if edit.is_empty() {
            return Err(ForecastError::Validation(
                "tie edit MUST change at least one field".to_string(),
            )
            .into());
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start tie transaction")?;

        let existing = load_tie(&tx, tie_id)?
            .ok_or_else(|| ForecastError::NotFound(format!("tie {tie_id}")))?;
        let draft = edit.merged_with(&existing);
        draft.validate()?;
        let tie = tie_from_draft(tie_id, &draft, Some(&existing));
        tx.execute("DELETE FROM ties WHERE tie_id = ?1", params![i64::from(tie_id.0)])
            .context("failed to replace tie")?;
        insert_tie(&tx, &tie)?;
        tx.commit().context("failed to commit tie transaction")?;

        self.snapshot = None;
        info!(tie_id = %tie_id, "tie edited");
        Ok(tie)
    }

    /// Records actual scores. Not subject to deadline locking.
    pub fn enter_results(&mut self, tie_id: TieId, entry: &ResultEntry) -> Result<Tie> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start results transaction")?;

        let mut tie = load_tie(&tx, tie_id)?
            .ok_or_else(|| ForecastError::NotFound(format!("tie {tie_id}")))?;
        tie.record_results(entry);
        tx.execute(
            "UPDATE ties SET
               actual_leg1_home = ?2,
               actual_leg1_away = ?3,
               actual_leg2_home = ?4,
               actual_leg2_away = ?5
             WHERE tie_id = ?1",
            params![
                i64::from(tie_id.0),
                tie.actual_leg1_home,
                tie.actual_leg1_away,
                tie.actual_leg2_home,
                tie.actual_leg2_away,
            ],
        )
        .context("failed to record tie results")?;
        tx.commit().context("failed to commit results transaction")?;

        self.snapshot = None;
        info!(tie_id = %tie_id, "tie results recorded");
        Ok(tie)
    }

    /// Deletes a tie together with every prediction made for it.
    pub fn delete_tie(&mut self, tie_id: TieId) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start tie transaction")?;

        let removed = tx
            .execute("DELETE FROM ties WHERE tie_id = ?1", params![i64::from(tie_id.0)])
            .context("failed to delete tie")?;
        if removed == 0 {
            return Err(ForecastError::NotFound(format!("tie {tie_id}")).into());
        }
        let cascaded = tx
            .execute(
                "DELETE FROM predictions WHERE tie_key = ?1",
                params![tie_id.storage_key()],
            )
            .context("failed to delete predictions for tie")?;
        tx.commit().context("failed to commit tie transaction")?;

        self.snapshot = None;
        info!(tie_id = %tie_id, predictions = cascaded, "tie deleted");
        Ok(())
    }

    /// Validates a submission against the deadline gate and persists it.
    ///
    /// The check and the write share one immediate transaction, so a leg
    /// cannot lock between them. A rejected submission writes nothing.
    pub fn submit_prediction(
        &mut self,
        participant: &str,
        tie_id: TieId,
        submission: &PredictionSubmission,
        actor: Actor,
        as_of: OffsetDateTime,
    ) -> Result<SubmissionRecord> {
        let participant = normalize_participant_id(participant)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start submission transaction")?;

        let state = load_state(&tx)?;
        let config = load_config_from(&tx)?;
        let view = ForecastView::new(&state, &config, as_of);
        let prediction = match view.prepare_submission(&participant, tie_id, submission, actor) {
            Ok(value) => value,
            Err(err) => {
                if let ForecastError::LockedLeg { leg, .. } = &err {
                    warn!(
                        participant = %participant,
                        tie_id = %tie_id,
                        leg = %leg,
                        "rejected submission for locked leg"
                    );
                }
                return Err(err.into());
            }
        };

        let recorded_at = now_utc();
        let recorded_at_raw = format_rfc3339(recorded_at)?;
        upsert_prediction(
            &tx,
            &participant,
            &tie_id.storage_key(),
            &prediction,
            &recorded_at_raw,
        )?;

        let entry_id = Ulid::new();
        tx.execute(
            "INSERT INTO submission_log(
                entry_id, participant_id, tie_id, actor,
                leg1_home, leg1_away, leg2_home, leg2_away,
                as_of, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry_id.to_string(),
                participant,
                i64::from(tie_id.0),
                actor.as_str(),
                submission.leg1.map(|score| score.home),
                submission.leg1.map(|score| score.away),
                submission.leg2.map(|score| score.home),
                submission.leg2.map(|score| score.away),
                format_rfc3339(as_of)?,
                recorded_at_raw,
            ],
        )
        .context("failed to append submission log entry")?;
        let entry_seq = tx.last_insert_rowid();
        tx.commit()
            .context("failed to commit submission transaction")?;

        self.snapshot = None;
        info!(
            participant = %participant,
            tie_id = %tie_id,
            actor = actor.as_str(),
            "prediction stored"
        );

        Ok(SubmissionRecord {
            entry_seq,
            entry_id,
            participant,
            tie_id,
            actor,
            leg1: submission.leg1,
            leg2: submission.leg2,
            as_of,
            recorded_at,
        })
    }

    pub fn list_submissions(&self, participant: Option<&str>) -> Result<Vec<SubmissionRecord>> {
        let filter = participant.map(normalize_participant_id).transpose()?;
        let mut stmt = self.conn.prepare(
            "SELECT
                entry_seq, entry_id, participant_id, tie_id, actor,
                leg1_home, leg1_away, leg2_home, leg2_away, as_of, recorded_at
             FROM submission_log
             WHERE ?1 IS NULL OR participant_id = ?1
             ORDER BY entry_seq ASC",
        )?;
        let rows = stmt.query_map(params![filter], parse_submission_row)?;
        collect_rows(rows)
    }

    /// Replaces participants, ties, predictions and extra document keys
    /// with the contents of a state document. Configuration and the
    /// submission log are kept.
    pub fn import_document(&mut self, raw: Value) -> Result<ImportReport> {
        let state = ForecastState::from_document(raw)?;
        let config = self.load_config()?;
        if state.participants.len() > config.max_participants {
            warn!(
                participants = state.participants.len(),
                limit = config.max_participants,
                "imported document exceeds participant limit"
            );
        }

        let now = format_rfc3339(now_utc())?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start import transaction")?;

        tx.execute_batch(
            "DELETE FROM predictions;
             DELETE FROM participants;
             DELETE FROM ties;
             DELETE FROM state_extras;",
        )
        .context("failed to clear existing state")?;

        for (participant, profile) in &state.participants {
            upsert_profile(&tx, participant, profile, &now)?;
        }
        for tie in &state.ties {
            insert_tie(&tx, tie)?;
        }

        let mut predictions = 0_usize;
        let mut skipped_predictions = 0_usize;
        for (participant, by_tie) in &state.predictions {
            if !state.participants.contains_key(participant) {
                warn!(
                    participant = %participant,
                    count = by_tie.len(),
                    "skipping predictions of unregistered participant"
                );
                skipped_predictions += by_tie.len();
                continue;
            }
            for (tie_key, prediction) in by_tie {
                upsert_prediction(&tx, participant, tie_key, prediction, &now)?;
                predictions += 1;
            }
        }

        for (key, value) in &state.extra {
            let payload =
                serde_json::to_string(value).context("failed to serialize state extra")?;
            tx.execute(
                "INSERT INTO state_extras(extra_key, value_json) VALUES (?1, ?2)",
                params![key, payload],
            )
            .with_context(|| format!("failed to store state extra {key}"))?;
        }

        tx.commit().context("failed to commit import transaction")?;
        self.snapshot = None;

        let report = ImportReport {
            participants: state.participants.len(),
            ties: state.ties.len(),
            predictions,
            skipped_predictions,
        };
        info!(
            participants = report.participants,
            ties = report.ties,
            predictions = report.predictions,
            "state document imported"
        );
        Ok(report)
    }

    pub fn export_document(&mut self) -> Result<Value> {
        let state = self.snapshot()?;
        Ok(state.to_document()?)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn load_config_from(conn: &Connection) -> Result<TournamentConfig> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT config_json FROM tournament_config WHERE config_id = 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read tournament config")?;

    let raw = raw.ok_or_else(|| anyhow!("tournament config missing; run migrate first"))?;
    let value: Value = serde_json::from_str(&raw).context("invalid stored config JSON")?;
    Ok(TournamentConfig::from_json(&value)?)
}

fn load_state(conn: &Connection) -> Result<ForecastState> {
    let mut state = ForecastState::default();

    let mut stmt = conn.prepare(
        "SELECT participant_id, email, password_hash, reset_token, reset_token_expires_at,
                language, needs_profile_completion
         FROM participants
         ORDER BY participant_id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, parse_profile_row(row)?))
    })?;
    state.participants = collect_rows(rows)?.into_iter().collect();

    let mut stmt = conn.prepare(
        "SELECT tie_id, team_a, team_b, leg1_deadline, leg2_deadline,
                actual_leg1_home, actual_leg1_away, actual_leg2_home, actual_leg2_away
         FROM ties
         ORDER BY tie_id ASC",
    )?;
    let rows = stmt.query_map([], parse_tie_row)?;
    state.ties = collect_rows(rows)?;

    let mut stmt = conn.prepare(
        "SELECT participant_id, tie_key, leg1_home, leg1_away, leg2_home, leg2_away
         FROM predictions
         ORDER BY participant_id ASC, tie_key ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let participant: String = row.get(0)?;
        let tie_key: String = row.get(1)?;
        let prediction = Prediction {
            leg1_home: goals_column(row, 2)?,
            leg1_away: goals_column(row, 3)?,
            leg2_home: goals_column(row, 4)?,
            leg2_away: goals_column(row, 5)?,
        };
        Ok((participant, tie_key, prediction))
    })?;
    let mut predictions: BTreeMap<String, BTreeMap<String, Prediction>> = BTreeMap::new();
    for (participant, tie_key, prediction) in collect_rows(rows)? {
        predictions
            .entry(participant)
            .or_default()
            .insert(tie_key, prediction);
    }
    state.predictions = predictions;

    let mut stmt =
        conn.prepare("SELECT extra_key, value_json FROM state_extras ORDER BY extra_key ASC")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut extra = Map::new();
    for (key, raw) in collect_rows(rows)? {
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("invalid stored JSON for state extra {key}"))?;
        extra.insert(key, value);
    }
    state.extra = extra;

    Ok(state)
}

fn load_profile(conn: &Connection, participant: &str) -> Result<Option<ParticipantProfile>> {
    conn.query_row(
        "SELECT participant_id, email, password_hash, reset_token, reset_token_expires_at,
                language, needs_profile_completion
         FROM participants
         WHERE participant_id = ?1",
        params![participant],
        parse_profile_row,
    )
    .optional()
    .with_context(|| format!("failed to load participant {participant}"))
}

fn load_tie(conn: &Connection, tie_id: TieId) -> Result<Option<Tie>> {
    conn.query_row(
        "SELECT tie_id, team_a, team_b, leg1_deadline, leg2_deadline,
                actual_leg1_home, actual_leg1_away, actual_leg2_home, actual_leg2_away
         FROM ties
         WHERE tie_id = ?1",
        params![i64::from(tie_id.0)],
        parse_tie_row,
    )
    .optional()
    .with_context(|| format!("failed to load tie {tie_id}"))
}

fn upsert_profile(
    conn: &Connection,
    participant: &str,
    profile: &ParticipantProfile,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO participants(
            participant_id, email, password_hash, reset_token, reset_token_expires_at,
            language, needs_profile_completion, registered_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(participant_id) DO UPDATE SET
           email = excluded.email,
           password_hash = excluded.password_hash,
           reset_token = excluded.reset_token,
           reset_token_expires_at = excluded.reset_token_expires_at,
           language = excluded.language,
           needs_profile_completion = excluded.needs_profile_completion",
        params![
            participant,
            profile.email,
            profile.password_hash,
            profile.reset_token,
            profile.reset_token_expires_at,
            profile.language,
            bool_to_sql(profile.needs_profile_completion),
            now,
        ],
    )
    .with_context(|| format!("failed to store participant {participant}"))?;
    Ok(())
}

fn insert_tie(conn: &Connection, tie: &Tie) -> Result<()> {
    conn.execute(
        "INSERT INTO ties(
            tie_id, team_a, team_b, leg1_deadline, leg2_deadline,
            actual_leg1_home, actual_leg1_away, actual_leg2_home, actual_leg2_away
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            i64::from(tie.id.0),
            tie.team_a,
            tie.team_b,
            tie.leg1_deadline.map(format_rfc3339).transpose()?,
            tie.leg2_deadline.map(format_rfc3339).transpose()?,
            tie.actual_leg1_home,
            tie.actual_leg1_away,
            tie.actual_leg2_home,
            tie.actual_leg2_away,
        ],
    )
    .with_context(|| format!("failed to store tie {}", tie.id))?;
    Ok(())
}

fn upsert_prediction(
    conn: &Connection,
    participant: &str,
    tie_key: &str,
    prediction: &Prediction,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO predictions(
            participant_id, tie_key, leg1_home, leg1_away, leg2_home, leg2_away, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(participant_id, tie_key) DO UPDATE SET
           leg1_home = excluded.leg1_home,
           leg1_away = excluded.leg1_away,
           leg2_home = excluded.leg2_home,
           leg2_away = excluded.leg2_away,
           updated_at = excluded.updated_at",
        params![
            participant,
            tie_key,
            prediction.leg1_home,
            prediction.leg1_away,
            prediction.leg2_home,
            prediction.leg2_away,
            now,
        ],
    )
    .with_context(|| format!("failed to store prediction of {participant} for tie {tie_key}"))?;
    Ok(())
}

fn tie_from_draft(tie_id: TieId, draft: &TieDraft, existing: Option<&Tie>) -> Tie {
    let mut tie = existing
        .cloned()
        .unwrap_or_else(|| Tie::new(tie_id, &draft.team_a, &draft.team_b));
    tie.team_a = draft.team_a.trim().to_string();
    tie.team_b = draft.team_b.trim().to_string();
    tie.leg1_deadline = draft.leg1_deadline;
    tie.leg2_deadline = draft.leg2_deadline;
    tie
}

fn parse_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ParticipantProfile> {
    let needs_completion: i64 = row.get(6)?;
    Ok(ParticipantProfile {
        email: row.get(1)?,
        password_hash: row.get(2)?,
        reset_token: row.get(3)?,
        reset_token_expires_at: row.get(4)?,
        language: row.get(5)?,
        needs_profile_completion: needs_completion != 0,
    })
}

fn parse_tie_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tie> {
    let tie_id_raw: i64 = row.get(0)?;
    let tie_id = u32::try_from(tie_id_raw).map_err(|_| {
        invalid_data(
            0,
            rusqlite::types::Type::Integer,
            format!("invalid tie_id: {tie_id_raw}"),
        )
    })?;

    Ok(Tie {
        id: TieId(tie_id),
        team_a: row.get(1)?,
        team_b: row.get(2)?,
        leg1_deadline: deadline_column(row, 3)?,
        leg2_deadline: deadline_column(row, 4)?,
        actual_leg1_home: goals_column(row, 5)?,
        actual_leg1_away: goals_column(row, 6)?,
        actual_leg2_home: goals_column(row, 7)?,
        actual_leg2_away: goals_column(row, 8)?,
    })
}

fn parse_submission_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubmissionRecord> {
    let entry_id_raw: String = row.get(1)?;
    let tie_id_raw: i64 = row.get(3)?;
    let actor_raw: String = row.get(4)?;
    let as_of_raw: String = row.get(9)?;
    let recorded_at_raw: String = row.get(10)?;

    let entry_id = Ulid::from_string(&entry_id_raw).map_err(|err| {
        invalid_data(
            1,
            rusqlite::types::Type::Text,
            format!("invalid entry_id {entry_id_raw}: {err}"),
        )
    })?;
    let tie_id = u32::try_from(tie_id_raw).map_err(|_| {
        invalid_data(
            3,
            rusqlite::types::Type::Integer,
            format!("invalid tie_id: {tie_id_raw}"),
        )
    })?;
    let actor = Actor::parse(&actor_raw).ok_or_else(|| {
        invalid_data(
            4,
            rusqlite::types::Type::Text,
            format!("invalid actor: {actor_raw}"),
        )
    })?;

    let leg = |home: usize, away: usize| -> rusqlite::Result<Option<Score>> {
        Ok(goals_column(row, home)?
            .zip(goals_column(row, away)?)
            .map(|(home, away)| Score::new(home, away)))
    };

    Ok(SubmissionRecord {
        entry_seq: row.get(0)?,
        entry_id,
        participant: row.get(2)?,
        tie_id: TieId(tie_id),
        actor,
        leg1: leg(5, 6)?,
        leg2: leg(7, 8)?,
        as_of: parse_rfc3339_utc(&as_of_raw).map_err(|err| to_sql_error(9, err))?,
        recorded_at: parse_rfc3339_utc(&recorded_at_raw).map_err(|err| to_sql_error(10, err))?,
    })
}

fn goals_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Option<u32>> {
    let raw: Option<i64> = row.get(index)?;
    raw.map(|value| {
        u32::try_from(value).map_err(|_| {
            invalid_data(
                index,
                rusqlite::types::Type::Integer,
                format!("invalid goal count: {value}"),
            )
        })
    })
    .transpose()
}

fn deadline_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|value| parse_rfc3339_utc(&value).map_err(|err| to_sql_error(index, err)))
        .transpose()
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn invalid_data(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn to_sql_error(index: usize, err: ForecastError) -> rusqlite::Error {
    invalid_data(index, rusqlite::types::Type::Text, err.to_string())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
