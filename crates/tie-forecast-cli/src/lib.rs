//! Embedded command surface for the tie forecast engine.
//!
//! Hosts can drive the engine through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_forecast_with_db`] for a single [`ForecastCommand`] against a DB path.
//! - [`run_forecast`] for execution against an existing [`SqliteForecastStore`].
//!
//! Every invocation fixes its reference time once, so all lock decisions made
//! by one command agree with each other.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tie_forecast_core::{
    format_rfc3339, now_utc, parse_deadline, parse_rfc3339_utc, Actor, BracketEntry,
    ForecastError, ForecastView, LockState, ResultEntry, Score, ScoreBreakdown, ScoringPolicy,
    StandingsRow, TieId, TiebreakPolicy, TournamentConfig,
};
use tie_forecast_store_sqlite::{ProfileUpdate, SqliteForecastStore, TieDraft, TieEdit};
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(name = "tf")]
#[command(about = "Two-legged tie prediction engine")]
pub struct Cli {
    #[arg(long, default_value = "./tie_forecast.sqlite3")]
    db: PathBuf,

    /// Reference time for deadline checks (RFC3339, UTC). Defaults to now.
    #[arg(long, global = true)]
    as_of: Option<String>,

    #[command(subcommand)]
    command: ForecastCommand,
}

#[derive(Debug, Subcommand)]
pub enum ForecastCommand {
    Config {
        #[command(subcommand)]
        command: Box<ConfigCommand>,
    },
    Participant {
        #[command(subcommand)]
        command: Box<ParticipantCommand>,
    },
    Tie {
        #[command(subcommand)]
        command: Box<TieCommand>,
    },
    Predict(PredictArgs),
    Score(ScoreArgs),
    Leaderboard(LeaderboardArgs),
    Dashboard(DashboardArgs),
    Bracket(BracketArgs),
    Locks,
    State {
        #[command(subcommand)]
        command: Box<StateCommand>,
    },
    Submissions(SubmissionsArgs),
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
pub struct ConfigSetArgs {
    #[arg(long, value_parser = ScoringPolicy::PRESET_NAMES)]
    preset: Option<String>,
    #[arg(long, value_parser = TiebreakPolicy::NAMES)]
    tiebreak: Option<String>,
    #[arg(long)]
    max_participants: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum ParticipantCommand {
    Register(ParticipantIdArgs),
    Profile(ParticipantProfileArgs),
    Remove(ParticipantIdArgs),
    List,
}

#[derive(Debug, Args)]
pub struct ParticipantIdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct ParticipantProfileArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    password_hash: Option<String>,
    #[arg(long)]
    language: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum TieCommand {
    Add(TieDraftArgs),
    Edit(TieEditArgs),
    Results(TieResultsArgs),
    Delete(TieIdArgs),
    List,
}

#[derive(Debug, Args)]
pub struct TieDraftArgs {
    #[arg(long)]
    team_a: String,
    #[arg(long)]
    team_b: String,
    /// Leg 1 kickoff. Omit for a leg that never locks.
    #[arg(long)]
    leg1_deadline: Option<String>,
    #[arg(long)]
    leg2_deadline: Option<String>,
}

#[derive(Debug, Args)]
pub struct TieEditArgs {
    #[arg(long)]
    id: u32,
    #[arg(long)]
    team_a: Option<String>,
    #[arg(long)]
    team_b: Option<String>,
    #[arg(long, conflicts_with = "clear_leg1_deadline")]
    leg1_deadline: Option<String>,
    #[arg(long, conflicts_with = "clear_leg2_deadline")]
    leg2_deadline: Option<String>,
    /// Removes the leg 1 deadline so the leg never locks.
    #[arg(long)]
    clear_leg1_deadline: bool,
    #[arg(long)]
    clear_leg2_deadline: bool,
}

#[derive(Debug, Args)]
pub struct TieIdArgs {
    #[arg(long)]
    id: u32,
}

#[derive(Debug, Args)]
pub struct LegScoreArgs {
    #[arg(long, allow_hyphen_values = true)]
    leg1_home: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    leg1_away: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    leg2_home: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    leg2_away: Option<String>,
}

#[derive(Debug, Args)]
pub struct TieResultsArgs {
    #[arg(long)]
    id: u32,
    #[command(flatten)]
    legs: LegScoreArgs,
}

#[derive(Debug, Args)]
pub struct PredictArgs {
    #[arg(long)]
    participant: String,
    #[arg(long)]
    tie: u32,
    #[command(flatten)]
    legs: LegScoreArgs,
    /// Submit as administrator; deadlines are not enforced.
    #[arg(long)]
    admin: bool,
}

#[derive(Debug, Args)]
pub struct ScoreArgs {
    #[arg(long)]
    participant: String,
    #[arg(long)]
    tie: u32,
}

#[derive(Debug, Args)]
pub struct LeaderboardArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DashboardArgs {
    #[arg(long)]
    participant: String,
}

#[derive(Debug, Args)]
pub struct BracketArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum StateCommand {
    Import(StateImportArgs),
    Export(StateExportArgs),
}

#[derive(Debug, Args)]
pub struct StateImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct StateExportArgs {
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct SubmissionsArgs {
    #[arg(long)]
    participant: Option<String>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the reference time is invalid, the store cannot be
/// opened or migrated, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let as_of = resolve_as_of(cli.as_of.as_deref())?;
    tracing::debug!(db = %cli.db.display(), as_of = %as_of, "running command");
    run_forecast_with_db(&cli.db, cli.command, as_of)
}

/// Executes a parsed command against the `SQLite` DB at `db_path`.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_forecast_with_db(
    db_path: &Path,
    command: ForecastCommand,
    as_of: OffsetDateTime,
) -> Result<()> {
    let mut store = SqliteForecastStore::open(db_path)?;
    store.migrate()?;
    run_forecast(command, &mut store, as_of)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, deadline checks or persistence fail.
pub fn run_forecast(
    command: ForecastCommand,
    store: &mut SqliteForecastStore,
    as_of: OffsetDateTime,
) -> Result<()> {
    match command {
        ForecastCommand::Config { command } => run_config(*command, store),
        ForecastCommand::Participant { command } => run_participant(*command, store),
        ForecastCommand::Tie { command } => run_tie(*command, store),
        ForecastCommand::Predict(args) => {
            let submission = tie_forecast_core::PredictionSubmission {
                leg1: leg_from_args(
                    1,
                    args.legs.leg1_home.as_deref(),
                    args.legs.leg1_away.as_deref(),
                )?,
                leg2: leg_from_args(
                    2,
                    args.legs.leg2_home.as_deref(),
                    args.legs.leg2_away.as_deref(),
                )?,
            };
            let actor = if args.admin {
                Actor::Administrator
            } else {
                Actor::Participant
            };
            let record = store.submit_prediction(
                &args.participant,
                TieId(args.tie),
                &submission,
                actor,
                as_of,
            )?;
            print_json(&record)
        }
        ForecastCommand::Score(args) => {
            let payload = build_score_payload(store, &args.participant, TieId(args.tie), as_of)?;
            print_json(&payload)
        }
        ForecastCommand::Leaderboard(args) => {
            let payload = build_leaderboard_payload(store, as_of)?;
            if args.json {
                print_json(&payload)
            } else {
                print_leaderboard_table(&payload);
                Ok(())
            }
        }
        ForecastCommand::Dashboard(args) => {
            let state = store.snapshot()?;
            let config = store.load_config()?;
            let participant = tie_forecast_core::normalize_participant_id(&args.participant)?;
            let dashboard = ForecastView::new(&state, &config, as_of).dashboard(&participant)?;
            print_json(&dashboard)
        }
        ForecastCommand::Bracket(args) => {
            let state = store.snapshot()?;
            let config = store.load_config()?;
            let bracket = ForecastView::new(&state, &config, as_of).bracket();
            if args.json {
                print_json(&bracket)
            } else {
                print_bracket_table(&bracket);
                Ok(())
            }
        }
        ForecastCommand::Locks => {
            let payload = build_locks_payload(store, as_of)?;
            print_json(&payload)
        }
        ForecastCommand::State { command } => run_state(*command, store),
        ForecastCommand::Submissions(args) => {
            let records = store.list_submissions(args.participant.as_deref())?;
            print_json(&records)
        }
    }
}

fn run_config(command: ConfigCommand, store: &mut SqliteForecastStore) -> Result<()> {
    match command {
        ConfigCommand::Show => print_json(&store.load_config()?),
        ConfigCommand::Set(args) => {
            let config = apply_config_args(store.load_config()?, &args)?;
            store.save_config(&config)?;
            print_json(&config)
        }
    }
}

fn run_participant(command: ParticipantCommand, store: &mut SqliteForecastStore) -> Result<()> {
    match command {
        ParticipantCommand::Register(args) => {
            let participant = store.register_participant(&args.id)?;
            print_json(&serde_json::json!({ "participant": participant }))
        }
        ParticipantCommand::Profile(args) => {
            let update = ProfileUpdate {
                email: args.email,
                password_hash: args.password_hash,
                language: args.language,
            };
            if update == ProfileUpdate::default() {
                return Err(anyhow!(
                    "at least one of --email, --password-hash or --language is required"
                ));
            }
            let profile = store.update_profile(&args.id, &update)?;
            print_json(&ParticipantSummary {
                participant: tie_forecast_core::normalize_participant_id(&args.id)?,
                email: profile.email,
                language: profile.language,
                needs_profile_completion: profile.needs_profile_completion,
            })
        }
        ParticipantCommand::Remove(args) => {
            let removed = store.remove_participant(&args.id)?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
        ParticipantCommand::List => {
            let state = store.snapshot()?;
            let summaries: Vec<ParticipantSummary> = state
                .participants
                .iter()
                .map(|(participant, profile)| ParticipantSummary {
                    participant: participant.clone(),
                    email: profile.email.clone(),
                    language: profile.language.clone(),
                    needs_profile_completion: profile.needs_profile_completion,
                })
                .collect();
            print_json(&summaries)
        }
    }
}

fn run_tie(command: TieCommand, store: &mut SqliteForecastStore) -> Result<()> {
    match command {
        TieCommand::Add(args) => {
            let tie = store.add_tie(&draft_from_args(&args)?)?;
            print_json(&tie)
        }
        TieCommand::Edit(args) => {
            let tie = store.edit_tie(TieId(args.id), &edit_from_args(&args)?)?;
            print_json(&tie)
        }
        TieCommand::Results(args) => {
            let leg1 = leg_from_args(
                1,
                args.legs.leg1_home.as_deref(),
                args.legs.leg1_away.as_deref(),
            )?;
            let leg2 = leg_from_args(
                2,
                args.legs.leg2_home.as_deref(),
                args.legs.leg2_away.as_deref(),
            )?;
            let entry = ResultEntry {
                leg1_home: leg1.map(|score| score.home),
                leg1_away: leg1.map(|score| score.away),
                leg2_home: leg2.map(|score| score.home),
                leg2_away: leg2.map(|score| score.away),
            };
            let tie = store.enter_results(TieId(args.id), &entry)?;
            print_json(&tie)
        }
        TieCommand::Delete(args) => {
            store.delete_tie(TieId(args.id))?;
            print_json(&serde_json::json!({ "deleted": args.id }))
        }
        TieCommand::List => {
            let state = store.snapshot()?;
            print_json(&state.ties)
        }
    }
}

fn run_state(command: StateCommand, store: &mut SqliteForecastStore) -> Result<()> {
    match command {
        StateCommand::Import(args) => {
            let raw = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read state file {}", args.file.display()))?;
            let document: Value = serde_json::from_str(&raw)
                .map_err(|err| ForecastError::MalformedState(format!("invalid JSON: {err}")))?;
            let report = store.import_document(document)?;
            print_json(&report)
        }
        StateCommand::Export(args) => {
            let document = store.export_document()?;
            let rendered = serde_json::to_string_pretty(&document)?;
            match args.output {
                Some(path) => {
                    fs::write(&path, rendered)
                        .with_context(|| format!("failed to write state file {}", path.display()))?;
                    Ok(())
                }
                None => {
                    println!("{rendered}");
                    Ok(())
                }
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantSummary {
    participant: String,
    email: Option<String>,
    language: Option<String>,
    needs_profile_completion: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreJsonPayload {
    contract_version: String,
    participant: String,
    tie_id: TieId,
    points: ScoreBreakdown,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardJsonPayload {
    contract_version: String,
    as_of: String,
    scoring: String,
    tiebreak: TiebreakPolicy,
    rows: Vec<StandingsRow>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocksJsonPayload {
    contract_version: String,
    as_of: String,
    ties: Vec<LockState>,
}

fn build_score_payload(
    store: &mut SqliteForecastStore,
    participant: &str,
    tie_id: TieId,
    as_of: OffsetDateTime,
) -> Result<ScoreJsonPayload> {
    let participant = tie_forecast_core::normalize_participant_id(participant)?;
    let state = store.snapshot()?;
    let config = store.load_config()?;
    let points = ForecastView::new(&state, &config, as_of).score(&participant, tie_id)?;
    Ok(ScoreJsonPayload {
        contract_version: "score.v1".to_string(),
        participant,
        tie_id,
        points,
    })
}

fn build_leaderboard_payload(
    store: &mut SqliteForecastStore,
    as_of: OffsetDateTime,
) -> Result<LeaderboardJsonPayload> {
    let state = store.snapshot()?;
    let config = store.load_config()?;
    let rows = ForecastView::new(&state, &config, as_of).leaderboard();
    Ok(LeaderboardJsonPayload {
        contract_version: "leaderboard.v1".to_string(),
        as_of: format_rfc3339(as_of)?,
        scoring: config.scoring.name.clone(),
        tiebreak: config.tiebreak,
        rows,
    })
}

fn build_locks_payload(
    store: &mut SqliteForecastStore,
    as_of: OffsetDateTime,
) -> Result<LocksJsonPayload> {
    let state = store.snapshot()?;
    let config = store.load_config()?;
    Ok(LocksJsonPayload {
        contract_version: "locks.v1".to_string(),
        as_of: format_rfc3339(as_of)?,
        ties: ForecastView::new(&state, &config, as_of).lock_states(),
    })
}

fn apply_config_args(
    mut config: TournamentConfig,
    args: &ConfigSetArgs,
) -> Result<TournamentConfig> {
    if let Some(name) = args.preset.as_deref() {
        config.scoring = ScoringPolicy::preset(name).ok_or_else(|| {
            ForecastError::Configuration(format!("unknown scoring preset {name:?}"))
        })?;
    }
    if let Some(name) = args.tiebreak.as_deref() {
        config.tiebreak = TiebreakPolicy::parse(name).ok_or_else(|| {
            ForecastError::Configuration(format!("unknown tiebreak policy {name:?}"))
        })?;
    }
    if let Some(max_participants) = args.max_participants {
        config.max_participants = max_participants;
    }
    Ok(config)
}

fn resolve_as_of(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => {
            parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid --as-of value: {err}"))
        }
        None => Ok(now_utc()),
    }
}

fn parse_optional_deadline(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => Ok(Some(
            parse_deadline(value).map_err(|err| anyhow!("invalid deadline {value:?}: {err}"))?,
        )),
    }
}

fn draft_from_args(args: &TieDraftArgs) -> Result<TieDraft> {
    Ok(TieDraft {
        team_a: args.team_a.clone(),
        team_b: args.team_b.clone(),
        leg1_deadline: parse_optional_deadline(args.leg1_deadline.as_deref())?,
        leg2_deadline: parse_optional_deadline(args.leg2_deadline.as_deref())?,
    })
}

fn edit_from_args(args: &TieEditArgs) -> Result<TieEdit> {
    Ok(TieEdit {
        team_a: args.team_a.clone(),
        team_b: args.team_b.clone(),
        leg1_deadline: deadline_edit(args.leg1_deadline.as_deref(), args.clear_leg1_deadline)?,
        leg2_deadline: deadline_edit(args.leg2_deadline.as_deref(), args.clear_leg2_deadline)?,
    })
}

/// `None` keeps the stored deadline; `Some(None)` clears it.
fn deadline_edit(raw: Option<&str>, clear: bool) -> Result<Option<Option<OffsetDateTime>>> {
    if clear {
        return Ok(Some(None));
    }
    match raw.map(str::trim) {
        None => Ok(None),
        Some("") => Err(anyhow!(
            "an empty deadline is not accepted here; use --clear-leg1-deadline or --clear-leg2-deadline"
        )),
        Some(value) => Ok(Some(Some(
            parse_deadline(value).map_err(|err| anyhow!("invalid deadline {value:?}: {err}"))?,
        ))),
    }
}

/// A leg is either fully given or absent.
fn leg_from_args(leg: u8, home: Option<&str>, away: Option<&str>) -> Result<Option<Score>> {
    match (home, away) {
        (None, None) => Ok(None),
        (Some(home), Some(away)) => Ok(Some(Score::parse(home, away)?)),
        _ => Err(ForecastError::InvalidPrediction(format!(
            "leg {leg} needs both --leg{leg}-home and --leg{leg}-away"
        ))
        .into()),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_leaderboard_table(payload: &LeaderboardJsonPayload) {
    println!(
        "as_of={} scoring={} tiebreak={}",
        payload.as_of,
        payload.scoring,
        payload.tiebreak.as_str()
    );
    println!("{:<5} {:<20} {:>5}  per_tie", "rank", "participant", "total");
    println!("{}", "-".repeat(72));
    for row in &payload.rows {
        let per_tie = row
            .breakdown
            .iter()
            .map(|item| format!("#{}:{}", item.tie_id, item.points.total))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{:<5} {:<20} {:>5}  {}",
            row.rank, row.participant, row.total, per_tie
        );
    }
}

fn print_bracket_table(entries: &[BracketEntry]) {
    println!(
        "{:<4} {:<24} {:<24} {:<9} qualifier",
        "tie", "team_a", "team_b", "aggregate"
    );
    println!("{}", "-".repeat(80));
    for entry in entries {
        println!(
            "{:<4} {:<24} {:<24} {:<9} {}",
            entry.tie_id,
            entry.team_a,
            entry.team_b,
            entry.aggregate.map_or_else(
                || "-".to_string(),
                |value| format!("{}-{}", value.team_a, value.team_b)
            ),
            entry.qualifier_team.as_deref().unwrap_or("undetermined")
        );
    }
}
