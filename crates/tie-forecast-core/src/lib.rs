use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Profile keys that must always be present in a canonical participant record.
pub const OPTIONAL_PROFILE_FIELDS: [&str; 5] = [
    "email",
    "password_hash",
    "reset_token",
    "reset_token_expires_at",
    "language",
];

const TIE_RESULT_FIELDS: [&str; 4] = [
    "actual_leg1_home",
    "actual_leg1_away",
    "actual_leg2_home",
    "actual_leg2_away",
];

const NAIVE_DEADLINE_FORMATS: [&str; 2] = [
    "[year]-[month]-[day]T[hour]:[minute]:[second]",
    "[year]-[month]-[day]T[hour]:[minute]",
];

// Round of 16: (team A, team B, leg-1 kickoff, leg-2 kickoff).
const SEED_ROUND: [(&str, &str, &str, &str); 8] = [
    (
        "Club Brugge",
        "Aston Villa",
        "2025-03-04T17:45:00Z",
        "2025-03-12T17:45:00Z",
    ),
    (
        "PSV Eindhoven",
        "Arsenal",
        "2025-03-04T20:00:00Z",
        "2025-03-12T20:00:00Z",
    ),
    (
        "Real Madrid",
        "Atletico Madrid",
        "2025-03-04T20:00:00Z",
        "2025-03-12T20:00:00Z",
    ),
    (
        "Borussia Dortmund",
        "Lille",
        "2025-03-04T20:00:00Z",
        "2025-03-12T17:45:00Z",
    ),
    (
        "Feyenoord",
        "Inter",
        "2025-03-05T17:45:00Z",
        "2025-03-11T20:00:00Z",
    ),
    (
        "Benfica",
        "Barcelona",
        "2025-03-05T20:00:00Z",
        "2025-03-11T17:45:00Z",
    ),
    (
        "Bayern Munich",
        "Bayer Leverkusen",
        "2025-03-05T20:00:00Z",
        "2025-03-11T20:00:00Z",
    ),
    (
        "Paris Saint-Germain",
        "Liverpool",
        "2025-03-05T20:00:00Z",
        "2025-03-11T20:00:00Z",
    ),
];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ForecastError {
    #[error("malformed state: {0}")]
    MalformedState(String),
    #[error("invalid prediction: {0}")]
    InvalidPrediction(String),
    #[error("leg {leg} of tie {tie_id} is locked")]
    LockedLeg { tie_id: TieId, leg: Leg },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Numeric tie identifier.
///
/// Predictions are keyed by the canonical decimal string of this value;
/// [`TieId::storage_key`] is the only place that conversion happens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TieId(pub u32);

impl TieId {
    #[must_use]
    pub fn storage_key(self) -> String {
        self.0.to_string()
    }

    /// Parses a storage key back into an identifier.
    ///
    /// Only canonical keys are accepted, so `"07"` does not alias tie `7`.
    #[must_use]
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let parsed: u32 = key.parse().ok()?;
        (parsed.to_string() == key).then_some(Self(parsed))
    }
}

impl Display for TieId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    First,
    Second,
}

impl Leg {
    pub const ALL: [Leg; 2] = [Leg::First, Leg::Second];

    #[must_use]
    pub fn number(self) -> u8 {
        match self {
            Self::First => 1,
            Self::Second => 2,
        }
    }
}

impl Display for Leg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Goals scored by the home and away side of a single leg.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Score {
    pub home: u32,
    pub away: u32,
}

impl Score {
    #[must_use]
    pub fn new(home: u32, away: u32) -> Self {
        Self { home, away }
    }

    /// Parses user-supplied goal counts.
    ///
    /// # Errors
    /// Returns [`ForecastError::InvalidPrediction`] when either value is not
    /// an integer or is negative.
    pub fn parse(home: &str, away: &str) -> Result<Self, ForecastError> {
        Ok(Self {
            home: parse_goals(home)?,
            away: parse_goals(away)?,
        })
    }

    /// Win/draw/loss direction from the home side's point of view.
    #[must_use]
    pub fn outcome(self) -> Ordering {
        self.home.cmp(&self.away)
    }

    #[must_use]
    pub fn goal_difference(self) -> i64 {
        i64::from(self.home) - i64::from(self.away)
    }
}

impl Display for Score {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.home, self.away)
    }
}

fn parse_goals(raw: &str) -> Result<u32, ForecastError> {
    let trimmed = raw.trim();
    let value: i64 = trimmed.parse().map_err(|_| {
        ForecastError::InvalidPrediction(format!("goal count must be an integer, got {raw:?}"))
    })?;
    goals_from_signed(value)
}

fn goals_from_signed(value: i64) -> Result<u32, ForecastError> {
    if value < 0 {
        return Err(ForecastError::InvalidPrediction(format!(
            "goal count must be non-negative, got {value}"
        )));
    }
    u32::try_from(value).map_err(|_| {
        ForecastError::InvalidPrediction(format!("goal count out of range: {value}"))
    })
}

/// A two-legged knockout fixture. Team A hosts leg 1, team B hosts leg 2.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tie {
    pub id: TieId,
    #[serde(rename = "home_team")]
    pub team_a: String,
    #[serde(rename = "away_team")]
    pub team_b: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub leg1_deadline: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub leg2_deadline: Option<OffsetDateTime>,
    #[serde(default)]
    pub actual_leg1_home: Option<u32>,
    #[serde(default)]
    pub actual_leg1_away: Option<u32>,
    #[serde(default)]
    pub actual_leg2_home: Option<u32>,
    #[serde(default)]
    pub actual_leg2_away: Option<u32>,
}

impl Tie {
    #[must_use]
    pub fn new(id: TieId, team_a: &str, team_b: &str) -> Self {
        Self {
            id,
            team_a: team_a.to_string(),
            team_b: team_b.to_string(),
            leg1_deadline: None,
            leg2_deadline: None,
            actual_leg1_home: None,
            actual_leg1_away: None,
            actual_leg2_home: None,
            actual_leg2_away: None,
        }
    }

    #[must_use]
    pub fn deadline(&self, leg: Leg) -> Option<OffsetDateTime> {
        match leg {
            Leg::First => self.leg1_deadline,
            Leg::Second => self.leg2_deadline,
        }
    }

    /// Actual score of one leg, present only once both goal counts are entered.
    #[must_use]
    pub fn leg_result(&self, leg: Leg) -> Option<Score> {
        let (home, away) = match leg {
            Leg::First => (self.actual_leg1_home, self.actual_leg1_away),
            Leg::Second => (self.actual_leg2_home, self.actual_leg2_away),
        };
        Some(Score::new(home?, away?))
    }

    #[must_use]
    pub fn result(&self) -> TieResult {
        TieResult {
            tie_id: self.id,
            leg1: self.leg_result(Leg::First),
            leg2: self.leg_result(Leg::Second),
        }
    }

    /// Overwrites all four actual goal fields. Administrative entry is never
    /// subject to deadline locking.
    pub fn record_results(&mut self, entry: &ResultEntry) {
        self.actual_leg1_home = entry.leg1_home;
        self.actual_leg1_away = entry.leg1_away;
        self.actual_leg2_home = entry.leg2_home;
        self.actual_leg2_away = entry.leg2_away;
    }

    #[must_use]
    pub fn team_name(&self, qualifier: Qualifier) -> Option<&str> {
        match qualifier {
            Qualifier::TeamA => Some(self.team_a.as_str()),
            Qualifier::TeamB => Some(self.team_b.as_str()),
            Qualifier::Undetermined => None,
        }
    }
}

/// Known results of a tie.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TieResult {
    pub tie_id: TieId,
    pub leg1: Option<Score>,
    pub leg2: Option<Score>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultEntry {
    pub leg1_home: Option<u32>,
    pub leg1_away: Option<u32>,
    pub leg2_home: Option<u32>,
    pub leg2_away: Option<u32>,
}

/// One participant's forecast for one tie. Each leg may be filled in
/// independently, since leg 1 can lock while leg 2 is still open.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Prediction {
    #[serde(default)]
    pub leg1_home: Option<u32>,
    #[serde(default)]
    pub leg1_away: Option<u32>,
    #[serde(default)]
    pub leg2_home: Option<u32>,
    #[serde(default)]
    pub leg2_away: Option<u32>,
}

impl Prediction {
    #[must_use]
    pub fn from_legs(leg1: Option<Score>, leg2: Option<Score>) -> Self {
        let mut prediction = Self::default();
        if let Some(score) = leg1 {
            prediction.set_leg(Leg::First, score);
        }
        if let Some(score) = leg2 {
            prediction.set_leg(Leg::Second, score);
        }
        prediction
    }

    #[must_use]
    pub fn leg(&self, leg: Leg) -> Option<Score> {
        let (home, away) = match leg {
            Leg::First => (self.leg1_home, self.leg1_away),
            Leg::Second => (self.leg2_home, self.leg2_away),
        };
        Some(Score::new(home?, away?))
    }

    pub fn set_leg(&mut self, leg: Leg, score: Score) {
        match leg {
            Leg::First => {
                self.leg1_home = Some(score.home);
                self.leg1_away = Some(score.away);
            }
            Leg::Second => {
                self.leg2_home = Some(score.home);
                self.leg2_away = Some(score.away);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Participant,
    Administrator,
}

impl Actor {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Participant => "participant",
            Self::Administrator => "administrator",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "participant" => Some(Self::Participant),
            "administrator" => Some(Self::Administrator),
            _ => None,
        }
    }
}

/// Legs a participant wants to write. Omitted legs are left untouched.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PredictionSubmission {
    pub leg1: Option<Score>,
    pub leg2: Option<Score>,
}

impl PredictionSubmission {
    #[must_use]
    pub fn legs(&self) -> Vec<(Leg, Score)> {
        Leg::ALL
            .into_iter()
            .filter_map(|leg| self.leg(leg).map(|score| (leg, score)))
            .collect()
    }

    #[must_use]
    pub fn leg(&self, leg: Leg) -> Option<Score> {
        match leg {
            Leg::First => self.leg1,
            Leg::Second => self.leg2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantProfile {
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub reset_token: Option<String>,
    pub reset_token_expires_at: Option<String>,
    pub language: Option<String>,
    pub needs_profile_completion: bool,
}

impl ParticipantProfile {
    /// Profile for a participant known only by identifier.
    #[must_use]
    pub fn incomplete() -> Self {
        Self {
            email: None,
            password_hash: None,
            reset_token: None,
            reset_token_expires_at: None,
            language: None,
            needs_profile_completion: true,
        }
    }
}

/// Canonical in-memory state. Field names on the wire follow the persisted
/// document (`users`, `matches`, `predictions`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ForecastState {
    #[serde(rename = "users")]
    pub participants: BTreeMap<String, ParticipantProfile>,
    #[serde(rename = "matches")]
    pub ties: Vec<Tie>,
    #[serde(default)]
    pub predictions: BTreeMap<String, BTreeMap<String, Prediction>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ForecastState {
    /// Migrates a raw document and decodes it into canonical state.
    ///
    /// # Errors
    /// Returns [`ForecastError::MalformedState`] when the document cannot be
    /// interpreted.
    pub fn from_document(raw: Value) -> Result<Self, ForecastError> {
        let migrated = migrate_state(raw)?;
        let state: Self = serde_json::from_value(migrated).map_err(|err| {
            ForecastError::MalformedState(format!("state document does not decode: {err}"))
        })?;

        let mut seen = BTreeSet::new();
        for tie in &state.ties {
            if !seen.insert(tie.id) {
                return Err(ForecastError::MalformedState(format!(
                    "duplicate tie id {}",
                    tie.id
                )));
            }
        }

        Ok(state)
    }

    /// Encodes the state as a canonical document.
    ///
    /// # Errors
    /// Returns [`ForecastError::MalformedState`] if serialization fails.
    pub fn to_document(&self) -> Result<Value, ForecastError> {
        serde_json::to_value(self).map_err(|err| {
            ForecastError::MalformedState(format!("failed to encode state document: {err}"))
        })
    }

    #[must_use]
    pub fn tie(&self, tie_id: TieId) -> Option<&Tie> {
        self.ties.iter().find(|tie| tie.id == tie_id)
    }

    #[must_use]
    pub fn prediction_for(&self, participant: &str, tie_id: TieId) -> Option<&Prediction> {
        self.predictions
            .get(participant)?
            .get(&tie_id.storage_key())
    }

    pub fn set_prediction(&mut self, participant: &str, tie_id: TieId, prediction: Prediction) {
        self.predictions
            .entry(participant.to_string())
            .or_default()
            .insert(tie_id.storage_key(), prediction);
    }

}

/// Trims and lowercases a participant identifier.
///
/// # Errors
/// Returns [`ForecastError::Validation`] for an empty identifier.
pub fn normalize_participant_id(raw: &str) -> Result<String, ForecastError> {
    let normalized = raw.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(ForecastError::Validation(
            "participant id MUST NOT be empty".to_string(),
        ));
    }
    Ok(normalized)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TiebreakPolicy {
    /// Team A advances unless team B won leg 2 outright.
    AwayGoals,
    /// Team B, hosting leg 2, advances unless leg 2 was drawn.
    Leg2HostAdvantage,
}

impl TiebreakPolicy {
    pub const NAMES: [&'static str; 2] = ["away_goals", "leg2_host_advantage"];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwayGoals => "away_goals",
            Self::Leg2HostAdvantage => "leg2_host_advantage",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "away_goals" => Some(Self::AwayGoals),
            "leg2_host_advantage" => Some(Self::Leg2HostAdvantage),
            _ => None,
        }
    }

    fn decide(self, second_leg: Score) -> Qualifier {
        match self {
            Self::AwayGoals => {
                if second_leg.home > second_leg.away {
                    Qualifier::TeamB
                } else {
                    Qualifier::TeamA
                }
            }
            Self::Leg2HostAdvantage => {
                if second_leg.home == second_leg.away {
                    Qualifier::TeamA
                } else {
                    Qualifier::TeamB
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LegTier {
    ExactScore,
    GoalDifference,
    Outcome,
}

/// Point values for one scoring variant.
///
/// `goal_difference_points = None` collapses the middle tier into the outcome
/// tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoringPolicy {
    pub name: String,
    pub exact_score_points: u32,
    pub goal_difference_points: Option<u32>,
    pub outcome_points: u32,
    pub qualifier_bonus_points: u32,
}

impl ScoringPolicy {
    pub const PRESET_NAMES: [&'static str; 3] =
        ["classic", "qualifier_bonus", "classic_with_qualifier"];

    #[must_use]
    pub fn classic() -> Self {
        Self {
            name: "classic".to_string(),
            exact_score_points: 10,
            goal_difference_points: Some(7),
            outcome_points: 5,
            qualifier_bonus_points: 0,
        }
    }

    #[must_use]
    pub fn qualifier_bonus() -> Self {
        Self {
            name: "qualifier_bonus".to_string(),
            exact_score_points: 3,
            goal_difference_points: None,
            outcome_points: 1,
            qualifier_bonus_points: 2,
        }
    }

    #[must_use]
    pub fn classic_with_qualifier() -> Self {
        Self {
            name: "classic_with_qualifier".to_string(),
            qualifier_bonus_points: 2,
            ..Self::classic()
        }
    }

    #[must_use]
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "classic" => Some(Self::classic()),
            "qualifier_bonus" => Some(Self::qualifier_bonus()),
            "classic_with_qualifier" => Some(Self::classic_with_qualifier()),
            _ => None,
        }
    }

    #[must_use]
    pub fn max_points_per_tie(&self) -> u32 {
        self.exact_score_points
            .saturating_mul(2)
            .saturating_add(self.qualifier_bonus_points)
    }

    #[must_use]
    pub fn points_for(&self, tier: Option<LegTier>) -> u32 {
        match tier {
            Some(LegTier::ExactScore) => self.exact_score_points,
            Some(LegTier::GoalDifference) => self
                .goal_difference_points
                .unwrap_or(self.outcome_points),
            Some(LegTier::Outcome) => self.outcome_points,
            None => 0,
        }
    }

    /// Highest matching tier for one leg, or `None` when the outcome differs
    /// or either side of the comparison is missing.
    #[must_use]
    pub fn classify_leg(&self, predicted: Option<Score>, actual: Option<Score>) -> Option<LegTier> {
        let (predicted, actual) = (predicted?, actual?);
        if predicted == actual {
            return Some(LegTier::ExactScore);
        }
        if predicted.outcome() != actual.outcome() {
            return None;
        }
        if self.goal_difference_points.is_some()
            && predicted.goal_difference() == actual.goal_difference()
        {
            return Some(LegTier::GoalDifference);
        }
        Some(LegTier::Outcome)
    }

    /// Validates tier ordering.
    ///
    /// # Errors
    /// Returns [`ForecastError::Configuration`] when tiers are empty or out of
    /// order.
    pub fn validate(&self) -> Result<(), ForecastError> {
        if self.name.trim().is_empty() {
            return Err(ForecastError::Configuration(
                "scoring policy name MUST be provided".to_string(),
            ));
        }
        if self.exact_score_points == 0 {
            return Err(ForecastError::Configuration(
                "exact_score_points MUST be >= 1".to_string(),
            ));
        }
        if self.outcome_points > self.exact_score_points {
            return Err(ForecastError::Configuration(
                "outcome_points cannot exceed exact_score_points".to_string(),
            ));
        }
        if let Some(points) = self.goal_difference_points {
            if points > self.exact_score_points || points < self.outcome_points {
                return Err(ForecastError::Configuration(
                    "goal_difference_points MUST lie between outcome_points and exact_score_points"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TournamentConfig {
    pub config_version: u32,
    pub scoring: ScoringPolicy,
    pub tiebreak: TiebreakPolicy,
    pub max_participants: usize,
}

impl TournamentConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            scoring: ScoringPolicy::qualifier_bonus(),
            tiebreak: TiebreakPolicy::AwayGoals,
            max_participants: 12,
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns [`ForecastError::Configuration`] for out-of-range values.
    pub fn validate(&self) -> Result<(), ForecastError> {
        if self.config_version == 0 {
            return Err(ForecastError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }
        if self.max_participants == 0 {
            return Err(ForecastError::Configuration(
                "max_participants MUST be >= 1".to_string(),
            ));
        }
        self.scoring.validate()
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`ForecastError::Configuration`] when decoding or validation
    /// fails.
    pub fn from_json(value: &Value) -> Result<Self, ForecastError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            ForecastError::Configuration(format!("invalid config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for TournamentConfig {
    fn default() -> Self {
        Self::v1()
    }
}

// ---------------------------------------------------------------------------
// Qualification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Qualifier {
    TeamA,
    TeamB,
    Undetermined,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Aggregate {
    pub team_a: u32,
    pub team_b: u32,
}

#[must_use]
pub fn aggregate(first: Score, second: Score) -> Aggregate {
    Aggregate {
        team_a: first.home.saturating_add(second.away),
        team_b: first.away.saturating_add(second.home),
    }
}

/// Resolves which side advances from a pair of leg scores. Works the same
/// on actual results and on a participant's predicted legs.
#[must_use]
pub fn resolve_qualifier(
    leg1: Option<Score>,
    leg2: Option<Score>,
    tiebreak: TiebreakPolicy,
) -> Qualifier {
    let (Some(first), Some(second)) = (leg1, leg2) else {
        return Qualifier::Undetermined;
    };

    let totals = aggregate(first, second);
    match totals.team_a.cmp(&totals.team_b) {
        Ordering::Greater => Qualifier::TeamA,
        Ordering::Less => Qualifier::TeamB,
        Ordering::Equal => tiebreak.decide(second),
    }
}

#[must_use]
pub fn tie_qualifier(tie: &Tie, tiebreak: TiebreakPolicy) -> Qualifier {
    resolve_qualifier(
        tie.leg_result(Leg::First),
        tie.leg_result(Leg::Second),
        tiebreak,
    )
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreBreakdown {
    pub leg1: u32,
    pub leg2: u32,
    pub qualifier: u32,
    pub total: u32,
}

#[must_use]
pub fn score_prediction(
    prediction: &Prediction,
    tie: &Tie,
    config: &TournamentConfig,
) -> ScoreBreakdown {
    let scoring = &config.scoring;
    let leg1 = scoring.points_for(
        scoring.classify_leg(prediction.leg(Leg::First), tie.leg_result(Leg::First)),
    );
    let leg2 = scoring.points_for(
        scoring.classify_leg(prediction.leg(Leg::Second), tie.leg_result(Leg::Second)),
    );

    let mut qualifier = 0;
    if scoring.qualifier_bonus_points > 0 {
        let actual = tie_qualifier(tie, config.tiebreak);
        let predicted = resolve_qualifier(
            prediction.leg(Leg::First),
            prediction.leg(Leg::Second),
            config.tiebreak,
        );
        if actual != Qualifier::Undetermined && actual == predicted {
            qualifier = scoring.qualifier_bonus_points;
        }
    }

    ScoreBreakdown {
        leg1,
        leg2,
        qualifier,
        total: leg1 + leg2 + qualifier,
    }
}

// ---------------------------------------------------------------------------
// Deadline gate
// ---------------------------------------------------------------------------

/// A leg without a deadline never locks.
#[must_use]
pub fn is_leg_locked(tie: &Tie, leg: Leg, as_of: OffsetDateTime) -> bool {
    tie.deadline(leg).is_some_and(|deadline| as_of >= deadline)
}

/// Applies a submission on top of an existing prediction.
///
/// # Errors
/// Returns [`ForecastError::InvalidPrediction`] for an empty submission and
/// [`ForecastError::LockedLeg`] when a participant touches a locked leg; in
/// that case nothing is applied.
pub fn apply_submission(
    existing: Option<&Prediction>,
    submission: &PredictionSubmission,
    tie: &Tie,
    as_of: OffsetDateTime,
    actor: Actor,
) -> Result<Prediction, ForecastError> {
    let legs = submission.legs();
    if legs.is_empty() {
        return Err(ForecastError::InvalidPrediction(
            "submission MUST include at least one leg".to_string(),
        ));
    }

    if actor == Actor::Participant {
        for (leg, _) in &legs {
            if is_leg_locked(tie, *leg, as_of) {
                return Err(ForecastError::LockedLeg {
                    tie_id: tie.id,
                    leg: *leg,
                });
            }
        }
    }

    let mut updated = existing.cloned().unwrap_or_default();
    for (leg, score) in legs {
        updated.set_leg(leg, score);
    }
    Ok(updated)
}

// ---------------------------------------------------------------------------
// Leaderboard and read models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TieScore {
    pub tie_id: TieId,
    pub points: ScoreBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StandingsRow {
    pub rank: usize,
    pub participant: String,
    pub total: u32,
    pub breakdown: Vec<TieScore>,
}

/// Ranks every registered participant.
///
/// Rows are ordered by total descending, then by participant id ascending.
/// Equal totals share a rank.
#[must_use]
pub fn build_leaderboard(state: &ForecastState, config: &TournamentConfig) -> Vec<StandingsRow> {
    let mut ties: Vec<&Tie> = state.ties.iter().collect();
    ties.sort_by_key(|tie| tie.id);

    let mut rows: Vec<StandingsRow> = state
        .participants
        .keys()
        .map(|participant| {
            let breakdown: Vec<TieScore> = ties
                .iter()
                .map(|tie| TieScore {
                    tie_id: tie.id,
                    points: state
                        .prediction_for(participant, tie.id)
                        .map(|prediction| score_prediction(prediction, tie, config))
                        .unwrap_or_default(),
                })
                .collect();
            StandingsRow {
                rank: 0,
                participant: participant.clone(),
                total: breakdown.iter().map(|item| item.points.total).sum(),
                breakdown,
            }
        })
        .collect();

    rows.sort_by(|lhs, rhs| {
        rhs.total
            .cmp(&lhs.total)
            .then_with(|| lhs.participant.cmp(&rhs.participant))
    });

    let mut previous_total = None;
    let mut rank = 0;
    for (index, row) in rows.iter_mut().enumerate() {
        if previous_total != Some(row.total) {
            rank = index + 1;
            previous_total = Some(row.total);
        }
        row.rank = rank;
    }

    rows
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockState {
    pub tie_id: TieId,
    pub leg1_locked: bool,
    pub leg2_locked: bool,
    pub fully_locked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DashboardTie {
    pub tie: Tie,
    pub prediction: Option<Prediction>,
    pub points: ScoreBreakdown,
    pub locks: LockState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dashboard {
    pub participant: String,
    pub standing: StandingsRow,
    pub ties: Vec<DashboardTie>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BracketEntry {
    pub tie_id: TieId,
    pub team_a: String,
    pub team_b: String,
    pub aggregate: Option<Aggregate>,
    pub qualifier: Qualifier,
    pub qualifier_team: Option<String>,
}

/// Read access to one snapshot for the duration of a single logical
/// operation. The reference time is fixed at construction and the tie index
/// lives only as long as the view.
pub struct ForecastView<'a> {
    state: &'a ForecastState,
    config: &'a TournamentConfig,
    as_of: OffsetDateTime,
    tie_index: BTreeMap<TieId, usize>,
}

impl<'a> ForecastView<'a> {
    #[must_use]
    pub fn new(
        state: &'a ForecastState,
        config: &'a TournamentConfig,
        as_of: OffsetDateTime,
    ) -> Self {
        let tie_index = state
            .ties
            .iter()
            .enumerate()
            .map(|(index, tie)| (tie.id, index))
            .collect();
        Self {
            state,
            config,
            as_of,
            tie_index,
        }
    }

    #[must_use]
    pub fn tie(&self, tie_id: TieId) -> Option<&'a Tie> {
        let state = self.state;
        self.tie_index
            .get(&tie_id)
            .and_then(|index| state.ties.get(*index))
    }

    /// # Errors
    /// Returns [`ForecastError::NotFound`] for an unknown tie.
    pub fn require_tie(&self, tie_id: TieId) -> Result<&'a Tie, ForecastError> {
        self.tie(tie_id)
            .ok_or_else(|| ForecastError::NotFound(format!("tie {tie_id}")))
    }

    /// # Errors
    /// Returns [`ForecastError::NotFound`] for an unknown participant.
    pub fn require_participant(
        &self,
        participant: &str,
    ) -> Result<&'a ParticipantProfile, ForecastError> {
        self.state
            .participants
            .get(participant)
            .ok_or_else(|| ForecastError::NotFound(format!("participant {participant}")))
    }

    #[must_use]
    pub fn lock_state(&self, tie: &Tie) -> LockState {
        let leg1_locked = is_leg_locked(tie, Leg::First, self.as_of);
        let leg2_locked = is_leg_locked(tie, Leg::Second, self.as_of);
        LockState {
            tie_id: tie.id,
            leg1_locked,
            leg2_locked,
            fully_locked: leg1_locked && leg2_locked,
        }
    }

    #[must_use]
    pub fn lock_states(&self) -> Vec<LockState> {
        self.ordered_ties()
            .into_iter()
            .map(|tie| self.lock_state(tie))
            .collect()
    }

    /// # Errors
    /// Returns [`ForecastError::NotFound`] for an unknown participant or tie.
    pub fn score(
        &self,
        participant: &str,
        tie_id: TieId,
    ) -> Result<ScoreBreakdown, ForecastError> {
        self.require_participant(participant)?;
        let tie = self.require_tie(tie_id)?;
        Ok(self
            .state
            .prediction_for(participant, tie_id)
            .map(|prediction| score_prediction(prediction, tie, self.config))
            .unwrap_or_default())
    }

    #[must_use]
    pub fn leaderboard(&self) -> Vec<StandingsRow> {
        build_leaderboard(self.state, self.config)
    }

    /// # Errors
    /// Returns [`ForecastError::NotFound`] for an unknown participant.
    pub fn dashboard(&self, participant: &str) -> Result<Dashboard, ForecastError> {
        self.require_participant(participant)?;
        let standing = self
            .leaderboard()
            .into_iter()
            .find(|row| row.participant == participant)
            .ok_or_else(|| ForecastError::NotFound(format!("participant {participant}")))?;

        let ties = self
            .ordered_ties()
            .into_iter()
            .map(|tie| {
                let prediction = self.state.prediction_for(participant, tie.id).cloned();
                let points = prediction
                    .as_ref()
                    .map(|value| score_prediction(value, tie, self.config))
                    .unwrap_or_default();
                DashboardTie {
                    tie: tie.clone(),
                    prediction,
                    points,
                    locks: self.lock_state(tie),
                }
            })
            .collect();

        Ok(Dashboard {
            participant: participant.to_string(),
            standing,
            ties,
        })
    }

    #[must_use]
    pub fn bracket(&self) -> Vec<BracketEntry> {
        self.ordered_ties()
            .into_iter()
            .map(|tie| {
                let result = tie.result();
                let qualifier = tie_qualifier(tie, self.config.tiebreak);
                BracketEntry {
                    tie_id: tie.id,
                    team_a: tie.team_a.clone(),
                    team_b: tie.team_b.clone(),
                    aggregate: result.leg1.zip(result.leg2).map(|(a, b)| aggregate(a, b)),
                    qualifier,
                    qualifier_team: tie.team_name(qualifier).map(str::to_string),
                }
            })
            .collect()
    }

    /// Builds the prediction that would be stored for a submission.
    ///
    /// # Errors
    /// Returns [`ForecastError::NotFound`] for unknown participant or tie and
    /// the errors of [`apply_submission`].
    pub fn prepare_submission(
        &self,
        participant: &str,
        tie_id: TieId,
        submission: &PredictionSubmission,
        actor: Actor,
    ) -> Result<Prediction, ForecastError> {
        self.require_participant(participant)?;
        let tie = self.require_tie(tie_id)?;
        apply_submission(
            self.state.prediction_for(participant, tie_id),
            submission,
            tie,
            self.as_of,
            actor,
        )
    }

    fn ordered_ties(&self) -> Vec<&'a Tie> {
        let state = self.state;
        self.tie_index
            .values()
            .filter_map(|index| state.ties.get(*index))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Schema migration
// ---------------------------------------------------------------------------

/// Normalizes a raw state document into the canonical shape.
///
/// Steps run in order: legacy participant lists become profile mappings,
/// missing optional profile fields are backfilled with `null`, and an empty
/// tie collection is filled from the seed round. Tie records and the
/// prediction map are normalized afterwards. Running the migration on its
/// own output is a no-op.
///
/// # Errors
/// Returns [`ForecastError::MalformedState`] when the document shape cannot
/// be interpreted.
pub fn migrate_state(raw: Value) -> Result<Value, ForecastError> {
    let Value::Object(mut root) = raw else {
        return Err(ForecastError::MalformedState(
            "state document MUST be a JSON object".to_string(),
        ));
    };

    upgrade_participant_list(&mut root)?;
    backfill_profile_fields(&mut root)?;
    seed_ties_if_empty(&mut root)?;
    normalize_ties(&mut root)?;
    normalize_predictions(&mut root)?;

    Ok(Value::Object(root))
}

fn upgrade_participant_list(root: &mut Map<String, Value>) -> Result<(), ForecastError> {
    let users = root
        .entry("users".to_string())
        .or_insert_with(|| Value::Object(Map::new()));

    let profiles = match users {
        Value::Object(existing) => {
            let mut profiles = Map::new();
            for (raw_id, profile) in std::mem::take(existing) {
                let id = migrated_participant_id(&raw_id)?;
                if profiles.insert(id.clone(), profile).is_some() {
                    return Err(ForecastError::MalformedState(format!(
                        "participant {raw_id:?} collides with {id:?} after normalization"
                    )));
                }
            }
            profiles
        }
        Value::Array(ids) => {
            let mut profiles = Map::new();
            for entry in &*ids {
                let Some(raw_id) = entry.as_str() else {
                    return Err(ForecastError::MalformedState(format!(
                        "legacy participant list entries MUST be strings, got {entry}"
                    )));
                };
                profiles
                    .entry(migrated_participant_id(raw_id)?)
                    .or_insert_with(incomplete_profile_value);
            }
            profiles
        }
        other => {
            return Err(ForecastError::MalformedState(format!(
                "users MUST be a list of identifiers or a mapping of profiles, got {}",
                json_kind(other)
            )));
        }
    };

    *users = Value::Object(profiles);
    Ok(())
}

fn migrated_participant_id(raw: &str) -> Result<String, ForecastError> {
    normalize_participant_id(raw).map_err(|_| {
        ForecastError::MalformedState(format!("participant id {raw:?} is empty"))
    })
}

fn incomplete_profile_value() -> Value {
    let mut profile = Map::new();
    for field in OPTIONAL_PROFILE_FIELDS {
        profile.insert(field.to_string(), Value::Null);
    }
    profile.insert("needs_profile_completion".to_string(), Value::Bool(true));
    Value::Object(profile)
}

fn backfill_profile_fields(root: &mut Map<String, Value>) -> Result<(), ForecastError> {
    let Some(Value::Object(users)) = root.get_mut("users") else {
        return Err(ForecastError::MalformedState(
            "users mapping missing after upgrade".to_string(),
        ));
    };

    for (id, profile) in users {
        let Value::Object(fields) = profile else {
            return Err(ForecastError::MalformedState(format!(
                "profile for participant {id} MUST be an object"
            )));
        };

        for field in OPTIONAL_PROFILE_FIELDS {
            fields.entry(field.to_string()).or_insert(Value::Null);
        }

        let email_missing = matches!(fields.get("email"), None | Some(Value::Null));
        match fields.get("needs_profile_completion") {
            Some(Value::Bool(_)) => {}
            None => {
                fields.insert(
                    "needs_profile_completion".to_string(),
                    Value::Bool(email_missing),
                );
            }
            Some(other) => {
                return Err(ForecastError::MalformedState(format!(
                    "needs_profile_completion for participant {id} MUST be a boolean, got {}",
                    json_kind(other)
                )));
            }
        }
    }

    Ok(())
}

fn seed_ties_if_empty(root: &mut Map<String, Value>) -> Result<(), ForecastError> {
    let ties = root
        .entry("matches".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));

    let items = match ties {
        Value::Array(items) => items,
        other => {
            return Err(ForecastError::MalformedState(format!(
                "matches MUST be a list, got {}",
                json_kind(other)
            )));
        }
    };

    if items.is_empty() {
        for tie in seed_round() {
            let value = serde_json::to_value(&tie).map_err(|err| {
                ForecastError::MalformedState(format!("failed to encode seed tie: {err}"))
            })?;
            items.push(value);
        }
    }

    Ok(())
}

/// Ties populated into an empty store.
#[must_use]
pub fn seed_round() -> Vec<Tie> {
    SEED_ROUND
        .iter()
        .zip(1_u32..)
        .map(|((team_a, team_b, leg1, leg2), id)| {
            let mut tie = Tie::new(TieId(id), team_a, team_b);
            tie.leg1_deadline = OffsetDateTime::parse(leg1, &Rfc3339).ok();
            tie.leg2_deadline = OffsetDateTime::parse(leg2, &Rfc3339).ok();
            tie
        })
        .collect()
}

fn normalize_ties(root: &mut Map<String, Value>) -> Result<(), ForecastError> {
    let Some(Value::Array(items)) = root.get_mut("matches") else {
        return Err(ForecastError::MalformedState(
            "matches list missing after seeding".to_string(),
        ));
    };

    for item in items {
        let fields = match item {
            Value::Object(fields) => fields,
            other => {
                return Err(ForecastError::MalformedState(format!(
                    "tie records MUST be objects, got {}",
                    json_kind(other)
                )));
            }
        };

        for field in TIE_RESULT_FIELDS {
            fields.entry(field.to_string()).or_insert(Value::Null);
        }

        for field in ["leg1_deadline", "leg2_deadline"] {
            let slot = fields.entry(field.to_string()).or_insert(Value::Null);
            let normalized = match &*slot {
                Value::Null => Value::Null,
                Value::String(raw) if raw.trim().is_empty() => Value::Null,
                Value::String(raw) => Value::String(normalize_deadline(raw)?),
                other => {
                    return Err(ForecastError::MalformedState(format!(
                        "{field} MUST be a timestamp string, got {}",
                        json_kind(other)
                    )));
                }
            };
            *slot = normalized;
        }
    }

    Ok(())
}

fn normalize_predictions(root: &mut Map<String, Value>) -> Result<(), ForecastError> {
    let predictions = root
        .entry("predictions".to_string())
        .or_insert_with(|| Value::Object(Map::new()));

    let by_participant = match predictions {
        Value::Object(by_participant) => by_participant,
        other => {
            return Err(ForecastError::MalformedState(format!(
                "predictions MUST be a mapping, got {}",
                json_kind(other)
            )));
        }
    };

    let mut normalized = Map::new();
    for (raw_participant, by_tie) in std::mem::take(by_participant) {
        let participant = migrated_participant_id(&raw_participant)?;
        let Value::Object(entries) = &by_tie else {
            return Err(ForecastError::MalformedState(format!(
                "predictions for participant {participant} MUST be a mapping keyed by tie id"
            )));
        };
        if let Some(key) = entries
            .keys()
            .find(|key| TieId::from_storage_key(key).is_none())
        {
            return Err(ForecastError::MalformedState(format!(
                "prediction key {key:?} of participant {participant} is not a canonical tie id"
            )));
        }
        if normalized.insert(participant.clone(), by_tie).is_some() {
            return Err(ForecastError::MalformedState(format!(
                "predictions of {raw_participant:?} collide with {participant:?} after normalization"
            )));
        }
    }
    *by_participant = normalized;

    Ok(())
}

/// Parses a deadline and renders it as RFC3339 UTC. Naive timestamps are
/// taken as UTC.
///
/// # Errors
/// Returns [`ForecastError::MalformedState`] for unrecognized timestamps.
pub fn normalize_deadline(raw: &str) -> Result<String, ForecastError> {
    let parsed = parse_deadline(raw)?;
    format_rfc3339(parsed).map_err(|err| ForecastError::MalformedState(err.to_string()))
}

/// Parses a deadline in RFC3339 or naive `YYYY-MM-DDTHH:MM[:SS]` form.
///
/// # Errors
/// Returns [`ForecastError::MalformedState`] for unrecognized timestamps.
pub fn parse_deadline(raw: &str) -> Result<OffsetDateTime, ForecastError> {
    let trimmed = raw.trim();
    if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(parsed.to_offset(UtcOffset::UTC));
    }

    for pattern in NAIVE_DEADLINE_FORMATS {
        let format = time::format_description::parse(pattern).map_err(|err| {
            ForecastError::Configuration(format!("invalid deadline format {pattern}: {err}"))
        })?;
        if let Ok(parsed) = PrimitiveDateTime::parse(trimmed, &format) {
            return Ok(parsed.assume_utc());
        }
    }

    Err(ForecastError::MalformedState(format!(
        "unrecognized deadline timestamp: {raw}"
    )))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ForecastError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ForecastError> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| ForecastError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ForecastError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ForecastError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ForecastError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| {
            ForecastError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn fixture_tie() -> Tie {
        let mut tie = Tie::new(TieId(1), "Real Madrid", "Atletico Madrid");
        tie.leg1_deadline = Some(must_utc("2025-03-04T20:00:00Z"));
        tie.leg2_deadline = Some(must_utc("2025-03-12T20:00:00Z"));
        tie.record_results(&ResultEntry {
            leg1_home: Some(2),
            leg1_away: Some(0),
            leg2_home: Some(3),
            leg2_away: Some(1),
        });
        tie
    }

    fn config_with(scoring: ScoringPolicy, tiebreak: TiebreakPolicy) -> TournamentConfig {
        TournamentConfig {
            scoring,
            tiebreak,
            ..TournamentConfig::v1()
        }
    }

    fn fixture_state() -> ForecastState {
        let mut state = must_ok(ForecastState::from_document(json!({
            "users": ["alice", "bob", "carol"],
            "matches": [],
            "predictions": {}
        })));
        state.ties = vec![fixture_tie()];
        state
    }

    #[test]
    fn classic_scores_exact_leg_and_outcome_only_leg() {
        let prediction = Prediction::from_legs(Some(Score::new(2, 0)), Some(Score::new(1, 0)));
        let breakdown = score_prediction(
            &prediction,
            &fixture_tie(),
            &config_with(ScoringPolicy::classic(), TiebreakPolicy::AwayGoals),
        );

        assert_eq!(
            breakdown,
            ScoreBreakdown {
                leg1: 10,
                leg2: 5,
                qualifier: 0,
                total: 15
            }
        );
    }

    #[test]
    fn qualifier_bonus_follows_literal_tiebreak_policy() {
        let prediction = Prediction::from_legs(Some(Score::new(2, 1)), Some(Score::new(1, 0)));
        let tie = fixture_tie();

        for tiebreak in [TiebreakPolicy::AwayGoals, TiebreakPolicy::Leg2HostAdvantage] {
            assert_eq!(tie_qualifier(&tie, tiebreak), Qualifier::TeamB);
            let breakdown = score_prediction(
                &prediction,
                &tie,
                &config_with(ScoringPolicy::qualifier_bonus(), tiebreak),
            );
            assert_eq!(
                breakdown,
                ScoreBreakdown {
                    leg1: 1,
                    leg2: 1,
                    qualifier: 2,
                    total: 4
                }
            );
        }
    }

    #[test]
    fn goal_difference_tier_applies_only_when_configured() {
        let mut tie = Tie::new(TieId(3), "A", "B");
        tie.record_results(&ResultEntry {
            leg1_home: Some(3),
            leg1_away: Some(1),
            leg2_home: Some(2),
            leg2_away: Some(2),
        });
        let prediction = Prediction::from_legs(Some(Score::new(2, 0)), Some(Score::new(0, 0)));

        let classic = score_prediction(
            &prediction,
            &tie,
            &config_with(ScoringPolicy::classic(), TiebreakPolicy::AwayGoals),
        );
        assert_eq!(classic.leg1, 7);
        assert_eq!(classic.leg2, 7);

        let bonus = score_prediction(
            &prediction,
            &tie,
            &config_with(ScoringPolicy::qualifier_bonus(), TiebreakPolicy::AwayGoals),
        );
        assert_eq!(bonus.leg1, 1);
        assert_eq!(bonus.leg2, 1);
        assert_eq!(bonus.qualifier, 2);
        assert_eq!(bonus.total, 4);
    }

    #[test]
    fn classic_with_qualifier_caps_at_twenty_two() {
        let prediction = Prediction::from_legs(Some(Score::new(2, 0)), Some(Score::new(3, 1)));
        let config = config_with(
            ScoringPolicy::classic_with_qualifier(),
            TiebreakPolicy::Leg2HostAdvantage,
        );
        let breakdown = score_prediction(&prediction, &fixture_tie(), &config);
        assert_eq!(breakdown.total, 22);
        assert_eq!(config.scoring.max_points_per_tie(), 22);
        assert_eq!(ScoringPolicy::classic().max_points_per_tie(), 20);
        assert_eq!(ScoringPolicy::qualifier_bonus().max_points_per_tie(), 8);
    }

    #[test]
    fn missing_results_score_zero() {
        let mut tie = fixture_tie();
        tie.record_results(&ResultEntry {
            leg1_home: Some(1),
            leg1_away: None,
            ..ResultEntry::default()
        });
        let prediction = Prediction::from_legs(Some(Score::new(1, 0)), Some(Score::new(0, 0)));
        let breakdown = score_prediction(&prediction, &tie, &TournamentConfig::v1());
        assert_eq!(breakdown, ScoreBreakdown::default());
        assert_eq!(tie_qualifier(&tie, TiebreakPolicy::AwayGoals), Qualifier::Undetermined);
    }

    #[test]
    fn partial_prediction_skips_qualifier_bonus() {
        let prediction = Prediction::from_legs(Some(Score::new(2, 0)), None);
        let breakdown = score_prediction(&prediction, &fixture_tie(), &TournamentConfig::v1());
        assert_eq!(breakdown.leg1, 3);
        assert_eq!(breakdown.leg2, 0);
        assert_eq!(breakdown.qualifier, 0);
    }

    #[test]
    fn tiebreak_policies_differ_on_level_aggregate() {
        // Aggregate 2-2, leg 2 won by its host.
        let first = Some(Score::new(2, 0));
        let host_wins = Some(Score::new(2, 0));
        assert_eq!(
            resolve_qualifier(first, host_wins, TiebreakPolicy::AwayGoals),
            Qualifier::TeamB
        );
        assert_eq!(
            resolve_qualifier(first, host_wins, TiebreakPolicy::Leg2HostAdvantage),
            Qualifier::TeamB
        );

        // Aggregate 1-1, leg 2 drawn.
        let draw_first = Some(Score::new(1, 1));
        let draw_second = Some(Score::new(0, 0));
        assert_eq!(
            resolve_qualifier(draw_first, draw_second, TiebreakPolicy::AwayGoals),
            Qualifier::TeamA
        );
        assert_eq!(
            resolve_qualifier(draw_first, draw_second, TiebreakPolicy::Leg2HostAdvantage),
            Qualifier::TeamA
        );

        // Aggregate 2-2, leg 2 won by the visitor.
        let lost_first = Some(Score::new(0, 1));
        let visitor_wins = Some(Score::new(1, 2));
        assert_eq!(
            resolve_qualifier(lost_first, visitor_wins, TiebreakPolicy::AwayGoals),
            Qualifier::TeamA
        );
        assert_eq!(
            resolve_qualifier(lost_first, visitor_wins, TiebreakPolicy::Leg2HostAdvantage),
            Qualifier::TeamB
        );
    }

    #[test]
    fn aggregate_winner_ignores_tiebreak() {
        let leg1 = Some(Score::new(0, 3));
        let leg2 = Some(Score::new(1, 1));
        for tiebreak in [TiebreakPolicy::AwayGoals, TiebreakPolicy::Leg2HostAdvantage] {
            assert_eq!(resolve_qualifier(leg1, leg2, tiebreak), Qualifier::TeamB);
        }
    }

    #[test]
    fn lock_applies_at_deadline_instant() {
        let tie = fixture_tie();
        assert!(!is_leg_locked(&tie, Leg::First, must_utc("2025-03-04T19:59:59Z")));
        assert!(is_leg_locked(&tie, Leg::First, must_utc("2025-03-04T20:00:00Z")));
        assert!(!is_leg_locked(&tie, Leg::Second, must_utc("2025-03-04T20:00:00Z")));

        let open = Tie::new(TieId(9), "A", "B");
        assert!(!is_leg_locked(&open, Leg::First, must_utc("2099-01-01T00:00:00Z")));
    }

    #[test]
    fn participant_cannot_touch_locked_leg_but_admin_can() {
        let tie = fixture_tie();
        let as_of = must_utc("2025-03-05T00:00:00Z");
        let existing = Prediction::from_legs(Some(Score::new(1, 1)), None);
        let submission = PredictionSubmission {
            leg1: Some(Score::new(4, 0)),
            leg2: Some(Score::new(0, 0)),
        };

        let rejected = apply_submission(
            Some(&existing),
            &submission,
            &tie,
            as_of,
            Actor::Participant,
        );
        assert_eq!(
            rejected,
            Err(ForecastError::LockedLeg {
                tie_id: TieId(1),
                leg: Leg::First
            })
        );

        let leg2_only = PredictionSubmission {
            leg1: None,
            leg2: Some(Score::new(0, 0)),
        };
        let accepted = must_ok(apply_submission(
            Some(&existing),
            &leg2_only,
            &tie,
            as_of,
            Actor::Participant,
        ));
        assert_eq!(accepted.leg(Leg::First), Some(Score::new(1, 1)));
        assert_eq!(accepted.leg(Leg::Second), Some(Score::new(0, 0)));

        let admin = must_ok(apply_submission(
            Some(&existing),
            &submission,
            &tie,
            as_of,
            Actor::Administrator,
        ));
        assert_eq!(admin.leg(Leg::First), Some(Score::new(4, 0)));
    }

    #[test]
    fn empty_submission_is_rejected() {
        let result = apply_submission(
            None,
            &PredictionSubmission::default(),
            &fixture_tie(),
            must_utc("2025-01-01T00:00:00Z"),
            Actor::Participant,
        );
        assert!(matches!(result, Err(ForecastError::InvalidPrediction(_))));
    }

    #[test]
    fn score_parse_rejects_negative_and_non_integer_goals() {
        assert_eq!(must_ok(Score::parse(" 2", "0 ")), Score::new(2, 0));
        assert!(matches!(
            Score::parse("-1", "0"),
            Err(ForecastError::InvalidPrediction(_))
        ));
        assert!(matches!(
            Score::parse("1.5", "0"),
            Err(ForecastError::InvalidPrediction(_))
        ));
        assert!(matches!(
            Score::parse("two", "0"),
            Err(ForecastError::InvalidPrediction(_))
        ));
    }

    #[test]
    fn storage_key_is_canonical_decimal() {
        assert_eq!(TieId(7).storage_key(), "7");
        assert_eq!(TieId::from_storage_key("7"), Some(TieId(7)));
        assert_eq!(TieId::from_storage_key("07"), None);
        assert_eq!(TieId::from_storage_key("x"), None);
    }

    #[test]
    fn prediction_lookup_uses_string_keys() {
        let state = must_ok(ForecastState::from_document(json!({
            "users": ["alice"],
            "matches": [{"id": 4, "home_team": "A", "away_team": "B"}],
            "predictions": {"alice": {"4": {"leg1_home": 1, "leg1_away": 0}}}
        })));
        let prediction = state.prediction_for("alice", TieId(4));
        assert_eq!(
            prediction.and_then(|value| value.leg(Leg::First)),
            Some(Score::new(1, 0))
        );
        assert_eq!(state.prediction_for("alice", TieId(5)), None);
    }

    #[test]
    fn leaderboard_orders_by_total_then_participant() {
        let mut state = fixture_state();
        let exact = Prediction::from_legs(Some(Score::new(2, 0)), Some(Score::new(3, 1)));
        state.set_prediction("carol", TieId(1), exact.clone());
        state.set_prediction("bob", TieId(1), exact);

        let rows = build_leaderboard(&state, &TournamentConfig::v1());
        let order: Vec<(&str, u32, usize)> = rows
            .iter()
            .map(|row| (row.participant.as_str(), row.total, row.rank))
            .collect();
        assert_eq!(order, vec![("bob", 8, 1), ("carol", 8, 1), ("alice", 0, 3)]);
        assert_eq!(rows[2].breakdown.len(), 1);
        assert_eq!(rows[2].breakdown[0].points, ScoreBreakdown::default());
    }

    #[test]
    fn dropping_a_participant_leaves_other_scores_unchanged() {
        let mut state = fixture_state();
        let exact = Prediction::from_legs(Some(Score::new(2, 0)), Some(Score::new(3, 1)));
        state.set_prediction("alice", TieId(1), exact.clone());
        state.set_prediction("bob", TieId(1), exact);

        let before = build_leaderboard(&state, &TournamentConfig::v1());
        let bob_before = before.iter().find(|row| row.participant == "bob").cloned();

        state.participants.remove("alice");
        state.predictions.remove("alice");
        let after = build_leaderboard(&state, &TournamentConfig::v1());
        assert!(after.iter().all(|row| row.participant != "alice"));
        let bob_after = after.iter().find(|row| row.participant == "bob").cloned();
        assert_eq!(
            bob_after.map(|row| (row.total, row.breakdown)),
            bob_before.map(|row| (row.total, row.breakdown))
        );
    }

    #[test]
    fn view_builds_dashboard_and_bracket() {
        let mut state = fixture_state();
        state.set_prediction(
            "alice",
            TieId(1),
            Prediction::from_legs(Some(Score::new(2, 0)), Some(Score::new(3, 1))),
        );
        let config = TournamentConfig::v1();
        let view = ForecastView::new(&state, &config, must_utc("2025-03-06T00:00:00Z"));

        let dashboard = must_ok(view.dashboard("alice"));
        assert_eq!(dashboard.standing.rank, 1);
        assert_eq!(dashboard.ties.len(), 1);
        assert!(dashboard.ties[0].locks.leg1_locked);
        assert!(!dashboard.ties[0].locks.leg2_locked);
        assert!(!dashboard.ties[0].locks.fully_locked);
        assert_eq!(dashboard.ties[0].points.total, 8);

        let bracket = view.bracket();
        assert_eq!(
            bracket[0].aggregate,
            Some(Aggregate {
                team_a: 3,
                team_b: 3
            })
        );
        assert_eq!(bracket[0].qualifier_team.as_deref(), Some("Atletico Madrid"));

        assert!(matches!(
            view.dashboard("nobody"),
            Err(ForecastError::NotFound(_))
        ));
        assert!(matches!(
            view.score("alice", TieId(99)),
            Err(ForecastError::NotFound(_))
        ));
    }

    #[test]
    fn legacy_participant_list_becomes_incomplete_profiles() {
        let migrated = must_ok(migrate_state(json!({
            "users": ["alice", "bob"],
            "admin_password": "admin123",
            "matches": [],
            "predictions": {}
        })));

        assert_eq!(
            migrated["users"]["alice"],
            json!({
                "email": null,
                "password_hash": null,
                "reset_token": null,
                "reset_token_expires_at": null,
                "language": null,
                "needs_profile_completion": true
            })
        );
        assert_eq!(migrated["admin_password"], json!("admin123"));
        assert_eq!(migrated["matches"].as_array().map(Vec::len), Some(8));
    }

    #[test]
    fn profile_mapping_gets_language_backfilled() {
        let migrated = must_ok(migrate_state(json!({
            "users": {"alice": {"email": "a@example.com", "password_hash": "x"}},
            "matches": [{"id": 1, "home_team": "A", "away_team": "B", "leg1_deadline": "2025-03-04T20:00", "leg2_deadline": ""}]
        })));

        let alice = &migrated["users"]["alice"];
        assert_eq!(alice["language"], Value::Null);
        assert_eq!(alice["reset_token"], Value::Null);
        assert_eq!(alice["needs_profile_completion"], json!(false));
        assert_eq!(migrated["matches"][0]["leg1_deadline"], json!("2025-03-04T20:00:00Z"));
        assert_eq!(migrated["matches"][0]["leg2_deadline"], Value::Null);
        assert_eq!(migrated["matches"][0]["actual_leg2_away"], Value::Null);
        assert_eq!(migrated["predictions"], json!({}));
    }

    #[test]
    fn malformed_state_is_rejected() {
        for raw in [
            json!([]),
            json!({"users": "alice"}),
            json!({"users": [1, 2]}),
            json!({"users": {"alice": 3}}),
            json!({"users": {}, "matches": {}}),
            json!({"users": {}, "matches": [{"id": 1, "home_team": "A", "away_team": "B", "leg1_deadline": "soon"}]}),
            json!({"users": {}, "matches": [], "predictions": []}),
        ] {
            assert!(
                matches!(migrate_state(raw.clone()), Err(ForecastError::MalformedState(_))),
                "expected malformed state for {raw}"
            );
        }

        let duplicate = ForecastState::from_document(json!({
            "users": {},
            "matches": [
                {"id": 1, "home_team": "A", "away_team": "B"},
                {"id": 1, "home_team": "C", "away_team": "D"}
            ]
        }));
        assert!(matches!(duplicate, Err(ForecastError::MalformedState(_))));
    }

    #[test]
    fn migration_normalizes_participant_ids() {
        let migrated = must_ok(migrate_state(json!({
            "users": ["Alice", " bob ", "alice"],
            "matches": [],
            "predictions": {"Alice": {"1": {"leg1_home": 1, "leg1_away": 0}}}
        })));
        let users = migrated["users"].as_object().map(|users| {
            users.keys().cloned().collect::<Vec<_>>()
        });
        assert_eq!(users, Some(vec!["alice".to_string(), "bob".to_string()]));
        assert_eq!(migrated["predictions"]["alice"]["1"]["leg1_home"], json!(1));
        assert!(migrated["predictions"].get("Alice").is_none());

        let state = must_ok(ForecastState::from_document(migrated));
        assert!(state.prediction_for("alice", TieId(1)).is_some());
    }

    #[test]
    fn migration_rejects_colliding_or_non_canonical_keys() {
        for raw in [
            json!({"users": {"Alice": {}, "alice": {}}, "matches": []}),
            json!({"users": [""], "matches": []}),
            json!({"users": ["alice"], "matches": [], "predictions": {"alice": {"01": {}}}}),
            json!({"users": ["alice"], "matches": [], "predictions": {"alice": {"x": {}}}}),
            json!({"users": ["alice"], "matches": [], "predictions": {"Alice": {}, "alice": {}}}),
        ] {
            assert!(
                matches!(migrate_state(raw.clone()), Err(ForecastError::MalformedState(_))),
                "expected malformed state for {raw}"
            );
        }
    }

    #[test]
    fn deadline_normalization_converts_offsets_to_utc() {
        assert_eq!(
            must_ok(normalize_deadline("2025-03-04T21:00:00+01:00")),
            "2025-03-04T20:00:00Z"
        );
        assert_eq!(
            must_ok(normalize_deadline("2025-03-04T20:00:30")),
            "2025-03-04T20:00:30Z"
        );
    }

    #[test]
    fn config_validation_rejects_inverted_tiers() {
        let mut config = TournamentConfig::v1();
        config.scoring.outcome_points = 5;
        assert!(matches!(
            config.validate(),
            Err(ForecastError::Configuration(_))
        ));

        let decoded = must_ok(TournamentConfig::from_json(&json!({
            "config_version": 1,
            "scoring": ScoringPolicy::classic(),
            "tiebreak": "leg2_host_advantage",
            "max_participants": 12
        })));
        assert_eq!(decoded.tiebreak, TiebreakPolicy::Leg2HostAdvantage);
        assert!(TournamentConfig::from_json(&json!({"config_version": 1})).is_err());
        for name in ScoringPolicy::PRESET_NAMES {
            assert!(ScoringPolicy::preset(name).is_some_and(|policy| policy.validate().is_ok()));
        }
    }

    #[test]
    fn participant_ids_are_trimmed_and_lowercased() {
        assert_eq!(must_ok(normalize_participant_id("  Alice ")), "alice");
        assert!(normalize_participant_id("   ").is_err());
    }

    fn score_strategy() -> impl Strategy<Value = Score> {
        (0u32..6, 0u32..6).prop_map(|(home, away)| Score::new(home, away))
    }

    fn policy_strategy() -> impl Strategy<Value = ScoringPolicy> {
        prop_oneof![
            Just(ScoringPolicy::classic()),
            Just(ScoringPolicy::qualifier_bonus()),
            Just(ScoringPolicy::classic_with_qualifier()),
        ]
    }

    fn tiebreak_strategy() -> impl Strategy<Value = TiebreakPolicy> {
        prop_oneof![
            Just(TiebreakPolicy::AwayGoals),
            Just(TiebreakPolicy::Leg2HostAdvantage),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn prop_leg_points_are_a_single_tier(
            scoring in policy_strategy(),
            tiebreak in tiebreak_strategy(),
            predicted in (score_strategy(), score_strategy()),
            actual in (prop::option::of(score_strategy()), prop::option::of(score_strategy())),
        ) {
            let mut tie = Tie::new(TieId(1), "A", "B");
            tie.record_results(&ResultEntry {
                leg1_home: actual.0.map(|score| score.home),
                leg1_away: actual.0.map(|score| score.away),
                leg2_home: actual.1.map(|score| score.home),
                leg2_away: actual.1.map(|score| score.away),
            });
            let prediction = Prediction::from_legs(Some(predicted.0), Some(predicted.1));
            let config = config_with(scoring.clone(), tiebreak);
            let breakdown = score_prediction(&prediction, &tie, &config);

            let mut allowed = vec![0, scoring.exact_score_points, scoring.outcome_points];
            allowed.extend(scoring.goal_difference_points);
            prop_assert!(allowed.contains(&breakdown.leg1));
            prop_assert!(allowed.contains(&breakdown.leg2));
            prop_assert!(breakdown.qualifier == 0 || breakdown.qualifier == scoring.qualifier_bonus_points);
            prop_assert_eq!(breakdown.total, breakdown.leg1 + breakdown.leg2 + breakdown.qualifier);
            prop_assert!(breakdown.total <= scoring.max_points_per_tie());
        }

        #[test]
        fn prop_qualifier_is_undetermined_iff_leg_missing(
            leg1 in prop::option::of(score_strategy()),
            leg2 in prop::option::of(score_strategy()),
            tiebreak in tiebreak_strategy(),
        ) {
            let qualifier = resolve_qualifier(leg1, leg2, tiebreak);
            prop_assert_eq!(
                qualifier == Qualifier::Undetermined,
                leg1.is_none() || leg2.is_none()
            );
        }

        #[test]
        fn prop_lock_is_monotonic(offsets in prop::collection::vec(-10_000i64..10_000, 2..20)) {
            let tie = fixture_tie();
            let base = must_utc("2025-03-04T20:00:00Z");
            let mut sorted = offsets;
            sorted.sort_unstable();
            let states: Vec<bool> = sorted
                .iter()
                .map(|offset| is_leg_locked(&tie, Leg::First, base + time::Duration::seconds(*offset)))
                .collect();
            for pair in states.windows(2) {
                prop_assert!(!(pair[0] && !pair[1]));
            }
        }

        #[test]
        fn prop_migration_is_idempotent(
            ids in prop::collection::vec("[a-z]{1,6}", 0..6),
            legacy in any::<bool>(),
            with_ties in any::<bool>(),
        ) {
            let users = if legacy {
                json!(ids)
            } else {
                let mut map = Map::new();
                for id in &ids {
                    map.insert(id.clone(), json!({"email": format!("{id}@example.com")}));
                }
                Value::Object(map)
            };
            let matches = if with_ties {
                json!([{"id": 2, "home_team": "A", "away_team": "B", "leg1_deadline": "2025-03-04T20:00"}])
            } else {
                json!([])
            };
            let once = must_ok(migrate_state(json!({"users": users, "matches": matches})));
            let twice = must_ok(migrate_state(once.clone()));
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_leaderboard_order_is_total_and_stable(
            totals in prop::collection::vec((0u32..4, 0u32..4), 1..8),
        ) {
            let mut state = fixture_state();
            state.participants.clear();
            for (index, (home, away)) in totals.iter().enumerate() {
                let id = format!("p{index}");
                state.participants.insert(id.clone(), ParticipantProfile::incomplete());
                state.set_prediction(
                    &id,
                    TieId(1),
                    Prediction::from_legs(Some(Score::new(*home, *away)), Some(Score::new(3, 1))),
                );
            }
            let config = TournamentConfig::v1();
            let first = build_leaderboard(&state, &config);
            let second = build_leaderboard(&state, &config);
            prop_assert_eq!(&first, &second);
            for pair in first.windows(2) {
                prop_assert!(
                    pair[0].total > pair[1].total
                        || (pair[0].total == pair[1].total && pair[0].participant < pair[1].participant)
                );
                prop_assert!(pair[0].rank <= pair[1].rank);
            }
        }
    }
}
