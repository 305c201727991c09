use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scalar state fields addressable by deltas and threshold expressions.
///
/// The first eight are the emotional registers and decay toward a baseline;
/// the last two are meta fields that only move when a delta moves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarField {
    Engagement,
    CognitiveLoad,
    RelationalWarmth,
    UncertaintyTolerance,
    Curiosity,
    Contentment,
    Anticipation,
    Concern,
    CoherenceConfidence,
    EnergyAvailable,
}

impl ScalarField {
    pub const ALL: [ScalarField; 10] = [
        Self::Engagement,
        Self::CognitiveLoad,
        Self::RelationalWarmth,
        Self::UncertaintyTolerance,
        Self::Curiosity,
        Self::Contentment,
        Self::Anticipation,
        Self::Concern,
        Self::CoherenceConfidence,
        Self::EnergyAvailable,
    ];

    pub const EMOTIONAL: [ScalarField; 8] = [
        Self::Engagement,
        Self::CognitiveLoad,
        Self::RelationalWarmth,
        Self::UncertaintyTolerance,
        Self::Curiosity,
        Self::Contentment,
        Self::Anticipation,
        Self::Concern,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Engagement => "engagement",
            Self::CognitiveLoad => "cognitive_load",
            Self::RelationalWarmth => "relational_warmth",
            Self::UncertaintyTolerance => "uncertainty_tolerance",
            Self::Curiosity => "curiosity",
            Self::Contentment => "contentment",
            Self::Anticipation => "anticipation",
            Self::Concern => "concern",
            Self::CoherenceConfidence => "coherence_confidence",
            Self::EnergyAvailable => "energy_available",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }

    pub fn is_emotional(&self) -> bool {
        Self::EMOTIONAL.contains(self)
    }
}

/// What the entity is doing right now. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    #[default]
    Idle,
    Chat,
    Research,
    Reflection,
    Dreaming,
    Journal,
    Other,
}

impl Activity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Chat => "chat",
            Self::Research => "research",
            Self::Reflection => "reflection",
            Self::Dreaming => "dreaming",
            Self::Journal => "journal",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single process-wide state record. Mutated only by the bus, persisted
/// on every change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalState {
    // Emotional registers, all in [0,1]
    pub engagement: f32,
    pub cognitive_load: f32,
    pub relational_warmth: f32,
    pub uncertainty_tolerance: f32,
    pub curiosity: f32,
    pub contentment: f32,
    pub anticipation: f32,
    pub concern: f32,

    // Meta
    pub coherence_confidence: f32,
    pub energy_available: f32,

    // Activity
    pub current_activity: Activity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_user_id: Option<String>,

    // Rhythm
    pub rhythm_phase: String,
    pub rhythm_day_summary: String,
    pub day_epoch: i64,

    // Narrative, bounded to the most recent N, insertion order preserved
    pub active_threads: Vec<String>,
    pub active_questions: Vec<String>,

    // Audit
    pub last_updated: DateTime<Utc>,
    pub last_updated_by: String,
    pub revision: u64,
}

impl GlobalState {
    pub fn initial(now: DateTime<Utc>, day_epoch: i64) -> Self {
        Self {
            engagement: 0.4,
            cognitive_load: 0.2,
            relational_warmth: 0.5,
            uncertainty_tolerance: 0.6,
            curiosity: 0.5,
            contentment: 0.5,
            anticipation: 0.4,
            concern: 0.2,
            coherence_confidence: 0.7,
            energy_available: 0.8,
            current_activity: Activity::Idle,
            active_session_id: None,
            active_user_id: None,
            rhythm_phase: "night".to_string(),
            rhythm_day_summary: String::new(),
            day_epoch,
            active_threads: Vec::new(),
            active_questions: Vec::new(),
            last_updated: now,
            last_updated_by: "init".to_string(),
            revision: 0,
        }
    }

    pub fn scalar(&self, field: ScalarField) -> f32 {
        match field {
            ScalarField::Engagement => self.engagement,
            ScalarField::CognitiveLoad => self.cognitive_load,
            ScalarField::RelationalWarmth => self.relational_warmth,
            ScalarField::UncertaintyTolerance => self.uncertainty_tolerance,
            ScalarField::Curiosity => self.curiosity,
            ScalarField::Contentment => self.contentment,
            ScalarField::Anticipation => self.anticipation,
            ScalarField::Concern => self.concern,
            ScalarField::CoherenceConfidence => self.coherence_confidence,
            ScalarField::EnergyAvailable => self.energy_available,
        }
    }

    fn scalar_mut(&mut self, field: ScalarField) -> &mut f32 {
        match field {
            ScalarField::Engagement => &mut self.engagement,
            ScalarField::CognitiveLoad => &mut self.cognitive_load,
            ScalarField::RelationalWarmth => &mut self.relational_warmth,
            ScalarField::UncertaintyTolerance => &mut self.uncertainty_tolerance,
            ScalarField::Curiosity => &mut self.curiosity,
            ScalarField::Contentment => &mut self.contentment,
            ScalarField::Anticipation => &mut self.anticipation,
            ScalarField::Concern => &mut self.concern,
            ScalarField::CoherenceConfidence => &mut self.coherence_confidence,
            ScalarField::EnergyAvailable => &mut self.energy_available,
        }
    }

    /// Merge a delta into a copy of this state.
    ///
    /// Numeric patches add and clamp; narrative patches union or remove;
    /// activity transitions are validated before anything is touched. Returns
    /// the merged state plus human-readable notes for every clamp that fired.
    pub fn merged(
        &self,
        delta: &StateDelta,
        now: DateTime<Utc>,
        narrative_cap: usize,
    ) -> Result<(GlobalState, Vec<String>), DeltaError> {
        if let Some(patch) = &delta.activity {
            self.check_activity_patch(patch, &delta.source)?;
        }
        for patch in delta.threads.iter().chain(delta.questions.iter()) {
            if patch.id.trim().is_empty() {
                return Err(DeltaError::EmptyNarrativeId);
            }
        }

        let mut next = self.clone();
        let mut notes = Vec::new();

        for patch in &delta.scalars {
            let slot = next.scalar_mut(patch.field);
            let raw = *slot + patch.add;
            let clamped = raw.clamp(0.0, 1.0);
            if (raw - clamped).abs() > f32::EPSILON {
                notes.push(format!(
                    "{} clamped from {:.3} to {:.3}",
                    patch.field.name(),
                    raw,
                    clamped
                ));
            }
            *slot = clamped;
        }

        if let Some(patch) = &delta.activity {
            next.current_activity = patch.activity;
            next.active_session_id = patch.session_id.clone();
            next.active_user_id = patch.user_id.clone();
        }

        if let Some(patch) = &delta.rhythm {
            if let Some(phase) = &patch.phase {
                next.rhythm_phase = phase.clone();
            }
            if let Some(summary) = &patch.day_summary {
                next.rhythm_day_summary = summary.clone();
            }
            if let Some(epoch) = patch.day_epoch {
                // day_epoch only moves forward; a stale value is dropped, not fatal
                if epoch >= next.day_epoch {
                    next.day_epoch = epoch;
                } else {
                    notes.push(format!(
                        "day_epoch {} behind current {}, ignored",
                        epoch, next.day_epoch
                    ));
                }
            }
        }

        apply_set_patches(&mut next.active_threads, &delta.threads, narrative_cap);
        apply_set_patches(&mut next.active_questions, &delta.questions, narrative_cap);

        next.last_updated = now;
        next.last_updated_by = delta.source.clone();
        next.revision = self.revision + 1;

        Ok((next, notes))
    }

    fn check_activity_patch(&self, patch: &ActivityPatch, source: &str) -> Result<(), DeltaError> {
        if let Some(expected) = patch.expect_activity {
            if expected != self.current_activity {
                return Err(DeltaError::StaleExpectation {
                    expected,
                    found: self.current_activity,
                });
            }
        }
        // Activity coherence: idle means no session, non-idle means a session
        if patch.activity == Activity::Idle && patch.session_id.is_some() {
            return Err(DeltaError::IdleWithSession);
        }
        if patch.activity != Activity::Idle && patch.session_id.is_none() {
            return Err(DeltaError::MissingSessionId);
        }
        // Non-idle to non-idle needs an intervening idle, except a chat source
        // taking over (a user message preempts background activity)
        if self.current_activity != Activity::Idle
            && patch.activity != Activity::Idle
            && source != "chat"
        {
            return Err(DeltaError::ActivityTransition {
                from: self.current_activity,
                to: patch.activity,
            });
        }
        Ok(())
    }
}

fn apply_set_patches(set: &mut Vec<String>, patches: &[SetPatch], cap: usize) {
    for patch in patches {
        if patch.remove {
            set.retain(|id| *id != patch.id);
        } else if !set.contains(&patch.id) {
            set.push(patch.id.clone());
        }
    }
    if set.len() > cap {
        let overflow = set.len() - cap;
        set.drain(..overflow);
    }
}

/// Additive patch to one scalar field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarPatch {
    pub field: ScalarField,
    pub add: f32,
}

/// Replacement of the activity triple, optionally guarded by a CAS
/// expectation on the current activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityPatch {
    pub activity: Activity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect_activity: Option<Activity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RhythmPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_epoch: Option<i64>,
}

/// Union (default) or removal of one narrative id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPatch {
    pub id: String,
    #[serde(default)]
    pub remove: bool,
}

/// Event requested by a delta, published after the write is visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSpec {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A partial, auditable update to [`GlobalState`]. Deltas are merged, never
/// raw-overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDelta {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scalars: Vec<ScalarPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rhythm: Option<RhythmPatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub threads: Vec<SetPatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<SetPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emit: Option<EventSpec>,
}

impl StateDelta {
    pub fn new(source: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            timestamp,
            reason: None,
            scalars: Vec::new(),
            activity: None,
            rhythm: None,
            threads: Vec::new(),
            questions: Vec::new(),
            emit: None,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn nudge(mut self, field: ScalarField, add: f32) -> Self {
        self.scalars.push(ScalarPatch { field, add });
        self
    }

    pub fn start_session(mut self, activity: Activity, session_id: impl Into<String>) -> Self {
        self.activity = Some(ActivityPatch {
            activity,
            session_id: Some(session_id.into()),
            user_id: None,
            expect_activity: None,
        });
        self
    }

    pub fn end_session(mut self) -> Self {
        self.activity = Some(ActivityPatch {
            activity: Activity::Idle,
            session_id: None,
            user_id: None,
            expect_activity: None,
        });
        self
    }

    pub fn rhythm(mut self, patch: RhythmPatch) -> Self {
        self.rhythm = Some(patch);
        self
    }

    pub fn thread(mut self, id: impl Into<String>) -> Self {
        self.threads.push(SetPatch { id: id.into(), remove: false });
        self
    }

    pub fn question(mut self, id: impl Into<String>) -> Self {
        self.questions.push(SetPatch { id: id.into(), remove: false });
        self
    }

    pub fn emit(mut self, name: impl Into<String>, payload: serde_json::Value) -> Self {
        self.emit = Some(EventSpec { name: name.into(), payload });
        self
    }

    /// True when applying this delta could not change any state field.
    pub fn is_noop(&self) -> bool {
        self.scalars.iter().all(|p| p.add == 0.0)
            && self.activity.is_none()
            && self.rhythm.is_none()
            && self.threads.is_empty()
            && self.questions.is_empty()
    }
}

/// Schema-level rejection of a delta. Anything merely out of range is
/// clamped instead and never reaches this type.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeltaError {
    #[error("activity transition {from} -> {to} requires an intervening idle")]
    ActivityTransition { from: Activity, to: Activity },
    #[error("non-idle activity requires a session id")]
    MissingSessionId,
    #[error("idle activity cannot carry a session id")]
    IdleWithSession,
    #[error("expected activity {expected}, found {found}")]
    StaleExpectation { expected: Activity, found: Activity },
    #[error("narrative id must not be empty")]
    EmptyNarrativeId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> GlobalState {
        GlobalState::initial(Utc::now(), 20_000)
    }

    mod merge_tests {
        use super::*;

        #[test]
        fn scalar_adds_clamp_to_unit_interval() {
            let state = base();
            let delta = StateDelta::new("test", Utc::now())
                .nudge(ScalarField::Curiosity, 2.0)
                .nudge(ScalarField::Concern, -5.0);

            let (next, notes) = state.merged(&delta, Utc::now(), 16).unwrap();
            assert_eq!(next.curiosity, 1.0);
            assert_eq!(next.concern, 0.0);
            assert_eq!(notes.len(), 2);
        }

        #[test]
        fn revision_increments_on_every_merge() {
            let state = base();
            let delta = StateDelta::new("test", Utc::now()).nudge(ScalarField::Engagement, 0.1);
            let (next, _) = state.merged(&delta, Utc::now(), 16).unwrap();
            assert_eq!(next.revision, state.revision + 1);
            let (after, _) = next.merged(&delta, Utc::now(), 16).unwrap();
            assert_eq!(after.revision, state.revision + 2);
        }

        #[test]
        fn source_recorded_in_audit_fields() {
            let state = base();
            let delta = StateDelta::new("dream.nightly", Utc::now())
                .nudge(ScalarField::Contentment, 0.1);
            let (next, _) = state.merged(&delta, Utc::now(), 16).unwrap();
            assert_eq!(next.last_updated_by, "dream.nightly");
        }

        #[test]
        fn stale_day_epoch_is_dropped_with_note() {
            let state = base();
            let delta = StateDelta::new("rhythm.phase_check", Utc::now()).rhythm(RhythmPatch {
                day_epoch: Some(state.day_epoch - 1),
                ..Default::default()
            });
            let (next, notes) = state.merged(&delta, Utc::now(), 16).unwrap();
            assert_eq!(next.day_epoch, state.day_epoch);
            assert_eq!(notes.len(), 1);
        }
    }

    mod activity_tests {
        use super::*;

        #[test]
        fn session_start_and_end_round_trip() {
            let state = base();
            let start = StateDelta::new("scheduler", Utc::now())
                .start_session(Activity::Research, "sess-1");
            let (mid, _) = state.merged(&start, Utc::now(), 16).unwrap();
            assert_eq!(mid.current_activity, Activity::Research);
            assert_eq!(mid.active_session_id.as_deref(), Some("sess-1"));

            let end = StateDelta::new("scheduler", Utc::now()).end_session();
            let (done, _) = mid.merged(&end, Utc::now(), 16).unwrap();
            assert_eq!(done.current_activity, Activity::Idle);
            assert_eq!(done.active_session_id, None);
        }

        #[test]
        fn non_idle_to_non_idle_rejected_for_background_sources() {
            let state = base();
            let start = StateDelta::new("scheduler", Utc::now())
                .start_session(Activity::Research, "sess-1");
            let (mid, _) = state.merged(&start, Utc::now(), 16).unwrap();

            let hijack = StateDelta::new("dream.nightly", Utc::now())
                .start_session(Activity::Dreaming, "sess-2");
            let err = mid.merged(&hijack, Utc::now(), 16).unwrap_err();
            assert!(matches!(err, DeltaError::ActivityTransition { .. }));
        }

        #[test]
        fn chat_source_may_preempt_a_running_session() {
            let state = base();
            let start = StateDelta::new("scheduler", Utc::now())
                .start_session(Activity::Dreaming, "sess-1");
            let (mid, _) = state.merged(&start, Utc::now(), 16).unwrap();

            let chat = StateDelta::new("chat", Utc::now()).start_session(Activity::Chat, "sess-2");
            let (next, _) = mid.merged(&chat, Utc::now(), 16).unwrap();
            assert_eq!(next.current_activity, Activity::Chat);
        }

        #[test]
        fn idle_with_session_id_is_schema_error() {
            let state = base();
            let mut delta = StateDelta::new("test", Utc::now());
            delta.activity = Some(ActivityPatch {
                activity: Activity::Idle,
                session_id: Some("sess-1".to_string()),
                user_id: None,
                expect_activity: None,
            });
            assert_eq!(
                state.merged(&delta, Utc::now(), 16).unwrap_err(),
                DeltaError::IdleWithSession
            );
        }

        #[test]
        fn cas_expectation_mismatch_rejected() {
            let state = base();
            let mut delta = StateDelta::new("test", Utc::now());
            delta.activity = Some(ActivityPatch {
                activity: Activity::Journal,
                session_id: Some("sess-1".to_string()),
                user_id: None,
                expect_activity: Some(Activity::Chat),
            });
            assert!(matches!(
                state.merged(&delta, Utc::now(), 16).unwrap_err(),
                DeltaError::StaleExpectation { .. }
            ));
        }
    }

    mod narrative_tests {
        use super::*;

        #[test]
        fn threads_union_preserves_insertion_order() {
            let state = base();
            let delta = StateDelta::new("test", Utc::now())
                .thread("t-alpha")
                .thread("t-beta")
                .thread("t-alpha");
            let (next, _) = state.merged(&delta, Utc::now(), 16).unwrap();
            assert_eq!(next.active_threads, vec!["t-alpha", "t-beta"]);
        }

        #[test]
        fn narrative_cap_evicts_oldest() {
            let mut state = base();
            state.active_threads = vec!["t-1".into(), "t-2".into(), "t-3".into()];
            let delta = StateDelta::new("test", Utc::now()).thread("t-4");
            let (next, _) = state.merged(&delta, Utc::now(), 3).unwrap();
            assert_eq!(next.active_threads, vec!["t-2", "t-3", "t-4"]);
        }

        #[test]
        fn remove_patch_drops_entry() {
            let mut state = base();
            state.active_questions = vec!["q-1".into(), "q-2".into()];
            let mut delta = StateDelta::new("test", Utc::now());
            delta.questions.push(SetPatch { id: "q-1".to_string(), remove: true });
            let (next, _) = state.merged(&delta, Utc::now(), 16).unwrap();
            assert_eq!(next.active_questions, vec!["q-2"]);
        }
    }

    mod serde_tests {
        use super::*;

        #[test]
        fn state_serialization_round_trip() {
            let state = base();
            let json = serde_json::to_string(&state).unwrap();
            let parsed: GlobalState = serde_json::from_str(&json).unwrap();
            assert_eq!(state, parsed);
        }

        #[test]
        fn activity_serializes_snake_case() {
            let json = serde_json::to_string(&Activity::Dreaming).unwrap();
            assert_eq!(json, "\"dreaming\"");
        }

        #[test]
        fn scalar_field_names_round_trip() {
            for field in ScalarField::ALL {
                assert_eq!(ScalarField::parse(field.name()), Some(field));
            }
            assert_eq!(ScalarField::parse("unknown_field"), None);
        }
    }
}
