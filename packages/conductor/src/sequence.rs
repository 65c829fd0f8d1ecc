//! Sequence definitions: sequences of movements of beats.
//!
//! A [`Sequence`] is an immutable workflow definition supplied by a plugin at
//! mount time. Movements run in array order; beats within a movement run in
//! ascending beat-number order, each publishing one named event.
//!
//! # Wire shape
//!
//! Definitions are plain JSON (camelCase fields, kebab-case policy values):
//!
//! ```json
//! {
//!   "id": "canvas-drop",
//!   "name": "Canvas.drop-symphony",
//!   "tempo": 120,
//!   "movements": [
//!     { "name": "place", "beats": [
//!       { "beat": 1, "event": "canvas:drop", "dynamics": "mf", "timing": "immediate" },
//!       { "beat": 2, "event": "canvas:render", "dynamics": "f", "errorHandling": "abort-sequence" }
//!     ] }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::telemetry::RESERVED_PREFIX;

/// Tempo used when a sequence does not declare one.
pub const DEFAULT_TEMPO: u32 = 120;

/// A reusable workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    /// Registry key used by `submit`.
    pub id: String,
    /// Display name; its leading qualifier is the owner name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Beats per minute, used only for inter-beat delays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<u32>,
    /// Skip duplicate suppression for this sequence.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bypass_dedup: bool,
    pub movements: Vec<Movement>,
}

/// Ordered grouping of beats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movement {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub beats: Vec<Beat>,
}

/// One unit of work: publishes a single event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beat {
    /// Position within the movement, starting at 1.
    pub beat: u32,
    pub event: String,
    #[serde(default)]
    pub dynamics: Option<Dynamics>,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Static payload merged into the published event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

/// Informational intensity label. Never used for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dynamics {
    #[serde(rename = "pp", alias = "pianissimo")]
    Pianissimo,
    #[serde(rename = "p", alias = "piano")]
    Piano,
    #[serde(rename = "mp", alias = "mezzo-piano")]
    MezzoPiano,
    #[serde(rename = "mf", alias = "mezzo-forte")]
    MezzoForte,
    #[serde(rename = "f", alias = "forte")]
    Forte,
    #[serde(rename = "ff", alias = "fortissimo")]
    Fortissimo,
}

impl Dynamics {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dynamics::Pianissimo => "pp",
            Dynamics::Piano => "p",
            Dynamics::MezzoPiano => "mp",
            Dynamics::MezzoForte => "mf",
            Dynamics::Forte => "f",
            Dynamics::Fortissimo => "ff",
        }
    }
}

impl fmt::Display for Dynamics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dynamics {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pp" | "pianissimo" => Ok(Dynamics::Pianissimo),
            "p" | "piano" => Ok(Dynamics::Piano),
            "mp" | "mezzo-piano" => Ok(Dynamics::MezzoPiano),
            "mf" | "mezzo-forte" => Ok(Dynamics::MezzoForte),
            "f" | "forte" => Ok(Dynamics::Forte),
            "ff" | "fortissimo" => Ok(Dynamics::Fortissimo),
            other => Err(format!("unrecognized dynamics '{other}'")),
        }
    }
}

/// Delay applied after a beat, relative to the sequence's beat duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Timing {
    #[default]
    Immediate,
    AfterBeat,
    Delayed,
    Synchronized,
}

impl Timing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timing::Immediate => "immediate",
            Timing::AfterBeat => "after-beat",
            Timing::Delayed => "delayed",
            Timing::Synchronized => "synchronized",
        }
    }

    /// Delay before the next beat for a beat of the given duration.
    pub fn delay(&self, beat_duration: Duration) -> Duration {
        match self {
            Timing::Immediate => Duration::ZERO,
            Timing::AfterBeat => beat_duration,
            Timing::Delayed => beat_duration.mul_f64(1.5),
            Timing::Synchronized => beat_duration / 2,
        }
    }
}

/// What the executor does when a beat fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorHandling {
    #[default]
    Continue,
    AbortSequence,
    /// Bounded retry with exponential backoff; aborts once exhausted.
    Retry,
}

impl ErrorHandling {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorHandling::Continue => "continue",
            ErrorHandling::AbortSequence => "abort-sequence",
            ErrorHandling::Retry => "retry",
        }
    }
}

impl Sequence {
    /// Start building a sequence in code.
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> SequenceBuilder {
        SequenceBuilder::new(id, name)
    }

    /// Duration of one beat: `60_000 / tempo` milliseconds.
    pub fn beat_duration(&self) -> Duration {
        beat_duration(self.tempo.unwrap_or(DEFAULT_TEMPO))
    }

    /// Total number of beats across all movements.
    pub fn total_beats(&self) -> usize {
        self.movements.iter().map(|m| m.beats.len()).sum()
    }

    /// Every distinct event name the sequence publishes.
    pub fn event_names(&self) -> HashSet<&str> {
        self.movements
            .iter()
            .flat_map(|m| m.beats.iter().map(|b| b.event.as_str()))
            .collect()
    }

    /// Structural validation.
    ///
    /// Hard errors make the sequence unmountable; warnings are advisory.
    pub fn validate(&self) -> Validation {
        let mut report = Validation::default();

        if self.id.trim().is_empty() {
            report.error("sequence id is empty");
        }
        if self.name.trim().is_empty() {
            report.error("sequence name is empty");
        }
        if self.description.is_none() {
            report.warn(format!("sequence '{}' has no description", self.name));
        }
        if self.version.is_none() {
            report.warn(format!("sequence '{}' has no version", self.name));
        }
        if self.tempo == Some(0) {
            report.error("tempo must be greater than zero");
        }
        if self.movements.is_empty() {
            report.error("sequence has no movements");
        }

        for (mi, movement) in self.movements.iter().enumerate() {
            if movement.name.trim().is_empty() {
                report.error(format!("movement {mi} has no name"));
            }
            if movement.beats.is_empty() {
                report.error(format!("movement {mi} ('{}') has no beats", movement.name));
                continue;
            }

            let mut seen = HashSet::new();
            let mut previous = 0;
            for (bi, beat) in movement.beats.iter().enumerate() {
                let at = format!("movement {mi} ('{}') beat index {bi}", movement.name);
                if beat.beat == 0 {
                    report.error(format!("{at}: beat number must be at least 1"));
                }
                if !seen.insert(beat.beat) {
                    report.error(format!("{at}: duplicate beat number {}", beat.beat));
                } else if beat.beat < previous {
                    report.warn(format!(
                        "{at}: beat {} is declared after beat {previous}; beats run in ascending order",
                        beat.beat
                    ));
                }
                previous = previous.max(beat.beat);

                if beat.event.trim().is_empty() {
                    report.error(format!("{at}: event name is empty"));
                } else if beat.event.starts_with(RESERVED_PREFIX) {
                    report.error(format!(
                        "{at}: event '{}' uses the reserved '{RESERVED_PREFIX}' prefix",
                        beat.event
                    ));
                }
                if beat.dynamics.is_none() {
                    report.error(format!("{at}: dynamics is missing"));
                }
            }
        }

        report
    }
}

/// Duration of one beat at the given tempo.
pub fn beat_duration(tempo: u32) -> Duration {
    Duration::from_millis(60_000 / u64::from(tempo.max(1)))
}

/// Outcome of [`Sequence::validate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Fluent construction of sequences in code.
///
/// ```ignore
/// let seq = Sequence::builder("canvas-drop", "Canvas.drop-symphony")
///     .tempo(240)
///     .movement("place", |m| {
///         m.beat(1, "canvas:drop", Dynamics::MezzoForte)
///          .beat(2, "canvas:render", Dynamics::Forte)
///     })
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct SequenceBuilder {
    sequence: Sequence,
}

impl SequenceBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            sequence: Sequence {
                id: id.into(),
                name: name.into(),
                description: None,
                version: None,
                category: None,
                tempo: None,
                bypass_dedup: false,
                movements: Vec::new(),
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.sequence.description = Some(description.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.sequence.version = Some(version.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.sequence.category = Some(category.into());
        self
    }

    pub fn tempo(mut self, tempo: u32) -> Self {
        self.sequence.tempo = Some(tempo);
        self
    }

    pub fn bypass_dedup(mut self, bypass: bool) -> Self {
        self.sequence.bypass_dedup = bypass;
        self
    }

    pub fn movement(
        mut self,
        name: impl Into<String>,
        build: impl FnOnce(MovementBuilder) -> MovementBuilder,
    ) -> Self {
        let movement = build(MovementBuilder::new(name)).movement;
        self.sequence.movements.push(movement);
        self
    }

    pub fn build(self) -> Sequence {
        self.sequence
    }
}

/// Builds one movement inside [`SequenceBuilder::movement`].
#[derive(Debug, Clone)]
pub struct MovementBuilder {
    movement: Movement,
}

impl MovementBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            movement: Movement {
                name: name.into(),
                description: None,
                beats: Vec::new(),
            },
        }
    }

    /// Add an immediate, continue-on-error beat.
    pub fn beat(self, number: u32, event: impl Into<String>, dynamics: Dynamics) -> Self {
        self.beat_with(Beat::new(number, event, dynamics))
    }

    /// Add a fully specified beat.
    pub fn beat_with(mut self, beat: Beat) -> Self {
        self.movement.beats.push(beat);
        self
    }
}

impl Beat {
    pub fn new(number: u32, event: impl Into<String>, dynamics: Dynamics) -> Self {
        Self {
            beat: number,
            event: event.into(),
            dynamics: Some(dynamics),
            timing: Timing::Immediate,
            error_handling: ErrorHandling::Continue,
            data: None,
        }
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn error_handling(mut self, policy: ErrorHandling) -> Self {
        self.error_handling = policy;
        self
    }

    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_beat_sequence() -> Sequence {
        Sequence::builder("canvas-drop", "Canvas.drop-symphony")
            .description("drops a component")
            .version("1.0.0")
            .movement("place", |m| {
                m.beat(1, "canvas:drop", Dynamics::MezzoForte)
                    .beat(2, "canvas:render", Dynamics::Forte)
            })
            .build()
    }

    #[test]
    fn test_valid_sequence_has_no_errors_or_warnings() {
        let report = two_beat_sequence().validate();
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn test_missing_recommended_fields_are_warnings() {
        let mut seq = two_beat_sequence();
        seq.description = None;
        seq.version = None;

        let report = seq.validate();
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn test_missing_dynamics_is_an_error() {
        let mut seq = two_beat_sequence();
        seq.movements[0].beats[1].dynamics = None;

        let report = seq.validate();
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("dynamics is missing"));
    }

    #[test]
    fn test_structural_errors_are_collected() {
        let seq = Sequence {
            id: "".into(),
            name: "".into(),
            description: None,
            version: None,
            category: None,
            tempo: None,
            bypass_dedup: false,
            movements: vec![Movement {
                name: "empty".into(),
                description: None,
                beats: vec![],
            }],
        };

        let report = seq.validate();
        assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
    }

    #[test]
    fn test_duplicate_beat_numbers_rejected_and_disorder_warned() {
        let seq = Sequence::builder("s", "S.seq")
            .description("d")
            .version("1")
            .movement("m", |m| {
                m.beat(2, "a", Dynamics::Piano)
                    .beat(1, "b", Dynamics::Piano)
                    .beat(1, "c", Dynamics::Piano)
            })
            .build();

        let report = seq.validate();
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("duplicate beat number 1"));
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_reserved_event_prefix_rejected() {
        let seq = Sequence::builder("s", "S.seq")
            .movement("m", |m| m.beat(1, "conductor:beat-started", Dynamics::Piano))
            .build();

        let report = seq.validate();
        assert!(report.errors.iter().any(|e| e.contains("reserved")));
    }

    #[test]
    fn test_timing_delays_follow_beat_duration() {
        let beat = beat_duration(120);
        assert_eq!(beat, Duration::from_millis(500));
        assert_eq!(Timing::Immediate.delay(beat), Duration::ZERO);
        assert_eq!(Timing::AfterBeat.delay(beat), Duration::from_millis(500));
        assert_eq!(Timing::Delayed.delay(beat), Duration::from_millis(750));
        assert_eq!(Timing::Synchronized.delay(beat), Duration::from_millis(250));
    }

    #[test]
    fn test_missing_tempo_uses_default() {
        let seq = two_beat_sequence();
        assert_eq!(seq.beat_duration(), Duration::from_millis(500));

        let fast = Sequence::builder("s", "S").tempo(600).build();
        assert_eq!(fast.beat_duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_deserializes_wire_shape() {
        let seq: Sequence = serde_json::from_value(json!({
            "id": "canvas-drop",
            "name": "Canvas.drop-symphony",
            "tempo": 90,
            "bypassDedup": true,
            "movements": [{
                "name": "place",
                "beats": [
                    { "beat": 1, "event": "canvas:drop", "dynamics": "mezzo-forte" },
                    { "beat": 2, "event": "canvas:render", "dynamics": "ff",
                      "timing": "after-beat", "errorHandling": "abort-sequence",
                      "data": { "layer": 3 } }
                ]
            }]
        }))
        .unwrap();

        assert!(seq.bypass_dedup);
        let beats = &seq.movements[0].beats;
        assert_eq!(beats[0].dynamics, Some(Dynamics::MezzoForte));
        assert_eq!(beats[0].timing, Timing::Immediate);
        assert_eq!(beats[0].error_handling, ErrorHandling::Continue);
        assert_eq!(beats[1].timing, Timing::AfterBeat);
        assert_eq!(beats[1].error_handling, ErrorHandling::AbortSequence);
        assert_eq!(beats[1].data.as_ref().unwrap()["layer"], 3);
    }

    #[test]
    fn test_unknown_dynamics_fails_to_parse() {
        assert!("loud".parse::<Dynamics>().is_err());
        assert_eq!("forte".parse::<Dynamics>(), Ok(Dynamics::Forte));
    }
}
