//! Sequence step model.
//!
//! Sequences arrive as a [`StepTable`] of parallel per-step option codes (the
//! shape used by the `.sml` builder and by forged-sequence sequencing options)
//! and are resolved into a typed [`SequenceDescriptor`] once, with every code
//! validated up front. Both the `.sml` writer and the instrument command stack
//! are driven from the descriptor.

pub mod forged;
pub mod importer;
pub mod seqx;
pub mod setup;
pub mod sml;

use crate::error::{AppResult, AwgError};

pub use forged::{
    ChannelData, ChannelMapping, ElementData, ForgedPosition, ForgedSequence, ForgedStep,
    SubElement,
};
pub use importer::{import_sequence, make_seqx_from_forged, ImportTarget, SequenceImporter};
pub use seqx::{assemble, make_seqx_file, Compression};

/// Largest finite repeat count accepted by the sequencer (2^20).
pub const MAX_REPEAT_COUNT: u32 = 1 << 20;

/// Trigger source for waits and event jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerInput {
    /// No trigger.
    #[default]
    None,
    /// Trigger input A.
    TrigA,
    /// Trigger input B.
    TrigB,
    /// Internal trigger timer.
    Internal,
}

impl TriggerInput {
    /// Decodes the numeric code used by step tables (0..=3).
    ///
    /// # Errors
    ///
    /// [`AwgError::Validation`] for codes above 3.
    pub fn from_code(code: u8) -> AppResult<Self> {
        match code {
            0 => Ok(TriggerInput::None),
            1 => Ok(TriggerInput::TrigA),
            2 => Ok(TriggerInput::TrigB),
            3 => Ok(TriggerInput::Internal),
            other => Err(AwgError::Validation(format!(
                "trigger input code {other} outside 0..=3"
            ))),
        }
    }

    /// Name used in `.sml` files.
    pub fn sml_name(self) -> &'static str {
        match self {
            TriggerInput::None => "None",
            TriggerInput::TrigA => "TrigA",
            TriggerInput::TrigB => "TrigB",
            TriggerInput::Internal => "Internal",
        }
    }

    /// Mnemonic used in `SLISt` commands.
    pub fn scpi_name(self) -> &'static str {
        match self {
            TriggerInput::None => "OFF",
            TriggerInput::TrigA => "ATR",
            TriggerInput::TrigB => "BTR",
            TriggerInput::Internal => "ITR",
        }
    }
}

/// How often a step plays before moving on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Until stopped or jumped away from.
    Infinite,
    /// Exactly once.
    Once,
    /// A fixed count in 2..=2^20.
    Count(u32),
}

impl Repeat {
    /// Decodes an `nrep` value, where 0 means infinite.
    ///
    /// # Errors
    ///
    /// [`AwgError::Validation`] above [`MAX_REPEAT_COUNT`].
    pub fn from_nrep(nrep: u32) -> AppResult<Self> {
        match nrep {
            0 => Ok(Repeat::Infinite),
            1 => Ok(Repeat::Once),
            n if n <= MAX_REPEAT_COUNT => Ok(Repeat::Count(n)),
            n => Err(AwgError::Validation(format!(
                "repeat count {n} exceeds the maximum of {MAX_REPEAT_COUNT}"
            ))),
        }
    }

    /// `Repeat` element text.
    pub fn sml_kind(self) -> &'static str {
        match self {
            Repeat::Infinite => "Infinite",
            Repeat::Once => "Once",
            Repeat::Count(_) => "RepeatCount",
        }
    }

    /// `RepeatCount` element value (1 unless an explicit count is set).
    pub fn sml_count(self) -> u32 {
        match self {
            Repeat::Count(n) => n,
            Repeat::Infinite | Repeat::Once => 1,
        }
    }
}

/// Destination of a jump or go-to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepTarget {
    /// The following step.
    #[default]
    Next,
    /// A 1-indexed step.
    Step(u32),
}

impl StepTarget {
    /// Decodes a target code (0 = next) for a sequence of `step_count` steps.
    ///
    /// # Errors
    ///
    /// [`AwgError::Validation`] if the code points past the last step.
    pub fn from_code(code: u32, step_count: usize) -> AppResult<Self> {
        if code == 0 {
            return Ok(StepTarget::Next);
        }
        if code as usize > step_count {
            return Err(AwgError::Validation(format!(
                "step target {code} outside 0..={step_count}"
            )));
        }
        Ok(StepTarget::Step(code))
    }

    /// `EventJumpTo`/`GoTo` text.
    pub fn sml_kind(self) -> &'static str {
        match self {
            StepTarget::Next => "Next",
            StepTarget::Step(_) => "StepIndex",
        }
    }

    /// `EventJumpToStep`/`GoToStep` value.
    pub fn sml_step(self) -> u32 {
        match self {
            StepTarget::Next => 1,
            StepTarget::Step(n) => n,
        }
    }
}

/// Event-driven branch of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventJump {
    /// Trigger that causes the jump; `None` disables it.
    pub input: TriggerInput,
    /// Where to jump. Ignored when `input` is `None`.
    pub target: StepTarget,
}

/// What an asset refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    /// A waveform played on the given 1-indexed track.
    Waveform {
        /// Track (physical channel) number.
        track: usize,
    },
    /// A nested sequence.
    Sequence,
}

/// One entry of a step's asset list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// Name of the waveform or sequence.
    pub name: String,
    /// Kind of entry.
    pub kind: AssetKind,
}

impl Asset {
    /// Waveform asset on a track.
    pub fn waveform(name: impl Into<String>, track: usize) -> Self {
        Self {
            name: name.into(),
            kind: AssetKind::Waveform { track },
        }
    }

    /// Sub-sequence asset.
    pub fn sequence(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AssetKind::Sequence,
        }
    }

    /// `AssetType` text.
    pub fn sml_type(&self) -> &'static str {
        match self.kind {
            AssetKind::Waveform { .. } => "Waveform",
            AssetKind::Sequence => "Sequence",
        }
    }
}

/// Sequencing options of one step, as numeric codes.
///
/// Defaults: no trigger wait, one repetition, no event jump, fall through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencingOptions {
    /// Trigger wait code (0..=3).
    pub twait: u8,
    /// Repeat count, 0 for infinite.
    pub nrep: u32,
    /// Event jump input code (0..=3).
    pub jump_input: u8,
    /// Event jump target, 0 for next.
    pub jump_target: u32,
    /// Go-to target, 0 for next.
    pub goto: u32,
}

impl Default for SequencingOptions {
    fn default() -> Self {
        Self {
            twait: 0,
            nrep: 1,
            jump_input: 0,
            jump_target: 0,
            goto: 0,
        }
    }
}

/// Parallel per-step option arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepTable {
    /// Trigger wait codes.
    pub trig_waits: Vec<u8>,
    /// Repeat counts (0 = infinite).
    pub nreps: Vec<u32>,
    /// Event jump input codes.
    pub event_jumps: Vec<u8>,
    /// Event jump targets (0 = next).
    pub event_jump_to: Vec<u32>,
    /// Go-to targets (0 = next).
    pub go_to: Vec<u32>,
}

impl StepTable {
    /// Appends one step.
    pub fn push(&mut self, options: SequencingOptions) {
        self.trig_waits.push(options.twait);
        self.nreps.push(options.nrep);
        self.event_jumps.push(options.jump_input);
        self.event_jump_to.push(options.jump_target);
        self.go_to.push(options.goto);
    }

    /// Checks that all five arrays share one non-zero length and returns it.
    ///
    /// # Errors
    ///
    /// [`AwgError::Validation`] naming every array length on mismatch.
    pub fn step_count(&self) -> AppResult<usize> {
        let lengths = [
            self.trig_waits.len(),
            self.nreps.len(),
            self.event_jumps.len(),
            self.event_jump_to.len(),
            self.go_to.len(),
        ];
        let n = lengths[0];
        if lengths.iter().any(|&len| len != n) {
            return Err(AwgError::Validation(format!(
                "all step option arrays must have the same length, got trig_waits={}, nreps={}, \
                 event_jumps={}, event_jump_to={}, go_to={}",
                lengths[0], lengths[1], lengths[2], lengths[3], lengths[4]
            )));
        }
        if n == 0 {
            return Err(AwgError::Validation(
                "received empty sequence option arrays".into(),
            ));
        }
        Ok(n)
    }
}

impl FromIterator<SequencingOptions> for StepTable {
    fn from_iter<I: IntoIterator<Item = SequencingOptions>>(iter: I) -> Self {
        let mut table = StepTable::default();
        for options in iter {
            table.push(options);
        }
        table
    }
}

/// One resolved step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceStep {
    /// 1-indexed step number.
    pub number: u32,
    /// Repetition mode.
    pub repeat: Repeat,
    /// Trigger waited on before playback.
    pub wait: TriggerInput,
    /// Event jump.
    pub event_jump: EventJump,
    /// Step played after the repetitions complete.
    pub go_to: StepTarget,
    /// Assets played at this step.
    pub assets: Vec<Asset>,
}

/// A complete, validated sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceDescriptor {
    /// Sequence name, unique within its archive.
    pub name: String,
    /// Number of tracks (channels).
    pub track_count: usize,
    /// Steps in play order.
    pub steps: Vec<SequenceStep>,
}

impl SequenceDescriptor {
    /// Resolves a step table and per-step asset lists.
    ///
    /// # Errors
    ///
    /// [`AwgError::Validation`] for mismatched array lengths, an asset list
    /// count different from the step count, unknown codes, out-of-range
    /// targets, an empty name, zero tracks or waveform tracks above
    /// `track_count`.
    pub fn from_table(
        name: &str,
        track_count: usize,
        table: &StepTable,
        assets: Vec<Vec<Asset>>,
    ) -> AppResult<Self> {
        let n = table.step_count()?;
        if assets.len() != n {
            return Err(AwgError::Validation(format!(
                "mismatch between number of asset lists ({}) and number of sequencing steps ({n})",
                assets.len()
            )));
        }
        if name.trim().is_empty() {
            return Err(AwgError::Validation("sequence name must not be empty".into()));
        }
        if track_count == 0 {
            return Err(AwgError::Validation(
                "a sequence needs at least one track".into(),
            ));
        }

        let mut steps = Vec::with_capacity(n);
        for (i, step_assets) in assets.into_iter().enumerate() {
            let number = u32::try_from(i + 1)
                .map_err(|_| AwgError::Validation(format!("step count {n} too large")))?;
            if let Some(asset) = step_assets.iter().find(|a| {
                matches!(a.kind, AssetKind::Waveform { track } if track == 0 || track > track_count)
            }) {
                return Err(AwgError::Validation(format!(
                    "step {number}: asset '{}' is assigned to a track outside 1..={track_count}",
                    asset.name
                )));
            }
            let input = TriggerInput::from_code(table.event_jumps[i])
                .map_err(|e| step_error(number, "event_jumps", e))?;
            let target = StepTarget::from_code(table.event_jump_to[i], n)
                .map_err(|e| step_error(number, "event_jump_to", e))?;
            // A disabled jump always serializes as Next.
            let target = match input {
                TriggerInput::None => StepTarget::Next,
                _ => target,
            };
            steps.push(SequenceStep {
                number,
                repeat: Repeat::from_nrep(table.nreps[i])
                    .map_err(|e| step_error(number, "nreps", e))?,
                wait: TriggerInput::from_code(table.trig_waits[i])
                    .map_err(|e| step_error(number, "trig_waits", e))?,
                event_jump: EventJump { input, target },
                go_to: StepTarget::from_code(table.go_to[i], n)
                    .map_err(|e| step_error(number, "go_to", e))?,
                assets: step_assets,
            });
        }
        Ok(Self {
            name: name.to_string(),
            track_count,
            steps,
        })
    }

    /// Names of every asset referenced by any step, in step order.
    pub fn asset_names(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .flat_map(|step| step.assets.iter().map(|a| a.name.as_str()))
    }
}

fn step_error(step: u32, field: &str, err: AwgError) -> AwgError {
    match err {
        AwgError::Validation(msg) => AwgError::Validation(format!("step {step}, {field}: {msg}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: usize) -> StepTable {
        (0..n).map(|_| SequencingOptions::default()).collect()
    }

    fn assets(n: usize) -> Vec<Vec<Asset>> {
        (1..=n).map(|i| vec![Asset::waveform(format!("w{i}"), 1)]).collect()
    }

    #[test]
    fn test_repeat_encoding() {
        assert_eq!(Repeat::from_nrep(0).unwrap(), Repeat::Infinite);
        assert_eq!(Repeat::from_nrep(0).unwrap().sml_count(), 1);
        assert_eq!(Repeat::from_nrep(1).unwrap(), Repeat::Once);
        assert_eq!(Repeat::from_nrep(7).unwrap().sml_kind(), "RepeatCount");
        assert_eq!(Repeat::from_nrep(7).unwrap().sml_count(), 7);
        assert!(Repeat::from_nrep(MAX_REPEAT_COUNT).is_ok());
        assert!(Repeat::from_nrep(MAX_REPEAT_COUNT + 1).is_err());
    }

    #[test]
    fn test_trigger_tables() {
        assert_eq!(TriggerInput::from_code(3).unwrap().sml_name(), "Internal");
        assert_eq!(TriggerInput::from_code(3).unwrap().scpi_name(), "ITR");
        assert_eq!(TriggerInput::from_code(0).unwrap().scpi_name(), "OFF");
        assert!(TriggerInput::from_code(4).is_err());
    }

    #[test]
    fn test_unequal_arrays_rejected() {
        let mut t = table(3);
        t.go_to.pop();
        let err = t.step_count().unwrap_err();
        assert!(err.to_string().contains("go_to=2"));
        assert!(StepTable::default().step_count().is_err());
    }

    #[test]
    fn test_asset_count_must_match() {
        let err = SequenceDescriptor::from_table("s", 1, &table(2), assets(3)).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_targets_bounded_by_step_count() {
        let mut t = table(2);
        t.go_to[0] = 2;
        assert!(SequenceDescriptor::from_table("s", 1, &t, assets(2)).is_ok());
        t.go_to[0] = 3;
        let err = SequenceDescriptor::from_table("s", 1, &t, assets(2)).unwrap_err();
        assert!(err.to_string().contains("step 1, go_to"));
    }

    #[test]
    fn test_disabled_event_jump_falls_through() {
        let mut t = table(2);
        t.event_jump_to[1] = 1;
        let d = SequenceDescriptor::from_table("s", 1, &t, assets(2)).unwrap();
        assert_eq!(d.steps[1].event_jump.target, StepTarget::Next);

        t.event_jumps[1] = 2;
        let d = SequenceDescriptor::from_table("s", 1, &t, assets(2)).unwrap();
        assert_eq!(
            d.steps[1].event_jump,
            EventJump {
                input: TriggerInput::TrigB,
                target: StepTarget::Step(1)
            }
        );
    }

    #[test]
    fn test_waveform_track_bounds() {
        let bad = vec![vec![Asset::waveform("w", 3)]];
        assert!(SequenceDescriptor::from_table("s", 2, &table(1), bad).is_err());
        let ok = vec![vec![Asset::sequence("sub")]];
        assert!(SequenceDescriptor::from_table("s", 2, &table(1), ok).is_ok());
    }
}
