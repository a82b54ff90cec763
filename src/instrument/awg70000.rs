//! Tektronix AWG70000 series driver
//!
//! Thin SCPI layer over an [`Adapter`]: mass memory transfers, the waveform
//! and sequence lists, output configuration and playback control. Every
//! message is validated, including its size against the single-write limit,
//! before anything is written.
//!
//! ```toml
//! [transfer]
//! opc_timeout_ms = 60000
//! play_timeout_ms = 10000
//! poll_interval_ms = 100
//! sequence_path = 'C:\Users\OEM\Documents\Sequences'
//! ```

use std::fmt;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::scpi::{self, block_message, check_capacity};
use super::Instrument;
use crate::adapters::Adapter;
use crate::config::TransferSettings;
use crate::error::{AppResult, AwgError};
use crate::sequence::{
    AssetKind, Repeat, SequenceDescriptor, StepTarget, TriggerInput, MAX_REPEAT_COUNT,
};
use crate::waveform::{pack, MarkerLayout, PackedWaveform, RangePolicy, WaveformRecord};

/// Largest peak-to-peak output amplitude in AWG mode (V).
pub const MAX_AMPLITUDE: f64 = 0.5;

/// Upper bound on entries drained from the error queue in one call.
const MAX_ERROR_QUEUE: usize = 64;

/// Sequencer run state reported by `AWGControl:RSTATe?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Not playing.
    Stopped,
    /// Armed, waiting for a trigger.
    WaitingForTrigger,
    /// Playing.
    Running,
}

impl RunState {
    fn from_code(code: i64) -> AppResult<Self> {
        match code {
            0 => Ok(RunState::Stopped),
            1 => Ok(RunState::WaitingForTrigger),
            2 => Ok(RunState::Running),
            other => Err(AwgError::Instrument(format!(
                "unknown run state {other} from AWGControl:RSTATe?"
            ))),
        }
    }

    /// True when the sequencer has left the stopped state.
    pub fn is_playing(self) -> bool {
        !matches!(self, RunState::Stopped)
    }
}

/// Instrument operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwgMode {
    /// Arbitrary waveform generator.
    Awg,
    /// Function generator.
    Fgen,
}

impl AwgMode {
    fn scpi_name(self) -> &'static str {
        match self {
            AwgMode::Awg => "AWG",
            AwgMode::Fgen => "FGEN",
        }
    }
}

/// Trigger input targeted by a forced trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerChannel {
    /// Trigger A.
    A,
    /// Trigger B.
    B,
    /// Both inputs.
    All,
}

/// Destination of a step's event jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpDestination {
    /// Following step.
    Next,
    /// First step.
    First,
    /// Last step.
    Last,
    /// End of the sequence, output at 0 V.
    End,
    /// 1-indexed step.
    Step(u32),
}

impl fmt::Display for JumpDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JumpDestination::Next => f.write_str("NEXT"),
            JumpDestination::First => f.write_str("FIRST"),
            JumpDestination::Last => f.write_str("LAST"),
            JumpDestination::End => f.write_str("END"),
            JumpDestination::Step(n) => write!(f, "{n}"),
        }
    }
}

/// Deadlines of the driver's poll loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverTimeouts {
    /// Limit for `*OPC?` polling.
    pub opc: Duration,
    /// Limit for waiting on the run state after `AWGControl:RUN`.
    pub play: Duration,
    /// Pause between polls.
    pub poll_interval: Duration,
}

impl Default for DriverTimeouts {
    fn default() -> Self {
        Self::from(&TransferSettings::default())
    }
}

impl From<&TransferSettings> for DriverTimeouts {
    fn from(settings: &TransferSettings) -> Self {
        Self {
            opc: Duration::from_millis(settings.opc_timeout_ms),
            play: Duration::from_millis(settings.play_timeout_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        }
    }
}

/// Result of sending one waveform to the waveform list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferredWaveform {
    /// Name in the waveform list.
    pub name: String,
    /// Marker bits the waveform needs (0, 1 or 2).
    pub markers_used: u8,
}

/// SCPI mnemonic used by `EJINPUT`.
fn event_input_name(input: TriggerInput) -> &'static str {
    match input {
        TriggerInput::None => "OFF",
        TriggerInput::TrigA => "ATRIGGER",
        TriggerInput::TrigB => "BTRIGGER",
        TriggerInput::Internal => "ITRIGGER",
    }
}

fn check_channel(channel: usize) -> AppResult<usize> {
    if channel == 0 {
        return Err(AwgError::Validation(
            "channels are numbered from 1".into(),
        ));
    }
    Ok(channel)
}

fn data_prefix(name: &str, sample_count: usize) -> String {
    format!("WLISt:WAVeform:DATA \"{name}\",0,{sample_count},")
}

fn marker_prefix(name: &str, len: usize) -> String {
    format!("WLISt:WAVeform:MARKER:DATA \"{name}\",0,{len},")
}

/// Builds the single `SLISt` command stack that recreates `descriptor` in the
/// sequence list. Options at their instrument default are omitted.
///
/// # Errors
///
/// [`AwgError::Validation`] if a step references a sub-sequence, which the
/// sequence list cannot receive this way.
pub fn sequence_command_stack(descriptor: &SequenceDescriptor) -> AppResult<String> {
    let name = &descriptor.name;
    let mut stack = format!(
        ":SLIS:SEQ:NEW \"{name}\", {}, {};",
        descriptor.steps.len(),
        descriptor.track_count
    );
    for step in &descriptor.steps {
        let n = step.number;
        match step.repeat {
            Repeat::Infinite => {
                stack.push_str(&format!(":SLIS:SEQ:STEP{n}:RCO \"{name}\",Infinite;"));
            }
            Repeat::Count(count) => {
                stack.push_str(&format!(":SLIS:SEQ:STEP{n}:RCO \"{name}\",{count};"));
            }
            Repeat::Once => {}
        }
        if step.wait != TriggerInput::None {
            stack.push_str(&format!(
                ":SLIS:SEQ:STEP{n}:WINPUT \"{name}\",{};",
                step.wait.scpi_name()
            ));
        }
        if step.event_jump.input != TriggerInput::None {
            stack.push_str(&format!(
                ":SLIS:SEQ:STEP{n}:EJIN \"{name}\",{};",
                step.event_jump.input.scpi_name()
            ));
            let target = match step.event_jump.target {
                StepTarget::Next => "Next".to_string(),
                StepTarget::Step(s) => s.to_string(),
            };
            stack.push_str(&format!(":SLIS:SEQ:STEP{n}:EJUMP \"{name}\",{target};"));
        }
        if let StepTarget::Step(goto) = step.go_to {
            stack.push_str(&format!(":SLIS:SEQ:STEP{n}:GOTO \"{name}\",{goto};"));
        }
        for asset in &step.assets {
            match asset.kind {
                AssetKind::Waveform { track } => stack.push_str(&format!(
                    ":SLIS:SEQ:STEP{n}:TASS{track}:WAV \"{name}\",\"{}\";",
                    asset.name
                )),
                AssetKind::Sequence => {
                    return Err(AwgError::Validation(format!(
                        "step {n} of '{name}' references sub-sequence '{}', \
                         sub-sequences cannot be sent to the sequence list",
                        asset.name
                    )));
                }
            }
        }
    }
    Ok(stack)
}

/// Checks that the data and marker messages for `packed` fit in one write.
///
/// # Errors
///
/// [`AwgError::Capacity`].
pub fn check_waveform_capacity(name: &str, packed: &PackedWaveform) -> AppResult<()> {
    check_capacity(&data_prefix(name, packed.sample_count), packed.samples.len())?;
    if let Some(markers) = &packed.markers {
        check_capacity(&marker_prefix(name, markers.len()), markers.len())?;
    }
    Ok(())
}

/// Tektronix AWG70000 arbitrary waveform generator.
pub struct Awg70000 {
    inst: Instrument,
    timeouts: DriverTimeouts,
    sequence_path: String,
    waveform_path: String,
}

impl Awg70000 {
    /// Driver with default paths and timeouts.
    pub fn new(adapter: Box<dyn Adapter>) -> Self {
        Self::from_settings(adapter, &TransferSettings::default())
    }

    /// Driver configured from the `[transfer]` settings.
    pub fn from_settings(adapter: Box<dyn Adapter>, settings: &TransferSettings) -> Self {
        Self {
            inst: Instrument::new("Tektronix AWG70000", adapter),
            timeouts: DriverTimeouts::from(settings),
            sequence_path: settings.sequence_path.clone(),
            waveform_path: settings.waveform_path.clone(),
        }
    }

    /// Replaces the poll deadlines.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: DriverTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Underlying instrument connection.
    pub fn instrument(&mut self) -> &mut Instrument {
        &mut self.inst
    }

    /// Poll deadlines in use.
    pub fn timeouts(&self) -> DriverTimeouts {
        self.timeouts
    }

    /// Default directory for `.seqx` files on the instrument disk.
    pub fn sequence_path(&self) -> &str {
        &self.sequence_path
    }

    /// Default directory for `.wfmx` files on the instrument disk.
    pub fn waveform_path(&self) -> &str {
        &self.waveform_path
    }

    // ---------------------------------------------------------------- system

    /// `*IDN?`
    pub async fn id(&mut self) -> AppResult<String> {
        self.inst.id().await
    }

    /// Current directory of the programmatic file interface.
    pub async fn current_directory(&mut self) -> AppResult<String> {
        Ok(scpi::unquote(&self.inst.ask("MMEMory:CDIRectory?").await?))
    }

    /// Changes the current directory. A leading drive `c:` is dropped.
    pub async fn set_current_directory(&mut self, directory: &str) -> AppResult<()> {
        let directory = match directory.get(..2) {
            Some(drive) if directory.len() > 2 && drive.eq_ignore_ascii_case("c:") => &directory[2..],
            _ => directory,
        };
        self.inst
            .write(&format!("MMEMory:CDIRectory \"{directory}\""))
            .await?;
        Ok(())
    }

    /// Operating mode.
    pub async fn mode(&mut self) -> AppResult<AwgMode> {
        let response = self.inst.ask("INSTrument:MODE?").await?;
        match scpi::unquote(&response).to_ascii_lowercase().as_str() {
            "awg" => Ok(AwgMode::Awg),
            "fgen" => Ok(AwgMode::Fgen),
            other => Err(AwgError::Instrument(format!(
                "unknown mode '{other}' from INSTrument:MODE?"
            ))),
        }
    }

    /// Switches between AWG and function generator mode.
    pub async fn set_mode(&mut self, mode: AwgMode) -> AppResult<()> {
        self.inst
            .write(&format!("INSTrument:MODE {}", mode.scpi_name()))
            .await?;
        Ok(())
    }

    /// Clock sample rate (S/s).
    pub async fn clock_sample_rate(&mut self) -> AppResult<f64> {
        let response = self.inst.ask("CLOCk:SRATe?").await?;
        scpi::parse_f64("CLOCk:SRATe?", &response)
    }

    /// Sets the clock sample rate (S/s).
    pub async fn set_clock_sample_rate(&mut self, sample_rate: f64) -> AppResult<()> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(AwgError::Validation(format!(
                "sample rate must be positive, got {sample_rate}"
            )));
        }
        self.inst
            .write(&format!("CLOCk:SRATe {sample_rate}"))
            .await?;
        Ok(())
    }

    /// Sequencer run state.
    pub async fn run_state(&mut self) -> AppResult<RunState> {
        let response = self.inst.ask("AWGControl:RSTATe?").await?;
        RunState::from_code(scpi::parse_int("AWGControl:RSTATe?", &response)?)
    }

    /// Polls `*OPC?` until it reports 1. Failed polls are retried until the
    /// OPC deadline.
    ///
    /// # Errors
    ///
    /// [`AwgError::Timeout`].
    pub async fn wait_for_operation_to_complete(&mut self) -> AppResult<()> {
        let deadline = Instant::now() + self.timeouts.opc;
        loop {
            match self.inst.ask("*OPC?").await {
                Ok(response) if scpi::parse_int("*OPC?", &response).ok() == Some(1) => {
                    return Ok(());
                }
                Ok(response) => debug!(response = %response, "operation pending"),
                Err(e) => debug!(error = %e, "*OPC? poll failed"),
            }
            if Instant::now() >= deadline {
                return Err(AwgError::Timeout {
                    operation: "operation complete".into(),
                    timeout: self.timeouts.opc,
                });
            }
            sleep(self.timeouts.poll_interval).await;
        }
    }

    /// First entry of the error queue.
    pub async fn error(&mut self) -> AppResult<(i64, String)> {
        let response = self.inst.ask("SYST:ERR?").await?;
        scpi::parse_error(&response)
    }

    /// Drains the error queue, logging every entry, and returns what it found.
    pub async fn check_errors(&mut self) -> AppResult<Vec<(i64, String)>> {
        let mut errors = Vec::new();
        for _ in 0..MAX_ERROR_QUEUE {
            let (code, message) = self.error().await?;
            if code == 0 {
                return Ok(errors);
            }
            warn!(instrument = %self.inst.name(), code, message = %message, "instrument reported error");
            errors.push((code, message));
        }
        warn!(
            instrument = %self.inst.name(),
            "error queue not empty after {MAX_ERROR_QUEUE} reads"
        );
        Ok(errors)
    }

    /// Resets the instrument and empties the waveform and sequence lists.
    pub async fn reset(&mut self) -> AppResult<()> {
        self.inst.reset().await?;
        self.inst.clear().await?;
        sleep(Duration::from_millis(500)).await;
        self.sequence_list_clear().await?;
        self.waveform_list_clear().await
    }

    /// Stops playback and disables both outputs.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        self.stop().await?;
        self.set_output(false, 1).await?;
        self.set_output(false, 2).await?;
        info!(instrument = %self.inst.name(), "Shutting down");
        Ok(())
    }

    // ----------------------------------------------------------- mass memory

    /// Writes `contents` to `filename` on the instrument disk, in `path` or the
    /// default sequence directory.
    ///
    /// With `overwrite`, an existing file is deleted first with the error
    /// dialog suppressed.
    ///
    /// # Errors
    ///
    /// [`AwgError::Capacity`] before anything is written if the message is too
    /// large; transport and OPC timeout errors.
    pub async fn send_binary_file(
        &mut self,
        contents: &[u8],
        filename: &str,
        path: Option<&str>,
        overwrite: bool,
    ) -> AppResult<()> {
        let msg = block_message(&format!("MMEMory:DATA \"{filename}\","), contents)?;
        let path = path.unwrap_or(&self.sequence_path).to_string();
        self.set_current_directory(&path).await?;

        if overwrite {
            self.inst.write("SYSTem:ERRor:DIALog 0").await?;
            self.inst
                .write(&format!("MMEMory:DELete \"{filename}\""))
                .await?;
            // -256 when there was nothing to delete.
            if let Err(e) = self.inst.ask("SYSTem:ERRor:CODE?").await {
                debug!(error = %e, "ignoring error code query failure");
            }
            self.inst.write("SYSTem:ERRor:DIALog 1").await?;
        }

        self.inst.write_raw(&msg).await?;
        self.wait_for_operation_to_complete().await?;
        info!(filename, path = %path, bytes = contents.len(), "File sent to instrument");
        Ok(())
    }

    /// Opens a `.wfmx` file from the instrument disk into the waveform list.
    pub async fn waveform_load_from_disk(&mut self, filepath: &str) -> AppResult<()> {
        self.inst
            .write(&format!("MMEMory:OPEN \"{}\"", scpi::escape_path(filepath)))
            .await?;
        self.wait_for_operation_to_complete().await
    }

    /// Opens every sequence of a `.seqx` file from the instrument disk.
    pub async fn sequence_load_from_disk(&mut self, filepath: &str) -> AppResult<()> {
        self.inst
            .write(&format!(
                "MMEMory:OPEN:SASSet:SEQuence \"{}\"",
                scpi::escape_path(filepath)
            ))
            .await?;
        self.wait_for_operation_to_complete().await
    }

    /// Sends a `.seqx` archive to the default sequence directory and loads it.
    pub async fn load_seqx(&mut self, seqx: &[u8], filename: &str) -> AppResult<()> {
        self.send_binary_file(seqx, filename, None, true).await?;
        let filepath = format!("{}\\{filename}", self.sequence_path);
        self.sequence_load_from_disk(&filepath).await
    }

    // --------------------------------------------------------- waveform list

    /// Names in the waveform list.
    pub async fn waveform_list(&mut self) -> AppResult<Vec<String>> {
        Ok(scpi::parse_list(&self.inst.ask("WLISt:LIST?").await?))
    }

    /// Empties the waveform list.
    pub async fn waveform_list_clear(&mut self) -> AppResult<()> {
        self.inst.write("WLISt:WAVeform:DELete ALL").await?;
        Ok(())
    }

    /// Creates an empty waveform of `size` points.
    pub async fn new_waveform(&mut self, name: &str, size: usize) -> AppResult<()> {
        self.inst
            .write(&format!("WLIST:WAVeform:NEW \"{name}\", {size}"))
            .await?;
        Ok(())
    }

    async fn require_waveform(&mut self, name: &str) -> AppResult<()> {
        if self.waveform_list().await?.iter().any(|w| w == name) {
            Ok(())
        } else {
            Err(AwgError::Validation(format!(
                "no waveform named '{name}' in the waveform list"
            )))
        }
    }

    /// Assigns a listed waveform to a channel.
    pub async fn waveform_set_to_channel(&mut self, name: &str, channel: usize) -> AppResult<()> {
        let channel = check_channel(channel)?;
        self.require_waveform(name).await?;
        self.inst
            .write(&format!("SOURce{channel}:CASSet:WAVeform \"{name}\""))
            .await?;
        Ok(())
    }

    /// Writes packed little-endian `f32` samples into an existing waveform.
    ///
    /// # Errors
    ///
    /// [`AwgError::Validation`] if `samples` is not a whole number of floats,
    /// [`AwgError::Capacity`] before writing.
    pub async fn import_waveform_data(&mut self, name: &str, samples: &[u8]) -> AppResult<()> {
        if samples.len() % 4 != 0 {
            return Err(AwgError::Validation(format!(
                "waveform data for '{name}' is {} bytes, not a multiple of 4",
                samples.len()
            )));
        }
        let msg = block_message(&data_prefix(name, samples.len() / 4), samples)?;
        self.inst.write_raw(&msg).await?;
        Ok(())
    }

    /// Writes marker bytes into a listed waveform.
    pub async fn set_waveform_marker_data(&mut self, name: &str, markers: &[u8]) -> AppResult<()> {
        let msg = block_message(&marker_prefix(name, markers.len()), markers)?;
        self.require_waveform(name).await?;
        self.inst.write_raw(&msg).await?;
        Ok(())
    }

    /// Packs `record` with markers on bits 6 and 7 and sends it.
    ///
    /// Out-of-range samples are rejected rather than clipped.
    ///
    /// # Errors
    ///
    /// Packing errors ([`AwgError::OutOfRange`] among them) and
    /// [`AwgError::Capacity`], all before the first write.
    pub async fn send_waveform(
        &mut self,
        name: &str,
        record: &WaveformRecord,
    ) -> AppResult<TransferredWaveform> {
        let packed = pack(record, MarkerLayout::Transfer, RangePolicy::Reject)?;
        check_waveform_capacity(name, &packed)?;
        self.send_packed_waveform(name, &packed, record.markers_used())
            .await
    }

    /// Creates `name` and fills it with an already packed waveform.
    pub async fn send_packed_waveform(
        &mut self,
        name: &str,
        packed: &PackedWaveform,
        markers_used: u8,
    ) -> AppResult<TransferredWaveform> {
        self.new_waveform(name, packed.sample_count).await?;
        self.wait_for_operation_to_complete().await?;
        self.import_waveform_data(name, &packed.samples).await?;
        if let Some(markers) = &packed.markers {
            self.set_waveform_marker_data(name, markers).await?;
        }
        info!(
            waveform = name,
            samples = packed.sample_count,
            markers_used,
            "Waveform transferred"
        );
        Ok(TransferredWaveform {
            name: name.to_string(),
            markers_used,
        })
    }

    // --------------------------------------------------------- sequence list

    /// Names in the sequence list.
    pub async fn sequence_list(&mut self) -> AppResult<Vec<String>> {
        let response = self.inst.ask("SLISt:SIZE?").await?;
        let size = scpi::parse_int("SLISt:SIZE?", &response)?;
        let mut names = Vec::new();
        for n in 1..=size {
            let name = self.inst.ask(&format!("SLISt:NAME? {n}")).await?;
            names.push(scpi::unquote(&name));
        }
        Ok(names)
    }

    /// Deletes one sequence.
    pub async fn sequence_list_delete(&mut self, seqname: &str) -> AppResult<()> {
        self.inst
            .write(&format!("SLISt:SEQuence:DELete \"{seqname}\""))
            .await?;
        Ok(())
    }

    /// Empties the sequence list.
    pub async fn sequence_list_clear(&mut self) -> AppResult<()> {
        self.inst.write("SLISt:SEQuence:DELete ALL").await?;
        Ok(())
    }

    /// Creates a sequence with `steps` steps and `tracks` tracks.
    pub async fn sequence_list_new(
        &mut self,
        seqname: &str,
        steps: usize,
        tracks: usize,
    ) -> AppResult<()> {
        if steps == 0 || tracks == 0 {
            return Err(AwgError::Validation(format!(
                "sequence '{seqname}' needs at least one step and one track"
            )));
        }
        self.inst
            .write(&format!(
                "SLIST:SEQUENCE:NEW \"{seqname}\", {steps}, {tracks}"
            ))
            .await?;
        Ok(())
    }

    /// Inserts `count` steps at `location`.
    pub async fn sequence_step_add(
        &mut self,
        seqname: &str,
        location: usize,
        count: usize,
    ) -> AppResult<()> {
        self.inst
            .write(&format!(
                "SLIST:SEQUENCE:STEP:ADD \"{seqname}\", {location}, {count}"
            ))
            .await?;
        Ok(())
    }

    /// Assigns a waveform to one step and track.
    pub async fn sequence_set_step_waveform(
        &mut self,
        seqname: &str,
        step: usize,
        waveform: &str,
        track: usize,
    ) -> AppResult<()> {
        self.inst
            .write(&format!(
                "SLIST:SEQUENCE:STEP{step}:TASSET{track}:WAVEFORM \"{seqname}\", \"{waveform}\""
            ))
            .await?;
        Ok(())
    }

    /// Sets a step's event jump input and, unless disabled, its destination.
    pub async fn sequence_set_step_jump(
        &mut self,
        seqname: &str,
        step: usize,
        input: TriggerInput,
        destination: JumpDestination,
    ) -> AppResult<()> {
        if destination == JumpDestination::Step(0) {
            return Err(AwgError::Validation("jump steps are numbered from 1".into()));
        }
        self.inst
            .write(&format!(
                "SLIST:SEQUENCE:STEP{step}:EJINPUT \"{seqname}\", {}",
                event_input_name(input)
            ))
            .await?;
        if input != TriggerInput::None {
            self.inst
                .write(&format!(
                    "SLIST:SEQUENCE:STEP{step}:EJUMP \"{seqname}\", {destination}"
                ))
                .await?;
        }
        Ok(())
    }

    /// Sets a step's repeat count.
    ///
    /// # Errors
    ///
    /// [`AwgError::Validation`] for an explicit count outside
    /// 1..=[`MAX_REPEAT_COUNT`].
    pub async fn sequence_set_step_rcount(
        &mut self,
        seqname: &str,
        step: usize,
        repeat: Repeat,
    ) -> AppResult<()> {
        let count = match repeat {
            Repeat::Infinite => "Infinite".to_string(),
            Repeat::Once => "1".to_string(),
            Repeat::Count(n) if (1..=MAX_REPEAT_COUNT).contains(&n) => n.to_string(),
            Repeat::Count(n) => {
                return Err(AwgError::Validation(format!(
                    "repeat count {n} outside 1..={MAX_REPEAT_COUNT}"
                )));
            }
        };
        self.inst
            .write(&format!(
                "SLISt:SEQuence:STEP{step}:RCOunt \"{seqname}\", {count}"
            ))
            .await?;
        Ok(())
    }

    /// Reads a step's repeat count.
    pub async fn sequence_step_rcount(&mut self, seqname: &str, step: usize) -> AppResult<Repeat> {
        let query = format!("SLISt:SEQuence:STEP{step}:RCOunt? \"{seqname}\"");
        let response = scpi::unquote(&self.inst.ask(&query).await?);
        if response.to_ascii_lowercase().starts_with("inf") {
            return Ok(Repeat::Infinite);
        }
        match scpi::parse_int(&query, &response)? {
            1 => Ok(Repeat::Once),
            n => u32::try_from(n)
                .ok()
                .filter(|&n| n > 1)
                .map(Repeat::Count)
                .ok_or_else(|| {
                    AwgError::Instrument(format!("unexpected reply to {query}: '{response}'"))
                }),
        }
    }

    /// Assigns a track of a listed sequence to a channel.
    pub async fn sequence_set_to_channel(
        &mut self,
        seqname: &str,
        track: usize,
        channel: usize,
    ) -> AppResult<()> {
        let channel = check_channel(channel)?;
        self.inst
            .write(&format!(
                "SOURCE{channel}:CASSet:SEQuence \"{seqname}\", {track}"
            ))
            .await?;
        Ok(())
    }

    /// Recommended peak-to-peak amplitude stored with a sequence.
    pub async fn sequence_list_amplitude(&mut self, seqname: &str) -> AppResult<f64> {
        let query = format!("SLIST:SEQUENCE:AMPLITUDE? \"{seqname}\"");
        let response = self.inst.ask(&query).await?;
        scpi::parse_f64(&query, &response)
    }

    /// Stores a recommended peak-to-peak amplitude with a sequence.
    pub async fn sequence_set_list_amplitude(&mut self, seqname: &str, amplitude: f64) -> AppResult<()> {
        self.inst
            .write(&format!(
                "SLIST:SEQUENCE:AMPLITUDE \"{seqname}\", {amplitude}"
            ))
            .await?;
        Ok(())
    }

    /// Creates `descriptor` in the sequence list with one command stack.
    ///
    /// # Errors
    ///
    /// [`AwgError::Validation`] for sub-sequence assets and
    /// [`AwgError::Capacity`] for an oversized stack, both before writing.
    pub async fn send_sequence(&mut self, descriptor: &SequenceDescriptor) -> AppResult<()> {
        let stack = sequence_command_stack(descriptor)?;
        if stack.len() > scpi::MAX_WRITE_LEN {
            return Err(AwgError::Capacity {
                size: stack.len(),
                limit: scpi::MAX_WRITE_LEN,
            });
        }
        debug!(sequence = %descriptor.name, len = stack.len(), "sending sequence command stack");
        self.inst.write(&stack).await?;
        info!(
            sequence = %descriptor.name,
            steps = descriptor.steps.len(),
            tracks = descriptor.track_count,
            "Sequence transferred"
        );
        Ok(())
    }

    // ---------------------------------------------------------------- output

    /// Sets the DAC resolution: 10 bits leave no marker bits, 9 bits one, 8
    /// bits two.
    pub async fn set_output_resolution(&mut self, bits: u8, channel: usize) -> AppResult<()> {
        let channel = check_channel(channel)?;
        if !(8..=10).contains(&bits) {
            return Err(AwgError::Validation(format!(
                "DAC resolution must be 8, 9 or 10 bits, got {bits}"
            )));
        }
        self.inst
            .write(&format!("SOURce{channel}:DAC:RESolution {bits}"))
            .await?;
        Ok(())
    }

    /// DAC resolution in bits.
    pub async fn output_resolution(&mut self, channel: usize) -> AppResult<u8> {
        let query = format!("SOURce{}:DAC:RESolution?", check_channel(channel)?);
        let response = self.inst.ask(&query).await?;
        let bits = scpi::parse_int(&query, &response)?;
        u8::try_from(bits)
            .map_err(|_| AwgError::Instrument(format!("unexpected reply to {query}: '{response}'")))
    }

    /// Peak-to-peak amplitude (V).
    pub async fn amplitude(&mut self, channel: usize) -> AppResult<f64> {
        let query = format!("SOUR{}:VOLT:AMPL?", check_channel(channel)?);
        let response = self.inst.ask(&query).await?;
        scpi::parse_f64(&query, &response)
    }

    /// Sets the peak-to-peak amplitude (V), at most [`MAX_AMPLITUDE`].
    pub async fn set_amplitude(&mut self, amplitude: f64, channel: usize) -> AppResult<()> {
        let channel = check_channel(channel)?;
        if !amplitude.is_finite() || amplitude <= 0.0 || amplitude > MAX_AMPLITUDE {
            return Err(AwgError::Validation(format!(
                "amplitude {amplitude} V outside (0, {MAX_AMPLITUDE}] V"
            )));
        }
        self.inst
            .write(&format!("SOUR{channel}:VOLT:AMPL {amplitude}"))
            .await?;
        Ok(())
    }

    /// Offset voltage (V).
    pub async fn offset(&mut self, channel: usize) -> AppResult<f64> {
        let query = format!("SOUR{}:VOLT:LEV:IMM:OFFS?", check_channel(channel)?);
        let response = self.inst.ask(&query).await?;
        scpi::parse_f64(&query, &response)
    }

    /// Sets the offset voltage (V).
    pub async fn set_offset(&mut self, offset: f64, channel: usize) -> AppResult<()> {
        let channel = check_channel(channel)?;
        if !offset.is_finite() {
            return Err(AwgError::Validation(format!("offset {offset} is not finite")));
        }
        self.inst
            .write(&format!("SOUR{channel}:VOLT:LEV:IMM:OFFS {offset}"))
            .await?;
        Ok(())
    }

    /// Enables or disables an output.
    pub async fn set_output(&mut self, on: bool, channel: usize) -> AppResult<()> {
        let channel = check_channel(channel)?;
        self.inst
            .write(&format!("OUTP{channel}:STAT {}", scpi::on_off(on)))
            .await?;
        Ok(())
    }

    /// Enables an output.
    pub async fn enable(&mut self, channel: usize) -> AppResult<()> {
        self.set_output(true, channel).await
    }

    /// Disables an output.
    pub async fn disable(&mut self, channel: usize) -> AppResult<()> {
        self.set_output(false, channel).await
    }

    /// True if the output is enabled.
    pub async fn output(&mut self, channel: usize) -> AppResult<bool> {
        let query = format!("OUTP{}:STAT?", check_channel(channel)?);
        let response = self.inst.ask(&query).await?;
        Ok(scpi::parse_int(&query, &response)? > 0)
    }

    // -------------------------------------------------------------- playback

    /// Starts playback. With `wait_for_running`, polls the run state until
    /// the sequencer runs or waits for a trigger.
    ///
    /// # Errors
    ///
    /// [`AwgError::Timeout`] after the play deadline; a corrupt waveform or
    /// sequence is the usual cause.
    pub async fn play(&mut self, wait_for_running: bool) -> AppResult<()> {
        self.inst.write("AWGControl:RUN").await?;
        if !wait_for_running {
            return Ok(());
        }
        let deadline = Instant::now() + self.timeouts.play;
        loop {
            sleep(self.timeouts.poll_interval).await;
            if self.run_state().await?.is_playing() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AwgError::Timeout {
                    operation: "instrument to play".into(),
                    timeout: self.timeouts.play,
                });
            }
        }
    }

    /// Stops playback.
    pub async fn stop(&mut self) -> AppResult<()> {
        self.inst.write("AWGControl:STOP").await?;
        Ok(())
    }

    /// Forces a trigger event.
    pub async fn trigger(&mut self, channel: TriggerChannel) -> AppResult<()> {
        let command = match channel {
            TriggerChannel::A => "TRIGGER:IMMEDIATE ATRIGGER",
            TriggerChannel::B => "TRIGGER:IMMEDIATE BTRIGGER",
            TriggerChannel::All => "TRIGGER:IMMEDIATE ATRIGGER; TRIGGER:IMMEDIATE BTRIGGER",
        };
        self.inst.write(command).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockAdapter, MockCall};
    use crate::sequence::{Asset, SequencingOptions, StepTable};

    fn fast() -> DriverTimeouts {
        DriverTimeouts {
            opc: Duration::from_millis(200),
            play: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn driver(mock: &MockAdapter) -> Awg70000 {
        Awg70000::new(Box::new(mock.clone())).with_timeouts(fast())
    }

    fn two_step_descriptor() -> SequenceDescriptor {
        let table: StepTable = [
            SequencingOptions {
                nrep: 0,
                twait: 1,
                ..Default::default()
            },
            SequencingOptions {
                nrep: 3,
                jump_input: 2,
                jump_target: 1,
                goto: 1,
                ..Default::default()
            },
        ]
        .into_iter()
        .collect();
        let assets = vec![
            vec![Asset::waveform("wfm_1_1_1", 1), Asset::waveform("wfm_1_1_2", 2)],
            vec![Asset::waveform("wfm_2_1_1", 1), Asset::waveform("wfm_2_1_2", 2)],
        ];
        SequenceDescriptor::from_table("seq", 2, &table, assets).unwrap()
    }

    #[test]
    fn test_command_stack() {
        let stack = sequence_command_stack(&two_step_descriptor()).unwrap();
        assert_eq!(
            stack,
            ":SLIS:SEQ:NEW \"seq\", 2, 2;\
             :SLIS:SEQ:STEP1:RCO \"seq\",Infinite;\
             :SLIS:SEQ:STEP1:WINPUT \"seq\",ATR;\
             :SLIS:SEQ:STEP1:TASS1:WAV \"seq\",\"wfm_1_1_1\";\
             :SLIS:SEQ:STEP1:TASS2:WAV \"seq\",\"wfm_1_1_2\";\
             :SLIS:SEQ:STEP2:RCO \"seq\",3;\
             :SLIS:SEQ:STEP2:EJIN \"seq\",BTR;\
             :SLIS:SEQ:STEP2:EJUMP \"seq\",1;\
             :SLIS:SEQ:STEP2:GOTO \"seq\",1;\
             :SLIS:SEQ:STEP2:TASS1:WAV \"seq\",\"wfm_2_1_1\";\
             :SLIS:SEQ:STEP2:TASS2:WAV \"seq\",\"wfm_2_1_2\";"
        );
    }

    #[test]
    fn test_command_stack_rejects_subsequence() {
        let table: StepTable = [SequencingOptions::default()].into_iter().collect();
        let descriptor =
            SequenceDescriptor::from_table("main", 1, &table, vec![vec![Asset::sequence("sub")]])
                .unwrap();
        let err = sequence_command_stack(&descriptor).unwrap_err();
        assert!(err.to_string().contains("sub-sequence"));
    }

    #[tokio::test]
    async fn test_send_binary_file_overwrite() {
        let mock = MockAdapter::new();
        let mut awg = driver(&mock);
        awg.send_binary_file(b"PK", "a.seqx", None, true)
            .await
            .unwrap();
        assert_eq!(
            mock.commands(),
            [
                "MMEMory:CDIRectory \"\\Users\\OEM\\Documents\\Sequences\"",
                "SYSTem:ERRor:DIALog 0",
                "MMEMory:DELete \"a.seqx\"",
                "SYSTem:ERRor:CODE?",
                "SYSTem:ERRor:DIALog 1",
                "*OPC?",
            ]
        );
        assert_eq!(mock.raw_writes(), [b"MMEMory:DATA \"a.seqx\",#12PK".to_vec()]);
    }

    #[tokio::test]
    async fn test_load_seqx_opens_escaped_path() {
        let mock = MockAdapter::new();
        let mut awg = driver(&mock);
        awg.load_seqx(b"PK", "b.seqx").await.unwrap();
        assert!(mock.commands().contains(
            &"MMEMory:OPEN:SASSet:SEQuence \"C:\\\\Users\\\\OEM\\\\Documents\\\\Sequences\\\\b.seqx\""
                .to_string()
        ));
    }

    #[tokio::test]
    async fn test_opc_poll_retries_then_times_out() {
        let mock = MockAdapter::new().respond_sequence("*OPC?", ["0", "junk", "1"]);
        let mut awg = driver(&mock);
        awg.wait_for_operation_to_complete().await.unwrap();
        assert_eq!(mock.commands().len(), 3);

        let stuck = MockAdapter::new().respond("*OPC?", "0");
        let mut awg = driver(&stuck);
        let err = awg.wait_for_operation_to_complete().await.unwrap_err();
        assert!(matches!(err, AwgError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_play_waits_for_running_state() {
        let mock = MockAdapter::new().respond_sequence("AWGControl:RSTATe?", ["0", "0", "1"]);
        let mut awg = driver(&mock);
        awg.play(true).await.unwrap();
        assert_eq!(mock.commands()[0], "AWGControl:RUN");

        let stopped = MockAdapter::new().respond("AWGControl:RSTATe?", "0");
        let mut awg = driver(&stopped);
        assert!(matches!(
            awg.play(true).await,
            Err(AwgError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_waveform_with_markers() {
        let mock = MockAdapter::new().respond("WLISt:LIST?", "\"w1\"");
        let mut awg = driver(&mock);
        let n = 2400;
        let mut m2 = vec![false; n];
        m2[10] = true;
        let record = WaveformRecord::new(vec![0.1; n], 0.5)
            .with_marker(1, vec![true; n])
            .with_marker(2, m2);
        let sent = awg.send_waveform("w1", &record).await.unwrap();
        assert_eq!(sent.markers_used, 2);

        let raw = mock.raw_writes();
        assert_eq!(raw.len(), 2);
        assert!(raw[0].starts_with(b"WLISt:WAVeform:DATA \"w1\",0,2400,#49600"));
        let markers = &raw[1][raw[1].len() - n..];
        assert_eq!(markers[0], 0b0100_0000);
        assert_eq!(markers[10], 0b1100_0000);
        assert_eq!(mock.commands()[0], "WLIST:WAVeform:NEW \"w1\", 2400");
    }

    #[tokio::test]
    async fn test_send_waveform_rejects_out_of_range_before_writing() {
        let mock = MockAdapter::new();
        let mut awg = driver(&mock);
        let record = WaveformRecord::new(vec![0.3; 2400], 0.5);
        let err = awg.send_waveform("w", &record).await.unwrap_err();
        assert!(matches!(err, AwgError::OutOfRange { .. }));
        assert!(mock.is_untouched());
    }

    #[tokio::test]
    async fn test_marker_data_requires_listed_waveform() {
        let mock = MockAdapter::new().respond("WLISt:LIST?", "\"other\"");
        let mut awg = driver(&mock);
        assert!(awg.set_waveform_marker_data("w", &[0; 4]).await.is_err());
        assert!(mock.raw_writes().is_empty());
    }

    #[tokio::test]
    async fn test_sequence_list_and_rcount() {
        let mock = MockAdapter::new()
            .respond("SLISt:SIZE?", "2")
            .respond_sequence("SLISt:NAME?", ["\"a\"", "\"b\""])
            .respond("SLISt:SEQuence:STEP1:RCOunt?", "INFINITE");
        let mut awg = driver(&mock);
        assert_eq!(awg.sequence_list().await.unwrap(), ["a", "b"]);
        assert_eq!(awg.sequence_step_rcount("a", 1).await.unwrap(), Repeat::Infinite);

        awg.sequence_set_step_rcount("a", 1, Repeat::Count(5)).await.unwrap();
        assert!(awg
            .sequence_set_step_rcount("a", 1, Repeat::Count(MAX_REPEAT_COUNT + 1))
            .await
            .is_err());
        awg.sequence_set_step_jump("a", 2, TriggerInput::TrigA, JumpDestination::First)
            .await
            .unwrap();
        awg.sequence_set_step_jump("a", 3, TriggerInput::None, JumpDestination::Next)
            .await
            .unwrap();
        let commands = mock.commands();
        assert!(commands.contains(&"SLISt:SEQuence:STEP1:RCOunt \"a\", 5".to_string()));
        assert!(commands.contains(&"SLIST:SEQUENCE:STEP2:EJUMP \"a\", FIRST".to_string()));
        assert!(commands.contains(&"SLIST:SEQUENCE:STEP3:EJINPUT \"a\", OFF".to_string()));
        assert!(!commands.iter().any(|c| c.starts_with("SLIST:SEQUENCE:STEP3:EJUMP")));
    }

    #[tokio::test]
    async fn test_output_configuration() {
        let mock = MockAdapter::new()
            .respond("SOURce1:DAC:RESolution?", "9")
            .respond("SOUR1:VOLT:AMPL?", "0.25")
            .respond("OUTP1:STAT?", "1");
        let mut awg = driver(&mock);
        awg.set_output_resolution(8, 1).await.unwrap();
        assert!(awg.set_output_resolution(11, 1).await.is_err());
        awg.set_amplitude(0.5, 2).await.unwrap();
        assert!(awg.set_amplitude(0.6, 1).await.is_err());
        awg.set_offset(-0.1, 1).await.unwrap();
        assert_eq!(awg.output_resolution(1).await.unwrap(), 9);
        assert_eq!(awg.amplitude(1).await.unwrap(), 0.25);
        assert!(awg.output(1).await.unwrap());
        awg.trigger(TriggerChannel::All).await.unwrap();

        let commands = mock.commands();
        assert!(commands.contains(&"SOURce1:DAC:RESolution 8".to_string()));
        assert!(commands.contains(&"SOUR2:VOLT:AMPL 0.5".to_string()));
        assert!(commands.contains(&"SOUR1:VOLT:LEV:IMM:OFFS -0.1".to_string()));
        assert!(commands.contains(
            &"TRIGGER:IMMEDIATE ATRIGGER; TRIGGER:IMMEDIATE BTRIGGER".to_string()
        ));
    }

    #[tokio::test]
    async fn test_check_errors_drains_queue() {
        let mock = MockAdapter::new().respond_sequence(
            "SYST:ERR?",
            ["-256,\"File name not found\"", "-222,\"Data out of range\"", "0,\"No error\""],
        );
        let mut awg = driver(&mock);
        let errors = awg.check_errors().await.unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].0, -256);
    }

    #[tokio::test]
    async fn test_shutdown_and_directory() {
        let mock = MockAdapter::new().respond("MMEMory:CDIRectory?", "\"\\Users\\OEM\"");
        let mut awg = driver(&mock);
        assert_eq!(awg.current_directory().await.unwrap(), "\\Users\\OEM");
        assert_eq!(awg.mode().await.unwrap(), AwgMode::Awg);
        awg.shutdown().await.unwrap();
        let calls = mock.calls();
        assert!(calls.contains(&MockCall::Write("AWGControl:STOP".into())));
        assert!(calls.contains(&MockCall::Write("OUTP1:STAT OFF".into())));
        assert!(calls.contains(&MockCall::Write("OUTP2:STAT OFF".into())));
    }
}
