//! Push 2 control surface driver.
//!
//! Input bytes are decoded into [`Gesture`]s by [`gesture::decode`]. Output is
//! LED state: callers hand over the complete desired state and only slots
//! that differ from the last write go out.
use std::cell::RefCell;
use std::rc::Rc;

use midir::{MidiInputConnection, MidiOutputConnection};
use tracing::{debug, info};

use crate::midi::{self, Inbound};
use crate::sequencer::clock::EngineClock;
use crate::sequencer::NUM_CHANNELS;

pub mod gesture;
pub mod leds;

pub use gesture::{decode, Direction, Encoder, Function, Gesture};
pub use leds::{Color, LedBank, LedEntry};

/// Port name fragment the surface is discovered by.
pub const DEFAULT_PORT_PATTERN: &str = "Ableton Push 2 Live Port";
/// Shared by every port the device exposes (Live and User).
pub const DEVICE_FAMILY: &str = "Ableton Push";

pub const MATRIX_SIZE: usize = 64;
/// Function LED slots are addressed by CC number.
pub const FUNCTION_SLOTS: usize = 128;

/// Buttons that are always lit once installed.
const STATIC_BUTTONS: [u8; 2] = [gesture::CC_OCTAVE_UP, gesture::CC_OCTAVE_DOWN];

/// Raw byte sink for the surface output port.
pub trait RawOutput {
    fn send(&mut self, bytes: &[u8]);
}

impl RawOutput for MidiOutputConnection {
    fn send(&mut self, bytes: &[u8]) {
        if let Err(e) = MidiOutputConnection::send(self, bytes) {
            debug!("surface send failed: {e}");
        }
    }
}

/// Keeps every message written, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct CaptureOutput(Rc<RefCell<Vec<Vec<u8>>>>);

impl CaptureOutput {
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.0.borrow().clone()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

impl RawOutput for CaptureOutput {
    fn send(&mut self, bytes: &[u8]) {
        self.0.borrow_mut().push(bytes.to_vec());
    }
}

pub struct SurfaceProtocol {
    output: Option<Box<dyn RawOutput>>,
    _input: Option<MidiInputConnection<()>>,
    port: Option<String>,
    matrix: LedBank,
    functions: LedBank,
}

impl SurfaceProtocol {
    /// A driver writing to `output`; `None` gives an uninstalled driver.
    pub fn new(output: Option<Box<dyn RawOutput>>) -> Self {
        Self {
            output,
            _input: None,
            port: None,
            matrix: LedBank::new(MATRIX_SIZE),
            functions: LedBank::new(FUNCTION_SLOTS),
        }
    }

    /// Look for a surface whose input and output port names contain
    /// `pattern`. Input is forwarded to `inbound` with the port name as
    /// source. Without a match the driver is returned uninstalled.
    pub fn discover(
        pattern: &str,
        clock: EngineClock,
        inbound: crossbeam_channel::Sender<Inbound>,
    ) -> anyhow::Result<Self> {
        let inputs = midi::input_port_names()?;
        let outputs = midi::output_port_names()?;
        let (Some(input), Some(output)) = (
            midi::find_port(&inputs, pattern),
            midi::find_port(&outputs, pattern),
        ) else {
            info!(pattern, "no control surface found");
            return Ok(Self::new(None));
        };
        let input_name = inputs[input].clone();
        let connection = midi::connect_output(&outputs[output])?;
        let listener = midi::connect_input(&input_name, clock, inbound)?;
        info!(port = %input_name, "control surface connected");

        Ok(Self {
            output: Some(Box::new(connection)),
            _input: Some(listener),
            port: Some(input_name),
            matrix: LedBank::new(MATRIX_SIZE),
            functions: LedBank::new(FUNCTION_SLOTS),
        })
    }

    pub fn installed(&self) -> bool {
        self.output.is_some()
    }

    /// Whether an inbound message came from the surface.
    pub fn is_source(&self, source: &str) -> bool {
        self.port.as_deref() == Some(source)
    }

    /// Upload the palette and write every LED once.
    pub fn install(&mut self) {
        if !self.installed() {
            return;
        }
        for color in Color::ALL {
            self.send(&leds::palette_entry(color));
        }
        self.send(&leds::reapply_palette());

        self.matrix = LedBank::new(MATRIX_SIZE);
        for index in 0..MATRIX_SIZE {
            self.send(&leds::pad_message(index, LedEntry::OFF));
        }
        self.functions = LedBank::new(FUNCTION_SLOTS);
        for cc in STATIC_BUTTONS {
            let entry = LedEntry::solid(Color::White);
            self.functions.update(cc as usize, entry);
            self.send(&leds::button_message(cc, entry));
        }
        info!("control surface installed");
    }

    /// Last-sent pad state.
    pub fn matrix_entry(&self, index: usize) -> Option<LedEntry> {
        self.matrix.get(index)
    }

    pub fn function_entry(&self, cc: u8) -> Option<LedEntry> {
        self.functions.get(cc as usize)
    }

    pub fn set_matrix(&mut self, colors: &[Color; MATRIX_SIZE]) {
        let entries: Vec<LedEntry> = colors.iter().map(|c| LedEntry::solid(*c)).collect();
        self.set_matrix_entries(&entries);
    }

    pub fn set_matrix_entries(&mut self, entries: &[LedEntry]) {
        for (index, entry) in self.matrix.diff(entries) {
            self.send(&leds::pad_message(index, entry));
        }
    }

    /// `(cc, entry)` pairs; unchanged slots are skipped.
    pub fn set_function_leds(&mut self, leds: &[(u8, LedEntry)]) {
        for &(cc, entry) in leds {
            if self.functions.update(cc as usize, entry) {
                self.send(&leds::button_message(cc, entry));
            }
        }
    }

    pub fn set_channel(&mut self, channel: usize) {
        let leds: Vec<(u8, LedEntry)> = (0..NUM_CHANNELS)
            .map(|i| {
                let color = if i == channel { Color::White } else { Color::DimWhite };
                (gesture::CC_CHANNEL_SELECT + i as u8, LedEntry::solid(color))
            })
            .collect();
        self.set_function_leds(&leds);
    }

    pub fn set_playing(&mut self, playing: bool) {
        self.set_toggle(Function::Play, playing, Color::Green);
    }

    pub fn set_recording(&mut self, recording: bool) {
        self.set_toggle(Function::Record, recording, Color::Red);
    }

    pub fn set_accent(&mut self, accent: bool) {
        self.set_toggle(Function::Accent, accent, Color::White);
    }

    pub fn set_automate(&mut self, automate: bool) {
        self.set_toggle(Function::Automate, automate, Color::Orange);
    }

    /// Light a mode button while its mode is active.
    pub fn set_mode(&mut self, function: Function, active: bool) {
        self.set_toggle(function, active, Color::White);
    }

    fn set_toggle(&mut self, function: Function, on: bool, color: Color) {
        let color = if on { color } else { Color::DimWhite };
        self.set_function_leds(&[(function.cc(), LedEntry::solid(color))]);
    }

    /// Mute row: audible channels lit, muted ones dark.
    pub fn refresh_mutes(&mut self, muted: &[bool]) {
        let leds: Vec<(u8, LedEntry)> = muted
            .iter()
            .take(NUM_CHANNELS)
            .enumerate()
            .map(|(i, muted)| {
                let color = if *muted { Color::Off } else { Color::Yellow };
                (gesture::CC_MUTE_SOLO_PADS + i as u8, LedEntry::solid(color))
            })
            .collect();
        self.set_function_leds(&leds);
    }

    /// Solo row: the soloed channel lit.
    pub fn refresh_solo(&mut self, solo: Option<usize>) {
        let leds: Vec<(u8, LedEntry)> = (0..NUM_CHANNELS)
            .map(|i| {
                let color = if solo == Some(i) { Color::Blue } else { Color::DimWhite };
                (gesture::CC_MUTE_SOLO_PADS + i as u8, LedEntry::solid(color))
            })
            .collect();
        self.set_function_leds(&leds);
    }

    /// Mute/solo row dark.
    pub fn no_mutes(&mut self) {
        let leds: Vec<(u8, LedEntry)> = (0..NUM_CHANNELS)
            .map(|i| (gesture::CC_MUTE_SOLO_PADS + i as u8, LedEntry::OFF))
            .collect();
        self.set_function_leds(&leds);
    }

    fn send(&mut self, bytes: &[u8]) {
        if let Some(output) = self.output.as_mut() {
            output.send(bytes);
        }
    }
}
