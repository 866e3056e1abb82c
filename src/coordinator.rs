//! Glue between the surface, the pattern store and the engine.
//!
//! Pad layout of the 8x8 matrix (index 0 is top-left):
//! - 0..16: pattern pads (select, chain, copy, delete)
//! - 16..48: 32 steps starting at the selected pattern
//! - 48..64: note pads, upper row first (or drum pads)
use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::midi::{ChannelRoute, Inbound, MidiSink, Output, Routing};
use crate::scale::{Scale, ScaleMapper};
use crate::sequencer::playback::{Scheduler, SyncSource};
use crate::sequencer::{
    Param, PatternStore, TrackMode, NUM_CHANNELS, NUM_PATTERNS, STEPS_PER_PATTERN,
};
use crate::snapshot::{self, Settings, Snapshot};
use crate::surface::{
    decode, Color, Direction, Encoder, Function, Gesture, LedEntry, SurfaceProtocol, MATRIX_SIZE,
};

const STEP_PADS: usize = 16;
const NOTE_PADS: usize = 48;
const STEP_VIEW: usize = NOTE_PADS - STEP_PADS;
/// A drum step pad released sooner than this toggles the step.
const DRUM_TOGGLE_MS: f64 = 300.0;
const ACCENT_VELOCITY: u8 = 100;
const DEFAULT_OCTAVE: i32 = 3;

// pad colors
const PATTERN: Color = Color::Red;
const SELECTED_PATTERN: Color = Color::LightRed;
const STEP: Color = Color::Green;
const SELECTED_STEP: Color = Color::LightGreen;
const ACTIVE_STEP: Color = Color::White;
const NOTE: Color = Color::Blue;
const ROOT_NOTE: Color = Color::Cyan;
const SELECTED_NOTE: Color = Color::LightBlue;
const SELECTED_ROOT_NOTE: Color = Color::LightCyan;
const ACTIVE_NOTE: Color = Color::White;

/// Selection and mode state of the surface.
#[derive(Debug, Clone)]
struct View {
    channel: usize,
    pattern: [usize; NUM_CHANNELS],
    octave: [i32; NUM_CHANNELS],
    /// Step pad offset (0..32) whose notes are shown and toggled.
    selected_step: Option<usize>,
    /// Step pad offset held for parameter edits.
    edit_step: Option<usize>,
    selected_drum: usize,
    held_patterns: BTreeSet<usize>,
    select_mode: bool,
    delete_mode: bool,
    scale_mode: bool,
    mute_mode: bool,
    solo_mode: bool,
    copy_mode: bool,
    controller_mode: bool,
    accent: bool,
    copy_source: Option<(usize, usize)>,
    encoder_cache: [i32; 8],
    /// Press time and velocity of a drum step pad.
    drum_press: Option<(f64, u8)>,
}

impl Default for View {
    fn default() -> Self {
        Self {
            channel: 0,
            pattern: [0; NUM_CHANNELS],
            octave: [DEFAULT_OCTAVE; NUM_CHANNELS],
            selected_step: None,
            edit_step: None,
            selected_drum: 0,
            held_patterns: BTreeSet::new(),
            select_mode: false,
            delete_mode: false,
            scale_mode: false,
            mute_mode: false,
            solo_mode: false,
            copy_mode: false,
            controller_mode: false,
            accent: false,
            copy_source: None,
            encoder_cache: [0; 8],
            drum_press: None,
        }
    }
}

pub struct Coordinator {
    store: PatternStore,
    scheduler: Scheduler,
    scale: ScaleMapper,
    routing: Routing,
    surface: SurfaceProtocol,
    view: View,
    leds: [LedEntry; MATRIX_SIZE],
    song_path: Option<PathBuf>,
}

impl Coordinator {
    pub fn new(routing: Routing, surface: SurfaceProtocol, now: f64) -> Self {
        Self {
            store: PatternStore::new(),
            scheduler: Scheduler::new(now),
            scale: ScaleMapper::default(),
            routing,
            surface,
            view: View::default(),
            leds: [LedEntry::OFF; MATRIX_SIZE],
            song_path: None,
        }
    }

    pub fn store(&self) -> &PatternStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut PatternStore {
        &mut self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn scale(&self) -> &ScaleMapper {
        &self.scale
    }

    pub fn routing(&self) -> &Routing {
        &self.routing
    }

    pub fn surface(&self) -> &SurfaceProtocol {
        &self.surface
    }

    pub fn selected_channel(&self) -> usize {
        self.view.channel
    }

    pub fn selected_pattern(&self) -> usize {
        self.view.pattern[self.view.channel]
    }

    pub fn accent(&self) -> bool {
        self.view.accent
    }

    /// File written by the User button.
    pub fn set_song_path(&mut self, path: Option<PathBuf>) {
        self.song_path = path;
    }

    /// Replace a track's route; the track's pad layout follows the route's mode.
    pub fn set_route(&mut self, channel: usize, route: ChannelRoute) {
        self.store.track_mut(channel).mode = route.mode;
        self.routing.set_route(channel, route);
    }

    pub fn set_channel_mode(&mut self, channel: usize, mode: TrackMode) {
        let mut route = self.routing.route(channel).clone();
        route.mode = mode;
        self.set_route(channel, route);
    }

    /// Timing helper wake-up. Returns true when the playhead moved.
    pub fn on_wake<S: MidiSink>(&mut self, now: f64, sink: &mut S) -> bool {
        let mut out = Output::new(&self.routing, sink);
        self.scheduler.on_wake(now, &self.store, &mut out)
    }

    /// Any inbound MIDI: surface gestures, clock/transport, or notes from a
    /// track's input device.
    pub fn on_midi<S: MidiSink>(&mut self, msg: &Inbound, sink: &mut S) {
        if self.surface.is_source(&msg.source) {
            if let Some(gesture) = decode(&msg.bytes) {
                self.handle_gesture(gesture, msg.at, sink);
            }
            return;
        }
        let mut out = Output::new(&self.routing, sink);
        if self
            .scheduler
            .on_clock_message(&msg.bytes, &msg.source, msg.at, &self.store, &mut out)
        {
            return;
        }
        self.play_input(msg, sink);
    }

    /// Notes from the selected track's input are played through and recorded.
    fn play_input<S: MidiSink>(&mut self, msg: &Inbound, sink: &mut S) {
        let &[status, pitch, velocity] = msg.bytes.as_slice() else {
            return;
        };
        let channel = self.view.channel;
        if !self.routing.route(channel).accepts(&msg.source, &msg.bytes) {
            return;
        }
        let mut out = Output::new(&self.routing, sink);
        match status & 0xF0 {
            0x90 if velocity > 0 => {
                self.scheduler.preview_note(channel, pitch, velocity, msg.at, &mut out);
                self.scheduler.record_note_on(channel, pitch, velocity);
            }
            0x80 | 0x90 => {
                self.scheduler.preview_note_off(channel, pitch, msg.at, &mut out);
                self.scheduler.record_note_off(channel, pitch, &mut self.store);
            }
            _ => debug!(source = %msg.source, "input message ignored"),
        }
    }

    pub fn handle_gesture<S: MidiSink>(&mut self, gesture: Gesture, now: f64, sink: &mut S) {
        match gesture {
            Gesture::PadOn { index, velocity } => self.led_click(index, velocity, now, sink),
            Gesture::PadOff { index } => self.led_off(index, now, sink),
            Gesture::FunctionOn(function) => self.function_on(function, sink),
            Gesture::FunctionOff(function) => self.function_off(function),
            Gesture::Octave(direction) => self.octave(direction),
            Gesture::Encoder { encoder, delta } => self.encoder(encoder, delta, now, sink),
            Gesture::ChannelSelect(channel) => self.select_channel(channel),
            Gesture::MuteSoloPad(channel) => self.mute_solo(channel),
            Gesture::RepeatOn(index) => self.scheduler.set_repeat(self.view.channel, index),
            Gesture::RepeatOff(index) => self.scheduler.release_repeat(index),
            Gesture::Pressure(pressure) => self.scheduler.set_repeat_pressure(pressure),
            Gesture::PitchBend { lsb, msb } => {
                let mut out = Output::new(&self.routing, sink);
                self.scheduler
                    .send_pitch_bend(self.view.channel, lsb, msb, now, &mut out);
            }
        }
    }

    fn mode(&self) -> TrackMode {
        self.routing.route(self.view.channel).mode
    }

    fn step_for_pad(&self, offset: usize) -> usize {
        self.selected_pattern() * STEPS_PER_PATTERN + offset
    }

    /// Pitch of a note pad in notes mode.
    fn pad_pitch(&self, index: usize) -> Option<u8> {
        let row = 1 - (index - NOTE_PADS) / 8;
        self.scale.pitch_for(row, index % 8)
    }

    /// Pitch of a drum pad slot (0..16), or of the selected drum.
    fn drum_note(&self, slot: Option<usize>) -> Option<u8> {
        let slot = slot.unwrap_or(self.view.selected_drum);
        match self.mode() {
            TrackMode::Drums => {
                let pad = (1 - slot / 8) * 8 + slot % 8;
                u8::try_from(pad as i32 + self.scale.octave() * 12)
                    .ok()
                    .filter(|p| *p <= 127)
            }
            mode => mode.drum_map()?.get(slot).copied(),
        }
    }

    fn drum_slot(&self, pitch: u8) -> Option<usize> {
        match self.mode() {
            TrackMode::Drums => {
                let pad = usize::try_from(pitch as i32 - self.scale.octave() * 12)
                    .ok()
                    .filter(|p| *p < 16)?;
                Some((1 - pad / 8) * 8 + pad % 8)
            }
            mode => mode.drum_map()?.iter().position(|p| *p == pitch),
        }
    }

    fn drum_pad_count(&self) -> usize {
        match self.mode() {
            TrackMode::Drums => 16,
            mode => mode.drum_map().map_or(0, <[u8]>::len),
        }
    }

    /// Color last computed for a pad.
    pub fn led_state(&self, index: usize) -> Color {
        self.leds.get(index).map_or(Color::Off, |entry| entry.color)
    }

    /// A pad press, from the surface or the on-screen grid.
    pub fn led_click<S: MidiSink>(&mut self, index: usize, velocity: u8, now: f64, sink: &mut S) {
        let velocity = if self.view.accent { ACCENT_VELOCITY } else { velocity };
        match index {
            i if i < STEP_PADS => self.pattern_pad(i),
            i if i < NOTE_PADS => self.step_pad_on(i - STEP_PADS, velocity, now),
            i if i < MATRIX_SIZE => {
                if self.mode().is_drums() {
                    self.drum_pad_on(index - NOTE_PADS, velocity, now, sink);
                } else {
                    self.note_pad_on(index, velocity, now, sink);
                }
            }
            _ => {}
        }
    }

    pub fn led_off<S: MidiSink>(&mut self, index: usize, now: f64, sink: &mut S) {
        let channel = self.view.channel;
        match index {
            i if i < STEP_PADS => {
                self.view.held_patterns.remove(&i);
            }
            i if i < NOTE_PADS => {
                let offset = index - STEP_PADS;
                if self.view.edit_step == Some(offset) {
                    self.view.edit_step = None;
                }
                if self.mode().is_drums() {
                    self.drum_step_release(offset, now);
                } else if self.view.selected_step == Some(offset) {
                    self.view.selected_step = None;
                }
            }
            i if i < MATRIX_SIZE => {
                let pitch = if self.mode().is_drums() {
                    self.drum_note(Some(index - NOTE_PADS))
                } else {
                    self.pad_pitch(index)
                };
                let Some(pitch) = pitch else {
                    return;
                };
                let mut out = Output::new(&self.routing, sink);
                self.scheduler.preview_note_off(channel, pitch, now, &mut out);
                self.scheduler.record_note_off(channel, pitch, &mut self.store);
            }
            _ => {}
        }
    }

    fn pattern_pad(&mut self, pattern: usize) {
        let channel = self.view.channel;
        if self.view.select_mode {
            self.view.pattern[channel] = pattern;
        } else if self.view.copy_mode {
            match self.view.copy_source {
                None => self.view.copy_source = Some((channel, pattern)),
                Some(source) => self.store.copy_pattern(source, (channel, pattern)),
            }
        } else if self.view.delete_mode {
            self.store.delete_pattern(channel, pattern);
        } else {
            self.view.held_patterns.insert(pattern);
            let min = self.view.held_patterns.first().copied().unwrap_or(pattern);
            let max = self.view.held_patterns.last().copied().unwrap_or(pattern);
            self.store.set_pattern_chain(channel, min, max);
            self.view.pattern[channel] = min;
        }
    }

    fn step_pad_on(&mut self, offset: usize, velocity: u8, now: f64) {
        let channel = self.view.channel;
        let step = self.step_for_pad(offset);
        if self.view.edit_step.is_none() {
            self.view.edit_step = Some(offset);
        }
        if self.mode().is_drums() {
            if self.drum_note(None).is_none() {
                return;
            }
            if self.view.delete_mode {
                self.store.delete_step(channel, step);
            } else {
                self.view.drum_press = Some((now, velocity));
            }
        } else {
            if self.view.delete_mode {
                self.store.delete_step(channel, step);
            }
            self.view.selected_step = Some(offset);
        }
    }

    fn drum_step_release(&mut self, offset: usize, now: f64) {
        let Some((pressed, velocity)) = self.view.drum_press.take() else {
            return;
        };
        if now - pressed >= DRUM_TOGGLE_MS || self.scheduler.is_recording() {
            return;
        }
        if let Some(pitch) = self.drum_note(None) {
            let step = self.step_for_pad(offset);
            self.store.toggle_note(self.view.channel, step, pitch, velocity, 1);
        }
    }

    fn note_pad_on<S: MidiSink>(&mut self, index: usize, velocity: u8, now: f64, sink: &mut S) {
        let Some(pitch) = self.pad_pitch(index) else {
            return;
        };
        let channel = self.view.channel;
        if self.view.delete_mode {
            self.store.delete_note(channel, self.selected_pattern(), pitch);
            return;
        }
        self.scheduler.record_note_on(channel, pitch, velocity);
        let mut out = Output::new(&self.routing, sink);
        match self.view.selected_step {
            Some(offset) => {
                let step = self.selected_pattern() * STEPS_PER_PATTERN + offset;
                let added = !self.scheduler.is_recording()
                    && self.store.toggle_note(channel, step, pitch, velocity, 1);
                if added {
                    self.scheduler.preview_note(channel, pitch, velocity, now, &mut out);
                }
            }
            None => self.scheduler.preview_note(channel, pitch, velocity, now, &mut out),
        }
    }

    fn drum_pad_on<S: MidiSink>(&mut self, slot: usize, velocity: u8, now: f64, sink: &mut S) {
        self.view.selected_drum = slot;
        let channel = self.view.channel;
        let Some(pitch) = self.drum_note(Some(slot)) else {
            return;
        };
        if self.view.delete_mode {
            self.store.delete_note(channel, self.selected_pattern(), pitch);
        } else if !self.view.select_mode {
            let mut out = Output::new(&self.routing, sink);
            self.scheduler.preview_note(channel, pitch, velocity, now, &mut out);
            self.scheduler.record_note_on(channel, pitch, velocity);
        }
    }

    fn function_on<S: MidiSink>(&mut self, function: Function, sink: &mut S) {
        match function {
            Function::Select => self.view.select_mode = true,
            Function::Delete => self.view.delete_mode = true,
            Function::Scale => self.view.scale_mode = true,
            Function::Mute => self.view.mute_mode = true,
            Function::Solo => self.view.solo_mode = true,
            Function::Accent => self.view.accent = !self.view.accent,
            Function::Record => {
                self.scheduler.toggle_recording();
            }
            Function::Automate => self.view.controller_mode = !self.view.controller_mode,
            Function::Duplicate => {
                self.view.copy_mode = true;
                self.view.copy_source = None;
            }
            Function::User => self.save_song(),
            Function::Play => {
                let mut out = Output::new(&self.routing, sink);
                self.scheduler.play_pause(&mut out);
            }
        }
    }

    fn function_off(&mut self, function: Function) {
        match function {
            Function::Select => self.view.select_mode = false,
            Function::Delete => self.view.delete_mode = false,
            Function::Scale => self.view.scale_mode = false,
            Function::Mute => self.view.mute_mode = false,
            Function::Solo => self.view.solo_mode = false,
            Function::Duplicate => {
                self.view.copy_mode = false;
                self.view.copy_source = None;
            }
            _ => {}
        }
    }

    /// With a step held the step is transposed, otherwise the pads move.
    fn octave(&mut self, direction: Direction) {
        let delta = match direction {
            Direction::Up => 1,
            Direction::Down => -1,
        };
        match self.view.edit_step {
            Some(offset) => {
                let step = self.step_for_pad(offset);
                self.store.edit_octave(self.view.channel, step, delta);
            }
            None if delta > 0 => self.scale.octave_up(),
            None => self.scale.octave_down(),
        }
    }

    /// Accumulate encoder movement and report whole units of `divisor`.
    fn slow_increment(&mut self, encoder: usize, delta: i32, divisor: i32) -> i32 {
        let cache = &mut self.view.encoder_cache[encoder];
        let before = cache.div_euclid(divisor);
        *cache = cache.saturating_add(delta);
        cache.div_euclid(divisor) - before
    }

    fn encoder<S: MidiSink>(&mut self, encoder: Encoder, delta: i32, now: f64, sink: &mut S) {
        let slot = match encoder {
            Encoder::Tempo => {
                self.scheduler.change_tempo(delta as f64);
                return;
            }
            Encoder::Swing => {
                self.scheduler.change_swing(delta);
                return;
            }
            Encoder::Track(slot) if slot < 8 => slot,
            Encoder::Track(_) => return,
        };
        let channel = self.view.channel;

        if let Some(offset) = self.view.edit_step {
            let step = self.step_for_pad(offset);
            let sub_note = if self.mode().is_drums() { self.drum_note(None) } else { None };
            let (param, divisor) = match slot {
                0 => (Some(Param::Length), 8),
                1 => (Some(Param::Velocity), 2),
                2 => (Some(Param::Nudge), 8),
                3 => (Some(Param::Repeat), 32),
                4 => (None, 8),
                _ => return,
            };
            let amount = self.slow_increment(slot, delta, divisor);
            if amount == 0 {
                return;
            }
            match param {
                Some(param) => self.store.edit_param(channel, step, sub_note, param, amount),
                None => self.move_step(offset, sub_note, amount),
            }
        } else if self.view.scale_mode {
            let amount = self.slow_increment(slot, delta, 16);
            match slot {
                0 => self.scale.edit_root_note(amount),
                1 => self.scale.edit_scale(amount),
                _ => {}
            }
        } else if self.view.controller_mode {
            if let Some(value) = self.routing.bump_control(channel, slot, delta) {
                let mut out = Output::new(&self.routing, sink);
                self.scheduler.send_control(channel, slot, value, now, &mut out);
            }
        }
    }

    /// Move the held step's notes inside their pattern; the selection follows.
    fn move_step(&mut self, offset: usize, sub_note: Option<u8>, amount: i32) {
        let step = self.step_for_pad(offset);
        self.store.nudge_note(self.view.channel, step, sub_note, amount);
        let page = offset / STEPS_PER_PATTERN * STEPS_PER_PATTERN;
        let in_pattern = (offset % STEPS_PER_PATTERN) as i32 + amount;
        let moved = page + in_pattern.rem_euclid(STEPS_PER_PATTERN as i32) as usize;
        self.view.edit_step = Some(moved);
        if self.view.selected_step == Some(offset) {
            self.view.selected_step = Some(moved);
        }
    }

    /// Switch the edited track, keeping each track's octave.
    pub fn select_channel(&mut self, channel: usize) {
        if channel >= NUM_CHANNELS {
            return;
        }
        self.view.octave[self.view.channel] = self.scale.octave();
        self.view.channel = channel;
        self.scale.set_octave(self.view.octave[channel]);
        self.surface.set_channel(channel);
    }

    fn mute_solo(&mut self, channel: usize) {
        if channel >= NUM_CHANNELS {
            return;
        }
        if self.view.mute_mode {
            self.routing.toggle_mute(channel);
        } else if self.view.solo_mode {
            self.routing.toggle_solo(channel);
        }
    }

    /// Recompute every pad and button and push the differences to the surface.
    pub fn refresh_leds(&mut self) {
        let mut leds = [LedEntry::OFF; MATRIX_SIZE];
        let channel = self.view.channel;
        let pattern = self.selected_pattern();
        let track = self.store.track(channel);

        let last = (track.first_pattern + track.length.max(1)).min(NUM_PATTERNS);
        for led in &mut leds[track.first_pattern.min(NUM_PATTERNS)..last] {
            *led = LedEntry::solid(PATTERN);
        }
        leds[pattern] = LedEntry::solid(SELECTED_PATTERN);
        if let Some((source_channel, source)) = self.view.copy_source {
            if self.view.copy_mode && source_channel == channel {
                leds[source] = LedEntry::blinking(SELECTED_PATTERN);
            }
        }

        if self.mode().is_drums() {
            self.drum_leds(&mut leds);
        } else {
            self.note_leds(&mut leds);
        }
        self.leds = leds;
        self.surface.set_matrix_entries(&leds);

        self.surface.set_channel(channel);
        self.surface.set_accent(self.view.accent);
        self.surface.set_playing(self.scheduler.is_playing());
        self.surface.set_recording(self.scheduler.is_recording());
        self.surface.set_automate(self.view.controller_mode);
        self.surface.set_mode(Function::Select, self.view.select_mode);
        self.surface.set_mode(Function::Delete, self.view.delete_mode);
        self.surface.set_mode(Function::Duplicate, self.view.copy_mode);
        self.surface.set_mode(Function::Scale, self.view.scale_mode);
        self.surface.set_mode(Function::Mute, self.view.mute_mode);
        self.surface.set_mode(Function::Solo, self.view.solo_mode);
        if self.view.mute_mode {
            let muted: Vec<bool> = self.routing.routes().iter().map(|r| r.muted).collect();
            self.surface.refresh_mutes(&muted);
        } else if self.view.solo_mode {
            self.surface.refresh_solo(self.routing.solo());
        } else {
            self.surface.no_mutes();
        }
    }

    /// Step pad offset (0..32) under the playhead, if it is in view.
    fn playhead_pad(&self) -> Option<usize> {
        if !self.scheduler.is_playing() {
            return None;
        }
        let track = self.store.track(self.view.channel);
        let in_chain = self.scheduler.real_step() % (track.length.max(1) * STEPS_PER_PATTERN);
        let shown_from = self.selected_pattern() * STEPS_PER_PATTERN;
        (track.first_pattern * STEPS_PER_PATTERN + in_chain)
            .checked_sub(shown_from)
            .filter(|offset| *offset < STEP_VIEW)
    }

    fn playing_pitches(&self) -> Vec<u8> {
        if !self.scheduler.is_playing() {
            return Vec::new();
        }
        self.store
            .notes_for_step(self.view.channel, self.scheduler.real_step())
            .iter()
            .map(|e| e.pitch)
            .collect()
    }

    fn note_leds(&self, leds: &mut [LedEntry; MATRIX_SIZE]) {
        let channel = self.view.channel;
        for offset in 0..STEP_VIEW {
            if !self.store.events_at(channel, self.step_for_pad(offset)).is_empty() {
                leds[STEP_PADS + offset] = LedEntry::solid(STEP);
            }
        }
        if let Some(offset) = self.playhead_pad() {
            leds[STEP_PADS + offset] = LedEntry::solid(ACTIVE_STEP);
        }
        if let Some(offset) = self.view.selected_step {
            leds[STEP_PADS + offset] = LedEntry::solid(SELECTED_STEP);
        }

        for i in 0..16 {
            let col = i % 8;
            let color = if col == 0 || col == 7 { ROOT_NOTE } else { NOTE };
            leds[NOTE_PADS + i] = LedEntry::solid(color);
        }
        if self.scale.scale() == Scale::Chromatic {
            // keyboard gaps on the upper row
            for i in [0, 3, 7] {
                leds[NOTE_PADS + i] = LedEntry::OFF;
            }
        }

        if let Some(offset) = self.view.selected_step {
            for event in self.store.events_at(channel, self.step_for_pad(offset)) {
                for (row, col) in self.scale.positions_for(event.pitch) {
                    let color = if col == 0 || col == 7 {
                        SELECTED_ROOT_NOTE
                    } else {
                        SELECTED_NOTE
                    };
                    leds[note_led(row, col)] = LedEntry::solid(color);
                }
            }
        }
        for pitch in self.playing_pitches() {
            for (row, col) in self.scale.positions_for(pitch) {
                leds[note_led(row, col)] = LedEntry::solid(ACTIVE_NOTE);
            }
        }
    }

    fn drum_leds(&self, leds: &mut [LedEntry; MATRIX_SIZE]) {
        let channel = self.view.channel;
        if let Some(drum) = self.drum_note(None) {
            for offset in 0..STEP_VIEW {
                let events = self.store.events_at(channel, self.step_for_pad(offset));
                if events.iter().any(|e| e.pitch == drum) {
                    leds[STEP_PADS + offset] = LedEntry::solid(SELECTED_STEP);
                }
            }
        }
        if let Some(offset) = self.playhead_pad() {
            leds[STEP_PADS + offset] = LedEntry::solid(ACTIVE_STEP);
        }

        let pads = self.drum_pad_count();
        for slot in 0..pads {
            leds[NOTE_PADS + slot] = LedEntry::solid(NOTE);
        }
        if self.view.selected_drum < pads {
            leds[NOTE_PADS + self.view.selected_drum] = LedEntry::solid(SELECTED_NOTE);
        }
        for pitch in self.playing_pitches() {
            if let Some(slot) = self.drum_slot(pitch) {
                leds[NOTE_PADS + slot] = LedEntry::solid(ACTIVE_NOTE);
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let channels = self.routing.routes().to_vec();
        let mut patterns = self.store.tracks().to_vec();
        for (track, route) in patterns.iter_mut().zip(&channels) {
            track.mode = route.mode;
        }
        let sync_in = match self.scheduler.sync_source() {
            SyncSource::Internal => None,
            SyncSource::External { input } => Some(input.clone()),
        };
        Snapshot {
            version: Some(snapshot::VERSION),
            patterns,
            channels,
            scaler: self.scale.context(),
            settings: Settings {
                tempo: self.scheduler.tempo(),
                swing: self.scheduler.swing(),
                sync_outs: self.scheduler.sync_outs().to_vec(),
                sync_in,
                accent: self.view.accent,
            },
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: Snapshot) {
        let snapshot = snapshot.migrate();
        if snapshot.channels.is_empty() {
            // files without routing keep the layout stored on the track
            for (channel, track) in snapshot.patterns.iter().enumerate().take(NUM_CHANNELS) {
                let mut route = self.routing.route(channel).clone();
                route.mode = track.mode;
                self.routing.set_route(channel, route);
            }
        } else {
            self.routing.set_routes(snapshot.channels);
        }
        self.store.replace_tracks(snapshot.patterns);
        for channel in 0..NUM_CHANNELS {
            self.store.track_mut(channel).mode = self.routing.route(channel).mode;
        }
        self.scale.set_context(snapshot.scaler);
        self.view = View {
            accent: snapshot.settings.accent,
            octave: [self.scale.octave(); NUM_CHANNELS],
            ..View::default()
        };
        let settings = snapshot.settings;
        self.scheduler.set_tempo(settings.tempo);
        self.scheduler.set_swing(settings.swing);
        self.scheduler.set_sync_outs(settings.sync_outs);
        self.scheduler.set_sync_source(match settings.sync_in {
            Some(input) => SyncSource::External { input },
            None => SyncSource::Internal,
        });
    }

    /// Blank song: empty tracks, default transport, fresh selection.
    pub fn new_song<S: MidiSink>(&mut self, sink: &mut S) {
        self.store.clear_tracks();
        for channel in 0..NUM_CHANNELS {
            self.store.track_mut(channel).mode = self.routing.route(channel).mode;
        }
        let mut out = Output::new(&self.routing, sink);
        self.scheduler.reset(&mut out);
        self.view = View::default();
        self.scale.set_octave(DEFAULT_OCTAVE);
    }

    pub fn load_song(&mut self, path: PathBuf) -> anyhow::Result<()> {
        let song = snapshot::load(&path)?;
        self.apply_snapshot(song);
        info!(path = %path.display(), "song loaded");
        self.song_path = Some(path);
        Ok(())
    }

    fn save_song(&self) {
        let Some(path) = &self.song_path else {
            warn!("no song file to save to");
            return;
        };
        if let Err(e) = snapshot::save(path, &self.snapshot()) {
            warn!("save failed: {e:#}");
        }
    }
}

/// Matrix index of a note pad; row 1 is the upper row.
fn note_led(row: usize, col: usize) -> usize {
    NOTE_PADS + (1 - row.min(1)) * 8 + col
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MemorySink;
    use crate::sequencer::NoteEvent;

    fn rig() -> (Coordinator, MemorySink) {
        let coordinator = Coordinator::new(
            Routing::with_default_output(Some("synth")),
            SurfaceProtocol::new(None),
            0.0,
        );
        (coordinator, MemorySink::with_ports(&["synth"]))
    }

    fn turn(c: &mut Coordinator, slot: usize, delta: i32, sink: &mut MemorySink) {
        let encoder = Encoder::Track(slot);
        c.handle_gesture(Gesture::Encoder { encoder, delta }, 0.0, sink);
    }

    fn press<S: MidiSink>(c: &mut Coordinator, index: usize, sink: &mut S) {
        c.led_click(index, 90, 0.0, sink);
        c.led_off(index, 10.0, sink);
    }

    #[test]
    fn test_step_then_note_toggles() {
        let (mut c, mut sink) = rig();
        // hold step pad 2, hit the lowest note pad (row 0, col 0 = C3)
        c.led_click(18, 90, 0.0, &mut sink);
        press(&mut c, 56, &mut sink);
        assert_eq!(c.store().events_at(0, 2), &[NoteEvent::new(36, 90, 1)]);
        // the preview sounded and was released
        assert_eq!(sink.with_status(0x90).len(), 1);
        assert_eq!(sink.with_status(0x80).len(), 1);

        press(&mut c, 56, &mut sink);
        assert!(c.store().events_at(0, 2).is_empty());
    }

    #[test]
    fn test_accent_forces_velocity() {
        let (mut c, mut sink) = rig();
        c.handle_gesture(Gesture::FunctionOn(Function::Accent), 0.0, &mut sink);
        assert!(c.accent());
        c.led_click(16, 90, 0.0, &mut sink);
        press(&mut c, 48 + 1, &mut sink);
        assert_eq!(c.store().events_at(0, 0)[0].velocity, ACCENT_VELOCITY);
    }

    #[test]
    fn test_pattern_pads_chain_and_select() {
        let (mut c, mut sink) = rig();
        c.led_click(2, 100, 0.0, &mut sink);
        c.led_click(5, 100, 0.0, &mut sink);
        assert_eq!(c.store().track(0).first_pattern, 2);
        assert_eq!(c.store().track(0).length, 4);
        assert_eq!(c.selected_pattern(), 2);
        c.led_off(2, 0.0, &mut sink);
        c.led_off(5, 0.0, &mut sink);

        c.handle_gesture(Gesture::FunctionOn(Function::Select), 0.0, &mut sink);
        c.led_click(4, 100, 0.0, &mut sink);
        assert_eq!(c.selected_pattern(), 4);
        assert_eq!(c.store().track(0).first_pattern, 2);
    }

    #[test]
    fn test_duplicate_and_delete_pattern() {
        let (mut c, mut sink) = rig();
        c.store_mut().add_note(0, 1, 60, 100, 1);
        c.handle_gesture(Gesture::FunctionOn(Function::Duplicate), 0.0, &mut sink);
        c.led_click(0, 100, 0.0, &mut sink);
        c.led_click(3, 100, 0.0, &mut sink);
        c.handle_gesture(Gesture::FunctionOff(Function::Duplicate), 0.0, &mut sink);
        assert_eq!(c.store().events_at(0, 3 * 16 + 1).len(), 1);

        c.handle_gesture(Gesture::FunctionOn(Function::Delete), 0.0, &mut sink);
        c.led_click(0, 100, 0.0, &mut sink);
        assert!(c.store().events_at(0, 1).is_empty());
        assert_eq!(c.store().events_at(0, 3 * 16 + 1).len(), 1);
    }

    #[test]
    fn test_encoders_edit_held_step_slowly() {
        let (mut c, mut sink) = rig();
        c.store_mut().add_note(0, 4, 60, 100, 1);
        c.led_click(16 + 4, 100, 0.0, &mut sink);
        for _ in 0..7 {
            turn(&mut c, 0, 1, &mut sink);
        }
        assert_eq!(c.store().events_at(0, 4)[0].length, 1);
        turn(&mut c, 0, 1, &mut sink);
        assert_eq!(c.store().events_at(0, 4)[0].length, 2);

        turn(&mut c, 1, -10, &mut sink);
        assert_eq!(c.store().events_at(0, 4)[0].velocity, 95);

        c.handle_gesture(Gesture::Octave(Direction::Up), 0.0, &mut sink);
        assert_eq!(c.store().events_at(0, 4)[0].pitch, 72);
        // the pads stayed where they were
        assert_eq!(c.scale().octave(), DEFAULT_OCTAVE);

        for _ in 0..8 {
            turn(&mut c, 4, 1, &mut sink);
        }
        assert!(c.store().events_at(0, 4).is_empty());
        assert_eq!(c.store().events_at(0, 5).len(), 1);
    }

    #[test]
    fn test_octave_and_scale_encoders_without_step() {
        let (mut c, mut sink) = rig();
        c.handle_gesture(Gesture::Octave(Direction::Up), 0.0, &mut sink);
        assert_eq!(c.scale().octave(), 4);
        c.handle_gesture(Gesture::FunctionOn(Function::Scale), 0.0, &mut sink);
        turn(&mut c, 1, 16, &mut sink);
        assert_eq!(c.scale().scale(), Scale::MelodicMinor);
        turn(&mut c, 0, 32, &mut sink);
        assert_eq!(c.scale().root_name(), "D");
    }

    #[test]
    fn test_controller_mode_sends_cc() {
        let (mut c, mut sink) = rig();
        c.handle_gesture(Gesture::FunctionOn(Function::Automate), 0.0, &mut sink);
        turn(&mut c, 2, 5, &mut sink);
        turn(&mut c, 2, -9, &mut sink);
        let sent: Vec<Vec<u8>> = sink.with_status(0xB0).iter().map(|p| p.bytes.clone()).collect();
        assert_eq!(sent, vec![vec![0xB0, 73, 5], vec![0xB0, 73, 0]]);
    }

    #[test]
    fn test_channel_select_remembers_octave() {
        let (mut c, mut sink) = rig();
        c.handle_gesture(Gesture::Octave(Direction::Down), 0.0, &mut sink);
        c.handle_gesture(Gesture::ChannelSelect(3), 0.0, &mut sink);
        assert_eq!(c.selected_channel(), 3);
        assert_eq!(c.scale().octave(), DEFAULT_OCTAVE);
        c.handle_gesture(Gesture::ChannelSelect(0), 0.0, &mut sink);
        assert_eq!(c.scale().octave(), DEFAULT_OCTAVE - 1);
    }

    #[test]
    fn test_mute_and_solo_pads() {
        let (mut c, mut sink) = rig();
        c.handle_gesture(Gesture::MuteSoloPad(2), 0.0, &mut sink);
        assert!(!c.routing().route(2).muted);
        c.handle_gesture(Gesture::FunctionOn(Function::Mute), 0.0, &mut sink);
        c.handle_gesture(Gesture::MuteSoloPad(2), 0.0, &mut sink);
        assert!(c.routing().route(2).muted);
        c.handle_gesture(Gesture::FunctionOff(Function::Mute), 0.0, &mut sink);
        c.handle_gesture(Gesture::FunctionOn(Function::Solo), 0.0, &mut sink);
        c.handle_gesture(Gesture::MuteSoloPad(5), 0.0, &mut sink);
        assert_eq!(c.routing().solo(), Some(5));
    }

    #[test]
    fn test_drum_step_toggles_on_quick_release() {
        let (mut c, mut sink) = rig();
        c.set_channel_mode(0, TrackMode::DrumsCircuit);
        // select the second drum
        press(&mut c, 49, &mut sink);
        c.led_click(20, 80, 1000.0, &mut sink);
        c.led_off(20, 1100.0, &mut sink);
        assert_eq!(c.store().events_at(0, 4), &[NoteEvent::new(62, 80, 1)]);

        // slow release does nothing
        c.led_click(21, 80, 2000.0, &mut sink);
        c.led_off(21, 2500.0, &mut sink);
        assert!(c.store().events_at(0, 5).is_empty());

        // drum pads beyond the map are silent
        let before = sink.sent.len();
        press(&mut c, 60, &mut sink);
        assert_eq!(sink.sent.len(), before);
    }

    #[test]
    fn test_drum_leds() {
        let (mut c, mut sink) = rig();
        c.set_channel_mode(0, TrackMode::Drums);
        // slot 8 is the lower-left pad, i.e. the octave's first pitch
        press(&mut c, 56, &mut sink);
        c.store_mut().add_note(0, 1, 36, 100, 1);
        c.refresh_leds();
        assert_eq!(c.led_state(17), SELECTED_STEP);
        assert_eq!(c.led_state(56), SELECTED_NOTE);
        assert_eq!(c.led_state(48), NOTE);
        assert_eq!(c.led_state(0), SELECTED_PATTERN);
    }

    #[test]
    fn test_note_leds() {
        let (mut c, mut sink) = rig();
        c.store_mut().add_note(0, 3, 39, 100, 1);
        c.led_click(19, 100, 0.0, &mut sink);
        c.refresh_leds();
        assert_eq!(c.led_state(19), SELECTED_STEP);
        // D#3 is row 0, col 2
        assert_eq!(c.led_state(58), SELECTED_NOTE);
        assert_eq!(c.led_state(56), ROOT_NOTE);
        assert_eq!(c.led_state(20), Color::Off);
        c.led_off(19, 0.0, &mut sink);
        c.refresh_leds();
        assert_eq!(c.led_state(19), STEP);
    }

    #[test]
    fn test_chromatic_gaps_are_dark() {
        let (mut c, _sink) = rig();
        c.scale.set_context(crate::scale::ScaleContext {
            scale: Scale::Chromatic,
            ..c.scale.context()
        });
        c.refresh_leds();
        for index in [48, 51, 55] {
            assert_eq!(c.led_state(index), Color::Off);
        }
        assert_eq!(c.led_state(49), NOTE);
    }

    #[test]
    fn test_record_from_pads() {
        let (mut c, mut sink) = rig();
        c.handle_gesture(Gesture::FunctionOn(Function::Play), 0.0, &mut sink);
        c.handle_gesture(Gesture::FunctionOn(Function::Record), 0.0, &mut sink);
        assert!(c.scheduler().is_playing() && c.scheduler().is_recording());
        let per_tick = c.scheduler().per_tick();
        // run until the playhead reaches step 2
        let mut now = 0.0;
        while now < 48.0 * per_tick {
            c.on_wake(now, &mut sink);
            now += per_tick;
        }
        c.led_click(56, 100, now, &mut sink);
        while now < 96.0 * per_tick {
            c.on_wake(now, &mut sink);
            now += per_tick;
        }
        c.led_off(56, now, &mut sink);
        let events = c.store().events_at(0, 2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pitch, 36);
        assert_eq!(events[0].length, 2);
    }

    #[test]
    fn test_external_input_plays_through() {
        let (mut c, mut sink) = rig();
        let msg = Inbound {
            bytes: vec![0x91, 64, 70],
            source: "keys".into(),
            at: 5.0,
        };
        c.on_midi(&msg, &mut sink);
        assert_eq!(sink.sent[0].bytes, vec![0x90, 64, 70]);

        c.set_route(
            0,
            ChannelRoute {
                input_device: Some("pads".into()),
                ..c.routing().route(0).clone()
            },
        );
        c.on_midi(&msg, &mut sink);
        assert_eq!(sink.sent.len(), 1);
    }

    #[test]
    fn test_surface_messages_are_decoded() {
        let (mut c, mut sink) = rig();
        // no surface installed, so nothing is treated as a gesture
        let msg = Inbound {
            bytes: vec![0xB0, 85, 127],
            source: "Ableton Push 2 Live Port".into(),
            at: 0.0,
        };
        c.on_midi(&msg, &mut sink);
        assert!(!c.scheduler().is_playing());

        c.handle_gesture(decode(&msg.bytes).unwrap(), 0.0, &mut sink);
        assert!(c.scheduler().is_playing());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (mut c, mut sink) = rig();
        c.store_mut().add_note(1, 7, 50, 100, 3);
        c.set_channel_mode(1, TrackMode::Drums);
        c.scheduler_mut().set_tempo(133.0);
        c.handle_gesture(Gesture::FunctionOn(Function::Accent), 0.0, &mut sink);
        let song = c.snapshot();

        let (mut other, mut other_sink) = rig();
        other.new_song(&mut other_sink);
        other.apply_snapshot(song.clone());
        assert_eq!(other.store().events_at(1, 7).len(), 1);
        assert_eq!(other.store().track(1).mode, TrackMode::Drums);
        assert_eq!(other.scheduler().tempo(), 133.0);
        assert!(other.accent());
        assert_eq!(other.snapshot(), song);
    }

    #[test]
    fn test_load_corrects_out_of_range_chain() {
        let (c, _) = rig();
        let mut song = serde_json::to_value(c.snapshot()).unwrap();
        song["patterns"][0]["firstPattern"] = 300_000_000.into();
        song["patterns"][1]["length"] = 1_000_000_000u64.into();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, song.to_string()).unwrap();

        let (mut c, mut sink) = rig();
        c.load_song(path).unwrap();
        assert_eq!(c.store().track(0).first_pattern, NUM_PATTERNS - 1);
        assert_eq!(c.store().track(1).length, NUM_PATTERNS);
        c.handle_gesture(Gesture::FunctionOn(Function::Play), 0.0, &mut sink);
        assert!(c.scheduler().is_playing());
        c.on_wake(0.0, &mut sink);
        c.refresh_leds();
    }

    #[test]
    fn test_repeat_release_keeps_newer_rate() {
        let (mut c, mut sink) = rig();
        c.handle_gesture(Gesture::RepeatOn(4), 0.0, &mut sink);
        c.handle_gesture(Gesture::RepeatOn(6), 0.0, &mut sink);
        c.handle_gesture(Gesture::RepeatOff(4), 0.0, &mut sink);
        assert_eq!(c.scheduler().repeat().map(|r| r.ticks), Some(12));
        c.handle_gesture(Gesture::RepeatOff(6), 0.0, &mut sink);
        assert!(c.scheduler().repeat().is_none());
    }

    #[test]
    fn test_load_and_save_song() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.json");
        let (mut c, mut sink) = rig();
        c.store_mut().add_note(0, 0, 60, 100, 1);
        c.set_song_path(Some(path.clone()));
        c.handle_gesture(Gesture::FunctionOn(Function::User), 0.0, &mut sink);

        let (mut other, _) = rig();
        other.load_song(path).unwrap();
        assert_eq!(other.store().events_at(0, 0).len(), 1);
        assert!(other.load_song(dir.path().join("nope.json")).is_err());
        assert_eq!(other.store().events_at(0, 0).len(), 1);
    }
}
