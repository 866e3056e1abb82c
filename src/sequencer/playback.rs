//! Playback engine - lookahead dispatch, swing, held repeat, live recording
//! and clock sync.
//!
//! The engine is driven from outside: [`Scheduler::on_wake`] is called
//! whenever the timing helper fires and [`Scheduler::on_clock_message`] for
//! every realtime byte from a MIDI input. All output goes through
//! [`Output`] with explicit timestamps, so nothing here blocks.
use tracing::{debug, info, trace};

use super::tempo::TempoTracker;
use super::{
    NoteEvent, PatternStore, LOOP_STEPS, LOOP_TICKS, NUM_CHANNELS, STEPS_PER_PATTERN,
    TICKS_PER_QUARTER, TICKS_PER_STEP,
};
use crate::midi::route::FIRST_CONTROL_CC;
use crate::midi::Output;
use crate::scale::pitch_name;

/// Ticks dispatched per wake-up.
pub const LOOKAHEAD_TICKS: u32 = TICKS_PER_STEP;
/// Ticks between MIDI clock pulses (24 PPQN).
pub const TICKS_PER_PULSE: u32 = 4;
/// Held-repeat rates in ticks: 1/4, 1/4t, 1/8, 1/8t, 1/16, 1/16t, 1/32, 1/32t.
pub const REPEAT_RATES: [u32; 8] = [96, 72, 48, 36, 24, 18, 12, 9];

pub const DEFAULT_TEMPO: f64 = 120.0;
pub const MIN_TEMPO: f64 = 30.0;
pub const MAX_TEMPO: f64 = 200.0;
pub const SWING_LIMIT: i32 = 36;

const CLOCK: u8 = 0xF8;
const START: u8 = 0xFA;
const CONTINUE: u8 = 0xFB;
const STOP: u8 = 0xFC;
const NOTE_ON: u8 = 0x90;
const NOTE_OFF: u8 = 0x80;
const START_LEAD_MS: f64 = 10.0;

/// Where the engine takes its time from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncSource {
    #[default]
    Internal,
    /// Follow 0xF8/0xFA/0xFB/0xFC from the named input port.
    External { input: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repeat {
    pub channel: usize,
    /// Rate in ticks, one of [`REPEAT_RATES`].
    pub ticks: u32,
}

#[derive(Debug, Clone, Copy)]
struct OpenNote {
    on_tick: u32,
    channel: usize,
    pitch: u8,
    velocity: u8,
}

#[derive(Debug, Clone, Copy)]
struct HeldNote {
    channel: usize,
    pitch: u8,
    velocity: u8,
}

pub struct Scheduler {
    tick: u32,
    next_time: f64,
    tempo: f64,
    swing: i32,
    playing: bool,
    recording: bool,
    repeat: Option<Repeat>,
    open_notes: Vec<OpenNote>,
    held_notes: Vec<HeldNote>,
    sync_outs: Vec<String>,
    sync: SyncSource,
    tracker: TempoTracker,
    real_tick: u32,
    real_step: usize,
}

impl Scheduler {
    pub fn new(now: f64) -> Self {
        Self {
            tick: 0,
            next_time: now,
            tempo: DEFAULT_TEMPO,
            swing: 0,
            playing: false,
            recording: false,
            repeat: None,
            open_notes: Vec::new(),
            held_notes: Vec::new(),
            sync_outs: Vec::new(),
            sync: SyncSource::Internal,
            tracker: TempoTracker::new(DEFAULT_TEMPO),
            real_tick: 0,
            real_step: 0,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn next_time(&self) -> f64 {
        self.next_time
    }

    /// Current tempo; the tracked estimate when following an external clock.
    pub fn tempo(&self) -> f64 {
        match self.sync {
            SyncSource::Internal => self.tempo,
            SyncSource::External { .. } => self.tracker.tempo(),
        }
    }

    pub fn swing(&self) -> i32 {
        self.swing
    }

    /// Milliseconds per tick at the current tempo.
    pub fn per_tick(&self) -> f64 {
        60.0 / (self.tempo() * TICKS_PER_QUARTER as f64) * 1000.0
    }

    /// Tick actually sounding now, as opposed to the dispatch position.
    pub fn real_tick(&self) -> u32 {
        self.real_tick
    }

    /// Playhead step for display; 0 when stopped.
    pub fn real_step(&self) -> usize {
        self.real_step
    }

    pub fn repeat(&self) -> Option<Repeat> {
        self.repeat
    }

    pub fn sync_outs(&self) -> &[String] {
        &self.sync_outs
    }

    pub fn set_sync_outs(&mut self, ports: Vec<String>) {
        self.sync_outs = ports;
    }

    pub fn sync_source(&self) -> &SyncSource {
        &self.sync
    }

    pub fn set_sync_source(&mut self, source: SyncSource) {
        if source == self.sync {
            return;
        }
        info!(?source, "sync source changed");
        if matches!(self.sync, SyncSource::External { .. }) {
            self.tracker.reset();
        }
        self.sync = source;
    }

    pub fn start(&mut self, out: &mut Output) {
        info!("transport start");
        self.playing = true;
        self.tick = 0;
        for port in &self.sync_outs {
            out.port_message(port, &[START], self.next_time - START_LEAD_MS);
        }
    }

    pub fn stop(&mut self, out: &mut Output) {
        info!("transport stop");
        self.playing = false;
        for port in &self.sync_outs {
            out.port_message(port, &[STOP], self.next_time);
        }
    }

    pub fn play_pause(&mut self, out: &mut Output) {
        if self.playing {
            self.stop(out);
        } else {
            self.start(out);
        }
    }

    /// Back to defaults: stopped, 120 bpm, no swing, nothing held or recording.
    pub fn reset(&mut self, out: &mut Output) {
        self.stop(out);
        self.tempo = DEFAULT_TEMPO;
        self.swing = 0;
        self.recording = false;
        self.repeat = None;
        self.open_notes.clear();
        self.held_notes.clear();
    }

    pub fn change_tempo(&mut self, delta: f64) {
        self.set_tempo(self.tempo + delta);
    }

    pub fn set_tempo(&mut self, tempo: f64) {
        self.tempo = tempo.clamp(MIN_TEMPO, MAX_TEMPO);
    }

    pub fn change_swing(&mut self, delta: i32) {
        self.set_swing(self.swing.saturating_add(delta));
    }

    pub fn set_swing(&mut self, swing: i32) {
        self.swing = swing.clamp(-SWING_LIMIT, SWING_LIMIT);
    }

    /// Flip the record flag, returning the new state.
    pub fn toggle_recording(&mut self) -> bool {
        self.recording = !self.recording;
        if !self.recording {
            self.open_notes.clear();
        }
        info!(recording = self.recording, "record toggled");
        self.recording
    }

    /// Handle a timing helper wake-up. Returns true when the displayed step
    /// changed.
    pub fn on_wake(&mut self, now: f64, store: &PatternStore, out: &mut Output) -> bool {
        let per_tick = self.per_tick();
        let shown = self.real_step;
        self.update_real_tick(now, per_tick);

        if matches!(self.sync, SyncSource::Internal) {
            if now - self.next_time > per_tick {
                debug!(behind_ms = now - self.next_time, "engine fell behind, re-anchoring");
                self.next_time = now;
            }
            if now > self.next_time - per_tick * 4.0 {
                self.dispatch_window(LOOKAHEAD_TICKS, per_tick, store, out);
            }
        }
        self.real_step != shown
    }

    /// Handle a realtime byte from an input. Returns true if `bytes` was a
    /// clock or transport message, whether or not it came from the sync input.
    pub fn on_clock_message(
        &mut self,
        bytes: &[u8],
        source: &str,
        at: f64,
        store: &PatternStore,
        out: &mut Output,
    ) -> bool {
        let Some(&status) = bytes.first() else {
            return false;
        };
        if !matches!(status, CLOCK | START | CONTINUE | STOP) {
            return false;
        }
        let from_sync_in = matches!(&self.sync, SyncSource::External { input } if input == source);
        if !from_sync_in {
            return true;
        }
        match status {
            CLOCK => {
                self.tracker.next(at);
                let per_tick = self.per_tick();
                self.next_time = at;
                self.dispatch_window(TICKS_PER_PULSE, per_tick, store, out);
            }
            START => {
                self.next_time = at;
                self.start(out);
            }
            CONTINUE => {
                info!("transport continue");
                self.playing = true;
            }
            _ => self.stop(out),
        }
        true
    }

    fn update_real_tick(&mut self, now: f64, per_tick: f64) {
        if !self.playing {
            self.real_step = 0;
            return;
        }
        let diff = (self.next_time - now) / per_tick;
        let real = (self.tick as f64 - diff).floor() as i64;
        self.real_tick = real.rem_euclid(LOOP_TICKS as i64) as u32;
        self.real_step = (self.real_tick / TICKS_PER_STEP) as usize;
    }

    /// Emit `count` ticks starting at `self.tick`/`self.next_time`, then
    /// advance both.
    fn dispatch_window(
        &mut self,
        count: u32,
        per_tick: f64,
        store: &PatternStore,
        out: &mut Output,
    ) {
        trace!(tick = self.tick, count, "dispatch window");
        for i in 0..count {
            let tick = self.tick + i;
            let straight = self.next_time + per_tick * i as f64;

            if tick % TICKS_PER_PULSE == 0 {
                for port in &self.sync_outs {
                    out.port_message(port, &[CLOCK], straight);
                }
            }

            let time = straight + per_tick * self.swing_offset(tick);

            if let Some(repeat) = self.repeat {
                if tick % repeat.ticks == 0 {
                    // only the 1/16 rate swings
                    let at = if repeat.ticks == TICKS_PER_STEP { time } else { straight };
                    let duration = repeat.ticks as f64 * per_tick;
                    for held in self.held_notes.iter().filter(|h| h.channel == repeat.channel) {
                        send_hit(out, held.channel, held.pitch, held.velocity, at, duration);
                    }
                }
            }

            if self.playing {
                for channel in 0..NUM_CHANNELS {
                    let track = store.track(channel);
                    let chain_steps = track.length.max(1) * STEPS_PER_PATTERN;
                    let chain_ticks = chain_steps as u32 * TICKS_PER_STEP;
                    let first_step = track.first_pattern * STEPS_PER_PATTERN;
                    let first_tick = first_step as u32 * TICKS_PER_STEP;
                    let track_tick = tick % chain_ticks + first_tick;
                    if track_tick % TICKS_PER_STEP != 0 {
                        continue;
                    }
                    let step = (track_tick / TICKS_PER_STEP) as usize;
                    for event in track.events(step) {
                        let at = time + event.nudge as f64 * per_tick;
                        send_note(out, channel, event, at, per_tick);
                    }
                }
            }
        }
        self.tick += count;
        self.next_time += per_tick * count as f64;
        if self.tick >= LOOP_TICKS {
            self.tick %= LOOP_TICKS;
        }
    }

    /// Swing offset in ticks for `tick`: every second sixteenth moves by half
    /// the swing amount.
    pub fn swing_offset(&self, tick: u32) -> f64 {
        if tick % (TICKS_PER_STEP * 2) == TICKS_PER_STEP {
            self.swing as f64 / 2.0
        } else {
            0.0
        }
    }

    pub fn record_note_on(&mut self, channel: usize, pitch: u8, velocity: u8) {
        self.capture_on(self.real_tick, channel, pitch, velocity);
    }

    pub fn record_note_off(&mut self, channel: usize, pitch: u8, store: &mut PatternStore) {
        self.capture_off(self.real_tick, channel, pitch, store);
    }

    fn capture_on(&mut self, tick: u32, channel: usize, pitch: u8, velocity: u8) {
        if !(self.recording && self.playing) {
            return;
        }
        self.open_notes.push(OpenNote {
            on_tick: tick,
            channel,
            pitch,
            velocity,
        });
    }

    fn capture_off(&mut self, tick: u32, channel: usize, pitch: u8, store: &mut PatternStore) {
        if !(self.recording && self.playing) {
            return;
        }
        let Some(index) = self
            .open_notes
            .iter()
            .position(|n| n.channel == channel && n.pitch == pitch)
        else {
            return;
        };
        let open = self.open_notes.remove(index);
        let on_step = rounded_step(open.on_tick);
        let mut off_step = rounded_step(tick);
        if off_step < on_step {
            off_step += LOOP_STEPS;
        }
        let length = (off_step - on_step).max(1);
        let track = store.track(channel);
        let in_chain = on_step % (track.length.max(1) * STEPS_PER_PATTERN);
        let step = track.first_pattern * STEPS_PER_PATTERN + in_chain;
        debug!(channel, note = %pitch_name(pitch), step, length, "recorded note");
        store.add_note(channel, step, pitch, open.velocity, length.min(u16::MAX as usize) as u16);
    }

    /// Immediate note-on for a pressed pad. The note is held for repeat until
    /// [`Scheduler::preview_note_off`].
    pub fn preview_note(
        &mut self,
        channel: usize,
        pitch: u8,
        velocity: u8,
        now: f64,
        out: &mut Output,
    ) {
        out.channel_message(channel, &[NOTE_ON, pitch, velocity], now);
        self.held_notes.push(HeldNote {
            channel,
            pitch,
            velocity,
        });
    }

    pub fn preview_note_off(&mut self, channel: usize, pitch: u8, now: f64, out: &mut Output) {
        out.channel_message(channel, &[NOTE_OFF, pitch, 0], now);
        self.held_notes
            .retain(|h| h.channel != channel || h.pitch != pitch);
    }

    /// One step long note, used when a step is toggled on.
    pub fn preview_note_hit(
        &self,
        channel: usize,
        pitch: u8,
        velocity: u8,
        now: f64,
        out: &mut Output,
    ) {
        send_note(out, channel, &NoteEvent::new(pitch, velocity, 1), now, self.per_tick());
    }

    pub fn send_pitch_bend(&self, channel: usize, lsb: u8, msb: u8, now: f64, out: &mut Output) {
        out.channel_message(channel, &[0xE0, lsb & 0x7F, msb & 0x7F], now);
    }

    /// Controller mode CC for one of the eight encoder slots.
    pub fn send_control(&self, channel: usize, slot: usize, value: u8, now: f64, out: &mut Output) {
        let cc = FIRST_CONTROL_CC + slot as u8;
        out.channel_message(channel, &[0xB0, cc, value & 0x7F], now);
    }

    /// Start retriggering held notes on `channel` at `REPEAT_RATES[index]`.
    pub fn set_repeat(&mut self, channel: usize, index: usize) {
        if let Some(&ticks) = REPEAT_RATES.get(index) {
            self.repeat = Some(Repeat { channel, ticks });
        }
    }

    /// Stop repeating if `index` is the active rate.
    pub fn release_repeat(&mut self, index: usize) {
        if self.repeat.map(|r| r.ticks) == REPEAT_RATES.get(index).copied() {
            self.repeat = None;
        }
    }

    /// Aftertouch drives the velocity of repeated notes.
    pub fn set_repeat_pressure(&mut self, pressure: u8) {
        let velocity = pressure.clamp(1, 127);
        for held in &mut self.held_notes {
            held.velocity = velocity;
        }
    }
}

fn rounded_step(tick: u32) -> usize {
    ((tick + TICKS_PER_STEP / 2) / TICKS_PER_STEP) as usize
}

fn send_hit(out: &mut Output, channel: usize, pitch: u8, velocity: u8, at: f64, duration: f64) {
    out.channel_message(channel, &[NOTE_ON, pitch, velocity], at);
    out.channel_message(channel, &[NOTE_OFF, pitch, velocity], at + duration);
}

/// Note-on at `at`; the note-off follows `length` steps later. With
/// `repeat > 1` the note is cut into `length * repeat` equal hits.
fn send_note(out: &mut Output, channel: usize, event: &NoteEvent, at: f64, per_tick: f64) {
    let step_ms = TICKS_PER_STEP as f64 * per_tick;
    if event.repeat <= 1 {
        send_hit(out, channel, event.pitch, event.velocity, at, event.length as f64 * step_ms);
        return;
    }
    let hit_ms = step_ms / event.repeat as f64;
    let hits = event.length as usize * event.repeat as usize;
    for i in 0..hits {
        send_hit(out, channel, event.pitch, event.velocity, at + i as f64 * hit_ms, hit_ms);
    }
}
