//! Core sequencer data - tracks, sparse step storage and pattern editing.
//!
//! The store has no notion of time. Steps are absolute indices
//! (`pattern * 16 + step`) into a fixed 256 step loop.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod clock;
pub mod playback;
pub mod tempo;

pub const NUM_CHANNELS: usize = 8;
pub const STEPS_PER_PATTERN: usize = 16;
pub const NUM_PATTERNS: usize = 16;
pub const LOOP_STEPS: usize = NUM_PATTERNS * STEPS_PER_PATTERN;
pub const TICKS_PER_STEP: u32 = 24;
pub const TICKS_PER_QUARTER: u32 = TICKS_PER_STEP * 4;
pub const LOOP_TICKS: u32 = LOOP_STEPS as u32 * TICKS_PER_STEP;

/// Absolute step index for a step inside a pattern.
pub fn step_index(pattern: usize, step: usize) -> usize {
    pattern * STEPS_PER_PATTERN + step
}

/// A single note inside a step's event list. Identity within a step is the pitch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "note")]
pub struct NoteEvent {
    #[serde(rename = "note")]
    pub pitch: u8,
    pub velocity: u8,
    /// In steps.
    pub length: u16,
    #[serde(default = "default_repeat")]
    pub repeat: u8,
    /// In ticks, applied at dispatch.
    #[serde(default)]
    pub nudge: i8,
}

fn default_repeat() -> u8 {
    1
}

impl NoteEvent {
    pub fn new(pitch: u8, velocity: u8, length: u16) -> Self {
        Self {
            pitch,
            velocity,
            length,
            repeat: 1,
            nudge: 0,
        }
    }
}

/// Editable per-note parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Length,
    Velocity,
    Repeat,
    Nudge,
}

impl Param {
    /// Inclusive `(min, max)` range.
    pub const fn limits(self) -> (i32, i32) {
        match self {
            Param::Length => (1, 64),
            Param::Velocity => (1, 127),
            Param::Repeat => (1, 4),
            Param::Nudge => (-12, 12),
        }
    }

    pub fn clamp(self, value: i64) -> i32 {
        let (min, max) = self.limits();
        value.clamp(min as i64, max as i64) as i32
    }

    pub fn get(self, event: &NoteEvent) -> i32 {
        match self {
            Param::Length => event.length as i32,
            Param::Velocity => event.velocity as i32,
            Param::Repeat => event.repeat as i32,
            Param::Nudge => event.nudge as i32,
        }
    }

    fn set(self, event: &mut NoteEvent, value: i32) {
        let value = self.clamp(value as i64);
        match self {
            Param::Length => event.length = value as u16,
            Param::Velocity => event.velocity = value as u8,
            Param::Repeat => event.repeat = value as u8,
            Param::Nudge => event.nudge = value as i8,
        }
    }
}

/// How a channel's pads and steps are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrackMode {
    #[default]
    #[serde(rename = "notes", alias = "note")]
    Notes,
    #[serde(rename = "drums")]
    Drums,
    #[serde(rename = "drums-circuit")]
    DrumsCircuit,
    #[serde(rename = "drums-volca")]
    DrumsVolca,
}

impl TrackMode {
    pub fn is_drums(self) -> bool {
        self != TrackMode::Notes
    }

    /// Fixed drum pad pitches for the device specific drum modes.
    pub fn drum_map(self) -> Option<&'static [u8]> {
        match self {
            TrackMode::DrumsCircuit => Some(&[60, 62, 64, 65]),
            TrackMode::DrumsVolca => Some(&[]),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Pattern the chain starts at.
    pub first_pattern: usize,
    /// Number of chained patterns.
    pub length: usize,
    /// Step index -> events. Lists are never empty.
    #[serde(with = "sparse_steps")]
    pub data: BTreeMap<usize, Vec<NoteEvent>>,
    #[serde(default)]
    pub mode: TrackMode,
    #[serde(default)]
    pub name: String,
}

impl Track {
    pub fn new(index: usize) -> Self {
        Self {
            first_pattern: 0,
            length: 1,
            data: BTreeMap::new(),
            mode: TrackMode::Notes,
            name: format!("Track {}", index + 1),
        }
    }

    /// Track step played at loop step `play_step`.
    pub fn step_for(&self, play_step: usize) -> usize {
        let track_steps = self.length.max(1) * STEPS_PER_PATTERN;
        (play_step % track_steps) + self.first_pattern * STEPS_PER_PATTERN
    }

    pub fn events(&self, step: usize) -> &[NoteEvent] {
        self.data.get(&step).map(Vec::as_slice).unwrap_or(&[])
    }

    fn put(&mut self, step: usize, events: Vec<NoteEvent>) {
        if events.is_empty() {
            self.data.remove(&step);
        } else {
            self.data.insert(step, events);
        }
    }
}

/// Per-track sparse pattern data and all editing operations.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternStore {
    tracks: Vec<Track>,
}

impl PatternStore {
    pub fn new() -> Self {
        Self {
            tracks: blank_tracks(),
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, channel: usize) -> &Track {
        assert!(channel < NUM_CHANNELS, "channel {channel} out of range");
        &self.tracks[channel]
    }

    pub fn track_mut(&mut self, channel: usize) -> &mut Track {
        assert!(channel < NUM_CHANNELS, "channel {channel} out of range");
        &mut self.tracks[channel]
    }

    /// Replace all tracks, e.g. from a snapshot. Missing tracks are blank.
    pub fn replace_tracks(&mut self, tracks: Vec<Track>) {
        let mut tracks = tracks;
        tracks.truncate(NUM_CHANNELS);
        while tracks.len() < NUM_CHANNELS {
            tracks.push(Track::new(tracks.len()));
        }
        for track in &mut tracks {
            track.data.retain(|step, events| *step < LOOP_STEPS && !events.is_empty());
            track.first_pattern = track.first_pattern.min(NUM_PATTERNS - 1);
            track.length = track.length.clamp(1, NUM_PATTERNS - track.first_pattern);
        }
        self.tracks = tracks;
    }

    pub fn clear_tracks(&mut self) {
        self.tracks = blank_tracks();
    }

    pub fn events_at(&self, channel: usize, step: usize) -> &[NoteEvent] {
        self.track(channel).events(step)
    }

    /// Events the track plays at loop step `play_step`, honoring its chain.
    pub fn notes_for_step(&self, channel: usize, play_step: usize) -> &[NoteEvent] {
        let track = self.track(channel);
        track.events(track.step_for(play_step))
    }

    /// Add the pitch at `step`, or remove it if present. Returns true when a
    /// note was added.
    pub fn toggle_note(
        &mut self,
        channel: usize,
        step: usize,
        pitch: u8,
        velocity: u8,
        length: u16,
    ) -> bool {
        if step >= LOOP_STEPS {
            return false;
        }
        let track = self.track_mut(channel);
        let mut events = track.data.remove(&step).unwrap_or_default();
        let before = events.len();
        events.retain(|e| e.pitch != pitch);
        let added = events.len() == before;
        if added {
            events.push(NoteEvent::new(pitch, velocity, length));
        }
        track.put(step, events);
        added
    }

    /// Add the pitch at `step`, replacing any event with the same pitch.
    pub fn add_note(&mut self, channel: usize, step: usize, pitch: u8, velocity: u8, length: u16) {
        if step >= LOOP_STEPS {
            return;
        }
        let length = Param::Length.clamp(length as i64) as u16;
        let track = self.track_mut(channel);
        let events = track.data.entry(step).or_default();
        events.retain(|e| e.pitch != pitch);
        events.push(NoteEvent::new(pitch, velocity, length));
    }

    pub fn delete_step(&mut self, channel: usize, step: usize) {
        self.track_mut(channel).data.remove(&step);
    }

    pub fn delete_pattern(&mut self, channel: usize, pattern: usize) {
        let start = step_index(pattern, 0);
        let track = self.track_mut(channel);
        track.data.retain(|step, _| !(start..start + STEPS_PER_PATTERN).contains(step));
    }

    /// Remove every occurrence of `pitch` from one pattern.
    pub fn delete_note(&mut self, channel: usize, pattern: usize, pitch: u8) {
        let start = step_index(pattern, 0);
        let track = self.track_mut(channel);
        let steps: Vec<usize> = track
            .data
            .range(start..start + STEPS_PER_PATTERN)
            .map(|(step, _)| *step)
            .collect();
        for step in steps {
            let mut events = track.data.remove(&step).unwrap_or_default();
            events.retain(|e| e.pitch != pitch);
            track.put(step, events);
        }
    }

    /// Block copy of 16 steps from `(channel, pattern)` to `(channel, pattern)`.
    /// Empty source steps clear the destination.
    pub fn copy_pattern(&mut self, src: (usize, usize), dest: (usize, usize)) {
        let (src_channel, src_pattern) = src;
        let (dest_channel, dest_pattern) = dest;
        if src_pattern >= NUM_PATTERNS || dest_pattern >= NUM_PATTERNS {
            return;
        }
        let block: Vec<Vec<NoteEvent>> = (0..STEPS_PER_PATTERN)
            .map(|i| {
                self.events_at(src_channel, step_index(src_pattern, i))
                    .to_vec()
            })
            .collect();
        let track = self.track_mut(dest_channel);
        for (i, events) in block.into_iter().enumerate() {
            track.put(step_index(dest_pattern, i), events);
        }
    }

    pub fn set_pattern_chain(&mut self, channel: usize, min: usize, max: usize) {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let min = min.min(NUM_PATTERNS - 1);
        let max = max.min(NUM_PATTERNS - 1);
        let track = self.track_mut(channel);
        track.first_pattern = min;
        track.length = max - min + 1;
    }

    /// Shift a parameter by `delta`, clamped to its limits. With `sub_note`
    /// only that pitch's event changes, otherwise every event in the step
    /// takes the value derived from the first one.
    pub fn edit_param(
        &mut self,
        channel: usize,
        step: usize,
        sub_note: Option<u8>,
        param: Param,
        delta: i32,
    ) {
        let Some(events) = self.track_mut(channel).data.get_mut(&step) else {
            return;
        };
        let source = match sub_note {
            Some(pitch) => events.iter().find(|e| e.pitch == pitch),
            None => events.first(),
        };
        let Some(source) = source else {
            return;
        };
        let value = param.clamp(param.get(source) as i64 + delta as i64);
        for event in events.iter_mut() {
            if sub_note.map_or(true, |pitch| event.pitch == pitch) {
                param.set(event, value);
            }
        }
    }

    /// Transpose every event in the step by `delta` octaves. Notes that would
    /// leave the MIDI range stay where they are.
    pub fn edit_octave(&mut self, channel: usize, step: usize, delta: i32) {
        let Some(events) = self.track_mut(channel).data.get_mut(&step) else {
            return;
        };
        for event in events.iter_mut() {
            let pitch = event.pitch as i32 + delta * 12;
            if (0..=127).contains(&pitch) {
                event.pitch = pitch as u8;
            }
        }
    }

    /// Move events to `(step + delta) mod 16` inside the same pattern. With
    /// `sub_note` only that pitch moves.
    pub fn nudge_note(&mut self, channel: usize, step: usize, sub_note: Option<u8>, delta: i32) {
        let pattern = step / STEPS_PER_PATTERN;
        let in_pattern = (step % STEPS_PER_PATTERN) as i32;
        let target = step_index(
            pattern,
            (in_pattern + delta).rem_euclid(STEPS_PER_PATTERN as i32) as usize,
        );
        if target == step {
            return;
        }
        let track = self.track_mut(channel);
        let Some(events) = track.data.remove(&step) else {
            return;
        };
        let (moving, staying): (Vec<NoteEvent>, Vec<NoteEvent>) = match sub_note {
            Some(pitch) => events.into_iter().partition(|e| e.pitch == pitch),
            None => (events, Vec::new()),
        };
        track.put(step, staying);
        let mut dest = track.data.remove(&target).unwrap_or_default();
        dest.retain(|e| !moving.iter().any(|m| m.pitch == e.pitch));
        dest.extend(moving);
        track.put(target, dest);
    }
}

impl Default for PatternStore {
    fn default() -> Self {
        Self::new()
    }
}

fn blank_tracks() -> Vec<Track> {
    (0..NUM_CHANNELS).map(Track::new).collect()
}

/// Steps persist as a sparse array: index = step, `null` for empty steps.
mod sparse_steps {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::NoteEvent;

    pub fn serialize<S>(
        data: &BTreeMap<usize, Vec<NoteEvent>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let len = data.keys().next_back().map_or(0, |last| last + 1);
        let mut steps: Vec<Option<&Vec<NoteEvent>>> = vec![None; len];
        for (step, events) in data {
            steps[*step] = Some(events);
        }
        steps.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<usize, Vec<NoteEvent>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let steps: Vec<Option<Vec<NoteEvent>>> = Vec::deserialize(deserializer)?;
        Ok(steps
            .into_iter()
            .enumerate()
            .filter_map(|(step, events)| events.filter(|e| !e.is_empty()).map(|e| (step, e)))
            .collect())
    }
}
