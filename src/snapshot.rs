//! Song files: one JSON document holding patterns, routing, scale and
//! transport settings.
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::midi::ChannelRoute;
use crate::scale::ScaleContext;
use crate::sequencer::playback::DEFAULT_TEMPO;
use crate::sequencer::{NoteEvent, Param, Track, TICKS_PER_STEP};

/// Current file version. Files without a version store positions and
/// lengths in ticks.
pub const VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    pub patterns: Vec<Track>,
    #[serde(default)]
    pub channels: Vec<ChannelRoute>,
    #[serde(default)]
    pub scaler: ScaleContext,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_tempo")]
    pub tempo: f64,
    #[serde(default)]
    pub swing: i32,
    #[serde(default)]
    pub sync_outs: Vec<String>,
    #[serde(default)]
    pub sync_in: Option<String>,
    #[serde(default)]
    pub accent: bool,
}

fn default_tempo() -> f64 {
    DEFAULT_TEMPO
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tempo: DEFAULT_TEMPO,
            swing: 0,
            sync_outs: Vec::new(),
            sync_in: None,
            accent: false,
        }
    }
}

impl Snapshot {
    /// Bring a file of any version up to [`VERSION`].
    pub fn migrate(mut self) -> Self {
        if self.version.is_none() {
            info!("converting legacy timebase");
            for track in &mut self.patterns {
                track.data = legacy_steps(std::mem::take(&mut track.data));
            }
        }
        self.version = Some(VERSION);
        self
    }
}

fn ticks_to_steps(ticks: usize) -> usize {
    (ticks + TICKS_PER_STEP as usize / 2) / TICKS_PER_STEP as usize
}

fn legacy_steps(data: BTreeMap<usize, Vec<NoteEvent>>) -> BTreeMap<usize, Vec<NoteEvent>> {
    data.into_iter()
        .map(|(tick, events)| {
            let events = events
                .into_iter()
                .map(|mut event| {
                    let steps = ticks_to_steps(event.length as usize);
                    event.length = Param::Length.clamp(steps as i64) as u16;
                    event
                })
                .collect();
            (ticks_to_steps(tick), events)
        })
        .collect()
}

pub fn from_json(json: &str) -> anyhow::Result<Snapshot> {
    let snapshot: Snapshot = serde_json::from_str(json)?;
    Ok(snapshot.migrate())
}

pub fn to_json(snapshot: &Snapshot) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(snapshot)?)
}

pub fn load(path: &Path) -> anyhow::Result<Snapshot> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    from_json(&data).with_context(|| format!("failed to parse {}", path.display()))
}

// Creates parent directories as needed.
pub fn save(path: &Path, snapshot: &Snapshot) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = to_json(snapshot)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "song saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale::Scale;
    use crate::sequencer::{PatternStore, TrackMode};

    fn sample() -> Snapshot {
        let mut store = PatternStore::new();
        store.add_note(0, 3, 60, 100, 2);
        store.add_note(2, 40, 36, 90, 1);
        store.set_pattern_chain(2, 2, 3);
        let mut channels = vec![ChannelRoute::default(); 8];
        channels[2].mode = TrackMode::Drums;
        channels[2].output_device = Some("synth".into());
        Snapshot {
            version: Some(VERSION),
            patterns: store.tracks().to_vec(),
            channels,
            scaler: ScaleContext {
                scale: Scale::Major,
                root: 2,
                octave: 4,
            },
            settings: Settings {
                tempo: 98.0,
                swing: -6,
                sync_outs: vec!["clock".into()],
                sync_in: None,
                accent: true,
            },
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("songs").join("a.json");
        let song = sample();
        save(&path, &song).unwrap();
        let back = load(&path).unwrap();
        assert_eq!(back, song);
    }

    #[test]
    fn test_json_shape() {
        let json: serde_json::Value = serde_json::from_str(&to_json(&sample()).unwrap()).unwrap();
        assert_eq!(json["version"], 2);
        assert_eq!(json["settings"]["syncOuts"][0], "clock");
        assert_eq!(json["scaler"]["currentScale"], "maj");
        assert_eq!(json["channels"][2]["sequencerMode"], "drums");
        assert_eq!(json["patterns"][0]["data"][3][0]["length"], 2);
    }

    #[test]
    fn test_legacy_timebase_is_converted() {
        let legacy = r#"{
            "patterns": [{
                "firstPattern": 0,
                "length": 1,
                "data": [[{"type": "note", "note": 60, "velocity": 100, "length": 48}]],
                "mode": "note",
                "name": "Track 1"
            }],
            "settings": {"tempo": 110}
        }"#;
        let mut value: serde_json::Value = serde_json::from_str(legacy).unwrap();
        // put a second note at tick 72, i.e. step 3
        let data = value["patterns"][0]["data"].as_array_mut().unwrap();
        data.resize(73, serde_json::Value::Null);
        data[72] =
            serde_json::json!([{"type": "note", "note": 62, "velocity": 80, "length": 5000}]);

        let song = from_json(&value.to_string()).unwrap();
        assert_eq!(song.version, Some(VERSION));
        let track = &song.patterns[0];
        assert_eq!(track.events(0)[0].length, 2);
        assert_eq!(track.events(3)[0].pitch, 62);
        assert_eq!(track.events(3)[0].length, 64);
        assert_eq!(track.mode, TrackMode::Notes);
        assert_eq!(song.settings.tempo, 110.0);
        assert_eq!(song.settings.swing, 0);
        assert_eq!(song.scaler, ScaleContext::default());
    }

    #[test]
    fn test_current_version_is_untouched() {
        let song = sample();
        let back = from_json(&to_json(&song).unwrap()).unwrap();
        assert_eq!(back.patterns[0].events(3)[0].length, 2);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("missing.json")).is_err());
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        let err = load(&bad).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse"));
    }
}
