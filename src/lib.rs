/// stepjam - pattern step sequencer for a pad control surface
///
/// - 8 tracks of 16 patterns, 16 steps each, played as one 256 step loop
/// - Lookahead MIDI scheduling, internal or external clock
/// - Scale aware note pads, drum layouts and live recording
/// - Push 2 driver with LED diffing
/// - JSON song snapshots

pub mod coordinator;
pub mod midi;
pub mod scale;
pub mod sequencer;
pub mod snapshot;
pub mod surface;

// Re-export commonly used types
pub use coordinator::Coordinator;
pub use midi::{ChannelRoute, MemorySink, MidiSink, MidiSystem, Routing};
pub use scale::{pitch_name, Scale, ScaleContext, ScaleMapper};
pub use sequencer::playback::{Scheduler, SyncSource};
pub use sequencer::tempo::TempoTracker;
pub use sequencer::{NoteEvent, PatternStore, Track, TrackMode};
pub use snapshot::Snapshot;
pub use surface::SurfaceProtocol;
