//! Per-track output/input routing, mute and solo.
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::MidiSink;
use crate::sequencer::{TrackMode, NUM_CHANNELS};

/// Number of controller-mode CC slots per channel.
pub const CONTROL_SLOTS: usize = 8;
/// CC number of the first controller slot.
pub const FIRST_CONTROL_CC: u8 = 71;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRoute {
    #[serde(default, deserialize_with = "port::deserialize")]
    pub output_device: Option<String>,
    #[serde(default)]
    pub output_channel: u8,
    /// `None` listens to every input device.
    #[serde(default, with = "port")]
    pub input_device: Option<String>,
    /// `None` listens on every MIDI channel.
    #[serde(default, with = "any_channel")]
    pub input_channel: Option<u8>,
    #[serde(default, rename = "sequencerMode")]
    pub mode: TrackMode,
    #[serde(default)]
    pub muted: bool,
}

impl Default for ChannelRoute {
    fn default() -> Self {
        Self {
            output_device: None,
            output_channel: 0,
            input_device: None,
            input_channel: None,
            mode: TrackMode::Notes,
            muted: false,
        }
    }
}

impl ChannelRoute {
    /// Whether a message from `source` is meant for this track.
    pub fn accepts(&self, source: &str, bytes: &[u8]) -> bool {
        let device_ok = self.input_device.as_deref().map_or(true, |d| d == source);
        let channel_ok = match (self.input_channel, bytes.first()) {
            (None, _) => true,
            (Some(ch), Some(status)) => status & 0x0F == ch,
            (Some(_), None) => false,
        };
        device_ok && channel_ok
    }
}

/// Routing table consulted before every channel send.
#[derive(Debug, Clone)]
pub struct Routing {
    routes: Vec<ChannelRoute>,
    solo: Option<usize>,
    control_slots: [[u8; CONTROL_SLOTS]; NUM_CHANNELS],
}

impl Routing {
    pub fn new() -> Self {
        Self {
            routes: vec![ChannelRoute::default(); NUM_CHANNELS],
            solo: None,
            control_slots: [[0; CONTROL_SLOTS]; NUM_CHANNELS],
        }
    }

    /// Every track sends to `device` on its own MIDI channel.
    pub fn with_default_output(device: Option<&str>) -> Self {
        let mut routing = Self::new();
        for (i, route) in routing.routes.iter_mut().enumerate() {
            route.output_device = device.map(str::to_string);
            route.output_channel = i as u8;
        }
        routing
    }

    pub fn routes(&self) -> &[ChannelRoute] {
        &self.routes
    }

    pub fn route(&self, track: usize) -> &ChannelRoute {
        &self.routes[track]
    }

    pub fn set_route(&mut self, track: usize, route: ChannelRoute) {
        self.routes[track] = route;
    }

    pub fn set_routes(&mut self, routes: Vec<ChannelRoute>) {
        for (i, route) in routes.into_iter().take(NUM_CHANNELS).enumerate() {
            self.routes[i] = route;
        }
    }

    pub fn solo(&self) -> Option<usize> {
        self.solo
    }

    pub fn toggle_solo(&mut self, track: usize) {
        self.solo = if self.solo == Some(track) { None } else { Some(track) };
    }

    pub fn toggle_mute(&mut self, track: usize) {
        let route = &mut self.routes[track];
        route.muted = !route.muted;
    }

    /// Port and channel-adjusted bytes for a track message, or `None` when the
    /// track is muted, another track is soloed or the device is absent.
    pub fn resolve<'a>(
        &'a self,
        track: usize,
        bytes: &[u8],
        sink: &dyn MidiSink,
    ) -> Option<(&'a str, Vec<u8>)> {
        let route = &self.routes[track];
        if route.muted || self.solo.is_some_and(|s| s != track) {
            trace!(track, "dropped: muted or not soloed");
            return None;
        }
        let port = route.output_device.as_deref()?;
        if !sink.has_port(port) {
            trace!(track, port, "dropped: output device absent");
            return None;
        }
        let mut bytes = bytes.to_vec();
        if let Some(status) = bytes.first_mut() {
            *status |= route.output_channel & 0x0F;
        }
        Some((port, bytes))
    }

    /// Move a controller slot by `delta`. Returns the new value if it changed.
    pub fn bump_control(&mut self, track: usize, slot: usize, delta: i32) -> Option<u8> {
        let value = self.control_slots[track].get_mut(slot)?;
        let next = (*value as i32 + delta).clamp(0, 127) as u8;
        if next == *value {
            return None;
        }
        *value = next;
        Some(next)
    }
}

impl Default for Routing {
    fn default() -> Self {
        Self::new()
    }
}

/// Device names persist as strings, "any" as -1.
mod port {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Name(String),
        Names(Vec<String>),
        Number(i64),
    }

    pub fn serialize<S>(device: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match device {
            Some(name) => serializer.serialize_str(name),
            None => serializer.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Raw>::deserialize(deserializer)? {
            Some(Raw::Name(name)) => Some(name),
            Some(Raw::Names(names)) => names.into_iter().next(),
            Some(Raw::Number(_)) | None => None,
        })
    }
}

mod any_channel {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(channel: &Option<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(channel.map_or(-1, i64::from))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<i64>::deserialize(deserializer)?;
        Ok(raw.filter(|c| (0..16).contains(c)).map(|c| c as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MemorySink;

    fn routing() -> Routing {
        Routing::with_default_output(Some("synth"))
    }

    #[test]
    fn test_resolve_sets_output_channel() {
        let routing = routing();
        let sink = MemorySink::with_ports(&["synth"]);
        let (port, bytes) = routing.resolve(3, &[0x90, 60, 100], &sink).unwrap();
        assert_eq!(port, "synth");
        assert_eq!(bytes, vec![0x93, 60, 100]);
    }

    #[test]
    fn test_muted_and_solo_drop() {
        let mut routing = routing();
        let sink = MemorySink::with_ports(&["synth"]);
        routing.toggle_mute(1);
        assert!(routing.resolve(1, &[0x90, 60, 100], &sink).is_none());
        routing.toggle_mute(1);
        assert!(routing.resolve(1, &[0x90, 60, 100], &sink).is_some());

        routing.toggle_solo(2);
        assert!(routing.resolve(1, &[0x90, 60, 100], &sink).is_none());
        assert!(routing.resolve(2, &[0x90, 60, 100], &sink).is_some());
        routing.toggle_solo(2);
        assert_eq!(routing.solo(), None);
    }

    #[test]
    fn test_absent_device_drops() {
        let routing = routing();
        let sink = MemorySink::with_ports(&["other"]);
        assert!(routing.resolve(0, &[0x90, 60, 100], &sink).is_none());
        let unrouted = Routing::new();
        assert!(unrouted.resolve(0, &[0x90, 60, 100], &sink).is_none());
    }

    #[test]
    fn test_input_filtering() {
        let mut routing = Routing::new();
        routing.set_route(
            1,
            ChannelRoute {
                input_device: Some("keys".into()),
                input_channel: Some(2),
                ..ChannelRoute::default()
            },
        );
        assert!((0..NUM_CHANNELS).all(|t| routing.route(t).accepts("keys", &[0x92, 60, 1])));
        assert!(!routing.route(1).accepts("pads", &[0x92, 60, 1]));
        assert!(routing.route(0).accepts("pads", &[0x92, 60, 1]));
        assert!(!routing.route(1).accepts("keys", &[0x91, 60, 1]));
    }

    #[test]
    fn test_control_slots_clamp() {
        let mut routing = Routing::new();
        assert_eq!(routing.bump_control(0, 2, 10), Some(10));
        assert_eq!(routing.bump_control(0, 2, 500), Some(127));
        assert_eq!(routing.bump_control(0, 2, 1), None);
        assert_eq!(routing.bump_control(0, 2, -1000), Some(0));
        assert_eq!(routing.bump_control(0, CONTROL_SLOTS, 1), None);
    }

    #[test]
    fn test_route_json_uses_any_markers() {
        let route = ChannelRoute {
            output_device: Some("synth".into()),
            output_channel: 4,
            mode: TrackMode::DrumsCircuit,
            ..ChannelRoute::default()
        };
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["inputDevice"], -1);
        assert_eq!(json["inputChannel"], -1);
        assert_eq!(json["sequencerMode"], "drums-circuit");
        let back: ChannelRoute = serde_json::from_value(json).unwrap();
        assert_eq!(back, route);

        let legacy: ChannelRoute = serde_json::from_str(
            r#"{"outputDevice":["IAC Bus 1"],"inputDevice":-1,"outputChannel":2,"inputChannel":-1,"sequencerMode":"drums"}"#,
        )
        .unwrap();
        assert_eq!(legacy.output_device.as_deref(), Some("IAC Bus 1"));
        assert_eq!(legacy.mode, TrackMode::Drums);
        assert!(!legacy.muted);
    }
}
