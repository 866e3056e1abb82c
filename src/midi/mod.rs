//! MIDI I/O: the send boundary the engine writes through, and its midir backend.
use std::collections::HashMap;

use anyhow::{anyhow, Context};
use crossbeam_channel::Sender;
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::{debug, info, warn};

use crate::sequencer::clock::EngineClock;

pub mod queue;
pub mod route;

pub use queue::{Pending, TimedQueue};
pub use route::{ChannelRoute, Routing};

const CLIENT_NAME: &str = "stepjam";

/// Destination for timestamped raw messages. Timestamps are engine
/// milliseconds; anything at or before "now" goes out immediately.
pub trait MidiSink {
    fn send(&mut self, port: &str, bytes: &[u8], at: f64);
    fn has_port(&self, port: &str) -> bool;
}

/// Routes track messages through [`Routing`] into a [`MidiSink`].
pub struct Output<'a> {
    routing: &'a Routing,
    sink: &'a mut dyn MidiSink,
}

impl<'a> Output<'a> {
    pub fn new(routing: &'a Routing, sink: &'a mut dyn MidiSink) -> Self {
        Self { routing, sink }
    }

    /// Send a channel message for `track`. Silently dropped when the route
    /// says so.
    pub fn channel_message(&mut self, track: usize, bytes: &[u8], at: f64) {
        if let Some((port, bytes)) = self.routing.resolve(track, bytes, &*self.sink) {
            self.sink.send(port, &bytes, at);
        }
    }

    /// Send to a named port (sync outputs). Dropped if the port is absent.
    pub fn port_message(&mut self, port: &str, bytes: &[u8], at: f64) {
        if self.sink.has_port(port) {
            self.sink.send(port, bytes, at);
        }
    }
}

/// Sink that records everything, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    ports: Vec<String>,
    pub sent: Vec<Pending>,
}

impl MemorySink {
    pub fn with_ports(ports: &[&str]) -> Self {
        Self {
            ports: ports.iter().map(|p| p.to_string()).collect(),
            sent: Vec::new(),
        }
    }

    /// Sent messages whose status byte (channel stripped) matches `status`.
    pub fn with_status(&self, status: u8) -> Vec<&Pending> {
        self.sent
            .iter()
            .filter(|p| p.bytes.first().is_some_and(|b| b & 0xF0 == status & 0xF0))
            .collect()
    }
}

impl MidiSink for MemorySink {
    fn send(&mut self, port: &str, bytes: &[u8], at: f64) {
        self.sent.push(Pending {
            at,
            port: port.to_string(),
            bytes: bytes.to_vec(),
        });
    }

    fn has_port(&self, port: &str) -> bool {
        self.ports.iter().any(|p| p == port)
    }
}

/// A raw message from any connected input.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub bytes: Vec<u8>,
    pub source: String,
    pub at: f64,
}

/// Connected midir ports plus the queue that holds future messages.
pub struct MidiSystem {
    outputs: HashMap<String, MidiOutputConnection>,
    _inputs: Vec<MidiInputConnection<()>>,
    queue: TimedQueue,
}

impl MidiSystem {
    /// Connect every input and output that passes [`is_routable`].
    /// Inbound messages are forwarded to `inbound`.
    pub fn open(
        clock: EngineClock,
        inbound: Sender<Inbound>,
        excludes: &[&str],
    ) -> anyhow::Result<Self> {
        let mut outputs = HashMap::new();
        for name in output_port_names()? {
            if !is_routable(&name, excludes) {
                continue;
            }
            match connect_output(&name) {
                Ok(conn) => {
                    info!(port = %name, "output connected");
                    outputs.insert(name, conn);
                }
                Err(e) => warn!(port = %name, "output skipped: {e:#}"),
            }
        }

        let mut inputs = Vec::new();
        for name in input_port_names()? {
            if !is_routable(&name, excludes) {
                continue;
            }
            match connect_input(&name, clock, inbound.clone()) {
                Ok(conn) => {
                    info!(port = %name, "input connected");
                    inputs.push(conn);
                }
                Err(e) => warn!(port = %name, "input skipped: {e:#}"),
            }
        }

        Ok(Self {
            outputs,
            _inputs: inputs,
            queue: TimedQueue::new(),
        })
    }

    pub fn output_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.outputs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Write out every queued message that is due.
    pub fn flush(&mut self, now: f64) {
        for msg in self.queue.pop_due(now) {
            if let Some(conn) = self.outputs.get_mut(&msg.port) {
                if let Err(e) = conn.send(&msg.bytes) {
                    debug!(port = %msg.port, "send failed: {e}");
                }
            }
        }
    }
}

impl MidiSink for MidiSystem {
    fn send(&mut self, port: &str, bytes: &[u8], at: f64) {
        self.queue.push(port, bytes, at);
    }

    fn has_port(&self, port: &str) -> bool {
        self.outputs.contains_key(port)
    }
}

pub fn input_port_names() -> anyhow::Result<Vec<String>> {
    let midi_in = MidiInput::new(CLIENT_NAME).context("failed to create MIDI input")?;
    Ok(midi_in
        .ports()
        .iter()
        .filter_map(|p| midi_in.port_name(p).ok())
        .collect())
}

pub fn output_port_names() -> anyhow::Result<Vec<String>> {
    let midi_out = MidiOutput::new(CLIENT_NAME).context("failed to create MIDI output")?;
    Ok(midi_out
        .ports()
        .iter()
        .filter_map(|p| midi_out.port_name(p).ok())
        .collect())
}

pub fn connect_output(name: &str) -> anyhow::Result<MidiOutputConnection> {
    let midi_out = MidiOutput::new(CLIENT_NAME).context("failed to create MIDI output")?;
    let port = midi_out
        .ports()
        .into_iter()
        .find(|p| midi_out.port_name(p).is_ok_and(|n| n == name))
        .ok_or_else(|| anyhow!("no output port named {name}"))?;
    midi_out
        .connect(&port, CLIENT_NAME)
        .map_err(|e| anyhow!("failed to connect {name}: {e}"))
}

pub fn connect_input(
    name: &str,
    clock: EngineClock,
    inbound: Sender<Inbound>,
) -> anyhow::Result<MidiInputConnection<()>> {
    let mut midi_in = MidiInput::new(CLIENT_NAME).context("failed to create MIDI input")?;
    // clock pulses and sysex are needed, active sensing is noise
    midi_in.ignore(Ignore::ActiveSense);
    let port = midi_in
        .ports()
        .into_iter()
        .find(|p| midi_in.port_name(p).is_ok_and(|n| n == name))
        .ok_or_else(|| anyhow!("no input port named {name}"))?;
    let source = name.to_string();
    midi_in
        .connect(
            &port,
            CLIENT_NAME,
            move |_stamp, message, _| {
                let _ = inbound.send(Inbound {
                    bytes: message.to_vec(),
                    source: source.clone(),
                    at: clock.now_ms(),
                });
            },
            (),
        )
        .map_err(|e| anyhow!("failed to connect {name}: {e}"))
}

/// False for ports whose name contains any non-empty fragment in `excludes`.
pub fn is_routable(name: &str, excludes: &[&str]) -> bool {
    !excludes
        .iter()
        .any(|fragment| !fragment.is_empty() && name.contains(fragment))
}

/// Index of the first port whose name contains `pattern`.
pub fn find_port(names: &[String], pattern: &str) -> Option<usize> {
    names.iter().position(|n| n.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_drops_unknown_sync_port() {
        let routing = Routing::new();
        let mut sink = MemorySink::with_ports(&["clock"]);
        let mut out = Output::new(&routing, &mut sink);
        out.port_message("clock", &[0xF8], 1.0);
        out.port_message("gone", &[0xF8], 1.0);
        assert_eq!(sink.sent.len(), 1);
    }

    #[test]
    fn test_find_port() {
        let names = vec![
            "IAC Bus 1".to_string(),
            "Ableton Push 2 User Port".to_string(),
            "Ableton Push 2 Live Port".to_string(),
        ];
        assert_eq!(find_port(&names, "Ableton Push 2 Live Port"), Some(2));
        assert_eq!(find_port(&names, "Launchpad"), None);
    }

    #[test]
    fn test_surface_ports_are_not_routable() {
        let excludes = [crate::surface::DEVICE_FAMILY, crate::surface::DEFAULT_PORT_PATTERN];
        assert!(!is_routable("Ableton Push 2 Live Port", &excludes));
        assert!(!is_routable("Ableton Push 2 User Port", &excludes));
        assert!(is_routable("IAC Bus 1", &excludes));
        // an empty fragment excludes nothing
        assert!(is_routable("IAC Bus 1", &[""]));
    }
}
