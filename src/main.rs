use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender};
use tracing::{error, info, Level};

#[cfg(feature = "gui")]
use eframe::egui;

use stepjam::midi::{self, Inbound};
use stepjam::sequencer::clock::{EngineClock, Ticker};
use stepjam::surface::{self, Color, Gesture, MATRIX_SIZE};
use stepjam::{Coordinator, MidiSystem, Routing, SurfaceProtocol, SyncSource};

#[derive(Parser, Debug, Clone)]
#[command(name = "stepjam")]
#[command(about = "Pattern step sequencer for the Push 2", long_about = None)]
struct Args {
    /// Song file to load; the User button saves to it
    #[arg(short, long)]
    song: Option<PathBuf>,

    /// Port name fragment of the control surface
    #[arg(long, default_value = surface::DEFAULT_PORT_PATTERN)]
    surface: String,

    /// Ports containing this are never routed to tracks
    #[arg(long, default_value = surface::DEVICE_FAMILY)]
    exclude: String,

    /// Output device for every track when the song has no routing
    #[arg(short, long)]
    output: Option<String>,

    /// Follow clock and transport from this input
    #[arg(long)]
    sync_in: Option<String>,

    /// Send clock and transport to this output (repeatable)
    #[arg(long)]
    sync_out: Vec<String>,

    #[arg(short, long)]
    tempo: Option<f64>,

    /// Wake-up interval of the timing helper
    #[arg(long, default_value_t = 2)]
    tick_ms: u64,

    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Print MIDI ports and exit
    #[arg(long)]
    list_ports: bool,

    /// No pad window, surface only
    #[arg(long)]
    headless: bool,
}

/// Input from the pad window.
#[derive(Debug, Clone, Copy)]
enum UiCommand {
    Press(usize),
    Release(usize),
    Gesture(Gesture),
}

/// What the pad window draws.
#[derive(Debug, Clone)]
struct Display {
    pads: [Color; MATRIX_SIZE],
    tempo: f64,
    playing: bool,
    recording: bool,
    step: usize,
    channel: usize,
}

impl Default for Display {
    fn default() -> Self {
        Self {
            pads: [Color::Off; MATRIX_SIZE],
            tempo: 0.0,
            playing: false,
            recording: false,
            step: 0,
            channel: 0,
        }
    }
}

struct Engine {
    clock: EngineClock,
    ticker: Ticker,
    inbound: Receiver<Inbound>,
    // keeps the inbound channel open when no input is connected
    _inbound_tx: Sender<Inbound>,
    ports: MidiSystem,
    coordinator: Coordinator,
}

impl Engine {
    fn start(args: &Args) -> anyhow::Result<Self> {
        let clock = EngineClock::new();
        let (inbound_tx, inbound) = unbounded();
        let excludes = [args.exclude.as_str(), args.surface.as_str()];
        let ports = MidiSystem::open(clock, inbound_tx.clone(), &excludes)
            .context("failed to open MIDI ports")?;

        let mut surface = SurfaceProtocol::discover(&args.surface, clock, inbound_tx.clone())?;
        surface.install();

        let output = args
            .output
            .clone()
            .or_else(|| ports.output_names().into_iter().next());
        info!(output = ?output, "default track output");
        let routing = Routing::with_default_output(output.as_deref());
        let mut coordinator = Coordinator::new(routing, surface, clock.now_ms());

        if let Some(path) = &args.song {
            if path.exists() {
                coordinator.load_song(path.clone())?;
            } else {
                info!(path = %path.display(), "new song");
                coordinator.set_song_path(Some(path.clone()));
            }
        }
        let scheduler = coordinator.scheduler_mut();
        if let Some(tempo) = args.tempo {
            scheduler.set_tempo(tempo);
        }
        if !args.sync_out.is_empty() {
            scheduler.set_sync_outs(args.sync_out.clone());
        }
        if let Some(input) = &args.sync_in {
            scheduler.set_sync_source(SyncSource::External {
                input: input.clone(),
            });
        }
        coordinator.refresh_leds();

        Ok(Self {
            clock,
            ticker: Ticker::spawn(Duration::from_millis(args.tick_ms)),
            inbound,
            _inbound_tx: inbound_tx,
            ports,
            coordinator,
        })
    }

    fn run(
        mut self,
        commands: Receiver<UiCommand>,
        display: Option<Arc<Mutex<Display>>>,
    ) -> anyhow::Result<()> {
        info!("engine running");
        loop {
            select! {
                recv(self.ticker.wakes()) -> wake => {
                    wake.context("timing helper stopped")?;
                    let now = self.clock.now_ms();
                    if self.coordinator.on_wake(now, &mut self.ports) {
                        self.coordinator.refresh_leds();
                    }
                    self.ticker.request();
                }
                recv(self.inbound) -> msg => {
                    let msg = msg.context("inbound MIDI closed")?;
                    self.coordinator.on_midi(&msg, &mut self.ports);
                    self.coordinator.refresh_leds();
                }
                recv(commands) -> command => {
                    let Ok(command) = command else {
                        info!("pad window closed");
                        return Ok(());
                    };
                    let now = self.clock.now_ms();
                    apply_command(&mut self.coordinator, &mut self.ports, command, now);
                    self.coordinator.refresh_leds();
                }
            }
            self.ports.flush(self.clock.now_ms());
            if let Some(display) = &display {
                if let Ok(mut display) = display.lock() {
                    self.publish(&mut display);
                }
            }
        }
    }

    fn publish(&self, display: &mut Display) {
        for (index, pad) in display.pads.iter_mut().enumerate() {
            *pad = self.coordinator.led_state(index);
        }
        let scheduler = self.coordinator.scheduler();
        display.tempo = scheduler.tempo();
        display.playing = scheduler.is_playing();
        display.recording = scheduler.is_recording();
        display.step = scheduler.real_step();
        display.channel = self.coordinator.selected_channel();
    }
}

fn apply_command(
    coordinator: &mut Coordinator,
    ports: &mut MidiSystem,
    command: UiCommand,
    now: f64,
) {
    match command {
        UiCommand::Press(index) => coordinator.led_click(index, 100, now, ports),
        UiCommand::Release(index) => coordinator.led_off(index, now, ports),
        UiCommand::Gesture(gesture) => coordinator.handle_gesture(gesture, now, ports),
    }
}

fn list_ports() -> anyhow::Result<()> {
    println!("Inputs:");
    for name in midi::input_port_names()? {
        println!("  {name}");
    }
    println!("Outputs:");
    for name in midi::output_port_names()? {
        println!("  {name}");
    }
    Ok(())
}

/// Build the engine on its own thread; the surface connection stays there.
fn spawn_engine(
    args: Args,
    commands: Receiver<UiCommand>,
    display: Option<Arc<Mutex<Display>>>,
) -> anyhow::Result<std::thread::JoinHandle<()>> {
    let (ready_tx, ready_rx) = bounded::<anyhow::Result<()>>(1);
    let handle = std::thread::spawn(move || match Engine::start(&args) {
        Ok(engine) => {
            let _ = ready_tx.send(Ok(()));
            if let Err(e) = engine.run(commands, display) {
                error!("engine stopped: {e:#}");
            }
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    });
    ready_rx
        .recv()
        .map_err(|_| anyhow!("engine thread exited during startup"))??;
    Ok(handle)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    if args.list_ports {
        return list_ports();
    }

    if args.headless || !cfg!(feature = "gui") {
        let handle = spawn_engine(args, never(), None)?;
        handle
            .join()
            .map_err(|_| anyhow!("engine thread panicked"))?;
        return Ok(());
    }

    #[cfg(feature = "gui")]
    {
        let display = Arc::new(Mutex::new(Display::default()));
        let (command_tx, command_rx) = unbounded();
        spawn_engine(args, command_rx, Some(display.clone()))?;
        run_window(command_tx, display)?;
    }
    Ok(())
}

#[cfg(feature = "gui")]
fn run_window(commands: Sender<UiCommand>, display: Arc<Mutex<Display>>) -> anyhow::Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([520.0, 600.0])
            .with_title("stepjam"),
        ..Default::default()
    };
    eframe::run_native(
        "stepjam",
        options,
        Box::new(|_cc| Ok(Box::new(PadWindow::new(commands, display)))),
    )
    .map_err(|e| anyhow!("window failed: {e}"))
}

/// Mirror of the pad matrix; clicks act like pad presses.
#[cfg(feature = "gui")]
struct PadWindow {
    commands: Sender<UiCommand>,
    display: Arc<Mutex<Display>>,
    pressed: [bool; MATRIX_SIZE],
}

#[cfg(feature = "gui")]
impl PadWindow {
    fn new(commands: Sender<UiCommand>, display: Arc<Mutex<Display>>) -> Self {
        Self {
            commands,
            display,
            pressed: [false; MATRIX_SIZE],
        }
    }

    fn send(&self, command: UiCommand) {
        let _ = self.commands.send(command);
    }
}

#[cfg(feature = "gui")]
impl eframe::App for PadWindow {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        ctx.request_repaint_after(Duration::from_millis(30));
        let display = self
            .display
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default();

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("stepjam");
            ui.horizontal(|ui| {
                let label = if display.playing { "⏸ Stop" } else { "▶ Play" };
                if ui.button(label).clicked() {
                    self.send(UiCommand::Gesture(Gesture::FunctionOn(surface::Function::Play)));
                }
                let record = if display.recording { "● Recording" } else { "○ Record" };
                if ui.button(record).clicked() {
                    self.send(UiCommand::Gesture(Gesture::FunctionOn(surface::Function::Record)));
                }
                ui.label(format!("{:.1} BPM", display.tempo));
                ui.label(format!("step {}", display.step + 1));
            });

            ui.horizontal(|ui| {
                for channel in 0..8 {
                    let text = format!("{}", channel + 1);
                    if ui.selectable_label(display.channel == channel, text).clicked() {
                        self.send(UiCommand::Gesture(Gesture::ChannelSelect(channel)));
                    }
                }
            });
            ui.add_space(10.0);

            for row in 0..8 {
                ui.horizontal(|ui| {
                    for col in 0..8 {
                        let index = row * 8 + col;
                        let [r, g, b] = display.pads[index].rgb();
                        let pad = egui::Button::new("")
                            .min_size(egui::vec2(52.0, 52.0))
                            .fill(egui::Color32::from_rgb(r.max(30), g.max(30), b.max(30)));
                        let down = ui.add(pad).is_pointer_button_down_on();
                        if down != self.pressed[index] {
                            self.pressed[index] = down;
                            let command = if down {
                                UiCommand::Press(index)
                            } else {
                                UiCommand::Release(index)
                            };
                            self.send(command);
                        }
                    }
                });
            }
        });
    }
}
