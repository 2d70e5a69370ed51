// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto
mod af;
mod gpio;
mod i2c;
mod maps;
mod output;
mod pipeline;
mod serial;
mod shot;

use {
    af::{FocusGate, FrameOutcome, Rearm},
    ams_as7265x_protocols::{As7265xSequencer, ProtocolError},
    camera_cdaf_protocols::{FocusActuator, FocusMachine, INITIAL_FOCUS_INDEX},
    clap::Parser,
    glib::{ControlFlow, Error, FileError, IOCondition},
    gpio::{drain_events, InputPin, OutputPin},
    i2c::LensActuator,
    maps::ConfigError,
    nix::{errno::Errno, sys::signal::Signal, unistd::read},
    output::OutputLog,
    pipeline::{FrameData, MediaPipeline, V4l2Pipeline},
    runtime_core::{cmdline::*, dispatcher::*, LogLevel, RuntimeOperation},
    serial::{LineBuffer, SerialPort},
    shot::{ShotDebounce, TimelineAction, SHOT_DEBOUNCE_MS, SHOT_TIMELINE},
    std::{path::PathBuf, sync::mpsc, time::Duration},
    tracing::{debug, debug_span, Level},
};

const SHUTTER_PIN: u32 = 7;
const FLASH_PIN: u32 = 38;
const AMBIENT_PIN: u32 = 40;

// Retry cadence of the frame trigger while its admission condition fails.
const TRIGGER_RETRY_MS: u64 = 50;

// Recheck interval against the reference sharpness while focused.
const FOCUS_RECHECK_MS: u64 = 250;

/// Everything the run loop consumes, funneled over one channel so exactly
/// one callback makes progress at a time.
pub enum Event {
    Shutdown,
    Shutter,
    DebounceClear,
    FocusFrame(FrameData),
    TriggerFocus,
    RunFocus,
    Timeline(TimelineAction),
    SerialLine(String),
    Fatal(Error),
}

pub struct SpecCamParams {
    pub camera_id: String,
    pub serial_id: String,
    pub video_device: usize,
    pub data_root: PathBuf,
}

struct SpecCamRuntime<P> {
    pipeline: P,
    port: SerialPort,
    shutter_pin: InputPin,
    flash_pin: OutputPin,
    ambient_pin: OutputPin,
    lens: LensActuator,
    output: OutputLog,
    gate: FocusGate,
    machine: FocusMachine,
    sequencer: As7265xSequencer,
    debounce: ShotDebounce,
    rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    dispatchers: Vec<Dispatcher>,
    timeline: Option<Dispatcher>,
}

impl<P> Drop for SpecCamRuntime<P> {
    fn drop(&mut self) {
        // At first, stop event loops in all of dispatchers to avoid queueing
        // new events.
        for dispatcher in &mut self.dispatchers {
            dispatcher.stop();
        }
        if let Some(timeline) = &mut self.timeline {
            timeline.stop();
        }

        // Next, consume all events in queue.
        for _ in self.rx.try_iter() {}

        // Finally finish I/O threads.
        self.dispatchers.clear();
        self.timeline = None;
    }
}

impl<P: MediaPipeline> SpecCamRuntime<P> {
    const SYSTEM_DISPATCHER_NAME: &'static str = "system event dispatcher";
    const DEVICE_DISPATCHER_NAME: &'static str = "device event dispatcher";
    const TIMELINE_DISPATCHER_NAME: &'static str = "shot timeline dispatcher";

    fn launch_system_event_dispatcher(&mut self) -> Result<(), Error> {
        let mut dispatcher = Dispatcher::run(Self::SYSTEM_DISPATCHER_NAME.to_string())?;

        let tx = self.tx.clone();
        dispatcher.attach_signal_handler(Signal::SIGINT, move || {
            let _ = tx.send(Event::Shutdown);
            ControlFlow::Break
        });

        let tx = self.tx.clone();
        dispatcher.attach_signal_handler(Signal::SIGTERM, move || {
            let _ = tx.send(Event::Shutdown);
            ControlFlow::Break
        });

        self.dispatchers.push(dispatcher);

        Ok(())
    }

    fn launch_device_event_dispatcher(&mut self) -> Result<(), Error> {
        let mut dispatcher = Dispatcher::run(Self::DEVICE_DISPATCHER_NAME.to_string())?;

        let tx = self.tx.clone();
        let shutter_fd = self.shutter_pin.fd();
        dispatcher.attach_fd_watch(
            shutter_fd,
            IOCondition::IN | IOCondition::HUP | IOCondition::ERR,
            move |fd, condition| {
                if condition.contains(IOCondition::IN) {
                    drain_events(fd);
                    let _ = tx.send(Event::Shutter);
                    ControlFlow::Continue
                } else {
                    let msg = "Shutter input pin connection broken";
                    let _ = tx.send(Event::Fatal(Error::new(FileError::Io, msg)));
                    ControlFlow::Break
                }
            },
        );

        let tx = self.tx.clone();
        let serial_fd = self.port.fd();
        let mut buffer = LineBuffer::default();
        dispatcher.attach_fd_watch(
            serial_fd,
            IOCondition::IN | IOCondition::HUP | IOCondition::ERR,
            move |fd, condition| {
                if !condition.contains(IOCondition::IN) {
                    let msg = "Serial line dropped";
                    let _ = tx.send(Event::Fatal(Error::new(FileError::Io, msg)));
                    return ControlFlow::Break;
                }

                let mut scratch = [0u8; serial::BUFFER_SIZE];
                loop {
                    match read(fd, &mut scratch) {
                        Ok(0) => break,
                        Ok(len) => {
                            for line in buffer.push_bytes(&scratch[..len]) {
                                let _ = tx.send(Event::SerialLine(line));
                            }
                        }
                        Err(Errno::EAGAIN) => break,
                        Err(e) => {
                            let msg = format!("Read from serial port failed: {}", e);
                            let _ = tx.send(Event::Fatal(Error::new(FileError::Io, &msg)));
                            return ControlFlow::Break;
                        }
                    }
                }

                ControlFlow::Continue
            },
        );

        self.dispatchers.push(dispatcher);

        Ok(())
    }

    fn schedule(&mut self, delay_ms: u64, event: Event) {
        if let Some(timeline) = &mut self.timeline {
            let tx = self.tx.clone();
            let mut event = Some(event);
            timeline.attach_timeout_handler(Duration::from_millis(delay_ms), move || {
                if let Some(event) = event.take() {
                    let _ = tx.send(event);
                }
            });
        }
    }

    fn rearm_trigger(&mut self, rearm: Rearm) {
        match rearm {
            Rearm::Immediate => {
                let _ = self.tx.send(Event::TriggerFocus);
            }
            Rearm::After(timeout_ms) => self.schedule(timeout_ms as u64, Event::TriggerFocus),
        }
    }

    // The synchronous part of the shutter response; everything else runs on
    // one-shot timers against the press instant.
    fn start_shot_timeline(&mut self) {
        debug!("shutter press accepted, focused={}", self.gate.is_focused());

        self.gate.request_focus_lock();
        self.output.stamp_now();
        self.output.arm_image_name();

        self.schedule(SHOT_DEBOUNCE_MS, Event::DebounceClear);
        for &(offset_ms, action) in SHOT_TIMELINE {
            self.schedule(offset_ms, Event::Timeline(action));
        }
    }

    fn dispatch_timeline_action(&mut self, action: TimelineAction) -> Result<(), Error> {
        match action {
            TimelineAction::LightsOut => {
                self.flash_pin.set(0)?;
                self.ambient_pin.set(0)
            }
            TimelineAction::FlashOn => self.flash_pin.set(1),
            TimelineAction::AmbientOn => self.ambient_pin.set(1),
            TimelineAction::StillCapture => {
                self.pipeline.trigger_image_capture();
                Ok(())
            }
            TimelineAction::SpectralData => {
                debug!("starting AS7265x data run");
                self.sequencer.begin_data_run(&mut self.port)
            }
            TimelineAction::ReleaseFocusLock => {
                debug!("releasing focus lock");
                let rearm = self.gate.release_focus_lock();
                self.rearm_trigger(rearm);
                Ok(())
            }
        }
    }

    fn handle_focus_frame(&mut self, frame: FrameData) {
        self.pipeline.close_focus_valve();

        let sharpness = af::laplacian_mean(&frame.data, frame.width, frame.height);
        match self.gate.admit_frame(sharpness) {
            FrameOutcome::Advance => {
                let _ = self.tx.send(Event::RunFocus);
            }
            FrameOutcome::Recheck => self.schedule(FOCUS_RECHECK_MS, Event::TriggerFocus),
            FrameOutcome::Discard => {
                let _ = self.tx.send(Event::TriggerFocus);
            }
        }
    }

    fn handle_run_focus(&mut self) -> Result<(), Error> {
        let sample = self.gate.current_sample();
        self.machine
            .run_focus(sample, &mut self.gate, &mut self.lens)?;

        let rearm = self.gate.finish_advance();
        self.rearm_trigger(rearm);

        Ok(())
    }

    fn handle_trigger_focus(&mut self) {
        if self.gate.ready_to_trigger() {
            self.gate.begin_capture();
            self.pipeline.open_focus_valve();
        } else {
            self.schedule(TRIGGER_RETRY_MS, Event::TriggerFocus);
        }
    }

    /// Returns false when the loop should end.
    fn dispatch_event(&mut self, event: Event) -> Result<bool, Error> {
        match event {
            Event::Shutdown => return Ok(false),
            Event::Fatal(e) => return Err(e),
            Event::Shutter => {
                if self.debounce.press() {
                    self.start_shot_timeline();
                }
            }
            Event::DebounceClear => self.debounce.clear(),
            Event::Timeline(action) => self.dispatch_timeline_action(action)?,
            Event::SerialLine(line) => {
                if self.sequencer.handler_bound() {
                    self.sequencer
                        .feed_line(&line, &mut self.port, &mut self.output)?;
                } else {
                    debug!("dropping unhandled serial line: {}", line);
                }
            }
            Event::FocusFrame(frame) => self.handle_focus_frame(frame),
            Event::RunFocus => self.handle_run_focus()?,
            Event::TriggerFocus => self.handle_trigger_focus(),
        }

        Ok(true)
    }
}

impl RuntimeOperation<SpecCamParams> for SpecCamRuntime<V4l2Pipeline> {
    fn new(params: SpecCamParams, log_level: Option<LogLevel>) -> Result<Self, Error> {
        if let Some(level) = log_level {
            let fmt_level = match level {
                LogLevel::Debug => Level::DEBUG,
            };
            tracing_subscriber::fmt().with_max_level(fmt_level).init();
        }

        // The serial port goes first as it is the most likely to be
        // unplugged.
        let port = SerialPort::new(&params.serial_id)?;
        let shutter_pin = InputPin::new(SHUTTER_PIN)?;
        let flash_pin = OutputPin::new(FLASH_PIN)?;
        let ambient_pin = OutputPin::new(AMBIENT_PIN)?;
        let lens = LensActuator::new(&params.camera_id)?;
        let output = OutputLog::new(&params.data_root)?;
        let pipeline = V4l2Pipeline::new(params.video_device, output.image_name_slot());

        let (tx, rx) = mpsc::channel();

        Ok(SpecCamRuntime {
            pipeline,
            port,
            shutter_pin,
            flash_pin,
            ambient_pin,
            lens,
            output,
            gate: Default::default(),
            machine: Default::default(),
            sequencer: Default::default(),
            debounce: Default::default(),
            rx,
            tx,
            dispatchers: Default::default(),
            timeline: Default::default(),
        })
    }

    fn listen(&mut self) -> Result<(), Error> {
        let enter = debug_span!("setup").entered();

        self.launch_system_event_dispatcher()?;
        self.launch_device_event_dispatcher()?;
        self.timeline = Some(Dispatcher::run(Self::TIMELINE_DISPATCHER_NAME.to_string())?);

        self.pipeline.start(self.tx.clone())?;

        // Park the lens at its preset and ask for the first focus frame.
        self.lens.set_focus(INITIAL_FOCUS_INDEX)?;
        let _ = self.tx.send(Event::TriggerFocus);

        self.sequencer.begin_handshake(&mut self.port)?;

        enter.exit();

        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        let _enter = debug_span!("event").entered();

        loop {
            let event = match self.rx.recv() {
                Ok(event) => event,
                Err(_) => continue,
            };

            if !self.dispatch_event(event)? {
                break;
            }
        }

        Ok(())
    }
}

struct SpecCamServiceCmd;

#[derive(Parser, Default)]
#[clap(name = "spectral-camera-ctl-service")]
struct Arguments {
    /// The root directory under which daily data directories are kept.
    data_root: PathBuf,

    /// The camera identifier for the lens focus actuator.
    #[clap(long, default_value = "camera-0")]
    camera: String,

    /// The port identifier the AS7265x board is attached to.
    #[clap(long, default_value = "USB0")]
    serial: String,

    /// The index of the V4L2 capture device supplying focus frames.
    #[clap(long, default_value_t = 0)]
    video_device: usize,

    /// The level to debug the service.
    #[clap(long, value_enum)]
    log_level: Option<LogLevel>,
}

impl ServiceCmd<Arguments, SpecCamParams, SpecCamRuntime<V4l2Pipeline>> for SpecCamServiceCmd {
    fn params(args: &Arguments) -> (SpecCamParams, Option<LogLevel>) {
        let params = SpecCamParams {
            camera_id: args.camera.clone(),
            serial_id: args.serial.clone(),
            video_device: args.video_device,
            data_root: args.data_root.clone(),
        };
        (params, args.log_level)
    }

    fn err_to_string(e: &Error) -> String {
        if let Some(error) = e.kind::<ProtocolError>() {
            let cause = match error {
                ProtocolError::MalformedReply => "Malformed reply",
                ProtocolError::UnexpectedStep => "Unexpected step",
                _ => "",
            };
            format!("AS7265x protocol error: {}, {}", cause, e)
        } else if let Some(error) = e.kind::<ConfigError>() {
            let cause = match error {
                ConfigError::UnknownDevice => "Unknown device identifier",
                ConfigError::UnknownPin => "Unknown pin number",
                _ => "",
            };
            format!("Device configuration error: {}, {}", cause, e)
        } else {
            file_err_to_string(e)
        }
    }
}

fn main() {
    SpecCamServiceCmd::run()
}
