//! The block's lifecycle and public API (§4.F): owns the chunk pool, driver handle, and (in
//! streaming mode) poll thread, and drives them through
//! `New -> Initialized -> Configured -> Armed -> Disarmed -> Closed`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::chunk::ChunkLayout;
use crate::config::{AcquisitionMode, DigitizerConfig};
use crate::driver::{Driver, RapidBlockData};
use crate::error::{ErrorKind, Result};
use crate::output::{SchedulerOutput, Tag};
use crate::pool::{new_chunk_pool, ChunkHandle, ChunkReader, ChunkWriter};
use crate::rapid_block::{RapidBlockEngine, RapidBlockStep};
use crate::realignment::RealignmentStage;
use crate::status::ErrorLog;
use crate::streaming::{Poller, StreamingEngine, StreamingStep};
use crate::tags::{TriggerTag, TimingEvent};
use crate::timing_queue::TimingMessageQueue;

/// Default realignment tolerances, applied until overridden via
/// [`Digitizer::set_realignment_tolerances`]. Matches the original driver's defaults of 1ms
/// matching tolerance and 1s max buffer time.
const DEFAULT_MATCHING_TOLERANCE_NS: i64 = 1_000_000;
const DEFAULT_MAX_BUFFER_TIME_NS: i64 = 1_000_000_000;

/// The block's lifecycle state, in the order §4.F fixes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Initialized,
    Configured,
    Armed,
    Disarmed,
    Closed,
}

/// What one [`Digitizer::work`] call produced.
pub enum WorkStep {
    /// A rapid-block window was produced on every enabled output.
    RapidBlock(RapidBlockData),
    /// A streaming chunk was dissected and delivered.
    Streaming(ChunkHandle),
    /// Nothing to deliver this call; call again.
    Yield,
    /// No further data will be produced.
    EndOfStream,
}

/// Owns one acquisition block end to end: driver handle, chunk pool, acquisition engine, timing
/// input, and realignment stage.
pub struct Digitizer {
    state: State,
    driver: Arc<Mutex<Box<dyn Driver>>>,
    config: Option<DigitizerConfig>,
    pool: Option<(ChunkWriter, ChunkReader)>,
    poller: Option<Poller>,
    rapid_block: RapidBlockEngine,
    streaming: StreamingEngine,
    timing: TimingMessageQueue,
    realignment: RealignmentStage,
    errors: ErrorLog,
}

impl Digitizer {
    /// Constructs a block in state `New`, bound to `driver` (§6: "a concrete driver is bound at
    /// construction").
    pub fn new(driver: Box<dyn Driver>) -> Self {
        Self {
            state: State::New,
            driver: Arc::new(Mutex::new(driver)),
            config: None,
            pool: None,
            poller: None,
            rapid_block: RapidBlockEngine::new(),
            streaming: StreamingEngine::new(),
            timing: TimingMessageQueue::new(),
            realignment: RealignmentStage::new(DEFAULT_MATCHING_TOLERANCE_NS, DEFAULT_MAX_BUFFER_TIME_NS),
            errors: ErrorLog::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    pub fn timing(&self) -> &TimingMessageQueue {
        &self.timing
    }

    /// Retunes the realignment stage's tolerances live, without tearing anything down.
    pub fn set_realignment_tolerances(&self, matching_tolerance_ns: i64, max_buffer_time_ns: i64) {
        self.realignment.set_matching_tolerance_ns(matching_tolerance_ns);
        self.realignment.set_max_buffer_time_ns(max_buffer_time_ns);
    }

    /// Queues a white-rabbit timing event for the realignment stage (§4.G), as if received on the
    /// block's asynchronous timing input.
    pub fn add_timing_event(&self, event: TimingEvent) -> bool {
        self.realignment.add_timing_event(event)
    }

    /// `start()` (§4.F): `Initialize -> Configure` and, in streaming mode, spawns the poll thread
    /// and (if `auto_arm`) arms. Configuration/validation failures are recorded to the error log
    /// and leave the block `Disarmed` rather than propagating as a panic or leaving the block
    /// half-built (§7).
    pub fn start(&mut self, config: DigitizerConfig) -> Result<()> {
        let result = self.try_start(config);
        if let Err(ref err) = result {
            self.errors.push(self.now(), err);
            self.state = State::Disarmed;
        }
        result
    }

    fn try_start(&mut self, config: DigitizerConfig) -> Result<()> {
        config.validate()?;

        self.driver.lock().unwrap().initialize(&config)?;
        self.state = State::Initialized;

        self.driver.lock().unwrap().configure()?;

        let layout = ChunkLayout {
            nr_channels: config.nr_enabled_channels(),
            nr_ports: config.nr_enabled_ports(),
            chunk_size: config.buffer_size,
        };
        let (writer, reader) = new_chunk_pool(layout, config.nr_buffers);

        if config.acquisition_mode == AcquisitionMode::Streaming {
            self.poller = Some(Poller::spawn(self.driver.clone(), writer.clone(), config.clone()));
        }
        self.pool = Some((writer, reader));
        self.state = State::Configured;

        let auto_arm = config.auto_arm;
        self.config = Some(config);

        if auto_arm {
            self.arm()?;
        } else {
            self.state = State::Disarmed;
        }
        Ok(())
    }

    /// Arms the driver (and, in streaming mode, the poll thread). Two successive calls are
    /// equivalent to one (§8).
    pub fn arm(&mut self) -> Result<()> {
        if self.state == State::Armed {
            return Ok(());
        }
        if self.config.is_none() {
            return Err(ErrorKind::InvalidState {
                message: "arm() called before start()".into(),
            });
        }
        self.driver.lock().unwrap().arm()?;
        if let Some(poller) = &self.poller {
            poller.run();
        }
        self.state = State::Armed;
        Ok(())
    }

    /// Disarms the driver (and, in streaming mode, pauses the poll thread). A no-op if already
    /// disarmed (§8). Tolerates driver errors: they are logged, never propagated (§7).
    pub fn disarm(&mut self) {
        if self.state != State::Armed {
            return;
        }
        if let Some(poller) = &self.poller {
            poller.pause();
        }
        if let Err(err) = self.driver.lock().unwrap().disarm() {
            self.errors.push(self.now(), &err);
        }
        self.state = State::Disarmed;
    }

    /// `stop()` (§4.F/§5): posts `Stopped` to wake a blocked work step, disarms, and stops the
    /// poll thread. Tolerant: never fails.
    pub fn stop(&mut self) {
        if let Some((writer, _)) = &self.pool {
            writer.post_error(ErrorKind::Stopped);
        }
        self.disarm();
        if let Some(poller) = self.poller.take() {
            poller.shutdown();
        }
    }

    /// Releases the driver (§4.B `close()`). Tolerates driver errors (§7).
    pub fn close(&mut self) {
        self.stop();
        if let Err(err) = self.driver.lock().unwrap().close() {
            self.errors.push(self.now(), &err);
        }
        self.state = State::Closed;
    }

    /// One scheduler work cycle, dispatching to the rapid-block or streaming engine per the
    /// configured acquisition mode, and realigning any trigger tag produced against the timing
    /// event stream before it reaches `output`.
    pub fn work(&mut self, output: &mut dyn SchedulerOutput) -> Result<WorkStep> {
        let config = self.config.clone().ok_or(ErrorKind::InvalidState {
            message: "work() called before start()".into(),
        })?;
        let now_ns = self.now_ns();
        let mut realigned = RealignmentOutput {
            inner: output,
            realignment: &self.realignment,
            held: None,
            now_ns,
        };

        let result = match config.acquisition_mode {
            AcquisitionMode::RapidBlock => {
                let mut driver = self.driver.lock().unwrap();
                let step = self.rapid_block.step(&mut **driver, &config, &self.timing, &mut realigned);
                drop(driver);
                step.map(|step| match step {
                    RapidBlockStep::Data(data) => WorkStep::RapidBlock(data),
                    RapidBlockStep::Yield => WorkStep::Yield,
                    RapidBlockStep::EndOfStream => WorkStep::EndOfStream,
                })
            }
            AcquisitionMode::Streaming => {
                let step = match self.pool.as_ref() {
                    Some((_, reader)) => {
                        self.streaming
                            .step(&self.driver, reader, &config, &self.timing, &mut realigned, &self.errors)
                    }
                    None => Err(ErrorKind::InvalidState {
                        message: "streaming work() called before a chunk pool was built".into(),
                    }),
                };
                step.map(|step| match step {
                    StreamingStep::Data(handle) => WorkStep::Streaming(handle),
                    StreamingStep::Yield => WorkStep::Yield,
                    StreamingStep::EndOfStream => WorkStep::EndOfStream,
                })
            }
        };

        // A step error here is a genuine driver/runtime failure, not a clean stop (both engines
        // already translate `Stopped` into `EndOfStream` internally), so it always belongs in the
        // error ring (§4.H, §7).
        if let Err(ref err) = result {
            self.errors.push(self.now(), err);
        }
        result
    }

    fn now(&self) -> Duration {
        Duration::from_nanos(self.now_ns().max(0) as u64)
    }

    fn now_ns(&self) -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i64
    }
}

/// Wraps a [`SchedulerOutput`] to run every [`Tag::Trigger`] through the realignment stage
/// before forwarding it, holding at most one trigger tag while it waits on a timing event
/// (§4.G: "return end-of-this-step, keep `t` for retry on next work call"). A held tag is
/// retried on the next `produce_each`/`add_tag` call, which happens at least once per
/// successfully delivered chunk or waveform window.
struct RealignmentOutput<'a> {
    inner: &'a mut dyn SchedulerOutput,
    realignment: &'a RealignmentStage,
    held: Option<(usize, TriggerTag)>,
    now_ns: i64,
}

impl RealignmentOutput<'_> {
    fn try_forward(&mut self, port: usize, mut tag: TriggerTag) {
        if self.realignment.fill_wr_stamp(&mut tag, self.now_ns) {
            self.inner.add_tag(port, Tag::Trigger(tag));
        } else {
            self.held = Some((port, tag));
        }
    }

    fn flush_held(&mut self) {
        if let Some((port, tag)) = self.held.take() {
            self.try_forward(port, tag);
        }
    }
}

impl SchedulerOutput for RealignmentOutput<'_> {
    fn produce_each(&mut self, n: usize) {
        self.flush_held();
        self.inner.produce_each(n);
    }

    fn add_tag(&mut self, port: usize, tag: Tag) {
        match tag {
            Tag::Trigger(t) => {
                self.flush_held();
                self.try_forward(port, t);
            }
            other => {
                self.flush_held();
                self.inner.add_tag(port, other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelSetting;
    use crate::driver::sim::SimDriver;
    use crate::output::RecordingOutput;
    use pretty_assertions::assert_eq;

    fn rapid_block_config() -> DigitizerConfig {
        DigitizerConfig {
            acquisition_mode: AcquisitionMode::RapidBlock,
            pre_samples: 500,
            post_samples: 2000,
            rapid_block_nr_captures: 1,
            sample_rate: 200_000.0,
            buffer_size: 8192,
            trigger_once: true,
            auto_arm: true,
            channels: vec![ChannelSetting {
                enabled: true,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn start_arms_automatically_when_auto_arm_is_set() {
        let mut driver = SimDriver::new();
        driver.set_data(vec![(0..2500).map(|v| v as f32).collect()], vec![]);
        let mut digitizer = Digitizer::new(Box::new(driver));

        digitizer.start(rapid_block_config()).unwrap();
        assert_eq!(digitizer.state(), State::Armed);
    }

    #[test]
    fn start_leaves_block_disarmed_when_auto_arm_is_false() {
        let mut digitizer = Digitizer::new(Box::new(SimDriver::new()));
        let mut config = rapid_block_config();
        config.auto_arm = false;
        digitizer.start(config).unwrap();
        assert_eq!(digitizer.state(), State::Disarmed);
    }

    #[test]
    fn invalid_config_is_recorded_and_leaves_block_disarmed() {
        let mut digitizer = Digitizer::new(Box::new(SimDriver::new()));
        let mut config = rapid_block_config();
        config.sample_rate = -1.0;
        assert!(digitizer.start(config).is_err());
        assert_eq!(digitizer.state(), State::Disarmed);
        assert_eq!(digitizer.errors().len(), 1);
    }

    #[test]
    fn second_arm_call_is_a_no_op() {
        let mut digitizer = Digitizer::new(Box::new(SimDriver::new()));
        let mut config = rapid_block_config();
        config.auto_arm = false;
        digitizer.start(config).unwrap();
        digitizer.arm().unwrap();
        digitizer.arm().unwrap();
        assert_eq!(digitizer.state(), State::Armed);
    }

    #[test]
    fn disarm_on_a_disarmed_block_is_a_no_op() {
        let mut digitizer = Digitizer::new(Box::new(SimDriver::new()));
        let mut config = rapid_block_config();
        config.auto_arm = false;
        digitizer.start(config).unwrap();
        digitizer.disarm();
        assert_eq!(digitizer.state(), State::Disarmed);
    }

    #[test]
    fn rapid_block_end_to_end_delivers_whole_waveform() {
        let mut driver = SimDriver::new();
        driver.set_data(vec![(0..2500).map(|v| v as f32).collect()], vec![]);
        let mut digitizer = Digitizer::new(Box::new(driver));
        digitizer.start(rapid_block_config()).unwrap();

        let mut output = RecordingOutput::default();
        let first = digitizer.work(&mut output).unwrap();
        assert!(matches!(first, WorkStep::Yield));
        let second = digitizer.work(&mut output).unwrap();
        let WorkStep::RapidBlock(data) = second else {
            panic!("expected rapid block data")
        };
        assert_eq!(data.ai_values[0].len(), 2500);
    }

    #[test]
    fn rapid_block_trigger_tag_is_realigned_against_a_timing_event_before_reaching_output() {
        let mut driver = SimDriver::new();
        driver.set_data(vec![(0..2500).map(|v| v as f32).collect()], vec![]);
        let mut digitizer = Digitizer::new(Box::new(driver));
        digitizer.start(rapid_block_config()).unwrap();
        digitizer.timing.push("trig".into(), 87_654_321, 0.0);
        digitizer.add_timing_event(TimingEvent {
            event_id: "wr0".into(),
            wr_trigger_stamp: 99_000_000,
            wr_trigger_stamp_utc: 87_654_321,
        });

        let mut output = RecordingOutput::default();
        digitizer.work(&mut output).unwrap(); // arm + stage
        digitizer.work(&mut output).unwrap(); // deliver waveform, trigger realigned

        let trigger_tags: Vec<_> = output
            .tags
            .iter()
            .filter_map(|(_, t)| if let Tag::Trigger(t) = t { Some(t) } else { None })
            .collect();
        assert_eq!(trigger_tags.len(), 1);
        assert_eq!(trigger_tags[0].timestamp_ns, 99_000_000);
        assert!(!trigger_tags[0].status.contains(crate::status::ChannelStatus::WR_TIMEOUT));
    }

    #[test]
    fn work_before_start_reports_invalid_state() {
        let mut digitizer = Digitizer::new(Box::new(SimDriver::new()));
        let mut output = RecordingOutput::default();
        assert!(matches!(digitizer.work(&mut output), Err(ErrorKind::InvalidState { .. })));
    }

    #[test]
    fn driver_error_during_streaming_work_is_recorded_to_the_error_log() {
        let mut digitizer = Digitizer::new(Box::new(SimDriver::new()));
        let config = DigitizerConfig {
            acquisition_mode: AcquisitionMode::Streaming,
            auto_arm: false,
            buffer_size: 4,
            channels: vec![ChannelSetting {
                enabled: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        digitizer.start(config).unwrap();
        digitizer
            .pool
            .as_ref()
            .unwrap()
            .0
            .post_error(ErrorKind::DriverError { message: "bus fault".into() });

        let mut output = RecordingOutput::default();
        assert!(matches!(digitizer.work(&mut output), Err(ErrorKind::DriverError { .. })));
        assert_eq!(digitizer.errors().len(), 1);
    }

    #[test]
    fn close_tears_down_and_never_panics_on_a_tolerant_driver() {
        let mut digitizer = Digitizer::new(Box::new(SimDriver::new()));
        let mut config = rapid_block_config();
        config.auto_arm = false;
        digitizer.start(config).unwrap();
        digitizer.close();
        assert_eq!(digitizer.state(), State::Closed);
    }
}
