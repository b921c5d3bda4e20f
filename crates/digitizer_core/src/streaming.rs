//! The streaming acquisition engine (§4.E): a poll thread that pulls samples from the driver into
//! the chunk pool, and a work step that dissects published chunks, finds trigger edges, pairs
//! them with inline timing messages, and emits tags to the scheduler.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use digitizer_sync::running_average::RunningAverage;

use crate::chunk::DataChunk;
use crate::config::{DigitizerConfig, TriggerSource};
use crate::driver::Driver;
use crate::error::{ErrorKind, Result};
use crate::output::{SchedulerOutput, Tag};
use crate::pool::{ChunkHandle, ChunkReader, ChunkWriter};
use crate::port_layout;
use crate::status::{ChannelStatus, ErrorLog};
use crate::tags::{AcqInfoTag, TimebaseInfoTag, TimingMessage, TriggerTag};
use crate::timing_queue::TimingMessageQueue;
use crate::trigger::{self, TriggerDetector};

/// Width (in poll iterations) of the running-average window the watchdog bases its sample-rate
/// estimate on.
const WATCHDOG_AVERAGE_WINDOW: usize = 16;

/// How many poll-loop iterations pass between checks of the pend/ack handshake (§4.E: "every 10
/// loop iterations, reload the poller state").
const ACK_CHECK_INTERVAL: u64 = 10;

/// Poll-thread teardown's hard timeout (§5): if the poll thread hasn't acknowledged `PendExit`
/// within this long, [`Poller::shutdown`] joins it regardless.
const POLL_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The poll thread's state machine (§3), mirroring the original's `poller_state_t`. A `Pend*`
/// variant is a request the owning thread makes of the poll thread; the poll thread acknowledges
/// by moving to the matching non-pend state and notifying the condvar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Running,
    PendIdle,
    PendExit,
    Exit,
}

struct PollerShared {
    state: Mutex<PollerState>,
    cv: Condvar,
}

/// Owns the streaming poll thread: repeatedly calls [`Driver::poll`], hands successful polls to
/// the chunk pool, and runs the sample-rate watchdog (§4.E).
pub struct Poller {
    shared: Arc<PollerShared>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Spawns the poll thread in [`PollerState::Idle`]. Call [`Self::run`] to start polling.
    pub fn spawn(driver: Arc<Mutex<Box<dyn Driver>>>, pool: ChunkWriter, config: DigitizerConfig) -> Self {
        let shared = Arc::new(PollerShared {
            state: Mutex::new(PollerState::Idle),
            cv: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("digitizer-poll".into())
            .spawn(move || poll_thread_main(thread_shared, driver, pool, config))
            .expect("failed to spawn streaming poll thread");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn state(&self) -> PollerState {
        *self.shared.state.lock().unwrap()
    }

    /// Moves `Idle -> Running`. A no-op if already running.
    pub fn run(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if *state == PollerState::Idle {
            *state = PollerState::Running;
            self.shared.cv.notify_all();
        }
    }

    /// Requests the poll thread park in `Idle`, blocking the caller until it acknowledges.
    pub fn pause(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state == PollerState::Running {
                *state = PollerState::PendIdle;
                self.shared.cv.notify_all();
            }
        }
        let mut state = self.shared.state.lock().unwrap();
        while !matches!(*state, PollerState::Idle) {
            state = self.shared.cv.wait(state).unwrap();
        }
    }

    /// Requests the poll thread exit and joins it, consuming the [`Poller`]. Waits up to
    /// [`POLL_TEARDOWN_TIMEOUT`] for acknowledgment before joining unconditionally (§5).
    pub fn shutdown(mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            *state = PollerState::PendExit;
            self.shared.cv.notify_all();
        }
        let deadline = Instant::now() + POLL_TEARDOWN_TIMEOUT;
        let mut state = self.shared.state.lock().unwrap();
        while !matches!(*state, PollerState::Exit) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (next, result) = self.shared.cv.wait_timeout(state, deadline - now).unwrap();
            state = next;
            if result.timed_out() {
                break;
            }
        }
        drop(state);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn poll_thread_main(shared: Arc<PollerShared>, driver: Arc<Mutex<Box<dyn Driver>>>, pool: ChunkWriter, config: DigitizerConfig) {
    let mut avg = RunningAverage::new(WATCHDOG_AVERAGE_WINDOW);
    let mut pending_lost: u32 = 0;
    let mut watchdog_active = false;
    let mut iterations: u64 = 0;
    let poll_period = Duration::from_secs_f64(config.streaming_mode_poll_rate.max(0.0));

    'outer: loop {
        {
            let mut state = shared.state.lock().unwrap();
            while *state == PollerState::Idle {
                state = shared.cv.wait(state).unwrap();
            }
            if matches!(*state, PollerState::Exit | PollerState::PendExit) {
                *state = PollerState::Exit;
                shared.cv.notify_all();
                return;
            }
        }

        loop {
            let loop_start = Instant::now();

            let samples_this_iter = match driver.lock().unwrap().poll() {
                Ok(Some(data)) => {
                    let n = data
                        .ai_values
                        .first()
                        .map(|c| c.len())
                        .or_else(|| data.port_words.first().map(|p| p.len()))
                        .unwrap_or(0);
                    ingest_streaming_data(&pool, &mut pending_lost, data);
                    n
                }
                Ok(None) => 0,
                Err(err) => {
                    log::error!("streaming driver poll failed: {err}");
                    pool.post_error(err);
                    0
                }
            };

            iterations += 1;
            let elapsed_s = loop_start.elapsed().as_secs_f64().max(f64::EPSILON);
            avg.add(samples_this_iter as f64 / elapsed_s);

            if iterations >= WATCHDOG_AVERAGE_WINDOW as u64 {
                let healthy = avg.get_avg_value() >= 0.75 * config.sample_rate;
                if !healthy && !watchdog_active {
                    watchdog_active = true;
                    log::warn!(
                        "streaming watchdog: observed rate {:.1}Hz below 75% of configured {:.1}Hz",
                        avg.get_avg_value(),
                        config.sample_rate
                    );
                    pool.post_error(ErrorKind::Watchdog);
                } else if healthy {
                    watchdog_active = false;
                }
            }

            if iterations % ACK_CHECK_INTERVAL == 0 {
                let mut state = shared.state.lock().unwrap();
                match *state {
                    PollerState::PendIdle => {
                        *state = PollerState::Idle;
                        shared.cv.notify_all();
                        break;
                    }
                    PollerState::PendExit => {
                        *state = PollerState::Exit;
                        shared.cv.notify_all();
                        continue 'outer;
                    }
                    _ => {}
                }
            }

            let elapsed = loop_start.elapsed();
            if elapsed < poll_period {
                thread::sleep(poll_period - elapsed);
            }
        }
    }
}

/// Copies one poll's worth of driver data into a free chunk and publishes it, mirroring the
/// original's streaming sample callback (§4.E). If no chunk is free, the loss is attributed to
/// whichever chunk is successfully published next (§8: "a missed free chunk ... is surfaced once
/// on the next successful chunk").
fn ingest_streaming_data(pool: &ChunkWriter, pending_lost: &mut u32, data: crate::driver::StreamingData) {
    let Some(mut free) = pool.take_free() else {
        *pending_lost += 1;
        return;
    };

    let chunk = free.chunk_mut();
    chunk.reset();
    for (c, values) in data.ai_values.iter().enumerate() {
        chunk.ai_values_mut(c)[..values.len()].copy_from_slice(values);
    }
    for (c, errors) in data.ai_errors.iter().enumerate() {
        chunk.ai_errors_mut(c)[..errors.len()].copy_from_slice(errors);
    }
    for (p, words) in data.port_words.iter().enumerate() {
        chunk.port_words_mut(p)[..words.len()].copy_from_slice(words);
    }
    for (c, &overflowed) in data.overflow.iter().enumerate() {
        if overflowed {
            chunk.status[c] |= ChannelStatus::OVERFLOW;
        }
    }
    chunk.local_timestamp = Duration::from_nanos(data.local_timestamp_ns.max(0) as u64);
    chunk.lost_count = *pending_lost + data.lost_count;
    *pending_lost = 0;

    free.publish();
}

/// What happened during one [`StreamingEngine::step`] call.
pub enum StreamingStep {
    /// A chunk was dissected and delivered; tags for it have already been emitted to `output`.
    Data(ChunkHandle),
    /// Nothing to deliver this call (no chunk ready yet, a watchdog rearm is in flight, or
    /// triggers within the pending chunk are still waiting on timing messages); call again.
    Yield,
    /// The engine was stopped; no further data will be produced.
    EndOfStream,
}

struct PendingChunk {
    handle: ChunkHandle,
    offsets: Vec<usize>,
}

/// The work step of §4.E: dissects published chunks, detects trigger edges, pairs them with
/// timing messages, and emits the tag stream. Called once per scheduler work cycle.
pub struct StreamingEngine {
    detector: TriggerDetector,
    pending: Option<PendingChunk>,
    total_samples_produced: u64,
    timebase_emitted: bool,
    already_triggered: bool,
}

impl StreamingEngine {
    pub fn new() -> Self {
        Self {
            detector: TriggerDetector::new(),
            pending: None,
            total_samples_produced: 0,
            timebase_emitted: false,
            already_triggered: false,
        }
    }

    pub fn step(
        &mut self,
        driver: &Arc<Mutex<Box<dyn Driver>>>,
        reader: &ChunkReader,
        config: &DigitizerConfig,
        timing: &TimingMessageQueue,
        output: &mut dyn SchedulerOutput,
        errors: &ErrorLog,
    ) -> Result<StreamingStep> {
        self.emit_timebase_tag_once(config, output);

        let mut pending = match self.pending.take() {
            Some(p) => p,
            None => match self.fetch_next_chunk(driver, reader, config, errors) {
                Ok(Some(p)) => p,
                Ok(None) => return Ok(StreamingStep::Yield),
                Err(ErrorKind::Stopped) => return Ok(StreamingStep::EndOfStream),
                Err(other) => return Err(other),
            },
        };

        if pending.offsets.len() > timing.len() {
            self.pending = Some(pending);
            return Ok(StreamingStep::Yield);
        }

        let chunk_samples = pending.handle.chunk().layout().chunk_size;
        self.emit_trigger_tags(&mut pending.offsets, chunk_samples, config, timing, output);
        self.emit_acq_info_tag(pending.handle.chunk(), config, output);

        let lost_count = pending.handle.chunk().lost_count;
        if lost_count > 0 {
            log::error!("streaming chunk lost {lost_count} buffer(s) since the previous delivery");
            errors.push(now(), &ErrorKind::BuffersLost { count: lost_count });
        }

        Ok(StreamingStep::Data(pending.handle))
    }

    fn fetch_next_chunk(
        &mut self,
        driver: &Arc<Mutex<Box<dyn Driver>>>,
        reader: &ChunkReader,
        config: &DigitizerConfig,
        errors: &ErrorLog,
    ) -> Result<Option<PendingChunk>> {
        match reader.wait_ready() {
            Ok(()) => {}
            Err(ErrorKind::Stopped) => return Err(ErrorKind::Stopped),
            Err(ErrorKind::Watchdog) => {
                errors.push(now(), &ErrorKind::Watchdog);
                let mut d = driver.lock().unwrap();
                let _ = d.disarm();
                d.arm()?;
                return Ok(None);
            }
            Err(other) => return Err(other),
        }

        let Some(handle) = reader.take_filled() else {
            return Ok(None);
        };

        let offsets = self.find_trigger_offsets(handle.chunk(), config);
        Ok(Some(PendingChunk { handle, offsets }))
    }

    fn find_trigger_offsets(&mut self, chunk: &DataChunk, config: &DigitizerConfig) -> Vec<usize> {
        if !config.trigger.is_enabled() || (config.trigger_once && self.already_triggered) {
            return Vec::new();
        }

        match config.trigger.source {
            TriggerSource::None => Vec::new(),
            TriggerSource::Analog(raw_idx) => {
                let Some(pos) = config.enabled_channel_position(raw_idx) else {
                    return Vec::new();
                };
                let band = config.channels[raw_idx].range / 100.0;
                self.detector
                    .find_triggers(chunk.ai_values(pos), config.trigger.threshold, config.trigger.direction, band)
            }
            TriggerSource::Aux => {
                // No dedicated AUX channel exists in the chunk layout (§9 open question); the
                // driver is trusted to reject this at `configure()` on hardware without one.
                log::warn!("trigger source AUX has no corresponding chunk data; no edges detected");
                Vec::new()
            }
            TriggerSource::Digital(pin) => {
                let raw_port = pin as usize / 8;
                let Some(pos) = config.enabled_port_position(raw_port) else {
                    return Vec::new();
                };
                let bit = pin % 8;
                let samples = trigger::extract_pin(chunk.port_words(pos), bit);
                self.detector.find_triggers(&samples, 0.5, config.trigger.direction, 0.0)
            }
        }
    }

    fn emit_trigger_tags(
        &mut self,
        offsets: &mut [usize],
        chunk_samples: usize,
        config: &DigitizerConfig,
        timing: &TimingMessageQueue,
        output: &mut dyn SchedulerOutput,
    ) {
        let nr_channels = config.nr_enabled_channels();
        let nr_ports = config.nr_enabled_ports();
        let targets = port_layout::trigger_target_ports(nr_channels, nr_ports);

        if !offsets.is_empty() {
            offsets.sort_unstable();
            let mut produced = 0usize;
            for &offset in offsets.iter() {
                let msg = timing
                    .pop_front()
                    .expect("caller already checked offsets.len() <= timing.len()");
                let tag = build_trigger_tag(&msg, self.total_samples_produced + offset as u64, config);
                if offset > produced {
                    output.produce_each(offset - produced);
                }
                for &port in &targets {
                    output.add_tag(port, Tag::Trigger(tag.clone()));
                }
                produced = offset;
                self.already_triggered = true;
            }
            output.produce_each(chunk_samples - produced);
        } else {
            if let Some(msg) = timing.peek_back() {
                let tag = build_trigger_tag(&msg, self.total_samples_produced, config);
                for &port in &targets {
                    output.add_tag(port, Tag::Trigger(tag.clone()));
                }
            }
            output.produce_each(chunk_samples);
        }

        self.total_samples_produced += chunk_samples as u64;
    }

    fn emit_acq_info_tag(&self, chunk: &DataChunk, config: &DigitizerConfig, output: &mut dyn SchedulerOutput) {
        let nr_channels = config.nr_enabled_channels();
        let nr_ports = config.nr_enabled_ports();

        let mut status = ChannelStatus::empty();
        for c in 0..nr_channels {
            status |= chunk.channel_status(c);
        }
        for p in 0..nr_ports {
            status |= chunk.port_status(p);
        }
        if chunk.lost_count > 0 {
            status |= ChannelStatus::BUFFERS_LOST;
        }

        let tag = AcqInfoTag {
            timestamp_ns: chunk.local_timestamp.as_nanos() as i64,
            timebase_s: config.time_per_sample_with_downsampling_ns() / 1.0e9,
            user_delay_s: 0.0,
            actual_delay_s: 0.0,
            status,
        };
        for port in port_layout::all_ports(nr_channels, nr_ports) {
            output.add_tag(port, Tag::AcqInfo(tag));
        }
    }

    fn emit_timebase_tag_once(&mut self, config: &DigitizerConfig, output: &mut dyn SchedulerOutput) {
        if self.timebase_emitted {
            return;
        }
        let tag = TimebaseInfoTag {
            seconds_per_sample: config.time_per_sample_with_downsampling_ns() / 1.0e9,
        };
        for port in port_layout::all_ports(config.nr_enabled_channels(), config.nr_enabled_ports()) {
            output.add_tag(port, Tag::TimebaseInfo(tag));
        }
        self.timebase_emitted = true;
    }
}

impl Default for StreamingEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock timestamp for error-log entries raised from inside the engine, which has no access
/// to the monotonic clock the owning [`crate::lifecycle::Digitizer`] uses for its own records.
fn now() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

fn build_trigger_tag(msg: &TimingMessage, stream_offset: u64, config: &DigitizerConfig) -> TriggerTag {
    let factor = config.downsampling_factor.max(1);
    TriggerTag {
        name: msg.name.clone(),
        timestamp_ns: msg.trigger_time_ns,
        offset_ns: msg.trigger_offset_ns,
        stream_offset,
        status: ChannelStatus::empty(),
        pre_samples: (config.pre_samples / factor) as u32,
        post_samples: (config.post_samples / factor) as u32,
    }
}
