//! The rapid-block acquisition engine (§4.D): captures a fixed `pre + post` sample window around
//! a trigger, once per waveform, driving the trait in [`crate::driver`] rather than the chunk
//! pool (rapid block has no continuous callback to pool against).
//!
//! [`RapidBlockEngine::step`] is called once per scheduler work cycle, mirroring the
//! `Waiting`/`ReadingPart1`/`ReadingRest` state machine of §4.D. The driver abstraction already
//! returns a whole waveform from a single [`crate::driver::Driver::read_rapid_block`] call
//! (rather than letting the caller request partial transfers), so this engine folds
//! `ReadingPart1`/`ReadingRest` into delivering that waveform to the scheduler in
//! `buffer_size`-sized windows across successive `step` calls, tagging only the window
//! containing the pre-trigger boundary — preserving "tag on first part, none after" without
//! requiring the driver trait to support partial block reads.

use crate::config::DigitizerConfig;
use crate::driver::{Driver, RapidBlockData};
use crate::error::Result;
use crate::output::{SchedulerOutput, Tag};
use crate::port_layout;
use crate::status::ChannelStatus;
use crate::tags::{TimebaseInfoTag, TriggerTag};
use crate::timing_queue::TimingMessageQueue;

/// What happened during one [`RapidBlockEngine::step`] call.
pub enum RapidBlockStep {
    /// A window of samples was produced on every enabled output.
    Data(RapidBlockData),
    /// Nothing was produced this call (e.g. an auto-arm retry is pending); call again.
    Yield,
    /// `trigger_once` was set and a trigger has already fired; no more data will be produced.
    EndOfStream,
}

enum Phase {
    Waiting,
    Reading {
        block: RapidBlockData,
        offset: usize,
        total: usize,
        tagged: bool,
    },
}

/// Per-waveform state machine driving rapid-block acquisition, initial state `Waiting`.
pub struct RapidBlockEngine {
    phase: Phase,
    waveform_idx: usize,
    waveform_count: usize,
    already_triggered: bool,
    total_samples_produced: u64,
    timebase_emitted: bool,
}

impl RapidBlockEngine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Waiting,
            waveform_idx: 0,
            waveform_count: 0,
            already_triggered: false,
            total_samples_produced: 0,
            timebase_emitted: false,
        }
    }

    /// Downsampled pre/post sample counts per §4.D's "pre/post counts exposed in tags are
    /// divided by k" rule.
    fn downsampled_pre_post(config: &DigitizerConfig) -> (usize, usize) {
        let factor = config.downsampling_factor.max(1);
        (config.pre_samples / factor, config.post_samples / factor)
    }

    pub fn step(
        &mut self,
        driver: &mut dyn Driver,
        config: &DigitizerConfig,
        timing: &TimingMessageQueue,
        output: &mut dyn SchedulerOutput,
    ) -> Result<RapidBlockStep> {
        if !self.timebase_emitted {
            let nr_channels = config.nr_enabled_channels();
            let nr_ports = config.nr_enabled_ports();
            let tag = TimebaseInfoTag {
                seconds_per_sample: config.time_per_sample_with_downsampling_ns() / 1.0e9,
            };
            for port in port_layout::all_ports(nr_channels, nr_ports) {
                output.add_tag(port, Tag::TimebaseInfo(tag));
            }
            self.timebase_emitted = true;
        }

        match self.phase {
            Phase::Waiting => self.begin_acquisition(driver, config),
            Phase::Reading { .. } => self.continue_reading(driver, config, timing, output),
        }
    }

    fn begin_acquisition(&mut self, driver: &mut dyn Driver, config: &DigitizerConfig) -> Result<RapidBlockStep> {
        if config.trigger_once && self.already_triggered {
            return Ok(RapidBlockStep::EndOfStream);
        }

        if config.auto_arm {
            // Tolerant: `disarm` on an unarmed driver must succeed per §4.F, so its error (if
            // any) is not fatal here either.
            let _ = driver.disarm();
            // Retry is the semantics (§9 open question): on error we simply stay in `Waiting`
            // and report the error to the caller, who is expected to call `step` again unless
            // `stop()` was requested meanwhile.
            driver.arm()?;
        }

        self.waveform_idx = 0;
        self.waveform_count = config.rapid_block_nr_captures.max(1);
        self.start_waveform(driver, config)?;
        Ok(RapidBlockStep::Yield)
    }

    fn start_waveform(&mut self, driver: &mut dyn Driver, config: &DigitizerConfig) -> Result<()> {
        driver.prefetch_block(self.waveform_idx)?;
        let block = driver.read_rapid_block(self.waveform_idx)?;
        let (pre_ds, post_ds) = Self::downsampled_pre_post(config);
        let total = pre_ds + post_ds;
        self.phase = Phase::Reading {
            block,
            offset: 0,
            total,
            tagged: false,
        };
        Ok(())
    }

    fn continue_reading(
        &mut self,
        driver: &mut dyn Driver,
        config: &DigitizerConfig,
        timing: &TimingMessageQueue,
        output: &mut dyn SchedulerOutput,
    ) -> Result<RapidBlockStep> {
        let Phase::Reading {
            ref block,
            ref mut offset,
            total,
            ref mut tagged,
        } = self.phase
        else {
            unreachable!("continue_reading called outside Reading phase")
        };

        let samples_left = total - *offset;
        let n = config.buffer_size.max(1).min(samples_left);
        let window = slice_block(block, *offset, n);

        let nr_channels = config.nr_enabled_channels();
        let nr_ports = config.nr_enabled_ports();
        let (pre_ds, post_ds) = Self::downsampled_pre_post(config);

        if !*tagged {
            let local_trigger_offset = pre_ds;
            let window_contains_trigger = local_trigger_offset >= *offset && local_trigger_offset < *offset + n;

            if window_contains_trigger {
                // Only consume the pending message once it is actually about to be attached to
                // a tag; otherwise a message that arrives before the trigger's window is reached
                // would be discarded while later windows still need it.
                if let Some(msg) = timing.pop_front() {
                    let split = local_trigger_offset - *offset;
                    if split > 0 {
                        output.produce_each(split);
                    }
                    let tag = TriggerTag {
                        name: msg.name.clone(),
                        timestamp_ns: msg.trigger_time_ns,
                        offset_ns: (pre_ds as i64) * (config.time_per_sample_with_downsampling_ns() as i64),
                        stream_offset: self.total_samples_produced + split as u64,
                        status: ChannelStatus::empty(),
                        pre_samples: pre_ds as u32,
                        post_samples: post_ds as u32,
                    };
                    for port in port_layout::trigger_target_ports(nr_channels, nr_ports) {
                        output.add_tag(port, Tag::Trigger(tag.clone()));
                    }
                    if n - split > 0 {
                        output.produce_each(n - split);
                    }
                    self.already_triggered = true;
                    *tagged = true;
                } else {
                    output.produce_each(n);
                }
            } else {
                output.produce_each(n);
                if local_trigger_offset < *offset {
                    // the trigger's window has already gone by without a message; stop retrying
                    // for this waveform.
                    *tagged = true;
                }
            }
        } else {
            output.produce_each(n);
        }

        self.total_samples_produced += n as u64;
        *offset += n;

        let waveform_done = *offset >= total;
        let result = RapidBlockStep::Data(window);

        if waveform_done {
            self.waveform_idx += 1;
            if self.waveform_idx >= self.waveform_count {
                self.phase = Phase::Waiting;
            } else {
                self.start_waveform(driver, config)?;
            }
        }

        Ok(result)
    }
}

impl Default for RapidBlockEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn slice_block(block: &RapidBlockData, start: usize, n: usize) -> RapidBlockData {
    RapidBlockData {
        ai_values: block.ai_values.iter().map(|c| c[start..start + n].to_vec()).collect(),
        ai_errors: block.ai_errors.iter().map(|c| c[start..start + n].to_vec()).collect(),
        port_words: block.port_words.iter().map(|p| p[start..start + n].to_vec()).collect(),
        status: block.status.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::SimDriver;
    use crate::output::RecordingOutput;
    use pretty_assertions::assert_eq;

    fn config() -> DigitizerConfig {
        DigitizerConfig {
            pre_samples: 500,
            post_samples: 2000,
            rapid_block_nr_captures: 1,
            sample_rate: 200_000.0,
            buffer_size: 8192,
            trigger_once: true,
            auto_arm: true,
            channels: vec![crate::config::ChannelSetting {
                enabled: true,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn single_waveform_produces_exactly_pre_plus_post_samples() {
        let config = config();
        let mut driver = SimDriver::new();
        driver.initialize(&config).unwrap();
        driver.set_data(vec![(0..2500).map(|v| v as f32).collect()], vec![]);

        let mut engine = RapidBlockEngine::new();
        let timing = TimingMessageQueue::new();
        timing.push("trig".into(), 87_654_321, 0.0);
        let mut output = RecordingOutput::default();

        // first step: arms and stages the waveform, yields.
        let step = engine.step(&mut driver, &config, &timing, &mut output).unwrap();
        assert!(matches!(step, RapidBlockStep::Yield));

        // second step: whole waveform fits in one buffer_size window.
        let step = engine.step(&mut driver, &config, &timing, &mut output).unwrap();
        let RapidBlockStep::Data(data) = step else {
            panic!("expected data")
        };
        assert_eq!(data.ai_values[0].len(), 2500);

        assert_eq!(output.produced.iter().sum::<usize>(), 2500);
        assert_eq!(output.tags.len(), 1);
        let (_, Tag::Trigger(tag)) = &output.tags[0] else {
            panic!("expected trigger tag")
        };
        assert_eq!(tag.timestamp_ns, 87_654_321);
        assert_eq!(tag.pre_samples, 500);
        assert_eq!(tag.post_samples, 2000);
    }

    #[test]
    fn trigger_once_ends_the_stream_after_one_waveform() {
        let config = config();
        let mut driver = SimDriver::new();
        driver.initialize(&config).unwrap();
        driver.set_data(vec![(0..5000).map(|v| v as f32).collect()], vec![]);

        let mut engine = RapidBlockEngine::new();
        let timing = TimingMessageQueue::new();
        let mut output = RecordingOutput::default();

        engine.step(&mut driver, &config, &timing, &mut output).unwrap(); // arm + stage
        engine.step(&mut driver, &config, &timing, &mut output).unwrap(); // deliver waveform 0

        let step = engine.step(&mut driver, &config, &timing, &mut output).unwrap();
        assert!(matches!(step, RapidBlockStep::EndOfStream));
    }

    #[test]
    fn multiple_waveforms_each_get_their_own_trigger_tag() {
        let mut config = config();
        config.trigger_once = false;
        config.rapid_block_nr_captures = 2;
        let mut driver = SimDriver::new();
        driver.initialize(&config).unwrap();
        driver.set_data(vec![(0..5000).map(|v| v as f32).collect()], vec![]);

        let mut engine = RapidBlockEngine::new();
        let timing = TimingMessageQueue::new();
        timing.push("a".into(), 1, 0.0);
        timing.push("b".into(), 2, 0.0);
        let mut output = RecordingOutput::default();

        engine.step(&mut driver, &config, &timing, &mut output).unwrap(); // arm
        engine.step(&mut driver, &config, &timing, &mut output).unwrap(); // waveform 0
        engine.step(&mut driver, &config, &timing, &mut output).unwrap(); // waveform 1 (re-arms internally)

        assert_eq!(output.tags.len(), 2);
    }

    #[test]
    fn trigger_tag_survives_into_a_later_window_than_the_first() {
        let mut config = config();
        config.pre_samples = 10_000;
        config.post_samples = 2000;
        config.buffer_size = 4096;
        let mut driver = SimDriver::new();
        driver.initialize(&config).unwrap();
        driver.set_data(vec![(0..12_000).map(|v| v as f32).collect()], vec![]);

        let mut engine = RapidBlockEngine::new();
        let timing = TimingMessageQueue::new();
        timing.push("trig".into(), 42, 0.0);
        let mut output = RecordingOutput::default();

        engine.step(&mut driver, &config, &timing, &mut output).unwrap(); // arm + stage
        // pre_samples=10_000 falls in the third 4096-sample window; the first two windows must
        // not discard the pending timing message.
        engine.step(&mut driver, &config, &timing, &mut output).unwrap();
        engine.step(&mut driver, &config, &timing, &mut output).unwrap();
        engine.step(&mut driver, &config, &timing, &mut output).unwrap();

        assert_eq!(output.tags.len(), 1);
        let (_, Tag::Trigger(tag)) = &output.tags[0] else {
            panic!("expected trigger tag")
        };
        assert_eq!(tag.timestamp_ns, 42);
    }

    #[test]
    fn no_pending_timing_message_still_produces_samples_untagged() {
        let config = config();
        let mut driver = SimDriver::new();
        driver.initialize(&config).unwrap();
        driver.set_data(vec![(0..2500).map(|v| v as f32).collect()], vec![]);

        let mut engine = RapidBlockEngine::new();
        let timing = TimingMessageQueue::new();
        let mut output = RecordingOutput::default();

        engine.step(&mut driver, &config, &timing, &mut output).unwrap();
        engine.step(&mut driver, &config, &timing, &mut output).unwrap();

        assert_eq!(output.produced.iter().sum::<usize>(), 2500);
        assert!(output.tags.is_empty());
    }
}
