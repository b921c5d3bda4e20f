//! Configuration types and their construction-time validation.
//!
//! Parsing configuration out of some external representation (a file, a CLI, an RPC message)
//! is out of scope here; these types assume the values have already been parsed and only
//! validate that they are internally consistent.

use crate::error::{ErrorKind, Result};

/// Hard upper bound on simultaneously enabled analog channels, matching the original driver's
/// `MAX_SUPPORTED_AI_CHANNELS`.
pub const MAX_AI_CHANNELS: usize = 16;

/// Hard upper bound on simultaneously enabled digital ports, matching the original driver's
/// `MAX_SUPPORTED_PORTS`.
pub const MAX_PORTS: usize = 8;

/// Input coupling mode for an analog channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coupling {
    Ac1M,
    Dc1M,
    Dc50,
}

/// Configuration of a single analog input channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSetting {
    pub range: f32,
    pub offset: f32,
    pub enabled: bool,
    pub coupling: Coupling,
}

impl Default for ChannelSetting {
    fn default() -> Self {
        Self {
            range: 2.0,
            offset: 0.0,
            enabled: false,
            coupling: Coupling::Ac1M,
        }
    }
}

/// Configuration of a single digital port (a group of logic-level inputs).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortSetting {
    pub logic_level: f32,
    pub enabled: bool,
}

impl Default for PortSetting {
    fn default() -> Self {
        Self {
            logic_level: 1.5,
            enabled: false,
        }
    }
}

/// Direction a trigger edge must cross its threshold in to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDirection {
    Rising,
    Falling,
    High,
    Low,
}

/// Which signal the trigger compares against its threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSource {
    /// No trigger; every chunk is passed through untouched. Corresponds to the sentinel source
    /// string `"NONE"`.
    None,
    /// An analog channel, by index into the configured channel list. Corresponds to a single
    /// letter `'A'..='P'` source string.
    Analog(usize),
    /// The external auxiliary input, source string `"AUX"`. Treated like an analog source for
    /// direction/threshold purposes; the driver is trusted to reject this at `configure()` on
    /// hardware without an AUX input (§9 open question).
    Aux,
    /// A digital pin, by bit position within its port. Corresponds to source string `"DI"`.
    Digital(u8),
}

/// Parses a trigger source string per §4.F/§3: `"NONE"`, `"AUX"`, `"DI"`, or a single analog
/// channel letter `'A'..='P'`.
pub fn parse_trigger_source(s: &str) -> Result<TriggerSource> {
    match s {
        "NONE" => Ok(TriggerSource::None),
        "AUX" => Ok(TriggerSource::Aux),
        "DI" => Ok(TriggerSource::Digital(0)),
        _ => parse_analog_channel_id(s).map(TriggerSource::Analog),
    }
}

/// Parses an analog channel id: a single letter `'A'..='P'`, mapped to index `id - 'A'`.
pub fn parse_analog_channel_id(s: &str) -> Result<usize> {
    let mut chars = s.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        return Err(ErrorKind::InvalidConfig {
            message: format!("'{s}' is not a single-letter analog channel id"),
        });
    };
    if !('A'..='P').contains(&c) {
        return Err(ErrorKind::InvalidConfig {
            message: format!("analog channel id '{c}' out of range 'A'..='P'"),
        });
    }
    Ok(c as usize - 'A' as usize)
}

/// Parses a digital port id: `"portN"` with a single decimal digit `0..=7`.
pub fn parse_port_id(s: &str) -> Result<usize> {
    let digit = s.strip_prefix("port").and_then(|rest| rest.parse::<usize>().ok());
    match digit {
        Some(n) if n <= 7 => Ok(n),
        _ => Err(ErrorKind::InvalidConfig {
            message: format!("'{s}' is not a valid port id (expected \"port0\".. \"port7\")"),
        }),
    }
}

/// Trigger configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSetting {
    pub source: TriggerSource,
    pub threshold: f32,
    pub direction: TriggerDirection,
}

impl Default for TriggerSetting {
    fn default() -> Self {
        Self {
            source: TriggerSource::None,
            threshold: 0.0,
            direction: TriggerDirection::Rising,
        }
    }
}

impl TriggerSetting {
    pub fn is_enabled(&self) -> bool {
        !matches!(self.source, TriggerSource::None)
    }

    pub fn is_analog(&self) -> bool {
        matches!(self.source, TriggerSource::Analog(_) | TriggerSource::Aux)
    }

    pub fn is_digital(&self) -> bool {
        matches!(self.source, TriggerSource::Digital(_))
    }
}

/// Whether a capture runs once per `start()` call (rapid block) or continuously (streaming).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    Streaming,
    RapidBlock,
}

/// How incoming samples are reduced before being handed to the chunk pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownsamplingMode {
    None,
    Decimate,
    Average,
    MinMaxAgg,
}

/// Full configuration for a [`crate::lifecycle::Digitizer`], mirroring the original driver's
/// `digitizer_args`.
#[derive(Debug, Clone)]
pub struct DigitizerConfig {
    pub sample_rate: f64,
    pub buffer_size: usize,
    pub nr_buffers: usize,
    pub driver_buffer_size: usize,
    pub pre_samples: usize,
    pub post_samples: usize,
    pub acquisition_mode: AcquisitionMode,
    pub rapid_block_nr_captures: usize,
    pub streaming_mode_poll_rate: f64,
    pub downsampling_mode: DownsamplingMode,
    pub downsampling_factor: usize,
    pub auto_arm: bool,
    pub trigger_once: bool,
    pub channels: Vec<ChannelSetting>,
    pub ports: Vec<PortSetting>,
    pub trigger: TriggerSetting,
}

impl Default for DigitizerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 10_000.0,
            buffer_size: 8192,
            nr_buffers: 100,
            driver_buffer_size: 100_000,
            pre_samples: 1000,
            post_samples: 9000,
            acquisition_mode: AcquisitionMode::Streaming,
            rapid_block_nr_captures: 1,
            streaming_mode_poll_rate: 0.001,
            downsampling_mode: DownsamplingMode::None,
            downsampling_factor: 1,
            auto_arm: true,
            trigger_once: false,
            channels: Vec::new(),
            ports: Vec::new(),
            trigger: TriggerSetting::default(),
        }
    }
}

impl DigitizerConfig {
    /// Validates internal consistency. Called by `configure`/`start`; never panics on bad input,
    /// only returns `ErrorKind::InvalidConfig`.
    pub fn validate(&self) -> Result<()> {
        if self.channels.len() > MAX_AI_CHANNELS {
            return Err(ErrorKind::InvalidConfig {
                message: format!(
                    "{} channels configured, maximum is {MAX_AI_CHANNELS}",
                    self.channels.len()
                ),
            });
        }
        if self.ports.len() > MAX_PORTS {
            return Err(ErrorKind::InvalidConfig {
                message: format!("{} ports configured, maximum is {MAX_PORTS}", self.ports.len()),
            });
        }
        if self.sample_rate <= 0.0 {
            return Err(ErrorKind::InvalidConfig {
                message: "sample_rate must be positive".into(),
            });
        }
        if self.buffer_size == 0 {
            return Err(ErrorKind::InvalidConfig {
                message: "buffer_size must be nonzero".into(),
            });
        }
        if matches!(self.downsampling_mode, DownsamplingMode::None) {
            if self.downsampling_factor != 1 {
                return Err(ErrorKind::InvalidConfig {
                    message: "downsampling_factor must be 1 when downsampling_mode is None".into(),
                });
            }
        } else if self.downsampling_factor < 2 {
            return Err(ErrorKind::InvalidConfig {
                message: "downsampling_factor must be >= 2 when downsampling is enabled".into(),
            });
        }
        if self.nr_buffers == 0 {
            return Err(ErrorKind::InvalidConfig {
                message: "nr_buffers must be at least 1".into(),
            });
        }
        if self.driver_buffer_size == 0 {
            return Err(ErrorKind::InvalidConfig {
                message: "driver_buffer_size must be at least 1".into(),
            });
        }
        if self.streaming_mode_poll_rate < 0.0 {
            return Err(ErrorKind::InvalidConfig {
                message: "streaming_mode_poll_rate must not be negative".into(),
            });
        }
        if self.acquisition_mode == AcquisitionMode::RapidBlock {
            if self.rapid_block_nr_captures == 0 {
                return Err(ErrorKind::InvalidConfig {
                    message: "rapid_block_nr_captures must be nonzero in rapid block mode".into(),
                });
            }
            if self.post_samples < 1 {
                return Err(ErrorKind::InvalidConfig {
                    message: "post_samples must be at least 1 in rapid block mode".into(),
                });
            }
        }
        if let TriggerSource::Analog(idx) = self.trigger.source {
            if idx >= self.channels.len() || !self.channels[idx].enabled {
                return Err(ErrorKind::InvalidConfig {
                    message: format!("trigger references analog channel {idx}, which is not enabled"),
                });
            }
        }
        if let TriggerSource::Digital(pin) = self.trigger.source {
            if pin as usize >= self.ports.len() * 8 {
                return Err(ErrorKind::InvalidConfig {
                    message: format!("trigger references digital pin {pin}, out of range"),
                });
            }
        }
        Ok(())
    }

    pub fn nr_enabled_channels(&self) -> usize {
        self.channels.iter().filter(|c| c.enabled).count()
    }

    pub fn nr_enabled_ports(&self) -> usize {
        self.ports.iter().filter(|p| p.enabled).count()
    }

    /// Maps a raw index into `channels` to its position among only the *enabled* channels, i.e.
    /// the channel index a [`crate::chunk::DataChunk`] actually stores data under. `None` if the
    /// channel at `raw_idx` doesn't exist or isn't enabled.
    pub fn enabled_channel_position(&self, raw_idx: usize) -> Option<usize> {
        if !self.channels.get(raw_idx)?.enabled {
            return None;
        }
        Some(self.channels[..raw_idx].iter().filter(|c| c.enabled).count())
    }

    /// Maps a raw index into `ports` to its position among only the *enabled* ports. `None` if
    /// the port at `raw_idx` doesn't exist or isn't enabled.
    pub fn enabled_port_position(&self, raw_idx: usize) -> Option<usize> {
        if !self.ports.get(raw_idx)?.enabled {
            return None;
        }
        Some(self.ports[..raw_idx].iter().filter(|p| p.enabled).count())
    }

    /// Nanoseconds per output sample after downsampling, used to convert pre-trigger sample
    /// counts into a timestamp offset.
    pub fn time_per_sample_with_downsampling_ns(&self) -> f64 {
        (1.0e9 / self.sample_rate) * self.downsampling_factor as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_original_driver_defaults() {
        let cfg = DigitizerConfig::default();
        assert_eq!(cfg.sample_rate, 10_000.0);
        assert_eq!(cfg.buffer_size, 8192);
        assert_eq!(cfg.pre_samples, 1000);
        assert_eq!(cfg.post_samples, 9000);
        assert!(cfg.auto_arm);
        assert!(!cfg.trigger_once);
    }

    #[test]
    fn rejects_too_many_channels() {
        let mut cfg = DigitizerConfig::default();
        cfg.channels = vec![ChannelSetting::default(); MAX_AI_CHANNELS + 1];
        assert!(matches!(cfg.validate(), Err(ErrorKind::InvalidConfig { .. })));
    }

    #[test]
    fn rejects_trigger_on_disabled_channel() {
        let mut cfg = DigitizerConfig::default();
        cfg.channels = vec![ChannelSetting::default()];
        cfg.trigger.source = TriggerSource::Analog(0);
        assert!(matches!(cfg.validate(), Err(ErrorKind::InvalidConfig { .. })));
    }

    #[test]
    fn accepts_trigger_on_enabled_channel() {
        let mut cfg = DigitizerConfig::default();
        cfg.channels = vec![ChannelSetting {
            enabled: true,
            ..Default::default()
        }];
        cfg.trigger.source = TriggerSource::Analog(0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_downsampling_factor() {
        let mut cfg = DigitizerConfig::default();
        cfg.downsampling_factor = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_downsampling_factor_of_one_when_downsampling_enabled() {
        let mut cfg = DigitizerConfig::default();
        cfg.downsampling_mode = DownsamplingMode::Decimate;
        cfg.downsampling_factor = 1;
        assert!(cfg.validate().is_err());
        cfg.downsampling_factor = 2;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_rapid_block_with_zero_post_samples() {
        let mut cfg = DigitizerConfig::default();
        cfg.acquisition_mode = AcquisitionMode::RapidBlock;
        cfg.post_samples = 0;
        assert!(matches!(cfg.validate(), Err(ErrorKind::InvalidConfig { .. })));
    }

    #[test]
    fn rejects_zero_nr_buffers_and_driver_buffer_size() {
        let mut cfg = DigitizerConfig::default();
        cfg.nr_buffers = 0;
        assert!(cfg.validate().is_err());
        cfg.nr_buffers = 1;
        cfg.driver_buffer_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_negative_poll_rate() {
        let mut cfg = DigitizerConfig::default();
        cfg.streaming_mode_poll_rate = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn trigger_source_strings_parse_per_spec() {
        assert_eq!(parse_trigger_source("NONE").unwrap(), TriggerSource::None);
        assert_eq!(parse_trigger_source("AUX").unwrap(), TriggerSource::Aux);
        assert_eq!(parse_trigger_source("DI").unwrap(), TriggerSource::Digital(0));
        assert_eq!(parse_trigger_source("A").unwrap(), TriggerSource::Analog(0));
        assert_eq!(parse_trigger_source("C").unwrap(), TriggerSource::Analog(2));
        assert!(parse_trigger_source("Z1").is_err());
    }

    #[test]
    fn port_ids_parse_single_digit_zero_to_seven() {
        assert_eq!(parse_port_id("port0").unwrap(), 0);
        assert_eq!(parse_port_id("port7").unwrap(), 7);
        assert!(parse_port_id("port8").is_err());
        assert!(parse_port_id("portA").is_err());
    }

    #[test]
    fn enabled_channel_position_skips_disabled_channels() {
        let mut cfg = DigitizerConfig::default();
        cfg.channels = vec![
            ChannelSetting::default(),
            ChannelSetting {
                enabled: true,
                ..Default::default()
            },
            ChannelSetting {
                enabled: true,
                ..Default::default()
            },
        ];
        assert_eq!(cfg.enabled_channel_position(0), None);
        assert_eq!(cfg.enabled_channel_position(1), Some(0));
        assert_eq!(cfg.enabled_channel_position(2), Some(1));
        assert_eq!(cfg.enabled_channel_position(99), None);
    }

    #[test]
    fn aux_trigger_source_is_treated_as_analog_without_an_index() {
        let mut cfg = DigitizerConfig::default();
        cfg.trigger.source = TriggerSource::Aux;
        assert!(cfg.trigger.is_analog());
        assert!(cfg.validate().is_ok());
    }
}
