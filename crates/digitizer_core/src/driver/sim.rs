//! An in-memory driver for tests and examples, standing in for a real digitizer SDK.
//!
//! Grounded on the original source's own simulation driver, which feeds preloaded channel/port
//! vectors through the same driver interface every concrete vendor implementation uses. Not part
//! of this crate's public contract in any real deployment; only ever constructed by tests.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::DigitizerConfig;
use crate::driver::{Driver, RapidBlockData, StreamingData};
use crate::error::{ErrorKind, Result};
use crate::status::ChannelStatus;

/// Constant per-sample error band the original simulation source reports (`0.005`), since it
/// has no real notion of measurement uncertainty.
const SIMULATED_ERROR: f32 = 0.005;

/// An in-memory [`Driver`] that serves samples from preloaded per-channel/per-port buffers.
pub struct SimDriver {
    config: Option<DigitizerConfig>,
    armed: bool,
    ai_data: Vec<Vec<f32>>,
    port_data: Vec<Vec<u8>>,
    stream_cursor: usize,
    pending_errors: VecDeque<ErrorKind>,
}

impl SimDriver {
    pub fn new() -> Self {
        Self {
            config: None,
            armed: false,
            ai_data: Vec::new(),
            port_data: Vec::new(),
            stream_cursor: 0,
            pending_errors: VecDeque::new(),
        }
    }

    /// Loads the samples subsequent polls/reads will serve, one vector per enabled channel/port.
    pub fn set_data(&mut self, ai_data: Vec<Vec<f32>>, port_data: Vec<Vec<u8>>) {
        self.ai_data = ai_data;
        self.port_data = port_data;
        self.stream_cursor = 0;
    }

    /// Queues an error to be returned from the next [`Driver::poll`] call, for exercising the
    /// watchdog/error paths without a real fault.
    pub fn inject_error(&mut self, err: ErrorKind) {
        self.pending_errors.push_back(err);
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    fn config(&self) -> &DigitizerConfig {
        self.config.as_ref().expect("driver initialized before use")
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SimDriver {
    fn driver_version(&self) -> String {
        "simulation".into()
    }

    fn hardware_version(&self) -> String {
        "simulation".into()
    }

    fn ai_channel_ids(&self) -> Vec<String> {
        ('A'..='P').map(String::from).collect()
    }

    fn ai_ranges(&self) -> Vec<f64> {
        vec![0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0]
    }

    fn initialize(&mut self, config: &DigitizerConfig) -> Result<()> {
        self.config = Some(config.clone());
        Ok(())
    }

    fn configure(&mut self) -> Result<()> {
        Ok(())
    }

    fn arm(&mut self) -> Result<()> {
        self.armed = true;
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        self.armed = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.armed = false;
        Ok(())
    }

    fn prefetch_block(&mut self, _capture_index: usize) -> Result<()> {
        Ok(())
    }

    fn read_rapid_block(&mut self, capture_index: usize) -> Result<RapidBlockData> {
        let total = self.config().pre_samples + self.config().post_samples;
        let offset = capture_index * total;

        let mut ai_values = Vec::with_capacity(self.ai_data.len());
        let mut ai_errors = Vec::with_capacity(self.ai_data.len());
        for channel in &self.ai_data {
            let end = (offset + total).min(channel.len());
            let values = channel.get(offset..end).unwrap_or(&[]).to_vec();
            let errors = vec![SIMULATED_ERROR; values.len()];
            ai_values.push(values);
            ai_errors.push(errors);
        }

        let mut port_words = Vec::with_capacity(self.port_data.len());
        for port in &self.port_data {
            let end = (offset + total).min(port.len());
            port_words.push(port.get(offset..end).unwrap_or(&[]).to_vec());
        }

        let status = vec![ChannelStatus::empty(); self.ai_data.len()];

        Ok(RapidBlockData {
            ai_values,
            ai_errors,
            port_words,
            status,
        })
    }

    fn poll(&mut self) -> Result<Option<StreamingData>> {
        if let Some(err) = self.pending_errors.pop_front() {
            return Err(err);
        }

        let buffer_size = self.config().buffer_size;
        let have_enough = self
            .ai_data
            .iter()
            .chain(self.port_data.iter())
            .all(|v| self.stream_cursor + buffer_size <= v.len());
        if !have_enough || (self.ai_data.is_empty() && self.port_data.is_empty()) {
            return Ok(None);
        }

        let start = self.stream_cursor;
        let end = start + buffer_size;
        self.stream_cursor = end;

        let ai_values: Vec<Vec<f32>> = self.ai_data.iter().map(|c| c[start..end].to_vec()).collect();
        let ai_errors: Vec<Vec<f32>> = ai_values.iter().map(|c| vec![SIMULATED_ERROR; c.len()]).collect();
        let port_words: Vec<Vec<u8>> = self.port_data.iter().map(|p| p[start..end].to_vec()).collect();
        let overflow = vec![false; ai_values.len()];

        let local_timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i64;

        Ok(Some(StreamingData {
            ai_values,
            ai_errors,
            port_words,
            overflow,
            local_timestamp_ns,
            lost_count: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cfg() -> DigitizerConfig {
        DigitizerConfig {
            buffer_size: 4,
            pre_samples: 2,
            post_samples: 2,
            ..Default::default()
        }
    }

    #[test]
    fn reports_capability_metadata_without_needing_initialize() {
        let driver = SimDriver::new();
        assert_eq!(driver.driver_version(), "simulation");
        assert_eq!(driver.ai_channel_ids().len(), 16);
        assert!(driver.ai_ranges().contains(&2.0));
    }

    #[test]
    fn streams_in_buffer_sized_chunks_until_exhausted() {
        let mut driver = SimDriver::new();
        driver.initialize(&cfg()).unwrap();
        driver.set_data(vec![vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]], vec![]);

        let first = driver.poll().unwrap().unwrap();
        assert_eq!(first.ai_values[0], vec![1.0, 2.0, 3.0, 4.0]);
        let second = driver.poll().unwrap().unwrap();
        assert_eq!(second.ai_values[0], vec![5.0, 6.0, 7.0, 8.0]);
        assert!(driver.poll().unwrap().is_none());
    }

    #[test]
    fn injected_error_surfaces_on_next_poll() {
        let mut driver = SimDriver::new();
        driver.initialize(&cfg()).unwrap();
        driver.set_data(vec![vec![0.0; 8]], vec![]);
        driver.inject_error(ErrorKind::Watchdog);
        assert!(matches!(driver.poll(), Err(ErrorKind::Watchdog)));
        // subsequent polls are unaffected
        assert!(driver.poll().unwrap().is_some());
    }

    #[test]
    fn rapid_block_reads_the_right_slice_per_capture() {
        let mut driver = SimDriver::new();
        driver.initialize(&cfg()).unwrap();
        driver.set_data(vec![(0..16).map(|v| v as f32).collect()], vec![]);
        let block0 = driver.read_rapid_block(0).unwrap();
        assert_eq!(block0.ai_values[0], vec![0.0, 1.0, 2.0, 3.0]);
        let block1 = driver.read_rapid_block(1).unwrap();
        assert_eq!(block1.ai_values[0], vec![4.0, 5.0, 6.0, 7.0]);
    }
}
