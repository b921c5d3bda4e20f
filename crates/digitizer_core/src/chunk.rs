//! The fixed-layout data chunk moved through the free/filled rings, and typed views over it.
//!
//! Memory layout, matching the original driver's `data_chunk_t`:
//!
//! ```text
//! <channel 0 values><channel 0 errors><channel 1 values><channel 1 errors>...<port 0 words><port 1 words>...
//! ```
//!
//! where each channel's values/errors are `chunk_size` `f32`s and each port's words are
//! `chunk_size` `u8`s (one logic word per sample).

use std::time::Duration;

use crate::status::ChannelStatus;

/// The static shape of a chunk: how many channels/ports it carries and how many samples each
/// holds. Every chunk handed out by a [`crate::pool::ChunkPool`] shares this layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub nr_channels: usize,
    pub nr_ports: usize,
    pub chunk_size: usize,
}

impl ChunkLayout {
    pub fn size_bytes(&self) -> usize {
        self.nr_ports * self.chunk_size + self.nr_channels * self.chunk_size * std::mem::size_of::<f32>() * 2
    }

    fn channel_values_offset(&self, channel: usize) -> usize {
        channel * self.chunk_size * std::mem::size_of::<f32>() * 2
    }

    fn channel_errors_offset(&self, channel: usize) -> usize {
        self.channel_values_offset(channel) + self.chunk_size * std::mem::size_of::<f32>()
    }

    fn ports_offset(&self) -> usize {
        self.nr_channels * self.chunk_size * std::mem::size_of::<f32>() * 2
    }

    fn port_offset(&self, port: usize) -> usize {
        self.ports_offset() + port * self.chunk_size
    }
}

/// A single data chunk: raw sample bytes plus the per-channel/port status and bookkeeping the
/// original calls `d_status`/`d_local_timestamp`/`d_lost_count`.
pub struct DataChunk {
    layout: ChunkLayout,
    data: Vec<u8>,
    pub status: Vec<ChannelStatus>,
    pub local_timestamp: Duration,
    pub lost_count: u32,
}

impl DataChunk {
    pub fn new(layout: ChunkLayout) -> Self {
        Self {
            data: vec![0u8; layout.size_bytes()],
            status: vec![ChannelStatus::empty(); layout.nr_channels + layout.nr_ports],
            local_timestamp: Duration::ZERO,
            lost_count: 0,
            layout,
        }
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    /// Resets a chunk taken from the free ring back to a clean slate before the driver fills it
    /// in. Does not reallocate.
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.status.fill(ChannelStatus::empty());
        self.local_timestamp = Duration::ZERO;
        self.lost_count = 0;
    }

    fn f32_slice(&self, byte_offset: usize) -> &[f32] {
        bytemuck_cast_slice(&self.data[byte_offset..byte_offset + self.layout.chunk_size * 4])
    }

    fn f32_slice_mut(&mut self, byte_offset: usize) -> &mut [f32] {
        bytemuck_cast_slice_mut(&mut self.data[byte_offset..byte_offset + self.layout.chunk_size * 4])
    }

    /// Analog sample values for `channel`, one per sample in the chunk.
    pub fn ai_values(&self, channel: usize) -> &[f32] {
        self.f32_slice(self.layout.channel_values_offset(channel))
    }

    pub fn ai_values_mut(&mut self, channel: usize) -> &mut [f32] {
        let off = self.layout.channel_values_offset(channel);
        self.f32_slice_mut(off)
    }

    /// Per-sample error estimates for `channel`.
    pub fn ai_errors(&self, channel: usize) -> &[f32] {
        self.f32_slice(self.layout.channel_errors_offset(channel))
    }

    pub fn ai_errors_mut(&mut self, channel: usize) -> &mut [f32] {
        let off = self.layout.channel_errors_offset(channel);
        self.f32_slice_mut(off)
    }

    /// Raw logic words for `port`, one byte per sample.
    pub fn port_words(&self, port: usize) -> &[u8] {
        let off = self.layout.port_offset(port);
        &self.data[off..off + self.layout.chunk_size]
    }

    pub fn port_words_mut(&mut self, port: usize) -> &mut [u8] {
        let off = self.layout.port_offset(port);
        &mut self.data[off..off + self.layout.chunk_size]
    }

    pub fn channel_status(&self, channel: usize) -> ChannelStatus {
        self.status[channel]
    }

    pub fn port_status(&self, port: usize) -> ChannelStatus {
        self.status[self.layout.nr_channels + port]
    }
}

fn bytemuck_cast_slice(bytes: &[u8]) -> &[f32] {
    bytemuck::cast_slice(bytes)
}

fn bytemuck_cast_slice_mut(bytes: &mut [u8]) -> &mut [f32] {
    bytemuck::cast_slice_mut(bytes)
}
