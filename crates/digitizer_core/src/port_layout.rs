//! Maps enabled channels/ports to the scheduler's output port numbering.
//!
//! The dataflow runtime this crate targets (out of scope here, consumed only via
//! [`crate::output::SchedulerOutput`]) gives each enabled analog channel two adjacent output
//! ports — sample values, then the per-sample error band — mirroring the value/error pairing
//! already present in [`crate::chunk::DataChunk`]'s layout. Digital ports follow after all
//! analog ports, one apiece. Trigger tags are attached only to value and digital ports, never to
//! error ports (§4.D step 4).

/// Output port carrying channel `channel_index`'s sample values.
pub fn value_port(channel_index: usize) -> usize {
    channel_index * 2
}

/// Output port carrying channel `channel_index`'s per-sample error band.
pub fn error_port(channel_index: usize) -> usize {
    channel_index * 2 + 1
}

/// Output port carrying digital port `port_index`'s logic words.
pub fn digital_port(nr_channels: usize, port_index: usize) -> usize {
    nr_channels * 2 + port_index
}

/// Every port a [`crate::tags::TriggerTag`] should be attached to: every enabled channel's value
/// port, then every enabled digital port. Error ports are excluded.
pub fn trigger_target_ports(nr_channels: usize, nr_ports: usize) -> Vec<usize> {
    let mut ports = Vec::with_capacity(nr_channels + nr_ports);
    ports.extend((0..nr_channels).map(value_port));
    ports.extend((0..nr_ports).map(|p| digital_port(nr_channels, p)));
    ports
}

/// Every port an [`crate::tags::AcqInfoTag`]/[`crate::tags::TimebaseInfoTag`] should be attached
/// to: all value, error, and digital ports.
pub fn all_ports(nr_channels: usize, nr_ports: usize) -> Vec<usize> {
    let mut ports = Vec::with_capacity(nr_channels * 2 + nr_ports);
    for c in 0..nr_channels {
        ports.push(value_port(c));
        ports.push(error_port(c));
    }
    ports.extend((0..nr_ports).map(|p| digital_port(nr_channels, p)));
    ports
}
