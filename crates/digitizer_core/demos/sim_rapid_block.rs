//! Runs a single rapid-block waveform through [`digitizer_core`] against the in-memory
//! [`SimDriver`], printing the trigger tag and sample count it produces.
//!
//! `RUST_LOG=debug cargo run -p digitizer_core --example sim_rapid_block`

use digitizer_core::config::{ChannelSetting, DigitizerConfig};
use digitizer_core::driver::sim::SimDriver;
use digitizer_core::lifecycle::{Digitizer, WorkStep};
use digitizer_core::output::{RecordingOutput, Tag};

fn main() {
    env_logger::init();

    let mut driver = SimDriver::new();
    driver.set_data(vec![(0..2500).map(|v| v as f32).collect()], vec![]);

    let mut digitizer = Digitizer::new(Box::new(driver));
    digitizer
        .start(DigitizerConfig {
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
        })
        .expect("valid configuration");

    digitizer.timing().push("ext-trigger".into(), 87_654_321, 0.0);

    let mut output = RecordingOutput::default();
    let mut samples = 0usize;
    loop {
        match digitizer.work(&mut output).expect("work step") {
            WorkStep::RapidBlock(data) => samples += data.ai_values[0].len(),
            WorkStep::EndOfStream => break,
            WorkStep::Yield => {}
            WorkStep::Streaming(_) => unreachable!("configured for rapid block"),
        }
    }

    for (port, tag) in &output.tags {
        if let Tag::Trigger(trigger) = tag {
            log::info!(
                "port {port}: trigger {:?} at {}ns (pre={}, post={})",
                trigger.name,
                trigger.timestamp_ns,
                trigger.pre_samples,
                trigger.post_samples
            );
        }
    }
    println!("produced {samples} samples across {} tags", output.tags.len());
}
