//! Edge detection with hysteresis, used to find trigger offsets inside a streaming chunk and to
//! arm/disarm a rapid-block capture.

use crate::config::TriggerDirection;

/// Finds sample offsets within `samples` at which a trigger fires, applying a hysteresis band so
/// noise near the threshold doesn't cause repeated firings.
///
/// `Rising`/`High` arm when a sample crosses at or above `threshold` and disarm once it falls to
/// or below `threshold - hysteresis_band`; `Falling`/`Low` are the mirror image. Analog channels
/// use `Rising`/`Falling`; digital pins (already reduced to `0.0`/`1.0`) use `High`/`Low`.
pub struct TriggerDetector {
    armed: bool,
}

impl TriggerDetector {
    pub fn new() -> Self {
        Self { armed: false }
    }

    /// Returns the offsets (relative to `samples[0]`) at which the trigger fired.
    pub fn find_triggers(&mut self, samples: &[f32], threshold: f32, direction: TriggerDirection, hysteresis_band: f32) -> Vec<usize> {
        let mut offsets = Vec::new();
        for (i, &sample) in samples.iter().enumerate() {
            match direction {
                TriggerDirection::Rising | TriggerDirection::High => {
                    if !self.armed && sample >= threshold {
                        self.armed = true;
                        offsets.push(i);
                    } else if self.armed && sample <= threshold - hysteresis_band {
                        self.armed = false;
                    }
                }
                TriggerDirection::Falling | TriggerDirection::Low => {
                    if !self.armed && sample <= threshold {
                        self.armed = true;
                        offsets.push(i);
                    } else if self.armed && sample >= threshold + hysteresis_band {
                        self.armed = false;
                    }
                }
            }
        }
        offsets
    }

    /// Resets the arm/disarm state, e.g. when a capture restarts.
    pub fn reset(&mut self) {
        self.armed = false;
    }
}

impl Default for TriggerDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts a single digital pin from a port's per-sample logic words as a `0.0`/`1.0` series
/// suitable for [`TriggerDetector::find_triggers`].
pub fn extract_pin(words: &[u8], pin: u8) -> Vec<f32> {
    words.iter().map(|w| if (w >> pin) & 1 == 1 { 1.0 } else { 0.0 }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rising_edge_fires_once_per_crossing() {
        let mut det = TriggerDetector::new();
        let samples = [0.0, 0.0, 1.0, 1.0, 1.0, -1.0, -1.0, 1.0];
        let offsets = det.find_triggers(&samples, 0.5, TriggerDirection::Rising, 0.2);
        assert_eq!(offsets, vec![2, 7]);
    }

    #[test]
    fn falling_edge_fires_once_per_crossing() {
        let mut det = TriggerDetector::new();
        let samples = [1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0];
        let offsets = det.find_triggers(&samples, 0.0, TriggerDirection::Falling, 0.2);
        assert_eq!(offsets, vec![2, 6]);
    }

    #[test]
    fn hysteresis_band_suppresses_noise_near_threshold() {
        let mut det = TriggerDetector::new();
        // Crosses threshold (0.5) then wobbles just below it without reaching the disarm band.
        let samples = [0.0, 1.0, 0.45, 1.0, 0.45, -1.0, 1.0];
        let offsets = det.find_triggers(&samples, 0.5, TriggerDirection::Rising, 0.5);
        // Only the first rise and the rise after the real disarm (sample -1.0) fire.
        assert_eq!(offsets, vec![1, 6]);
    }

    #[test]
    fn state_persists_across_calls_at_a_chunk_boundary() {
        let mut det = TriggerDetector::new();
        let first_half = [0.0, 1.0, 1.0];
        let second_half = [-1.0, 1.0];
        let mut offsets = det.find_triggers(&first_half, 0.5, TriggerDirection::Rising, 0.2);
        offsets.extend(det.find_triggers(&second_half, 0.5, TriggerDirection::Rising, 0.2).into_iter().map(|o| o + first_half.len()));
        assert_eq!(offsets, vec![1, 4]);
    }

    #[test]
    fn digital_pin_extraction_reduces_words_to_bit_series() {
        let words = [0b0000_0001, 0b0000_0010, 0b0000_0011];
        assert_eq!(extract_pin(&words, 0), vec![1.0, 0.0, 1.0]);
        assert_eq!(extract_pin(&words, 1), vec![0.0, 1.0, 1.0]);
    }
}
