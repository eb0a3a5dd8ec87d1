//! Sliding window over an audio stream
//!
//! Samples accumulate until a full inference window of `sample_length`
//! samples is available. Windows start every `slide` samples; when the
//! slide is shorter than the window, consecutive windows overlap and only
//! the slide prefix is dropped after each inference.
//!
//! ```text
//! sample_length = 16000, slide = 8000, buffers of 8000 samples
//!
//!   window 0: [0      .. 16000)
//!   window 1:         [8000  .. 24000)
//!   window 2:                [16000 .. 32000)
//! ```

use crate::inference::InferenceError;
use std::collections::VecDeque;

/// Rate every audio inference element runs at.
pub const SAMPLE_AUDIO_RATE: u32 = 16000;

const NS_PER_SAMPLE: u64 = 1_000_000_000 / SAMPLE_AUDIO_RATE as u64;

/// One full window handed to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    /// Start of the window in nanoseconds.
    pub start_time: u64,
    pub end_time: u64,
}

#[derive(Debug)]
pub struct AudioWindow {
    samples: Vec<i16>,
    start_times: VecDeque<u64>,
    sample_length: usize,
    sliding_length: f64,
    slide_samples: usize,
}

impl AudioWindow {
    /// Creates a window of `sample_length` samples sliding by
    /// `sliding_length` seconds.
    pub fn new(sample_length: usize, sliding_length: f64) -> Result<Self, InferenceError> {
        if sample_length == 0 {
            return Err(InferenceError::Configuration(
                "inference window must hold at least one sample".to_string(),
            ));
        }
        let mut window = Self {
            samples: Vec::with_capacity(sample_length),
            start_times: VecDeque::new(),
            sample_length,
            sliding_length,
            slide_samples: 0,
        };
        window.set_slide_length(sliding_length);
        Ok(window)
    }

    pub fn sample_length(&self) -> usize {
        self.sample_length
    }

    pub fn sliding_length(&self) -> f64 {
        self.sliding_length
    }

    pub fn slide_samples(&self) -> usize {
        self.slide_samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of window starts recorded and not yet consumed.
    pub fn pending_windows(&self) -> usize {
        self.start_times.len()
    }

    /// Recomputes the slide in samples from a length in seconds.
    pub fn set_slide_length(&mut self, sliding_length: f64) {
        self.sliding_length = sliding_length;
        self.slide_samples = ((sliding_length * SAMPLE_AUDIO_RATE as f64).round() as usize).max(1);
    }

    /// Validates the window against the number of samples every buffer
    /// carries and rounds the slide down to a multiple of it.
    ///
    /// Returns the new sliding length in seconds when it was adjusted.
    pub fn adjust_sliding_length(&mut self, num_samples: usize) -> Result<Option<f64>, InferenceError> {
        if num_samples == 0 {
            return Err(InferenceError::InvalidInput("buffer holds no samples".to_string()));
        }
        if self.sample_length < num_samples || self.sample_length % num_samples != 0 {
            return Err(InferenceError::Configuration(format!(
                "buffers of {} samples do not divide the inference window of {} samples",
                num_samples, self.sample_length
            )));
        }

        let slide = self.slide_samples;
        if slide < self.sample_length && slide % num_samples != 0 {
            let adjusted = (slide - slide % num_samples).max(num_samples);
            self.slide_samples = adjusted;
            self.sliding_length = adjusted as f64 / SAMPLE_AUDIO_RATE as f64;
            return Ok(Some(self.sliding_length));
        }
        Ok(None)
    }

    /// Appends samples that start at `start_time` nanoseconds.
    pub fn add_samples(&mut self, samples: &[i16], start_time: u64) -> Result<(), InferenceError> {
        if samples.is_empty() {
            return Err(InferenceError::InvalidInput("no samples to add".to_string()));
        }
        if self.samples.len() + samples.len() > self.sample_length {
            return Err(InferenceError::InvalidState(
                "inference window overflow, the ready window was not consumed",
            ));
        }

        let offset = self.samples.len();
        if offset % self.slide_samples == 0 && offset / self.slide_samples >= self.start_times.len() {
            self.start_times.push_back(start_time);
        }
        self.samples.extend_from_slice(samples);
        Ok(())
    }

    pub fn ready_to_infer(&self) -> bool {
        self.samples.len() == self.sample_length
    }

    /// Takes the ready window and slides past it.
    pub fn fill_audio_frame(&mut self) -> Result<AudioFrame, InferenceError> {
        if !self.ready_to_infer() {
            return Err(InferenceError::InvalidState("inference window is not full"));
        }
        let start_time = self
            .start_times
            .front()
            .copied()
            .ok_or(InferenceError::InvalidState("no start time recorded for the window"))?;

        let frame = AudioFrame {
            samples: self.samples.clone(),
            start_time,
            end_time: start_time + self.sample_length as u64 * NS_PER_SAMPLE,
        };

        if self.slide_samples < self.sample_length {
            self.samples.drain(..self.slide_samples);
            self.start_times.pop_front();
        } else {
            self.samples.clear();
            self.start_times.clear();
        }
        Ok(frame)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.start_times.clear();
    }
}
