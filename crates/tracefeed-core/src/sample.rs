use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TraceId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame data length {actual} does not match {channels}x{height}x{width}")]
    DataLength {
        channels: usize,
        height: usize,
        width: usize,
        actual: usize,
    },
    #[error("crop window {0:?} exceeds frame bounds {1}x{2}")]
    CropOutOfBounds(CropWindow, usize, usize),
    #[error("frame shape {actual:?} does not match batch shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },
}

/// Half-open pixel rectangle `[left, right) x [top, bottom)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropWindow {
    pub left: usize,
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
}

impl CropWindow {
    pub fn width(&self) -> usize {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> usize {
        self.bottom.saturating_sub(self.top)
    }
}

/// Dense channel-major image plane stack (`channels x height x width`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl Frame {
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self, FrameError> {
        if data.len() != channels * height * width {
            return Err(FrameError::DataLength {
                channels,
                height,
                width,
                actual: data.len(),
            });
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
            data: vec![0.0; channels * height * width],
        }
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.channels, self.height, self.width)
    }

    pub fn get(&self, channel: usize, y: usize, x: usize) -> f32 {
        self.data[(channel * self.height + y) * self.width + x]
    }

    pub fn crop(&self, window: &CropWindow) -> Result<Frame, FrameError> {
        if window.right > self.width
            || window.bottom > self.height
            || window.left > window.right
            || window.top > window.bottom
        {
            return Err(FrameError::CropOutOfBounds(*window, self.width, self.height));
        }
        let (w, h) = (window.width(), window.height());
        let mut data = Vec::with_capacity(self.channels * w * h);
        for c in 0..self.channels {
            for y in window.top..window.bottom {
                let row = (c * self.height + y) * self.width;
                data.extend_from_slice(&self.data[row + window.left..row + window.right]);
            }
        }
        Ok(Frame {
            channels: self.channels,
            height: h,
            width: w,
            data,
        })
    }
}

/// Cached, uncropped training representation of one trace.
///
/// Written once per trace id and never mutated on disk. Cropping and
/// augmentation operate on a copy at draw time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub trace_id: TraceId,
    pub processed_image: Frame,
    pub pixel_action_map: Frame,
    /// Single channel.
    pub reward_pixel_mask: Frame,
    pub next_processed_image: Frame,
    pub next_pixel_action_map: Frame,
    pub action_x: i32,
    pub action_y: i32,
    pub action_type: u32,
    pub reward: f32,
    pub symbol_indexes: Vec<u32>,
    pub symbol_weights: Vec<f32>,
    pub next_symbol_indexes: Vec<u32>,
    pub next_symbol_weights: Vec<f32>,
    pub decaying_future_symbol_indexes: Vec<u32>,
    pub decaying_future_symbol_weights: Vec<f32>,
}

impl Sample {
    pub fn image_width(&self) -> usize {
        self.processed_image.width
    }

    pub fn image_height(&self) -> usize {
        self.processed_image.height
    }
}

/// Fixed-shape frames concatenated along the batch axis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameStack {
    pub count: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl FrameStack {
    pub fn push(&mut self, frame: &Frame) -> Result<(), FrameError> {
        if self.count == 0 {
            self.channels = frame.channels;
            self.height = frame.height;
            self.width = frame.width;
        } else if frame.shape() != (self.channels, self.height, self.width) {
            return Err(FrameError::ShapeMismatch {
                expected: (self.channels, self.height, self.width),
                actual: frame.shape(),
            });
        }
        self.data.extend_from_slice(&frame.data);
        self.count += 1;
        Ok(())
    }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        if index >= self.count {
            return None;
        }
        let stride = self.channels * self.height * self.width;
        Some(&self.data[index * stride..(index + 1) * stride])
    }
}

/// Flattened variable-length per-sample lists.
///
/// `offsets[i]` is the start of sample `i`'s segment; the segment ends at
/// `offsets[i + 1]` or at the end of `indexes` for the last sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolSegments {
    pub indexes: Vec<u32>,
    pub weights: Vec<f32>,
    pub offsets: Vec<u64>,
}

impl SymbolSegments {
    pub fn push(&mut self, indexes: &[u32], weights: &[f32]) {
        self.offsets.push(self.indexes.len() as u64);
        self.indexes.extend_from_slice(indexes);
        self.weights.extend_from_slice(weights);
    }

    pub fn segment(&self, sample: usize) -> Option<&[u32]> {
        let start = usize::try_from(*self.offsets.get(sample)?).ok()?;
        let end = match self.offsets.get(sample + 1) {
            Some(next) => usize::try_from(*next).ok()?,
            None => self.indexes.len(),
        };
        self.indexes.get(start..end)
    }
}

/// A batch is the unit of delivery to the learner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub trace_ids: Vec<TraceId>,
    pub processed_images: FrameStack,
    pub pixel_action_maps: FrameStack,
    pub reward_pixel_masks: FrameStack,
    pub next_processed_images: FrameStack,
    pub next_pixel_action_maps: FrameStack,
    pub action_xs: Vec<i32>,
    pub action_ys: Vec<i32>,
    pub action_types: Vec<u32>,
    pub rewards: Vec<f32>,
    pub symbols: SymbolSegments,
    pub next_symbols: SymbolSegments,
    pub decaying_future_symbols: SymbolSegments,
}

impl Batch {
    pub fn sample_count(&self) -> usize {
        self.trace_ids.len()
    }
}
