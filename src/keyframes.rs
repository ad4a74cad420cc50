use crate::capture::Frame;

/// Every `stride`-th frame of a sequence, starting at the first one.
#[derive(Debug, Clone)]
pub struct KeyframeSubset<'a> {
    stride: usize,
    frames: Vec<&'a Frame>,
}

impl<'a> KeyframeSubset<'a> {
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn frames(&self) -> &[&'a Frame] {
        &self.frames
    }

    pub fn indices(&self) -> Vec<usize> {
        self.frames.iter().map(|frame| frame.index).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Thins the subset again until it holds at most `max` frames. The first
    /// frame is always kept.
    pub fn limit(self, max: usize) -> Self {
        if max == 0 || self.frames.len() <= max {
            return self;
        }
        let extra = self.frames.len().div_ceil(max);
        let frames = self.frames.into_iter().step_by(extra).collect();
        Self {
            stride: self.stride * extra,
            frames,
        }
    }
}

/// Selects every `stride`-th frame starting at index 0. A stride of zero is
/// treated as one.
pub fn select_keyframes(frames: &[Frame], stride: usize) -> KeyframeSubset<'_> {
    let stride = stride.max(1);
    KeyframeSubset {
        stride,
        frames: frames.iter().step_by(stride).collect(),
    }
}
