use chrono::{DateTime, Utc};
use sky_frame::Frame;

/// How incoming frames are folded into the running accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackMethod {
    Sum,
    Mean,
    Max,
}

/// How the wide accumulator is mapped back down to an output depth on
/// close. Which strategy is "correct" is configuration-dependent; both
/// are implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionMethod {
    /// Divide by a fixed factor, discarding precision below it.
    FixedShift { divisor: u32 },
    /// Scale to preserve the 99.5th percentile, recording BZERO/BSCALE
    /// headers so the linear mapping back to physical units is lossless.
    BzeroBscale,
}

/// A long-exposure composite closed out by the stacker.
#[derive(Debug, Clone)]
pub struct StackedFrame {
    pub pixels: Vec<u16>,
    pub width: u32,
    pub height: u32,
    pub method: StackMethod,
    pub frame_count: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_exposure_ms: f64,
    /// Present when `ReductionMethod::BzeroBscale` was used.
    pub bzero_bscale: Option<(f64, f64)>,
}

/// A stack window open between `StackFrames` consumed from the source.
pub struct Accumulator {
    data: Vec<f64>,
    width: u32,
    height: u32,
    method: StackMethod,
    count: u32,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    total_exposure_ms: f64,
}

impl Accumulator {
    pub fn open(width: u32, height: u32, method: StackMethod) -> Self {
        let fill = match method {
            StackMethod::Max => f64::MIN,
            _ => 0.0,
        };
        Self {
            data: vec![fill; (width as usize) * (height as usize)],
            width,
            height,
            method,
            count: 0,
            start: None,
            end: None,
            total_exposure_ms: 0.0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Fold one frame in. Caller guarantees `frame` matches this
    /// accumulator's dimensions.
    pub fn fold(&mut self, frame: &Frame) {
        if self.start.is_none() {
            self.start = Some(frame.timestamp);
        }
        self.end = Some(frame.timestamp);
        self.total_exposure_ms += frame.exposure_ms as f64;

        let samples = frame.pixels.to_f32_vec();
        match self.method {
            StackMethod::Sum | StackMethod::Mean => {
                for (acc, s) in self.data.iter_mut().zip(samples.iter()) {
                    *acc += *s as f64;
                }
            }
            StackMethod::Max => {
                for (acc, s) in self.data.iter_mut().zip(samples.iter()) {
                    if (*s as f64) > *acc {
                        *acc = *s as f64;
                    }
                }
            }
        }
        self.count += 1;
    }

    /// Close the window, reducing the wide accumulator to the configured
    /// output depth.
    pub fn close(self, reduction: ReductionMethod) -> StackedFrame {
        let finalized: Vec<f64> = match self.method {
            StackMethod::Mean if self.count > 0 => self
                .data
                .iter()
                .map(|v| v / self.count as f64)
                .collect(),
            _ => self.data,
        };

        let (pixels, bzero_bscale) = reduce(&finalized, reduction);

        StackedFrame {
            pixels,
            width: self.width,
            height: self.height,
            method: self.method,
            frame_count: self.count,
            start: self.start.unwrap_or_else(Utc::now),
            end: self.end.unwrap_or_else(Utc::now),
            total_exposure_ms: self.total_exposure_ms,
            bzero_bscale,
        }
    }
}

fn reduce(data: &[f64], reduction: ReductionMethod) -> (Vec<u16>, Option<(f64, f64)>) {
    match reduction {
        ReductionMethod::FixedShift { divisor } => {
            let divisor = divisor.max(1) as f64;
            let pixels = data
                .iter()
                .map(|v| (v / divisor).clamp(0.0, u16::MAX as f64) as u16)
                .collect();
            (pixels, None)
        }
        ReductionMethod::BzeroBscale => {
            let mut sorted: Vec<f64> = data.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let idx = ((sorted.len() as f64 - 1.0) * 0.995).round() as usize;
            let p995 = sorted.get(idx).copied().unwrap_or(1.0).max(1.0);
            let bscale = p995 / u16::MAX as f64;
            let bzero = 0.0;
            let pixels = data
                .iter()
                .map(|v| ((v - bzero) / bscale).clamp(0.0, u16::MAX as f64) as u16)
                .collect();
            (pixels, Some((bzero, bscale)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sky_frame::{Frame, PixelBuffer};
    use std::sync::Arc;

    fn uniform_frame(value: u8, seq: u64) -> Frame {
        let data: Arc<[u8]> = Arc::from(vec![value; 4]);
        Frame::new(PixelBuffer::Eight(data), 2, 2, Utc::now(), seq, 1.0, 10.0, "t").unwrap()
    }

    #[test]
    fn sum_of_identical_frames_is_n_times_value() {
        let mut acc = Accumulator::open(2, 2, StackMethod::Sum);
        for i in 0..10 {
            acc.fold(&uniform_frame(100, i));
        }
        let stacked = acc.close(ReductionMethod::FixedShift { divisor: 1 });
        assert_eq!(stacked.frame_count, 10);
        assert!(stacked.pixels.iter().all(|&p| p == 1000));
    }

    #[test]
    fn mean_of_identical_frames_equals_the_frame() {
        let mut acc = Accumulator::open(2, 2, StackMethod::Mean);
        for i in 0..10 {
            acc.fold(&uniform_frame(100, i));
        }
        let stacked = acc.close(ReductionMethod::FixedShift { divisor: 1 });
        assert!(stacked.pixels.iter().all(|&p| p == 100));
    }

    #[test]
    fn max_of_identical_frames_equals_the_frame() {
        let mut acc = Accumulator::open(2, 2, StackMethod::Max);
        for i in 0..5 {
            acc.fold(&uniform_frame(77, i));
        }
        let stacked = acc.close(ReductionMethod::FixedShift { divisor: 1 });
        assert!(stacked.pixels.iter().all(|&p| p == 77));
    }

    #[test]
    fn max_picks_the_brighter_of_varying_frames() {
        let mut acc = Accumulator::open(2, 2, StackMethod::Max);
        acc.fold(&uniform_frame(10, 0));
        acc.fold(&uniform_frame(200, 1));
        acc.fold(&uniform_frame(50, 2));
        let stacked = acc.close(ReductionMethod::FixedShift { divisor: 1 });
        assert!(stacked.pixels.iter().all(|&p| p == 200));
    }

    #[test]
    fn total_exposure_accumulates() {
        let mut acc = Accumulator::open(2, 2, StackMethod::Sum);
        for i in 0..4 {
            acc.fold(&uniform_frame(1, i));
        }
        let stacked = acc.close(ReductionMethod::FixedShift { divisor: 1 });
        assert_eq!(stacked.total_exposure_ms, 40.0);
    }
}
