//! Bounded inclusive voltage ramp.

/// Linear voltage range from `begin` to `end` in steps of `|step|`.
///
/// Iteration always terminates exactly on `end`: when the last regular step
/// would overshoot, it is clamped to the boundary. The sign of `step` is
/// ignored; direction follows `sign(end - begin)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearRange {
    pub begin: f64,
    pub end: f64,
    step: f64,
}

impl LinearRange {
    pub fn new(begin: f64, end: f64, step: f64) -> Self {
        Self {
            begin,
            end,
            step: step.abs(),
        }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn distance(&self) -> f64 {
        (self.end - self.begin).abs()
    }

    /// A range is walkable when its step is finite and nonzero.
    pub fn is_valid(&self) -> bool {
        self.step.is_finite()
            && self.step > 0.0
            && self.begin.is_finite()
            && self.end.is_finite()
    }

    /// Number of points the iterator yields, boundary included.
    pub fn points(&self) -> usize {
        if !self.is_valid() {
            return 0;
        }
        let ratio = self.distance() / self.step;
        let steps = if (ratio - ratio.round()).abs() < 1e-9 {
            ratio.round()
        } else {
            ratio.ceil()
        };
        steps as usize + 1
    }
}

impl IntoIterator for LinearRange {
    type Item = f64;
    type IntoIter = LinearRangeIter;

    fn into_iter(self) -> LinearRangeIter {
        LinearRangeIter {
            range: self,
            index: 0,
            done: !self.is_valid(),
        }
    }
}

pub struct LinearRangeIter {
    range: LinearRange,
    index: usize,
    done: bool,
}

impl Iterator for LinearRangeIter {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.done {
            return None;
        }
        let offset = self.index as f64 * self.range.step;
        if offset < self.range.distance() {
            self.index += 1;
            let direction = if self.range.end >= self.range.begin {
                1.0
            } else {
                -1.0
            };
            Some(self.range.begin + direction * offset)
        } else {
            self.done = true;
            Some(self.range.end)
        }
    }
}
