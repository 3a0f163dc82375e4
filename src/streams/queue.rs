//! Operations shared by every controller: strategy extraction and the queue-with-sizes.

use super::{QueuingStrategy, StreamError, StreamResult};
use crate::platform::BoxedStrategy;
use std::collections::VecDeque;

/// Options object accepted by the built-in strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueuingStrategyInit {
    pub high_water_mark: Option<f64>,
}

impl QueuingStrategyInit {
    pub const fn new(high_water_mark: f64) -> Self {
        Self {
            high_water_mark: Some(high_water_mark),
        }
    }

    pub(crate) fn required_high_water_mark(self) -> StreamResult<f64> {
        self.high_water_mark
            .ok_or_else(|| StreamError::type_error("highWaterMark is required"))
    }
}

/// Validates a strategy's high water mark: NaN and negative values are rejected.
pub fn extract_high_water_mark(high_water_mark: f64) -> StreamResult<f64> {
    if high_water_mark.is_nan() || high_water_mark < 0.0 {
        return Err(StreamError::range_error(
            "highWaterMark must be a non-negative, non-NaN number",
        ));
    }
    Ok(high_water_mark)
}

/// Resolves the strategy a builder was configured with, validating its high water mark.
pub(crate) fn extract_strategy<T>(
    strategy: Option<BoxedStrategy<T>>,
    default: BoxedStrategy<T>,
) -> StreamResult<(BoxedStrategy<T>, f64)> {
    let strategy = strategy.unwrap_or(default);
    let high_water_mark = extract_high_water_mark(strategy.high_water_mark())?;
    Ok((strategy, high_water_mark))
}

/// Runs the size algorithm and rejects sizes a queue cannot account for.
pub(crate) fn chunk_size<T>(strategy: &dyn QueuingStrategy<T>, chunk: &T) -> StreamResult<f64> {
    validate_size(strategy.size(chunk)?)
}

pub(crate) fn validate_size(size: Option<f64>) -> StreamResult<f64> {
    match size {
        Some(size) if size.is_finite() && size >= 0.0 => Ok(size),
        Some(_) => Err(StreamError::range_error(
            "Size must be a finite, non-NaN, non-negative number",
        )),
        None => Err(StreamError::range_error("Chunk has no measurable size")),
    }
}

/// FIFO of values paired with their sizes, tracking the running total.
#[derive(Debug)]
pub(crate) struct QueueWithSizes<T> {
    entries: VecDeque<(T, f64)>,
    total_size: f64,
}

impl<T> Default for QueueWithSizes<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            total_size: 0.0,
        }
    }
}

impl<T> QueueWithSizes<T> {
    pub(crate) fn enqueue(&mut self, value: T, size: f64) {
        self.total_size += size;
        self.entries.push_back((value, size));
    }

    pub(crate) fn dequeue(&mut self) -> Option<T> {
        let (value, size) = self.entries.pop_front()?;
        // Float rounding can leave a tiny negative remainder.
        self.total_size = if self.entries.is_empty() {
            0.0
        } else {
            (self.total_size - size).max(0.0)
        };
        Some(value)
    }

    pub(crate) fn peek(&self) -> Option<&T> {
        self.entries.front().map(|(value, _)| value)
    }

    pub(crate) fn peek_mut(&mut self) -> Option<&mut T> {
        self.entries.front_mut().map(|(value, _)| value)
    }

    pub(crate) fn reset(&mut self) {
        self.entries.clear();
        self.total_size = 0.0;
    }

    pub(crate) fn total_size(&self) -> f64 {
        self.total_size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
