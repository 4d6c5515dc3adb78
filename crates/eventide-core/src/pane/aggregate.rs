//! Aggregation functions.
//!
//! An [`Aggregator`] describes how the elements of a window are combined.
//! Accumulators are plain values owned by the window state; the aggregator
//! itself is shared, stateless configuration.
//!
//! Combining is fallible. An error aborts the current unit of work and the
//! engine rolls back every state change made by it.

use std::marker::PhantomData;

/// Errors raised by aggregation logic.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// Arithmetic overflow in a built-in aggregate
    #[error("Overflow in {0} aggregate")]
    Overflow(&'static str),

    /// Error reported by user aggregation logic
    #[error("Aggregation failed: {0}")]
    Failed(String),
}

/// Trait for window aggregation functions.
///
/// # Example
///
/// ```rust
/// use eventide_core::pane::{Aggregator, SumAggregator};
///
/// let sum = SumAggregator;
/// let mut acc = sum.create_accumulator();
/// sum.add_input(&mut acc, 3).unwrap();
/// sum.add_input(&mut acc, 4).unwrap();
/// assert_eq!(sum.extract_output(&acc).unwrap(), 7);
/// ```
pub trait Aggregator: Send + Sync {
    /// The element type consumed by the aggregation.
    type Input;
    /// The per-window accumulator.
    type Acc: Clone + Send;
    /// The pane value produced by the aggregation.
    type Output;

    /// Creates a new empty accumulator.
    fn create_accumulator(&self) -> Self::Acc;

    /// Adds one element to the accumulator.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError`] if the element cannot be combined.
    fn add_input(&self, acc: &mut Self::Acc, input: Self::Input) -> Result<(), AggregateError>;

    /// Merges `other` into `acc`.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError`] if the accumulators cannot be combined.
    fn merge_accumulators(&self, acc: &mut Self::Acc, other: Self::Acc)
        -> Result<(), AggregateError>;

    /// Extracts the pane value from the accumulator.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError`] if no value can be produced.
    fn extract_output(&self, acc: &Self::Acc) -> Result<Self::Output, AggregateError>;
}

/// Count aggregator - counts the number of elements in a window.
#[derive(Debug)]
pub struct CountAggregator<T>(PhantomData<fn(T)>);

impl<T> CountAggregator<T> {
    /// Creates a new count aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for CountAggregator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CountAggregator<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Aggregator for CountAggregator<T> {
    type Input = T;
    type Acc = u64;
    type Output = u64;

    fn create_accumulator(&self) -> u64 {
        0
    }

    fn add_input(&self, acc: &mut u64, _input: T) -> Result<(), AggregateError> {
        *acc += 1;
        Ok(())
    }

    fn merge_accumulators(&self, acc: &mut u64, other: u64) -> Result<(), AggregateError> {
        *acc += other;
        Ok(())
    }

    fn extract_output(&self, acc: &u64) -> Result<u64, AggregateError> {
        Ok(*acc)
    }
}

/// Sum aggregator - sums i64 values, failing on overflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumAggregator;

impl Aggregator for SumAggregator {
    type Input = i64;
    type Acc = i64;
    type Output = i64;

    fn create_accumulator(&self) -> i64 {
        0
    }

    fn add_input(&self, acc: &mut i64, input: i64) -> Result<(), AggregateError> {
        *acc = acc.checked_add(input).ok_or(AggregateError::Overflow("sum"))?;
        Ok(())
    }

    fn merge_accumulators(&self, acc: &mut i64, other: i64) -> Result<(), AggregateError> {
        self.add_input(acc, other)
    }

    fn extract_output(&self, acc: &i64) -> Result<i64, AggregateError> {
        Ok(*acc)
    }
}

/// Min aggregator - smallest value seen, `None` for an empty window.
#[derive(Debug)]
pub struct MinAggregator<T>(PhantomData<fn(T)>);

impl<T> MinAggregator<T> {
    /// Creates a new min aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for MinAggregator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MinAggregator<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone + Send> Aggregator for MinAggregator<T> {
    type Input = T;
    type Acc = Option<T>;
    type Output = Option<T>;

    fn create_accumulator(&self) -> Option<T> {
        None
    }

    fn add_input(&self, acc: &mut Option<T>, input: T) -> Result<(), AggregateError> {
        match acc {
            Some(current) if *current <= input => {}
            _ => *acc = Some(input),
        }
        Ok(())
    }

    fn merge_accumulators(&self, acc: &mut Option<T>, other: Option<T>) -> Result<(), AggregateError> {
        match other {
            Some(value) => self.add_input(acc, value),
            None => Ok(()),
        }
    }

    fn extract_output(&self, acc: &Option<T>) -> Result<Option<T>, AggregateError> {
        Ok(acc.clone())
    }
}

/// Max aggregator - largest value seen, `None` for an empty window.
#[derive(Debug)]
pub struct MaxAggregator<T>(PhantomData<fn(T)>);

impl<T> MaxAggregator<T> {
    /// Creates a new max aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for MaxAggregator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MaxAggregator<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone + Send> Aggregator for MaxAggregator<T> {
    type Input = T;
    type Acc = Option<T>;
    type Output = Option<T>;

    fn create_accumulator(&self) -> Option<T> {
        None
    }

    fn add_input(&self, acc: &mut Option<T>, input: T) -> Result<(), AggregateError> {
        match acc {
            Some(current) if *current >= input => {}
            _ => *acc = Some(input),
        }
        Ok(())
    }

    fn merge_accumulators(&self, acc: &mut Option<T>, other: Option<T>) -> Result<(), AggregateError> {
        match other {
            Some(value) => self.add_input(acc, value),
            None => Ok(()),
        }
    }

    fn extract_output(&self, acc: &Option<T>) -> Result<Option<T>, AggregateError> {
        Ok(acc.clone())
    }
}

/// Average aggregator - mean of f64 values, `None` for an empty window.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvgAggregator;

impl Aggregator for AvgAggregator {
    type Input = f64;
    /// (sum, count)
    type Acc = (f64, u64);
    type Output = Option<f64>;

    fn create_accumulator(&self) -> (f64, u64) {
        (0.0, 0)
    }

    fn add_input(&self, acc: &mut (f64, u64), input: f64) -> Result<(), AggregateError> {
        acc.0 += input;
        acc.1 += 1;
        Ok(())
    }

    fn merge_accumulators(&self, acc: &mut (f64, u64), other: (f64, u64)) -> Result<(), AggregateError> {
        acc.0 += other.0;
        acc.1 += other.1;
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn extract_output(&self, acc: &(f64, u64)) -> Result<Option<f64>, AggregateError> {
        if acc.1 == 0 {
            Ok(None)
        } else {
            Ok(Some(acc.0 / acc.1 as f64))
        }
    }
}

/// Collect aggregator - the window's elements in arrival order.
///
/// This is a plain group-by-key.
#[derive(Debug)]
pub struct CollectAggregator<T>(PhantomData<fn(T)>);

impl<T> CollectAggregator<T> {
    /// Creates a new collect aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for CollectAggregator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CollectAggregator<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Clone + Send> Aggregator for CollectAggregator<T> {
    type Input = T;
    type Acc = Vec<T>;
    type Output = Vec<T>;

    fn create_accumulator(&self) -> Vec<T> {
        Vec::new()
    }

    fn add_input(&self, acc: &mut Vec<T>, input: T) -> Result<(), AggregateError> {
        acc.push(input);
        Ok(())
    }

    fn merge_accumulators(&self, acc: &mut Vec<T>, other: Vec<T>) -> Result<(), AggregateError> {
        acc.extend(other);
        Ok(())
    }

    fn extract_output(&self, acc: &Vec<T>) -> Result<Vec<T>, AggregateError> {
        Ok(acc.clone())
    }
}
