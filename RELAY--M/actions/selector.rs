use rand::{
    distributions::{Distribution, WeightedIndex},
    Rng,
};
use serde::{Deserialize, Serialize};

use crate::catalog::ActionError;

/// Candidate value with a relative likelihood.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeightedOption<T> {
    /// Candidate.
    pub value: T,
    /// Relative weight; values at or below zero are never selected.
    pub weight: i32,
}

impl<T> WeightedOption<T> {
    /// Creates an option.
    #[must_use]
    pub const fn new(value: T, weight: i32) -> Self {
        Self { value, weight }
    }
}

/// Weighted random chooser over a finite set of values.
#[derive(Debug, Clone)]
pub struct WeightedSelector<T> {
    values: Vec<T>,
    weights: Vec<u32>,
    index: WeightedIndex<u32>,
}

impl<T: Clone> WeightedSelector<T> {
    /// Builds a selector, discarding options with non-positive weight.
    ///
    /// # Errors
    /// Returns [`ActionError::InvalidConfig`] when no option has a positive weight.
    pub fn new(options: impl IntoIterator<Item = WeightedOption<T>>) -> Result<Self, ActionError> {
        let (values, weights): (Vec<T>, Vec<u32>) = options
            .into_iter()
            .filter_map(|option| {
                u32::try_from(option.weight)
                    .ok()
                    .filter(|weight| *weight > 0)
                    .map(|weight| (option.value, weight))
            })
            .unzip();
        if values.is_empty() {
            return Err(ActionError::InvalidConfig(
                "weighted selector needs at least one positive weight".into(),
            ));
        }
        let index = WeightedIndex::new(weights.iter().copied())
            .map_err(|err| ActionError::InvalidConfig(err.to_string()))?;
        Ok(Self {
            values,
            weights,
            index,
        })
    }

    /// Draws the next value from `rng`.
    pub fn next<R: Rng + ?Sized>(&self, rng: &mut R) -> T {
        self.values[self.index.sample(rng)].clone()
    }

    /// Values that can be selected, in configuration order.
    #[must_use]
    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Probability of selecting the value at `position`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn probability(&self, position: usize) -> f64 {
        let total: u64 = self.weights.iter().map(|weight| u64::from(*weight)).sum();
        self.weights
            .get(position)
            .map_or(0.0, |weight| f64::from(*weight) / total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn options() -> Vec<WeightedOption<&'static str>> {
        vec![
            WeightedOption::new("tank", 1),
            WeightedOption::new("mob", 3),
            WeightedOption::new("witch", 0),
            WeightedOption::new("smoker", -4),
        ]
    }

    #[test]
    fn rejects_tables_without_positive_weight() {
        let err = WeightedSelector::new(vec![WeightedOption::new(1, 0), WeightedOption::new(2, -1)])
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidConfig(_)));
        assert!(WeightedSelector::<u8>::new(Vec::new()).is_err());
    }

    #[test]
    fn seeded_sources_reproduce_sequences() {
        let selector = WeightedSelector::new(options()).unwrap();
        let mut first = StdRng::seed_from_u64(42);
        let mut second = StdRng::seed_from_u64(42);
        let a: Vec<_> = (0..64).map(|_| selector.next(&mut first)).collect();
        let b: Vec<_> = (0..64).map(|_| selector.next(&mut second)).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn never_returns_non_positive_weights() {
        let selector = WeightedSelector::new(options()).unwrap();
        assert_eq!(selector.values(), &["tank", "mob"]);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..2_000 {
            let value = selector.next(&mut rng);
            assert!(value == "tank" || value == "mob");
        }
    }

    #[test]
    fn distribution_converges_to_weights() {
        let selector = WeightedSelector::new(options()).unwrap();
        let mut rng = StdRng::seed_from_u64(1234);
        let draws = 40_000;
        let mobs = (0..draws)
            .filter(|_| selector.next(&mut rng) == "mob")
            .count();
        let observed = mobs as f64 / f64::from(draws);
        assert!((observed - selector.probability(1)).abs() < 0.02, "{observed}");
        assert!((selector.probability(1) - 0.75).abs() < f64::EPSILON);
    }
}
