//! Count-min sketch used as the cheap admission pre-filter.
//!
//! The sketch never undercounts: every key owns one cell per row, and its
//! estimate is the smallest of those cells, each of which has seen at least
//! every increment for the key. Collisions can only inflate it.

use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{FloodgateError, Result};

/// Modulus of the affine row hashes (2^61 - 1, a Mersenne prime).
const MERSENNE_61: u64 = (1 << 61) - 1;

/// One `x -> ((a·x + b) mod p) mod width` hash function.
#[derive(Debug, Clone, Copy)]
struct RowHash {
    a: u64,
    b: u64,
}

impl RowHash {
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            a: rng.gen_range(1..MERSENNE_61),
            b: rng.gen_range(0..MERSENNE_61),
        }
    }

    fn column(&self, x: u64, width: usize) -> usize {
        let mixed = (self.a as u128 * x as u128 + self.b as u128) % MERSENNE_61 as u128;
        (mixed as u64 % width as u64) as usize
    }
}

/// A lock-free count-min sketch.
///
/// Sized from an error factor `ε` and a failure probability `δ`:
/// `width = ceil(e / ε)` and `depth = ceil(ln(1 / δ))`, with at least one row.
pub struct FrequencyEstimator {
    width: usize,
    rows: Box<[(Box<[AtomicU64]>, RowHash)]>,
}

impl FrequencyEstimator {
    /// Create an estimator with hash coefficients drawn from the thread RNG.
    pub fn new(epsilon: f64, delta: f64) -> Result<Self> {
        Self::with_rng(epsilon, delta, &mut rand::thread_rng())
    }

    /// Create an estimator drawing its hash coefficients from `rng`.
    pub fn with_rng<R: Rng + ?Sized>(epsilon: f64, delta: f64, rng: &mut R) -> Result<Self> {
        if !(epsilon > 0.0 && epsilon < 1.0) {
            return Err(FloodgateError::Config(format!(
                "estimator epsilon must be in (0, 1), got {}",
                epsilon
            )));
        }
        if !(delta > 0.0 && delta < 1.0) {
            return Err(FloodgateError::Config(format!(
                "estimator delta must be in (0, 1), got {}",
                delta
            )));
        }

        let width = (std::f64::consts::E / epsilon).ceil() as usize;
        let depth = ((1.0 / delta).ln().ceil() as usize).max(1);
        Ok(Self::with_dimensions(depth, width, rng))
    }

    /// Create an estimator with explicit dimensions.
    pub fn with_dimensions<R: Rng + ?Sized>(depth: usize, width: usize, rng: &mut R) -> Self {
        let width = width.max(1);
        let rows = (0..depth.max(1))
            .map(|_| {
                let cells = (0..width).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();
                (cells.into_boxed_slice(), RowHash::random(rng))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { width, rows }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn depth(&self) -> usize {
        self.rows.len()
    }

    /// Record `increment` occurrences of `key` and return its new estimate.
    pub fn update(&self, key: &str, increment: u64) -> u64 {
        let x = key_to_int(key);
        self.rows
            .iter()
            .map(|(cells, hash)| {
                let cell = &cells[hash.column(x, self.width)];
                cell.fetch_add(increment, Ordering::Relaxed).saturating_add(increment)
            })
            .min()
            .unwrap_or(0)
    }

    /// Upper-bound estimate of how many times `key` has been recorded.
    pub fn estimate(&self, key: &str) -> u64 {
        let x = key_to_int(key);
        self.rows
            .iter()
            .map(|(cells, hash)| cells[hash.column(x, self.width)].load(Ordering::Relaxed))
            .min()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for FrequencyEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrequencyEstimator")
            .field("depth", &self.depth())
            .field("width", &self.width)
            .finish()
    }
}

/// Deterministic non-negative integer for a key, reduced into the hash field.
fn key_to_int(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() % MERSENNE_61
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn seeded(epsilon: f64, delta: f64) -> FrequencyEstimator {
        FrequencyEstimator::with_rng(epsilon, delta, &mut StdRng::seed_from_u64(7)).unwrap()
    }

    #[test]
    fn test_dimensions_from_parameters() {
        let est = seeded(0.001, 0.99);
        assert_eq!(est.width(), 2719);
        assert_eq!(est.depth(), 1);

        let est = seeded(0.01, 0.01);
        assert_eq!(est.width(), 272);
        assert_eq!(est.depth(), 5);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(FrequencyEstimator::new(0.0, 0.5).is_err());
        assert!(FrequencyEstimator::new(1.5, 0.5).is_err());
        assert!(FrequencyEstimator::new(0.1, 1.0).is_err());
        assert!(FrequencyEstimator::new(0.1, f64::NAN).is_err());
    }

    #[test]
    fn test_unseen_key_estimates_zero() {
        let est = seeded(0.01, 0.01);
        assert_eq!(est.estimate("nobody"), 0);
    }

    #[test]
    fn test_estimate_monotone_and_never_undercounts() {
        let est = seeded(0.1, 0.1);
        let mut previous = 0;
        for i in 1..=200u64 {
            let returned = est.update("client", 1);
            let estimate = est.estimate("client");
            assert!(estimate >= i, "estimate {} below true count {}", estimate, i);
            assert!(estimate >= previous);
            assert!(returned <= estimate);
            previous = estimate;
            // noise from other keys may only push estimates up
            est.update(&format!("noise-{}", i % 17), 3);
        }
    }

    #[test]
    fn test_heavy_and_light_keys() {
        let est = seeded(0.001, 0.99);
        for _ in 0..1000 {
            est.update("A", 1);
        }
        for _ in 0..10 {
            est.update("B", 1);
        }

        assert!(est.estimate("A") >= 1000);
        assert!(est.estimate("B") >= 10);
        assert!(est.estimate("A") > est.estimate("B"));
    }

    #[test]
    fn test_custom_increment() {
        let est = seeded(0.01, 0.1);
        assert_eq!(est.update("bulk", 5), 5);
        assert!(est.estimate("bulk") >= 5);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        // A single column forces every key into the same cell.
        let est = Arc::new(FrequencyEstimator::with_dimensions(
            2,
            1,
            &mut StdRng::seed_from_u64(1),
        ));

        std::thread::scope(|scope| {
            for t in 0..8 {
                let est = Arc::clone(&est);
                scope.spawn(move || {
                    for _ in 0..1000 {
                        est.update(&format!("thread-{}", t), 1);
                    }
                });
            }
        });

        assert_eq!(est.estimate("thread-0"), 8000);
    }
}
