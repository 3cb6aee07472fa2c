//! Randomized credential sampling.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::ApiKey;
use crate::error::{Error, Result};

/// Fixed set of interchangeable upstream credentials.
///
/// No health is tracked: a key that failed for one request is offered again
/// to the next one, since quota errors are usually transient.
#[derive(Debug, Clone, Default)]
pub struct CredentialPool {
    keys: Vec<ApiKey>,
}

impl CredentialPool {
    /// Create a pool holding `keys` in configured order.
    pub fn new(keys: Vec<ApiKey>) -> Self {
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// All keys in configured order.
    pub fn keys(&self) -> &[ApiKey] {
        &self.keys
    }

    /// Draw a uniformly random permutation of the pool, truncated to `limit`.
    pub fn sample(&self, limit: usize) -> Result<Vec<ApiKey>> {
        self.sample_with(&mut rand::thread_rng(), limit)
    }

    /// [`CredentialPool::sample`] with a caller-provided RNG.
    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R, limit: usize) -> Result<Vec<ApiKey>> {
        if self.keys.is_empty() {
            return Err(Error::NoCredentials);
        }

        let mut order = self.keys.clone();
        order.shuffle(rng);
        order.truncate(limit);

        tracing::debug!(
            pool_size = self.keys.len(),
            sampled = order.len(),
            "Sampled credential order"
        );

        Ok(order)
    }
}
