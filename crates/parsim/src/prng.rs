use crate::error::{ErrorOrigin, PipelineError};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

/// Generator handle shared between a store connection, its custom SQL
/// functions and the generative plugins bound to it.
///
/// The inner mutex serializes draws; by convention a store connection is
/// driven from a single thread, so the lock is uncontended.
pub type SharedGenerator = Arc<Mutex<ChaCha8Rng>>;

/// Lock a shared generator, recovering from a poisoned mutex.
///
/// Poisoning can only happen if a panic unwound through a draw; the
/// generator state itself is always valid.
pub fn lock(generator: &SharedGenerator) -> MutexGuard<'_, ChaCha8Rng> {
    generator.lock().unwrap_or_else(PoisonError::into_inner)
}

///
/// PrngToken
///
/// Opaque identity of one store connection inside a [`PrngRegistry`].
/// A connection refresh mints a new token; tokens are never reused.
///

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PrngToken(u64);

///
/// PrngRegistry
///
/// Maps connection identities to seeded generators. Owned by the pipeline
/// driver and passed by reference to every component that needs randomness;
/// there is no process-global state.
///
/// The map itself is mutex-guarded; the generators handed out are locked
/// per draw (see [`SharedGenerator`]). Reproducibility contract: two
/// registries driven with identical seeds and identical draw sequences
/// produce bit-identical values.
///

pub struct PrngRegistry {
    generators: Mutex<HashMap<PrngToken, SharedGenerator>>,
    next_token: AtomicU64,
}

impl PrngRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            generators: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Mint a fresh connection identity.
    pub fn mint_token(&self) -> PrngToken {
        PrngToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Return the generator bound to `token`, creating or reseeding it.
    ///
    /// - bound + `Some(seed)`: the generator is reseeded in place and its
    ///   output sequence restarts from the new seed;
    /// - bound + `None`: the generator is returned as is;
    /// - absent + `Some(seed)`: a new generator is created;
    /// - absent + `None`: a `Configuration` error, unless the `os-seeding`
    ///   feature opts in to a nondeterministic entropy seed.
    pub fn get_or_create(
        &self,
        token: PrngToken,
        seed: Option<u64>,
    ) -> Result<SharedGenerator, PipelineError> {
        let mut table = self.table();

        if let Some(generator) = table.get(&token) {
            if let Some(seed) = seed {
                *lock(generator) = ChaCha8Rng::seed_from_u64(seed);
            }
            return Ok(Arc::clone(generator));
        }

        let seed = match seed {
            Some(seed) => seed,
            None => Self::fallback_seed()?,
        };

        let generator: SharedGenerator = Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed)));
        table.insert(token, Arc::clone(&generator));

        Ok(generator)
    }

    /// Drop the generator bound to `token`. Returns whether one was bound.
    pub fn release(&self, token: PrngToken) -> bool {
        self.table().remove(&token).is_some()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PrngToken, SharedGenerator>> {
        self.generators.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(feature = "os-seeding")]
    fn fallback_seed() -> Result<u64, PipelineError> {
        use rand::Rng;
        Ok(rand::rng().random())
    }

    #[cfg(not(feature = "os-seeding"))]
    fn fallback_seed() -> Result<u64, PipelineError> {
        Err(PipelineError::config(
            ErrorOrigin::Prng,
            "unseeded generator requested; pass a seed or enable the `os-seeding` feature",
        ))
    }
}

impl Default for PrngRegistry {
    fn default() -> Self {
        Self::new()
    }
}

///
/// TESTS
///

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn draw_sequence(registry: &PrngRegistry, token: PrngToken, n: usize) -> Vec<f64> {
        let generator = registry
            .get_or_create(token, None)
            .expect("generator should be bound");
        let mut rng = lock(&generator);
        (0..n).map(|_| rng.random::<f64>()).collect()
    }

    #[test]
    fn identical_seeds_produce_identical_sequences() {
        let a = PrngRegistry::new();
        let b = PrngRegistry::new();
        let ta = a.mint_token();
        let tb = b.mint_token();

        a.get_or_create(ta, Some(42)).expect("seeded");
        b.get_or_create(tb, Some(42)).expect("seeded");

        assert_eq!(draw_sequence(&a, ta, 16), draw_sequence(&b, tb, 16));
    }

    #[test]
    fn reseeding_resets_the_sequence() {
        let registry = PrngRegistry::new();
        let token = registry.mint_token();

        registry.get_or_create(token, Some(7)).expect("seeded");
        let first = draw_sequence(&registry, token, 8);

        // Advance the stream, then reseed: the sequence must restart
        // independent of prior draws.
        draw_sequence(&registry, token, 100);
        registry.get_or_create(token, Some(7)).expect("reseeded");

        assert_eq!(first, draw_sequence(&registry, token, 8));
    }

    #[test]
    fn distinct_tokens_have_independent_generators() {
        let registry = PrngRegistry::new();
        let ta = registry.mint_token();
        let tb = registry.mint_token();

        registry.get_or_create(ta, Some(1)).expect("seeded");
        registry.get_or_create(tb, Some(2)).expect("seeded");

        assert_ne!(draw_sequence(&registry, ta, 4), draw_sequence(&registry, tb, 4));
    }

    #[cfg(not(feature = "os-seeding"))]
    #[test]
    fn missing_seed_is_a_configuration_error() {
        let registry = PrngRegistry::new();
        let token = registry.mint_token();

        let err = registry
            .get_or_create(token, None)
            .expect_err("unseeded creation must fail");
        assert!(err.is_configuration());
    }

    #[test]
    fn release_unbinds_the_generator() {
        let registry = PrngRegistry::new();
        let token = registry.mint_token();

        registry.get_or_create(token, Some(5)).expect("seeded");
        assert!(registry.release(token));
        assert!(!registry.release(token));
    }
}
