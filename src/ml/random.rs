use std::{ops::Deref, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::ml::NodeValue;

use self::rc::ArcRng;

/// Random source abstraction: uniform samples in `[0, 1)`, with range and
/// normal sampling derived from them.
pub trait Rng {
    fn rand(&self) -> NodeValue;

    fn rand_range(&self, min: usize, exclusive_max: usize) -> usize {
        (self.rand() * (exclusive_max - min) as NodeValue) as usize + min
    }

    /// Standard normal sample via the Box-Muller transform.
    fn rand_normal(&self) -> NodeValue {
        let u1 = 1.0 - self.rand();
        let u2 = 1.0 - self.rand();
        let two_pi = 2.0 * std::f64::consts::PI as NodeValue;
        (-2.0 * u1.ln()).sqrt() * (two_pi * u2).sin()
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "SerializedRngStrategy", into = "SerializedRngStrategy")]
pub enum RngStrategy {
    Default,

    Debug { seed: u64 },

    Cached(ArcRng, Arc<RngStrategy>),
}

impl Default for RngStrategy {
    fn default() -> Self {
        Self::Default.upgrade()
    }
}

impl Deref for RngStrategy {
    type Target = dyn Rng;

    fn deref(&self) -> &Self::Target {
        self
    }
}

impl Rng for RngStrategy {
    fn rand(&self) -> NodeValue {
        self.with_rng(|x| x.rand())
    }
}

impl RngStrategy {
    pub fn testable(seed: u64) -> Self {
        RngStrategy::Debug { seed }.upgrade()
    }

    pub fn to_arc(&self) -> Arc<dyn Rng> {
        match self {
            RngStrategy::Cached(instance, _) => instance.rng.clone(),
            rng => rng.factory().into(),
        }
    }

    pub fn with_rng<F: Fn(&dyn Rng) -> O, O>(&self, func: F) -> O {
        match self {
            RngStrategy::Cached(instance, _) => func(instance.as_ref()),
            rng => func(&*rng.factory()),
        }
    }

    /// Caches a single live generator instance so repeated sampling reuses
    /// one source rather than building a fresh generator per call.
    pub fn upgrade(self) -> Self {
        match self {
            RngStrategy::Cached(instance, strategy) => RngStrategy::Cached(instance, strategy),
            rng => RngStrategy::Cached(rng.to_arc().into(), Arc::new(rng)),
        }
    }

    fn factory(&self) -> Box<dyn Rng> {
        match self {
            RngStrategy::Default => Box::new(SystemRng::default()),
            RngStrategy::Debug { seed } => Box::new(SeedableTestRng::new(*seed)),
            RngStrategy::Cached(instance, _) => Box::new(instance.clone()),
        }
    }

    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(..))
    }

    #[must_use]
    pub fn is_debug(&self) -> bool {
        match self {
            Self::Debug { .. } => true,
            Self::Cached(_, inner) => inner.is_debug(),
            _ => false,
        }
    }
}

unsafe impl Send for RngStrategy {}

impl std::fmt::Debug for RngStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "Default"),
            Self::Debug { seed } => f.debug_struct("Debug").field("seed", seed).finish(),
            Self::Cached(_, inner) => f.debug_struct("Cached").field("inner", inner).finish(),
        }
    }
}

/// Serialized form: the live generator is never persisted, only the strategy
/// that recreates one.
#[derive(Serialize, Deserialize)]
#[serde(rename = "RngStrategy")]
enum SerializedRngStrategy {
    Default,
    Debug { seed: u64 },
}

impl From<RngStrategy> for SerializedRngStrategy {
    fn from(value: RngStrategy) -> Self {
        let mut inner = &value;
        while let RngStrategy::Cached(_, child) = inner {
            inner = child.as_ref();
        }
        match inner {
            RngStrategy::Default => Self::Default,
            RngStrategy::Debug { seed } => Self::Debug { seed: *seed },
            RngStrategy::Cached(..) => unreachable!("cached chain was unwrapped"),
        }
    }
}

impl From<SerializedRngStrategy> for RngStrategy {
    fn from(value: SerializedRngStrategy) -> Self {
        match value {
            SerializedRngStrategy::Default => RngStrategy::Default.upgrade(),
            SerializedRngStrategy::Debug { seed } => RngStrategy::Debug { seed }.upgrade(),
        }
    }
}

#[derive(Default)]
pub struct SystemRng(std::cell::RefCell<rand::rngs::ThreadRng>);

impl Rng for SystemRng {
    fn rand(&self) -> NodeValue {
        use rand::Rng;
        self.0.borrow_mut().gen()
    }
}

mod rc {
    use std::{ops::Deref, sync::Arc};

    use super::{Rng, RngStrategy};

    #[derive(Clone)]
    pub struct ArcRng {
        pub rng: Arc<dyn Rng>,
    }

    unsafe impl Send for ArcRng {}
    unsafe impl Sync for ArcRng {}

    impl Default for ArcRng {
        fn default() -> Self {
            Self {
                rng: Arc::new(RngStrategy::default()),
            }
        }
    }

    impl Deref for ArcRng {
        type Target = Arc<dyn Rng>;

        fn deref(&self) -> &Self::Target {
            &self.rng
        }
    }

    impl Rng for ArcRng {
        fn rand(&self) -> super::NodeValue {
            self.rng.rand()
        }
    }

    impl From<Arc<dyn Rng>> for ArcRng {
        fn from(value: Arc<dyn Rng>) -> Self {
            Self { rng: value }
        }
    }
}

pub struct SeedableTestRng(std::sync::Mutex<algo::park_miller::ParkMiller>);

impl SeedableTestRng {
    pub fn new(seed: u64) -> Self {
        Self(std::sync::Mutex::new(algo::park_miller::ParkMiller::new(
            seed,
        )))
    }
}

impl Rng for SeedableTestRng {
    fn rand(&self) -> NodeValue {
        let rand = {
            let mut inner = self.0.lock().expect("rng lock poisoned");
            (inner.rand() - 1) as NodeValue
        };
        rand * algo::park_miller::F64_MULTIPLIER as NodeValue
    }
}

mod algo {
    pub mod park_miller {
        const MODULUS: u64 = 2_147_483_647;
        const MULTIPLIER: u64 = 16_807;

        pub(crate) const F64_MULTIPLIER: f64 = 1.0 / 2_147_483_646 as f64;

        pub struct ParkMiller {
            state: u64,
        }

        impl ParkMiller {
            pub fn new(seed: u64) -> Self {
                Self {
                    state: seed % MODULUS,
                }
            }

            pub fn rand(&mut self) -> u64 {
                self.state = self.state.wrapping_mul(MULTIPLIER) % MODULUS;
                self.state
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rng_strategy_can_be_serialized() {
        let rng_from_variant = RngStrategy::Default;
        let json = serde_json::to_string(&rng_from_variant).unwrap();
        assert!(!json.is_empty());

        let rng_upgraded = rng_from_variant.upgrade();
        let json = serde_json::to_string(&rng_upgraded).unwrap();
        assert!(!json.is_empty());

        let rng_from_variant = RngStrategy::Debug { seed: 1234 };
        let json = serde_json::to_string(&rng_from_variant).unwrap();
        assert!(!json.is_empty());

        let rng_from_factory = RngStrategy::testable(1234);
        let json = serde_json::to_string(&rng_from_factory).unwrap();
        assert!(!json.is_empty());
    }

    #[test]
    fn rng_strategy_can_be_deserialized() {
        let src_rng = RngStrategy::default();
        let json = serde_json::to_string(&src_rng).unwrap();
        let rng: RngStrategy = serde_json::from_str(&json).unwrap();
        assert!(rng.is_cached());
        assert!(!rng.is_debug());

        let src_rng = RngStrategy::testable(1234);
        let json = serde_json::to_string(&src_rng).unwrap();
        let rng: RngStrategy = serde_json::from_str(&json).unwrap();
        assert!(rng.is_cached());
        assert!(rng.is_debug());
    }

    #[test]
    fn rng_strategy_seeded_instances_replay_identically() {
        let rng1 = RngStrategy::testable(1234);
        let rng2 = RngStrategy::testable(1234);

        let samples1: Vec<usize> = (0..32).map(|_| rng1.rand_range(0, 1000)).collect();
        let samples2: Vec<usize> = (0..32).map(|_| rng2.rand_range(0, 1000)).collect();

        assert_eq!(samples1, samples2);
    }

    #[test]
    fn rng_strategy_roundtrip_restarts_seeded_sequence() {
        let src_rng = RngStrategy::testable(1234);
        let first_sample = src_rng.rand();

        let json = serde_json::to_string(&src_rng).unwrap();
        let restored: RngStrategy = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.rand(), first_sample);
    }

    #[test]
    fn seedable_test_rng_samples_uniformly() {
        let rng = SeedableTestRng::new(6);
        assert_rng(&rng);
    }

    #[test]
    fn rand_normal_matches_standard_moments() {
        let rng = RngStrategy::testable(42);

        let iters = 20_000;
        let samples: Vec<NodeValue> = (0..iters).map(|_| rng.rand_normal()).collect();

        let mean = samples.iter().sum::<NodeValue>() / iters as NodeValue;
        let variance =
            samples.iter().map(|x| (x - mean) * (x - mean)).sum::<NodeValue>() / iters as NodeValue;

        assert!(mean.abs() < 0.05, "sample mean drifted: {mean}");
        assert!((variance - 1.0).abs() < 0.05, "sample variance drifted: {variance}");
    }

    fn assert_rng(rng: &dyn Rng) {
        let mut buckets = vec![0; 13];
        let span = 1.0 / buckets.len() as NodeValue;

        let iters = 10_000;
        for _ in 0..iters {
            let rand = rng.rand();
            let bucket_idx = (rand / span) as usize;
            buckets[bucket_idx] += 1;
        }

        let min_expected = iters / (buckets.len() + 1).max((buckets.len() as f64 * 0.1) as usize);
        for (i, bucket) in buckets.iter().enumerate() {
            assert!(
                *bucket > min_expected,
                "bucket[{i}] distribution is not even {:?}",
                buckets
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("bucket[{i}]: {:.1}%", 100.0 * *c as f64 / iters as f64))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        }
    }
}
