// Per-request noise sources for the sampler

use rand::rngs::StdRng;
use rand::SeedableRng;

/// Supplies a fresh generator for each sampling call.
///
/// Generators are never shared between requests, so one request's draws
/// cannot shift another's.
pub trait RandomSource: Send + Sync {
    fn request_rng(&self) -> StdRng;

    fn describe(&self) -> String;
}

/// Seeding strategy selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPolicy {
    /// Same seed for every request: identical inputs give identical outputs
    Fixed(u64),
    /// New OS entropy per request
    Fresh,
}

impl Default for SeedPolicy {
    fn default() -> Self {
        SeedPolicy::Fixed(100)
    }
}

impl SeedPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("random") || raw.eq_ignore_ascii_case("fresh") {
            return Some(SeedPolicy::Fresh);
        }
        raw.parse().ok().map(SeedPolicy::Fixed)
    }
}

impl RandomSource for SeedPolicy {
    fn request_rng(&self) -> StdRng {
        match *self {
            SeedPolicy::Fixed(seed) => StdRng::seed_from_u64(seed),
            SeedPolicy::Fresh => StdRng::from_os_rng(),
        }
    }

    fn describe(&self) -> String {
        match self {
            SeedPolicy::Fixed(seed) => format!("fixed({})", seed),
            SeedPolicy::Fresh => "fresh".to_string(),
        }
    }
}
