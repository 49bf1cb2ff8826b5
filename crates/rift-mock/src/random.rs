//! Process-wide random source for fake-data generation.
//!
//! Template helpers draw from one seeded generator behind a mutex so that
//! concurrent renders are safe.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

static RNG: Lazy<Mutex<StdRng>> = Lazy::new(|| Mutex::new(StdRng::from_entropy()));

/// Run `f` with exclusive access to the shared generator.
pub fn with_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    let mut rng = RNG.lock();
    f(&mut rng)
}
