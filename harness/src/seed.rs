use rand::{SeedableRng, rngs::StdRng};

/// Seeds every pseudo-random source a worker uses from a single integer.
///
/// The seed travels explicitly with each worker instead of being set on a global, so several
/// worker contexts can live in one process without sharing RNG state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedController {
    seed: u64,
}

/// The seeded sources of one worker.
#[derive(Debug, Clone)]
pub struct SeededRngs {
    seed: u64,
    /// General purpose source (shuffles, augmentation).
    pub general: StdRng,
    /// Source for numerical array initialization.
    pub numeric: StdRng,
    /// One source per visible device.
    pub devices: Vec<StdRng>,
}

impl SeedController {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Seeds every source with the same literal seed.
    ///
    /// # Arguments
    /// * `visible_devices` - The amount of devices visible to this worker.
    ///
    /// # Returns
    /// The worker's seeded sources.
    pub fn seed_all(&self, visible_devices: usize) -> SeededRngs {
        let seed = self.seed;

        SeededRngs {
            seed,
            general: StdRng::seed_from_u64(seed),
            numeric: StdRng::seed_from_u64(seed),
            devices: (0..visible_devices)
                .map(|_| StdRng::seed_from_u64(seed))
                .collect(),
        }
    }
}

impl SeededRngs {
    /// The seed these sources were created from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// The source of the device with the given ordinal, if it is visible.
    pub fn device(&mut self, ordinal: usize) -> Option<&mut StdRng> {
        self.devices.get_mut(ordinal)
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    #[test]
    fn same_seed_same_streams() {
        let mut a = SeedController::new(1640).seed_all(2);
        let mut b = SeedController::new(1640).seed_all(2);

        let xs: Vec<u64> = (0..8).map(|_| a.general.random()).collect();
        let ys: Vec<u64> = (0..8).map(|_| b.general.random()).collect();
        assert_eq!(xs, ys);

        let x: f32 = a.numeric.random();
        let y: f32 = b.numeric.random();
        assert_eq!(x.to_bits(), y.to_bits());

        let x: u32 = a.device(1).unwrap().random();
        let y: u32 = b.device(1).unwrap().random();
        assert_eq!(x, y);
    }

    #[test]
    fn independent_contexts_do_not_interfere() {
        let mut a = SeedController::new(7).seed_all(0);
        let first: u64 = a.general.random();

        let mut b = SeedController::new(7).seed_all(0);
        let _: u64 = a.general.random();
        let second: u64 = b.general.random();

        assert_eq!(first, second);
    }

    #[test]
    fn cpu_workers_have_no_device_sources() {
        let mut rngs = SeedController::new(1).seed_all(0);
        assert!(rngs.device(0).is_none());
    }
}
