//! Device assignment and trial-id policies.

use gs_types::{invalid_field, ConfigurationError};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Picks the device the next trial is bound to.
pub trait DevicePolicy: Send {
    fn next_device(&mut self) -> u32;

    /// Human-readable policy name.
    fn name(&self) -> &str;
}

/// Every trial goes to the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantDevice(pub u32);

impl DevicePolicy for ConstantDevice {
    fn next_device(&mut self) -> u32 {
        self.0
    }

    fn name(&self) -> &str {
        "constant"
    }
}

/// Cycles through a fixed device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRobin {
    devices: Vec<u32>,
    cursor: usize,
}

impl RoundRobin {
    pub fn new(devices: Vec<u32>) -> Result<Self, ConfigurationError> {
        if devices.is_empty() {
            return Err(invalid_field!("devices", "round-robin needs at least one device"));
        }
        Ok(Self { devices, cursor: 0 })
    }
}

impl DevicePolicy for RoundRobin {
    fn next_device(&mut self) -> u32 {
        let device = self.devices[self.cursor];
        self.cursor = (self.cursor + 1) % self.devices.len();
        device
    }

    fn name(&self) -> &str {
        "round_robin"
    }
}

/// Upper bound of randomly drawn trial ids.
pub const MAX_RANDOM_TRIAL_ID: u64 = 1_000_000;

/// How trial ids are assigned within a sampling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TrialIdPolicy {
    /// Uniform in [1, 1 000 000]; collisions within a run are possible.
    Random,
    /// Monotonic counter; unique within the run.
    Sequential { next: u64 },
}

impl TrialIdPolicy {
    pub fn sequential_from(base: u64) -> Self {
        Self::Sequential { next: base }
    }

    /// Counter starting at a random base, so ids stay unique within the run
    /// and unlikely to repeat across runs writing to the same model directory.
    pub fn sequential_with_random_base<R: Rng>(rng: &mut R) -> Self {
        Self::Sequential {
            next: rng.gen_range(1..=MAX_RANDOM_TRIAL_ID),
        }
    }

    pub fn next_id<R: Rng>(&mut self, rng: &mut R) -> u64 {
        match self {
            Self::Random => rng.gen_range(1..=MAX_RANDOM_TRIAL_ID),
            Self::Sequential { next } => {
                let id = *next;
                *next += 1;
                id
            }
        }
    }
}

impl Default for TrialIdPolicy {
    fn default() -> Self {
        Self::sequential_from(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    #[test]
    fn constant_device_never_rotates() {
        let mut policy = ConstantDevice(1);
        let devices: Vec<u32> = (0..5).map(|_| policy.next_device()).collect();
        assert_eq!(devices, vec![1; 5]);
    }

    #[test]
    fn round_robin_cycles() {
        let mut policy = RoundRobin::new(vec![0, 2, 3]).unwrap();
        let devices: Vec<u32> = (0..7).map(|_| policy.next_device()).collect();
        assert_eq!(devices, vec![0, 2, 3, 0, 2, 3, 0]);
        assert_eq!(policy.name(), "round_robin");
    }

    #[test]
    fn round_robin_rejects_empty() {
        assert!(RoundRobin::new(Vec::new()).is_err());
    }

    #[test]
    fn sequential_ids_are_unique() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut policy = TrialIdPolicy::sequential_with_random_base(&mut rng);
        let ids: HashSet<u64> = (0..1000).map(|_| policy.next_id(&mut rng)).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn random_ids_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut policy = TrialIdPolicy::Random;
        for _ in 0..500 {
            let id = policy.next_id(&mut rng);
            assert!((1..=MAX_RANDOM_TRIAL_ID).contains(&id));
        }
    }
}
