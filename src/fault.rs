use std::sync::Mutex;
use std::time::Duration;
#[cfg(test)] use mockall::automock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use crate::config::ChannelConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitFlip {
    pub byte_index: usize,
    pub bit_index: u8,
}

/// What the channel does to a single outgoing frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Impairment {
    pub drop: bool,
    pub damage: Option<BitFlip>,
    pub extra_delay: Option<Duration>,
}

/// Decides how each outgoing frame is impaired. This is a trait so that tests can script
///  exactly which frames get lost or damaged.
#[cfg_attr(test, automock)]
pub trait FaultSource: Send + Sync + 'static {
    fn impair(&self, frame_len: usize) -> Impairment;
}

pub struct NoFaults;

impl FaultSource for NoFaults {
    fn impair(&self, _frame_len: usize) -> Impairment {
        Impairment::default()
    }
}

/// Independent random decisions per frame with the configured probabilities
pub struct RandomFaults {
    drop_probability: f64,
    damage_probability: f64,
    delay_probability: f64,
    max_extra_delay: Duration,
    rng: Mutex<StdRng>,
}

impl RandomFaults {
    pub fn new(config: &ChannelConfig) -> anyhow::Result<RandomFaults> {
        config.validate()?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(RandomFaults {
            drop_probability: probability(config.drop_percent),
            damage_probability: probability(config.damage_percent),
            delay_probability: probability(config.delay_percent),
            max_extra_delay: config.max_extra_delay(),
            rng: Mutex::new(rng),
        })
    }
}

/// `percent` must be validated to be at most 100
fn probability(percent: u8) -> f64 {
    percent as f64 / 100.0
}

impl FaultSource for RandomFaults {
    fn impair(&self, frame_len: usize) -> Impairment {
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };

        if rng.gen_bool(self.drop_probability) {
            return Impairment { drop: true, ..Impairment::default() };
        }

        let damage = if frame_len > 0 && rng.gen_bool(self.damage_probability) {
            Some(BitFlip {
                byte_index: rng.gen_range(0..frame_len),
                bit_index: rng.gen_range(0..8),
            })
        }
        else {
            None
        };

        let extra_delay = if rng.gen_bool(self.delay_probability) {
            if self.max_extra_delay.is_zero() {
                Some(Duration::ZERO)
            }
            else {
                Some(rng.gen_range(Duration::ZERO..self.max_extra_delay))
            }
        }
        else {
            None
        };

        Impairment { drop: false, damage, extra_delay }
    }
}
