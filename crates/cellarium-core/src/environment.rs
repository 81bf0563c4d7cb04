//! Static environment fields sampled by world coordinate.
//!
//! Three coarse scalar fields cover the world rectangle: solar intensity,
//! poison concentration, and a barrier mask. Fields are generated once at
//! construction from a seeded procedure (white noise smoothed by box-blur
//! passes, then shaped per field), so the same seed always reproduces the
//! same samples. Coordinates outside the world read as zero solar, zero
//! poison, and blocked.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};

use crate::SOLAR_CONSTANT_RANGE;

/// Fraction of the normalized noise range above which a cell is a barrier.
const BARRIER_THRESHOLD: f32 = 0.82;
/// Poison values below this read as clean; keeps hotspots sparse.
const POISON_CUTOFF: f32 = 0.05;

/// Static solar, poison, and barrier fields over the world rectangle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    world_size: f32,
    resolution: usize,
    solar_constant: f32,
    solar: Vec<f32>,
    poison: Vec<f32>,
    barrier: Vec<bool>,
}

impl Environment {
    /// Generate fields from a seed. Identical seeds produce identical fields.
    #[must_use]
    pub fn generate(world_size: f32, resolution: u32, seed: u64) -> Self {
        let res = resolution.max(1) as usize;
        let mut rng = SmallRng::seed_from_u64(seed);

        let mut solar = noise_field(&mut rng, res);
        blur(&mut solar, res, 3);
        normalize(&mut solar);

        let mut poison = vec![0.0f32; res * res];
        let hotspots = (res / 12).max(3);
        for _ in 0..hotspots {
            let cx = rng.random_range(0..res);
            let cy = rng.random_range(0..res);
            poison[cy * res + cx] = 1.0;
        }
        blur(&mut poison, res, 2);
        normalize(&mut poison);
        for value in &mut poison {
            if *value < POISON_CUTOFF {
                *value = 0.0;
            }
        }

        let mut ridges = noise_field(&mut rng, res);
        blur(&mut ridges, res, 2);
        normalize(&mut ridges);
        let barrier = ridges.iter().map(|&v| v > BARRIER_THRESHOLD).collect();

        Self {
            world_size,
            resolution: res,
            solar_constant: 1.0,
            solar,
            poison,
            barrier,
        }
    }

    /// An environment with no solar, no poison, and no barriers.
    #[must_use]
    pub fn sterile(world_size: f32, resolution: u32) -> Self {
        let res = resolution.max(1) as usize;
        Self {
            world_size,
            resolution: res,
            solar_constant: 1.0,
            solar: vec![0.0; res * res],
            poison: vec![0.0; res * res],
            barrier: vec![false; res * res],
        }
    }

    /// Solar intensity at `(x, y)`, in `[0, solar_constant]`.
    #[must_use]
    pub fn solar(&self, x: f32, y: f32) -> f32 {
        self.cell(x, y)
            .map_or(0.0, |cell| self.solar[cell] * self.solar_constant)
    }

    /// Poison concentration at `(x, y)`; zero almost everywhere.
    #[must_use]
    pub fn poison(&self, x: f32, y: f32) -> f32 {
        self.cell(x, y).map_or(0.0, |cell| self.poison[cell])
    }

    /// Returns true for barrier cells and any out-of-world coordinate.
    #[must_use]
    pub fn blocked(&self, x: f32, y: f32) -> bool {
        self.cell(x, y).is_none_or(|cell| self.barrier[cell])
    }

    /// Current global solar multiplier.
    #[must_use]
    pub fn solar_constant(&self) -> f32 {
        self.solar_constant
    }

    /// Set the solar multiplier, clamped to its documented range.
    pub fn set_solar_constant(&mut self, value: f32) {
        self.solar_constant = value.clamp(SOLAR_CONSTANT_RANGE.0, SOLAR_CONSTANT_RANGE.1);
    }

    /// Per-axis field resolution.
    #[must_use]
    pub fn resolution(&self) -> usize {
        self.resolution
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn cell(&self, x: f32, y: f32) -> Option<usize> {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        if x < 0.0 || y < 0.0 || x >= self.world_size || y >= self.world_size {
            return None;
        }
        let scale = self.resolution as f32 / self.world_size;
        let cx = ((x * scale) as usize).min(self.resolution - 1);
        let cy = ((y * scale) as usize).min(self.resolution - 1);
        Some(cy * self.resolution + cx)
    }
}

fn noise_field(rng: &mut SmallRng, res: usize) -> Vec<f32> {
    (0..res * res).map(|_| rng.random_range(0.0..1.0)).collect()
}

/// 3x3 box blur with clamped edges, `passes` times.
fn blur(field: &mut [f32], res: usize, passes: usize) {
    let mut scratch = vec![0.0f32; field.len()];
    for _ in 0..passes {
        for y in 0..res {
            for x in 0..res {
                let mut sum = 0.0;
                let mut count = 0.0;
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let nx = x as i64 + dx;
                        let ny = y as i64 + dy;
                        if nx < 0 || ny < 0 || nx >= res as i64 || ny >= res as i64 {
                            continue;
                        }
                        sum += field[ny as usize * res + nx as usize];
                        count += 1.0;
                    }
                }
                scratch[y * res + x] = sum / count;
            }
        }
        field.copy_from_slice(&scratch);
    }
}

/// Rescale a field to span `[0, 1]`.
fn normalize(field: &mut [f32]) {
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for &value in field.iter() {
        lo = lo.min(value);
        hi = hi.max(value);
    }
    let span = hi - lo;
    if span <= f32::EPSILON {
        field.fill(0.0);
        return;
    }
    for value in field.iter_mut() {
        *value = (*value - lo) / span;
    }
}
