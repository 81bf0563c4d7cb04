//! Core types and simulation engine for the Cellarium artificial-life system.
//!
//! The crate is the data/command side of the simulation: a fixed-capacity
//! population of cells that move, feed, fight, reproduce, mutate, cluster
//! into colonies and alliances, and are periodically classified into
//! emergent species. Rendering, input routing, and the host event loop live
//! elsewhere; hosts drive [`Engine::tick`], read the column accessors, and
//! drain the event queue between ticks.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod analytics;
mod engine;
mod environment;
mod events;
mod species;
mod store;

pub use analytics::{Analytics, PopulationSnapshot, SpeciesCount};
pub use engine::{CellSnapshot, Engine, MAX_DT, Telemetry};
pub use environment::Environment;
pub use events::{Event, EventQueue};
pub use species::{SPECIES_EPSILON, SpeciesRecord, SpeciesTracker};
pub use store::{CellStore, MIN_MASS, SPAWN_ENERGY, SPAWN_MASS};

/// Number of genes carried by every cell.
pub const GENOME_LEN: usize = 8;

/// Gene indices into a [`Genome`].
pub const GENE_SPD: usize = 0;
pub const GENE_AGG: usize = 1;
pub const GENE_PHO: usize = 2;
pub const GENE_SIZ: usize = 3;
pub const GENE_DEF: usize = 4;
pub const GENE_VIS: usize = 5;
pub const GENE_MUT: usize = 6;
pub const GENE_LIF: usize = 7;

/// Heritable trait vector, each gene in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Genome(pub [f32; GENOME_LEN]);

impl Genome {
    /// Construct a genome with every gene set to `value`.
    #[must_use]
    pub const fn uniform(value: f32) -> Self {
        Self([value; GENOME_LEN])
    }

    #[must_use]
    pub fn speed(&self) -> f32 {
        self.0[GENE_SPD]
    }

    #[must_use]
    pub fn aggression(&self) -> f32 {
        self.0[GENE_AGG]
    }

    #[must_use]
    pub fn photosynthesis(&self) -> f32 {
        self.0[GENE_PHO]
    }

    #[must_use]
    pub fn size(&self) -> f32 {
        self.0[GENE_SIZ]
    }

    #[must_use]
    pub fn defense(&self) -> f32 {
        self.0[GENE_DEF]
    }

    #[must_use]
    pub fn vision(&self) -> f32 {
        self.0[GENE_VIS]
    }

    #[must_use]
    pub fn mutability(&self) -> f32 {
        self.0[GENE_MUT]
    }

    #[must_use]
    pub fn lifespan(&self) -> f32 {
        self.0[GENE_LIF]
    }

    /// Clamp every gene to `[0, 1]`, mapping non-finite values to zero.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        for gene in &mut self.0 {
            *gene = if gene.is_finite() {
                gene.clamp(0.0, 1.0)
            } else {
                0.0
            };
        }
        self
    }

    /// A genome is viable when at least one sanitized gene is positive.
    /// All-zero and all-NaN inputs both fail this check.
    #[must_use]
    pub fn is_viable(&self) -> bool {
        self.sanitized().0.iter().any(|&gene| gene > 0.0)
    }

    /// Normalized Euclidean distance in `[0, 1]` between two genomes.
    #[must_use]
    pub fn normalized_distance(&self, other: &Self) -> f32 {
        let mut sum = 0.0f32;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let d = a - b;
            sum += d * d;
        }
        (sum.sqrt()) / (GENOME_LEN as f32).sqrt()
    }

    /// Index of the strongest gene; ties resolve to the lowest index.
    #[must_use]
    pub fn dominant_gene(&self) -> usize {
        let mut best = 0;
        for (idx, &gene) in self.0.iter().enumerate() {
            if gene > self.0[best] {
                best = idx;
            }
        }
        best
    }
}

/// Behavioral tag assigned at spawn from the genome, never mutated afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Archetype {
    #[default]
    Average = 0,
    Predator = 1,
    Producer = 2,
    Tank = 3,
    Speedster = 4,
}

impl Archetype {
    /// Number of archetype variants.
    pub const COUNT: usize = 5;

    /// Threshold a dominant gene must reach before it names an archetype.
    pub const THRESHOLD: f32 = 0.7;

    /// Derive the archetype from a genome: the maximum among SPD, AGG, PHO,
    /// and DEF names the tag when it reaches the threshold, ties resolving in
    /// that order; otherwise the cell is Average.
    #[must_use]
    pub fn derive(genome: &Genome) -> Self {
        let candidates = [
            (genome.speed(), Self::Speedster),
            (genome.aggression(), Self::Predator),
            (genome.photosynthesis(), Self::Producer),
            (genome.defense(), Self::Tank),
        ];
        let mut best = candidates[0];
        for &candidate in &candidates[1..] {
            if candidate.0 > best.0 {
                best = candidate;
            }
        }
        if best.0 >= Self::THRESHOLD {
            best.1
        } else {
            Self::Average
        }
    }

    /// Dense index for histogram buckets.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Axis-aligned 2D position in world units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Squared distance to another position.
    #[must_use]
    pub fn distance_sq(&self, other: &Self) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }
}

/// World-space velocity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub vx: f32,
    pub vy: f32,
}

impl Velocity {
    /// Construct a new velocity vector.
    #[must_use]
    pub const fn new(vx: f32, vy: f32) -> Self {
        Self { vx, vy }
    }

    /// Squared magnitude.
    #[must_use]
    pub fn magnitude_sq(&self) -> f32 {
        self.vx.mul_add(self.vx, self.vy * self.vy)
    }

    /// Scale the vector so its magnitude does not exceed `cap`.
    #[must_use]
    pub fn capped(self, cap: f32) -> Self {
        let mag_sq = self.magnitude_sq();
        if cap <= 0.0 {
            return Self::default();
        }
        if mag_sq > cap * cap {
            let scale = cap / mag_sq.sqrt();
            Self::new(self.vx * scale, self.vy * scale)
        } else {
            self
        }
    }
}

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Lineage counter; children carry their parent's generation plus one.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Generation(pub u32);

impl Generation {
    /// Advances to the next lineage generation.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Transient per-cell flag bits. Replaces the metadata-float sentinel of the
/// source design; bits are cleared by the engine on the tick after they are
/// set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellFlags(u8);

impl CellFlags {
    /// Set on a parent for one tick after it reproduces (host glow effect).
    pub const RECENT_BIRTH: Self = Self(1);

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns true when every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

/// Errors that can occur when constructing engine state.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for a Cellarium world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellariumConfig {
    /// Side length of the square world in world units.
    pub world_size: f32,
    /// Fixed number of cell slots allocated at construction.
    pub capacity: usize,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Global multiplier on per-gene mutation deltas (0..10).
    pub mutation_rate: f32,
    /// Multiplier on solar energy gain (0.1..5).
    pub food_abundance: f32,
    /// Multiplicative velocity decay applied once per integrate (0.80..1.00).
    pub friction: f32,
    /// Multiplier applied to all solar samples (0..2).
    pub solar_constant: f32,
    /// Edge length of one spatial-hash cell.
    pub grid_cell_size: f32,
    /// Per-axis resolution of the environment fields.
    pub field_resolution: u32,
    /// Ticks between species identification passes.
    pub species_interval: u32,
    /// Ticks between colony formation passes.
    pub colony_interval: u32,
    /// Ticks between alliance maintenance passes.
    pub alliance_interval: u32,
    /// Maximum events retained before the oldest are dropped.
    pub event_capacity: usize,
    /// Maximum population snapshots retained by analytics.
    pub history_capacity: usize,
    /// Disable solar, poison, and barrier fields (headless tests, benches).
    pub sterile: bool,
}

impl Default for CellariumConfig {
    fn default() -> Self {
        Self {
            world_size: 2_000.0,
            capacity: 4_096,
            rng_seed: None,
            mutation_rate: 1.0,
            food_abundance: 1.0,
            friction: 0.98,
            solar_constant: 1.0,
            grid_cell_size: 50.0,
            field_resolution: 64,
            species_interval: 60,
            colony_interval: 30,
            alliance_interval: 60,
            event_capacity: 1_024,
            history_capacity: 256,
            sterile: false,
        }
    }
}

/// Clamp ranges for the runtime tunables.
pub const MUTATION_RATE_RANGE: (f32, f32) = (0.0, 10.0);
pub const FOOD_ABUNDANCE_RANGE: (f32, f32) = (0.1, 5.0);
pub const FRICTION_RANGE: (f32, f32) = (0.80, 1.00);
pub const SOLAR_CONSTANT_RANGE: (f32, f32) = (0.0, 2.0);

impl CellariumConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.world_size.is_finite() || self.world_size <= 0.0 {
            return Err(CoreError::InvalidConfig(
                "world_size must be positive and finite",
            ));
        }
        if self.capacity == 0 {
            return Err(CoreError::InvalidConfig("capacity must be non-zero"));
        }
        if !self.grid_cell_size.is_finite() || self.grid_cell_size <= 0.0 {
            return Err(CoreError::InvalidConfig("grid_cell_size must be positive"));
        }
        if self.field_resolution == 0 {
            return Err(CoreError::InvalidConfig(
                "field_resolution must be non-zero",
            ));
        }
        if self.species_interval == 0 || self.colony_interval == 0 || self.alliance_interval == 0 {
            return Err(CoreError::InvalidConfig(
                "pass intervals must be non-zero",
            ));
        }
        if self.event_capacity == 0 || self.history_capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "event and history capacities must be non-zero",
            ));
        }
        Ok(())
    }

    /// Apply a partial update, clamping every tunable to its documented range.
    pub fn apply(&mut self, update: &ConfigUpdate) {
        if let Some(rate) = update.mutation_rate {
            self.mutation_rate = rate.clamp(MUTATION_RATE_RANGE.0, MUTATION_RATE_RANGE.1);
        }
        if let Some(food) = update.food_abundance {
            self.food_abundance = food.clamp(FOOD_ABUNDANCE_RANGE.0, FOOD_ABUNDANCE_RANGE.1);
        }
        if let Some(friction) = update.friction {
            self.friction = friction.clamp(FRICTION_RANGE.0, FRICTION_RANGE.1);
        }
        if let Some(solar) = update.solar_constant {
            self.solar_constant = solar.clamp(SOLAR_CONSTANT_RANGE.0, SOLAR_CONSTANT_RANGE.1);
        }
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
    #[must_use]
    pub(crate) fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }

    /// Environment seed derived from the world seed.
    #[must_use]
    pub(crate) fn environment_seed(&self) -> u64 {
        self.rng_seed.unwrap_or_else(rand::random)
    }
}

/// Partial runtime reconfiguration; absent fields keep their current value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub mutation_rate: Option<f32>,
    pub food_abundance: Option<f32>,
    pub friction: Option<f32>,
    pub solar_constant: Option<f32>,
}

/// Sample a uniform value in `[-limit, limit]`.
pub(crate) fn symmetric_uniform(rng: &mut SmallRng, limit: f32) -> f32 {
    if limit <= 0.0 {
        return 0.0;
    }
    rng.random_range(-limit..=limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genome_sanitize_clamps_and_zeroes_non_finite() {
        let genome = Genome([1.5, -0.2, f32::NAN, f32::INFINITY, 0.5, 0.0, 0.25, 1.0]);
        let clean = genome.sanitized();
        assert_eq!(clean.0, [1.0, 0.0, 0.0, 0.0, 0.5, 0.0, 0.25, 1.0]);
    }

    #[test]
    fn genome_viability_rejects_degenerate_inputs() {
        assert!(!Genome::uniform(0.0).is_viable());
        assert!(!Genome::uniform(f32::NAN).is_viable());
        assert!(Genome::uniform(0.5).is_viable());
    }

    #[test]
    fn genome_distance_is_normalized() {
        let a = Genome::uniform(0.0);
        let b = Genome::uniform(1.0);
        assert!((a.normalized_distance(&b) - 1.0).abs() < 1e-6);
        assert_eq!(a.normalized_distance(&a), 0.0);
    }

    #[test]
    fn dominant_gene_breaks_ties_toward_lowest_index() {
        let genome = Genome([0.4, 0.9, 0.9, 0.1, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(genome.dominant_gene(), GENE_AGG);
    }

    #[test]
    fn archetype_derivation_follows_threshold_and_tie_order() {
        let mut genome = Genome::uniform(0.5);
        assert_eq!(Archetype::derive(&genome), Archetype::Average);

        genome.0[GENE_PHO] = 0.9;
        assert_eq!(Archetype::derive(&genome), Archetype::Producer);

        // SPD wins an exact tie against AGG.
        let tied = Genome([0.8, 0.8, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1]);
        assert_eq!(Archetype::derive(&tied), Archetype::Speedster);

        // Re-derivation of an unchanged genome is stable.
        assert_eq!(Archetype::derive(&tied), Archetype::derive(&tied));
    }

    #[test]
    fn config_apply_clamps_tunables() {
        let mut config = CellariumConfig::default();
        config.apply(&ConfigUpdate {
            mutation_rate: Some(42.0),
            food_abundance: Some(0.0),
            friction: Some(0.5),
            solar_constant: Some(-1.0),
        });
        assert_eq!(config.mutation_rate, 10.0);
        assert_eq!(config.food_abundance, 0.1);
        assert_eq!(config.friction, 0.80);
        assert_eq!(config.solar_constant, 0.0);
    }

    #[test]
    fn config_validation_rejects_degenerate_worlds() {
        let mut config = CellariumConfig::default();
        config.world_size = 0.0;
        assert!(config.validate().is_err());

        let mut config = CellariumConfig::default();
        config.capacity = 0;
        assert!(config.validate().is_err());

        assert!(CellariumConfig::default().validate().is_ok());
    }

    #[test]
    fn velocity_cap_preserves_direction() {
        let v = Velocity::new(30.0, 40.0).capped(5.0);
        assert!((v.magnitude_sq().sqrt() - 5.0).abs() < 1e-4);
        assert!((v.vx / v.vy - 0.75).abs() < 1e-5);
    }
}
