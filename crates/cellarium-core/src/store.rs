//! Fixed-capacity Structure-of-Arrays storage for all cell fields.
//!
//! Slots are identified by stable indices in `[0, capacity)`. Freed slots go
//! onto a LIFO free-list and their columns are zeroed so collaborators that
//! read the buffers between ticks never observe stale agent state.

use rand::rngs::SmallRng;

use crate::{
    Archetype, CellFlags, FRICTION_RANGE, Generation, Genome, Position, Velocity,
    symmetric_uniform,
};

/// Energy written into a freshly spawned cell.
pub const SPAWN_ENERGY: f32 = 100.0;
/// Mass written into a freshly spawned cell.
pub const SPAWN_MASS: f32 = 1.0;
/// Smallest mass a live cell may carry.
pub const MIN_MASS: f32 = 1.0;
/// Maximum per-axis offset between a parent and its offspring.
pub const OFFSPRING_JITTER: f32 = 5.0;
/// Scale applied to per-gene mutation deltas.
pub const GENE_DELTA_SCALE: f32 = 0.1;

/// Fixed-capacity column store with free-list index recycling.
#[derive(Debug, Clone)]
pub struct CellStore {
    capacity: usize,
    friction: f32,
    active: Vec<bool>,
    free: Vec<u32>,
    active_count: usize,
    positions: Vec<Position>,
    velocities: Vec<Velocity>,
    energies: Vec<f32>,
    masses: Vec<f32>,
    archetypes: Vec<Archetype>,
    species_ids: Vec<i32>,
    generations: Vec<Generation>,
    alliance_ids: Vec<i32>,
    cooldowns: Vec<f32>,
    flags: Vec<CellFlags>,
    genomes: Vec<Genome>,
}

impl CellStore {
    /// Create a store with `capacity` zeroed slots, all free. The free-list
    /// is ordered so the first spawns take indices 0, 1, 2, ...
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            friction: 0.98,
            active: vec![false; capacity],
            free: (0..capacity as u32).rev().collect(),
            active_count: 0,
            positions: vec![Position::default(); capacity],
            velocities: vec![Velocity::default(); capacity],
            energies: vec![0.0; capacity],
            masses: vec![0.0; capacity],
            archetypes: vec![Archetype::Average; capacity],
            species_ids: vec![0; capacity],
            generations: vec![Generation(0); capacity],
            alliance_ids: vec![0; capacity],
            cooldowns: vec![0.0; capacity],
            flags: vec![CellFlags::empty(); capacity],
            genomes: vec![Genome::default(); capacity],
        }
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live cells.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active_count
    }

    /// Number of free slots.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Returns true when `index` refers to a live cell.
    #[must_use]
    pub fn is_active(&self, index: usize) -> bool {
        index < self.capacity && self.active[index]
    }

    /// Per-slot liveness mask.
    #[must_use]
    pub fn live_mask(&self) -> &[bool] {
        &self.active
    }

    /// Velocity decay factor applied once per [`integrate`](Self::integrate).
    #[must_use]
    pub fn friction(&self) -> f32 {
        self.friction
    }

    /// Set the friction factor, clamped to its documented range.
    pub fn set_friction(&mut self, friction: f32) {
        self.friction = friction.clamp(FRICTION_RANGE.0, FRICTION_RANGE.1);
    }

    /// Spawn a new cell from an external seed genome. Returns `None` when the
    /// store is full or the genome is not viable.
    pub fn spawn(&mut self, x: f32, y: f32, genome: Genome) -> Option<usize> {
        if !genome.is_viable() {
            return None;
        }
        self.allocate(x, y, genome.sanitized(), Generation(1))
    }

    /// Spawn an offspring of `parent` with mutated genes, jittered position,
    /// and the next lineage generation. Returns `None` when the store is full
    /// or the parent slot is dead.
    pub fn reproduce(
        &mut self,
        parent: usize,
        mutation_rate: f32,
        rng: &mut SmallRng,
    ) -> Option<usize> {
        if !self.is_active(parent) {
            return None;
        }
        let parent_genome = self.genomes[parent];
        let limit = parent_genome.mutability() * GENE_DELTA_SCALE * mutation_rate;
        let mut child_genome = parent_genome;
        for gene in &mut child_genome.0 {
            *gene = (*gene + symmetric_uniform(rng, limit)).clamp(0.0, 1.0);
        }
        let origin = self.positions[parent];
        let x = origin.x + symmetric_uniform(rng, OFFSPRING_JITTER);
        let y = origin.y + symmetric_uniform(rng, OFFSPRING_JITTER);
        let generation = self.generations[parent].next();
        self.allocate(x, y, child_genome, generation)
    }

    fn allocate(
        &mut self,
        x: f32,
        y: f32,
        genome: Genome,
        generation: Generation,
    ) -> Option<usize> {
        let index = self.free.pop()? as usize;
        self.active[index] = true;
        self.active_count += 1;
        self.positions[index] = Position::new(x, y);
        self.velocities[index] = Velocity::default();
        self.energies[index] = SPAWN_ENERGY;
        self.masses[index] = SPAWN_MASS;
        self.archetypes[index] = Archetype::derive(&genome);
        self.species_ids[index] = -1;
        self.generations[index] = generation;
        self.alliance_ids[index] = -1;
        self.cooldowns[index] = 0.0;
        self.flags[index] = CellFlags::empty();
        self.genomes[index] = genome;
        Some(index)
    }

    /// Free a slot, zeroing every column. Idempotent; invalid and already-dead
    /// indices are no-ops.
    pub fn remove(&mut self, index: usize) {
        if !self.is_active(index) {
            return;
        }
        self.active[index] = false;
        self.active_count -= 1;
        self.positions[index] = Position::default();
        self.velocities[index] = Velocity::default();
        self.energies[index] = 0.0;
        self.masses[index] = 0.0;
        self.archetypes[index] = Archetype::Average;
        self.species_ids[index] = 0;
        self.generations[index] = Generation(0);
        self.alliance_ids[index] = 0;
        self.cooldowns[index] = 0.0;
        self.flags[index] = CellFlags::empty();
        self.genomes[index] = Genome::default();
        self.free.push(index as u32);
        self.debug_assert_coherent();
    }

    /// Advance positions: `v *= friction` once per call (deliberately not
    /// scaled by dt), then `p += v * dt`.
    pub fn integrate(&mut self, dt: f32) {
        for index in 0..self.capacity {
            if !self.active[index] {
                continue;
            }
            let velocity = &mut self.velocities[index];
            velocity.vx *= self.friction;
            velocity.vy *= self.friction;
            let position = &mut self.positions[index];
            position.x += velocity.vx * dt;
            position.y += velocity.vy * dt;
        }
    }

    /// Iterate the indices of live cells in ascending order.
    pub fn iter_active(&self) -> impl Iterator<Item = usize> + '_ {
        self.active
            .iter()
            .enumerate()
            .filter_map(|(idx, &live)| live.then_some(idx))
    }

    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Position] {
        &mut self.positions
    }

    #[must_use]
    pub fn velocities(&self) -> &[Velocity] {
        &self.velocities
    }

    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut [Velocity] {
        &mut self.velocities
    }

    #[must_use]
    pub fn energies(&self) -> &[f32] {
        &self.energies
    }

    #[must_use]
    pub fn energies_mut(&mut self) -> &mut [f32] {
        &mut self.energies
    }

    #[must_use]
    pub fn masses(&self) -> &[f32] {
        &self.masses
    }

    #[must_use]
    pub fn masses_mut(&mut self) -> &mut [f32] {
        &mut self.masses
    }

    #[must_use]
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    #[must_use]
    pub fn species_ids(&self) -> &[i32] {
        &self.species_ids
    }

    #[must_use]
    pub fn species_ids_mut(&mut self) -> &mut [i32] {
        &mut self.species_ids
    }

    #[must_use]
    pub fn generations(&self) -> &[Generation] {
        &self.generations
    }

    #[must_use]
    pub fn generations_mut(&mut self) -> &mut [Generation] {
        &mut self.generations
    }

    #[must_use]
    pub fn alliance_ids(&self) -> &[i32] {
        &self.alliance_ids
    }

    #[must_use]
    pub fn alliance_ids_mut(&mut self) -> &mut [i32] {
        &mut self.alliance_ids
    }

    #[must_use]
    pub fn cooldowns(&self) -> &[f32] {
        &self.cooldowns
    }

    #[must_use]
    pub fn cooldowns_mut(&mut self) -> &mut [f32] {
        &mut self.cooldowns
    }

    #[must_use]
    pub fn flags(&self) -> &[CellFlags] {
        &self.flags
    }

    #[must_use]
    pub fn flags_mut(&mut self) -> &mut [CellFlags] {
        &mut self.flags
    }

    #[must_use]
    pub fn genomes(&self) -> &[Genome] {
        &self.genomes
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(
            self.active_count + self.free.len(),
            self.capacity,
            "active and free slots must partition the store"
        );
    }
}
