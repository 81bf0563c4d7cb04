//! Simulation engine: orchestrates the per-tick pipeline over the store.
//!
//! One tick runs, in order: transient-flag reset, spatial index rebuild, the
//! periodic species pass, the per-agent behavior pass (strictly in index
//! order, each agent reading the current store state), position integration
//! with the boundary policy, the coarser colony and alliance passes, and the
//! extinction milestone check. Interaction effects are applied immediately:
//! when cell *i* eats cell *j*, cells after *i* observe *j* already gone.

use ordered_float::OrderedFloat;
use rand::{Rng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cellarium_index::{NeighborhoodIndex, UniformGridIndex};

use crate::store::MIN_MASS;
use crate::{
    Analytics, Archetype, CellFlags, CellStore, CellariumConfig, ConfigUpdate, CoreError,
    Environment, Event, EventQueue, GENOME_LEN, Generation, Genome, PopulationSnapshot, Position,
    SpeciesCount, SpeciesTracker, Tick, Velocity, symmetric_uniform,
};

/// Hosts clamp dt; the engine enforces the same ceiling defensively.
pub const MAX_DT: f32 = 0.1;

// Thermodynamics.
const DRAG_COEFF: f32 = 0.5;
const VISION_RANGE_SCALE: f32 = 100.0;
const VISION_UPKEEP: f32 = 0.005;
const SOLAR_YIELD: f32 = 45.0;
const POISON_DAMAGE: f32 = 50.0;
const COLONY_FEED_MASS: f32 = 2.0;

// Fragmentation.
const FRAGMENT_MIN_MASS: f32 = 1.5;
const FRAGMENT_MAX_MASS: f32 = 10.0;
const FRAGMENT_MAX_CHILDREN: u32 = 5;
const FRAGMENT_OFFSET_MIN: f32 = 10.0;
const FRAGMENT_OFFSET_MAX: f32 = 30.0;
const FRAGMENT_COOLDOWN: f32 = 5.0;

// Interaction.
const DOMINANCE_MASS_RATIO: f32 = 1.2;
const ABSORB_ENERGY_SHARE: f32 = 0.5;
const AID_DONOR_FLOOR: f32 = 100.0;
const AID_RECIPIENT_CEILING: f32 = 50.0;
const AID_RATE: f32 = 10.0;
const STEAL_AGGRESSION: f32 = 0.5;
const STEAL_RATE: f32 = 1.5;
const STEAL_ENERGY_RATE: f32 = 15.0;
const HUNT_HUNGER: f32 = 60.0;
const EAT_REWARD: f32 = 30.0;
const EAT_REACH_SCALE: f32 = 10.0;

// Locomotion.
const CHASE_SPEED_SCALE: f32 = 100.0;
const WANDER_KICK: f32 = 5.0;
const WANDER_SPEED_SCALE: f32 = 50.0;

// Reproduction.
const REPRODUCTION_THRESHOLD: f32 = 150.0;
const REPRODUCTION_COST: f32 = 80.0;

// Boundary policy.
const BARRIER_BOUNCE: f32 = -1.2;
const BARRIER_STEP: f32 = 0.1;

// Colony formation.
const COLONY_THRESHOLD: usize = 15;
const COLONY_RADIUS: f32 = 50.0;
const COLONY_CROWDED_COUNT: usize = 2_000;
const COLONY_CROWDED_THRESHOLD: usize = 5;
const COLONY_CROWDED_RADIUS: f32 = 80.0;
const COLONY_ENERGY_PER_MASS: f32 = 10.0;

// Alliance maintenance.
const ALLIANCE_MIN_MASS: f32 = 2.0;
const ALLIANCE_RANGE: f32 = 400.0;
const ALLIANCE_COMPAT: f32 = 0.3;
const ALLIANCE_SIZE: usize = 3;
const FUSION_MASS: f32 = 100.0;
const FUSION_SYNERGY: f32 = 1.1;
const FUSION_ENERGY: f32 = 5_000.0;

// Inspection and telemetry.
const PICK_RADIUS: f32 = 100.0;
const GENERATION_EPOCH_TICKS: u64 = 500;

/// Reach within which a body absorbs a dominated neighbor outright.
/// Monotone in mass so colonies eat over a wider footprint.
#[inline]
fn eat_radius(mass: f32) -> f32 {
    8.0 + 2.0 * mass.max(0.0).sqrt()
}

/// Read-only copy of one cell handed to inspection clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellSnapshot {
    pub index: u32,
    pub position: Position,
    pub energy: f32,
    pub mass: f32,
    pub genome: Genome,
    pub generation: Generation,
    pub archetype: Archetype,
    pub species_id: i32,
    pub alliance_id: i32,
}

/// Per-frame digest assembled from the live columns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telemetry {
    pub alive: u32,
    pub births: u64,
    pub deaths: u64,
    pub generation: u32,
    /// Live cells bucketed by their strongest gene.
    pub dominant_genes: [u32; GENOME_LEN],
    /// Live cells bucketed by archetype.
    pub archetypes: [u32; Archetype::COUNT],
}

/// The simulation core. Owns the store, environment, spatial index, species
/// tracker, analytics window, and event queue; hosts drive [`Engine::tick`].
pub struct Engine {
    config: CellariumConfig,
    tick: Tick,
    rng: SmallRng,
    store: CellStore,
    environment: Environment,
    index: UniformGridIndex,
    species: SpeciesTracker,
    analytics: Analytics,
    events: EventQueue,
    births_total: u64,
    deaths_total: u64,
    frame_births: u32,
    frame_deaths: u32,
    extinct: bool,
    position_scratch: Vec<(f32, f32)>,
    neighbor_scratch: Vec<(usize, f32)>,
    cluster_scratch: Vec<usize>,
    visited_scratch: Vec<bool>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("tick", &self.tick)
            .field("active_count", &self.store.active_count())
            .field("species", &self.species.len())
            .finish()
    }
}

impl Engine {
    /// Instantiate an engine from the supplied configuration.
    pub fn new(config: CellariumConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let mut environment = if config.sterile {
            Environment::sterile(config.world_size, config.field_resolution)
        } else {
            Environment::generate(
                config.world_size,
                config.field_resolution,
                config.environment_seed(),
            )
        };
        environment.set_solar_constant(config.solar_constant);
        let mut store = CellStore::new(config.capacity);
        store.set_friction(config.friction);
        let index = UniformGridIndex::new(config.grid_cell_size, config.world_size, config.world_size);
        Ok(Self {
            tick: Tick::zero(),
            rng,
            store,
            environment,
            index,
            species: SpeciesTracker::new(),
            analytics: Analytics::new(config.history_capacity),
            events: EventQueue::new(config.event_capacity),
            births_total: 0,
            deaths_total: 0,
            frame_births: 0,
            frame_deaths: 0,
            extinct: false,
            position_scratch: Vec::new(),
            neighbor_scratch: Vec::new(),
            cluster_scratch: Vec::new(),
            visited_scratch: Vec::new(),
            config,
        })
    }

    /// Convenience constructor with defaults for everything but size.
    pub fn with_size(world_size: f32, capacity: usize) -> Result<Self, CoreError> {
        Self::new(CellariumConfig {
            world_size,
            capacity,
            ..CellariumConfig::default()
        })
    }

    /// Apply a partial reconfiguration; each tunable clamps to its range.
    pub fn configure(&mut self, update: ConfigUpdate) {
        self.config.apply(&update);
        self.store.set_friction(self.config.friction);
        self.environment.set_solar_constant(self.config.solar_constant);
    }

    /// Seed one cell from an external genome. Out-of-world coordinates wrap;
    /// `None` means the store is full or the genome is not viable.
    pub fn spawn(&mut self, x: f32, y: f32, genome: Genome) -> Option<usize> {
        let world = self.config.world_size;
        let index = self
            .store
            .spawn(wrap_coordinate(x, world), wrap_coordinate(y, world), genome)?;
        self.births_total += 1;
        self.frame_births += 1;
        self.events.push(Event::Birth {
            index: index as u32,
            generation: self.store.generations()[index].0,
        });
        Some(index)
    }

    /// Scatter `count` random viable genomes across the world. Returns how
    /// many cells were actually placed (the store may fill up).
    pub fn seed_population(&mut self, count: usize) -> usize {
        let mut placed = 0;
        for _ in 0..count {
            let x = self.rng.random_range(0.0..self.config.world_size);
            let y = self.rng.random_range(0.0..self.config.world_size);
            let mut genome = Genome::default();
            for gene in &mut genome.0 {
                *gene = self.rng.random_range(0.05..1.0);
            }
            if self.spawn(x, y, genome).is_some() {
                placed += 1;
            }
        }
        placed
    }

    /// Advance the simulation one step. `dt` is clamped to [`MAX_DT`].
    pub fn tick(&mut self, dt: f32) {
        let dt = if dt.is_finite() {
            dt.clamp(0.0, MAX_DT)
        } else {
            0.0
        };
        let current = self.tick.next();
        self.frame_births = 0;
        self.frame_deaths = 0;

        self.stage_clear_flags();
        self.stage_rebuild_index();
        if current.0 == 1 || current.0.is_multiple_of(u64::from(self.config.species_interval)) {
            self.stage_species_pass(current);
        }
        self.stage_behavior(dt);
        self.stage_integrate(dt);
        if current.0.is_multiple_of(u64::from(self.config.colony_interval)) {
            self.stage_colony_pass();
        }
        if current.0.is_multiple_of(u64::from(self.config.alliance_interval)) {
            self.stage_alliance_pass();
        }
        self.stage_milestones();
        self.tick = current;
    }

    /// Resolve a follow hint or pick the nearest live cell within the pick
    /// radius of `(x, y)`.
    #[must_use]
    pub fn nearest(&self, x: f32, y: f32, follow_hint: Option<usize>) -> Option<CellSnapshot> {
        if let Some(hint) = follow_hint {
            if self.store.is_active(hint) {
                return Some(self.snapshot(hint));
            }
        }
        let origin = Position::new(x, y);
        let mut best: Option<(usize, f32)> = None;
        for idx in self.store.iter_active() {
            let dist_sq = self.store.positions()[idx].distance_sq(&origin);
            if dist_sq <= PICK_RADIUS * PICK_RADIUS
                && best.is_none_or(|(_, best_sq)| dist_sq < best_sq)
            {
                best = Some((idx, dist_sq));
            }
        }
        best.map(|(idx, _)| self.snapshot(idx))
    }

    /// Assemble the per-frame digest from the live columns.
    #[must_use]
    pub fn telemetry(&self) -> Telemetry {
        let mut dominant_genes = [0u32; GENOME_LEN];
        let mut archetypes = [0u32; Archetype::COUNT];
        for idx in self.store.iter_active() {
            dominant_genes[self.store.genomes()[idx].dominant_gene()] += 1;
            archetypes[self.store.archetypes()[idx].index()] += 1;
        }
        Telemetry {
            alive: self.store.active_count() as u32,
            births: self.births_total,
            deaths: self.deaths_total,
            generation: (self.tick.0 / GENERATION_EPOCH_TICKS) as u32,
            dominant_genes,
            archetypes,
        }
    }

    /// Remove and return every event emitted since the last drain.
    pub fn drain_events(&mut self) -> Vec<Event> {
        self.events.drain()
    }

    /// Events discarded to queue overflow since construction.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    #[must_use]
    pub fn config(&self) -> &CellariumConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub fn tick_count(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.store.active_count()
    }

    #[must_use]
    pub fn positions(&self) -> &[Position] {
        self.store.positions()
    }

    #[must_use]
    pub fn velocities(&self) -> &[Velocity] {
        self.store.velocities()
    }

    #[must_use]
    pub fn energies(&self) -> &[f32] {
        self.store.energies()
    }

    #[must_use]
    pub fn masses(&self) -> &[f32] {
        self.store.masses()
    }

    #[must_use]
    pub fn archetypes(&self) -> &[Archetype] {
        self.store.archetypes()
    }

    #[must_use]
    pub fn alliance_ids(&self) -> &[i32] {
        self.store.alliance_ids()
    }

    #[must_use]
    pub fn is_active(&self) -> &[bool] {
        self.store.live_mask()
    }

    #[must_use]
    pub fn cooldowns(&self) -> &[f32] {
        self.store.cooldowns()
    }

    #[must_use]
    pub fn genomes(&self) -> &[Genome] {
        self.store.genomes()
    }

    /// Read-only access to the backing store.
    #[must_use]
    pub fn store(&self) -> &CellStore {
        &self.store
    }

    /// Mutable access to the backing store for host tooling and tests.
    /// The engine owns all mutation during a tick; callers must only use
    /// this between ticks.
    #[must_use]
    pub fn store_mut(&mut self) -> &mut CellStore {
        &mut self.store
    }

    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    #[must_use]
    pub fn species(&self) -> &SpeciesTracker {
        &self.species
    }

    #[must_use]
    pub fn analytics(&self) -> &Analytics {
        &self.analytics
    }

    /// Births recorded during the most recent tick.
    #[must_use]
    pub fn frame_births(&self) -> u32 {
        self.frame_births
    }

    /// Removals recorded during the most recent tick.
    #[must_use]
    pub fn frame_deaths(&self) -> u32 {
        self.frame_deaths
    }

    fn snapshot(&self, index: usize) -> CellSnapshot {
        CellSnapshot {
            index: index as u32,
            position: self.store.positions()[index],
            energy: self.store.energies()[index],
            mass: self.store.masses()[index],
            genome: self.store.genomes()[index],
            generation: self.store.generations()[index],
            archetype: self.store.archetypes()[index],
            species_id: self.store.species_ids()[index],
            alliance_id: self.store.alliance_ids()[index],
        }
    }

    fn kill(&mut self, index: usize) {
        if !self.store.is_active(index) {
            return;
        }
        self.store.remove(index);
        self.deaths_total += 1;
        self.frame_deaths += 1;
        self.events.push(Event::Death {
            index: index as u32,
        });
    }

    fn stage_clear_flags(&mut self) {
        for flags in self.store.flags_mut() {
            flags.remove(CellFlags::RECENT_BIRTH);
        }
    }

    fn stage_rebuild_index(&mut self) {
        self.position_scratch.clear();
        self.position_scratch
            .extend(self.store.positions().iter().map(|p| (p.x, p.y)));
        // Cannot fail with a validated config.
        let _ = self
            .index
            .rebuild(&self.position_scratch, self.store.live_mask());
    }

    fn stage_species_pass(&mut self, current: Tick) {
        self.species.reset_counts();
        for idx in 0..self.store.capacity() {
            if !self.store.is_active(idx) {
                continue;
            }
            let genome = self.store.genomes()[idx];
            let id = self.species.identify(&genome);
            self.store.species_ids_mut()[idx] = id as i32;
        }
        self.species.prune();

        let species: Vec<SpeciesCount> = self
            .species
            .iter()
            .map(|record| SpeciesCount {
                species_id: record.id,
                population: record.population,
            })
            .collect();
        debug!(
            tick = current.0,
            species = species.len(),
            population = self.store.active_count(),
            "species pass"
        );
        self.analytics.record(PopulationSnapshot {
            tick: current,
            total: self.store.active_count() as u32,
            species,
        });
    }

    fn stage_behavior(&mut self, dt: f32) {
        for idx in 0..self.store.capacity() {
            if !self.store.is_active(idx) {
                continue;
            }
            self.update_cell(idx, dt);
        }
    }

    /// One cell's full update: thermodynamics, fragmentation, neighbor
    /// interaction, locomotion, reproduction, death. Runs against the
    /// current store state; earlier cells this tick have already applied
    /// their effects.
    fn update_cell(&mut self, idx: usize, dt: f32) {
        let cooldown = self.store.cooldowns()[idx];
        if cooldown > 0.0 {
            self.store.cooldowns_mut()[idx] = (cooldown - dt).max(0.0);
        }

        let genome = self.store.genomes()[idx];
        let position = self.store.positions()[idx];
        let mass = self.store.masses()[idx];

        // Thermodynamics: drag, size upkeep, vision upkeep, solar intake,
        // poison damage. Colonies feed more efficiently, with diminishing
        // returns in mass.
        let mut energy = self.store.energies()[idx];
        let velocity = self.store.velocities()[idx];
        energy -= (velocity.magnitude_sq() * DRAG_COEFF
            + genome.size().powi(3)
            + genome.vision() * VISION_RANGE_SCALE * VISION_UPKEEP)
            * dt;
        let mut intake = self.environment.solar(position.x, position.y)
            * genome.photosynthesis()
            * SOLAR_YIELD
            * self.config.food_abundance
            * dt;
        if mass > COLONY_FEED_MASS {
            intake *= 1.0 + mass.log2();
        }
        energy += intake;
        energy -= self.environment.poison(position.x, position.y) * POISON_DAMAGE * dt;
        self.store.energies_mut()[idx] = energy;

        // Mid-sized bodies are unstable and dissolve back into cells.
        if mass > FRAGMENT_MIN_MASS && mass < FRAGMENT_MAX_MASS {
            self.fragment(idx, mass, genome);
            return;
        }

        let energy_snapshot = energy;

        // Perception: gather neighbors once into the reusable scratch list.
        let vision = genome.vision() * VISION_RANGE_SCALE;
        let mut neighbors = std::mem::take(&mut self.neighbor_scratch);
        neighbors.clear();
        if vision > 0.0 {
            self.index.neighbors_within(
                position.x,
                position.y,
                vision * vision,
                &mut |other, dist_sq: OrderedFloat<f32>| {
                    if other != idx {
                        neighbors.push((other, dist_sq.into_inner()));
                    }
                },
            );
        }

        let mut hunt: Option<(usize, f32)> = None;
        let mut flee: Option<(usize, f32)> = None;

        for &(other, dist_sq) in &neighbors {
            if !self.store.is_active(other) {
                continue;
            }
            let my_mass = self.store.masses()[idx];
            let my_energy = self.store.energies()[idx];
            let my_alliance = self.store.alliance_ids()[idx];
            let other_mass = self.store.masses()[other];
            let other_genome = self.store.genomes()[other];
            let allied = my_alliance != -1 && my_alliance == self.store.alliance_ids()[other];
            let dominated = my_mass > other_mass * DOMINANCE_MASS_RATIO;

            // Absorption: a strictly larger body swallows the neighbor whole.
            if !allied && dominated {
                let reach = eat_radius(my_mass);
                if dist_sq <= reach * reach {
                    let merged = my_mass + other_mass;
                    self.store.masses_mut()[idx] = merged;
                    self.store.energies_mut()[idx] =
                        my_energy + ABSORB_ENERGY_SHARE * energy_snapshot;
                    self.kill(other);
                    self.events.push(Event::Absorption { mass: merged });
                    continue;
                }
            }

            // Alliance cooperation: rich donors top up starving allies.
            if allied
                && my_energy > AID_DONOR_FLOOR
                && self.store.energies()[other] < AID_RECIPIENT_CEILING
            {
                let transfer = AID_RATE * dt;
                self.store.energies_mut()[idx] = my_energy - transfer;
                self.store.energies_mut()[other] += transfer;
            }

            // Mass steal: aggressive dominant bodies siphon rival mass. A
            // drain that would push the victim under the live-mass floor
            // assimilates it outright.
            if !allied && genome.aggression() > STEAL_AGGRESSION && dominated {
                let drain = STEAL_RATE * dt;
                let my_energy = self.store.energies()[idx];
                if other_mass - drain < MIN_MASS {
                    self.events.push(Event::Assimilation {
                        predator: self.store.archetypes()[idx],
                        prey: self.store.archetypes()[other],
                    });
                    self.store.masses_mut()[idx] = self.store.masses()[idx] + other_mass;
                    self.store.energies_mut()[idx] = my_energy + STEAL_ENERGY_RATE * dt;
                    self.kill(other);
                    continue;
                }
                self.store.masses_mut()[other] = other_mass - drain;
                self.store.masses_mut()[idx] = self.store.masses()[idx] + drain;
                self.store.energies_mut()[idx] = my_energy + STEAL_ENERGY_RATE * dt;
            }

            // Hungry cells pick the closest soft target they outweigh.
            if self.store.energies()[idx] < HUNT_HUNGER
                && other_genome.defense() < genome.aggression()
                && self.store.masses()[idx] >= self.store.masses()[other]
                && hunt.is_none_or(|(_, best)| dist_sq < best)
            {
                hunt = Some((other, dist_sq));
            }

            // Anything more aggressive than our defense is worth fleeing.
            if other_genome.aggression() > genome.defense()
                && flee.is_none_or(|(_, best)| dist_sq < best)
            {
                flee = Some((other, dist_sq));
            }
        }
        self.neighbor_scratch = neighbors;

        // Locomotion: flee beats hunt beats wander.
        let my_pos = self.store.positions()[idx];
        let flee = flee.filter(|&(target, _)| self.store.is_active(target));
        let hunt = hunt.filter(|&(target, _)| self.store.is_active(target));
        if let Some((threat, _)) = flee {
            let threat_pos = self.store.positions()[threat];
            self.store.velocities_mut()[idx] =
                steer(threat_pos, my_pos, genome.speed() * CHASE_SPEED_SCALE);
        } else if let Some((target, _)) = hunt {
            let target_pos = self.store.positions()[target];
            self.store.velocities_mut()[idx] =
                steer(my_pos, target_pos, genome.speed() * CHASE_SPEED_SCALE);
            let reach = (genome.size() + self.store.genomes()[target].size()) * EAT_REACH_SCALE;
            if my_pos.distance_sq(&target_pos) < reach * reach {
                self.store.energies_mut()[idx] += EAT_REWARD;
                self.kill(target);
            }
        } else {
            let mut velocity = self.store.velocities()[idx];
            velocity.vx += symmetric_uniform(&mut self.rng, WANDER_KICK);
            velocity.vy += symmetric_uniform(&mut self.rng, WANDER_KICK);
            self.store.velocities_mut()[idx] =
                velocity.capped(genome.speed() * WANDER_SPEED_SCALE);
        }

        // Reproduction. The energy cost applies only when a slot was free.
        let energy = self.store.energies()[idx];
        if energy > REPRODUCTION_THRESHOLD {
            if let Some(child) = self
                .store
                .reproduce(idx, self.config.mutation_rate, &mut self.rng)
            {
                self.store.energies_mut()[idx] = energy - REPRODUCTION_COST;
                self.store.flags_mut()[idx].insert(CellFlags::RECENT_BIRTH);
                self.births_total += 1;
                self.frame_births += 1;
                self.events.push(Event::Birth {
                    index: child as u32,
                    generation: self.store.generations()[child].0,
                });
            }
        }

        // Death: starved cells never survive to the tick boundary.
        if self.store.energies()[idx] <= 0.0 {
            self.kill(idx);
        }
    }

    /// Dissolve a mid-sized body into up to five fresh cells scattered on a
    /// ring around it. Children inherit the genome and lineage and carry a
    /// cooldown that keeps them out of the next colony fusion.
    ///
    /// Accounting mirrors the fusion passes: the first child continues the
    /// parent, so a split into k children books k - 1 births and no death.
    /// A body too light to yield any children dies outright.
    fn fragment(&mut self, idx: usize, mass: f32, genome: Genome) {
        let count = ((mass / 2.0).floor() as u32).min(FRAGMENT_MAX_CHILDREN);
        if count == 0 {
            self.kill(idx);
            return;
        }
        let origin = self.store.positions()[idx];
        let generation = self.store.generations()[idx];
        self.store.remove(idx);
        let mut spawned = 0u32;
        for _ in 0..count {
            let angle = self.rng.random_range(0.0..std::f32::consts::TAU);
            let distance = self
                .rng
                .random_range(FRAGMENT_OFFSET_MIN..FRAGMENT_OFFSET_MAX);
            let x = origin.x + angle.cos() * distance;
            let y = origin.y + angle.sin() * distance;
            if let Some(child) = self.store.spawn(x, y, genome) {
                self.store.generations_mut()[child] = generation;
                self.store.cooldowns_mut()[child] = FRAGMENT_COOLDOWN;
                if spawned > 0 {
                    self.births_total += 1;
                    self.frame_births += 1;
                    self.events.push(Event::Birth {
                        index: child as u32,
                        generation: generation.0,
                    });
                }
                spawned += 1;
            }
        }
    }

    fn stage_integrate(&mut self, dt: f32) {
        self.store.integrate(dt);
        let world = self.config.world_size;
        for idx in 0..self.store.capacity() {
            if !self.store.is_active(idx) {
                continue;
            }
            // Wrap first so the barrier reflection below only ever fires on
            // in-world barrier cells, not on edge crossings.
            {
                let position = &mut self.store.positions_mut()[idx];
                position.x = wrap_coordinate(position.x, world);
                position.y = wrap_coordinate(position.y, world);
            }
            let position = self.store.positions()[idx];
            if self.environment.blocked(position.x, position.y) {
                let velocity = &mut self.store.velocities_mut()[idx];
                velocity.vx *= BARRIER_BOUNCE;
                velocity.vy *= BARRIER_BOUNCE;
                let (vx, vy) = (velocity.vx, velocity.vy);
                let position = &mut self.store.positions_mut()[idx];
                position.x = wrap_coordinate(position.x + vx * BARRIER_STEP, world);
                position.y = wrap_coordinate(position.y + vy * BARRIER_STEP, world);
            }
        }
    }

    /// Fuse dense same-archetype clusters into single colony bodies.
    fn stage_colony_pass(&mut self) {
        let crowded = self.store.active_count() > COLONY_CROWDED_COUNT;
        let (threshold, radius) = if crowded {
            (COLONY_CROWDED_THRESHOLD, COLONY_CROWDED_RADIUS)
        } else {
            (COLONY_THRESHOLD, COLONY_RADIUS)
        };

        let capacity = self.store.capacity();
        let mut visited = std::mem::take(&mut self.visited_scratch);
        visited.clear();
        visited.resize(capacity, false);
        let mut cluster = std::mem::take(&mut self.cluster_scratch);

        for seed in 0..capacity {
            if visited[seed] || !self.store.is_active(seed) {
                continue;
            }
            if self.store.cooldowns()[seed] > 0.0 {
                continue;
            }
            visited[seed] = true;
            let archetype = self.store.archetypes()[seed];
            let origin = self.store.positions()[seed];
            cluster.clear();
            cluster.push(seed);
            {
                let store = &self.store;
                self.index.neighbors_within(
                    origin.x,
                    origin.y,
                    radius * radius,
                    &mut |other, _dist_sq: OrderedFloat<f32>| {
                        if other == seed || visited[other] || !store.is_active(other) {
                            return;
                        }
                        if store.archetypes()[other] != archetype
                            || store.cooldowns()[other] > 0.0
                        {
                            return;
                        }
                        visited[other] = true;
                        cluster.push(other);
                    },
                );
            }

            if cluster.len() <= threshold {
                continue;
            }

            let mut total_mass = 0.0f32;
            let mut cx = 0.0f32;
            let mut cy = 0.0f32;
            let mut donor = cluster[0];
            let mut generation = Generation(0);
            for &member in &cluster {
                total_mass += self.store.masses()[member];
                let p = self.store.positions()[member];
                cx += p.x;
                cy += p.y;
                if self.store.energies()[member] > self.store.energies()[donor] {
                    donor = member;
                }
                generation = generation.max(self.store.generations()[member]);
            }
            let members = cluster.len() as f32;
            let genome = self.store.genomes()[donor];
            let energy = self.store.energies()[donor] + COLONY_ENERGY_PER_MASS * total_mass;
            for &member in &cluster {
                self.store.remove(member);
            }
            self.deaths_total += (cluster.len() - 1) as u64;
            self.frame_deaths += (cluster.len() - 1) as u32;

            if let Some(colony) = self.store.spawn(cx / members, cy / members, genome) {
                self.store.masses_mut()[colony] = total_mass;
                self.store.energies_mut()[colony] = energy;
                self.store.generations_mut()[colony] = generation;
                let archetype = self.store.archetypes()[colony];
                debug!(?archetype, mass = total_mass, members = cluster.len(), "colony fused");
                self.events.push(Event::Colony {
                    archetype,
                    mass: total_mass,
                });
            }
        }

        self.visited_scratch = visited;
        self.cluster_scratch = cluster;
    }

    /// Link compatible colonies into alliances; heavy triangles collapse
    /// into super-colonies.
    fn stage_alliance_pass(&mut self) {
        for idx in 0..self.store.capacity() {
            if self.store.is_active(idx) {
                self.store.alliance_ids_mut()[idx] = -1;
            }
        }

        let candidates: Vec<usize> = self
            .store
            .iter_active()
            .filter(|&idx| self.store.masses()[idx] > ALLIANCE_MIN_MASS)
            .collect();
        let mut taken = vec![false; candidates.len()];
        let mut next_alliance = 1i32;
        let mut triplet: Vec<usize> = Vec::with_capacity(ALLIANCE_SIZE);

        for i in 0..candidates.len() {
            if taken[i] {
                continue;
            }
            taken[i] = true;
            let seed = candidates[i];
            let seed_pos = self.store.positions()[seed];
            let seed_genome = self.store.genomes()[seed];
            triplet.clear();
            triplet.push(seed);
            let mut partner_slots: [usize; 2] = [0; 2];

            for (j, &other) in candidates.iter().enumerate().skip(i + 1) {
                if triplet.len() == ALLIANCE_SIZE {
                    break;
                }
                if taken[j] {
                    continue;
                }
                let distance_sq = self.store.positions()[other].distance_sq(&seed_pos);
                if distance_sq >= ALLIANCE_RANGE * ALLIANCE_RANGE {
                    continue;
                }
                if !compatible(&seed_genome, &self.store.genomes()[other]) {
                    continue;
                }
                partner_slots[triplet.len() - 1] = j;
                triplet.push(other);
            }

            if triplet.len() < ALLIANCE_SIZE {
                continue;
            }
            for &slot in &partner_slots {
                taken[slot] = true;
            }

            let alliance = next_alliance;
            next_alliance += 1;
            let total_mass: f32 = triplet.iter().map(|&m| self.store.masses()[m]).sum();

            if total_mass > FUSION_MASS {
                let mut cx = 0.0f32;
                let mut cy = 0.0f32;
                let mut donor = triplet[0];
                let mut generation = Generation(0);
                for &member in &triplet {
                    let p = self.store.positions()[member];
                    cx += p.x;
                    cy += p.y;
                    if self.store.energies()[member] > self.store.energies()[donor] {
                        donor = member;
                    }
                    generation = generation.max(self.store.generations()[member]);
                }
                let genome = self.store.genomes()[donor];
                for &member in &triplet {
                    self.store.remove(member);
                }
                self.deaths_total += (ALLIANCE_SIZE - 1) as u64;
                self.frame_deaths += (ALLIANCE_SIZE - 1) as u32;

                let members = ALLIANCE_SIZE as f32;
                if let Some(colony) = self.store.spawn(cx / members, cy / members, genome) {
                    let mass = total_mass * FUSION_SYNERGY;
                    self.store.masses_mut()[colony] = mass;
                    self.store.energies_mut()[colony] = FUSION_ENERGY;
                    self.store.generations_mut()[colony] = generation;
                    let archetype = self.store.archetypes()[colony];
                    debug!(?archetype, mass, "alliance fused into super-colony");
                    self.events.push(Event::Fusion { archetype, mass });
                }
            } else {
                for &member in &triplet {
                    self.store.alliance_ids_mut()[member] = alliance;
                }
                self.events.push(Event::Alliance {
                    archetype: self.store.archetypes()[seed],
                    count: ALLIANCE_SIZE as u32,
                });
            }
        }
    }

    fn stage_milestones(&mut self) {
        if self.store.active_count() == 0 {
            if !self.extinct {
                self.extinct = true;
                info!(tick = self.tick.0, "population extinct");
                self.events.push(Event::Milestone("extinction".to_owned()));
            }
        } else {
            self.extinct = false;
        }
    }
}

/// Wrap a coordinate to the opposite edge of a `[0, world)` axis.
#[inline]
fn wrap_coordinate(value: f32, world: f32) -> f32 {
    if !value.is_finite() || world <= 0.0 {
        return 0.0;
    }
    let mut v = value;
    if v < 0.0 {
        v += world;
    } else if v > world {
        v -= world;
    }
    // A fast-moving body can overshoot a full axis; fall back to modulo.
    if v < 0.0 || v > world {
        v = v.rem_euclid(world);
    }
    v
}

/// Velocity of magnitude `speed` pointing from `from` toward `to`.
#[inline]
fn steer(from: Position, to: Position, speed: f32) -> Velocity {
    let dx = to.x - from.x;
    let dy = to.y - from.y;
    let length = dx.hypot(dy);
    if length <= f32::EPSILON || speed <= 0.0 {
        return Velocity::default();
    }
    Velocity::new(dx / length * speed, dy / length * speed)
}

/// Alliance compatibility: close behavioral genes (SPD, AGG, PHO).
#[inline]
fn compatible(a: &Genome, b: &Genome) -> bool {
    let delta = (a.speed() - b.speed()).abs()
        + (a.aggression() - b.aggression()).abs()
        + (a.photosynthesis() - b.photosynthesis()).abs();
    delta < ALLIANCE_COMPAT
}
