use cellarium_core::{
    Archetype, CellariumConfig, Engine, Event, GENE_AGG, GENE_DEF, GENE_LIF, GENE_MUT, GENE_PHO,
    GENE_SIZ, GENE_SPD, GENE_VIS, Genome, Position,
};

fn sterile_config(capacity: usize, seed: u64) -> CellariumConfig {
    CellariumConfig {
        world_size: 1_000.0,
        capacity,
        rng_seed: Some(seed),
        sterile: true,
        ..CellariumConfig::default()
    }
}

fn genome(values: [f32; 8]) -> Genome {
    Genome(values)
}

#[test]
fn hungry_predator_eats_adjacent_prey() {
    let mut sim = Engine::new(sterile_config(8, 0xBEEF)).expect("engine");
    let predator = sim
        .spawn(
            100.0,
            100.0,
            genome([0.9, 0.9, 0.1, 0.5, 0.5, 0.5, 0.1, 0.5]),
        )
        .expect("predator");
    let prey = sim
        .spawn(
            101.0,
            100.0,
            genome([0.1, 0.0, 0.1, 0.5, 0.1, 0.2, 0.1, 0.5]),
        )
        .expect("prey");
    // Hungry enough to hunt.
    sim.store_mut().energies_mut()[predator] = 55.0;
    sim.drain_events();

    let mut kill_tick = None;
    for tick in 1..=5 {
        sim.tick(0.1);
        if sim.active_count() == 1 {
            kill_tick = Some(tick);
            break;
        }
    }

    assert_eq!(kill_tick, Some(1), "prey should fall within five ticks");
    assert!(sim.is_active()[predator]);
    assert!(!sim.is_active()[prey]);
    assert_eq!(sim.frame_deaths(), 1);
    assert_eq!(sim.telemetry().deaths, 1);
    // The eat reward landed, minus at most a trickle of upkeep.
    assert!(sim.energies()[predator] >= 55.0 + 30.0 - 1.0);
    let events = sim.drain_events();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::Death { index } if *index as usize == prey))
    );
}

#[test]
fn producer_monoculture_fuses_into_one_colony() {
    let mut sim = Engine::new(sterile_config(64, 0xC01))
        .expect("engine");
    let producer = genome([0.0, 0.2, 0.9, 0.5, 0.2, 0.3, 0.1, 0.5]);
    for i in 0..20usize {
        let x = 500.0 + (i % 5) as f32 * 8.0 - 16.0;
        let y = 500.0 + (i / 5) as f32 * 8.0 - 12.0;
        let idx = sim.spawn(x, y, producer).expect("producer");
        assert_eq!(sim.archetypes()[idx], Archetype::Producer);
    }
    sim.drain_events();

    let mut max_member_energy = 0.0f32;
    for tick in 1..=30 {
        if tick == 30 {
            max_member_energy = sim
                .store()
                .iter_active()
                .map(|idx| sim.energies()[idx])
                .fold(0.0, f32::max);
        }
        sim.tick(0.1);
    }

    assert_eq!(sim.active_count(), 1, "the cluster collapses to one body");
    let colony = sim.store().iter_active().next().expect("colony");
    assert_eq!(sim.masses()[colony], 20.0, "mass is conserved exactly");
    assert_eq!(sim.archetypes()[colony], Archetype::Producer);
    // energy = most energetic member + 10 * total mass (member paid one more
    // tick of upkeep before the pass ran).
    let expected = max_member_energy + 10.0 * 20.0;
    assert!(
        (sim.energies()[colony] - expected).abs() < 0.5,
        "colony energy {} vs expected {expected}",
        sim.energies()[colony]
    );
    // Centroid of the 5x4 lattice.
    let position = sim.positions()[colony];
    assert!((position.x - 500.0).abs() < 1.0);
    assert!((position.y - 500.0).abs() < 1.0);

    assert_eq!(sim.telemetry().deaths, 19);
    let events = sim.drain_events();
    assert!(events.iter().any(
        |e| matches!(e, Event::Colony { archetype: Archetype::Producer, mass } if *mass == 20.0)
    ));
}

#[test]
fn heavy_alliance_triangle_fuses_into_super_colony() {
    let mut sim = Engine::new(sterile_config(16, 0xA111)).expect("engine");
    let colony_genome = genome([0.0, 0.2, 0.2, 0.5, 0.2, 0.3, 0.1, 0.5]);
    let corners = [(300.0, 300.0), (600.0, 300.0), (450.0, 560.0)];
    let mut members = Vec::new();
    for &(x, y) in &corners {
        members.push(sim.spawn(x, y, colony_genome).expect("colony"));
    }
    for &member in &members {
        sim.store_mut().masses_mut()[member] = 40.0;
    }
    sim.drain_events();

    for _ in 0..60 {
        sim.tick(0.1);
    }

    assert_eq!(sim.active_count(), 1);
    let fused = sim.store().iter_active().next().expect("super-colony");
    assert!(
        (sim.masses()[fused] - 120.0 * 1.1).abs() < 1e-2,
        "synergy bonus applied: {}",
        sim.masses()[fused]
    );
    assert_eq!(sim.energies()[fused], 5_000.0);
    assert_eq!(sim.telemetry().deaths, 2);

    let events = sim.drain_events();
    assert!(events.iter().any(|e| matches!(e, Event::Fusion { .. })));

    // Centroid of the triangle.
    let position = sim.positions()[fused];
    assert!((position.x - 450.0).abs() < 1.0);
    assert!((position.y - 386.7).abs() < 1.0);
}

#[test]
fn light_triplet_gets_an_alliance_id_instead_of_fusing() {
    let mut sim = Engine::new(sterile_config(16, 0xA112)).expect("engine");
    let colony_genome = genome([0.0, 0.2, 0.2, 0.5, 0.2, 0.3, 0.1, 0.5]);
    let corners = [(300.0, 300.0), (500.0, 300.0), (400.0, 450.0)];
    let mut members = Vec::new();
    for &(x, y) in &corners {
        members.push(sim.spawn(x, y, colony_genome).expect("colony"));
    }
    for &member in &members {
        // Above the candidate floor, far below the fusion mass.
        sim.store_mut().masses_mut()[member] = 12.0;
    }
    sim.drain_events();

    for _ in 0..60 {
        sim.tick(0.1);
    }

    assert_eq!(sim.active_count(), 3);
    let ids: Vec<i32> = members.iter().map(|&m| sim.alliance_ids()[m]).collect();
    assert!(ids.iter().all(|&id| id == ids[0] && id > 0), "ids: {ids:?}");
    let events = sim.drain_events();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::Alliance { count: 3, .. }))
    );
}

#[test]
fn mid_mass_body_fragments_into_cooled_children() {
    let mut sim = Engine::new(sterile_config(16, 0xF7A6)).expect("engine");
    // Stationary and blind so the children sit exactly where they spawned.
    let body = genome([0.0, 0.2, 0.3, 0.5, 0.2, 0.0, 0.1, 0.5]);
    let parent = sim.spawn(500.0, 500.0, body).expect("parent");
    sim.store_mut().masses_mut()[parent] = 8.0;
    let before = sim.telemetry();
    sim.drain_events();

    sim.tick(0.1);

    // mass 8 dissolves into min(5, floor(8 / 2)) = 4 children.
    assert_eq!(sim.active_count(), 4);
    let after = sim.telemetry();
    assert_eq!(after.births - before.births, 3, "first child continues the parent");
    assert_eq!(after.deaths, before.deaths, "dissolution books no death");
    assert_eq!(sim.frame_births(), 3);
    assert_eq!(sim.frame_deaths(), 0);

    let origin = Position::new(500.0, 500.0);
    for child in sim.store().iter_active() {
        assert_eq!(sim.masses()[child], 1.0);
        assert_eq!(sim.genomes()[child], body);
        assert_eq!(sim.store().generations()[child].0, 1);
        // Spawned on the 10..30 ring around the parent.
        let offset = sim.positions()[child].distance_sq(&origin).sqrt();
        assert!(
            (10.0 - 1e-3..=30.0).contains(&offset),
            "child offset {offset} outside the ring"
        );
        // Fusion-gate cooldown, minus at most one tick of decay.
        let cooldown = sim.cooldowns()[child];
        assert!(
            (4.9 - 1e-4..=5.0).contains(&cooldown),
            "child cooldown {cooldown}"
        );
    }

    let events = sim.drain_events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::Birth { .. }))
            .count(),
        3
    );
    assert!(events.iter().all(|e| !matches!(e, Event::Death { .. })));
}

#[test]
fn dissolution_too_light_for_children_is_a_death() {
    let mut sim = Engine::new(sterile_config(8, 0xF7A7)).expect("engine");
    let body = genome([0.0, 0.2, 0.3, 0.5, 0.2, 0.0, 0.1, 0.5]);
    let parent = sim.spawn(500.0, 500.0, body).expect("parent");
    // floor(1.8 / 2) = 0 children: the body vanishes.
    sim.store_mut().masses_mut()[parent] = 1.8;
    let before = sim.telemetry();
    sim.drain_events();

    sim.tick(0.1);

    assert_eq!(sim.active_count(), 0);
    let after = sim.telemetry();
    assert_eq!(after.births, before.births);
    assert_eq!(after.deaths - before.deaths, 1);
    assert_eq!(sim.frame_deaths(), 1);
    let events = sim.drain_events();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::Death { index } if *index as usize == parent))
    );
}

#[test]
fn seeded_runs_are_deterministic() {
    fn run(seed: u64) -> (Vec<Position>, Vec<f32>, cellarium_core::Telemetry) {
        let config = CellariumConfig {
            world_size: 1_000.0,
            capacity: 256,
            rng_seed: Some(seed),
            ..CellariumConfig::default()
        };
        let mut sim = Engine::new(config).expect("engine");
        sim.seed_population(80);
        for _ in 0..120 {
            sim.tick(0.1);
        }
        (
            sim.positions().to_vec(),
            sim.energies().to_vec(),
            sim.telemetry(),
        )
    }

    let (pos_a, energy_a, telemetry_a) = run(0xDEADBEEF);
    let (pos_b, energy_b, telemetry_b) = run(0xDEADBEEF);
    assert_eq!(pos_a, pos_b, "identical seeds replay identical worlds");
    assert_eq!(energy_a, energy_b);
    assert_eq!(telemetry_a, telemetry_b);

    let (pos_c, _, _) = run(0xF00DF00D);
    assert_ne!(pos_a, pos_c, "different seeds diverge");
}

#[test]
fn universal_invariants_hold_across_a_long_run() {
    let config = CellariumConfig {
        world_size: 1_000.0,
        capacity: 512,
        rng_seed: Some(42),
        ..CellariumConfig::default()
    };
    let mut sim = Engine::new(config).expect("engine");
    sim.seed_population(100);

    for tick in 1..=150u32 {
        sim.tick(0.1);
        if !tick.is_multiple_of(10) {
            continue;
        }

        let store = sim.store();
        assert_eq!(
            store.active_count() + store.free_count(),
            store.capacity(),
            "active and free slots partition capacity"
        );

        for idx in store.iter_active() {
            for &gene in &sim.genomes()[idx].0 {
                assert!((0.0..=1.0).contains(&gene), "gene out of range: {gene}");
            }
            assert!(sim.masses()[idx] >= 1.0, "mass floor: {}", sim.masses()[idx]);
            assert!(sim.energies()[idx] > 0.0, "live cells hold energy");
            assert!(sim.cooldowns()[idx] >= 0.0);

            let species_id = store.species_ids()[idx];
            assert!(
                species_id == -1 || sim.species().contains(species_id as u32),
                "stale species id {species_id}"
            );
        }

        let telemetry = sim.telemetry();
        assert_eq!(telemetry.alive as usize, store.active_count());
        assert_eq!(
            telemetry.dominant_genes.iter().sum::<u32>(),
            telemetry.alive
        );
        assert_eq!(telemetry.archetypes.iter().sum::<u32>(), telemetry.alive);
    }
}

#[test]
fn species_assignments_are_stable_between_passes() {
    let mut sim = Engine::new(sterile_config(32, 7)).expect("engine");
    // Stationary, non-interacting, non-reproducing population.
    let quiet = genome([0.0, 0.2, 0.3, 0.4, 0.2, 0.0, 0.1, 0.5]);
    let a = sim.spawn(200.0, 200.0, quiet).expect("a");
    let b = sim.spawn(700.0, 700.0, quiet).expect("b");

    sim.tick(0.1);
    let id_a = sim.store().species_ids()[a];
    let id_b = sim.store().species_ids()[b];
    assert!(id_a >= 0);
    assert_eq!(id_a, id_b, "identical genomes share one species");

    // Through the next pass at tick 60, unchanged genomes keep their id.
    for _ in 0..65 {
        sim.tick(0.1);
    }
    assert_eq!(sim.store().species_ids()[a], id_a);
    assert_eq!(sim.store().species_ids()[b], id_b);
}

#[test]
fn removed_slots_read_as_zero_until_respawn() {
    let mut sim = Engine::new(sterile_config(8, 3)).expect("engine");
    let idx = sim
        .spawn(100.0, 100.0, genome([0.3, 0.4, 0.5, 0.6, 0.7, 0.2, 0.1, 0.9]))
        .expect("spawn");
    sim.store_mut().remove(idx);

    assert_eq!(sim.positions()[idx], Position::default());
    assert_eq!(sim.energies()[idx], 0.0);
    assert_eq!(sim.masses()[idx], 0.0);
    assert_eq!(sim.alliance_ids()[idx], 0);
    assert_eq!(sim.genomes()[idx], Genome::default());
    assert!(!sim.is_active()[idx]);

    let again = sim.spawn(50.0, 50.0, Genome::uniform(0.5)).expect("reuse");
    assert_eq!(again, idx);
    assert!(sim.is_active()[idx]);
}

#[test]
fn gene_constants_cover_the_genome() {
    // The named gene order is part of the public contract.
    assert_eq!(
        [
            GENE_SPD, GENE_AGG, GENE_PHO, GENE_SIZ, GENE_DEF, GENE_VIS, GENE_MUT, GENE_LIF
        ],
        [0, 1, 2, 3, 4, 5, 6, 7]
    );
}
