//! Integration tests for paged-ecs

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use paged_ecs::{
    BincodeCodec, ComponentId, ComponentManager, Entity, ManagerOptions, PAGE_SIZE, Patch, PodCodec, PresenceTable,
    World,
};
use rand::{Rng, SeedableRng, rngs::StdRng};

// ============================================================================
// Test Components
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Health {
    hp: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
enum Team {
    Red,
    Blue,
}

fn health_manager() -> ComponentManager<Health> {
    ComponentManager::new(ComponentId::from_raw(0), Arc::new(PresenceTable::new()))
}

fn e(id: u32) -> Entity {
    Entity::from_id(id)
}

/// Every dense slot points back at itself through the lookup.
fn assert_consistent(manager: &ComponentManager<Health>, model: &HashMap<u32, i32>) {
    assert_eq!(manager.len(), model.len());

    let mut values = Vec::new();
    let mut owners = Vec::new();
    manager.raw_components(&mut values);
    manager.raw_entities(&mut owners);
    assert_eq!(values.len(), model.len());
    assert_eq!(owners.len(), model.len());

    let guard = manager.lock();
    for (index, (&owner, value)) in owners.iter().zip(&values).enumerate() {
        assert_eq!(guard.dense_index(owner), Some(index));
        assert_eq!(model.get(&owner.id()), Some(&value.hp));
    }
}

// ============================================================================
// Manager Properties
// ============================================================================

#[test]
fn test_health_scenario() {
    let health = health_manager();
    health.create(e(1), Health { hp: 100 });
    health.create(e(2), Health { hp: 50 });
    health.create(e(3), Health { hp: 10 });

    health.delete(e(1));

    assert_eq!(health.len(), 2);
    assert!(!health.has(e(1)));
    assert_eq!(health.get(e(2)), Some(Health { hp: 50 }));
    assert_eq!(health.get(e(3)), Some(Health { hp: 10 }));

    let mut owners = Vec::new();
    health.raw_entities(&mut owners);
    owners.sort_by_key(|entity| entity.id());
    assert_eq!(owners, vec![e(2), e(3)]);
}

#[test]
fn test_swap_remove_moves_tail_into_hole() {
    let health = health_manager();
    for id in 0..5 {
        health.create(e(id), Health { hp: id as i32 });
    }

    health.delete(e(1));

    let guard = health.lock();
    assert_eq!(guard.len(), 4);
    assert_eq!(guard.entity_at(1), e(4));
    assert_eq!(guard.dense_index(e(4)), Some(1));
    assert_eq!(guard.component_at(1), &Health { hp: 4 });
    for id in [0, 2, 3] {
        assert_eq!(guard.dense_index(e(id)), Some(id as usize));
    }
}

#[test]
fn test_lengths_agree_across_interleavings() {
    let health = health_manager();
    let mut model: HashMap<u32, i32> = HashMap::new();
    // Fixed seed so failures reproduce.
    let mut rng = StdRng::seed_from_u64(0x9e37_79b9);

    for step in 0..20_000 {
        let id = rng.gen_range(0..PAGE_SIZE as u32 * 3);
        match (model.contains_key(&id), rng.gen_range(0..4)) {
            (false, _) => {
                health.create(e(id), Health { hp: step });
                model.insert(id, step);
            }
            (true, 0) => {
                assert!(health.set(e(id), Health { hp: -step }));
                model.insert(id, -step);
            }
            (true, _) => {
                assert_eq!(health.delete(e(id)).hp, model[&id]);
                model.remove(&id);
            }
        }

        if step % 997 == 0 {
            assert_consistent(&health, &model);
        }
    }

    assert_consistent(&health, &model);
    for id in 0..PAGE_SIZE as u32 * 3 {
        assert_eq!(health.get(e(id)).map(|h| h.hp), model.get(&id).copied());
    }
}

#[test]
fn test_get_follows_create_and_delete() {
    let health = health_manager();

    health.create(e(42), Health { hp: 7 });
    assert_eq!(health.get(e(42)), Some(Health { hp: 7 }));

    health.delete(e(42));
    assert_eq!(health.get(e(42)), None);
    assert!(!health.set(e(42), Health { hp: 1 }));
}

#[test]
fn test_parallel_visits_each_entity_exactly_once() {
    for n in [0, 1, PAGE_SIZE - 1, PAGE_SIZE, PAGE_SIZE * 3 + 5] {
        let health = health_manager();
        for id in 0..n as u32 {
            health.create(e(id), Health { hp: 0 });
        }

        for workers in [1, 2, 8] {
            let hits: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();
            health.par_for_each(workers, |entity, _| {
                hits[entity.id() as usize].fetch_add(1, Ordering::Relaxed);
            });
            assert!(
                hits.iter().all(|hit| hit.load(Ordering::Relaxed) == 1),
                "n={n} workers={workers}"
            );

            health.par_for_each_mut(workers, |_, value| value.hp += 1);
        }

        health.for_each(|_, value| assert_eq!(value.hp, 3));
    }
}

#[test]
fn test_concurrent_entry_points_serialise() {
    let health = Arc::new(health_manager());

    std::thread::scope(|scope| {
        for worker in 0..4_u32 {
            let health = Arc::clone(&health);
            scope.spawn(move || {
                for i in 0..500 {
                    let entity = e(worker * 1000 + i);
                    health.create(entity, Health { hp: i as i32 });
                    if i % 2 == 0 {
                        health.delete(entity);
                    }
                }
            });
        }
    });

    assert_eq!(health.len(), 4 * 250);
    let mut owners = Vec::new();
    health.raw_entities(&mut owners);
    assert!(owners.iter().all(|owner| owner.id() % 2 == 1));
}

// ============================================================================
// Patches
// ============================================================================

#[test]
fn test_patch_wire_trip_rebuilds_replica() {
    let options = || ManagerOptions::<Health>::new().track_changes(true).codec(PodCodec);
    let source = ComponentManager::with_options(ComponentId::from_raw(0), Arc::new(PresenceTable::new()), options());
    let replica = ComponentManager::with_options(ComponentId::from_raw(0), Arc::new(PresenceTable::new()), options());

    for id in 0..100 {
        source.create(e(id), Health { hp: id as i32 });
    }
    for id in (0..100).step_by(3) {
        source.delete(e(id));
    }

    let bytes = source.patch_get().unwrap().encode().unwrap();
    replica.patch_apply(&Patch::decode(&bytes).unwrap()).unwrap();
    source.patch_reset();

    let mut expected = Vec::new();
    let mut actual = Vec::new();
    source.for_each(|entity, value| expected.push((entity.id(), value.hp)));
    replica.for_each(|entity, value| actual.push((entity.id(), value.hp)));
    expected.sort_unstable();
    actual.sort_unstable();
    assert_eq!(expected, actual);

    // Applying the same patch twice converges to the same state.
    replica.patch_apply(&Patch::decode(&bytes).unwrap()).unwrap();
    assert_eq!(replica.len(), source.len());
}

// ============================================================================
// World
// ============================================================================

#[test]
fn test_world_despawn_clears_presence_and_managers() {
    let mut world = World::new();
    let health = world.register::<Health>();

    let entities: Vec<Entity> = (0..10).map(|_| world.spawn()).collect();
    for (i, &entity) in entities.iter().enumerate() {
        health.create(entity, Health { hp: i as i32 });
    }

    for &entity in entities.iter().step_by(2) {
        assert!(world.despawn(entity));
        assert!(world.components_of(entity).is_empty());
    }

    assert_eq!(health.len(), 5);
    assert_eq!(world.entities().alive_count(), 5);
    assert_eq!(world.entities().presence().entity_count(), 5);
    for (i, &entity) in entities.iter().enumerate() {
        assert_eq!(health.has(entity), i % 2 == 1);
    }
}

#[test]
fn test_world_patches_replay_recycled_ids() {
    let mut source = World::new();
    let health = source.register_with(ManagerOptions::<Health>::new().track_changes(true).codec(PodCodec));
    let teams = source.register_shared(ManagerOptions::<Team>::new().track_changes(true).codec(BincodeCodec));

    let mut replica = World::new();
    let replica_health = replica.register_with(ManagerOptions::<Health>::new().codec(PodCodec));
    let replica_teams = replica.register_shared(ManagerOptions::<Team>::new().codec(BincodeCodec));

    let old = source.spawn();
    let survivor = source.spawn();
    health.create(old, Health { hp: 10 });
    health.create(survivor, Health { hp: 20 });
    teams.create(old, Team::Red);
    replica.apply_patches(&source.collect_patches().unwrap()).unwrap();
    source.reset_patches();

    // Destroy and re-create within one patch window; the new entity takes the
    // recycled id.
    assert!(source.despawn(old));
    let new = source.spawn();
    assert_eq!(new.id(), old.id());
    health.create(new, Health { hp: 99 });
    teams.create(new, Team::Blue);

    let bytes: Vec<Vec<u8>> = source
        .collect_patches()
        .unwrap()
        .iter()
        .map(|patch| patch.encode().unwrap())
        .collect();
    let patches: Vec<Patch> = bytes.iter().map(|bytes| Patch::decode(bytes).unwrap()).collect();
    replica.apply_patches(&patches).unwrap();

    assert!(!replica_health.has(old));
    assert_eq!(replica_health.get(new), Some(Health { hp: 99 }));
    assert_eq!(replica_health.get(survivor), Some(Health { hp: 20 }));
    assert_eq!(replica_health.len(), 2);

    assert!(!replica_teams.has(old));
    assert_eq!(replica_teams.get(new), Some(Team::Blue));
    assert_eq!(replica_teams.instance_count(), 1);
}
