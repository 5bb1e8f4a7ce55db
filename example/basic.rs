//! Example: basic world usage
//!
//! Shows spawn/despawn, query iteration and a deferred command buffer.

use chunked_ecs::{CommandBuffer, World};

// Define components
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
struct Position {
    x: f32,
    y: f32,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
struct Velocity {
    x: f32,
    y: f32,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
struct Health(u32);

fn main() {
    let mut world = World::new();

    println!("Creating entities...");

    let entity1 = world.spawn((Position { x: 0.0, y: 0.0 }, Velocity { x: 1.0, y: 0.5 }));
    println!("Spawned entity {:?}", entity1);

    let entity2 = world.spawn((
        Position { x: 10.0, y: 20.0 },
        Velocity { x: -1.0, y: 2.0 },
        Health(100),
    ));
    println!("Spawned entity {:?}", entity2);

    let entity3 = world.spawn((Position { x: 5.0, y: 5.0 },));
    println!("Spawned entity {:?}", entity3);

    // Integrate velocities.
    let movement = world.query().all_mut::<Position>().all::<Velocity>().build();
    world.each(movement, |rows| {
        let mut pos = rows.view_mut::<Position>();
        let vel = rows.view::<Velocity>();
        for i in 0..rows.len() {
            pos[i].x += vel[i].x;
            pos[i].y += vel[i].y;
        }
    });
    println!(
        "After one step, entity1 sits at {:?}",
        world.get_component::<Position>(entity1)
    );

    // Structural changes during iteration go through a command buffer.
    let mut commands = CommandBuffer::new();
    let everything = world.query().all::<Position>().build();
    world.each(everything, |rows| {
        for i in 0..rows.len() {
            if rows.entity(i) == entity2 {
                commands.del(rows.entity(i));
            }
        }
    });
    commands.commit(&mut world).expect("commit");
    println!("Despawned entity {:?}", entity2);
    assert!(!world.is_alive(entity2));

    println!("\nWorld summary:");
    let stats = world.stats();
    println!(
        "  {} entities across {} archetypes ({} chunks)",
        stats.entities, stats.archetypes, stats.chunks
    );
}
