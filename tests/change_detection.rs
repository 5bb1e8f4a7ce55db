// Copyright 2025 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Change-filter behavior across query runs.

use chunked_ecs::World;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Position {
    x: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Velocity {
    x: f32,
}

fn populate(world: &mut World, n: usize) -> Vec<chunked_ecs::Entity> {
    (0..n)
        .map(|i| world.spawn((Position { x: i as f32 }, Velocity { x: 1.0 })))
        .collect()
}

#[test]
fn filter_visits_all_then_none_then_touched_chunk() {
    let mut world = World::new();
    // Two chunks worth of entities (512 rows per chunk for this layout).
    let entities = populate(&mut world, 1000);

    let q = world
        .query()
        .all::<Position>()
        .changed::<Position>()
        .build();

    let count_chunks = |world: &mut World| {
        let mut chunks = 0;
        let mut rows = 0;
        world.each(q, |r| {
            chunks += 1;
            rows += r.len();
        });
        (chunks, rows)
    };

    // First run: everything is newer than "never observed".
    let (chunks, rows) = count_chunks(&mut world);
    assert!(chunks >= 2);
    assert_eq!(rows, 1000);

    // No mutation since: nothing to visit.
    let (chunks, rows) = count_chunks(&mut world);
    assert_eq!(chunks, 0);
    assert_eq!(rows, 0);

    // Touch one entity's Position: exactly its chunk shows up again.
    world.get_component_mut::<Position>(entities[700]).unwrap().x = -1.0;
    let (chunks, rows) = count_chunks(&mut world);
    assert_eq!(chunks, 1);
    assert!(rows <= 512);
    assert!(rows > 0);
}

#[test]
fn mutable_views_mark_changes_silent_views_do_not() {
    let mut world = World::new();
    populate(&mut world, 10);

    let writer = world.query().all_mut::<Position>().build();
    let filtered = world
        .query()
        .all::<Position>()
        .changed::<Position>()
        .build();

    // Drain the filter.
    world.each(filtered, |_| {});

    // A silent write does not trip the filter.
    world.each(writer, |rows| {
        let mut pos = rows.view_mut_silent::<Position>();
        pos[0].x += 100.0;
    });
    let mut visited = 0;
    world.each(filtered, |rows| visited += rows.len());
    assert_eq!(visited, 0);

    // A normal mutable view does.
    world.each(writer, |rows| {
        let mut pos = rows.view_mut::<Position>();
        pos[0].x += 100.0;
    });
    let mut visited = 0;
    world.each(filtered, |rows| visited += rows.len());
    assert_eq!(visited, 10);
}

#[test]
fn read_views_never_trip_the_filter() {
    let mut world = World::new();
    populate(&mut world, 10);

    let reader = world.query().all::<Position>().all::<Velocity>().build();
    let filtered = world
        .query()
        .all::<Velocity>()
        .changed::<Velocity>()
        .build();

    world.each(filtered, |_| {});
    // Reading both columns leaves versions untouched.
    world.each(reader, |rows| {
        let _p = rows.view::<Position>();
        let _v = rows.view::<Velocity>();
    });
    let mut visited = 0;
    world.each(filtered, |rows| visited += rows.len());
    assert_eq!(visited, 0);
}

#[test]
fn structural_add_marks_chunk_changed() {
    let mut world = World::new();
    populate(&mut world, 10);

    let filtered = world
        .query()
        .all::<Position>()
        .changed::<Position>()
        .build();
    world.each(filtered, |_| {});

    // A new row lands in the matched chunk; its columns are stamped.
    world.spawn((Position { x: 999.0 }, Velocity { x: 0.0 }));
    let mut visited = 0;
    world.each(filtered, |rows| visited += rows.len());
    assert_eq!(visited, 11);
}
