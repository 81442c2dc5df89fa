//! CPU ray queries against a finished structure.
//!
//! An atom is indexed only in the coarse voxel holding its center, but its
//! sphere may reach up to the largest radius past that voxel's faces, and its
//! fine references are clamped to the voxel's border cells. Traversal
//! therefore walks voxel groups, then coarse voxels, and at every coarse
//! voxel considers its 26 neighbours as well. Each assigned voxel is traced
//! once, at the first walked cell next to it, over its box grown by the fine
//! margin; fine cells outside the voxel read the border cell they clamp to.

use glam::{IVec3, Vec3};

use moltrace_bvh::StructureView;
use moltrace_core::constants::VOXEL_GROUP_SIZE;
use moltrace_core::types::{AtomId, VoxelCoords};

use crate::dda::{ray_box, GridFrame, GridWalk};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    /// Unit length, or zero for a degenerate ray that hits nothing.
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }

    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub atom_id: AtomId,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraversalStats {
    pub groups_visited: u32,
    pub voxels_visited: u32,
    /// Assigned voxels whose grown box the ray crossed.
    pub slots_traced: u32,
    pub fine_voxels_visited: u32,
    pub spheres_tested: u32,
}

/// Nearest non-negative hit distance along the ray. Zero if the origin is inside.
pub fn intersect_sphere(ray: &Ray, center: Vec3, radius: f32) -> Option<f32> {
    let oc = ray.origin - center;
    let c = oc.length_squared() - radius * radius;
    if c <= 0.0 {
        return Some(0.0);
    }
    let b = oc.dot(ray.direction);
    if b > 0.0 {
        return None;
    }
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    Some(-b - disc.sqrt())
}

/// Fine cells a sphere can reach past its coarse voxel's faces.
pub fn fine_margin(view: &StructureView) -> i32 {
    (view.elements().max_radius() / view.grid().fine_width()).ceil() as i32
}

/// The cell and its 26 neighbours.
fn neighbourhood() -> impl Iterator<Item = IVec3> {
    (-1..=1).flat_map(|z| (-1..=1).flat_map(move |y| (-1..=1).map(move |x| IVec3::new(x, y, z))))
}

fn adjacent(a: IVec3, b: IVec3) -> bool {
    (a - b).abs().max_element() <= 1
}

/// Closest atom hit within `t_max`, ties going to the lower atom ID.
pub fn cast_ray(view: &StructureView, ray: &Ray, t_max: f32) -> Option<RayHit> {
    cast_ray_with_stats(view, ray, t_max).0
}

pub fn cast_ray_with_stats(
    view: &StructureView,
    ray: &Ray,
    t_max: f32,
) -> (Option<RayHit>, TraversalStats) {
    let mut stats = TraversalStats::default();
    if ray.direction == Vec3::ZERO {
        return (None, stats);
    }
    let grid = view.grid();
    let Some((t0, t1)) = ray_box(ray.origin, ray.direction, grid.world_min(), grid.world_max())
    else {
        return (None, stats);
    };
    let (t0, t1) = (t0.max(0.0), t1.min(t_max));
    if t0 > t1 {
        return (None, stats);
    }

    // A sphere hit at t is found no later than the cell entered at t plus
    // the sphere's diameter.
    let slack = 2.0 * view.elements().max_radius();
    let margin = fine_margin(view);
    let pad = Vec3::splat(margin as f32 * grid.fine_width());

    let group_size = VOXEL_GROUP_SIZE as i32;
    let group_dim = IVec3::splat(grid.group_dimension() as i32);
    let groups = GridFrame {
        lower: grid.world_min(),
        cell_width: grid.coarse_width() * VOXEL_GROUP_SIZE as f32,
        min: IVec3::ZERO,
        max: group_dim,
    };

    let mut best: Option<RayHit> = None;
    // Last walked coarse voxel that may neighbour an assigned one.
    let mut previous: Option<VoxelCoords> = None;
    'groups: for group in GridWalk::new(ray.origin, ray.direction, &groups, t0, t1) {
        if past(best, group.t_enter, slack) {
            break;
        }
        stats.groups_visited += 1;
        // Voxels of this group can only neighbour voxels of this group or
        // the groups around it.
        let near_occupied = neighbourhood().any(|offset| {
            let g = group.cell + offset;
            g.cmpge(IVec3::ZERO).all()
                && g.cmplt(group_dim).all()
                && view.group_occupied(grid.coords_of_indices((g * group_size).as_uvec3()))
        });
        if !near_occupied {
            previous = None;
            continue;
        }

        let first = group.cell * group_size;
        let voxels = GridFrame {
            lower: grid.world_min(),
            cell_width: grid.coarse_width(),
            min: first,
            max: first + IVec3::splat(group_size),
        };
        for voxel in GridWalk::new(ray.origin, ray.direction, &voxels, group.t_enter, group.t_exit) {
            if past(best, voxel.t_enter, slack) {
                break 'groups;
            }
            stats.voxels_visited += 1;
            let coords = grid.coords_of_indices(voxel.cell.as_uvec3());
            for offset in neighbourhood() {
                let neighbour = coords + offset;
                // Already considered from the previous cell.
                if previous.is_some_and(|p| adjacent(p, neighbour)) {
                    continue;
                }
                let Some(slot) = view.slot_of(neighbour) else {
                    continue;
                };
                let corner = grid.voxel_lower_corner(neighbour);
                let lower = corner - pad;
                let upper = corner + Vec3::splat(grid.coarse_width()) + pad;
                let Some((n0, n1)) = ray_box(ray.origin, ray.direction, lower, upper) else {
                    continue;
                };
                let (n0, n1) = (n0.max(0.0), n1.min(t_max));
                if n0 > n1 {
                    continue;
                }
                stats.slots_traced += 1;
                let fine = GridFrame {
                    lower,
                    cell_width: grid.fine_width(),
                    min: IVec3::ZERO,
                    max: IVec3::splat(grid.fine_dimension() as i32 + 2 * margin),
                };
                trace_slot(view, ray, slot, &fine, margin, (n0, n1), t_max, &mut best, &mut stats);
            }
            previous = Some(coords);
        }
    }
    (best, stats)
}

fn past(best: Option<RayHit>, t_enter: f32, slack: f32) -> bool {
    best.is_some_and(|hit| t_enter > hit.distance + slack)
}

/// Walk one assigned voxel's grown fine grid and test the referenced spheres.
#[allow(clippy::too_many_arguments)]
fn trace_slot(
    view: &StructureView,
    ray: &Ray,
    slot: u32,
    fine: &GridFrame,
    margin: i32,
    (t_start, t_end): (f32, f32),
    t_max: f32,
    best: &mut Option<RayHit>,
    stats: &mut TraversalStats,
) {
    let grid = view.grid();
    let slack = 2.0 * view.elements().max_radius();
    let last = IVec3::splat(grid.fine_dimension() as i32 - 1);
    for cell in GridWalk::new(ray.origin, ray.direction, fine, t_start, t_end) {
        if past(*best, cell.t_enter, slack) {
            break;
        }
        stats.fine_voxels_visited += 1;
        let clamped = (cell.cell - IVec3::splat(margin)).clamp(IVec3::ZERO, last);
        let range = view.fine_range(slot, grid.fine_address(clamped));
        for index in range.begin as u32..range.end as u32 {
            let id = view.reference(slot, index);
            if !view.is_occupied(id) {
                continue;
            }
            stats.spheres_tested += 1;
            let Some(t) = intersect_sphere(ray, view.position(id), view.radius(id)) else {
                continue;
            };
            let closer = match *best {
                None => true,
                Some(hit) => t < hit.distance || (t == hit.distance && id < hit.atom_id),
            };
            if t <= t_max && closer {
                *best = Some(RayHit {
                    atom_id: id,
                    distance: t,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moltrace_bvh::BvhBuilder;
    use moltrace_core::element::CARBON;
    use moltrace_core::types::{Atom, Transaction};
    use moltrace_core::{ElementTable, WorldConfig};

    fn builder() -> BvhBuilder {
        let config = WorldConfig {
            world_dimension: 32.0,
            memory_slot_count: 256,
            atom_capacity: 1024,
            ..WorldConfig::default()
        };
        BvhBuilder::new(config, ElementTable::default()).unwrap()
    }

    fn build(atoms: &[(u32, Vec3)]) -> BvhBuilder {
        let mut b = builder();
        let mut tx = Transaction::default();
        for &(id, p) in atoms {
            tx.add(id, Atom::new(p, CARBON));
        }
        let report = b.update(&tx).unwrap();
        assert_eq!(report.crash, None);
        b
    }

    #[test]
    fn test_sphere_intersection() {
        let ray = Ray::new(Vec3::new(-5.0, 0.0, 0.0), Vec3::X);
        let t = intersect_sphere(&ray, Vec3::ZERO, 1.0).unwrap();
        assert!((t - 4.0).abs() < 1e-5);
        assert!(intersect_sphere(&ray, Vec3::new(0.0, 2.0, 0.0), 1.0).is_none());
        // Sphere behind the origin.
        assert!(intersect_sphere(&ray, Vec3::new(-9.0, 0.0, 0.0), 1.0).is_none());
        assert_eq!(intersect_sphere(&ray, ray.origin, 0.5), Some(0.0));
    }

    #[test]
    fn test_ray_through_origin_hits_single_atom() {
        let b = build(&[(0, Vec3::ZERO)]);
        let view = b.view();
        let ray = Ray::new(Vec3::new(-5.0, 0.01, 0.01), Vec3::X);
        let hit = cast_ray(&view, &ray, f32::INFINITY).unwrap();
        assert_eq!(hit.atom_id, 0);
        let expected = intersect_sphere(&ray, Vec3::ZERO, view.radius(0)).unwrap();
        assert_eq!(hit.distance, expected);
        assert!(hit.distance > 4.8 && hit.distance < 4.9);
        assert!(view.slot_of(IVec3::ZERO).is_some());
    }

    #[test]
    fn test_ray_misses() {
        let b = build(&[(0, Vec3::ZERO)]);
        let ray = Ray::new(Vec3::new(-5.0, 1.0, 0.0), Vec3::X);
        assert_eq!(cast_ray(&b.view(), &ray, f32::INFINITY), None);
        // Too short to reach the atom.
        let ray = Ray::new(Vec3::new(-5.0, 0.01, 0.01), Vec3::X);
        assert_eq!(cast_ray(&b.view(), &ray, 2.0), None);
    }

    #[test]
    fn test_closest_of_two() {
        let b = build(&[(0, Vec3::new(1.0, 1.0, 1.0)), (1, Vec3::new(5.0, 1.0, 1.0))]);
        let view = b.view();
        let forward = Ray::new(Vec3::new(-3.0, 1.0, 1.0), Vec3::X);
        assert_eq!(cast_ray(&view, &forward, f32::INFINITY).unwrap().atom_id, 0);
        let backward = Ray::new(Vec3::new(9.0, 1.0, 1.0), -Vec3::X);
        assert_eq!(cast_ray(&view, &backward, f32::INFINITY).unwrap().atom_id, 1);
    }

    #[test]
    fn test_closest_within_one_fine_voxel() {
        let b = build(&[(7, Vec3::new(1.05, 0.5, 0.5)), (3, Vec3::new(0.95, 0.5, 0.5))]);
        let ray = Ray::new(Vec3::new(-2.0, 0.5, 0.5), Vec3::X);
        assert_eq!(cast_ray(&b.view(), &ray, f32::INFINITY).unwrap().atom_id, 3);
    }

    #[test]
    fn test_empty_groups_skipped() {
        let b = build(&[(0, Vec3::new(12.0, 12.0, 12.0))]);
        let ray = Ray::new(Vec3::new(-15.0, -15.0, -14.5), Vec3::X);
        let (hit, stats) = cast_ray_with_stats(&b.view(), &ray, f32::INFINITY);
        assert_eq!(hit, None);
        assert_eq!(stats.groups_visited, 4);
        assert_eq!(stats.voxels_visited, 0);
    }

    struct Lcg(u64);

    impl Lcg {
        fn next_f32(&mut self) -> f32 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 40) as f32 / (1u64 << 24) as f32
        }

        fn range(&mut self, lo: f32, hi: f32) -> f32 {
            lo + (hi - lo) * self.next_f32()
        }
    }

    #[test]
    fn test_hits_sphere_spilling_into_neighbour() {
        // Center in voxel (0,0,0); the ray passes only through voxel (1,0,0).
        let b = build(&[(0, Vec3::new(1.95, 1.0, 1.0))]);
        let view = b.view();
        assert!(view.slot_of(IVec3::new(1, 0, 0)).is_none());
        let ray = Ray::new(Vec3::new(2.05, -5.0, 1.0), Vec3::Y);
        let expected = intersect_sphere(&ray, Vec3::new(1.95, 1.0, 1.0), view.radius(0)).unwrap();
        let hit = cast_ray(&view, &ray, f32::INFINITY).unwrap();
        assert_eq!(hit.atom_id, 0);
        assert_eq!(hit.distance, expected);
    }

    #[test]
    fn test_hits_spill_across_group_boundary() {
        // Voxel x index 11 is in group 2; the ray only crosses group 3.
        let center = Vec3::new(7.95, 1.0, 1.0);
        let b = build(&[(4, center)]);
        let ray = Ray::new(Vec3::new(8.05, -5.0, 1.0), Vec3::Y);
        let (hit, stats) = cast_ray_with_stats(&b.view(), &ray, f32::INFINITY);
        assert_eq!(hit.map(|h| h.atom_id), Some(4));
        assert_eq!(stats.slots_traced, 1);
    }

    #[test]
    fn test_each_slot_traced_once() {
        let b = build(&[(0, Vec3::new(1.0, 1.0, 1.0))]);
        // Both rays walk three voxels next to the assigned one.
        let ray = Ray::new(Vec3::new(-5.0, 1.0, 3.1), Vec3::X);
        let (hit, stats) = cast_ray_with_stats(&b.view(), &ray, f32::INFINITY);
        assert_eq!(hit, None);
        assert_eq!(stats.slots_traced, 0);
        let ray = Ray::new(Vec3::new(-5.0, 1.0, 2.1), Vec3::X);
        let (hit, stats) = cast_ray_with_stats(&b.view(), &ray, f32::INFINITY);
        assert_eq!(hit, None);
        assert_eq!(stats.slots_traced, 1);
    }

    #[test]
    fn test_removed_atom_in_overflowed_voxel_is_not_hit() {
        let config = WorldConfig {
            world_dimension: 32.0,
            memory_slot_count: 8,
            atom_capacity: 32_768,
            ..WorldConfig::default()
        };
        let mut b = BvhBuilder::new(config, ElementTable::default()).unwrap();
        let mut tx = Transaction::default();
        tx.add(0, Atom::new(Vec3::new(1.0, 1.0, 1.0), CARBON));
        b.update(&tx).unwrap();

        // Remove the atom and overflow its voxel in the same frame.
        let mut tx = Transaction::default();
        tx.remove(0);
        let spacing = 2.0 / 30.0;
        for id in 1..=25_000u32 {
            let i = id - 1;
            let cell = Vec3::new((i % 30) as f32, (i / 30 % 30) as f32, (i / 900) as f32);
            tx.add(id, Atom::new((cell + Vec3::splat(0.5)) * spacing, CARBON));
        }
        let report = b.update(&tx).unwrap();
        assert!(report.crash.is_some());

        let view = b.view();
        let slot = view.slot_of(IVec3::ZERO).unwrap();
        assert_eq!(view.reference(slot, 0), 0);
        assert!(!view.is_occupied(0));
        let ray = Ray::new(Vec3::new(-5.0, 1.0, 1.0), Vec3::X);
        assert_eq!(cast_ray(&view, &ray, f32::INFINITY), None);
    }

    #[test]
    fn test_matches_brute_force() {
        let mut rng = Lcg(11);
        let mut atoms: Vec<(u32, Vec3)> = (0..120)
            .map(|id| {
                let p = Vec3::new(rng.range(-8.0, 8.0), rng.range(-8.0, 8.0), rng.range(-8.0, 8.0));
                (id, p)
            })
            .collect();
        // Centers just inside voxel faces, edges and corners.
        for (k, &x) in [1.97f32, 2.03, -0.02, 3.99].iter().enumerate() {
            atoms.push((120 + k as u32, Vec3::new(x, 1.98, -0.03)));
        }
        let b = build(&atoms);
        let view = b.view();
        let radius = view.radius(0);

        let mut hits = 0;
        for n in 0..400 {
            let origin = Vec3::new(rng.range(-14.0, 14.0), rng.range(-14.0, 14.0), rng.range(-14.0, 14.0));
            let target = if n % 2 == 0 {
                Vec3::new(rng.range(-8.0, 8.0), rng.range(-8.0, 8.0), rng.range(-8.0, 8.0))
            } else {
                // Aim at the boundary atoms, offset to graze their spill.
                let (_, p) = atoms[120 + n % 4];
                p + Vec3::new(rng.range(-0.2, 0.2), rng.range(-0.2, 0.2), rng.range(-0.2, 0.2))
            };
            let ray = Ray::new(origin, target - origin);

            let expected = atoms
                .iter()
                .filter_map(|&(id, p)| intersect_sphere(&ray, p, radius).map(|t| (t, id)))
                .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            let got = cast_ray(&view, &ray, f32::INFINITY);
            match (expected, got) {
                (None, None) => {}
                (Some((t, id)), Some(hit)) => {
                    assert_eq!(hit.atom_id, id);
                    assert!((hit.distance - t).abs() < 1e-4);
                    hits += 1;
                }
                other => panic!("ray {ray:?}: {other:?}"),
            }
        }
        assert!(hits > 0);
    }
}
