//! Cell walking over a uniform grid (Amanatides and Woo).
//!
//! The same walker drives all three levels of a query: voxel groups,
//! coarse voxels inside an occupied group, and fine voxels inside an
//! assigned coarse voxel. Each level is walked over the parametric interval
//! the parent cell covers.

use glam::{IVec3, Vec3};

/// Parametric interval `[enter, exit]` where the ray is inside the box.
pub fn ray_box(origin: Vec3, direction: Vec3, lo: Vec3, hi: Vec3) -> Option<(f32, f32)> {
    let mut t_enter = f32::NEG_INFINITY;
    let mut t_exit = f32::INFINITY;
    for axis in 0..3 {
        let (o, d) = (origin[axis], direction[axis]);
        if d == 0.0 {
            if o < lo[axis] || o > hi[axis] {
                return None;
            }
            continue;
        }
        let a = (lo[axis] - o) / d;
        let b = (hi[axis] - o) / d;
        t_enter = t_enter.max(a.min(b));
        t_exit = t_exit.min(a.max(b));
    }
    (t_enter <= t_exit).then_some((t_enter, t_exit))
}

/// Placement of a grid level in world space. Cell `c` spans
/// `lower + c * cell_width` to `lower + (c + 1) * cell_width`.
#[derive(Debug, Clone, Copy)]
pub struct GridFrame {
    pub lower: Vec3,
    pub cell_width: f32,
    /// First cell walked, inclusive.
    pub min: IVec3,
    /// Last cell walked, exclusive.
    pub max: IVec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellSpan {
    pub cell: IVec3,
    pub t_enter: f32,
    pub t_exit: f32,
}

pub struct GridWalk {
    cell: IVec3,
    step: IVec3,
    t_next: Vec3,
    t_delta: Vec3,
    t: f32,
    t_end: f32,
    frame: GridFrame,
    done: bool,
}

impl GridWalk {
    /// Walk the cells of `frame` the ray crosses between `t_start` and `t_end`.
    ///
    /// The starting cell is clamped into the frame, so a start point sitting
    /// on the frame's boundary is attributed to the nearest inside cell.
    pub fn new(origin: Vec3, direction: Vec3, frame: &GridFrame, t_start: f32, t_end: f32) -> Self {
        let entry = origin + direction * t_start;
        let cell = ((entry - frame.lower) / frame.cell_width)
            .floor()
            .as_ivec3()
            .clamp(frame.min, frame.max - IVec3::ONE);

        let mut step = IVec3::ZERO;
        let mut t_next = Vec3::splat(f32::INFINITY);
        let mut t_delta = Vec3::splat(f32::INFINITY);
        for axis in 0..3 {
            let d = direction[axis];
            if d > 0.0 {
                step[axis] = 1;
                let boundary = frame.lower[axis] + (cell[axis] + 1) as f32 * frame.cell_width;
                t_next[axis] = (boundary - origin[axis]) / d;
                t_delta[axis] = frame.cell_width / d;
            } else if d < 0.0 {
                step[axis] = -1;
                let boundary = frame.lower[axis] + cell[axis] as f32 * frame.cell_width;
                t_next[axis] = (boundary - origin[axis]) / d;
                t_delta[axis] = -frame.cell_width / d;
            }
        }

        Self {
            cell,
            step,
            t_next,
            t_delta,
            t: t_start,
            t_end,
            frame: *frame,
            done: t_start > t_end,
        }
    }

    fn next_axis(&self) -> usize {
        let t = self.t_next;
        if t.x < t.y {
            if t.x < t.z {
                0
            } else {
                2
            }
        } else if t.y < t.z {
            1
        } else {
            2
        }
    }
}

impl Iterator for GridWalk {
    type Item = CellSpan;

    fn next(&mut self) -> Option<CellSpan> {
        if self.done {
            return None;
        }
        let axis = self.next_axis();
        let crossing = self.t_next[axis];
        let span = CellSpan {
            cell: self.cell,
            t_enter: self.t,
            t_exit: crossing.min(self.t_end).max(self.t),
        };

        if crossing >= self.t_end {
            self.done = true;
        } else {
            self.cell[axis] += self.step[axis];
            self.t = crossing;
            self.t_next[axis] += self.t_delta[axis];
            if self.cell[axis] < self.frame.min[axis] || self.cell[axis] >= self.frame.max[axis] {
                self.done = true;
            }
        }
        Some(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_frame(size: i32) -> GridFrame {
        GridFrame {
            lower: Vec3::ZERO,
            cell_width: 1.0,
            min: IVec3::ZERO,
            max: IVec3::splat(size),
        }
    }

    fn walk(origin: Vec3, direction: Vec3, frame: &GridFrame) -> Vec<CellSpan> {
        let hi = frame.lower + frame.max.as_vec3() * frame.cell_width;
        let lo = frame.lower + frame.min.as_vec3() * frame.cell_width;
        let (t0, t1) = ray_box(origin, direction, lo, hi).unwrap();
        GridWalk::new(origin, direction, frame, t0.max(0.0), t1).collect()
    }

    #[test]
    fn test_ray_box_axis_aligned() {
        let (t0, t1) = ray_box(Vec3::new(-1.0, 0.5, 0.5), Vec3::X, Vec3::ZERO, Vec3::ONE).unwrap();
        assert!((t0 - 1.0).abs() < 1e-6);
        assert!((t1 - 2.0).abs() < 1e-6);
        assert!(ray_box(Vec3::new(-1.0, 2.0, 0.5), Vec3::X, Vec3::ZERO, Vec3::ONE).is_none());
        assert!(ray_box(Vec3::new(-1.0, 0.5, 0.5), -Vec3::X, Vec3::ZERO, Vec3::ONE)
            .is_some_and(|(_, t1)| t1 < 0.0));
    }

    #[test]
    fn test_walk_positive_x() {
        let cells = walk(Vec3::new(-0.5, 0.5, 0.5), Vec3::X, &unit_frame(4));
        let xs: Vec<i32> = cells.iter().map(|s| s.cell.x).collect();
        assert_eq!(xs, vec![0, 1, 2, 3]);
        assert!((cells[0].t_enter - 0.5).abs() < 1e-6);
        assert!((cells[3].t_exit - 4.5).abs() < 1e-6);
    }

    #[test]
    fn test_walk_negative_x() {
        let cells = walk(Vec3::new(4.5, 0.5, 2.5), -Vec3::X, &unit_frame(4));
        let xs: Vec<i32> = cells.iter().map(|s| s.cell.x).collect();
        assert_eq!(xs, vec![3, 2, 1, 0]);
        assert!(cells.iter().all(|s| s.cell.z == 2));
    }

    #[test]
    fn test_walk_diagonal_is_face_connected() {
        let direction = Vec3::ONE.normalize();
        let cells = walk(Vec3::new(0.1, 0.2, 0.3), direction, &unit_frame(4));
        // Nine interior crossings before the ray leaves through z = 4.
        assert_eq!(cells.len(), 10);
        for pair in cells.windows(2) {
            let d = (pair[1].cell - pair[0].cell).abs();
            assert_eq!(d.x + d.y + d.z, 1);
            assert!((pair[0].t_exit - pair[1].t_enter).abs() < 1e-5);
        }
    }

    #[test]
    fn test_walk_sub_frame() {
        // Only cells 4..8 of a larger grid, as when walking inside one group.
        let frame = GridFrame {
            lower: Vec3::splat(-8.0),
            cell_width: 2.0,
            min: IVec3::new(4, 0, 0),
            max: IVec3::new(8, 1, 1),
        };
        let cells = walk(Vec3::new(-20.0, -7.0, -7.0), Vec3::X, &frame);
        let xs: Vec<i32> = cells.iter().map(|s| s.cell.x).collect();
        assert_eq!(xs, vec![4, 5, 6, 7]);
    }
}
