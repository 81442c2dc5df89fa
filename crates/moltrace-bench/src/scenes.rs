use glam::Vec3;

use moltrace_core::element::CARBON;
use moltrace_core::types::{Atom, AtomId, Transaction};
use moltrace_scene::AtomStore;

/// Cubic lattice constant of diamond, in nm.
pub const DIAMOND_LATTICE_CONSTANT: f32 = 0.357;

/// Fractional positions of the eight atoms in the diamond unit cell.
const DIAMOND_BASIS: [[f32; 3]; 8] = [
    [0.0, 0.0, 0.0],
    [0.0, 0.5, 0.5],
    [0.5, 0.0, 0.5],
    [0.5, 0.5, 0.0],
    [0.25, 0.25, 0.25],
    [0.25, 0.75, 0.75],
    [0.75, 0.25, 0.75],
    [0.75, 0.75, 0.25],
];

/// Largest per-axis displacement of a jittered atom from its lattice site.
const JITTER_AMPLITUDE: f32 = 0.02;

/// Slabs the churn scene cycles through along x.
const CHURN_SLABS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneKind {
    /// Static block. Every frame after the first is an empty transaction.
    Lattice,
    /// Every atom moves every frame.
    Jitter,
    /// A slab of atoms is removed on even frames and re-added on odd ones.
    Churn,
}

/// Configuration for a single benchmark scene.
#[derive(Debug, Clone)]
pub struct SceneConfig {
    pub name: &'static str,
    pub kind: SceneKind,
    /// Diamond unit cells per block edge.
    pub cells_per_axis: u32,
}

impl SceneConfig {
    pub fn atom_count(&self) -> u32 {
        DIAMOND_BASIS.len() as u32 * self.cells_per_axis.pow(3)
    }
}

/// Return the standard suite of benchmark scenes.
pub fn standard_scenes() -> Vec<SceneConfig> {
    vec![
        SceneConfig {
            name: "lattice-8",
            kind: SceneKind::Lattice,
            cells_per_axis: 8,
        },
        SceneConfig {
            name: "lattice-16",
            kind: SceneKind::Lattice,
            cells_per_axis: 16,
        },
        SceneConfig {
            name: "jitter-8",
            kind: SceneKind::Jitter,
            cells_per_axis: 8,
        },
        SceneConfig {
            name: "jitter-16",
            kind: SceneKind::Jitter,
            cells_per_axis: 16,
        },
        SceneConfig {
            name: "churn-16",
            kind: SceneKind::Churn,
            cells_per_axis: 16,
        },
    ]
}

pub fn find_scene(name: &str) -> Option<SceneConfig> {
    standard_scenes().into_iter().find(|s| s.name == name)
}

/// Sites of a diamond block of `cells` unit cells per edge, centered on the origin.
pub fn diamond_lattice(cells: u32) -> Vec<Vec3> {
    let half = cells as f32 * DIAMOND_LATTICE_CONSTANT / 2.0;
    let mut sites = Vec::with_capacity(DIAMOND_BASIS.len() * cells.pow(3) as usize);
    for z in 0..cells {
        for y in 0..cells {
            for x in 0..cells {
                let cell = Vec3::new(x as f32, y as f32, z as f32);
                for basis in DIAMOND_BASIS {
                    let p = (cell + Vec3::from_array(basis)) * DIAMOND_LATTICE_CONSTANT;
                    sites.push(p - Vec3::splat(half));
                }
            }
        }
    }
    sites
}

/// Drives an [`AtomStore`] through a scene, one frame at a time.
pub struct SceneDriver {
    kind: SceneKind,
    sites: Vec<Vec3>,
    /// ID of the atom at each site, `None` while the site is churned out.
    site_ids: Vec<Option<AtomId>>,
    store: AtomStore,
    half_extent: f32,
    rng: u64,
}

impl SceneDriver {
    /// Populate a store with the scene's initial block. The first
    /// [`SceneDriver::transaction`] adds every atom.
    pub fn new(config: &SceneConfig, capacity: u32) -> Self {
        let sites = diamond_lattice(config.cells_per_axis);
        let mut store = AtomStore::new(capacity);
        let site_ids = sites
            .iter()
            .map(|&p| store.push(Atom::new(p, CARBON)))
            .collect::<Vec<_>>();
        let placed = site_ids.iter().filter(|id| id.is_some()).count();
        if placed < sites.len() {
            log::warn!(
                "Scene '{}': store capacity {} holds {} of {} atoms",
                config.name,
                capacity,
                placed,
                sites.len()
            );
        }
        Self {
            kind: config.kind,
            sites,
            site_ids,
            store,
            half_extent: config.cells_per_axis as f32 * DIAMOND_LATTICE_CONSTANT / 2.0,
            rng: 0x2545_f491_4f6c_dd1d,
        }
    }

    pub fn store(&self) -> &AtomStore {
        &self.store
    }

    pub fn half_extent(&self) -> f32 {
        self.half_extent
    }

    fn next_unit(&mut self) -> f32 {
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 7;
        self.rng ^= self.rng << 17;
        (self.rng >> 40) as f32 / (1u64 << 24) as f32 * 2.0 - 1.0
    }

    /// Slab of sites churned on `frame`, as an x interval.
    fn churn_slab(&self, frame: u32) -> (f32, f32) {
        let width = 2.0 * self.half_extent / CHURN_SLABS as f32;
        let lo = -self.half_extent + (frame / 2 % CHURN_SLABS) as f32 * width;
        (lo, lo + width)
    }

    /// Apply the scene's edits for `frame` (frames start at 1; frame 0 is the
    /// initial population).
    pub fn advance(&mut self, frame: u32) {
        match self.kind {
            SceneKind::Lattice => {}
            SceneKind::Jitter => {
                for i in 0..self.sites.len() {
                    let Some(id) = self.site_ids[i] else {
                        continue;
                    };
                    let offset = Vec3::new(self.next_unit(), self.next_unit(), self.next_unit())
                        * JITTER_AMPLITUDE;
                    // Ids come from this store, so the write cannot fail.
                    let _ = self.store.set(id, Atom::new(self.sites[i] + offset, CARBON));
                }
            }
            SceneKind::Churn => {
                let (lo, hi) = self.churn_slab(frame);
                let removing = frame % 2 == 0;
                for i in 0..self.sites.len() {
                    let x = self.sites[i].x;
                    if x < lo || x >= hi {
                        continue;
                    }
                    if removing {
                        if let Some(id) = self.site_ids[i].take() {
                            let _ = self.store.remove(id);
                        }
                    } else if self.site_ids[i].is_none() {
                        self.site_ids[i] = self.store.push(Atom::new(self.sites[i], CARBON));
                    }
                }
            }
        }
    }

    /// Net change since the previous call.
    pub fn transaction(&mut self) -> Transaction {
        self.store.register_changes()
    }
}
