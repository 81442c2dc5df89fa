//! Per-element display metadata: radius (nm) and color, indexed by atomic number.

use serde::{Deserialize, Serialize};

use crate::constants::FALLBACK_RADIUS;
use crate::error::ConfigError;

/// Color for element codes without an entry.
const FALLBACK_COLOR: [f32; 3] = [1.0, 0.0, 1.0];

/// (atomic number, radius in Å, color in 8-bit RGB)
const BUILTIN: &[(u8, f32, [u8; 3])] = &[
    (0, 0.853, [204, 0, 0]),
    (1, 0.930, [199, 199, 199]),
    (2, 1.085, [217, 255, 255]),
    (3, 3.100, [0, 128, 128]),
    (4, 2.325, [250, 171, 255]),
    (5, 1.550, [51, 51, 150]),
    (6, 1.426, [99, 99, 99]),
    (7, 1.201, [31, 31, 99]),
    (8, 1.349, [128, 0, 0]),
    (9, 1.279, [0, 99, 51]),
    (10, 1.411, [179, 227, 245]),
    (11, 3.100, [0, 102, 102]),
    (12, 2.325, [224, 153, 230]),
    (13, 1.938, [128, 128, 255]),
    (14, 1.744, [41, 41, 41]),
    (15, 1.635, [84, 20, 128]),
    (16, 1.635, [219, 150, 0]),
    (17, 1.573, [74, 99, 0]),
    (18, 1.457, [128, 209, 227]),
    (19, 3.875, [0, 77, 77]),
    (20, 3.100, [201, 140, 204]),
    (21, 2.868, [230, 230, 230]),
    (22, 2.712, [191, 194, 199]),
    (23, 2.558, [166, 166, 171]),
    (24, 2.403, [138, 153, 199]),
    (25, 2.325, [156, 122, 199]),
    (26, 2.325, [224, 102, 51]),
    (27, 2.325, [240, 144, 160]),
    (28, 2.325, [80, 208, 80]),
    (29, 2.325, [200, 128, 51]),
    (30, 2.248, [106, 106, 130]),
    (31, 2.093, [153, 153, 204]),
    (32, 1.938, [102, 115, 26]),
    (33, 1.705, [153, 66, 179]),
    (34, 1.705, [199, 79, 0]),
    (35, 1.662, [0, 102, 77]),
    (36, 1.565, [92, 184, 209]),
    (50, 2.227, [102, 128, 128]),
    (79, 2.371, [212, 175, 55]),
    (82, 2.339, [87, 89, 97]),
];

/// Atomic number of carbon.
pub const CARBON: u8 = 6;

/// Atomic number of hydrogen.
pub const HYDROGEN: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    /// Display radius in nm.
    pub radius: f32,
    /// Linear RGB in [0, 1].
    pub color: [f32; 3],
}

/// Read-only lookup from element code to display metadata.
///
/// Holds exactly 256 entries so every `u8` code resolves. Codes without a
/// definition resolve to [`FALLBACK_RADIUS`] and magenta.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementTable {
    entries: Vec<ElementInfo>,
}

/// Serialized form: only the defined elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ElementDef {
    code: u8,
    radius: f32,
    color: [f32; 3],
}

impl Default for ElementTable {
    fn default() -> Self {
        let mut table = Self::empty();
        for &(code, radius_angstrom, rgb) in BUILTIN {
            table.entries[code as usize] = ElementInfo {
                radius: radius_angstrom * 0.1,
                color: rgb.map(|c| c as f32 / 255.0),
            };
        }
        table
    }
}

impl ElementTable {
    /// A table where every code resolves to the fallback entry.
    pub fn empty() -> Self {
        Self {
            entries: vec![
                ElementInfo {
                    radius: FALLBACK_RADIUS,
                    color: FALLBACK_COLOR,
                };
                256
            ],
        }
    }

    /// Parse a list of `(code, radius, color)` definitions over an empty table.
    pub fn from_ron_str(ron_str: &str) -> Result<Self, ConfigError> {
        let options = ron::Options::default();
        let defs: Vec<ElementDef> = options
            .from_str(ron_str)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let mut table = Self::empty();
        for def in defs {
            table.set(def.code, ElementInfo {
                radius: def.radius,
                color: def.color,
            })?;
        }
        Ok(table)
    }

    /// Override one entry. Radii must be finite and positive.
    pub fn set(&mut self, code: u8, info: ElementInfo) -> Result<(), ConfigError> {
        if !(info.radius.is_finite() && info.radius > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "element {} radius must be positive, got {}",
                code, info.radius
            )));
        }
        self.entries[code as usize] = info;
        Ok(())
    }

    pub fn get(&self, code: u8) -> ElementInfo {
        self.entries[code as usize]
    }

    pub fn radius(&self, code: u8) -> f32 {
        self.entries[code as usize].radius
    }

    pub fn color(&self, code: u8) -> [f32; 3] {
        self.entries[code as usize].color
    }

    /// Largest radius over all codes. Bounds how far a sphere reaches past its voxel.
    pub fn max_radius(&self) -> f32 {
        self.entries.iter().map(|e| e.radius).fold(0.0, f32::max)
    }

    /// Radii of all 256 codes, for GPU upload.
    pub fn radii(&self) -> Vec<f32> {
        self.entries.iter().map(|e| e.radius).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carbon_radius() {
        let table = ElementTable::default();
        assert!((table.radius(CARBON) - 0.1426).abs() < 1e-6);
        assert!((table.radius(HYDROGEN) - 0.0930).abs() < 1e-6);
    }

    #[test]
    fn test_carbon_color() {
        let table = ElementTable::default();
        let c = table.color(CARBON);
        assert!((c[0] - 99.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_element_falls_back() {
        let table = ElementTable::default();
        // Rubidium is not parameterized.
        assert_eq!(table.radius(37), FALLBACK_RADIUS);
        assert_eq!(table.radius(255), FALLBACK_RADIUS);
        assert_eq!(table.color(255), FALLBACK_COLOR);
    }

    #[test]
    fn test_all_radii_nonzero() {
        let table = ElementTable::default();
        assert!(table.radii().iter().all(|&r| r > 0.0));
        assert_eq!(table.radii().len(), 256);
    }

    #[test]
    fn test_max_radius_is_potassium() {
        let table = ElementTable::default();
        assert!((table.max_radius() - 0.3875).abs() < 1e-6);
    }

    #[test]
    fn test_from_ron() {
        let table = ElementTable::from_ron_str(
            "[(code: 6, radius: 0.17, color: (0.5, 0.5, 0.5))]",
        )
        .unwrap();
        assert!((table.radius(6) - 0.17).abs() < 1e-6);
        assert_eq!(table.radius(1), FALLBACK_RADIUS);
    }

    #[test]
    fn test_zero_radius_rejected() {
        let mut table = ElementTable::default();
        let err = table.set(6, ElementInfo {
            radius: 0.0,
            color: [0.0; 3],
        });
        assert!(err.is_err());
        assert!((table.radius(6) - 0.1426).abs() < 1e-6);
    }
}
