use crate::{AdhesionError, read_outcar};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Below this |sin γ| the in-plane vectors are treated as collinear.
pub const MIN_SIN_GAMMA: f64 = 1e-12;

/// Unit-cell lengths in Å and angles in degrees, as `(a, b, c, α, β, γ)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellParameters {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl CellParameters {
    pub fn from_lattice(lattice: &[[f64; 3]; 3]) -> Self {
        let [x, y, z] = lattice;
        Self {
            a: norm(x),
            b: norm(y),
            c: norm(z),
            alpha: angle_degrees(y, z),
            beta: angle_degrees(x, z),
            gamma: angle_degrees(x, y),
        }
    }

    /// `|x|·|y|·sin γ`, the area of the interface plane.
    pub fn interfacial_area(&self) -> Result<f64, AdhesionError> {
        let sin_gamma = self.gamma.to_radians().sin();
        if !sin_gamma.is_finite() || sin_gamma.abs() < MIN_SIN_GAMMA {
            return Err(AdhesionError::DegenerateGeometry(format!(
                "sin(γ) is {sin_gamma} for γ = {}°",
                self.gamma
            )));
        }
        let area = self.a * self.b * sin_gamma;
        if !area.is_finite() || area == 0.0 {
            return Err(AdhesionError::DegenerateGeometry(format!(
                "interfacial area is {area} for |x| = {}, |y| = {}",
                self.a, self.b
            )));
        }
        Ok(area)
    }
}

fn norm(v: &[f64; 3]) -> f64 {
    v.iter().map(|c| c * c).sum::<f64>().sqrt()
}

fn angle_degrees(u: &[f64; 3], v: &[f64; 3]) -> f64 {
    let lengths = norm(u) * norm(v);
    if lengths == 0.0 {
        return 90.0;
    }
    let dot: f64 = u.iter().zip(v).map(|(p, q)| p * q).sum();
    (dot / lengths).clamp(-1.0, 1.0).acos().to_degrees()
}

/// Field order is the order written to disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdhesionRecord {
    pub energy_a: f64,
    pub energy_b: f64,
    pub energy_a_b: f64,
    pub area_a_b: f64,
    pub adhesion: f64,
}

impl AdhesionRecord {
    /// Reads the three OUTCARs and computes the record; the cell comes from
    /// the composite.
    pub fn from_results(a: &Path, b: &Path, a_b: &Path) -> Result<Self, AdhesionError> {
        let slab_a = read_outcar(a)?;
        let slab_b = read_outcar(b)?;
        let composite = read_outcar(a_b)?;
        compute_work_of_adhesion(
            slab_a.energy,
            slab_b.energy,
            composite.energy,
            &CellParameters::from_lattice(&composite.lattice),
        )
    }

    pub fn to_json(&self) -> Result<String, AdhesionError> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn write_to_path(&self, path: &Path) -> Result<(), AdhesionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load_from_path(path: &Path) -> Result<Self, AdhesionError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// `(E_a + E_b - E_ab) / area(a_b)`.
pub fn compute_work_of_adhesion(
    energy_a: f64,
    energy_b: f64,
    energy_a_b: f64,
    cell: &CellParameters,
) -> Result<AdhesionRecord, AdhesionError> {
    let area_a_b = cell.interfacial_area()?;
    Ok(AdhesionRecord {
        energy_a,
        energy_b,
        energy_a_b,
        area_a_b,
        adhesion: (energy_a + energy_b - energy_a_b) / area_a_b,
    })
}
