use crate::AdhesionError;
use std::path::{Path, PathBuf};

pub const OUTCAR_FILE_NAME: &str = "OUTCAR";

const SIGMA_ZERO_MARKER: &str = "energy(sigma->0)";
const TOTEN_MARKER: &str = "free  energy   TOTEN";
const LATTICE_MARKER: &str = "direct lattice vectors";

/// Final energy and cell of a VASP run.
#[derive(Clone, Debug, PartialEq)]
pub struct OutcarSummary {
    /// eV, extrapolated to zero smearing when VASP reports it.
    pub energy: f64,
    /// Rows are the lattice vectors in Å.
    pub lattice: [[f64; 3]; 3],
}

/// Accepts either a VASP output directory or the OUTCAR itself.
pub fn outcar_path(result: &Path) -> PathBuf {
    if result.is_dir() {
        result.join(OUTCAR_FILE_NAME)
    } else {
        result.to_path_buf()
    }
}

pub fn read_outcar(result: &Path) -> Result<OutcarSummary, AdhesionError> {
    let path = outcar_path(result);
    let text = std::fs::read_to_string(&path).map_err(|error| AdhesionError::Parse {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    parse_outcar(&text).map_err(|message| AdhesionError::Parse {
        path: path.display().to_string(),
        message,
    })
}

/// Uses the last ionic step: later energies and lattice blocks win.
pub fn parse_outcar(text: &str) -> Result<OutcarSummary, String> {
    let mut sigma_zero = None;
    let mut toten = None;
    let mut lattice = None;

    let lines: Vec<&str> = text.lines().collect();
    for (index, line) in lines.iter().enumerate() {
        if let Some(value) = value_after(line, SIGMA_ZERO_MARKER) {
            sigma_zero = Some(value?);
        } else if let Some(value) = value_after(line, TOTEN_MARKER) {
            toten = Some(value?);
        } else if line.contains(LATTICE_MARKER) {
            lattice = Some(parse_lattice(&lines, index + 1)?);
        }
    }

    let energy = sigma_zero
        .or(toten)
        .ok_or_else(|| "no total energy found".to_string())?;
    let lattice = lattice.ok_or_else(|| "no direct lattice vectors found".to_string())?;
    Ok(OutcarSummary { energy, lattice })
}

fn value_after(line: &str, marker: &str) -> Option<Result<f64, String>> {
    let (_, rest) = line.split_once(marker)?;
    let token = rest
        .trim_start()
        .trim_start_matches('=')
        .split_whitespace()
        .next()
        .unwrap_or_default();
    Some(
        token
            .parse()
            .map_err(|_| format!("unreadable value '{token}' after '{marker}'")),
    )
}

fn parse_lattice(lines: &[&str], start: usize) -> Result<[[f64; 3]; 3], String> {
    let mut rows = [[0.0; 3]; 3];
    for (offset, row) in rows.iter_mut().enumerate() {
        let line = lines
            .get(start + offset)
            .ok_or_else(|| "truncated lattice block".to_string())?;
        let values: Vec<f64> = line
            .split_whitespace()
            .take(3)
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|_| format!("unreadable lattice row '{}'", line.trim()))?;
        if values.len() != 3 {
            return Err(format!("short lattice row '{}'", line.trim()));
        }
        row.copy_from_slice(&values);
    }
    Ok(rows)
}
