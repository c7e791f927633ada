use crate::AdhesionError;
use hpcflow_core::{ExecutorProfile, ProfileOverrides, Step, shell_quote};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const VASP_OUTPUT_SLOT: &str = "out";
pub const POSCAR_SLOT: &str = "poscar";
pub const INCAR_SLOT: &str = "incar";
pub const DEFAULT_VASP_COMMAND: &str = "mpirun vasp_std";
pub const DEFAULT_POTCAR_ROOT: &str = "$VASP_PP_PATH/potpaw_PBE";

/// Recommended PAW datasets for elements whose default POTCAR is not the
/// plain element name.
const RECOMMENDED_SETUPS: &[(&str, &str)] = &[
    ("Li", "Li_sv"),
    ("Na", "Na_pv"),
    ("K", "K_sv"),
    ("Rb", "Rb_sv"),
    ("Cs", "Cs_sv"),
    ("Ca", "Ca_sv"),
    ("Sr", "Sr_sv"),
    ("Ba", "Ba_sv"),
    ("Sc", "Sc_sv"),
    ("Ti", "Ti_sv"),
    ("V", "V_sv"),
    ("Cr", "Cr_pv"),
    ("Mn", "Mn_pv"),
    ("Y", "Y_sv"),
    ("Zr", "Zr_sv"),
    ("Nb", "Nb_sv"),
    ("Mo", "Mo_sv"),
];

/// INCAR parameters plus how the calculation is launched on the node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaspSettings {
    /// Written in this order.
    pub parameters: Vec<(String, String)>,
    pub command: String,
    pub potcar_root: String,
    /// Element -> POTCAR directory under `potcar_root`.
    pub setups: BTreeMap<String, String>,
}

impl Default for VaspSettings {
    fn default() -> Self {
        Self::pbe()
    }
}

impl VaspSettings {
    /// PBE relaxation at ENCUT 500 eV with KSPACING 0.25.
    pub fn pbe() -> Self {
        let parameters = [
            ("PREC", "Accurate"),
            ("GGA", "PE"),
            ("ENCUT", "500"),
            ("EDIFF", "1e-05"),
            ("NELM", "500"),
            ("KSPACING", "0.25"),
            ("LREAL", "Auto"),
            ("IBRION", "2"),
            ("NSW", "500"),
            ("EDIFFG", "-0.01"),
            ("NPAR", "2"),
            ("LWAVE", ".FALSE."),
            ("LCHARG", ".FALSE."),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
        Self {
            parameters,
            command: DEFAULT_VASP_COMMAND.to_string(),
            potcar_root: DEFAULT_POTCAR_ROOT.to_string(),
            setups: RECOMMENDED_SETUPS
                .iter()
                .map(|(element, setup)| (element.to_string(), setup.to_string()))
                .collect(),
        }
    }

    /// Same settings with Gaussian smearing, for insulating slabs.
    pub fn with_gaussian_smearing(self, sigma: f64) -> Self {
        self.set("ISMEAR", "0").set("SIGMA", sigma.to_string())
    }

    /// Replaces an existing key in place or appends a new one.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into().to_ascii_uppercase();
        let value = value.into();
        match self.parameters.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.parameters.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn render_incar(&self) -> String {
        self.parameters
            .iter()
            .map(|(key, value)| format!("{key} = {value}\n"))
            .collect()
    }

    /// Shell snippet concatenating POTCARs for the species on line 6 of the
    /// POSCAR in the current directory.
    pub fn potcar_script(&self) -> String {
        let mut cases: Vec<String> = self
            .setups
            .iter()
            .map(|(element, setup)| format!("{element}) d={setup} ;;"))
            .collect();
        cases.push("*) d=\"$el\" ;;".to_string());
        format!(
            ": > POTCAR\nfor el in $(sed -n 6p POSCAR); do\n  case \"$el\" in {} esac\n  cat \"{}/$d/POTCAR\" >> POTCAR || exit 1\ndone",
            cases.join(" "),
            self.potcar_root
        )
    }
}

/// One VASP calculation: a POSCAR relaxed in `outdir` on the cluster.
#[derive(Clone, Debug)]
pub struct VaspJob {
    pub name: String,
    pub poscar: PathBuf,
    pub outdir: String,
    pub settings: VaspSettings,
    pub profile: Arc<ExecutorProfile>,
    pub overrides: ProfileOverrides,
}

impl VaspJob {
    /// `outdir` defaults to the POSCAR file stem.
    pub fn new(name: impl Into<String>, poscar: impl Into<PathBuf>, profile: Arc<ExecutorProfile>) -> Self {
        let poscar = poscar.into();
        let outdir = poscar
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "vasp".to_string());
        Self {
            name: name.into(),
            poscar,
            outdir,
            settings: VaspSettings::pbe(),
            profile,
            overrides: ProfileOverrides::default(),
        }
    }

    pub fn outdir(mut self, outdir: impl Into<String>) -> Self {
        self.outdir = outdir.into();
        self
    }

    pub fn settings(mut self, settings: VaspSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn overrides(mut self, overrides: ProfileOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Writes the job's INCAR to `staging_dir/<name>/INCAR` and returns a remote
/// step that uploads it with the POSCAR, assembles the POTCAR, runs VASP in
/// `outdir` and exposes that directory as output slot `out`.
pub fn vasp_step(job: &VaspJob, staging_dir: &Path) -> Result<Step, AdhesionError> {
    let incar_dir = staging_dir.join(&job.name);
    std::fs::create_dir_all(&incar_dir)?;
    let incar = incar_dir.join("INCAR");
    std::fs::write(&incar, job.settings.render_incar())?;

    let outdir = &job.outdir;
    let command = format!(
        "mkdir -p {dir} && cp \"$HPCFLOW_INPUT_POSCAR\" {poscar} && cp \"$HPCFLOW_INPUT_INCAR\" {incar} && cd {dir} || exit 1\n{}\n{}",
        job.settings.potcar_script(),
        job.settings.command,
        dir = shell_quote(outdir),
        poscar = shell_quote(&format!("{outdir}/POSCAR")),
        incar = shell_quote(&format!("{outdir}/INCAR")),
    );
    Ok(Step::remote(&job.name, command)
        .upload_file(POSCAR_SLOT, &job.poscar)
        .upload_file(INCAR_SLOT, incar)
        .output_dir(VASP_OUTPUT_SLOT, outdir)
        .profile(Arc::clone(&job.profile))
        .overrides(job.overrides.clone()))
}
