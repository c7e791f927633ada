#![cfg(unix)]

use serde_json::{Value, json};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const QSUB: &str = "#!/bin/sh\nbash \"$1\" > /dev/null 2>&1\necho \"$$.fake\"\n";
const QSTAT: &str = "#!/bin/sh\necho \"qstat: Unknown Job Id $2\" >&2\nexit 153\n";
const QDEL: &str = "#!/bin/sh\nexit 0\n";
/// Stands in for VASP: energy from the POSCAR comment line, lattice from
/// lines 3-5.
const FAKE_VASP: &str = "#!/bin/sh
energy=$(sed -n 1p POSCAR)
{
  echo '      direct lattice vectors                 reciprocal lattice vectors'
  sed -n 3,5p POSCAR
  echo \"  energy  without entropy= $energy  energy(sigma->0) = $energy\"
} > OUTCAR
";

const POSCAR_A: &str = "Li.001.x3y5z4_vac12.POSCAR";
const POSCAR_B: &str = "Li2CO3.001.x2y2z2_vac12.POSCAR";
const POSCAR_A_B: &str = "Li.001.x5y3z4_Li2CO3.001.x2y2z2_vac12.POSCAR";

fn write_executable(path: &Path, contents: &str) {
    std::fs::write(path, contents).expect("script should write");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("script should become executable");
}

/// Fake scheduler and VASP binaries plus a POTCAR library.
fn fake_cluster(root: &Path) -> PathBuf {
    let bin = root.join("bin");
    std::fs::create_dir_all(&bin).expect("bin dir should create");
    write_executable(&bin.join("qsub"), QSUB);
    write_executable(&bin.join("qstat"), QSTAT);
    write_executable(&bin.join("qdel"), QDEL);
    write_executable(&bin.join("fake_vasp"), FAKE_VASP);
    for setup in ["Li_sv", "C", "O"] {
        let dir = root.join("potpaw_PBE").join(setup);
        std::fs::create_dir_all(&dir).expect("potcar dir should create");
        std::fs::write(dir.join("POTCAR"), format!("PAW_PBE {setup}\n"))
            .expect("potcar should write");
    }
    bin
}

fn poscar(energy: f64, second_vector: &str, species: &str) -> String {
    format!("{energy}\n1.0\n5.0 0.0 0.0\n{second_vector}\n0.0 0.0 30.0\n{species}\n1\n")
}

fn write_adhesion_plan(root: &Path, collinear_interface: bool) -> PathBuf {
    let interface_vector = if collinear_interface {
        "5.0 0.0 0.0"
    } else {
        "0.0 5.0 0.0"
    };
    std::fs::write(root.join(POSCAR_A), poscar(-10.0, "0.0 5.0 0.0", "Li"))
        .expect("poscar should write");
    std::fs::write(root.join(POSCAR_B), poscar(-5.0, "0.0 5.0 0.0", "Li C O"))
        .expect("poscar should write");
    std::fs::write(
        root.join(POSCAR_A_B),
        poscar(-16.0, interface_vector, "Li C O"),
    )
    .expect("poscar should write");

    let plan = json!({
        "profiles": {
            "local": {
                "host": "localhost",
                "user": "flow",
                "queue": "spst_pub",
                "remote_root": root.join("remote"),
            }
        },
        "adhesion": {
            "profile": "local",
            "label_a": "Li",
            "label_b": "Li2CO3",
            "poscar_a": POSCAR_A,
            "poscar_b": POSCAR_B,
            "poscar_a_b": POSCAR_A_B,
            "settings": {
                "command": "fake_vasp",
                "potcar_root": root.join("potpaw_PBE"),
            }
        }
    });
    let path = root.join("plan.json");
    std::fs::write(
        &path,
        serde_json::to_string_pretty(&plan).expect("plan should serialize"),
    )
    .expect("plan should write");
    path
}

fn run_cli(args: &[&str], cwd: &Path, bin: Option<&Path>) -> std::process::Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_hpcflow-cli"));
    command.args(args).current_dir(cwd).env("RUST_LOG", "warn");
    if let Some(bin) = bin {
        let path = std::env::var("PATH").unwrap_or_default();
        command.env("PATH", format!("{}:{path}", bin.display()));
    }
    command.output().expect("cli process should start")
}

fn assert_success(output: &std::process::Output) {
    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn run_adhesion_plan_local_transport_expected_record_exported() {
    let temp = TempDir::new().expect("tempdir should create");
    let bin = fake_cluster(temp.path());
    let plan = write_adhesion_plan(temp.path(), false);

    let output = run_cli(
        &[
            "run",
            "--plan",
            plan.to_str().expect("plan path should be utf8"),
            "--run-id",
            "wf-1",
            "--transport",
            "local",
            "--artifact-root",
            "artifacts",
            "--poll-interval-ms",
            "20",
            "--event-json",
            "--export",
            "Step-Workofadhesion.record",
            "--export-dir",
            "download",
        ],
        temp.path(),
        Some(&bin),
    );
    assert_success(&output);

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("\"category\":\"run\""));
    assert!(stdout.contains("run_id: wf-1"));
    assert!(stdout.contains("status: succeeded"));
    assert!(stdout.contains("exported: Step-Workofadhesion.record"));

    let record: Value = serde_json::from_str(
        &std::fs::read_to_string(temp.path().join("download/workofadhesion.json"))
            .expect("record should be exported"),
    )
    .expect("record should be json");
    assert_eq!(record["energy_a"].as_f64(), Some(-10.0));
    assert_eq!(record["energy_b"].as_f64(), Some(-5.0));
    assert_eq!(record["energy_a_b"].as_f64(), Some(-16.0));
    let adhesion = record["adhesion"].as_f64().expect("adhesion is a number");
    assert!((adhesion - 0.04).abs() < 1e-9, "{adhesion}");

    let potcar = std::fs::read_to_string(
        temp.path()
            .join("remote/wf-1/Step-Vasp-Li-Li2CO3/Li.001.x5y3z4_Li2CO3.001.x2y2z2_vac12/POTCAR"),
    )
    .expect("potcar should be assembled on the cluster");
    assert_eq!(potcar, "PAW_PBE Li_sv\nPAW_PBE C\nPAW_PBE O\n");

    let inspect = run_cli(
        &[
            "inspect-report",
            "--report",
            "artifacts/run-report.json",
            "--json",
        ],
        temp.path(),
        None,
    );
    assert_success(&inspect);
    let report: Value = serde_json::from_slice(&inspect.stdout).expect("report should be json");
    assert_eq!(report["status"].as_str(), Some("succeeded"));
    assert_eq!(
        report["steps"]["Step-Vasp-Li"]["job_name"].as_str(),
        Some("Li")
    );

    assert!(temp.path().join("artifacts/Step-Vasp-Li").exists());
    let clean = run_cli(
        &[
            "clean",
            "--artifact-root",
            "artifacts",
            "--step",
            "Step-Vasp-Li",
        ],
        temp.path(),
        None,
    );
    assert_success(&clean);
    assert!(String::from_utf8_lossy(&clean.stdout).contains("removed: "));
    assert!(!temp.path().join("artifacts/Step-Vasp-Li").exists());
    assert!(temp.path().join("artifacts/Step-Workofadhesion").exists());
}

#[test]
fn run_adhesion_plan_collinear_interface_expected_failed_aggregation_exit_code() {
    let temp = TempDir::new().expect("tempdir should create");
    let bin = fake_cluster(temp.path());
    let plan = write_adhesion_plan(temp.path(), true);

    let output = run_cli(
        &[
            "run",
            "--plan",
            plan.to_str().expect("plan path should be utf8"),
            "--transport",
            "local",
            "--artifact-root",
            "artifacts",
            "--poll-interval-ms",
            "20",
        ],
        temp.path(),
        Some(&bin),
    );

    assert_eq!(output.status.code(), Some(2));
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("status: failed"));
    assert!(stdout.contains("step Step-Vasp-Li-Li2CO3: succeeded"));
    assert!(stdout.contains("step Step-Workofadhesion: failed"));
    assert!(stdout.contains("degenerate"));
    assert!(stdout.contains("step ready step=Step-Vasp-Li"));
    assert!(stdout.contains("step failed step=Step-Workofadhesion reason="));
    assert!(temp.path().join("artifacts/run-report.json").exists());
}

#[test]
fn validate_adhesion_plan_expected_topological_order() {
    let temp = TempDir::new().expect("tempdir should create");
    fake_cluster(temp.path());
    let plan = write_adhesion_plan(temp.path(), false);

    let output = run_cli(
        &[
            "validate",
            "--plan",
            plan.to_str().expect("plan path should be utf8"),
        ],
        temp.path(),
        None,
    );
    assert_success(&output);

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("graph: wf-workofadhesion"));
    assert!(stdout.contains("steps: 4"));
    assert!(stdout.contains(
        "order: Step-Vasp-Li, Step-Vasp-Li-Li2CO3, Step-Vasp-Li2CO3, Step-Workofadhesion"
    ));
    assert!(!temp.path().join("hpcflow-artifacts").exists());
}

#[test]
fn validate_mutually_dependent_steps_expected_unresolved_reference_error() {
    let temp = TempDir::new().expect("tempdir should create");
    let plan = json!({
        "profiles": {
            "pub": {
                "host": "cluster.example",
                "queue": "spst_pub",
                "remote_root": "/scratch",
            }
        },
        "steps": [
            {
                "name": "a",
                "command": "true",
                "profile": "pub",
                "inputs": {"prev": "b.out"},
                "outputs": {"out": {"path": "a"}},
            },
            {
                "name": "b",
                "command": "true",
                "profile": "pub",
                "inputs": {"prev": "a.out"},
                "outputs": {"out": {"path": "b"}},
            }
        ]
    });
    let path = temp.path().join("loop.json");
    std::fs::write(&path, plan.to_string()).expect("plan should write");

    let output = run_cli(
        &[
            "validate",
            "--plan",
            path.to_str().expect("plan path should be utf8"),
        ],
        temp.path(),
        None,
    );

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf8");
    assert!(
        stderr.contains("step 'a' input 'prev' references unknown output 'b.out'"),
        "{stderr}"
    );
}
