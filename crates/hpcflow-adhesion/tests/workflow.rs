use async_trait::async_trait;
use hpcflow_adhesion::{
    AGGREGATION_STEP, AdhesionRecord, AdhesionSystem, DEFAULT_RECORD_FILE, INCAR_SLOT,
    RECORD_SLOT, work_of_adhesion_workflow,
};
use hpcflow_core::{
    ArtifactId, ArtifactStore, ConnectionSpec, ExecutorProfile, FetchedOutputs, FlowError,
    InputBinding, JobDriver, JobHandle, JobState, JobStatus, Orchestrator, PollBackoff, RunConfig,
    RunStatus, StagedInput, Step, StepStatus,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Pretends every VASP job finished at once and writes an OUTCAR with a
/// preset energy into each fetched output directory.
struct FakeVaspDriver {
    energies: BTreeMap<String, f64>,
    collinear_interface: bool,
    submitted: Mutex<Vec<(String, String)>>,
}

impl FakeVaspDriver {
    fn new(system: &AdhesionSystem, collinear_interface: bool) -> Self {
        let energies = BTreeMap::from([
            (system.step_name_a(), -10.0),
            (system.step_name_b(), -5.0),
            (system.step_name_a_b(), -16.0),
        ]);
        Self {
            energies,
            collinear_interface,
            submitted: Mutex::new(Vec::new()),
        }
    }

    fn outcar(&self, step: &str) -> String {
        let energy = self.energies.get(step).copied().unwrap_or_default();
        let interface = step.matches('-').count() > 2;
        let y = if interface && self.collinear_interface {
            "5.0 0.0 0.0"
        } else {
            "0.0 5.0 0.0"
        };
        format!(
            "      direct lattice vectors                 reciprocal lattice vectors\n\
             5.0 0.0 0.0  0.2 0.0 0.0\n\
             {y}  0.0 0.2 0.0\n\
             0.0 0.0 30.0  0.0 0.0 0.033\n\
             energy  without entropy= {energy}  energy(sigma->0) = {energy}\n"
        )
    }
}

#[async_trait]
impl JobDriver for FakeVaspDriver {
    async fn submit(
        &self,
        run_id: &str,
        step: &Step,
        inputs: &[StagedInput],
    ) -> Result<JobHandle, FlowError> {
        assert_eq!(inputs.len(), 2, "poscar and incar are uploaded");
        let profile = step
            .profile
            .as_ref()
            .expect("vasp steps carry a profile")
            .with_overrides(&step.overrides);
        let job_name = profile.job_name_for(&step.name);
        let mut submitted = self.submitted.lock().expect("submitted mutex should lock");
        submitted.push((step.name.clone(), job_name.clone()));
        Ok(JobHandle {
            job_id: format!("{}.mgr", submitted.len()),
            step: step.name.clone(),
            job_name,
            remote_dir: format!("/scratch/{run_id}/{}", step.workdir),
            scheduler: profile.scheduler,
            connection: profile.connection.clone(),
        })
    }

    async fn poll(&self, _job: &JobHandle) -> Result<JobStatus, FlowError> {
        Ok(JobStatus::new(JobState::Succeeded))
    }

    async fn fetch_result(
        &self,
        _job: &JobHandle,
        step: &Step,
        local_dir: &Path,
    ) -> Result<FetchedOutputs, FlowError> {
        let mut fetched = FetchedOutputs::new();
        for (slot, output) in &step.outputs {
            let dir = local_dir.join(&output.path);
            std::fs::create_dir_all(&dir).expect("output dir should create");
            std::fs::write(dir.join("OUTCAR"), self.outcar(&step.name))
                .expect("outcar should write");
            fetched.insert(slot.clone(), dir);
        }
        Ok(fetched)
    }

    async fn cancel(&self, _job: &JobHandle) -> Result<(), FlowError> {
        Ok(())
    }
}

fn system(temp: &TempDir) -> AdhesionSystem {
    let inputs = temp.path().join("inputs");
    std::fs::create_dir_all(&inputs).expect("inputs dir should create");
    let names = [
        "Li.001.x3y5z4_vac12.POSCAR",
        "Li2CO3.001.x2y2z2_vac12.POSCAR",
        "Li.001.x5y3z4_Li2CO3.001.x2y2z2_vac12.POSCAR",
    ];
    for name in names {
        std::fs::write(inputs.join(name), "poscar\n").expect("poscar should write");
    }
    AdhesionSystem::new(
        "Li",
        "Li2CO3",
        inputs.join(names[0]),
        inputs.join(names[1]),
        inputs.join(names[2]),
    )
    .vasp_bootstrap("$homedir/.local/bin/bashrc_vasp.6.3.2.sh")
}

fn profile() -> Arc<ExecutorProfile> {
    Arc::new(
        ExecutorProfile::builder("spst-sunzhr")
            .connection(ConnectionSpec::new("10.15.22.167", "flow").port(22112))
            .bootstrap("$HOME/.config/.tianff")
            .remote_root("/public/home/flow/hpcflow")
            .build()
            .expect("profile should build"),
    )
}

#[test]
fn workflow_has_three_vasp_steps_feeding_aggregation() {
    let temp = TempDir::new().expect("temp dir should create");
    let system = system(&temp);
    let graph = work_of_adhesion_workflow(&system, profile(), &temp.path().join("staging"))
        .expect("workflow should build");

    assert_eq!(graph.len(), 4);
    assert_eq!(
        graph.dependencies(AGGREGATION_STEP).into_iter().collect::<Vec<_>>(),
        ["Step-Vasp-Li", "Step-Vasp-Li-Li2CO3", "Step-Vasp-Li2CO3"]
    );
    let interface = graph
        .step("Step-Vasp-Li-Li2CO3")
        .expect("interface step exists");
    assert_eq!(
        interface.outputs["out"].path,
        "Li.001.x5y3z4_Li2CO3.001.x2y2z2_vac12"
    );
    let InputBinding::Upload { path, .. } = &interface.inputs[INCAR_SLOT] else {
        panic!("incar should be an upload");
    };
    let incar = std::fs::read_to_string(path).expect("incar should be staged");
    assert!(incar.contains("ISMEAR = 0"));
    let slab_incar = std::fs::read_to_string(temp.path().join("staging/Step-Vasp-Li/INCAR"))
        .expect("slab incar should be staged");
    assert!(!slab_incar.contains("ISMEAR"));
}

#[tokio::test(flavor = "current_thread")]
async fn run_workflow_computes_record_and_exports_it() {
    let temp = TempDir::new().expect("temp dir should create");
    let system = system(&temp);
    let mut graph = work_of_adhesion_workflow(&system, profile(), &temp.path().join("staging"))
        .expect("workflow should build");
    let driver = Arc::new(FakeVaspDriver::new(&system, false));
    let store = ArtifactStore::new(temp.path().join("artifacts")).expect("store should create");

    let report = Orchestrator
        .run(
            &mut graph,
            RunConfig {
                run_id: Some("run-1".to_string()),
                artifacts: Some(store.clone()),
                poll: PollBackoff::fixed(Duration::from_millis(1)),
                driver: driver.clone(),
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should complete");

    assert_eq!(report.status, RunStatus::Succeeded, "{report:?}");
    let job_names: Vec<String> = driver
        .submitted
        .lock()
        .expect("submitted mutex should lock")
        .iter()
        .map(|(_, job_name)| job_name.clone())
        .collect();
    assert_eq!(job_names, ["Li", "Li-Li2CO3", "Li2CO3"]);

    let exported = store
        .export(
            &ArtifactId::Output {
                step: AGGREGATION_STEP.to_string(),
                slot: RECORD_SLOT.to_string(),
            },
            &temp.path().join("download"),
        )
        .expect("record should export");
    assert!(exported.ends_with(DEFAULT_RECORD_FILE));
    let record = AdhesionRecord::load_from_path(&exported).expect("record should load");
    assert_eq!(record.energy_a, -10.0);
    assert_eq!(record.energy_b, -5.0);
    assert_eq!(record.energy_a_b, -16.0);
    assert!((record.area_a_b - 25.0).abs() < 1e-9);
    assert!((record.adhesion - 0.04).abs() < 1e-9);
}

#[tokio::test(flavor = "current_thread")]
async fn run_collinear_interface_fails_only_aggregation() {
    let temp = TempDir::new().expect("temp dir should create");
    let system = system(&temp);
    let mut graph = work_of_adhesion_workflow(&system, profile(), &temp.path().join("staging"))
        .expect("workflow should build");

    let report = Orchestrator
        .run(
            &mut graph,
            RunConfig {
                run_id: Some("run-2".to_string()),
                artifact_root: temp.path().join("artifacts"),
                poll: PollBackoff::fixed(Duration::from_millis(1)),
                driver: Arc::new(FakeVaspDriver::new(&system, true)),
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should complete");

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed_steps(), [AGGREGATION_STEP]);
    for step in [
        system.step_name_a(),
        system.step_name_b(),
        system.step_name_a_b(),
    ] {
        assert_eq!(graph.status(&step), Some(StepStatus::Succeeded));
    }
    let reason = report
        .step(AGGREGATION_STEP)
        .and_then(|step| step.reason.clone())
        .expect("aggregation failure has a reason");
    assert!(reason.contains("degenerate"), "{reason}");
}
