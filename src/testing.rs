//! In-process stand-ins for the container engine and the collaborators.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::clients::{
    BranchOutcome, ClientError, CodeHost, Planner, PullRequestDraft, VersionControl,
};
use crate::plan::{ChangePlan, FileEdit, RepoInventory};
use crate::requirement::types::RepoSpec;
use crate::requirement::Requirement;
use crate::runner::{ContainerEngine, ContainerSpec, RunnerError};

/// What a fake container does once started.
#[derive(Debug, Clone)]
pub struct FakeRun {
    behavior: Behavior,
    delay: Duration,
    wedged: bool,
}

#[derive(Debug, Clone)]
enum Behavior {
    Exit { code: i64, logs: String },
    EngineError(String),
    /// Fails when any `test_*.py` under the mount contains `assert False`
    Pytest,
}

impl FakeRun {
    pub fn exit(code: i64, logs: &str) -> Self {
        Self {
            behavior: Behavior::Exit {
                code,
                logs: logs.to_string(),
            },
            delay: Duration::ZERO,
            wedged: false,
        }
    }

    pub fn engine_error(message: &str) -> Self {
        Self {
            behavior: Behavior::EngineError(message.to_string()),
            delay: Duration::ZERO,
            wedged: false,
        }
    }

    pub fn pytest() -> Self {
        Self {
            behavior: Behavior::Pytest,
            delay: Duration::ZERO,
            wedged: false,
        }
    }

    /// Make `wait` take this long.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make `kill` and `logs` never return, like a daemon that stopped
    /// answering.
    pub fn wedged(mut self) -> Self {
        self.wedged = true;
        self
    }
}

#[derive(Default)]
struct EngineState {
    created: Vec<ContainerSpec>,
    live: HashMap<String, ContainerSpec>,
    kills: usize,
    failing_creates: usize,
}

/// A container engine that tracks live containers instead of running them.
pub struct FakeEngine {
    run: FakeRun,
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new(run: FakeRun) -> Self {
        Self {
            run,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// The next `n` creates fail as if the daemon were down.
    pub fn fail_next_creates(&self, n: usize) {
        self.state.lock().unwrap().failing_creates = n;
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    /// Every create request, including failed ones.
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn kill_count(&self) -> usize {
        self.state.lock().unwrap().kills
    }

    fn outcome(&self, name: &str) -> Result<(i64, String), RunnerError> {
        let mount = self
            .state
            .lock()
            .unwrap()
            .live
            .get(name)
            .map(|spec| spec.mount_source.clone())
            .ok_or_else(|| RunnerError::Engine(format!("no such container: {name}")))?;

        match &self.run.behavior {
            Behavior::Exit { code, logs } => Ok((*code, logs.clone())),
            Behavior::EngineError(message) => Err(RunnerError::Engine(message.clone())),
            Behavior::Pytest => Ok(fake_pytest(&mount)),
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pull(&self, _image: &str) -> Result<(), RunnerError> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), RunnerError> {
        let mut state = self.state.lock().unwrap();
        state.created.push(spec.clone());
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(RunnerError::EngineUnavailable(
                "Cannot connect to the Docker daemon".to_string(),
            ));
        }
        state.live.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RunnerError> {
        if self.state.lock().unwrap().live.contains_key(name) {
            Ok(())
        } else {
            Err(RunnerError::Engine(format!("no such container: {name}")))
        }
    }

    async fn wait(&self, name: &str) -> Result<i64, RunnerError> {
        tokio::time::sleep(self.run.delay).await;
        self.outcome(name).map(|(code, _)| code)
    }

    async fn kill(&self, _name: &str) -> Result<(), RunnerError> {
        self.state.lock().unwrap().kills += 1;
        if self.run.wedged {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn logs(&self, name: &str) -> Result<String, RunnerError> {
        if self.run.wedged {
            std::future::pending::<()>().await;
        }
        self.outcome(name).map(|(_, logs)| logs)
    }

    async fn remove(&self, name: &str) -> Result<(), RunnerError> {
        self.state.lock().unwrap().live.remove(name);
        Ok(())
    }

    async fn sweep(&self, label: &str) -> Result<usize, RunnerError> {
        let mut state = self.state.lock().unwrap();
        let before = state.live.len();
        state.live.retain(|_, spec| !spec.labels.contains_key(label));
        Ok(before - state.live.len())
    }
}

fn fake_pytest(mount: &Path) -> (i64, String) {
    let mut tests = Vec::new();
    collect_tests(mount, &mut tests);
    tests.sort();

    let failing: Vec<&PathBuf> = tests
        .iter()
        .filter(|p| {
            std::fs::read_to_string(p)
                .map(|c| c.contains("assert False"))
                .unwrap_or(false)
        })
        .collect();

    if failing.is_empty() {
        return (0, format!("{} passed in 0.01s\n", tests.len()));
    }

    let mut logs = String::new();
    for path in &failing {
        let rel = path.strip_prefix(mount).unwrap_or(path);
        logs.push_str(&format!(
            "{}:2: in test\n    assert False\nE   AssertionError: assert False\n",
            rel.display()
        ));
    }
    logs.push_str(&format!(
        "{} failed, {} passed in 0.02s\n",
        failing.len(),
        tests.len() - failing.len()
    ));
    (1, logs)
}

fn collect_tests(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_tests(&path, out);
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("test_") && n.ends_with(".py"))
        {
            out.push(path);
        }
    }
}

/// Version control over the local filesystem: "cloning" writes a small
/// Python project into the destination.
pub struct FakeVcs {
    failing_clones: AtomicUsize,
    clones: AtomicUsize,
    branches: Mutex<HashSet<String>>,
    pushed: Mutex<Vec<String>>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self {
            failing_clones: AtomicUsize::new(0),
            clones: AtomicUsize::new(0),
            branches: Mutex::new(HashSet::new()),
            pushed: Mutex::new(Vec::new()),
        }
    }

    /// The first `n` clones fail with a network error.
    pub fn failing_clones(self, n: usize) -> Self {
        self.failing_clones.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_existing_branch(self, name: &str) -> Self {
        self.branches.lock().unwrap().insert(name.to_string());
        self
    }

    pub fn clone_count(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }

    pub fn pushed_branches(&self) -> Vec<String> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn clone_repo(&self, _repo: &RepoSpec, dest: &Path) -> Result<PathBuf, ClientError> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failing_clones
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ClientError::Transient("connection reset by peer".to_string()));
        }

        let files = [
            ("README.md", "# service\n"),
            ("app/__init__.py", ""),
            ("app/main.py", "def create_app():\n    return object()\n"),
            ("tests/__init__.py", ""),
        ];
        for (path, content) in files {
            let path = dest.join(path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ClientError::Rejected(e.to_string()))?;
            }
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| ClientError::Rejected(e.to_string()))?;
        }
        Ok(dest.to_path_buf())
    }

    async fn create_branch(
        &self,
        _repo_dir: &Path,
        name: &str,
    ) -> Result<BranchOutcome, ClientError> {
        if self.branches.lock().unwrap().insert(name.to_string()) {
            Ok(BranchOutcome::Created)
        } else {
            Ok(BranchOutcome::AlreadyExists)
        }
    }

    async fn commit_and_push(
        &self,
        _repo_dir: &Path,
        branch: &str,
        _edits: &[FileEdit],
        _message: &str,
    ) -> Result<String, ClientError> {
        let mut pushed = self.pushed.lock().unwrap();
        pushed.push(branch.to_string());
        Ok(format!("{:0>40x}", pushed.len()))
    }
}

/// Returns fixed raw payloads, as a recorded planning service would.
pub struct FakePlanner {
    plan: Value,
    edits: Value,
    plan_calls: AtomicUsize,
    edit_calls: AtomicUsize,
}

impl FakePlanner {
    pub fn new(plan: Value, edits: Value) -> Self {
        Self {
            plan,
            edits,
            plan_calls: AtomicUsize::new(0),
            edit_calls: AtomicUsize::new(0),
        }
    }

    pub fn passing_test() -> Self {
        Self::with_test_body("    assert create_app() is not None")
    }

    pub fn failing_test() -> Self {
        Self::with_test_body("    assert False")
    }

    fn with_test_body(body: &str) -> Self {
        Self::new(
            json!({
                "summary": "Add a health check test",
                "touched_files": ["tests/test_health.py"]
            }),
            json!({
                "edits": [{
                    "action": "create",
                    "path": "tests/test_health.py",
                    "content": format!("from app.main import create_app\n\ndef test_health():\n{body}")
                }]
            }),
        )
    }

    pub fn plan_calls(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }

    pub fn edit_calls(&self) -> usize {
        self.edit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for FakePlanner {
    async fn plan(
        &self,
        _requirement: &Requirement,
        _inventory: &RepoInventory,
    ) -> Result<Value, ClientError> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.plan.clone())
    }

    async fn generate_edits(
        &self,
        _requirement: &Requirement,
        _plan: &ChangePlan,
        _repo_dir: &Path,
    ) -> Result<Value, ClientError> {
        self.edit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.edits.clone())
    }
}

/// Records pull request drafts and answers with a URL or a fixed error.
pub struct FakeHost {
    failure: Option<ClientError>,
    drafts: Mutex<Vec<PullRequestDraft>>,
}

impl FakeHost {
    pub fn ok() -> Self {
        Self {
            failure: None,
            drafts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: ClientError) -> Self {
        Self {
            failure: Some(error),
            drafts: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.drafts.lock().unwrap().len()
    }

    pub fn drafts(&self) -> Vec<PullRequestDraft> {
        self.drafts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeHost for FakeHost {
    async fn create_pull_request(&self, draft: &PullRequestDraft) -> Result<String, ClientError> {
        let mut drafts = self.drafts.lock().unwrap();
        drafts.push(draft.clone());
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(format!(
            "https://github.com/{}/pull/{}",
            draft.repo,
            drafts.len()
        ))
    }
}
