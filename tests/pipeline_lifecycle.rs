//! End-to-end pipeline runs over real temporary git repositories.
//!
//! Each test builds a bare remote, a workspace clone with a recorded commit,
//! and scripted collaborators, then drives the pipeline to a terminal status
//! and asserts on the hub, the remote, and the persisted artifacts.

use std::path::{Path, PathBuf};
use std::process::Command;

use commitly::approval::ScriptedApproval;
use commitly::chat::{ChatMessage, ChatNotifier};
use commitly::core::config::{Config, DatabaseConfig};
use commitly::core::context::{AgentStatus, RunStatus};
use commitly::core::error::PipelineError;
use commitly::core::lock::PipelineLock;
use commitly::core::paths::CommitlyPaths;
use commitly::db::{PlanMeasure, PlanProbe};
use commitly::io::state::{load_agent_cache, load_run_context};
use commitly::llm::{LlmHandle, ScriptedLlm};
use commitly::pipeline::{Collaborators, Pipeline};

struct TestRepo {
    _temp: tempfile::TempDir,
    pub origin: PathBuf,
    pub workspace: PathBuf,
}

impl TestRepo {
    /// Bare origin + workspace clone with one pushed baseline commit.
    fn new() -> Self {
        // Identity for every repo the run touches, including the hub clone.
        std::env::set_var("GIT_AUTHOR_NAME", "test");
        std::env::set_var("GIT_AUTHOR_EMAIL", "test@example.com");
        std::env::set_var("GIT_COMMITTER_NAME", "test");
        std::env::set_var("GIT_COMMITTER_EMAIL", "test@example.com");

        let temp = tempfile::tempdir().expect("tempdir");
        let origin = temp.path().join("origin.git");
        let workspace = temp.path().join("proj");

        git_in(temp.path(), &["init", "--bare", "-b", "main", "origin.git"]);
        git_in(
            temp.path(),
            &["clone", origin.to_str().expect("utf8"), "proj"],
        );
        // The clone of the empty remote leaves HEAD on the unborn main.
        git_in(&workspace, &["config", "user.name", "test"]);
        git_in(&workspace, &["config", "user.email", "test@example.com"]);

        std::fs::create_dir_all(workspace.join("app")).expect("mkdir app");
        write(&workspace, "README.md", "demo project\n");
        write(&workspace, "main.py", "print('ok')\n");
        git_in(&workspace, &["add", "-A"]);
        git_in(&workspace, &["commit", "-m", "chore: baseline"]);
        git_in(&workspace, &["push", "-u", "origin", "main"]);

        Self {
            _temp: temp,
            origin,
            workspace,
        }
    }

    /// Record a user commit touching `path` (not pushed).
    fn user_commit(&self, path: &str, contents: &str, message: &str) {
        write(&self.workspace, path, contents);
        git_in(&self.workspace, &["add", "-A"]);
        git_in(&self.workspace, &["commit", "-m", message]);
    }

    fn hub_path(&self) -> PathBuf {
        // The pipeline canonicalizes the workspace before deriving the hub
        // location; mirror that so symlinked temp dirs resolve identically.
        self.workspace
            .canonicalize()
            .expect("canonicalize workspace")
            .parent()
            .expect("parent")
            .join(".commitly_hub_proj")
    }

    fn hub_branches(&self) -> Vec<String> {
        let out = git_capture(&self.hub_path(), &["branch", "--format=%(refname:short)"]);
        out.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn hub_current_branch(&self) -> String {
        git_capture(&self.hub_path(), &["rev-parse", "--abbrev-ref", "HEAD"])
            .trim()
            .to_string()
    }

    fn origin_main_sha(&self) -> String {
        git_capture(&self.origin, &["rev-parse", "main"]).trim().to_string()
    }
}

fn git_in(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

fn git_capture(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(out.status.success(), "git {args:?} failed in {}", dir.display());
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir");
    }
    std::fs::write(path, contents).expect("write file");
}

fn git_binary() -> String {
    let out = Command::new("sh")
        .args(["-c", "command -v git"])
        .output()
        .expect("locate git");
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Config whose commands always succeed; the interpreter probe reuses the
/// git binary because it reliably answers `--version`.
fn passing_config() -> Config {
    let mut config = Config::default();
    config.execution.command = "true".to_string();
    config.execution.python_bin = Some(git_binary());
    config.execution.static_checks = Vec::new();
    config.test.command = "true".to_string();
    config
}

fn collaborators(approve: bool) -> Collaborators {
    Collaborators {
        approval: Box::new(ScriptedApproval(approve)),
        llm: None,
        probe: None,
        notifier: None,
    }
}

/// Plan probe scripted by query fragment.
struct FakeProbe {
    plans: Vec<(String, f64, f64)>,
}

impl PlanProbe for FakeProbe {
    fn table_brief(&self, table: &str) -> Result<String, PipelineError> {
        Ok(format!("TABLE {table} (id integer, status text, last_login timestamp)"))
    }

    fn explain(&self, query: &str) -> Result<PlanMeasure, PipelineError> {
        for (fragment, cost, time) in &self.plans {
            if query.contains(fragment.as_str()) {
                return Ok(PlanMeasure {
                    total_cost: *cost,
                    execution_time_ms: *time,
                });
            }
        }
        Err(PipelineError::QueryParseFailed(format!("no plan for {query}")))
    }
}

struct FailingNotifier;

impl ChatNotifier for FailingNotifier {
    fn search(&self, _window_days: u32) -> Result<Vec<ChatMessage>, PipelineError> {
        Err(PipelineError::InternalInvariantViolated(
            "chat platform unreachable".to_string(),
        ))
    }

    fn reply(&self, _thread_id: &str, _text: &str) -> Result<(), PipelineError> {
        Ok(())
    }
}

#[test]
fn happy_path_without_sql_pushes_and_cleans_the_hub() {
    let repo = TestRepo::new();
    repo.user_commit("app/util.py", "def double(x):\n    return x * 2\n", "feat: add double");
    let before_remote = repo.origin_main_sha();

    let pipeline = Pipeline::prepare(
        &repo.workspace,
        passing_config(),
        collaborators(true),
        Some("feat: add double".to_string()),
    )
    .expect("prepare");
    let outcome = pipeline.run().expect("run");

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.exit_code(), 0);

    // The remote advanced and contains the user's change.
    let after_remote = repo.origin_main_sha();
    assert_ne!(before_remote, after_remote);
    let tree = git_capture(&repo.origin, &["ls-tree", "-r", "--name-only", "main"]);
    assert!(tree.contains("app/util.py"));

    // No derivative branch survives a successful run.
    let leftover: Vec<String> = repo
        .hub_branches()
        .into_iter()
        .filter(|b| b.starts_with("commitly/"))
        .collect();
    assert!(leftover.is_empty(), "leftover branches: {leftover:?}");

    // All seven agents succeeded and the run context is persisted.
    let paths = CommitlyPaths::new(&repo.workspace);
    let ctx = load_run_context(&paths).expect("run context");
    assert_eq!(ctx.status, Some(RunStatus::Succeeded));
    for agent in commitly::core::context::AGENT_ORDER {
        let record = ctx.agent_records.get(agent).expect(agent);
        assert_eq!(record.status, AgentStatus::Succeeded, "{agent}");
    }
}

#[test]
fn declined_gate_leaves_hub_for_inspection() {
    let repo = TestRepo::new();
    repo.user_commit("app/util.py", "VALUE = 1\n", "feat: value");
    let before_remote = repo.origin_main_sha();
    let workspace_head_before =
        git_capture(&repo.workspace, &["rev-parse", "HEAD"]).trim().to_string();

    let pipeline = Pipeline::prepare(
        &repo.workspace,
        passing_config(),
        collaborators(false),
        Some("feat: value".to_string()),
    )
    .expect("prepare");
    let outcome = pipeline.run().expect("run");

    assert_eq!(outcome.status, RunStatus::ApprovedNoPush);
    assert_eq!(outcome.exit_code(), 2);

    // No push, no workspace movement, hub parked on the refactor branch
    // with all four derivative branches intact.
    assert_eq!(repo.origin_main_sha(), before_remote);
    let workspace_head_after =
        git_capture(&repo.workspace, &["rev-parse", "HEAD"]).trim().to_string();
    assert_eq!(workspace_head_before, workspace_head_after);

    let ctx = load_run_context(&CommitlyPaths::new(&repo.workspace)).expect("ctx");
    assert!(repo.hub_current_branch().starts_with("commitly/refactor/"));
    let branches = repo.hub_branches();
    for agent in ["clone", "code", "test", "refactor"] {
        let expected = format!("commitly/{agent}/{}", ctx.run_id);
        assert!(branches.contains(&expected), "missing {expected}");
    }

    // Notify and Report still ran.
    let paths = CommitlyPaths::new(&repo.workspace);
    assert!(load_agent_cache(&paths, "notify_agent").is_ok());
    assert!(load_agent_cache(&paths, "report_agent").is_ok());
}

#[test]
fn optimizer_rewrites_query_and_reports_improvement() {
    let repo = TestRepo::new();
    repo.user_commit(
        "app/repo.py",
        "def load_users(conn):\n    return conn.execute(\"SELECT * FROM users WHERE status='active' AND last_login > '2024-01-01'\")\n",
        "feat: user lookup",
    );

    let candidates = r#"["SELECT * FROM users WHERE status='active' AND last_login > '2024-01-01' ORDER BY id", "SELECT * FROM users WHERE last_login > '2024-01-01' AND status='active'", "SELECT id FROM users"]"#;
    let mut collab = collaborators(true);
    collab.llm = Some(Box::new(ScriptedLlm::new(vec![candidates.to_string()])) as Box<dyn LlmHandle>);
    collab.probe = Some(Box::new(FakeProbe {
        plans: vec![
            ("ORDER BY id".to_string(), 40.0, 6.0),
            ("last_login > '2024-01-01' AND status='active'".to_string(), 12.4, 1.2),
            ("SELECT id FROM users".to_string(), 99.0, 9.0),
            // Fallback for the original query (checked last).
            ("SELECT * FROM users".to_string(), 37.8, 4.5),
        ],
    }) as Box<dyn PlanProbe>);

    let mut config = passing_config();
    config.database = Some(DatabaseConfig {
        dbname: "appdb".to_string(),
        user: "app".to_string(),
        ..DatabaseConfig::default()
    });

    let pipeline = Pipeline::prepare(
        &repo.workspace,
        config,
        collab,
        Some("feat: user lookup".to_string()),
    )
    .expect("prepare");
    let outcome = pipeline.run().expect("run");
    assert_eq!(outcome.status, RunStatus::Succeeded);

    // The pushed file carries the chosen query with indentation intact.
    let blob = git_capture(&repo.origin, &["show", "main:app/repo.py"]);
    assert!(
        blob.contains("    return conn.execute(\"SELECT * FROM users WHERE last_login > '2024-01-01' AND status='active'\")"),
        "unexpected file content:\n{blob}"
    );

    let paths = CommitlyPaths::new(&repo.workspace);
    let cache = load_agent_cache(&paths, "test_agent").expect("test cache");
    let sites = cache.data["optimizer"]["sites"].as_array().expect("sites");
    assert_eq!(sites.len(), 1);
    let site = &sites[0];
    assert_eq!(site["outcome"], "rewritten");
    assert_eq!(site["original_cost"], 37.8);
    assert_eq!(site["chosen_cost"], 12.4);
    let rate = site["improvement_rate"].as_f64().expect("rate");
    assert!((rate - 67.2).abs() < 0.2, "rate {rate}");
}

#[test]
fn failing_tests_after_replacement_revert_and_abort() {
    let repo = TestRepo::new();
    repo.user_commit(
        "app/repo.py",
        "def load(conn):\n    return conn.execute(\"SELECT * FROM users\")\n",
        "feat: lookup",
    );

    let candidates = r#"["SELECT /* CHOSEN */ * FROM users", "SELECT * FROM users WHERE 1=1", "SELECT * FROM users LIMIT 100000"]"#;
    let mut collab = collaborators(true);
    collab.llm = Some(Box::new(ScriptedLlm::new(vec![candidates.to_string()])) as Box<dyn LlmHandle>);
    collab.probe = Some(Box::new(FakeProbe {
        plans: vec![
            ("CHOSEN".to_string(), 1.0, 0.1),
            ("WHERE 1=1".to_string(), 50.0, 5.0),
            ("LIMIT 100000".to_string(), 60.0, 6.0),
            ("SELECT * FROM users".to_string(), 37.8, 4.5),
        ],
    }) as Box<dyn PlanProbe>);

    // Tests pass until the marker lands in the file, then fail.
    let mut config = passing_config();
    config.test.command = "sh -c \"! grep -q CHOSEN app/repo.py\"".to_string();
    config.database = Some(DatabaseConfig {
        dbname: "appdb".to_string(),
        ..DatabaseConfig::default()
    });

    let pipeline = Pipeline::prepare(&repo.workspace, config, collab, None).expect("prepare");
    let outcome = pipeline.run().expect("run");

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(outcome.failed_agent.as_deref(), Some("test_agent"));

    // Rollback parked the hub on the code branch, pre-optimization content.
    let ctx = load_run_context(&CommitlyPaths::new(&repo.workspace)).expect("ctx");
    assert_eq!(ctx.status, Some(RunStatus::Failed));
    assert!(repo.hub_current_branch().starts_with("commitly/code/"));
    let hub_file = std::fs::read_to_string(repo.hub_path().join("app/repo.py")).expect("read");
    assert!(hub_file.contains("SELECT * FROM users"));
    assert!(!hub_file.contains("CHOSEN"));

    // The test branch is gone; earlier branches survive.
    let branches = repo.hub_branches();
    assert!(branches.iter().any(|b| b.starts_with("commitly/code/")));
    assert!(!branches.iter().any(|b| b.starts_with("commitly/test/")));

    let error = ctx.error.expect("error record");
    assert_eq!(error.kind, "TestFailed");
}

#[test]
fn nonblocking_notify_failure_keeps_the_run_green() {
    let repo = TestRepo::new();
    repo.user_commit("app/util.py", "X = 1\n", "feat: x");

    let mut config = passing_config();
    config.notify.enabled = true;
    let mut collab = collaborators(true);
    collab.notifier = Some(Box::new(FailingNotifier) as Box<dyn ChatNotifier>);

    let pipeline =
        Pipeline::prepare(&repo.workspace, config, collab, Some("feat: x".to_string()))
            .expect("prepare");
    let outcome = pipeline.run().expect("run");

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.exit_code(), 0);

    let paths = CommitlyPaths::new(&repo.workspace);
    let ctx = load_run_context(&paths).expect("ctx");
    assert_eq!(
        ctx.agent_records.get("notify_agent").expect("notify").status,
        AgentStatus::Failed
    );
    assert_eq!(
        ctx.agent_records.get("report_agent").expect("report").status,
        AgentStatus::Succeeded
    );
}

#[test]
fn second_invocation_fails_fast_while_lock_is_held() {
    let repo = TestRepo::new();
    repo.user_commit("app/util.py", "Y = 2\n", "feat: y");

    let paths = CommitlyPaths::new(&repo.workspace);
    let _held = PipelineLock::acquire(&paths.lock_path).expect("hold lock");

    let pipeline = Pipeline::prepare(
        &repo.workspace,
        passing_config(),
        collaborators(true),
        None,
    )
    .expect("prepare");
    let err = pipeline.run().unwrap_err();
    assert!(matches!(err, PipelineError::LockHeld(_)));
}

#[test]
fn blocking_failure_in_code_agent_rolls_back_to_clone_branch() {
    let repo = TestRepo::new();
    repo.user_commit("app/util.py", "Z = 3\n", "feat: z");

    let mut config = passing_config();
    config.execution.command = "false".to_string();

    let pipeline = Pipeline::prepare(&repo.workspace, config, collaborators(true), None)
        .expect("prepare");
    let outcome = pipeline.run().expect("run");

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.failed_agent.as_deref(), Some("code_agent"));

    // Hub rewound to the clone branch; code branch deleted; later agents
    // never started.
    assert!(repo.hub_current_branch().starts_with("commitly/clone/"));
    let branches = repo.hub_branches();
    assert!(!branches.iter().any(|b| b.starts_with("commitly/code/")));

    let ctx = load_run_context(&CommitlyPaths::new(&repo.workspace)).expect("ctx");
    let error = ctx.error.expect("error");
    assert_eq!(error.kind, "RuntimeFailed");
    assert!(ctx.agent_records.get("test_agent").is_none());

    // The error artifact lands in both log roots.
    let local_logs = repo
        .workspace
        .join(".commitly/logs/code_agent");
    let has_error_log = std::fs::read_dir(&local_logs)
        .expect("log dir")
        .filter_map(Result::ok)
        .any(|entry| entry.file_name().to_string_lossy().starts_with("error_"));
    assert!(has_error_log, "missing local error record");
}

#[test]
fn run_with_no_new_commits_is_a_noop_past_clone() {
    let repo = TestRepo::new();
    // No user commit: workspace is level with origin/main.

    let pipeline = Pipeline::prepare(
        &repo.workspace,
        passing_config(),
        collaborators(true),
        None,
    )
    .expect("prepare");
    let outcome = pipeline.run().expect("run");

    assert_eq!(outcome.status, RunStatus::Succeeded);
    let paths = CommitlyPaths::new(&repo.workspace);
    let clone_cache = load_agent_cache(&paths, "clone_agent").expect("clone cache");
    assert_eq!(clone_cache.data["patch_applied"], false);
    assert_eq!(
        clone_cache.data["changed_files"].as_array().map(Vec::len),
        Some(0)
    );
}
