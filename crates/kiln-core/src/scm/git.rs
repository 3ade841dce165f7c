//! Git SCM probe.
//!
//! Each project gets a bare mirror repository under the configured root
//! path with a single named remote, created on the first check and replaced
//! only when the configured upstream URL changed. A check pass fetches and
//! decides from the transfer progress whether anything new arrived (the
//! remote's tracking refs carry the last known state between calls, so an
//! unchanged upstream negotiates down to an empty fetch). Only a complete
//! transfer of new objects produces a task; an unreachable remote or an incomplete
//! transfer degrades to "nothing to do" so that one flaky upstream cannot
//! stall the scheduler.

use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{Cred, Direction, ErrorClass, FetchOptions, RemoteCallbacks, Repository};
use serde_json::Value;

use kiln_kernel::config::ConfigError;
use kiln_kernel::json;
use kiln_kernel::scm::{ScmError, ScmProbe};
use kiln_kernel::task::Task;

const REMOTE_NAME: &str = "kiln-upstream";

pub struct GitProbe {
    project: String,
    repo_path: PathBuf,
    upstream_url: String,
    descriptor: Value,
    template: Value,
}

impl GitProbe {
    /// Build a probe from a project's `scm` descriptor.
    pub fn from_config(
        project: &str,
        scm: &Value,
        root_path: &Path,
        template: Value,
    ) -> Result<Self, ConfigError> {
        let upstream_url = json::find_str(scm, "upstream_url")
            .ok_or_else(|| {
                ConfigError::Invalid(format!("project '{project}': scm has no upstream_url"))
            })?
            .to_string();

        Ok(Self {
            project: project.to_string(),
            repo_path: root_path.join(format!("{project}.git")),
            upstream_url,
            descriptor: scm.clone(),
            template,
        })
    }
}

#[async_trait]
impl ScmProbe for GitProbe {
    fn descriptor(&self) -> &Value {
        &self.descriptor
    }

    async fn check(&self) -> Result<Option<Task>, ScmError> {
        let repo_path = self.repo_path.clone();
        let url = self.upstream_url.clone();

        let outcome = tokio::task::spawn_blocking(move || fetch_upstream(&repo_path, &url))
            .await
            .map_err(|e| ScmError::Failure(format!("probe task failed: {e}")))??;

        match outcome {
            FetchOutcome::Unreachable | FetchOutcome::UpToDate | FetchOutcome::Incomplete => {
                Ok(None)
            }
            FetchOutcome::Changed { head, branch } => {
                tracing::info!(project = %self.project, %head, %branch, "upstream needs building");
                let env = HashMap::from([
                    ("ref".to_string(), head),
                    ("branch".to_string(), branch),
                ]);
                Ok(Some(Task::from_template(&self.template, &env)))
            }
        }
    }
}

enum FetchOutcome {
    Unreachable,
    UpToDate,
    Incomplete,
    Changed { head: String, branch: String },
}

fn gitfail(action: &str) -> impl Fn(git2::Error) -> ScmError + '_ {
    move |e| ScmError::Failure(format!("{action}: {} ({:?}/{:?})", e.message(), e.class(), e.code()))
}

fn is_connectivity(e: &git2::Error) -> bool {
    matches!(
        e.class(),
        ErrorClass::Net | ErrorClass::Os | ErrorClass::Http | ErrorClass::Ssh
    )
}

fn credentials(
    _url: &str,
    username_from_url: Option<&str>,
    _allowed: git2::CredentialType,
) -> Result<Cred, git2::Error> {
    Cred::default().or_else(|_| Cred::ssh_key_from_agent(username_from_url.unwrap_or("git")))
}

/// Open or initialize the bare mirror, point the named remote at `url`,
/// fetch, and classify what happened.
fn fetch_upstream(repo_path: &Path, url: &str) -> Result<FetchOutcome, ScmError> {
    let repo = match Repository::open_bare(repo_path) {
        Ok(repo) => repo,
        Err(_) => {
            tracing::info!(path = %repo_path.display(), "initializing repository");
            Repository::init_bare(repo_path).map_err(gitfail("init repository"))?
        }
    };

    // The remote is created once and reused afterwards: deleting it would
    // drop its tracking refs, and without them every fetch re-transfers the
    // full history and looks like new work. It is only replaced when the
    // configured upstream URL changed.
    let reusable = repo
        .find_remote(REMOTE_NAME)
        .ok()
        .is_some_and(|remote| remote.url() == Some(url));
    if !reusable {
        if repo.find_remote(REMOTE_NAME).is_ok() {
            repo.remote_delete(REMOTE_NAME).map_err(gitfail("delete remote"))?;
        }
        repo.remote(REMOTE_NAME, url).map_err(gitfail("create remote"))?;
    }
    let mut remote = repo.find_remote(REMOTE_NAME).map_err(gitfail("load remote"))?;

    // Read the advertised refs first: the first head is HEAD.
    let (head, branch) = {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(credentials);
        // Any connect failure is soft: the next pass simply retries.
        let connection = match remote.connect_auth(Direction::Fetch, Some(callbacks), None) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(%url, error = %e.message(), "upstream unreachable");
                return Ok(FetchOutcome::Unreachable);
            }
        };

        let head = match connection.list().map_err(gitfail("list refs"))?.first() {
            Some(head) => head.oid().to_string(),
            None => {
                tracing::debug!(%url, "upstream is empty");
                return Ok(FetchOutcome::UpToDate);
            }
        };
        let branch = connection
            .default_branch()
            .ok()
            .and_then(|buf| buf.as_str().map(str::to_string))
            .map(|name| name.strip_prefix("refs/heads/").unwrap_or(&name).to_string())
            .unwrap_or_default();
        (head, branch)
    };

    let fetch_percent = Cell::new(-1i64);
    let index_percent = Cell::new(-1i64);

    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(credentials);
    callbacks.sideband_progress(|data| {
        tracing::debug!(remote = %String::from_utf8_lossy(data).trim_end());
        true
    });
    callbacks.transfer_progress(|stats| {
        if stats.total_objects() > 0 {
            let fetched = (100 * stats.received_objects() / stats.total_objects()) as i64;
            let indexed = (100 * stats.indexed_objects() / stats.total_objects()) as i64;
            if fetched != fetch_percent.get() || indexed != index_percent.get() {
                tracing::debug!(
                    network = fetched,
                    indexing = indexed,
                    received = stats.received_objects(),
                    total = stats.total_objects(),
                    kbytes = stats.received_bytes() / 1024,
                    "transfer"
                );
                fetch_percent.set(fetched);
                index_percent.set(indexed);
            }
        }
        true
    });

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);

    if let Err(e) = remote.fetch(&[] as &[&str], Some(&mut options), None) {
        if is_connectivity(&e) {
            tracing::warn!(%url, error = %e.message(), "fetch failed, upstream unreachable");
            return Ok(FetchOutcome::Unreachable);
        }
        return Err(gitfail("fetch")(e));
    }

    let (fetched, indexed) = (fetch_percent.get(), index_percent.get());
    if fetched == -1 && indexed == -1 {
        tracing::debug!(%url, "upstream is up-to-date");
        Ok(FetchOutcome::UpToDate)
    } else if fetched != 100 || indexed != 100 {
        tracing::warn!(%url, network = fetched, indexing = indexed, "download incomplete");
        Ok(FetchOutcome::Incomplete)
    } else {
        Ok(FetchOutcome::Changed { head, branch })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use serde_json::json;

    fn commit_file(repo: &Repository, name: &str, content: &str, message: &str) {
        let workdir = repo.workdir().unwrap();
        std::fs::write(workdir.join(name), content).unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();

        let signature = Signature::now("kiln", "kiln@example.org").unwrap();
        let parent = repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<_> = parent.iter().collect();
        repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
            .unwrap();
    }

    fn probe_for(upstream: &Path, root: &Path) -> GitProbe {
        GitProbe::from_config(
            "demo",
            &json!({"type": "git", "upstream_url": upstream.to_str().unwrap()}),
            root,
            json!({"project": "demo", "checkout": "${ref}", "branch": "${branch}"}),
        )
        .unwrap()
    }

    #[test]
    fn missing_upstream_url_is_rejected() {
        let err = GitProbe::from_config(
            "demo",
            &json!({"type": "git"}),
            Path::new("/tmp"),
            json!({}),
        );
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn first_fetch_produces_a_task_with_resolved_variables() {
        let upstream_dir = tempfile::tempdir().unwrap();
        let root_dir = tempfile::tempdir().unwrap();
        let upstream = Repository::init(upstream_dir.path()).unwrap();
        commit_file(&upstream, "hello.txt", "one", "initial");

        let probe = probe_for(upstream_dir.path(), root_dir.path());
        let task = probe.check().await.unwrap().expect("a task");

        let checkout = task.descriptor()["checkout"].as_str().unwrap();
        assert_eq!(checkout.len(), 40, "expected a full oid, got '{checkout}'");
        assert!(checkout.bytes().all(|b| b.is_ascii_hexdigit()));

        let branch = task.descriptor()["branch"].as_str().unwrap();
        assert!(!branch.is_empty());
        assert!(!branch.contains("${"));
        assert_eq!(task.project_name(), Some("demo"));
    }

    #[tokio::test]
    async fn unchanged_upstream_yields_nothing() {
        let upstream_dir = tempfile::tempdir().unwrap();
        let root_dir = tempfile::tempdir().unwrap();
        let upstream = Repository::init(upstream_dir.path()).unwrap();
        commit_file(&upstream, "hello.txt", "one", "initial");

        let probe = probe_for(upstream_dir.path(), root_dir.path());
        assert!(probe.check().await.unwrap().is_some());
        assert!(probe.check().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn a_new_commit_triggers_another_task() {
        let upstream_dir = tempfile::tempdir().unwrap();
        let root_dir = tempfile::tempdir().unwrap();
        let upstream = Repository::init(upstream_dir.path()).unwrap();
        commit_file(&upstream, "hello.txt", "one", "initial");

        let probe = probe_for(upstream_dir.path(), root_dir.path());
        let first = probe.check().await.unwrap().expect("first task");

        commit_file(&upstream, "hello.txt", "two", "update");
        let second = probe.check().await.unwrap().expect("second task");

        assert_ne!(
            first.descriptor()["checkout"],
            second.descriptor()["checkout"]
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_soft_failure() {
        let root_dir = tempfile::tempdir().unwrap();
        let probe = GitProbe::from_config(
            "demo",
            &json!({"type": "git", "upstream_url": "/nonexistent/upstream.git"}),
            root_dir.path(),
            json!({"project": "demo"}),
        )
        .unwrap();

        assert!(probe.check().await.unwrap().is_none());
    }
}
