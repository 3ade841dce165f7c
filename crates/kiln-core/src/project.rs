//! Projects and the project registry.
//!
//! A project combines a name, the cron spec driving its checks, the SCM
//! probe watching its upstream, and the criteria a runner must satisfy to
//! execute its tasks. Projects live for the lifetime of the scheduler
//! process; the registry is rebuilt only on restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use error_stack::{Report, ResultExt};
use serde_json::Value;

use kiln_kernel::config::{ConfigError, CoreConfig, ProjectConfig};
use kiln_kernel::cron::CronSpec;
use kiln_kernel::scm::{ScmError, ScmProbe};
use kiln_kernel::task::Task;
use kiln_kernel::{KernelError, KernelResult};

use crate::scm::git::GitProbe;

pub struct Project {
    name: String,
    cron: CronSpec,
    probe: Arc<dyn ScmProbe>,
    runner_criteria: Value,
}

impl Project {
    pub fn new(
        name: impl Into<String>,
        cron: CronSpec,
        probe: Arc<dyn ScmProbe>,
        runner_criteria: Value,
    ) -> Self {
        Self {
            name: name.into(),
            cron,
            probe,
            runner_criteria,
        }
    }

    /// Build a project from its configuration entry.
    ///
    /// # Errors
    ///
    /// Fails when the cron spec does not parse or the SCM descriptor names
    /// an unimplemented kind — the caller excludes the project and keeps
    /// loading the others.
    pub fn from_config(config: &ProjectConfig, root_path: &std::path::Path) -> KernelResult<Self> {
        let cron = CronSpec::parse(&config.cron)
            .map_err(KernelError::from)
            .map_err(Report::new)
            .attach_printable_lazy(|| format!("project '{}'", config.name))?;

        match config.scm_kind() {
            Some("git") => {}
            kind => {
                return Err(Report::new(KernelError::from(ConfigError::UnsupportedScm {
                    project: config.name.clone(),
                    kind: kind.unwrap_or("<missing>").to_string(),
                })));
            }
        }

        // Tasks must know their project so the queue can match runner
        // criteria; stamp the name into the action template.
        let mut template = config.run.clone();
        match &mut template {
            Value::Object(map) => {
                map.entry("project".to_string())
                    .or_insert_with(|| Value::String(config.name.clone()));
            }
            _ => tracing::warn!(
                project = %config.name,
                "run template is not an object; its tasks cannot be matched to the project"
            ),
        }

        let probe = GitProbe::from_config(&config.name, &config.scm, root_path, template)
            .map_err(KernelError::from)
            .map_err(Report::new)
            .attach_printable_lazy(|| format!("project '{}'", config.name))?;

        Ok(Self::new(
            &config.name,
            cron,
            Arc::new(probe),
            config.runner.clone(),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The next instant this project wants to be checked, if any.
    pub fn next_check(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let next = self.cron.next_after(now);
        match next {
            Some(t) => tracing::debug!(project = %self.name, next = %t, "next check time"),
            None => tracing::debug!(project = %self.name, "cron spec never fires again"),
        }
        next
    }

    /// Ask the probe whether the upstream moved.
    pub async fn check(&self) -> Result<Option<Task>, ScmError> {
        self.probe.check().await
    }

    pub fn scm_descriptor(&self) -> &Value {
        self.probe.descriptor()
    }

    pub fn runner_criteria(&self) -> &Value {
        &self.runner_criteria
    }

    /// Follow-up work after a task of this project succeeded.
    ///
    /// The hook exists for chained pipelines; nothing produces follow-ups
    /// today, so every task is currently a pipeline of one.
    pub fn next_task(&self, _previous: &Task) -> Option<Task> {
        None
    }
}

/// Map from project name to project, in stable name order.
pub struct ProjectRegistry {
    projects: BTreeMap<String, Project>,
}

impl ProjectRegistry {
    /// Build the registry from configuration.
    ///
    /// Invalid projects are reported and excluded; one misconfigured project
    /// never prevents the others from loading.
    pub fn from_config(config: &CoreConfig) -> Self {
        let mut projects = BTreeMap::new();
        for entry in &config.projects {
            if projects.contains_key(&entry.name) {
                tracing::error!(project = %entry.name, "duplicate project name, entry ignored");
                continue;
            }
            match Project::from_config(entry, &config.core.root_path) {
                Ok(project) => {
                    projects.insert(project.name.clone(), project);
                }
                Err(report) => {
                    tracing::error!(project = %entry.name, error = ?report, "project excluded");
                }
            }
        }
        Self { projects }
    }

    pub fn from_projects(projects: impl IntoIterator<Item = Project>) -> Self {
        Self {
            projects: projects
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Project> {
        self.projects.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// The earliest next-check instant across all projects.
    pub fn next_check(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        self.iter().filter_map(|p| p.next_check(now)).min()
    }
}
