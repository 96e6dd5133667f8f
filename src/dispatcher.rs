use std::fs;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{ConfigError, DispatchError};
use crate::node::ExecutableNode;
use crate::plug::Plugs;

/// A single dispatch request, as handed to [`Dispatcher::do_dispatch`].
pub struct Dispatch<'a> {
    /// Name the dispatcher was registered under.
    pub name: &'a str,
    /// Context the root nodes are evaluated under.
    pub context: &'a Context,
    /// Root nodes to execute, along with all their requirements.
    pub nodes: &'a [Arc<dyn ExecutableNode>],
}

/// A scheduling strategy, turning root nodes into the ordered or parallel
/// execution of their deduplicated tasks.
///
/// Strategies are registered by name in a [`Registry`](crate::Registry) and
/// invoked through [`Registry::dispatch`](crate::Registry::dispatch), which
/// takes care of the notifications around every dispatch.
pub trait Dispatcher: Send + Sync {
    /// Settings locating the per-job output directory.
    fn job(&self) -> &JobSettings;

    /// Executes the requested nodes, usually by flattening them with
    /// [`unique_tasks`](crate::unique_tasks). A record must never start
    /// before all the records it requires completed successfully.
    fn do_dispatch(&self, request: &Dispatch) -> Result<(), DispatchError>;

    /// Installs this dispatcher's per-node settings. Called for every newly
    /// constructed executable node with the compound named after the
    /// registration name. The slots may already exist when the node is being
    /// restored, existing values have to be kept.
    fn setup_plugs(&self, plugs: &mut Plugs);

    /// Directory for the outputs of the current job under `context`, created
    /// on demand.
    fn job_directory(&self, context: &Context) -> Result<Utf8PathBuf, DispatchError> {
        self.job().directory(context)
    }
}

/// Where a dispatcher stores per-job files. Both fields are templates,
/// expanded with [`Context::substitute`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Root directory shared by all jobs.
    pub directory: String,
    /// Name of the next job.
    pub name: String,
}

impl JobSettings {
    pub fn new(directory: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            name: name.into(),
        }
    }

    /// Resolves `directory/name` under `context` and creates it. Calling this
    /// again with an equivalent context returns the same path.
    pub fn directory(&self, context: &Context) -> Result<Utf8PathBuf, DispatchError> {
        let path = Utf8PathBuf::from(context.substitute(&self.directory))
            .join(context.substitute(&self.name));

        fs::create_dir_all(&path).map_err(|err| DispatchError::JobDirectory(path.clone(), err))?;

        Ok(path)
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            directory: "jobs".to_string(),
            name: "job".to_string(),
        }
    }
}

/// Serializable dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub job: JobSettings,
    /// Run independent records concurrently.
    pub parallel: bool,
}

impl DispatcherConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_job_directory_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let job = JobSettings::new(root.path().to_str().unwrap(), "${shot}/frame.####");
        let context = Context::new().with("shot", "sh010").with_frame(12.0);

        let first = job.directory(&context).unwrap();
        assert!(first.is_dir());
        assert!(first.ends_with("sh010/frame.0012"));

        let again = job
            .directory(&Context::new().with_frame(12.0).with("shot", "sh010"))
            .unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_job_directory_reports_failure() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("taken");
        fs::write(&file, b"").unwrap();

        let job = JobSettings::new(file.to_str().unwrap(), "job");
        let err = job.directory(&Context::new()).unwrap_err();
        assert!(matches!(err, DispatchError::JobDirectory(..)));
    }

    #[test]
    fn test_config_from_json() {
        let config = DispatcherConfig::from_json(
            r#"{ "job": { "directory": "/tmp/jobs", "name": "comp.#" }, "parallel": true }"#,
        )
        .unwrap();

        assert_eq!(config.job, JobSettings::new("/tmp/jobs", "comp.#"));
        assert!(config.parallel);

        let config = DispatcherConfig::from_json("{}").unwrap();
        assert_eq!(config, DispatcherConfig::default());

        assert!(DispatcherConfig::from_json("{ parallel: 1 }").is_err());
    }
}
