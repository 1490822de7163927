use crate::engine::FlowEngine;
use flowcore::{FlowError, WorkflowDefinition, WorkflowId};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Directory of workflow definitions, one `<id>.json` document each
///
/// Workflows live in memory once registered; the directory is what lets a
/// restarted host register them again before recovering executions.
pub struct WorkflowLoader {
    dir: PathBuf,
}

impl WorkflowLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Parse a single workflow definition file
    pub async fn read_file(path: impl AsRef<Path>) -> Result<WorkflowDefinition, FlowError> {
        let bytes = fs::read(path.as_ref()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Register every definition in the directory with the engine
    ///
    /// Unreadable or invalid files are skipped. Returns how many workflows
    /// were registered; a missing directory registers none.
    pub async fn load_into(&self, engine: &FlowEngine) -> Result<usize, FlowError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension() == Some("json".as_ref()) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let registered = match Self::read_file(&path).await {
                Ok(workflow) => engine.register_workflow(workflow).await,
                Err(e) => Err(e),
            };
            match registered {
                Ok(id) => {
                    tracing::debug!("Loaded workflow {} from {}", id, path.display());
                    loaded += 1;
                }
                Err(e) => tracing::warn!("Skipping workflow file {}: {}", path.display(), e),
            }
        }

        tracing::info!("Loaded {} workflows from {}", loaded, self.dir.display());
        Ok(loaded)
    }

    /// Write a definition to `<dir>/<id>.json`, replacing any previous version
    pub async fn save(&self, workflow: &WorkflowDefinition) -> Result<PathBuf, FlowError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{}.json", workflow.id));
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(workflow)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    /// Delete the saved definition of a workflow, if there is one
    pub async fn remove(&self, id: WorkflowId) -> Result<(), FlowError> {
        match fs::remove_file(self.dir.join(format!("{}.json", id))).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
