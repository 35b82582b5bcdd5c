//! Repository access used to read included configuration.
//!
//! The version-control layer is a black box to the compiler: it hands out
//! file contents at a ref, lists a ref's tree, and answers access checks.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{Error, Result};

/// Read access to repositories, the template catalogue and job artifacts.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Read a file at `git_ref` in `project`.
    async fn read_file(&self, project: &str, git_ref: &str, path: &str) -> Result<String>;

    /// List every file path in the tree of `project` at `git_ref`.
    async fn list_files(&self, project: &str, git_ref: &str) -> Result<Vec<String>>;

    /// Whether the current requester may read `project`.
    async fn can_read(&self, project: &str) -> bool;

    /// Read a shared template from the template catalogue.
    async fn read_template(&self, name: &str) -> Result<String>;

    /// Read a file produced as an artifact of `job` in the parent pipeline.
    async fn read_artifact(&self, job: &str, path: &str) -> Result<String> {
        Err(Error::NotFound(format!(
            "artifact '{}' of job '{}' is not available",
            path, job
        )))
    }
}

/// Normalize a repository path: strip the leading slash.
pub fn normalize_path(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// In-memory repository, used for embedding and tests.
#[derive(Default)]
pub struct MemoryRepository {
    files: HashMap<(String, String), BTreeMap<String, String>>,
    templates: HashMap<String, String>,
    artifacts: HashMap<(String, String), String>,
    denied: HashSet<String>,
    reads: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file to `project` at `git_ref`.
    pub fn with_file(
        mut self,
        project: impl Into<String>,
        git_ref: impl Into<String>,
        path: &str,
        content: impl Into<String>,
    ) -> Self {
        self.files
            .entry((project.into(), git_ref.into()))
            .or_default()
            .insert(normalize_path(path).to_string(), content.into());
        self
    }

    pub fn with_template(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.templates.insert(name.into(), content.into());
        self
    }

    pub fn with_artifact(
        mut self,
        job: impl Into<String>,
        path: &str,
        content: impl Into<String>,
    ) -> Self {
        self.artifacts.insert(
            (job.into(), normalize_path(path).to_string()),
            content.into(),
        );
        self
    }

    /// Deny read access to `project`.
    pub fn deny(mut self, project: impl Into<String>) -> Self {
        self.denied.insert(project.into());
        self
    }

    /// Number of successful reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn read_file(&self, project: &str, git_ref: &str, path: &str) -> Result<String> {
        let content = self
            .files
            .get(&(project.to_string(), git_ref.to_string()))
            .and_then(|tree| tree.get(normalize_path(path)))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}@{}:{}", project, git_ref, path)))?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(content)
    }

    async fn list_files(&self, project: &str, git_ref: &str) -> Result<Vec<String>> {
        Ok(self
            .files
            .get(&(project.to_string(), git_ref.to_string()))
            .map(|tree| tree.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn can_read(&self, project: &str) -> bool {
        !self.denied.contains(project)
    }

    async fn read_template(&self, name: &str) -> Result<String> {
        let content = self
            .templates
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("template {}", name)))?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(content)
    }

    async fn read_artifact(&self, job: &str, path: &str) -> Result<String> {
        self.artifacts
            .get(&(job.to_string(), normalize_path(path).to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("artifact '{}' of job '{}'", path, job))
            })
    }
}

/// Repository backed by a checked-out working tree.
///
/// Only the checkout's own project is readable; the ref is ignored since the
/// working tree is a single ref. Templates are read from `template_dir`.
pub struct FsRepository {
    project: String,
    root: PathBuf,
    template_dir: Option<PathBuf>,
}

impl FsRepository {
    pub fn new(project: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            root: root.into(),
            template_dir: None,
        }
    }

    pub fn with_template_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.template_dir = Some(dir.into());
        self
    }

    fn check_project(&self, project: &str) -> Result<()> {
        if project == self.project {
            Ok(())
        } else {
            Err(Error::NotFound(format!("project {}", project)))
        }
    }

    fn resolve(base: &Path, path: &str) -> Result<PathBuf> {
        let relative = normalize_path(path);
        if relative.split('/').any(|part| part == "..") {
            return Err(Error::AccessDenied(format!("path escapes the tree: {}", path)));
        }
        Ok(base.join(relative))
    }
}

async fn read_to_string(path: &Path, label: &str) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::NotFound(label.to_string()))
        }
        Err(e) => Err(Error::Internal(format!("{}: {}", label, e))),
    }
}

#[async_trait]
impl Repository for FsRepository {
    async fn read_file(&self, project: &str, _git_ref: &str, path: &str) -> Result<String> {
        self.check_project(project)?;
        let full = Self::resolve(&self.root, path)?;
        read_to_string(&full, path).await
    }

    async fn list_files(&self, project: &str, _git_ref: &str) -> Result<Vec<String>> {
        self.check_project(project)?;

        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| Error::Internal(format!("{}: {}", dir.display(), e)))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?
            {
                let name = entry.file_name().to_string_lossy().to_string();
                // Skip VCS metadata
                if name == ".git" {
                    continue;
                }
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Error::Internal(e.to_string()))?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    files.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        files.sort();
        Ok(files)
    }

    async fn can_read(&self, project: &str) -> bool {
        project == self.project
    }

    async fn read_template(&self, name: &str) -> Result<String> {
        let dir = self
            .template_dir
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("template {}", name)))?;
        let full = Self::resolve(dir, name)?;
        read_to_string(&full, name).await
    }
}
