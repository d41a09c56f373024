//! Workflow Definition Store
//!
//! Validates and stores workflow definitions by URI. Storage itself sits
//! behind [`DefinitionBackend`] so that definitions can live in memory or
//! as JSON files under a state directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::model::WorkflowDefinition;
use super::validator::validate_workflow;
use crate::error::{OrderflowError, Result};

/// Raw load/save of definitions by URI.
pub trait DefinitionBackend: Send + Sync {
    fn load(&self, uri: &str) -> Result<Option<WorkflowDefinition>>;
    fn save(&self, workflow: &WorkflowDefinition) -> Result<()>;
    fn remove(&self, uri: &str) -> Result<bool>;
    fn uris(&self) -> Result<Vec<String>>;
}

/// Keeps definitions in a map; nothing survives the process.
#[derive(Default)]
pub struct MemoryBackend {
    definitions: DashMap<String, WorkflowDefinition>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DefinitionBackend for MemoryBackend {
    fn load(&self, uri: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self.definitions.get(uri).map(|d| d.value().clone()))
    }

    fn save(&self, workflow: &WorkflowDefinition) -> Result<()> {
        self.definitions
            .insert(workflow.workflow_uri.clone(), workflow.clone());
        Ok(())
    }

    fn remove(&self, uri: &str) -> Result<bool> {
        Ok(self.definitions.remove(uri).is_some())
    }

    fn uris(&self) -> Result<Vec<String>> {
        let mut uris: Vec<String> = self.definitions.iter().map(|d| d.key().clone()).collect();
        uris.sort();
        Ok(uris)
    }
}

/// Stores each definition as `<dir>/<encoded uri>.json`.
///
/// Writes and removals are serialized; concurrent saves of one URI would
/// otherwise share a temporary file.
pub struct DirectoryBackend {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl DirectoryBackend {
    /// Opens (creating if needed) a definition directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!("Workflow definitions stored in {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, uri: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_file_name(uri)))
    }
}

impl DefinitionBackend for DirectoryBackend {
    fn load(&self, uri: &str) -> Result<Option<WorkflowDefinition>> {
        let path = self.path_for(uri);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let json = serde_json::to_string_pretty(workflow)?;
        let _guard = self.write_lock.lock();
        write_atomically(&self.path_for(&workflow.workflow_uri), &json)
    }

    fn remove(&self, uri: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let path = self.path_for(uri);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }

    fn uris(&self) -> Result<Vec<String>> {
        let mut uris = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(OrderflowError::from)
                .and_then(|c| Ok(serde_json::from_str::<WorkflowDefinition>(&c)?))
            {
                Ok(workflow) => uris.push(workflow.workflow_uri),
                Err(e) => warn!("Skipping unreadable definition {}: {}", path.display(), e),
            }
        }
        uris.sort();
        Ok(uris)
    }
}

/// Encodes a URI into a flat file name. Characters outside
/// `[A-Za-z0-9._-]` become `%XX`, so distinct URIs never collide.
pub(crate) fn encode_file_name(uri: &str) -> String {
    let mut name = String::with_capacity(uri.len());
    for byte in uri.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => name.push(byte as char),
            _ => name.push_str(&format!("%{:02X}", byte)),
        }
    }
    name
}

/// Writes through a temporary file so readers never see a partial document.
pub(crate) fn write_atomically(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Validating front for a [`DefinitionBackend`].
///
/// Definitions handed out are shared snapshots; a later put replaces the
/// stored definition without touching snapshots already in use.
pub struct WorkflowStore {
    backend: Box<dyn DefinitionBackend>,
    cache: DashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowStore {
    pub fn new(backend: Box<dyn DefinitionBackend>) -> Self {
        Self {
            backend,
            cache: DashMap::new(),
        }
    }

    /// A store that keeps definitions in memory.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    /// Validates and stores (or overwrites) a definition.
    pub fn put_workflow(&self, workflow: WorkflowDefinition) -> Result<()> {
        validate_workflow(&workflow)?;
        self.backend.save(&workflow)?;

        let uri = workflow.workflow_uri.clone();
        if self.cache.insert(uri.clone(), Arc::new(workflow)).is_some() {
            info!("Workflow {} updated", uri);
        } else {
            info!("Workflow {} stored", uri);
        }
        Ok(())
    }

    /// Returns a definition, failing with `NotFound` if absent.
    pub fn get_workflow(&self, uri: &str) -> Result<Arc<WorkflowDefinition>> {
        if let Some(workflow) = self.cache.get(uri) {
            return Ok(Arc::clone(workflow.value()));
        }

        let workflow = self
            .backend
            .load(uri)?
            .map(Arc::new)
            .ok_or_else(|| OrderflowError::workflow_not_found(uri))?;

        debug!("Workflow {} loaded from backend", uri);
        self.cache.insert(uri.to_string(), Arc::clone(&workflow));
        Ok(workflow)
    }

    /// URIs of every stored definition, sorted.
    pub fn list_workflows(&self) -> Result<Vec<String>> {
        self.backend.uris()
    }

    /// Removes a definition. Returns false if it did not exist.
    pub fn delete_workflow(&self, uri: &str) -> Result<bool> {
        self.cache.remove(uri);
        let removed = self.backend.remove(uri)?;
        if removed {
            info!("Workflow {} deleted", uri);
        }
        Ok(removed)
    }
}
