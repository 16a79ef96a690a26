//! JSON-file store. Layout under the root directory:
//!
//! ```text
//! definitions/<id>/v<version>.json
//! runs/<run id>/run.json
//! runs/<run id>/nodes/<escaped execution key>.json
//! approvals/<request id>.json
//! ```
//!
//! Every write goes to a temporary file that is then renamed over the target,
//! so a crash never leaves a half-written record behind.

use super::{active_count, ApprovalStore, DefinitionStore, RunStore};
use async_trait::async_trait;
use flowcore::{
    ApprovalRequest, DefinitionId, NodeExecution, RequestId, RunId, RunStatus, StoreError,
    WorkflowDefinition, WorkflowRun,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

pub struct FileStore {
    root: PathBuf,
    /// Serializes read-check-write sequences within this process
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn definition_dir(&self, id: DefinitionId) -> PathBuf {
        self.root.join("definitions").join(id.to_string())
    }

    fn run_dir(&self, id: RunId) -> PathBuf {
        self.root.join("runs").join(id.to_string())
    }

    fn run_path(&self, id: RunId) -> PathBuf {
        self.run_dir(id).join("run.json")
    }

    fn approval_path(&self, id: RequestId) -> PathBuf {
        self.root.join("approvals").join(format!("{}.json", id))
    }

    async fn all_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let mut runs = Vec::new();
        for dir in list_dir(&self.root.join("runs")).await? {
            if let Some(run) = read_json::<WorkflowRun>(&dir.join("run.json")).await? {
                runs.push(run);
            }
        }
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn all_requests(&self) -> Result<Vec<ApprovalRequest>, StoreError> {
        let mut requests = Vec::new();
        for path in list_dir(&self.root.join("approvals")).await? {
            if let Some(request) = read_json::<ApprovalRequest>(&path).await? {
                requests.push(request);
            }
        }
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }
}

#[async_trait]
impl DefinitionStore for FileStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let path = self
            .definition_dir(definition.id)
            .join(format!("v{}.json", definition.version));
        write_json(&path, definition).await
    }

    async fn load_definition(
        &self,
        id: DefinitionId,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        read_json(&self.definition_dir(id).join(format!("v{}.json", version))).await
    }

    async fn latest_definition(&self, id: DefinitionId) -> Result<Option<WorkflowDefinition>, StoreError> {
        let mut latest: Option<WorkflowDefinition> = None;
        for path in list_dir(&self.definition_dir(id)).await? {
            if let Some(definition) = read_json::<WorkflowDefinition>(&path).await? {
                if latest.as_ref().map_or(true, |l| definition.version > l.version) {
                    latest = Some(definition);
                }
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl RunStore for FileStore {
    async fn create_run(&self, run: &WorkflowRun, limit: Option<u32>) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        if let Some(limit) = limit {
            let runs = self.all_runs().await?;
            if active_count(runs.iter(), run.definition_id) >= limit {
                return Ok(false);
            }
        }
        let path = self.run_path(run.id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        write_json(&path, run).await?;
        Ok(true)
    }

    async fn load_run(&self, id: RunId) -> Result<Option<WorkflowRun>, StoreError> {
        read_json(&self.run_path(id)).await
    }

    async fn update_run_if(&self, run: &WorkflowRun, expected: RunStatus) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.run_path(run.id);
        match read_json::<WorkflowRun>(&path).await? {
            Some(stored) if stored.status == expected => {
                write_json(&path, run).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_runs(&self, tenant_id: &str) -> Result<Vec<WorkflowRun>, StoreError> {
        Ok(self
            .all_runs()
            .await?
            .into_iter()
            .filter(|r| r.tenant_id == tenant_id)
            .collect())
    }

    async fn list_active_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        Ok(self
            .all_runs()
            .await?
            .into_iter()
            .filter(|r| r.status.is_active())
            .collect())
    }

    async fn save_node_execution(&self, record: &NodeExecution) -> Result<(), StoreError> {
        let path = self
            .run_dir(record.run_id)
            .join("nodes")
            .join(format!("{}.json", escape_file_name(&record.key())));
        write_json(&path, record).await
    }

    async fn list_node_executions(&self, run_id: RunId) -> Result<Vec<NodeExecution>, StoreError> {
        let mut records = Vec::new();
        for path in list_dir(&self.run_dir(run_id).join("nodes")).await? {
            if let Some(record) = read_json::<NodeExecution>(&path).await? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.started_at.or(r.completed_at));
        Ok(records)
    }
}

#[async_trait]
impl ApprovalStore for FileStore {
    async fn save_request(&self, request: &ApprovalRequest) -> Result<(), StoreError> {
        write_json(&self.approval_path(request.id), request).await
    }

    async fn load_request(&self, id: RequestId) -> Result<Option<ApprovalRequest>, StoreError> {
        read_json(&self.approval_path(id)).await
    }

    async fn find_request(
        &self,
        run_id: RunId,
        node_key: &str,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        Ok(self
            .all_requests()
            .await?
            .into_iter()
            .find(|r| r.run_id == Some(run_id) && r.node_key.as_deref() == Some(node_key)))
    }

    async fn list_requests(&self, tenant_id: &str) -> Result<Vec<ApprovalRequest>, StoreError> {
        Ok(self
            .all_requests()
            .await?
            .into_iter()
            .filter(|r| r.tenant_id == tenant_id)
            .collect())
    }
}

/// Percent-encode everything but `[A-Za-z0-9_.@-]` so any node id maps to
/// exactly one file inside the directory
fn escape_file_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'@' | b'-' => {
                escaped.push(byte as char)
            }
            _ => escaped.push_str(&format!("%{:02X}", byte)),
        }
    }
    escaped
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await.map_err(|e| io_error(&tmp, e))?;
    fs::rename(&tmp, path).await.map_err(|e| io_error(path, e))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}

/// Entries of a directory, sorted; a missing directory is empty
async fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(dir, e)),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(dir, e))? {
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "tmp") {
            continue;
        }
        paths.push(path);
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::escape_file_name;

    #[test]
    fn file_names_never_leave_the_directory() {
        assert_eq!(escape_file_name("work@0.1"), "work@0.1");
        assert_eq!(escape_file_name("a/b"), "a%2Fb");
        assert_eq!(escape_file_name("..\\x"), "..%5Cx");
        assert_eq!(escape_file_name("50%"), "50%25");
        assert_ne!(escape_file_name("a/b"), escape_file_name("a%2Fb"));
    }
}
