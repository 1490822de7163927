use super::{EventLog, ExecutionStore};
use crate::{
    ContextSnapshot, EventQuery, Execution, ExecutionEvent, ExecutionId, StoreError, Transition,
};
use async_trait::async_trait;
use chrono::Utc;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// JSON file store
///
/// Layout under the data directory:
/// - `executions/<id>.json`: one document per execution record
/// - `events/<id>.jsonl`: the event log of one execution, one event per line
///
/// Record writes go through a temporary file and a rename, so a crash never
/// leaves a half-written record behind.
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("executions")).await?;
        fs::create_dir_all(root.join("events")).await?;
        tracing::info!("Opened file store at {}", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: ExecutionId) -> PathBuf {
        self.root.join("executions").join(format!("{}.json", id))
    }

    fn log_path(&self, id: ExecutionId) -> PathBuf {
        self.root.join("events").join(format!("{}.jsonl", id))
    }

    async fn read_record(&self, id: ExecutionId) -> Result<Execution, StoreError> {
        match fs::read(self.record_path(id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::ExecutionNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, execution: &Execution) -> Result<(), StoreError> {
        let path = self.record_path(execution.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(execution)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_log(&self, path: &Path) -> Result<Vec<ExecutionEvent>, StoreError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                // A torn final line from a crash mid-append is skipped
                Err(e) => tracing::warn!("Skipping unreadable event in {}: {}", path.display(), e),
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl ExecutionStore for FileStore {
    async fn create(&self, execution: Execution) -> Result<Execution, StoreError> {
        let _guard = self.write_lock.lock().await;
        if fs::try_exists(self.record_path(execution.id)).await? {
            return Err(StoreError::AlreadyExists(execution.id));
        }
        self.write_record(&execution).await?;
        Ok(execution)
    }

    async fn get(&self, id: ExecutionId) -> Result<Execution, StoreError> {
        self.read_record(id).await
    }

    async fn list(&self) -> Result<Vec<Execution>, StoreError> {
        let mut all = Vec::new();
        let mut entries = fs::read_dir(self.root.join("executions")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            all.push(serde_json::from_slice::<Execution>(&bytes)?);
        }
        all.sort_by_key(|e| e.inserted_at);
        Ok(all)
    }

    async fn transition(&self, id: ExecutionId, transition: Transition) -> Result<Execution, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut execution = self.read_record(id).await?;
        execution.apply(transition, Utc::now())?;
        self.write_record(&execution).await?;
        Ok(execution)
    }

    async fn save_snapshot(&self, id: ExecutionId, snapshot: ContextSnapshot) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut execution = self.read_record(id).await?;
        execution.record_snapshot(snapshot)?;
        self.write_record(&execution).await
    }
}

#[async_trait]
impl EventLog for FileStore {
    async fn append(&self, event: ExecutionEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.log_path(event.execution_id))
            .await?;

        // Start a fresh line after a torn tail so this event stays readable
        if file.metadata().await?.len() > 0 {
            file.seek(SeekFrom::End(-1)).await?;
            if file.read_u8().await? != b'\n' {
                line.insert(0, b'\n');
            }
        }
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<ExecutionEvent>, StoreError> {
        if let Some(id) = query.execution_id {
            return Ok(query.apply(self.read_log(&self.log_path(id)).await?));
        }

        let mut events = Vec::new();
        let mut entries = fs::read_dir(self.root.join("events")).await?;
        while let Some(entry) = entries.next_entry().await? {
            events.extend(self.read_log(&entry.path()).await?);
        }
        Ok(query.apply(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventType, ExecutionStatus, StepSpec, Variables};
    use serde_json::json;
    use uuid::Uuid;

    async fn temp_store() -> FileStore {
        let dir = std::env::temp_dir().join(format!("flowcore-store-{}", Uuid::new_v4()));
        FileStore::open(dir).await.unwrap()
    }

    #[tokio::test]
    async fn test_record_survives_reopen() {
        let store = temp_store().await;
        let mut input = Variables::new();
        input.insert("site".to_string(), json!("example.org"));
        let execution = store
            .create(Execution::new(Uuid::new_v4(), "acct", input))
            .await
            .unwrap();
        store.transition(execution.id, Transition::Start).await.unwrap();

        let reopened = FileStore::open(store.root()).await.unwrap();
        let loaded = reopened.get(execution.id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(loaded.input_data["site"], json!("example.org"));
        assert_eq!(reopened.list().await.unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(store.root());
    }

    #[tokio::test]
    async fn test_snapshot_rejected_after_terminal() {
        let store = temp_store().await;
        let execution = store
            .create(Execution::new(Uuid::new_v4(), "acct", Variables::new()))
            .await
            .unwrap();
        store.transition(execution.id, Transition::Cancel).await.unwrap();

        let snapshot = ContextSnapshot {
            variables: Variables::new(),
            step_cursor: None,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            taken_at: Utc::now(),
        };
        assert!(store.save_snapshot(execution.id, snapshot).await.is_err());

        let _ = std::fs::remove_dir_all(store.root());
    }

    #[tokio::test]
    async fn test_log_appends_in_order() {
        let store = temp_store().await;
        let id = Uuid::new_v4();
        let step = StepSpec::new("A", "debug.log");

        store.append(ExecutionEvent::execution_started(id, Uuid::new_v4(), false)).await.unwrap();
        store.append(ExecutionEvent::step_started(id, &step)).await.unwrap();
        store.append(ExecutionEvent::step_completed(id, &step, &json!({}), 1)).await.unwrap();
        store.append(ExecutionEvent::execution_resumed(Uuid::new_v4())).await.unwrap();

        let events = store.query(&EventQuery::for_execution(id)).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::ExecutionStarted, EventType::StepStarted, EventType::StepCompleted]
        );

        let all = store.query(&EventQuery::new()).await.unwrap();
        assert_eq!(all.len(), 4);

        let _ = std::fs::remove_dir_all(store.root());
    }
    #[tokio::test]
    async fn test_append_after_torn_line() {
        let store = temp_store().await;
        let id = Uuid::new_v4();
        store.append(ExecutionEvent::execution_started(id, Uuid::new_v4(), false)).await.unwrap();

        // A crash mid-append leaves half a line with no newline
        let mut torn = std::fs::OpenOptions::new()
            .append(true)
            .open(store.log_path(id))
            .unwrap();
        std::io::Write::write_all(&mut torn, br#"{"id":"0000"#).unwrap();
        drop(torn);

        store.append(ExecutionEvent::execution_paused(id, Some("A"))).await.unwrap();

        let types: Vec<_> = store
            .query(&EventQuery::for_execution(id))
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec![EventType::ExecutionStarted, EventType::ExecutionPaused]);

        let _ = std::fs::remove_dir_all(store.root());
    }
}
