use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::Store;

/// Per-job log sink. Every line goes to the store as it arrives so a running
/// job can be tailed, and is kept in memory for the job's final outcome.
#[derive(Clone)]
pub struct JobLog {
    job_id: Uuid,
    store: Arc<dyn Store>,
    lines: Arc<Mutex<Vec<String>>>,
}

impl JobLog {
    pub fn new(job_id: Uuid, store: Arc<dyn Store>) -> Self {
        Self {
            job_id,
            store,
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        if let Err(err) = self.store.append_job_log(self.job_id, &line).await {
            tracing::warn!(job_id = %self.job_id, %err, "failed to persist job log line");
        }
        self.lines.lock().await.push(line);
    }

    pub async fn lines(&self) -> Vec<String> {
        self.lines.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    #[tokio::test]
    async fn lines_are_persisted_as_they_are_emitted() {
        let store = Arc::new(MemoryStore::new());
        let job_id = Uuid::new_v4();
        let log = JobLog::new(job_id, store.clone());

        log.emit("[stdout] PLAY [all]").await;
        assert_eq!(store.job_logs(job_id).await.unwrap(), vec!["[stdout] PLAY [all]"]);

        log.clone().emit("[stderr] warning").await;
        assert_eq!(store.job_logs(job_id).await.unwrap().len(), 2);
        assert_eq!(log.lines().await.len(), 2);
    }
}
