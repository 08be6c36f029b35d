use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha_domain::{
    ActiveConnection, AuditEvent, DeviceMapping, EnrollmentId, Export, Enrollment, Job, JobId,
    LogEvent, ProgressRecord, Step, VmContext, VmContextId, VolumeId, VolumeOperation,
    VolumeOperationId,
};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{is_open, StateStore};

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    steps: HashMap<JobId, Vec<Step>>,
    logs: HashMap<JobId, Vec<LogEvent>>,
    volume_ops: HashMap<VolumeOperationId, VolumeOperation>,
    device_mappings: HashMap<VolumeId, DeviceMapping>,
    exports: HashMap<String, Export>,
    enrollments: HashMap<EnrollmentId, Enrollment>,
    active_connections: HashMap<EnrollmentId, ActiveConnection>,
    vm_contexts: HashMap<VmContextId, VmContext>,
    progress: HashMap<JobId, Vec<ProgressRecord>>,
    events: Vec<AuditEvent>,
}

/// In-memory implementation of [`StateStore`].
///
/// All data is lost on process exit. Suitable for tests and the local
/// developer loop; never used in production (see [`PostgresStore`](crate::postgres_store::PostgresStore)).
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.jobs.insert(job.id, job.clone());
        guard.steps.entry(job.id).or_default();
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.jobs.get(id).cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn list_child_jobs(&self, parent: &JobId) -> Result<Vec<Job>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .jobs
            .values()
            .filter(|j| j.parent_job_id.as_ref() == Some(parent))
            .cloned()
            .collect())
    }

    async fn list_open_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.jobs.values().filter(|j| is_open(j.status)).cloned().collect())
    }

    async fn list_jobs(&self, limit: u32) -> Result<Vec<Job>, StoreError> {
        let guard = self.inner.read().await;
        let mut jobs: Vec<Job> = guard.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn create_step(&self, step: &Step) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.steps.entry(step.job_id).or_default().push(step.clone());
        Ok(())
    }

    async fn update_step(&self, step: &Step) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let steps = guard
            .steps
            .get_mut(&step.job_id)
            .ok_or_else(|| StoreError::JobNotFound(step.job_id.to_string()))?;
        if let Some(existing) = steps.iter_mut().find(|s| s.seq == step.seq) {
            *existing = step.clone();
        }
        Ok(())
    }

    async fn list_steps(&self, job_id: &JobId) -> Result<Vec<Step>, StoreError> {
        let guard = self.inner.read().await;
        let mut steps = guard.steps.get(job_id).cloned().unwrap_or_default();
        steps.sort_by_key(|s| s.seq);
        Ok(steps)
    }

    async fn append_log(&self, log: &LogEvent) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if let Some(job_id) = log.job_id {
            guard.logs.entry(job_id).or_default().push(log.clone());
        }
        Ok(())
    }

    async fn list_logs(&self, job_id: &JobId, limit: u32) -> Result<Vec<LogEvent>, StoreError> {
        let guard = self.inner.read().await;
        let logs = guard.logs.get(job_id).cloned().unwrap_or_default();
        let start = logs.len().saturating_sub(limit as usize);
        Ok(logs[start..].to_vec())
    }

    async fn create_volume_operation(&self, op: &VolumeOperation) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.volume_ops.insert(op.id, op.clone());
        Ok(())
    }

    async fn update_volume_operation(&self, op: &VolumeOperation) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.volume_ops.insert(op.id, op.clone());
        Ok(())
    }

    async fn get_volume_operation(&self, id: &VolumeOperationId) -> Result<Option<VolumeOperation>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.volume_ops.get(id).cloned())
    }

    async fn list_volume_operations(&self, volume_id: &VolumeId) -> Result<Vec<VolumeOperation>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .volume_ops
            .values()
            .filter(|op| &op.volume_id == volume_id)
            .cloned()
            .collect())
    }

    async fn upsert_device_mapping(&self, mapping: &DeviceMapping) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.device_mappings.insert(mapping.volume_uuid.clone(), mapping.clone());
        Ok(())
    }

    async fn get_device_mapping(&self, volume_id: &VolumeId) -> Result<Option<DeviceMapping>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.device_mappings.get(volume_id).cloned())
    }

    async fn list_device_mappings(&self) -> Result<Vec<DeviceMapping>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.device_mappings.values().cloned().collect())
    }

    async fn delete_device_mapping(&self, volume_id: &VolumeId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.device_mappings.remove(volume_id);
        Ok(())
    }

    async fn upsert_export(&self, export: &Export) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.exports.insert(export.export_name.clone(), export.clone());
        Ok(())
    }

    async fn get_export(&self, name: &str) -> Result<Option<Export>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.exports.get(name).cloned())
    }

    async fn list_exports(&self) -> Result<Vec<Export>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.exports.values().cloned().collect())
    }

    async fn create_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(())
    }

    async fn update_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(())
    }

    async fn get_enrollment(&self, id: &EnrollmentId) -> Result<Option<Enrollment>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.enrollments.get(id).cloned())
    }

    async fn find_enrollment_by_pairing_code(&self, code: &str) -> Result<Option<Enrollment>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.enrollments.values().find(|e| e.pairing_code == code).cloned())
    }

    async fn upsert_active_connection(&self, conn: &ActiveConnection) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.active_connections.insert(conn.enrollment_id, conn.clone());
        Ok(())
    }

    async fn get_active_connection(&self, enrollment_id: &EnrollmentId) -> Result<Option<ActiveConnection>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.active_connections.get(enrollment_id).cloned())
    }

    async fn list_active_connections(&self) -> Result<Vec<ActiveConnection>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.active_connections.values().cloned().collect())
    }

    async fn upsert_vm_context(&self, context: &VmContext) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.vm_contexts.insert(context.id.clone(), context.clone());
        Ok(())
    }

    async fn get_vm_context(&self, id: &VmContextId) -> Result<Option<VmContext>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.vm_contexts.get(id).cloned())
    }

    async fn list_vm_contexts(&self) -> Result<Vec<VmContext>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.vm_contexts.values().cloned().collect())
    }

    async fn upsert_progress(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let rows = guard.progress.entry(record.job_id).or_default();
        if let Some(existing) = rows.iter_mut().find(|r| r.disk_id == record.disk_id) {
            *existing = record.clone();
        } else {
            rows.push(record.clone());
        }
        Ok(())
    }

    async fn list_progress(&self, job_id: &JobId) -> Result<Vec<ProgressRecord>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.progress.get(job_id).cloned().unwrap_or_default())
    }

    async fn append_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, job_id: Option<&JobId>, limit: u32) -> Result<Vec<AuditEvent>, StoreError> {
        let guard = self.inner.read().await;
        let filtered: Vec<AuditEvent> = guard
            .events
            .iter()
            .filter(|ev| match job_id {
                Some(id) => ev.job_id() == Some(id),
                None => true,
            })
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit as usize);
        Ok(filtered[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha_domain::{JobKind, JobStatus, StepStatus};
    use chrono::Utc;

    fn dummy_job() -> Job {
        Job::new(None, JobKind::Replicate, "replicate vm01", None, serde_json::json!({}), Utc::now())
    }

    #[tokio::test]
    async fn create_and_get_job() {
        let store = InMemoryStore::new();
        let job = dummy_job();
        store.create_job(&job).await.unwrap();

        let got = store.get_job(&job.id).await.unwrap();
        assert_eq!(got.unwrap().id, job.id);
    }

    #[tokio::test]
    async fn list_open_jobs_excludes_terminal() {
        let store = InMemoryStore::new();
        let mut done = dummy_job();
        done.finish(JobStatus::Completed, None, Utc::now());
        let running = dummy_job();

        store.create_job(&done).await.unwrap();
        store.create_job(&running).await.unwrap();

        let open = store.list_open_jobs().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, running.id);
    }

    #[tokio::test]
    async fn steps_sorted_by_seq() {
        let store = InMemoryStore::new();
        let job = dummy_job();
        store.create_job(&job).await.unwrap();

        let now = Utc::now();
        store.create_step(&Step::new(job.id, 2, "second", serde_json::json!({}), now)).await.unwrap();
        store.create_step(&Step::new(job.id, 1, "first", serde_json::json!({}), now)).await.unwrap();

        let steps = store.list_steps(&job.id).await.unwrap();
        assert_eq!(steps.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn job_progress_view_counts_steps() {
        let store = InMemoryStore::new();
        let job = dummy_job();
        store.create_job(&job).await.unwrap();

        let now = Utc::now();
        let mut s1 = Step::new(job.id, 1, "a", serde_json::json!({}), now);
        s1.finish(StepStatus::Completed, None, now);
        let s2 = Step::new(job.id, 2, "b", serde_json::json!({}), now);

        store.create_step(&s1).await.unwrap();
        store.create_step(&s2).await.unwrap();

        let view = store.job_progress_view(&job.id).await.unwrap().unwrap();
        assert_eq!(view.total_steps, 2);
        assert_eq!(view.completed_steps, 1);
        assert_eq!(view.step_completion_percent, 50);
    }
}
