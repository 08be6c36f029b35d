#[cfg(test)]
mod tests {
    use crate::types::*;
    use chrono::Utc;

    #[test]
    fn job_finish_is_one_way() {
        let now = Utc::now();
        let mut job = Job::new(None, JobKind::Replicate, "replicate vm01".into(), None, serde_json::json!({}), now);
        assert_eq!(job.status, JobStatus::Running);

        assert!(job.finish(JobStatus::Completed, None, now));
        assert_eq!(job.status, JobStatus::Completed);

        // second finish is a no-op
        assert!(!job.finish(JobStatus::Failed, Some("late".into()), now));
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
    }

    #[test]
    fn cancel_sets_cancelled_at() {
        let now = Utc::now();
        let mut job = Job::new(None, JobKind::Backup, "backup vm02".into(), None, serde_json::json!({}), now);
        assert!(job.cancel(now));
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.cancelled_at, Some(now));
    }

    #[test]
    fn step_finish_is_one_way() {
        let now = Utc::now();
        let job_id = JobId::new();
        let mut step = Step::new(job_id, 1, "attach-volume", serde_json::json!({}), now);
        assert!(step.finish(StepStatus::Completed, None, now));
        assert!(!step.finish(StepStatus::Failed, None, now));
        assert_eq!(step.status, StepStatus::Completed);
    }

    #[test]
    fn job_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn progress_status_terminality() {
        assert!(!ProgressStatus::InProgress.is_terminal());
        assert!(ProgressStatus::Completed.is_terminal());
        assert!(ProgressStatus::Failed.is_terminal());
    }
}
