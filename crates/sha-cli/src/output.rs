use serde_json::Value;

/// Renders a `JobSummary` (job + steps + progress) as plain text.
pub fn render_job_summary(summary: &Value) -> String {
    let mut out = String::new();
    let job = &summary["job"];
    out.push_str(&format!(
        "Job:       {}\n",
        job.get("id").and_then(|v| v.as_str()).unwrap_or("-")
    ));
    out.push_str(&format!(
        "Kind:      {}   Status: {}\n",
        job.get("kind").and_then(|v| v.as_str()).unwrap_or("-"),
        job.get("status").and_then(|v| v.as_str()).unwrap_or("-"),
    ));
    out.push_str(&format!(
        "Operation: {}\n",
        job.get("operation").and_then(|v| v.as_str()).unwrap_or("-")
    ));
    if let Some(err) = job.get("error").and_then(|v| v.as_str()) {
        out.push_str(&format!("Error:     {}\n", err));
    }

    let progress = &summary["progress"];
    out.push_str(&format!(
        "Steps:     {}/{} completed, {} running, {} failed, {} skipped\n",
        progress.get("completed_steps").and_then(|v| v.as_u64()).unwrap_or(0),
        progress.get("total_steps").and_then(|v| v.as_u64()).unwrap_or(0),
        progress.get("running_steps").and_then(|v| v.as_u64()).unwrap_or(0),
        progress.get("failed_steps").and_then(|v| v.as_u64()).unwrap_or(0),
        progress.get("skipped_steps").and_then(|v| v.as_u64()).unwrap_or(0),
    ));

    if let Some(steps) = summary.get("steps").and_then(|v| v.as_array()) {
        out.push('\n');
        out.push_str(&format!("{:<4} {:<28} {:<10} {}\n", "SEQ", "NAME", "STATUS", "ERROR"));
        for step in steps {
            out.push_str(&format!(
                "{:<4} {:<28} {:<10} {}\n",
                step.get("seq").and_then(|v| v.as_u64()).unwrap_or(0),
                step.get("name").and_then(|v| v.as_str()).unwrap_or("-"),
                step.get("status").and_then(|v| v.as_str()).unwrap_or("-"),
                step.get("error").and_then(|v| v.as_str()).unwrap_or(""),
            ));
        }
    }
    out
}

/// Renders the aggregated `/jobs/{id}/progress` response.
pub fn render_progress(progress: &Value) -> String {
    let mut out = String::new();
    let bytes = progress.get("bytes_transferred").and_then(|v| v.as_u64()).unwrap_or(0);
    let total = progress.get("total_bytes").and_then(|v| v.as_u64());
    let percent = progress.get("percent").and_then(|v| v.as_u64());

    match (total, percent) {
        (Some(total), Some(pct)) => out.push_str(&format!("{bytes}/{total} bytes ({pct}%)\n")),
        _ => out.push_str(&format!("{bytes} bytes transferred\n")),
    }

    if let Some(disks) = progress.get("disks").and_then(|v| v.as_array()) {
        for disk in disks {
            out.push_str(&format!(
                "  disk {}: {} bytes, status {}\n",
                disk.get("disk_id").and_then(|v| v.as_str()).unwrap_or("-"),
                disk.get("bytes_transferred").and_then(|v| v.as_u64()).unwrap_or(0),
                disk.get("status").and_then(|v| v.as_str()).unwrap_or("-"),
            ));
        }
    }
    out
}

/// Renders the `/vm-contexts` list.
pub fn render_vm_contexts(contexts: &Value) -> String {
    let contexts = contexts.as_array().cloned().unwrap_or_default();
    if contexts.is_empty() {
        return "No VM contexts.\n".to_string();
    }
    let mut out = String::new();
    out.push_str(&format!("{:<38} {:<14} {:<12} {}\n", "VM CONTEXT", "LAST KIND", "LAST STATUS", "LAST ACTIVITY"));
    out.push_str(&"-".repeat(90));
    out.push('\n');
    for c in &contexts {
        out.push_str(&format!(
            "{:<38} {:<14} {:<12} {}\n",
            c.get("vm_context_id").and_then(|v| v.as_str()).unwrap_or("-"),
            c.get("last_job_kind").and_then(|v| v.as_str()).unwrap_or("-"),
            c.get("last_job_status").and_then(|v| v.as_str()).unwrap_or("-"),
            c.get("last_activity").and_then(|v| v.as_str()).unwrap_or("-"),
        ));
    }
    out
}

/// Renders the `/vm-contexts/{id}/recent-jobs` list.
pub fn render_recent_jobs(jobs: &Value) -> String {
    let jobs = jobs.as_array().cloned().unwrap_or_default();
    if jobs.is_empty() {
        return "No jobs for this VM context.\n".to_string();
    }
    let mut out = String::new();
    out.push_str(&format!("{:<38} {:<14} {:<12} {}\n", "JOB", "KIND", "STATUS", "STARTED"));
    out.push_str(&"-".repeat(90));
    out.push('\n');
    for j in &jobs {
        out.push_str(&format!(
            "{:<38} {:<14} {:<12} {}\n",
            j.get("id").and_then(|v| v.as_str()).unwrap_or("-"),
            j.get("kind").and_then(|v| v.as_str()).unwrap_or("-"),
            j.get("status").and_then(|v| v.as_str()).unwrap_or("-"),
            j.get("started_at").and_then(|v| v.as_str()).unwrap_or("-"),
        ));
    }
    out
}
