use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use serde_json::{json, Value};
use sha_enroll::EnrollmentBroker;
use sha_orchestrator::InMemorySnaClient;
use sha_store::{InMemoryStore, PostgresStore, StateStore};
use sha_tracker::{Tracker, DEFAULT_RECOVERY_THRESHOLD_MINUTES};
use sha_volume::{
    CloudStackUpstreamClient, DeviceObserver, ExportPublisher, InMemoryUpstreamClient,
    NullExportServerSignal, SimulatedObserver, SysfsBlockObserver, UpstreamClient, VolumeDaemon,
    DEFAULT_POLL_INTERVAL, DEFAULT_TRANSPORT_PREFIX,
};

use crate::cli::{AdminCommand, BackupCommand, FailoverCommand, FailoverKindArg};
use crate::output;

// ── Bootstrap ─────────────────────────────────────────────────────────────────

pub async fn bootstrap(config: Option<PathBuf>, ephemeral: bool, bind: String, port: u16) -> Result<()> {
    let cfg = sha_config::load(config.as_deref()).context("Failed to load configuration")?;

    let store: Arc<dyn StateStore> = if ephemeral {
        println!("Using in-memory (ephemeral) store — state will be lost on server stop");
        Arc::new(InMemoryStore::new())
    } else {
        match &cfg.store {
            sha_config::StoreLocation::Memory => {
                println!("Using in-memory store (no postgres_url configured)");
                Arc::new(InMemoryStore::new())
            }
            sha_config::StoreLocation::Postgres(url) => {
                println!("Connecting to postgres store…");
                Arc::new(
                    PostgresStore::connect(url)
                        .await
                        .context("Failed to connect to the configured postgres store")?,
                )
            }
        }
    };

    write_token(&default_token_path(), &cfg.control_api_token)
        .context("Failed to persist the control API token for later CLI calls")?;

    // `--ephemeral` implies the local developer loop end to end: no real
    // CloudStack calls, no real kernel device polling.
    let (upstream, observer): (Arc<dyn UpstreamClient>, Arc<dyn DeviceObserver>) = if ephemeral {
        (Arc::new(InMemoryUpstreamClient::default()), Arc::new(SimulatedObserver::default()))
    } else {
        println!("Using CloudStack upstream at {}", cfg.cloudstack.api_url);
        (
            Arc::new(CloudStackUpstreamClient::new(
                cfg.cloudstack.api_url.clone(),
                cfg.cloudstack.api_key.clone(),
                cfg.cloudstack.secret_key.clone(),
                cfg.cloudstack.zone.clone(),
            )),
            Arc::new(SysfsBlockObserver::new(DEFAULT_POLL_INTERVAL, DEFAULT_TRANSPORT_PREFIX)),
        )
    };

    let tracker = Arc::new(Tracker::new(store.clone()));
    let volume_daemon = Arc::new(VolumeDaemon::new(store.clone(), upstream, observer));
    let publisher = Arc::new(ExportPublisher::new(store.clone(), Arc::new(NullExportServerSignal)));
    let sna: Arc<dyn sha_orchestrator::SnaClient> = Arc::new(InMemorySnaClient::default());
    let enroll = Arc::new(EnrollmentBroker::new(store.clone()));

    let app = sha_api::build_app(sha_api::AppState {
        store,
        tracker,
        volume_daemon,
        publisher,
        sna,
        enroll,
        auth_token: Arc::new(cfg.control_api_token.clone()),
    });

    let addr = format!("{bind}:{port}");
    println!("Starting SHA control plane on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

// ── Recover ───────────────────────────────────────────────────────────────────

/// Runs the orphan-job recovery pass directly against the store. Exit codes
/// follow the admin-CLI contract: 0 clean, 2 orphans recovered, 3 nothing to
/// do, >=10 fatal.
pub async fn recover(config: Option<PathBuf>, threshold_minutes: Option<i64>) -> Result<i32> {
    let cfg = match sha_config::load(config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return Ok(10);
        }
    };

    let store: Arc<dyn StateStore> = match &cfg.store {
        sha_config::StoreLocation::Memory => Arc::new(InMemoryStore::new()),
        sha_config::StoreLocation::Postgres(url) => match PostgresStore::connect(url).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                eprintln!("Failed to connect to the configured postgres store: {e}");
                return Ok(11);
            }
        },
    };

    let tracker = Tracker::new(store);
    let threshold = ChronoDuration::minutes(threshold_minutes.unwrap_or(DEFAULT_RECOVERY_THRESHOLD_MINUTES));

    match tracker.recover_stale_jobs(threshold).await {
        Ok(0) => {
            println!("No orphaned jobs found.");
            Ok(3)
        }
        Ok(n) => {
            println!("Recovered {n} orphaned job(s).");
            Ok(2)
        }
        Err(e) => {
            eprintln!("Recovery pass failed: {e}");
            Ok(12)
        }
    }
}

// ── Replicate / backup / failover ────────────────────────────────────────────

/// Parses a `disk_id:size_bytes:offering_id:zone_id[:previous_change_id]` arg
/// into the JSON disk body the Control API expects.
fn parse_disk(raw: &str) -> Result<Value> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() < 4 {
        anyhow::bail!(
            "invalid --disk '{raw}': expected disk_id:size_bytes:offering_id:zone_id[:previous_change_id]"
        );
    }
    let size_bytes: u64 = parts[1].parse().with_context(|| format!("invalid size_bytes in --disk '{raw}'"))?;
    Ok(json!({
        "disk_id": parts[0],
        "size_bytes": size_bytes,
        "offering_id": parts[2],
        "zone_id": parts[3],
        "previous_change_id": parts.get(4),
    }))
}

pub async fn replicate(
    vm_context_id: String,
    source_vm: String,
    hub_vm_id: String,
    disks: Vec<String>,
    incremental: bool,
    owner: Option<String>,
    remote: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let token = resolve_token(token)?;
    let disks: Vec<Value> = disks.iter().map(|d| parse_disk(d)).collect::<Result<_>>()?;
    let body = json!({
        "source_vm": source_vm,
        "vm_context_id": vm_context_id,
        "hub_vm_id": hub_vm_id,
        "replication_type": if incremental { "incremental" } else { "initial" },
        "disks": disks,
        "owner": owner,
    });
    let reply = post(&server_url(remote), "/replicate", &token, &body).await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

pub async fn backup(cmd: BackupCommand, remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);

    match cmd {
        BackupCommand::Start { vm_context_id, source_vm, hub_vm_id, disks, owner } => {
            let disks: Vec<Value> = disks.iter().map(|d| parse_disk(d)).collect::<Result<_>>()?;
            let body = json!({
                "source_vm": source_vm,
                "vm_context_id": vm_context_id,
                "hub_vm_id": hub_vm_id,
                "disks": disks,
                "owner": owner,
            });
            let reply = post(&url, "/backup/start", &token, &body).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        BackupCommand::Restore { vm_context_id, restore_vm_id, volume_ids, owner } => {
            let body = json!({
                "vm_context_id": vm_context_id,
                "restore_vm_id": restore_vm_id,
                "volume_ids": volume_ids,
                "owner": owner,
            });
            let reply = post(&url, "/backup/restore", &token, &body).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        BackupCommand::Mount { vm_context_id, restore_vm_id, volume_ids, ttl_seconds, owner } => {
            let body = json!({
                "vm_context_id": vm_context_id,
                "restore_vm_id": restore_vm_id,
                "volume_ids": volume_ids,
                "ttl_seconds": ttl_seconds,
                "owner": owner,
            });
            let reply = post(&url, "/backup/mount", &token, &body).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        BackupCommand::Unmount { job_id } => {
            let resp = authed_client(&token)
                .delete(format!("{}/backup/mount/{}", url.trim_end_matches('/'), job_id))
                .send()
                .await
                .with_context(|| format!("Failed to reach server at {url}"))?;
            ensure_success(resp).await?;
            println!("Mount {} released.", job_id);
        }
    }
    Ok(())
}

fn failover_kind_str(kind: &FailoverKindArg) -> &'static str {
    match kind {
        FailoverKindArg::Test => "test",
        FailoverKindArg::Live => "live",
    }
}

pub async fn failover(cmd: FailoverCommand, remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);

    match cmd {
        FailoverCommand::Start {
            context_id, hub_vm_id, target_vm_id, kind, volume_ids, source_vm_path, power_off_source, owner,
        } => {
            let body = json!({
                "context_id": context_id,
                "failover_type": failover_kind_str(&kind),
                "hub_vm_id": hub_vm_id,
                "target_vm_id": target_vm_id,
                "volume_ids": volume_ids,
                "source_vm_path": source_vm_path,
                "power_off_source": power_off_source,
                "owner": owner,
            });
            let reply = post(&url, "/failover/unified", &token, &body).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        FailoverCommand::Rollback {
            context_id, hub_vm_id, cutover_vm_id, kind, volume_ids, source_vm_path, power_on_source, owner,
        } => {
            let body = json!({
                "context_id": context_id,
                "failover_type": failover_kind_str(&kind),
                "hub_vm_id": hub_vm_id,
                "cutover_vm_id": cutover_vm_id,
                "volume_ids": volume_ids,
                "source_vm_path": source_vm_path,
                "power_on_source": power_on_source,
                "owner": owner,
            });
            let reply = post(&url, "/failover/rollback", &token, &body).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
    }
    Ok(())
}

// ── Job / VM context / status ────────────────────────────────────────────────

pub async fn job(job_id: String, progress: bool, remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let path = if progress { format!("/jobs/{job_id}/progress") } else { format!("/jobs/{job_id}") };
    let body = get(&url, &path, &token).await?;
    if progress {
        print!("{}", output::render_progress(&body));
    } else {
        print!("{}", output::render_job_summary(&body));
    }
    Ok(())
}

pub async fn vm_contexts(
    vm_context_id: Option<String>,
    limit: u32,
    remote: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    match vm_context_id {
        Some(id) => {
            let body = get(&url, &format!("/vm-contexts/{id}/recent-jobs?limit={limit}"), &token).await?;
            print!("{}", output::render_recent_jobs(&body));
        }
        None => {
            let body = get(&url, "/vm-contexts", &token).await?;
            print!("{}", output::render_vm_contexts(&body));
        }
    }
    Ok(())
}

pub async fn status(remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);
    let body = get(&url, "/status", &token).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

// ── Admin ─────────────────────────────────────────────────────────────────────

pub async fn admin(cmd: AdminCommand, remote: Option<String>, token: Option<String>) -> Result<()> {
    let token = resolve_token(token)?;
    let url = server_url(remote);

    match cmd {
        AdminCommand::PairingCode { valid_for_seconds } => {
            let body = json!({ "valid_for_seconds": valid_for_seconds });
            let reply = post(&url, "/admin/pairing-code", &token, &body).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        AdminCommand::Approve { enrollment_id, approver } => {
            let body = json!({ "enrollment_id": enrollment_id, "approver": approver });
            let reply = post(&url, "/admin/approve", &token, &body).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        AdminCommand::Reject { enrollment_id, approver, reason } => {
            let body = json!({ "enrollment_id": enrollment_id, "approver": approver, "reason": reason });
            post(&url, "/admin/reject", &token, &body).await?;
            println!("Enrollment {} rejected.", enrollment_id);
        }
        AdminCommand::Revoke { enrollment_id, revoked_by } => {
            let body = json!({ "enrollment_id": enrollment_id, "revoked_by": revoked_by });
            post(&url, "/admin/revoke", &token, &body).await?;
            println!("Enrollment {} revoked.", enrollment_id);
        }
    }
    Ok(())
}

// ── HTTP helpers ──────────────────────────────────────────────────────────────

async fn ensure_success(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    if status.is_success() {
        Ok(body)
    } else {
        let msg = body.get("message").and_then(|v| v.as_str()).unwrap_or("unknown error");
        anyhow::bail!("request failed: {status} — {msg}");
    }
}

async fn get(url: &str, path: &str, token: &str) -> Result<Value> {
    let resp = authed_client(token)
        .get(format!("{}{}", url.trim_end_matches('/'), path))
        .send()
        .await
        .with_context(|| format!("Failed to reach server at {url}"))?;
    ensure_success(resp).await
}

async fn post(url: &str, path: &str, token: &str, body: &Value) -> Result<Value> {
    let resp = authed_client(token)
        .post(format!("{}{}", url.trim_end_matches('/'), path))
        .json(body)
        .send()
        .await
        .with_context(|| format!("Failed to reach server at {url}"))?;
    ensure_success(resp).await
}

/// Resolve the token to use for API calls.
///
/// Priority: explicit value (from --token / SHA_TOKEN) → ~/.sha/token file.
fn resolve_token(explicit: Option<String>) -> Result<String> {
    if let Some(t) = explicit {
        return Ok(t);
    }
    let path = default_token_path();
    std::fs::read_to_string(&path).map(|s| s.trim().to_string()).with_context(|| {
        format!(
            "No token provided and could not read token file at {}. \
             Use --token, SHA_TOKEN, or run `shactl bootstrap` first.",
            path.display()
        )
    })
}

fn write_token(path: &PathBuf, token: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    std::fs::write(path, token).with_context(|| format!("Failed to write token to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }
    Ok(())
}

fn default_token_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".sha").join("token")
}

fn authed_client(token: &str) -> reqwest::Client {
    let mut headers = reqwest::header::HeaderMap::new();
    let bearer = format!("Bearer {}", token);
    headers.insert(
        reqwest::header::AUTHORIZATION,
        reqwest::header::HeaderValue::from_str(&bearer).expect("token contains invalid header characters"),
    );
    reqwest::Client::builder().default_headers(headers).build().expect("failed to build HTTP client")
}

fn server_url(remote: Option<String>) -> String {
    remote.unwrap_or_else(|| "http://localhost:8080".into())
}
