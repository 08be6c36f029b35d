use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::Sha1;
use hmac::{Hmac, Mac};
use serde_json::Value;
use tracing::warn;

use crate::error::VolumeError;

type HmacSha1 = Hmac<Sha1>;

/// CloudStack zone, as returned by `listZones`.
#[derive(Debug, Clone)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

/// CloudStack disk offering, as returned by `listDiskOfferings`.
#[derive(Debug, Clone)]
pub struct Offering {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub size_bytes: u64,
    pub offering_id: String,
    pub zone_id: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamVolume {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub state: String,
    pub attached_vm_id: Option<String>,
}

/// The Volume Daemon's sole view of CloudStack — no HTTP detail leaks past
/// this trait. A production implementation signs requests per the
/// CloudStack API contract (HMAC-SHA1 over the sorted, lowercased query
/// string) and retries transient failures with the orchestrator's shared
/// backoff policy; the in-memory implementation below never performs I/O.
#[async_trait]
pub trait UpstreamClient: Send + Sync + 'static {
    async fn list_volumes(&self) -> Result<Vec<UpstreamVolume>, VolumeError>;
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<UpstreamVolume, VolumeError>;
    async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> Result<(), VolumeError>;
    async fn detach_volume(&self, volume_id: &str) -> Result<(), VolumeError>;
    async fn delete_volume(&self, volume_id: &str) -> Result<(), VolumeError>;
    async fn list_zones(&self) -> Result<Vec<Zone>, VolumeError>;
    async fn list_offerings(&self) -> Result<Vec<Offering>, VolumeError>;
    async fn reconfigure_vm(&self, vm_id: &str, offering_id: &str) -> Result<(), VolumeError>;
}

/// Signs a CloudStack API query string: sort params, lowercase, join with
/// `&`, HMAC-SHA1 with the API secret key, base64-encode.
pub fn sign_request(params: &HashMap<String, String>, secret_key: &str) -> String {
    let mut sorted: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let query = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
        .to_lowercase();

    use base64::Engine as _;
    let mut mac = HmacSha1::new_from_slice(secret_key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(query.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

const ASYNC_JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ASYNC_JOB_MAX_POLLS: u32 = 60;

/// Signed HTTP client over the CloudStack API. `create_volume`/`attach_volume`/
/// `detach_volume`/`delete_volume` dispatch async jobs and poll
/// `queryAsyncJobResult` to completion; the rest are synchronous list calls.
pub struct CloudStackUpstreamClient {
    api_url: String,
    api_key: String,
    secret_key: String,
    zone_id: String,
    http: reqwest::Client,
}

impl CloudStackUpstreamClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, secret_key: impl Into<String>, zone_id: impl Into<String>) -> Self {
        CloudStackUpstreamClient {
            api_url: api_url.into(),
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            zone_id: zone_id.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Issues one signed API call and returns the `<command>response` object.
    async fn call(&self, command: &str, params: &[(&str, &str)]) -> Result<Value, VolumeError> {
        let mut all: HashMap<String, String> = params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        all.insert("command".to_string(), command.to_string());
        all.insert("apikey".to_string(), self.api_key.clone());
        all.insert("response".to_string(), "json".to_string());

        let signature = sign_request(&all, &self.secret_key);
        let mut query: Vec<(String, String)> = all.into_iter().collect();
        query.push(("signature".to_string(), signature));

        let resp = self
            .http
            .get(&self.api_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| VolumeError::UpstreamCloudStackTransient(format!("{command}: {e}")))?;

        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(VolumeError::UpstreamCloudStackTransient(format!("{command}: HTTP {status}")));
        }
        if status.is_client_error() {
            return Err(VolumeError::UpstreamCloudStackError(format!("{command}: HTTP {status}")));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| VolumeError::UpstreamCloudStackError(format!("{command}: malformed response: {e}")))?;

        let key = format!("{}response", command.to_lowercase());
        body.get(&key)
            .cloned()
            .ok_or_else(|| VolumeError::UpstreamCloudStackError(format!("{command}: missing '{key}' in response")))
    }

    /// Dispatches an async command and polls `queryAsyncJobResult` until the
    /// job leaves the pending state, returning the job's `jobresult`.
    async fn call_async(&self, command: &str, params: &[(&str, &str)]) -> Result<Value, VolumeError> {
        let accepted = self.call(command, params).await?;
        let job_id = accepted
            .get("jobid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| VolumeError::UpstreamCloudStackError(format!("{command}: no jobid returned")))?
            .to_string();

        for attempt in 0..ASYNC_JOB_MAX_POLLS {
            let result = self.call("queryAsyncJobResult", &[("jobid", &job_id)]).await?;
            let status = result.get("jobstatus").and_then(|v| v.as_i64()).unwrap_or(0);
            match status {
                0 => {
                    tokio::time::sleep(ASYNC_JOB_POLL_INTERVAL).await;
                    continue;
                }
                1 => return Ok(result.get("jobresult").cloned().unwrap_or(Value::Null)),
                _ => {
                    let message = result
                        .get("jobresult")
                        .and_then(|r| r.get("errortext"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("async job failed")
                        .to_string();
                    return Err(VolumeError::UpstreamCloudStackError(message));
                }
            }
        }
        warn!(command, job_id, attempt = ASYNC_JOB_MAX_POLLS, "async job did not complete within the poll budget");
        Err(VolumeError::UpstreamCloudStackTransient(format!("{command}: job {job_id} timed out")))
    }

    fn parse_volume(v: &Value) -> UpstreamVolume {
        UpstreamVolume {
            id: v.get("id").and_then(|x| x.as_str()).unwrap_or_default().to_string(),
            name: v.get("name").and_then(|x| x.as_str()).unwrap_or_default().to_string(),
            size_bytes: v.get("size").and_then(|x| x.as_u64()).unwrap_or(0),
            state: v.get("state").and_then(|x| x.as_str()).unwrap_or_default().to_string(),
            attached_vm_id: v.get("virtualmachineid").and_then(|x| x.as_str()).map(|s| s.to_string()),
        }
    }
}

#[async_trait]
impl UpstreamClient for CloudStackUpstreamClient {
    async fn list_volumes(&self) -> Result<Vec<UpstreamVolume>, VolumeError> {
        let resp = self.call("listVolumes", &[("zoneid", &self.zone_id)]).await?;
        Ok(resp.get("volume").and_then(|v| v.as_array()).map(|a| a.iter().map(Self::parse_volume).collect()).unwrap_or_default())
    }

    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<UpstreamVolume, VolumeError> {
        let size_gb = (req.size_bytes.max(1) as f64 / (1024.0 * 1024.0 * 1024.0)).ceil().to_string();
        let result = self
            .call_async(
                "createVolume",
                &[
                    ("name", &req.name),
                    ("diskofferingid", &req.offering_id),
                    ("zoneid", &req.zone_id),
                    ("size", &size_gb),
                ],
            )
            .await?;
        let volume = result.get("volume").unwrap_or(&result);
        Ok(Self::parse_volume(volume))
    }

    async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> Result<(), VolumeError> {
        self.call_async("attachVolume", &[("id", volume_id), ("virtualmachineid", vm_id)]).await?;
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<(), VolumeError> {
        self.call_async("detachVolume", &[("id", volume_id)]).await?;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), VolumeError> {
        self.call_async("deleteVolume", &[("id", volume_id)]).await?;
        Ok(())
    }

    async fn list_zones(&self) -> Result<Vec<Zone>, VolumeError> {
        let resp = self.call("listZones", &[]).await?;
        Ok(resp
            .get("zone")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .map(|z| Zone {
                        id: z.get("id").and_then(|x| x.as_str()).unwrap_or_default().to_string(),
                        name: z.get("name").and_then(|x| x.as_str()).unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_offerings(&self) -> Result<Vec<Offering>, VolumeError> {
        let resp = self.call("listDiskOfferings", &[]).await?;
        Ok(resp
            .get("diskoffering")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .map(|o| Offering {
                        id: o.get("id").and_then(|x| x.as_str()).unwrap_or_default().to_string(),
                        name: o.get("name").and_then(|x| x.as_str()).unwrap_or_default().to_string(),
                        size_bytes: o.get("disksize").and_then(|x| x.as_u64()).unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn reconfigure_vm(&self, vm_id: &str, offering_id: &str) -> Result<(), VolumeError> {
        self.call_async("scaleVirtualMachine", &[("id", vm_id), ("serviceofferingid", offering_id)]).await?;
        Ok(())
    }
}

/// In-memory `UpstreamClient` used by every test in this crate and by the
/// local developer loop. Never performs I/O; tests can inject synthetic
/// failures and orphaned volumes via `fail_next`/`seed_orphan`.
#[derive(Default)]
pub struct InMemoryUpstreamClient {
    state: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    volumes: HashMap<String, UpstreamVolume>,
    next_id: u64,
    fail_next_create: Option<String>,
}

impl InMemoryUpstreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects a volume that exists upstream but was never created through
    /// this client — simulates an orphan left by a crashed prior run.
    pub fn seed_orphan(&self, volume: UpstreamVolume) {
        let mut state = self.state.lock().unwrap();
        state.volumes.insert(volume.id.clone(), volume);
    }

    /// The next `create_volume` call fails with the given message.
    pub fn fail_next_create(&self, message: impl Into<String>) {
        self.state.lock().unwrap().fail_next_create = Some(message.into());
    }
}

#[async_trait]
impl UpstreamClient for InMemoryUpstreamClient {
    async fn list_volumes(&self) -> Result<Vec<UpstreamVolume>, VolumeError> {
        Ok(self.state.lock().unwrap().volumes.values().cloned().collect())
    }

    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<UpstreamVolume, VolumeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_next_create.take() {
            return Err(VolumeError::UpstreamCloudStackTransient(message));
        }
        state.next_id += 1;
        let volume = UpstreamVolume {
            id: format!("vol-{}", state.next_id),
            name: req.name,
            size_bytes: req.size_bytes,
            state: "Allocated".into(),
            attached_vm_id: None,
        };
        state.volumes.insert(volume.id.clone(), volume.clone());
        Ok(volume)
    }

    async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> Result<(), VolumeError> {
        let mut state = self.state.lock().unwrap();
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| VolumeError::VolumeNotFound(volume_id.to_string()))?;
        if volume.attached_vm_id.is_some() {
            return Err(VolumeError::AttachConflict(volume_id.to_string()));
        }
        volume.attached_vm_id = Some(vm_id.to_string());
        volume.state = "Ready".into();
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<(), VolumeError> {
        let mut state = self.state.lock().unwrap();
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| VolumeError::VolumeNotFound(volume_id.to_string()))?;
        volume.attached_vm_id = None;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), VolumeError> {
        let mut state = self.state.lock().unwrap();
        state
            .volumes
            .remove(volume_id)
            .ok_or_else(|| VolumeError::VolumeNotFound(volume_id.to_string()))?;
        Ok(())
    }

    async fn list_zones(&self) -> Result<Vec<Zone>, VolumeError> {
        Ok(vec![Zone { id: "zone-1".into(), name: "local-zone".into() }])
    }

    async fn list_offerings(&self) -> Result<Vec<Offering>, VolumeError> {
        Ok(vec![Offering { id: "offering-1".into(), name: "default".into(), size_bytes: 0 }])
    }

    async fn reconfigure_vm(&self, _vm_id: &str, _offering_id: &str) -> Result<(), VolumeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_attach() {
        let client = InMemoryUpstreamClient::new();
        let vol = client
            .create_volume(CreateVolumeRequest {
                name: "vm01-disk0".into(),
                size_bytes: 1 << 30,
                offering_id: "offering-1".into(),
                zone_id: "zone-1".into(),
            })
            .await
            .unwrap();

        client.attach_volume(&vol.id, "vm-123").await.unwrap();
        let err = client.attach_volume(&vol.id, "vm-456").await.unwrap_err();
        assert!(matches!(err, VolumeError::AttachConflict(_)));
    }

    #[test]
    fn sign_request_is_order_independent() {
        let mut a = HashMap::new();
        a.insert("command".to_string(), "listVolumes".to_string());
        a.insert("apikey".to_string(), "key123".to_string());

        let mut b = HashMap::new();
        b.insert("apikey".to_string(), "key123".to_string());
        b.insert("command".to_string(), "listVolumes".to_string());

        assert_eq!(sign_request(&a, "secret"), sign_request(&b, "secret"));
    }

    mod cloudstack {
        use super::*;
        use serde_json::json;
        use wiremock::matchers::{method, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn client(server: &MockServer) -> CloudStackUpstreamClient {
            CloudStackUpstreamClient::new(server.uri(), "key123", "secret", "zone-1")
        }

        #[tokio::test]
        async fn list_volumes_parses_response() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(query_param("command", "listVolumes"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "listvolumesresponse": {
                        "volume": [
                            { "id": "vol-1", "name": "vm01-disk0", "size": 10737418240u64, "state": "Ready", "virtualmachineid": "vm-1" }
                        ]
                    }
                })))
                .mount(&server)
                .await;

            let volumes = client(&server).list_volumes().await.unwrap();
            assert_eq!(volumes.len(), 1);
            assert_eq!(volumes[0].id, "vol-1");
            assert_eq!(volumes[0].attached_vm_id.as_deref(), Some("vm-1"));
        }

        #[tokio::test]
        async fn create_volume_polls_async_job_to_completion() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(query_param("command", "createVolume"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "createvolumeresponse": { "jobid": "job-1" }
                })))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(query_param("command", "queryAsyncJobResult"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "queryasyncjobresultresponse": {
                        "jobstatus": 1,
                        "jobresult": { "volume": { "id": "vol-2", "name": "vm01-disk1", "size": 5368709120u64, "state": "Allocated" } }
                    }
                })))
                .mount(&server)
                .await;

            let volume = client(&server)
                .create_volume(CreateVolumeRequest {
                    name: "vm01-disk1".into(),
                    size_bytes: 5 * 1024 * 1024 * 1024,
                    offering_id: "offering-1".into(),
                    zone_id: "zone-1".into(),
                })
                .await
                .unwrap();
            assert_eq!(volume.id, "vol-2");
        }

        #[tokio::test]
        async fn async_job_failure_surfaces_errortext() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(query_param("command", "attachVolume"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "attachvolumeresponse": { "jobid": "job-2" }
                })))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(query_param("command", "queryAsyncJobResult"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "queryasyncjobresultresponse": {
                        "jobstatus": 2,
                        "jobresult": { "errortext": "volume already attached" }
                    }
                })))
                .mount(&server)
                .await;

            let err = client(&server).attach_volume("vol-1", "vm-1").await.unwrap_err();
            assert!(matches!(err, VolumeError::UpstreamCloudStackError(msg) if msg == "volume already attached"));
        }

        #[tokio::test]
        async fn server_error_classified_as_transient() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(query_param("command", "listZones"))
                .respond_with(ResponseTemplate::new(503))
                .mount(&server)
                .await;

            let err = client(&server).list_zones().await.unwrap_err();
            assert!(matches!(err, VolumeError::UpstreamCloudStackTransient(_)));
            assert_eq!(err.kind(), sha_domain::ErrorKind::UpstreamTransient);
        }

        #[tokio::test]
        async fn client_error_classified_as_permanent() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(query_param("command", "listDiskOfferings"))
                .respond_with(ResponseTemplate::new(401))
                .mount(&server)
                .await;

            let err = client(&server).list_offerings().await.unwrap_err();
            assert!(matches!(err, VolumeError::UpstreamCloudStackError(_)));
            assert_eq!(err.kind(), sha_domain::ErrorKind::UpstreamPermanent);
        }
    }
}
