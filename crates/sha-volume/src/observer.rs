use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Identity of a block device as seen by the kernel — derived from
/// enumeration name, size, and the transport-controller token extracted
/// from its symlink chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    pub name: String,
    pub device_path: String,
    pub size_bytes: u64,
    pub controller_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    Added,
    Removed,
}

#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub device: DeviceInfo,
}

/// Produces a stream of device add/remove events for local block devices
/// that plausibly correspond to CloudStack-backed virtual disks. Never
/// mutates state — a pure source of truth about the kernel view.
#[async_trait]
pub trait DeviceObserver: Send + Sync + 'static {
    /// The current set of known devices.
    async fn snapshot(&self) -> HashSet<DeviceInfo>;

    /// Blocks until an event satisfying `predicate` arrives, or `timeout` elapses.
    async fn wait_for(
        &self,
        predicate: &(dyn Fn(&DeviceEvent) -> bool + Send + Sync),
        timeout_duration: Duration,
    ) -> Option<DeviceEvent>;
}

/// Software-simulated namespace used on non-Linux platforms and in tests —
/// an identical public contract to a real VirtIO-backed observer, driven
/// entirely by `simulate_attach`/`simulate_detach` calls instead of a real
/// poll of `/sys/block`.
pub struct SimulatedObserver {
    devices: Mutex<HashSet<DeviceInfo>>,
    tx: broadcast::Sender<DeviceEvent>,
}

impl Default for SimulatedObserver {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        SimulatedObserver { devices: Mutex::new(HashSet::new()), tx }
    }
}

impl SimulatedObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the kernel surfacing a new block device — what a real
    /// Observer would report after CloudStack attaches a volume to a VM.
    pub fn simulate_attach(&self, device: DeviceInfo) {
        self.devices.lock().unwrap().insert(device.clone());
        let _ = self.tx.send(DeviceEvent { kind: DeviceEventKind::Added, device });
    }

    /// Simulates the kernel removing a block device on detach.
    pub fn simulate_detach(&self, device: DeviceInfo) {
        self.devices.lock().unwrap().remove(&device);
        let _ = self.tx.send(DeviceEvent { kind: DeviceEventKind::Removed, device });
    }
}

#[async_trait]
impl DeviceObserver for SimulatedObserver {
    async fn snapshot(&self) -> HashSet<DeviceInfo> {
        self.devices.lock().unwrap().clone()
    }

    async fn wait_for(
        &self,
        predicate: &(dyn Fn(&DeviceEvent) -> bool + Send + Sync),
        timeout_duration: Duration,
    ) -> Option<DeviceEvent> {
        let mut rx = self.tx.subscribe();
        let fut = async {
            loop {
                match rx.recv().await {
                    Ok(event) if predicate(&event) => return Some(event),
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
        };
        timeout(timeout_duration, fut).await.unwrap_or(None)
    }
}

/// Default poll interval for `SysfsBlockObserver` (§4.2).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// VirtIO block devices enumerate as `vda`, `vdb`, ... under `/sys/block`.
pub const DEFAULT_TRANSPORT_PREFIX: &str = "vd";

fn read_device(name: &str) -> Option<DeviceInfo> {
    let base = format!("/sys/block/{name}");
    let sectors: u64 = std::fs::read_to_string(format!("{base}/size")).ok()?.trim().parse().ok()?;
    let link = std::fs::read_link(&base).ok()?;
    let controller_token = link
        .to_string_lossy()
        .split('/')
        .find(|segment| segment.starts_with("virtio"))
        .unwrap_or("unknown")
        .to_string();
    Some(DeviceInfo {
        name: name.to_string(),
        device_path: format!("/dev/{name}"),
        size_bytes: sectors * 512,
        controller_token,
    })
}

fn snapshot_sysfs(transport_prefix: &str) -> HashSet<DeviceInfo> {
    let Ok(entries) = std::fs::read_dir("/sys/block") else { return HashSet::new() };
    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.starts_with(transport_prefix).then(|| read_device(&name)).flatten()
        })
        .collect()
}

/// Polls `/sys/block` for VirtIO-backed disks. Two consecutive snapshots
/// are diffed on every tick; since the poll interval is well above the
/// 500 ms debounce window named in the design, an add immediately followed
/// by a remove (or vice versa) is naturally coalesced into whichever state
/// holds at the next tick instead of firing both events.
pub struct SysfsBlockObserver {
    devices: Arc<Mutex<HashSet<DeviceInfo>>>,
    tx: broadcast::Sender<DeviceEvent>,
    _poll_task: tokio::task::JoinHandle<()>,
}

impl SysfsBlockObserver {
    pub fn new(poll_interval: Duration, transport_prefix: impl Into<String>) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        let transport_prefix = transport_prefix.into();
        let initial = snapshot_sysfs(&transport_prefix);
        let devices = Arc::new(Mutex::new(initial.clone()));

        let poll_tx = tx.clone();
        let poll_devices = devices.clone();
        let poll_task = tokio::spawn(async move {
            let mut prev = initial;
            loop {
                tokio::time::sleep(poll_interval).await;
                let current = snapshot_sysfs(&transport_prefix);
                for removed in prev.difference(&current) {
                    let _ = poll_tx.send(DeviceEvent { kind: DeviceEventKind::Removed, device: removed.clone() });
                }
                for added in current.difference(&prev) {
                    let _ = poll_tx.send(DeviceEvent { kind: DeviceEventKind::Added, device: added.clone() });
                }
                *poll_devices.lock().unwrap() = current.clone();
                prev = current;
            }
        });

        SysfsBlockObserver { devices, tx, _poll_task: poll_task }
    }
}

#[async_trait]
impl DeviceObserver for SysfsBlockObserver {
    async fn snapshot(&self) -> HashSet<DeviceInfo> {
        self.devices.lock().unwrap().clone()
    }

    async fn wait_for(
        &self,
        predicate: &(dyn Fn(&DeviceEvent) -> bool + Send + Sync),
        timeout_duration: Duration,
    ) -> Option<DeviceEvent> {
        let mut rx = self.tx.subscribe();
        let fut = async {
            loop {
                match rx.recv().await {
                    Ok(event) if predicate(&event) => return Some(event),
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
        };
        timeout(timeout_duration, fut).await.unwrap_or(None)
    }
}

impl Drop for SysfsBlockObserver {
    fn drop(&mut self) {
        self._poll_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(name: &str, size: u64, token: &str) -> DeviceInfo {
        DeviceInfo {
            name: name.into(),
            device_path: format!("/dev/{name}"),
            size_bytes: size,
            controller_token: token.into(),
        }
    }

    #[tokio::test]
    async fn snapshot_reflects_attach_and_detach() {
        let observer = SimulatedObserver::new();
        let d = dev("vda", 1 << 30, "ctrl-0");
        observer.simulate_attach(d.clone());
        assert_eq!(observer.snapshot().await.len(), 1);

        observer.simulate_detach(d);
        assert_eq!(observer.snapshot().await.len(), 0);
    }

    #[tokio::test]
    async fn wait_for_matches_added_event_by_size() {
        let observer = SimulatedObserver::new();
        let target_size = 2 << 30;

        let observer_handle = std::sync::Arc::new(observer);
        let waiter = {
            let observer_handle = observer_handle.clone();
            tokio::spawn(async move {
                observer_handle
                    .wait_for(
                        &|event| event.kind == DeviceEventKind::Added && event.device.size_bytes == target_size,
                        Duration::from_millis(500),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        observer_handle.simulate_attach(dev("vdb", target_size, "ctrl-1"));

        let result = waiter.await.unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn wait_for_times_out_with_no_match() {
        let observer = SimulatedObserver::new();
        let result = observer
            .wait_for(&|_| true, Duration::from_millis(20))
            .await;
        assert!(result.is_none());
    }
}
