pub mod daemon;
pub mod error;
pub mod observer;
pub mod publisher;
pub mod upstream;

pub use daemon::{VolumeDaemon, VolumeStatus, DEFAULT_CORRELATION_WINDOW};
pub use error::VolumeError;
pub use observer::{
    DeviceEvent, DeviceEventKind, DeviceInfo, DeviceObserver, SimulatedObserver,
    SysfsBlockObserver, DEFAULT_POLL_INTERVAL, DEFAULT_TRANSPORT_PREFIX,
};
pub use publisher::{ExportPublisher, ExportServerSignal, NullExportServerSignal};
pub use upstream::{
    sign_request, CloudStackUpstreamClient, CreateVolumeRequest, InMemoryUpstreamClient, Offering,
    UpstreamClient, UpstreamVolume, Zone,
};
