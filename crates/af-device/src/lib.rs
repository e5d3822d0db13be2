// af-device: Typed HTTP client for one A/V encoder appliance.
//
// Stateless wrapper over the device's `/api/v2.0` surface.  One shared
// `reqwest::Client` provides the keep-alive connection pool for the whole
// fleet; per-device address and HTTP Basic credentials are supplied per call.

pub mod backoff;
pub mod client;
pub mod error;
pub mod types;

pub use backoff::{BackoffPolicy, BackoffState};
pub use client::{ControlAction, DeviceClient, DeviceTarget, PreviewParams, TransportConfig};
pub use error::DeviceError;
pub use types::{
    Channel, ChannelPublisher, PublisherState, PublisherStatus, RecorderState, RecorderStatus,
    SystemIdentity, SystemStatus,
};
