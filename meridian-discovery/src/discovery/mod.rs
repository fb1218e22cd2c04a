//! Instance records, the registry and its event stream

pub mod events;
pub mod instance;
pub mod registry;

pub use events::{EventBus, Watcher};
pub use instance::{EventKind, ServiceEvent, ServiceInstance, ServiceStatus};
pub use registry::{Registry, RegistryConfig};
