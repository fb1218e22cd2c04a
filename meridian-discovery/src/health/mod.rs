//! Active health checking of registered instances

pub mod prober;
pub mod supervisor;

pub use prober::{build_prober, HealthResult, HttpProber, NoopProber, Prober, TcpProber};
pub use supervisor::{HealthCheckConfig, HealthSupervisor, SupervisorHandle, SupervisorReport};
