//! The emulation engine: state storage, the event bus, the scenario
//! library, emulated metrics and hosts, and the mixer that pushes their
//! output to a Prometheus Pushgateway.
//!
//! Everything time-dependent reads "now" through [`clock::Clock`] rather
//! than the system clock directly, which is what lets the boundary-behavior
//! tests in each module drive exact timestamps instead of sleeping.

pub mod clock;
pub mod error;
pub mod events;
pub mod hosts;
pub mod metrics;
pub mod mixer;
pub mod registry;
pub mod scenarios;
pub mod storage;

pub use clock::Clock;
pub use error::{ConfigError, EngineError, TransportError, ValidationError};
pub use events::{Event, EventBus, EventData, SubscriptionId};
pub use hosts::{EmulatedHost, HostBatch, HostConfig, HostStatus};
pub use metrics::{EmulatedMetric, MetricConfig, MetricContext, MetricType};
pub use mixer::{Mixer, MixerConfig, MixerStatus};
pub use scenarios::ScenarioSpec;
pub use storage::{StateStorage, StorageValue};
