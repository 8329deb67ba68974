pub mod config;
pub mod loopback;
pub mod recording;
pub mod sink;
pub mod swarm;

pub use config::AppConfig;
pub use loopback::{LoopbackFactory, LoopbackNetwork, LoopbackTransport, relay_signals};
pub use recording::{RecordedTransport, RecordingTransportFactory};
pub use sink::{DirectoryFileSink, MemoryFileSink};
pub use swarm::{InMemorySwarm, SwarmHub};
