#![doc = "Real-time core of the process-data exchange coordinator."]

pub mod bus;
pub mod cyclic;
pub mod gate;
pub mod lock;
pub mod realtime;
pub mod scheduler;
pub mod sequencer;
pub mod status;

pub use bus::*;
pub use cyclic::*;
pub use gate::*;
pub use lock::*;
pub use realtime::*;
pub use scheduler::*;
pub use sequencer::*;
pub use status::*;
