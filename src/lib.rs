//! # gemsched - GPU command submission core
//!
//! The part of a GPU kernel driver that sits between client batches and the
//! hardware rings, modelled as a library over a pluggable [`RingDevice`].
//!
//! ## Features
//!
//! - **GTT address space** with LRU eviction, a mappable aperture and fence registers
//! - **Per-engine seqno tracking** with interrupt-driven retirement
//! - **Flow-controlled rings** behind a reference-counted wake gate
//! - **Journaled submission**: a failed execbuffer leaves no trace
//! - **Token-bucket admission** with rogue demotion and video promotion
//! - **Hang detection** and asynchronous engine reset
//! - **Software device** (`sim` feature) for tests and tooling
//!
//! ## Quick Start
//!
//! ```rust
//! use gemsched::prelude::*;
//!
//! fn main() -> Result<(), GemError> {
//!     let (device, _sim) = Device::simulated(DeviceConfig::testing())?;
//!     let client = device.open_client(PriorityClass::Normal)?;
//!     let batch = device.create_object(client, 4096)?;
//!
//!     let args = SubmitArgs::new(EngineId::Render, vec![ExecObject::new(batch)], 64);
//!     let seqno = device.submit(client, &args)?;
//!     device.wait_rendering(client, batch, false, std::time::Duration::from_secs(1))?;
//!     println!("seqno {} done", seqno);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod device;
pub mod error;
pub mod hangcheck;
pub mod hw;
pub mod mm;
pub mod ring;
pub mod sched;
pub mod seqno;
pub mod submit;

// Re-export main API for easy access
pub use config::DeviceConfig;
pub use device::Device;
pub use error::{GemError, GemResult};
pub use hw::{EngineId, RingDevice};
pub use mm::{CacheLevel, Domains, ObjectId, Tiling};
pub use sched::{ClientId, PriorityClass, SchedulerReport};
pub use submit::{ExecFlags, ExecObject, ExecObjectFlags, Relocation, SubmitArgs};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
///
/// # Example
///
/// ```
/// println!("Using gemsched v{}", gemsched::version());
/// ```
pub fn version() -> &'static str {
    VERSION
}


/// Prelude module for convenient imports
///
/// # Example
///
/// ```
/// use gemsched::prelude::*;
///
/// let config = DeviceConfig::testing();
/// assert!(config.validate().is_ok());
/// ```
pub mod prelude {
    pub use crate::config::DeviceConfig;
    pub use crate::device::Device;
    pub use crate::error::{GemError, GemResult};
    pub use crate::hw::EngineId;
    pub use crate::mm::{Domains, ObjectId, Tiling};
    pub use crate::sched::{ClientId, PriorityClass};
    pub use crate::submit::{ExecFlags, ExecObject, ExecObjectFlags, Relocation, SubmitArgs};
    pub use crate::version;

    #[cfg(feature = "sim")]
    pub use crate::hw::sim::{SimDevice, SimMode};
}
