//! What to capture: the acquisition plan and the device commands that set it up.

pub mod device;
pub mod plan;

pub use device::{ChannelSelection, DeviceControl, VendorCommand};
pub use plan::AcquisitionPlan;
