//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockBackend, MockDevice, MockOp};
pub use self::nusb::NusbBackend;
pub use traits::{DeviceProbe, EndpointRef, KernelDriver, TransportError, UsbBackend, UsbTransport};
