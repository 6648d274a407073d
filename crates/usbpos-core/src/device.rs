//! USB device descriptors and printer discovery.
//!
//! Discovery works on plain descriptor values produced by a [`UsbBackend`],
//! so the same filtering and binding rules apply to the nusb backend and to
//! the mock used in tests.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::error::ConnectionError;
use crate::transport::{TransportError, UsbBackend};

/// USB interface class code for printers (bInterfaceClass).
pub const PRINTER_CLASS: u8 = 0x07;

/// Identity of one attached device.
///
/// Enumerating the same attachment twice yields the same key; unplugging and
/// replugging the device yields a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey(pub u64);

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:016x}", self.0)
    }
}

/// Transfer direction of an endpoint, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

/// One endpoint of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub direction: Direction,
}

impl EndpointDescriptor {
    pub fn new(address: u8, direction: Direction) -> Self {
        Self { address, direction }
    }
}

/// Interface number and class as reported during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSummary {
    pub number: u8,
    pub class: u8,
}

/// Interface descriptor read from an opened device, endpoints included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub class: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// An enumerated USB device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub key: DeviceKey,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interfaces: Vec<InterfaceSummary>,
}

impl DeviceDescriptor {
    /// Whether any interface of this device is printer class.
    pub fn is_printer(&self) -> bool {
        self.interfaces.iter().any(|i| i.class == PRINTER_CLASS)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}:{:04X} ({})",
            self.vendor_id, self.product_id, self.key
        )
    }
}

/// Which device a connection should bind to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BindTarget {
    /// A specific device, falling back to another unit with the same ids.
    Descriptor(DeviceDescriptor),
    /// First device with this vendor/product pair.
    Ids { vendor_id: u16, product_id: u16 },
    /// First printer-class device found.
    #[default]
    AnyPrinter,
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindTarget::Descriptor(d) => write!(f, "device {d}"),
            BindTarget::Ids {
                vendor_id,
                product_id,
            } => write!(f, "VID={vendor_id:04X} PID={product_id:04X}"),
            BindTarget::AnyPrinter => write!(f, "any printer-class device"),
        }
    }
}

/// Finds printer devices through a backend.
#[derive(Clone)]
pub struct DeviceLocator {
    backend: Arc<dyn UsbBackend>,
}

impl DeviceLocator {
    pub fn new(backend: Arc<dyn UsbBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn UsbBackend> {
        &self.backend
    }

    /// All devices whose descriptors could be read.
    pub fn list_all(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let probes = self.backend.enumerate()?;
        Ok(probes
            .into_iter()
            .filter_map(|probe| match probe {
                Ok(device) => Some(device),
                Err(e) => {
                    // Permission or transient read failures only hide this device.
                    debug!(error = %e, "Skipping device with unreadable descriptors");
                    None
                }
            })
            .collect())
    }

    /// Devices exposing at least one printer-class interface.
    #[instrument(level = "debug", skip(self))]
    pub fn find_candidates(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let candidates: Vec<_> = self
            .list_all()?
            .into_iter()
            .filter(DeviceDescriptor::is_printer)
            .collect();
        debug!(count = candidates.len(), "Printer candidates");
        Ok(candidates)
    }

    /// Resolve a bind target to a device that is currently attached.
    #[instrument(level = "debug", skip(self), fields(target = %target))]
    pub fn bind(&self, target: &BindTarget) -> Result<DeviceDescriptor, ConnectionError> {
        let not_found = || ConnectionError::DeviceNotFound {
            target: target.to_string(),
        };

        let device = match target {
            BindTarget::Descriptor(wanted) => {
                let devices = self.list_all()?;
                devices
                    .iter()
                    .find(|d| d.key == wanted.key)
                    .or_else(|| {
                        devices.iter().find(|d| {
                            d.vendor_id == wanted.vendor_id && d.product_id == wanted.product_id
                        })
                    })
                    .cloned()
            }
            BindTarget::Ids {
                vendor_id,
                product_id,
            } => self
                .list_all()?
                .into_iter()
                .find(|d| d.vendor_id == *vendor_id && d.product_id == *product_id),
            BindTarget::AnyPrinter => self.find_candidates()?.into_iter().next(),
        };

        let device = device.ok_or_else(not_found)?;
        info!(
            vid = %format!("{:04X}", device.vendor_id),
            pid = %format!("{:04X}", device.product_id),
            key = %device.key,
            "Bound printer"
        );
        Ok(device)
    }
}
