//! nusb-based USB backend.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use futures::executor::block_on_stream;
use nusb::descriptors::TransferType;
use nusb::hotplug::HotplugEvent;
use nusb::transfer::{Bulk, In, Out};
use nusb::{Interface, MaybeFuture, list_devices, watch_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{DeviceProbe, EndpointRef, KernelDriver, TransportError, UsbBackend, UsbTransport};
use crate::device::{
    DeviceDescriptor, DeviceKey, Direction, EndpointDescriptor, InterfaceDescriptor,
    InterfaceSummary,
};

/// Buffer size handed to nusb's endpoint reader/writer.
const TRANSFER_BUFFER: usize = 4096;

fn key_of(id: nusb::DeviceId) -> DeviceKey {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    DeviceKey(hasher.finish())
}

fn describe(info: &nusb::DeviceInfo) -> DeviceDescriptor {
    DeviceDescriptor {
        key: key_of(info.id()),
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        interfaces: info
            .interfaces()
            .map(|iface| InterfaceSummary {
                number: iface.interface_number(),
                class: iface.class(),
            })
            .collect(),
    }
}

fn io_to_transfer(e: io::Error, timeout: Duration, wrap: fn(String) -> TransportError) -> TransportError {
    match e.kind() {
        io::ErrorKind::TimedOut => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected => TransportError::Disconnected,
        _ => wrap(e.to_string()),
    }
}

/// usbfs reports ENODATA when no driver is bound to the interface.
#[cfg(target_os = "linux")]
const ENODATA: i64 = 61;

#[cfg(target_os = "linux")]
fn detach_error(
    interface: u8,
    os_error: Option<i64>,
    message: &str,
) -> Result<KernelDriver, TransportError> {
    match os_error {
        Some(ENODATA) => Ok(KernelDriver::NotActive),
        _ => Err(TransportError::ClaimInterfaceFailed {
            interface,
            message: format!("kernel driver detach: {message}"),
        }),
    }
}

/// Backend talking to the host USB stack through nusb.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBackend;

impl NusbBackend {
    pub fn new() -> Self {
        Self
    }
}

impl UsbBackend for NusbBackend {
    fn enumerate(&self) -> Result<Vec<DeviceProbe>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?;
        // nusb reads interface summaries during enumeration, so every listed
        // device is readable here.
        Ok(devices.map(|info| Ok(describe(&info))).collect())
    }

    #[instrument(level = "info", skip(self), fields(device = %device))]
    fn open(&self, device: &DeviceDescriptor) -> Result<Arc<dyn UsbTransport>, TransportError> {
        let info = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?
            .find(|info| key_of(info.id()) == device.key)
            .ok_or(TransportError::DeviceGone { key: device.key })?;

        let handle = info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        info!(
            vendor_id = %format!("{:04X}", device.vendor_id),
            product_id = %format!("{:04X}", device.product_id),
            "Device opened"
        );

        Ok(Arc::new(NusbTransport {
            device: handle,
            claimed: Mutex::new(Vec::new()),
        }))
    }

    fn watch_detach(&self) -> Result<Receiver<DeviceKey>, TransportError> {
        let watch = watch_devices().map_err(|e| TransportError::WatchFailed(e.to_string()))?;
        let (tx, rx) = mpsc::channel();

        thread::Builder::new()
            .name("usb-hotplug".into())
            .spawn(move || {
                for event in block_on_stream(watch) {
                    if let HotplugEvent::Disconnected(id) = event {
                        debug!(key = %key_of(id), "USB device removed");
                        if tx.send(key_of(id)).is_err() {
                            break;
                        }
                    }
                }
            })?;

        Ok(rx)
    }
}

/// An opened nusb device with its claimed interfaces.
pub struct NusbTransport {
    device: nusb::Device,
    claimed: Mutex<Vec<(u8, Interface)>>,
}

impl NusbTransport {
    fn interface(&self, number: u8) -> Result<Interface, TransportError> {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, iface)| iface.clone())
            .ok_or(TransportError::InterfaceNotClaimed { interface: number })
    }
}

impl UsbTransport for NusbTransport {
    fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>, TransportError> {
        let config = self
            .device
            .active_configuration()
            .map_err(|e| TransportError::DescriptorUnreadable(e.to_string()))?;

        let mut interfaces = Vec::new();
        for group in config.interfaces() {
            // Use the default alternate setting.
            let Some(alt) = group.alt_settings().next() else {
                continue;
            };
            let endpoints = alt
                .endpoints()
                .filter(|ep| ep.transfer_type() == TransferType::Bulk)
                .map(|ep| {
                    let direction = if ep.direction() == nusb::transfer::Direction::In {
                        Direction::In
                    } else {
                        Direction::Out
                    };
                    EndpointDescriptor::new(ep.address(), direction)
                })
                .collect();
            interfaces.push(InterfaceDescriptor {
                number: group.interface_number(),
                class: alt.class(),
                endpoints,
            });
        }
        Ok(interfaces)
    }

    #[cfg(target_os = "linux")]
    fn detach_kernel_driver(&self, interface: u8) -> Result<KernelDriver, TransportError> {
        match self.device.detach_kernel_driver(interface) {
            Ok(()) => Ok(KernelDriver::Detached),
            Err(e) => detach_error(interface, e.os_error().map(i64::from), &e.to_string()),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn detach_kernel_driver(&self, _interface: u8) -> Result<KernelDriver, TransportError> {
        Ok(KernelDriver::Unsupported)
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        let claimed = self
            .device
            .claim_interface(interface)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface,
                message: e.to_string(),
            })?;
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((interface, claimed));
        Ok(())
    }

    #[instrument(skip(self, data), fields(ep = %format!("0x{:02X}", endpoint.address), len = data.len()))]
    fn write(
        &self,
        endpoint: EndpointRef,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let ep = self
            .interface(endpoint.interface)?
            .endpoint::<Bulk, Out>(endpoint.address)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(TRANSFER_BUFFER).with_write_timeout(timeout);
        writer
            .write_all(data)
            .map_err(|e| io_to_transfer(e, timeout, TransportError::WriteFailed))?;
        writer
            .flush()
            .map_err(|e| io_to_transfer(e, timeout, TransportError::WriteFailed))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(ep = %format!("0x{:02X}", endpoint.address)))]
    fn read(
        &self,
        endpoint: EndpointRef,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let ep = self
            .interface(endpoint.interface)?
            .endpoint::<Bulk, In>(endpoint.address)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(TRANSFER_BUFFER).with_read_timeout(timeout);
        let mut buf = vec![0u8; max_len];
        let n = reader
            .read(&mut buf)
            .map_err(|e| io_to_transfer(e, timeout, TransportError::ReadFailed))?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn release(&self) -> Result<(), TransportError> {
        let released = std::mem::take(&mut *self.claimed.lock().unwrap_or_else(PoisonError::into_inner));
        if !released.is_empty() {
            debug!(interfaces = released.len(), "Released interfaces");
        }
        // Dropping the interfaces releases the claims; the device closes once
        // the last handle goes away.
        drop(released);
        Ok(())
    }
}

impl Drop for NusbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "Release on drop failed");
        }
    }
}
