//! Mock USB backend for testing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use super::traits::{DeviceProbe, EndpointRef, KernelDriver, TransportError, UsbBackend, UsbTransport};
use crate::device::{
    DeviceDescriptor, DeviceKey, Direction, EndpointDescriptor, InterfaceDescriptor,
    InterfaceSummary, PRINTER_CLASS,
};

/// A scripted device attached to a [`MockBackend`].
#[derive(Debug, Clone)]
pub struct MockDevice {
    key: DeviceKey,
    vendor_id: u16,
    product_id: u16,
    interfaces: Vec<InterfaceDescriptor>,
    failing_claims: HashSet<u8>,
    claim_gates: HashMap<u8, Arc<Barrier>>,
    unreadable: bool,
    fail_writes: bool,
    fail_release: bool,
    responses: VecDeque<Vec<u8>>,
}

impl MockDevice {
    /// A device without interfaces.
    pub fn new(key: u64, vendor_id: u16, product_id: u16) -> Self {
        Self {
            key: DeviceKey(key),
            vendor_id,
            product_id,
            interfaces: Vec::new(),
            failing_claims: HashSet::new(),
            claim_gates: HashMap::new(),
            unreadable: false,
            fail_writes: false,
            fail_release: false,
            responses: VecDeque::new(),
        }
    }

    /// A receipt printer: one printer-class interface with OUT 0x01 and IN 0x81.
    pub fn printer(key: u64, vendor_id: u16, product_id: u16) -> Self {
        Self::new(key, vendor_id, product_id).with_interface(
            0,
            PRINTER_CLASS,
            &[
                EndpointDescriptor::new(0x01, Direction::Out),
                EndpointDescriptor::new(0x81, Direction::In),
            ],
        )
    }

    pub fn with_interface(mut self, number: u8, class: u8, endpoints: &[EndpointDescriptor]) -> Self {
        self.interfaces.push(InterfaceDescriptor {
            number,
            class,
            endpoints: endpoints.to_vec(),
        });
        self
    }

    /// Make claiming this interface fail (e.g. taken by another process).
    pub fn fail_claim(mut self, interface: u8) -> Self {
        self.failing_claims.insert(interface);
        self
    }

    /// Park claims of this interface on `gate`.
    ///
    /// The claim waits on the barrier twice: once to announce that it is in
    /// progress and once more before it completes.
    pub fn block_claim(mut self, interface: u8, gate: Arc<Barrier>) -> Self {
        self.claim_gates.insert(interface, gate);
        self
    }

    /// Make the descriptors of this device unreadable during enumeration.
    pub fn unreadable(mut self) -> Self {
        self.unreadable = true;
        self
    }

    pub fn fail_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn fail_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    /// Queue a response for the next read on this device.
    pub fn with_response(mut self, bytes: &[u8]) -> Self {
        self.responses.push_back(bytes.to_vec());
        self
    }

    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            key: self.key,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            interfaces: self
                .interfaces
                .iter()
                .map(|i| InterfaceSummary {
                    number: i.number,
                    class: i.class,
                })
                .collect(),
        }
    }
}

/// Operations recorded by the mock, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Open(DeviceKey),
    DetachKernelDriver(DeviceKey, u8),
    Claim(DeviceKey, u8),
    Write(DeviceKey, Vec<u8>),
    Read(DeviceKey, usize),
    Release(DeviceKey),
}

#[derive(Default)]
struct MockState {
    devices: Vec<MockDevice>,
    watchers: Vec<Sender<DeviceKey>>,
    ops: Vec<MockOp>,
}

/// In-memory USB backend.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a device in.
    pub fn attach(&self, device: MockDevice) {
        self.state.lock().unwrap().devices.push(device);
    }

    /// Pull a device out and notify every detach watcher.
    pub fn unplug(&self, key: DeviceKey) {
        let mut state = self.state.lock().unwrap();
        state.devices.retain(|d| d.key != key);
        state.watchers.retain(|tx| tx.send(key).is_ok());
    }

    /// Detach watchers that are still listening.
    pub fn watcher_count(&self) -> usize {
        self.state.lock().unwrap().watchers.len()
    }

    /// Every operation performed so far.
    pub fn ops(&self) -> Vec<MockOp> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Payloads of all successful writes.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                MockOp::Write(_, bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&MockOp) -> bool) -> usize {
        self.ops().iter().filter(|op| pred(op)).count()
    }

    fn record(&self, op: MockOp) {
        self.state.lock().unwrap().ops.push(op);
    }

    fn with_device<T>(
        &self,
        key: DeviceKey,
        f: impl FnOnce(&mut MockDevice) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = self.state.lock().unwrap();
        let device = state
            .devices
            .iter_mut()
            .find(|d| d.key == key)
            .ok_or(TransportError::Disconnected)?;
        f(device)
    }
}

impl UsbBackend for MockBackend {
    fn enumerate(&self) -> Result<Vec<DeviceProbe>, TransportError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .devices
            .iter()
            .map(|d| {
                if d.unreadable {
                    Err(TransportError::DescriptorUnreadable(format!(
                        "access denied to {}",
                        d.key
                    )))
                } else {
                    Ok(d.descriptor())
                }
            })
            .collect())
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Arc<dyn UsbTransport>, TransportError> {
        self.with_device(device.key, |_| Ok(()))
            .map_err(|_| TransportError::DeviceGone { key: device.key })?;
        self.record(MockOp::Open(device.key));
        Ok(Arc::new(MockTransport {
            backend: self.clone(),
            key: device.key,
            claimed: Mutex::new(HashSet::new()),
        }))
    }

    fn watch_detach(&self) -> Result<Receiver<DeviceKey>, TransportError> {
        let (tx, rx) = mpsc::channel();
        self.state.lock().unwrap().watchers.push(tx);
        Ok(rx)
    }
}

/// Handle returned by [`MockBackend::open`].
pub struct MockTransport {
    backend: MockBackend,
    key: DeviceKey,
    claimed: Mutex<HashSet<u8>>,
}

impl MockTransport {
    fn check_claimed(&self, interface: u8) -> Result<(), TransportError> {
        if self.claimed.lock().unwrap().contains(&interface) {
            Ok(())
        } else {
            Err(TransportError::InterfaceNotClaimed { interface })
        }
    }
}

impl UsbTransport for MockTransport {
    fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>, TransportError> {
        self.backend
            .with_device(self.key, |d| Ok(d.interfaces.clone()))
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<KernelDriver, TransportError> {
        self.backend
            .record(MockOp::DetachKernelDriver(self.key, interface));
        Ok(KernelDriver::NotActive)
    }

    fn claim_interface(&self, interface: u8) -> Result<(), TransportError> {
        let gate = self
            .backend
            .with_device(self.key, |d| Ok(d.claim_gates.get(&interface).cloned()))?;
        if let Some(gate) = gate {
            gate.wait();
            gate.wait();
        }
        self.backend.with_device(self.key, |d| {
            if d.failing_claims.contains(&interface) {
                Err(TransportError::ClaimInterfaceFailed {
                    interface,
                    message: "LIBUSB_ERROR_ACCESS".into(),
                })
            } else {
                Ok(())
            }
        })?;
        self.claimed.lock().unwrap().insert(interface);
        self.backend.record(MockOp::Claim(self.key, interface));
        Ok(())
    }

    fn write(
        &self,
        endpoint: EndpointRef,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.check_claimed(endpoint.interface)?;
        self.backend.with_device(self.key, |d| {
            if d.fail_writes {
                Err(TransportError::WriteFailed("LIBUSB_ERROR_PIPE".into()))
            } else {
                Ok(())
            }
        })?;
        self.backend.record(MockOp::Write(self.key, data.to_vec()));
        Ok(data.len())
    }

    fn read(
        &self,
        endpoint: EndpointRef,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_claimed(endpoint.interface)?;
        let mut response = self.backend.with_device(self.key, |d| {
            d.responses.pop_front().ok_or(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
        })?;
        response.truncate(max_len);
        self.backend.record(MockOp::Read(self.key, max_len));
        Ok(response)
    }

    fn release(&self) -> Result<(), TransportError> {
        let fail = self
            .backend
            .with_device(self.key, |d| Ok(d.fail_release))
            .unwrap_or(false);
        if fail {
            return Err(TransportError::ReleaseFailed("LIBUSB_ERROR_NO_DEVICE".into()));
        }
        self.claimed.lock().unwrap().clear();
        self.backend.record(MockOp::Release(self.key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out_ep() -> EndpointRef {
        EndpointRef {
            interface: 0,
            address: 0x01,
        }
    }

    #[test]
    fn test_mock_write_requires_claim() {
        let backend = MockBackend::new();
        backend.attach(MockDevice::printer(1, 0x0493, 0x8760));
        let device = backend.enumerate().unwrap().remove(0).unwrap();
        let handle = backend.open(&device).unwrap();

        assert!(matches!(
            handle.write(out_ep(), b"x", Duration::from_secs(1)),
            Err(TransportError::InterfaceNotClaimed { interface: 0 })
        ));

        handle.claim_interface(0).unwrap();
        handle.write(out_ep(), b"Hello", Duration::from_secs(1)).unwrap();
        assert_eq!(backend.writes(), vec![b"Hello".to_vec()]);
    }

    #[test]
    fn test_mock_read_queue() {
        let backend = MockBackend::new();
        backend.attach(MockDevice::printer(1, 0x0493, 0x8760).with_response(&[0x12, 0x00]));
        let device = backend.enumerate().unwrap().remove(0).unwrap();
        let handle = backend.open(&device).unwrap();
        handle.claim_interface(0).unwrap();

        let ep_in = EndpointRef {
            interface: 0,
            address: 0x81,
        };
        assert_eq!(handle.read(ep_in, 64, Duration::from_secs(1)).unwrap(), vec![0x12, 0x00]);
        assert!(matches!(
            handle.read(ep_in, 64, Duration::from_secs(1)),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_mock_unplug_notifies_watchers() {
        let backend = MockBackend::new();
        backend.attach(MockDevice::printer(9, 0x0493, 0x8760));
        let device = backend.enumerate().unwrap().remove(0).unwrap();
        let handle = backend.open(&device).unwrap();
        handle.claim_interface(0).unwrap();
        let watch = backend.watch_detach().unwrap();

        backend.unplug(DeviceKey(9));
        assert_eq!(watch.recv().unwrap(), DeviceKey(9));
        assert!(matches!(
            handle.write(out_ep(), b"x", Duration::from_secs(1)),
            Err(TransportError::Disconnected)
        ));
        assert!(backend.enumerate().unwrap().is_empty());
    }
}
