//! Transport abstraction layer.
//! Engine consumes any duplex byte stream: TCP, an in-memory pipe (for simulated devices)
//! or an externally implemented serial/USB stream.

use crate::error::Error;
use indexmap::IndexMap;
use std::io;

mod memory;
mod tcp;

pub use memory::{duplex, MemoryTransport};
pub use tcp::TcpTransport;

/// Duplex byte stream to a device.
pub trait Transport: Send {
    /// Human-readable name of underlying device, used in logs.
    fn name(&self) -> &str;

    /// Prepare stream for reading and writing.
    fn open(&mut self) -> io::Result<()>;

    /// Read available bytes into `buf`.
    /// Implementations must not block forever: return `Ok(0)` if nothing arrived
    /// within a short poll interval.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all bytes.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Number of bytes that can be read without blocking.
    fn available_bytes(&self) -> io::Result<usize>;

    /// Return a second handle to the same stream, engine reads and writes from different threads.
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;

    /// Close stream, subsequent reads return an error.
    fn close(&mut self);
}

type Supplier = Box<dyn Fn() -> Result<Vec<Box<dyn Transport>>, Error> + Send + Sync>;

/// Registry of transport suppliers. Each supplier enumerates devices reachable by some
/// strategy (serial port list, usb device list, tcp endpoints).
#[derive(Default)]
pub struct TransportRegistry {
    suppliers: IndexMap<String, Supplier>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a supplier. Supplier with the same name is replaced.
    ///
    /// # Arguments
    ///
    /// * `name`: supplier name (like "tcp", "usb")
    /// * `supplier`: function that enumerates devices
    pub fn register<F>(&mut self, name: impl Into<String>, supplier: F)
    where
        F: Fn() -> Result<Vec<Box<dyn Transport>>, Error> + Send + Sync + 'static,
    {
        self.suppliers.insert(name.into(), Box::new(supplier));
    }

    pub fn deregister(&mut self, name: &str) -> bool {
        self.suppliers.shift_remove(name).is_some()
    }

    /// Return names of all registered suppliers in registration order.
    pub fn suppliers(&self) -> impl Iterator<Item = &str> {
        self.suppliers.keys().map(String::as_str)
    }

    /// Enumerate devices of a single supplier.
    pub fn enumerate(&self, name: &str) -> Result<Vec<Box<dyn Transport>>, Error> {
        let supplier = self
            .suppliers
            .get(name)
            .ok_or_else(|| Error::TransportNotFound(name.to_string()))?;
        supplier()
    }

    /// Enumerate devices of all suppliers. Failed suppliers are logged and skipped.
    pub fn enumerate_all(&self) -> Vec<Box<dyn Transport>> {
        self.suppliers
            .iter()
            .filter_map(|(name, supplier)| {
                crate::weak_error!(supplier(), "transport enumeration fail:")
                    .map(|devices| (name, devices))
            })
            .flat_map(|(_, devices)| devices)
            .collect()
    }
}
