use crate::transport::Transport;
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    cv: Condvar,
}

impl Pipe {
    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cv.notify_all();
    }
}

/// One end of an in-memory duplex stream, see [`duplex`].
#[derive(Clone)]
pub struct MemoryTransport {
    name: String,
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
}

/// Create a connected pair of in-memory transports.
/// Bytes written into one end are readable from another. Used for simulated devices.
pub fn duplex(name: &str) -> (MemoryTransport, MemoryTransport) {
    let a = Arc::new(Pipe::default());
    let b = Arc::new(Pipe::default());
    (
        MemoryTransport {
            name: format!("mem:{name}:host"),
            incoming: a.clone(),
            outgoing: b.clone(),
        },
        MemoryTransport {
            name: format!("mem:{name}:device"),
            incoming: b,
            outgoing: a,
        },
    )
}

impl MemoryTransport {
    /// Read with explicit wait timeout.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let state = self.incoming.state.lock().unwrap();
        let (mut state, _) = self
            .incoming
            .cv
            .wait_timeout_while(state, timeout, |s| s.data.is_empty() && !s.closed)
            .unwrap();

        if state.data.is_empty() && state.closed {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "pipe closed"));
        }

        let n = buf.len().min(state.data.len());
        for (dst, src) in buf.iter_mut().zip(state.data.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_timeout(buf, POLL_INTERVAL)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.outgoing.state.lock().unwrap();
        if state.closed {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "pipe closed"));
        }
        state.data.extend(data);
        self.outgoing.cv.notify_all();
        Ok(())
    }

    fn available_bytes(&self) -> io::Result<usize> {
        Ok(self.incoming.state.lock().unwrap().data.len())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.clone()))
    }

    fn close(&mut self) {
        self.incoming.close();
        self.outgoing.close();
    }
}
