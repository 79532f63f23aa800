use crate::transport::Transport;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// TCP-based transport (devices exposing the debug channel over a socket, emulators).
pub struct TcpTransport {
    addr: SocketAddr,
    name: String,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            name: format!("tcp:{addr}"),
            stream: None,
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "tcp transport not opened"))
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> io::Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect(self.addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream()?.read(buf) {
            Ok(0) => Err(io::Error::new(
                ErrorKind::ConnectionAborted,
                "tcp connection closed",
            )),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let stream = self.stream()?;
        stream.write_all(data)?;
        stream.flush()
    }

    fn available_bytes(&self) -> io::Result<usize> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(0);
        };
        let mut probe = [0u8; 4096];
        stream.set_nonblocking(true)?;
        let available = match stream.peek(&mut probe) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        };
        stream.set_nonblocking(false)?;
        available
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        let stream = match self.stream.as_ref() {
            Some(stream) => Some(stream.try_clone()?),
            None => None,
        };
        Ok(Box::new(TcpTransport {
            addr: self.addr,
            name: self.name.clone(),
            stream,
        }))
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            _ = stream.shutdown(Shutdown::Both);
        }
    }
}
