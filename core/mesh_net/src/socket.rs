//! Non-blocking TCP stream with separate input and output buffers

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

/// Size of the stack buffer used per `read` call
const READ_CHUNK: usize = 16 * 1024;

// ============================================================================
// Byte Buffer
// ============================================================================

/// Growable FIFO of bytes with count-aware peek/read/drain.
#[derive(Debug, Default, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The first `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        self.data.get(..n)
    }

    /// Consume exactly `n` bytes, or nothing if fewer are buffered.
    pub fn read(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.data.len() < n {
            return None;
        }
        Some(self.data.drain(..n).collect())
    }

    /// Discard up to `n` bytes, returning how many were removed.
    pub fn drain(&mut self, n: usize) -> usize {
        let n = n.min(self.data.len());
        self.data.drain(..n);
        n
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

// ============================================================================
// Socket
// ============================================================================

/// Outcome of draining the kernel receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Open,
    /// Peer closed its write half
    Eof,
}

pub struct Socket {
    stream: TcpStream,
    input: ByteBuffer,
    output: ByteBuffer,
}

impl Socket {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            input: ByteBuffer::new(),
            output: ByteBuffer::new(),
        }
    }

    /// Start a non-blocking connect. Completion is reported as writability.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("set_nodelay failed for {}: {}", addr, e);
        }
        Ok(Self::new(stream))
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(
            &mut self.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    pub fn deregister(&mut self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut self.stream) {
            log::trace!("deregister failed: {}", e);
        }
    }

    /// Read everything the kernel has buffered into the input buffer.
    pub fn fill(&mut self) -> io::Result<ReadStatus> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => self.input.extend(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn input(&mut self) -> &mut ByteBuffer {
        &mut self.input
    }

    /// Queue bytes for sending without touching the stream.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.output.extend(bytes);
    }

    /// Queue bytes and try to send immediately.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.queue(bytes);
        self.flush()
    }

    /// Send as much queued output as the kernel accepts.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.output.is_empty() {
            match self.stream.write(self.output.as_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.output.drain(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    /// Pending error from a non-blocking connect.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.stream.take_error()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_addr().ok().map(|a| a.ip())
    }

    pub fn peer_port(&self) -> Option<u16> {
        self.peer_addr().ok().map(|a| a.port())
    }

    /// `ip:port` of the peer for log lines.
    pub fn addr_string(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "unconnected".to_string(),
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.flush();
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::trace!("shutdown: {}", e);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_peek_read_drain() {
        let mut buf = ByteBuffer::new();
        buf.extend(b"abcdef");

        assert_eq!(buf.peek(2), Some(&b"ab"[..]));
        assert_eq!(buf.peek(7), None);
        assert_eq!(buf.len(), 6);

        assert_eq!(buf.read(3), Some(b"abc".to_vec()));
        assert_eq!(buf.read(4), None);
        assert_eq!(buf.len(), 3);

        assert_eq!(buf.drain(10), 3);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_socket_write_and_fill() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let mut a = Socket::new(TcpStream::from_std(client));
        let mut b = Socket::new(TcpStream::from_std(server));

        a.write(b"ping").unwrap();
        assert_eq!(a.pending_output(), 0);

        let mut got = Vec::new();
        for _ in 0..100 {
            b.fill().unwrap();
            if b.input().len() >= 4 {
                got = b.input().read(4).unwrap();
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(got, b"ping");
        assert_eq!(a.peer_port(), Some(addr.port()));

        a.shutdown();
        let mut status = ReadStatus::Open;
        for _ in 0..100 {
            status = b.fill().unwrap();
            if status == ReadStatus::Eof {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(status, ReadStatus::Eof);
    }
}
