use std::{
    io::{self, Write},
    net::SocketAddr,
};

use tracing::debug;

/// Non-blocking byte sink for one connection.
///
/// `write` returns how many bytes the kernel accepted; 0 is legal and means
/// try again on a later tick. `seq`/`replay` describe the frame being
/// written, for transports that care (TLS record flushing, capture).
pub trait Channel {
    fn write(&mut self, buf: &[u8], seq: u32, replay: bool) -> io::Result<usize>;

    /// Called once per replay burst after its last byte was handed over.
    fn on_replay_complete(&mut self, correlation_id: u64);

    fn close(&mut self);
}

/// Production channel over a mio TCP stream.
pub struct SocketChannel {
    stream: mio::net::TcpStream,
    peer_addr: SocketAddr,
}

impl SocketChannel {
    pub fn new(stream: mio::net::TcpStream, peer_addr: SocketAddr) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream, peer_addr })
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn stream_mut(&mut self) -> &mut mio::net::TcpStream {
        &mut self.stream
    }
}

impl Channel for SocketChannel {
    #[inline]
    fn write(&mut self, buf: &[u8], _seq: u32, _replay: bool) -> io::Result<usize> {
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock ||
                    e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn on_replay_complete(&mut self, correlation_id: u64) {
        debug!(peer = %self.peer_addr, correlation_id, "replay burst flushed");
    }

    fn close(&mut self) {
        debug!(peer = %self.peer_addr, "terminating connection");
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a mio TcpStream.
pub(crate) fn set_socket_buf_size(stream: &mio::net::TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
