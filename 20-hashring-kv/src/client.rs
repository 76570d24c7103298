//! Outbound connections: one fresh TCP connection per request.

use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::protocol::{self, Request, Response};

/// Resolves `host:port` to the first matching socket address.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{host}:{port} did not resolve"),
        )
    })
}

/// Opens a connection, writes `request`, and closes the connection.
///
/// No response is read. Success only means the bytes were handed to the
/// kernel, not that the peer applied them.
pub fn send(addr: SocketAddr, request: &Request, timeout: Duration) -> io::Result<()> {
    let mut stream = connect(addr, timeout)?;
    stream.write_all(request.encode().as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Sends `request` and waits for a single response line.
///
/// Returns `Ok(None)` when the peer closed the connection without
/// answering, which is how nodes treat mutations and malformed requests.
pub fn request(
    addr: SocketAddr,
    request: &Request,
    timeout: Duration,
) -> io::Result<Option<Response>> {
    let mut stream = connect(addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.write_all(request.encode().as_bytes())?;
    stream.flush()?;
    stream.shutdown(Shutdown::Write)?;

    let Some(line) = protocol::read_line(&stream)? else {
        return Ok(None);
    };
    Response::decode(&line)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
