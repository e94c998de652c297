//! Connection materializer — turns a dialed connection into an owned socket.
//!
//! The engine takes ownership of the raw descriptor it is handed and closes
//! it on its own schedule. Handing it the descriptor of a live stream object
//! would leave two owners, so the socket is duplicated (`F_DUPFD_CLOEXEC`)
//! and the original stream is closed. Only the duplicate survives.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use thiserror::Error;
use tracing::debug;

/// A connected stream returned by a dial function.
///
/// Implementors backed by an OS socket return its descriptor from
/// [`Connection::socket`]; in-memory transports return `None` and cannot be
/// handed to the engine.
pub trait Connection: Send {
    /// The underlying socket descriptor, if the connection has one.
    fn socket(&self) -> Option<BorrowedFd<'_>>;
}

impl Connection for tokio::net::TcpStream {
    fn socket(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

impl Connection for tokio::net::UnixStream {
    fn socket(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

impl Connection for std::net::TcpStream {
    fn socket(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

impl Connection for std::os::unix::net::UnixStream {
    fn socket(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

impl Connection for tokio::io::DuplexStream {
    fn socket(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn socket(&self) -> Option<BorrowedFd<'_>> {
        (**self).socket()
    }
}

/// Why a connection could not be materialized.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("connection has no OS socket to hand over")]
    UnsupportedConnectionKind,

    #[error("failed to duplicate socket descriptor: {0}")]
    DescriptorDuplicationFailed(#[source] std::io::Error),
}

/// Detach the socket from `conn` and return an independently owned copy.
///
/// `conn` is consumed and closed on every path, success or failure.
pub fn materialize<C>(conn: C) -> Result<OwnedFd, MaterializeError>
where
    C: Connection,
{
    let duplicated = match conn.socket() {
        Some(fd) => fd
            .try_clone_to_owned()
            .map_err(MaterializeError::DescriptorDuplicationFailed),
        None => Err(MaterializeError::UnsupportedConnectionKind),
    };
    drop(conn);

    if let Ok(fd) = &duplicated {
        debug!(?fd, "materialized connection");
    }
    duplicated
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked {
        inner: Option<TcpStream>,
        drops: Arc<AtomicUsize>,
    }

    impl Connection for Tracked {
        fn socket(&self) -> Option<BorrowedFd<'_>> {
            self.inner.as_ref().map(|s| s.as_fd())
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn duplicate_outlives_original() {
        let (client, mut server) = pair();
        let fd = materialize(client).unwrap();

        // The original stream is gone; the duplicate still carries the socket.
        let mut dup = TcpStream::from(fd);
        dup.write_all(b"ping").unwrap();

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn in_memory_connection_is_unsupported() {
        let (a, _b) = tokio::io::duplex(64);
        let err = materialize(a).unwrap_err();
        assert!(matches!(err, MaterializeError::UnsupportedConnectionKind));
    }

    #[test]
    fn unsupported_connection_is_still_closed() {
        let drops = Arc::new(AtomicUsize::new(0));
        let conn = Tracked {
            inner: None,
            drops: Arc::clone(&drops),
        };

        assert!(materialize(conn).is_err());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn successful_materialize_closes_original() {
        let (client, _server) = pair();
        let drops = Arc::new(AtomicUsize::new(0));
        let conn = Tracked {
            inner: Some(client),
            drops: Arc::clone(&drops),
        };

        let _fd = materialize(conn).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn boxed_connection_delegates() {
        let (client, _server) = pair();
        let boxed: Box<dyn Connection> = Box::new(client);
        assert!(boxed.socket().is_some());
        assert!(materialize(boxed).is_ok());
    }

    #[tokio::test]
    async fn tokio_stream_materializes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let fd = materialize(client).unwrap();
        let dup = TcpStream::from(fd);
        dup.set_nonblocking(false).unwrap();
        (&dup).write_all(b"hi").unwrap();

        let mut buf = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
