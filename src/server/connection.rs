use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};

/// An accepted client connection on either transport.
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// Body of a request: whatever follows the head on the connection.
pub type BodyStream = BufReader<ReadHalf<Connection>>;
pub type ConnectionWriter = WriteHalf<Connection>;

impl Connection {
    /// Splits into the buffered body stream and the response writer.
    pub fn into_parts(self) -> (BodyStream, ConnectionWriter) {
        let (read, write) = tokio::io::split(self);
        (BufReader::new(read), write)
    }
}

/// Shuts down the write half, then releases both halves. Failures are ignored.
///
/// The write side goes first so a forked child that inherited the socket does
/// not keep the client waiting for more response bytes.
pub async fn close(body: BodyStream, mut writer: ConnectionWriter) {
    let _ = writer.shutdown().await;
    drop(writer);
    drop(body);
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(inner) => Pin::new(inner).poll_read(cx, buf),
            Connection::Unix(inner) => Pin::new(inner).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    #[inline]
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(inner) => Pin::new(inner).poll_write(cx, buf),
            Connection::Unix(inner) => Pin::new(inner).poll_write(cx, buf),
        }
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(inner) => Pin::new(inner).poll_flush(cx),
            Connection::Unix(inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(inner) => Pin::new(inner).poll_shutdown(cx),
            Connection::Unix(inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}
