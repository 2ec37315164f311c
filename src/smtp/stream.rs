//! A trait-object-friendly bound combining the halves of a bidirectional
//! async stream, so the per-connection handler can treat a plain `TcpStream`
//! and a `STARTTLS`-upgraded `TlsStream<TcpStream>` identically once the
//! upgrade has happened.

use tokio::io::{AsyncRead, AsyncWrite};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;
