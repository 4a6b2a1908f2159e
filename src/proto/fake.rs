use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// In-memory instrument: replays canned replies and records everything written.
pub struct FakeBuffer {
    rx: Vec<u8>,
    pos: usize,
    chunk: usize,
    tx: Arc<Mutex<Vec<u8>>>,
}

impl FakeBuffer {
    pub fn new(rx: Vec<u8>) -> Self {
        Self {
            rx,
            pos: 0,
            chunk: usize::MAX,
            tx: Arc::default(),
        }
    }

    /// Hand out replies in pieces of at most `chunk` bytes.
    pub fn chunked(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    /// Bytes written by the device, shared with the buffer.
    pub fn written(&self) -> Arc<Mutex<Vec<u8>>> {
        self.tx.clone()
    }
}

impl AsyncRead for FakeBuffer {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let remaining = &self.rx[self.pos..];
        let n = remaining.len().min(buf.remaining()).min(self.chunk);
        buf.put_slice(&remaining[..n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for FakeBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.tx.lock() {
            Ok(mut tx) => {
                tx.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            Err(_) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "poisoned"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
