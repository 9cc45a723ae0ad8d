//! Client identification capture
//!
//! russh consumes the client's `SSH-2.0-...` line without exposing it, so
//! the raw stream is wrapped and the line recorded on the way through.

use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::context::Context;

/// RFC 4253 caps the identification line at 255 bytes; lines before it
/// may be longer, so allow some slack before giving up.
const MAX_PREAMBLE: usize = 8 * 1024;

pub(crate) struct VersionSniffer<S> {
    inner: S,
    ctx: Context,
    line: Vec<u8>,
    seen: usize,
    done: bool,
}

impl<S> VersionSniffer<S> {
    pub(crate) fn new(inner: S, ctx: Context) -> Self {
        Self {
            inner,
            ctx,
            line: Vec::new(),
            seen: 0,
            done: false,
        }
    }

    fn observe(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.done {
                return;
            }
            self.seen += 1;
            if b != b'\n' {
                self.line.push(b);
            } else {
                let line = String::from_utf8_lossy(&self.line);
                let line = line.trim_end_matches('\r');
                if line.starts_with("SSH-") {
                    self.ctx.set_client_version(line);
                    self.done = true;
                }
                self.line.clear();
            }
            if self.seen >= MAX_PREAMBLE {
                self.done = true;
            }
        }
        if self.done {
            self.line = Vec::new();
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for VersionSniffer<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if !this.done {
            if let Poll::Ready(Ok(())) = poll {
                let fresh = buf.filled()[before..].to_vec();
                this.observe(&fresh);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for VersionSniffer<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
