//! First-record write splitting.
//!
//! [`FragmentStream`] wraps a freshly opened TCP connection and clamps the
//! very first write to a byte budget, so the first outbound TLS record (the
//! ClientHello) leaves the socket as two segments. The TLS layer retries
//! with the remainder, which passes through untouched, as does everything
//! after it. A budget of 0 disables the behavior entirely.
//!
//! The split must happen before handshake completion and only on the first
//! flight; clamping the first `poll_write` on the connection the handshake
//! runs over guarantees both.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct FragmentStream<S> {
    inner: S,
    first_budget: Option<usize>,
}

impl<S> FragmentStream<S> {
    pub fn new(inner: S, first_fragment_len: u8) -> Self {
        Self {
            inner,
            first_budget: (first_fragment_len > 0).then_some(first_fragment_len as usize),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.first_budget.take() {
            Some(budget) if buf.len() > budget => {
                match Pin::new(&mut this.inner).poll_write(cx, &buf[..budget]) {
                    Poll::Pending => {
                        // Nothing went out; the next call is still the first.
                        this.first_budget = Some(budget);
                        Poll::Pending
                    }
                    ready => ready,
                }
            }
            _ => Pin::new(&mut this.inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    // The default poll_write_vectored funnels through poll_write, which is
    // required for the budget to apply to vectored writers as well.
    fn is_write_vectored(&self) -> bool {
        false
    }
}
