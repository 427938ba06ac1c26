//! Outgoing request bodies.

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt as _;
use pin_project::pin_project;
use tokio::sync::oneshot;
use tokio::time::Sleep;

use crate::BoxError;

/// Resolves once the last frame of an [`Outgoing`] body has been handed to
/// the connection, or the body was dropped.
#[derive(Debug)]
pub(crate) struct Sent(oneshot::Receiver<()>);

impl Future for Sent {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let _ = ready!(Pin::new(&mut self.0).poll(cx));
        Poll::Ready(())
    }
}

/// The body type sent on pooled connections.
///
/// When the request asked for `Expect: 100-continue`, no body frame is
/// released until the expect-continue timeout has passed.
#[derive(Debug)]
#[pin_project]
pub(crate) struct Outgoing {
    #[pin]
    gate: Option<Sleep>,
    inner: UnsyncBoxBody<Bytes, BoxError>,
    sent: Option<oneshot::Sender<()>>,
}

impl Outgoing {
    pub(crate) fn new<B>(body: B, hold: Option<Duration>) -> (Self, Sent)
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let inner = body.map_err(Into::into).boxed_unsync();
        let (tx, rx) = oneshot::channel();

        if inner.is_end_stream() {
            let _ = tx.send(());
            let body = Self {
                gate: None,
                inner,
                sent: None,
            };
            return (body, Sent(rx));
        }

        let body = Self {
            gate: hold.map(tokio::time::sleep),
            inner,
            sent: Some(tx),
        };
        (body, Sent(rx))
    }
}

impl Body for Outgoing {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        if let Some(gate) = this.gate.as_mut().as_pin_mut() {
            ready!(gate.poll(cx));
            tracing::trace!("expect-continue wait over, sending body");
            this.gate.set(None);
        }

        let frame = ready!(Pin::new(&mut *this.inner).poll_frame(cx));
        if frame.is_none() || this.inner.is_end_stream() {
            if let Some(sent) = this.sent.take() {
                tracing::trace!("request body sent");
                let _ = sent.send(());
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
