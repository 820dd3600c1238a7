use crate::proxy::context::{BoxBody, BoxError};
use bytes::Bytes;
use hyper::body::{Body, Frame};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Enforces an idle timeout between body frames: the deadline re-arms on
/// every frame, so a slow-but-moving stream survives while a stalled one is
/// cut with a timeout error.
pub struct IdleTimeoutBody {
    inner: BoxBody,
    timeout: Duration,
    sleep: Pin<Box<tokio::time::Sleep>>,
    timed_out: bool,
}

impl IdleTimeoutBody {
    pub fn new(inner: BoxBody, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
            timed_out: false,
        }
    }

    pub fn boxed(inner: BoxBody, timeout: Duration) -> BoxBody {
        use http_body_util::BodyExt;
        Self::new(inner, timeout).boxed()
    }
}

impl Body for IdleTimeoutBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.timed_out {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_frame(cx) {
            Poll::Ready(frame) => {
                let deadline = tokio::time::Instant::now() + self.timeout;
                self.sleep.as_mut().reset(deadline);
                Poll::Ready(frame)
            }
            Poll::Pending => {
                if self.sleep.as_mut().poll(cx).is_ready() {
                    self.timed_out = true;
                    let err: BoxError = Box::new(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "body idle timeout",
                    ));
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, StreamBody};

    fn streaming_body<S>(stream: S) -> BoxBody
    where
        S: futures_util::Stream<Item = Result<Frame<Bytes>, BoxError>> + Send + Sync + 'static,
    {
        BodyExt::boxed(StreamBody::new(stream))
    }

    #[tokio::test]
    async fn test_moving_stream_survives() {
        let stream = futures_util::stream::unfold(0u32, |n| async move {
            if n >= 3 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            Some((Ok(Frame::data(Bytes::from_static(b"chunk"))), n + 1))
        });
        let body = IdleTimeoutBody::boxed(streaming_body(stream), Duration::from_millis(100));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"chunkchunkchunk");
    }

    #[tokio::test]
    async fn test_stalled_stream_times_out() {
        let stream = futures_util::stream::unfold(0u32, |n| async move {
            if n == 0 {
                return Some((Ok(Frame::data(Bytes::from_static(b"first"))), 1));
            }
            // Stall forever.
            std::future::pending::<()>().await;
            None
        });
        let body = IdleTimeoutBody::boxed(streaming_body(stream), Duration::from_millis(30));
        let err = body.collect().await.unwrap_err();
        let io = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_empty_body_passes() {
        let body = IdleTimeoutBody::boxed(
            crate::proxy::context::empty_body(),
            Duration::from_millis(50),
        );
        let collected = body.collect().await.unwrap().to_bytes();
        assert!(collected.is_empty());
    }
}
