//! HTTP/2 client connections to an agent, pooled per session.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http2::{self, SendRequest};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::task::JoinHandle;
use tracing::debug;
use tunnel_pool::{PoolWaker, Poolable};
use wormhole_core::Stream;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Tunnel {
    id: u64,
    sender: SendRequest<ProxyBody>,
    streams: AtomicUsize,
    soft_cap: usize,
    /// Set when a checkout pushes `streams` past `soft_cap`. A retiring
    /// tunnel takes no new work and is deleted once it drains.
    retiring: AtomicBool,
    closed: AtomicBool,
    driver: JoinHandle<()>,
    waker: PoolWaker,
}

impl Tunnel {
    /// Runs the HTTP/2 client handshake over an agent connection whose TLS
    /// session negotiated `h2`. `waker` is poked whenever a stream finishes.
    pub async fn handshake<IO: Stream>(
        id: u64,
        io: IO,
        soft_cap: usize,
        waker: PoolWaker,
    ) -> Result<Arc<Self>, hyper::Error> {
        let (sender, conn) = http2::Builder::new(TokioExecutor::new())
            .timer(TokioTimer::new())
            .keep_alive_interval(KEEP_ALIVE_INTERVAL)
            .keep_alive_timeout(KEEP_ALIVE_TIMEOUT)
            .handshake(TokioIo::new(io))
            .await?;
        let driver = tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(tunnel_id = id, error = %err, "tunnel connection ended");
            }
        });
        Ok(Arc::new(Self {
            id,
            sender,
            streams: AtomicUsize::new(0),
            soft_cap,
            retiring: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            driver,
            waker,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Round trips currently in flight.
    pub fn streams(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.sender.is_closed() && !self.driver.is_finished()
    }

    /// Sends `req` to the agent. The stream stays counted until the response
    /// body has been fully read or dropped.
    pub async fn round_trip(
        self: &Arc<Self>,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        let guard = StreamGuard::new(Arc::clone(self));
        let mut sender = self.sender.clone();
        sender.ready().await?;
        let response = sender.send_request(req).await?;
        Ok(response.map(|body| {
            TrackedBody {
                inner: body,
                guard: Some(guard),
            }
            .boxed()
        }))
    }
}

impl Poolable for Tunnel {
    fn should_queue(&self) -> bool {
        self.is_open() && !self.retiring.load(Ordering::SeqCst) && self.streams() < self.soft_cap
    }

    fn should_delete(&self) -> bool {
        !self.is_open() || (self.retiring.load(Ordering::SeqCst) && self.streams() == 0)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(tunnel_id = self.id, "closing tunnel");
            self.driver.abort();
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

struct StreamGuard {
    tunnel: Arc<Tunnel>,
}

impl StreamGuard {
    fn new(tunnel: Arc<Tunnel>) -> Self {
        let streams = tunnel.streams.fetch_add(1, Ordering::SeqCst) + 1;
        if streams > tunnel.soft_cap && !tunnel.retiring.swap(true, Ordering::SeqCst) {
            debug!(tunnel_id = tunnel.id, streams, "tunnel over its stream cap, retiring");
        }
        Self { tunnel }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.tunnel.streams.fetch_sub(1, Ordering::SeqCst);
        self.tunnel.waker.wake();
    }
}

/// Response body that releases its stream slot once finished.
struct TrackedBody {
    inner: Incoming,
    guard: Option<StreamGuard>,
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.guard.take();
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use http_body_util::{Empty, Full};
    use hyper::service::service_fn;
    use tokio::time::{sleep, timeout};
    use tunnel_pool::{Pool, PoolConfig};

    /// A tunnel whose agent end answers every request with `test`.
    async fn connected(soft_cap: usize, waker: PoolWaker) -> Arc<Tunnel> {
        let (server_io, agent_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let service = service_fn(|_req| async {
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"test"))))
            });
            let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(agent_io), service)
                .await;
        });
        Tunnel::handshake(1, server_io, soft_cap, waker).await.unwrap()
    }

    fn request() -> Request<ProxyBody> {
        Request::builder()
            .uri("http://agent.test/")
            .body(Empty::new().map_err(|never| match never {}).boxed())
            .unwrap()
    }

    #[tokio::test]
    async fn stream_is_counted_until_the_body_is_done() {
        let tunnel = connected(2, PoolWaker::default()).await;
        assert_eq!(tunnel.streams(), 0);

        let response = tunnel.round_trip(request()).await.unwrap();
        assert_eq!(tunnel.streams(), 1);
        assert!(tunnel.should_queue());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"test");
        assert_eq!(tunnel.streams(), 0);

        let response = tunnel.round_trip(request()).await.unwrap();
        assert_eq!(tunnel.streams(), 1);
        drop(response);
        assert_eq!(tunnel.streams(), 0);
        assert!(tunnel.should_queue());
        assert!(!tunnel.should_delete());
    }

    #[tokio::test]
    async fn full_tunnel_leaves_the_queue_and_retires_past_its_cap() {
        let tunnel = connected(1, PoolWaker::default()).await;

        let first = tunnel.round_trip(request()).await.unwrap();
        assert_eq!(tunnel.streams(), 1);
        assert!(!tunnel.should_queue());
        assert!(!tunnel.should_delete());

        let second = tunnel.round_trip(request()).await.unwrap();
        assert_eq!(tunnel.streams(), 2);
        assert!(!tunnel.should_queue());
        assert!(!tunnel.should_delete());

        drop(first);
        assert!(!tunnel.should_delete());
        drop(second);
        assert_eq!(tunnel.streams(), 0);
        assert!(!tunnel.should_queue());
        assert!(tunnel.should_delete());
    }

    #[tokio::test]
    async fn finished_stream_releases_a_parked_get() {
        let pool = Arc::new(Pool::new(
            PoolConfig::new(1).with_sweep_interval(Duration::from_secs(60)),
        ));
        let tunnel = connected(1, pool.waker()).await;
        pool.insert(Arc::clone(&tunnel)).unwrap();

        let handle = timeout(Duration::from_secs(1), pool.get()).await.unwrap().unwrap();
        let response = handle.object().round_trip(request()).await.unwrap();
        handle.done();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get().await.map(|handle| handle.id()) })
        };
        sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(response);
        let id = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap();
        assert_eq!(id, 1);
    }
}
