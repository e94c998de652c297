//! Dial functions — application-supplied outbound connection logic.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::conn::Connection;

/// Default bound on a single dial attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Boxed future returned by a [`DialFunc`].
pub type DialFuture = Pin<Box<dyn Future<Output = io::Result<Box<dyn Connection>>> + Send>>;

/// Establishes a connection to a peer address before the context deadline.
pub type DialFunc = Arc<dyn Fn(DialContext, String) -> DialFuture + Send + Sync>;

/// Deadline handed to every dial attempt.
///
/// The bridge also enforces the deadline from the outside by dropping the
/// dial future, so honoring it is about returning a useful error rather than
/// about correctness.
#[derive(Debug, Clone, Copy)]
pub struct DialContext {
    deadline: Instant,
}

impl DialContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline (zero once it has passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Wrap an async closure as a [`DialFunc`].
pub fn dial_fn<F, Fut, C>(f: F) -> DialFunc
where
    F: Fn(DialContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<C>> + Send + 'static,
    C: Connection + 'static,
{
    Arc::new(move |ctx: DialContext, address: String| -> DialFuture {
        let fut = f(ctx, address);
        Box::pin(async move {
            let conn = fut.await?;
            Ok(Box::new(conn) as Box<dyn Connection>)
        })
    })
}

/// Plain TCP dialer.
pub fn tcp_dialer() -> DialFunc {
    dial_fn(|ctx: DialContext, address: String| async move {
        let stream = tokio::time::timeout_at(ctx.deadline(), tokio::net::TcpStream::connect(&address))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, format!("dial {address}: deadline exceeded"))
            })??;
        stream.set_nodelay(true)?;
        debug!(%address, "dialed peer");
        Ok::<_, io::Error>(stream)
    })
}
