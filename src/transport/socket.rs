//! Application-facing ND sockets.
//!
//! An [`NdSocket`] is one end of a connection that carries exactly one
//! message. The connecting side only sends, the accepting side only receives.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::pin::Pin;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

use super::connection::{ConnState, ConnStats, Connection};
use super::stack::StackShared;
use crate::core::constants::READ_CHUNK;
use crate::core::{FlowId, FlowKey, NdError, NdResult, lock};

/// Options for [`NdSocket::send`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    /// Return [`NdError::WouldBlock`] instead of waiting for buffer space.
    pub nonblocking: bool,
    /// More data follows; keep the tail segment open for coalescing.
    pub more: bool,
}

impl SendFlags {
    /// Set the non-blocking flag.
    pub fn nonblocking(mut self) -> Self {
        self.nonblocking = true;
        self
    }

    /// Set the more-data-follows flag.
    pub fn more(mut self) -> Self {
        self.more = true;
        self
    }
}

/// Options for [`NdSocket::recv`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvFlags {
    /// Return [`NdError::WouldBlock`] instead of waiting for data.
    pub nonblocking: bool,
    /// Keep waiting until the full requested length is available.
    pub wait_all: bool,
}

impl RecvFlags {
    /// Set the non-blocking flag.
    pub fn nonblocking(mut self) -> Self {
        self.nonblocking = true;
        self
    }

    /// Set the wait-for-everything flag.
    pub fn wait_all(mut self) -> Self {
        self.wait_all = true;
        self
    }
}

/// One end of an ND connection.
///
/// Dropping the socket closes it: a sender that has handed over the whole
/// message stays registered until the receiver acknowledged it, anything else
/// is aborted and the peer is told with a FIN.
pub struct NdSocket {
    conn: Arc<Connection>,
    stack: Arc<StackShared>,
}

impl NdSocket {
    pub(crate) fn new(conn: Arc<Connection>, stack: Arc<StackShared>) -> Self {
        Self { conn, stack }
    }

    /// Identifier of the underlying connection.
    pub fn flow_id(&self) -> FlowId {
        self.conn.id
    }

    /// Ports and peer of the connection.
    pub fn key(&self) -> FlowKey {
        self.conn.key
    }

    /// Scheduler core the connection is pinned to.
    pub fn core_id(&self) -> usize {
        self.conn.core_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        lock(&self.conn.inner).state
    }

    /// Snapshot of the connection's counters.
    pub fn stats(&self) -> ConnStats {
        let inner = lock(&self.conn.inner);
        let rx = lock(&self.conn.rx);
        self.conn.stats(&inner, &rx)
    }

    /// Queue `data` for transmission.
    ///
    /// Waits for send buffer space unless `flags.nonblocking` is set. Returns
    /// the number of bytes accepted; a wait that ends early after partial
    /// progress reports that progress instead of the error.
    pub async fn send(&self, data: &[u8], flags: SendFlags) -> NdResult<usize> {
        let conn = &self.conn;
        let stack = &self.stack;
        {
            let inner = lock(&conn.inner);
            match inner.state {
                ConnState::Sender => {}
                _ if inner.done => return Err(NdError::BrokenPipe),
                _ => return Err(sticky_error(&inner.error, NdError::NotConnected)),
            }
            if inner.closing {
                return Err(NdError::BrokenPipe);
            }
            let limit = inner.flow.total_length();
            let room = limit as usize - inner.send.accepted();
            if data.len() > room {
                return Err(NdError::MessageTooLong { limit });
            }
        }

        let deadline = stack.config.send_timeout.map(|t| Instant::now() + t);
        let mut copied = 0;
        loop {
            let notified = conn.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = lock(&conn.inner);
                if inner.state != ConnState::Sender {
                    let err = sticky_error(&inner.error, NdError::ConnectionReset);
                    return partial(copied, copied, err);
                }
                if conn.interrupted.swap(false, Ordering::AcqRel) {
                    return partial(copied, copied, NdError::Interrupted);
                }

                let want = data.len() - copied;
                let free = stack.config.sndbuf.saturating_sub(inner.send.wmem_queued());
                let mut room = free.min(want);
                if room > 0 && inner.wmem.charge(room, &stack.pool).is_err() {
                    room = room.min(stack.config.segment_cap);
                    if inner.wmem.charge(room, &stack.pool).is_err() {
                        room = 0;
                    }
                }
                copied += inner.send.append(&data[copied..], room);

                if copied == data.len() {
                    if !flags.more {
                        stack.push_pending(conn, &mut inner);
                    }
                    return Ok(copied);
                }
                stack.push_pending(conn, &mut inner);
                if flags.nonblocking {
                    return partial(copied, copied, NdError::WouldBlock);
                }
                trace!(flow = %conn.id, copied, "send waiting for buffer space");
            }
            if !wait(notified, deadline).await {
                return partial(copied, copied, NdError::TimedOut);
            }
        }
    }

    /// Receive up to `max_len` bytes in sequence order.
    ///
    /// An empty result means the whole message has been consumed.
    pub async fn recv(&self, max_len: usize, flags: RecvFlags) -> NdResult<Vec<u8>> {
        self.read(max_len, flags, false).await.map(|(data, _)| data)
    }

    /// Consume up to `max_len` bytes without copying them out.
    pub async fn discard(&self, max_len: usize, flags: RecvFlags) -> NdResult<usize> {
        self.read(max_len, flags, true).await.map(|(_, consumed)| consumed)
    }

    /// Receive the remainder of the message.
    pub async fn recv_to_end(&self) -> NdResult<Vec<u8>> {
        let mut message = Vec::new();
        loop {
            let chunk = self.recv(READ_CHUNK, RecvFlags::default()).await?;
            if chunk.is_empty() {
                return Ok(message);
            }
            message.extend_from_slice(&chunk);
        }
    }

    async fn read(
        &self,
        max_len: usize,
        flags: RecvFlags,
        discard: bool,
    ) -> NdResult<(Vec<u8>, usize)> {
        let conn = &self.conn;
        let stack = &self.stack;
        let deadline = stack.config.recv_timeout.map(|t| Instant::now() + t);
        let target = if flags.wait_all { max_len } else { max_len.min(1) };
        let mut out = Vec::new();
        let mut consumed = 0;

        loop {
            let notified = conn.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let finished = {
                let mut inner = lock(&conn.inner);
                if inner.done || consumed >= target {
                    return Ok((out, consumed));
                }
                if inner.state != ConnState::Receiver {
                    let err = sticky_error(&inner.error, NdError::NotConnected);
                    return partial((out, consumed), consumed, err);
                }

                let chunk = stack.read_locked(conn, &mut inner, max_len - consumed, discard);
                consumed += chunk.consumed;
                out.extend_from_slice(&chunk.data);

                if inner.done {
                    true
                } else if consumed >= target {
                    return Ok((out, consumed));
                } else if conn.interrupted.swap(false, Ordering::AcqRel) {
                    return partial((out, consumed), consumed, NdError::Interrupted);
                } else if flags.nonblocking {
                    return partial((out, consumed), consumed, NdError::WouldBlock);
                } else {
                    false
                }
            };
            if finished {
                debug!(flow = %conn.id, "message fully consumed");
                stack.teardown(conn, "message consumed");
                return Ok((out, consumed));
            }
            if !wait(notified, deadline).await {
                return partial((out, consumed), consumed, NdError::TimedOut);
            }
        }
    }

    /// Wake any blocked send or receive with [`NdError::Interrupted`].
    pub fn interrupt(&self) {
        self.conn.interrupted.store(true, Ordering::Release);
        self.conn.readable.notify_waiters();
        self.conn.writable.notify_waiters();
    }

    /// Close the socket. Also runs on drop.
    pub fn close(&self) {
        self.stack.close(&self.conn);
    }

    /// Socket options are not supported.
    pub fn set_option(&self, _level: i32, _name: i32, _value: &[u8]) -> NdResult<()> {
        Err(NdError::Unsupported("setsockopt"))
    }

    /// Socket options are not supported.
    pub fn get_option(&self, _level: i32, _name: i32) -> NdResult<Vec<u8>> {
        Err(NdError::Unsupported("getsockopt"))
    }

    /// Device control requests are not supported.
    pub fn ioctl(&self, _request: u64) -> NdResult<i64> {
        Err(NdError::Unsupported("ioctl"))
    }

    /// Readiness polling is not supported; use the async calls.
    pub fn poll_events(&self) -> NdResult<u32> {
        Err(NdError::Unsupported("poll"))
    }
}

impl Drop for NdSocket {
    fn drop(&mut self) {
        self.stack.close(&self.conn);
    }
}

impl std::fmt::Debug for NdSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdSocket")
            .field("flow", &self.conn.id)
            .field("key", &self.conn.key)
            .finish()
    }
}

/// Incoming connections for one local ND port.
pub struct NdListener {
    port: u16,
    incoming: UnboundedReceiver<NdSocket>,
    stack: Arc<StackShared>,
}

impl NdListener {
    pub(crate) fn new(port: u16, incoming: UnboundedReceiver<NdSocket>, stack: Arc<StackShared>) -> Self {
        Self {
            port,
            incoming,
            stack,
        }
    }

    /// Local port this listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next incoming connection.
    #[instrument(skip(self), fields(port = self.port))]
    pub async fn accept(&mut self) -> NdResult<NdSocket> {
        self.incoming.recv().await.ok_or(NdError::NotConnected)
    }
}

impl Drop for NdListener {
    fn drop(&mut self) {
        lock(&self.stack.listeners).remove(&self.port);
    }
}

impl std::fmt::Debug for NdListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdListener").field("port", &self.port).finish()
    }
}

fn sticky_error(recorded: &Option<NdError>, fallback: NdError) -> NdError {
    recorded.as_ref().map(NdError::duplicate).unwrap_or(fallback)
}

/// Report progress if there was any, otherwise the error.
fn partial<T>(value: T, progress: usize, err: NdError) -> NdResult<T> {
    if progress > 0 { Ok(value) } else { Err(err) }
}

/// Wait for a notification; `false` when the deadline passed first.
async fn wait(notified: Pin<&mut Notified<'_>>, deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, notified).await.is_ok(),
        None => {
            notified.await;
            true
        }
    }
}
