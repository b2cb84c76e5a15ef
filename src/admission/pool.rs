//! Shared pool of write buffers.
//!
//! Outbound events are serialised into a pooled buffer, copied out once as an
//! immutable frame, and the scratch buffer goes back to the pool. Buffers
//! that grew far past the configured size are dropped instead of returned.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Buffers bigger than this multiple of the configured size are not pooled.
const MAX_GROWTH: usize = 4;

#[derive(Debug)]
pub struct BufferPool {
    idle: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            buffer_size,
            max_idle,
        })
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Serialise `value` as JSON into a pooled buffer and return it as a frame.
    pub fn encode_json<T: Serialize>(self: &Arc<Self>, value: &T) -> Result<Bytes, serde_json::Error> {
        let mut buf = self.acquire();
        serde_json::to_writer(bytes::BufMut::writer(&mut *buf), value)?;
        Ok(Bytes::copy_from_slice(&buf))
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > self.buffer_size * MAX_GROWTH {
            return;
        }
        buf.clear();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`]; returned on drop.
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}
