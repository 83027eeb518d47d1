//! Bounded inbound chunk queue shared by the read loop and the caller.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::AudioChunk;

/// Ordered, bounded queue of inbound audio.
///
/// When full, the oldest chunk is dropped to make room: stale audio is worth
/// less than fresh audio. Closing wakes every waiting consumer; chunks already
/// queued can still be drained until [`AudioBuffer::clear`] is called.
pub struct AudioBuffer {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

struct Inner {
    queue: VecDeque<AudioChunk>,
    closed: bool,
    dropped: u64,
}

impl AudioBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity.min(64)),
                closed: true,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept chunks again, discarding anything left from a previous call.
    pub fn reopen(&self) {
        let mut inner = self.lock();
        inner.queue.clear();
        inner.closed = false;
        inner.dropped = 0;
    }

    /// Stop accepting chunks and release every waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.lock().queue.clear();
    }

    /// Queue a chunk. Returns false once the buffer is closed.
    pub fn push(&self, chunk: AudioChunk) -> bool {
        {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            if inner.queue.len() >= self.capacity {
                inner.queue.pop_front();
                inner.dropped += 1;
                log::debug!(
                    "Audio buffer full ({}), dropped oldest chunk ({} total)",
                    self.capacity,
                    inner.dropped
                );
            }
            inner.queue.push_back(chunk);
        }
        self.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<AudioChunk> {
        self.lock().queue.pop_front()
    }

    /// Wait for the next chunk.
    ///
    /// `None` waits indefinitely, a zero timeout polls once. Returns `None`
    /// on timeout, or when the buffer is closed and empty.
    pub async fn pop(&self, timeout: Option<Duration>) -> Option<AudioChunk> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // 先登记等待，再检查队列，避免错过 push 的通知
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(chunk) = inner.queue.pop_front() {
                    return Some(chunk);
                }
                if inner.closed {
                    return None;
                }
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_pop();
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}
