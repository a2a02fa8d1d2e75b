//! In-process channel backend: bounded FIFO queues registered under a shared namespace.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use super::{Access, Channel, ChannelAttrs, ChannelError, ChannelFactory, Received, Wait, validate_name};

/// A synchronized, bounded FIFO of fixed-size messages.
pub struct BoundedQueue {
    name: String,
    attrs: ChannelAttrs,
    inner: Mutex<VecDeque<Vec<u8>>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl BoundedQueue {
    fn new(name: &str, attrs: ChannelAttrs) -> Self {
        Self {
            name: name.to_string(),
            attrs,
            inner: Mutex::new(VecDeque::with_capacity(attrs.capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Push a message, waiting while the queue is at capacity.
    fn push_blocking(&self, message: Vec<u8>) {
        let mut guard = self.inner.lock().expect("channel mutex poisoned");
        while guard.len() >= self.attrs.capacity {
            // Wait releases the lock and re-acquires it before returning.
            guard = self.not_full.wait(guard).expect("condvar wait failed");
        }
        guard.push_back(message);
        self.not_empty.notify_one();
    }

    /// Pop the oldest message, waiting as `wait` allows.
    fn pop(&self, wait: Wait) -> Received<Vec<u8>> {
        let mut guard = self.inner.lock().expect("channel mutex poisoned");
        loop {
            if let Some(message) = guard.pop_front() {
                self.not_full.notify_one();
                return Received::Message(message);
            }
            match wait {
                Wait::Never => return Received::WouldBlock,
                Wait::Forever => {
                    guard = self.not_empty.wait(guard).expect("condvar wait failed");
                }
                Wait::Until(deadline) => {
                    // Spurious wakeups loop back with the same absolute deadline.
                    let Some(left) = deadline.remaining() else {
                        return Received::TimedOut;
                    };
                    guard = self
                        .not_empty
                        .wait_timeout(guard, left)
                        .expect("condvar wait failed")
                        .0;
                }
            }
        }
    }

    fn len(&self) -> usize {
        let guard = self.inner.lock().expect("channel mutex poisoned");
        guard.len()
    }
}

/// Handle to a queue in a [`LocalNamespace`], restricted to one direction.
pub struct LocalChannel {
    queue: Arc<BoundedQueue>,
    access: Access,
}

impl LocalChannel {
    fn check(&self, wanted: Access) -> Result<(), ChannelError> {
        if self.access == wanted {
            Ok(())
        } else {
            Err(ChannelError::Access {
                name: self.queue.name.clone(),
                wanted,
            })
        }
    }
}

impl Channel for LocalChannel {
    fn name(&self) -> &str {
        &self.queue.name
    }

    fn attrs(&self) -> ChannelAttrs {
        self.queue.attrs
    }

    fn send_bytes(&self, message: &[u8]) -> Result<(), ChannelError> {
        self.check(Access::Write)?;
        if message.len() > self.queue.attrs.message_size {
            return Err(ChannelError::MessageSize {
                name: self.queue.name.clone(),
                expected: self.queue.attrs.message_size,
                actual: message.len(),
            });
        }
        self.queue.push_blocking(message.to_vec());
        Ok(())
    }

    fn receive_bytes(&self, buf: &mut [u8], wait: Wait) -> Result<Received<usize>, ChannelError> {
        self.check(Access::Read)?;
        if buf.len() < self.queue.attrs.message_size {
            return Err(ChannelError::MessageSize {
                name: self.queue.name.clone(),
                expected: self.queue.attrs.message_size,
                actual: buf.len(),
            });
        }
        Ok(match self.queue.pop(wait) {
            Received::Message(message) => {
                buf[..message.len()].copy_from_slice(&message);
                Received::Message(message.len())
            }
            Received::TimedOut => Received::TimedOut,
            Received::WouldBlock => Received::WouldBlock,
        })
    }

    fn pending(&self) -> Result<usize, ChannelError> {
        Ok(self.queue.len())
    }
}

/// Registry of named in-process queues, shared by cloning.
#[derive(Clone, Default)]
pub struct LocalNamespace {
    queues: Arc<Mutex<HashMap<String, Arc<BoundedQueue>>>>,
}

impl LocalNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn contains(&self, name: &str) -> bool {
        let guard = self.queues.lock().expect("namespace mutex poisoned");
        guard.contains_key(name)
    }
}

impl ChannelFactory for LocalNamespace {
    type Channel = LocalChannel;

    fn create(
        &self,
        name: &str,
        attrs: ChannelAttrs,
        access: Access,
    ) -> Result<LocalChannel, ChannelError> {
        validate_name(name)?;
        let queue = Arc::new(BoundedQueue::new(name, attrs));
        let mut guard = self.queues.lock().expect("namespace mutex poisoned");
        if guard.insert(name.to_string(), Arc::clone(&queue)).is_some() {
            debug!("[QUEUE] replaced stale channel {name}");
        }
        Ok(LocalChannel { queue, access })
    }

    fn open(
        &self,
        name: &str,
        attrs: ChannelAttrs,
        access: Access,
    ) -> Result<LocalChannel, ChannelError> {
        validate_name(name)?;
        let mut guard = self.queues.lock().expect("namespace mutex poisoned");
        let queue = guard
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BoundedQueue::new(name, attrs)));
        if queue.attrs != attrs {
            return Err(ChannelError::AttrsMismatch {
                name: name.to_string(),
                existing: queue.attrs,
                requested: attrs,
            });
        }
        Ok(LocalChannel {
            queue: Arc::clone(queue),
            access,
        })
    }

    fn unlink(&self, name: &str) -> Result<bool, ChannelError> {
        let mut guard = self.queues.lock().expect("namespace mutex poisoned");
        Ok(guard.remove(name).is_some())
    }
}
