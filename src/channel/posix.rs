//! Kernel message-queue backend (`mq_overview(7)`), shared between processes by name.

use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr;
use std::time::UNIX_EPOCH;

use log::{debug, warn};

use super::{Access, Channel, ChannelAttrs, ChannelError, ChannelFactory, Deadline, Received, Wait, validate_name};

const QUEUE_MODE: libc::mode_t = 0o600;

/// An open message-queue descriptor; closed on drop.
pub struct MessageQueue {
    mqd: libc::mqd_t,
    name: String,
    attrs: ChannelAttrs,
}

/// Opens queues in the host's message-queue namespace.
#[derive(Clone, Copy, Debug, Default)]
pub struct PosixFactory;

fn c_name(name: &str) -> Result<CString, ChannelError> {
    validate_name(name)?;
    CString::new(name).map_err(|_| ChannelError::InvalidName(name.to_string()))
}

fn to_timespec(deadline: Deadline) -> libc::timespec {
    let since_epoch = deadline
        .instant()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    ts.tv_sec = since_epoch.as_secs() as libc::time_t;
    ts.tv_nsec = since_epoch.subsec_nanos() as _;
    ts
}

fn query_attrs(mqd: libc::mqd_t) -> io::Result<libc::mq_attr> {
    let mut attr: libc::mq_attr = unsafe { mem::zeroed() };
    let rc = unsafe { libc::mq_getattr(mqd, &mut attr) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(attr)
}

fn open_queue(
    name: &str,
    attrs: ChannelAttrs,
    access: Access,
    exclusive: bool,
) -> Result<MessageQueue, ChannelError> {
    let path = c_name(name)?;
    let mut attr: libc::mq_attr = unsafe { mem::zeroed() };
    attr.mq_maxmsg = attrs.capacity as _;
    attr.mq_msgsize = attrs.message_size as _;

    let mut oflag = libc::O_CREAT;
    oflag |= match access {
        Access::Read => libc::O_RDONLY,
        Access::Write => libc::O_WRONLY,
    };
    if exclusive {
        oflag |= libc::O_EXCL;
    }

    let mqd = unsafe {
        libc::mq_open(
            path.as_ptr(),
            oflag,
            QUEUE_MODE as libc::c_uint,
            &mut attr as *mut libc::mq_attr,
        )
    };
    if mqd < 0 {
        return Err(ChannelError::Open {
            name: name.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    let queue = MessageQueue {
        mqd,
        name: name.to_string(),
        attrs,
    };

    // An existing queue keeps the attributes its creator chose.
    let actual = query_attrs(mqd).map_err(|source| ChannelError::Open {
        name: name.to_string(),
        source,
    })?;
    let existing = ChannelAttrs {
        capacity: actual.mq_maxmsg as usize,
        message_size: actual.mq_msgsize as usize,
    };
    if existing != attrs {
        return Err(ChannelError::AttrsMismatch {
            name: name.to_string(),
            existing,
            requested: attrs,
        });
    }
    Ok(queue)
}

impl ChannelFactory for PosixFactory {
    type Channel = MessageQueue;

    fn create(
        &self,
        name: &str,
        attrs: ChannelAttrs,
        access: Access,
    ) -> Result<MessageQueue, ChannelError> {
        if self.unlink(name)? {
            debug!("[QUEUE] removed stale queue {name}");
        }
        open_queue(name, attrs, access, true)
    }

    fn open(
        &self,
        name: &str,
        attrs: ChannelAttrs,
        access: Access,
    ) -> Result<MessageQueue, ChannelError> {
        open_queue(name, attrs, access, false)
    }

    fn unlink(&self, name: &str) -> Result<bool, ChannelError> {
        let path = c_name(name)?;
        let rc = unsafe { libc::mq_unlink(path.as_ptr()) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::NotFound {
            Ok(false)
        } else {
            Err(ChannelError::Unlink {
                name: name.to_string(),
                source: err,
            })
        }
    }
}

impl MessageQueue {
    fn receive_error(&self, source: io::Error) -> ChannelError {
        ChannelError::Receive {
            name: self.name.clone(),
            source,
        }
    }
}

impl Channel for MessageQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn attrs(&self) -> ChannelAttrs {
        self.attrs
    }

    fn send_bytes(&self, message: &[u8]) -> Result<(), ChannelError> {
        loop {
            let rc = unsafe {
                libc::mq_send(
                    self.mqd,
                    message.as_ptr() as *const libc::c_char,
                    message.len(),
                    0,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(ChannelError::Send {
                    name: self.name.clone(),
                    source: err,
                });
            }
        }
    }

    fn receive_bytes(&self, buf: &mut [u8], wait: Wait) -> Result<Received<usize>, ChannelError> {
        // A deadline already in the past makes the kernel report ETIMEDOUT without sleeping,
        // which turns a timed receive into a non-blocking poll on a blocking descriptor.
        let timeout = match wait {
            Wait::Forever => None,
            Wait::Until(deadline) => Some(to_timespec(deadline)),
            Wait::Never => Some(to_timespec(Deadline::at(UNIX_EPOCH))),
        };
        loop {
            let received = unsafe {
                match &timeout {
                    None => libc::mq_receive(
                        self.mqd,
                        buf.as_mut_ptr() as *mut libc::c_char,
                        buf.len(),
                        ptr::null_mut(),
                    ),
                    Some(ts) => libc::mq_timedreceive(
                        self.mqd,
                        buf.as_mut_ptr() as *mut libc::c_char,
                        buf.len(),
                        ptr::null_mut(),
                        ts,
                    ),
                }
            };
            if received >= 0 {
                return Ok(Received::Message(received as usize));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // Interrupted waits resume with the same absolute deadline.
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) if matches!(wait, Wait::Never) => {
                    return Ok(Received::WouldBlock);
                }
                Some(libc::ETIMEDOUT) => return Ok(Received::TimedOut),
                Some(libc::EAGAIN) => return Ok(Received::WouldBlock),
                _ => return Err(self.receive_error(err)),
            }
        }
    }

    fn pending(&self) -> Result<usize, ChannelError> {
        let attr = query_attrs(self.mqd).map_err(|err| self.receive_error(err))?;
        Ok(attr.mq_curmsgs as usize)
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        let rc = unsafe { libc::mq_close(self.mqd) };
        if rc < 0 {
            warn!(
                "[QUEUE] close of {} failed: {}",
                self.name,
                io::Error::last_os_error()
            );
        }
    }
}
