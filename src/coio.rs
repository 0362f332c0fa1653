//! Cooperative input/output.
//!
//! [`Stream`] wraps a non-blocking file descriptor so that synchronous-
//! looking reads and writes suspend the calling fiber instead of spinning on
//! `EAGAIN`: the operation is attempted once, and if the kernel has nothing
//! to offer the fiber parks itself in the reactor until the descriptor
//! becomes ready, then retries.
//!
//! The stream is single-owner. Closing happens unconditionally on drop; a
//! concurrent registration left in the reactor by another fiber is the
//! caller's problem, exactly like handing a raw fd to two owners would be.
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use strand::coio::Stream;
//!
//! let rt = strand::Runtime::new();
//! rt.work(|h| {
//!     let (mut rx, mut tx) = Stream::pipe(h).unwrap();
//!     h.spawn(move |_| {
//!         tx.write_all(b"ping").unwrap();
//!     })
//!     .unwrap();
//!     let mut buf = [0; 4];
//!     rx.read_exact(&mut buf).unwrap(); // suspends until the writer runs
//!     assert_eq!(&buf, b"ping");
//! })
//! .unwrap();
//! ```

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::mem::ManuallyDrop;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use log::trace;

use crate::error::Result;
use crate::reactor;
use crate::runtime::Handle;

pub use crate::reactor::IoFlags;

/// Suspend the current fiber until `fd` reports one of the `interest`
/// events. Returns the observed event mask; a mask containing
/// [`IoFlags::ERROR`] means the descriptor is in an error state.
#[inline]
pub fn wait(handle: &Handle, fd: RawFd, interest: IoFlags) -> Result<IoFlags> {
    reactor::wait(handle.inner(), fd, interest)
}

/// Error produced when the reactor reports an error condition instead of
/// readiness.
#[inline]
fn fd_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "error condition reported on fd")
}

////////////////////////////////////////////////////////////////////////////////
// Stream
////////////////////////////////////////////////////////////////////////////////

/// A non-blocking file descriptor bridged to the reactor.
pub struct Stream {
    handle: Handle,
    fd: RawFd,
}

impl Stream {
    /// Take ownership of an fd-like object and switch it to non-blocking
    /// mode.
    pub fn new<T>(handle: &Handle, inner: T) -> io::Result<Stream>
    where
        T: IntoRawFd,
    {
        Self::from_fd(handle, inner.into_raw_fd())
    }

    /// Open a TCP connection and wrap it.
    pub fn connect<A: ToSocketAddrs>(handle: &Handle, addr: A) -> io::Result<Stream> {
        let inner = TcpStream::connect(addr)?;
        Self::new(handle, inner)
    }

    /// A non-blocking pipe pair: `(read end, write end)`.
    pub fn pipe(handle: &Handle) -> io::Result<(Stream, Stream)> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let rx = Self::from_fd(handle, fds[0]).map_err(|e| {
            unsafe { libc::close(fds[1]) };
            e
        })?;
        let tx = Self::from_fd(handle, fds[1])?;
        Ok((rx, tx))
    }

    fn from_fd(handle: &Handle, fd: RawFd) -> io::Result<Stream> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Stream {
            handle: handle.clone(),
            fd,
        })
    }

    /// Suspend until this stream reports one of the `interest` events.
    #[inline]
    pub fn wait(&self, interest: IoFlags) -> Result<IoFlags> {
        wait(&self.handle, self.fd, interest)
    }

    /// Pull some bytes from the stream. Suspends the calling fiber while
    /// the descriptor has nothing to read; returns 0 at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.suspending(IoFlags::READ, |fd| unsafe {
            libc::read(fd, buf.as_mut_ptr().cast(), buf.len())
        })
    }

    /// Write a buffer into the stream. Suspends the calling fiber while the
    /// descriptor cannot accept more data.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.suspending(IoFlags::WRITE, |fd| unsafe {
            libc::write(fd, buf.as_ptr().cast(), buf.len())
        })
    }

    /// Vectored [`read`](Self::read).
    pub fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        // IoSliceMut is ABI-compatible with iovec on unix.
        self.suspending(IoFlags::READ, |fd| unsafe {
            libc::readv(fd, bufs.as_mut_ptr().cast(), bufs.len() as libc::c_int)
        })
    }

    /// Vectored [`write`](Self::write).
    pub fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.suspending(IoFlags::WRITE, |fd| unsafe {
            libc::writev(fd, bufs.as_ptr().cast(), bufs.len() as libc::c_int)
        })
    }

    /// The suspend-on-EAGAIN protocol shared by all transfer directions:
    /// attempt, wait for readiness if the kernel pushes back, attempt once
    /// more and report whatever comes out.
    fn suspending(
        &self,
        interest: IoFlags,
        mut op: impl FnMut(RawFd) -> isize,
    ) -> io::Result<usize> {
        let result = op(self.fd);
        if result >= 0 {
            return Ok(result as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }

        trace!("fd {} would block, suspending", self.fd);
        let events = self.wait(interest).map_err(io::Error::from)?;
        if events.contains(IoFlags::ERROR) {
            return Err(fd_error());
        }

        let result = op(self.fd);
        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(result as usize)
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for Stream {
    fn into_raw_fd(self) -> RawFd {
        let mut this = ManuallyDrop::new(self);
        let fd = this.fd;
        // Skip close, but do release the runtime handle.
        unsafe { std::ptr::drop_in_place(&mut this.handle) };
        fd
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(self, buf)
    }

    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        Stream::read_vectored(self, bufs)
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(self, buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        Stream::write_vectored(self, bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
