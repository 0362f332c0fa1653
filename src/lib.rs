//! Cooperative fiber runtime for Rust.
//!
//! The crate multiplexes lightweight stackful fibers onto one OS thread:
//! a round-robin [scheduler] drives the fibers, a [reactor] suspends them
//! on non-blocking file descriptors and resumes them when the kernel
//! reports readiness, and synchronization primitives compose with the
//! suspend/resume protocol. The building blocks:
//!
//! - [Runtime lifecycle: init, work, stop](runtime)
//! - [Fibers, fiber attributes, conditional variables, latches](fiber)
//! - [Cooperative I/O](coio)
//! - [Arena allocator](arena) for per-request lifetimes
//! - [Intrusive doubly-linked list](list) backing every runtime queue
//! - [Logging](mod@log) (see <https://docs.rs/log/>)
//! - [Error handling](error)
//!
//! A fiber runs until it performs an operation that would block; it then
//! registers with the reactor, surrenders the CPU back to the scheduler and
//! resumes with its stack intact once the descriptor is ready. Exactly one
//! fiber runs at any instant, so between suspension points fibers access
//! shared state without locks or atomics; the runtime is correspondingly
//! not safe to drive from multiple OS threads.
//!
//! ```
//! use std::io::{Read, Write};
//! use std::rc::Rc;
//! use std::cell::Cell;
//! use strand::coio::Stream;
//!
//! let rt = strand::Runtime::new();
//! let received = Rc::new(Cell::new(0));
//! let total = received.clone();
//! rt.work(move |h| {
//!     let (mut rx, mut tx) = Stream::pipe(h).unwrap();
//!     h.spawn(move |_| {
//!         tx.write_all(b"ping").unwrap();
//!     })
//!     .unwrap();
//!     let mut buf = [0; 4];
//!     // The first read hits EAGAIN and parks this fiber in the reactor
//!     // until the writer has run.
//!     rx.read_exact(&mut buf).unwrap();
//!     received.set(buf.len());
//! })
//! .unwrap();
//! assert_eq!(total.get(), 4);
//! ```
//!
//! [scheduler]: crate::runtime::Runtime::work
//! [reactor]: crate::coio

pub mod arena;
pub mod coio;
pub mod error;
pub mod fiber;
pub mod list;
pub mod log;
pub mod runtime;

mod context;
mod reactor;
mod sched;
mod stack;

pub use error::{Error, Result};
pub use runtime::{Handle, Runtime};

pub type StdResult<T, E> = std::result::Result<T, E>;
