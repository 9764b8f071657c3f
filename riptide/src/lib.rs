//! riptide — an io_uring-backed asynchronous I/O event loop for sockets.
//!
//! A single thread owns a kernel-shared submission/completion ring and
//! drives many socket channels over it: accepts, connects, reads, writes,
//! polls and timeouts are all multiplexed through one `io_uring_enter`
//! call per iteration. Completions route themselves — every SQE carries a
//! 64-bit tag encoding `{fd, op, poll mask}` — and other threads reach the
//! loop only through a multi-producer task queue paired with an eventfd
//! wake-up.
//!
//! Channel state machines, buffer pooling and protocol handling live with
//! the embedder; riptide dispatches completions to anything implementing
//! [`Channel`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use riptide::{Config, RiptideBuilder};
//!
//! fn main() -> Result<(), riptide::Error> {
//!     let (shutdown, workers) = RiptideBuilder::new(Config::default()).launch()?;
//!
//!     workers[0].handle().execute(|ctx| {
//!         // Runs on the loop thread: register channels, queue SQEs,
//!         // schedule deadline tasks.
//!         ctx.schedule(std::time::Duration::from_secs(1), |_| {
//!             tracing::info!("one second later");
//!         });
//!     });
//!
//!     shutdown.shutdown();
//!     for worker in workers {
//!         worker.join().unwrap()?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux 5.6+ only: requires io_uring with READ/WRITE, ACCEPT, CONNECT,
//! POLL_ADD/POLL_REMOVE, TIMEOUT/TIMEOUT_REMOVE and ASYNC_CANCEL.

pub mod channel;
pub mod completion;
pub mod config;
pub mod counter;
pub mod error;
pub mod event_loop;
pub mod fixed;
pub mod metrics;
pub mod ring;
pub mod submission;
pub mod sys;
pub(crate) mod tasks;
pub(crate) mod wakeup;
pub mod worker;

pub use channel::{Channel, ChannelMap, ChannelRef};
pub use completion::{CompletionQueue, UserData};
pub use config::{Config, WorkerConfig};
pub use error::Error;
pub use event_loop::{EventLoop, LoopCtx, LoopHandle};
pub use fixed::{BufferRegion, FixedBufferTable};
pub use ring::RingBuffer;
pub use submission::{SubmissionQueue, SubmitCallback};
pub use tasks::Task;
pub use worker::{RiptideBuilder, ShutdownHandle, Worker};
