//! Thread launch for one or more event loops.
//!
//! Each worker thread owns one [`EventLoop`]; the builder pre-creates the
//! cross-thread pieces (eventfd, task channel, wake-up state) so handles
//! are available before the loops start.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::config::Config;
use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys;
use crate::wakeup::WakeupState;

/// A launched event-loop thread.
pub struct Worker {
    handle: LoopHandle,
    join: thread::JoinHandle<Result<(), Error>>,
}

impl Worker {
    /// Handle to this worker's loop.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Wait for the loop to exit.
    pub fn join(self) -> thread::Result<Result<(), Error>> {
        self.join.join()
    }
}

/// Handle returned by [`RiptideBuilder::launch`] to trigger graceful
/// shutdown of all workers.
pub struct ShutdownHandle {
    shutdown_flag: Arc<AtomicBool>,
    wakeups: Vec<Arc<WakeupState>>,
}

impl ShutdownHandle {
    /// Signal every worker to shut down and wake each loop so it notices
    /// even while parked in the kernel.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Release);
        for wakeup in &self.wakeups {
            wakeup.wake(false);
        }
    }
}

/// Builder for launching riptide event-loop workers.
pub struct RiptideBuilder {
    config: Config,
}

impl RiptideBuilder {
    pub fn new(config: Config) -> Self {
        RiptideBuilder { config }
    }

    /// Spawn the worker threads. All loops share one shutdown flag.
    pub fn launch(self) -> Result<(ShutdownHandle, Vec<Worker>), Error> {
        let num_threads = if self.config.worker.threads == 0 {
            num_cpus()
        } else {
            self.config.worker.threads
        };

        let shutdown_flag = Arc::new(AtomicBool::new(false));

        // Create the cross-thread pieces up front so a setup failure can
        // release them all before any thread runs.
        let mut parts = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let eventfd = match sys::eventfd() {
                Ok(fd) => fd,
                Err(e) => {
                    for (fd, _, _, _) in &parts {
                        unsafe {
                            libc::close(*fd);
                        }
                    }
                    return Err(Error::Io(e));
                }
            };
            let (task_tx, task_rx) = crossbeam_channel::unbounded();
            let wakeup = Arc::new(WakeupState::new(eventfd));
            parts.push((eventfd, task_tx, task_rx, wakeup));
        }

        let mut workers = Vec::with_capacity(num_threads);
        let mut wakeups = Vec::with_capacity(num_threads);

        for (worker_id, (eventfd, task_tx, task_rx, wakeup)) in parts.into_iter().enumerate() {
            wakeups.push(wakeup.clone());
            let handle = LoopHandleParts {
                eventfd,
                task_tx,
                task_rx,
                wakeup,
                shutdown: shutdown_flag.clone(),
            };
            let config = self.config.clone();

            let loop_handle = handle.loop_handle();
            let join = thread::Builder::new()
                .name(format!("riptide-loop-{worker_id}"))
                .spawn(move || {
                    if config.worker.pin_to_core {
                        pin_to_core(config.worker.core_offset + worker_id)?;
                    }
                    let mut event_loop = match EventLoop::with_parts(
                        &config,
                        handle.eventfd,
                        handle.task_tx,
                        handle.task_rx,
                        handle.wakeup,
                        handle.shutdown,
                    ) {
                        Ok(event_loop) => event_loop,
                        Err(e) => {
                            unsafe {
                                libc::close(handle.eventfd);
                            }
                            return Err(e);
                        }
                    };
                    event_loop.run()
                })
                .map_err(Error::Io)?;

            workers.push(Worker {
                handle: loop_handle,
                join,
            });
        }

        Ok((
            ShutdownHandle {
                shutdown_flag,
                wakeups,
            },
            workers,
        ))
    }
}

struct LoopHandleParts {
    eventfd: std::os::fd::RawFd,
    task_tx: crossbeam_channel::Sender<crate::tasks::Task>,
    task_rx: crossbeam_channel::Receiver<crate::tasks::Task>,
    wakeup: Arc<WakeupState>,
    shutdown: Arc<AtomicBool>,
}

impl LoopHandleParts {
    fn loop_handle(&self) -> LoopHandle {
        LoopHandle::from_parts(
            self.task_tx.clone(),
            self.wakeup.clone(),
            self.shutdown.clone(),
        )
    }
}

/// Pin the current thread to a specific CPU core.
fn pin_to_core(core: usize) -> Result<(), Error> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Number of available CPU cores.
fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}
