//! Event-loop integration tests: cross-thread tasks, wake-up coalescing,
//! deadline tasks, and shutdown with channels holding armed polls.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use riptide::event_loop::LoopCtx;
use riptide::{Channel, ChannelRef, Config, EventLoop, RiptideBuilder, WorkerConfig, sys};

fn test_config() -> Config {
    Config {
        ring_entries: 64,
        worker: WorkerConfig {
            threads: 1,
            pin_to_core: false,
            core_offset: 0,
        },
        ..Config::default()
    }
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn tasks_from_many_threads_all_run() {
    let (shutdown, mut workers) = RiptideBuilder::new(test_config()).launch().unwrap();
    let handle = workers[0].handle().clone();
    let counter = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let handle = handle.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..8 {
                    let counter = counter.clone();
                    assert!(handle.execute(move |_ctx| {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(2), || counter.load(Ordering::Relaxed) == 32),
        "all 32 tasks must run"
    );

    shutdown.shutdown();
    workers.remove(0).join().unwrap().unwrap();
}

#[test]
fn repeated_wakeups_while_idle_are_harmless() {
    let (shutdown, mut workers) = RiptideBuilder::new(test_config()).launch().unwrap();
    let handle = workers[0].handle().clone();

    // Hammer the wake-up path with no work queued; the loop must absorb
    // the spurious wakes and still run a task afterwards.
    for _ in 0..100 {
        handle.wakeup();
    }
    let ran = Arc::new(AtomicUsize::new(0));
    let observed = ran.clone();
    handle.execute(move |_ctx| {
        observed.fetch_add(1, Ordering::Relaxed);
    });
    assert!(wait_until(Duration::from_secs(2), || {
        ran.load(Ordering::Relaxed) == 1
    }));

    shutdown.shutdown();
    workers.remove(0).join().unwrap().unwrap();
}

#[test]
fn scheduled_task_fires_after_its_delay() {
    let (shutdown, mut workers) = RiptideBuilder::new(test_config()).launch().unwrap();
    let handle = workers[0].handle().clone();

    let (fired_tx, fired_rx) = mpsc::channel();
    let start = Instant::now();
    handle.execute(move |ctx| {
        ctx.schedule(Duration::from_millis(50), move |_ctx| {
            let _ = fired_tx.send(());
        });
    });

    fired_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("scheduled task must fire");
    assert!(start.elapsed() >= Duration::from_millis(40));

    shutdown.shutdown();
    workers.remove(0).join().unwrap().unwrap();
}

#[test]
fn nearer_deadline_replaces_armed_timeout() {
    let (shutdown, mut workers) = RiptideBuilder::new(test_config()).launch().unwrap();
    let handle = workers[0].handle().clone();

    let (tx, rx) = mpsc::channel();
    let slow_tx = tx.clone();
    handle.execute(move |ctx| {
        ctx.schedule(Duration::from_millis(500), move |_ctx| {
            let _ = slow_tx.send("slow");
        });
    });
    // Let the loop park with the 500ms timeout armed before the nearer
    // deadline arrives.
    thread::sleep(Duration::from_millis(20));
    let fast_tx = tx;
    let start = Instant::now();
    handle.execute(move |ctx| {
        ctx.schedule(Duration::from_millis(50), move |_ctx| {
            let _ = fast_tx.send("fast");
        });
    });

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first, "fast");
    assert!(start.elapsed() < Duration::from_millis(400));
    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(second, "slow");

    shutdown.shutdown();
    workers.remove(0).join().unwrap().unwrap();
}

/// A channel that arms one POLLIN poll and records what the loop tells it.
struct PollChannel {
    fd: RawFd,
    active: bool,
    open: bool,
    poll_outstanding: bool,
    events: Arc<Mutex<Vec<String>>>,
}

impl PollChannel {
    fn record(&self, what: &str) {
        self.events.lock().unwrap().push(format!("{}:{}", self.fd, what));
    }
}

impl Channel for PollChannel {
    fn read_complete(&mut self, _ctx: &mut LoopCtx<'_>, res: i32) {
        self.record(&format!("read_complete:{res}"));
    }

    fn poll_in(&mut self, _ctx: &mut LoopCtx<'_>, res: i32) {
        self.poll_outstanding = false;
        self.record(&format!("poll_in:{res}"));
    }

    fn remove_polls(&mut self, ctx: &mut LoopCtx<'_>) {
        if self.poll_outstanding {
            let _ = ctx.submission().add_poll_remove(self.fd, sys::POLLIN);
        }
    }

    fn close(&mut self, ctx: &mut LoopCtx<'_>) {
        if !self.open {
            return;
        }
        self.open = false;
        self.active = false;
        self.record("close");
        self.remove_polls(ctx);
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn io_scheduled(&self) -> bool {
        false
    }

    fn poll_scheduled(&self) -> bool {
        self.poll_outstanding
    }
}

#[test]
fn shutdown_retires_channels_with_armed_polls() {
    let efd_a = sys::eventfd().unwrap();
    let efd_b = sys::eventfd().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));

    let (handle_tx, handle_rx) = mpsc::channel();
    let loop_thread = thread::spawn(move || {
        let mut event_loop = EventLoop::new(&test_config()).unwrap();
        handle_tx.send(event_loop.handle()).unwrap();
        event_loop.run()
    });
    let handle = handle_rx.recv().unwrap();

    let registered = Arc::new(AtomicUsize::new(0));
    let registered_inner = registered.clone();
    let events_inner = events.clone();
    handle.execute(move |ctx| {
        for fd in [efd_a, efd_b] {
            let channel: ChannelRef = Rc::new(RefCell::new(PollChannel {
                fd,
                active: true,
                open: true,
                poll_outstanding: true,
                events: events_inner.clone(),
            }));
            ctx.register_channel(fd, channel);
            ctx.submission().add_poll(fd, sys::POLLIN).unwrap();
        }
        registered_inner.store(ctx.channel_count(), Ordering::Release);
    });

    assert!(wait_until(Duration::from_secs(2), || {
        registered.load(Ordering::Acquire) == 2
    }));
    // Give the loop a moment to park with the polls armed.
    thread::sleep(Duration::from_millis(50));

    handle.shutdown();
    loop_thread.join().unwrap().unwrap();

    let seen = events.lock().unwrap();
    assert!(seen.contains(&format!("{efd_a}:close")));
    assert!(seen.contains(&format!("{efd_b}:close")));
    // Neither poll fired as ready; they were cancelled.
    assert!(!seen.iter().any(|e| e.contains("poll_in")));

    unsafe {
        libc::close(efd_a);
        libc::close(efd_b);
    }
}

#[test]
fn channel_poll_dispatch_delivers_pollin() {
    let efd = sys::eventfd().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));

    let (handle_tx, handle_rx) = mpsc::channel();
    let loop_thread = thread::spawn(move || {
        let mut event_loop = EventLoop::new(&test_config()).unwrap();
        handle_tx.send(event_loop.handle()).unwrap();
        event_loop.run()
    });
    let handle = handle_rx.recv().unwrap();

    let events_inner = events.clone();
    handle.execute(move |ctx| {
        let channel: ChannelRef = Rc::new(RefCell::new(PollChannel {
            fd: efd,
            active: true,
            open: true,
            poll_outstanding: true,
            events: events_inner.clone(),
        }));
        ctx.register_channel(efd, channel);
        ctx.submission().add_poll(efd, sys::POLLIN).unwrap();
    });

    thread::sleep(Duration::from_millis(50));
    sys::eventfd_write(efd, 1);

    assert!(
        wait_until(Duration::from_secs(2), || {
            events.lock().unwrap().iter().any(|e| e.contains("poll_in"))
        }),
        "poll_in must be delivered"
    );

    handle.shutdown();
    loop_thread.join().unwrap().unwrap();

    unsafe {
        libc::close(efd);
    }
}
