//! A level-triggered epoll thread that watches fence eventfds and reports
//! each one's transition to the signaled state exactly once.
//!
//! Registration and deregistration happen from other threads (the session
//! operations), so they are queued and a waker eventfd interrupts the
//! ongoing poll, after which the thread drains the queue. Once a watched
//! fence becomes readable it is removed from the epoll set before the ready
//! callback runs; a fence never produces a second callback.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::mem;
use std::os::unix::io::{AsFd, AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, warn};
use nix::sys::eventfd::{EfdFlags, EventFd};

use super::SyncEvent;

macro_rules! syscall {
    ($f: ident ( $($args: expr),* $(,)* ) ) => {{
        match unsafe { libc::$f($($args, )*) } {
            err if err < 0 => Err(std::io::Error::last_os_error()),
            res => Ok(res)
        }
    }};
}

/// Epoll key reserved for the waker; fence tokens start at 1 and count up,
/// so they can never collide with it.
const WAKER_KEY: u64 = u64::MAX;

/// Interrupts an ongoing (or coming) epoll wait from another thread.
struct Waker {
    fd: EventFd,
}

impl Waker {
    fn new() -> io::Result<Self> {
        let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(Waker { fd })
    }

    fn wake(&self) -> io::Result<()> {
        self.fd
            .arm()
            .map(|_| ())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))
    }

    /// Resets the counter to 0 so subsequent polls block until the next
    /// `wake()`.
    fn reset(&self) -> io::Result<()> {
        let mut buf = 0u64.to_ne_bytes();
        let raw = self.fd.as_fd().as_raw_fd();
        match nix::unistd::read(raw, &mut buf) {
            Ok(_) => Ok(()),
            // Already zero, nothing to reset.
            Err(nix::errno::Errno::EAGAIN) => Ok(()),
            Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

enum WatchOp {
    Add(SyncEvent),
    Remove(u64),
}

/// Owns the epoll thread. Dropping it stops and joins the thread.
pub struct FenceWatcher {
    ops: Arc<Mutex<Vec<WatchOp>>>,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FenceWatcher {
    /// Starts the watcher thread. `on_ready` is invoked from that thread
    /// with the token of each watched event that reaches the signaled
    /// state.
    pub fn start<F>(on_ready: F) -> io::Result<Self>
    where
        F: Fn(u64) + Send + 'static,
    {
        let epoll = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))
            .map(|fd| unsafe { File::from_raw_fd(fd) })?;

        let waker = Arc::new(Waker::new()?);
        syscall!(epoll_ctl(
            epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            waker.fd.as_fd().as_raw_fd(),
            &mut libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: WAKER_KEY,
            }
        ))?;

        let ops: Arc<Mutex<Vec<WatchOp>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let mut thread = WatcherThread {
            epoll,
            waker: Arc::clone(&waker),
            ops: Arc::clone(&ops),
            stop: Arc::clone(&stop),
            watched: BTreeMap::new(),
            on_ready: Box::new(on_ready),
        };
        let handle = std::thread::Builder::new()
            .name("fence watcher".into())
            .spawn(move || {
                if let Err(e) = thread.run() {
                    error!("fence watcher thread exited with error: {:#}", e);
                }
            })?;

        Ok(FenceWatcher {
            ops,
            waker,
            stop,
            handle: Some(handle),
        })
    }

    /// Starts watching `event`. If the event is already signaled the ready
    /// callback fires promptly. Watching a token twice is a no-op.
    pub fn watch(&self, event: SyncEvent) -> io::Result<()> {
        self.ops.lock().unwrap().push(WatchOp::Add(event));
        self.waker.wake()
    }

    /// Stops watching the event with `token`, if it is still watched. Any
    /// ready callback already in flight for it may still be delivered.
    pub fn unwatch(&self, token: u64) -> io::Result<()> {
        self.ops.lock().unwrap().push(WatchOp::Remove(token));
        self.waker.wake()
    }
}

impl Drop for FenceWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("could not wake fence watcher for shutdown: {}", e);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct WatcherThread {
    epoll: File,
    waker: Arc<Waker>,
    ops: Arc<Mutex<Vec<WatchOp>>>,
    stop: Arc<AtomicBool>,
    // Holding the events here keeps their fds alive while registered.
    watched: BTreeMap<u64, SyncEvent>,
    on_ready: Box<dyn Fn(u64) + Send>,
}

impl WatcherThread {
    fn run(&mut self) -> anyhow::Result<()> {
        let mut events: [libc::epoll_event; 16] = unsafe { mem::zeroed() };

        loop {
            let nb_events = match syscall!(epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as i32,
                -1
            )) {
                Ok(n) => n as usize,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            for event in &events[0..nb_events] {
                match event.u64 {
                    WAKER_KEY => {
                        self.waker.reset()?;
                    }
                    token => self.handle_ready(token)?,
                }
            }

            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.drain_ops()?;
        }
    }

    fn drain_ops(&mut self) -> anyhow::Result<()> {
        let ops: Vec<WatchOp> = mem::take(&mut *self.ops.lock().unwrap());
        for op in ops {
            match op {
                WatchOp::Add(event) => {
                    let token = event.token();
                    if self.watched.contains_key(&token) {
                        warn!("fence token {} is already watched", token);
                        continue;
                    }
                    syscall!(epoll_ctl(
                        self.epoll.as_raw_fd(),
                        libc::EPOLL_CTL_ADD,
                        event.as_raw_fd(),
                        &mut libc::epoll_event {
                            events: libc::EPOLLIN as u32,
                            u64: token,
                        }
                    ))?;
                    self.watched.insert(token, event);
                }
                WatchOp::Remove(token) => {
                    if let Some(event) = self.watched.remove(&token) {
                        syscall!(epoll_ctl(
                            self.epoll.as_raw_fd(),
                            libc::EPOLL_CTL_DEL,
                            event.as_raw_fd(),
                            &mut libc::epoll_event {
                                events: libc::EPOLLIN as u32,
                                u64: token,
                            }
                        ))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_ready(&mut self, token: u64) -> anyhow::Result<()> {
        let event = match self.watched.remove(&token) {
            Some(event) => event,
            None => {
                // Raced with an unwatch that was drained after epoll_wait
                // returned.
                debug!("ready event for unwatched token {}", token);
                return Ok(());
            }
        };
        syscall!(epoll_ctl(
            self.epoll.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            event.as_raw_fd(),
            &mut libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: token,
            }
        ))?;
        (self.on_ready)(token);
        Ok(())
    }
}
