//! Named, system-wide auto-reset signal between the producer and widget processes.
//!
//! `signal` wakes at most one waiting listener. A signal raised while nobody is
//! waiting is dropped; consumers poll on a timer as well, so nothing is lost for
//! longer than one poll interval. Where the OS has no named-event primitive the
//! listener exits straight away and `signal` reports that nobody heard it.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest time a listener blocks before re-checking its stop flag.
pub const WAIT_SLICE: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("named signals are not supported on this platform")]
    Unsupported,
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct NotificationChannel {
    name: String,
}

impl NotificationChannel {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raises the signal. `Ok(false)` means no listener has created the event yet.
    pub fn signal(&self) -> Result<bool, ChannelError> {
        match sys::signal(&self.name) {
            Err(ChannelError::Unsupported) => Ok(false),
            other => other,
        }
    }

    /// Spawns a background listener that calls `on_signaled` once per received signal.
    ///
    /// The callback runs on the listener thread; a panic inside it is logged and the
    /// listener keeps going.
    pub fn listen<F>(&self, on_signaled: F) -> ChannelListener
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let name = self.name.clone();
        let spawned = thread::Builder::new()
            .name("wallsync-channel".to_owned())
            .spawn(move || listen_loop(&name, &thread_stop, on_signaled));

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(channel = %self.name, "failed to spawn channel listener: {err}");
                None
            }
        };
        ChannelListener { stop, handle }
    }
}

/// Handle to a running listener; stopping (or dropping) it joins the thread
/// within one wait slice.
#[derive(Debug)]
pub struct ChannelListener {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ChannelListener {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn listen_loop<F: FnMut()>(name: &str, stop: &AtomicBool, mut on_signaled: F) {
    while !stop.load(Ordering::SeqCst) {
        let event = match sys::Event::open_or_create(name) {
            Ok(event) => event,
            Err(ChannelError::Unsupported) => {
                info!(channel = %name, "named signal unavailable, relying on polling");
                return;
            }
            Err(err) => {
                warn!(channel = %name, "channel open failed: {err}");
                sleep_unless_stopped(stop, ERROR_BACKOFF);
                continue;
            }
        };
        debug!(channel = %name, "channel listener waiting");

        while !stop.load(Ordering::SeqCst) {
            match event.wait(WAIT_SLICE) {
                Ok(true) => {
                    if panic::catch_unwind(AssertUnwindSafe(&mut on_signaled)).is_err() {
                        warn!(channel = %name, "signal handler panicked");
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(channel = %name, "channel wait failed: {err}");
                    sleep_unless_stopped(stop, ERROR_BACKOFF);
                    break;
                }
            }
        }
    }
}

fn sleep_unless_stopped(stop: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(STOP_POLL.min(deadline - now));
    }
}

#[cfg(target_os = "windows")]
mod sys {
    use std::{io, time::Duration};

    use windows_sys::Win32::{
        Foundation::{
            CloseHandle, ERROR_FILE_NOT_FOUND, GetLastError, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT,
        },
        System::Threading::{
            CreateEventW, EVENT_MODIFY_STATE, OpenEventW, SetEvent, WaitForSingleObject,
        },
    };

    use super::ChannelError;

    fn to_wide(value: &str) -> Vec<u16> {
        value.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn os_error(op: &'static str) -> ChannelError {
        ChannelError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }

    pub struct Event {
        handle: HANDLE,
    }

    // SAFETY: a kernel event handle may be waited on from any thread.
    unsafe impl Send for Event {}

    impl Event {
        pub fn open_or_create(name: &str) -> Result<Self, ChannelError> {
            let wide = to_wide(name);
            // SAFETY: `wide` is NUL-terminated and outlives the call; auto-reset, initially unset.
            let handle = unsafe { CreateEventW(std::ptr::null(), 0, 0, wide.as_ptr()) };
            if handle == 0 {
                return Err(os_error("CreateEventW"));
            }
            Ok(Self { handle })
        }

        pub fn wait(&self, slice: Duration) -> Result<bool, ChannelError> {
            let millis = u32::try_from(slice.as_millis()).unwrap_or(u32::MAX);
            // SAFETY: `self.handle` is a live event handle owned by this value.
            let status = unsafe { WaitForSingleObject(self.handle, millis) };
            match status {
                WAIT_OBJECT_0 => Ok(true),
                WAIT_TIMEOUT => Ok(false),
                _ => Err(os_error("WaitForSingleObject")),
            }
        }
    }

    impl Drop for Event {
        fn drop(&mut self) {
            // SAFETY: the handle was returned by CreateEventW and is closed once.
            unsafe {
                CloseHandle(self.handle);
            }
        }
    }

    pub fn signal(name: &str) -> Result<bool, ChannelError> {
        let wide = to_wide(name);
        // SAFETY: `wide` is NUL-terminated and outlives the call.
        let handle = unsafe { OpenEventW(EVENT_MODIFY_STATE, 0, wide.as_ptr()) };
        if handle == 0 {
            // SAFETY: reads the calling thread's last-error value.
            if unsafe { GetLastError() } == ERROR_FILE_NOT_FOUND {
                return Ok(false);
            }
            return Err(os_error("OpenEventW"));
        }
        let event = Event { handle };
        // SAFETY: `event.handle` was opened with EVENT_MODIFY_STATE above.
        if unsafe { SetEvent(event.handle) } == 0 {
            return Err(os_error("SetEvent"));
        }
        Ok(true)
    }
}

#[cfg(not(target_os = "windows"))]
mod sys {
    use std::time::Duration;

    use super::ChannelError;

    pub struct Event;

    impl Event {
        pub fn open_or_create(_name: &str) -> Result<Self, ChannelError> {
            Err(ChannelError::Unsupported)
        }

        pub fn wait(&self, _slice: Duration) -> Result<bool, ChannelError> {
            Err(ChannelError::Unsupported)
        }
    }

    pub fn signal(_name: &str) -> Result<bool, ChannelError> {
        Err(ChannelError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn sleep_unless_stopped_returns_early_when_stopped() {
        let stop = AtomicBool::new(true);
        let started = Instant::now();
        sleep_unless_stopped(&stop, Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn stop_joins_within_a_wait_slice() {
        let channel = NotificationChannel::new(format!(
            "Local\\WallpaperSyncTest-{}",
            std::process::id()
        ));
        let listener = channel.listen(|| {});
        let started = Instant::now();
        listener.stop();
        assert!(started.elapsed() < WAIT_SLICE + Duration::from_secs(1));
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn degrades_to_noop_without_named_events() {
        let channel = NotificationChannel::new(crate::REFRESH_CHANNEL_NAME);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let listener = channel.listen(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!channel.signal().unwrap());
        let deadline = Instant::now() + Duration::from_secs(2);
        while listener.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!listener.is_running());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[cfg(target_os = "windows")]
    #[test]
    fn signal_wakes_listener() {
        let channel = NotificationChannel::new(format!(
            "Local\\WallpaperSyncTest-wake-{}",
            std::process::id()
        ));
        assert!(!channel.signal().unwrap());

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let listener = channel.listen(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            let _ = channel.signal();
            thread::sleep(Duration::from_millis(50));
        }
        assert!(hits.load(Ordering::SeqCst) >= 1);
        listener.stop();
    }
}
