//! Pipeline stall monitor.
//!
//! A background thread samples the monotonic clock on a fixed absolute
//! schedule and fires the registered callback when the time since the
//! last kick exceeds the current timeout, at most once per tick, so a
//! wedged pipeline produces a steady escalation beat rather than a
//! burst. Escalation policy itself lives with the caller; the callback
//! may kick or retime the watchdog (no lock is held across it).

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

struct State {
    last_kick: Instant,
    timeout: Duration,
    stop: bool,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Watchdog {
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start the monitor thread. `interval` is the sampling period,
    /// `timeout` the initial allowed silence. The callback runs on the
    /// watchdog thread.
    pub fn spawn<F>(interval: Duration, timeout: Duration, mut callback: F) -> Watchdog
    where
        F: FnMut() + Send + 'static,
    {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                last_kick: Instant::now(),
                timeout,
                stop: false,
            }),
            cv: Condvar::new(),
        });
        let thread_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || run(&thread_inner, interval, &mut callback))
            .expect("spawn watchdog thread");
        Watchdog {
            inner,
            handle: Some(handle),
        }
    }

    /// Record pipeline liveness.
    pub fn kick(&self) {
        self.inner.lock().last_kick = Instant::now();
    }

    /// Change the allowed silence. Does not kick.
    pub fn set_timeout(&self, timeout: Duration) {
        debug!(target: "watchdog", ?timeout, "timeout_changed");
        self.inner.lock().timeout = timeout;
    }

    /// Stop the monitor and join the thread.
    pub fn stop(&mut self) {
        self.inner.lock().stop = true;
        self.inner.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<F: FnMut()>(inner: &Inner, interval: Duration, callback: &mut F) {
    // Absolute tick schedule: deadlines advance by whole intervals from
    // the start instant, so callback latency does not accumulate drift.
    let mut next = Instant::now() + interval;
    loop {
        let mut st = inner.lock();
        loop {
            if st.stop {
                return;
            }
            let now = Instant::now();
            if now >= next {
                break;
            }
            let (guard, _) = inner
                .cv
                .wait_timeout(st, next - now)
                .unwrap_or_else(|e| e.into_inner());
            st = guard;
        }
        let silence = st.last_kick.elapsed();
        let timeout = st.timeout;
        drop(st);
        if silence > timeout {
            warn!(target: "watchdog", ?silence, ?timeout, "overrun");
            callback();
        }
        next += interval;
        let now = Instant::now();
        while next <= now {
            next += interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn no_callback_while_kicked() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let mut wd = Watchdog::spawn(
            Duration::from_millis(20),
            Duration::from_millis(60),
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        for _ in 0..10 {
            wd.kick();
            std::thread::sleep(Duration::from_millis(15));
        }
        wd.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fires_once_per_tick_on_silence() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let mut wd = Watchdog::spawn(
            Duration::from_millis(30),
            Duration::from_millis(50),
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        std::thread::sleep(Duration::from_millis(200));
        wd.stop();
        let n = fired.load(Ordering::SeqCst);
        // ~6 ticks, the first one or two still inside the timeout.
        assert!(n >= 2 && n <= 6, "fired {n} times");
    }

    #[test]
    fn callback_rekick_spaces_escalations() {
        let fired = Arc::new(AtomicU32::new(0));
        let inner_handle: Arc<Mutex<Option<Watchdog>>> = Arc::new(Mutex::new(None));
        let f = fired.clone();
        let h = inner_handle.clone();
        let wd = Watchdog::spawn(
            Duration::from_millis(20),
            Duration::from_millis(40),
            move || {
                f.fetch_add(1, Ordering::SeqCst);
                if let Some(wd) = h.lock().unwrap().as_ref() {
                    wd.kick();
                }
            },
        );
        *inner_handle.lock().unwrap() = Some(wd);
        std::thread::sleep(Duration::from_millis(210));
        let mut wd = inner_handle.lock().unwrap().take().unwrap();
        wd.stop();
        let n = fired.load(Ordering::SeqCst);
        // Re-kicking inside the callback spreads firings a full timeout
        // apart: roughly 210 / (40 + tick slop) of them.
        assert!(n >= 2 && n <= 5, "fired {n} times");
    }

    #[test]
    fn set_timeout_takes_effect_without_kick() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let mut wd = Watchdog::spawn(
            Duration::from_millis(20),
            Duration::from_secs(60),
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // Shrinking the timeout makes the existing silence an overrun.
        wd.set_timeout(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        wd.stop();
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn stop_joins_promptly() {
        let mut wd = Watchdog::spawn(
            Duration::from_secs(10),
            Duration::from_secs(10),
            || {},
        );
        let t0 = Instant::now();
        wd.stop();
        assert!(t0.elapsed() < Duration::from_secs(1));
    }
}
