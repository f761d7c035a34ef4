//! Synchronization primitives shared by dispatcher threads and components.
//!
//! Every blocking object implements [`Lockable`], so scoped helpers such as
//! [`Lock`] and [`MultiLock`] work uniformly over mutexes, events,
//! semaphores and waitable timers.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Return immediately.
    DoNotWait,
    /// Block until the condition is met.
    Infinite,
    /// Block for at most the given duration.
    After(Duration),
}

impl WaitTimeout {
    pub fn millis(ms: u64) -> Self {
        WaitTimeout::After(Duration::from_millis(ms))
    }

    /// Absolute deadline for finite timeouts.
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            WaitTimeout::DoNotWait => Some(Instant::now()),
            WaitTimeout::Infinite => None,
            WaitTimeout::After(d) => Some(Instant::now() + *d),
        }
    }

    /// Milliseconds for diagnostics; `u64::MAX` stands for infinite.
    pub fn as_millis(&self) -> u64 {
        match self {
            WaitTimeout::DoNotWait => 0,
            WaitTimeout::Infinite => u64::MAX,
            WaitTimeout::After(d) => d.as_millis() as u64,
        }
    }
}

impl From<Duration> for WaitTimeout {
    fn from(d: Duration) -> Self {
        WaitTimeout::After(d)
    }
}

/// Blocks on `cond` until `ready` returns true or the timeout elapses.
fn wait_on<T>(
    cond: &Condvar,
    guard: &mut parking_lot::MutexGuard<'_, T>,
    timeout: WaitTimeout,
    mut ready: impl FnMut(&mut T) -> bool,
) -> bool {
    let deadline = timeout.deadline();
    loop {
        if ready(&mut **guard) {
            return true;
        }
        match (timeout, deadline) {
            (WaitTimeout::DoNotWait, _) => return false,
            (_, None) => cond.wait(guard),
            (_, Some(deadline)) => {
                if cond.wait_until(guard, deadline).timed_out() {
                    return ready(&mut **guard);
                }
            }
        }
    }
}

/// Generation counter bumped whenever any object becomes available, so
/// [`MultiLock`] can block across objects that each have their own condvar.
struct Releases {
    generation: Mutex<u64>,
    cond: Condvar,
    waiters: AtomicUsize,
}

static RELEASES: Releases = Releases {
    generation: parking_lot::const_mutex(0),
    cond: Condvar::new(),
    waiters: AtomicUsize::new(0),
};

/// Wakes blocked multi-waiters. Must be called after the object's own state
/// change is visible.
fn notify_release() {
    if RELEASES.waiters.load(Ordering::SeqCst) > 0 {
        let mut generation = RELEASES.generation.lock();
        *generation = generation.wrapping_add(1);
        RELEASES.cond.notify_all();
    }
}

struct MultiWaiter;

impl MultiWaiter {
    fn enter() -> Self {
        RELEASES.waiters.fetch_add(1, Ordering::SeqCst);
        MultiWaiter
    }

    fn generation(&self) -> u64 {
        *RELEASES.generation.lock()
    }

    /// Blocks until a release newer than `seen` or until `wake`.
    fn wait(&self, seen: u64, wake: Option<Instant>) {
        let mut generation = RELEASES.generation.lock();
        while *generation == seen {
            match wake {
                Some(at) => {
                    if RELEASES.cond.wait_until(&mut generation, at).timed_out() {
                        return;
                    }
                }
                None => RELEASES.cond.wait(&mut generation),
            }
        }
    }
}

impl Drop for MultiWaiter {
    fn drop(&mut self) {
        RELEASES.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Capability shared by all blocking synchronization objects.
pub trait Lockable: Send + Sync {
    /// Acquire (or wait for) the object. Returns false on timeout.
    fn lock(&self, timeout: WaitTimeout) -> bool;

    /// Release the object. Signal-like objects treat this as a no-op.
    fn unlock(&self) -> bool;

    fn try_lock(&self) -> bool {
        self.lock(WaitTimeout::DoNotWait)
    }

    /// Moment the object becomes available without anyone releasing it.
    fn available_at(&self) -> Option<Instant> {
        None
    }
}

#[derive(Debug, Default)]
struct Ownership {
    owner: Option<ThreadId>,
    depth: u32,
}

/// Recursive mutex. Only the owning thread may unlock it.
#[derive(Debug, Default)]
pub struct SyncMutex {
    state: Mutex<Ownership>,
    released: Condvar,
}

impl SyncMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread currently holding the mutex.
    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }
}

impl Lockable for SyncMutex {
    fn lock(&self, timeout: WaitTimeout) -> bool {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        let acquired = wait_on(&self.released, &mut state, timeout, |s| {
            s.owner.is_none() || s.owner == Some(me)
        });
        if acquired {
            state.owner = Some(me);
            state.depth += 1;
        }
        acquired
    }

    fn unlock(&self) -> bool {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return false;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_one();
            drop(state);
            notify_release();
        }
        true
    }
}

/// Reset behaviour of a [`SyncEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Stays signaled until `reset` is called.
    Manual,
    /// Releases one waiter and resets itself.
    Automatic,
}

/// Signal flag that threads can wait on.
#[derive(Debug)]
pub struct SyncEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
    mode: ResetMode,
}

impl SyncEvent {
    pub fn new(mode: ResetMode, initially_signaled: bool) -> Self {
        Self {
            signaled: Mutex::new(initially_signaled),
            cond: Condvar::new(),
            mode,
        }
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        match self.mode {
            ResetMode::Manual => {
                self.cond.notify_all();
            }
            ResetMode::Automatic => {
                self.cond.notify_one();
            }
        }
        drop(signaled);
        notify_release();
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    pub fn wait(&self, timeout: WaitTimeout) -> bool {
        let mut signaled = self.signaled.lock();
        let ok = wait_on(&self.cond, &mut signaled, timeout, |s| *s);
        if ok && self.mode == ResetMode::Automatic {
            *signaled = false;
        }
        ok
    }
}

impl Lockable for SyncEvent {
    fn lock(&self, timeout: WaitTimeout) -> bool {
        self.wait(timeout)
    }

    fn unlock(&self) -> bool {
        true
    }
}

/// Counting semaphore with an upper bound.
#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
    max: u32,
}

impl Semaphore {
    pub fn new(initial: u32, max: u32) -> Self {
        Self {
            count: Mutex::new(initial.min(max)),
            cond: Condvar::new(),
            max,
        }
    }

    pub fn available(&self) -> u32 {
        *self.count.lock()
    }
}

impl Lockable for Semaphore {
    fn lock(&self, timeout: WaitTimeout) -> bool {
        let mut count = self.count.lock();
        let ok = wait_on(&self.cond, &mut count, timeout, |c| *c > 0);
        if ok {
            *count -= 1;
        }
        ok
    }

    fn unlock(&self) -> bool {
        let mut count = self.count.lock();
        if *count >= self.max {
            return false;
        }
        *count += 1;
        self.cond.notify_one();
        drop(count);
        notify_release();
        true
    }
}

#[derive(Debug, Default)]
struct TimerState {
    due: Option<Instant>,
    period: Option<Duration>,
}

/// Timer that becomes "lockable" once its deadline passes.
///
/// A periodic timer re-arms itself each time a waiter observes it firing.
#[derive(Debug, Default)]
pub struct WaitableTimer {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl WaitableTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, after: Duration, periodic: bool) {
        let mut state = self.state.lock();
        state.due = Some(Instant::now() + after);
        state.period = periodic.then_some(after);
        self.cond.notify_all();
        drop(state);
        notify_release();
    }

    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.due = None;
        state.period = None;
        self.cond.notify_all();
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().due.is_some()
    }
}

impl Lockable for WaitableTimer {
    fn lock(&self, timeout: WaitTimeout) -> bool {
        let deadline = timeout.deadline();
        let mut state = self.state.lock();
        loop {
            let now = Instant::now();
            match state.due {
                Some(due) if due <= now => {
                    state.due = state.period.map(|p| due + p);
                    return true;
                }
                Some(due) => {
                    let wake = deadline.map_or(due, |d| d.min(due));
                    if deadline.is_some_and(|d| d <= now) {
                        return false;
                    }
                    let _ = self.cond.wait_until(&mut state, wake);
                }
                None => match deadline {
                    Some(d) if d <= now => return false,
                    Some(d) => {
                        let _ = self.cond.wait_until(&mut state, d);
                    }
                    None => self.cond.wait(&mut state),
                },
            }
        }
    }

    fn unlock(&self) -> bool {
        self.cancel();
        true
    }

    fn available_at(&self) -> Option<Instant> {
        self.state.lock().due
    }
}

/// Scoped acquisition of a single [`Lockable`]; released on drop.
pub struct Lock<'a> {
    object: &'a dyn Lockable,
    locked: bool,
}

impl<'a> Lock<'a> {
    pub fn new(object: &'a dyn Lockable, timeout: WaitTimeout) -> Self {
        let locked = object.lock(timeout);
        Self { object, locked }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Release before the end of scope.
    pub fn unlock(&mut self) {
        if self.locked {
            self.object.unlock();
            self.locked = false;
        }
    }
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Waits on several [`Lockable`] objects at once.
///
/// In wait-all mode either every object is acquired or none is; in wait-any
/// mode the first object that becomes available wins.
pub struct MultiLock<'a> {
    objects: Vec<&'a dyn Lockable>,
    acquired: Vec<bool>,
}

impl<'a> MultiLock<'a> {
    pub fn new(objects: &[&'a dyn Lockable]) -> Self {
        Self {
            objects: objects.to_vec(),
            acquired: vec![false; objects.len()],
        }
    }

    /// Acquire all objects. Returns false (holding nothing) on timeout.
    pub fn lock_all(&mut self, timeout: WaitTimeout) -> bool {
        let deadline = timeout.deadline();
        let waiter = MultiWaiter::enter();
        loop {
            let seen = waiter.generation();
            for (idx, object) in self.objects.iter().enumerate() {
                if !self.acquired[idx] && object.try_lock() {
                    self.acquired[idx] = true;
                }
            }
            if self.acquired.iter().all(|a| *a) {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.unlock_all();
                return false;
            }
            waiter.wait(seen, self.wake_at(deadline));
        }
    }

    /// Acquire the first available object and return its index.
    pub fn lock_any(&mut self, timeout: WaitTimeout) -> Option<usize> {
        let deadline = timeout.deadline();
        let waiter = MultiWaiter::enter();
        loop {
            let seen = waiter.generation();
            for (idx, object) in self.objects.iter().enumerate() {
                if !self.acquired[idx] && object.try_lock() {
                    self.acquired[idx] = true;
                    return Some(idx);
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return None;
            }
            waiter.wait(seen, self.wake_at(deadline));
        }
    }

    /// Earliest of the caller's deadline and any pending timer.
    fn wake_at(&self, deadline: Option<Instant>) -> Option<Instant> {
        self.objects
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.acquired[*idx])
            .filter_map(|(_, object)| object.available_at())
            .chain(deadline)
            .min()
    }

    pub fn is_acquired(&self, idx: usize) -> bool {
        self.acquired.get(idx).copied().unwrap_or(false)
    }

    pub fn unlock_all(&mut self) {
        for (idx, object) in self.objects.iter().enumerate() {
            if self.acquired[idx] {
                object.unlock();
                self.acquired[idx] = false;
            }
        }
    }
}

impl Drop for MultiLock<'_> {
    fn drop(&mut self) {
        self.unlock_all();
    }
}

/// Atomic counter with interlocked helpers.
#[derive(Debug, Default)]
pub struct InterlockedValue(AtomicU32);

impl InterlockedValue {
    pub const fn new(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    /// Increments and returns the new value.
    pub fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Decrements and returns the new value.
    pub fn decrement(&self) -> u32 {
        self.0.fetch_sub(1, Ordering::AcqRel).wrapping_sub(1)
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u32) -> u32 {
        self.0.swap(value, Ordering::AcqRel)
    }

    /// Stores `new` if the current value equals `expected`.
    pub fn test_and_set(&self, expected: u32, new: u32) -> bool {
        self.0
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
