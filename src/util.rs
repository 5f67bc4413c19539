use std::sync::{Mutex, Condvar};
use std::thread::{self, ThreadId};

pub fn align_up(x: usize, align: usize) -> usize {
    debug_assert!(align != 0 && (align - 1) & align == 0);
    (x + align - 1) & !(align - 1)
}

pub fn align_down(x: usize, align: usize) -> usize {
    debug_assert!(align != 0 && (align - 1) & align == 0);
    x & !(align - 1)
}

// Lock that the owning thread may re-enter. Not a general recursive mutex: it's only
// meant for the enter/leave pairs of an access session, where a call already inside
// the session triggers another entry on the same thread. Other threads block until
// the owner's nesting depth drops to zero.
pub struct NestableLock {
    state: Mutex<LockState>,
    cv: Condvar,
}

struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

impl NestableLock {
    pub fn new() -> Self { Self {state: Mutex::new(LockState {owner: None, depth: 0}), cv: Condvar::new()} }

    pub fn lock(&self) {
        let me = thread::current().id();
        let mut s = self.state.lock().unwrap();
        if s.owner == Some(me) {
            s.depth += 1;
            return;
        }
        while s.owner.is_some() {
            s = self.cv.wait(s).unwrap();
        }
        s.owner = Some(me);
        s.depth = 1;
    }

    pub fn unlock(&self) {
        let mut s = self.state.lock().unwrap();
        assert!(s.owner == Some(thread::current().id()) && s.depth > 0);
        s.depth -= 1;
        if s.depth == 0 {
            s.owner = None;
            drop(s);
            self.cv.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::util::*;
    use std::sync::Arc;

    #[test]
    fn align() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_down(31, 16), 16);
    }

    #[test]
    fn nestable_lock() {
        let lock = Arc::new(NestableLock::new());
        lock.lock();
        lock.lock(); // same thread, nests
        lock.unlock();

        let l = lock.clone();
        let t = std::thread::spawn(move || {
            l.lock(); // blocks until the main thread fully unlocks
            l.unlock();
        });
        lock.unlock();
        t.join().unwrap();
    }
}
