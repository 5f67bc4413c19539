use crate::{*, error::*, cache::*, log::*, target::*, util::*, vtable::*};
use std::{cell::{Cell, UnsafeCell}, panic, ptr};

pub struct SessionConfig {
    // Upper bound on a single marshaled instance. A corrupt target can hand us any
    // size field it likes; this keeps one bad value from exhausting host memory.
    pub max_instance_size: usize,
    // How far back the interior-pointer search walks, in units of the instance
    // alignment stride. Large enough to cover legitimately nested structures, small
    // enough to fail fast on misuse.
    pub interior_search_iterations: usize,
    // Code units per block when scanning for a string terminator.
    pub string_scan_units: usize,
    // Keep one cache block across a flush instead of returning it to the allocator.
    pub keep_spare_block: bool,
    pub max_walk_depth: usize,
    // Panic on evidence of a corrupt or mismatched target instead of just returning
    // an error. Off by default; a developer chasing a bad target provider turns it on.
    pub consistency_asserts: bool,
}

impl Default for SessionConfig {
    fn default() -> Self { SessionConfig {
        max_instance_size: 0x0400_0000,
        interior_search_iterations: 100,
        string_scan_units: 256,
        keep_spare_block: true,
        max_walk_depth: 30000,
        consistency_asserts: false,
    } }
}

// Everything one debugging connection knows about its target. Only reachable through
// a SessionGuard, so by the time any of this is touched the process-wide lock is held.
pub struct DacCore {
    pub target: Box<dyn AddressSpace>,
    pub metadata: Box<dyn MetadataService>,
    pub cache: InstanceCache,
    // Load address of the target's runtime image; vtable offsets are relative to it.
    pub global_base: TargetAddr,
    pub runtime_image_size: usize,
    pub vtables: &'static [VtableDesc],
    pub config: SessionConfig,
    pub log: Log,
}

impl DacCore {
    pub fn in_runtime_image(&self, addr: TargetAddr) -> bool {
        addr >= self.global_base && addr < self.global_base + self.runtime_image_size
    }

    pub fn report_inconsistency(&mut self, msg: String) {
        log!(self.log, "target inconsistency: {}", msg);
        if self.config.consistency_asserts {
            panic!("target inconsistency: {}", msg);
        }
    }

    pub fn report_usage_error(&mut self, msg: String) {
        log!(self.log, "usage error: {}", msg);
        if self.config.consistency_asserts {
            panic!("usage error: {}", msg);
        }
    }
}

// The single active "who am I marshaling for" context. One per debugging connection,
// flushed (not destroyed) whenever the target may have moved on (continue, step).
//
// All operations go through enter()/enter_for(), which serialize on a process-wide
// nestable lock: the engine provides mutual exclusion, not parallelism. The target's
// memory and the cache must be observed as one consistent snapshot per operation.
pub struct DacSession {
    lock: NestableLock,
    core: UnsafeCell<DacCore>,
}

unsafe impl Send for DacSession {}
unsafe impl Sync for DacSession {}

thread_local! {
    // Innermost session this thread is currently inside. Nested entries save and
    // restore it, so a host callback that re-enters sees sane state.
    static ACTIVE: Cell<*const DacSession> = const { Cell::new(ptr::null()) };
}

impl DacSession {
    pub fn new(target: Box<dyn AddressSpace>, metadata: Box<dyn MetadataService>, global_base: TargetAddr, runtime_image_size: usize, vtables: &'static [VtableDesc], config: SessionConfig) -> Self {
        let cache = InstanceCache::new(config.max_instance_size);
        DacSession {
            lock: NestableLock::new(),
            core: UnsafeCell::new(DacCore {target, metadata, cache, global_base, runtime_image_size, vtables, config, log: Log::new()}),
        }
    }

    // Acquires the process-wide lock and makes this session the active one. Safe to
    // call from a thread that's already inside a session (same or different): the
    // previous active session is saved and restored when the guard drops.
    pub fn enter(&self) -> SessionGuard<'_> {
        self.lock.lock();
        let prev = ACTIVE.with(|a| a.replace(self as *const _));
        SessionGuard {session: self, prev_active: prev}
    }

    // Entry on behalf of a host-visible object created earlier. The object remembers
    // the instance age it was created under; if the cache has been flushed since, all
    // its pointers are stale and the only correct answer is to fail fast.
    pub fn enter_for(&self, instance_age: u64) -> Result<SessionGuard<'_>> {
        let guard = self.enter();
        let current = guard.instance_age();
        if instance_age != current {
            let core = unsafe {&mut *guard.core_ptr()};
            core.report_usage_error(format!("stale instance age {} (current {})", instance_age, current));
            return err!(Usage, "object is from a flushed session state (age {} vs {})", instance_age, current);
        }
        Ok(guard)
    }
}

pub struct SessionGuard<'a> {
    session: &'a DacSession,
    prev_active: *const DacSession,
}

impl<'a> Drop for SessionGuard<'a> {
    fn drop(&mut self) {
        ACTIVE.with(|a| a.set(self.prev_active));
        self.session.lock.unlock();
    }
}

// Nothing that goes wrong on the host side may unwind out of the engine into the
// embedding debugger: panics become a HostFault status at this boundary. The one
// exception is the Interrupted error kind (a target-visible interrupt during live
// debugging) - it's already a Result, and we pass every Err through untouched, so
// the debugger's own interrupt handling sees it.
pub(crate) fn boundary<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(panic::AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(_) => err!(HostFault, "unexpected fault inside access session"),
    }
}

impl<'a> SessionGuard<'a> {
    // The lock is held for the guard's whole lifetime, and engine methods never call
    // back into user code, so taking &mut DacCore for the duration of one method is
    // fine even with nested guards on this thread.
    pub(crate) fn core_ptr(&self) -> *mut DacCore { self.session.core.get() }

    pub fn instance_age(&self) -> u64 {
        unsafe {&*self.core_ptr()}.cache.age()
    }

    // Invalidates every host pointer handed out so far. Call whenever the target's
    // state may have changed discontinuously.
    pub fn flush(&self) {
        let core = unsafe {&mut *self.core_ptr()};
        let save = core.config.keep_spare_block;
        core.cache.flush(save);
        log!(core.log, "flushed instance cache, age now {}", core.cache.age());
    }

    pub fn log_lines(&self) -> Vec<String> {
        unsafe {&*self.core_ptr()}.log.lines.iter().cloned().collect()
    }

    pub fn cache_stats(&self) -> (usize, usize, usize) {
        unsafe {&*self.core_ptr()}.cache.stats()
    }

    pub fn clear_enum_marks(&self) {
        unsafe {&mut *self.core_ptr()}.cache.clear_enum_marks();
    }

    // Reports each live instance that isn't suppressed and hasn't been reported yet
    // (the enum mark makes this idempotent until clear_enum_marks). For dump writers.
    pub fn enum_memory_regions(&self, f: &mut dyn FnMut(TargetAddr, &[u8])) {
        let core = unsafe {&mut *self.core_ptr()};
        let mut pending: Vec<*mut Instance> = Vec::new();
        core.cache.for_each_instance(&mut |inst| {
            if !inst.flags.contains(InstanceFlags::NO_REPORT) && !inst.flags.contains(InstanceFlags::ENUM_MARKED) {
                pending.push(inst as *const Instance as *mut Instance);
            }
        });
        for inst in pending {
            let i = unsafe {&mut *inst};
            i.flags.insert(InstanceFlags::ENUM_MARKED);
            f(i.addr, i.payload());
        }
    }
}

#[cfg(test)]
pub mod tests {
    use crate::{*, error::*, session::*, target::{*, mock::*}};
    use std::sync::Arc;

    pub const TEST_BASE: TargetAddr = 0x7f00_0000_0000;
    pub const TEST_IMAGE_SIZE: usize = 0x10_0000;

    pub fn test_session(target: MockTarget) -> DacSession {
        test_session_with(target, MockMetadata::new(), SessionConfig::default())
    }

    pub fn test_session_with(target: MockTarget, metadata: MockMetadata, config: SessionConfig) -> DacSession {
        DacSession::new(Box::new(target), Box::new(metadata), TEST_BASE, TEST_IMAGE_SIZE, &crate::vtable::RUNTIME_FRAME_VTABLES, config)
    }

    #[test]
    fn epoch_invalidation() {
        let session = test_session(MockTarget::new());
        let age = {
            let g = session.enter();
            g.instance_age()
        };
        assert!(session.enter_for(age).is_ok());
        session.enter().flush();
        let e = session.enter_for(age).err().unwrap();
        assert!(e.is_usage());
        assert!(session.enter_for(age + 1).is_ok());
    }

    #[test]
    fn nested_entry() {
        let session = test_session(MockTarget::new());
        let g1 = session.enter();
        let g2 = session.enter(); // same thread, nests instead of deadlocking
        assert_eq!(g1.instance_age(), g2.instance_age());
        drop(g2);
        drop(g1);
    }

    #[test]
    fn boundary_converts_panics_only() {
        let r: Result<()> = boundary(|| panic!("host bug"));
        assert!(r.unwrap_err().is_host_fault());

        let r: Result<()> = boundary(|| err!(Interrupted, "attach interrupted"));
        assert!(r.unwrap_err().is_interrupted());

        assert_eq!(boundary(|| Ok(7)).unwrap(), 7);
    }

    #[test]
    fn concurrent_entry_serializes() {
        let mut t = MockTarget::new();
        t.map_words(0x1000, &[11, 22, 33, 44]);
        let session = Arc::new(test_session(t));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = session.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let g = s.enter();
                    assert_eq!(*g.marshal::<u64>(0x1000).unwrap(), 11);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
