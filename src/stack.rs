use crate::{*, error::*, registers::*, session::*, target::*, vtable::*};
use bitflags::bitflags;
use libc::pid_t;
use std::mem;

// Stack walking for a stopped target thread. Two interleaved sources: ordinary code
// frames recovered by following the frame-pointer chain, and the explicit frame
// objects the runtime links onto each thread (transitions into and out of managed
// code, exception dispatch, function evaluation). Both advance monotonically up the
// stack, so the walk merges them by stack address.

bitflags! {
    pub struct FrameFilter: u32 {
        const UNRECOGNIZED = 0x1;
        const MANAGED_METHOD = 0x2;
        const RUNTIME_UNMANAGED = 0x4;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SimpleFrameKind {
    ManagedMethod,
    RuntimeUnmanagedCode,
    Unrecognized,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DetailedFrameKind {
    Unknown,
    ManagedMethod,
    RuntimeCode,
    TransitionFrame,
    HelperMethodFrame,
    ExceptionFrame,
    ExceptionFilterFrame,
    FuncEvalFrame,
    GcCoopFrame,
}

fn detail_for_poly(kind: PolyKind) -> DetailedFrameKind {
    match kind {
        PolyKind::TransitionFrame => DetailedFrameKind::TransitionFrame,
        PolyKind::HelperMethodFrame => DetailedFrameKind::HelperMethodFrame,
        PolyKind::ExceptionFrame => DetailedFrameKind::ExceptionFrame,
        PolyKind::ExceptionFilterFrame => DetailedFrameKind::ExceptionFilterFrame,
        PolyKind::FuncEvalFrame => DetailedFrameKind::FuncEvalFrame,
        PolyKind::GcCoopFrame => DetailedFrameKind::GcCoopFrame,
        PolyKind::Other => DetailedFrameKind::RuntimeCode,
    }
}

// Frame objects start with a vtable slot; the link to the next frame up the stack is
// the following slot. Chains terminate with a sentinel.
const FRAME_CHAIN_LINK_OFFSET: usize = mem::size_of::<usize>();
const FRAME_OBJECT_MIN_SIZE: u32 = (2 * mem::size_of::<usize>()) as u32;

// Snapshot of one frame that outlives the walker. Holds no host pointers, but its
// contents describe a particular stopped state of the target, so reads back through
// a session check the instance age first.
pub struct FrameHandle {
    pub simple: SimpleFrameKind,
    pub detail: DetailedFrameKind,
    pub method: Option<MethodId>,
    pub frame_object: Option<TargetAddr>,
    regs: Registers,
    age: u64,
}

impl FrameHandle {
    pub fn context(&self, session: &DacSession) -> Result<Registers> {
        let _guard = session.enter_for(self.age)?;
        Ok(self.regs.clone())
    }
}

pub struct StackWalker<'a> {
    guard: &'a SessionGuard<'a>,
    tid: pid_t,
    filter: FrameFilter,
    age: u64,
    chain_head: TargetAddr,

    // Registers of the most recent code frame (the current frame, unless a chained
    // frame object preempted it).
    regs: Registers,
    // Caller frame already unwound but not yet presented; chained frame objects below
    // its stack pointer come first.
    next_regs: Option<Registers>,
    // Next unconsumed frame object, sentinel when the chain is done.
    chain: TargetAddr,
    // Set when the current frame is a chained frame object.
    runtime_frame: Option<TargetAddr>,

    simple: SimpleFrameKind,
    detail: DetailedFrameKind,
    method: Option<MethodId>,
    // Stack distance consumed by frames the filter rejected since the last reported
    // frame. A big value here is a hint that the walk is leaping over something.
    bytes_skipped: usize,
    depth: usize,
    exhausted: bool,
}

impl<'a> SessionGuard<'a> {
    pub fn stack_walk(&self, tid: pid_t, filter: FrameFilter) -> Result<StackWalker<'_>> {
        boundary(|| StackWalker::new(self, tid, filter))
    }

    pub fn thread_ids(&self) -> Result<Vec<pid_t>> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.target.thread_ids())
    }

    pub fn thread_context(&self, tid: pid_t) -> Result<Registers> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.target.get_thread_context(tid))
    }
}

impl<'a> StackWalker<'a> {
    fn new(guard: &'a SessionGuard<'a>, tid: pid_t, filter: FrameFilter) -> Result<Self> {
        let core = unsafe {&mut *guard.core_ptr()};
        // A thread stopped mid-exception-dispatch has its fault-site context saved
        // aside; that's where the interesting stack is.
        let regs = match core.target.saved_filter_context(tid)? {
            Some(r) => r,
            None => core.target.get_thread_context(tid)?,
        };
        let chain_head = core.target.frame_chain_head(tid)?;
        let age = core.cache.age();
        let mut w = StackWalker {guard, tid, filter, age, chain_head, regs, next_regs: None, chain: NULL_ADDR, runtime_frame: None, simple: SimpleFrameKind::Unrecognized, detail: DetailedFrameKind::Unknown, method: None, bytes_skipped: 0, depth: 0, exhausted: false};
        w.reset_chain()?;
        w.classify_code();
        if !w.passes() {
            w.seek()?;
        }
        Ok(w)
    }

    // Advance to the next frame the filter accepts. Ok(false) once the walk is done;
    // asking again keeps returning Ok(false).
    pub fn next(&mut self) -> Result<bool> {
        boundary(|| {
            if self.exhausted {
                return Ok(false);
            }
            let r = self.seek();
            if r.is_err() {
                self.exhausted = true;
            }
            r?;
            Ok(!self.exhausted)
        })
    }

    pub fn frame_kind(&self) -> (SimpleFrameKind, DetailedFrameKind) { (self.simple, self.detail) }

    pub fn method_id(&self) -> Option<MethodId> { self.method }

    // Target address of the current chained frame object, None for code frames.
    pub fn frame_object(&self) -> Option<TargetAddr> { self.runtime_frame }

    pub fn bytes_skipped(&self) -> usize { self.bytes_skipped }

    pub fn get_context(&self) -> Result<Registers> {
        if self.exhausted {
            return err!(NoFrame, "stack walk of thread {} is past the last frame", self.tid);
        }
        Ok(self.regs.clone())
    }

    // Redirect the walk to continue from an explicit context, e.g. one recovered from
    // an exception record. The chain restarts from the head; entries below the new
    // stack pointer have already been popped and are skipped.
    pub fn set_context(&mut self, regs: &Registers) -> Result<()> {
        boundary(|| {
            self.regs = regs.clone();
            self.next_regs = None;
            self.runtime_frame = None;
            self.exhausted = false;
            self.depth = 0;
            self.bytes_skipped = 0;
            self.reset_chain()?;
            self.classify_code();
            if !self.passes() {
                self.seek()?;
            }
            Ok(())
        })
    }

    pub fn materialize_frame(&self) -> Result<FrameHandle> {
        if self.exhausted {
            return err!(NoFrame, "stack walk of thread {} is past the last frame", self.tid);
        }
        Ok(FrameHandle {simple: self.simple, detail: self.detail, method: self.method, frame_object: self.runtime_frame, regs: self.regs.clone(), age: self.age})
    }

    fn passes(&self) -> bool {
        match self.simple {
            SimpleFrameKind::ManagedMethod => self.filter.contains(FrameFilter::MANAGED_METHOD),
            SimpleFrameKind::RuntimeUnmanagedCode => self.filter.contains(FrameFilter::RUNTIME_UNMANAGED),
            SimpleFrameKind::Unrecognized => self.filter.contains(FrameFilter::UNRECOGNIZED),
        }
    }

    // Stack position of the current frame: the frame object's address for chained
    // frames, the stack pointer for code frames.
    fn position(&self) -> usize {
        match self.runtime_frame {
            Some(f) => f,
            None => self.regs.get_option(RegisterIdx::Rsp).map_or(0, |(v, _)| v as usize),
        }
    }

    fn seek(&mut self) -> Result<()> {
        self.bytes_skipped = 0;
        loop {
            let before = self.position();
            self.advance_raw()?;
            if self.exhausted || self.passes() {
                return Ok(());
            }
            self.bytes_skipped += self.position().saturating_sub(before);
        }
    }

    fn advance_raw(&mut self) -> Result<()> {
        let core = unsafe {&mut *self.guard.core_ptr()};
        self.depth += 1;
        if self.depth > core.config.max_walk_depth {
            return err!(ProcessState, "stack too deep on thread {}", self.tid);
        }

        if let Some(f) = self.runtime_frame.take() {
            self.chain = self.read_chain_link(f)?;
        } else {
            // Leaving a code frame: figure out its caller now, so we know which
            // chained frame objects sit between the two.
            self.unwind_step()?;
        }

        let limit = match &self.next_regs {
            Some(r) => r.get(RegisterIdx::Rsp)?.0 as usize,
            None => usize::MAX, // code frames exhausted, drain the chain
        };
        if !is_sentinel(self.chain) && self.chain < limit {
            let f = self.chain;
            self.classify_chained(f)?;
            self.runtime_frame = Some(f);
            return Ok(());
        }
        match self.next_regs.take() {
            Some(r) => {
                self.regs = r;
                self.classify_code();
            }
            None => self.exhausted = true,
        }
        Ok(())
    }

    fn reset_chain(&mut self) -> Result<()> {
        self.chain = self.chain_head;
        let (rsp, _) = self.regs.get(RegisterIdx::Rsp)?;
        while !is_sentinel(self.chain) && self.chain < rsp as usize {
            self.chain = self.read_chain_link(self.chain)?;
        }
        Ok(())
    }

    fn read_chain_link(&mut self, f: TargetAddr) -> Result<TargetAddr> {
        let core = unsafe {&mut *self.guard.core_ptr()};
        // The frame object is already marshaled by the time we follow its link, so
        // this is a cache hit in the common path.
        core.instantiate_by_vtable(f, FRAME_OBJECT_MIN_SIZE)?;
        let next = core.read_marshaled_word(f + FRAME_CHAIN_LINK_OFFSET)?;
        if !is_sentinel(next) && next <= f {
            return err!(Inconsistent, "frame chain not monotonic: @{:x} -> @{:x}", f, next);
        }
        Ok(next)
    }

    fn classify_chained(&mut self, f: TargetAddr) -> Result<()> {
        let core = unsafe {&mut *self.guard.core_ptr()};
        let p = core.instantiate_by_vtable(f, FRAME_OBJECT_MIN_SIZE)?;
        let desc = core.poly_desc_for_host(p)?;
        self.simple = SimpleFrameKind::RuntimeUnmanagedCode;
        self.detail = detail_for_poly(desc.kind);
        self.method = None;
        Ok(())
    }

    fn classify_code(&mut self) {
        let core = unsafe {&mut *self.guard.core_ptr()};
        self.method = None;
        let rip = match self.regs.get_option(RegisterIdx::Rip) {
            Some((v, _)) => v as usize,
            None => {
                self.simple = SimpleFrameKind::Unrecognized;
                self.detail = DetailedFrameKind::Unknown;
                return;
            }
        };
        if let Some(m) = core.metadata.method_for_ip(rip) {
            self.method = Some(m);
            self.simple = SimpleFrameKind::ManagedMethod;
            self.detail = DetailedFrameKind::ManagedMethod;
        } else if core.in_runtime_image(rip) {
            self.simple = SimpleFrameKind::RuntimeUnmanagedCode;
            self.detail = DetailedFrameKind::RuntimeCode;
        } else {
            self.simple = SimpleFrameKind::Unrecognized;
            self.detail = DetailedFrameKind::Unknown;
        }
    }

    // One frame-pointer unwind step. Leaves next_regs empty when the chain bottoms
    // out (no frame pointer, or a zero return address).
    fn unwind_step(&mut self) -> Result<()> {
        let core = unsafe {&mut *self.guard.core_ptr()};
        let rbp = match self.regs.get_option(RegisterIdx::Rbp) {
            Some((v, _)) => v,
            None => return Ok(()),
        };
        if rbp == 0 {
            return Ok(());
        }
        let (rsp, _) = self.regs.get(RegisterIdx::Rsp)?;
        // rbp is 16-aligned in every prologue-using frame; anything else means we're
        // chasing data, not frames.
        if rbp & 0xf != 0 {
            return err!(Inconsistent, "misaligned frame pointer 0x{:x} on thread {}", rbp, self.tid);
        }
        if rbp < rsp {
            return err!(Inconsistent, "frame pointer 0x{:x} below stack pointer 0x{:x} on thread {}", rbp, rsp, self.tid);
        }
        let saved_rbp = core.read_marshaled_word(rbp as usize)? as u64;
        let ret = core.read_marshaled_word(rbp as usize + mem::size_of::<usize>())? as u64;
        if ret == 0 {
            return Ok(());
        }
        let mut r = Registers::default();
        // Callee-saved values survive the call, but we can't prove the callee didn't
        // save and modify them, hence dubious.
        for reg in [RegisterIdx::Rbx, RegisterIdx::R12, RegisterIdx::R13, RegisterIdx::R14, RegisterIdx::R15] {
            if let Some((v, _)) = self.regs.get_option(reg) {
                r.set(reg, v, true);
            }
        }
        let cfa = match rbp.checked_add(2 * mem::size_of::<usize>() as u64) {
            Some(c) => c,
            None => return err!(Inconsistent, "frame pointer 0x{:x} wraps the address space on thread {}", rbp, self.tid),
        };
        r.set(RegisterIdx::Rip, ret, false);
        r.set(RegisterIdx::Rsp, cfa, false);
        r.set(RegisterIdx::Cfa, cfa, false);
        if saved_rbp != 0 {
            r.set(RegisterIdx::Rbp, saved_rbp, true);
        }
        self.next_regs = Some(r);
        Ok(())
    }
}
