use crate::{*, error::*, target::*, util::*};
use bitflags::bitflags;
use std::{alloc::{alloc, dealloc, Layout}, mem, ptr, slice};

// Storage for marshaled copies of target memory. All instances must stay alive as long
// as anybody may hold a host pointer to one of them, and we can't know when that is,
// so nothing is freed individually - everything lives until the next flush. That turns
// allocation into a sweep over large blocks instead of a real allocator. The only
// complication is alignment: the header size is a multiple of the instance alignment,
// so a payload right after an aligned header is itself aligned.

pub const INSTANCE_ALIGN: usize = 16;
pub const INSTANCE_SIG: u16 = 0xdac1;

const BLOCK_ALLOCATION: usize = 0x40000;

// Accesses cluster spatially (the runtime's data structures are packed together), so
// hash on low/mid bits of the target address to spread neighbors across buckets.
// Not all the way down to the LSB: most accesses are at least word-aligned.
const HASH_BITS: usize = 10;
const HASH_SHIFT: usize = 2;
const HASH_SIZE: usize = 1 << HASH_BITS;

fn hash_addr(addr: TargetAddr) -> usize { (addr >> HASH_SHIFT) & (HASH_SIZE - 1) }

// How a marshaled instance was produced. Direct and Poly copies of the same address
// are incompatible: reinterpreting one as the other is a bug in the caller, not
// something we paper over.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Usage {
    Direct = 0, // fixed-layout copy, type known statically by the caller
    Poly = 1,   // type identified from the object's vtable pointer at marshal time
    StrA = 2,   // NUL-terminated byte string
    StrW = 3,   // NUL-terminated 16-bit string
    Pal = 4,    // host-only synthetic instance, never backed by target memory
}

bitflags! {
    pub struct InstanceFlags: u8 {
        // Set once the instance has been reported to a dump writer, so enumeration
        // passes don't report the same memory twice.
        const ENUM_MARKED = 0x1;
        // Same idea, for the per-method enumeration pass.
        const METHOD_ENUM_MARKED = 0x2;
        // Never report this instance to a dump writer.
        const NO_REPORT = 0x4;
    }
}

// Header preceding every payload in a cache block. The signature is what lets us take
// an arbitrary host pointer and decide whether it points at (or into) something we
// marshaled, without reading garbage.
#[repr(C)]
pub struct Instance {
    next: *mut Instance, // hash chain, or superseded list once deregistered
    pub addr: TargetAddr,
    pub size: u32,
    pub sig: u16,
    pub usage: Usage,
    pub flags: InstanceFlags,
    pad: u64, // keep the header a multiple of INSTANCE_ALIGN
}

const _: () = assert!(mem::size_of::<Instance>() % INSTANCE_ALIGN == 0);

impl Instance {
    pub fn payload(&self) -> &[u8] {
        unsafe {slice::from_raw_parts((self as *const Instance).add(1) as *const u8, self.size as usize)}
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe {slice::from_raw_parts_mut((self as *mut Instance).add(1) as *mut u8, self.size as usize)}
    }

    pub fn payload_host_addr(&self) -> usize { self as *const Instance as usize + mem::size_of::<Instance>() }

    // The header immediately precedes the payload. The caller must check `sig` before
    // trusting anything else in the result.
    pub unsafe fn from_payload(p: *const u8) -> *mut Instance { (p as *mut Instance).sub(1) }
}

struct Block {
    data: *mut u8,
    capacity: usize,
    used: usize,
}
unsafe impl Send for Block {}

impl Block {
    fn new(capacity: usize) -> Result<Block> {
        let layout = Layout::from_size_align(capacity, INSTANCE_ALIGN).unwrap();
        let p = unsafe {alloc(layout)};
        if p.is_null() {
            return err!(OutOfMemory, "failed to allocate 0x{:x} byte cache block", capacity);
        }
        Ok(Block {data: p, capacity, used: 0})
    }

    fn contains(&self, p: usize) -> bool { p >= self.data as usize && p < self.data as usize + self.capacity }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { dealloc(self.data, Layout::from_size_align(self.capacity, INSTANCE_ALIGN).unwrap()); }
    }
}

pub struct InstanceCache {
    blocks: Vec<Block>,
    // One block kept across a flush so steady-state flush/refill doesn't hit the
    // system allocator every time.
    spare: Option<Block>,
    hash: Vec<*mut Instance>,
    // Deregistered but still-allocated instances (a larger copy of the same address
    // took their place in the index). Outstanding host pointers into them stay
    // readable until the next flush.
    superseded: *mut Instance,
    age: u64,
    max_instance_size: usize,

    num_instances: usize,
    inst_bytes: usize,
    block_bytes: usize,
}

unsafe impl Send for InstanceCache {}

impl InstanceCache {
    pub fn new(max_instance_size: usize) -> Self {
        Self {blocks: Vec::new(), spare: None, hash: vec![ptr::null_mut(); HASH_SIZE], superseded: ptr::null_mut(), age: 0, max_instance_size, num_instances: 0, inst_bytes: 0, block_bytes: 0}
    }

    // Incremented on every flush. Anything that caches host pointers must remember the
    // age they were created under and treat a mismatch as "start over".
    pub fn age(&self) -> u64 { self.age }

    pub fn stats(&self) -> (/*instances*/ usize, /*instance bytes*/ usize, /*block bytes*/ usize) {
        (self.num_instances, self.inst_bytes, self.block_bytes)
    }

    fn full_size(size: u32) -> usize { mem::size_of::<Instance>() + align_up(size as usize, INSTANCE_ALIGN) }

    // Carves out header + payload space. Does not populate the payload and does not
    // register the instance in the lookup index; the caller does that after the
    // target read succeeds (or hands the space back with return_alloc if it doesn't).
    pub fn alloc(&mut self, addr: TargetAddr, size: u32, usage: Usage) -> Result<*mut Instance> {
        if size == 0 || size as usize > self.max_instance_size {
            return err!(OutOfMemory, "instance size 0x{:x} out of range (max 0x{:x})", size, self.max_instance_size);
        }
        let full = Self::full_size(size);

        let idx = match self.blocks.iter().position(|b| b.capacity - b.used >= full) {
            Some(i) => i,
            None => {
                let capacity = BLOCK_ALLOCATION.max(full + INSTANCE_ALIGN);
                let mut block = None;
                if self.spare.as_ref().is_some_and(|b| b.capacity >= capacity) {
                    block = self.spare.take();
                }
                let block = match block {
                    Some(b) => b,
                    None => Block::new(capacity)?,
                };
                self.block_bytes += block.capacity;
                self.blocks.push(block);
                self.blocks.len() - 1
            }
        };

        let b = &mut self.blocks[idx];
        let inst = unsafe {b.data.add(b.used) as *mut Instance};
        b.used += full;
        unsafe { ptr::write(inst, Instance {next: ptr::null_mut(), addr, size, sig: INSTANCE_SIG, usage, flags: InstanceFlags::empty(), pad: 0}); }
        self.num_instances += 1;
        self.inst_bytes += full;
        Ok(inst)
    }

    // Hands back a just-allocated, never-registered instance, e.g. after the target
    // read into it failed. Storage is actually reclaimed only if this was the latest
    // allocation in its block; otherwise it just becomes a hole until the next flush.
    pub fn return_alloc(&mut self, inst: *mut Instance) {
        let full = Self::full_size(unsafe {(*inst).size});
        let p = inst as usize;
        for b in &mut self.blocks {
            if b.contains(p) {
                unsafe {(*inst).sig = 0};
                if p + full == b.data as usize + b.used {
                    b.used -= full;
                }
                self.num_instances -= 1;
                self.inst_bytes -= full;
                return;
            }
        }
        debug_assert!(false, "return_alloc of a pointer outside all blocks");
    }

    pub fn find(&self, addr: TargetAddr) -> Option<*mut Instance> {
        let mut cur = self.hash[hash_addr(addr)];
        while !cur.is_null() {
            if unsafe {(*cur).addr} == addr {
                return Some(cur);
            }
            cur = unsafe {(*cur).next};
        }
        None
    }

    // Registers an allocated instance in the lookup index, at the head of its chain.
    // When promoting (a bigger copy of an already-cached address), call this for the
    // new instance before superseding the old one: a concurrent lookup then sees
    // either the old record or the new one, never neither.
    pub fn add(&mut self, inst: *mut Instance) {
        let b = hash_addr(unsafe {(*inst).addr});
        unsafe {(*inst).next = self.hash[b]};
        self.hash[b] = inst;
    }

    // Removes the instance from the lookup index but keeps its storage reachable for
    // outstanding host pointers. Dies for real at the next flush.
    pub fn supersede(&mut self, inst: *mut Instance) {
        let b = hash_addr(unsafe {(*inst).addr});
        let mut prev: *mut Instance = ptr::null_mut();
        let mut cur = self.hash[b];
        while !cur.is_null() {
            if cur == inst {
                unsafe {
                    if prev.is_null() {
                        self.hash[b] = (*cur).next;
                    } else {
                        (*prev).next = (*cur).next;
                    }
                    (*inst).next = self.superseded;
                }
                self.superseded = inst;
                return;
            }
            prev = cur;
            cur = unsafe {(*cur).next};
        }
        debug_assert!(false, "superseding an instance that isn't registered");
    }

    // Reclaims everything, including the superseded list (by definition no read is
    // legitimately in flight across a flush). Advances the instance age.
    pub fn flush(&mut self, save_block: bool) {
        self.hash.iter_mut().for_each(|p| *p = ptr::null_mut());
        self.superseded = ptr::null_mut();
        self.num_instances = 0;
        self.inst_bytes = 0;
        self.block_bytes = 0;
        self.age += 1;

        if save_block && self.spare.is_none() {
            if let Some(i) = self.blocks.iter().position(|b| b.capacity == BLOCK_ALLOCATION) {
                let mut b = self.blocks.swap_remove(i);
                b.used = 0;
                self.spare = Some(b);
            }
        }
        self.blocks.clear();
    }

    // Best-effort push of the instance's current payload back to the target. Only
    // meaningful for host-initiated mutation of target state; there's no dirty
    // tracking or coalescing.
    pub fn write_back(&mut self, inst: *mut Instance, space: &mut dyn AddressSpace) -> Result<()> {
        let i = unsafe {&*inst};
        if i.addr == NULL_ADDR {
            return err!(Usage, "write_back of a host-only instance");
        }
        let payload = i.payload();
        let n = space.write_virtual(i.addr, payload)?;
        if n < payload.len() {
            return err!(Unreadable, "short write @{:x}: 0x{:x} of 0x{:x} bytes", i.addr, n, payload.len());
        }
        Ok(())
    }

    // Visits all live (non-superseded) instances, e.g. for a dump writer.
    pub fn for_each_instance(&self, f: &mut dyn FnMut(&Instance)) {
        for bucket in &self.hash {
            let mut cur = *bucket;
            while !cur.is_null() {
                f(unsafe {&*cur});
                cur = unsafe {(*cur).next};
            }
        }
    }

    // Resets the one-shot enumeration bits so a new enumeration pass starts clean.
    pub fn clear_enum_marks(&mut self) {
        let clear_list = |mut cur: *mut Instance| {
            while !cur.is_null() {
                unsafe {
                    (*cur).flags.remove(InstanceFlags::ENUM_MARKED | InstanceFlags::METHOD_ENUM_MARKED);
                    cur = (*cur).next;
                }
            }
        };
        for bucket in &self.hash {
            clear_list(*bucket);
        }
        clear_list(self.superseded);
    }

    // For the interior-pointer search: the allocated extent of the block containing a
    // host pointer, or None if the pointer isn't ours at all. The backward signature
    // scan must never step outside this range.
    pub fn host_block_bounds(&self, p: usize) -> Option<(usize, usize)> {
        for b in &self.blocks {
            if b.contains(p) {
                return Some((b.data as usize, b.data as usize + b.used));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use crate::{*, cache::*, error::*};
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn cache() -> InstanceCache { InstanceCache::new(0x0400_0000) }

    #[test]
    fn alloc_find() {
        let mut c = cache();
        let inst = c.alloc(0x1000, 24, Usage::Direct).unwrap();
        unsafe {(*inst).payload_mut().copy_from_slice(&[7u8; 24])};
        assert!(c.find(0x1000).is_none()); // not registered yet
        c.add(inst);
        let found = c.find(0x1000).unwrap();
        assert_eq!(found, inst);
        let i = unsafe {&*found};
        assert_eq!(i.size, 24);
        assert_eq!(i.sig, INSTANCE_SIG);
        assert_eq!(i.usage, Usage::Direct);
        assert_eq!(i.payload(), &[7u8; 24]);
        assert_eq!(i.payload_host_addr() % INSTANCE_ALIGN, 0);
        assert!(c.find(0x1008).is_none());
    }

    #[test]
    fn supersede_keeps_old_readable() {
        let mut c = cache();
        let small = c.alloc(0x2000, 8, Usage::Direct).unwrap();
        unsafe {(*small).payload_mut().copy_from_slice(&[1u8; 8])};
        c.add(small);

        let big = c.alloc(0x2000, 32, Usage::Direct).unwrap();
        c.add(big);
        c.supersede(small);

        assert_eq!(c.find(0x2000).unwrap(), big);
        // The old copy is out of the index but its bytes are still there.
        assert_eq!(unsafe {(*small).payload()}, &[1u8; 8]);
    }

    #[test]
    fn return_alloc_rewinds_tail() {
        let mut c = cache();
        let a = c.alloc(0x3000, 16, Usage::Direct).unwrap();
        let b = c.alloc(0x3100, 16, Usage::Direct).unwrap();
        c.return_alloc(b);
        let (n, _, _) = c.stats();
        assert_eq!(n, 1);
        // Space was reclaimed, so the next allocation lands where b was.
        let b2 = c.alloc(0x3200, 16, Usage::Direct).unwrap();
        assert_eq!(b2, b);
        c.add(a);
        c.add(b2);
    }

    #[test]
    fn flush_resets_and_ages() {
        let mut c = cache();
        let inst = c.alloc(0x4000, 8, Usage::Direct).unwrap();
        c.add(inst);
        assert_eq!(c.age(), 0);
        c.flush(true);
        assert_eq!(c.age(), 1);
        assert!(c.find(0x4000).is_none());
        assert_eq!(c.stats().0, 0);
        // Spare block gets reused instead of reallocating.
        let inst2 = c.alloc(0x4000, 8, Usage::Direct).unwrap();
        assert_eq!(inst2 as usize, inst as usize);
    }

    #[test]
    fn size_ceiling() {
        let mut c = InstanceCache::new(1 << 20);
        assert!(c.alloc(0x5000, 0, Usage::Direct).unwrap_err().is_out_of_memory());
        assert!(c.alloc(0x5000, (1 << 20) + 1, Usage::Direct).unwrap_err().is_out_of_memory());
        assert!(c.alloc(0x5000, 1 << 20, Usage::Direct).is_ok());
    }

    #[test]
    fn oversized_instance_gets_own_block() {
        let mut c = cache();
        let inst = c.alloc(0x6000, 0x50000, Usage::Direct).unwrap();
        c.add(inst);
        assert_eq!(unsafe {(*inst).size}, 0x50000);
        let small = c.alloc(0x7000, 8, Usage::Direct).unwrap();
        c.add(small);
        assert_eq!(c.find(0x6000).unwrap(), inst);
        assert_eq!(c.find(0x7000).unwrap(), small);
    }

    #[test]
    fn host_block_bounds() {
        let mut c = cache();
        let inst = c.alloc(0x8000, 64, Usage::Direct).unwrap();
        let payload = unsafe {(*inst).payload_host_addr()};
        let (start, end) = c.host_block_bounds(payload + 10).unwrap();
        assert!(start <= inst as usize && payload + 64 <= end);
        assert!(c.host_block_bounds(0x1234).is_none());
    }

    #[test]
    fn stress_many_instances() {
        let mut rng = StdRng::seed_from_u64(0xdac);
        let mut c = cache();
        let mut expected: Vec<(TargetAddr, u8, u32)> = Vec::new();
        for i in 0..2000 {
            let addr = 0x10000 + i * 0x40;
            let size = rng.gen_range(1..200u32);
            let fill = rng.gen::<u8>();
            let inst = c.alloc(addr, size, Usage::Direct).unwrap();
            unsafe {(*inst).payload_mut().fill(fill)};
            c.add(inst);
            expected.push((addr, fill, size));
        }
        for (addr, fill, size) in expected {
            let i = unsafe {&*c.find(addr).unwrap()};
            assert_eq!(i.size, size);
            assert!(i.payload().iter().all(|&b| b == fill));
        }
        assert_eq!(c.stats().0, 2000);
    }

    #[test]
    fn enum_marks() {
        let mut c = cache();
        for i in 0..5 {
            let inst = c.alloc(0x9000 + i * 16, 8, Usage::Direct).unwrap();
            c.add(inst);
        }
        let mut count = 0;
        c.for_each_instance(&mut |_| count += 1);
        assert_eq!(count, 5);

        let inst = c.find(0x9000).unwrap();
        unsafe {(*inst).flags.insert(InstanceFlags::ENUM_MARKED)};
        c.clear_enum_marks();
        assert!(unsafe {(*inst).flags}.is_empty());
    }
}
