use crate::{*, error::*, cache::*, session::*, target::*, util::*, vtable::*};
use std::{mem, slice};

// Marshaling proper: pulling copies of target memory into the instance cache and
// translating pointers in both directions. All target-supplied values (sizes, vtable
// pointers, string lengths, chain links) are validated before they're acted on; a
// corrupt target gets an Inconsistent error, never a bad host access.

impl DacCore {
    // Copy `size` bytes at `addr` into the cache (or return the existing copy) and
    // hand back a host pointer to the payload. Sentinel addresses pass through
    // unchanged so that pointer fields survive marshaling without special-casing.
    //
    // A cached copy that is large enough satisfies any smaller request for the same
    // address. A larger request supersedes the old copy; the old payload stays
    // readable until the next flush, so host pointers handed out earlier don't dangle.
    pub fn instantiate_by_address(&mut self, addr: TargetAddr, size: u32, report: bool) -> Result<*mut u8> {
        if is_sentinel(addr) {
            return Ok(addr as *mut u8);
        }
        if size == 0 {
            return err!(Usage, "zero-size request @{:x}", addr);
        }
        if addr.checked_add(size as usize).is_none() {
            return err!(Inconsistent, "request @{:x} size 0x{:x} wraps the address space", addr, size);
        }
        let mut old = None;
        if let Some(hit) = self.cache.find(addr) {
            let h = unsafe {&mut *hit};
            if h.usage == Usage::Poly {
                self.report_usage_error(format!("fixed-layout request @{:x} over a vtable-marshaled object", addr));
                return err!(Usage, "instance @{:x} was marshaled by vtable", addr);
            }
            if h.size >= size {
                if report {
                    h.flags.remove(InstanceFlags::NO_REPORT);
                }
                return Ok(h.payload_host_addr() as *mut u8);
            }
            old = Some(hit);
        }
        let inst = self.cache.alloc(addr, size, Usage::Direct)?;
        if !report {
            unsafe {(*inst).flags.insert(InstanceFlags::NO_REPORT)};
        }
        if let Err(e) = read_fully(&mut *self.target, addr, unsafe {(*inst).payload_mut()}) {
            self.cache.return_alloc(inst);
            return Err(e);
        }
        // Register the new copy before superseding the old one, so a lookup always
        // finds one of them.
        self.cache.add(inst);
        if let Some(old) = old {
            self.cache.supersede(old);
        }
        Ok(unsafe {(*inst).payload_host_addr()} as *mut u8)
    }

    // Marshal a polymorphic object whose concrete type is only knowable from its
    // vtable pointer. The copy's first pointer-width slot is overwritten with a host
    // marker; nothing may ever dispatch through the copied vtable pointer, and the
    // concrete type stays recoverable from the copy alone.
    pub fn instantiate_by_vtable(&mut self, addr: TargetAddr, min_size: u32) -> Result<*mut u8> {
        if is_sentinel(addr) {
            return Ok(addr as *mut u8);
        }
        if let Some(hit) = self.cache.find(addr) {
            let h = unsafe {&*hit};
            if h.usage != Usage::Poly {
                self.report_usage_error(format!("vtable request @{:x} over a fixed-layout instance", addr));
                return err!(Usage, "instance @{:x} was marshaled as fixed-layout", addr);
            }
            if h.size < min_size {
                return err!(Inconsistent, "object @{:x} is 0x{:x} bytes, need at least 0x{:x}", addr, h.size, min_size);
            }
            return Ok(h.payload_host_addr() as *mut u8);
        }
        let vt = read_word(&mut *self.target, addr)?;
        let (index, desc) = match find_by_target_vtable(self.vtables, self.global_base, vt) {
            Some(x) => x,
            None => {
                self.report_inconsistency(format!("unrecognized vtable 0x{:x} for object @{:x}", vt, addr));
                return err!(Inconsistent, "unrecognized vtable 0x{:x} for object @{:x}", vt, addr);
            }
        };
        if desc.size < min_size {
            return err!(Inconsistent, "{} @{:x} is 0x{:x} bytes, need at least 0x{:x}", desc.name, addr, desc.size, min_size);
        }
        let inst = self.cache.alloc(addr, desc.size, Usage::Poly)?;
        if let Err(e) = read_fully(&mut *self.target, addr, unsafe {(*inst).payload_mut()}) {
            self.cache.return_alloc(inst);
            return Err(e);
        }
        unsafe {(*inst).payload_mut()[..mem::size_of::<usize>()].copy_from_slice(&host_marker(index).to_le_bytes())};
        self.cache.add(inst);
        Ok(unsafe {(*inst).payload_host_addr()} as *mut u8)
    }

    // Find the terminator of a NUL-terminated string without reading past it more
    // than a block at a time. Reads are chunked so that a string near the end of a
    // mapped region doesn't fail just because the block straddles the boundary.
    fn scan_string(&mut self, addr: TargetAddr, unit: usize, max_units: usize) -> Result<u32> {
        let block_bytes = self.config.string_scan_units * unit;
        let mut buf = vec![0u8; block_bytes];
        let mut pos = addr;
        let mut units = 0usize;
        loop {
            // Never shorter than one code unit: a wide string starting one byte before
            // a chunk boundary still spans it.
            let n = (block_bytes - pos % block_bytes).max(unit);
            let got = self.target.read_virtual(pos, &mut buf[..n])? / unit * unit;
            if got == 0 {
                return err!(Unreadable, "unreadable string data @{:x}", pos);
            }
            for off in (0..got).step_by(unit) {
                units += 1;
                let terminated = if unit == 1 {buf[off] == 0} else {buf[off] == 0 && buf[off + 1] == 0};
                if terminated {
                    return Ok((units * unit) as u32);
                }
                if units >= max_units {
                    return err!(Inconsistent, "string @{:x} exceeds {} units with no terminator", addr, max_units);
                }
            }
            pos = match pos.checked_add(got) {
                Some(p) => p,
                None => return err!(Inconsistent, "string scan wrapped the address space @{:x}", addr),
            };
        }
    }

    // Strings are marshaled terminator-inclusive, sized by scanning rather than by a
    // caller-supplied length. max_units bounds the scan; hitting it means the target
    // data isn't the string the caller thinks it is.
    pub fn instantiate_string(&mut self, addr: TargetAddr, unit: usize, max_units: usize, usage: Usage) -> Result<*mut u8> {
        if is_sentinel(addr) {
            return Ok(addr as *mut u8);
        }
        let mut old = None;
        if let Some(hit) = self.cache.find(addr) {
            let h = unsafe {&*hit};
            if h.usage == usage {
                return Ok(h.payload_host_addr() as *mut u8);
            }
            if h.usage == Usage::Poly {
                self.report_usage_error(format!("string request @{:x} over a vtable-marshaled object", addr));
                return err!(Usage, "instance @{:x} was marshaled by vtable", addr);
            }
            old = Some(hit);
        }
        let size = self.scan_string(addr, unit, max_units)?;
        let inst = self.cache.alloc(addr, size, usage)?;
        if let Err(e) = read_fully(&mut *self.target, addr, unsafe {(*inst).payload_mut()}) {
            self.cache.return_alloc(inst);
            return Err(e);
        }
        self.cache.add(inst);
        if let Some(old) = old {
            self.cache.supersede(old);
        }
        Ok(unsafe {(*inst).payload_host_addr()} as *mut u8)
    }

    // A host pointer is only accepted as "one of ours" if it sits in a cache block,
    // far enough in that a header fits behind it, and the header carries the
    // signature. Anything else is a caller bug, reported as Usage.
    pub(crate) fn checked_instance(&mut self, p: *const u8) -> Result<*mut Instance> {
        let pa = p as usize;
        let bounds = self.cache.host_block_bounds(pa);
        let valid = match bounds {
            Some((start, end)) => pa >= start + mem::size_of::<Instance>() && pa <= end,
            None => false,
        };
        if valid {
            let inst = unsafe {Instance::from_payload(p)};
            if unsafe {(*inst).sig} == INSTANCE_SIG {
                return Ok(inst);
            }
        }
        self.report_usage_error(format!("host pointer {:p} was not produced by marshaling", p));
        err!(Usage, "host pointer {:p} was not produced by marshaling", p)
    }

    // Reverse translation: host payload pointer back to the target address it was
    // marshaled from. Sentinels round-trip.
    pub fn target_addr_for_host(&mut self, p: *const u8) -> Result<TargetAddr> {
        if p.is_null() {
            return Ok(NULL_ADDR);
        }
        if p as usize == INVALID_ADDR {
            return Ok(INVALID_ADDR);
        }
        let inst = self.checked_instance(p)?;
        Ok(unsafe {(*inst).addr})
    }

    // Reverse translation for a pointer into the middle of a marshaled copy: scan
    // backwards through the owning block for the nearest instance header, verify it
    // against the lookup index, and map the offset. The scan never leaves the block
    // the pointer landed in and gives up after a bounded number of steps.
    pub fn target_addr_for_host_interior(&mut self, p: *const u8) -> Result<TargetAddr> {
        if p.is_null() {
            return Ok(NULL_ADDR);
        }
        if p as usize == INVALID_ADDR {
            return Ok(INVALID_ADDR);
        }
        let pa = p as usize;
        if let Some((start, end)) = self.cache.host_block_bounds(pa) {
            let mut cur = align_down(pa, INSTANCE_ALIGN);
            let mut iters = self.config.interior_search_iterations;
            while cur >= start && iters > 0 {
                if cur + mem::size_of::<Instance>() <= end {
                    let cand = cur as *mut Instance;
                    let c = unsafe {&*cand};
                    // The signature alone isn't proof (payload bytes can contain it);
                    // the lookup index is the authority on where headers are.
                    if c.sig == INSTANCE_SIG && self.cache.find(c.addr) == Some(cand) {
                        let pstart = c.payload_host_addr();
                        let pend = pstart + c.size as usize;
                        if pa >= pstart && pa < pend {
                            return Ok(c.addr + (pa - pstart));
                        }
                        // Nearest live instance below the pointer doesn't cover it,
                        // so the pointer is into padding or a header.
                        break;
                    }
                }
                if cur < start + INSTANCE_ALIGN {
                    break;
                }
                cur -= INSTANCE_ALIGN;
                iters -= 1;
            }
        }
        self.report_usage_error(format!("interior host pointer {:p} is not inside a marshaled instance", p));
        err!(Usage, "interior host pointer {:p} is not inside a marshaled instance", p)
    }

    pub(crate) fn poly_desc_for_host(&mut self, p: *const u8) -> Result<&'static VtableDesc> {
        let inst = self.checked_instance(p)?;
        if unsafe {(*inst).usage} != Usage::Poly {
            return err!(Usage, "host pointer {:p} is not a vtable-marshaled object", p);
        }
        let marker = usize::from_le_bytes(unsafe {(*inst).payload()}[..mem::size_of::<usize>()].try_into().unwrap());
        match find_by_host_marker(self.vtables, marker) {
            Some(d) => Ok(d),
            None => err!(Inconsistent, "corrupted host marker 0x{:x} in instance {:p}", marker, p),
        }
    }

    // The target-side vtable address a vtable-marshaled copy originally had (the copy
    // itself only holds the host marker).
    pub fn target_vtable_for_host(&mut self, p: *const u8) -> Result<TargetAddr> {
        let offset = self.poly_desc_for_host(p)?.vtable_offset;
        Ok(self.global_base + offset)
    }

    pub fn poly_type_name(&mut self, p: *const u8) -> Result<&'static str> {
        Ok(self.poly_desc_for_host(p)?.name)
    }

    // Name of the marshalable type a target vtable address belongs to, for
    // diagnostics and result formatting.
    pub fn vtable_name(&mut self, vt: TargetAddr) -> Result<&'static str> {
        match find_by_target_vtable(self.vtables, self.global_base, vt) {
            Some((_, d)) => Ok(d.name),
            None => err!(Inconsistent, "unrecognized vtable 0x{:x}", vt),
        }
    }

    // Host-only scratch instance: zeroed, not backed by target memory, never reported
    // to dump writers, and not registered in the address index.
    pub fn alloc_host_only(&mut self, size: u32) -> Result<*mut u8> {
        let inst = self.cache.alloc(NULL_ADDR, size, Usage::Pal)?;
        unsafe {
            (*inst).flags.insert(InstanceFlags::NO_REPORT);
            (*inst).payload_mut().fill(0);
        }
        Ok(unsafe {(*inst).payload_host_addr()} as *mut u8)
    }

    // Push the current payload bytes of a marshaled copy back into the target.
    pub fn write_host_instance(&mut self, p: *const u8) -> Result<()> {
        if p.is_null() || p as usize == INVALID_ADDR {
            return err!(Usage, "write of a sentinel host pointer");
        }
        let inst = self.checked_instance(p)?;
        self.cache.write_back(inst, &mut *self.target)
    }

    pub fn mark_method_enumerated(&mut self, p: *const u8) -> Result<()> {
        let inst = self.checked_instance(p)?;
        unsafe {(*inst).flags.insert(InstanceFlags::METHOD_ENUM_MARKED)};
        Ok(())
    }

    pub fn is_method_enumerated(&mut self, p: *const u8) -> Result<bool> {
        let inst = self.checked_instance(p)?;
        Ok(unsafe {(*inst).flags}.contains(InstanceFlags::METHOD_ENUM_MARKED))
    }

    // Word read through the cache, for pointer chasing (stack memory, chain links).
    // Not reported to dump writers: transient reads shouldn't bloat dumps.
    pub(crate) fn read_marshaled_word(&mut self, addr: TargetAddr) -> Result<usize> {
        let p = self.instantiate_by_address(addr, mem::size_of::<usize>() as u32, false)?;
        let bytes = unsafe {slice::from_raw_parts(p as *const u8, mem::size_of::<usize>())};
        Ok(usize::from_le_bytes(bytes.try_into().unwrap()))
    }
}

impl<'a> SessionGuard<'a> {
    pub fn instantiate_by_address(&self, addr: TargetAddr, size: u32, report: bool) -> Result<*mut u8> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.instantiate_by_address(addr, size, report))
    }

    pub fn instantiate_by_vtable(&self, addr: TargetAddr, min_size: u32) -> Result<*mut u8> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.instantiate_by_vtable(addr, min_size))
    }

    pub fn instantiate_str_a(&self, addr: TargetAddr, max_units: usize) -> Result<*mut u8> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.instantiate_string(addr, 1, max_units, Usage::StrA))
    }

    pub fn instantiate_str_w(&self, addr: TargetAddr, max_units: usize) -> Result<*mut u8> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.instantiate_string(addr, 2, max_units, Usage::StrW))
    }

    pub fn read_string_a(&self, addr: TargetAddr, max_units: usize) -> Result<String> {
        if is_sentinel(addr) {
            return err!(Usage, "string read at sentinel address 0x{:x}", addr);
        }
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| {
            let p = core.instantiate_string(addr, 1, max_units, Usage::StrA)?;
            let inst = unsafe {&*Instance::from_payload(p)};
            let bytes = inst.payload();
            Ok(String::from_utf8(bytes[..bytes.len() - 1].to_vec())?)
        })
    }

    pub fn read_string_w(&self, addr: TargetAddr, max_units: usize) -> Result<String> {
        if is_sentinel(addr) {
            return err!(Usage, "string read at sentinel address 0x{:x}", addr);
        }
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| {
            let p = core.instantiate_string(addr, 2, max_units, Usage::StrW)?;
            let inst = unsafe {&*Instance::from_payload(p)};
            let bytes = inst.payload();
            let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
            char::decode_utf16(units[..units.len() - 1].iter().copied())
                .collect::<std::result::Result<String, _>>()
                .map_err(|e| error!(Inconsistent, "invalid UTF-16 in string @{:x}: {}", addr, e))
        })
    }

    pub fn target_addr_for_host(&self, p: *const u8) -> Result<TargetAddr> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.target_addr_for_host(p))
    }

    pub fn target_addr_for_host_interior(&self, p: *const u8) -> Result<TargetAddr> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.target_addr_for_host_interior(p))
    }

    pub fn target_vtable_for_host(&self, p: *const u8) -> Result<TargetAddr> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.target_vtable_for_host(p))
    }

    pub fn poly_type_name(&self, p: *const u8) -> Result<&'static str> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.poly_type_name(p))
    }

    pub fn vtable_name(&self, vt: TargetAddr) -> Result<&'static str> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.vtable_name(vt))
    }

    pub fn alloc_host_only(&self, size: u32) -> Result<*mut u8> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.alloc_host_only(size))
    }

    pub fn write_host_instance(&self, p: *const u8) -> Result<()> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.write_host_instance(p))
    }

    pub fn mark_method_enumerated(&self, p: *const u8) -> Result<()> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.mark_method_enumerated(p))
    }

    pub fn is_method_enumerated(&self, p: *const u8) -> Result<bool> {
        let core = unsafe {&mut *self.core_ptr()};
        boundary(|| core.is_method_enumerated(p))
    }

    // Typed view of a fixed-layout copy. The reference is valid until the next flush;
    // borrowing it from the guard keeps the easy mistakes impossible.
    pub fn marshal<T: Copy>(&self, addr: TargetAddr) -> Result<&T> {
        if is_sentinel(addr) {
            return err!(Usage, "dereference of sentinel address 0x{:x}", addr);
        }
        if mem::align_of::<T>() > crate::cache::INSTANCE_ALIGN {
            return err!(Usage, "type alignment {} exceeds instance alignment", mem::align_of::<T>());
        }
        let core = unsafe {&mut *self.core_ptr()};
        let p = boundary(|| core.instantiate_by_address(addr, mem::size_of::<T>() as u32, true))?;
        Ok(unsafe {&*(p as *const T)})
    }

    pub fn marshal_slice<T: Copy>(&self, addr: TargetAddr, count: usize) -> Result<&[T]> {
        if is_sentinel(addr) {
            return err!(Usage, "dereference of sentinel address 0x{:x}", addr);
        }
        if mem::align_of::<T>() > crate::cache::INSTANCE_ALIGN {
            return err!(Usage, "type alignment {} exceeds instance alignment", mem::align_of::<T>());
        }
        let size = match count.checked_mul(mem::size_of::<T>()).filter(|&s| s <= u32::MAX as usize) {
            Some(s) => s as u32,
            None => return err!(Usage, "slice of {} elements is too large", count),
        };
        let core = unsafe {&mut *self.core_ptr()};
        let p = boundary(|| core.instantiate_by_address(addr, size, true))?;
        Ok(unsafe {slice::from_raw_parts(p as *const T, count)})
    }
}
