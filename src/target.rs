use crate::{*, error::*, registers::*};
use libc::pid_t;

// Address in the target's address space. Two values are reserved: NULL_ADDR and
// INVALID_ADDR. Every marshaling operation passes them through unchanged instead of
// dereferencing them, so they survive round trips through marshaled structures.
pub type TargetAddr = usize;

pub const NULL_ADDR: TargetAddr = 0;
pub const INVALID_ADDR: TargetAddr = usize::MAX;

pub fn is_sentinel(addr: TargetAddr) -> bool { addr == NULL_ADDR || addr == INVALID_ADDR }

// The target being inspected: live process, suspended process, or memory dump.
// Everything we know about it comes through this narrow byte-oriented interface;
// we never run target code and never trust target-supplied sizes or pointers.
//
// Reads are best-effort: a provider may return fewer bytes than requested (e.g. the
// range straddles an unmapped page). Callers that need the whole range use read_fully().
pub trait AddressSpace: Send {
    fn read_virtual(&mut self, addr: TargetAddr, buf: &mut [u8]) -> Result<usize>;

    // Absent on read-only targets (dumps).
    fn write_virtual(&mut self, _addr: TargetAddr, _buf: &[u8]) -> Result<usize> {
        err!(NotImplemented, "target is read-only")
    }

    fn get_thread_context(&mut self, tid: pid_t) -> Result<Registers>;

    fn set_thread_context(&mut self, _tid: pid_t, _regs: &Registers) -> Result<()> {
        err!(NotImplemented, "target is read-only")
    }

    // If the thread is suspended in the middle of exception dispatch, the context it had
    // at the fault site was saved aside; a stack walk should start from that instead of
    // the live context (which would be somewhere inside the runtime's unwinder).
    fn saved_filter_context(&mut self, _tid: pid_t) -> Result<Option<Registers>> { Ok(None) }

    // Head of the thread's chain of explicit runtime frame objects (transition frames
    // etc. that the runtime pushes on the stack), NULL_ADDR if none. Locating the
    // per-thread record is the provider's business; walking the chain is ours.
    fn frame_chain_head(&mut self, _tid: pid_t) -> Result<TargetAddr> { Ok(NULL_ADDR) }

    fn thread_ids(&mut self) -> Result<Vec<pid_t>>;
}

// Read exactly buf.len() bytes. A short read is a failure here, not a partial success:
// marshaled instances are all-or-nothing.
pub fn read_fully(space: &mut dyn AddressSpace, addr: TargetAddr, buf: &mut [u8]) -> Result<()> {
    let n = space.read_virtual(addr, buf)?;
    if n < buf.len() {
        return err!(Unreadable, "short read @{:x}: 0x{:x} of 0x{:x} bytes", addr, n, buf.len());
    }
    Ok(())
}

pub fn read_word(space: &mut dyn AddressSpace, addr: TargetAddr) -> Result<usize> {
    let mut buf = [0u8; 8];
    read_fully(space, addr, &mut buf)?;
    Ok(usize::from_le_bytes(buf))
}

// Symbol/metadata import. Opaque to the marshaling engine; the stack walker uses
// method_for_ip to tell managed code from everything else, the names are only for
// formatting results.
pub type MethodId = u64;

pub trait MetadataService: Send {
    fn method_for_ip(&mut self, ip: TargetAddr) -> Option<MethodId>;
    fn method_name(&mut self, method: MethodId) -> Result<String>;
    fn type_name(&mut self, module: TargetAddr, token: u32) -> Result<String>;
}

// For targets with no symbols at all. Classification still works off the runtime
// image range, just everything outside it is unrecognized.
pub struct NullMetadata;

impl MetadataService for NullMetadata {
    fn method_for_ip(&mut self, _ip: TargetAddr) -> Option<MethodId> { None }
    fn method_name(&mut self, method: MethodId) -> Result<String> { err!(NotImplemented, "no metadata for method {}", method) }
    fn type_name(&mut self, module: TargetAddr, token: u32) -> Result<String> { err!(NotImplemented, "no metadata for token {:x} in module @{:x}", token, module) }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::ops::Range;
    use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};

    // In-memory target for tests: a few mapped regions, per-thread contexts, and
    // counters so tests can assert which operations actually hit the "target".
    // The counters are shared so a test can keep watching them after the mock is
    // boxed up and moved into a session.
    pub struct MockTarget {
        pub regions: Vec<(TargetAddr, Vec<u8>)>,
        pub contexts: HashMap<pid_t, Registers>,
        pub filter_contexts: HashMap<pid_t, Registers>,
        pub frame_chains: HashMap<pid_t, TargetAddr>,
        pub reads: Arc<AtomicUsize>,
        pub writes: Arc<AtomicUsize>,
    }

    impl MockTarget {
        pub fn new() -> Self { Self {regions: Vec::new(), contexts: HashMap::new(), filter_contexts: HashMap::new(), frame_chains: HashMap::new(), reads: Arc::new(AtomicUsize::new(0)), writes: Arc::new(AtomicUsize::new(0))} }

        pub fn map(&mut self, addr: TargetAddr, bytes: Vec<u8>) {
            self.regions.push((addr, bytes));
            self.regions.sort_by_key(|(a, _)| *a);
        }

        pub fn map_words(&mut self, addr: TargetAddr, words: &[u64]) {
            let mut bytes = Vec::with_capacity(words.len() * 8);
            for w in words {
                bytes.extend_from_slice(&w.to_le_bytes());
            }
            self.map(addr, bytes);
        }

        pub fn poke_word(&mut self, addr: TargetAddr, val: u64) {
            for (start, data) in &mut self.regions {
                if addr >= *start && addr + 8 <= *start + data.len() {
                    data[addr - *start..addr - *start + 8].copy_from_slice(&val.to_le_bytes());
                    return;
                }
            }
            panic!("poke_word outside mapped regions: {:x}", addr);
        }

        pub fn word_at(&self, addr: TargetAddr) -> u64 {
            for (start, data) in &self.regions {
                if addr >= *start && addr + 8 <= *start + data.len() {
                    return u64::from_le_bytes(data[addr - *start..addr - *start + 8].try_into().unwrap());
                }
            }
            panic!("word_at outside mapped regions: {:x}", addr);
        }

        fn region_for(&self, addr: TargetAddr) -> Option<(usize, Range<usize>)> {
            for (i, (start, data)) in self.regions.iter().enumerate() {
                if addr >= *start && addr < *start + data.len() {
                    return Some((i, addr - *start..data.len()));
                }
            }
            None
        }
    }

    impl AddressSpace for MockTarget {
        fn read_virtual(&mut self, addr: TargetAddr, buf: &mut [u8]) -> Result<usize> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let (i, range) = match self.region_for(addr) {
                Some(x) => x,
                None => return err!(Unreadable, "unmapped address @{:x}", addr),
            };
            let avail = range.end - range.start;
            let n = buf.len().min(avail);
            buf[..n].copy_from_slice(&self.regions[i].1[range.start..range.start + n]);
            Ok(n)
        }

        fn write_virtual(&mut self, addr: TargetAddr, buf: &[u8]) -> Result<usize> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            let (i, range) = match self.region_for(addr) {
                Some(x) => x,
                None => return err!(Unreadable, "unmapped address @{:x}", addr),
            };
            let avail = range.end - range.start;
            let n = buf.len().min(avail);
            self.regions[i].1[range.start..range.start + n].copy_from_slice(&buf[..n]);
            Ok(n)
        }

        fn get_thread_context(&mut self, tid: pid_t) -> Result<Registers> {
            match self.contexts.get(&tid) {
                Some(r) => Ok(r.clone()),
                None => err!(ProcessState, "no thread {}", tid),
            }
        }

        fn set_thread_context(&mut self, tid: pid_t, regs: &Registers) -> Result<()> {
            self.contexts.insert(tid, regs.clone());
            Ok(())
        }

        fn saved_filter_context(&mut self, tid: pid_t) -> Result<Option<Registers>> {
            Ok(self.filter_contexts.get(&tid).cloned())
        }

        fn frame_chain_head(&mut self, tid: pid_t) -> Result<TargetAddr> {
            Ok(self.frame_chains.get(&tid).copied().unwrap_or(NULL_ADDR))
        }

        fn thread_ids(&mut self) -> Result<Vec<pid_t>> {
            let mut ids: Vec<pid_t> = self.contexts.keys().copied().collect();
            ids.sort();
            Ok(ids)
        }
    }

    pub struct MockMetadata {
        pub methods: Vec<(Range<TargetAddr>, MethodId)>,
    }

    impl MockMetadata {
        pub fn new() -> Self { Self {methods: Vec::new()} }
    }

    impl MetadataService for MockMetadata {
        fn method_for_ip(&mut self, ip: TargetAddr) -> Option<MethodId> {
            self.methods.iter().find(|(r, _)| r.contains(&ip)).map(|(_, m)| *m)
        }
        fn method_name(&mut self, method: MethodId) -> Result<String> { Ok(format!("method_{}", method)) }
        fn type_name(&mut self, _module: TargetAddr, token: u32) -> Result<String> { Ok(format!("Type{:x}", token)) }
    }
}

#[cfg(test)]
mod tests {
    use crate::{*, error::*, target::{*, mock::*}};

    #[test]
    fn short_read_is_failure() {
        let mut t = MockTarget::new();
        t.map(0x1000, vec![1u8; 4]);
        let mut buf = [0u8; 8];
        assert_eq!(t.read_virtual(0x1000, &mut buf).unwrap(), 4);
        let e = read_fully(&mut t, 0x1000, &mut buf).unwrap_err();
        assert!(e.is_unreadable());
        assert!(read_fully(&mut t, 0x1000, &mut buf[..4]).is_ok());
    }

    #[test]
    fn word_read() {
        let mut t = MockTarget::new();
        t.map_words(0x2000, &[0xdeadbeef, 42]);
        assert_eq!(read_word(&mut t, 0x2000).unwrap(), 0xdeadbeef);
        assert_eq!(read_word(&mut t, 0x2008).unwrap(), 42);
        assert!(read_word(&mut t, 0x3000).is_err());
    }
}
