use crate::target::*;

// Compiled-in registry of the polymorphic runtime types we know how to marshal.
// The only way to identify the concrete type of a polymorphic object in the target is
// its vtable pointer, and vtables live at fixed offsets from the runtime image base,
// so the registry stores offsets and the lookup adds the session's global base.
//
// On a match, the marshaled copy gets its first pointer-width slot overwritten with a
// host-side marker so that (a) nothing ever dispatches through a dangling target
// vtable pointer and (b) the concrete type can be recovered later from the copy alone.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PolyKind {
    // Explicit frame objects the runtime pushes on a thread's stack.
    TransitionFrame,
    HelperMethodFrame,
    ExceptionFrame,
    ExceptionFilterFrame,
    FuncEvalFrame,
    GcCoopFrame,
    // Polymorphic heap/runtime objects that aren't frames.
    Other,
}

pub struct VtableDesc {
    pub name: &'static str,
    // Target vtable address = session global base + this offset.
    pub vtable_offset: usize,
    // Size of the concrete type; this is what gets allocated and read.
    pub size: u32,
    pub kind: PolyKind,
}

// Host markers occupy a reserved pattern that can't collide with a plausible target
// vtable offset or with host heap pointers handed out by this crate (payloads are
// 16-aligned, markers are odd).
const HOST_MARKER_TAG: usize = 0xdac1_0000_0000_0001;

pub fn host_marker(index: usize) -> usize { HOST_MARKER_TAG | index << 16 }

pub fn index_of_host_marker(marker: usize) -> Option<usize> {
    if marker & 0xffff_0000_0000_ffff == HOST_MARKER_TAG {
        Some((marker >> 16) & 0xffff_ffff)
    } else {
        None
    }
}

pub fn find_by_target_vtable(table: &[VtableDesc], global_base: TargetAddr, vt: usize) -> Option<(usize, &VtableDesc)> {
    // Linear scan; the table is small and this only runs on a cache miss.
    table.iter().enumerate().find(|(_, d)| global_base.wrapping_add(d.vtable_offset) == vt)
}

pub fn find_by_host_marker(table: &[VtableDesc], marker: usize) -> Option<&VtableDesc> {
    index_of_host_marker(marker).and_then(|i| table.get(i))
}

// The frame types every supported target runtime build exposes. An embedding debugger
// generates its own table from the runtime's type catalog and passes it to the session;
// this one is enough for runtimes with the default frame layout, and for tests.
pub static RUNTIME_FRAME_VTABLES: [VtableDesc; 6] = [
    VtableDesc {name: "TransitionFrame", vtable_offset: 0x1000, size: 0x40, kind: PolyKind::TransitionFrame},
    VtableDesc {name: "HelperMethodFrame", vtable_offset: 0x1040, size: 0x60, kind: PolyKind::HelperMethodFrame},
    VtableDesc {name: "ExceptionFrame", vtable_offset: 0x1080, size: 0x80, kind: PolyKind::ExceptionFrame},
    VtableDesc {name: "ExceptionFilterFrame", vtable_offset: 0x10c0, size: 0x80, kind: PolyKind::ExceptionFilterFrame},
    VtableDesc {name: "FuncEvalFrame", vtable_offset: 0x1100, size: 0x50, kind: PolyKind::FuncEvalFrame},
    VtableDesc {name: "GcCoopFrame", vtable_offset: 0x1140, size: 0x30, kind: PolyKind::GcCoopFrame},
];

#[cfg(test)]
mod tests {
    use crate::vtable::*;

    #[test]
    fn marker_round_trip() {
        for i in [0usize, 1, 5, 0xffff] {
            assert_eq!(index_of_host_marker(host_marker(i)), Some(i));
        }
        assert_eq!(index_of_host_marker(0), None);
        assert_eq!(index_of_host_marker(0x7f00_0000_1234_5678), None);
        // Markers are odd, so they can't be mistaken for an aligned host pointer.
        assert!(host_marker(3) & 1 == 1);
    }

    #[test]
    fn target_lookup() {
        let base = 0x7f00_0000_0000usize;
        let (i, d) = find_by_target_vtable(&RUNTIME_FRAME_VTABLES, base, base + 0x1080).unwrap();
        assert_eq!(d.kind, PolyKind::ExceptionFrame);
        assert_eq!(RUNTIME_FRAME_VTABLES[i].name, "ExceptionFrame");
        assert!(find_by_target_vtable(&RUNTIME_FRAME_VTABLES, base, base + 0xdead).is_none());
    }
}
