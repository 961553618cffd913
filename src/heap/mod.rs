//! The heap engine: request routing, the master-block tree and zone growth.
//!
//! A heap is a tree of master blocks whose leaves are allocation zones.
//! Allocation walks the calling thread's private state first (hoard, then
//! block cache), descends the tree on a miss and grows a zone (or maps a
//! new one) when nothing has room. Freeing never walks the tree: the
//! block locator recovers the owning allocation block from the pointer
//! alone in constant time.
//!
//! The only lock is the growth mutex, serializing first-time
//! initialization, zone creation and wilderness carving. Every hot-path
//! transition is a compare-and-set on an info word.

pub mod block;
pub mod master;
pub mod varblock;
pub mod zone;

use core::alloc::Layout;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::bitmap::{SlotClass, BLOCK, WORD};
use crate::heap::block::{chain, find_sub_block, free_slot, init_chain, locate, try_alloc};
use crate::heap::master::{Child, MasterBlock};
use crate::heap::varblock::{round_up, VarBlock, MAX_REGION};
use crate::heap::zone::PagesSource;
use crate::thread::ThreadState;

/// An error occurred when calling `free()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// A double-free was detected: the slot behind the pointer is already
    /// marked free.
    DoubleFreeDetected,
    /// The pointer does not belong to any live allocation of this heap.
    AllocationNotFound,
}

/// Blocks per general-purpose zone (32 KiB).
const ZONE_BLOCKS: usize = 64;

/// Depth bound for master-tree walks; each level multiplies capacity by
/// sixty-one, so this is far beyond any reachable shape.
const WALK_DEPTH: usize = 16;

/// What a request, after rounding and alignment analysis, asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    /// One slot of a fixed class.
    Fixed(SlotClass),
    /// A few bytes stored inline in a variable block's slot array.
    Inline(usize),
    /// A packed region of `bytes` (word-rounded), aligned to `align`.
    Region { bytes: usize, align: usize },
    /// A run of whole blocks in a dedicated zone.
    Run(usize),
}

impl Request {
    fn plan(predictor_variable: bool, size: usize, align: usize) -> Request {
        if align <= WORD {
            if matches!(size, 3 | 5..=7) && align == 1 && predictor_variable {
                return Request::Inline(size);
            }
            if let Some(class) = SlotClass::for_size(size.max(align)) {
                return Request::Fixed(class);
            }
            let bytes = round_up(size);
            if bytes <= MAX_REGION {
                return Request::Region { bytes, align };
            }
        } else {
            let bytes = round_up(size) + align;
            if bytes <= MAX_REGION {
                return Request::Region { bytes, align };
            }
        }
        Request::Run((size + BLOCK - 1) / BLOCK)
    }

    /// Hoard entry size that would satisfy this request, if hoarding
    /// applies to it at all.
    fn hoard_size(self) -> Option<usize> {
        match self {
            Request::Fixed(SlotClass::C1) => Some(WORD),
            Request::Region { bytes, .. } => Some(bytes),
            _ => None,
        }
    }

    /// Blocks to carve for a new allocation block serving this request.
    fn carve_blocks(self) -> usize {
        match self {
            Request::Fixed(_) => 1,
            _ => 2,
        }
    }

    /// Turn an engine-level region start into the user pointer.
    fn finish(self, addr: usize) -> *mut u8 {
        let user = match self {
            Request::Region { align, .. } if align > WORD => {
                (addr + align - 1) & !(align - 1)
            }
            _ => addr,
        };
        user as *mut u8
    }
}

/// A thread-caching heap over a pages source.
///
/// All methods take the calling thread's [`ThreadState`]; the state must
/// not be shared between threads (nothing enforces more than `&mut`
/// exclusivity, which is exactly the contract).
pub struct Heap<S: PagesSource> {
    source: S,
    /// Root of the master-block tree; zero until the first allocation.
    root: AtomicUsize,
    /// Serializes heap initialization, zone creation and carving.
    grow_lock: spin::Mutex<()>,
}

impl<S: PagesSource> Heap<S> {
    pub const fn new(source: S) -> Heap<S> {
        Heap {
            source,
            root: AtomicUsize::new(0),
            grow_lock: spin::Mutex::new(()),
        }
    }

    /// Allocate memory for `layout`. Returns null when the pages source is
    /// exhausted or the alignment exceeds the block size.
    pub fn alloc(&self, state: &mut ThreadState, layout: Layout) -> *mut u8 {
        let size = layout.size().max(1);
        let align = layout.align();
        if align > BLOCK {
            return ptr::null_mut();
        }
        let request = Request::plan(state.predictor.prefers_variable(), size, align);

        // Thread-local reserve first: popped slots still carry their bit.
        if let Some(needed) = request.hoard_size() {
            if let Some(addr) = state.hoard_pop(needed) {
                return request.finish(addr);
            }
        }

        // Recently used blocks, most recent first.
        let mut cached = [None; 8];
        for (slot, child) in cached.iter_mut().zip(state.cached()) {
            *slot = Some(child);
        }
        for child in cached.into_iter().flatten() {
            if let Some(addr) = Self::try_child(child, request) {
                state.promote(child);
                return request.finish(addr);
            }
        }

        state.note_miss(size);
        if let Some((addr, child)) = self.descend(request) {
            state.promote(child);
            return request.finish(addr);
        }
        match self.grow(state, request) {
            Some((addr, child)) => {
                if let Some(child) = child {
                    state.promote(child);
                }
                request.finish(addr)
            }
            None => ptr::null_mut(),
        }
    }

    /// Release the allocation behind `p`.
    ///
    /// # Safety
    /// `p` must be null or a pointer previously returned by this heap and
    /// not freed since.
    pub unsafe fn free(&self, state: &mut ThreadState, p: *mut u8) -> Result<(), FreeError> {
        if p.is_null() {
            return Ok(());
        }
        let addr = p as usize;
        let owner = locate(addr);
        if owner == 0 || owner % BLOCK != 0 {
            return Err(FreeError::AllocationNotFound);
        }
        if let Some(var) = VarBlock::from_block(owner) {
            return var.free(addr, state);
        }
        if addr % BLOCK == 0 {
            return self.free_run(owner, addr);
        }
        let sub = find_sub_block(owner, addr).ok_or(FreeError::AllocationNotFound)?;
        free_slot(sub, addr, state)
    }

    /// Resize the allocation behind `p`, moving it if it cannot grow in
    /// place. Mirrors the `GlobalAlloc` contract.
    ///
    /// # Safety
    /// `p` must have been returned by this heap for `layout` and not freed;
    /// `new_size` must be non-zero.
    pub unsafe fn realloc(
        &self,
        state: &mut ThreadState,
        p: *mut u8,
        layout: Layout,
        new_size: usize,
    ) -> *mut u8 {
        if p.is_null() {
            return match Layout::from_size_align(new_size, layout.align()) {
                Ok(new_layout) => self.alloc(state, new_layout),
                Err(_) => ptr::null_mut(),
            };
        }
        let addr = p as usize;
        let owner = locate(addr);
        let old_size = match self.size_of(owner, addr) {
            Some(size) => size,
            None => return ptr::null_mut(),
        };
        if new_size <= old_size {
            return p;
        }
        if let Some(var) = VarBlock::from_block(owner) {
            if addr > var.meta() {
                // Inline slots never grow in place.
            } else if var.try_grow(addr, new_size) {
                return p;
            }
        }
        let new_layout = match Layout::from_size_align(new_size, layout.align()) {
            Ok(new_layout) => new_layout,
            Err(_) => return ptr::null_mut(),
        };
        let q = self.alloc(state, new_layout);
        if !q.is_null() {
            // SAFETY: both regions are live and at least `old_size` bytes;
            // they cannot overlap, being distinct live allocations.
            unsafe { ptr::copy_nonoverlapping(p, q, old_size.min(new_size)) };
            // SAFETY: `p` is live and owned by the caller.
            let _ = unsafe { self.free(state, p) };
        }
        q
    }

    /// Usable bytes of the live allocation at `addr`.
    fn size_of(&self, owner: usize, addr: usize) -> Option<usize> {
        if owner == 0 || owner % BLOCK != 0 {
            return None;
        }
        if let Some(var) = VarBlock::from_block(owner) {
            return var.size_of(addr);
        }
        if addr % BLOCK == 0 {
            let master = MasterBlock::from_base(owner);
            return master
                .children()
                .any(|(_, child)| child == Child::Run(addr))
                .then(|| master.zone_end() - addr);
        }
        find_sub_block(owner, addr).map(|sub| sub.class.slot_size())
    }

    /// Attempt to serve `request` from one known child block.
    fn try_child(child: Child, request: Request) -> Option<usize> {
        match (child, request) {
            (Child::Fixed(base), Request::Fixed(class)) => chain(base)
                .filter(|sub| sub.class == class)
                .find_map(|sub| try_alloc(sub.bm, class)),
            (Child::Variable(payload), Request::Inline(len)) => {
                VarBlock::from_block(payload + BLOCK)?.alloc_inline(len)
            }
            (Child::Variable(payload), Request::Region { bytes, .. }) => {
                VarBlock::from_block(payload + BLOCK)?.alloc(bytes)
            }
            _ => None,
        }
    }

    /// Top-down walk of the master tree looking for a block with room.
    fn descend(&self, request: Request) -> Option<(usize, Child)> {
        let root = self.root.load(Ordering::Acquire);
        if root == 0 {
            return None;
        }
        let mut stack = [0usize; WALK_DEPTH];
        stack[0] = root;
        let mut top = 1;
        while top > 0 {
            top -= 1;
            let master = MasterBlock::from_base(stack[top]);
            for (_, child) in master.children() {
                match child {
                    Child::Master(base) => {
                        if top < WALK_DEPTH {
                            stack[top] = base;
                            top += 1;
                        }
                    }
                    _ => {
                        if let Some(addr) = Self::try_child(child, request) {
                            return Some((addr, child));
                        }
                    }
                }
            }
        }
        None
    }

    /// Slow path: carve a new allocation block (or map a new zone) for
    /// `request`. Serialized by the growth lock.
    fn grow(
        &self,
        state: &mut ThreadState,
        request: Request,
    ) -> Option<(usize, Option<Child>)> {
        let _guard = self.grow_lock.lock();
        // A racing thread may have grown the heap already.
        if let Some((addr, child)) = self.descend(request) {
            return Some((addr, Some(child)));
        }

        if let Request::Run(blocks) = request {
            // Large runs get a dedicated zone: master block, then payload.
            // The run starts right after the master, so the locator
            // resolves any run pointer through the master's info word.
            let total = (blocks + 1) * BLOCK;
            let base = self.source.acquire(total, BLOCK)?.as_ptr() as usize;
            let master = MasterBlock::init(base, base + total);
            master.carve(blocks);
            master.insert(Child::Run(base + BLOCK));
            return Some((base + BLOCK, None));
        }

        let blocks = request.carve_blocks();
        let master = self.zone_with_space(blocks)?;
        let base = master.carve(blocks)?;
        // A variable pair ending at the carve edge records its successor
        // in its reserved slot (until now it held the wilderness address,
        // which is the same boundary).
        if base > master.base() + BLOCK {
            if let Some(var) = VarBlock::from_block(base - BLOCK) {
                var.set_next_block(base);
            }
        }
        let child = match request {
            Request::Fixed(class) => {
                init_chain(base, state.predictor.chain_plan(class));
                Child::Fixed(base)
            }
            _ => {
                VarBlock::init(base);
                Child::Variable(base)
            }
        };
        let registered = master.insert(child);
        debug_assert!(registered, "zone master vetted for a free child slot");
        let addr = Self::try_child(child, request)?;
        Some((addr, Some(child)))
    }

    /// A zone master with both wilderness room and a free child slot,
    /// creating and linking a fresh zone when none qualifies.
    fn zone_with_space(&self, blocks: usize) -> Option<MasterBlock> {
        let root = self.root.load(Ordering::Acquire);
        if root != 0 {
            let mut stack = [0usize; WALK_DEPTH];
            stack[0] = root;
            let mut top = 1;
            while top > 0 {
                top -= 1;
                let master = MasterBlock::from_base(stack[top]);
                if master.zone_end() - master.wilderness() >= blocks * BLOCK
                    && master.has_free_slot()
                {
                    return Some(master);
                }
                for (_, child) in master.children() {
                    if let Child::Master(base) = child {
                        if top < WALK_DEPTH {
                            stack[top] = base;
                            top += 1;
                        }
                    }
                }
            }
        }

        let total = ZONE_BLOCKS * BLOCK;
        let base = self.source.acquire(total, BLOCK)?.as_ptr() as usize;
        let master = MasterBlock::init(base, base + total);
        if root == 0 {
            self.root.store(base, Ordering::Release);
            return Some(master);
        }
        // Link under any master with room; when the whole tree is full the
        // new master adopts the old root and becomes the root itself.
        let mut stack = [0usize; WALK_DEPTH];
        stack[0] = root;
        let mut top = 1;
        while top > 0 {
            top -= 1;
            let node = MasterBlock::from_base(stack[top]);
            if node.insert(Child::Master(base)) {
                return Some(master);
            }
            for (_, child) in node.children() {
                if let Child::Master(child_base) = child {
                    if top < WALK_DEPTH {
                        stack[top] = child_base;
                        top += 1;
                    }
                }
            }
        }
        master.insert(Child::Master(root));
        self.root.store(base, Ordering::Release);
        Some(master)
    }

    /// Free a whole-block run: unregister it from its master and return
    /// the dedicated zone to the pages source.
    fn free_run(&self, owner: usize, addr: usize) -> Result<(), FreeError> {
        let master = MasterBlock::from_base(owner);
        let run = master
            .children()
            .find(|&(_, child)| child == Child::Run(addr))
            .ok_or(FreeError::AllocationNotFound)?;
        let bytes = master.zone_end() - master.base();
        master.remove(run.0);
        let base = NonNull::new(master.base() as *mut u8).ok_or(FreeError::AllocationNotFound)?;
        // SAFETY: the dedicated zone was acquired in `grow` with exactly
        // this base and extent, and its only allocation is gone.
        unsafe { self.source.release(base, bytes) };
        Ok(())
    }
}
