//! Shared fuzzing and testing infrastructure for `brkalloc`.

use brkalloc::{
    usable_size, FixedBreak, GlobalLockHeap, HeapStats, LocalArena, SingleThreadedLock,
    SplitLockHeap, ThreadLocalHeap, HEADER_ALIGN, HEADER_SIZE,
};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::{collections::BTreeMap, ops::Range, ptr::NonNull};

/// The requested byte count of a test allocation.
//
// Note: a newtype rather than a bare `usize` so that it can have a default
// mutator that keeps sizes within something a test arena can actually hold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Size(pub usize);

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// The default mutator for [`Size`].
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self { max_size: 4096 }
    }
}

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() {
                size.0
            } else {
                self.max_size
            };
            size.0 = ctx.rng().gen_index(max_size + 1).unwrap();
            Ok(())
        })?;

        // Land right on, or right next to, a unit boundary.
        if !c.shrink() {
            c.mutation(|ctx| {
                let units = ctx.rng().gen_index(self.max_size / HEADER_SIZE + 1).unwrap();
                let nudge = ctx.rng().gen_index(3).unwrap();
                size.0 = (units * HEADER_SIZE + nudge)
                    .saturating_sub(1)
                    .min(self.max_size);
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Size> {
        let size = m::range(0..=self.max_size).generate(context)?;
        Ok(Size(size))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: Size },
    Release { id: u32 },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Release {
                    id: ctx.rng().gen_u32(),
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                Op::Release { .. } => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. } | Op::Release { id } => {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Release an existing allocation somewhere after it was made. Releases
        // of neighbours are what drive coalescing, so this is the interesting
        // one.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let release_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(release_index, Op::Release { id });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

/// Growth batches are kept small so that test runs grow the arena often.
const MIN_BATCH_UNITS: usize = 64;

/// The wire format for fuzzer inputs.
const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Are there no operations at all?
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Decode operations from the start of a fuzzer input. Trailing bytes are
    /// ignored.
    pub fn decode(data: &[u8]) -> Option<Self> {
        bincode::decode_from_slice(data, bincode_config())
            .ok()
            .map(|(ops, _)| ops)
    }

    /// Encode these operations into `buf`, dropping operations off the end
    /// until the encoding fits. Returns the encoded length, or `None` once
    /// even an empty sequence does not fit.
    pub fn encode_into(&mut self, buf: &mut [u8]) -> Option<usize> {
        loop {
            if let Ok(len) = bincode::encode_into_slice(&*self, buf, bincode_config()) {
                return Some(len);
            }
            if !self.pop() {
                return None;
            }
        }
    }

    /// Run these test operations against every heap variant, each over its
    /// own bounded arena, with the given allocation limit.
    pub fn run(&self, allocation_limit: usize) -> Result<(), String> {
        log::debug!("========== Running test operations ==========");

        {
            let mut region = Region::new(allocation_limit);
            let mut heap = GlobalLockHeap::new(
                region.brk(),
                SingleThreadedLock::new(),
                SingleThreadedLock::new(),
            )
            .with_min_batch(MIN_BATCH_UNITS);
            let live = self.run_on(&mut heap, region.bounds(), allocation_limit)?;
            teardown(&mut heap, live)?;
        }

        {
            let mut region = Region::new(allocation_limit);
            let mut heap = SplitLockHeap::new(
                region.brk(),
                SingleThreadedLock::new(),
                SingleThreadedLock::new(),
            )
            .with_min_batch(MIN_BATCH_UNITS);
            let live = self.run_on(&mut heap, region.bounds(), allocation_limit)?;
            teardown(&mut heap, live)?;
        }

        {
            let mut region = Region::new(allocation_limit);
            let heap = ThreadLocalHeap::new(region.brk(), SingleThreadedLock::new())
                .with_min_batch(MIN_BATCH_UNITS);
            let mut arena = heap.local();
            let live = self.run_on(&mut arena, region.bounds(), allocation_limit)?;

            // Another arena must refuse to take any of these blocks, and the
            // attempt must not disturb their owner.
            if let Some((id, alloc)) = live.map.iter().next() {
                log::debug!("releasing id{id} into a foreign arena");
                let before = arena.stats();
                let mut stranger = heap.local();
                let rejected = unsafe { stranger.try_release(alloc.ptr) };
                ensure!(
                    rejected.is_err(),
                    "a foreign arena accepted id{} at {:p}",
                    id,
                    alloc.ptr,
                );
                ensure!(
                    stranger.stats() == HeapStats::default(),
                    "a rejected release left a trace in the foreign arena",
                );
                ensure!(
                    arena.stats() == before,
                    "a rejected release changed the owning arena",
                );
            }

            teardown(&mut arena, live)?;
        }

        Ok(())
    }

    /// Interpret each op against `heap`, checking our invariants as we go,
    /// and hand back whatever is still live at the end.
    fn run_on<H>(
        &self,
        heap: &mut H,
        bounds: Range<usize>,
        allocation_limit: usize,
    ) -> Result<LiveMap, String>
    where
        H: TestHeap,
    {
        log::debug!("---------- {} ----------", H::NAME);
        let mut live = LiveMap::new(allocation_limit);

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match op {
                Op::Alloc { id, size } => {
                    if live.beyond_allocation_limit(size.0) {
                        continue;
                    }
                    if let Some(old) = live.remove(*id) {
                        release(heap, *id, old)?;
                    }

                    let Some(ptr) = heap.allocate(size.0) else {
                        // Exhausting the bounded arena is allowed; leaving the
                        // heap broken afterwards is not.
                        log::debug!("allocation of {} bytes failed", size.0);
                        check_heap(heap, &live)?;
                        continue;
                    };
                    let alloc = LiveAlloc {
                        ptr,
                        size: size.0,
                        usable: unsafe { usable_size(ptr) },
                    };
                    log::debug!("new allocation: id{id} -> {alloc:?}");

                    check_new_alloc(&live, &bounds, &alloc)?;
                    unsafe { alloc.ptr.as_ptr().write_bytes(LIVE_POISON_PATTERN, alloc.usable) };
                    live.insert(*id, alloc);
                }

                Op::Release { id } => {
                    if let Some(alloc) = live.remove(*id) {
                        release(heap, *id, alloc)?;
                    }
                }
            }

            check_heap(heap, &live)?;
        }

        Ok(live)
    }
}

/// The operations every heap variant offers to the op interpreter.
trait TestHeap {
    const NAME: &'static str;
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;
    unsafe fn release(&mut self, ptr: NonNull<u8>);
    fn stats(&self) -> HeapStats;
    fn validate(&self) -> Result<(), &'static str>;
}

impl TestHeap for GlobalLockHeap<FixedBreak, SingleThreadedLock> {
    const NAME: &'static str = "global lock";

    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        GlobalLockHeap::allocate(self, size).ok()
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        GlobalLockHeap::release(self, ptr);
    }

    fn stats(&self) -> HeapStats {
        GlobalLockHeap::stats(self)
    }

    fn validate(&self) -> Result<(), &'static str> {
        GlobalLockHeap::validate(self)
    }
}

impl TestHeap for SplitLockHeap<FixedBreak, SingleThreadedLock, SingleThreadedLock> {
    const NAME: &'static str = "split lock";

    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        SplitLockHeap::allocate(self, size).ok()
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        SplitLockHeap::release(self, ptr);
    }

    fn stats(&self) -> HeapStats {
        SplitLockHeap::stats(self)
    }

    fn validate(&self) -> Result<(), &'static str> {
        SplitLockHeap::validate(self)
    }
}

impl TestHeap for LocalArena<'_, FixedBreak, SingleThreadedLock> {
    const NAME: &'static str = "thread local";

    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        LocalArena::allocate(self, size).ok()
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let result = LocalArena::try_release(self, ptr);
        debug_assert!(result.is_ok(), "own block rejected: {result:?}");
    }

    fn stats(&self) -> HeapStats {
        LocalArena::stats(self)
    }

    fn validate(&self) -> Result<(), &'static str> {
        LocalArena::validate(self)
    }
}

/// Check that the payload survived untouched, poison it, and give it back.
fn release<H: TestHeap>(heap: &mut H, id: u32, alloc: LiveAlloc) -> Result<(), String> {
    log::debug!("releasing id{id} -> {alloc:?}");
    let bytes = unsafe { std::slice::from_raw_parts(alloc.ptr.as_ptr(), alloc.usable) };
    ensure!(
        bytes.iter().all(|b| *b == LIVE_POISON_PATTERN),
        "live allocation id{} was clobbered while it was handed out",
        id,
    );
    unsafe {
        alloc.ptr.as_ptr().write_bytes(FREE_POISON_PATTERN, alloc.usable);
        heap.release(alloc.ptr);
    }
    Ok(())
}

/// Release everything still live and check that the arena folds back into a
/// single free block.
fn teardown<H: TestHeap>(heap: &mut H, live: LiveMap) -> Result<(), String> {
    for (id, alloc) in live.map {
        release(heap, id, alloc)?;
    }

    let empty = LiveMap::new(0);
    check_heap(heap, &empty)?;

    let stats = heap.stats();
    if stats.arena_bytes > 0 {
        ensure!(
            stats.free_blocks == 1,
            "a contiguous arena with nothing live should be one free block, found {}",
            stats.free_blocks,
        );
        ensure!(
            stats.free_bytes == stats.arena_bytes - HEADER_SIZE,
            "everything but the sentinel should be free: {:?}",
            stats,
        );
    }
    Ok(())
}

/// Check a freshly allocated block against the arena and the live set.
fn check_new_alloc(live: &LiveMap, bounds: &Range<usize>, alloc: &LiveAlloc) -> Result<(), String> {
    let addr = alloc.ptr.as_ptr() as usize;
    ensure!(
        addr % HEADER_ALIGN == 0,
        "payload {:#x} is not aligned to {}",
        addr,
        HEADER_ALIGN,
    );
    ensure!(
        alloc.usable >= alloc.size,
        "usable size {} is less than the requested {}",
        alloc.usable,
        alloc.size,
    );
    ensure!(
        alloc.usable % HEADER_SIZE == 0,
        "usable size {} is not a whole number of units",
        alloc.usable,
    );

    let block = alloc.block();
    ensure!(
        bounds.start <= block.start && block.end <= bounds.end,
        "block {:#x?} lies outside the arena {:#x?}",
        block,
        bounds,
    );
    for other in live.map.values() {
        let other = other.block();
        ensure!(
            block.end <= other.start || other.end <= block.start,
            "blocks {:#x?} and {:#x?} are both live and overlap",
            block,
            other,
        );
    }
    Ok(())
}

/// Check the free list's shape and that every byte of the arena is accounted
/// for.
fn check_heap<H: TestHeap>(heap: &H, live: &LiveMap) -> Result<(), String> {
    if let Err(e) = heap.validate() {
        return Err(format!("{} free list is malformed: {e}", H::NAME));
    }

    let stats = heap.stats();
    if stats.arena_bytes == 0 {
        ensure!(live.map.is_empty(), "live allocations without an arena");
        return Ok(());
    }
    let live_bytes: usize = live.map.values().map(|a| a.block().len()).sum();
    ensure!(
        stats.arena_bytes == stats.free_bytes + live_bytes + HEADER_SIZE,
        "arena of {} bytes is not free {} + live {} + sentinel {}",
        stats.arena_bytes,
        stats.free_bytes,
        live_bytes,
        HEADER_SIZE,
    );
    Ok(())
}

// Live payloads are filled with one pattern and checked on release; released
// payloads get another, so a block handed out twice shows up as clobbered.
const LIVE_POISON_PATTERN: u8 = 0xAA;
const FREE_POISON_PATTERN: u8 = 0xFF;

/// A zeroed byte buffer that serves as one heap's entire program break.
struct Region {
    bytes: Vec<u8>,
}

impl Region {
    fn new(allocation_limit: usize) -> Self {
        // Room for the limit twice over, to leave headroom for headers and
        // fragmentation.
        let len = allocation_limit * 2 + MIN_BATCH_UNITS * HEADER_SIZE;
        Region {
            bytes: vec![0; len],
        }
    }

    /// A break over this region. It must not be used once the region drops.
    fn brk(&mut self) -> FixedBreak {
        unsafe { FixedBreak::from_raw_parts(self.bytes.as_mut_ptr(), self.bytes.len()) }
    }

    fn bounds(&self) -> Range<usize> {
        let start = self.bytes.as_ptr() as usize;
        start..start + self.bytes.len()
    }
}

/// A currently-live allocation.
struct LiveAlloc {
    ptr: NonNull<u8>,
    /// Requested size at allocation time.
    size: usize,
    /// What `usable_size` reported.
    usable: usize,
}

impl LiveAlloc {
    /// The whole block, header included.
    fn block(&self) -> Range<usize> {
        let payload = self.ptr.as_ptr() as usize;
        payload - HEADER_SIZE..payload + self.usable
    }
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc { ptr, size, usable } = self;
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{ptr:p}"))
            .field("size", &size)
            .field("usable", &usable)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
struct LiveMap {
    /// The live allocations themselves.
    map: BTreeMap<u32, LiveAlloc>,

    /// The total number of bytes that are currently allocated.
    ///
    /// Note: this is a sum of the requested allocation sizes, and does not
    /// include headers or rounding.
    total_allocated_bytes: usize,

    /// The total allocated bytes should never surpass this limit.
    allocation_limit: usize,
}

impl LiveMap {
    fn new(allocation_limit: usize) -> Self {
        LiveMap {
            map: BTreeMap::default(),
            total_allocated_bytes: 0,
            allocation_limit,
        }
    }

    /// Would an allocation of the given size push us past our allocation limit?
    fn beyond_allocation_limit(&self, size: usize) -> bool {
        self.total_allocated_bytes + size > self.allocation_limit
    }

    /// Insert a new live allocation.
    ///
    /// It is the caller's responsibility to check that the given allocation
    /// fits within our configured limit.
    fn insert(&mut self, id: u32, alloc: LiveAlloc) {
        self.total_allocated_bytes += alloc.size;
        assert!(self.total_allocated_bytes <= self.allocation_limit);

        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and release old entries before adding new ones"
        );
    }

    /// Remove a live allocation for release.
    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        let alloc = self.map.remove(&id)?;
        self.total_allocated_bytes -= alloc.size;
        Some(alloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutatis::check::{Check, CheckError, CheckFailure};

    #[test]
    fn run_ops() {
        let _ = env_logger::try_init();

        let seed_corpus = [
            // Empty.
            Ops::default(),
            // Simple alloc/release pair.
            Ops::new([
                Op::Alloc {
                    id: 0,
                    size: Size(8),
                },
                Op::Release { id: 0 },
            ]),
            // Zero-sized allocation.
            Ops::new([Op::Alloc {
                id: 0,
                size: Size(0),
            }]),
            // Two neighbours released in allocation order, then reused.
            Ops::new([
                Op::Alloc {
                    id: 0,
                    size: Size(16),
                },
                Op::Alloc {
                    id: 1,
                    size: Size(17),
                },
                Op::Release { id: 0 },
                Op::Release { id: 1 },
                Op::Alloc {
                    id: 2,
                    size: Size(48),
                },
            ]),
            // Three neighbours released middle first.
            Ops::new([
                Op::Alloc {
                    id: 0,
                    size: Size(100),
                },
                Op::Alloc {
                    id: 1,
                    size: Size(100),
                },
                Op::Alloc {
                    id: 2,
                    size: Size(100),
                },
                Op::Release { id: 1 },
                Op::Release { id: 2 },
                Op::Release { id: 0 },
            ]),
            // Bigger than a growth batch, forcing a dedicated growth.
            Ops::new([
                Op::Alloc {
                    id: 0,
                    size: Size(1),
                },
                Op::Alloc {
                    id: 1,
                    size: Size(4096),
                },
                Op::Release { id: 0 },
            ]),
        ];

        match Check::new().iters(20_000).shrink_iters(1).run_with(
            m::default::<Ops>(),
            seed_corpus,
            |ops| {
                let megabyte = 1 << 20;
                ops.run(megabyte)
            },
        ) {
            Ok(()) => {}
            Err(CheckError::Failed(CheckFailure { value, message, .. })) => {
                panic!("test failure: {message}: {value:#?}")
            }
            Err(e) => panic!("check error: {e}"),
        }
    }

    #[test]
    fn encoding_sheds_trailing_ops_to_fit() {
        let mut ops = Ops::new((0..10).map(|id| Op::Alloc {
            id,
            size: Size(id as usize * 100),
        }));
        let mut roomy = vec![0; 4096];
        let full = ops.encode_into(&mut roomy).unwrap();
        assert_eq!(ops.len(), 10);

        let mut cramped = vec![0; full - 1];
        let shed = ops.encode_into(&mut cramped).unwrap();
        assert!(shed < full);
        assert!(ops.len() < 10);

        // Only the encoded prefix is meaningful; the rest of the buffer is
        // whatever the fuzzer left there.
        cramped[shed..].fill(0xff);
        let decoded = Ops::decode(&cramped[..shed]).unwrap();
        assert_eq!(decoded.len(), ops.len());

        assert!(Ops::default().encode_into(&mut []).is_none());
        assert!(Ops::decode(&[0xff; 3]).is_none());
    }

    #[test]
    fn exhaustion_is_survivable() {
        let _ = env_logger::try_init();

        // The limit caps live requested bytes, not the region, so a run of
        // small allocations can still run the region dry.
        let ops = Ops::new((0..500).map(|id| Op::Alloc { id, size: Size(0) }));
        ops.run(1024).unwrap();
    }
}
