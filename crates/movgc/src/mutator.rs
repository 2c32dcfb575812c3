//! Per-thread mutator API.
//!
//! A [`Mutator`] is what a registered thread uses to touch the heap. It is
//! `!Send`: its methods run the calling thread's safepoints and barriers and
//! update that thread's roots.
//!
//! Objects are built inside a [`Construction`], which keeps the fresh box
//! alive and its handles visible to the collector until it is committed.
//! [`Mutator::alloc`] does the same in one step for a [`Managed`] value.

use std::any::type_name;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::gc::collector::GcCore;
use crate::gc::remset;
use crate::gc::GcOptions;
use crate::handle::Handle;
use crate::error::GcError;
use crate::meta::{Managed, TypeKey, TypeMeta};
use crate::metrics::GcRunStat;
use crate::threads::registry::{Critical, ThreadRecord};
use crate::threads::stw::{stop_the_world, WorldSnapshot};

/// Parameters of a raw allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    /// Bytes of one object.
    pub object_size: usize,
    /// Objects in the box.
    pub count: usize,
    /// Type whose metadata is installed at allocation time. It must already
    /// be published in the collector's [`TypeRegistry`](crate::TypeRegistry).
    /// Without it the box becomes self-describing on commit.
    pub type_key: Option<TypeKey>,
    /// Name of the self-describing type.
    pub name: &'static str,
}

impl AllocRequest {
    /// A request for one object of `object_size` bytes.
    #[must_use]
    pub const fn new(object_size: usize) -> Self {
        Self {
            object_size,
            count: 1,
            type_key: None,
            name: "anonymous",
        }
    }

    /// Sets the number of objects.
    #[must_use]
    pub const fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Installs the published metadata of `key` when the box is created.
    #[must_use]
    pub const fn with_type(mut self, key: TypeKey) -> Self {
        self.type_key = Some(key);
        self
    }

    /// Names the self-describing type built at commit.
    #[must_use]
    pub const fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

/// A registered thread's access to the heap.
///
/// Dropping it deregisters the thread.
pub struct Mutator {
    core: Arc<GcCore>,
    record: Arc<ThreadRecord>,
    _not_send: PhantomData<*const ()>,
}

impl Mutator {
    pub(crate) fn new(core: Arc<GcCore>, record: Arc<ThreadRecord>) -> Self {
        core.bind_current(&record);
        Self {
            core,
            record,
            _not_send: PhantomData,
        }
    }

    /// Collector-unique id of this thread.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.record.id()
    }

    fn critical(&self) -> Critical<'_> {
        self.record.enter_critical(&self.core.registry)
    }

    fn resolve(&self, key: TypeKey) -> Result<&TypeMeta> {
        self.core.types.get(key).ok_or(GcError::UnknownType(key))
    }

    /// Starts building a box.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::UnknownType`] when the request names a type with
    /// no published metadata, and [`GcError::OutOfMemory`] when neither a
    /// collection nor growing the heap made room.
    pub fn allocate(&self, request: AllocRequest) -> Result<Construction<'_>> {
        let _critical = self.critical();
        let meta = request.type_key.map(|key| self.resolve(key)).transpose()?;
        let allocation = self.core.allocate(
            &self.record,
            request.object_size,
            request.count,
            meta,
        )?;
        let object = allocation.object();
        let token = self.record.alloc_stack.lock().push(allocation);
        Ok(Construction {
            mutator: self,
            token,
            object,
            object_size: request.object_size,
            size: request.object_size * request.count,
            meta,
            name: request.name,
            finished: false,
        })
    }

    /// Moves `value` into a new box and roots it.
    ///
    /// Handles inside `value` stay visible to the collector while the box
    /// is being allocated.
    ///
    /// # Errors
    ///
    /// As [`allocate`](Self::allocate).
    pub fn alloc<T: Managed>(&self, value: T) -> Result<Root<'_>> {
        let _critical = self.critical();
        let meta = self.core.types.of::<T>();
        let base = ptr::addr_of!(value) as usize;
        let slots: Vec<usize> = meta.handle_offsets().iter().map(|offset| base + offset).collect();
        {
            let mut roots = self.record.roots.lock();
            for &slot in &slots {
                roots.insert(slot);
            }
        }
        let allocation = self
            .core
            .allocate(&self.record, mem::size_of::<T>(), 1, Some(meta));
        {
            let mut roots = self.record.roots.lock();
            for &slot in &slots {
                roots.remove(slot);
            }
        }
        let allocation = allocation?;
        let object = allocation.object();
        let token = self.record.alloc_stack.lock().push(allocation);
        // SAFETY: the payload is sized for one `T` and aligned to the box
        // alignment, which `TypeMeta::of` checked covers `T`.
        unsafe { object.cast::<T>().write(value) };
        self.core
            .commit(&self.record, token, mem::size_of::<T>(), Some(meta), type_name::<T>());
        Ok(self.root_raw(object))
    }

    fn root_raw(&self, object: *mut u8) -> Root<'_> {
        let handle = Box::new(Handle::null());
        handle.store(object, Ordering::Release);
        self.record.roots.lock().insert(handle.slot_address());
        Root {
            handle,
            mutator: self,
        }
    }

    /// A new root referring to the same object as `handle`.
    #[must_use]
    pub fn root(&self, handle: &Handle) -> Root<'_> {
        let _critical = self.critical();
        self.root_raw(self.read_barrier(handle))
    }

    /// Makes `handle` a root until [`deregister_handle`](Self::deregister_handle).
    ///
    /// In conservative mode, handles on this thread's stack go to its stack
    /// bitmap and their targets are pinned during collections; everything
    /// else goes to the precise root set.
    ///
    /// # Safety
    ///
    /// `handle` must not move or be freed while registered.
    ///
    /// # Panics
    ///
    /// Panics if the handle is already registered.
    pub unsafe fn register_handle(&self, handle: &Handle) {
        let _critical = self.critical();
        let addr = handle.slot_address();
        if let Some(bitmap) = self.record.stack_roots.lock().as_mut() {
            if bitmap.covers(addr) {
                bitmap.insert(addr);
                return;
            }
        }
        self.record.roots.lock().insert(addr);
    }

    /// Removes a handle added with [`register_handle`](Self::register_handle).
    ///
    /// # Panics
    ///
    /// Panics if the handle was never registered.
    pub fn deregister_handle(&self, handle: &Handle) {
        let _critical = self.critical();
        let addr = handle.slot_address();
        if let Some(bitmap) = self.record.stack_roots.lock().as_mut() {
            if bitmap.covers(addr) {
                bitmap.remove(addr);
                return;
            }
        }
        self.record.roots.lock().remove(addr);
    }

    /// Address held by `handle`.
    #[inline]
    #[must_use]
    pub fn read_barrier(&self, handle: &Handle) -> *mut u8 {
        handle.load(Ordering::Acquire)
    }

    /// Makes `dst` refer to the object `src` refers to.
    #[inline]
    pub fn write_barrier(&self, dst: &Handle, src: &Handle) {
        let _critical = self.critical();
        self.core
            .write_barrier(&self.record, dst, src.load(Ordering::Acquire));
    }

    /// Moves `handle` by `offset` bytes within the box it refers to.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is null or the result leaves the box payload.
    pub fn interior_write_barrier(&self, handle: &Handle, offset: isize) {
        let _critical = self.critical();
        let current = handle.load(Ordering::Acquire) as usize;
        assert!(current != 0, "interior write through a null handle");
        let target = current.wrapping_add_signed(offset);
        let (start, end) = self.payload_bounds(current);
        assert!(
            (start..end).contains(&target),
            "interior offset {offset} leaves the box at {start:#x}"
        );
        handle.store(target as *mut u8, Ordering::Release);
    }

    /// Stores `value` into the handle field at `offset` of `object`.
    ///
    /// # Panics
    ///
    /// Panics if the field is misaligned or outside the box.
    pub fn store(&self, object: &Handle, offset: usize, value: &Handle) {
        let _critical = self.critical();
        let field = self.field(object, offset);
        self.write_barrier(field, value);
    }

    /// Roots the handle field at `offset` of `object`.
    ///
    /// # Panics
    ///
    /// As [`store`](Self::store).
    #[must_use]
    pub fn load(&self, object: &Handle, offset: usize) -> Root<'_> {
        let _critical = self.critical();
        let field = self.field(object, offset);
        self.root(field)
    }

    fn field(&self, object: &Handle, offset: usize) -> &Handle {
        let base = self.read_barrier(object) as usize;
        assert!(base != 0, "field access through a null handle");
        assert!(
            offset % mem::align_of::<Handle>() == 0,
            "handle field offset {offset} is misaligned"
        );
        let (_, end) = self.payload_bounds(base);
        assert!(
            base + offset + mem::size_of::<Handle>() <= end,
            "handle field offset {offset} leaves the box"
        );
        // SAFETY: the slot lies inside a live payload, is aligned, and the
        // object cannot move while this thread runs managed code.
        unsafe { Handle::from_slot(base + offset) }
    }

    fn payload_bounds(&self, addr: usize) -> (usize, usize) {
        let descriptor = self
            .core
            .heap
            .index()
            .expect_descriptor(addr)
            .unwrap_or_else(|| panic!("{addr:#x} is not a box"));
        let cell = descriptor.cell_start(addr) as usize;
        (
            crate::heap::box_meta::object_start(cell as *mut u8) as usize,
            cell + descriptor.cell_size(),
        )
    }

    /// Copies a `T` out of the object `handle` refers to.
    ///
    /// # Safety
    ///
    /// The handle must refer to a `T`.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is null.
    #[must_use]
    pub unsafe fn read<T: Copy>(&self, handle: &Handle) -> T {
        let _critical = self.critical();
        let object = self.read_barrier(handle);
        assert!(!object.is_null(), "read through a null handle");
        // SAFETY: caller contract.
        unsafe { object.cast::<T>().read() }
    }

    /// Keeps the object `handle` refers to from moving while the guard
    /// lives. Guards may be dropped in any order.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is null.
    pub fn pin(&self, handle: &Handle) -> PinGuard<'_> {
        let _critical = self.critical();
        let addr = self.read_barrier(handle) as usize;
        assert!(addr != 0, "cannot pin a null handle");
        self.record.pins.lock().insert(addr);
        PinGuard { addr, mutator: self }
    }

    /// Like [`pin`](Self::pin) for strictly nested scopes: guards must be
    /// dropped in reverse order of creation.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is null.
    pub fn push_pin(&self, handle: &Handle) -> PushPinGuard<'_> {
        let _critical = self.critical();
        let addr = self.read_barrier(handle) as usize;
        assert!(addr != 0, "cannot pin a null handle");
        self.record.pins.lock().push(addr);
        PushPinGuard { addr, mutator: self }
    }

    /// Stops here if a collection is waiting for this thread.
    #[inline]
    pub fn safepoint(&self) {
        self.record.safepoint(&self.core.registry);
    }

    /// Runs `f` outside managed code, so collections need not wait for it.
    /// `f` must not touch the heap.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.record.blocking(&self.core.registry, f)
    }

    /// Disables stop-the-world until the scope is dropped.
    pub fn unsafe_scope(&self) -> UnsafeScope<'_> {
        self.record.enter_unsafe(&self.core.registry);
        UnsafeScope { mutator: self }
    }

    /// Runs a collection from this thread.
    ///
    /// # Errors
    ///
    /// See [`Collector::collect`](crate::Collector::collect).
    pub fn collect(&self, options: GcOptions) -> Result<Option<GcRunStat>> {
        self.core.collect(options, Some(&self.record))
    }

    /// Stops every other registered thread until the snapshot is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::StopTheWorldDisabled`](crate::GcError::StopTheWorldDisabled)
    /// if a thread is inside an unsafe scope.
    pub fn stop_the_world(&self) -> Result<WorldSnapshot<'_>> {
        stop_the_world(&self.core.registry, Some(&self.record))
    }

    /// Metadata of `T` in this collector.
    pub fn type_meta<T: Managed>(&self) -> &TypeMeta {
        let _critical = self.critical();
        self.core.types.of::<T>()
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        {
            let _critical = self.critical();
            remset::flush(&self.record.store_buffer, &self.core.remembered);
        }
        self.core.unbind_current(&self.record);
        self.core
            .registry
            .deregister(&self.record, self.core.heap.index());
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator").field("thread", &self.record).finish()
    }
}

/// A box under construction.
///
/// Handles written with [`store`](Self::store) are roots until the box is
/// committed. Dropping it without committing gives the box back.
pub struct Construction<'m> {
    mutator: &'m Mutator,
    token: u64,
    object: *mut u8,
    object_size: usize,
    size: usize,
    meta: Option<&'m TypeMeta>,
    name: &'static str,
    finished: bool,
}

impl<'m> Construction<'m> {
    /// Start of the zeroed payload.
    #[must_use]
    pub const fn object(&self) -> *mut u8 {
        self.object
    }

    /// Payload bytes requested.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Writes a handle field at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the field is misaligned or outside the payload.
    pub fn store(&mut self, offset: usize, value: &Handle) {
        let _critical = self.mutator.critical();
        assert!(
            offset % mem::align_of::<Handle>() == 0 && offset + mem::size_of::<Handle>() <= self.size,
            "handle field offset {offset} is outside a {}-byte payload",
            self.size
        );
        self.mutator
            .record
            .alloc_stack
            .lock()
            .record(self.token, offset);
        // SAFETY: checked to lie inside the payload, which is zeroed and
        // cannot move before commit.
        let slot = unsafe { Handle::from_slot(self.object as usize + offset) };
        self.mutator.write_barrier(slot, value);
    }

    /// Writes plain data at `offset`.
    ///
    /// # Safety
    ///
    /// The bytes must not overlap a handle field.
    ///
    /// # Panics
    ///
    /// Panics if the value does not fit in the payload.
    pub unsafe fn write<T: Copy>(&mut self, offset: usize, value: T) {
        assert!(
            offset + mem::size_of::<T>() <= self.size,
            "{}-byte value at {offset} overflows the payload",
            mem::size_of::<T>()
        );
        // SAFETY: in bounds; caller keeps handle fields intact.
        unsafe { self.object.add(offset).cast::<T>().write_unaligned(value) };
    }

    /// Publishes the box and roots it.
    pub fn commit(mut self) -> Root<'m> {
        let meta = self.meta;
        self.finish(meta)
    }

    /// Publishes the box with the published metadata of `key` instead of
    /// the request's.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::UnknownType`] when `key` has no published
    /// metadata; the box is given back.
    pub fn commit_as(mut self, key: TypeKey) -> Result<Root<'m>> {
        let meta = self.mutator.resolve(key)?;
        Ok(self.finish(Some(meta)))
    }

    fn finish(&mut self, meta: Option<&TypeMeta>) -> Root<'m> {
        let _critical = self.mutator.critical();
        self.finished = true;
        let mutator = self.mutator;
        mutator
            .core
            .commit(&mutator.record, self.token, self.object_size, meta, self.name);
        mutator.root_raw(self.object)
    }

    /// Gives the box back without publishing it.
    pub fn abort(mut self) {
        let _critical = self.mutator.critical();
        self.finished = true;
        self.mutator.core.abort(&self.mutator.record, self.token);
    }
}

impl Drop for Construction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _critical = self.mutator.critical();
            self.mutator.core.abort(&self.mutator.record, self.token);
        }
    }
}

impl std::fmt::Debug for Construction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Construction")
            .field("object", &self.object)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// A rooted handle owned by Rust code. The collector updates it when its
/// object moves.
pub struct Root<'m> {
    handle: Box<Handle>,
    mutator: &'m Mutator,
}

impl Root<'_> {
    /// The rooted handle.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Current address of the object.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.mutator.read_barrier(&self.handle)
    }

    /// Makes this root refer to the object `src` refers to.
    pub fn set(&self, src: &Handle) {
        self.mutator.write_barrier(&self.handle, src);
    }
}

impl std::ops::Deref for Root<'_> {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Root<'_> {
    fn drop(&mut self) {
        let _critical = self.mutator.critical();
        self.mutator
            .record
            .roots
            .lock()
            .remove(self.handle.slot_address());
    }
}

impl std::fmt::Debug for Root<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Root").field(&self.as_ptr()).finish()
    }
}

/// Pins an object until dropped.
#[must_use = "the object is unpinned when the guard is dropped"]
pub struct PinGuard<'m> {
    addr: usize,
    mutator: &'m Mutator,
}

impl PinGuard<'_> {
    /// Address of the pinned object.
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        let _critical = self.mutator.critical();
        self.mutator.record.pins.lock().remove(self.addr);
    }
}

impl std::fmt::Debug for PinGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PinGuard").field(&self.as_ptr()).finish()
    }
}

/// Pins an object until dropped, in LIFO order with other push pins.
#[must_use = "the object is unpinned when the guard is dropped"]
pub struct PushPinGuard<'m> {
    addr: usize,
    mutator: &'m Mutator,
}

impl PushPinGuard<'_> {
    /// Address of the pinned object.
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }
}

impl Drop for PushPinGuard<'_> {
    fn drop(&mut self) {
        let _critical = self.mutator.critical();
        self.mutator.record.pins.lock().pop(self.addr);
    }
}

impl std::fmt::Debug for PushPinGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PushPinGuard").field(&self.as_ptr()).finish()
    }
}

/// Stop-the-world is refused while this guard lives.
#[must_use = "stop-the-world is enabled again when the scope is dropped"]
pub struct UnsafeScope<'m> {
    mutator: &'m Mutator,
}

impl Drop for UnsafeScope<'_> {
    fn drop(&mut self) {
        self.mutator.record.leave_unsafe(&self.mutator.core.registry);
    }
}

impl std::fmt::Debug for UnsafeScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnsafeScope").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::gc::collector::Collector;
    use crate::meta::LayoutBuilder;
    use crate::threads::registry::ThreadInfo;

    #[repr(C)]
    struct Node {
        value: u64,
        next: Handle,
    }

    unsafe impl Managed for Node {
        fn describe(layout: &mut LayoutBuilder, base: usize) {
            Handle::describe(layout, base + mem::offset_of!(Node, next));
        }
    }

    fn setup() -> (Collector, Mutator) {
        let gc = Collector::new(GcConfig::serial().with_worker_threads(1)).unwrap();
        let mutator = gc.register_thread(ThreadInfo::current()).unwrap();
        (gc, mutator)
    }

    #[test]
    fn test_alloc_keeps_contained_handles() {
        let (gc, mutator) = setup();
        let tail = mutator.alloc(Node { value: 2, next: Handle::null() }).unwrap();
        let head_node = Node { value: 1, next: Handle::null() };
        mutator.write_barrier(&head_node.next, tail.handle());
        let head = mutator.alloc(head_node).unwrap();
        drop(tail);

        let run = gc.collect(GcOptions::full()).unwrap().unwrap();
        assert_eq!(run.heap.mem_live, 64);
        let next = mutator.load(head.handle(), mem::offset_of!(Node, next));
        assert_eq!(unsafe { mutator.read::<u64>(head.handle()) }, 1);
        assert_eq!(unsafe { mutator.read::<u64>(&next) }, 2);
    }

    #[test]
    fn test_construction_self_describing() {
        let (gc, mutator) = setup();
        let child = mutator.alloc(5_u64).unwrap();
        let mut construction = mutator
            .allocate(AllocRequest::new(16).with_name("pair"))
            .unwrap();
        construction.store(0, child.handle());
        unsafe { construction.write(8, 9_u64) };
        let parent = construction.commit();
        drop(child);

        let run = gc.collect(GcOptions::full()).unwrap().unwrap();
        assert_eq!(run.heap.mem_live, 64);
        let meta = gc.types().get(crate::meta::TypeKey::Named("pair")).unwrap();
        assert_eq!(meta.handle_offsets(), &[0]);
        let child = mutator.load(parent.handle(), 0);
        assert_eq!(unsafe { mutator.read::<u64>(&child) }, 5);
    }

    #[test]
    fn test_dropped_construction_aborts() {
        let (gc, mutator) = setup();
        let construction = mutator.allocate(AllocRequest::new(16)).unwrap();
        drop(construction);
        let run = gc.collect(GcOptions::full()).unwrap().unwrap();
        assert_eq!(run.heap.mem_occupied, 0);
    }

    #[test]
    fn test_registered_handle_is_root() {
        let (gc, mutator) = setup();
        let slot = Box::new(Handle::null());
        {
            let root = mutator.alloc(11_u64).unwrap();
            mutator.write_barrier(&slot, root.handle());
        }
        unsafe { mutator.register_handle(&slot) };
        gc.collect(GcOptions::full()).unwrap();
        assert_eq!(unsafe { mutator.read::<u64>(&slot) }, 11);
        mutator.deregister_handle(&slot);
        let run = gc.collect(GcOptions::full()).unwrap().unwrap();
        assert_eq!(run.heap.mem_live, 0);
    }

    #[test]
    fn test_interior_write_barrier_stays_in_box() {
        let (_gc, mutator) = setup();
        let root = mutator.alloc([1_u64, 2]).unwrap();
        let cursor = mutator.root(root.handle());
        mutator.interior_write_barrier(&cursor, 8);
        assert_eq!(unsafe { mutator.read::<u64>(&cursor) }, 2);
        mutator.interior_write_barrier(&cursor, -8);
        assert_eq!(cursor.as_ptr(), root.as_ptr());
    }

    #[test]
    #[should_panic(expected = "leaves the box")]
    fn test_interior_write_barrier_rejects_escape() {
        let (_gc, mutator) = setup();
        let root = mutator.alloc(1_u64).unwrap();
        mutator.interior_write_barrier(&root, 64);
    }

    #[test]
    #[should_panic(expected = "cannot pin a null handle")]
    fn test_pin_null_panics() {
        let (_gc, mutator) = setup();
        let _guard = mutator.pin(&Handle::null());
    }

    #[test]
    fn test_unsafe_scope_refuses_collection() {
        let (gc, mutator) = setup();
        let scope = mutator.unsafe_scope();
        assert!(matches!(
            gc.collect(GcOptions::mark_and_collect()),
            Err(crate::error::GcError::StopTheWorldDisabled)
        ));
        drop(scope);
        assert!(gc.collect(GcOptions::mark_and_collect()).is_ok());
    }
}
