//! Type metadata: object layout as seen by the collector.
//!
//! The collector never looks at a managed object's Rust type. Everything it
//! needs (size, where the handles are, how to drop it, whether it may be
//! moved) is captured once per type in a [`TypeMeta`] owned by the
//! collector's [`TypeRegistry`].

use std::any::{type_name, TypeId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::RwLock;

use crate::handle::Handle;
use crate::heap::box_meta::BOX_ALIGN;

/// Collects the byte offsets of handle fields while a type describes itself.
#[derive(Debug, Default)]
pub struct LayoutBuilder {
    offsets: Vec<usize>,
}

impl LayoutBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            offsets: Vec::new(),
        }
    }

    /// Records a handle at `offset` bytes from the start of the object.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not pointer aligned.
    pub fn handle(&mut self, offset: usize) {
        assert!(
            offset % mem::align_of::<Handle>() == 0,
            "handle offset {offset} is not pointer aligned"
        );
        self.offsets.push(offset);
    }

    /// Offsets recorded so far.
    #[must_use]
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    fn finish(mut self) -> Box<[usize]> {
        self.offsets.sort_unstable();
        self.offsets.dedup();
        self.offsets.into_boxed_slice()
    }
}

/// A type that can live in the collected heap.
///
/// Usually derived with `#[derive(Managed)]`, which describes every field
/// with `offset_of!`.
///
/// # Safety
///
/// `describe` must report the offset of every [`Handle`] stored inline in
/// the value, relative to `base`, and nothing else. A missed handle is never
/// traced or fixed up; a bogus one makes the collector read garbage as a
/// pointer. Types with `MOVABLE = true` must tolerate a bitwise move.
pub unsafe trait Managed: Send + Sized + 'static {
    /// Whether compaction may relocate values of this type.
    const MOVABLE: bool = true;

    /// Reports handle offsets of a value placed at `base`.
    fn describe(layout: &mut LayoutBuilder, base: usize);
}

/// Layout of one managed type.
pub struct TypeMeta {
    name: Cow<'static, str>,
    type_size: usize,
    type_align: usize,
    handle_offsets: Box<[usize]>,
    drop_fn: Option<unsafe fn(*mut u8)>,
    movable: bool,
}

unsafe fn drop_glue<T>(object: *mut u8) {
    // SAFETY: only installed for boxes holding initialized `T`s.
    unsafe { ptr::drop_in_place(object.cast::<T>()) };
}

impl TypeMeta {
    /// Metadata of a Rust type.
    ///
    /// # Panics
    ///
    /// Panics for types aligned beyond the box payload alignment or of zero
    /// size.
    #[must_use]
    pub fn of<T: Managed>() -> Self {
        assert!(
            mem::align_of::<T>() <= BOX_ALIGN,
            "`{}` is aligned to {} bytes, at most {BOX_ALIGN} is supported",
            type_name::<T>(),
            mem::align_of::<T>()
        );
        assert!(
            mem::size_of::<T>() > 0,
            "zero-sized type `{}` cannot be managed",
            type_name::<T>()
        );
        let mut layout = LayoutBuilder::new();
        T::describe(&mut layout, 0);
        Self {
            name: Cow::Borrowed(type_name::<T>()),
            type_size: mem::size_of::<T>(),
            type_align: mem::align_of::<T>(),
            handle_offsets: layout.finish(),
            drop_fn: mem::needs_drop::<T>().then_some(drop_glue::<T> as unsafe fn(*mut u8)),
            movable: T::MOVABLE,
        }
    }

    /// Metadata assembled at run time, as done for self-describing objects
    /// whose handles are discovered while they are being constructed.
    #[must_use]
    pub fn self_describing(
        name: impl Into<Cow<'static, str>>,
        type_size: usize,
        handle_offsets: &[usize],
    ) -> Self {
        let mut layout = LayoutBuilder::new();
        for &offset in handle_offsets {
            layout.handle(offset);
        }
        Self {
            name: name.into(),
            type_size,
            type_align: mem::align_of::<Handle>(),
            handle_offsets: layout.finish(),
            drop_fn: None,
            movable: true,
        }
    }

    /// Type name, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of one object in bytes.
    #[must_use]
    pub const fn type_size(&self) -> usize {
        self.type_size
    }

    /// Alignment of one object.
    #[must_use]
    pub const fn type_align(&self) -> usize {
        self.type_align
    }

    /// Offsets of handle fields within one object, ascending.
    #[must_use]
    pub fn handle_offsets(&self) -> &[usize] {
        &self.handle_offsets
    }

    /// Whether objects of this type contain no handles.
    #[must_use]
    pub fn is_plain(&self) -> bool {
        self.handle_offsets.is_empty()
    }

    /// Whether compaction may move objects of this type.
    #[must_use]
    pub const fn is_movable(&self) -> bool {
        self.movable
    }

    /// Runs the destructor of one object.
    ///
    /// # Safety
    ///
    /// `object` must point to an initialized object of this type that is not
    /// used afterwards.
    pub(crate) unsafe fn drop_object(&self, object: *mut u8) {
        if let Some(drop_fn) = self.drop_fn {
            // SAFETY: forwarded caller contract.
            unsafe { drop_fn(object) };
        }
    }
}

impl std::fmt::Debug for TypeMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeMeta")
            .field("name", &self.name)
            .field("type_size", &self.type_size)
            .field("handle_offsets", &self.handle_offsets)
            .field("movable", &self.movable)
            .finish_non_exhaustive()
    }
}

/// Registry key of a type's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKey {
    /// A Rust type implementing [`Managed`].
    Rust(TypeId),
    /// A self-describing type identified by name.
    Named(&'static str),
}

impl TypeKey {
    /// Key of the Rust type `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self::Rust(TypeId::of::<T>())
    }
}

struct TypeSlot {
    meta: AtomicPtr<TypeMeta>,
}

impl Drop for TypeSlot {
    fn drop(&mut self) {
        let meta = *self.meta.get_mut();
        if !meta.is_null() {
            // SAFETY: published metadata is owned by its slot.
            drop(unsafe { Box::from_raw(meta) });
        }
    }
}

/// Per-collector cache of type metadata.
///
/// Each key owns one slot whose metadata pointer is published once with a
/// compare-exchange. A thread that loses the publication race frees its own
/// copy and adopts the winner's. Metadata lives as long as the registry.
#[derive(Default)]
pub struct TypeRegistry {
    slots: RwLock<HashMap<TypeKey, Box<TypeSlot>>>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata of `T`, registering it on first use.
    pub fn of<T: Managed>(&self) -> &TypeMeta {
        self.publish(TypeKey::of::<T>(), TypeMeta::of::<T>)
    }

    /// Already-published metadata for `key`.
    pub fn get(&self, key: TypeKey) -> Option<&TypeMeta> {
        let slots = self.slots.read();
        let meta = slots.get(&key)?.meta.load(Ordering::Acquire);
        // SAFETY: published metadata is never freed before the registry.
        unsafe { meta.as_ref() }
    }

    /// Returns the metadata for `key`, publishing `make()` if none exists.
    pub fn publish(&self, key: TypeKey, make: impl FnOnce() -> TypeMeta) -> &TypeMeta {
        let slot = self.slot(key);
        let current = slot.load(Ordering::Acquire);
        if !current.is_null() {
            // SAFETY: see `get`.
            return unsafe { &*current };
        }

        let fresh = Box::into_raw(Box::new(make()));
        match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            // SAFETY: `fresh` is now owned by the slot.
            Ok(_) => unsafe { &*fresh },
            Err(winner) => {
                // SAFETY: `fresh` was never shared.
                drop(unsafe { Box::from_raw(fresh) });
                // SAFETY: see `get`.
                unsafe { &*winner }
            }
        }
    }

    /// Number of keys with a slot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether no type has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    fn slot(&self, key: TypeKey) -> &AtomicPtr<TypeMeta> {
        if let Some(slot) = self.slots.read().get(&key) {
            let slot: *const TypeSlot = &**slot;
            // SAFETY: slots are boxed and never removed, so the address
            // outlives the read guard.
            return unsafe { &(*slot).meta };
        }
        let mut slots = self.slots.write();
        let slot: *const TypeSlot = &**slots.entry(key).or_insert_with(|| {
            Box::new(TypeSlot {
                meta: AtomicPtr::new(ptr::null_mut()),
            })
        });
        // SAFETY: as above.
        unsafe { &(*slot).meta }
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.len())
            .finish()
    }
}

macro_rules! impl_plain_managed {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl Managed for $t {
                #[inline]
                fn describe(_layout: &mut LayoutBuilder, _base: usize) {}
            }
        )*
    };
}

impl_plain_managed![
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char, String,
    Box<str>,
];

unsafe impl Managed for Handle {
    #[inline]
    fn describe(layout: &mut LayoutBuilder, base: usize) {
        layout.handle(base);
    }
}

unsafe impl<T: Managed, const N: usize> Managed for [T; N] {
    const MOVABLE: bool = T::MOVABLE;

    fn describe(layout: &mut LayoutBuilder, base: usize) {
        for i in 0..N {
            T::describe(layout, base + i * mem::size_of::<T>());
        }
    }
}

// Heap-allocated contents are invisible to the collector, so only element
// types that cannot hold handles are allowed.
unsafe impl<T: Copy + Send + 'static> Managed for Vec<T> {
    #[inline]
    fn describe(_layout: &mut LayoutBuilder, _base: usize) {}
}

unsafe impl<T: Send + 'static> Managed for PhantomData<T> {
    #[inline]
    fn describe(_layout: &mut LayoutBuilder, _base: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[repr(C)]
    struct Pair {
        tag: u64,
        left: Handle,
        right: Handle,
    }

    unsafe impl Managed for Pair {
        fn describe(layout: &mut LayoutBuilder, base: usize) {
            u64::describe(layout, base + mem::offset_of!(Pair, tag));
            Handle::describe(layout, base + mem::offset_of!(Pair, left));
            Handle::describe(layout, base + mem::offset_of!(Pair, right));
        }
    }

    #[test]
    fn test_meta_of_struct_with_handles() {
        let meta = TypeMeta::of::<Pair>();
        assert_eq!(meta.type_size(), mem::size_of::<Pair>());
        assert_eq!(meta.handle_offsets(), &[8, 16]);
        assert!(meta.is_movable());
        assert!(!meta.is_plain());
        assert!(meta.name().ends_with("Pair"));
    }

    #[test]
    fn test_meta_of_array_repeats_offsets() {
        let meta = TypeMeta::of::<[Handle; 3]>();
        assert_eq!(meta.handle_offsets(), &[0, 8, 16]);
    }

    #[test]
    fn test_plain_meta_has_no_drop_for_copy_types() {
        let meta = TypeMeta::of::<u64>();
        assert!(meta.is_plain());
        assert!(meta.drop_fn.is_none());
        assert!(TypeMeta::of::<String>().drop_fn.is_some());
    }

    #[test]
    fn test_self_describing_sorts_and_dedups() {
        let meta = TypeMeta::self_describing("node", 32, &[16, 0, 16]);
        assert_eq!(meta.handle_offsets(), &[0, 16]);
        assert_eq!(meta.name(), "node");
    }

    #[test]
    #[should_panic(expected = "not pointer aligned")]
    fn test_misaligned_handle_offset_panics() {
        let _ = TypeMeta::self_describing("bad", 16, &[3]);
    }

    #[test]
    fn test_registry_returns_same_meta() {
        let registry = TypeRegistry::new();
        let a: *const TypeMeta = registry.of::<Pair>();
        let b: *const TypeMeta = registry.of::<Pair>();
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(TypeKey::of::<Pair>()).is_some());
        assert!(registry.get(TypeKey::of::<u8>()).is_none());
    }

    #[test]
    fn test_registry_publication_race_has_one_winner() {
        let registry = Arc::new(TypeRegistry::new());
        let addrs: Vec<usize> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let meta = registry.publish(TypeKey::Named("raced"), || {
                        TypeMeta::self_describing(format!("raced-{i}"), 16, &[])
                    });
                    ptr::from_ref(meta) as usize
                })
            })
            .map(|h| h.join().unwrap())
            .collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    }
}
