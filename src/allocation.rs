use crate::context::ContextShared;
use crate::element::{Element, ElementKind};
use crate::error::{HarnessError, Result};
use bytemuck::Zeroable;
use ndarray::Array2;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shape and element type of an allocation. Rows run along `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Type {
    pub element: ElementKind,
    pub dim_x: u32,
    pub dim_y: u32,
}

impl Type {
    pub fn new(element: ElementKind, dim_x: u32, dim_y: u32) -> Result<Self> {
        if dim_x == 0 || dim_y == 0 {
            return Err(HarnessError::Allocation(format!(
                "dimensions must be positive, got {dim_x}x{dim_y}"
            )));
        }
        let ty = Self {
            element,
            dim_x,
            dim_y,
        };
        ty.size_bytes()?;
        Ok(ty)
    }

    pub fn of<T: Element>(dim_x: u32, dim_y: u32) -> Result<Self> {
        Self::new(T::KIND, dim_x, dim_y)
    }

    pub fn shape(&self) -> (u32, u32) {
        (self.dim_x, self.dim_y)
    }

    pub fn element_count(&self) -> u64 {
        self.dim_x as u64 * self.dim_y as u64
    }

    pub fn size_bytes(&self) -> Result<u64> {
        self.element_count()
            .checked_mul(self.element.size_bytes() as u64)
            .filter(|&bytes| usize::try_from(bytes).is_ok())
            .ok_or_else(|| {
                HarnessError::Allocation(format!(
                    "{}x{} {} buffer does not fit in memory",
                    self.dim_x, self.dim_y, self.element
                ))
            })
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}x{}]", self.element, self.dim_x, self.dim_y)
    }
}

/// Byte budget shared by every allocation of one context.
#[derive(Debug)]
pub(crate) struct AllocationBudget {
    limit: u64,
    used: AtomicU64,
}

impl AllocationBudget {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    pub(crate) fn reserve(&self, bytes: u64) -> Result<()> {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.limit)
            })
            .map(|_| ())
            .map_err(|used| {
                HarnessError::Allocation(format!(
                    "context exhausted: {bytes} bytes requested, {used} of {} in use",
                    self.limit
                ))
            })
    }

    pub(crate) fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub(crate) fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}

struct AllocationInner<T: Element> {
    id: u64,
    ty: Type,
    bytes: u64,
    data: RwLock<Array2<T>>,
    owner: Arc<ContextShared>,
}

impl<T: Element> Drop for AllocationInner<T> {
    fn drop(&mut self) {
        self.owner.budget.release(self.bytes);
        log::debug!("allocation #{} ({}) released", self.id, self.ty);
    }
}

/// A fixed-shape buffer owned by a compute context.
///
/// Cloning yields another handle to the same memory.
pub struct Allocation<T: Element> {
    inner: Arc<AllocationInner<T>>,
}

impl<T: Element> Clone for Allocation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Element> fmt::Debug for Allocation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.inner.id)
            .field("type", &self.inner.ty)
            .finish()
    }
}

impl<T: Element> Allocation<T> {
    pub(crate) fn new(owner: &Arc<ContextShared>, ty: Type) -> Result<Self> {
        if ty.element != T::KIND {
            return Err(HarnessError::Allocation(format!(
                "type {ty} cannot back a buffer of {}",
                T::KIND
            )));
        }
        let bytes = ty.size_bytes()?;
        owner.budget.reserve(bytes)?;

        let data = Array2::from_elem((ty.dim_y as usize, ty.dim_x as usize), T::zeroed());
        let id = owner.next_allocation_id();
        log::debug!("allocation #{id} created: {ty} ({bytes} bytes)");

        Ok(Self {
            inner: Arc::new(AllocationInner {
                id,
                ty,
                bytes,
                data: RwLock::new(data),
                owner: Arc::clone(owner),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn ty(&self) -> Type {
        self.inner.ty
    }

    /// `(dim_x, dim_y)`
    pub fn shape(&self) -> (u32, u32) {
        self.inner.ty.shape()
    }

    pub fn dim_x(&self) -> u32 {
        self.inner.ty.dim_x
    }

    pub fn dim_y(&self) -> u32 {
        self.inner.ty.dim_y
    }

    pub fn len(&self) -> usize {
        self.inner.ty.element_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn same_as(&self, other: &Allocation<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn owned_by(&self, owner: &Arc<ContextShared>) -> bool {
        Arc::ptr_eq(&self.inner.owner, owner)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Array2<T>> {
        self.inner.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Array2<T>> {
        self.inner.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_coords(&self, x: u32, y: u32) -> Result<(usize, usize)> {
        if x >= self.dim_x() || y >= self.dim_y() {
            return Err(HarnessError::Allocation(format!(
                "({x}, {y}) is outside {}",
                self.inner.ty
            )));
        }
        Ok((y as usize, x as usize))
    }

    /// Overwrites the whole buffer, row-major.
    pub fn copy_from(&self, src: &[T]) -> Result<()> {
        self.inner.owner.ensure_active()?;
        if src.len() != self.len() {
            return Err(HarnessError::Allocation(format!(
                "copy of {} elements into {} ({} elements)",
                src.len(),
                self.inner.ty,
                self.len()
            )));
        }
        let mut data = self.write();
        for (dst, &value) in data.iter_mut().zip(src) {
            *dst = value;
        }
        Ok(())
    }

    /// Row-major snapshot of the contents.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.inner.owner.ensure_active()?;
        Ok(self.read().iter().copied().collect())
    }

    pub fn get(&self, x: u32, y: u32) -> Result<T> {
        self.inner.owner.ensure_active()?;
        let index = self.check_coords(x, y)?;
        Ok(self.read()[index])
    }

    pub fn set(&self, x: u32, y: u32, value: T) -> Result<()> {
        self.inner.owner.ensure_active()?;
        let index = self.check_coords(x, y)?;
        self.write()[index] = value;
        Ok(())
    }
}
