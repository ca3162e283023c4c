use std::fmt;

/// Round up to a multiple of `align` (which must be a power of two)
pub const fn roundto(num: usize, align: usize) -> usize {
    (num + align - 1) & !(align - 1)
}

/// Wrapper to format a pointer-sized value as a pointer in debug/trace output
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UsizePtr(pub usize);
impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0 as *const ())
    }
}
impl<T> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as usize)
    }
}
impl<T> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as usize)
    }
}
impl<T> From<&T> for UsizePtr {
    fn from(value: &T) -> Self {
        Self(value as *const T as usize)
    }
}
