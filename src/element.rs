use bytemuck::Pod;
use std::fmt;

/// Scalar data type of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ElementKind {
    /// Size of a single element in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementKind::I8 | ElementKind::U8 => 1,
            ElementKind::I16 | ElementKind::U16 => 2,
            ElementKind::I32 | ElementKind::U32 | ElementKind::F32 => 4,
            ElementKind::I64 | ElementKind::U64 | ElementKind::F64 => 8,
        }
    }

    /// WGSL scalar type, for the kinds a storage buffer can hold.
    pub fn wgsl_type(&self) -> Option<&'static str> {
        match self {
            ElementKind::I32 => Some("i32"),
            ElementKind::U32 => Some("u32"),
            ElementKind::F32 => Some("f32"),
            _ => None,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementKind::I8 => "I8",
            ElementKind::U8 => "U8",
            ElementKind::I16 => "I16",
            ElementKind::U16 => "U16",
            ElementKind::I32 => "I32",
            ElementKind::U32 => "U32",
            ElementKind::I64 => "I64",
            ElementKind::U64 => "U64",
            ElementKind::F32 => "F32",
            ElementKind::F64 => "F64",
        };
        f.write_str(name)
    }
}

/// Rust types that can back an allocation.
pub trait Element: Pod + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const KIND: ElementKind;
}

macro_rules! impl_element {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(impl Element for $ty {
            const KIND: ElementKind = ElementKind::$kind;
        })*
    };
}

impl_element! {
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}
