use crate::{op_region::OpRegion, AmlError, Handle, Operation};
use alloc::{borrow::Cow, string::String, sync::Arc, vec::Vec};
use bit_field::BitField;
use core::fmt;

use crate::namespace::AmlName;

/// A function provided by the interpreter itself that can be called like an AML method. Used for
/// `\_OSI`, which answers host-capability queries without any bytecode backing it.
pub type NativeMethodFn = fn(&[Arc<Object>]) -> Result<Arc<Object>, AmlError>;

#[derive(PartialEq)]
pub enum Object {
    Uninitialized,
    Buffer(Vec<u8>),
    BufferField { buffer: Arc<Object>, offset: usize, length: usize },
    Device,
    Event(Handle),
    FieldUnit(FieldUnit),
    Integer(u64),
    Method { code: Vec<u8>, flags: MethodFlags, serialize_mutex: Option<Arc<Object>>, wide_integers: bool },
    NativeMethod { f: NativeMethodFn, arg_count: usize },
    Mutex { mutex: Handle, sync_level: u8, owner: Option<u64>, recursion: u32 },
    Reference { kind: ReferenceKind, inner: Arc<Object> },
    OpRegion(OpRegion),
    Package(Vec<Arc<Object>>),
    PowerResource { system_level: u8, resource_order: u16 },
    Processor { proc_id: u8, pblk_address: u32, pblk_length: u8 },
    String(String),
    ThermalZone,
    Debug,
}

impl Object {
    /*
     * XXX: this hack stands in for a cleverer dynamic borrow-validation scheme. The interpreter
     * relies on mutating objects in place through shared references (e.g. `Store` to a named
     * integer), and the firmware's own serialization discipline is what makes this sound in
     * practice. Options for replacing it:
     *   - An `AtomicRefCell` around every object (likely too slow).
     *   - A namespace-wide lock handing out type-level mutation tokens.
     */
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn gain_mut(&self) -> &mut Self {
        #[allow(invalid_reference_casting)]
        unsafe {
            &mut *(self as *const Self as *mut Self)
        }
    }

    pub fn as_integer(&self) -> Result<u64, AmlError> {
        if let Object::Integer(value) = self {
            Ok(*value)
        } else {
            Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Integer, got: self.typ() })
        }
    }

    pub fn as_string(&self) -> Result<Cow<str>, AmlError> {
        if let Object::String(value) = self {
            Ok(Cow::from(value))
        } else {
            Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::String, got: self.typ() })
        }
    }

    pub fn as_buffer(&self) -> Result<&[u8], AmlError> {
        if let Object::Buffer(bytes) = self {
            Ok(bytes)
        } else {
            Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Buffer, got: self.typ() })
        }
    }

    pub fn as_package(&self) -> Result<&[Arc<Object>], AmlError> {
        if let Object::Package(elements) = self {
            Ok(elements)
        } else {
            Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Package, got: self.typ() })
        }
    }

    pub fn native_method(arg_count: usize, f: NativeMethodFn) -> Object {
        Object::NativeMethod { f, arg_count }
    }

    pub fn wrap(self) -> Arc<Object> {
        Arc::new(self)
    }

    pub fn read_buffer_field(&self, dst: &mut [u8]) -> Result<(), AmlError> {
        if let Self::BufferField { buffer, offset, length } = self {
            let buffer = match **buffer {
                Object::Buffer(ref buffer) => buffer.as_slice(),
                Object::String(ref string) => string.as_bytes(),
                _ => {
                    return Err(AmlError::InvalidOperationOnObject {
                        op: Operation::ReadBufferField,
                        typ: buffer.typ(),
                    })
                }
            };
            if (*offset + *length).div_ceil(8) > buffer.len() {
                return Err(AmlError::IndexOutOfBounds);
            }
            copy_bits(buffer, *offset, dst, 0, *length);
            Ok(())
        } else {
            Err(AmlError::InvalidOperationOnObject { op: Operation::ReadBufferField, typ: self.typ() })
        }
    }

    pub fn write_buffer_field(&self, value: &[u8]) -> Result<(), AmlError> {
        if let Self::BufferField { buffer, offset, length } = self {
            let buffer = match buffer.gain_mut() {
                Object::Buffer(buffer) => buffer.as_mut_slice(),
                // AML is trusted to keep the string valid UTF-8 here
                Object::String(string) => unsafe { string.as_bytes_mut() },
                _ => {
                    return Err(AmlError::InvalidOperationOnObject {
                        op: Operation::WriteBufferField,
                        typ: buffer.typ(),
                    })
                }
            };
            if (*offset + *length).div_ceil(8) > buffer.len() {
                return Err(AmlError::IndexOutOfBounds);
            }
            copy_bits(value, 0, buffer, *offset, *length);
            Ok(())
        } else {
            Err(AmlError::InvalidOperationOnObject { op: Operation::WriteBufferField, typ: self.typ() })
        }
    }

    /// Returns the `ObjectType` of this object. Returns the type of the referenced object in the
    /// case of `Object::Reference`.
    pub fn typ(&self) -> ObjectType {
        match self {
            Object::Uninitialized => ObjectType::Uninitialized,
            Object::Buffer(_) => ObjectType::Buffer,
            Object::BufferField { .. } => ObjectType::BufferField,
            Object::Device => ObjectType::Device,
            Object::Event(_) => ObjectType::Event,
            Object::FieldUnit(_) => ObjectType::FieldUnit,
            Object::Integer(_) => ObjectType::Integer,
            Object::Method { .. } => ObjectType::Method,
            Object::NativeMethod { .. } => ObjectType::Method,
            Object::Mutex { .. } => ObjectType::Mutex,
            Object::Reference { inner, .. } => inner.typ(),
            Object::OpRegion(_) => ObjectType::OpRegion,
            Object::Package(_) => ObjectType::Package,
            Object::PowerResource { .. } => ObjectType::PowerResource,
            Object::Processor { .. } => ObjectType::Processor,
            Object::String(_) => ObjectType::String,
            Object::ThermalZone => ObjectType::ThermalZone,
            Object::Debug => ObjectType::Debug,
        }
    }

    /// Unwrap all levels of reference, following chains until a non-reference object is reached.
    pub fn unwrap_reference(self: Arc<Object>) -> Arc<Object> {
        let mut object = self;
        loop {
            if let Object::Reference { ref inner, .. } = *object {
                object = inner.clone();
            } else {
                return object.clone();
            }
        }
    }

    /// Unwraps 'transparent' references (locals, arguments, and other internal uses of
    /// reference-type objects), but maintains 'real' references deliberately created by AML.
    pub fn unwrap_transparent_reference(self: Arc<Self>) -> Arc<Object> {
        let mut object = self;
        loop {
            let next = if let Object::Reference { ref kind, ref inner } = *object {
                if *kind == ReferenceKind::LocalOrArg {
                    Some(inner.clone())
                } else {
                    None
                }
            } else {
                None
            };
            match next {
                Some(inner) => object = inner,
                None => return object.clone(),
            }
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Uninitialized => write!(f, "[Uninitialized]"),
            Object::Buffer(bytes) => write!(f, "Buffer({} bytes)", bytes.len()),
            Object::BufferField { offset, length, .. } => {
                write!(f, "BufferField {{ offset: {}, length: {} }}", offset, length)
            }
            Object::Device => write!(f, "Device"),
            Object::Event(handle) => write!(f, "Event({:?})", handle),
            Object::FieldUnit(field) => write!(f, "{:?}", field),
            Object::Integer(value) => write!(f, "Integer({:#x})", value),
            Object::Method { flags, .. } => write!(f, "Method(args: {})", flags.arg_count()),
            Object::NativeMethod { arg_count, .. } => write!(f, "NativeMethod(args: {})", arg_count),
            Object::Mutex { sync_level, recursion, .. } => {
                write!(f, "Mutex {{ sync_level: {}, recursion: {} }}", sync_level, recursion)
            }
            Object::Reference { kind, inner } => write!(f, "Reference({:?} -> {:?})", kind, inner),
            Object::OpRegion(region) => write!(f, "{:?}", region),
            Object::Package(elements) => write!(f, "Package({} elements)", elements.len()),
            Object::PowerResource { system_level, resource_order } => {
                write!(f, "PowerResource {{ system_level: {}, resource_order: {} }}", system_level, resource_order)
            }
            Object::Processor { proc_id, .. } => write!(f, "Processor(id: {})", proc_id),
            Object::String(value) => write!(f, "String({:?})", value),
            Object::ThermalZone => write!(f, "ThermalZone"),
            Object::Debug => write!(f, "Debug"),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct FieldUnit {
    pub kind: FieldUnitKind,
    pub flags: FieldFlags,
    pub bit_index: usize,
    pub bit_length: usize,
}

#[derive(Clone, PartialEq, Debug)]
pub enum FieldUnitKind {
    Normal { region: Arc<Object> },
    Bank { region: Arc<Object>, bank: Arc<Object>, bank_value: u64 },
    Index { index: Arc<Object>, data: Arc<Object> },
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct FieldFlags(pub u8);

#[derive(Clone, Copy, Debug)]
pub enum FieldAccessType {
    Any,
    Byte,
    Word,
    DWord,
    QWord,
    Buffer,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum FieldUpdateRule {
    Preserve,
    WriteAsOnes,
    WriteAsZeros,
}

impl FieldFlags {
    pub fn access_type(&self) -> Result<FieldAccessType, AmlError> {
        match self.0.get_bits(0..4) {
            0 => Ok(FieldAccessType::Any),
            1 => Ok(FieldAccessType::Byte),
            2 => Ok(FieldAccessType::Word),
            3 => Ok(FieldAccessType::DWord),
            4 => Ok(FieldAccessType::QWord),
            5 => Ok(FieldAccessType::Buffer),
            _ => Err(AmlError::InvalidFieldFlags),
        }
    }

    pub fn access_type_bytes(&self) -> Result<usize, AmlError> {
        match self.access_type()? {
            FieldAccessType::Any => {
                // All widths are valid in this case; the narrowest is always correct
                Ok(1)
            }
            FieldAccessType::Byte | FieldAccessType::Buffer => Ok(1),
            FieldAccessType::Word => Ok(2),
            FieldAccessType::DWord => Ok(4),
            FieldAccessType::QWord => Ok(8),
        }
    }

    /// Whether accesses to the field must be bracketed by the global lock (`\_GL_`).
    pub fn lock_rule(&self) -> bool {
        self.0.get_bit(4)
    }

    pub fn update_rule(&self) -> FieldUpdateRule {
        match self.0.get_bits(5..7) {
            0 => FieldUpdateRule::Preserve,
            1 => FieldUpdateRule::WriteAsOnes,
            2 => FieldUpdateRule::WriteAsZeros,
            _ => FieldUpdateRule::Preserve,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct MethodFlags(pub u8);

impl MethodFlags {
    pub fn arg_count(&self) -> usize {
        self.0.get_bits(0..3) as usize
    }

    pub fn serialize(&self) -> bool {
        self.0.get_bit(3)
    }

    pub fn sync_level(&self) -> u8 {
        self.0.get_bits(4..8)
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum ReferenceKind {
    RefOf,
    LocalOrArg,
    /// A namestring that did not resolve at parse time. The inner object holds the namestring,
    /// and `scope` records where resolution must start when the reference is used. Packages store
    /// forward references like this instead of object pointers, which is also what keeps the
    /// object graph acyclic.
    Unresolved {
        scope: AmlName,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjectType {
    Uninitialized,
    Buffer,
    BufferField,
    Device,
    Event,
    FieldUnit,
    Integer,
    Method,
    Mutex,
    Reference,
    OpRegion,
    Package,
    PowerResource,
    Processor,
    String,
    ThermalZone,
    Debug,
}

/// Helper type for decoding the result of `_STA` objects.
pub struct DeviceStatus(pub u64);

impl DeviceStatus {
    pub fn present(&self) -> bool {
        self.0.get_bit(0)
    }

    pub fn enabled(&self) -> bool {
        self.0.get_bit(1)
    }

    pub fn show_in_ui(&self) -> bool {
        self.0.get_bit(2)
    }

    pub fn functioning(&self) -> bool {
        self.0.get_bit(3)
    }
}

/// Copy an arbitrary bit range of `src` to an arbitrary bit range of `dst`. This is used for
/// buffer fields. Data is zero-extended if `src` does not cover `length` bits, matching the
/// expected behaviour for buffer fields.
pub(crate) fn copy_bits(src: &[u8], mut src_index: usize, dst: &mut [u8], mut dst_index: usize, mut length: usize) {
    while length > 0 {
        let src_shift = src_index & 7;
        let mut src_bits = src.get(src_index / 8).unwrap_or(&0x00) >> src_shift;
        if src_shift > 0 && length > (8 - src_shift) {
            src_bits |= src.get(src_index / 8 + 1).unwrap_or(&0x00) << (8 - src_shift);
        }

        if length < 8 {
            src_bits &= (1 << length) - 1;
        }

        let dst_shift = dst_index & 7;
        let mut dst_mask: u16 = if length < 8 { ((1 << length) - 1) as u16 } else { 0xff_u16 } << dst_shift;
        dst[dst_index / 8] = (dst[dst_index / 8] & !(dst_mask as u8)) | ((src_bits << dst_shift) & (dst_mask as u8));

        if dst_shift > 0 && length > (8 - dst_shift) {
            dst_mask >>= 8;
            dst[dst_index / 8 + 1] &= !(dst_mask as u8);
            dst[dst_index / 8 + 1] |= (src_bits >> (8 - dst_shift)) & (dst_mask as u8);
        }

        if length < 8 {
            length = 0;
        } else {
            length -= 8;
            src_index += 8;
            dst_index += 8;
        }
    }
}

#[inline]
pub(crate) fn align_down(value: usize, align: usize) -> usize {
    assert!(align == 0 || align.is_power_of_two());

    if align == 0 {
        value
    } else {
        value & !(align - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_copy_bits() {
        let src = [0b1011_1111, 0b1111_0111, 0b1111_1111, 0b1111_1111, 0b1111_1111];
        let mut dst = [0b1110_0001, 0, 0, 0, 0];

        copy_bits(&src, 0, &mut dst, 2, 15);
        assert_eq!(dst, [0b1111_1101, 0b1101_1110, 0b0000_0001, 0b0000_0000, 0b0000_0000]);
    }

    #[test]
    fn buffer_field_round_trip() {
        let buffer = Object::Buffer(vec![0; 4]).wrap();
        let field = Object::BufferField { buffer: buffer.clone(), offset: 4, length: 12 };

        field.write_buffer_field(&0xabc_u16.to_le_bytes()).unwrap();
        let mut read_back = [0u8; 2];
        field.read_buffer_field(&mut read_back).unwrap();
        assert_eq!(u16::from_le_bytes(read_back), 0xabc);

        // The surrounding bits must be untouched
        assert_eq!(buffer.as_buffer().unwrap(), &[0xc0, 0xab, 0x00, 0x00]);
    }

    #[test]
    fn buffer_field_out_of_bounds() {
        let buffer = Object::Buffer(vec![0; 2]).wrap();
        let field = Object::BufferField { buffer, offset: 8, length: 16 };
        let mut dst = [0u8; 2];
        assert_eq!(field.read_buffer_field(&mut dst), Err(AmlError::IndexOutOfBounds));
    }

    #[test]
    fn transparent_references() {
        let value = Object::Integer(42).wrap();
        let local = Object::Reference { kind: ReferenceKind::LocalOrArg, inner: value.clone() }.wrap();
        let explicit = Object::Reference { kind: ReferenceKind::RefOf, inner: value.clone() }.wrap();

        assert_eq!(local.clone().unwrap_transparent_reference().as_integer(), Ok(42));
        // A `RefOf` reference survives transparent unwrapping
        assert_eq!(explicit.clone().unwrap_transparent_reference().typ(), ObjectType::Integer);
        assert!(matches!(*explicit.clone().unwrap_transparent_reference(), Object::Reference { .. }));
        assert_eq!(explicit.unwrap_reference().as_integer(), Ok(42));
    }
}
