use std::fmt;

/// One slot of the Java stack, a local variable or an object field.
pub type Word = u64;

/// A reference to a heap object. `ObjectRef::NULL` is the Java `null`.
///
/// The raw value is a 1-based handle into the heap's object table so that a
/// zeroed slot reads back as `null`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectRef(u64);

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef(0);

    #[inline]
    pub fn from_word(word: Word) -> Self {
        ObjectRef(word)
    }

    #[inline]
    pub fn to_word(self) -> Word {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Index into the heap table, or `None` for null.
    #[inline]
    pub(crate) fn index(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some((self.0 - 1) as usize)
        }
    }

    #[inline]
    pub(crate) fn from_index(index: usize) -> Self {
        ObjectRef(index as u64 + 1)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "@{}", self.0)
        }
    }
}

/// Field, local and argument types as they appear in descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JavaType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Reference,
    Void,
}

impl JavaType {
    /// Number of stack slots a value of this type occupies.
    #[inline]
    pub fn slots(self) -> usize {
        match self {
            JavaType::Long | JavaType::Double => 2,
            JavaType::Void => 0,
            _ => 1,
        }
    }

    pub fn is_wide(self) -> bool {
        self.slots() == 2
    }

    pub fn is_reference(self) -> bool {
        self == JavaType::Reference
    }

    /// Primitive type for a descriptor character (`I`, `J`, ...).
    pub fn from_descriptor_char(c: char) -> Option<Self> {
        Some(match c {
            'Z' => JavaType::Boolean,
            'B' => JavaType::Byte,
            'C' => JavaType::Char,
            'S' => JavaType::Short,
            'I' => JavaType::Int,
            'J' => JavaType::Long,
            'F' => JavaType::Float,
            'D' => JavaType::Double,
            'L' | '[' => JavaType::Reference,
            'V' => JavaType::Void,
            _ => return None,
        })
    }

    /// The return category used to pick a return trampoline.
    pub fn return_type(self) -> ReturnType {
        match self {
            JavaType::Void => ReturnType::Void,
            JavaType::Long => ReturnType::Long,
            JavaType::Float => ReturnType::Float,
            JavaType::Double => ReturnType::Double,
            JavaType::Reference => ReturnType::Object,
            _ => ReturnType::Int,
        }
    }

    /// Narrow a raw 32-bit value the way an array/field store of this type does.
    pub fn narrow(self, value: i32) -> i32 {
        match self {
            JavaType::Boolean => value & 1,
            JavaType::Byte => value as i8 as i32,
            JavaType::Char => value as u16 as i32,
            JavaType::Short => value as i16 as i32,
            _ => value,
        }
    }
}

/// Return-type category. The native calling convention places these in
/// different register classes, so each gets its own return trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum ReturnType {
    Void = 0,
    Int = 1,
    Long = 2,
    Float = 3,
    Double = 4,
    Object = 5,
}

impl ReturnType {
    pub const COUNT: usize = 6;

    pub fn slots(self) -> usize {
        match self {
            ReturnType::Void => 0,
            ReturnType::Long | ReturnType::Double => 2,
            _ => 1,
        }
    }
}

/// A typed Java value used at the embedding boundary (call-in arguments,
/// native method arguments and results).
#[derive(Clone, Copy, PartialEq)]
pub enum JValue {
    Void,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Ref(ObjectRef),
}

impl JValue {
    pub fn slots(&self) -> usize {
        match self {
            JValue::Void => 0,
            JValue::Long(_) | JValue::Double(_) => 2,
            _ => 1,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            JValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            JValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            JValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            JValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Option<ObjectRef> {
        match self {
            JValue::Ref(r) => Some(*r),
            _ => None,
        }
    }

    /// Whether this value can be passed where `ty` is expected.
    pub fn matches(&self, ty: JavaType) -> bool {
        matches!(
            (self, ty),
            (
                JValue::Int(_),
                JavaType::Int | JavaType::Boolean | JavaType::Byte | JavaType::Char | JavaType::Short
            ) | (JValue::Long(_), JavaType::Long)
                | (JValue::Float(_), JavaType::Float)
                | (JValue::Double(_), JavaType::Double)
                | (JValue::Ref(_), JavaType::Reference)
                | (JValue::Void, JavaType::Void)
        )
    }

    /// Encode into stack slots, lower address first.
    pub fn to_slots(&self) -> ([Word; 2], usize) {
        match *self {
            JValue::Void => ([0, 0], 0),
            JValue::Int(v) => ([int_to_word(v), 0], 1),
            JValue::Float(v) => ([float_to_word(v), 0], 1),
            JValue::Ref(r) => ([r.to_word(), 0], 1),
            JValue::Long(v) => ([v as u64, 0], 2),
            JValue::Double(v) => ([v.to_bits(), 0], 2),
        }
    }

    /// Decode a value of category `ty` from its lower slot.
    pub fn from_word(ty: ReturnType, word: Word) -> Self {
        match ty {
            ReturnType::Void => JValue::Void,
            ReturnType::Int => JValue::Int(word_to_int(word)),
            ReturnType::Long => JValue::Long(word as i64),
            ReturnType::Float => JValue::Float(word_to_float(word)),
            ReturnType::Double => JValue::Double(f64::from_bits(word)),
            ReturnType::Object => JValue::Ref(ObjectRef::from_word(word)),
        }
    }
}

impl fmt::Debug for JValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JValue::Void => write!(f, "void"),
            JValue::Int(v) => write!(f, "{}", v),
            JValue::Long(v) => write!(f, "{}L", v),
            JValue::Float(v) => write!(f, "{}f", v),
            JValue::Double(v) => write!(f, "{}d", v),
            JValue::Ref(r) => write!(f, "{:?}", r),
        }
    }
}

// =============================================================================
// Slot encoding helpers
// =============================================================================

#[inline(always)]
pub fn int_to_word(v: i32) -> Word {
    v as u32 as u64
}

#[inline(always)]
pub fn word_to_int(w: Word) -> i32 {
    w as u32 as i32
}

#[inline(always)]
pub fn float_to_word(v: f32) -> Word {
    v.to_bits() as u64
}

#[inline(always)]
pub fn word_to_float(w: Word) -> f32 {
    f32::from_bits(w as u32)
}
