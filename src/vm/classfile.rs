//! In-memory class definitions handed to [`JavaVM::define_class`].
//!
//! This is the boundary with class loading: whatever parses class files (or
//! the TOML program images used by the CLI) produces a [`ClassDef`], and the
//! engine links it into a [`Class`](super::class::Class).
//!
//! [`JavaVM::define_class`]: super::JavaVM::define_class

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SYNCHRONIZED: u16 = 0x0020;
/// Class flag: instances have no identity and cannot be synchronized on.
pub const ACC_VALUE: u16 = 0x0040;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;

/// A constant pool entry as written in the class file. Pool indices are
/// 1-based; `ClassDef::constants[0]` is index 1.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Class(String),
    Field {
        class: String,
        name: String,
        descriptor: String,
    },
    Method {
        class: String,
        name: String,
        descriptor: String,
    },
    InterfaceMethod {
        class: String,
        name: String,
        descriptor: String,
    },
    MethodType(String),
    /// A direct handle to a static or virtual method.
    MethodHandle {
        class: String,
        name: String,
        descriptor: String,
        is_static: bool,
    },
}

/// One row of a method's exception table. `catch_type` 0 catches everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

impl ExceptionHandler {
    #[inline]
    pub fn covers(&self, pc: usize) -> bool {
        (self.start_pc as usize) <= pc && pc < (self.end_pc as usize)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub descriptor: String,
    pub flags: u16,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodDef {
    pub name: String,
    pub descriptor: String,
    pub flags: u16,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionHandler>,
    /// `(pc, line)` pairs.
    pub line_numbers: Vec<(u16, u32)>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClassDef {
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub flags: u16,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
    pub constants: Vec<Constant>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_name: Some("java/lang/Object".to_string()),
            ..Self::default()
        }
    }

    pub fn constant(&self, index: u16) -> Option<&Constant> {
        if index == 0 {
            return None;
        }
        self.constants.get(index as usize - 1)
    }

    pub fn is_interface(&self) -> bool {
        self.flags & ACC_INTERFACE != 0
    }
}

/// Deduplicating constant pool builder used by the assembler.
#[derive(Debug, Default)]
pub struct ConstantPoolBuilder {
    entries: Vec<Constant>,
}

impl ConstantPoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `constant`, adding it if needed.
    pub fn add(&mut self, constant: Constant) -> u16 {
        if let Some(pos) = self.entries.iter().position(|c| same_constant(c, &constant)) {
            return (pos + 1) as u16;
        }
        self.entries.push(constant);
        self.entries.len() as u16
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finish(self) -> Vec<Constant> {
        self.entries
    }
}

// Floats compare bitwise so NaN constants dedupe and 0.0/-0.0 stay distinct.
fn same_constant(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Float(x), Constant::Float(y)) => x.to_bits() == y.to_bits(),
        (Constant::Double(x), Constant::Double(y)) => x.to_bits() == y.to_bits(),
        _ => a == b,
    }
}
