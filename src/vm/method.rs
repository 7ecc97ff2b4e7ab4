use std::fmt;

use once_cell::sync::OnceCell;

use super::class::ClassId;
use super::classfile::{
    ACC_ABSTRACT, ACC_NATIVE, ACC_PRIVATE, ACC_STATIC, ACC_SYNCHRONIZED, ExceptionHandler,
    MethodDef,
};
use super::debug::LineTable;
use super::frame::STACK_FRAME_WORDS;
use super::native::NativeFn;
use super::run_target::{RunState, RunTarget, SendTarget};
use super::value::{JavaType, ReturnType};

/// Index of a method in the VM's method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl MethodId {
    /// Encoding used in the literals register and saved-CP slots; 0 is "none".
    #[inline]
    pub fn to_word(self) -> u64 {
        self.0 as u64 + 1
    }

    #[inline]
    pub fn from_word(word: u64) -> Option<Self> {
        if word == 0 {
            None
        } else {
            Some(MethodId((word - 1) as u32))
        }
    }
}

/// Parsed method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub args: Vec<JavaType>,
    pub ret: JavaType,
}

impl MethodSignature {
    /// Stack slots taken by the declared arguments (receiver excluded).
    pub fn arg_slots(&self) -> usize {
        self.args.iter().map(|t| t.slots()).sum()
    }
}

/// Parse `(IJLjava/lang/String;[D)V`.
pub fn parse_method_descriptor(descriptor: &str) -> Option<MethodSignature> {
    let rest = descriptor.strip_prefix('(')?;
    let close = rest.find(')')?;
    let (params, ret) = (&rest[..close], &rest[close + 1..]);
    let mut args = Vec::new();
    let mut chars = params.char_indices().peekable();
    while let Some((start, _)) = chars.peek().copied() {
        let len = field_descriptor_len(&params[start..])?;
        args.push(parse_field_descriptor(&params[start..start + len])?);
        for _ in 0..len {
            chars.next();
        }
    }
    let ret = if ret == "V" {
        JavaType::Void
    } else {
        parse_field_descriptor(ret)?
    };
    Some(MethodSignature { args, ret })
}

/// Parse a single field descriptor (`I`, `Ljava/lang/Object;`, `[[J`).
pub fn parse_field_descriptor(descriptor: &str) -> Option<JavaType> {
    if field_descriptor_len(descriptor)? != descriptor.len() {
        return None;
    }
    let first = descriptor.chars().next()?;
    match JavaType::from_descriptor_char(first)? {
        JavaType::Void => None,
        ty => Some(ty),
    }
}

/// Length of the leading field descriptor in `s`.
fn field_descriptor_len(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while bytes.get(i) == Some(&b'[') {
        i += 1;
    }
    match bytes.get(i)? {
        b'L' => Some(s[i..].find(';')? + i + 1),
        b'Z' | b'B' | b'C' | b'S' | b'I' | b'J' | b'F' | b'D' => Some(i + 1),
        _ => None,
    }
}

/// Split a method descriptor's parameters into individual descriptors.
pub fn split_parameter_descriptors(descriptor: &str) -> Vec<String> {
    let mut out = Vec::new();
    let Some(rest) = descriptor.strip_prefix('(') else {
        return out;
    };
    let Some(close) = rest.find(')') else {
        return out;
    };
    let mut params = &rest[..close];
    while let Some(len) = field_descriptor_len(params) {
        out.push(params[..len].to_string());
        params = &params[len..];
    }
    out
}

/// A linked method. Immutable apart from its run target and the lazily bound
/// native implementation.
pub struct Method {
    pub id: MethodId,
    pub class_id: ClassId,
    pub class_name: String,
    pub name: String,
    pub descriptor: String,
    pub flags: u16,
    pub signature: MethodSignature,
    /// Argument slots including the receiver.
    pub arg_slots: usize,
    pub max_locals: usize,
    pub max_stack: usize,
    pub code: Box<[u8]>,
    pub exception_table: Vec<ExceptionHandler>,
    pub lines: LineTable,
    pub run_target: RunTarget,
    pub(crate) itable_index: OnceCell<usize>,
    pub(crate) native: OnceCell<NativeFn>,
}

impl Method {
    pub(crate) fn from_def(
        def: &MethodDef,
        id: MethodId,
        class_id: ClassId,
        class_name: &str,
        initial_count: Option<u32>,
    ) -> Result<Self, String> {
        let signature = parse_method_descriptor(&def.descriptor)
            .ok_or_else(|| format!("malformed descriptor {}", def.descriptor))?;
        let receiver = usize::from(def.flags & ACC_STATIC == 0);
        let arg_slots = signature.arg_slots() + receiver;
        let is_native = def.flags & ACC_NATIVE != 0;
        let is_abstract = def.flags & ACC_ABSTRACT != 0;
        if !is_native && !is_abstract && def.code.is_empty() {
            return Err(format!("{}{} has no code", def.name, def.descriptor));
        }
        let max_locals = (def.max_locals as usize).max(arg_slots);

        let initial = if is_native {
            RunState::Send(SendTarget::BindNative)
        } else if is_abstract {
            RunState::Send(SendTarget::UnsatisfiedOrAbstract)
        } else {
            match initial_count {
                Some(count) => RunState::Counting(count),
                None => RunState::Send(SendTarget::Interpreted),
            }
        };

        let mut lines = LineTable::new();
        for &(pc, line) in &def.line_numbers {
            lines.add(pc as usize, line as usize);
        }

        Ok(Method {
            id,
            class_id,
            class_name: class_name.to_string(),
            name: def.name.clone(),
            descriptor: def.descriptor.clone(),
            flags: def.flags,
            signature,
            arg_slots,
            max_locals,
            max_stack: def.max_stack as usize,
            code: def.code.clone().into_boxed_slice(),
            exception_table: def.exception_table.clone(),
            lines,
            run_target: RunTarget::new(initial),
            itable_index: OnceCell::new(),
            native: OnceCell::new(),
        })
    }

    /// A body-less copy of `template` dispatching to `target`. Used for the
    /// slots of conflicting default methods.
    pub(crate) fn stand_in(template: &Method, id: MethodId, target: SendTarget) -> Self {
        Method {
            id,
            class_id: template.class_id,
            class_name: template.class_name.clone(),
            name: template.name.clone(),
            descriptor: template.descriptor.clone(),
            flags: template.flags | ACC_ABSTRACT,
            signature: template.signature.clone(),
            arg_slots: template.arg_slots,
            max_locals: template.arg_slots,
            max_stack: 0,
            code: Box::new([]),
            exception_table: Vec::new(),
            lines: LineTable::new(),
            run_target: RunTarget::new(RunState::Send(target)),
            itable_index: OnceCell::new(),
            native: OnceCell::new(),
        }
    }

    /// Replace the run target of a freshly created method.
    pub(crate) fn with_send_target(self, target: SendTarget) -> Self {
        self.run_target.store(RunState::Send(target));
        self
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.flags & ACC_STATIC != 0
    }

    #[inline]
    pub fn is_synchronized(&self) -> bool {
        self.flags & ACC_SYNCHRONIZED != 0
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        self.flags & ACC_NATIVE != 0
    }

    #[inline]
    pub fn is_abstract(&self) -> bool {
        self.flags & ACC_ABSTRACT != 0
    }

    #[inline]
    pub fn is_private(&self) -> bool {
        self.flags & ACC_PRIVATE != 0
    }

    pub fn is_initializer(&self) -> bool {
        self.name == "<init>"
    }

    pub fn is_class_initializer(&self) -> bool {
        self.name == "<clinit>"
    }

    /// Whether this method takes part in virtual dispatch.
    pub fn is_virtual(&self) -> bool {
        !self.is_static() && !self.is_private() && !self.name.starts_with('<')
    }

    #[inline]
    pub fn return_type(&self) -> ReturnType {
        self.signature.ret.return_type()
    }

    /// Locals that are not arguments; zeroed at frame build.
    #[inline]
    pub fn temp_count(&self) -> usize {
        self.max_locals - self.arg_slots
    }

    /// The extra slot a synchronized method keeps its monitor object in.
    #[inline]
    pub fn sync_slots(&self) -> usize {
        usize::from(self.is_synchronized())
    }

    /// Words between the frame base and the saved-A0 slot of its frame.
    #[inline]
    pub fn locals_and_sync(&self) -> usize {
        self.max_locals + self.sync_slots()
    }

    /// Words needed below the arguments to enter this method.
    pub fn stack_use(&self) -> usize {
        self.temp_count() + self.sync_slots() + STACK_FRAME_WORDS + self.max_stack
    }

    pub fn itable_index(&self) -> Option<usize> {
        self.itable_index.get().copied()
    }

    /// `java/lang/Object.toString()Ljava/lang/String;`
    pub fn full_name(&self) -> String {
        format!("{}.{}{}", self.class_name, self.name, self.descriptor)
    }

    /// Whether `name`/`descriptor` select this method.
    pub fn matches(&self, name: &str, descriptor: &str) -> bool {
        self.name == name && self.descriptor == descriptor
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("name", &self.full_name())
            .field("run_target", &self.run_target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method_descriptor() {
        let sig = parse_method_descriptor("(IJLjava/lang/String;[DZ)V").unwrap();
        assert_eq!(
            sig.args,
            vec![
                JavaType::Int,
                JavaType::Long,
                JavaType::Reference,
                JavaType::Reference,
                JavaType::Boolean
            ]
        );
        assert_eq!(sig.ret, JavaType::Void);
        assert_eq!(sig.arg_slots(), 6);
    }

    #[test]
    fn test_rejects_malformed_descriptors() {
        assert!(parse_method_descriptor("I)V").is_none());
        assert!(parse_method_descriptor("(Ljava/lang/String)V").is_none());
        assert!(parse_method_descriptor("(Q)V").is_none());
        assert!(parse_field_descriptor("V").is_none());
        assert!(parse_field_descriptor("II").is_none());
    }

    #[test]
    fn test_split_parameters() {
        assert_eq!(
            split_parameter_descriptors("(I[Ljava/lang/Object;J)V"),
            vec!["I", "[Ljava/lang/Object;", "J"]
        );
    }

    #[test]
    fn test_initial_run_target() {
        let def = MethodDef {
            name: "f".into(),
            descriptor: "(JI)I".into(),
            flags: ACC_STATIC,
            max_locals: 1,
            code: vec![0x03, 0xac],
            ..MethodDef::default()
        };
        let m = Method::from_def(&def, MethodId(0), ClassId(0), "A", Some(5)).unwrap();
        assert_eq!(m.arg_slots, 3);
        assert_eq!(m.max_locals, 3);
        assert_eq!(m.run_target.load(), RunState::Counting(5));

        let native = MethodDef {
            flags: ACC_NATIVE,
            code: Vec::new(),
            ..def
        };
        let m = Method::from_def(&native, MethodId(1), ClassId(0), "A", Some(5)).unwrap();
        assert_eq!(m.arg_slots, 4);
        assert_eq!(m.run_target.load(), RunState::Send(SendTarget::BindNative));
    }
}
