//! A small text assembler for method bodies.
//!
//! One instruction per line, written with its class-file mnemonic:
//!
//! ```text
//!     .line 3
//!     iload_0
//!     ifle done
//!     getstatic demo/Main.count I
//!     invokestatic demo/Main.step(I)I
//! done:
//!     ireturn
//!     .catch java/lang/ArithmeticException from start to end using handler
//! ```
//!
//! Symbolic operands (fields, methods, classes, literals) go through a shared
//! [`ConstantPoolBuilder`]; branch targets are labels. Local-variable
//! instructions switch to their `wide` form when the index needs it.

use std::collections::HashMap;

use super::bytecode::*;
use super::classfile::{
    ACC_ABSTRACT, ACC_NATIVE, ACC_PUBLIC, ACC_STATIC, ClassDef, Constant, ConstantPoolBuilder,
    ExceptionHandler, FieldDef, MethodDef,
};
use super::method::parse_method_descriptor;
use crate::error::{VmError, VmResult};

/// Operand stack depth assumed when a body gives no `.limit stack`.
pub const DEFAULT_MAX_STACK: u16 = 16;

/// An assembled method body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledCode {
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionHandler>,
    pub line_numbers: Vec<(u16, u32)>,
    pub max_stack: u16,
    /// Highest local slot touched plus one, or the `.limit locals` value.
    pub max_locals: u16,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    text: String,
    quoted: bool,
}

enum Fixup {
    /// 16-bit offset at `at`, relative to the instruction at `from`.
    Short { at: usize, from: usize, label: String, line: usize },
    Wide { at: usize, from: usize, label: String, line: usize },
}

struct PendingCatch {
    catch_type: u16,
    start: String,
    end: String,
    handler: String,
    line: usize,
}

struct Assembler<'p> {
    pool: &'p mut ConstantPoolBuilder,
    code: Vec<u8>,
    labels: HashMap<String, usize>,
    fixups: Vec<Fixup>,
    catches: Vec<PendingCatch>,
    lines: Vec<(u16, u32)>,
    max_locals: usize,
    limit_stack: Option<u16>,
    limit_locals: Option<u16>,
}

/// Assemble `source`, adding its constants to `pool`.
pub fn assemble(source: &str, pool: &mut ConstantPoolBuilder) -> VmResult<AssembledCode> {
    let mut asm = Assembler {
        pool,
        code: Vec::new(),
        labels: HashMap::new(),
        fixups: Vec::new(),
        catches: Vec::new(),
        lines: Vec::new(),
        max_locals: 0,
        limit_stack: None,
        limit_locals: None,
    };
    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        let tokens = tokenize(strip_comment(raw)).map_err(|m| error(line, m))?;
        asm.line(&tokens, line).map_err(|m| error(line, m))?;
    }
    asm.finish()
}

fn error(line: usize, message: impl Into<String>) -> VmError {
    VmError::Assemble {
        line,
        message: message.into(),
    }
}

/// Drop a `;` or `//` comment, ignoring comment markers inside quotes. A `;`
/// only starts a comment at the start of a line or after whitespace, since
/// descriptors end in one.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b';' if i == 0 || bytes[i - 1].is_ascii_whitespace() => return &line[..i],
            b'/' if bytes.get(i + 1) == Some(&b'/') => return &line[..i],
            _ => {}
        }
    }
    line
}

fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    None => return Err("unterminated string literal".to_string()),
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => text.push('\n'),
                        Some('t') => text.push('\t'),
                        Some('\\') => text.push('\\'),
                        Some('"') => text.push('"'),
                        other => return Err(format!("bad escape {:?}", other)),
                    },
                    Some(ch) => text.push(ch),
                }
            }
            tokens.push(Token { text, quoted: true });
            continue;
        }
        let mut text = String::new();
        while let Some(&ch) = chars.peek() {
            if ch.is_whitespace() {
                break;
            }
            text.push(ch);
            chars.next();
        }
        tokens.push(Token {
            text,
            quoted: false,
        });
    }
    Ok(tokens)
}

fn parse_int(text: &str) -> Result<i64, String> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .map_err(|_| format!("expected an integer, found `{}`", text))?;
    Ok(if negative { -value } else { value })
}

fn is_float_literal(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    if lower.starts_with("0x") || lower.starts_with("-0x") {
        return false;
    }
    lower.contains('.')
        || lower.contains('e')
        || lower.ends_with('f')
        || lower.ends_with('d')
        || matches!(lower.trim_start_matches('-'), "nan" | "infinity")
}

fn parse_float(text: &str) -> Result<f64, String> {
    let trimmed = text.trim_end_matches(['f', 'F', 'd', 'D']);
    match trimmed {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => trimmed
            .parse::<f64>()
            .map_err(|_| format!("expected a number, found `{}`", text)),
    }
}

/// `owner/Class.name` split at the last dot.
fn split_member(text: &str) -> Result<(String, String), String> {
    text.rsplit_once('.')
        .map(|(owner, name)| (owner.to_string(), name.to_string()))
        .ok_or_else(|| format!("expected Owner.name, found `{}`", text))
}

/// `owner/Class.name(desc)ret`.
fn split_method(text: &str) -> Result<(String, String, String), String> {
    let open = text
        .find('(')
        .ok_or_else(|| format!("expected Owner.name(descriptor), found `{}`", text))?;
    let (owner, name) = split_member(&text[..open])?;
    let descriptor = text[open..].to_string();
    parse_method_descriptor(&descriptor)
        .ok_or_else(|| format!("malformed method descriptor `{}`", descriptor))?;
    Ok((owner, name, descriptor))
}

fn newarray_code(name: &str) -> Option<u8> {
    Some(match name {
        "boolean" => T_BOOLEAN,
        "char" => T_CHAR,
        "float" => T_FLOAT,
        "double" => T_DOUBLE,
        "byte" => T_BYTE,
        "short" => T_SHORT,
        "int" => T_INT,
        "long" => T_LONG,
        _ => return None,
    })
}

/// Slots a local-variable instruction touches.
fn local_width(op: u8) -> usize {
    match op {
        LLOAD | DLOAD | LSTORE | DSTORE => 2,
        _ => 1,
    }
}

impl Assembler<'_> {
    fn line(&mut self, tokens: &[Token], line: usize) -> Result<(), String> {
        let mut tokens = tokens;
        while let Some(first) = tokens.first() {
            match first.text.strip_suffix(':') {
                Some(label) if !first.quoted && !label.is_empty() && !label.contains(':') => {
                    if self.labels.insert(label.to_string(), self.code.len()).is_some() {
                        return Err(format!("label `{}` defined twice", label));
                    }
                    tokens = &tokens[1..];
                }
                _ => break,
            }
        }
        let Some(first) = tokens.first() else {
            return Ok(());
        };
        if first.text.starts_with('.') {
            return self.directive(tokens, line);
        }
        let op = opcode_for(&first.text)
            .ok_or_else(|| format!("unknown instruction `{}`", first.text))?;
        self.instruction(op, &tokens[1..], line)
    }

    fn directive(&mut self, tokens: &[Token], line: usize) -> Result<(), String> {
        let args: Vec<&str> = tokens[1..].iter().map(|t| t.text.as_str()).collect();
        match tokens[0].text.as_str() {
            ".line" => {
                let number = parse_int(args.first().copied().unwrap_or(""))?;
                self.lines.push((self.code.len() as u16, number as u32));
            }
            ".limit" => match args.as_slice() {
                ["stack", n] => self.limit_stack = Some(parse_int(n)? as u16),
                ["locals", n] => self.limit_locals = Some(parse_int(n)? as u16),
                _ => return Err("expected `.limit stack N` or `.limit locals N`".to_string()),
            },
            ".catch" => match args.as_slice() {
                [class, "from", start, "to", end, "using", handler] => {
                    let catch_type = if *class == "any" {
                        0
                    } else {
                        self.pool.add(Constant::Class(class.to_string()))
                    };
                    self.catches.push(PendingCatch {
                        catch_type,
                        start: start.to_string(),
                        end: end.to_string(),
                        handler: handler.to_string(),
                        line,
                    });
                }
                _ => {
                    return Err(
                        "expected `.catch Class|any from L to L using L`".to_string(),
                    );
                }
            },
            other => return Err(format!("unknown directive `{}`", other)),
        }
        Ok(())
    }

    fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    fn operand<'t>(args: &'t [Token], i: usize, what: &str) -> Result<&'t str, String> {
        args.get(i)
            .map(|t| t.text.as_str())
            .ok_or_else(|| format!("missing {}", what))
    }

    fn branch_short(&mut self, from: usize, label: &str, line: usize) {
        self.fixups.push(Fixup::Short {
            at: self.code.len(),
            from,
            label: label.to_string(),
            line,
        });
        self.emit_u16(0);
    }

    fn branch_wide(&mut self, from: usize, label: &str, line: usize) {
        self.fixups.push(Fixup::Wide {
            at: self.code.len(),
            from,
            label: label.to_string(),
            line,
        });
        self.emit_i32(0);
    }

    fn touch_local(&mut self, index: usize, width: usize) {
        self.max_locals = self.max_locals.max(index + width);
    }

    fn instruction(&mut self, op: u8, args: &[Token], line: usize) -> Result<(), String> {
        let pc = self.code.len();
        match op {
            BIPUSH => {
                let value = parse_int(Self::operand(args, 0, "byte value")?)?;
                let byte = i8::try_from(value).map_err(|_| format!("bipush {} out of range", value))?;
                self.emit(op);
                self.emit(byte as u8);
            }
            SIPUSH => {
                let value = parse_int(Self::operand(args, 0, "short value")?)?;
                let short =
                    i16::try_from(value).map_err(|_| format!("sipush {} out of range", value))?;
                self.emit(op);
                self.emit_u16(short as u16);
            }
            LDC | LDC_W => {
                let index = self.literal(args, false)?;
                if index > u8::MAX as u16 {
                    self.emit(LDC_W);
                    self.emit_u16(index);
                } else if op == LDC_W {
                    self.emit(LDC_W);
                    self.emit_u16(index);
                } else {
                    self.emit(LDC);
                    self.emit(index as u8);
                }
            }
            LDC2_W => {
                let index = self.literal(args, true)?;
                self.emit(op);
                self.emit_u16(index);
            }
            ILOAD..=ALOAD | ISTORE..=ASTORE | RET => {
                let index = parse_int(Self::operand(args, 0, "local index")?)?;
                let index = u16::try_from(index).map_err(|_| format!("bad local index {}", index))?;
                self.touch_local(index as usize, local_width(op));
                if index > u8::MAX as u16 {
                    self.emit(WIDE);
                    self.emit(op);
                    self.emit_u16(index);
                } else {
                    self.emit(op);
                    self.emit(index as u8);
                }
            }
            ILOAD_0..=ALOAD_3 => {
                let n = ((op - ILOAD_0) % 4) as usize;
                let width = if matches!(op, LLOAD_0..=LLOAD_3 | DLOAD_0..=DLOAD_3) { 2 } else { 1 };
                self.touch_local(n, width);
                self.emit(op);
            }
            ISTORE_0..=ASTORE_3 => {
                let n = ((op - ISTORE_0) % 4) as usize;
                let width =
                    if matches!(op, LSTORE_0..=LSTORE_3 | DSTORE_0..=DSTORE_3) { 2 } else { 1 };
                self.touch_local(n, width);
                self.emit(op);
            }
            IINC => {
                let index = parse_int(Self::operand(args, 0, "local index")?)?;
                let delta = parse_int(Self::operand(args, 1, "increment")?)?;
                let index = u16::try_from(index).map_err(|_| format!("bad local index {}", index))?;
                self.touch_local(index as usize, 1);
                match (u8::try_from(index), i8::try_from(delta)) {
                    (Ok(i), Ok(d)) => {
                        self.emit(IINC);
                        self.emit(i);
                        self.emit(d as u8);
                    }
                    _ => {
                        let delta = i16::try_from(delta)
                            .map_err(|_| format!("iinc {} out of range", delta))?;
                        self.emit(WIDE);
                        self.emit(IINC);
                        self.emit_u16(index);
                        self.emit_u16(delta as u16);
                    }
                }
            }
            IFEQ..=JSR | IFNULL | IFNONNULL => {
                let label = Self::operand(args, 0, "branch target")?.to_string();
                self.emit(op);
                self.branch_short(pc, &label, line);
            }
            GOTO_W | JSR_W => {
                let label = Self::operand(args, 0, "branch target")?.to_string();
                self.emit(op);
                self.branch_wide(pc, &label, line);
            }
            TABLESWITCH => self.tableswitch(args, line)?,
            LOOKUPSWITCH => self.lookupswitch(args, line)?,
            GETSTATIC..=PUTFIELD => {
                let (owner, name) = split_member(Self::operand(args, 0, "field reference")?)?;
                let descriptor = Self::operand(args, 1, "field descriptor")?.to_string();
                let index = self.pool.add(Constant::Field {
                    class: owner,
                    name,
                    descriptor,
                });
                self.emit(op);
                self.emit_u16(index);
            }
            INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC => {
                let (class, name, descriptor) =
                    split_method(Self::operand(args, 0, "method reference")?)?;
                let index = self.pool.add(Constant::Method {
                    class,
                    name,
                    descriptor,
                });
                self.emit(op);
                self.emit_u16(index);
            }
            INVOKEINTERFACE => {
                let (class, name, descriptor) =
                    split_method(Self::operand(args, 0, "method reference")?)?;
                let count = parse_method_descriptor(&descriptor)
                    .map(|s| s.arg_slots() + 1)
                    .unwrap_or(1);
                let index = self.pool.add(Constant::InterfaceMethod {
                    class,
                    name,
                    descriptor,
                });
                self.emit(op);
                self.emit_u16(index);
                self.emit(count as u8);
                self.emit(0);
            }
            INVOKEDYNAMIC => {
                let index = parse_int(Self::operand(args, 0, "call site index")?)?;
                self.emit(op);
                self.emit_u16(index as u16);
                self.emit(0);
                self.emit(0);
            }
            NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => {
                let name = Self::operand(args, 0, "class name")?.to_string();
                let index = self.pool.add(Constant::Class(name));
                self.emit(op);
                self.emit_u16(index);
            }
            NEWARRAY => {
                let name = Self::operand(args, 0, "element type")?;
                let code = newarray_code(name)
                    .ok_or_else(|| format!("unknown primitive type `{}`", name))?;
                self.emit(op);
                self.emit(code);
            }
            MULTIANEWARRAY => {
                let name = Self::operand(args, 0, "array class")?.to_string();
                let dims = parse_int(Self::operand(args, 1, "dimensions")?)?;
                let dims = u8::try_from(dims)
                    .ok()
                    .filter(|d| *d > 0)
                    .ok_or_else(|| format!("bad dimension count {}", dims))?;
                let index = self.pool.add(Constant::Class(name));
                self.emit(op);
                self.emit_u16(index);
                self.emit(dims);
            }
            WIDE => return Err("write the plain instruction; `wide` is chosen automatically".into()),
            _ => {
                if !args.is_empty() {
                    return Err(format!(
                        "`{}` takes no operands",
                        mnemonic(op).unwrap_or("?")
                    ));
                }
                self.emit(op);
            }
        }
        Ok(())
    }

    /// Constant-pool index of an `ldc`/`ldc2_w` operand.
    fn literal(&mut self, args: &[Token], wide: bool) -> Result<u16, String> {
        let first = args.first().ok_or("missing constant")?;
        if first.quoted {
            if wide {
                return Err("ldc2_w takes a long or double".to_string());
            }
            return Ok(self.pool.add(Constant::String(first.text.clone())));
        }
        let constant = match first.text.as_str() {
            "class" if !wide => Constant::Class(Self::operand(args, 1, "class name")?.to_string()),
            "methodtype" if !wide => {
                let descriptor = Self::operand(args, 1, "method type")?;
                parse_method_descriptor(descriptor)
                    .ok_or_else(|| format!("malformed method type `{}`", descriptor))?;
                Constant::MethodType(descriptor.to_string())
            }
            "methodhandle" if !wide => {
                let is_static = match Self::operand(args, 1, "handle kind")? {
                    "static" => true,
                    "virtual" => false,
                    other => return Err(format!("unknown handle kind `{}`", other)),
                };
                let (class, name, descriptor) =
                    split_method(Self::operand(args, 2, "handle target")?)?;
                Constant::MethodHandle {
                    class,
                    name,
                    descriptor,
                    is_static,
                }
            }
            text if is_float_literal(text) => {
                let value = parse_float(text)?;
                if wide {
                    Constant::Double(value)
                } else {
                    Constant::Float(value as f32)
                }
            }
            text => {
                let value = parse_int(text.trim_end_matches(['L', 'l']))?;
                if wide {
                    Constant::Long(value)
                } else {
                    Constant::Int(
                        i32::try_from(value).map_err(|_| format!("int {} out of range", value))?,
                    )
                }
            }
        };
        Ok(self.pool.add(constant))
    }

    fn pad_switch(&mut self, pc: usize) {
        while self.code.len() < switch_operand_base(pc) {
            self.emit(0);
        }
    }

    /// `tableswitch low L0 L1 .. default Ld`
    fn tableswitch(&mut self, args: &[Token], line: usize) -> Result<(), String> {
        let pc = self.code.len();
        let low = parse_int(Self::operand(args, 0, "low key")?)?;
        let low = i32::try_from(low).map_err(|_| format!("key {} out of range", low))?;
        let rest: Vec<&str> = args[1..].iter().map(|t| t.text.as_str()).collect();
        let Some(default_pos) = rest.iter().position(|t| *t == "default") else {
            return Err("tableswitch needs a `default` target".to_string());
        };
        let default = rest
            .get(default_pos + 1)
            .ok_or("missing default target")?
            .to_string();
        let targets = &rest[..default_pos];
        if targets.is_empty() {
            return Err("tableswitch needs at least one target".to_string());
        }
        let high = low
            .checked_add(targets.len() as i32 - 1)
            .ok_or("tableswitch range overflows")?;
        self.emit(TABLESWITCH);
        self.pad_switch(pc);
        self.branch_wide(pc, &default, line);
        self.emit_i32(low);
        self.emit_i32(high);
        for target in targets {
            self.branch_wide(pc, target, line);
        }
        Ok(())
    }

    /// `lookupswitch k:L .. default Ld`
    fn lookupswitch(&mut self, args: &[Token], line: usize) -> Result<(), String> {
        let pc = self.code.len();
        let mut pairs = Vec::new();
        let mut default = None;
        let mut iter = args.iter().map(|t| t.text.as_str());
        while let Some(token) = iter.next() {
            if token == "default" {
                default = Some(iter.next().ok_or("missing default target")?.to_string());
                continue;
            }
            let (key, label) = token
                .split_once(':')
                .ok_or_else(|| format!("expected key:label, found `{}`", token))?;
            let key = parse_int(key)?;
            let key = i32::try_from(key).map_err(|_| format!("key {} out of range", key))?;
            pairs.push((key, label.to_string()));
        }
        let default = default.ok_or("lookupswitch needs a `default` target")?;
        pairs.sort_by_key(|(key, _)| *key);
        if pairs.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err("duplicate lookupswitch key".to_string());
        }
        self.emit(LOOKUPSWITCH);
        self.pad_switch(pc);
        self.branch_wide(pc, &default, line);
        self.emit_i32(pairs.len() as i32);
        for (key, label) in &pairs {
            self.emit_i32(*key);
            self.branch_wide(pc, label, line);
        }
        Ok(())
    }

    fn resolve(&self, label: &str, line: usize) -> VmResult<usize> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| error(line, format!("undefined label `{}`", label)))
    }

    fn finish(mut self) -> VmResult<AssembledCode> {
        for fixup in std::mem::take(&mut self.fixups) {
            match fixup {
                Fixup::Short {
                    at,
                    from,
                    label,
                    line,
                } => {
                    let offset = self.resolve(&label, line)? as i64 - from as i64;
                    let offset = i16::try_from(offset)
                        .map_err(|_| error(line, format!("branch to `{}` too far; use goto_w", label)))?;
                    self.code[at..at + 2].copy_from_slice(&offset.to_be_bytes());
                }
                Fixup::Wide {
                    at,
                    from,
                    label,
                    line,
                } => {
                    let offset = (self.resolve(&label, line)? as i64 - from as i64) as i32;
                    self.code[at..at + 4].copy_from_slice(&offset.to_be_bytes());
                }
            }
        }
        let mut exception_table = Vec::new();
        for catch in &self.catches {
            exception_table.push(ExceptionHandler {
                start_pc: self.resolve(&catch.start, catch.line)? as u16,
                end_pc: self.resolve(&catch.end, catch.line)? as u16,
                handler_pc: self.resolve(&catch.handler, catch.line)? as u16,
                catch_type: catch.catch_type,
            });
        }
        let computed = self.max_locals as u16;
        Ok(AssembledCode {
            code: self.code,
            exception_table,
            line_numbers: self.lines,
            max_stack: self.limit_stack.unwrap_or(DEFAULT_MAX_STACK),
            max_locals: self.limit_locals.map_or(computed, |l| l.max(computed)),
        })
    }
}

// =============================================================================
// Class builder
// =============================================================================

/// Builds a [`ClassDef`] whose methods are written in assembler text.
#[derive(Debug)]
pub struct ClassBuilder {
    def: ClassDef,
    pool: ConstantPoolBuilder,
}

impl ClassBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ClassBuilder {
            def: ClassDef::new(name),
            pool: ConstantPoolBuilder::new(),
        }
    }

    pub fn super_class(mut self, name: impl Into<String>) -> Self {
        self.def.super_name = Some(name.into());
        self
    }

    /// A root class (only `java/lang/Object`).
    pub fn no_super(mut self) -> Self {
        self.def.super_name = None;
        self
    }

    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.def.interfaces.push(name.into());
        self
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.def.flags = flags;
        self
    }

    pub fn field(mut self, name: &str, descriptor: &str, flags: u16) -> Self {
        self.def.fields.push(FieldDef {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            flags,
        });
        self
    }

    /// Add a method with an assembled body.
    pub fn method(mut self, name: &str, descriptor: &str, flags: u16, source: &str) -> VmResult<Self> {
        let signature = parse_method_descriptor(descriptor).ok_or_else(|| VmError::ClassFormat {
            class: self.def.name.clone(),
            message: format!("malformed descriptor {} of {}", descriptor, name),
        })?;
        let code = assemble(source, &mut self.pool).map_err(|e| match e {
            VmError::Assemble { line, message } => VmError::Assemble {
                line,
                message: format!("{}.{}{}: {}", self.def.name, name, descriptor, message),
            },
            other => other,
        })?;
        let arg_slots = signature.arg_slots() + usize::from(flags & ACC_STATIC == 0);
        self.def.methods.push(MethodDef {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            flags,
            max_stack: code.max_stack,
            max_locals: code.max_locals.max(arg_slots as u16),
            code: code.code,
            exception_table: code.exception_table,
            line_numbers: code.line_numbers,
        });
        Ok(self)
    }

    pub fn native_method(mut self, name: &str, descriptor: &str, flags: u16) -> Self {
        self.def.methods.push(MethodDef {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            flags: flags | ACC_NATIVE,
            ..MethodDef::default()
        });
        self
    }

    pub fn abstract_method(mut self, name: &str, descriptor: &str) -> Self {
        self.def.methods.push(MethodDef {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            flags: ACC_PUBLIC | ACC_ABSTRACT,
            ..MethodDef::default()
        });
        self
    }

    pub fn build(mut self) -> ClassDef {
        self.def.constants = self.pool.finish();
        self.def
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asm(source: &str) -> AssembledCode {
        let mut pool = ConstantPoolBuilder::new();
        assemble(source, &mut pool).unwrap()
    }

    #[test]
    fn test_backward_branch_offset() {
        let code = asm(
            "
            top:
                iinc 0 -1
                iload_0
                ifgt top
                return
            ",
        );
        assert_eq!(code.code, vec![IINC, 0, 0xff, ILOAD_0, IFGT, 0xff, 0xfc, RETURN]);
        assert_eq!(code.max_locals, 1);
    }

    #[test]
    fn test_wide_forms_chosen_for_large_indices() {
        let code = asm("iload 300\nlstore 2\niinc 1 1000\nreturn");
        assert_eq!(&code.code[..4], &[WIDE, ILOAD, 0x01, 0x2c]);
        assert_eq!(&code.code[4..6], &[LSTORE, 2]);
        assert_eq!(&code.code[6..12], &[WIDE, IINC, 0, 1, 0x03, 0xe8]);
        assert_eq!(code.max_locals, 301);
    }

    #[test]
    fn test_constants_are_pooled() {
        let mut pool = ConstantPoolBuilder::new();
        let code = assemble(
            "ldc \"hi; there\" ; comment\nldc 70000\nldc 1.5\nldc2_w 7\nldc2_w 2.5\nreturn",
            &mut pool,
        )
        .unwrap();
        assert_eq!(code.code[0], LDC);
        let constants = pool.finish();
        assert_eq!(constants[0], Constant::String("hi; there".into()));
        assert_eq!(constants[1], Constant::Int(70000));
        assert_eq!(constants[2], Constant::Float(1.5));
        assert_eq!(constants[3], Constant::Long(7));
        assert_eq!(constants[4], Constant::Double(2.5));
    }

    #[test]
    fn test_tableswitch_layout() {
        let code = asm(
            "
                iload_0
                tableswitch 1 one two default other
            one:
                iconst_1
                ireturn
            two:
                iconst_2
                ireturn
            other:
                iconst_0
                ireturn
            ",
        );
        assert_eq!(instruction_length(&code.code, 1), Some(3 + 12 + 8));
        let base = switch_operand_base(1);
        let default = read_i32(&code.code, base).unwrap();
        assert_eq!(code.code[(1 + default) as usize], ICONST_0);
    }

    #[test]
    fn test_catch_directive() {
        let code = asm(
            "
            start:
                aconst_null
                athrow
            end:
            handler:
                pop
                return
                .catch java/lang/Throwable from start to end using handler
            ",
        );
        assert_eq!(code.exception_table.len(), 1);
        let h = code.exception_table[0];
        assert_eq!((h.start_pc, h.end_pc, h.handler_pc), (0, 2, 2));
        assert_ne!(h.catch_type, 0);
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let mut pool = ConstantPoolBuilder::new();
        let err = assemble("iconst_0\nfrobnicate\n", &mut pool).unwrap_err();
        assert!(matches!(err, VmError::Assemble { line: 2, .. }));
        let err = assemble("goto nowhere", &mut pool).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_invokeinterface_count_byte() {
        let code = asm("aload_0\niconst_1\ninvokeinterface demo/Shape.scale(I)I\nireturn");
        assert_eq!(code.code[2], INVOKEINTERFACE);
        assert_eq!(code.code[5], 2);
    }

    #[test]
    fn test_class_builder_sizes_locals_from_arguments() {
        let def = ClassBuilder::new("demo/A")
            .method("f", "(JI)I", ACC_STATIC, "iload_2\nireturn")
            .unwrap()
            .build();
        assert_eq!(def.methods[0].max_locals, 3);
        assert_eq!(def.methods[0].max_stack, DEFAULT_MAX_STACK);
    }
}
