//! TOML program images.
//!
//! An image lists classes with their fields and methods; method bodies are
//! assembler text. The `jexec` binary loads one and runs its `main`.
//!
//! ```toml
//! main_class = "demo/Main"
//!
//! [[class]]
//! name = "demo/Main"
//!
//! [[class.method]]
//! name = "main"
//! descriptor = "()I"
//! flags = ["public", "static"]
//! code = """
//!     bipush 42
//!     ireturn
//! """
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{VmError, VmResult};
use crate::vm::asm::ClassBuilder;
use crate::vm::bytecode::disassemble;
use crate::vm::class::Class;
use crate::vm::classfile::*;
use crate::vm::vm::JavaVM;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramImage {
    /// Class whose `main` the CLI runs when none is given.
    #[serde(default)]
    pub main_class: Option<String>,
    #[serde(default, rename = "class")]
    pub classes: Vec<ClassImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassImage {
    pub name: String,
    /// Defaults to `java/lang/Object`.
    #[serde(default, rename = "super")]
    pub super_name: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldImage>,
    #[serde(default, rename = "method")]
    pub methods: Vec<MethodImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldImage {
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodImage {
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub flags: Vec<String>,
    /// Assembler text. Native and abstract methods have none.
    #[serde(default)]
    pub code: Option<String>,
}

fn flag_bits(owner: &str, names: &[String]) -> VmResult<u16> {
    let mut flags = 0;
    for name in names {
        flags |= match name.as_str() {
            "public" => ACC_PUBLIC,
            "private" => ACC_PRIVATE,
            "protected" => ACC_PROTECTED,
            "static" => ACC_STATIC,
            "final" => ACC_FINAL,
            "synchronized" => ACC_SYNCHRONIZED,
            "value" => ACC_VALUE,
            "native" => ACC_NATIVE,
            "interface" => ACC_INTERFACE,
            "abstract" => ACC_ABSTRACT,
            other => return Err(VmError::Image(format!("{}: unknown flag '{}'", owner, other))),
        };
    }
    Ok(flags)
}

impl ProgramImage {
    pub fn from_toml_str(text: &str) -> VmResult<Self> {
        toml::from_str(text).map_err(|e| VmError::Image(e.to_string()))
    }

    pub fn load(path: &Path) -> VmResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| VmError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&text)
    }

    /// Assemble every class. Classes come back in definition order:
    /// superclasses and interfaces from this image before their subtypes.
    pub fn class_defs(&self) -> VmResult<Vec<ClassDef>> {
        let mut defs = Vec::with_capacity(self.classes.len());
        for class in self.ordered()? {
            defs.push(class.class_def()?);
        }
        Ok(defs)
    }

    fn ordered(&self) -> VmResult<Vec<&ClassImage>> {
        let local: HashSet<&str> = self.classes.iter().map(|c| c.name.as_str()).collect();
        let mut done: HashSet<&str> = HashSet::new();
        let mut ordered = Vec::with_capacity(self.classes.len());
        while ordered.len() < self.classes.len() {
            let before = ordered.len();
            for class in &self.classes {
                if done.contains(class.name.as_str()) {
                    continue;
                }
                let ready = class
                    .super_name
                    .iter()
                    .chain(class.interfaces.iter())
                    .all(|dep| !local.contains(dep.as_str()) || done.contains(dep.as_str()));
                if ready {
                    done.insert(class.name.as_str());
                    ordered.push(class);
                }
            }
            if ordered.len() == before {
                let stuck: Vec<&str> = self
                    .classes
                    .iter()
                    .map(|c| c.name.as_str())
                    .filter(|name| !done.contains(name))
                    .collect();
                return Err(VmError::Image(format!("circular class hierarchy: {}", stuck.join(", "))));
            }
        }
        Ok(ordered)
    }

    /// Define every class of the image in `vm`.
    pub fn define_into(&self, vm: &JavaVM) -> VmResult<Vec<Arc<Class>>> {
        let mut classes = Vec::with_capacity(self.classes.len());
        for def in self.class_defs()? {
            classes.push(vm.define_class(def)?);
        }
        debug!(classes = classes.len(), "image loaded");
        Ok(classes)
    }

    /// Human-readable listing of every method body.
    pub fn disassemble(&self) -> VmResult<String> {
        let mut out = String::new();
        for def in self.class_defs()? {
            out.push_str(&format!("class {}\n", def.name));
            for method in &def.methods {
                out.push_str(&format!("  {}{}\n", method.name, method.descriptor));
                for line in disassemble(&method.code) {
                    out.push_str("    ");
                    out.push_str(&line);
                    out.push('\n');
                }
            }
        }
        Ok(out)
    }
}

impl ClassImage {
    pub fn class_def(&self) -> VmResult<ClassDef> {
        let mut builder = ClassBuilder::new(self.name.as_str()).flags(flag_bits(&self.name, &self.flags)?);
        if let Some(super_name) = &self.super_name {
            builder = builder.super_class(super_name.as_str());
        }
        for interface in &self.interfaces {
            builder = builder.interface(interface.as_str());
        }
        for field in &self.fields {
            let owner = format!("{}.{}", self.name, field.name);
            builder = builder.field(&field.name, &field.descriptor, flag_bits(&owner, &field.flags)?);
        }
        for method in &self.methods {
            let owner = format!("{}.{}", self.name, method.name);
            let flags = flag_bits(&owner, &method.flags)?;
            builder = match &method.code {
                Some(code) => builder.method(&method.name, &method.descriptor, flags, code)?,
                None if flags & ACC_NATIVE != 0 => {
                    builder.native_method(&method.name, &method.descriptor, flags)
                }
                None if flags & ACC_ABSTRACT != 0 => {
                    builder.abstract_method(&method.name, &method.descriptor)
                }
                None => {
                    return Err(VmError::Image(format!("{}: method has no code", owner)));
                }
            };
        }
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE: &str = r#"
main_class = "demo/Main"

[[class]]
name = "demo/Main"
super = "demo/Base"

[[class.method]]
name = "main"
descriptor = "()I"
flags = ["public", "static"]
code = """
    bipush 40
    iconst_2
    iadd
    ireturn
"""

[[class]]
name = "demo/Base"

[[class.field]]
name = "count"
descriptor = "I"
flags = ["static"]

[[class.method]]
name = "tick"
descriptor = "()V"
flags = ["public", "native"]
"#;

    #[test]
    fn test_supertypes_are_defined_first() {
        let image = ProgramImage::from_toml_str(IMAGE).unwrap();
        let defs = image.class_defs().unwrap();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["demo/Base", "demo/Main"]);
        assert_eq!(defs[0].fields[0].flags, ACC_STATIC);
        assert_ne!(defs[0].methods[0].flags & ACC_NATIVE, 0);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        let text = IMAGE.replace("[\"public\", \"static\"]", "[\"public\", \"strict\"]");
        let image = ProgramImage::from_toml_str(&text).unwrap();
        let error = image.class_defs().unwrap_err();
        assert!(error.to_string().contains("unknown flag 'strict'"), "{}", error);
    }

    #[test]
    fn test_circular_hierarchy_is_rejected() {
        let text = r#"
[[class]]
name = "a/A"
super = "a/B"

[[class]]
name = "a/B"
super = "a/A"
"#;
        let image = ProgramImage::from_toml_str(text).unwrap();
        assert!(matches!(image.class_defs(), Err(VmError::Image(_))));
    }

    #[test]
    fn test_disassembly_lists_methods() {
        let image = ProgramImage::from_toml_str(IMAGE).unwrap();
        let listing = image.disassemble().unwrap();
        assert!(listing.contains("class demo/Main"));
        assert!(listing.contains("main()I"));
        assert!(listing.contains("bipush 40"));
        assert!(listing.contains("iadd"));
    }
}
