//! Debug information for mapping bytecode offsets to source lines.

/// A line table entry mapping a bytecode offset to a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// Bytecode offset (program counter)
    pub pc: u32,
    /// Line number (1-based)
    pub line: u32,
}

/// A line table for mapping bytecode offsets to source lines.
#[derive(Debug, Clone, Default)]
pub struct LineTable {
    pub entries: Vec<LineEntry>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry to the line table.
    pub fn add(&mut self, pc: usize, line: usize) {
        self.entries.push(LineEntry {
            pc: pc as u32,
            line: line as u32,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the source line for a given bytecode offset.
    pub fn find_line(&self, pc: usize) -> Option<u32> {
        let pc = pc as u32;
        // Entry with the largest pc <= target pc
        let mut best: Option<&LineEntry> = None;
        for entry in &self.entries {
            if entry.pc <= pc {
                match best {
                    Some(b) if entry.pc > b.pc => best = Some(entry),
                    None => best = Some(entry),
                    _ => {}
                }
            }
        }
        best.map(|e| e.line)
    }
}

/// One element of a captured Java stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTraceElement {
    pub class_name: String,
    pub method_name: String,
    /// Bytecode offset, `None` for native frames.
    pub pc: Option<usize>,
    pub line: Option<u32>,
    pub compiled: bool,
}

/// A frame tagged for frame-pop reporting left the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePopEvent {
    pub class_name: String,
    pub method_name: String,
    /// Popped by an exception rather than a return.
    pub exceptional: bool,
}

impl std::fmt::Display for StackTraceElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.class_name.replace('/', "."), self.method_name)?;
        match (self.pc, self.line) {
            (None, _) => write!(f, "(Native Method)"),
            (Some(_), Some(line)) if self.compiled => write!(f, "(line {}, compiled)", line),
            (Some(_), Some(line)) => write!(f, "(line {})", line),
            (Some(pc), None) if self.compiled => write!(f, "(pc {}, compiled)", pc),
            (Some(pc), None) => write!(f, "(pc {})", pc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_table() {
        let mut table = LineTable::new();
        table.add(0, 1);
        table.add(5, 2);
        table.add(10, 3);

        assert_eq!(table.find_line(0), Some(1));
        assert_eq!(table.find_line(3), Some(1));
        assert_eq!(table.find_line(5), Some(2));
        assert_eq!(table.find_line(7), Some(2));
        assert_eq!(table.find_line(100), Some(3));
    }

    #[test]
    fn test_trace_element_display() {
        let element = StackTraceElement {
            class_name: "demo/Main".to_string(),
            method_name: "run".to_string(),
            pc: Some(4),
            line: None,
            compiled: false,
        };
        assert_eq!(element.to_string(), "demo.Main.run(pc 4)");
    }
}
