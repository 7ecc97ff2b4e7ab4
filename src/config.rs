//! Runtime configuration types.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{VmError, VmResult};

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// JIT enabled (compile hot methods)
    On,
    /// Automatic: JIT enabled when the `jit` feature is compiled in
    #[default]
    Auto,
}

impl JitMode {
    /// Whether methods should start in the counting state.
    pub fn is_enabled(self) -> bool {
        match self {
            JitMode::Off => false,
            JitMode::On => true,
            JitMode::Auto => cfg!(feature = "jit"),
        }
    }
}

/// What to do when the soft stack watermark is crossed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrowthPolicy {
    /// Ask the segment provider for more stack, up to `max_words`.
    #[default]
    Grow,
    /// Throw StackOverflowError at the first crossing.
    FailFast,
}

/// Java stack sizing. All sizes are in stack slots (words).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub initial_words: usize,
    pub max_words: usize,
    pub increment_words: usize,
    /// Headroom kept below the soft watermark for building the
    /// StackOverflowError itself.
    pub reserved_words: usize,
    pub growth: GrowthPolicy,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            initial_words: 16 * 1024,
            max_words: 256 * 1024,
            increment_words: 16 * 1024,
            reserved_words: 512,
            growth: GrowthPolicy::Grow,
        }
    }
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    /// Invocation count a method starts with before it is compiled.
    pub jit_threshold: u32,
    pub trace_jit: bool,
    pub stack: StackConfig,
    /// Hard limit on heap size in bytes (None = unlimited)
    pub heap_limit: Option<usize>,
    /// Maximum number of inflated monitors (None = unlimited)
    pub monitor_limit: Option<usize>,
    /// Honour frame-pop requests from debuggers.
    pub debug_interpreter: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            jit_threshold: 1000,
            trace_jit: false,
            stack: StackConfig::default(),
            heap_limit: None,
            monitor_limit: None,
            debug_interpreter: false,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> VmResult<Self> {
        let config: RuntimeConfig =
            toml::from_str(text).map_err(|e| VmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> VmResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| VmError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&text)
    }

    /// Small configuration for tests: tiny stacks, low JIT threshold.
    pub fn for_testing() -> Self {
        Self {
            jit_mode: JitMode::On,
            jit_threshold: 2,
            stack: StackConfig {
                initial_words: 2048,
                max_words: 16 * 1024,
                increment_words: 2048,
                reserved_words: 256,
                growth: GrowthPolicy::Grow,
            },
            ..Self::default()
        }
    }

    fn validate(&self) -> VmResult<()> {
        let stack = &self.stack;
        if stack.initial_words <= stack.reserved_words {
            return Err(VmError::Config(format!(
                "stack.initial_words ({}) must exceed stack.reserved_words ({})",
                stack.initial_words, stack.reserved_words
            )));
        }
        if stack.max_words < stack.initial_words {
            return Err(VmError::Config(format!(
                "stack.max_words ({}) is smaller than stack.initial_words ({})",
                stack.max_words, stack.initial_words
            )));
        }
        Ok(())
    }
}
