use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use jexec::image::ProgramImage;
use jexec::{JValue, JavaVM, JitMode, RuntimeConfig, VmError, VmResult};
use tracing_subscriber::EnvFilter;

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JitModeArg {
    Off,
    On,
    Auto,
}

impl From<JitModeArg> for JitMode {
    fn from(arg: JitModeArg) -> Self {
        match arg {
            JitModeArg::Off => JitMode::Off,
            JitModeArg::On => JitMode::On,
            JitModeArg::Auto => JitMode::Auto,
        }
    }
}

#[derive(Parser)]
#[command(name = "jexec")]
#[command(about = "A JVM-style bytecode execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the main method of a program image
    Run {
        /// The TOML program image
        image: PathBuf,

        /// Class holding the entry point (defaults to the image's main_class)
        #[arg(long)]
        class: Option<String>,

        /// Entry point name; must be static with descriptor ()I or ()V
        #[arg(long, default_value = "main")]
        method: String,

        /// JIT compilation mode (off, on, auto)
        #[arg(long, value_enum)]
        jit: Option<JitModeArg>,

        /// Invocations before a method is compiled
        #[arg(long)]
        jit_threshold: Option<u32>,

        /// Trace JIT compilation and transition events
        #[arg(long)]
        trace_jit: bool,

        /// Runtime configuration file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Print VM statistics as JSON after the run
        #[arg(long)]
        stats: bool,
    },
    /// Print the disassembly of every method in a program image
    Disasm {
        /// The TOML program image
        image: PathBuf,
    },
}

fn init_logging(trace_jit: bool) {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if trace_jit {
        if let Ok(directive) = "jexec::jit=debug".parse() {
            filter = filter.add_directive(directive);
        }
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

struct RunOptions {
    class: Option<String>,
    method: String,
    jit: Option<JitModeArg>,
    jit_threshold: Option<u32>,
    trace_jit: bool,
    config: Option<PathBuf>,
    stats: bool,
}

fn load_config(options: &RunOptions) -> VmResult<RuntimeConfig> {
    let mut config = match &options.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(jit) = options.jit {
        config.jit_mode = jit.into();
    }
    if let Some(threshold) = options.jit_threshold {
        config.jit_threshold = threshold;
    }
    config.trace_jit |= options.trace_jit;
    Ok(config)
}

fn run_image(path: &Path, options: &RunOptions) -> VmResult<()> {
    let config = load_config(options)?;
    let image = ProgramImage::load(path)?;
    let class = options
        .class
        .clone()
        .or_else(|| image.main_class.clone())
        .ok_or_else(|| VmError::Image("no --class given and the image has no main_class".to_string()))?;

    let vm = JavaVM::new(config)?;
    image.define_into(&vm)?;

    let method = match vm.find_method(&class, &options.method, "()I") {
        Ok(method) => method,
        Err(_) => vm.find_method(&class, &options.method, "()V")?,
    };
    if !method.is_static() {
        return Err(VmError::ArgumentMismatch {
            method: method.full_name(),
            message: "entry point must be static".to_string(),
        });
    }

    let mut thread = vm.attach_thread("main");
    let result = thread.call_method(&method, &[])?;
    if let JValue::Int(value) = result {
        println!("{}", value);
    }

    if options.stats {
        let stats = serde_json::to_string_pretty(&vm.stats())
            .map_err(|e| VmError::Config(format!("cannot serialize stats: {}", e)))?;
        println!("{}", stats);
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            image,
            class,
            method,
            jit,
            jit_threshold,
            trace_jit,
            config,
            stats,
        } => {
            init_logging(trace_jit);
            let options = RunOptions {
                class,
                method,
                jit,
                jit_threshold,
                trace_jit,
                config,
                stats,
            };
            if let Err(e) = run_image(&image, &options) {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        }
        Commands::Disasm { image } => {
            init_logging(false);
            match ProgramImage::load(&image).and_then(|image| image.disassemble()) {
                Ok(listing) => print!("{}", listing),
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    ExitCode::SUCCESS
}
