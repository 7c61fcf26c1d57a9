/// Ouroboros CLI (ouro)
/// Orchestrates run, build, disasm, and inspect over .orbc images.
use clap::{Parser, Subcommand};
use miette::{miette, IntoDiagnostic, Result};
use std::path::PathBuf;

use ouroboros::errors::{EXIT_LINK, EXIT_OK, EXIT_UNCAUGHT, EXIT_VERIFY};
use ouroboros::{backend, loader, BackendError, Engine, VmError};

#[derive(Parser)]
#[command(
    name = "ouro",
    version = "0.1.0",
    about = "The Ouroboros VM and compiler backend",
    long_about = "ouro — execute Ouroboros bytecode images (.orbc) or lower them to native code."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a bytecode image in the VM
    Run { path: PathBuf },
    /// Lower an image to IR/assembly/object code (format from -o extension)
    Build {
        path: PathBuf,
        /// Output path: .ll, .bc, .s/.asm, .o/.obj
        #[arg(short, long)]
        output: PathBuf,
        /// Optimization level 0-3 (default: the conf file's opt_level)
        #[arg(short = 'O', long)]
        opt: Option<u8>,
    },
    /// Print the disassembly of an image
    Disasm { path: PathBuf },
    /// Print image metadata as JSON
    Inspect { path: PathBuf },
}

fn main() {
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{:?}", report);
            1
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run { path } => {
            let program = loader::load_file(&path).map_err(|e| miette!("{}", e))?;
            let mut engine = Engine::load_program(program);
            match engine.execute() {
                Ok(value) => {
                    if !value.is_null() {
                        println!("{}", value);
                    }
                    Ok(EXIT_OK)
                }
                Err(VmError::Uncaught(exc)) => {
                    eprintln!("uncaught exception: {}", exc);
                    Ok(EXIT_UNCAUGHT)
                }
                Err(other) => Err(miette!("{}", other)),
            }
        }
        Commands::Build { path, output, opt } => {
            let program = loader::load_file(&path).map_err(|e| miette!("{}", e))?;
            let module_name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("module");
            let level = opt
                .unwrap_or_else(|| ouroboros::OuroConf::global().opt_level)
                .min(3);
            match backend::compile_program(&program, module_name, &output, level) {
                Ok(final_path) => {
                    println!("wrote {}", final_path.display());
                    Ok(EXIT_OK)
                }
                Err(e @ BackendError::ModuleVerificationFailed { .. })
                | Err(e @ BackendError::Unsupported { .. }) => {
                    eprintln!("{}", e);
                    Ok(EXIT_VERIFY)
                }
                Err(e @ BackendError::LinkerFailed { .. }) => {
                    eprintln!("{}", e);
                    Ok(EXIT_LINK)
                }
                Err(e) => Err(miette!("{}", e)),
            }
        }
        Commands::Disasm { path } => {
            let program = loader::load_file(&path).map_err(|e| miette!("{}", e))?;
            print!("{}", program.disassemble());
            Ok(EXIT_OK)
        }
        Commands::Inspect { path } => {
            let program = loader::load_file(&path).map_err(|e| miette!("{}", e))?;
            let summary = serde_json::json!({
                "code_bytes": program.code.len(),
                "constants": program.constants.len(),
                "globals": program.global_count,
                "functions": program.functions.iter().map(|f| {
                    serde_json::json!({
                        "name": f.name,
                        "params": f.parameter_count,
                        "locals": f.local_count,
                        "async": f.is_async,
                        "generator": f.is_generator,
                        "handlers": f.handlers.len(),
                        "callable": f.is_callable(),
                    })
                }).collect::<Vec<_>>(),
                "types": program.types.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
            });
            let text = serde_json::to_string_pretty(&summary).into_diagnostic()?;
            println!("{}", text);
            Ok(EXIT_OK)
        }
    }
}
