use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::{Context, bail};
use tracing_subscriber::EnvFilter;

use mythos::builtins::{Console, Registry};
use mythos::bytecode::CodeObject;
use mythos::vm::Vm;
use mythos::{image, repl};

const EXIT_COMPILE_ERROR: u8 = 1;
const EXIT_RUNTIME_ERROR: u8 = 2;

const USAGE: &str = "\
Mythos programming language

Usage:
  mythos run <file> [--debug]    compile and run a .mythos source file or .mbc image
  mythos build <file> [-o OUT]   compile a source file to a .mbc image
  mythos repl                    start an interactive session
";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match dispatch(&args) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(EXIT_COMPILE_ERROR)
        }
    }
}

fn dispatch(args: &[String]) -> anyhow::Result<ExitCode> {
    let Some(command) = args.first() else {
        print!("{USAGE}");
        return Ok(ExitCode::SUCCESS);
    };
    match command.as_str() {
        "run" => {
            let mut debug = false;
            let mut file = None;
            for arg in &args[1..] {
                match arg.as_str() {
                    "--debug" => debug = true,
                    other if file.is_none() => file = Some(other.to_string()),
                    other => bail!("Unexpected argument '{other}'"),
                }
            }
            let file = file.context("'run' needs a file argument")?;
            run_file(Path::new(&file), debug)
        }
        "build" => {
            let mut output = None;
            let mut file = None;
            let mut rest = args[1..].iter();
            while let Some(arg) = rest.next() {
                match arg.as_str() {
                    "-o" | "--output" => {
                        output = Some(PathBuf::from(
                            rest.next().context("'-o' needs a path")?,
                        ));
                    }
                    other if file.is_none() => file = Some(other.to_string()),
                    other => bail!("Unexpected argument '{other}'"),
                }
            }
            let file = file.context("'build' needs a file argument")?;
            build_file(Path::new(&file), output)
        }
        "repl" => {
            repl::run(&Console::stdio())?;
            Ok(ExitCode::SUCCESS)
        }
        "--help" | "-h" | "help" => {
            print!("{USAGE}");
            Ok(ExitCode::SUCCESS)
        }
        other => bail!("Unknown command '{other}'\n\n{USAGE}"),
    }
}

/// Source files compile on the fly; `.mbc` images load directly.
fn load_program(path: &Path) -> anyhow::Result<Result<Rc<CodeObject>, ExitCode>> {
    if path.extension().and_then(|ext| ext.to_str()) == Some(image::EXTENSION) {
        let program =
            image::load(path).with_context(|| format!("Loading image {}", path.display()))?;
        return Ok(Ok(program));
    }
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Reading {}", path.display()))?;
    match mythos::compile(&source) {
        Ok(program) => Ok(Ok(program)),
        Err(error) => {
            eprintln!("error: {error}");
            Ok(Err(ExitCode::from(EXIT_COMPILE_ERROR)))
        }
    }
}

fn run_file(path: &Path, debug: bool) -> anyhow::Result<ExitCode> {
    let program = match load_program(path)? {
        Ok(program) => program,
        Err(exit) => return Ok(exit),
    };
    if debug {
        eprint!("{}", program.disassemble());
    }

    let console = Console::stdio();
    let mut vm = Vm::new(Registry::standard(&console));
    match vm.run(&program) {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(error) => {
            eprintln!("error: {}", error.render());
            Ok(ExitCode::from(EXIT_RUNTIME_ERROR))
        }
    }
}

fn build_file(path: &Path, output: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Reading {}", path.display()))?;
    let program = match mythos::compile(&source) {
        Ok(program) => program,
        Err(error) => {
            eprintln!("error: {error}");
            return Ok(ExitCode::from(EXIT_COMPILE_ERROR));
        }
    };
    let output = output.unwrap_or_else(|| path.with_extension(image::EXTENSION));
    image::save(&output, &program)
        .with_context(|| format!("Writing image {}", output.display()))?;
    tracing::info!(path = %output.display(), "image written");
    Ok(ExitCode::SUCCESS)
}
