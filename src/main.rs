mod compiler;
mod parser;

use std::path::{Path, PathBuf};
use std::process::Command;

use clap::Parser as Clap;

use crate::compiler::compile;
use crate::parser::{first_error, Parser};

const INSTALL_PATH: &str = "/usr/local/bin/quill";
const PROJECT_SITE: &str = "https://quill-lang.dev";

#[derive(Clap, Debug)]
#[command(
    name = "quill",
    version,
    about = "Compiler for the Quill scripting language",
    arg_required_else_help = true
)]
struct Args {
    /// Shows debugging info
    #[arg(short, long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clap, Debug)]
enum Commands {
    /// Install the quill binary system-wide
    Setup,
    /// Produce a native binary next to the source file
    Compile { filename: String },
    /// Like compile, with aggressive linker flags
    CompileMax { filename: String },
    /// Print the generated Go source to stdout
    Transpile { filename: String },
    /// Compile to a temporary directory, then execute
    Run { filename: String },
    /// Write the AST as JSON to <file>.ast.json
    Ast { filename: String },
    /// Remove the system-wide binary
    Uninstall,
    /// Open the project website
    Origin,
    /// Print the version
    Version,
}

fn read_source(filename: &str) -> String {
    match std::fs::read_to_string(filename) {
        Ok(contents) => contents,
        Err(err) => {
            eprintln!("Os error while reading file {filename}: {err}");
            std::process::exit(70);
        }
    }
}

fn base_dir(filename: &str) -> PathBuf {
    Path::new(filename)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Runs the whole pipeline on one source file and returns the Go program.
fn transpile_source(filename: &str) -> String {
    let source = read_source(filename);
    let mut parser = Parser::new();
    let ast = match parser.generate_full_ast(&source, true) {
        Ok(ast) => ast,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(65);
        }
    };
    if let Some(err) = first_error(&ast) {
        eprintln!("{err}");
        std::process::exit(65);
    }
    match compile(ast, &mut parser, &base_dir(filename)) {
        Ok(output) => output,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(65);
        }
    }
}

/// Writes the generated source to a scratch directory and invokes the Go
/// toolchain on it. Returns the produced binary's path.
fn build_binary(filename: &str, output: &Path, max: bool, debug: bool) -> PathBuf {
    let generated = transpile_source(filename);

    let build_dir = std::env::temp_dir().join(format!("quill-build-{}", std::process::id()));
    if let Err(err) = std::fs::create_dir_all(&build_dir) {
        eprintln!("Could not create build directory: {err}");
        std::process::exit(70);
    }
    let go_file = build_dir.join("main.go");
    if let Err(err) = std::fs::write(&go_file, generated) {
        eprintln!("Could not write generated source: {err}");
        std::process::exit(70);
    }
    if debug {
        eprintln!("generated source: {}", go_file.display());
    }

    let mut build = Command::new("go");
    build.arg("build");
    if max {
        build.args(["-ldflags", "-s -w"]);
    }
    build.arg("-o").arg(output).arg("main.go");
    build.current_dir(&build_dir);

    match build.output() {
        Ok(result) if result.status.success() => output.to_path_buf(),
        Ok(result) => {
            eprintln!("Build failed!");
            eprintln!("{}", String::from_utf8_lossy(&result.stderr));
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("Could not invoke the Go toolchain: {err}");
            std::process::exit(70);
        }
    }
}

fn binary_target(filename: &str) -> PathBuf {
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "out".to_string());
    // absolute, so `go build -o` is not relative to the scratch directory
    let dir = base_dir(filename);
    let dir = std::fs::canonicalize(&dir).unwrap_or(dir);
    dir.join(stem)
}

fn execute_run(filename: &str, debug: bool) {
    let build_dir = std::env::temp_dir().join(format!("quill-run-{}", std::process::id()));
    if let Err(err) = std::fs::create_dir_all(&build_dir) {
        eprintln!("Could not create build directory: {err}");
        std::process::exit(70);
    }
    let target = build_dir.join("program");
    let binary = build_binary(filename, &target, false, debug);
    match Command::new(&binary).status() {
        Ok(status) => {
            std::process::exit(status.code().unwrap_or(0));
        }
        Err(err) => {
            eprintln!("Error running binary: {err}");
            std::process::exit(70);
        }
    }
}

fn execute_ast(filename: &str) {
    let source = read_source(filename);
    let mut parser = Parser::new();
    let ast = match parser.generate_full_ast(&source, true) {
        Ok(ast) => ast,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(65);
        }
    };
    let json = match serde_json::to_string_pretty(&ast) {
        Ok(json) => json,
        Err(err) => {
            eprintln!("Could not serialise AST: {err}");
            std::process::exit(70);
        }
    };
    let out_path = format!("{filename}.ast.json");
    if let Err(err) = std::fs::write(&out_path, json) {
        eprintln!("Could not write {out_path}: {err}");
        std::process::exit(70);
    }
    println!("{out_path}");
}

fn execute_setup() {
    let current = match std::env::current_exe() {
        Ok(path) => path,
        Err(err) => {
            eprintln!("Could not locate the running binary: {err}");
            std::process::exit(70);
        }
    };
    match std::fs::copy(&current, INSTALL_PATH) {
        Ok(_) => println!("Installed to {INSTALL_PATH}"),
        Err(err) => {
            eprintln!("Install failed (try with elevated permissions): {err}");
            std::process::exit(70);
        }
    }
}

fn execute_uninstall() {
    match std::fs::remove_file(INSTALL_PATH) {
        Ok(_) => println!("Removed {INSTALL_PATH}"),
        Err(err) => {
            eprintln!("Uninstall failed: {err}");
            std::process::exit(70);
        }
    }
}

fn execute_origin() {
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else if cfg!(target_os = "windows") {
        "explorer"
    } else {
        "xdg-open"
    };
    if let Err(err) = Command::new(opener).arg(PROJECT_SITE).status() {
        eprintln!("Could not open {PROJECT_SITE}: {err}");
        std::process::exit(70);
    }
}

fn main() {
    let args = Args::parse();
    let debug = args.debug;

    let Some(command) = args.command else {
        eprintln!("No command given. Try `quill help`.");
        std::process::exit(64);
    };

    match command {
        Commands::Setup => execute_setup(),
        Commands::Compile { filename } => {
            let target = binary_target(&filename);
            build_binary(&filename, &target, false, debug);
            println!("{}", target.display());
        }
        Commands::CompileMax { filename } => {
            let target = binary_target(&filename);
            build_binary(&filename, &target, true, debug);
            println!("{}", target.display());
        }
        Commands::Transpile { filename } => {
            print!("{}", transpile_source(&filename));
        }
        Commands::Run { filename } => execute_run(&filename, debug),
        Commands::Ast { filename } => execute_ast(&filename),
        Commands::Uninstall => execute_uninstall(),
        Commands::Origin => execute_origin(),
        Commands::Version => println!("quill {}", env!("CARGO_PKG_VERSION")),
    }
}
