use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use moonbridge::{ast, Error, FunctionHandle, Options, Session, Value, parser, vm};

#[derive(Parser, Debug)]
#[command(name = "moonbridge", version, about = "Run scripts on the moonbridge VM")]
struct Cli {
    /// Script file to run
    file: Option<PathBuf>,

    /// Run inline code instead of a file
    #[arg(short = 'e', long = "execute", value_name = "CODE")]
    execute: Option<String>,

    /// Print an intermediate form instead of running
    #[arg(long, value_enum)]
    emit: Option<Emit>,

    /// Print the chunk's return values as JSON
    #[arg(long)]
    json: bool,

    /// VM options as a JSON file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Arguments passed to the chunk as `...`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Emit {
    Ast,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut cli = Cli::parse();
    match run(&mut cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{}", message);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &mut Cli) -> Result<(), String> {
    let (source, chunk_name) = match (cli.execute.clone(), cli.file.take()) {
        (Some(code), file) => {
            // With -e every positional is a script argument.
            if let Some(file) = file {
                cli.args.insert(0, file.display().to_string());
            }
            (code, "=(command line)".to_string())
        }
        (None, Some(path)) => {
            let source = std::fs::read_to_string(&path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
            (source, path.display().to_string())
        }
        (None, None) => return Err("usage: moonbridge [OPTIONS] <FILE | -e CODE> [ARGS]...".to_string()),
    };

    if let Some(Emit::Ast) = cli.emit {
        let chunk = parser::compile(&source, &chunk_name).map_err(|e| report_compile(&source, &e.to_string(), e.line))?;
        let json = serde_json::to_string_pretty(&chunk).map_err(|e| format!("serialization error: {}", e))?;
        println!("{}", json);
        return Ok(());
    }

    let options = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
            Options::from_json(&text).map_err(|e| format!("bad config {}: {}", path.display(), e))?
        }
        None => Options { open_libs: true, ..Options::default() },
    };
    tracing::debug!(?options, "starting session");
    let session = Session::with_options(options);

    let main = session.load(&source, &chunk_name).map_err(|e| describe(&source, &e))?;
    let args: Vec<Value> = cli.args.iter().map(|a| Value::from(a.as_str())).collect();
    let results = call(&main, &args).map_err(|e| describe(&source, &e))?;

    if cli.json {
        let values = results
            .iter()
            .map(Value::to_json)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        let json = serde_json::to_string_pretty(&values).map_err(|e| format!("serialization error: {}", e))?;
        println!("{}", json);
    } else if !results.is_empty() {
        let line: Vec<String> = results.iter().map(Value::to_string).collect();
        println!("{}", line.join("\t"));
    }
    Ok(())
}

fn call(main: &FunctionHandle, args: &[Value]) -> Result<Vec<Value>, Error> {
    main.call_with_results(args, vm::MULTRET)
}

fn describe(source: &str, err: &Error) -> String {
    match err {
        Error::Compile { line, .. } => report_compile(source, &err.to_string(), *line),
        other => other.to_string(),
    }
}

fn report_compile(source: &str, message: &str, line: usize) -> String {
    let text = ast::line_text(source, line);
    if text.is_empty() {
        return message.to_string();
    }
    format!("{}\n  {:>4} | {}", message, line, text)
}
