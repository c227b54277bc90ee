use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pyrite_core::backend::create_backend;
use pyrite_core::value::Shape;
use pyrite_core::{
    InjectionResult, ProcessControl, ProcessId, PyriteError, RemoteValue, Result as PyriteResult, SessionManager,
    ThreadHandle,
};
use pyrite_utils::{InspectorConfig, LogLevel, info, init_logging, init_logging_with_level, warn};

/// Inspect a running CPython process and run code inside it.
#[derive(Parser, Debug)]
#[command(name = "pyrite")]
#[command(version)]
#[command(about = "Inspect a running CPython process and run code inside it", long_about = None)]
struct Cli
{
    /// Process ID (PID) of the target
    #[arg(short, long)]
    pid: u32,

    /// Runtime thread to operate on (`threading.get_ident()`, hex or decimal)
    #[arg(short, long, value_parser = parse_thread_id)]
    thread: Option<u64>,

    /// Frame depth to operate on (0 = innermost)
    #[arg(short, long, default_value_t = 0)]
    frame: usize,

    /// Timeout for each call into the target, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Separate debug-symbol file for the runtime image
    #[arg(long)]
    symbol_file: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); overrides `RUST_LOG`
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Maximum entries printed when expanding a container
    #[arg(long, default_value_t = 50)]
    limit: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// List the runtime's threads
    Threads,
    /// Print a traceback of the selected thread
    Bt,
    /// Print the locals of the selected frame
    Locals,
    /// Print the globals of the selected frame
    Globals,
    /// Print the builtins of the selected frame
    Builtins,
    /// Look a name up (locals, then globals, then builtins) and print it
    Print
    {
        /// Variable name
        name: String,
    },
    /// Run source code inside the target
    Inject
    {
        /// Source code to run in `__main__`
        code: String,
    },
    /// Run a local file inside the target
    InjectFile
    {
        /// Path of the file to run
        path: PathBuf,
    },
    /// Show the target's runtime build and threads
    Info,
}

fn parse_thread_id(value: &str) -> Result<u64, String>
{
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed.map_err(|err| format!("invalid thread id `{value}`: {err}"))
}

fn main()
{
    let cli = Cli::parse();

    // Initialize logging (reads from RUST_LOG env var unless --log-level is given)
    let logging = match cli.log_level {
        Some(level) => init_logging_with_level(level, None),
        None => init_logging(),
    };
    let guard = match logging {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    let config = match config_for(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(2);
        }
    };

    let code = match run(&cli, config) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };
    // Flush the log file before exiting
    drop(guard);
    process::exit(code);
}

fn config_for(cli: &Cli) -> Result<InspectorConfig, pyrite_utils::ConfigError>
{
    let mut config = InspectorConfig::from_env()?;
    if let Some(ms) = cli.timeout_ms {
        if ms == 0 {
            return Err(pyrite_utils::ConfigError::Zero { var: "--timeout-ms" });
        }
        config.inject_timeout = Duration::from_millis(ms);
    }
    if let Some(path) = &cli.symbol_file {
        config.symbol_file = Some(path.clone());
    }
    Ok(config)
}

/// Attach, run one command, detach. Returns the exit code.
fn run(cli: &Cli, config: InspectorConfig) -> PyriteResult<i32>
{
    let backend = create_backend(config.symbol_file.clone())?;
    let manager = SessionManager::new(backend, config);

    info!("Attaching to process {}", cli.pid);
    manager.attach(ProcessId::from(cli.pid))?;

    let outcome = select(&manager, cli).and_then(|()| run_command(&manager, cli));

    if manager.is_stalled() {
        warn!("injection stalled; releasing the target anyway");
        manager.force_detach()?;
    } else if manager.pid().is_some() {
        manager.detach()?;
    }
    outcome
}

fn select<B: ProcessControl>(manager: &SessionManager<B>, cli: &Cli) -> PyriteResult<()>
{
    if let Some(id) = cli.thread {
        manager.select_thread_by_id(id)?;
    }
    if cli.frame > 0 {
        manager.set_frame(cli.frame)?;
    }
    Ok(())
}

fn run_command<B: ProcessControl>(manager: &SessionManager<B>, cli: &Cli) -> PyriteResult<i32>
{
    match &cli.command {
        Commands::Threads => {
            let current = manager.current_thread()?;
            for thread in manager.list_threads()? {
                let marker = if current.as_ref() == Some(&thread) { "*" } else { " " };
                let depth = manager.frames(&thread)?.len();
                println!("{marker} {thread} ({depth} frames)");
            }
            Ok(0)
        }
        Commands::Bt => {
            let thread = current_thread(manager)?;
            print!("{}", manager.backtrace(&thread)?);
            Ok(0)
        }
        Commands::Locals => {
            print_mapping(manager, &manager.locals()?, cli.limit)?;
            Ok(0)
        }
        Commands::Globals => {
            print_mapping(manager, &manager.globals()?, cli.limit)?;
            Ok(0)
        }
        Commands::Builtins => {
            print_mapping(manager, &manager.builtins()?, cli.limit)?;
            Ok(0)
        }
        Commands::Print { name } => match manager.lookup(name)? {
            Some(value) => {
                println!("{value}");
                expand(manager, &value, cli.limit)?;
                Ok(0)
            }
            None => {
                eprintln!("NameError: name '{name}' is not defined");
                Ok(1)
            }
        },
        Commands::Inject { code } => report(manager.inject(code, None)?),
        Commands::InjectFile { path } => report(manager.inject_file(path, None)?),
        Commands::Info => {
            println!("Process: {}", cli.pid);
            println!("  Runtime: CPython {}", manager.build()?);
            println!("  State: {}", manager.state());
            if let Some(session) = manager.session_id() {
                println!("  Session: {session}");
            }
            let threads = manager.list_threads()?;
            println!("  Threads: {}", threads.len());
            if let Some(thread) = manager.current_thread()? {
                println!("  Current Thread: {thread}");
                if let Ok(frame) = manager.current_frame() {
                    println!("  Current Frame: {}", frame.location);
                }
            }
            Ok(0)
        }
    }
}

fn current_thread<B: ProcessControl>(manager: &SessionManager<B>) -> PyriteResult<ThreadHandle>
{
    manager
        .current_thread()?
        .ok_or_else(|| PyriteError::Position("the target has no runtime threads".to_string()))
}

fn report(result: InjectionResult) -> PyriteResult<i32>
{
    print!("{}", result.stdout());
    match result.traceback() {
        Some(traceback) => {
            eprint!("{traceback}");
            Ok(1)
        }
        None => Ok(0),
    }
}

fn print_mapping<B: ProcessControl>(manager: &SessionManager<B>, value: &RemoteValue, limit: usize) -> PyriteResult<()>
{
    let Some(proxy) = value.as_proxy() else {
        println!("{value}");
        return Ok(());
    };
    for index in 0..proxy.len().min(limit) {
        let Some((key, item)) = manager.entry(proxy, index)? else {
            break;
        };
        match key.as_str() {
            Some(name) => println!("{name} = {item}"),
            None => println!("{key} = {item}"),
        }
    }
    if proxy.len() > limit {
        println!("... {} more", proxy.len() - limit);
    }
    Ok(())
}

/// Print one level of a container's contents
fn expand<B: ProcessControl>(manager: &SessionManager<B>, value: &RemoteValue, limit: usize) -> PyriteResult<()>
{
    let Some(proxy) = value.as_proxy() else {
        return Ok(());
    };
    match &proxy.shape {
        Shape::Sequence { len, .. } => {
            for index in 0..(*len).min(limit) {
                if let Some(item) = manager.item(proxy, index)? {
                    println!("  [{index}] {item}");
                }
            }
            if *len > limit {
                println!("  ... {} more", len - limit);
            }
        }
        Shape::Mapping { .. } | Shape::Instance { .. } => {
            for index in 0..proxy.len().min(limit) {
                if let Some((key, item)) = manager.entry(proxy, index)? {
                    println!("  {key}: {item}");
                }
            }
            if proxy.len() > limit {
                println!("  ... {} more", proxy.len() - limit);
            }
        }
    }
    Ok(())
}
