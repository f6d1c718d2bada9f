use std::env;
use std::fs;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fetchpool_core::config::EngineConfig;
use fetchpool_core::{
    CoreError, DownloadEngine, DownloadTask, TaskHandle, TaskMonitor, TaskOutput, TaskState,
};
use tracing::debug;

struct Options {
    command: String,
    positional: Vec<String>,
    config: Option<String>,
    max_total: Option<usize>,
    per_host: Vec<(String, usize)>,
    verbose: bool,
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("error: {}", message);
            print_usage();
            process::exit(2);
        }
    };
    init_tracing(options.verbose);

    let engine = match build_engine(&options) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("error: {}", err);
            process::exit(1);
        }
    };

    let code = match (options.command.as_str(), options.positional.as_slice()) {
        ("get", [url]) => get(&engine, url),
        ("save", [url, dest]) => save(&engine, url, dest),
        _ => {
            print_usage();
            2
        }
    };
    process::exit(code);
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        command: String::new(),
        positional: Vec::new(),
        config: None,
        max_total: None,
        per_host: Vec::new(),
        verbose: false,
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-v" | "--verbose" => options.verbose = true,
            "--config" => {
                let path = iter.next().ok_or("--config needs a path")?;
                options.config = Some(path.clone());
            }
            "--max-total" => {
                let value = iter.next().ok_or("--max-total needs a number")?;
                let value = value
                    .parse()
                    .map_err(|_| format!("invalid --max-total {:?}", value))?;
                options.max_total = Some(value);
            }
            "--max-per-host" => {
                let value = iter.next().ok_or("--max-per-host needs HOST=N")?;
                let (host, max) = value
                    .split_once('=')
                    .ok_or_else(|| format!("invalid --max-per-host {:?}", value))?;
                let max = max
                    .parse()
                    .map_err(|_| format!("invalid --max-per-host {:?}", value))?;
                options.per_host.push((host.to_string(), max));
            }
            flag if flag.starts_with('-') => return Err(format!("unknown flag {}", flag)),
            _ if options.command.is_empty() => options.command = arg.clone(),
            _ => options.positional.push(arg.clone()),
        }
    }
    if options.command.is_empty() {
        return Err("missing command".to_string());
    }
    Ok(options)
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_engine(options: &Options) -> Result<DownloadEngine, CoreError> {
    let config = match &options.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    let engine = DownloadEngine::new(config)?;
    if let Some(max_total) = options.max_total {
        engine.set_max_total_connections(max_total)?;
    }
    for (host, max) in &options.per_host {
        engine.set_max_per_host(host, *max)?;
    }
    Ok(engine)
}

fn load_config(path: &str) -> Result<EngineConfig, CoreError> {
    let raw = fs::read_to_string(path)
        .map_err(|err| CoreError::InvalidArgument(format!("read {}: {}", path, err)))?;
    let config: EngineConfig = serde_json::from_str(&raw)
        .map_err(|err| CoreError::InvalidArgument(format!("parse {}: {}", path, err)))?;
    debug!(path, "loaded engine config");
    Ok(config)
}

fn get(engine: &DownloadEngine, url: &str) -> i32 {
    let task = match engine.download_string_with_monitor(url, Arc::new(ConsoleMonitor::default())) {
        Ok(task) => task,
        Err(err) => return report(&err),
    };
    if let Err(err) = task.start() {
        return report(&err);
    }
    match (task.wait(), task.result()) {
        (TaskState::Succeeded, Some(text)) => {
            print!("{}", text);
            0
        }
        _ => finish_failed(&task),
    }
}

fn save(engine: &DownloadEngine, url: &str, dest: &str) -> i32 {
    let task = match engine.download_file_with_monitor(url, dest, Arc::new(ConsoleMonitor::default())) {
        Ok(task) => task,
        Err(err) => return report(&err),
    };
    if let Err(err) = task.start() {
        return report(&err);
    }
    match (task.wait(), task.result()) {
        (TaskState::Succeeded, Some(path)) => {
            println!("saved {}", path.display());
            0
        }
        _ => finish_failed(&task),
    }
}

fn finish_failed(task: &impl DownloadTask) -> i32 {
    match task.error() {
        Some(err) => report(&err),
        None => {
            eprintln!("error: task ended as {}", task.state());
            1
        }
    }
}

fn report(err: &CoreError) -> i32 {
    eprintln!("error: {}", err);
    1
}

fn print_usage() {
    eprintln!(
        "Usage: fetchpool [options] <command> [args]\n\
Commands:\n\
  get <url>               Download a resource and print it as text\n\
  save <url> <path>       Download a resource into a file\n\
Options:\n\
  --max-total N           Connection limit across all hosts\n\
  --max-per-host HOST=N   Connection limit for one host (repeatable)\n\
  --config FILE           Engine configuration as JSON\n\
  -v, --verbose           Debug logging (RUST_LOG overrides)"
    );
}

/// Prints a progress line to stderr at most every 250ms.
#[derive(Default)]
struct ConsoleMonitor {
    last: Mutex<Option<(Instant, Instant)>>,
}

impl TaskMonitor for ConsoleMonitor {
    fn on_start(&self, task: &TaskHandle) {
        let now = Instant::now();
        if let Ok(mut last) = self.last.lock() {
            *last = Some((now, now));
        }
        eprintln!("fetching {}", task.url());
    }

    fn on_progress(&self, _task: &TaskHandle, transferred: u64, total: Option<u64>) {
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        let now = Instant::now();
        let (started, printed) = last.get_or_insert((now, now));
        if now.duration_since(*printed) < Duration::from_millis(250) {
            return;
        }
        *printed = now;
        let secs = now.duration_since(*started).as_secs_f64();
        let speed = if secs > 0.0 {
            (transferred as f64 / secs) as u64
        } else {
            0
        };
        let percent = match total {
            Some(total) if total > 0 => format!("{:.1}%", transferred as f64 / total as f64 * 100.0),
            _ => "--".to_string(),
        };
        eprintln!(
            "{} {}/{} ({}/s)",
            percent,
            format_bytes(transferred),
            total.map(format_bytes).unwrap_or_else(|| "?".to_string()),
            format_bytes(speed),
        );
    }

    fn on_success(&self, task: &TaskHandle, output: &TaskOutput) {
        if let TaskOutput::File(path) = output {
            debug!(task_id = %task.id(), path = %path.display(), "file written");
        }
        eprintln!("done, {}", format_bytes(task.bytes_transferred()));
    }

    fn on_cancel(&self, _task: &TaskHandle) {
        eprintln!("cancelled");
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}
