use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use launchbench::benchmark::{CounterSampling, StartupBenchmark, TraceCapture};
use launchbench::config::BenchConfig;
use launchbench::counters::{CounterService, DEFAULT_MAX_CONCURRENT, PttCounters, plan_groups};
use launchbench::display;
use launchbench::errors::BenchError;
use launchbench::metrics::MetricSink;
use launchbench::prefetch::PrefetchDir;
use launchbench::preload::TomlPreloadStore;
use launchbench::profile::CallTraceProfile;
use launchbench::runner::{RunOptions, Runner};
use launchbench::service::Liveness;
use launchbench::target::{ProcessTarget, ReadyTiming};
use launchbench::trace::{CommandDecoder, JsonLinesDecoder, TraceDecoder};
use launchbench::types::PrefetchPolicy;
use launchbench::workingset::WsDumpTool;

#[derive(Parser)]
#[command(
    name = "launchbench",
    version,
    about = "Repeatedly launch an application and report startup performance metrics"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log lifecycle steps and recorded samples to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Benchmark the startup of an executable
    Run(RunArgs),
    /// Run an executable under a call-trace service and collect its trace files
    Profile(ProfileArgs),
    /// Show the counter catalog and how requested counters are grouped
    Counters(CountersArgs),
}

#[derive(Args)]
struct RunArgs {
    executable: PathBuf,

    #[arg(short = 'n', long)]
    iterations: Option<usize>,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    profile_dir: Option<PathBuf>,

    #[arg(long)]
    no_initialize_profile: bool,

    #[arg(long, value_enum)]
    prefetch: Option<PrefetchPolicy>,

    #[arg(long)]
    prefetch_dir: Option<PathBuf>,

    #[arg(long, overrides_with = "no_preload")]
    preload: bool,

    #[arg(long, overrides_with = "preload")]
    no_preload: bool,

    #[arg(long)]
    preload_settings: Option<PathBuf>,

    #[arg(long)]
    keep_temp_dirs: bool,

    #[arg(long)]
    trace_service: Option<PathBuf>,

    /// Sample hardware performance counters
    #[arg(long)]
    counters: bool,

    /// Counter to sample (repeatable); all counters when omitted
    #[arg(long, value_name = "NAME")]
    counter: Vec<String>,

    #[arg(long)]
    counter_tool_dir: Option<PathBuf>,

    #[arg(long)]
    working_set_tool: Option<PathBuf>,

    #[arg(long)]
    settle_secs: Option<u64>,

    #[arg(long)]
    json: bool,

    /// Print whatever was measured even when the run fails
    #[arg(long)]
    partial_results: bool,
}

impl RunArgs {
    /// Command-line flags win over the configuration file.
    fn apply(&self, config: &mut BenchConfig) {
        config.target.executable = Some(self.executable.clone());
        if let Some(n) = self.iterations {
            config.run.iterations = n;
        }
        if let Some(dir) = &self.profile_dir {
            config.run.profile_dir = Some(dir.clone());
        }
        if self.no_initialize_profile {
            config.run.initialize_profile = false;
        }
        if let Some(policy) = self.prefetch {
            config.prefetch.policy = policy;
        }
        if let Some(dir) = &self.prefetch_dir {
            config.prefetch.dir = Some(dir.clone());
        }
        if self.preload {
            config.preload.enabled = Some(true);
        }
        if self.no_preload {
            config.preload.enabled = Some(false);
        }
        if let Some(path) = &self.preload_settings {
            config.preload.settings_file = Some(path.clone());
        }
        if self.keep_temp_dirs {
            config.run.keep_temp_dirs = true;
        }
        if let Some(path) = &self.trace_service {
            config.trace.service = Some(path.clone());
        }
        if self.counters || !self.counter.is_empty() {
            config.counters.enabled = true;
        }
        if !self.counter.is_empty() {
            config.counters.names = self.counter.clone();
        }
        if let Some(dir) = &self.counter_tool_dir {
            config.counters.tool_dir = Some(dir.clone());
        }
        if let Some(path) = &self.working_set_tool {
            config.working_set.tool = Some(path.clone());
        }
        if let Some(secs) = self.settle_secs {
            config.target.settle_secs = secs;
        }
        if self.json {
            config.run.json = true;
        }
        if self.partial_results {
            config.run.partial_results = true;
        }
    }
}

#[derive(Args)]
struct ProfileArgs {
    executable: PathBuf,

    #[arg(long)]
    output_dir: PathBuf,

    #[arg(long)]
    call_trace_service: PathBuf,

    #[arg(short = 'n', long, default_value_t = 10)]
    iterations: usize,

    #[arg(long, default_value_t = 10)]
    settle_secs: u64,

    #[arg(long)]
    profile_dir: Option<PathBuf>,
}

#[derive(Args)]
struct CountersArgs {
    #[arg(long)]
    counter_tool_dir: PathBuf,

    #[arg(long, value_name = "NAME")]
    counter: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("launchbench={level}").into()),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_report(sink: &MetricSink, json: bool) {
    if json {
        println!("{}", display::format_json(sink, Utc::now()));
    } else {
        print!("{}", display::format_report(sink));
    }
}

fn timing(config: &BenchConfig) -> ReadyTiming {
    ReadyTiming {
        poll_interval: config.target.poll_interval(),
        timeout: config.target.ready_timeout(),
    }
}

fn build_target(config: &BenchConfig, exe: &Path) -> ProcessTarget {
    ProcessTarget::new(exe)
        .with_name(&config.target.resolved_process_name())
        .with_extra_args(config.target.extra_args.clone())
        .with_launch_wrapper(config.target.launch_wrapper.clone())
        .with_ready_lock(&config.target.ready_lock)
        .with_shutdown_timeout(config.target.shutdown_timeout())
}

fn build_benchmark(config: &BenchConfig, exe: &Path) -> Result<StartupBenchmark, BenchError> {
    let target = &config.target;
    let mut bench = StartupBenchmark::new(
        &target.resolved_graph(),
        &target.resolved_process_name(),
        &target.resolved_module_suffix(),
    )
    .with_settle(target.settle());

    if config.prefetch.policy != PrefetchPolicy::Enabled
        && let Some(dir) = &config.prefetch.dir
    {
        let exe_name = exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        bench = bench.with_prefetch(
            config.prefetch.policy,
            Box::new(PrefetchDir::new(dir, &exe_name)),
        );
    }

    if let (Some(setting), Some(path)) = (config.preload.setting(), &config.preload.settings_file) {
        bench = bench.with_preload(Box::new(TomlPreloadStore::new(path)), setting);
    }

    if let Some(service) = &config.trace.service {
        let decoder: Box<dyn TraceDecoder> = match &config.trace.decoder {
            Some(program) => Box::new(CommandDecoder::new(program)),
            None => Box::new(JsonLinesDecoder),
        };
        bench = bench.with_trace(TraceCapture {
            program: service.clone(),
            extra_args: config.trace.extra_args.clone(),
            verbose: config.trace.verbose,
            extension: config.trace.extension.clone(),
            decoder,
            liveness: Liveness::default(),
        });
    }

    if config.counters.enabled
        && let Some(tool_dir) = &config.counters.tool_dir
    {
        let service = PttCounters::open(tool_dir, config.counters.max_concurrent)?;
        let requested: BTreeSet<String> = config.counters.names.iter().cloned().collect();
        let groups = plan_groups(&requested, service.catalog())?;
        bench = bench.with_counters(CounterSampling {
            service: Box::new(service),
            groups,
        });
    }

    if let Some(tool) = &config.working_set.tool {
        bench = bench.with_working_set(Box::new(WsDumpTool::new(tool)));
    }

    Ok(bench)
}

fn run_benchmark(args: RunArgs) -> Result<()> {
    let mut config = BenchConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let exe = config
        .target
        .executable
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no target executable given"))?;
    if !exe.is_file() {
        return Err(BenchError::Configuration(format!(
            "target executable \"{}\" does not exist",
            exe.display()
        ))
        .into());
    }

    let mut scenario = build_benchmark(&config, &exe)?;
    let options = RunOptions {
        profile_dir: config.run.profile_dir.clone(),
        initialize_profile: config.run.initialize_profile,
        keep_temp_dirs: config.run.keep_temp_dirs,
        timing: timing(&config),
    };
    let mut runner = Runner::new(build_target(&config, &exe), options);

    info!(iterations = config.run.iterations, "starting benchmark");
    match runner.run(&mut scenario, config.run.iterations) {
        Ok(()) => {
            print_report(runner.sink(), config.run.json);
            Ok(())
        }
        Err(err) => {
            if config.run.partial_results {
                print_report(runner.sink(), config.run.json);
            }
            eprintln!("{}", display::format_failure(&err));
            Err(err.into())
        }
    }
}

fn run_profile(args: ProfileArgs) -> Result<()> {
    let mut config = BenchConfig::default();
    config.target.executable = Some(args.executable.clone());
    config.run.iterations = args.iterations;
    config.run.profile_dir = args.profile_dir.clone();
    config.validate()?;

    let mut scenario = CallTraceProfile::new(&args.call_trace_service, &args.output_dir)
        .with_settle(Duration::from_secs(args.settle_secs));
    let options = RunOptions {
        profile_dir: config.run.profile_dir.clone(),
        initialize_profile: config.run.initialize_profile,
        keep_temp_dirs: false,
        timing: timing(&config),
    };
    let mut runner = Runner::new(build_target(&config, &args.executable), options);

    if let Err(err) = runner.run(&mut scenario, args.iterations) {
        eprintln!("{}", display::format_failure(&err));
        return Err(err.into());
    }

    for file in scenario.trace_files() {
        println!("{}", file.display());
    }
    Ok(())
}

fn show_counters(args: CountersArgs) -> Result<()> {
    let service = PttCounters::open(&args.counter_tool_dir, args.max_concurrent)?;
    let catalog = service.catalog();

    println!("Available counters:");
    for name in &catalog.names {
        if catalog.is_free(name) {
            println!("  {name} (free)");
        } else {
            println!("  {name}");
        }
    }

    let requested: BTreeSet<String> = args.counter.into_iter().collect();
    let groups = plan_groups(&requested, catalog)?;
    println!();
    println!(
        "{} group(s), at most {} counters each:",
        groups.len(),
        catalog.max_concurrent
    );
    for (i, group) in groups.iter().enumerate() {
        println!("  {i}: {group}");
    }
    Ok(())
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run(args) => run_benchmark(args),
        Commands::Profile(args) => run_profile(args),
        Commands::Counters(args) => show_counters(args),
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{}", err);
        process::exit(1);
    }
}
