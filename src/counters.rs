use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, error, info};

use crate::errors::BenchError;
use crate::metrics::MetricSink;
use crate::types::CounterGroup;

/// The counter that is always sampled and used to rank subjects.
pub const CYCLES: &str = "CYCLES";

/// Default number of counters the sampling hardware runs at once, including `CYCLES`.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Counters a sampling service can run, in the order the service declares them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterCatalog {
    pub names: Vec<String>,
    pub free: BTreeSet<String>,
    pub max_concurrent: usize,
    pub reference: String,
}

impl CounterCatalog {
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn is_free(&self, name: &str) -> bool {
        self.free.contains(name)
    }

    /// Declared counters that each occupy a hardware slot.
    pub fn non_free(&self) -> impl Iterator<Item = &String> {
        self.names.iter().filter(|n| !self.free.contains(*n))
    }
}

/// Splits the requested counters into groups that can be sampled together.
///
/// An empty request means every declared counter. Every group contains all
/// free counters and holds at most `max_concurrent` names. Non-free counters
/// are chunked in catalog declaration order, so identical requests always give
/// identical groups.
pub fn plan_groups(
    requested: &BTreeSet<String>,
    catalog: &CounterCatalog,
) -> Result<Vec<CounterGroup>, BenchError> {
    if catalog.max_concurrent < catalog.free.len() {
        return Err(BenchError::Configuration(format!(
            "at most {} counters can run together but {} free counters are always sampled",
            catalog.max_concurrent,
            catalog.free.len()
        )));
    }
    if !catalog.free.contains(&catalog.reference) {
        return Err(BenchError::Configuration(format!(
            "reference counter {} must be one of the free counters",
            catalog.reference
        )));
    }

    if let Some(unknown) = requested.iter().find(|name| !catalog.contains(name)) {
        return Err(BenchError::Configuration(format!(
            "unknown counter \"{unknown}\""
        )));
    }

    let non_free: Vec<&String> = catalog
        .non_free()
        .filter(|name| requested.is_empty() || requested.contains(*name))
        .collect();

    if non_free.is_empty() {
        return Ok(vec![CounterGroup {
            names: catalog.free.clone(),
        }]);
    }

    let chunk_size = catalog.max_concurrent - catalog.free.len();
    if chunk_size == 0 {
        return Err(BenchError::Configuration(format!(
            "no room for non-free counters: limit {} is taken by the free counters",
            catalog.max_concurrent
        )));
    }

    let groups: Vec<CounterGroup> = non_free
        .chunks(chunk_size)
        .map(|chunk| {
            let mut names = catalog.free.clone();
            names.extend(chunk.iter().map(|n| n.to_string()));
            CounterGroup { names }
        })
        .collect();

    info!(
        groups = groups.len(),
        "performance counters require {} runs per iteration",
        groups.len()
    );
    Ok(groups)
}

/// Counter values per counter name and per subject (process id).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub values: BTreeMap<String, BTreeMap<u32, u64>>,
}

impl CounterSnapshot {
    /// Subjects ordered by descending reference count (ties by descending id).
    pub fn rank_subjects(&self, reference: &str) -> Result<Vec<u32>, BenchError> {
        let counts = self.values.get(reference).ok_or_else(|| {
            BenchError::artifact(
                "counter snapshot",
                format!("reference counter {reference} missing"),
            )
        })?;
        let mut ranked: Vec<(u64, u32)> = counts.iter().map(|(pid, c)| (*c, *pid)).collect();
        ranked.sort_by(|a, b| b.cmp(a));
        Ok(ranked.into_iter().map(|(_, pid)| pid).collect())
    }
}

/// Records one sample per (counter, subject rank) pair.
pub fn record_counters(
    sink: &mut MetricSink,
    graph: &str,
    snapshot: &CounterSnapshot,
    reference: &str,
) -> Result<(), BenchError> {
    let ranked = snapshot.rank_subjects(reference)?;
    for (counter, values) in &snapshot.values {
        for (rank, pid) in ranked.iter().enumerate() {
            let count = values.get(pid).ok_or_else(|| {
                BenchError::artifact(
                    "counter snapshot",
                    format!("no {counter} value for process {pid}"),
                )
            })?;
            sink.add_result(graph, &format!("Counters[{counter}][{rank}]"), *count, "");
        }
    }
    Ok(())
}

/// A hardware performance counter sampling service.
pub trait CounterService {
    fn catalog(&self) -> &CounterCatalog;

    /// Starts sampling `group`. Any previously running group is discarded.
    fn start(&mut self, group: &CounterGroup) -> Result<(), BenchError>;

    /// Reads the running counters for every live instance of `program`.
    fn query(&mut self, program: &str) -> Result<CounterSnapshot, BenchError>;

    /// Stops sampling; all counter data is discarded.
    fn stop(&mut self) -> Result<(), BenchError>;

    fn is_running(&self) -> bool;
}

const PTT: &str = "ptt";
const PRIV_USER: &str = "priv_user";

/// Drives the `ptt` command-line counter toolkit found in `tool_dir`.
pub struct PttCounters {
    tool_dir: PathBuf,
    catalog: CounterCatalog,
    running: Option<Vec<String>>,
}

impl PttCounters {
    pub fn open(tool_dir: &Path, max_concurrent: usize) -> Result<Self, BenchError> {
        let tool_dir = tool_dir.to_path_buf();
        let listing = run_tool(&tool_dir, PTT, &[])?;
        let mut names = parse_counter_listing(&listing);
        if !names.iter().any(|n| n == CYCLES) {
            names.insert(0, CYCLES.to_string());
        }
        debug!(?names, "counter catalog");

        let catalog = CounterCatalog {
            names,
            free: BTreeSet::from([CYCLES.to_string()]),
            max_concurrent,
            reference: CYCLES.to_string(),
        };
        Ok(PttCounters {
            tool_dir,
            catalog,
            running: None,
        })
    }
}

impl CounterService for PttCounters {
    fn catalog(&self) -> &CounterCatalog {
        &self.catalog
    }

    fn start(&mut self, group: &CounterGroup) -> Result<(), BenchError> {
        if let Some(unknown) = group.names.iter().find(|n| !self.catalog.contains(n)) {
            return Err(BenchError::Configuration(format!(
                "unknown counter \"{unknown}\""
            )));
        }

        info!(%group, "starting counters");
        run_tool(&self.tool_dir, PTT, &["term"])?;
        run_tool(&self.tool_dir, PTT, &["noautoterm"])?;

        let names: Vec<String> = group.names.iter().cloned().collect();
        let mut args: Vec<&str> = vec!["init"];
        args.extend(names.iter().map(String::as_str));
        args.extend([PRIV_USER, "-force"]);
        run_tool(&self.tool_dir, PTT, &args)?;

        self.running = Some(names);
        Ok(())
    }

    fn query(&mut self, program: &str) -> Result<CounterSnapshot, BenchError> {
        let running = self
            .running
            .as_ref()
            .ok_or_else(|| BenchError::artifact("counter query", "no counters are running"))?;

        let root = program_root(program);
        info!(program = root, ?running, "querying counters");
        let dump = run_tool(&self.tool_dir, PTT, &["dump", "-pl", root])?;
        parse_dump(&dump, running)
    }

    fn stop(&mut self) -> Result<(), BenchError> {
        let running = self
            .running
            .take()
            .ok_or_else(|| BenchError::artifact("counter stop", "no counters are running"))?;
        info!(?running, "stopping counters");
        run_tool(&self.tool_dir, PTT, &["term"])?;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

/// Bare executable name: no directory, no extension.
pub(crate) fn program_root(program: &str) -> &str {
    let file = program.rsplit(['/', '\\']).next().unwrap_or(program);
    match file.rfind('.') {
        Some(dot) if dot > 0 => &file[..dot],
        _ => file,
    }
}

fn run_tool(tool_dir: &Path, tool: &str, args: &[&str]) -> Result<String, BenchError> {
    let tool_path = tool_dir.join(tool);
    debug!(tool = %tool_path.display(), ?args, "running counter tool");
    let output = Command::new(&tool_path)
        .args(args)
        .current_dir(tool_dir)
        .output()
        .map_err(|source| BenchError::Launch {
            program: tool_path.clone(),
            source,
        })?;

    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("STDOUT: {}", stdout.trim());
        error!("STDERR: {}", stderr.trim());
        return Err(BenchError::artifact(
            format!("{tool} {}", args.join(" ")),
            format!("returned {}", output.status),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn is_counter_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

/// Counter names from the tool's listing, given as `- NAME` lines.
pub fn parse_counter_listing(listing: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in listing.lines() {
        if let Some(name) = line.trim().strip_prefix("- ")
            && is_counter_name(name)
            && !names.iter().any(|n| n == name)
        {
            names.push(name.to_string());
        }
    }
    names
}

/// Parses `ptt dump` output into a snapshot.
///
/// The header `PID TID Disp Intr <NAMES...>` fixes the column order. Each
/// data row is one thread and is summed into its process. A
/// `<pid> ** No Data **` row yields zeros for that process.
pub fn parse_dump(dump: &str, running: &[String]) -> Result<CounterSnapshot, BenchError> {
    let mut columns: Option<Vec<String>> = None;
    let mut snapshot = CounterSnapshot::default();

    for line in dump.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        let Some(names) = &columns else {
            if tokens.len() > 4 && tokens[..4] == ["PID", "TID", "Disp", "Intr"] {
                let names: Vec<String> = tokens[4..].iter().map(|s| s.to_string()).collect();
                let reported: BTreeSet<&String> = names.iter().collect();
                let expected: BTreeSet<&String> = running.iter().collect();
                if reported != expected {
                    return Err(BenchError::artifact(
                        "counter dump",
                        format!("reported counters do not match running counters: {names:?}"),
                    ));
                }
                for name in &names {
                    snapshot.values.insert(name.clone(), BTreeMap::new());
                }
                columns = Some(names);
            }
            continue;
        };

        if tokens.len() == 5
            && tokens[1..] == ["**", "No", "Data", "**"]
            && let Ok(pid) = tokens[0].parse::<u32>()
        {
            for name in names {
                snapshot.values.entry(name.clone()).or_default().insert(pid, 0);
            }
            continue;
        }

        if tokens.len() != names.len() + 4 {
            continue;
        }
        let Ok(numbers) = tokens
            .iter()
            .map(|t| t.parse::<u64>())
            .collect::<Result<Vec<u64>, _>>()
        else {
            continue;
        };
        let Ok(pid) = u32::try_from(numbers[0]) else {
            continue;
        };
        for (name, count) in names.iter().zip(&numbers[4..]) {
            *snapshot
                .values
                .entry(name.clone())
                .or_default()
                .entry(pid)
                .or_insert(0) += count;
        }
    }

    if columns.is_none() {
        return Err(BenchError::artifact(
            "counter dump",
            format!("no results seen for counters: {running:?}"),
        ));
    }
    Ok(snapshot)
}
