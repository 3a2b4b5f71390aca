use std::{
    collections::BTreeMap,
    env, fs,
    io::{self, IsTerminal, Write},
    path::{Path, PathBuf},
    process::{Command, ExitCode},
};

use mneme::{CaptureOutcome, CaptureReader, HighWaterReport, Record, TemporalRow, ThreadId};

const USAGE: &str = "\
usage: mneme <command> [options]

commands:
  run         Run a command with heap tracking activated and write a capture
  parse       Debug a capture by printing every record in it
  flamegraph  Render the peak (or leaked) heap contents as collapsed stacks

run options:
  mneme run [--native] [--follow-fork] [--trace-python-allocators]
            [--aggregate] [-f] [-q] [-o FILE] <script> [args...]

parse options:
  mneme parse <capture>

flamegraph options:
  mneme flamegraph [--leaks] [--temporal] [--split-threads] [-f] [-o FILE] <capture>
";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("run") => run_command(&args[1..]),
        Some("parse") => parse_command(&args[1..]),
        Some("flamegraph") => flamegraph_command(&args[1..]),
        Some("-h" | "--help") => {
            print!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Some(other) => Err(format!("unknown command: {other}\n{USAGE}")),
        None => Err(USAGE.to_owned()),
    };
    match result {
        Ok(code) => code,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

// === run ===

struct RunOptions {
    native: bool,
    follow_fork: bool,
    trace_python_allocators: bool,
    aggregate: bool,
    force: bool,
    quiet: bool,
    output: Option<PathBuf>,
    script: String,
    script_args: Vec<String>,
}

fn parse_run_options(args: &[String]) -> Result<RunOptions, String> {
    let mut options = RunOptions {
        native: false,
        follow_fork: false,
        trace_python_allocators: false,
        aggregate: false,
        force: false,
        quiet: false,
        output: None,
        script: String::new(),
        script_args: Vec::new(),
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--native" => options.native = true,
            "--follow-fork" => options.follow_fork = true,
            "--trace-python-allocators" => options.trace_python_allocators = true,
            "--aggregate" => options.aggregate = true,
            "-f" | "--force" => options.force = true,
            "-q" | "--quiet" => options.quiet = true,
            "-o" | "--output" => {
                let value = iter.next().ok_or("-o requires a file name")?;
                options.output = Some(PathBuf::from(value));
            }
            script => {
                options.script = script.to_owned();
                options.script_args = iter.map(Clone::clone).collect();
                return Ok(options);
            }
        }
    }
    Err("run requires a script to execute".to_owned())
}

fn run_command(args: &[String]) -> Result<ExitCode, String> {
    let options = parse_run_options(args)?;
    let output = options.output.clone().unwrap_or_else(|| {
        let script_path = Path::new(&options.script);
        let base = script_path.file_name().map_or_else(|| "capture".to_owned(), |name| name.to_string_lossy().into_owned());
        let name = format!("mneme-{base}.{}.bin", std::process::id());
        script_path.parent().unwrap_or_else(|| Path::new(".")).join(name)
    });

    if output.exists() && !options.force {
        return Err(format!(
            "output file {} already exists (pass -f to overwrite)",
            output.display()
        ));
    }
    if !options.quiet {
        eprintln!("Writing profile results into {}", output.display());
    }

    let mut child = Command::new(&options.script);
    child
        .args(&options.script_args)
        .env("MNEME_OUTPUT", &output)
        .env("MNEME_FORCE", "1");
    set_flag_env(&mut child, "MNEME_NATIVE", options.native);
    set_flag_env(&mut child, "MNEME_FOLLOW_FORK", options.follow_fork);
    set_flag_env(&mut child, "MNEME_TRACE_PYTHON_ALLOCATORS", options.trace_python_allocators);
    set_flag_env(&mut child, "MNEME_AGGREGATE", options.aggregate);

    let status = child
        .status()
        .map_err(|err| format!("failed to run {}: {err}", options.script))?;

    if !options.quiet && status.success() {
        eprintln!("Successfully generated profile results.");
        eprintln!("You can now generate reports from the stored allocation records:");
        eprintln!("  mneme flamegraph {}", output.display());
    }
    Ok(exit_code_of(status))
}

fn set_flag_env(child: &mut Command, name: &str, value: bool) {
    if value {
        child.env(name, "1");
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> ExitCode {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitCode::from(u8::try_from(code.rem_euclid(256)).unwrap_or(1)),
        // Terminated by a signal: mirror the shell convention of 128 + N.
        None => ExitCode::from(status.signal().map_or(1, |signal| 128u8.saturating_add(signal as u8))),
    }
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> ExitCode {
    match status.code() {
        Some(code) => ExitCode::from(u8::try_from(code.rem_euclid(256)).unwrap_or(1)),
        None => ExitCode::FAILURE,
    }
}

// === parse ===

fn parse_command(args: &[String]) -> Result<ExitCode, String> {
    let [capture] = args else {
        return Err("parse takes exactly one capture file".to_owned());
    };
    if io::stdout().is_terminal() {
        return Err("you must redirect stdout to a file or shell pipeline".to_owned());
    }

    let mut reader =
        CaptureReader::open(Path::new(capture)).map_err(|err| format!("failed to open {capture}: {err}"))?;

    let stdout = io::stdout().lock();
    let mut out = io::BufWriter::new(stdout);
    dump_header(&mut out, &reader).map_err(stringify_io)?;

    loop {
        match reader.next_record() {
            Ok(Some((offset, record))) => {
                dump_record(&mut out, offset, &record).map_err(stringify_io)?;
            }
            Ok(None) => break,
            Err(err) => {
                out.flush().map_err(stringify_io)?;
                return Err(format!("failed to parse allocation records in {capture}\nreason: {err}"));
            }
        }
    }
    out.flush().map_err(stringify_io)?;

    if reader.outcome() == Some(CaptureOutcome::Truncated) {
        eprintln!("warning: PARTIAL_CAPTURE: {capture} has no trailer; showing every record before truncation");
    }
    Ok(ExitCode::SUCCESS)
}

fn stringify_io(err: io::Error) -> String {
    format!("failed to write output: {err}")
}

fn dump_header<W: Write, R: io::Read>(out: &mut W, reader: &CaptureReader<R>) -> io::Result<()> {
    let header = reader.header();
    let format_name: &'static str = header.file_format.into();
    writeln!(out, "HEADER magic={} version={}", mneme::FILE_MAGIC, mneme::FILE_VERSION)?;
    writeln!(
        out,
        "HEADER python_version={:#010x} native_traces={} file_format={} python_allocator={} trace_python_allocators={}",
        header.python_version, header.native_traces, format_name, header.python_allocator,
        header.trace_python_allocators,
    )?;
    writeln!(
        out,
        "HEADER pid={} main_tid={} skipped_frames_on_main_tid={} n_allocations={} n_frames={}",
        header.pid, header.main_tid.0, header.skipped_frames_on_main_tid, header.n_allocations, header.n_frames,
    )?;
    writeln!(
        out,
        "HEADER start_time={} end_time={} command_line={}",
        human_time(header.start_time_ms),
        human_time(header.end_time_ms),
        header.command_line,
    )
}

fn human_time(time_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(i64::try_from(time_ms).unwrap_or(0))
        .map_or_else(|| time_ms.to_string(), |stamp| stamp.to_rfc3339())
}

fn dump_record<W: Write>(out: &mut W, offset: u64, record: &Record) -> io::Result<()> {
    let tag: &'static str = record.tag().into();
    write!(out, "{offset:>10} {tag}")?;
    match record {
        Record::MemoryRecord(snapshot) => {
            write!(out, " time={} rss={}", human_time(snapshot.time_ms), snapshot.rss_bytes)?;
        }
        Record::ContextSwitch(tid) => write!(out, " tid={}", tid.0)?,
        Record::ThreadName(name) => write!(out, " name={name}")?,
        Record::CodeObject { id, descriptor } => {
            write!(
                out,
                " id={} function={} file={} first_line={} linetable_bytes={}",
                id.raw(),
                descriptor.function_name,
                descriptor.file_name,
                descriptor.first_line,
                descriptor.linetable.len(),
            )?;
        }
        Record::FramePush(frame) => {
            write!(
                out,
                " code={} instr_offset={} is_entry={}",
                frame.code.raw(),
                frame.instr_offset,
                frame.is_entry
            )?;
        }
        Record::FramePop { count } => write!(out, " count={count}")?,
        Record::NativeFrame(node) => write!(out, " ip={:#x} parent={}", node.ip, node.parent.raw())?,
        Record::Allocation(allocation) => {
            let kind: &'static str = allocation.kind.into();
            write!(
                out,
                " address={:#x} size={} allocator={kind} native_frame_id={}",
                allocation.address,
                allocation.size,
                allocation.native_stack.raw()
            )?;
        }
        Record::AggregatedAllocation(row) => {
            let kind: &'static str = row.kind.into();
            write!(
                out,
                " tid={} stack={} native={} allocator={kind} n_hwm={} bytes_hwm={} n_leaked={} bytes_leaked={}",
                row.tid.0,
                row.stack.raw(),
                row.native_stack.raw(),
                row.n_allocations_in_high_water_mark,
                row.bytes_in_high_water_mark,
                row.n_allocations_leaked,
                row.bytes_leaked,
            )?;
        }
        Record::MemoryMapStart | Record::Trailer => {}
        Record::SegmentHeader {
            filename,
            base_addr,
            n_segments,
        } => write!(out, " filename={filename} base={base_addr:#x} n_segments={n_segments}")?,
        Record::Segment { vaddr, memsz } => write!(out, " vaddr={vaddr:#x} memsz={memsz:#x}")?,
    }
    writeln!(out)
}

// === flamegraph ===

struct FlamegraphOptions {
    leaks: bool,
    temporal: bool,
    split_threads: bool,
    force: bool,
    output: Option<PathBuf>,
    capture: PathBuf,
}

fn parse_flamegraph_options(args: &[String]) -> Result<FlamegraphOptions, String> {
    let mut leaks = false;
    let mut temporal = false;
    let mut split_threads = false;
    let mut force = false;
    let mut output = None;
    let mut capture = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--leaks" => leaks = true,
            "--temporal" => temporal = true,
            "--split-threads" => split_threads = true,
            "-f" | "--force" => force = true,
            "-o" | "--output" => {
                let value = iter.next().ok_or("-o requires a file name")?;
                output = Some(PathBuf::from(value));
            }
            other if capture.is_none() => capture = Some(PathBuf::from(other)),
            other => return Err(format!("unexpected argument: {other}")),
        }
    }
    let capture = capture.ok_or("flamegraph takes a capture file")?;
    if leaks && temporal {
        return Err("--leaks cannot be combined with --temporal".to_owned());
    }
    Ok(FlamegraphOptions {
        leaks,
        temporal,
        split_threads,
        force,
        output,
        capture,
    })
}

fn flamegraph_command(args: &[String]) -> Result<ExitCode, String> {
    let options = parse_flamegraph_options(args)?;
    let extension = if options.temporal { "json" } else { "folded" };
    let output = options.output.clone().unwrap_or_else(|| {
        let stem = options
            .capture
            .file_stem()
            .map_or_else(|| "capture".to_owned(), |stem| stem.to_string_lossy().into_owned());
        options
            .capture
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("mneme-flamegraph-{stem}.{extension}"))
    });
    if output.exists() && !options.force {
        return Err(format!(
            "output file {} already exists (pass -f to overwrite)",
            output.display()
        ));
    }

    let capture = options.capture.display().to_string();
    let mut reader =
        CaptureReader::open(&options.capture).map_err(|err| format!("failed to open {capture}: {err}"))?;

    let rendered = if options.temporal {
        let rows = reader.temporal_report().map_err(|err| format!("failed to analyse {capture}: {err}"))?;
        render_temporal(&reader, &rows)
    } else {
        let report = reader.high_water_report().map_err(|err| format!("failed to analyse {capture}: {err}"))?;
        render_folded(&reader, &report, options.leaks, options.split_threads)
    };

    if reader.outcome() == Some(CaptureOutcome::Truncated) {
        eprintln!("warning: PARTIAL_CAPTURE: {capture} has no trailer; the report covers the flushed prefix");
    }

    fs::write(&output, rendered).map_err(|err| format!("failed to write {}: {err}", output.display()))?;
    eprintln!("Wrote {}", output.display());
    Ok(ExitCode::SUCCESS)
}

fn thread_label<R: io::Read>(reader: &CaptureReader<R>, tid: ThreadId) -> String {
    reader
        .thread_name(tid)
        .map_or_else(|| format!("thread {}", tid.0), |name| format!("thread {} ({name})", tid.0))
}

/// Collapsed-stack lines, one per distinct stack: `a;b;c bytes`.
fn render_folded<R: io::Read>(
    reader: &CaptureReader<R>,
    report: &HighWaterReport,
    leaks: bool,
    split_threads: bool,
) -> String {
    let mut totals: BTreeMap<String, u64> = BTreeMap::new();
    for row in &report.rows {
        let bytes = if leaks { row.bytes_leaked } else { row.bytes_in_high_water_mark };
        if bytes == 0 {
            continue;
        }
        let mut parts: Vec<String> = Vec::new();
        if split_threads {
            parts.push(thread_label(reader, row.location.tid));
        }
        let frames = reader.resolve_stack(row.location.stack);
        if frames.is_empty() {
            let kind: &'static str = row.location.kind.into();
            parts.push(format!("<{kind}>"));
        } else {
            for frame in frames {
                parts.push(format!("{} ({}:{})", frame.function_name, frame.file_name, frame.line));
            }
        }
        *totals.entry(parts.join(";")).or_insert(0) += bytes;
    }
    let mut rendered = String::new();
    for (stack, bytes) in totals {
        rendered.push_str(&stack);
        rendered.push(' ');
        rendered.push_str(&bytes.to_string());
        rendered.push('\n');
    }
    rendered
}

/// Temporal report as a JSON document for external renderers.
fn render_temporal<R: io::Read>(reader: &CaptureReader<R>, rows: &[TemporalRow]) -> String {
    let rows: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            let kind: &'static str = row.location.kind.into();
            serde_json::json!({
                "thread": thread_label(reader, row.location.tid),
                "allocator": kind,
                "frames": reader.resolve_stack(row.location.stack),
                "intervals": row.intervals,
            })
        })
        .collect();
    let document = serde_json::json!({
        "format": "mneme-temporal",
        "rows": rows,
    });
    serde_json::to_string_pretty(&document).unwrap_or_else(|_| "{}".to_owned())
}
