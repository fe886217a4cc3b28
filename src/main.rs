//! Purpose: `tablestream` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON lines on stdout.
//! Invariants: Data lines go to stdout; logs and errors go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
use std::error::Error as StdError;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};

mod command_dispatch;
mod serve;

use command_dispatch::dispatch_command;
use tablestream::core::error::{Error, ErrorKind, to_exit_code};
use tablestream::core::export::{
    DEFAULT_DUMP_CHUNK_SIZE, DEFAULT_DUMP_LIMIT, DEFAULT_PAGE_CHUNK_SIZE, DumpOptions,
};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `tablestream --help` for usage."));
            }
        },
    };

    dispatch_command(cli.command, cli.database, cli.table)
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .next()
        .unwrap_or("invalid arguments")
        .trim_start_matches("error: ")
        .to_string()
}

#[derive(Parser)]
#[command(
    name = "tablestream",
    version,
    about = "Stream a SQLite table as chunked newline-delimited JSON",
    long_about = None,
    after_help = r#"EXAMPLES
  $ tablestream --database database/bulk.db serve
  $ curl http://127.0.0.1:8000/bulk-data
  $ curl 'http://127.0.0.1:8000/bulk-data-paginated?page=2&chunk_size=50'
  $ curl http://127.0.0.1:8000/count-records
  $ tablestream dump --chunk-size 500 > dump.jsonl
  $ tablestream page --page 3 --chunk-size 100"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "TABLESTREAM_DATABASE",
        default_value = "database/bulk.db",
        help = "SQLite database file",
        value_hint = ValueHint::FilePath
    )]
    database: PathBuf,
    #[arg(
        long,
        global = true,
        env = "TABLESTREAM_TABLE",
        default_value = "large_table",
        help = "Table to export"
    )]
    table: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Serve the table over HTTP",
        after_help = r#"ROUTES
  GET /bulk-data                              all rows as JSON array lines
  GET /bulk-data-paginated?page=&chunk_size=  one page as a single line
  GET /count-records                          {"total_records": n}
  GET /healthz                                {"ok": true}

NOTES
  - Every streamed chunk is also written to <chunks-dir>/part_<n>.json
  - Each page overwrites <paginated-dir>/part_1.json
  - Full dumps stop at --dump-limit rows unless --no-dump-limit is set"#
    )]
    Serve(ServeArgs),
    #[command(about = "Write the full dump to stdout, one chunk per line")]
    Dump {
        #[arg(
            long,
            default_value_t = DEFAULT_DUMP_CHUNK_SIZE,
            help = "Rows per chunk"
        )]
        chunk_size: usize,
        #[arg(
            long,
            default_value = "chunks",
            help = "Directory for part_<n>.json files",
            value_hint = ValueHint::DirPath
        )]
        chunks_dir: PathBuf,
        #[command(flatten)]
        limit: DumpLimitArgs,
    },
    #[command(about = "Write one page to stdout as a single line")]
    Page {
        #[arg(long, default_value_t = 1, allow_negative_numbers = true, help = "Page number (1-based)")]
        page: i64,
        #[arg(
            long,
            default_value_t = DEFAULT_PAGE_CHUNK_SIZE as i64,
            allow_negative_numbers = true,
            help = "Rows per page"
        )]
        chunk_size: i64,
        #[arg(
            long,
            default_value = "chunks_paginated",
            help = "Directory for part_1.json",
            value_hint = ValueHint::DirPath
        )]
        paginated_dir: PathBuf,
    },
    #[command(about = "Print the number of rows in the table")]
    Count,
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(
        long,
        default_value = "127.0.0.1:8000",
        help = "Bind address",
        help_heading = "Connection"
    )]
    bind: String,
    #[arg(
        long,
        help = "Allow non-loopback binds",
        help_heading = "Connection"
    )]
    allow_non_loopback: bool,
    #[arg(
        long,
        default_value_t = 4,
        help = "Idle database connections kept for reuse",
        help_heading = "Connection"
    )]
    max_idle_connections: usize,
    #[arg(
        long,
        default_value = "chunks",
        help = "Directory for full-dump part_<n>.json files",
        value_hint = ValueHint::DirPath,
        help_heading = "Export"
    )]
    chunks_dir: PathBuf,
    #[arg(
        long,
        default_value = "chunks_paginated",
        help = "Directory for the paginated part_1.json file",
        value_hint = ValueHint::DirPath,
        help_heading = "Export"
    )]
    paginated_dir: PathBuf,
    #[arg(
        long,
        default_value_t = DEFAULT_DUMP_CHUNK_SIZE,
        help = "Rows per chunk on /bulk-data",
        help_heading = "Export"
    )]
    dump_chunk_size: usize,
    #[command(flatten)]
    limit: DumpLimitArgs,
}

#[derive(Args)]
struct DumpLimitArgs {
    #[arg(
        long,
        default_value_t = DEFAULT_DUMP_LIMIT,
        help = "Maximum rows returned by a full dump",
        help_heading = "Export"
    )]
    dump_limit: u64,
    #[arg(
        long,
        conflicts_with = "dump_limit",
        help = "Export every row on a full dump",
        help_heading = "Export"
    )]
    no_dump_limit: bool,
}

impl DumpLimitArgs {
    fn options(&self, chunk_size: usize) -> DumpOptions {
        DumpOptions {
            chunk_size,
            limit: (!self.no_dump_limit).then_some(self.dump_limit),
        }
    }
}

fn parse_bind(bind: &str) -> Result<SocketAddr, Error> {
    bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:8000.")
    })
}

/// Writes one line to stdout; `Ok(false)` means the reader went away.
fn emit_line(out: &mut impl Write, line: &str) -> Result<bool, Error> {
    match out.write_all(line.as_bytes()).and_then(|()| out.flush()) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(false),
        Err(err) => Err(Error::new(ErrorKind::Io)
            .with_message("failed to write to stdout")
            .with_source(err)),
    }
}

fn emit_json(value: Value) -> Result<(), Error> {
    let mut line = value.to_string();
    line.push('\n');
    emit_line(&mut io::stdout().lock(), &line).map(|_| ())
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Store => "store unavailable".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(path) = err.path() {
        lines.push(format!("  path: {}", path.display()));
    }
    for cause in error_causes(err) {
        lines.push(format!("  caused by: {cause}"));
    }
    if let Some(hint) = err.hint() {
        lines.push(format!("  hint: {hint}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, emit_line, error_json, parse_bind};
    use clap::Parser;
    use tablestream::core::error::{Error, ErrorKind};

    #[test]
    fn dump_limit_flags_resolve_to_options() {
        let cli = Cli::try_parse_from(["tablestream", "dump", "--chunk-size", "5"]).expect("parse");
        let Command::Dump { chunk_size, limit, .. } = cli.command else {
            panic!("expected dump");
        };
        let options = limit.options(chunk_size);
        assert_eq!(options.chunk_size, 5);
        assert_eq!(options.limit, Some(10_000));

        let cli = Cli::try_parse_from(["tablestream", "dump", "--no-dump-limit"]).expect("parse");
        let Command::Dump { chunk_size, limit, .. } = cli.command else {
            panic!("expected dump");
        };
        assert_eq!(limit.options(chunk_size).limit, None);
    }

    #[test]
    fn page_accepts_negative_numbers_for_validation() {
        let cli = Cli::try_parse_from(["tablestream", "page", "--page", "-1"]).expect("parse");
        let Command::Page { page, chunk_size, .. } = cli.command else {
            panic!("expected page");
        };
        assert_eq!((page, chunk_size), (-1, 100));
    }

    #[test]
    fn global_options_have_defaults() {
        let cli = Cli::try_parse_from(["tablestream", "count"]).expect("parse");
        assert_eq!(cli.table, "large_table");
        assert!(cli.database.ends_with("bulk.db"));
    }

    #[test]
    fn invalid_bind_is_usage_error() {
        let err = parse_bind("localhost").expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Usage);
        parse_bind("127.0.0.1:8000").expect("valid");
    }

    #[test]
    fn emit_line_writes_and_flushes() {
        let mut out = Vec::new();
        assert!(emit_line(&mut out, "[1]\n").expect("write"));
        assert_eq!(out, b"[1]\n");
    }

    #[test]
    fn error_json_includes_hint_and_causes() {
        let err = Error::new(ErrorKind::Store)
            .with_message("failed to open database")
            .with_hint("check the path")
            .with_source(std::io::Error::other("no such file"));
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Store");
        assert_eq!(value["error"]["hint"], "check the path");
        assert_eq!(value["error"]["causes"][0], "no such file");
    }
}
