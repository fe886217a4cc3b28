//! Purpose: Hold top-level CLI command dispatch for `tablestream`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: `dump` and `page` print exactly the lines the HTTP routes would stream.

use super::*;

use tablestream::core::export::{
    INVALID_PAGE_MESSAGE, count_records, dump_lines, export_page, prepare_dump, validate_page,
};
use tablestream::core::store::{Store, StoreConfig};
use tablestream::core::table::TableName;
use tablestream::core::writer::ChunkWriter;
use tracing::debug;

pub(super) fn dispatch_command(
    command: Command,
    database: PathBuf,
    table: String,
) -> Result<RunOutcome, Error> {
    let store_config = StoreConfig::new(database);
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "tablestream", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Serve(args) => {
            let config = serve::ServeConfig {
                bind: parse_bind(&args.bind)?,
                allow_non_loopback: args.allow_non_loopback,
                store: store_config.with_max_idle(args.max_idle_connections),
                table: TableName::new(table)?,
                chunks_dir: args.chunks_dir,
                paginated_dir: args.paginated_dir,
                dump: args.limit.options(args.dump_chunk_size),
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
        Command::Dump {
            chunk_size,
            chunks_dir,
            limit,
        } => {
            let table = TableName::new(table)?;
            let options = limit.options(chunk_size);
            if options.chunk_size == 0 {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("--chunk-size must be greater than zero")
                    .with_hint("Use a positive value like 1000."));
            }
            if options.limit == Some(0) {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("--dump-limit must be greater than zero")
                    .with_hint("Use --no-dump-limit to export the whole table."));
            }
            serve::init_tracing();
            let store = Store::open(store_config)?;
            let writer = ChunkWriter::new(chunks_dir);
            let result = write_dump(&store, &table, options, &writer);
            store.close();
            result?;
            Ok(RunOutcome::ok())
        }
        Command::Page {
            page,
            chunk_size,
            paginated_dir,
        } => {
            let table = TableName::new(table)?;
            let (page, chunk_size) = match (u64::try_from(page), u64::try_from(chunk_size)) {
                (Ok(page), Ok(chunk_size)) => (page, chunk_size),
                _ => return Err(Error::new(ErrorKind::Usage).with_message(INVALID_PAGE_MESSAGE)),
            };
            validate_page(page, chunk_size)?;
            serve::init_tracing();
            let store = Store::open(store_config)?;
            let writer = ChunkWriter::new(paginated_dir);
            let line = {
                let conn = store.connect()?;
                export_page(&conn, &table, page, chunk_size, &writer)?
            };
            store.close();
            emit_line(&mut io::stdout().lock(), &line)?;
            Ok(RunOutcome::ok())
        }
        Command::Count => {
            let table = TableName::new(table)?;
            let store = Store::open(store_config)?;
            let total = {
                let conn = store.connect()?;
                count_records(&conn, &table)?
            };
            store.close();
            emit_json(json!({ "total_records": total }))?;
            Ok(RunOutcome::ok())
        }
    }
}

fn write_dump(
    store: &Store,
    table: &TableName,
    options: DumpOptions,
    writer: &ChunkWriter,
) -> Result<(), Error> {
    let conn = store.connect()?;
    let mut stmt = prepare_dump(&conn, table)?;
    let lines = dump_lines(&mut stmt, options, writer)?;
    let mut out = io::stdout().lock();
    for line in lines {
        if !emit_line(&mut out, &line?)? {
            debug!("stdout closed; stopping dump");
            break;
        }
    }
    Ok(())
}
