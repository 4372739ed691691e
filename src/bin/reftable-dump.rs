//! Dumps the contents of a reftable file or a stack of them.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use reftable::{
    FileBlockSource, HashId, LogRecord, Merged, Reader, RefRecord, Result, Table,
};

#[derive(Debug, Parser)]
#[command(name = "reftable-dump")]
#[command(about = "Dump reftable files", long_about = None)]
struct Cli {
    /// Dump a single reftable file.
    #[arg(long)]
    table: Option<PathBuf>,

    /// Dump a merged stack from a reftable directory.
    #[arg(long)]
    stack: Option<PathBuf>,
}

fn open_reader(path: &PathBuf) -> Result<Reader> {
    let src = FileBlockSource::open(path).map_err(reftable::Error::from)?;
    Reader::new(Box::new(src), &path.display().to_string())
}

fn dump_table(tab: &dyn Table) -> Result<()> {
    let mut it = tab.seek_ref("")?;
    let mut rec = RefRecord::default();
    while it.next(&mut rec)? {
        println!("{rec:?}");
    }

    println!("** LOGS **");

    let mut it = tab.seek_log("", u64::MAX)?;
    let mut log = LogRecord::default();
    while it.next(&mut log)? {
        println!("{log:?}");
    }
    Ok(())
}

fn dump_table_file(path: &PathBuf) -> Result<()> {
    let reader = open_reader(path)?;
    dump_table(&reader)
}

fn dump_stack(dir: &PathBuf) -> Result<()> {
    let list = std::fs::read_to_string(dir.join("tables.list"))
        .map_err(reftable::Error::from)?;

    let mut tabs = Vec::new();
    let mut hash_id = HashId::SHA1;
    for name in list.lines().filter(|l| !l.is_empty()) {
        let reader = open_reader(&dir.join(name))?;
        hash_id = reader.hash_id();
        tabs.push(Arc::new(reader));
    }

    let merged = Merged::new(tabs, hash_id);
    dump_table(&merged)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(table) = &cli.table {
        if let Err(e) = dump_table_file(table) {
            eprintln!("reftable-dump: {}: {e}", table.display());
            return ExitCode::FAILURE;
        }
    }

    if let Some(stack) = &cli.stack {
        if let Err(e) = dump_stack(stack) {
            eprintln!("reftable-dump: {}: {e}", stack.display());
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
