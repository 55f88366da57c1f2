#![allow(dead_code)]

use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use rustyline::DefaultEditor;
use serengeti_core::compact::{CompactionOptions, LeveledCompactionOptions};
use serengeti_core::config::EngineConfig;
use serengeti_core::db::Database;
use serengeti_core::iterators::StorageIterator;
use serengeti_core::lsm_storage::{LsmStorageOptions, MiniLsm};
use serengeti_core::query::executor::execute;
use serengeti_core::wal::SyncMode;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, ValueEnum)]
enum CompactionStrategy {
    Leveled,
    None,
}

/// Raw key/value commands run directly against the `MiniLsm` engine;
/// anything that isn't one of these and starts with a SQL keyword is
/// routed to the query executor instead (see `main`'s dispatch).
#[derive(Debug)]
enum Command {
    Init { begin: u64, end: u64 },
    Put { key: String, value: String },
    Del { key: String },
    Get { key: String },
    Scan { lower: Option<String>, upper: Option<String> },
    Flush,
    Compact,
    Dump,
    Quit,
}

impl Command {
    pub fn parse(input: &str) -> Result<Self> {
        use nom::branch::*;
        use nom::bytes::complete::*;
        use nom::character::complete::*;
        use nom::combinator::*;
        use nom::sequence::*;

        let uint = |i| {
            map_res(digit1::<&str, nom::error::Error<_>>, |s: &str| {
                s.parse().map_err(|_| nom::error::Error::new(s, nom::error::ErrorKind::Digit))
            })(i)
        };

        let string = |i| map(take_till1(|c: char| c.is_whitespace()), |s: &str| s.to_string())(i);

        let init = |i| {
            map(tuple((tag_no_case("init"), space1, uint, space1, uint)), |(_, _, begin, _, end)| {
                Command::Init { begin, end }
            })(i)
        };
        let put = |i| {
            map(tuple((tag_no_case("put"), space1, string, space1, string)), |(_, _, key, _, value)| {
                Command::Put { key, value }
            })(i)
        };
        let del = |i| map(tuple((tag_no_case("del"), space1, string)), |(_, _, key)| Command::Del { key })(i);
        let get = |i| map(tuple((tag_no_case("get"), space1, string)), |(_, _, key)| Command::Get { key })(i);
        let scan = |i| {
            map(
                tuple((tag_no_case("scan"), opt(tuple((space1, string, space1, string))))),
                |(_, opt_args)| {
                    let (lower, upper) = opt_args.map_or((None, None), |(_, lower, _, upper)| (Some(lower), Some(upper)));
                    Command::Scan { lower, upper }
                },
            )(i)
        };

        let command = |i| {
            alt((
                init,
                put,
                del,
                get,
                scan,
                map(tag_no_case("flush"), |_| Command::Flush),
                map(tag_no_case("compact"), |_| Command::Compact),
                map(tag_no_case("dump"), |_| Command::Dump),
                map(alt((tag_no_case("quit"), tag_no_case("exit"))), |_| Command::Quit),
            ))(i)
        };

        command(input).map(|(_, c)| c).map_err(|e| anyhow::anyhow!("{}", e))
    }
}

const SQL_KEYWORDS: &[&str] =
    &["select", "insert", "update", "delete", "create", "drop", "show", "explain"];

fn looks_like_sql(input: &str) -> bool {
    let first = input.split_whitespace().next().unwrap_or("").to_ascii_lowercase();
    SQL_KEYWORDS.contains(&first.as_str())
}

fn handle_raw(lsm: &Arc<MiniLsm>, command: &Command) -> Result<()> {
    match command {
        Command::Init { begin, end } => {
            let mut count = 0;
            for i in *begin..=*end {
                let key = format!("{i}");
                let value = format!("value{i}");
                lsm.put(key.as_bytes(), value.as_bytes())?;
                count += 1;
            }
            println!("{count} values filled");
        }
        Command::Put { key, value } => {
            lsm.put(key.as_bytes(), value.as_bytes())?;
            println!("{key}={value}");
        }
        Command::Del { key } => {
            lsm.delete(key.as_bytes())?;
            println!("{key} deleted");
        }
        Command::Get { key } => match lsm.get(key.as_bytes())? {
            Some(value) => println!("{key}={:?}", Bytes::copy_from_slice(&value)),
            None => println!("{key} not found"),
        },
        Command::Scan { lower, upper } => {
            let (lo, hi) = match (lower, upper) {
                (Some(l), Some(u)) => (std::ops::Bound::Included(l.as_bytes()), std::ops::Bound::Included(u.as_bytes())),
                _ => (std::ops::Bound::Unbounded, std::ops::Bound::Unbounded),
            };
            let mut iter = lsm.scan(lo, hi)?;
            let mut count = 0;
            while iter.is_valid() {
                println!("{:?}={:?}", Bytes::copy_from_slice(iter.key()), Bytes::copy_from_slice(iter.value()));
                iter.next()?;
                count += 1;
            }
            println!("{count} keys scanned");
        }
        Command::Flush => {
            lsm.force_flush()?;
            println!("flushed");
        }
        Command::Compact => {
            lsm.force_compact()?;
            println!("compacted");
        }
        Command::Dump => println!("{lsm:#?}"),
        Command::Quit => {}
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "lsm.db")]
    path: PathBuf,
    #[arg(long, default_value = "leveled")]
    compaction: CompactionStrategy,
    #[arg(long)]
    enable_wal: bool,
    /// Database name used for SQL statements (addressed as `<database>.<table>`).
    #[arg(long, default_value = "default")]
    database: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let lsm = MiniLsm::open(
        &args.path,
        LsmStorageOptions {
            block_size: 4096,
            target_sst_size: 2 << 20,
            max_memtable_limit: 3,
            compaction_options: match args.compaction {
                CompactionStrategy::None => CompactionOptions::NoCompaction,
                CompactionStrategy::Leveled => CompactionOptions::Leveled(LeveledCompactionOptions {
                    level0_files_num_compaction_threshold: 2,
                    max_levels: 4,
                    base_level_size_mb: 128,
                    level_size_multiplier: 2,
                }),
            },
            enable_wal: args.enable_wal,
            wal_sync_mode: SyncMode::Sync,
            cache: Default::default(),
        },
    )?;

    let db = Database::open(args.path.join("sql"), &args.database, &EngineConfig::default())?;

    let mut editor = DefaultEditor::new()?;
    println!("serengeti-cli: raw commands (put/get/del/scan/init/flush/compact/dump) plus SQL against '{}'", args.database);
    loop {
        let line = match editor.readline("serengeti-cli> ") {
            Ok(line) => line,
            Err(_) => break,
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        if looks_like_sql(input) {
            let response = execute(input, &db);
            if !response.executed {
                println!("error: {}", response.error.unwrap_or_default());
            } else if let Some(list) = response.list {
                println!("{}", serde_json::to_string_pretty(&list)?);
                println!("({} row(s))", list.len());
            } else {
                println!("ok");
            }
            continue;
        }

        match Command::parse(input) {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(e) = handle_raw(&lsm, &command) {
                    println!("error: {e:?}");
                }
            }
            Err(e) => println!("parse error: {e}"),
        }
    }

    lsm.close()?;
    Ok(())
}
