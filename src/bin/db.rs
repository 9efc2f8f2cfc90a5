use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};
use rusqlite::Connection;
use std::{path::PathBuf, process::ExitCode};

use cgsup::{
    cli::{init_logging, LogLevel},
    schema::{self, LogRecord, SchemaVariant},
    CgsupError, DEFAULT_DATABASE,
};

#[derive(Parser, Debug)]
#[command(version, about = "Manages the local log of processed messages")]
struct Args {
    #[arg(short, long, env = "CGSUP_DATABASE", default_value = DEFAULT_DATABASE)]
    database: PathBuf,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Creates the messages table unless it already exists.
    Init {
        #[arg(long, value_enum, default_value_t = Variant::WithQuotes)]
        variant: Variant,
    },
    /// Prints the most recent messages, newest first.
    Tail {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Variant {
    Basic,
    WithQuotes,
}

impl From<Variant> for SchemaVariant {
    fn from(value: Variant) -> Self {
        match value {
            Variant::Basic => SchemaVariant::Basic,
            Variant::WithQuotes => SchemaVariant::WithQuotes,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_level);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), CgsupError> {
    let conn = Connection::open(&args.database)?;

    match args.command {
        Command::Init { variant } => {
            schema::ensure_table(&conn, variant.into())?;
            if let Some(existing) = schema::detect_variant(&conn)? {
                if existing != SchemaVariant::from(variant) {
                    info!("{} keeps its existing {:?} layout", args.database.display(), existing);
                }
            }
        }
        Command::Tail { limit } => {
            for record in schema::recent(&conn, limit)? {
                println!("{}", Line(&record));
            }
        }
    }

    Ok(())
}

struct Line<'r>(&'r LogRecord);

impl core::fmt::Display for Line<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let record = self.0;
        let sender = record
            .source_name
            .as_deref()
            .or(record.source.as_deref())
            .unwrap_or("?");

        write!(
            f,
            "#{} {} [{}] {}: {}",
            record.id.unwrap_or_default(),
            record.timestamp.unwrap_or_default(),
            record.group_name.as_deref().unwrap_or("-"),
            sender,
            record.message.as_deref().unwrap_or("")
        )?;

        if let Some(quote) = record.quote_text.as_deref() {
            write!(f, " (re: {:?})", quote)?;
        }
        if let Some(paths) = record.attachment_paths.as_deref().filter(|paths| !paths.is_empty() && *paths != "[]") {
            write!(f, " attachments={}", paths)?;
        }

        Ok(())
    }
}
