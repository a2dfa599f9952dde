//! PgFuse entry point: parse the CLI, stand up logging, make sure the
//! database is reachable and has its schema, then hand a [`fs::PgFuse`] to
//! `fuser`'s mount loop.
//!
//! Exit codes: 0 on a clean unmount, 1 if the startup
//! database checks fail, 2 on a CLI/argument error.

mod dal;
mod error;
mod fs;
mod opts;
mod pool;
mod schema;
mod statfs;
mod txn;

use std::process::ExitCode;

use log::{error, info, LevelFilter};
use postgres::NoTls;

use error::PgfuseError;
use opts::{Options, OptsError};

const EXIT_OK: u8 = 0;
const EXIT_DB_CHECK_FAILED: u8 = 1;
const EXIT_ARGS: u8 = 2;

/// PgFuse logs to syslog only — the one exception is a CLI
/// argument error, which is reported on stderr before any logger exists.
fn init_logging(verbose: bool) {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process: "pgfuse".into(),
        pid: std::process::id() as i32,
    };
    match syslog::unix(formatter) {
        Ok(writer) => {
            let logger = syslog::BasicLogger::new(writer);
            if let Err(e) = log::set_boxed_logger(Box::new(logger)) {
                eprintln!("pgfuse: failed to install syslog logger: {e}");
            } else {
                log::set_max_level(level);
            }
        }
        Err(e) => {
            eprintln!("pgfuse: could not connect to syslog, logging disabled: {e}");
        }
    }
}

/// Startup preconditions: the database is reachable, its
/// datetimes are 64-bit integers (the only encoding `postgres-types`'
/// `SystemTime` impl supports), and the schema exists with a block size
/// matching this invocation.
fn check_database(opts: &Options) -> Result<(), PgfuseError> {
    let mut client = postgres::Client::connect(&opts.connection_string, NoTls)?;
    schema::check_integer_datetimes(&mut client)?;
    schema::ensure_schema(&mut client, opts.block_size)?;
    Ok(())
}

fn mount_options(opts: &Options) -> Vec<fuser::MountOption> {
    use fuser::MountOption::*;
    vec![
        FSName("pgfuse".to_string()),
        AutoUnmount,
        if opts.read_only { RO } else { RW },
    ]
}

fn run(opts: Options) -> Result<(), PgfuseError> {
    check_database(&opts)?;

    let capacity = if opts.single_threaded { 1 } else { pool::MAX_DB_CONNECTIONS };
    let pool = pool::Pool::new(&opts.connection_string, capacity)?;
    let filesystem = fs::PgFuse::new(pool, opts.block_size, opts.read_only);

    info!(
        "mounting {} at {} (block_size={}, read_only={}, single_threaded={}, foreground={})",
        opts.connection_string,
        opts.mountpoint,
        opts.block_size,
        opts.read_only,
        opts.single_threaded,
        opts.foreground
    );

    let mount_opts = mount_options(&opts);
    fuser::mount2(filesystem, &opts.mountpoint, &mount_opts).map_err(|e| PgfuseError::Io(e.to_string()))
}

fn main() -> ExitCode {
    let opts = match opts::parse(std::env::args()) {
        Ok(opts) => opts,
        Err(OptsError::Handled) => return ExitCode::from(EXIT_OK),
        Err(OptsError::Invalid(msg)) => {
            eprintln!("pgfuse: {msg}");
            return ExitCode::from(EXIT_ARGS);
        }
    };

    init_logging(opts.verbose);

    match run(opts) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            error!("{e}");
            ExitCode::from(EXIT_DB_CHECK_FAILED)
        }
    }
}
