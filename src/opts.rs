//! Command-line parsing. PgFuse's own surface is small — a
//! connection string, a mountpoint, three flags, and a handful of
//! comma/`-o`-joined mount options — so this follows the same builder-style
//! `clap` usage the `fuser` project's own example binaries use for their
//! FUSE CLIs, rather than reaching for `clap::Parser` derive macros that
//! would be overkill for four options.

use clap::{crate_version, Arg, ArgAction, Command};

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

pub struct Options {
    pub connection_string: String,
    pub mountpoint: String,
    pub verbose: bool,
    pub foreground: bool,
    pub single_threaded: bool,
    pub read_only: bool,
    pub block_size: u32,
}

#[derive(Debug)]
pub enum OptsError {
    /// `-h`/`--help` or `-V`/`--version` were given; the message was
    /// already printed and the caller should exit 0.
    Handled,
    Invalid(String),
}

fn command() -> Command {
    Command::new("pgfuse")
        .version(crate_version!())
        .about("A FUSE filesystem whose entire persistent state lives inside PostgreSQL")
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(Arg::new("help").short('h').long("help").action(ArgAction::SetTrue))
        .arg(Arg::new("version").short('V').long("version").action(ArgAction::SetTrue))
        .arg(Arg::new("verbose").short('v').action(ArgAction::SetTrue))
        .arg(Arg::new("foreground").short('f').action(ArgAction::SetTrue))
        .arg(Arg::new("single-threaded").short('s').action(ArgAction::SetTrue))
        .arg(
            Arg::new("mount-option")
                .short('o')
                .action(ArgAction::Append)
                .value_name("opt[,opt...]"),
        )
        .arg(Arg::new("connection-string").required(false))
        .arg(Arg::new("mountpoint").required(false))
}

/// Parses `-o key=value,key2` lists the way real FUSE CLIs do: each `-o`
/// may carry several comma-separated options.
fn parse_mount_options(raw: &[String], read_only: &mut bool, block_size: &mut u32) -> Result<(), OptsError> {
    for group in raw {
        for opt in group.split(',') {
            let opt = opt.trim();
            if opt.is_empty() {
                continue;
            }
            if opt == "ro" {
                *read_only = true;
            } else if let Some(value) = opt.strip_prefix("blocksize=") {
                *block_size = value
                    .parse()
                    .map_err(|_| OptsError::Invalid(format!("invalid blocksize: {value}")))?;
            }
            // Unrecognized -o options are forwarded to fuser verbatim by
            // the caller; they're never an error at this layer.
        }
    }
    Ok(())
}

pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Options, OptsError> {
    let matches = command()
        .try_get_matches_from(args)
        .map_err(|e| OptsError::Invalid(e.to_string()))?;

    if matches.get_flag("help") {
        println!("{}", command().render_long_help());
        println!("pgfuse additionally forwards unrecognized options to the FUSE bridge.");
        return Err(OptsError::Handled);
    }
    if matches.get_flag("version") {
        println!("pgfuse {}", crate_version!());
        return Err(OptsError::Handled);
    }

    let connection_string = matches
        .get_one::<String>("connection-string")
        .ok_or_else(|| OptsError::Invalid("missing <connection-string>".into()))?
        .clone();
    let mountpoint = matches
        .get_one::<String>("mountpoint")
        .ok_or_else(|| OptsError::Invalid("missing <mountpoint>".into()))?
        .clone();

    let mut read_only = false;
    let mut block_size = DEFAULT_BLOCK_SIZE;
    let mount_opts: Vec<String> = matches
        .get_many::<String>("mount-option")
        .map(|vs| vs.cloned().collect())
        .unwrap_or_default();
    parse_mount_options(&mount_opts, &mut read_only, &mut block_size)?;

    Ok(Options {
        connection_string,
        mountpoint,
        verbose: matches.get_flag("verbose"),
        foreground: matches.get_flag("foreground"),
        single_threaded: matches.get_flag("single-threaded"),
        read_only,
        block_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_positional_args() {
        let opts = parse(args(&["pgfuse", "postgres://localhost/db", "/mnt/pg"])).unwrap();
        assert_eq!(opts.connection_string, "postgres://localhost/db");
        assert_eq!(opts.mountpoint, "/mnt/pg");
        assert_eq!(opts.block_size, DEFAULT_BLOCK_SIZE);
        assert!(!opts.read_only);
        assert!(!opts.verbose);
    }

    #[test]
    fn parses_flags_and_mount_options() {
        let opts = parse(args(&[
            "pgfuse",
            "-v",
            "-f",
            "-s",
            "-o",
            "ro,blocksize=8192",
            "postgres://localhost/db",
            "/mnt/pg",
        ]))
        .unwrap();
        assert!(opts.verbose);
        assert!(opts.foreground);
        assert!(opts.single_threaded);
        assert!(opts.read_only);
        assert_eq!(opts.block_size, 8192);
    }

    #[test]
    fn multiple_o_flags_accumulate() {
        let opts = parse(args(&[
            "pgfuse",
            "-o",
            "ro",
            "-o",
            "blocksize=1024",
            "postgres://localhost/db",
            "/mnt/pg",
        ]))
        .unwrap();
        assert!(opts.read_only);
        assert_eq!(opts.block_size, 1024);
    }

    #[test]
    fn missing_mountpoint_is_invalid() {
        let err = parse(args(&["pgfuse", "postgres://localhost/db"])).unwrap_err();
        assert!(matches!(err, OptsError::Invalid(_)));
    }

    #[test]
    fn help_flag_is_handled() {
        let err = parse(args(&["pgfuse", "--help"])).unwrap_err();
        assert!(matches!(err, OptsError::Handled));
    }

    #[test]
    fn rejects_invalid_blocksize() {
        let err = parse(args(&[
            "pgfuse",
            "-o",
            "blocksize=not-a-number",
            "postgres://localhost/db",
            "/mnt/pg",
        ]))
        .unwrap_err();
        assert!(matches!(err, OptsError::Invalid(_)));
    }
}
