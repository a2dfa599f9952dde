//! `statfs` introspection: resolve the tablespace directories
//! backing PgFuse's own tables, map each to the host mount that contains
//! it, and take the worst-case (minimum) free/available space across all
//! distinct mounts found.

use nix::sys::statvfs::statvfs;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default location of the mount table — the only host-specific path this
/// module consults.
pub const DEFAULT_MTAB: &str = "/etc/mtab";

pub struct MountEntry {
    pub mount_point: PathBuf,
}

/// Reverses the `\040`/`\011`/`\012`/`\134` octal escapes `/etc/mtab` uses
/// for whitespace and backslashes inside a path field.
fn unescape_mtab_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = String::with_capacity(field.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &field[i + 1..i + 4];
            if let Ok(value) = u8::from_str_radix(octal, 8) {
                out.push(value as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Parses an fstab/mtab-format mount table; only the mount point column is
/// kept since that's all `statfs` needs.
pub fn parse_mount_table(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter(|line| !line.trim_start().starts_with('#') && !line.trim().is_empty())
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = fields.next()?;
            Some(MountEntry {
                mount_point: PathBuf::from(unescape_mtab_field(mount_point)),
            })
        })
        .collect()
}

pub fn read_mount_table(path: &Path) -> io::Result<Vec<MountEntry>> {
    let contents = fs::read_to_string(path)?;
    Ok(parse_mount_table(&contents))
}

/// The mount whose directory is the longest prefix of `path`.
pub fn find_mount_for<'a>(path: &Path, mounts: &'a [MountEntry]) -> Option<&'a MountEntry> {
    mounts
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.as_os_str().len())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HostSpace {
    pub free_bytes: u64,
    pub available_bytes: u64,
}

/// Dereferences symlinks and resolves `..`/`.` so tablespace paths compare
/// meaningfully against mount-table entries.
pub fn resolve_tablespace_dir(raw: &str) -> io::Result<PathBuf> {
    fs::canonicalize(raw)
}

/// Across all distinct mounts backing the given tablespace directories,
/// takes the minimum free and available byte counts — the worst case: the
/// first tablespace to exhaust disk space.
pub fn aggregate_free_space(tablespace_dirs: &[String], mtab_path: &Path) -> io::Result<HostSpace> {
    let mounts = read_mount_table(mtab_path)?;

    let mut seen_mount_points: Vec<PathBuf> = Vec::new();
    let mut min_free: Option<u64> = None;
    let mut min_avail: Option<u64> = None;

    for raw in tablespace_dirs {
        let resolved = resolve_tablespace_dir(raw).unwrap_or_else(|_| PathBuf::from(raw));
        let mount = find_mount_for(&resolved, &mounts);
        let probe_path: &Path = mount.map(|m| m.mount_point.as_path()).unwrap_or(&resolved);

        if let Some(mount) = mount {
            if seen_mount_points.contains(&mount.mount_point) {
                continue;
            }
            seen_mount_points.push(mount.mount_point.clone());
        }

        let stat = statvfs(probe_path)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let bsize = stat.fragment_size().max(1);
        let free = stat.blocks_free() * bsize;
        let avail = stat.blocks_available() * bsize;

        min_free = Some(min_free.map_or(free, |m| m.min(free)));
        min_avail = Some(min_avail.map_or(avail, |m| m.min(avail)));
    }

    Ok(HostSpace {
        free_bytes: min_free.unwrap_or(0),
        available_bytes: min_avail.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_mtab_line() {
        let mtab = "/dev/sda1 / ext4 rw,relatime 0 1\n/dev/sda2 /home ext4 rw 0 2\n";
        let mounts = parse_mount_table(mtab);
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].mount_point, PathBuf::from("/"));
        assert_eq!(mounts[1].mount_point, PathBuf::from("/home"));
    }

    #[test]
    fn unescapes_spaces_in_mount_points() {
        let mtab = "/dev/sdb1 /mnt/my\\040drive ext4 rw 0 0\n";
        let mounts = parse_mount_table(mtab);
        assert_eq!(mounts[0].mount_point, PathBuf::from("/mnt/my drive"));
    }

    #[test]
    fn longest_prefix_wins() {
        let mounts = vec![
            MountEntry {
                mount_point: PathBuf::from("/"),
            },
            MountEntry {
                mount_point: PathBuf::from("/var/lib/postgresql"),
            },
        ];
        let found = find_mount_for(Path::new("/var/lib/postgresql/data/base"), &mounts).unwrap();
        assert_eq!(found.mount_point, PathBuf::from("/var/lib/postgresql"));
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let mtab = "# comment\n\n/dev/sda1 / ext4 rw 0 1\n";
        let mounts = parse_mount_table(mtab);
        assert_eq!(mounts.len(), 1);
    }

    #[test]
    fn reads_mount_table_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mtab");
        fs::write(&path, "/dev/sda1 / ext4 rw 0 1\n/dev/sda2 /var/lib/postgresql ext4 rw 0 2\n").unwrap();

        let mounts = read_mount_table(&path).unwrap();
        assert_eq!(mounts.len(), 2);
        let found = find_mount_for(Path::new("/var/lib/postgresql/data"), &mounts).unwrap();
        assert_eq!(found.mount_point, PathBuf::from("/var/lib/postgresql"));
    }
}
