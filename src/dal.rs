//! Database Access Layer — the only module that knows SQL text. Every
//! function here takes the in-flight `Transaction` the envelope opened for
//! the current handler call and returns the small error taxonomy in
//! `error.rs`.

use crate::error::{PgfuseError, Result};
use postgres::Transaction;
use std::time::SystemTime;

pub const ROOT_ID: i64 = 0;

/// POSIX mode file-type bits.
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
const S_IFMT: u32 = 0o170000;

pub fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub fn is_symlink(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// In-memory mirror of a `dir` row, minus the bookkeeping columns
/// (`id`/`parent_id`/`name`/`path`) that callers already have on hand from
/// whatever looked the inode up in the first place.
#[derive(Clone, Debug)]
pub struct Meta {
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub ctime: SystemTime,
    pub mtime: SystemTime,
    pub atime: SystemTime,
}

pub struct DirEntry {
    pub id: i64,
    pub name: String,
    pub mode: u32,
}

fn row_to_meta(row: &postgres::Row) -> Meta {
    Meta {
        size: row.get::<_, i64>("size") as u64,
        mode: row.get::<_, i32>("mode") as u32,
        uid: row.get::<_, i32>("uid") as u32,
        gid: row.get::<_, i32>("gid") as u32,
        ctime: row.get("ctime"),
        mtime: row.get("mtime"),
        atime: row.get("atime"),
    }
}

/// Splits an absolute path into its components, skipping the leading `/`.
/// `"/"` itself yields an empty component list (the root).
fn split_path(path: &str) -> Vec<&str> {
    path.trim_start_matches('/')
        .split('/')
        .filter(|c| !c.is_empty())
        .collect()
}

/// Resolves an absolute path to `(id, meta)` by descending from the root,
/// looking up each component in `dir` by `(parent_id, name)`. This is the
/// authoritative lookup; the denormalized `path` column exists for cheap
/// existence probes elsewhere, but tree descent is what callers get here.
pub fn read_meta_from_path(tx: &mut Transaction<'_>, path: &str) -> Result<(i64, Meta)> {
    let mut id = ROOT_ID;
    for component in split_path(path) {
        let row = tx.query_opt(
            "select id from dir where parent_id = $1 and name = $2 and id <> parent_id",
            &[&id, &component],
        )?;
        match row {
            Some(row) => id = row.get(0),
            None => return Err(PgfuseError::NotFound),
        }
    }
    let meta = read_meta(tx, id)?;
    Ok((id, meta))
}

/// Looks up a single child of `parent_id` by name — the building block
/// `read_meta_from_path` folds over for every path component, and what
/// `lookup()` calls directly since `fuser` already hands handlers a
/// resolved parent inode.
pub fn lookup_child(tx: &mut Transaction<'_>, parent_id: i64, name: &str) -> Result<(i64, Meta)> {
    let row = tx.query_opt(
        "select id, size, mode, uid, gid, ctime, mtime, atime from dir \
         where parent_id = $1 and name = $2 and id <> parent_id",
        &[&parent_id, &name],
    )?;
    match row {
        Some(row) => Ok((row.get(0), row_to_meta(&row))),
        None => Err(PgfuseError::NotFound),
    }
}

/// The denormalized `path` column for `id`.
pub fn path_of(tx: &mut Transaction<'_>, id: i64) -> Result<String> {
    let row = tx
        .query_opt("select path from dir where id = $1", &[&id])?
        .ok_or(PgfuseError::NotFound)?;
    Ok(row.get(0))
}

/// Joins a parent's absolute path with a child name, avoiding a doubled `/`
/// when the parent is the root.
pub fn join_path(parent_path: &str, name: &str) -> String {
    if parent_path == "/" {
        format!("/{name}")
    } else {
        format!("{parent_path}/{name}")
    }
}

/// `path` is advisory only — useful in error messages, never consulted for
/// correctness.
pub fn read_meta(tx: &mut Transaction<'_>, id: i64) -> Result<Meta> {
    let row = tx
        .query_opt(
            "select size, mode, uid, gid, ctime, mtime, atime from dir where id = $1",
            &[&id],
        )?
        .ok_or(PgfuseError::NotFound)?;
    Ok(row_to_meta(&row))
}

pub fn write_meta(tx: &mut Transaction<'_>, id: i64, meta: &Meta) -> Result<()> {
    let n = tx.execute(
        "update dir set size = $1, mode = $2, uid = $3, gid = $4, ctime = $5, mtime = $6, atime = $7 \
         where id = $8",
        &[
            &(meta.size as i64),
            &(meta.mode as i32),
            &(meta.uid as i32),
            &(meta.gid as i32),
            &meta.ctime,
            &meta.mtime,
            &meta.atime,
            &id,
        ],
    )?;
    if n == 0 {
        return Err(PgfuseError::NotFound);
    }
    Ok(())
}

/// All children of `id`, excluding the self-referential root.
pub fn readdir(tx: &mut Transaction<'_>, id: i64) -> Result<Vec<DirEntry>> {
    let rows = tx.query(
        "select id, name, mode from dir where parent_id = $1 and id <> parent_id",
        &[&id],
    )?;
    Ok(rows
        .into_iter()
        .map(|row| DirEntry {
            id: row.get(0),
            name: row.get(1),
            mode: row.get::<_, i32>(2) as u32,
        })
        .collect())
}

fn next_id(tx: &mut Transaction<'_>) -> Result<i64> {
    let row = tx.query_one("select nextval('dir_id_seq')", &[])?;
    Ok(row.get(0))
}

fn insert_inode(
    tx: &mut Transaction<'_>,
    parent_id: i64,
    path: &str,
    name: &str,
    meta: &Meta,
) -> Result<i64> {
    let id = next_id(tx)?;
    tx.execute(
        "insert into dir (id, parent_id, name, path, size, mode, uid, gid, ctime, mtime, atime) \
         values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        &[
            &id,
            &parent_id,
            &name,
            &path,
            &(meta.size as i64),
            &(meta.mode as i32),
            &(meta.uid as i32),
            &(meta.gid as i32),
            &meta.ctime,
            &meta.mtime,
            &meta.atime,
        ],
    )?;
    Ok(id)
}

/// Materializes the first (possibly empty) data block for a non-directory
/// inode. Every non-directory `dir` row has at least one `data` row at
/// `block_no = 0` from creation time.
fn insert_first_block(tx: &mut Transaction<'_>, id: i64, block: &[u8]) -> Result<()> {
    tx.execute(
        "insert into data (dir_id, block_no, data) values ($1, 0, $2)",
        &[&id, &block],
    )?;
    Ok(())
}

pub fn create_file(
    tx: &mut Transaction<'_>,
    parent_id: i64,
    path: &str,
    name: &str,
    meta: &Meta,
) -> Result<i64> {
    let id = insert_inode(tx, parent_id, path, name, meta)?;
    insert_first_block(tx, id, &[])?;
    Ok(id)
}

pub fn create_dir(
    tx: &mut Transaction<'_>,
    parent_id: i64,
    path: &str,
    name: &str,
    meta: &Meta,
) -> Result<i64> {
    insert_inode(tx, parent_id, path, name, meta)
}

/// Creates a symlink inode whose content is the link target; `meta.size`
/// must already equal `target.len()`.
pub fn create_symlink(
    tx: &mut Transaction<'_>,
    parent_id: i64,
    path: &str,
    name: &str,
    meta: &Meta,
    target: &str,
) -> Result<i64> {
    let id = insert_inode(tx, parent_id, path, name, meta)?;
    insert_first_block(tx, id, target.as_bytes())?;
    Ok(id)
}

/// Reads a symlink/regular-file inode's full content (used by `readlink`).
pub fn read_all(tx: &mut Transaction<'_>, block_size: u32, id: i64, size: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    let n = read_buf(tx, block_size, id, &mut buf, 0, size as u32)?;
    buf.truncate(n);
    Ok(buf)
}

pub fn delete_file(tx: &mut Transaction<'_>, id: i64) -> Result<()> {
    let row = tx
        .query_opt("select mode from dir where id = $1", &[&id])?
        .ok_or(PgfuseError::NotFound)?;
    let mode: i32 = row.get(0);
    if is_dir(mode as u32) {
        return Err(PgfuseError::IsDirectory);
    }
    // `data` rows cascade via the foreign key's ON DELETE CASCADE.
    tx.execute("delete from dir where id = $1", &[&id])?;
    Ok(())
}

pub fn delete_dir(tx: &mut Transaction<'_>, id: i64) -> Result<()> {
    let row = tx
        .query_opt("select mode from dir where id = $1", &[&id])?
        .ok_or(PgfuseError::NotFound)?;
    let mode: i32 = row.get(0);
    if !is_dir(mode as u32) {
        return Err(PgfuseError::NotDirectory);
    }
    let has_child = tx
        .query_opt(
            "select 1 from dir where parent_id = $1 and id <> parent_id limit 1",
            &[&id],
        )?
        .is_some();
    if has_child {
        return Err(PgfuseError::NotEmpty);
    }
    tx.execute("delete from dir where id = $1", &[&id])?;
    Ok(())
}

fn ceil_div(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

/// Reads `size` bytes starting at `offset`, masking sparse/absent blocks and
/// any tail past the file's declared length with zeros. Returns
/// the number of bytes actually placed into `buf` — fewer than `size` only
/// when the read runs past end-of-file.
pub fn read_buf(
    tx: &mut Transaction<'_>,
    block_size: u32,
    id: i64,
    buf: &mut [u8],
    offset: u64,
    size: u32,
) -> Result<usize> {
    let file_size: i64 = tx
        .query_opt("select size from dir where id = $1", &[&id])?
        .ok_or(PgfuseError::NotFound)?
        .get(0);
    let file_size = file_size as u64;

    if offset >= file_size {
        return Ok(0);
    }
    let want = std::cmp::min(size as u64, file_size - offset) as usize;
    let block_size = block_size as u64;

    let first_block = offset / block_size;
    let last_block = (offset + want as u64 - 1) / block_size;

    let rows = tx.query(
        "select block_no, data from data where dir_id = $1 and block_no >= $2 and block_no <= $3",
        &[&id, &(first_block as i64), &(last_block as i64)],
    )?;
    let mut by_block = std::collections::HashMap::new();
    for row in rows {
        let block_no: i64 = row.get(0);
        let data: Vec<u8> = row.get(1);
        by_block.insert(block_no as u64, data);
    }

    let mut written = 0usize;
    for block_no in first_block..=last_block {
        let block_start = block_no * block_size;
        let in_block_start = if block_no == first_block {
            (offset - block_start) as usize
        } else {
            0
        };
        let remaining = want - written;
        let in_block_len = std::cmp::min(block_size as usize - in_block_start, remaining);

        if let Some(data) = by_block.get(&block_no) {
            let available = data.len().saturating_sub(in_block_start);
            let copy_len = std::cmp::min(available, in_block_len);
            if copy_len > 0 {
                buf[written..written + copy_len]
                    .copy_from_slice(&data[in_block_start..in_block_start + copy_len]);
            }
            // Anything past the stored (possibly short) block and up to
            // `in_block_len` stays zero — `buf` is assumed pre-zeroed by the
            // caller, matching sparse-region semantics.
        }
        written += in_block_len;
    }
    Ok(written)
}

/// Writes `size` bytes at `offset`, splicing into existing blocks (loaded,
/// modified, written back) and zero-padding any newly-materialized blocks
/// up to the splice point. Returns bytes written, which is
/// always exactly `size` — a short write from the database is treated as a
/// caller bug and surfaces as `Io`.
pub fn write_buf(
    tx: &mut Transaction<'_>,
    block_size: u32,
    id: i64,
    data: &[u8],
    offset: u64,
) -> Result<usize> {
    let block_size_u = block_size as u64;
    let size = data.len();
    if size == 0 {
        return Ok(0);
    }

    let first_block = offset / block_size_u;
    let last_block = (offset + size as u64 - 1) / block_size_u;

    let mut written_so_far = 0usize;
    for block_no in first_block..=last_block {
        let block_start = block_no * block_size_u;
        let in_block_start = if block_no == first_block {
            (offset - block_start) as usize
        } else {
            0
        };
        let remaining = size - written_so_far;
        let in_block_len = std::cmp::min(block_size as usize - in_block_start, remaining);
        let chunk = &data[written_so_far..written_so_far + in_block_len];

        let existing = tx.query_opt(
            "select data from data where dir_id = $1 and block_no = $2 for update",
            &[&id, &(block_no as i64)],
        )?;

        let mut block = match existing {
            Some(row) => {
                let mut b: Vec<u8> = row.get(0);
                if b.len() < block_size as usize {
                    b.resize(block_size as usize, 0);
                }
                b
            }
            None => vec![0u8; block_size as usize],
        };
        block[in_block_start..in_block_start + chunk.len()].copy_from_slice(chunk);

        tx.execute(
            "insert into data (dir_id, block_no, data) values ($1, $2, $3) \
             on conflict (dir_id, block_no) do update set data = excluded.data",
            &[&id, &(block_no as i64), &block],
        )?;
        written_so_far += chunk.len();
    }

    Ok(size)
}

/// Grows or shrinks a file to `new_size`. Growing inserts
/// zero-filled blocks up to `ceil(new_size / block_size)`; shrinking deletes
/// blocks past that count and zeroes the tail of the last retained block.
pub fn truncate(tx: &mut Transaction<'_>, block_size: u32, id: i64, new_size: u64) -> Result<()> {
    let block_size_u = block_size as u64;
    let new_block_count = ceil_div(new_size, block_size_u).max(if new_size == 0 { 0 } else { 1 });

    if new_block_count > 0 {
        let last_idx = new_block_count - 1;
        let tail_len = new_size - last_idx * block_size_u;

        let existing = tx.query_opt(
            "select data from data where dir_id = $1 and block_no = $2 for update",
            &[&id, &(last_idx as i64)],
        )?;
        let mut tail = match existing {
            Some(row) => {
                let mut b: Vec<u8> = row.get(0);
                b.resize(tail_len as usize, 0);
                b
            }
            None => vec![0u8; tail_len as usize],
        };
        tail.truncate(tail_len as usize);

        tx.execute(
            "insert into data (dir_id, block_no, data) values ($1, $2, $3) \
             on conflict (dir_id, block_no) do update set data = excluded.data",
            &[&id, &(last_idx as i64), &tail],
        )?;
    }

    tx.execute(
        "delete from data where dir_id = $1 and block_no >= $2",
        &[&id, &(new_block_count as i64)],
    )?;

    tx.execute("update dir set size = $1 where id = $2", &[&(new_size as i64), &id])?;
    Ok(())
}

/// Relinks `from_id` under `to_parent_id` as `new_name`, rewriting `path`
/// for the inode itself and, if it's a directory, every descendant's
/// `path` prefix.
pub fn rename(
    tx: &mut Transaction<'_>,
    from_id: i64,
    to_parent_id: i64,
    new_name: &str,
    from_path: &str,
    to_path: &str,
) -> Result<()> {
    tx.execute(
        "update dir set parent_id = $1, name = $2, path = $3 where id = $4",
        &[&to_parent_id, &new_name, &to_path, &from_id],
    )?;

    // Descendants: any row whose path was prefixed by the old path gets the
    // prefix swapped for the new one. The root can never be a descendant of
    // itself here since `id <> parent_id` holds for everything but row 0.
    let old_prefix = format!("{}/", from_path.trim_end_matches('/'));
    let new_prefix = format!("{}/", to_path.trim_end_matches('/'));
    tx.execute(
        "update dir set path = $1 || substring(path from $2) \
         where path like $3 and id <> $4",
        &[
            &new_prefix,
            &((old_prefix.len() + 1) as i32),
            &format!("{old_prefix}%"),
            &from_id,
        ],
    )?;
    Ok(())
}

/// Resolves the on-disk directories of the tablespaces backing PgFuse's own
/// tables, substituting the cluster's default tablespace directory for the
/// zero-OID ("pg_default") case.
pub fn get_tablespace_locations(tx: &mut Transaction<'_>) -> Result<Vec<String>> {
    let rows = tx.query(
        "select distinct coalesce( \
           nullif(pg_tablespace_location(ts.oid), ''), \
           current_setting('data_directory') \
         ) as loc \
         from pg_class c \
         join pg_namespace n on n.oid = c.relnamespace \
         left join pg_tablespace ts on ts.oid = nullif(c.reltablespace, 0) \
         where c.relname in ('dir', 'data', 'pgfuse_meta') and n.nspname = 'public'",
        &[],
    )?;
    Ok(rows.into_iter().map(|r| r.get(0)).collect())
}

pub fn get_fs_blocks_used(tx: &mut Transaction<'_>, block_size: u32) -> Result<u64> {
    let row = tx.query_one("select coalesce(sum(size), 0) from dir", &[])?;
    let total_size: i64 = row.get(0);
    Ok(ceil_div(total_size.max(0) as u64, block_size as u64))
}

pub fn get_fs_files_used(tx: &mut Transaction<'_>) -> Result<u64> {
    let row = tx.query_one("select count(*) from dir", &[])?;
    let count: i64 = row.get(0);
    Ok(count.max(0) as u64)
}

/// The block size recorded at schema init; `None` on a not-yet-bootstrapped
/// database. Generic over `GenericClient` so both the bare `Client` schema
/// bootstrap uses before any transaction exists, and a handler's
/// `Transaction`, can call it.
pub fn get_block_size<C: postgres::GenericClient>(client: &mut C) -> Result<Option<u32>> {
    let row = client.query_opt(
        "select value from pgfuse_meta where key = 'block_size'",
        &[],
    )?;
    Ok(match row {
        Some(row) => {
            let value: String = row.get(0);
            Some(
                value
                    .parse()
                    .map_err(|_| PgfuseError::Io("corrupt block_size".into()))?,
            )
        }
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(0, 4096), 0);
        assert_eq!(ceil_div(1, 4096), 1);
        assert_eq!(ceil_div(4096, 4096), 1);
        assert_eq!(ceil_div(4097, 4096), 2);
        assert_eq!(ceil_div(8192, 4096), 2);
    }

    #[test]
    fn split_path_drops_empty_components() {
        assert_eq!(split_path("/"), Vec::<&str>::new());
        assert_eq!(split_path("/a"), vec!["a"]);
        assert_eq!(split_path("/a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(split_path("/a//b/"), vec!["a", "b"]);
    }

    #[test]
    fn join_path_avoids_double_slash_at_root() {
        assert_eq!(join_path("/", "foo"), "/foo");
        assert_eq!(join_path("/a", "foo"), "/a/foo");
        assert_eq!(join_path("/a/b", "foo"), "/a/b/foo");
    }

    #[test]
    fn mode_bit_helpers_identify_file_types() {
        assert!(is_dir(S_IFDIR | 0o755));
        assert!(!is_dir(S_IFREG | 0o644));
        assert!(is_symlink(S_IFLNK | 0o777));
        assert!(!is_symlink(S_IFDIR | 0o755));
    }
}
