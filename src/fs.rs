//! Filesystem operation handlers: one per VFS callback. Every
//! handler follows the same shape — call into the DAL inside
//! [`txn::run`], translate `Result<_, PgfuseError>` into a `reply`/errno —
//! since the transaction envelope (and therefore acquire/commit/release) is
//! centralized there rather than repeated per handler.

use std::cmp;
use std::ffi::OsStr;
use std::path::Path;
use std::time::SystemTime;

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::{EBADF, EINVAL, ENOSYS, EROFS};
use log::{debug, error, warn};

use crate::dal::{self, Meta, S_IFDIR, S_IFLNK, S_IFREG};
use crate::error::PgfuseError;
use crate::pool::Pool;
use crate::statfs;
use crate::txn;

const TTL: std::time::Duration = std::time::Duration::from_secs(1);
/// files_free is reported as effectively unbounded.
const FILES_FREE_SENTINEL: u64 = 1_000_000_000;
const MAX_NAME_LENGTH: u32 = 255;

pub struct PgFuse {
    pool: Pool,
    block_size: u32,
    read_only: bool,
    mtab_path: std::path::PathBuf,
}

impl PgFuse {
    pub fn new(pool: Pool, block_size: u32, read_only: bool) -> PgFuse {
        PgFuse {
            pool,
            block_size,
            read_only,
            mtab_path: std::path::PathBuf::from(statfs::DEFAULT_MTAB),
        }
    }

    fn to_file_attr(&self, id: i64, meta: &Meta) -> FileAttr {
        let kind = if dal::is_dir(meta.mode) {
            FileType::Directory
        } else if dal::is_symlink(meta.mode) {
            FileType::Symlink
        } else {
            FileType::RegularFile
        };
        FileAttr {
            ino: id as u64,
            size: meta.size,
            blocks: meta.size.div_ceil(self.block_size as u64),
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
            crtime: meta.ctime,
            kind,
            perm: (meta.mode & 0o7777) as u16,
            nlink: 1,
            uid: meta.uid,
            gid: meta.gid,
            rdev: 0,
            flags: 0,
            blksize: self.block_size,
        }
    }

    fn now_meta(mode: u32, uid: u32, gid: u32) -> Meta {
        let now = SystemTime::now();
        Meta {
            size: 0,
            mode,
            uid,
            gid,
            ctime: now,
            mtime: now,
            atime: now,
        }
    }
}

fn os_str_to_str(name: &OsStr) -> Result<&str, i32> {
    name.to_str().ok_or(EINVAL)
}

impl Filesystem for PgFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), i32> {
        let _ = config.set_max_write(self.block_size.max(64 * 1024));
        debug!("mounted with block_size={} read_only={}", self.block_size, self.read_only);
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("unmounting");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match os_str_to_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let result = txn::run(&self.pool, |tx| dal::lookup_child(tx, parent as i64, name));
        match result {
            Ok((id, meta)) => reply.entry(&TTL, &self.to_file_attr(id, &meta), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, _ino: u64, _nlookup: u64) {}

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = txn::run(&self.pool, |tx| dal::read_meta(tx, ino as i64));
        match result {
            Ok(meta) => reply.attr(&TTL, &self.to_file_attr(ino as i64, &meta)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if self.read_only && (mode.is_some() || uid.is_some() || gid.is_some() || size.is_some()) {
            return reply.error(EROFS);
        }
        let id = ino as i64;
        let block_size = self.block_size;
        let result = txn::run(&self.pool, |tx| {
            let mut meta = dal::read_meta(tx, id)?;
            if let Some(size) = size {
                dal::truncate(tx, block_size, id, size)?;
                meta.size = size;
            }
            if let Some(mode) = mode {
                // preserve the file-type bits; only the permission bits are
                // under the caller's control (chmod never changes the kind
                // of an inode).
                meta.mode = (meta.mode & !0o7777) | (mode & 0o7777);
            }
            if let Some(uid) = uid {
                meta.uid = uid;
            }
            if let Some(gid) = gid {
                meta.gid = gid;
            }
            if let Some(atime) = atime {
                meta.atime = match atime {
                    TimeOrNow::SpecificTime(t) => t,
                    TimeOrNow::Now => SystemTime::now(),
                };
            }
            if let Some(mtime) = mtime {
                meta.mtime = match mtime {
                    TimeOrNow::SpecificTime(t) => t,
                    TimeOrNow::Now => SystemTime::now(),
                };
            }
            meta.ctime = SystemTime::now();
            dal::write_meta(tx, id, &meta)?;
            Ok(meta)
        });
        match result {
            Ok(meta) => reply.attr(&TTL, &self.to_file_attr(id, &meta)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let id = ino as i64;
        let block_size = self.block_size;
        let result = txn::run(&self.pool, |tx| {
            let meta = dal::read_meta(tx, id)?;
            if !dal::is_symlink(meta.mode) {
                return Err(PgfuseError::BadArgument);
            }
            dal::read_all(tx, block_size, id, meta.size)
        });
        match result {
            Ok(bytes) => reply.data(&bytes),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        if self.read_only {
            return reply.error(EROFS);
        }
        let name = match os_str_to_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let parent_id = parent as i64;
        let meta = PgFuse::now_meta((mode & 0o7777) | S_IFDIR, req.uid(), req.gid());
        let result = txn::run(&self.pool, |tx| {
            let parent_path = dal::path_of(tx, parent_id)?;
            let path = dal::join_path(&parent_path, name);
            let id = dal::create_dir(tx, parent_id, &path, name, &meta)?;
            Ok((id, meta.clone()))
        });
        match result {
            Ok((id, meta)) => reply.entry(&TTL, &self.to_file_attr(id, &meta), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if self.read_only {
            return reply.error(EROFS);
        }
        let name = match os_str_to_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let parent_id = parent as i64;
        let result = txn::run(&self.pool, |tx| {
            let (id, _meta) = dal::lookup_child(tx, parent_id, name)?;
            dal::delete_file(tx, id).map_err(|e| match e {
                PgfuseError::IsDirectory => PgfuseError::NotPermitted,
                other => other,
            })
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if self.read_only {
            return reply.error(EROFS);
        }
        let name = match os_str_to_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let parent_id = parent as i64;
        let result = txn::run(&self.pool, |tx| {
            let (id, _meta) = dal::lookup_child(tx, parent_id, name)?;
            dal::delete_dir(tx, id)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        if self.read_only {
            return reply.error(EROFS);
        }
        let name = match os_str_to_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let target = match link.to_str() {
            Some(t) => t,
            None => return reply.error(EINVAL),
        };
        let parent_id = parent as i64;
        let mut meta = PgFuse::now_meta(0o777 | S_IFLNK, req.uid(), req.gid());
        meta.size = target.len() as u64;
        let result = txn::run(&self.pool, |tx| {
            let parent_path = dal::path_of(tx, parent_id)?;
            let path = dal::join_path(&parent_path, name);
            let id = dal::create_symlink(tx, parent_id, &path, name, &meta, target)?;
            Ok((id, meta.clone()))
        });
        match result {
            Ok((id, meta)) => reply.entry(&TTL, &self.to_file_attr(id, &meta), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        if self.read_only {
            return reply.error(EROFS);
        }
        let name = match os_str_to_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let newname = match os_str_to_str(newname) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let parent_id = parent as i64;
        let new_parent_id = newparent as i64;
        let result = txn::run(&self.pool, |tx| {
            let (from_id, from_meta) = dal::lookup_child(tx, parent_id, name)?;
            let existing_to = dal::lookup_child(tx, new_parent_id, newname);

            match existing_to {
                Ok((to_id, to_meta)) => {
                    if to_id == from_id {
                        return Ok(()); // rename onto self: no-op
                    }
                    if dal::is_dir(to_meta.mode) {
                        return Err(PgfuseError::BadArgument);
                    }
                    if dal::is_dir(from_meta.mode) {
                        return Err(PgfuseError::BadArgument);
                    }
                    if dal::is_symlink(from_meta.mode) != dal::is_symlink(to_meta.mode) {
                        // cross-type overwrite (regular file <-> symlink)
                        return Err(PgfuseError::BadArgument);
                    }
                    // to exists, is the same non-directory kind as from,
                    // and isn't the same inode as from: overwrite is only
                    // allowed for an identity rename, so this is a conflict.
                    return Err(PgfuseError::AlreadyExists);
                }
                Err(PgfuseError::NotFound) => {}
                Err(e) => return Err(e),
            }

            let from_path = dal::path_of(tx, from_id)?;
            let new_parent_path = dal::path_of(tx, new_parent_id)?;
            let to_path = dal::join_path(&new_parent_path, newname);
            dal::rename(tx, from_id, new_parent_id, newname, &from_path, &to_path)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        // Hard links are a deliberate non-goal.
        reply.error(ENOSYS);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let id = ino as i64;
        let wants_write = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        if self.read_only && wants_write {
            return reply.error(EROFS);
        }
        let result = txn::run(&self.pool, |tx| {
            let mut meta = dal::read_meta(tx, id)?;
            if dal::is_dir(meta.mode) {
                return Err(PgfuseError::IsDirectory);
            }
            meta.atime = SystemTime::now();
            dal::write_meta(tx, id, &meta)?;
            Ok(())
        });
        match result {
            Ok(()) => reply.opened(id as u64, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if fh == 0 {
            return reply.error(EBADF);
        }
        if offset < 0 {
            return reply.error(EINVAL);
        }
        let id = ino as i64;
        let offset = offset as u64;
        let block_size = self.block_size;
        let result = txn::run(&self.pool, |tx| {
            let mut buf = vec![0u8; size as usize];
            let n = dal::read_buf(tx, block_size, id, &mut buf, offset, size)?;
            buf.truncate(n);
            Ok(buf)
        });
        match result {
            Ok(bytes) => reply.data(&bytes),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if self.read_only {
            return reply.error(EROFS);
        }
        if fh == 0 {
            return reply.error(EBADF);
        }
        if offset < 0 {
            return reply.error(EINVAL);
        }
        let id = ino as i64;
        let offset = offset as u64;
        let block_size = self.block_size;
        let result = txn::run(&self.pool, |tx| {
            let mut meta = dal::read_meta(tx, id)?;
            let written = dal::write_buf(tx, block_size, id, data, offset)?;
            if written != data.len() {
                error!("short write: requested {} wrote {}", data.len(), written);
                return Err(PgfuseError::Io("short write".into()));
            }
            meta.size = cmp::max(meta.size, offset + written as u64);
            meta.mtime = SystemTime::now();
            dal::write_meta(tx, id, &meta)?;
            Ok(written)
        });
        match result {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // Every write already committed; nothing to flush.
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        if fh == 0 {
            return reply.error(EBADF);
        }
        if self.read_only {
            return reply.error(EROFS);
        }
        // The database commit inside each write already persisted the data.
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(ino, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let id = ino as i64;
        let result = txn::run(&self.pool, |tx| dal::readdir(tx, id));
        let entries = match result {
            Ok(entries) => entries,
            Err(e) => return reply.error(e.to_errno()),
        };

        let dots = [(id as u64, FileType::Directory, ".".to_string()), (id as u64, FileType::Directory, "..".to_string())];
        let children = entries.into_iter().map(|e| {
            let kind = if dal::is_dir(e.mode) {
                FileType::Directory
            } else if dal::is_symlink(e.mode) {
                FileType::Symlink
            } else {
                FileType::RegularFile
            };
            (e.id as u64, kind, e.name)
        });

        for (i, (entry_ino, kind, name)) in dots.into_iter().chain(children).enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let block_size = self.block_size;
        let mtab_path = self.mtab_path.clone();
        let result = txn::run(&self.pool, |tx| {
            let tablespaces = dal::get_tablespace_locations(tx)?;
            let blocks_used = dal::get_fs_blocks_used(tx, block_size)?;
            let files_used = dal::get_fs_files_used(tx)?;
            Ok((tablespaces, blocks_used, files_used))
        });
        let (tablespaces, blocks_used, files_used) = match result {
            Ok(v) => v,
            Err(e) => return reply.error(e.to_errno()),
        };

        let space = match statfs::aggregate_free_space(&tablespaces, &mtab_path) {
            Ok(space) => space,
            Err(e) => {
                warn!("statfs: failed to inspect host mounts: {e}");
                statfs::HostSpace::default()
            }
        };

        let blocks_free = space.free_bytes / block_size as u64;
        let blocks_avail = space.available_bytes / block_size as u64;
        let blocks_total = blocks_used + blocks_avail;
        let files_total = files_used + FILES_FREE_SENTINEL;

        reply.statfs(
            blocks_total,
            blocks_free,
            blocks_avail,
            files_total,
            FILES_FREE_SENTINEL,
            block_size,
            MAX_NAME_LENGTH,
            block_size,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        // Extended attributes are a deliberate non-goal.
        reply.error(ENOSYS);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(libc::ENODATA);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: ReplyXattr) {
        reply.size(0);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(ENOSYS);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        // Access-control checks are intentionally absent; any
        // enforcement comes from the host's mount-level options.
        reply.ok();
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let file_type = mode & libc::S_IFMT as u32;
        if file_type != 0 && file_type != S_IFREG {
            // Device nodes are a deliberate non-goal.
            return reply.error(ENOSYS);
        }
        match self.create_regular_file(req, parent, name, mode) {
            Ok((id, meta)) => reply.entry(&TTL, &self.to_file_attr(id, &meta), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_regular_file(req, parent, name, mode) {
            Ok((id, meta)) => {
                let attr = self.to_file_attr(id, &meta);
                reply.created(&TTL, &attr, 0, id as u64, 0)
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

impl PgFuse {
    /// Shared `create(path, mode)` logic: fails `EEXIST` if the
    /// name is already a file, `EISDIR` if it's already a directory.
    fn create_regular_file(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
    ) -> Result<(i64, Meta), PgfuseError> {
        if self.read_only {
            return Err(PgfuseError::ReadOnly);
        }
        let name = name.to_str().ok_or(PgfuseError::BadArgument)?;
        let parent_id = parent as i64;
        let meta = PgFuse::now_meta((mode & 0o7777) | S_IFREG, req.uid(), req.gid());
        txn::run(&self.pool, |tx| {
            if let Ok((_, existing)) = dal::lookup_child(tx, parent_id, name) {
                if dal::is_dir(existing.mode) {
                    return Err(PgfuseError::IsDirectory);
                }
                return Err(PgfuseError::AlreadyExists);
            }
            let parent_path = dal::path_of(tx, parent_id)?;
            let path = dal::join_path(&parent_path, name);
            let id = dal::create_file(tx, parent_id, &path, name, &meta)?;
            Ok((id, meta.clone()))
        })
    }
}
