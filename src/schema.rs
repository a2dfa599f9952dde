//! Idempotent schema bootstrap and the two startup preconditions a mount
//! depends on. This is deliberately thin: PgFuse does not ship a migration
//! framework, it just makes sure a blank database can be mounted without a
//! deployer running SQL by hand first.

use crate::dal;
use crate::error::{PgfuseError, Result};
use log::info;
use postgres::Client;

/// DDL for the two relations, their indices, the block-lifecycle rules, and
/// the root inode row.
const SCHEMA_SQL: &str = r#"
create sequence if not exists dir_id_seq start with 1;

create table if not exists dir (
    id          bigint primary key,
    parent_id   bigint not null,
    name        text not null,
    path        text not null,
    size        bigint not null default 0,
    mode        integer not null,
    uid         integer not null,
    gid         integer not null,
    ctime       timestamp not null default now(),
    mtime       timestamp not null default now(),
    atime       timestamp not null default now(),
    unique (parent_id, name),
    unique (path)
);

create table if not exists data (
    id          bigserial primary key,
    dir_id      bigint not null references dir(id) on delete cascade,
    block_no    bigint not null,
    data        bytea not null,
    unique (dir_id, block_no)
);

create index if not exists data_dir_id_idx on data (dir_id);
create index if not exists data_block_no_idx on data (block_no);
create index if not exists dir_parent_id_idx on dir (parent_id);

create table if not exists pgfuse_meta (
    key   text primary key,
    value text not null
);

insert into dir (id, parent_id, name, path, size, mode, uid, gid)
values (0, 0, '/', '/', 0, 16895, 0, 0)
on conflict (id) do nothing;
"#;

/// Creates `dir`/`data`/their indices and the root row if they don't already
/// exist, then records `block_size` the first time the schema is created.
/// Subsequent mounts compare against the recorded value (see
/// `check_block_size`).
pub fn ensure_schema(client: &mut Client, block_size: u32) -> Result<()> {
    client.batch_execute(SCHEMA_SQL)?;

    let existing = dal::get_block_size(client)?;
    match existing {
        None => {
            client.execute(
                "insert into pgfuse_meta (key, value) values ('block_size', $1) \
                 on conflict (key) do nothing",
                &[&block_size.to_string()],
            )?;
            info!("initialized schema with block_size={block_size}");
        }
        Some(recorded) if recorded != block_size => {
            return Err(PgfuseError::BadArgument);
        }
        Some(_) => {}
    }
    Ok(())
}

/// `integer_datetimes` must be enabled so timestamps round-trip as
/// 64-bit microseconds. Modern Postgres (>= 10) always has this on, but we
/// check rather than assume, since a mismatch silently corrupts timestamps
/// instead of failing loudly.
pub fn check_integer_datetimes(client: &mut Client) -> Result<()> {
    let row = client.query_one("show integer_datetimes", &[])?;
    let value: String = row.get(0);
    if value != "on" {
        return Err(PgfuseError::Io(
            "database was built without --enable-integer-datetimes".into(),
        ));
    }
    Ok(())
}
