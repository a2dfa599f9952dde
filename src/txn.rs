//! Transaction envelope: acquire a session, begin a
//! transaction, run the handler body, commit on success or roll back on any
//! error, then release the session. Never retried — at-most-once semantics
//! avoid duplicating side effects on partial failure.

use crate::error::{PgfuseError, Result};
use crate::pool::Pool;
use postgres::Transaction;

/// Runs `body` inside a fresh transaction on a pooled session.
///
/// A lost connection surfaces as `PgfuseError::Io` to the caller (mapped
/// from `postgres::Error` via `From`), and the broken session is flagged so
/// the pool replaces it instead of handing it to the next handler call.
pub fn run<F, T>(pool: &Pool, body: F) -> Result<T>
where
    F: FnOnce(&mut Transaction<'_>) -> Result<T>,
{
    let mut conn = pool.acquire();

    let mut txn = match conn.client().transaction() {
        Ok(txn) => txn,
        Err(e) => {
            conn.mark_broken();
            return Err(PgfuseError::from(e));
        }
    };

    let result = body(&mut txn);

    match result {
        Ok(value) => match txn.commit() {
            Ok(()) => Ok(value),
            Err(e) => {
                conn.mark_broken();
                Err(PgfuseError::from(e))
            }
        },
        Err(e) => {
            if txn.rollback().is_err() {
                conn.mark_broken();
            }
            Err(e)
        }
    }
}
