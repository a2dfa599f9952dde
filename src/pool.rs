//! Fixed-capacity connection pool. Acquire blocks until a
//! session is free; release returns it to the idle set, discarding and
//! lazily replacing any session the caller marks broken.
//!
//! Single-threaded mounts use this same structure with
//! `capacity == 1`: since `fuser`'s single-threaded session model only ever
//! has one handler running at a time, a pool of one behaves exactly like
//! "the process's shared session for every acquire" — acquire never blocks
//! because the one session is always idle by the time the next handler
//! call starts.

use log::warn;
use postgres::{Client, NoTls};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::error::Result;

/// Default pool size. Not exposed on the CLI — nothing in PgFuse's
/// command-line surface names a flag for it, so it stays a compile-time
/// constant.
pub const MAX_DB_CONNECTIONS: usize = 8;

struct State {
    idle: VecDeque<Client>,
    outstanding: usize,
}

pub struct Pool {
    connection_string: String,
    state: Mutex<State>,
    available: Condvar,
}

/// A session borrowed from the pool. Dropping it without calling
/// [`PooledConnection::mark_broken`] returns it to the idle set; the
/// transaction envelope guarantees the session is out of any transaction by
/// the time that happens.
pub struct PooledConnection<'a> {
    pool: &'a Pool,
    client: Option<Client>,
    broken: bool,
}

impl Pool {
    /// Opens `capacity` connections up front. `capacity == 1` is how
    /// single-threaded mounts are modeled (see module docs).
    pub fn new(connection_string: &str, capacity: usize) -> Result<Pool> {
        let mut idle = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            idle.push_back(Client::connect(connection_string, NoTls)?);
        }
        Ok(Pool {
            connection_string: connection_string.to_string(),
            state: Mutex::new(State {
                idle,
                outstanding: 0,
            }),
            available: Condvar::new(),
        })
    }

    /// Blocks until an idle session is available.
    pub fn acquire(&self) -> PooledConnection<'_> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(client) = guard.idle.pop_front() {
                guard.outstanding += 1;
                return PooledConnection {
                    pool: self,
                    client: Some(client),
                    broken: false,
                };
            }
            guard = self
                .available
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn release(&self, client: Client, broken: bool) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.outstanding -= 1;
        if broken {
            warn!("pooled connection broken; reconnecting lazily");
            match Client::connect(&self.connection_string, NoTls) {
                Ok(fresh) => guard.idle.push_back(fresh),
                Err(e) => {
                    // The pool's effective capacity shrinks by one until a
                    // later release succeeds in reconnecting; callers still
                    // make progress as long as at least one session is
                    // healthy.
                    warn!("failed to reconnect after a broken session: {e}");
                }
            }
        } else {
            guard.idle.push_back(client);
        }
        self.available.notify_one();
    }
}

impl<'a> PooledConnection<'a> {
    pub fn client(&mut self) -> &mut Client {
        self.client.as_mut().expect("client taken from a live guard")
    }

    /// Marks the session as unusable; on drop the pool discards it instead
    /// of returning it to the idle set, re-establishing a replacement
    /// lazily on the next acquire.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<'a> Drop for PooledConnection<'a> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client, self.broken);
        }
    }
}
