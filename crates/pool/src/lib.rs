//! Brume Pool
//!
//! Fixed-capacity, index-addressed pools of lazily built resources that heal
//! themselves.
//!
//! ## Model
//!
//! - Every slot is `Building`, `Ready` or `Failed`; capacity never changes.
//! - A slot has at most one build task. Restarting slot *i* aborts that task,
//!   tears down the old entry and spawns a new build, touching no other slot.
//! - Callers asking for a slot that is still building wait on it rather than
//!   starting a second build.
//! - Each (re)build emits [`PoolEvent::Started`]. A pool layered on another
//!   [`Pool::follow`]s it: when the upstream starts rebuilding, the downstream
//!   bumps its [`RebuildGate`] and restarts its own failed slots.
//!
//! ## Example
//!
//! ```ignore
//! use brume_pool::{Entry, Pool};
//!
//! let pool = Pool::new(4, |params| async move {
//!     let socket = dial(params.index).await?;
//!     Ok(Entry::new(Arc::new(socket)))
//! });
//!
//! let socket = pool.get(0, &cancel).await?;
//! ```

mod entry;
mod gate;
mod pool;
mod signal;

pub use entry::Entry;
pub use gate::{RebuildGate, Ticket};
pub use pool::{Pool, PoolEvent, PoolParams, SlotState, WeakPool};
pub use signal::{abortable, cancellable, sleep, Interrupted};

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Aborted")]
    Aborted,

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Index {index} out of bounds (capacity {capacity})")]
    OutOfBounds { index: usize, capacity: usize },

    #[error("Pool closed")]
    Closed,

    #[error("Creation failed: {0}")]
    Failed(String),
}

impl From<Interrupted> for PoolError {
    fn from(interrupted: Interrupted) -> Self {
        match interrupted {
            Interrupted::Aborted => Self::Aborted,
            Interrupted::TimedOut(after) => Self::TimedOut(after),
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
