//! ref-store: a single-threaded, bidirectional association store whose
//! bookkeeping cleans itself up when either side of an association dies.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: link a key (a string, or any heap object by identity) to a value
//!   object, and guarantee that forward entry, reverse index and key
//!   registry disappear together as soon as either side is destroyed.
//! - Layers:
//!   - Heap (`object`): arena of reference-counted objects with `Strong`
//!     and `WeakRef` handles; the last `Strong` going away is the
//!     destruction notification.
//!   - ActionList engine (`action`, `hooks`): per-object ordered,
//!     de-duplicated list of cleanup actions fired exactly once when the
//!     object is finalized.
//!   - Keys (`key`): simple (string) and encapsulating (object) key
//!     objects that register their own teardown.
//!   - Store (`store`): forward, reverse and scalar-lookup tables composed
//!     from the layers above.
//!
//! Constraints
//! - Single-threaded: `!Send`/`!Sync` (no atomics, no locks).
//! - Stable, generational object ids; a stale id never aliases.
//! - Every container removal unlinks first and drops later.
//!
//! Reentrancy policy
//! - Finalizing one object may finalize others while the first is still
//!   being torn down, and their actions may mutate the same container.
//!   Containers never run user code while borrowed: removals hand the
//!   removed entry back and the caller drops it after the borrow ends.
//! - A container being mutated by an action is pinned with an extra `Rc`
//!   (`Keepalive`) until the mutation returns, so the cascade cannot free
//!   it underneath the call.
//! - The action list being fired stays in place; entries are taken out as
//!   they fire and removals during firing leave an inert slot. The list is
//!   freed after the walk.
//! - Nesting depth is tracked for diagnostics, never limited.
//!
//! Failure semantics
//! - Invariant violations are `StoreError`s and stop the operation that
//!   hit them; a failing action stops the rest of its list.
//! - `Drop` cannot return errors: a fatal condition there is logged with
//!   `tracing::error!` and then panics. `Heap::release` is the explicit,
//!   fallible alternative.
//! - Misses (unknown key, absent action, container already gone) are
//!   ordinary return values.
//!
//! Notes and non-goals
//! - No persistence, no concurrency.
//! - Relinking a key to a different value always needs `Store::relink`
//!   with the current value as acknowledgment; `store` refuses it.

pub mod action;
pub mod error;
mod hooks;
mod key;
pub mod object;
mod reentrancy;
mod refcount;
pub mod store;
pub mod table;

// Public surface
pub use action::{Action, ActionCallback, DeletionStatus, Operation, TargetId};
pub use error::StoreError;
pub use hooks::DestroyHook;
pub use object::{Heap, ObjectId, Strong, WeakRef};
pub use store::{IdentityRemap, KeyStatus, LookupKey, Store, StoreOptions, StoreStats};
pub use table::{Held, Keepalive, KeepaliveOutcome, Selector, Sequence, Table};
