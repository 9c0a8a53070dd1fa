//! `pocore-memory` is PoCore's hierarchical region allocator: a process-wide
//! [`Context`] caches standard and oversized memory blocks; applications
//! create [`Pool`]s within it that form a parent/child tree and allocate
//! untyped byte ranges with [`pool_alloc`]. A pool is cleared or destroyed
//! as a unit — individual allocations are never freed one at a time.
//! Cleanup callbacks registered on a pool run in a defined order when that
//! pool is cleared or destroyed, and a chained [`error`] object carries
//! wrap/join/trace semantics plus unhandled-error tracking.
//!
//! # Example
//!
//! ```
//! use pocore_memory::{Context, pool_alloc, pool_root};
//!
//! let mut ctx = Context::create();
//! let root = pool_root(&mut ctx);
//! let bytes = unsafe { pool_alloc(root, 64) };
//! assert!(!bytes.is_null());
//! ```
//!
//! # Concurrency
//!
//! A [`Context`] and the pools drawn from it are single-threaded by
//! contract; do not share a context across threads without external
//! synchronisation.

// `raw_free` and a handful of accessors exist to name an operation
// explicitly even where this crate's own call sites don't need them.
#![allow(dead_code)]

mod block;
mod cleanup;
pub mod config;
mod context;
pub mod error;
mod memtree;
mod pool;
mod raw;

pub use cleanup::RegKey;
pub use config::{ContextConfig, OomPolicy};
pub use context::{Context, ContextStats};
pub use error::{ErrorCode, ErrorLink};
pub use pool::Pool;

use std::panic::Location;

/// `pool_root(ctx)`.
pub fn pool_root(ctx: &mut Context) -> *mut Pool {
    Pool::create_root(ctx)
}

/// `pool_create(parent)`.
///
/// # Safety
/// `parent` must be a live pool obtained from this crate.
pub unsafe fn pool_create(parent: *mut Pool) -> *mut Pool {
    Pool::create(parent)
}

/// `pool_create_coalescing(parent)`.
///
/// # Safety
/// `parent` must be a live pool obtained from this crate.
pub unsafe fn pool_create_coalescing(parent: *mut Pool) -> *mut Pool {
    Pool::create_coalescing(parent)
}

/// `pool_track(pool)`.
///
/// # Safety
/// `pool` must be a live pool.
pub unsafe fn pool_track(pool: *mut Pool) -> RegKey {
    Pool::track(pool)
}

/// `registry_track(ctx, cleanup)`: registers an entity that is not itself a
/// pool (a descriptor, a handle, anything with its own teardown) with the
/// context's cleanup registry, returning a key that can be adopted as a
/// pool's owner via [`pool_adopt_owner`] or linked with [`registry_depend`].
///
/// # Safety
/// `ctx` must be a live context.
pub unsafe fn registry_track(ctx: *mut Context, cleanup: Box<dyn FnMut()>) -> RegKey {
    (*ctx).registry.insert(Some(cleanup))
}

/// `pool_adopt_owner(pool, key)`: adopts an already-tracked entity (another
/// pool's [`pool_track`] key, or a [`registry_track`] key) as one of
/// `pool`'s owners, so its cleanup runs as part of `pool`'s clear/destroy
/// protocol. This is the mechanism by which an owner external to the pool
/// tree participates in cleanup.
///
/// # Safety
/// `pool` must be live; `key` must come from `pool_track` or `registry_track`
/// on the same context as `pool`.
pub unsafe fn pool_adopt_owner(pool: *mut Pool, key: RegKey) {
    Pool::adopt_owner(pool, key)
}

/// `registry_depend(ctx, owner, dependent)`: records that `dependent`
/// depends on `owner`. When `owner`'s cleanup runs, `dependent` is detached
/// from `owner`'s dependent list so it is never left referencing a retired
/// entity, even if `dependent`'s own cleanup runs along some other path
/// later.
///
/// # Safety
/// `ctx` must be a live context; `owner` and `dependent` should be keys
/// previously returned by `pool_track` or `registry_track` on this context.
pub unsafe fn registry_depend(ctx: *mut Context, owner: RegKey, dependent: RegKey) {
    (*ctx).registry.add_dependent(owner, dependent);
}

/// `alloc(pool, n)`.
///
/// # Safety
/// `pool` must be a live, non-destroyed pool.
pub unsafe fn pool_alloc(pool: *mut Pool, n: usize) -> *mut u8 {
    Pool::alloc(pool, n)
}

/// `pool_freemem(pool, ptr, n)`.
///
/// # Safety
/// `ptr` must be a live allocation of at least `n` bytes previously
/// returned by [`pool_alloc`] on `pool`.
pub unsafe fn pool_freemem(pool: *mut Pool, ptr: *mut u8, n: usize) {
    Pool::freemem(pool, ptr, n)
}

/// `strdup(pool, s)`.
///
/// # Safety
/// `pool` must be a live pool.
pub unsafe fn pool_strdup(pool: *mut Pool, s: &[u8]) -> *mut u8 {
    Pool::strdup(pool, s)
}

/// `strmemdup(pool, s)`.
///
/// # Safety
/// `pool` must be a live pool.
pub unsafe fn pool_strmemdup(pool: *mut Pool, s: &[u8]) -> *mut u8 {
    Pool::strmemdup(pool, s)
}

/// `strndup(pool, s, n)`.
///
/// # Safety
/// `pool` must be a live pool.
pub unsafe fn pool_strndup(pool: *mut Pool, s: &[u8], n: usize) -> *mut u8 {
    Pool::strndup(pool, s, n)
}

/// `memdup(pool, src, n)`.
///
/// # Safety
/// `pool` must be a live pool; `src` must be valid for `n` reads.
pub unsafe fn pool_memdup(pool: *mut Pool, src: *const u8, n: usize) -> *mut u8 {
    Pool::memdup(pool, src, n)
}

/// `pool_clear(pool)`.
///
/// # Safety
/// `pool` must be a live pool.
pub unsafe fn pool_clear(pool: *mut Pool) {
    Pool::clear(pool)
}

/// `pool_destroy(pool)`.
///
/// # Safety
/// `pool` must be a live pool, not yet destroyed. `pool` must not be used
/// again after this call.
pub unsafe fn pool_destroy(pool: *mut Pool) {
    Pool::destroy(pool)
}

/// `context_destroy(ctx)`: an explicit spelling of dropping the context.
pub fn context_destroy(ctx: Box<Context>) {
    drop(ctx);
}

/// `error_create(ctx, code, msg) → error`.
///
/// Call-site file/line are captured automatically via [`Location::caller`]
/// rather than threaded through as explicit parameters.
///
/// # Safety
/// `ctx` must be a live context.
#[track_caller]
pub unsafe fn error_create(ctx: *mut Context, code: ErrorCode, msg: &[u8]) -> *mut ErrorLink {
    let loc = Location::caller();
    error::create(ctx, code, msg, loc.file(), loc.line(), std::ptr::null_mut())
}

/// `error_createf(ctx, code, fmt, …)`: formats `args` (typically built with
/// [`format_args!`]) into the error's message.
///
/// # Safety
/// `ctx` must be a live context.
#[track_caller]
pub unsafe fn error_createf(
    ctx: *mut Context,
    code: ErrorCode,
    args: std::fmt::Arguments,
) -> *mut ErrorLink {
    let formatted = std::fmt::format(args);
    error_create(ctx, code, formatted.as_bytes())
}

/// `error_wrap(code, msg, original)`.
///
/// # Safety
/// `original` must be a live error link.
#[track_caller]
pub unsafe fn error_wrap(code: ErrorCode, msg: &[u8], original: *mut ErrorLink) -> *mut ErrorLink {
    let loc = Location::caller();
    error::wrap(code, msg, original, loc.file(), loc.line())
}

/// `error_join(error, separate)`.
///
/// # Safety
/// Both arguments must be live error links from the same context.
#[track_caller]
pub unsafe fn error_join(error: *mut ErrorLink, separate: *mut ErrorLink) -> *mut ErrorLink {
    let loc = Location::caller();
    error::join(error, separate, loc.file(), loc.line())
}

/// `error_trace(error)`.
///
/// # Safety
/// `error` must be a live error link.
#[track_caller]
pub unsafe fn error_trace(error: *mut ErrorLink) -> *mut ErrorLink {
    let loc = Location::caller();
    error::trace(error, loc.file(), loc.line())
}

/// `error_handled(error)`.
///
/// # Safety
/// `error` must be a live error link.
#[track_caller]
pub unsafe fn error_handled(error: *mut ErrorLink) {
    let loc = Location::caller();
    error::handled(error, loc.file(), loc.line())
}

/// `context_unhandled(ctx) → error | null`.
pub fn context_unhandled(ctx: &Context) -> Option<*mut ErrorLink> {
    ctx.unhandled()
}

/// `context_tracing(ctx, bool)`.
pub fn context_tracing(ctx: &mut Context, enabled: bool) {
    ctx.set_tracing(enabled);
}
