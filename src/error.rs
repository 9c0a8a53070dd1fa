//! Chained error objects: wrap/join/trace, unhandled-list membership, and
//! the STOP-sentinel double-handle/double-wrap misuse detection.
//!
//! Error links are allocated from the context's lazily-created error pool
//! rather than with `Box`: allocations here are never freed individually,
//! only whole pools, so an `ErrorLink` is POD bump-allocated memory that
//! outlives every operation performed on it until the error pool itself is
//! destroyed with the context. This sidesteps needing a `Drop` story for a
//! structure that is, by contract, never individually freed — it lives
//! until `error_handled` marks it terminated, or until its error pool is
//! destroyed with its context.

use std::fmt;
use std::mem;
use std::ptr;

use crate::context::Context;
use crate::pool::Pool;

pub type ErrorCode = i32;

pub const SUCCESS: ErrorCode = 0;
pub const TRACE: ErrorCode = -1;
pub const IMPROPER_WRAP: ErrorCode = -2;
pub const IMPROPER_UNHANDLED_CALL: ErrorCode = -3;

/// A tagged enum in place of sentinel-pointer comparison for list
/// membership.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LinkState {
    /// On the context's unhandled list.
    Active {
        prev: *mut ErrorLink,
        next: *mut ErrorLink,
    },
    /// Terminated: either properly handled already, or flagged as misused.
    /// Both cases forbid any further list traversal through this link.
    Stop,
    /// This context never tracks unhandled errors; list bookkeeping does
    /// not apply.
    Untracked,
}

/// A chained error value: a domain error, a trace annotation, or a misuse
/// record, optionally wrapping an inner cause and a joined side error.
#[repr(C)]
pub struct ErrorLink {
    ctx: *mut Context,
    code: ErrorCode,
    msg: *const u8,
    msg_len: usize,
    file: &'static str,
    lineno: u32,
    original: *mut ErrorLink,
    separate: *mut ErrorLink,
    state: LinkState,
}

impl ErrorLink {
    pub fn code(this: *mut ErrorLink) -> ErrorCode {
        unsafe {
            let real = skip_trace(this);
            (*real).code
        }
    }

    pub fn message(this: *mut ErrorLink) -> &'static [u8] {
        unsafe {
            let real = skip_trace(this);
            std::slice::from_raw_parts((*real).msg, (*real).msg_len)
        }
    }

    pub fn original(this: *mut ErrorLink) -> Option<*mut ErrorLink> {
        unsafe {
            let real = skip_trace(this);
            let o = (*real).original;
            if o.is_null() {
                None
            } else {
                Some(o)
            }
        }
    }

    pub fn separate(this: *mut ErrorLink) -> Option<*mut ErrorLink> {
        unsafe {
            let real = skip_trace(this);
            let s = (*real).separate;
            if s.is_null() {
                None
            } else {
                Some(s)
            }
        }
    }

    /// `error_trace_info`: file/line of the nearest trace annotation
    /// reachable from `this` without crossing a non-trace node.
    pub fn trace_info(this: *mut ErrorLink) -> Option<(&'static str, u32)> {
        unsafe {
            if (*this).code == TRACE {
                Some(((*this).file, (*this).lineno))
            } else {
                None
            }
        }
    }
}

impl fmt::Debug for ErrorLink {
    /// Identity summary only — does not walk `.original`/`.separate`, since
    /// a chain can be arbitrarily long.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorLink")
            .field("code", &self.code)
            .field("file", &self.file)
            .field("lineno", &self.lineno)
            .field("state", &self.state)
            .finish()
    }
}

/// Walks `.original` while the code is `TRACE`, so accessors skip trace
/// records transparently.
unsafe fn skip_trace(mut link: *mut ErrorLink) -> *mut ErrorLink {
    while (*link).code == TRACE && !(*link).original.is_null() {
        link = (*link).original;
    }
    link
}

/// `error_create(ctx, code, msg) → error`.
///
/// # Safety
/// `ctx` must be a live context.
pub unsafe fn create(
    ctx: *mut Context,
    code: ErrorCode,
    msg: &[u8],
    file: &'static str,
    lineno: u32,
    original: *mut ErrorLink,
) -> *mut ErrorLink {
    let pool = error_pool(ctx);
    let msg_copy = Pool::memdup(pool, msg.as_ptr(), msg.len());
    let link = Pool::alloc(pool, mem::size_of::<ErrorLink>()) as *mut ErrorLink;
    let state = if (*ctx).track_unhandled {
        LinkState::Active {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    } else {
        LinkState::Untracked
    };
    ptr::write(
        link,
        ErrorLink {
            ctx,
            code,
            msg: msg_copy,
            msg_len: msg.len(),
            file,
            lineno,
            original,
            separate: ptr::null_mut(),
            state,
        },
    );
    if (*ctx).track_unhandled {
        push_unhandled(ctx, link);
    }
    link
}

unsafe fn error_pool(ctx: *mut Context) -> *mut Pool {
    (*ctx).error_pool()
}

unsafe fn push_unhandled(ctx: *mut Context, link: *mut ErrorLink) {
    let old_head = (*ctx).unhandled().map(|h| h).unwrap_or(ptr::null_mut());
    if !old_head.is_null() {
        if let LinkState::Active { prev, .. } = &mut (*old_head).state {
            *prev = link;
        }
    }
    (*link).state = LinkState::Active {
        prev: ptr::null_mut(),
        next: old_head,
    };
    *(*ctx).unhandled_head_ptr() = link;
}

/// Removes `link` from the unhandled list if it is currently on it.
/// Leaves `link.state` untouched; callers set the post-detach state.
unsafe fn unlink_if_active(ctx: *mut Context, link: *mut ErrorLink) -> bool {
    let (prev, next) = match (*link).state {
        LinkState::Active { prev, next } => (prev, next),
        _ => return false,
    };
    if prev.is_null() {
        *(*ctx).unhandled_head_ptr() = next;
    } else if let LinkState::Active { next: pn, .. } = &mut (*prev).state {
        *pn = next;
    }
    if !next.is_null() {
        if let LinkState::Active { prev: np, .. } = &mut (*next).state {
            *np = prev;
        }
    }
    true
}

/// `error_wrap(code, msg, original)`.
///
/// # Safety
/// `original` must be a live link created against the same context.
pub unsafe fn wrap(
    code: ErrorCode,
    msg: &[u8],
    original: *mut ErrorLink,
    file: &'static str,
    lineno: u32,
) -> *mut ErrorLink {
    let ctx = (*original).ctx;
    if !(*ctx).track_unhandled {
        return create(ctx, code, msg, file, lineno, original);
    }
    if unlink_if_active(ctx, original) {
        (*original).state = LinkState::Stop;
        create(ctx, code, msg, file, lineno, original)
    } else {
        (*original).state = LinkState::Stop;
        create(
            ctx,
            IMPROPER_WRAP,
            b"error_wrap called on an error that was not the unhandled head",
            file,
            lineno,
            original,
        )
    }
}

/// `error_join(error, separate)`.
///
/// # Safety
/// Both arguments must be live links created against the same context.
pub unsafe fn join(
    error: *mut ErrorLink,
    separate: *mut ErrorLink,
    file: &'static str,
    lineno: u32,
) -> *mut ErrorLink {
    let ctx = (*error).ctx;
    // Walk the existing `separate` chain of `error` and append at the end.
    // The loop re-reads `scan.separate` each iteration, not `error.separate`,
    // so appending past the first element reaches the actual tail.
    let mut scan = error;
    while !(*scan).separate.is_null() {
        scan = (*scan).separate;
    }
    (*scan).separate = separate;
    if (*ctx).track_unhandled {
        if unlink_if_active(ctx, separate) {
            (*separate).state = LinkState::Stop;
        }
    }
    trace(error, file, lineno)
}

/// `error_trace(error)`.
///
/// # Safety
/// `error` must be a live link.
pub unsafe fn trace(error: *mut ErrorLink, file: &'static str, lineno: u32) -> *mut ErrorLink {
    let ctx = (*error).ctx;
    if !(*ctx).tracing {
        return error;
    }
    if !(*ctx).track_unhandled {
        return create(ctx, TRACE, b"", file, lineno, error);
    }
    if unlink_if_active(ctx, error) {
        (*error).state = LinkState::Stop;
        create(ctx, TRACE, b"", file, lineno, error)
    } else {
        create(ctx, TRACE, b"", file, lineno, error)
    }
}

/// `error_handled(error)`.
///
/// # Safety
/// `error` must be a live link.
pub unsafe fn handled(error: *mut ErrorLink, file: &'static str, lineno: u32) {
    let ctx = (*error).ctx;
    if !(*ctx).track_unhandled {
        // Bump-pool allocated; nothing to eagerly reclaim beyond marking.
        (*error).state = LinkState::Stop;
        return;
    }
    if unlink_if_active(ctx, error) {
        (*error).state = LinkState::Stop;
        return;
    }
    // Already retired (double-handle), or never was list-resident.
    (*error).state = LinkState::Stop;
    let _ = create(
        ctx,
        IMPROPER_UNHANDLED_CALL,
        b"error_handled called twice on the same error",
        file,
        lineno,
        error,
    );
}

/// Walks `link.next` one step for diagnostics (`Context::stats`).
///
/// # Safety
/// `link` must be a live link.
pub(crate) unsafe fn link_next(link: *mut ErrorLink) -> *mut ErrorLink {
    match (*link).state {
        LinkState::Active { next, .. } => next,
        _ => ptr::null_mut(),
    }
}

/// Invoked from `Context::drop`; the links themselves live in the error
/// pool and are reclaimed when that pool's blocks return to the OS, so
/// this only needs to run user-visible teardown notification (handled by
/// the caller) — no explicit per-node deallocation happens here.
///
/// # Safety
/// `_head` must be the context's current unhandled-list head or null.
pub(crate) unsafe fn free_unhandled_list(_head: *mut ErrorLink) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;

    #[test]
    fn wrap_then_handled_round_trip() {
        let mut ctx = Context::create_custom(ContextConfig {
            track_unhandled: true,
            ..Default::default()
        });
        let ctx_ptr = ctx.as_mut() as *mut Context;
        unsafe {
            let e1 = create(ctx_ptr, 42, b"bad", "test.rs", 1, ptr::null_mut());
            assert_eq!(ctx.unhandled(), Some(e1));

            let e2 = wrap(7, b"outer", e1, "test.rs", 2);
            assert_eq!(ctx.unhandled(), Some(e2));
            assert_ne!(ErrorLink::code(e1), IMPROPER_WRAP);

            handled(e2, "test.rs", 3);
            assert!(ctx.unhandled().is_none());
        }
    }

    #[test]
    fn double_handle_produces_improper_unhandled_call() {
        let mut ctx = Context::create_custom(ContextConfig {
            track_unhandled: true,
            ..Default::default()
        });
        let ctx_ptr = ctx.as_mut() as *mut Context;
        unsafe {
            let e1 = create(ctx_ptr, 42, b"bad", "test.rs", 1, ptr::null_mut());
            let e2 = wrap(7, b"outer", e1, "test.rs", 2);
            handled(e2, "test.rs", 3);
            handled(e2, "test.rs", 4);
            let head = ctx.unhandled().expect("a fresh misuse error");
            assert_eq!(ErrorLink::code(head), IMPROPER_UNHANDLED_CALL);
        }
    }

    #[test]
    fn join_appends_to_separate_chain_tail() {
        let mut ctx = Context::create();
        let ctx_ptr = ctx.as_mut() as *mut Context;
        unsafe {
            let e = create(ctx_ptr, 1, b"a", "t.rs", 1, ptr::null_mut());
            let s1 = create(ctx_ptr, 2, b"b", "t.rs", 2, ptr::null_mut());
            let s2 = create(ctx_ptr, 3, b"c", "t.rs", 3, ptr::null_mut());
            let joined = join(e, s1, "t.rs", 4);
            join(e, s2, "t.rs", 5);
            assert_eq!(ErrorLink::separate(e), Some(s1));
            assert_eq!(ErrorLink::separate(s1), Some(s2));
            let _ = joined;
        }
    }

    #[test]
    fn message_roundtrips_bytes() {
        let mut ctx = Context::create();
        let ctx_ptr = ctx.as_mut() as *mut Context;
        unsafe {
            let e = create(ctx_ptr, 1, b"hello world", "t.rs", 1, ptr::null_mut());
            assert_eq!(ErrorLink::message(e), b"hello world");
        }
    }
}
