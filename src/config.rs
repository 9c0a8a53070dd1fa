//! Context configuration: standard block size, OOM policy, and unhandled
//! error tracking.

use crate::block::MEMBLOCK_MINIMUM;

/// Built-in standard block size used when a caller asks for the default.
pub const DEFAULT_STDSIZE: usize = 8192;

/// The smallest `stdsize` a [`crate::context::Context`] will accept. Chosen
/// so that the unsigned `stdsize - sizeof(block header)` comparison used
/// when picking a standard block can never underflow.
pub const MIN_STDSIZE: usize = 256;

const _: () = assert_min_stdsize_holds();
const fn assert_min_stdsize_holds() -> () {
    // MIN_STDSIZE must be able to hold at least one block header and one
    // memtree node, or a "standard block" could never be recycled as a
    // remnant once its bump region is exhausted.
    if MIN_STDSIZE < 64 {
        panic!("MIN_STDSIZE is unreasonably small");
    }
}

/// What to do when [`crate::raw::raw_alloc`] fails.
///
/// A closure-based policy so callers can plug in custom retry/abort
/// behaviour instead of a bare function pointer.
pub enum OomPolicy {
    /// Abort the process. The default when no handler is supplied — out of
    /// memory is the one case these routines treat as fatal rather than
    /// returning a value.
    Abort,
    /// Retry the allocation up to `attempts` times (busy looping is the
    /// caller's problem; a real handler would sleep or trim caches between
    /// attempts), then fail.
    Retry {
        attempts: u32,
        on_attempt: Box<dyn FnMut(usize)>,
    },
    /// Hand a null/failure straight back to the caller.
    FailNull,
    /// Fully custom policy: called with the requested size, returns `true`
    /// to retry once more, `false` to fail.
    Custom(Box<dyn FnMut(usize) -> bool>),
}

impl Default for OomPolicy {
    fn default() -> Self {
        OomPolicy::Abort
    }
}

/// Configuration accepted by [`crate::context::Context::create_custom`].
pub struct ContextConfig {
    pub stdsize: usize,
    pub oom_policy: OomPolicy,
    pub track_unhandled: bool,
    pub tracing: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            stdsize: DEFAULT_STDSIZE,
            oom_policy: OomPolicy::default(),
            track_unhandled: true,
            tracing: false,
        }
    }
}

impl ContextConfig {
    /// Clamps `stdsize` to `[MIN_STDSIZE, ..]`; `0` means "use the built-in
    /// default".
    pub(crate) fn normalised_stdsize(&self) -> usize {
        let requested = if self.stdsize == 0 {
            DEFAULT_STDSIZE
        } else {
            self.stdsize
        };
        let requested = requested.max(MIN_STDSIZE);
        debug_assert!(requested >= MEMBLOCK_MINIMUM);
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_means_default() {
        let cfg = ContextConfig {
            stdsize: 0,
            ..Default::default()
        };
        assert_eq!(cfg.normalised_stdsize(), DEFAULT_STDSIZE);
    }

    #[test]
    fn tiny_request_clamps_to_minimum() {
        let cfg = ContextConfig {
            stdsize: 1,
            ..Default::default()
        };
        assert_eq!(cfg.normalised_stdsize(), MIN_STDSIZE);
    }
}
