//! Runtime tuning: a `MALLOC_OPTIONS` environment string parsed once,
//! plus an optional external trace hook.  Parsing goes through
//! `getenv` directly so that option lookup never allocates; the
//! allocator consults the options on its own entry paths.
use std::ffi::c_void;
use std::os::raw::c_char;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Options {
    /// `Z`: zero every byte of every allocation.
    zero: bool,
    /// `H`: advise the kernel that freed zones are reclaimable.
    madvise: bool,
    /// `U`: invoke the registered trace hook.
    trace: bool,
}

fn apply(opts: &mut Options, ch: u8) {
    match ch {
        b'U' => opts.trace = true,
        b'u' => opts.trace = false,
        b'Z' => opts.zero = true,
        b'z' => opts.zero = false,
        b'H' => opts.madvise = true,
        b'h' => opts.madvise = false,
        // Unknown characters are ignored.
        _ => {}
    }
}

fn parse(bytes: impl Iterator<Item = u8>) -> Options {
    let mut opts = Options::default();

    for ch in bytes {
        apply(&mut opts, ch);
    }
    opts
}

fn parse_env() -> Options {
    let raw = unsafe { libc::getenv(b"MALLOC_OPTIONS\0".as_ptr() as *const c_char) };

    if raw.is_null() {
        return Options::default();
    }

    let mut len = 0;
    while unsafe { *raw.add(len) } != 0 {
        len += 1;
    }

    parse((0..len).map(|i| unsafe { *raw.add(i) } as u8))
}

lazy_static::lazy_static! {
    static ref OPTIONS: Options = parse_env();
}

#[inline]
pub(crate) fn zero_all() -> bool {
    OPTIONS.zero
}

#[inline]
pub(crate) fn madvise_freed() -> bool {
    OPTIONS.madvise
}

/// Operations reported to the trace hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceOp {
    Alloc,
    Free,
    Realloc,
}

/// External trace hook: `(op, input pointer, request size, result)`.
/// Hooks run on the calling thread, outside any allocator lock, and
/// may themselves allocate.
pub type TraceHook = fn(op: TraceOp, ptr: *mut c_void, size: usize, result: *mut c_void);

static TRACE_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Installs (or clears) the external trace hook.  It only fires when
/// the `U` option is set.
pub fn set_trace_hook(hook: Option<TraceHook>) {
    let raw = match hook {
        Some(f) => f as usize,
        None => 0,
    };

    TRACE_HOOK.store(raw, Ordering::Release);
}

#[inline]
pub(crate) fn trace(op: TraceOp, ptr: *mut c_void, size: usize, result: *mut c_void) {
    if !OPTIONS.trace {
        return;
    }

    let raw = TRACE_HOOK.load(Ordering::Acquire);
    if raw != 0 {
        let hook: TraceHook = unsafe { std::mem::transmute(raw) };
        hook(op, ptr, size, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_flags() {
        let opts = parse(b"ZHU".iter().cloned());
        assert!(opts.zero && opts.madvise && opts.trace);

        // Lowercase disables, last writer wins.
        let opts = parse(b"Zz".iter().cloned());
        assert!(!opts.zero);

        let opts = parse(b"uU".iter().cloned());
        assert!(opts.trace);
    }

    #[test]
    fn ignores_unknown_flags() {
        let opts = parse(b"qwerty42!Z".iter().cloned());
        assert!(opts.zero);
        assert!(!opts.madvise);
        assert!(!opts.trace);
    }

    #[test]
    fn empty_means_defaults() {
        assert_eq!(parse(std::iter::empty()), Options::default());
    }
}
