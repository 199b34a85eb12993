//! Fork hooks.  A child must not inherit a lock frozen mid-operation
//! by some other thread, so before `fork(2)` we acquire the depot
//! lock and then the rack lock, and both sides release them in
//! reverse order.  Class and shard locks are leaves taken only around
//! pointer juggling and are left alone.
use std::sync::Once;

use crate::depot;
use crate::rack;

static REGISTER: Once = Once::new();

unsafe extern "C" fn prefork() {
    depot::raw_lock();
    rack::raw_lock();
}

unsafe extern "C" fn postfork_parent() {
    rack::raw_unlock();
    depot::raw_unlock();
}

unsafe extern "C" fn postfork_child() {
    rack::raw_unlock();
    depot::raw_unlock();
}

/// Registers the hooks with the host runtime, once per process.
pub(crate) fn register() {
    REGISTER.call_once(|| {
        let rc = unsafe {
            libc::pthread_atfork(Some(prefork), Some(postfork_parent), Some(postfork_child))
        };

        if rc != 0 {
            log::warn!("pthread_atfork failed: {}", rc);
        }
    });
}
