// Grad mode: thread-local switch for graph recording
//
// Forward functions only attach a backward node to their outputs when grad
// mode is enabled and some input requires grad. The engine turns grad mode
// off while running backward nodes, unless the caller asked for
// `create_graph`, in which case backward nodes record second-order nodes.

use std::cell::Cell;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether forward operations on this thread record graph nodes.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

/// Restores the previous grad mode on drop, including during unwinding.
struct GradModeGuard {
    prev: bool,
}

impl Drop for GradModeGuard {
    fn drop(&mut self) {
        GRAD_ENABLED.with(|g| g.set(self.prev));
    }
}

/// Run `f` with grad mode set to `enabled`.
pub fn with_grad_mode<R>(enabled: bool, f: impl FnOnce() -> R) -> R {
    let prev = GRAD_ENABLED.with(|g| g.replace(enabled));
    let _guard = GradModeGuard { prev };
    f()
}

/// Run `f` without recording graph nodes.
pub fn no_grad<R>(f: impl FnOnce() -> R) -> R {
    with_grad_mode(false, f)
}
