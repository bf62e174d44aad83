use std::sync::atomic::{AtomicBool, Ordering};

/// Set on the first SIGINT/SIGTERM. The run stops before the next target.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Install handlers for cooperative shutdown.
///
/// The first signal sets [`SHUTDOWN`] and restores the default handler, so a
/// second signal terminates immediately.
pub fn install_signal_handlers() {
    #[cfg(unix)]
    {
        // Safety: the handler only stores an atomic and resets the disposition.
        unsafe {
            libc::signal(
                libc::SIGTERM,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
            libc::signal(
                libc::SIGINT,
                unix_signal_handler as *const () as libc::sighandler_t,
            );
        }
    }
}

#[cfg(unix)]
extern "C" fn unix_signal_handler(sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}
