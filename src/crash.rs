//! Fatal signal handlers.
//!
//! A fault inside the engine takes the whole host process down. Before it
//! does, leave one line on stderr naming the signal so the crash shows up in
//! device logs, then restore the default disposition and re-raise.

use std::sync::Once;

use tracing::debug;

static INSTALL: Once = Once::new();

/// Signals intercepted by [`install`].
#[cfg(unix)]
pub const FATAL_SIGNALS: [libc::c_int; 4] = [libc::SIGSEGV, libc::SIGABRT, libc::SIGILL, libc::SIGFPE];

/// Name of a fatal signal, `"UNKNOWN"` for anything else.
#[cfg(unix)]
pub fn signal_name(signum: libc::c_int) -> &'static str {
    match signum {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGABRT => "SIGABRT",
        libc::SIGILL => "SIGILL",
        libc::SIGFPE => "SIGFPE",
        _ => "UNKNOWN",
    }
}

#[cfg(unix)]
fn crash_message(signum: libc::c_int) -> &'static [u8] {
    match signum {
        libc::SIGSEGV => b"CRITICAL ENGINE CRASH: SIGSEGV\n",
        libc::SIGABRT => b"CRITICAL ENGINE CRASH: SIGABRT\n",
        libc::SIGILL => b"CRITICAL ENGINE CRASH: SIGILL\n",
        libc::SIGFPE => b"CRITICAL ENGINE CRASH: SIGFPE\n",
        _ => b"CRITICAL ENGINE CRASH: UNKNOWN\n",
    }
}

// Only async-signal-safe calls in here: write, signal, raise.
#[cfg(unix)]
extern "C" fn on_fatal_signal(signum: libc::c_int) {
    let msg = crash_message(signum);
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::signal(signum, libc::SIG_DFL);
        libc::raise(signum);
    }
}

/// Install the handlers once per process.
pub fn install() {
    INSTALL.call_once(|| {
        #[cfg(unix)]
        {
            let handler = on_fatal_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            for signum in FATAL_SIGNALS {
                // SAFETY: the handler only performs async-signal-safe calls.
                unsafe {
                    libc::signal(signum, handler);
                }
            }
            debug!("Fatal signal handlers installed");
        }
    });
}
