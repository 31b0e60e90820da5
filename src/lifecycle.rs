//! Process-wide state, and what happens when the library is loaded, unloaded
//! or the process is interrupted.
//!
//! Initialization is lazy *and* eager: the loader runs [`on_load`] from
//! `.init_array`, but other libraries' constructors can call `malloc()`
//! before that, so every exported entry point calls [`Context::init`] too.
//! Whoever gets there first does the work; a call that lands in the middle
//! of it (`dlsym()` allocating, say) sees `INITIALIZING` and passes through.

use std::{
    fmt::{self, Write},
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

use crate::{
    alloc::{tracker::ReentryGuard, RealAlloc, Tracker},
    binding::NextAlloc,
    config::Config,
    putln,
    report::{self, FrameStyle},
    externc::tracked::SLOT_LOG,
    util::print::LineBuf,
};

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

pub struct Context<A>
where
    A: RealAlloc,
{
    tracker: Tracker<A>,
    state: AtomicU8,
    reported: AtomicBool,
}

/// The one tracker that the exported `malloc()` family feeds.
pub static CONTEXT: Context<NextAlloc> = Context::new(NextAlloc);

impl<A> Context<A>
where
    A: RealAlloc,
{
    pub const fn new(allocator: A) -> Self {
        Self {
            tracker: Tracker::new(allocator),
            state: AtomicU8::new(STATE_UNINIT),
            reported: AtomicBool::new(false),
        }
    }

    pub fn tracker(&self) -> &Tracker<A> {
        &self.tracker
    }

    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    /// Initialize from the process environment, once.
    #[inline]
    pub fn init(&self) {
        if !self.is_ready() {
            self.init_with(Config::from_env);
        }
    }

    /// Returns whether the context is ready. `false` means another call
    /// (maybe further up this very stack) is initializing right now.
    pub fn init_with<F>(&self, config: F) -> bool
    where
        F: FnOnce() -> Config,
    {
        match self.state.compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(state) => return state == STATE_READY,
        }

        // Binding happens here, and may re-enter us
        let bound = self.tracker.registry().allocator().ready();
        let config = config();
        self.tracker.set_verbose(config.verbose);
        self.tracker.set_enabled(bound && config.enabled);

        let pid = unsafe { libc::getpid() };
        if self.tracker.is_enabled() {
            putln!("Memory Tracker: Initialized (PID: {pid})");
        } else {
            putln!("Memory Tracker: Tracking disabled (PID: {pid})");
        }
        self.state.store(STATE_READY, Ordering::Release);
        true
    }

    /// Claim the one report this process gets. Tracking stops for good, so
    /// anything the report itself allocates goes untracked.
    fn claim_report(&self) -> bool {
        if !self.is_ready() || self.reported.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Nothing was recorded if tracking was never on
        self.tracker.disable()
    }

    /// Print the leak report to stderr, once. Called at unload.
    pub fn shutdown(&self) {
        if !self.claim_report() {
            return;
        }
        let _guard = ReentryGuard::enter();
        let mut out = LineBuf::<1024>::stderr();
        _ = self.write_report(&mut out, FrameStyle::Symbolicated);
    }

    /// Like [`Context::shutdown`], but safe to run from a signal handler:
    /// never waits for the registry lock and never symbolizes. If the
    /// interrupted code holds the lock, a notice is printed instead.
    pub fn flush_on_signal(&self) {
        self.write_signal_report(&mut LineBuf::<1024>::stderr());
    }

    fn write_signal_report<W: fmt::Write>(&self, w: &mut W) {
        if !self.claim_report() {
            return;
        }
        let written = self.tracker.registry().try_visit(|stats, records| {
            report::write_report(w, stats, records, FrameStyle::Raw)
        });
        if written.is_none() {
            _ = writeln!(w, "Memory Tracker: registry busy at signal, leak report skipped");
        }
    }

    /// The leak report, as of now. Waits for the registry lock, so call it
    /// with the re-entry guard held or tracking off.
    pub fn write_report<W: fmt::Write>(&self, w: &mut W, style: FrameStyle) -> fmt::Result {
        self.tracker
            .registry()
            .visit(|stats, records| report::write_report(w, stats, records, style))
    }
}

extern "C" fn on_signal(sig: libc::c_int) {
    CONTEXT.flush_on_signal();
    // SA_RESETHAND already put the default disposition back, and the signal
    // is blocked until we return, so this kills us as it would have anyway.
    unsafe { libc::raise(sig) };
}

/// Flush the report on SIGINT/SIGTERM, but only where the program hasn't
/// set up its own handling.
pub fn install_signal_handlers() {
    for sig in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: zeroed `sigaction`s are valid, and we only install a handler
        // over the default disposition.
        unsafe {
            let mut old: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(sig, std::ptr::null(), &mut old) != 0
                || old.sa_sigaction != libc::SIG_DFL
            {
                continue;
            }
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESETHAND;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                putln!("Memory Tracker: could not install handler for signal {sig}");
            }
        }
    }
}

unsafe extern "C" fn prepare_fork() {
    CONTEXT.tracker().before_fork();
    SLOT_LOG.before_fork();
}

unsafe extern "C" fn parent_after_fork() {
    SLOT_LOG.after_fork(false);
    CONTEXT.tracker().after_fork(false);
}

unsafe extern "C" fn child_after_fork() {
    SLOT_LOG.after_fork(true);
    CONTEXT.tracker().after_fork(true);
}

/// Keep `fork()` from handing the child a lock that some other thread of the
/// parent held, and that nobody in the child will ever release.
pub fn install_fork_handlers() {
    // SAFETY: the handlers only take and release our own locks
    let rc = unsafe {
        libc::pthread_atfork(
            Some(prepare_fork),
            Some(parent_after_fork),
            Some(child_after_fork),
        )
    };
    if rc != 0 {
        putln!("Memory Tracker: could not install fork handlers (error {rc})");
    }
}

/// Run by the dynamic loader before `main()`.
pub extern "C" fn on_load() {
    CONTEXT.init();
    install_fork_handlers();
    if CONTEXT.tracker().is_enabled() {
        install_signal_handlers();
    }
}

/// Run by the dynamic loader after `main()` returns or on `exit()`.
pub extern "C" fn on_unload() {
    CONTEXT.shutdown();
}

#[cfg(not(test))]
#[used]
#[link_section = ".init_array"]
static ON_LOAD: extern "C" fn() = on_load;

#[cfg(not(test))]
#[used]
#[link_section = ".fini_array"]
static ON_UNLOAD: extern "C" fn() = on_unload;
