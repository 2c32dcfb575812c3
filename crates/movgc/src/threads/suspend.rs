//! Platform suspension of mutators that do not reach a safepoint in time.
//!
//! On unix the collector sends [`SUSPEND_SIGNAL`] to the thread. The handler
//! finds the thread's records through a thread-local table, marks each one
//! that was asked to stop as suspended and sleeps in `sigsuspend` until
//! [`RESUME_SIGNAL`] arrives. Everything the handler touches is an atomic,
//! so it is safe at any instruction boundary.
//!
//! On Windows the collector freezes the thread with `SuspendThread` and
//! waits for the freeze to land with `GetThreadContext`.
//!
//! A thread inside a critical section (see
//! [`ThreadRecord::enter_critical`]) may hold locks the collector needs.
//! The handler returns at once and a frozen thread is thawed again; the
//! thread then acknowledges cooperatively when the section ends.

#[cfg(all(unix, not(miri)))]
pub use self::unix::{NativeThread, RESUME_SIGNAL, SUSPEND_SIGNAL};
#[cfg(all(windows, not(miri)))]
pub use self::windows::NativeThread;
#[cfg(any(miri, not(any(unix, windows))))]
pub use self::unsupported::NativeThread;

#[cfg(all(unix, not(miri)))]
pub(crate) use self::unix::{bind, install, send_resume, send_suspend, unbind, wait_for_resume};
#[cfg(all(windows, not(miri)))]
pub(crate) use self::windows::{freeze, thaw};

#[cfg(all(unix, not(miri)))]
mod unix {
    use std::mem;
    use std::ptr;
    use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

    use libc::c_int;
    use parking_lot::Once;

    use crate::threads::registry::{ThreadRecord, ThreadRegistry};

    /// Signal that parks a mutator.
    #[cfg(target_os = "linux")]
    pub const SUSPEND_SIGNAL: c_int = libc::SIGPWR;
    /// Signal that wakes a parked mutator.
    #[cfg(target_os = "linux")]
    pub const RESUME_SIGNAL: c_int = libc::SIGXCPU;
    /// Signal that parks a mutator.
    #[cfg(not(target_os = "linux"))]
    pub const SUSPEND_SIGNAL: c_int = libc::SIGUSR1;
    /// Signal that wakes a parked mutator.
    #[cfg(not(target_os = "linux"))]
    pub const RESUME_SIGNAL: c_int = libc::SIGUSR2;

    /// Collectors one OS thread can be registered with and still be
    /// suspended by signal. Further registrations rely on safepoints only.
    const MAX_BINDINGS: usize = 8;

    struct Binding {
        record: AtomicPtr<ThreadRecord>,
        registry: AtomicPtr<ThreadRegistry>,
    }

    impl Binding {
        const fn empty() -> Self {
            Self {
                record: AtomicPtr::new(ptr::null_mut()),
                registry: AtomicPtr::new(ptr::null_mut()),
            }
        }
    }

    thread_local! {
        static BINDINGS: [Binding; MAX_BINDINGS] =
            const { [const { Binding::empty() }; MAX_BINDINGS] };
    }

    static INSTALL: Once = Once::new();
    static INSTALLED: AtomicBool = AtomicBool::new(false);

    /// An OS thread that can be signalled.
    #[derive(Debug)]
    pub struct NativeThread(libc::pthread_t);

    // SAFETY: a pthread_t is an opaque id valid from any thread.
    unsafe impl Send for NativeThread {}
    // SAFETY: as above.
    unsafe impl Sync for NativeThread {}

    impl NativeThread {
        /// The calling thread.
        #[must_use]
        pub fn current() -> Option<Self> {
            // SAFETY: always safe to call.
            Some(Self(unsafe { libc::pthread_self() }))
        }
    }

    /// Installs the suspend and resume handlers once per process.
    pub fn install() {
        INSTALL.call_once(|| {
            // SAFETY: the actions are fully initialized and both handlers
            // only touch atomics and async-signal-safe calls.
            let installed = unsafe {
                let mut suspend: libc::sigaction = mem::zeroed();
                suspend.sa_sigaction = on_suspend as extern "C" fn(c_int) as libc::sighandler_t;
                suspend.sa_flags = libc::SA_RESTART;
                libc::sigemptyset(&mut suspend.sa_mask);
                libc::sigaddset(&mut suspend.sa_mask, RESUME_SIGNAL);

                let mut resume: libc::sigaction = mem::zeroed();
                resume.sa_sigaction = on_resume as extern "C" fn(c_int) as libc::sighandler_t;
                resume.sa_flags = libc::SA_RESTART;
                libc::sigemptyset(&mut resume.sa_mask);

                libc::sigaction(SUSPEND_SIGNAL, &suspend, ptr::null_mut()) == 0
                    && libc::sigaction(RESUME_SIGNAL, &resume, ptr::null_mut()) == 0
            };
            INSTALLED.store(installed, Ordering::Release);
        });
    }

    /// Makes `record` reachable from the suspend handler of the calling
    /// thread. Returns `false` when the table is full.
    pub fn bind(record: &ThreadRecord, registry: &ThreadRegistry) -> bool {
        BINDINGS.with(|bindings| {
            for binding in bindings {
                if binding.record.load(Ordering::Relaxed).is_null() {
                    binding
                        .registry
                        .store(ptr::from_ref(registry).cast_mut(), Ordering::Relaxed);
                    binding
                        .record
                        .store(ptr::from_ref(record).cast_mut(), Ordering::Release);
                    return true;
                }
            }
            false
        })
    }

    /// Removes `record` from the calling thread's table.
    pub fn unbind(record: &ThreadRecord) {
        let target = ptr::from_ref(record).cast_mut();
        BINDINGS.with(|bindings| {
            for binding in bindings {
                if binding.record.load(Ordering::Relaxed) == target {
                    binding.record.store(ptr::null_mut(), Ordering::Release);
                }
            }
        });
    }

    /// Asks `thread` to run the suspend handler.
    ///
    /// # Errors
    ///
    /// Returns the OS error code when the handlers are missing or the
    /// signal could not be sent.
    pub fn send_suspend(thread: &NativeThread) -> Result<(), i32> {
        if !INSTALLED.load(Ordering::Acquire) {
            return Err(libc::ENOSYS);
        }
        // SAFETY: the thread is registered, so it has not exited.
        match unsafe { libc::pthread_kill(thread.0, SUSPEND_SIGNAL) } {
            0 => Ok(()),
            code => Err(code),
        }
    }

    /// Wakes `thread` from [`wait_for_resume`].
    ///
    /// # Errors
    ///
    /// Returns the OS error code when the signal could not be sent.
    pub fn send_resume(thread: &NativeThread) -> Result<(), i32> {
        // SAFETY: as in `send_suspend`.
        match unsafe { libc::pthread_kill(thread.0, RESUME_SIGNAL) } {
            0 => Ok(()),
            code => Err(code),
        }
    }

    /// Sleeps inside the suspend handler until `resumed` holds.
    ///
    /// [`RESUME_SIGNAL`] stays blocked while the handler runs, so a resume
    /// sent between the check and `sigsuspend` is delivered by the latter.
    pub fn wait_for_resume(resumed: impl Fn() -> bool) {
        // SAFETY: `mask` is initialized by `sigfillset` before use.
        let mask = unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigfillset(&mut mask);
            for signal in [RESUME_SIGNAL, libc::SIGINT, libc::SIGQUIT, libc::SIGTERM] {
                libc::sigdelset(&mut mask, signal);
            }
            mask
        };
        while !resumed() {
            // SAFETY: `mask` is a valid signal set.
            unsafe { libc::sigsuspend(&mask) };
        }
    }

    extern "C" fn on_suspend(_signal: c_int) {
        let errno = errno_location();
        // SAFETY: errno is thread-local and always valid.
        let saved = errno.map(|errno| unsafe { *errno });
        BINDINGS.with(|bindings| {
            for binding in bindings {
                let record = binding.record.load(Ordering::Acquire);
                if record.is_null() {
                    continue;
                }
                let registry = binding.registry.load(Ordering::Relaxed);
                // SAFETY: bindings are cleared on this thread before the
                // record or its registry can be dropped.
                unsafe { (*record).park_in_signal(&*registry) };
            }
        });
        if let (Some(errno), Some(saved)) = (errno, saved) {
            // SAFETY: as above.
            unsafe { *errno = saved };
        }
    }

    extern "C" fn on_resume(_signal: c_int) {}

    #[cfg(any(target_os = "linux", target_os = "emscripten"))]
    fn errno_location() -> Option<*mut c_int> {
        // SAFETY: always safe to call.
        Some(unsafe { libc::__errno_location() })
    }

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    fn errno_location() -> Option<*mut c_int> {
        // SAFETY: always safe to call.
        Some(unsafe { libc::__error() })
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "emscripten",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    )))]
    fn errno_location() -> Option<*mut c_int> {
        None
    }
}

#[cfg(all(windows, not(miri)))]
mod windows {
    use std::mem;

    use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE};
    use windows_sys::Win32::System::Diagnostics::Debug::{GetThreadContext, CONTEXT};
    use windows_sys::Win32::System::Threading::{
        GetCurrentThreadId, OpenThread, ResumeThread, SuspendThread, THREAD_GET_CONTEXT,
        THREAD_QUERY_INFORMATION, THREAD_SUSPEND_RESUME,
    };

    #[cfg(target_arch = "x86_64")]
    use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_CONTROL_AMD64 as CONTEXT_CONTROL;
    #[cfg(target_arch = "aarch64")]
    use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_CONTROL_ARM64 as CONTEXT_CONTROL;
    #[cfg(target_arch = "x86")]
    use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_CONTROL_X86 as CONTEXT_CONTROL;

    /// An OS thread that can be frozen.
    #[derive(Debug)]
    pub struct NativeThread(HANDLE);

    // SAFETY: a thread handle may be used from any thread.
    unsafe impl Send for NativeThread {}
    // SAFETY: as above.
    unsafe impl Sync for NativeThread {}

    impl NativeThread {
        /// The calling thread.
        #[must_use]
        pub fn current() -> Option<Self> {
            // SAFETY: always safe to call; a null handle means failure.
            let handle = unsafe {
                OpenThread(
                    THREAD_SUSPEND_RESUME | THREAD_GET_CONTEXT | THREAD_QUERY_INFORMATION,
                    0,
                    GetCurrentThreadId(),
                )
            };
            (!handle.is_null()).then_some(Self(handle))
        }
    }

    impl Drop for NativeThread {
        fn drop(&mut self) {
            // SAFETY: the handle was opened by `current` and is closed once.
            unsafe { CloseHandle(self.0) };
        }
    }

    /// Freezes `thread` and waits until it no longer runs.
    ///
    /// # Errors
    ///
    /// Returns the OS error code when the thread could not be suspended.
    pub fn freeze(thread: &NativeThread) -> Result<(), i32> {
        // SAFETY: the handle is valid while the record lives.
        if unsafe { SuspendThread(thread.0) } == u32::MAX {
            // SAFETY: always safe to call.
            return Err(unsafe { GetLastError() } as i32);
        }
        // `SuspendThread` is asynchronous; reading the context waits for it.
        // SAFETY: CONTEXT is plain data.
        let mut context: CONTEXT = unsafe { mem::zeroed() };
        context.ContextFlags = CONTEXT_CONTROL;
        // SAFETY: as above.
        unsafe { GetThreadContext(thread.0, &mut context) };
        Ok(())
    }

    /// Undoes one [`freeze`].
    pub fn thaw(thread: &NativeThread) {
        // SAFETY: the handle is valid while the record lives.
        unsafe { ResumeThread(thread.0) };
    }
}

#[cfg(any(miri, not(any(unix, windows))))]
mod unsupported {
    /// Placeholder where threads can only stop at safepoints.
    #[derive(Debug)]
    pub struct NativeThread;

    impl NativeThread {
        /// Always `None`: no platform suspension here.
        #[must_use]
        pub const fn current() -> Option<Self> {
            None
        }
    }
}
