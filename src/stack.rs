//! Call stacks captured at allocation time, for the leak report only.

use std::{cell::Cell, ffi::c_void, fmt, hint, marker::PhantomData};

/// How many return addresses we keep per allocation
pub const MAX_FRAMES: usize = 16;

thread_local! {
    static ENTRY_FRAME: Cell<usize> = const { Cell::new(0) };
}

/// Marks the calling function's stack frame as where the tracker was entered
/// from the outside. While one is alive, [`CapturedStack::capture`] leaves
/// out that frame and everything called from it, so a stack starts at
/// whoever called `malloc()`.
///
/// Only the outermost entry on a thread counts.
pub struct EntryFrame {
    set: bool,
    _not_send: PhantomData<*const ()>,
}

impl EntryFrame {
    /// Must be inlined: the marker has to live in the caller's frame.
    #[inline(always)]
    pub fn enter() -> Self {
        let marker = 0u8;
        let address = hint::black_box(&marker) as *const u8 as usize;
        let set = ENTRY_FRAME
            .try_with(|entry| {
                if entry.get() == 0 {
                    entry.set(address);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        Self {
            set,
            _not_send: PhantomData,
        }
    }

    fn current() -> usize {
        ENTRY_FRAME.try_with(Cell::get).unwrap_or(0)
    }
}

impl Drop for EntryFrame {
    fn drop(&mut self) {
        if self.set {
            _ = ENTRY_FRAME.try_with(|entry| entry.set(0));
        }
    }
}

/// A bounded, fixed-size list of instruction pointers. Fixed-size so that it
/// can be captured from inside `malloc()` and stored inline in a registry
/// node without any extra allocation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CapturedStack {
    frames: [usize; MAX_FRAMES],
    len: usize,
}

impl CapturedStack {
    pub const fn empty() -> Self {
        Self {
            frames: [0; MAX_FRAMES],
            len: 0,
        }
    }

    /// Walk the current thread's stack. Never allocates on Linux (the walk is
    /// `_Unwind_Backtrace()`), but call it under the re-entry guard anyway in
    /// case the unwinder lazily loads something.
    ///
    /// Under an [`EntryFrame`], the frames from the entry inward are skipped
    /// and don't count against [`MAX_FRAMES`].
    pub fn capture() -> Self {
        Self::capture_outside(EntryFrame::current())
    }

    /// Skip frames up to and including the one whose stack holds `entry`,
    /// or nothing if `entry` is 0. `Frame::sp()` is the canonical frame
    /// address on the unwinders we run on: just above the frame's own
    /// locals, and below its caller's.
    fn capture_outside(entry: usize) -> Self {
        let mut stack = Self::empty();
        let mut inside = entry != 0;
        // SAFETY: the unsynchronized variant is only unsound where the
        // platform unwinder isn't thread safe; libgcc's unwinder is.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if inside {
                    // the first frame above the marker is the one holding it
                    inside = frame.sp() as usize <= entry;
                    return true;
                }
                stack.push(frame.ip() as usize)
            });
        }
        stack
    }

    /// Build a stack from known addresses, truncating to [`MAX_FRAMES`].
    pub fn from_frames(frames: &[usize]) -> Self {
        let mut stack = Self::empty();
        for &ip in frames {
            if !stack.push(ip) {
                break;
            }
        }
        stack
    }

    /// Returns whether there is room for more frames
    fn push(&mut self, ip: usize) -> bool {
        if self.len < MAX_FRAMES {
            self.frames[self.len] = ip;
            self.len += 1;
        }
        self.len < MAX_FRAMES
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One line per frame: `<indent>#<i> <ip>` and, when the symbolizer can
    /// find them, the demangled symbol name and `file:line`.
    ///
    /// Symbolication allocates, so run this under the re-entry guard.
    pub fn write_symbolicated<W: fmt::Write>(&self, w: &mut W, indent: &str) -> fmt::Result {
        for (i, &ip) in self.frames().iter().enumerate() {
            let mut result = Ok(());
            let mut resolved = false;
            backtrace::resolve(ip as *mut c_void, |symbol| {
                // Inlined frames resolve to several symbols; the first is the
                // innermost, which is the one we want.
                if resolved {
                    return;
                }
                resolved = true;
                result = (|| {
                    write!(w, "{indent}#{i} {ip:#x}")?;
                    if let Some(name) = symbol.name() {
                        write!(w, " {name}")?;
                    }
                    if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                        write!(w, " ({}:{line})", file.display())?;
                    }
                    writeln!(w)
                })();
            });
            result?;
            if !resolved {
                writeln!(w, "{indent}#{i} {ip:#x}")?;
            }
        }
        Ok(())
    }

    /// Like [`CapturedStack::write_symbolicated`], but addresses only.
    pub fn write_raw<W: fmt::Write>(&self, w: &mut W, indent: &str) -> fmt::Result {
        for (i, &ip) in self.frames().iter().enumerate() {
            writeln!(w, "{indent}#{i} {ip:#x}")?;
        }
        Ok(())
    }
}

struct Hex(usize);

impl fmt::Debug for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for CapturedStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.frames().iter().map(|&ip| Hex(ip)))
            .finish()
    }
}
