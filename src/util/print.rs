use std::{fmt, io};

/// A line buffer that lives on the stack and writes straight to a file
/// descriptor with `write(2)`. Nothing in here touches the heap, so it is
/// safe to use from inside `malloc()`.
///
/// Text is flushed when the buffer fills up, when [`LineBuf::flush`] is
/// called, and on drop. A line that fits in `N` bytes is emitted with a
/// single syscall, so concurrent writers don't interleave mid-line.
pub struct LineBuf<const N: usize> {
    fd: libc::c_int,
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> LineBuf<N> {
    pub const fn new(fd: libc::c_int) -> Self {
        Self {
            fd,
            buf: [0; N],
            len: 0,
        }
    }

    pub const fn stderr() -> Self {
        Self::new(libc::STDERR_FILENO)
    }

    /// Write everything buffered so far. Errors are swallowed: there is
    /// nowhere left to report them.
    pub fn flush(&mut self) {
        _ = write_all(self.fd, &self.buf[..self.len]);
        self.len = 0;
    }
}

impl<const N: usize> fmt::Write for LineBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            if self.len == N {
                self.flush();
            }
            let n = usize::min(N - self.len, bytes.len());
            self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
            self.len += n;
            bytes = &bytes[n..];
        }
        Ok(())
    }
}

impl<const N: usize> Drop for LineBuf<N> {
    fn drop(&mut self) {
        if self.len > 0 {
            self.flush();
        }
    }
}

/// `write(2)` all of `bytes`, retrying on `EINTR` and short writes.
pub fn write_all(fd: libc::c_int, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice, valid for `bytes.len()` reads.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        bytes = &bytes[n as usize..];
    }
    Ok(())
}

/// `eprintln!()`, but without allocating. Use this from anywhere that might
/// be running underneath `malloc()`.
#[macro_export]
macro_rules! putln {
    ($($arg:tt)*) => {{
        let mut line = $crate::util::print::LineBuf::<256>::stderr();
        _ = ::core::fmt::Write::write_fmt(&mut line, format_args!($($arg)*));
        _ = ::core::fmt::Write::write_str(&mut line, "\n");
    }};
}
