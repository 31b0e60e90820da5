//! Text output: per-event lines, the leak report and the slot-table summary.
//!
//! Everything here writes to any [`fmt::Write`], so the same code feeds a
//! stack [`LineBuf`](crate::util::print::LineBuf) at runtime and a `String`
//! in tests.

use std::fmt;

use crate::alloc::{
    registry::AllocationRecord,
    slots::SlotTable,
    stats::{Change, Stats},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Alloc,
    Free,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Alloc => "ALLOC",
            Self::Free => "FREE",
        })
    }
}

/// `ALLOC 0x5581e0, size=100, total_usage=300`
pub fn write_event<W: fmt::Write>(
    w: &mut W,
    event: Event,
    address: usize,
    change: Change,
) -> fmt::Result {
    writeln!(
        w,
        "{event} {address:#x}, size={}, total_usage={}",
        change.size, change.current_usage
    )
}

/// How to print the call stack under each leak.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStyle {
    /// Addresses and epoch seconds only. Never allocates or takes a libc
    /// lock, so it can run in a signal handler.
    Raw,
    /// Resolve symbol names and source lines where debug info allows.
    Symbolicated,
}

/// A Unix timestamp, displayed like `ctime()` in the local timezone:
/// `Thu Mar  7 14:02:11 2024`.
pub struct LocalTime(pub u64);

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self.0 as libc::time_t;
        let mut tm = std::mem::MaybeUninit::<libc::tm>::uninit();
        let mut buf = [0u8; 64];
        // SAFETY: `tm` is only read if `localtime_r()` filled it in, and
        // `strftime()` never writes more than `buf.len()` bytes.
        let len = unsafe {
            if libc::localtime_r(&time, tm.as_mut_ptr()).is_null() {
                0
            } else {
                libc::strftime(
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    c"%a %b %e %H:%M:%S %Y".as_ptr(),
                    tm.as_ptr(),
                )
            }
        };
        match std::str::from_utf8(&buf[..len]) {
            Ok(s) if len > 0 => f.write_str(s),
            _ => write!(f, "@{}", self.0),
        }
    }
}

pub fn write_report_header<W: fmt::Write>(w: &mut W, stats: &Stats) -> fmt::Result {
    writeln!(w, "\n=== MEMORY LEAK REPORT ===")?;
    writeln!(
        w,
        "Total allocated: {} bytes ({} allocations)",
        stats.total_allocated, stats.allocation_count
    )?;
    writeln!(
        w,
        "Total freed: {} bytes ({} frees)",
        stats.total_freed, stats.free_count
    )?;
    writeln!(w, "Current usage: {} bytes", stats.current_usage)?;
    writeln!(w, "Peak usage: {} bytes", stats.peak_usage)?;
    writeln!(w, "Untracked frees: {}", stats.untracked_frees)
}

pub fn write_leak<W: fmt::Write>(
    w: &mut W,
    record: &AllocationRecord,
    style: FrameStyle,
) -> fmt::Result {
    write!(w, "  LEAK: {} bytes at {:#x} ", record.size, record.address)?;
    match style {
        FrameStyle::Raw => {
            writeln!(w, "(allocated at @{})", record.timestamp)?;
            record.stack.write_raw(w, "    ")
        }
        FrameStyle::Symbolicated => {
            writeln!(w, "(allocated at {})", LocalTime(record.timestamp))?;
            record.stack.write_symbolicated(w, "    ")
        }
    }
}

pub const REPORT_FOOTER: &str = "=========================\n";

/// The whole leak report for `stats` and the records still live.
pub fn write_report<'a, W, I>(
    w: &mut W,
    stats: &Stats,
    records: I,
    style: FrameStyle,
) -> fmt::Result
where
    W: fmt::Write,
    I: IntoIterator<Item = &'a AllocationRecord>,
{
    write_report_header(w, stats)?;
    let mut records = records.into_iter().peekable();
    if records.peek().is_none() {
        writeln!(w, "No memory leaks detected!")?;
    } else {
        writeln!(w, "\nLEAKED ALLOCATIONS:")?;
        for record in records {
            write_leak(w, record, style)?;
        }
    }
    writeln!(w, "{REPORT_FOOTER}")
}

/// The summary block for a [`SlotTable`], with each live block's age as of
/// `now`.
pub fn write_slot_summary<W: fmt::Write, const N: usize>(
    w: &mut W,
    table: &SlotTable<N>,
    now: u64,
) -> fmt::Result {
    let stats = table.stats();
    writeln!(w, "\n=== HEAP TRACKER SUMMARY ===")?;
    writeln!(w, "Total allocated: {} bytes", stats.total_allocated)?;
    writeln!(w, "Total freed: {} bytes", stats.total_freed)?;
    writeln!(w, "Current usage: {} bytes", stats.current_usage)?;
    writeln!(w, "Peak usage: {} bytes", stats.peak_usage)?;
    writeln!(w, "Active allocations: {}", table.active())?;
    if table.active() == 0 {
        writeln!(w, "No memory leaks detected!")?;
    } else {
        writeln!(w, "\nACTIVE ALLOCATIONS (POTENTIAL LEAKS):")?;
        for slot in table.live() {
            writeln!(
                w,
                "  {:#x}: {} bytes (age: {} seconds)",
                slot.address,
                slot.size,
                now.saturating_sub(slot.timestamp)
            )?;
        }
    }
    writeln!(w, "===========================")
}
