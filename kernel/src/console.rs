//! Console.
//!
//! Output goes to a pluggable byte sink: the hosted runner installs one
//! writing to its stdout, tests install a capture buffer, and with no
//! sink installed output is discarded. [`putbuf`] is the primitive user
//! programs reach through `write(1, ...)`; the kernel's own messages use
//! the [`kprint!`]/[`kprintln!`] macros. Keyboard input arrives through
//! a fixed-size queue that the embedding fills.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;
use spin::Mutex;

/// Receives console output bytes.
pub trait ByteSink: Send {
    fn write_bytes(&mut self, bytes: &[u8]);
}

static SINK: Mutex<Option<Box<dyn ByteSink>>> = Mutex::new(None);

/// Sizes of every `putbuf` call since the last reset, for inspecting
/// write chunking.
static PUTBUF_SIZES: Mutex<Vec<usize>> = Mutex::new(Vec::new());

static INPUT: OnceCell<ArrayQueue<u8>> = OnceCell::uninit();

const INPUT_QUEUE_SIZE: usize = 1024;

pub fn set_sink(sink: Option<Box<dyn ByteSink>>) {
    *SINK.lock() = sink;
}

/// A sink that appends to a shared byte buffer.
pub struct CaptureSink(Arc<Mutex<Vec<u8>>>);

impl ByteSink for CaptureSink {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.0.lock().extend_from_slice(bytes);
    }
}

/// Installs a capture sink and returns the buffer it fills.
pub fn capture() -> Arc<Mutex<Vec<u8>>> {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    set_sink(Some(Box::new(CaptureSink(buffer.clone()))));
    buffer
}

fn write_out(bytes: &[u8]) {
    if let Some(sink) = SINK.lock().as_mut() {
        sink.write_bytes(bytes);
    }
}

/// Writes a buffer of program output to the console.
pub fn putbuf(bytes: &[u8]) {
    PUTBUF_SIZES.lock().push(bytes.len());
    write_out(bytes);
}

/// The sizes of all `putbuf` calls so far.
pub fn putbuf_sizes() -> Vec<usize> {
    PUTBUF_SIZES.lock().clone()
}

struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_out(s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = ConsoleWriter.write_fmt(args);
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($arg:tt)*) => {
        $crate::kprint!("{}\n", format_args!($($arg)*))
    };
}

fn input_queue() -> &'static ArrayQueue<u8> {
    let _ = INPUT.try_init_once(|| ArrayQueue::new(INPUT_QUEUE_SIZE));
    INPUT.get().expect("input queue init failed")
}

/// Queues a byte of keyboard input. Returns false if the queue is full.
pub fn input_push(byte: u8) -> bool {
    input_queue().push(byte).is_ok()
}

/// Takes the next byte of queued input, if any.
pub(crate) fn input_pop() -> Option<u8> {
    input_queue().pop()
}

pub(crate) fn reset() {
    PUTBUF_SIZES.lock().clear();
    while input_pop().is_some() {}
}
