//! Hosted kernel runner.
//!
//! Boots the kernel in this process and drives the commands queued on
//! the command line, e.g.:
//!
//! ```text
//! minos -q run 'echo hello world'
//! ```

use std::io::Write as _;

use kernel::userprog::load::{install_image, ImageSegment};
use kernel::userprog::program::{self, UserCtx};
use kernel::{console, init};

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

struct StdoutSink;

impl console::ByteSink for StdoutSink {
    fn write_bytes(&mut self, bytes: &[u8]) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    }
}

fn host_exit() -> ! {
    std::process::exit(0);
}

/// Writes its arguments to the console, space-separated.
fn echo_body(ctx: &mut UserCtx) -> i32 {
    let args = ctx.arg_strings();
    let line = args[1..].join(" ") + "\n";
    // Stage the bytes in already-mapped stack space below esp, as user
    // code would stage a local buffer.
    let buf = ctx.esp() - (line.len() as u64 + 64);
    ctx.write_bytes(buf, line.as_bytes());
    ctx.sys_write(1, buf, line.len() as u32);
    0
}

/// Exits with the status given as its first argument.
fn exit_body(ctx: &mut UserCtx) -> i32 {
    let args = ctx.arg_strings();
    args.get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn main() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Info);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (options, commands) = init::parse_args(args.iter().map(String::as_str));

    init::bootstrap(&options);
    console::set_sink(Some(Box::new(StdoutSink)));
    init::set_power_off(host_exit);

    install_demo_programs();

    for command in &commands {
        init::run_command(command);
    }

    if options.quit {
        init::power_off();
    }
}

fn install_demo_programs() {
    let code = ImageSegment {
        vaddr: 0x0804_8000,
        data: b"\x90\x90\x90\x90".to_vec(),
        mem_size: 4096,
        writable: false,
    };
    for name in ["echo", "exit"] {
        if !install_image(
            name,
            &[ImageSegment {
                vaddr: code.vaddr,
                data: code.data.clone(),
                mem_size: code.mem_size,
                writable: code.writable,
            }],
        ) {
            log::warn!("could not install image for {}", name);
        }
    }
    program::register("echo", echo_body);
    program::register("exit", exit_body);
}
