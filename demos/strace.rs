use std::process;

use anyhow::Result;
use pinch::syscall::{self, Arg, Descriptor};
use pinch::{Command, Pid, Ptracer, Session, Stop, Tracee};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

/// Exit code when tracing itself fails, distinct from any tracee status we forward.
const ENGINE_ERROR_EXIT_CODE: i32 = 255;

/// Most elements of a string array to print.
const MAX_ARRAY_ELEMENTS: usize = 32;

#[derive(StructOpt, Debug)]
struct Opt {
    /// Maximum string length to print.
    #[structopt(short, long, default_value = "32")]
    string_limit: usize,

    /// Attach to a running process instead of spawning one.
    #[structopt(short = "p", long = "attach")]
    attach: Option<i32>,

    /// Only report signals and the exit status.
    #[structopt(short, long)]
    quiet: bool,

    #[structopt(required_unless = "attach")]
    argv: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::from_args();

    let code = match run(&opt) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("strace: {:#}", err);
            ENGINE_ERROR_EXIT_CODE
        },
    };

    process::exit(code);
}

fn run(opt: &Opt) -> Result<i32> {
    let ptracer = Ptracer::new();

    let mut session = match opt.attach {
        Some(pid) => Session::attach(ptracer, Pid::from_raw(pid))?,
        None => Session::spawn(ptracer, Command::new(opt.argv.clone())?)?,
    };

    // Syscall whose entry was seen, rendered, and waiting for its return value.
    let mut entered: Option<String> = None;

    loop {
        match session.advance()? {
            Stop::SyscallEntry { number } => {
                let call = render_call(session.tracee(), number, opt.string_limit);
                entered = Some(call);
            },
            Stop::SyscallExit { ret, .. } => {
                if let Some(call) = entered.take() {
                    if !opt.quiet {
                        eprintln!("{} = {}", call, render_return(ret));
                    }
                }
            },
            Stop::Exec { old, new } => {
                if let Some(call) = entered.take() {
                    if !opt.quiet {
                        eprintln!("{} = 0", call);
                    }
                }

                if old != new {
                    eprintln!("[ Process PID={} runs in {} mode. ]", session.pid(), new);
                }
            },
            Stop::SignalDelivered { signal } => {
                eprintln!("--- {} ---", signal_name(signal));
            },
            Stop::PtraceEvent { event, message } => {
                eprintln!("--- {:?} ({}) ---", event, message);
            },
            Stop::Exited { exit_code } => {
                print_unfinished(&mut entered, opt.quiet);
                eprintln!("+++ exited with {} +++", exit_code);
                break;
            },
            Stop::Killed { signal, core_dumped } => {
                print_unfinished(&mut entered, opt.quiet);
                let core = if core_dumped { " (core dumped)" } else { "" };
                eprintln!("+++ killed by {}{} +++", signal_name(signal), core);
                break;
            },
        }
    }

    if session.spawn_failed() {
        eprintln!("strace: could not execute {:?}", opt.argv.first());
    }

    Ok(session.status().unwrap_or(ENGINE_ERROR_EXIT_CODE))
}

// Calls like `exit_group()` never return.
fn print_unfinished(entered: &mut Option<String>, quiet: bool) {
    if let Some(call) = entered.take() {
        if !quiet {
            eprintln!("{} = ?", call);
        }
    }
}

fn render_call(tracee: &Tracee, number: u64, string_limit: usize) -> String {
    // Show a `socketcall(2)` as the socket syscall it multiplexes.
    if let Ok(Some(call)) = tracee.socket_call() {
        let args = render_args(tracee, call.args(), string_limit, Tracee::socket_argument);
        return format!("{}({})", call.name(), args);
    }

    let desc = syscall::describe(number, tracee.bitness());

    let name = match desc {
        Some(Descriptor { name, .. }) => name.to_owned(),
        None => format!("syscall_{:#x}", number),
    };

    let args = render_args(
        tracee,
        desc.and_then(|desc| desc.args),
        string_limit,
        Tracee::argument,
    );

    format!("{}({})", name, args)
}

type ReadArg = fn(&Tracee, usize) -> pinch::error::Result<u64>;

fn render_args(
    tracee: &Tracee,
    args: Option<&[Arg]>,
    string_limit: usize,
    read: ReadArg,
) -> String {
    let args = match args {
        Some(args) => args
            .iter()
            .enumerate()
            .map(|(index, arg)| render_arg(tracee, index, *arg, string_limit, read))
            .collect::<Vec<_>>(),
        None => (0..syscall::MAX_ARGS)
            .map(|index| render_arg(tracee, index, Arg::Int, string_limit, read))
            .collect(),
    };

    args.join(", ")
}

fn render_arg(
    tracee: &Tracee,
    index: usize,
    arg: Arg,
    string_limit: usize,
    read: ReadArg,
) -> String {
    let value = match read(tracee, index) {
        Ok(value) => value,
        Err(_) => return "?".into(),
    };

    if value == 0 && matches!(arg, Arg::Ptr | Arg::Str | Arg::StrArray | Arg::SockAddr) {
        return "NULL".into();
    }

    match arg {
        Arg::Int => format!("{}", value as i64),
        Arg::Fd => format!("{}", value as i32),
        Arg::Ptr => format!("{:#x}", value),
        Arg::Str => render_string(tracee, value, string_limit),
        Arg::StrArray => render_array(tracee, value, string_limit),
        Arg::SockAddr => match tracee.decode_socket_address(index) {
            Ok((decoded, _fd)) => format!("{{{}}}", decoded.address),
            Err(_) => format!("{:#x}", value),
        },
    }
}

// Unreadable memory is shown as its address.
fn render_string(tracee: &Tracee, addr: u64, string_limit: usize) -> String {
    match tracee.read_string(addr, Some(string_limit + 1)) {
        Ok(bytes) if bytes.len() > string_limit => {
            format!("{:?}...", String::from_utf8_lossy(&bytes[..string_limit]))
        },
        Ok(bytes) => format!("{:?}", String::from_utf8_lossy(&bytes)),
        Err(_) => format!("{:#x}", addr),
    }
}

fn render_array(tracee: &Tracee, base: u64, string_limit: usize) -> String {
    let mut elements = vec![];

    for index in 0.. {
        if index == MAX_ARRAY_ELEMENTS {
            elements.push("...".to_owned());
            break;
        }

        match tracee.decode_string_array_element(base, index) {
            Ok(Some(element)) => {
                let mut element = element;
                if element.len() > string_limit {
                    let mut end = string_limit;
                    while !element.is_char_boundary(end) {
                        end -= 1;
                    }
                    element.truncate(end);
                }
                elements.push(format!("{:?}", element));
            },
            Ok(None) => break,
            Err(_) => return format!("{:#x}", base),
        }
    }

    format!("[{}]", elements.join(", "))
}

fn render_return(ret: i64) -> String {
    match syscall::errno(ret) {
        Some(errno) => format!("-1 {:?} ({})", errno, errno.desc()),
        None if ret < 0 => format!("{:#x}", ret as u64),
        None => format!("{}", ret),
    }
}

fn signal_name(signal: i32) -> String {
    match nix::sys::signal::Signal::try_from(signal) {
        Ok(signal) => signal.as_str().to_owned(),
        Err(_) => format!("signal {}", signal),
    }
}
