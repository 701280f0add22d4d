use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{App, Arg};
use log::warn;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use drspin::core::process::{Pid, ProcessRecord};
use drspin::sampler::Sampler;
use drspin::symbolicate::ElfSymbolicator;
use drspin::ui::report::write_report;

/// Set from the signal handlers, polled at the top of every sampling
/// tick.
static GOT_SIGNAL: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signo: libc::c_int) {
    GOT_SIGNAL.store(true, Ordering::Relaxed);
}

fn main() {
    env_logger::init();

    if let Err(error) = do_main() {
        eprintln!("drspin: {:#}", error);
        exit(1);
    }
}

fn do_main() -> Result<()> {
    let (pid, seconds) = parse_args();

    install_signal_handlers()?;

    let mut process = ProcessRecord::new(pid)?;
    println!(
        "Sampling process {} [{}] for {} seconds with 1 millisecond of run time between samples...",
        process.name(),
        pid,
        seconds
    );

    let mut sampler = Sampler::attach(pid, seconds)?;
    if let Some(bytes) = max_frame_bytes_override() {
        sampler.set_max_frame_bytes(bytes);
    }
    sampler.run(&mut process, &GOT_SIGNAL)?;

    println!("Sampling completed.  Processing symbols...");

    // The link map is read while the target is still stopped; only
    // then may it run again.
    let mut symbolicator = ElfSymbolicator::new(pid).context("couldn't build the symbolicator")?;
    sampler.detach()?;

    let stdout = std::io::stdout();
    write_report(&mut stdout.lock(), &process, &mut symbolicator)?;
    Ok(())
}

fn parse_args() -> (Pid, u64) {
    let matches = arg_parser().get_matches_safe().unwrap_or_else(|_| usage());
    let pid = match matches.value_of("pid").expect("pid is required").parse() {
        Ok(pid) => pid,
        Err(_) => usage(),
    };
    let seconds = match matches
        .value_of("seconds")
        .expect("seconds is required")
        .parse()
    {
        Ok(seconds) if seconds >= 1 => seconds,
        _ => usage(),
    };
    (pid, seconds)
}

fn usage() -> ! {
    eprintln!("usage:\n\tdrspin <pid> <seconds>");
    exit(1);
}

/// The stack walker's frame-size cutoff, overridable without touching
/// the fixed two-argument invocation.
fn max_frame_bytes_override() -> Option<usize> {
    let value = std::env::var("DRSPIN_MAX_FRAME_BYTES").ok()?;
    match value.parse() {
        Ok(bytes) => Some(bytes),
        Err(_) => {
            warn!("ignoring unparseable DRSPIN_MAX_FRAME_BYTES: {:?}", value);
            None
        }
    }
}

fn arg_parser() -> App<'static, 'static> {
    App::new("drspin")
        .about("Sampling profiler: stops a process once a millisecond and aggregates its threads' stacks")
        .arg(
            Arg::with_name("pid")
                .help("pid of the process to sample")
                .required(true),
        )
        .arg(
            Arg::with_name("seconds")
                .help("how long to sample, in seconds")
                .required(true),
        )
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("couldn't install the {} handler", signal))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_parsing() {
        let matches = arg_parser()
            .get_matches_from_safe(vec!["drspin", "1234", "5"])
            .unwrap();
        assert_eq!(matches.value_of("pid"), Some("1234"));
        assert_eq!(matches.value_of("seconds"), Some("5"));

        assert!(arg_parser()
            .get_matches_from_safe(vec!["drspin", "1234"])
            .is_err());
        assert!(arg_parser()
            .get_matches_from_safe(vec!["drspin", "1234", "5", "extra"])
            .is_err());
    }
}
