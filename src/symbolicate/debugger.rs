//! The other implementation of the symbolication capability: instead
//! of parsing ELF state ourselves, drive a debugger attached to the
//! same pid and scrape its answers. Slower and heuristic, but it
//! understands anything the debugger does.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use anyhow::{bail, Context, Result};

use super::Symbolicator;
use crate::core::process::Pid;

/// Echoed back by the debugger to delimit one command's output, so no
/// stale text is left in the pipe between lookups.
const SENTINEL: &str = "drspin-sync";

pub struct DebuggerSymbolicator {
    child: Child,
    input: ChildStdin,
    output: BufReader<ChildStdout>,
    cache: HashMap<usize, String>,
}

impl DebuggerSymbolicator {
    /// Spawn `gdb` attached to `pid` and wait for it to become ready.
    pub fn attach(pid: Pid) -> Result<DebuggerSymbolicator> {
        let mut child = Command::new("gdb")
            .arg("-q")
            .arg("-nx")
            .arg("-p")
            .arg(pid.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("couldn't spawn gdb")?;
        let input = child.stdin.take().expect("gdb stdin is piped");
        let output = BufReader::new(child.stdout.take().expect("gdb stdout is piped"));

        let mut symbolicator = DebuggerSymbolicator {
            child,
            input,
            output,
            cache: HashMap::new(),
        };
        // The attach prologue's length depends on the target, so sync
        // on an echoed marker rather than a fixed line count.
        symbolicator.sync().context("gdb never became ready")?;
        Ok(symbolicator)
    }

    fn sync(&mut self) -> Result<()> {
        writeln!(self.input, "echo {}\\n", SENTINEL)?;
        self.input.flush()?;
        let mut line = String::new();
        loop {
            line.clear();
            if self.output.read_line(&mut line)? == 0 {
                bail!("gdb closed its output");
            }
            if line.contains(SENTINEL) {
                return Ok(());
            }
        }
    }

    fn lookup(&mut self, address: usize) -> Result<String> {
        writeln!(self.input, "info symbol {:#x}", address)?;
        writeln!(self.input, "echo {}\\n", SENTINEL)?;
        self.input.flush()?;

        let mut result = "???".to_string();
        let mut line = String::new();
        loop {
            line.clear();
            if self.output.read_line(&mut line)? == 0 {
                break;
            }
            if line.contains(SENTINEL) {
                break;
            }
            if let Some(parsed) = parse_symbol_line(&line) {
                result = parsed;
            }
        }
        Ok(result)
    }
}

impl Symbolicator for DebuggerSymbolicator {
    fn symbolicate(&mut self, address: usize) -> String {
        if address == 0 {
            return "...".to_string();
        }
        if let Some(cached) = self.cache.get(&address) {
            return cached.clone();
        }
        let result = match self.lookup(address) {
            Ok(result) => result,
            Err(e) => {
                warn!("debugger lookup for {:#x} failed: {}", address, e);
                "???".to_string()
            }
        };
        self.cache.insert(address, result.clone());
        result
    }
}

impl Drop for DebuggerSymbolicator {
    fn drop(&mut self) {
        // Ask for a clean exit, but don't let a confirmation prompt
        // keep the child around.
        let _ = writeln!(self.input, "quit");
        let _ = self.input.flush();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Extract `symbol + offset (in image)` from a gdb `info symbol`
/// reply such as `malloc + 52 in section .text of /lib/libc.so.6`.
/// Anything else (errors, echoes, prompts) yields `None`.
fn parse_symbol_line(line: &str) -> Option<String> {
    let line = line.trim_end();
    let (location, rest) = line.split_once(" in section ")?;
    match rest.split_once(" of ") {
        Some((_, path)) => {
            let image = path.rsplit('/').next().unwrap_or(path);
            Some(format!("{} (in {})", location, image))
        }
        // The main executable's section carries no path.
        None => Some(location.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_reply_with_an_image_path() {
        let line = "malloc + 52 in section .text of /lib/x86_64-linux-gnu/libc.so.6\n";
        assert_eq!(
            parse_symbol_line(line),
            Some("malloc + 52 (in libc.so.6)".to_string())
        );
    }

    #[test]
    fn parses_a_reply_without_an_image_path() {
        let line = "main + 10 in section .text";
        assert_eq!(parse_symbol_line(line), Some("main + 10".to_string()));
    }

    #[test]
    fn a_symbol_with_no_offset_keeps_its_bare_name() {
        let line = "_start in section .text of /usr/bin/spin";
        assert_eq!(parse_symbol_line(line), Some("_start (in spin)".to_string()));
    }

    #[test]
    fn non_answers_are_ignored() {
        assert_eq!(parse_symbol_line("No symbol matches 0x1234.\n"), None);
        assert_eq!(parse_symbol_line("(gdb) \n"), None);
        assert_eq!(parse_symbol_line(""), None);
    }
}
