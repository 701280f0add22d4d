use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid as NixPid;

use crate::core::mem::RemoteMem;
use crate::core::process::{live_thread_ids, Pid, ProcessRecord, MAX_THREADS};
use crate::core::stack::{self, DEFAULT_MAX_FRAME_BYTES};

/// Run time given to the target between samples.
pub const TICK_INTERVAL: Duration = Duration::from_millis(1);

const TICKS_PER_SECOND: u64 = 1000;

/// Drives the target through stop/sample/resume ticks. Owns the ptrace
/// attachment: constructed attached, and detaches on `detach` or, as a
/// fallback, on drop.
pub struct Sampler {
    pid: Pid,
    ticks: u64,
    max_frame_bytes: usize,
    traced: Vec<Pid>,
}

impl Sampler {
    /// Attach to every live thread of `pid`. The stops this provokes
    /// are left pending; the first tick's wait consumes them.
    pub fn attach(pid: Pid, seconds: u64) -> Result<Sampler> {
        let mut sampler = Sampler {
            pid,
            ticks: seconds * TICKS_PER_SECOND,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            traced: Vec::new(),
        };
        for tid in live_thread_ids(pid)? {
            ptrace::attach(NixPid::from_raw(tid))
                .with_context(|| format!("couldn't attach to thread {} of process {}", tid, pid))?;
            sampler.traced.push(tid);
        }
        ensure!(!sampler.traced.is_empty(), "no live threads in process {}", pid);
        Ok(sampler)
    }

    pub fn set_max_frame_bytes(&mut self, bytes: usize) {
        self.max_frame_bytes = bytes;
    }

    /// The sampling loop: one tick per millisecond of target run time,
    /// ending early if `interrupted` is set. On return the target is
    /// still attached and stopped, so its link map can be read safely;
    /// call `detach` to let it run again.
    pub fn run(&mut self, process: &mut ProcessRecord, interrupted: &AtomicBool) -> Result<()> {
        for tick in 0..self.ticks {
            if interrupted.load(Ordering::Relaxed) {
                debug!("interrupted after {} ticks", tick);
                break;
            }

            // Consume the stops pending from attach (first tick) or
            // from the previous tick's SIGSTOP.
            self.wait_all()?;
            self.refresh_threads()?;
            self.sample_all(process)?;
            self.resume_all()?;

            std::thread::sleep(TICK_INTERVAL);

            self.stop_all()?;
        }

        // One final wait so the target is left in a clean stop.
        self.wait_all()?;
        Ok(())
    }

    /// Detach from every thread and let the target run. Consumes the
    /// sampler; the attachment is gone afterwards.
    pub fn detach(mut self) -> Result<()> {
        for &tid in &self.traced {
            ptrace::detach(NixPid::from_raw(tid), None)
                .with_context(|| format!("couldn't detach from thread {}", tid))?;
        }
        self.traced.clear();
        Ok(())
    }

    /// Attach to a thread discovered mid-run. Its stop is consumed
    /// right away: the thread gets sampled this same tick, so it must
    /// already be past its attach stop.
    fn trace_thread(&mut self, tid: Pid) -> Result<()> {
        ptrace::attach(NixPid::from_raw(tid))
            .with_context(|| format!("couldn't attach to thread {} of process {}", tid, self.pid))?;
        ensure!(
            self.expect_stop(tid)?,
            "thread {} of process {} exited while attaching",
            tid,
            self.pid
        );
        self.traced.push(tid);
        Ok(())
    }

    /// Wait for `tid` to report a stop; false means the thread is gone.
    fn expect_stop(&self, tid: Pid) -> Result<bool> {
        let status = waitpid(NixPid::from_raw(tid), Some(WaitPidFlag::__WALL))
            .with_context(|| format!("couldn't wait for thread {}", tid))?;
        match status {
            WaitStatus::Stopped(reported, _) => {
                ensure!(
                    reported.as_raw() == tid,
                    "waited for thread {} but {} reported instead",
                    tid,
                    reported
                );
                Ok(true)
            }
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => Ok(false),
            other => bail!("unexpected wait status for thread {}: {:?}", tid, other),
        }
    }

    fn wait_all(&mut self) -> Result<()> {
        let mut alive = Vec::with_capacity(self.traced.len());
        for &tid in &self.traced {
            if self.expect_stop(tid)? {
                alive.push(tid);
            } else {
                debug!("thread {} exited", tid);
            }
        }
        self.traced = alive;
        ensure!(
            !self.traced.is_empty(),
            "every thread of process {} has exited",
            self.pid
        );
        Ok(())
    }

    /// Threads created since the last tick get attached on sight.
    fn refresh_threads(&mut self) -> Result<()> {
        for tid in live_thread_ids(self.pid)? {
            if self.traced.len() >= MAX_THREADS {
                break;
            }
            if !self.traced.contains(&tid) {
                debug!("new thread {}", tid);
                self.trace_thread(tid)?;
            }
        }
        Ok(())
    }

    fn sample_all(&self, process: &mut ProcessRecord) -> Result<()> {
        let mem = RemoteMem::new(self.pid);
        for &tid in &self.traced {
            let regs = thread_regs(tid)
                .with_context(|| format!("couldn't read registers of thread {}", tid))?;
            let (pc, fp) = stack::pc_and_fp(&regs);
            let sample = stack::walk(&mem, pc, fp, self.max_frame_bytes)
                .with_context(|| format!("couldn't walk the stack of thread {}", tid))?;
            process.thread_mut(tid).add_sample(sample);
        }
        Ok(())
    }

    fn resume_all(&self) -> Result<()> {
        for &tid in &self.traced {
            ptrace::cont(NixPid::from_raw(tid), None)
                .with_context(|| format!("couldn't resume thread {}", tid))?;
        }
        Ok(())
    }

    /// Send every traced thread its own SIGSTOP so the next tick's
    /// per-thread waits each observe a stop. A process-directed signal
    /// would reach only one thread while the rest keep running.
    fn stop_all(&self) -> Result<()> {
        for &tid in &self.traced {
            let rv = unsafe { libc::tgkill(self.pid, tid, libc::SIGSTOP) };
            if rv != 0 {
                return Err(std::io::Error::last_os_error()).with_context(|| {
                    format!("couldn't stop thread {} of process {}", tid, self.pid)
                });
            }
        }
        Ok(())
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        // Best effort: don't leave the target stopped if we bail out
        // before an explicit detach.
        for &tid in &self.traced {
            let _ = ptrace::detach(NixPid::from_raw(tid), None);
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn thread_regs(tid: Pid) -> nix::Result<libc::user_regs_struct> {
    ptrace::getregs(NixPid::from_raw(tid))
}

#[cfg(target_arch = "aarch64")]
fn thread_regs(tid: Pid) -> nix::Result<libc::user_regs_struct> {
    ptrace::getregset::<ptrace::regset::NT_PRSTATUS>(NixPid::from_raw(tid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::process::tests::SpinTarget;
    use crate::core::process::ProcessRecord;

    #[test]
    fn samples_every_thread_of_a_live_process() {
        let target = SpinTarget::new();
        // Give the shell a moment to start spinning.
        std::thread::sleep(Duration::from_millis(50));

        let mut process = ProcessRecord::new(target.id()).expect("target should be alive");
        let mut sampler = Sampler::attach(target.id(), 1).expect("failed to attach");
        sampler.ticks = 25;

        let interrupted = AtomicBool::new(false);
        sampler.run(&mut process, &interrupted).expect("sampling failed");
        sampler.detach().expect("failed to detach");

        assert!(!process.threads().is_empty());
        let thread = &process.threads()[0];
        assert_eq!(thread.samples().len(), 25);
        assert!(thread.samples().iter().all(|sample| !sample.is_empty()));
    }

    #[test]
    fn an_interrupt_before_the_first_tick_yields_no_samples() {
        let target = SpinTarget::new();
        std::thread::sleep(Duration::from_millis(50));

        let mut process = ProcessRecord::new(target.id()).expect("target should be alive");
        let mut sampler = Sampler::attach(target.id(), 1).expect("failed to attach");

        let interrupted = AtomicBool::new(true);
        sampler.run(&mut process, &interrupted).expect("sampling failed");
        sampler.detach().expect("failed to detach");

        assert!(process.threads().is_empty());
    }
}
