use std::fs;

use anyhow::{Context, Result};

pub type Pid = libc::pid_t;

/// One captured backtrace: addresses ordered outermost frame first, so
/// the leading address becomes a child of the call-tree root.
pub type Sample = Vec<usize>;

/// Upper bound on how many threads of one target we track.
pub const MAX_THREADS: usize = 64;

/// A thread of the target and every sample taken of it, in capture
/// order.
pub struct ThreadRecord {
    pub tid: Pid,
    samples: Vec<Sample>,
}

impl ThreadRecord {
    fn new(tid: Pid) -> ThreadRecord {
        ThreadRecord {
            tid,
            samples: Vec::new(),
        }
    }

    pub fn add_sample(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

/// The target process: its short name and its threads, in the order
/// they were first sampled.
pub struct ProcessRecord {
    pid: Pid,
    name: String,
    threads: Vec<ThreadRecord>,
}

impl ProcessRecord {
    pub fn new(pid: Pid) -> Result<ProcessRecord> {
        let comm = fs::read_to_string(format!("/proc/{}/comm", pid))
            .with_context(|| format!("no process with pid {}", pid))?;
        Ok(ProcessRecord {
            pid,
            name: comm.trim_end().to_string(),
            threads: Vec::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_name(pid: Pid, name: &str) -> ProcessRecord {
        ProcessRecord {
            pid,
            name: name.to_string(),
            threads: Vec::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> &[ThreadRecord] {
        &self.threads
    }

    /// The record for `tid`, created on first touch. Sibling counts are
    /// tiny, so a scan is fine.
    pub fn thread_mut(&mut self, tid: Pid) -> &mut ThreadRecord {
        if let Some(index) = self.threads.iter().position(|thread| thread.tid == tid) {
            return &mut self.threads[index];
        }
        self.threads.push(ThreadRecord::new(tid));
        self.threads.last_mut().expect("a record was just pushed")
    }
}

/// The target's live thread ids from `/proc/<pid>/task`, numerically
/// sorted and capped at `MAX_THREADS`.
pub fn live_thread_ids(pid: Pid) -> Result<Vec<Pid>> {
    let mut tids = Vec::new();
    let task_dir = format!("/proc/{}/task", pid);
    for entry in
        fs::read_dir(&task_dir).with_context(|| format!("couldn't list threads of process {}", pid))?
    {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<Pid>() {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    tids.truncate(MAX_THREADS);
    Ok(tids)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::process::{Child, Command, Stdio};

    /// A child process that spins forever, for exercising the sampler
    /// against something real.
    pub struct SpinTarget {
        child: Child,
    }

    impl SpinTarget {
        pub fn new() -> SpinTarget {
            let child = Command::new("/bin/sh")
                .arg("-c")
                .arg("while :; do :; done")
                .stdin(Stdio::null())
                .spawn()
                .expect("failed to spawn spin target");
            SpinTarget { child }
        }

        pub fn id(&self) -> Pid {
            self.child.id() as Pid
        }
    }

    impl Drop for SpinTarget {
        fn drop(&mut self) {
            if let Err(e) = self.child.kill() {
                debug!("failed to kill process {}: {:?}", self.id(), e);
            }
            if let Err(e) = self.child.wait() {
                debug!("failed to wait for process {}: {:?}", self.id(), e);
            }
        }
    }

    #[test]
    fn thread_records_are_created_once_and_keep_order() {
        let mut process = ProcessRecord::with_name(42, "spin");
        process.thread_mut(30).add_sample(vec![1]);
        process.thread_mut(10).add_sample(vec![2]);
        process.thread_mut(30).add_sample(vec![3]);

        let tids: Vec<Pid> = process.threads().iter().map(|t| t.tid).collect();
        assert_eq!(tids, vec![30, 10]);
        assert_eq!(process.threads()[0].samples().len(), 2);
        assert_eq!(process.threads()[1].samples().len(), 1);
    }

    #[test]
    fn reads_the_short_name_of_a_live_process() {
        let target = SpinTarget::new();
        let process = ProcessRecord::new(target.id()).expect("target should be alive");
        assert_eq!(process.name(), "sh");
    }

    #[test]
    fn missing_processes_are_an_error() {
        // Pids wrap far below this on any reasonable kernel config.
        assert!(ProcessRecord::new(i32::MAX - 1).is_err());
    }

    #[test]
    fn lists_at_least_the_main_thread() {
        let target = SpinTarget::new();
        let tids = live_thread_ids(target.id()).expect("target should be alive");
        assert!(tids.contains(&target.id()));
    }
}
