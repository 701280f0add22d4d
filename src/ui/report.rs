use std::io;

use crate::core::process::ProcessRecord;
use crate::symbolicate::Symbolicator;
use crate::ui::calltree::TreeFrame;

/// The final report: a process header, then one sorted call tree per
/// thread, in first-sample order, each followed by a blank line. The
/// trees are built here, from the accumulated samples.
pub fn write_report<W: io::Write>(
    w: &mut W,
    process: &ProcessRecord,
    symbolicator: &mut dyn Symbolicator,
) -> io::Result<()> {
    writeln!(w, "Process: {} [{}]", process.name(), process.pid())?;
    writeln!(w)?;

    for thread in process.threads() {
        writeln!(w, "  Thread {:#x}:", thread.tid)?;

        let mut root = TreeFrame::root();
        for sample in thread.samples() {
            root.record(sample);
        }
        root.sort();
        root.write(w, symbolicator)?;
        writeln!(w)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::calltree::tests::LetterNames;

    #[test]
    fn prints_the_process_header_and_one_tree_per_thread() {
        let mut process = ProcessRecord::with_name(1234, "spin");
        process.thread_mut(0x1001).add_sample(vec![0xa, 0xb]);
        process.thread_mut(0x1001).add_sample(vec![0xa, 0xb]);
        process.thread_mut(0x1001).add_sample(vec![0xa]);
        process.thread_mut(0x1002).add_sample(vec![0xc]);

        let mut buf: Vec<u8> = Vec::new();
        write_report(&mut buf, &process, &mut LetterNames).expect("report failed");
        let report = String::from_utf8(buf).expect("report not utf8");

        let expected = "Process: spin [1234]

  Thread 0x1001:
  3  A (0xa)
    2  B (0xb)

  Thread 0x1002:
  1  C (0xc)

";
        assert_eq!(report, expected);
    }

    #[test]
    fn a_process_with_no_samples_still_has_a_header() {
        let process = ProcessRecord::with_name(7, "idle");
        let mut buf: Vec<u8> = Vec::new();
        write_report(&mut buf, &process, &mut LetterNames).expect("report failed");
        assert_eq!(String::from_utf8(buf).unwrap(), "Process: idle [7]\n\n");
    }
}
