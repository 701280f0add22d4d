//! Turning runtime addresses into human-readable locations. The
//! capability is a trait with two implementations: one that parses the
//! target's ELF state itself, and one that delegates to a debugger
//! subprocess.

pub mod debugger;
mod library;
mod linkmap;

pub use debugger::DebuggerSymbolicator;
pub use library::{Library, Symbol};

use anyhow::{Context, Result};

use self::linkmap::{is_virtual_dso, loaded_objects};
use crate::core::process::Pid;

pub trait Symbolicator {
    /// A human-readable location for `address`, e.g.
    /// `malloc + 52 (in libc.so.6)`.
    fn symbolicate(&mut self, address: usize) -> String;
}

/// Resolves addresses by walking the target's dynamic-linker state and
/// indexing each loaded image from disk. Built once, after sampling,
/// while the target is still stopped.
pub struct ElfSymbolicator {
    // Sorted by load address so a library lookup is one binary search.
    libraries: Vec<Library>,
}

impl ElfSymbolicator {
    pub fn new(pid: Pid) -> Result<ElfSymbolicator> {
        let mut libraries = Vec::new();
        for object in loaded_objects(pid)? {
            let library = if is_virtual_dso(&object.path) {
                Library::stub(&object.path, object.load_address)
            } else {
                Library::parse(&object.path, object.load_address)
                    .with_context(|| format!("couldn't index {}", object.path))?
            };
            libraries.push(library);
        }
        Ok(ElfSymbolicator::from_libraries(libraries))
    }

    fn from_libraries(mut libraries: Vec<Library>) -> ElfSymbolicator {
        libraries.sort_by_key(|library| library.load_address());
        ElfSymbolicator { libraries }
    }
}

impl Symbolicator for ElfSymbolicator {
    fn symbolicate(&mut self, address: usize) -> String {
        // Address zero is the sample-terminator marker.
        if address == 0 {
            return "...".to_string();
        }

        let follows = self
            .libraries
            .partition_point(|library| library.load_address() <= address);
        if follows == 0 {
            return "???".to_string();
        }

        let library = &self.libraries[follows - 1];
        library.symbolicate(library.base_address() + (address - library.load_address()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str, address: usize, size: usize) -> Symbol {
        Symbol {
            name: name.to_string(),
            address,
            size,
        }
    }

    fn symbolicator() -> ElfSymbolicator {
        ElfSymbolicator::from_libraries(vec![
            Library::with_symbols(
                "/usr/lib/libL2",
                0x500000,
                0x0,
                vec![sym("baz", 0x40, 0x10)],
            ),
            Library::with_symbols(
                "/usr/lib/libL1",
                0x400000,
                0x1000,
                vec![sym("foo", 0x1100, 0x40), sym("bar", 0x1200, 0x10)],
            ),
        ])
    }

    #[test]
    fn address_zero_is_the_terminator_marker() {
        assert_eq!(symbolicator().symbolicate(0), "...");
    }

    #[test]
    fn a_hit_names_symbol_offset_and_image() {
        // load + (foo.address - base) + 5 = 0x400000 + 0x100 + 5.
        assert_eq!(symbolicator().symbolicate(0x400105), "foo + 5 (in libL1)");
        assert_eq!(symbolicator().symbolicate(0x500045), "baz + 5 (in libL2)");
    }

    #[test]
    fn every_offset_inside_a_symbol_hits_it() {
        let mut symbolicator = symbolicator();
        // load + (address - base) + k for every k inside foo's extent.
        for k in 0..0x40 {
            let line = symbolicator.symbolicate(0x400000 + (0x1100 - 0x1000) + k);
            assert_eq!(line, format!("foo + {} (in libL1)", k));
        }
    }

    #[test]
    fn an_address_past_a_symbols_extent_is_unknown_in_its_image() {
        // Unslid 0x1150: past foo's extent, before bar.
        assert_eq!(symbolicator().symbolicate(0x400150), "??? (in libL1)");
    }

    #[test]
    fn an_address_below_every_library_has_no_image_suffix() {
        assert_eq!(symbolicator().symbolicate(0x1000), "???");
    }

    #[test]
    fn no_libraries_means_no_answer_at_all() {
        let mut empty = ElfSymbolicator::from_libraries(Vec::new());
        assert_eq!(empty.symbolicate(0x1234), "???");
    }

    #[test]
    fn the_last_library_at_or_below_the_address_wins() {
        // 0x4fffff is past libL1's symbols but still belongs to it.
        assert_eq!(symbolicator().symbolicate(0x4fffff), "??? (in libL1)");
    }

    #[test]
    fn resolves_addresses_in_our_own_process() {
        let mut symbolicator =
            ElfSymbolicator::new(std::process::id() as Pid).expect("construction failed");
        // Whatever this function resolves to, it lives in some image.
        let line = symbolicator.symbolicate(resolves_addresses_in_our_own_process as usize);
        assert!(line.contains("(in "), "unexpected: {}", line);
    }
}
