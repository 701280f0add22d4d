use anyhow::{anyhow, Context, Result};

/// One entry from an image's symbol tables, with the unslid address
/// the file declares. Zero-sized entries never make it in here.
pub struct Symbol {
    pub name: String,
    pub address: usize,
    pub size: usize,
}

/// A loaded image and its merged, address-sorted symbol index.
/// `load_address` is where the dynamic linker put it; `base_address` is
/// where the file says its first loadable segment goes. The difference
/// is the slide applied at load time.
pub struct Library {
    path: String,
    load_address: usize,
    base_address: usize,
    symbols: Vec<Symbol>,
}

impl Library {
    /// Index the on-disk image backing a loaded object: symbols from
    /// both the full and the dynamic symbol table, sorted by unslid
    /// address.
    pub fn parse(path: &str, load_address: usize) -> Result<Library> {
        let file = elf::File::open_path(path)
            .map_err(|e| anyhow!("couldn't open ELF image {}: {:?}", path, e))?;

        let base_address = file
            .phdrs
            .iter()
            .find(|phdr| phdr.progtype == elf::types::PT_LOAD)
            .map(|phdr| phdr.vaddr as usize)
            .with_context(|| format!("{} has no loadable segment", path))?;

        let mut symbols = Vec::new();
        for section in &file.sections {
            if section.shdr.shtype != elf::types::SHT_SYMTAB
                && section.shdr.shtype != elf::types::SHT_DYNSYM
            {
                continue;
            }
            let table = file
                .get_symbols(section)
                .map_err(|e| anyhow!("couldn't read the symbols of {}: {:?}", path, e))?;
            for symbol in table {
                if symbol.size > 0 {
                    symbols.push(Symbol {
                        name: symbol.name,
                        address: symbol.value as usize,
                        size: symbol.size as usize,
                    });
                }
            }
        }
        // Duplicates across the two tables are fine; order among equal
        // addresses doesn't matter.
        symbols.sort_by_key(|symbol| symbol.address);

        debug!("{}: {} sized symbols", path, symbols.len());
        Ok(Library {
            path: path.to_string(),
            load_address,
            base_address,
            symbols,
        })
    }

    /// An object with no backing file (the vDSO): it still claims its
    /// address range but can never name a symbol.
    pub fn stub(path: &str, load_address: usize) -> Library {
        Library {
            path: path.to_string(),
            load_address,
            base_address: 0,
            symbols: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_symbols(
        path: &str,
        load_address: usize,
        base_address: usize,
        mut symbols: Vec<Symbol>,
    ) -> Library {
        symbols.sort_by_key(|symbol| symbol.address);
        Library {
            path: path.to_string(),
            load_address,
            base_address,
            symbols,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Short image name for report lines.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn load_address(&self) -> usize {
        self.load_address
    }

    pub fn base_address(&self) -> usize {
        self.base_address
    }

    #[cfg(test)]
    pub(crate) fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Resolve an unslid address within this image: the last symbol at
    /// or below it, if the address falls inside that symbol's extent.
    pub fn symbolicate(&self, address: usize) -> String {
        let follows = self
            .symbols
            .partition_point(|symbol| symbol.address <= address);
        if follows > 0 {
            let symbol = &self.symbols[follows - 1];
            let offset = address - symbol.address;
            if offset < symbol.size {
                return format!("{} + {} (in {})", symbol.name, offset, self.name());
            }
        }
        format!("??? (in {})", self.name())
    }
}
