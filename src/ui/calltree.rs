use std::io;

use crate::symbolicate::Symbolicator;

/// One node of a per-thread call tree: an address, how many samples
/// passed through it, and the frames called from it. The root is an
/// ordinary frame at address zero whose own line is never written.
pub struct TreeFrame {
    address: usize,
    count: u32,
    children: Vec<TreeFrame>,
}

impl TreeFrame {
    pub fn root() -> TreeFrame {
        TreeFrame::new(0)
    }

    fn new(address: usize) -> TreeFrame {
        TreeFrame {
            address,
            count: 0,
            children: Vec::new(),
        }
    }

    /// Count one sample, outermost frame first: each address descends
    /// into (or creates) a child of the previous one.
    pub fn record(&mut self, sample: &[usize]) {
        let mut node = self;
        for &address in sample {
            node = node.child_mut(address);
            node.count += 1;
        }
    }

    // Sibling counts stay small, so a scan beats anything clever.
    fn child_mut(&mut self, address: usize) -> &mut TreeFrame {
        if let Some(index) = self
            .children
            .iter()
            .position(|child| child.address == address)
        {
            return &mut self.children[index];
        }
        self.children.push(TreeFrame::new(address));
        self.children.last_mut().expect("a child was just pushed")
    }

    /// Order every level by descending count. The sort is stable, so
    /// equal counts keep their first-seen order.
    pub fn sort(&mut self) {
        self.children.sort_by(|a, b| b.count.cmp(&a.count));
        for child in &mut self.children {
            child.sort();
        }
    }

    /// Write the tree depth-first, children of the root at indentation
    /// 2 and two more spaces per level below.
    pub fn write<W: io::Write>(
        &self,
        w: &mut W,
        symbolicator: &mut dyn Symbolicator,
    ) -> io::Result<()> {
        for child in &self.children {
            child.write_frame(w, 2, symbolicator)?;
        }
        Ok(())
    }

    fn write_frame<W: io::Write>(
        &self,
        w: &mut W,
        indentation: usize,
        symbolicator: &mut dyn Symbolicator,
    ) -> io::Result<()> {
        writeln!(
            w,
            "{:width$}{}  {} ({:#x})",
            "",
            self.count,
            symbolicator.symbolicate(self.address),
            self.address,
            width = indentation
        )?;
        for child in &self.children {
            child.write_frame(w, indentation + 2, symbolicator)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    #[cfg(test)]
    pub(crate) fn children(&self) -> &[TreeFrame] {
        &self.children
    }
}
