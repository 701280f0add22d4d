//! Finds the target's loaded objects the way a debugger does: the
//! auxiliary vector locates the program-header table, `PT_DYNAMIC`
//! leads to `DT_DEBUG`, and the dynamic linker's `r_debug` structure
//! hands over its link map.

use std::fs;
use std::mem::size_of;

use anyhow::{bail, Context, Result};

use crate::core::mem::{RemoteArray, RemoteMem};
use crate::core::process::Pid;

const PT_DYNAMIC: u32 = 2;
const PT_PHDR: u32 = 6;
const DT_DEBUG: i64 = 21;

// Fixed 64-bit layouts read byte-for-byte out of the target; every
// field is carried so the byte offsets line up, whether we look at it
// or not. The crate only builds for 64-bit architectures (see
// core::stack).

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct ElfPhdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ElfDyn {
    d_tag: i64,
    d_val: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct RDebug {
    r_version: i32,
    r_map: u64,
    r_brk: u64,
    r_state: i32,
    r_ldbase: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct LinkMap {
    l_addr: u64,
    l_name: u64,
    l_ld: u64,
    l_next: u64,
    l_prev: u64,
}

/// A shared object currently mapped into the target.
pub struct SharedObject {
    pub path: String,
    pub load_address: usize,
}

/// The kernel-provided virtual DSO has no backing file to parse.
pub fn is_virtual_dso(path: &str) -> bool {
    path == "[vdso]" || path == "linux-vdso.so.1"
}

/// Every object the dynamic linker has loaded into `pid`, as
/// `(path, load address)`. The target must be stopped.
pub fn loaded_objects(pid: Pid) -> Result<Vec<SharedObject>> {
    let mem = RemoteMem::new(pid);
    let (table, count) = phdr_table(pid)?;
    let (dyn_addr, dyn_len) = dynamic_segment(&mem, table, count)?;
    let debug_addr = debug_pointer(&mem, dyn_addr, dyn_len)?;

    let debug: RDebug = mem
        .read(debug_addr)
        .context("couldn't read the dynamic linker's debug structure")?;

    let mut objects = Vec::new();
    let mut node_addr = debug.r_map as usize;
    while node_addr != 0 {
        let node: LinkMap = mem.read(node_addr).context("couldn't read a link-map node")?;
        let mut path = mem
            .read_string(node.l_name as usize)
            .context("couldn't read a link-map path")?;
        // The executable's own node carries no name; resolve it so its
        // image can be indexed like any other.
        if path.is_empty() {
            path = fs::read_link(format!("/proc/{}/exe", pid))
                .with_context(|| format!("couldn't resolve the executable of process {}", pid))?
                .to_string_lossy()
                .into_owned();
        }
        debug!("loaded object {} at {:#x}", path, node.l_addr);
        objects.push(SharedObject {
            path,
            load_address: node.l_addr as usize,
        });
        node_addr = node.l_next as usize;
    }
    Ok(objects)
}

/// Locate the program-header table through the auxiliary vector the
/// kernel wrote at exec time: `AT_PHDR` is its runtime address,
/// `AT_PHNUM` its entry count.
fn phdr_table(pid: Pid) -> Result<(usize, usize)> {
    let raw = fs::read(format!("/proc/{}/auxv", pid))
        .with_context(|| format!("couldn't read the auxiliary vector of process {}", pid))?;

    let word = size_of::<u64>();
    let mut phdr_addr = None;
    let mut phdr_count = None;
    for pair in raw.chunks_exact(2 * word) {
        let tag = u64::from_ne_bytes(pair[..word].try_into().expect("auxv entries are two words"));
        let value = u64::from_ne_bytes(pair[word..].try_into().expect("auxv entries are two words"));
        if tag == libc::AT_PHDR {
            phdr_addr = Some(value as usize);
        } else if tag == libc::AT_PHNUM {
            phdr_count = Some(value as usize);
        }
    }

    match (phdr_addr, phdr_count) {
        (Some(addr), Some(count)) => Ok((addr, count)),
        _ => bail!(
            "the auxiliary vector of process {} has no AT_PHDR/AT_PHNUM",
            pid
        ),
    }
}

/// Scan the remote program headers for the dynamic segment and return
/// its runtime address and byte length.
fn dynamic_segment(mem: &RemoteMem, table: usize, count: usize) -> Result<(usize, usize)> {
    let phdrs = RemoteArray::<ElfPhdr>::new(mem, table, count);
    let mut dynamic = None;
    let mut phdr_vaddr = None;
    for phdr in phdrs.iter() {
        let phdr = phdr.context("couldn't read the target's program headers")?;
        if phdr.p_type == PT_DYNAMIC {
            dynamic = Some(phdr);
        } else if phdr.p_type == PT_PHDR {
            phdr_vaddr = Some(phdr.p_vaddr as usize);
        }
    }
    let dynamic = match dynamic {
        Some(phdr) => phdr,
        None => bail!("process {} has no PT_DYNAMIC segment", mem.pid()),
    };

    // A position-independent executable lands wherever the kernel put
    // it; AT_PHDR is the runtime address of the table whose on-file
    // address PT_PHDR declares, which pins down the displacement.
    let bias = match phdr_vaddr {
        Some(vaddr) => table - vaddr,
        None => 0,
    };
    Ok((bias + dynamic.p_vaddr as usize, dynamic.p_filesz as usize))
}

/// Walk the remote dynamic table for `DT_DEBUG`, whose value the
/// dynamic linker fills in with the address of its `r_debug`.
fn debug_pointer(mem: &RemoteMem, dyn_addr: usize, dyn_len: usize) -> Result<usize> {
    let entries = RemoteArray::<ElfDyn>::new(mem, dyn_addr, dyn_len / size_of::<ElfDyn>());
    for entry in entries.iter() {
        let entry = entry.context("couldn't read the target's dynamic table")?;
        if entry.d_tag == DT_DEBUG && entry.d_val != 0 {
            return Ok(entry.d_val as usize);
        }
    }
    bail!("process {} has no DT_DEBUG entry", mem.pid())
}
