use std::io::IoSliceMut;
use std::marker::PhantomData;
use std::mem;

use nix::errno::Errno;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use thiserror::Error;

use crate::core::process::Pid;

/// Ways a remote read can fail. `UnmappedAddress` is the only variant
/// anything recovers from: the stack walker treats it as the end of a
/// frame chain. Everything else is fatal to the caller.
#[derive(Error, Debug)]
pub enum MemoryReadError {
    #[error("address {1:#x} is not mapped in process {0}")]
    UnmappedAddress(Pid, usize),
    #[error("permission denied when reading from process {0}. If you're not running as root, try again with sudo. If you're using Docker, try passing `--cap-add=SYS_PTRACE` to `docker run`")]
    PermissionDenied(Pid),
    #[error("process {0} is no longer running")]
    ProcessEnded(Pid),
    #[error("short read at {1:#x} in process {0}: got {2} of {3} bytes")]
    ShortRead(Pid, usize, usize, usize),
    #[error("failed to read {2} bytes at {1:#x} from process {0}: {3}")]
    Io(Pid, usize, usize, Errno),
}

/// Typed reads from another process's address space, one
/// `process_vm_readv` call per read. The target must be stopped while
/// reads are issued or the values may be torn.
pub struct RemoteMem {
    pid: Pid,
}

impl RemoteMem {
    pub fn new(pid: Pid) -> RemoteMem {
        RemoteMem { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn read_bytes(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryReadError> {
        let len = buf.len();
        let remote = [RemoteIoVec { base: addr, len }];
        let mut local = [IoSliceMut::new(buf)];

        match process_vm_readv(nix::unistd::Pid::from_raw(self.pid), &mut local, &remote) {
            Ok(n) if n == len => Ok(()),
            Ok(n) => Err(MemoryReadError::ShortRead(self.pid, addr, n, len)),
            Err(Errno::EFAULT) | Err(Errno::EIO) => {
                Err(MemoryReadError::UnmappedAddress(self.pid, addr))
            }
            Err(Errno::EPERM) => Err(MemoryReadError::PermissionDenied(self.pid)),
            Err(Errno::ESRCH) => Err(MemoryReadError::ProcessEnded(self.pid)),
            Err(errno) => Err(MemoryReadError::Io(self.pid, addr, len, errno)),
        }
    }

    /// Read a `T` out of the target by copying exactly `size_of::<T>()`
    /// bytes and reinterpreting them. `T` must be a plain fixed-layout
    /// value (integers, `#[repr(C)]` structs of them).
    pub fn read<T: Copy>(&self, addr: usize) -> Result<T, MemoryReadError> {
        let mut buf = vec![0u8; mem::size_of::<T>()];
        self.read_bytes(addr, &mut buf)?;
        Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) })
    }

    /// A NUL-terminated string, fetched one byte at a time so the
    /// address needs no particular alignment.
    pub fn read_string(&self, addr: usize) -> Result<String, MemoryReadError> {
        let mut bytes = Vec::new();
        let mut cur = addr;
        loop {
            let byte: u8 = self.read(cur)?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cur += 1;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// A lazy view of `count` consecutive `T`s in the target. Nothing is
/// fetched until an element is asked for; element `i` lives at
/// `base + i * size_of::<T>()`.
pub struct RemoteArray<'a, T> {
    mem: &'a RemoteMem,
    base: usize,
    count: usize,
    _element: PhantomData<T>,
}

impl<'a, T: Copy> RemoteArray<'a, T> {
    pub fn new(mem: &'a RemoteMem, base: usize, count: usize) -> RemoteArray<'a, T> {
        RemoteArray {
            mem,
            base,
            count,
            _element: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, index: usize) -> Result<T, MemoryReadError> {
        debug_assert!(index < self.count);
        self.mem.read(self.base + index * mem::size_of::<T>())
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<T, MemoryReadError>> + '_ {
        (0..self.count).map(move |index| self.get(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_memory() -> RemoteMem {
        RemoteMem::new(std::process::id() as Pid)
    }

    #[test]
    fn reads_a_value_from_this_process() {
        let value: u64 = 0xfeed_face_cafe_f00d;
        let mem = own_memory();
        let got: u64 = mem.read(&value as *const u64 as usize).unwrap();
        assert_eq!(got, value);
    }

    #[test]
    fn reads_a_nul_terminated_string() {
        let bytes = b"spin\0garbage";
        let mem = own_memory();
        let got = mem.read_string(bytes.as_ptr() as usize).unwrap();
        assert_eq!(got, "spin");
    }

    #[test]
    fn array_elements_come_back_in_order() {
        let values: [u64; 4] = [3, 1, 4, 1];
        let mem = own_memory();
        let array = RemoteArray::<u64>::new(&mem, values.as_ptr() as usize, values.len());
        assert_eq!(array.len(), 4);
        let got: Vec<u64> = array.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(got, values);
    }

    #[test]
    fn unmapped_addresses_are_reported_as_such() {
        let mem = own_memory();
        // The zero page is never mapped.
        let err = mem.read::<u64>(8).unwrap_err();
        assert!(matches!(err, MemoryReadError::UnmappedAddress(_, 8)));
    }
}
