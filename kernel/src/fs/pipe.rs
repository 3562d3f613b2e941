//! Kernel pipes
//!
//! A pipe is a fixed 4096-byte buffer with a read and a write pointer,
//! shared by two anonymous inodes (the two ends). Writes past the end
//! of the buffer compact it first by moving the unread bytes down.
//! Reading an empty pipe blocks until the writer produces bytes or
//! closes; writing a full pipe blocks until the reader catches up.
//! Writing after the read end closed raises SIGPIPE and fails with
//! EPIPE; reading after the write end closed returns end-of-file.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;

use spin::Mutex;

use super::file::{AccessMode, OpenFile, O_RDONLY, O_WRONLY};
use super::{Inode, InodeAttr, InodeOps, S_IFIFO, S_IRUSR, S_IWUSR};
use crate::error::{Errno, KResult};
use crate::signal::SIGPIPE;

/// Pipe buffer capacity in bytes.
pub const PIPE_LENGTH: usize = 4096;

struct PipeShared {
    data: [u8; PIPE_LENGTH],
    read_ptr: usize,
    write_ptr: usize,
    read_closed: bool,
    write_closed: bool,
}

impl PipeShared {
    fn available(&self) -> usize {
        self.write_ptr - self.read_ptr
    }

    /// Compact the unread bytes to the front of the buffer.
    fn compact(&mut self) {
        if self.read_ptr == 0 {
            return;
        }
        self.data.copy_within(self.read_ptr..self.write_ptr, 0);
        self.write_ptr -= self.read_ptr;
        self.read_ptr = 0;
    }

    fn free_space(&self) -> usize {
        PIPE_LENGTH - self.available()
    }
}

type PipeRef = Arc<Mutex<PipeShared>>;

/// Ops for one end of a pipe. Dropping the inode closes the end.
struct PipeEnd {
    pipe: PipeRef,
    write_end: bool,
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        let mut pipe = self.pipe.lock();
        if self.write_end {
            pipe.write_closed = true;
        } else {
            pipe.read_closed = true;
        }
    }
}

impl InodeOps for PipeEnd {
    fn read(&self, _inode: &Inode, _offset: u64, buf: &mut [u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut pipe = self.pipe.lock();
                let avail = pipe.available();
                if avail > 0 {
                    let n = avail.min(buf.len());
                    let start = pipe.read_ptr;
                    buf[..n].copy_from_slice(&pipe.data[start..start + n]);
                    pipe.read_ptr += n;
                    return Ok(n);
                }
                if pipe.write_closed {
                    return Ok(0); // EOF
                }
            }
            crate::task::sched::relax();
        }
    }

    fn write(&self, _inode: &Inode, _offset: u64, buf: &[u8]) -> KResult<usize> {
        let mut written = 0;
        while written < buf.len() {
            let progressed = {
                let mut pipe = self.pipe.lock();
                if pipe.read_closed {
                    // Raised outside the lock.
                    drop(pipe);
                    crate::process::raise_current(SIGPIPE);
                    return Err(Errno::Epipe);
                }
                if pipe.write_ptr + (buf.len() - written) > PIPE_LENGTH {
                    pipe.compact();
                }
                let space = pipe.free_space().min(PIPE_LENGTH - pipe.write_ptr);
                if space > 0 {
                    let n = space.min(buf.len() - written);
                    let at = pipe.write_ptr;
                    pipe.data[at..at + n].copy_from_slice(&buf[written..written + n]);
                    pipe.write_ptr += n;
                    written += n;
                    true
                } else {
                    false
                }
            };
            if !progressed {
                crate::task::sched::relax();
            }
        }
        Ok(written)
    }
}

/// Create a pipe and return its `(read, write)` open files.
pub fn create_pipe(uid: u32, gid: u32) -> KResult<(Arc<OpenFile>, Arc<OpenFile>)> {
    let shared = Arc::new(Mutex::new(PipeShared {
        data: [0; PIPE_LENGTH],
        read_ptr: 0,
        write_ptr: 0,
        read_closed: false,
        write_closed: false,
    }));

    let now = crate::time::unix_time();
    let attr = InodeAttr {
        mode: S_IFIFO | S_IRUSR | S_IWUSR,
        nlink: 1,
        uid,
        gid,
        size: PIPE_LENGTH as u64,
        atime: now,
        mtime: now,
        ctime: now,
        ..InodeAttr::default()
    };

    let read_inode = Inode::new(
        0,
        None,
        attr.clone(),
        Box::new(PipeEnd {
            pipe: shared.clone(),
            write_end: false,
        }),
    );
    let write_inode = Inode::new(
        0,
        None,
        attr,
        Box::new(PipeEnd {
            pipe: shared,
            write_end: true,
        }),
    );

    Ok((
        OpenFile::new(read_inode, AccessMode::ReadOnly, O_RDONLY, String::from("pipe:[r]")),
        OpenFile::new(write_inode, AccessMode::WriteOnly, O_WRONLY, String::from("pipe:[w]")),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let (r, w) = create_pipe(0, 0).unwrap();
        assert_eq!(w.write(b"A").unwrap(), 1);
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'A');
    }

    #[test]
    fn read_after_writer_close_is_eof() {
        let (r, w) = create_pipe(0, 0).unwrap();
        w.write(b"bye").unwrap();
        drop(w);
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"bye");
        assert_eq!(r.read(&mut buf).unwrap(), 0, "EOF after drain");
    }

    #[test]
    fn write_after_reader_close_is_epipe() {
        let (r, w) = create_pipe(0, 0).unwrap();
        drop(r);
        assert_eq!(w.write(b"x").unwrap_err(), Errno::Epipe);
    }

    #[test]
    fn compaction_reclaims_consumed_space() {
        let (r, w) = create_pipe(0, 0).unwrap();
        let big = [0x5au8; PIPE_LENGTH];
        assert_eq!(w.write(&big).unwrap(), PIPE_LENGTH);
        let mut buf = [0u8; 1000];
        assert_eq!(r.read(&mut buf).unwrap(), 1000);
        // Space freed by the read is usable again after compaction.
        assert_eq!(w.write(&[1u8; 1000]).unwrap(), 1000);
        let mut rest = alloc::vec![0u8; PIPE_LENGTH];
        assert_eq!(r.read(&mut rest).unwrap(), PIPE_LENGTH);
        assert!(rest[..PIPE_LENGTH - 1000].iter().all(|&b| b == 0x5a));
        assert!(rest[PIPE_LENGTH - 1000..].iter().all(|&b| b == 1));
    }

    #[test]
    fn pipes_cannot_seek() {
        let (r, _w) = create_pipe(0, 0).unwrap();
        assert_eq!(r.seek(0, super::super::file::SEEK_SET).unwrap_err(), Errno::Espipe);
    }

    #[test]
    fn fork_shared_ends_deliver_bytes() {
        // Both ends stay usable while any descriptor holds them; the
        // byte written by one side is readable by the other.
        let (r, w) = create_pipe(0, 0).unwrap();
        let w2 = w.clone();
        w2.write(b"A").unwrap();
        drop(w2);
        let mut buf = [0u8; 1];
        assert_eq!(r.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'A');
        drop(w);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }
}
