#![forbid(unsafe_code)]
//! Positioned reads and writes against a relation file.

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
};

use crate::types::{CheckError, Result};

/// Positioned I/O on one relation file. Calls never move a shared cursor, so
/// concurrent readers need no coordination.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from offset `off`; a short file is an `UnexpectedEof` error.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at offset `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true for a zero-length file.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(unix)]
fn pread(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, dst, off)
}

#[cfg(unix)]
fn pwrite(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, src, off)
}

#[cfg(windows)]
fn pread(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, dst, off)
}

#[cfg(windows)]
fn pwrite(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, src, off)
}

/// [`FileIo`] over a standard library file handle.
#[derive(Debug)]
pub struct StdFileIo {
    file: File,
}

impl StdFileIo {
    /// Wraps an already opened file.
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// Opens an existing relation for verification; writes will fail.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            match pread(&self.file, dst, off)? {
                0 => return Err(io::Error::new(ErrorKind::UnexpectedEof, "read past end of relation").into()),
                n => {
                    dst = &mut dst[n..];
                    off += n as u64;
                }
            }
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            match pwrite(&self.file, src, off)? {
                0 => return Err(io::Error::new(ErrorKind::WriteZero, "relation write made no progress").into()),
                n => {
                    src = &src[n..];
                    off += n as u64;
                }
            }
        }
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Turns an end-of-file read into `None`; other errors pass through.
pub fn eof_as_none<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(CheckError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err),
    }
}
