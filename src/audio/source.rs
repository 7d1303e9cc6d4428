use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;

#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};

/// Open the PCM byte stream: a file or FIFO when `path` is given, otherwise
/// standard input. On Unix the descriptor is switched to non-blocking mode so
/// the ingest loop can observe its stop flag while no audio arrives; stdin
/// gets its original flags back once the reader is dropped.
pub fn open_source(path: Option<&Path>) -> Result<Box<dyn Read + Send>> {
    match path {
        Some(path) if path.as_os_str() != "-" => {
            let file = open_file(path)
                .with_context(|| format!("Failed to open PCM input: {}", path.display()))?;
            log::info!("Reading PCM from {}", path.display());
            Ok(Box::new(file))
        }
        _ => {
            let stdin = stdin_source().context("Failed to make stdin non-blocking")?;
            log::info!("Reading PCM from stdin");
            Ok(stdin)
        }
    }
}

#[cfg(unix)]
fn open_file(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

#[cfg(unix)]
fn stdin_source() -> std::io::Result<Box<dyn Read + Send>> {
    Ok(Box::new(NonBlocking::new(std::io::stdin())?))
}

// Without fcntl the worker blocks in read; shutdown then waits for the next
// chunk or end of stream.
#[cfg(not(unix))]
fn stdin_source() -> std::io::Result<Box<dyn Read + Send>> {
    log::warn!("Non-blocking stdin is not supported on this platform");
    Ok(Box::new(std::io::stdin()))
}

/// Reader whose descriptor is in non-blocking mode for as long as it lives.
///
/// Status flags belong to the open file description, which a shared stdin
/// has in common with the parent shell, so the previous flags are put back
/// on drop.
#[cfg(unix)]
pub struct NonBlocking<R: AsRawFd> {
    inner: R,
    original_flags: libc::c_int,
}

#[cfg(unix)]
impl<R: AsRawFd> NonBlocking<R> {
    pub fn new(inner: R) -> std::io::Result<Self> {
        let fd = inner.as_raw_fd();
        let original_flags = get_flags(fd)?;
        set_flags(fd, original_flags | libc::O_NONBLOCK)?;
        Ok(Self {
            inner,
            original_flags,
        })
    }
}

#[cfg(unix)]
impl<R: Read + AsRawFd> Read for NonBlocking<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

#[cfg(unix)]
impl<R: AsRawFd> Drop for NonBlocking<R> {
    fn drop(&mut self) {
        if let Err(e) = set_flags(self.inner.as_raw_fd(), self.original_flags) {
            log::warn!("Failed to restore descriptor flags: {}", e);
        }
    }
}

#[cfg(unix)]
fn get_flags(fd: RawFd) -> std::io::Result<libc::c_int> {
    // SAFETY: F_GETFL only reads the status flags of an open descriptor.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(flags)
}

#[cfg(unix)]
fn set_flags(fd: RawFd, flags: libc::c_int) -> std::io::Result<()> {
    // SAFETY: F_SETFL only updates the status flags of an open descriptor.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use std::os::fd::FromRawFd;

    fn pipe() -> (File, File) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) }
    }

    #[test]
    fn flags_are_restored_on_drop() {
        let (reader, _writer) = pipe();
        // A duplicate shares the open file description, so it sees the same flags
        let observer = reader.try_clone().unwrap();
        let before = get_flags(observer.as_raw_fd()).unwrap();
        assert_eq!(before & libc::O_NONBLOCK, 0);

        let mut source = NonBlocking::new(reader).unwrap();
        assert_ne!(get_flags(observer.as_raw_fd()).unwrap() & libc::O_NONBLOCK, 0);
        let mut buf = [0u8; 8];
        let err = source.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);

        drop(source);
        assert_eq!(get_flags(observer.as_raw_fd()).unwrap(), before);
    }

    #[test]
    fn reads_pass_through() {
        use std::io::Write;
        let (reader, mut writer) = pipe();
        writer.write_all(&[1, 2, 3]).unwrap();
        let mut source = NonBlocking::new(reader).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }
}
