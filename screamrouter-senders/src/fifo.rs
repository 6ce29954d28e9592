//! Named-FIFO sender for local playback consumers (e.g. an ALSA plugin
//! reading from `${XDG_RUNTIME_DIR}/screamrouter/<sink_id>`). Non-blocking
//! writer: a consumer that isn't keeping up gets dropped data, not a stall.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use screamrouter_core::error::{Error, Result};
use screamrouter_core::sender::Sender;

fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join("screamrouter");
    }
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/run/user/{uid}/screamrouter"))
}

fn ensure_fifo(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::SenderSetupFailed {
            sink_id: "fifo".into(),
            reason: format!("creating {}: {e}", parent.display()),
        })?;
    }
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| Error::SenderSetupFailed {
        sink_id: "fifo".into(),
        reason: e.to_string(),
    })?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o660) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(Error::SenderSetupFailed {
                sink_id: "fifo".into(),
                reason: format!("mkfifo {}: {err}", path.display()),
            });
        }
    }
    Ok(())
}

pub struct FifoSender {
    sink_id: String,
    path: PathBuf,
    fd: Option<RawFd>,
}

impl FifoSender {
    pub fn new(sink_id: impl Into<String>) -> Self {
        let sink_id = sink_id.into();
        let path = runtime_dir().join(&sink_id);
        Self { sink_id, path, fd: None }
    }

    fn open_locked(&mut self) -> bool {
        if self.fd.is_some() {
            return true;
        }
        if ensure_fifo(&self.path).is_err() {
            return false;
        }
        let c_path = match CString::new(self.path.as_os_str().as_bytes()) {
            Ok(p) => p,
            Err(_) => return false,
        };
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENXIO) {
                tracing::debug!(sink = %self.sink_id, path = %self.path.display(), error = %err, "fifo sender: open failed");
            }
            return false;
        }
        tracing::info!(sink = %self.sink_id, path = %self.path.display(), "fifo sender: opened for playback");
        self.fd = Some(fd);
        true
    }

    fn close_locked(&mut self) {
        if let Some(fd) = self.fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

impl Sender for FifoSender {
    fn setup(&mut self) -> Result<()> {
        self.open_locked();
        Ok(())
    }

    fn close(&mut self) {
        self.close_locked();
    }

    fn send_payload(&mut self, payload: &[u8], _csrcs: &[u32]) {
        if payload.is_empty() {
            return;
        }
        if !self.open_locked() {
            return;
        }
        let fd = self.fd.expect("checked by open_locked");

        let mut offset = 0usize;
        while offset < payload.len() {
            let remaining = &payload[offset..];
            let written = unsafe { libc::write(fd, remaining.as_ptr() as *const _, remaining.len()) };
            if written < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => break,
                    Some(libc::EPIPE) | Some(libc::ENXIO) => {
                        tracing::debug!(sink = %self.sink_id, error = %err, "fifo sender: consumer disconnected");
                        self.close_locked();
                    }
                    _ => {
                        tracing::debug!(sink = %self.sink_id, error = %err, "fifo sender: write error");
                        self.close_locked();
                    }
                }
                break;
            }
            if written == 0 {
                break;
            }
            offset += written as usize;
        }
    }
}

impl Drop for FifoSender {
    fn drop(&mut self) {
        self.close_locked();
    }
}
