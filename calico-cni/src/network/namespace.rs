//! Entering Linux network namespaces

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::sched;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NetnsError {
    #[error("i/o error: {context}")]
    Io {
        context: String,
        #[source]
        error: io::Error,
    },

    #[error("system error: {context}")]
    System {
        context: String,
        #[source]
        error: nix::Error,
    },

    #[error("could not run {command}")]
    Exec {
        command: String,
        #[source]
        error: unshare::Error,
    },

    #[error("{command} failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("could not find MAC address of {0}")]
    NoMac(String),
}

/// The calling thread's own namespace.
const CURRENT_NAMESPACE: &str = "/proc/thread-self/ns/net";

/// RAII guard for restoring a network namespace. When this is dropped, it switches back to the saved namespace
/// using [`sched::setns`], panicking if that fails: there is no recovering from being in the wrong namespace.
pub struct NamespaceGuard {
    saved: File,
    entered: PathBuf,
}

/// Switches the current thread into the network namespace bound at `path` until the returned guard is dropped.
///
/// Child processes spawned while the guard is held start in that namespace.
pub fn enter(path: &Path) -> Result<NamespaceGuard, NetnsError> {
    let target = open_namespace(path, "could not open network namespace")?;
    let saved = open_namespace(Path::new(CURRENT_NAMESPACE), "could not open current network namespace")?;

    sched::setns(target.as_raw_fd(), sched::CloneFlags::CLONE_NEWNET).map_err(|error| NetnsError::System {
        context: format!("could not enter network namespace {}", path.display()),
        error,
    })?;
    debug!("Entered network namespace {}", path.display());

    Ok(NamespaceGuard {
        saved,
        entered: path.into(),
    })
}

fn open_namespace(path: &Path, context: &str) -> Result<File, NetnsError> {
    OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_CLOEXEC)
        .open(path)
        .map_err(|error| NetnsError::Io {
            context: format!("{} {}", context, path.display()),
            error,
        })
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        debug!("Leaving network namespace {}", self.entered.display());
        sched::setns(self.saved.as_raw_fd(), sched::CloneFlags::CLONE_NEWNET)
            .expect("could not restore network namespace!")
    }
}
