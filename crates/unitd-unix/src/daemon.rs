use nix::unistd::{ForkResult, fork, pipe, setsid};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use tracing::{debug, warn};
use unitd_core::{HandshakeReport, ProcessId, UnitdError};

/// Which side of the fork the caller is on
pub enum Fork {
    /// The invoking process; it only waits for the handshake line
    Parent(HandshakeReader),
    /// The detached copy that goes on to supervise
    Child(HandshakeWriter),
}

/// Fork into a background copy connected to the invoker by a pipe.
///
/// In the child, standard output is the write end of the pipe until
/// [`HandshakeWriter::report`] is called or the writer is dropped.
///
/// # Safety
///
/// The process must still be single-threaded: call this before building an
/// async runtime or spawning any thread.
pub unsafe fn daemonize() -> Result<Fork, UnitdError> {
    let (read_end, write_end) =
        pipe().map_err(|e| UnitdError::handshake(format!("cannot create pipe: {e}")))?;

    // SAFETY: guaranteed single-threaded by the caller.
    match unsafe { fork() }.map_err(|e| UnitdError::handshake(format!("fork failed: {e}")))? {
        ForkResult::Parent { child } => {
            drop(write_end);
            debug!("Forked supervisor {}", child);
            Ok(Fork::Parent(HandshakeReader {
                pipe: File::from(read_end),
                child: child.as_raw() as ProcessId,
            }))
        }
        ForkResult::Child => {
            drop(read_end);
            redirect(&write_end, &[nix::libc::STDOUT_FILENO])?;
            drop(write_end);
            setsid().map_err(|e| UnitdError::handshake(format!("setsid failed: {e}")))?;
            Ok(Fork::Child(HandshakeWriter { reported: false }))
        }
    }
}

fn redirect(source: &impl AsRawFd, targets: &[i32]) -> Result<(), UnitdError> {
    for &target in targets {
        // SAFETY: both descriptors are open for the duration of the call.
        if unsafe { nix::libc::dup2(source.as_raw_fd(), target) } < 0 {
            return Err(UnitdError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Parent side of the handshake
pub struct HandshakeReader {
    pipe: File,
    child: ProcessId,
}

impl HandshakeReader {
    pub fn child(&self) -> ProcessId {
        self.child
    }

    /// Block until the child reports. Returns the raw line alongside the
    /// decoded report so it can be re-emitted verbatim.
    pub fn read(self) -> Result<(String, HandshakeReport), UnitdError> {
        read_handshake(BufReader::new(self.pipe))
    }
}

/// Read exactly one handshake line. End of stream before a full line means
/// the child died without reporting.
pub fn read_handshake<R: BufRead>(mut reader: R) -> Result<(String, HandshakeReport), UnitdError> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| UnitdError::handshake(format!("cannot read handshake: {e}")))?;
    if read == 0 {
        return Err(UnitdError::handshake("supervisor exited before reporting"));
    }
    let report = HandshakeReport::from_line(&line)?;
    let line = line.trim_end_matches(['\r', '\n']).to_string();
    Ok((line, report))
}

/// Child side of the handshake. Reports once, then detaches from the invoker.
pub struct HandshakeWriter {
    reported: bool,
}

impl HandshakeWriter {
    pub fn report(&mut self, report: &HandshakeReport) -> Result<(), UnitdError> {
        if self.reported {
            return Err(UnitdError::InvalidState("handshake already reported".into()));
        }
        self.reported = true;

        let line = report.to_line()?;
        let written = {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{line}").and_then(|_| stdout.flush())
        };
        let detached = detach();
        written?;
        detached
    }
}

impl Drop for HandshakeWriter {
    fn drop(&mut self) {
        if !self.reported {
            self.reported = true;
            if let Err(e) = detach() {
                warn!("Failed to detach from invoker: {}", e);
            }
        }
    }
}

// Closes the last handle on the pipe, which the invoker sees as end of stream.
fn detach() -> Result<(), UnitdError> {
    let null: OwnedFd = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?
        .into();
    redirect(
        &null,
        &[
            nix::libc::STDIN_FILENO,
            nix::libc::STDOUT_FILENO,
            nix::libc::STDERR_FILENO,
        ],
    )
}
