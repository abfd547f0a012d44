use nix::libc;
use nix::sys::signal::Signal;
use signal_hook::SigId;
use std::collections::btree_map::{BTreeMap, Entry};
use std::collections::HashSet;
use std::io;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tracing::{debug, warn};
use unitd_core::UnitdError;

/// Disposition a signal had before it was first watched.
///
/// signal-hook never uninstalls its handler, so while nothing watches the
/// signal the original disposition is put back and the handler parked here
/// until the next subscription.
struct Disposition {
    live: usize,
    original: libc::sigaction,
    parked: Option<libc::sigaction>,
}

impl Disposition {
    fn park(&mut self, signal: i32) -> io::Result<()> {
        let handler = install(signal, &self.original)?;
        self.parked = Some(handler);
        Ok(())
    }
}

// Dispositions are process-wide, so this is shared by every hub.
static DISPOSITIONS: Mutex<BTreeMap<i32, Disposition>> = Mutex::new(BTreeMap::new());

fn dispositions() -> MutexGuard<'static, BTreeMap<i32, Disposition>> {
    DISPOSITIONS.lock().unwrap_or_else(PoisonError::into_inner)
}

fn query(signal: i32) -> io::Result<libc::sigaction> {
    // SAFETY: all-zero is a valid sigaction, and a null new action only reads
    // the current one.
    let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
    if unsafe { libc::sigaction(signal, std::ptr::null(), &mut current) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(current)
}

fn install(signal: i32, action: &libc::sigaction) -> io::Result<libc::sigaction> {
    // SAFETY: `action` was read back from the kernel, so it names either a
    // default disposition or a handler that is still loaded.
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    if unsafe { libc::sigaction(signal, action, &mut previous) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(previous)
}

fn arm(signal: i32, writer: StdUnixStream) -> io::Result<SigId> {
    let mut dispositions = dispositions();
    let entry = match dispositions.entry(signal) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(Disposition {
            live: 0,
            original: query(signal)?,
            parked: None,
        }),
    };

    let unparked = match entry.parked.take() {
        Some(handler) => {
            if let Err(e) = install(signal, &handler) {
                entry.parked = Some(handler);
                return Err(e);
            }
            true
        }
        None => false,
    };

    match signal_hook::low_level::pipe::register(signal, writer) {
        Ok(id) => {
            entry.live += 1;
            Ok(id)
        }
        Err(e) => {
            if unparked && entry.live == 0 {
                entry.park(signal)?;
            }
            Err(e)
        }
    }
}

fn disarm(signal: Signal, id: SigId) {
    signal_hook::low_level::unregister(id);

    let mut dispositions = dispositions();
    if let Some(entry) = dispositions.get_mut(&(signal as i32)) {
        entry.live = entry.live.saturating_sub(1);
        if entry.live == 0
            && entry.parked.is_none()
            && let Err(e) = entry.park(signal as i32)
        {
            warn!("Cannot restore the disposition of {}: {}", signal, e);
        }
    }
}

/// Routes OS signal deliveries to one-shot subscriptions.
///
/// At most one subscription per signal exists at a time. A subscription fires
/// once and withdraws its handler as soon as it fires or is dropped. When the
/// last subscription for a signal goes away the signal gets back the
/// disposition it had before it was first watched.
#[derive(Clone, Default)]
pub struct SignalHub {
    watched: Arc<Mutex<HashSet<i32>>>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening for `signal`. Must be called before the event that
    /// raises it, deliveries before this call are lost.
    pub fn subscribe(&self, signal: Signal) -> Result<SignalSubscription, UnitdError> {
        let mut watched = self.lock();
        if !watched.insert(signal as i32) {
            return Err(UnitdError::SignalBusy(signal.to_string()));
        }

        let registered = (|| -> std::io::Result<(SigId, StdUnixStream)> {
            let (reader, writer) = StdUnixStream::pair()?;
            reader.set_nonblocking(true)?;
            writer.set_nonblocking(true)?;
            let id = arm(signal as i32, writer)?;
            Ok((id, reader))
        })();

        match registered {
            Ok((id, reader)) => {
                debug!("Watching {}", signal);
                Ok(SignalSubscription {
                    signal,
                    id: Some(id),
                    pending: Some(reader),
                    stream: None,
                    hub: self.clone(),
                })
            }
            Err(e) => {
                watched.remove(&(signal as i32));
                Err(UnitdError::SignalError(format!("cannot watch {signal}: {e}")))
            }
        }
    }

    /// Whether a live subscription for `signal` exists
    pub fn is_watched(&self, signal: Signal) -> bool {
        self.lock().contains(&(signal as i32))
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<i32>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered interest in one signal
pub struct SignalSubscription {
    signal: Signal,
    id: Option<SigId>,
    pending: Option<StdUnixStream>,
    stream: Option<UnixStream>,
    hub: SignalHub,
}

impl SignalSubscription {
    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Wait for the signal. Cancel safe; the handler is withdrawn once this
    /// returns `Ok`, after which every call fails.
    pub async fn recv(&mut self) -> Result<(), UnitdError> {
        if self.id.is_none() {
            return Err(UnitdError::SignalError(format!(
                "{} was already delivered",
                self.signal
            )));
        }

        let stream = self.stream()?;
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;

        debug!("Received {}", self.signal);
        self.release();
        Ok(())
    }

    // Converted lazily since registration may happen outside a runtime.
    fn stream(&mut self) -> Result<&mut UnixStream, UnitdError> {
        if let Some(reader) = self.pending.take() {
            self.stream = Some(UnixStream::from_std(reader)?);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| UnitdError::SignalError(format!("{} stream is closed", self.signal)))
    }

    fn release(&mut self) {
        if let Some(id) = self.id.take() {
            disarm(self.signal, id);
            self.hub.lock().remove(&(self.signal as i32));
            debug!("Stopped watching {}", self.signal);
        }
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_delivery() {
        let hub = SignalHub::new();
        let mut subscription = hub.subscribe(Signal::SIGUSR1).unwrap();
        assert!(hub.is_watched(Signal::SIGUSR1));

        raise(Signal::SIGUSR1).unwrap();
        tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(!hub.is_watched(Signal::SIGUSR1));
        assert!(subscription.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_second_subscriber_is_rejected() {
        let hub = SignalHub::new();
        let first = hub.subscribe(Signal::SIGUSR2).unwrap();
        match hub.subscribe(Signal::SIGUSR2) {
            Err(UnitdError::SignalBusy(name)) => assert_eq!(name, "SIGUSR2"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("duplicate subscription accepted"),
        }

        drop(first);
        assert!(!hub.is_watched(Signal::SIGUSR2));
        assert!(hub.subscribe(Signal::SIGUSR2).is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_wait_releases_handler() {
        let hub = SignalHub::new();
        let mut subscription = hub.subscribe(Signal::SIGWINCH).unwrap();
        let waited =
            tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await;
        assert!(waited.is_err());
        assert!(hub.is_watched(Signal::SIGWINCH));

        drop(subscription);
        assert!(!hub.is_watched(Signal::SIGWINCH));
    }

    fn handler_of(signal: Signal) -> libc::sighandler_t {
        query(signal as i32).unwrap().sa_sigaction
    }

    #[tokio::test]
    async fn test_release_restores_disposition() {
        let hub = SignalHub::new();
        let before = handler_of(Signal::SIGTTIN);

        let subscription = hub.subscribe(Signal::SIGTTIN).unwrap();
        assert_ne!(handler_of(Signal::SIGTTIN), before);
        drop(subscription);
        assert_eq!(handler_of(Signal::SIGTTIN), before);

        // Watching it again still delivers.
        let mut subscription = hub.subscribe(Signal::SIGTTIN).unwrap();
        raise(Signal::SIGTTIN).unwrap();
        tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handler_of(Signal::SIGTTIN), before);
    }

    #[tokio::test]
    async fn test_disposition_kept_while_another_hub_watches() {
        let first = SignalHub::new();
        let second = SignalHub::new();
        let before = handler_of(Signal::SIGTTOU);

        let early = first.subscribe(Signal::SIGTTOU).unwrap();
        let mut late = second.subscribe(Signal::SIGTTOU).unwrap();
        drop(early);
        assert_ne!(handler_of(Signal::SIGTTOU), before);

        raise(Signal::SIGTTOU).unwrap();
        tokio::time::timeout(Duration::from_secs(5), late.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handler_of(Signal::SIGTTOU), before);
    }

    #[test]
    fn test_forbidden_signal() {
        let hub = SignalHub::new();
        assert!(matches!(
            hub.subscribe(Signal::SIGKILL),
            Err(UnitdError::SignalError(_))
        ));
        assert!(!hub.is_watched(Signal::SIGKILL));
    }
}
