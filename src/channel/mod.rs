//! Single-slot shared-memory mailboxes between the application and the
//! controlling client.
//!
//! A [`Segment`] is a memory map of [`CHANNEL_COUNT`] fixed-size slots. Each
//! slot holds one message: byte 0 is the "has data" flag and the rest is a
//! NUL-terminated UTF-8 string. A send only succeeds into an empty slot and
//! a receive empties it, so at most one message is ever pending per
//! direction and neither side ever blocks.
//!
//! Direction is fixed by construction: the application side gets
//! [`AppChannels`], the client side gets [`ClientChannels`], and each field
//! is either an [`Inbox`] (receive only) or an [`Outbox`] (send only).

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use memmap2::MmapMut;
use tracing::debug;

use crate::{AppError, Result};

/// Bytes per slot, flag byte included.
pub const MSG_CHANNEL_SIZE: usize = 1024;

/// Number of slots in a segment.
pub const CHANNEL_COUNT: usize = 6;

/// Total segment size in bytes.
pub const SEGMENT_SIZE: usize = MSG_CHANNEL_SIZE * CHANNEL_COUNT;

/// The six unidirectional channels of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Client → app: suspend/resume/quit/abort.
    ProcessControl,
    /// Client → app: liveness and working-set hints.
    Heartbeat,
    /// App → client: CPU time, fraction done, counters.
    AppStatus,
    /// App → client: new trickle-up file available.
    TrickleUp,
    /// Client → app: new trickle-down file available.
    TrickleDown,
    /// Client → app: graphics mode requests.
    Graphics,
}

impl ChannelKind {
    const fn index(self) -> usize {
        match self {
            Self::ProcessControl => 0,
            Self::Heartbeat => 1,
            Self::AppStatus => 2,
            Self::TrickleUp => 3,
            Self::TrickleDown => 4,
            Self::Graphics => 5,
        }
    }
}

/// A mapped region holding all channel slots.
///
/// The in-process `Mutex` only serialises handles living in the same
/// process; it is taken with `try_lock` so contention reads as "slot busy"
/// rather than blocking the monitoring loop.
#[derive(Debug)]
pub struct Segment {
    map: Mutex<MmapMut>,
    path: Option<PathBuf>,
}

impl Segment {
    /// Create (or truncate) a file-backed segment and zero every slot.
    ///
    /// Called by the client side before launching the application.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` if the file cannot be created, sized or
    /// mapped.
    pub fn create(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|err| AppError::Channel(format!("cannot create {}: {err}", path.display())))?;
        file.set_len(SEGMENT_SIZE as u64)
            .map_err(|err| AppError::Channel(format!("cannot size segment: {err}")))?;
        let mut map = map_file(&file, path)?;
        map.fill(0);
        Ok(Arc::new(Self {
            map: Mutex::new(map),
            path: Some(path.to_path_buf()),
        }))
    }

    /// Attach to a segment created by the client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` if the file is missing, too small or
    /// cannot be mapped.
    pub fn attach(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| AppError::Channel(format!("cannot open {}: {err}", path.display())))?;
        let len = file
            .metadata()
            .map_err(|err| AppError::Channel(format!("cannot stat segment: {err}")))?
            .len();
        if len < SEGMENT_SIZE as u64 {
            return Err(AppError::Channel(format!(
                "segment {} is {len} bytes, expected {SEGMENT_SIZE}",
                path.display()
            )));
        }
        let map = map_file(&file, path)?;
        Ok(Arc::new(Self {
            map: Mutex::new(map),
            path: Some(path.to_path_buf()),
        }))
    }

    /// Anonymous segment for two endpoints living in one process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` if the mapping cannot be created.
    pub fn anonymous() -> Result<Arc<Self>> {
        let map = MmapMut::map_anon(SEGMENT_SIZE)
            .map_err(|err| AppError::Channel(format!("cannot map anonymous segment: {err}")))?;
        Ok(Arc::new(Self {
            map: Mutex::new(map),
            path: None,
        }))
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` over one slot. Returns `None` if another in-process handle
    /// holds the map right now.
    fn with_slot<R>(&self, kind: ChannelKind, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut guard = match self.map.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        let start = kind.index() * MSG_CHANNEL_SIZE;
        Some(f(&mut guard[start..start + MSG_CHANNEL_SIZE]))
    }
}

#[allow(unsafe_code)]
fn map_file(file: &std::fs::File, path: &Path) -> Result<MmapMut> {
    // SAFETY: the segment file is private to the slot directory and only
    // ever touched through this module's flag-then-body protocol; its
    // length is checked or set before mapping.
    unsafe { MmapMut::map_mut(file) }
        .map_err(|err| AppError::Channel(format!("cannot map {}: {err}", path.display())))
}

/// One direction of the protocol.
#[derive(Debug, Clone)]
struct Channel {
    segment: Arc<Segment>,
    kind: ChannelKind,
}

impl Channel {
    fn send(&self, msg: &str) -> bool {
        self.segment
            .with_slot(self.kind, |slot| {
                if slot[0] != 0 {
                    return false;
                }
                let body = truncate_to_boundary(msg, MSG_CHANNEL_SIZE - 2);
                if body.len() < msg.len() {
                    debug!(channel = ?self.kind, len = msg.len(), "message truncated");
                }
                let bytes = body.as_bytes();
                slot[1..=bytes.len()].copy_from_slice(bytes);
                slot[bytes.len() + 1] = 0;
                fence(Ordering::Release);
                slot[0] = 1;
                true
            })
            .unwrap_or(false)
    }

    fn receive(&self) -> Option<String> {
        self.segment
            .with_slot(self.kind, |slot| {
                if slot[0] == 0 {
                    return None;
                }
                fence(Ordering::Acquire);
                let body = &slot[1..];
                let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
                let msg = String::from_utf8_lossy(&body[..end]).into_owned();
                fence(Ordering::Release);
                slot[0] = 0;
                Some(msg)
            })
            .flatten()
    }

    fn has_pending(&self) -> bool {
        self.segment
            .with_slot(self.kind, |slot| slot[0] != 0)
            .unwrap_or(true)
    }
}

fn truncate_to_boundary(msg: &str, max: usize) -> &str {
    if msg.len() <= max {
        return msg;
    }
    let mut end = max;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    &msg[..end]
}

/// Receiving end of a channel.
#[derive(Debug, Clone)]
pub struct Inbox(Channel);

impl Inbox {
    /// Take the pending message, if any. Never blocks.
    #[must_use]
    pub fn receive(&self) -> Option<String> {
        self.0.receive()
    }

    /// Whether a message is waiting to be received.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.0.has_pending()
    }

    /// Which channel this is.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.0.kind
    }
}

/// Sending end of a channel.
#[derive(Debug, Clone)]
pub struct Outbox(Channel);

impl Outbox {
    /// Place `msg` in the slot. Returns `false`, leaving the slot untouched,
    /// if the previous message has not been consumed yet.
    #[must_use]
    pub fn send(&self, msg: &str) -> bool {
        self.0.send(msg)
    }

    /// Whether the previous message is still unread by the peer.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.0.has_pending()
    }

    /// Which channel this is.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.0.kind
    }
}

fn inbox(segment: &Arc<Segment>, kind: ChannelKind) -> Inbox {
    Inbox(Channel {
        segment: Arc::clone(segment),
        kind,
    })
}

fn outbox(segment: &Arc<Segment>, kind: ChannelKind) -> Outbox {
    Outbox(Channel {
        segment: Arc::clone(segment),
        kind,
    })
}

/// The application's view of the segment.
#[derive(Debug, Clone)]
pub struct AppChannels {
    /// Suspend/resume/quit/abort requests.
    pub process_control: Inbox,
    /// Liveness messages.
    pub heartbeat: Inbox,
    /// Trickle-down notifications.
    pub trickle_down: Inbox,
    /// Graphics requests.
    pub graphics: Inbox,
    /// Outgoing status reports.
    pub app_status: Outbox,
    /// Outgoing trickle-up notifications.
    pub trickle_up: Outbox,
}

impl AppChannels {
    /// Build application-side endpoints over `segment`.
    #[must_use]
    pub fn new(segment: &Arc<Segment>) -> Self {
        Self {
            process_control: inbox(segment, ChannelKind::ProcessControl),
            heartbeat: inbox(segment, ChannelKind::Heartbeat),
            trickle_down: inbox(segment, ChannelKind::TrickleDown),
            graphics: inbox(segment, ChannelKind::Graphics),
            app_status: outbox(segment, ChannelKind::AppStatus),
            trickle_up: outbox(segment, ChannelKind::TrickleUp),
        }
    }
}

/// The controlling client's view of the segment.
#[derive(Debug, Clone)]
pub struct ClientChannels {
    /// Outgoing suspend/resume/quit/abort requests.
    pub process_control: Outbox,
    /// Outgoing liveness messages.
    pub heartbeat: Outbox,
    /// Outgoing trickle-down notifications.
    pub trickle_down: Outbox,
    /// Outgoing graphics requests.
    pub graphics: Outbox,
    /// Incoming status reports.
    pub app_status: Inbox,
    /// Incoming trickle-up notifications.
    pub trickle_up: Inbox,
}

impl ClientChannels {
    /// Build client-side endpoints over `segment`.
    #[must_use]
    pub fn new(segment: &Arc<Segment>) -> Self {
        Self {
            process_control: outbox(segment, ChannelKind::ProcessControl),
            heartbeat: outbox(segment, ChannelKind::Heartbeat),
            trickle_down: outbox(segment, ChannelKind::TrickleDown),
            graphics: outbox(segment, ChannelKind::Graphics),
            app_status: inbox(segment, ChannelKind::AppStatus),
            trickle_up: inbox(segment, ChannelKind::TrickleUp),
        }
    }
}
