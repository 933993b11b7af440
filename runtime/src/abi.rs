//! WASI `snapshot_preview1` ABI: error taxonomy, flag sets, enumerations
//! and the byte layout of every structure exchanged through guest memory.
//!
//! All layouts are little-endian and packed by natural alignment; union
//! payloads sit at the maximum alignment of their arms, so the offsets here
//! agree with what any preview1 toolchain emits. Encoding is deterministic:
//! padding bytes are written as zero. The only failure mode is a range
//! error, which surfaces as [`Errno::Inval`].

use std::fmt;

use crate::memory::GuestMemory;

/// WASI error codes (the subset this runtime produces).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Errno {
    /// No error.
    Success = 0,
    /// Permission denied.
    Acces = 2,
    /// Bad file descriptor.
    Badf = 8,
    /// Operation canceled.
    Canceled = 11,
    /// File exists.
    Exist = 20,
    /// Invalid argument.
    Inval = 28,
    /// Is a directory.
    Isdir = 31,
    /// No such file or directory.
    Noent = 44,
    /// Function not supported.
    Nosys = 52,
    /// Not a directory.
    Notdir = 54,
    /// Directory not empty.
    Notempty = 55,
    /// Capabilities insufficient.
    Notcapable = 76,
}

impl Errno {
    /// The numeric value returned to the guest.
    pub fn raw(self) -> i32 {
        self as i32
    }

    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Errno::Success),
            2 => Some(Errno::Acces),
            8 => Some(Errno::Badf),
            11 => Some(Errno::Canceled),
            20 => Some(Errno::Exist),
            28 => Some(Errno::Inval),
            31 => Some(Errno::Isdir),
            44 => Some(Errno::Noent),
            52 => Some(Errno::Nosys),
            54 => Some(Errno::Notdir),
            55 => Some(Errno::Notempty),
            76 => Some(Errno::Notcapable),
            _ => None,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// File descriptor types (preview1 filetype values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Filetype {
    Unknown = 0,
    CharacterDevice = 2,
    Directory = 3,
    RegularFile = 4,
}

impl Filetype {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Filetype::Unknown),
            2 => Some(Filetype::CharacterDevice),
            3 => Some(Filetype::Directory),
            4 => Some(Filetype::RegularFile),
            _ => None,
        }
    }
}

/// Seek anchor for `fd_seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl Whence {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// Clocks the guest can query or subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClockId {
    Realtime = 0,
    Monotonic = 1,
}

impl ClockId {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ClockId::Realtime),
            1 => Some(ClockId::Monotonic),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// `path_open` open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OFlags: u16 {
        const CREAT = 1 << 0;
        const DIRECTORY = 1 << 1;
        const EXCL = 1 << 2;
        const TRUNC = 1 << 3;
    }
}

bitflags::bitflags! {
    /// File descriptor status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u16 {
        const APPEND = 1 << 0;
        const DSYNC = 1 << 1;
        const NONBLOCK = 1 << 2;
        const RSYNC = 1 << 3;
        const SYNC = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Preview1 rights bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u64 {
        const FD_DATASYNC = 1 << 0;
        const FD_READ = 1 << 1;
        const FD_SEEK = 1 << 2;
        const FD_FDSTAT_SET_FLAGS = 1 << 3;
        const FD_SYNC = 1 << 4;
        const FD_TELL = 1 << 5;
        const FD_WRITE = 1 << 6;
        const FD_ADVISE = 1 << 7;
        const FD_ALLOCATE = 1 << 8;
        const PATH_CREATE_DIRECTORY = 1 << 9;
        const PATH_CREATE_FILE = 1 << 10;
        const PATH_LINK_SOURCE = 1 << 11;
        const PATH_LINK_TARGET = 1 << 12;
        const PATH_OPEN = 1 << 13;
        const FD_READDIR = 1 << 14;
        const PATH_READLINK = 1 << 15;
        const PATH_RENAME_SOURCE = 1 << 16;
        const PATH_RENAME_TARGET = 1 << 17;
        const PATH_FILESTAT_GET = 1 << 18;
        const PATH_FILESTAT_SET_SIZE = 1 << 19;
        const PATH_FILESTAT_SET_TIMES = 1 << 20;
        const FD_FILESTAT_GET = 1 << 21;
        const FD_FILESTAT_SET_SIZE = 1 << 22;
        const FD_FILESTAT_SET_TIMES = 1 << 23;
        const PATH_SYMLINK = 1 << 24;
        const PATH_REMOVE_DIRECTORY = 1 << 25;
        const PATH_UNLINK_FILE = 1 << 26;
        const POLL_FD_READWRITE = 1 << 27;
        const SOCK_SHUTDOWN = 1 << 28;
    }
}

bitflags::bitflags! {
    /// Clock subscription flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClockFlags: u16 {
        /// The timeout is an absolute timestamp on the subscribed clock.
        const ABSTIME = 1 << 0;
    }
}

/// Subscription / event discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    Clock = 0,
    FdRead = 1,
    FdWrite = 2,
}

impl EventKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(EventKind::Clock),
            1 => Some(EventKind::FdRead),
            2 => Some(EventKind::FdWrite),
            _ => None,
        }
    }
}

/// A structure with a fixed guest-memory layout.
pub trait Layout: Sized {
    /// Encoded size in bytes.
    const SIZE: u32;

    fn read(mem: &GuestMemory<'_>, offset: u32) -> Result<Self, Errno>;

    fn write(&self, mem: &mut GuestMemory<'_>, offset: u32) -> Result<(), Errno>;
}

/// One scatter/gather buffer: `(buf_ptr, buf_len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iovec {
    pub buf: u32,
    pub len: u32,
}

impl Layout for Iovec {
    const SIZE: u32 = 8;

    fn read(mem: &GuestMemory<'_>, offset: u32) -> Result<Self, Errno> {
        Ok(Iovec {
            buf: mem.read_u32(offset)?,
            len: mem.read_u32(offset + 4)?,
        })
    }

    fn write(&self, mem: &mut GuestMemory<'_>, offset: u32) -> Result<(), Errno> {
        mem.write_u32(offset, self.buf)?;
        mem.write_u32(offset + 4, self.len)
    }
}

/// Pre-open descriptor info. The tag is always `Dir` (0); the payload is
/// the mount path length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prestat {
    pub name_len: u32,
}

impl Layout for Prestat {
    const SIZE: u32 = 8;

    fn read(mem: &GuestMemory<'_>, offset: u32) -> Result<Self, Errno> {
        if mem.read_u8(offset)? != 0 {
            return Err(Errno::Inval);
        }
        Ok(Prestat {
            name_len: mem.read_u32(offset + 4)?,
        })
    }

    fn write(&self, mem: &mut GuestMemory<'_>, offset: u32) -> Result<(), Errno> {
        mem.write_u32(offset, 0)?;
        mem.write_u32(offset + 4, self.name_len)
    }
}

/// File descriptor status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fdstat {
    pub filetype: Filetype,
    pub flags: FdFlags,
    pub rights_base: Rights,
    pub rights_inheriting: Rights,
}

impl Layout for Fdstat {
    const SIZE: u32 = 24;

    fn read(mem: &GuestMemory<'_>, offset: u32) -> Result<Self, Errno> {
        Ok(Fdstat {
            filetype: Filetype::from_raw(mem.read_u8(offset)?).ok_or(Errno::Inval)?,
            flags: FdFlags::from_bits_truncate(mem.read_u16(offset + 2)?),
            rights_base: Rights::from_bits_truncate(mem.read_u64(offset + 8)?),
            rights_inheriting: Rights::from_bits_truncate(mem.read_u64(offset + 16)?),
        })
    }

    fn write(&self, mem: &mut GuestMemory<'_>, offset: u32) -> Result<(), Errno> {
        mem.write_u8(offset, self.filetype as u8)?;
        mem.write_u8(offset + 1, 0)?;
        mem.write_u16(offset + 2, self.flags.bits())?;
        mem.write_u32(offset + 4, 0)?;
        mem.write_u64(offset + 8, self.rights_base.bits())?;
        mem.write_u64(offset + 16, self.rights_inheriting.bits())
    }
}

/// Directory entry header; the name bytes follow it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dirent {
    /// Cookie to pass to `fd_readdir` to resume after this entry.
    pub next: u64,
    pub ino: u64,
    pub name_len: u32,
    pub kind: Filetype,
}

impl Layout for Dirent {
    const SIZE: u32 = 24;

    fn read(mem: &GuestMemory<'_>, offset: u32) -> Result<Self, Errno> {
        Ok(Dirent {
            next: mem.read_u64(offset)?,
            ino: mem.read_u64(offset + 8)?,
            name_len: mem.read_u32(offset + 16)?,
            kind: Filetype::from_raw(mem.read_u8(offset + 20)?).ok_or(Errno::Inval)?,
        })
    }

    fn write(&self, mem: &mut GuestMemory<'_>, offset: u32) -> Result<(), Errno> {
        mem.write_u64(offset, self.next)?;
        mem.write_u64(offset + 8, self.ino)?;
        mem.write_u32(offset + 16, self.name_len)?;
        mem.write_u8(offset + 20, self.kind as u8)?;
        mem.write_u8(offset + 21, 0)?;
        mem.write_u8(offset + 22, 0)?;
        mem.write_u8(offset + 23, 0)
    }
}

/// File attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Filestat {
    pub dev: u64,
    pub ino: u64,
    pub filetype: u8,
    pub nlink: u64,
    pub size: u64,
    pub atim: u64,
    pub mtim: u64,
    pub ctim: u64,
}

impl Layout for Filestat {
    const SIZE: u32 = 64;

    fn read(mem: &GuestMemory<'_>, offset: u32) -> Result<Self, Errno> {
        Ok(Filestat {
            dev: mem.read_u64(offset)?,
            ino: mem.read_u64(offset + 8)?,
            filetype: mem.read_u8(offset + 16)?,
            nlink: mem.read_u64(offset + 24)?,
            size: mem.read_u64(offset + 32)?,
            atim: mem.read_u64(offset + 40)?,
            mtim: mem.read_u64(offset + 48)?,
            ctim: mem.read_u64(offset + 56)?,
        })
    }

    fn write(&self, mem: &mut GuestMemory<'_>, offset: u32) -> Result<(), Errno> {
        mem.write_u64(offset, self.dev)?;
        mem.write_u64(offset + 8, self.ino)?;
        mem.write_u8(offset + 16, self.filetype)?;
        for pad in 17..24 {
            mem.write_u8(offset + pad, 0)?;
        }
        mem.write_u64(offset + 24, self.nlink)?;
        mem.write_u64(offset + 32, self.size)?;
        mem.write_u64(offset + 40, self.atim)?;
        mem.write_u64(offset + 48, self.mtim)?;
        mem.write_u64(offset + 56, self.ctim)
    }
}

/// A clock wait request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSubscription {
    pub id: ClockId,
    pub timeout_ns: u64,
    pub precision_ns: u64,
    pub flags: ClockFlags,
}

/// Payload of a subscription, selected by its tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionContent {
    Clock(ClockSubscription),
    FdRead(u32),
    FdWrite(u32),
}

/// One `poll_oneoff` subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub userdata: u64,
    pub content: SubscriptionContent,
}

impl Layout for Subscription {
    const SIZE: u32 = 48;

    fn read(mem: &GuestMemory<'_>, offset: u32) -> Result<Self, Errno> {
        let userdata = mem.read_u64(offset)?;
        let tag = EventKind::from_raw(mem.read_u8(offset + 8)?).ok_or(Errno::Inval)?;
        let payload = offset + 16;
        let content = match tag {
            EventKind::Clock => SubscriptionContent::Clock(ClockSubscription {
                id: ClockId::from_raw(mem.read_u32(payload)?).ok_or(Errno::Inval)?,
                timeout_ns: mem.read_u64(payload + 8)?,
                precision_ns: mem.read_u64(payload + 16)?,
                flags: ClockFlags::from_bits_truncate(mem.read_u16(payload + 24)?),
            }),
            EventKind::FdRead => SubscriptionContent::FdRead(mem.read_u32(payload)?),
            EventKind::FdWrite => SubscriptionContent::FdWrite(mem.read_u32(payload)?),
        };
        Ok(Subscription { userdata, content })
    }

    fn write(&self, mem: &mut GuestMemory<'_>, offset: u32) -> Result<(), Errno> {
        mem.write_u64(offset, self.userdata)?;
        let tag = match self.content {
            SubscriptionContent::Clock(_) => EventKind::Clock,
            SubscriptionContent::FdRead(_) => EventKind::FdRead,
            SubscriptionContent::FdWrite(_) => EventKind::FdWrite,
        };
        mem.write_u8(offset + 8, tag as u8)?;
        for pad in 9..Self::SIZE {
            mem.write_u8(offset + pad, 0)?;
        }
        let payload = offset + 16;
        match self.content {
            SubscriptionContent::Clock(clock) => {
                mem.write_u32(payload, clock.id as u32)?;
                mem.write_u64(payload + 8, clock.timeout_ns)?;
                mem.write_u64(payload + 16, clock.precision_ns)?;
                mem.write_u16(payload + 24, clock.flags.bits())
            }
            SubscriptionContent::FdRead(fd) | SubscriptionContent::FdWrite(fd) => {
                mem.write_u32(payload, fd)
            }
        }
    }
}

/// One `poll_oneoff` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub userdata: u64,
    pub error: Errno,
    pub kind: EventKind,
    pub nbytes: u64,
}

impl Layout for Event {
    const SIZE: u32 = 32;

    fn read(mem: &GuestMemory<'_>, offset: u32) -> Result<Self, Errno> {
        Ok(Event {
            userdata: mem.read_u64(offset)?,
            error: Errno::from_raw(mem.read_u16(offset + 8)?).ok_or(Errno::Inval)?,
            kind: EventKind::from_raw(mem.read_u8(offset + 10)?).ok_or(Errno::Inval)?,
            nbytes: mem.read_u64(offset + 16)?,
        })
    }

    fn write(&self, mem: &mut GuestMemory<'_>, offset: u32) -> Result<(), Errno> {
        mem.write_u64(offset, self.userdata)?;
        mem.write_u16(offset + 8, self.error as u16)?;
        mem.write_u8(offset + 10, self.kind as u8)?;
        for pad in 11..16 {
            mem.write_u8(offset + pad, 0)?;
        }
        mem.write_u64(offset + 16, self.nbytes)?;
        // fd_readwrite flags; this runtime never reports a hangup
        mem.write_u16(offset + 24, 0)?;
        for pad in 26..32 {
            mem.write_u8(offset + pad, 0)?;
        }
        Ok(())
    }
}

// ─── Tests ─────────────────────────────────────────────────────────
