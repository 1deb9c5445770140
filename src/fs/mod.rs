//! FUSE front end: a root directory holding the one image file.
//!
//! The adapter only translates requests. Attribute, lookup and open checks
//! are answered directly; reads go to [`RecoveringFile`]. A fatal read error
//! is answered with `EIO` and also handed to the mount's owner, which then
//! tears the mount down. The end of the session is signalled the same way.

use crate::config::MountConfig;
use crate::core::error::RescueError;
use crate::image_file::{FileAttributes, RecoveringFile};
use crate::recovery::{RangeRecovery, RecoverySupervisor};
use crossbeam_channel::Sender;
use fuser::{
    BackgroundSession, FUSE_ROOT_ID, FileAttr, FileType, Filesystem, MountOption, ReplyAttr,
    ReplyData, ReplyDirectory, ReplyEntry, ReplyOpen, Request,
};
use libc::c_int;
use std::ffi::{OsStr, OsString};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const ROOT_INODE: u64 = FUSE_ROOT_ID;
pub const IMAGE_INODE: u64 = FUSE_ROOT_ID + 1;

/// Attributes are never cached: the image's timestamps move while the tool runs.
const ATTR_TTL: Duration = Duration::ZERO;
/// The single name never changes meaning.
const ENTRY_TTL: Duration = Duration::from_secs(1 << 31);
const GENERATION: u64 = 1;

/// One directory entry as handed to `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: FileType,
    pub name: OsString,
}

pub struct ImageFs<R = RecoverySupervisor> {
    file: Arc<RecoveringFile<R>>,
    file_name: OsString,
    uid: u32,
    gid: u32,
    fatal: Sender<RescueError>,
    unmounted: Option<Sender<()>>,
}

impl<R: RangeRecovery> ImageFs<R> {
    pub fn new(
        file: Arc<RecoveringFile<R>>,
        file_name: impl Into<OsString>,
        fatal: Sender<RescueError>,
    ) -> Self {
        Self {
            file,
            file_name: file_name.into(),
            uid: rustix::process::getuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
            fatal,
            unmounted: None,
        }
    }

    /// Signals `unmounted` once the session ends, including an unmount done
    /// from outside the process.
    pub fn with_unmount_signal(mut self, unmounted: Sender<()>) -> Self {
        self.unmounted = Some(unmounted);
        self
    }

    pub fn file(&self) -> &RecoveringFile<R> {
        &self.file
    }

    pub fn attr(&self, ino: u64) -> Result<FileAttr, c_int> {
        let (kind, perm, size) = match ino {
            ROOT_INODE => (FileType::Directory, 0o755, 0),
            IMAGE_INODE => (FileType::RegularFile, 0o444, self.file.size()),
            _ => return Err(libc::ENOENT),
        };

        let image: FileAttributes = self.file.attributes().map_err(|e| {
            warn!("Cannot stat image {:?}: {}", self.file.image_path(), e);
            e.errno()
        })?;

        Ok(FileAttr {
            ino,
            size,
            blocks: image.blocks,
            atime: image.atime,
            mtime: image.mtime,
            ctime: image.ctime,
            crtime: image.ctime,
            kind,
            perm,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: image.blksize,
            flags: 0,
        })
    }

    pub fn lookup_entry(&self, parent: u64, name: &OsStr) -> Result<FileAttr, c_int> {
        if parent != ROOT_INODE || name != self.file_name.as_os_str() {
            return Err(libc::ENOENT);
        }
        self.attr(IMAGE_INODE)
    }

    /// Only read-only opens of the image are allowed.
    pub fn check_open(&self, ino: u64, flags: i32) -> Result<(), c_int> {
        if ino != IMAGE_INODE {
            return Err(libc::ENOENT);
        }
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(libc::EPERM);
        }
        Ok(())
    }

    pub fn check_opendir(&self, ino: u64) -> Result<(), c_int> {
        if ino != ROOT_INODE {
            return Err(libc::ENOENT);
        }
        Ok(())
    }

    /// The listing holds the image entry only.
    pub fn dir_entries(&self, ino: u64) -> Result<Vec<DirEntry>, c_int> {
        self.check_opendir(ino)?;
        Ok(vec![DirEntry {
            ino: IMAGE_INODE,
            kind: FileType::RegularFile,
            name: self.file_name.clone(),
        }])
    }

    pub fn read_data(&self, ino: u64, offset: i64, size: u32) -> Result<Vec<u8>, c_int> {
        if ino != IMAGE_INODE {
            return Err(libc::ENOENT);
        }
        let offset = u64::try_from(offset).map_err(|_| libc::EINVAL)?;

        self.file
            .read(offset, u64::from(size))
            .map_err(|e| self.report(e))
    }

    fn report(&self, err: RescueError) -> c_int {
        let errno = err.errno();
        if err.is_fatal() {
            error!("Fatal error, unmounting: {}", err);
            // Only the first fatal error matters; the mount is going away.
            let _ = self.fatal.try_send(err);
        } else {
            warn!("Read failed: {}", err);
        }
        errno
    }
}

impl<R: RangeRecovery + 'static> Filesystem for ImageFs<R> {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_entry(parent, name) {
            Ok(attr) => reply.entry(&ENTRY_TTL, &attr, GENERATION),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.attr(ino) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.check_open(ino, flags) {
            Ok(()) => reply.opened(ino, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_data(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.check_opendir(ino) {
            Ok(()) => reply.opened(ino, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.dir_entries(ino) {
            Ok(entries) => entries,
            Err(errno) => return reply.error(errno),
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (idx, entry) in entries.into_iter().enumerate().skip(skip) {
            // The offset handed back is where the next call resumes.
            if reply.add(entry.ino, (idx + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn destroy(&mut self) {
        debug!("Filesystem destroyed");
        if let Some(unmounted) = self.unmounted.take() {
            let _ = unmounted.try_send(());
        }
    }
}

/// Mounts `fs` read-only in a background session; dropping the session unmounts.
pub fn mount<R: RangeRecovery + 'static>(
    fs: ImageFs<R>,
    config: &MountConfig,
) -> io::Result<BackgroundSession> {
    let options = [
        MountOption::RO,
        MountOption::FSName(config.fs_name.clone()),
        MountOption::Subtype("rescuefs".to_string()),
    ];

    info!("Mounting {} on {:?}", config.fs_name, config.mountpoint);
    fuser::spawn_mount2(fs, &config.mountpoint, &options)
}
