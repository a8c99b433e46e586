//! The emulated file system: replay-side stand-ins for files that were
//! mmap'd shared during recording. Those files were most likely modified
//! during recording, so the original contents only exist as snapshots in
//! the trace; and every mapping of one must alias the same backing so
//! stores are seen by all mappees. Each emulated file is keyed by the
//! recorded (device, inode): two distinct live files can never collide on
//! that key because inode recycling requires all references (including
//! mappings) to the old file to be gone first, at which point the emulated
//! file has been dropped too.

use crate::log::LogLevel::LogDebug;
use crate::scoped_fd::ScopedFd;
use crate::session::address_space::kernel_mapping::KernelMapping;
use crate::util::resize_shmem_segment;
use libc::{c_void, pread64, pwrite64};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::getpid;
use std::{
    cell::RefCell,
    cmp::min,
    collections::HashMap,
    convert::TryInto,
    ffi::{CString, OsStr, OsString},
    io::Write,
    os::unix::ffi::{OsStrExt, OsStringExt},
    rc::{Rc, Weak},
};

pub type EmuFsSharedPtr = Rc<RefCell<EmuFs>>;
pub type EmuFileSharedPtr = Rc<RefCell<EmuFile>>;
pub type EmuFsSharedWeakPtr = Weak<RefCell<EmuFs>>;
pub type EmuFileSharedWeakPtr = Weak<RefCell<EmuFile>>;

type FileMap = HashMap<FileId, EmuFileSharedWeakPtr>;

pub struct EmuFile {
    orig_path: OsString,
    tmp_path: OsString,
    file: ScopedFd,
    owner: EmuFsSharedWeakPtr,
    size_: u64,
    device_: u64,
    inode_: u64,
}

impl EmuFile {
    const BUF_LEN: usize = 65536;

    fn new(
        owner: EmuFsSharedWeakPtr,
        fd: ScopedFd,
        orig_path: &OsStr,
        real_path: &OsStr,
        device: u64,
        inode: u64,
        file_size: u64,
    ) -> EmuFileSharedPtr {
        Rc::new(RefCell::new(EmuFile {
            orig_path: orig_path.to_owned(),
            tmp_path: real_path.to_owned(),
            file: fd,
            owner,
            size_: file_size,
            device_: device,
            inode_: inode,
        }))
    }

    /// The fd of the real backing file, in the tracer.
    pub fn fd(&self) -> &ScopedFd {
        &self.file
    }

    /// A pathname for this backing usable from any process:
    /// "/proc/<tracer-pid>/fd/<n>".
    pub fn proc_path(&self) -> String {
        format!("/proc/{}/fd/{}", getpid(), self.fd().as_raw())
    }

    /// The recorded path this file is standing in for.
    pub fn emu_path(&self) -> &OsStr {
        &self.orig_path
    }

    pub fn real_path(&self) -> &OsStr {
        &self.tmp_path
    }

    pub fn device(&self) -> u64 {
        self.device_
    }

    pub fn inode(&self) -> u64 {
        self.inode_
    }

    pub fn size(&self) -> u64 {
        self.size_
    }

    pub fn ensure_size(&mut self, size: u64) {
        if self.size_ < size {
            resize_shmem_segment(&self.file, size.try_into().unwrap());
            self.size_ = size;
        }
    }

    /// Byte-for-byte copy, for cloning an EmuFs into a diversion.
    fn clone_file(&self, owner: EmuFsSharedWeakPtr) -> EmuFileSharedPtr {
        let f = EmuFile::create(
            owner,
            self.emu_path(),
            self.device(),
            self.inode(),
            self.size_,
        );

        let mut data = [0u8; Self::BUF_LEN];
        let mut offset: u64 = 0;
        while offset < self.size_ {
            let amount: usize = min((self.size_ - offset) as usize, Self::BUF_LEN);
            let ret: isize = unsafe {
                pread64(
                    self.fd().as_raw(),
                    data.as_mut_ptr().cast::<c_void>(),
                    amount,
                    offset as i64,
                )
            };
            if ret <= 0 {
                fatal!("Couldn't read all of emulated file {:?}", self.orig_path);
            }
            let mut written = 0usize;
            while written < ret as usize {
                let w = unsafe {
                    pwrite64(
                        f.borrow().fd().as_raw(),
                        data[written..].as_ptr().cast(),
                        ret as usize - written,
                        (offset + written as u64) as i64,
                    )
                };
                if w <= 0 {
                    fatal!("Couldn't write all of emulated file clone");
                }
                written += w as usize;
            }
            offset += ret as u64;
        }

        f
    }

    /// Sizing must track later observations of the same file.
    fn update(&mut self, device: u64, inode: u64, size: u64) {
        debug_assert!(self.device_ == device && self.inode_ == inode);
        self.ensure_size(size);
    }

    fn create(
        owner: EmuFsSharedWeakPtr,
        orig_path: &OsStr,
        orig_device: u64,
        orig_inode: u64,
        orig_file_size: u64,
    ) -> EmuFileSharedPtr {
        let (fd, real_name) = create_memfd_file(orig_path, orig_device, orig_inode);
        resize_shmem_segment(&fd, orig_file_size.try_into().unwrap());

        let f = EmuFile::new(
            owner,
            fd,
            orig_path,
            &real_name,
            orig_device,
            orig_inode,
            orig_file_size,
        );

        log!(
            LogDebug,
            "created emulated file for {:?} as {:?}",
            orig_path,
            real_name
        );

        f
    }
}

impl Drop for EmuFile {
    fn drop(&mut self) {
        log!(LogDebug, "dropping emulated file (inode:{})", self.inode_);
        if let Some(owner) = self.owner.upgrade() {
            owner.borrow_mut().destroyed_file(self);
        }
    }
}

/// The pool of emulated files for one replay (or one diversion). Holds
/// weak references: an entry lives exactly as long as some mapping still
/// uses it.
pub struct EmuFs {
    files: FileMap,
    weak_self: EmuFsSharedWeakPtr,
}

impl EmuFs {
    pub fn create() -> EmuFsSharedPtr {
        let shared_fs = Rc::new(RefCell::new(EmuFs {
            files: HashMap::new(),
            weak_self: Weak::new(),
        }));
        shared_fs.borrow_mut().weak_self = Rc::downgrade(&shared_fs);
        shared_fs
    }

    /// The emulated file for `recorded_map`, if one exists.
    pub fn at(&self, recorded_map: &KernelMapping) -> Option<EmuFileSharedPtr> {
        self.files
            .get(&FileId::from_kernel_mapping(recorded_map))
            .and_then(|weak| weak.upgrade())
    }

    /// The emulated file representing the recorded shared mapping
    /// `recorded_km`, created on first use and grown to cover it.
    pub fn get_or_create(&mut self, recorded_km: &KernelMapping) -> EmuFileSharedPtr {
        let file_id = FileId::from_kernel_mapping(recorded_km);
        let min_file_size: u64 = recorded_km.file_offset_bytes() + recorded_km.size() as u64;
        if let Some(file) = self.files.get(&file_id).and_then(|weak| weak.upgrade()) {
            file.borrow_mut()
                .update(recorded_km.device(), recorded_km.inode(), min_file_size);
            return file;
        }

        let vf = EmuFile::create(
            self.weak_self.clone(),
            recorded_km.fsname(),
            recorded_km.device(),
            recorded_km.inode(),
            min_file_size,
        );
        self.files.insert(file_id, Rc::downgrade(&vf));
        vf
    }

    pub fn find(&self, device: u64, inode: u64) -> Option<EmuFileSharedPtr> {
        self.files
            .get(&FileId::new(device, inode))
            .and_then(|weak| weak.upgrade())
    }

    /// Deep copy for a diversion: same keys, fresh backing files, so
    /// speculative writes never reach the replay's state.
    pub fn clone_for_diversion(&self) -> (EmuFsSharedPtr, Vec<(EmuFileSharedPtr, EmuFileSharedPtr)>) {
        let new_fs = EmuFs::create();
        let mut pairs = Vec::new();
        for weak in self.files.values() {
            if let Some(old_file) = weak.upgrade() {
                let cloned = old_file
                    .borrow()
                    .clone_file(Rc::downgrade(&new_fs));
                let id = FileId::new(old_file.borrow().device(), old_file.borrow().inode());
                new_fs
                    .borrow_mut()
                    .files
                    .insert(id, Rc::downgrade(&cloned));
                pairs.push((old_file, cloned));
            }
        }
        (new_fs, pairs)
    }

    pub fn size(&self) -> usize {
        self.files.len()
    }

    fn destroyed_file(&mut self, emu_file: &EmuFile) {
        self.files.remove(&FileId::from_emu_file(emu_file));
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
struct FileId {
    pub device: u64,
    pub inode: u64,
}

impl FileId {
    pub fn new(device: u64, inode: u64) -> FileId {
        FileId { device, inode }
    }

    pub fn from_kernel_mapping(recorded_map: &KernelMapping) -> FileId {
        FileId {
            device: recorded_map.device(),
            inode: recorded_map.inode(),
        }
    }

    pub fn from_emu_file(emu_file: &EmuFile) -> FileId {
        FileId {
            device: emu_file.device_,
            inode: emu_file.inode_,
        }
    }
}

fn create_memfd_file(
    orig_path: &OsStr,
    orig_device: u64,
    orig_inode: u64,
) -> (ScopedFd, OsString) {
    let mut name: Vec<u8> = Vec::new();
    write!(
        name,
        "retrace-emufs-{}-dev-{}-inode-{}-",
        getpid(),
        orig_device,
        orig_inode
    )
    .unwrap();
    name.extend_from_slice(orig_path.as_bytes());
    name.truncate(255);

    let cname = CString::new(name.clone()).unwrap();
    match memfd_create(&cname, MemFdCreateFlag::empty()) {
        Ok(fd) => (ScopedFd::from_raw(fd), OsString::from_vec(name)),
        Err(e) => fatal!(
            "Failed to create memfd for {}:{}: {:?}",
            orig_device,
            orig_inode,
            e
        ),
    }
}
