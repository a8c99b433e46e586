use super::address_space::AddressSpace;
use super::task::{Task, TaskSharedPtr};
use super::AddressSpaceId;
use crate::log::LogLevel::LogDebug;
use libc::pid_t;
use std::collections::BTreeMap;
use std::ffi::OsStr;

struct VmEntry {
    /// Number of tasks holding this id. The entry, including its
    /// breakpoints and watchpoints, dies with the last holder.
    refcount: u32,
    vm: AddressSpace,
}

/// State common to all session variants: the task table (keyed by
/// recorded tid) and the address-space arena.
pub struct SessionInner {
    tasks: BTreeMap<pid_t, TaskSharedPtr>,
    vms: Vec<Option<VmEntry>>,
    next_task_serial: u32,
}

impl SessionInner {
    pub fn new() -> SessionInner {
        SessionInner {
            tasks: BTreeMap::new(),
            vms: Vec::new(),
            next_task_serial: 1,
        }
    }

    pub fn find_task(&self, rec_tid: pid_t) -> Option<TaskSharedPtr> {
        self.tasks.get(&rec_tid).cloned()
    }

    pub fn tasks(&self) -> &BTreeMap<pid_t, TaskSharedPtr> {
        &self.tasks
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn add_task(&mut self, rec_tid: pid_t, task: TaskSharedPtr) {
        let old = self.tasks.insert(rec_tid, task);
        debug_assert!(old.is_none());
    }

    /// Forget the task and release its vm reference.
    pub fn on_task_destroyed(&mut self, rec_tid: pid_t) {
        if let Some(t) = self.tasks.remove(&rec_tid) {
            let vm = t.borrow().vm;
            self.vm_unref(vm);
        }
    }

    pub fn next_task_serial(&mut self) -> u32 {
        let serial = self.next_task_serial;
        self.next_task_serial += 1;
        serial
    }

    // --- address-space arena ---

    pub fn vm_create(&mut self, exe_name: &OsStr) -> AddressSpaceId {
        self.vm_insert(AddressSpace::new(exe_name))
    }

    /// A fork child starts with a copy of the parent's map.
    pub fn vm_fork(&mut self, parent: AddressSpaceId) -> AddressSpaceId {
        let copied = self.vm(parent).fork_copy();
        self.vm_insert(copied)
    }

    fn vm_insert(&mut self, vm: AddressSpace) -> AddressSpaceId {
        let entry = VmEntry { refcount: 1, vm };
        for (id, slot) in self.vms.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return id;
            }
        }
        self.vms.push(Some(entry));
        self.vms.len() - 1
    }

    pub fn vm_ref(&mut self, id: AddressSpaceId) {
        self.vms[id].as_mut().unwrap().refcount += 1;
    }

    pub fn vm_unref(&mut self, id: AddressSpaceId) {
        let entry = self.vms[id].as_mut().unwrap();
        entry.refcount -= 1;
        if entry.refcount == 0 {
            log!(LogDebug, "dropping address space {}", id);
            self.vms[id] = None;
        }
    }

    pub fn vm(&self, id: AddressSpaceId) -> &AddressSpace {
        &self.vms[id].as_ref().unwrap().vm
    }

    pub fn vm_mut(&mut self, id: AddressSpaceId) -> &mut AddressSpace {
        &mut self.vms[id].as_mut().unwrap().vm
    }

    /// SIGKILL everything we're still tracing. Used on tracer shutdown and
    /// when a fatal error makes the tracee tree unsalvageable.
    pub fn kill_all_tasks(&mut self) {
        let tids: Vec<pid_t> = self.tasks.keys().cloned().collect();
        for rec_tid in tids {
            if let Some(t) = self.tasks.get(&rec_tid) {
                let mut t = t.borrow_mut();
                Task::kill(&mut t);
            }
        }
        self.tasks.clear();
        self.vms.clear();
    }
}

impl Default for SessionInner {
    fn default() -> Self {
        Self::new()
    }
}
