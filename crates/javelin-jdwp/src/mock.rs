use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{JdwpError, JdwpTransport, MonitorId, ThreadId, ThreadInfo};

#[derive(Default)]
struct MockVm {
    threads: Vec<ThreadInfo>,
    suspend_counts: HashMap<ThreadId, u32>,
    contended: HashMap<ThreadId, MonitorId>,
    monitor_owners: HashMap<MonitorId, ThreadId>,
    disconnected: bool,
    monitor_info_supported: bool,
    suspend_calls: Vec<ThreadId>,
    resume_calls: Vec<ThreadId>,
    suspend_all_calls: u32,
    resume_all_calls: u32,
}

/// Deterministic, in-memory JDWP test double.
///
/// Clones share the same VM state, so a test can keep one handle for
/// assertions while the debugger owns another behind `Box<dyn JdwpTransport>`.
/// Suspend counts follow the JDWP vote semantics documented on
/// [`JdwpTransport`].
#[derive(Clone, Default)]
pub struct MockTransport {
    vm: Arc<Mutex<MockVm>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_thread(&self, id: ThreadId, name: impl Into<String>) {
        let mut vm = self.vm.lock();
        vm.threads.push(ThreadInfo {
            id,
            name: name.into(),
        });
        vm.suspend_counts.entry(id).or_insert(0);
    }

    /// Marks `thread` as blocked trying to enter `monitor`.
    pub fn set_contended_monitor(&self, thread: ThreadId, monitor: Option<MonitorId>) {
        let mut vm = self.vm.lock();
        match monitor {
            Some(monitor) => {
                vm.contended.insert(thread, monitor);
            }
            None => {
                vm.contended.remove(&thread);
            }
        }
    }

    pub fn set_monitor_owner(&self, monitor: MonitorId, owner: Option<ThreadId>) {
        let mut vm = self.vm.lock();
        match owner {
            Some(owner) => {
                vm.monitor_owners.insert(monitor, owner);
            }
            None => {
                vm.monitor_owners.remove(&monitor);
            }
        }
    }

    /// Enables or disables the optional monitor-inspection capabilities.
    /// Disabled by default, matching a conservative target VM.
    pub fn set_monitor_info_supported(&self, supported: bool) {
        self.vm.lock().monitor_info_supported = supported;
    }

    /// Makes every subsequent call fail with [`JdwpError::Disconnected`].
    pub fn disconnect(&self) {
        self.vm.lock().disconnected = true;
    }

    pub fn suspend_count_of(&self, thread: ThreadId) -> u32 {
        self.vm
            .lock()
            .suspend_counts
            .get(&thread)
            .copied()
            .unwrap_or(0)
    }

    pub fn suspend_calls(&self) -> Vec<ThreadId> {
        self.vm.lock().suspend_calls.clone()
    }

    pub fn resume_calls(&self) -> Vec<ThreadId> {
        self.vm.lock().resume_calls.clone()
    }

    pub fn suspend_all_calls(&self) -> u32 {
        self.vm.lock().suspend_all_calls
    }

    pub fn resume_all_calls(&self) -> u32 {
        self.vm.lock().resume_all_calls
    }
}

impl MockVm {
    fn check_connected(&self) -> Result<(), JdwpError> {
        if self.disconnected {
            Err(JdwpError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn check_thread(&self, thread: ThreadId) -> Result<(), JdwpError> {
        if self.threads.iter().any(|t| t.id == thread) {
            Ok(())
        } else {
            Err(JdwpError::InvalidThreadId(thread))
        }
    }
}

impl JdwpTransport for MockTransport {
    fn threads(&mut self) -> Result<Vec<ThreadInfo>, JdwpError> {
        let vm = self.vm.lock();
        vm.check_connected()?;
        Ok(vm.threads.clone())
    }

    fn suspend_thread(&mut self, thread: ThreadId) -> Result<(), JdwpError> {
        let mut vm = self.vm.lock();
        vm.check_connected()?;
        vm.check_thread(thread)?;
        vm.suspend_calls.push(thread);
        *vm.suspend_counts.entry(thread).or_insert(0) += 1;
        Ok(())
    }

    fn resume_thread(&mut self, thread: ThreadId) -> Result<(), JdwpError> {
        let mut vm = self.vm.lock();
        vm.check_connected()?;
        vm.check_thread(thread)?;
        vm.resume_calls.push(thread);
        let count = vm.suspend_counts.entry(thread).or_insert(0);
        // JDWP: resuming a running thread is a no-op, never a negative count.
        *count = count.saturating_sub(1);
        Ok(())
    }

    fn suspend_all(&mut self) -> Result<(), JdwpError> {
        let mut vm = self.vm.lock();
        vm.check_connected()?;
        vm.suspend_all_calls += 1;
        let ids: Vec<ThreadId> = vm.threads.iter().map(|t| t.id).collect();
        for id in ids {
            *vm.suspend_counts.entry(id).or_insert(0) += 1;
        }
        Ok(())
    }

    fn resume_all(&mut self) -> Result<(), JdwpError> {
        let mut vm = self.vm.lock();
        vm.check_connected()?;
        vm.resume_all_calls += 1;
        let ids: Vec<ThreadId> = vm.threads.iter().map(|t| t.id).collect();
        for id in ids {
            let count = vm.suspend_counts.entry(id).or_insert(0);
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    fn suspend_count(&mut self, thread: ThreadId) -> Result<u32, JdwpError> {
        let vm = self.vm.lock();
        vm.check_connected()?;
        vm.check_thread(thread)?;
        Ok(vm.suspend_counts.get(&thread).copied().unwrap_or(0))
    }

    fn current_contended_monitor(
        &mut self,
        thread: ThreadId,
    ) -> Result<Option<MonitorId>, JdwpError> {
        let vm = self.vm.lock();
        vm.check_connected()?;
        if !vm.monitor_info_supported {
            return Err(JdwpError::NotImplemented);
        }
        vm.check_thread(thread)?;
        Ok(vm.contended.get(&thread).copied())
    }

    fn owning_thread(&mut self, monitor: MonitorId) -> Result<Option<ThreadId>, JdwpError> {
        let vm = self.vm.lock();
        vm.check_connected()?;
        if !vm.monitor_info_supported {
            return Err(JdwpError::NotImplemented);
        }
        Ok(vm.monitor_owners.get(&monitor).copied())
    }
}
