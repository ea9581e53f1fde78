//! Call a function inside a hardware-virtualized sandbox.
//!
//! A [`Sandbox`] owns a KVM VM with a 1 GiB identity-mapped guest physical
//! window. [`Sandbox::load_executable`] puts a flat binary or ELF64 image
//! into that window, builds the guest page tables and prepares a boot CPU
//! that starts directly in 64-bit long mode. [`Sandbox::call`] then hands
//! the guest a register file, runs it until it writes [`PIO_EXIT_PORT`]
//! and returns the updated registers.
//!
//! Guests run with zero-limit descriptor tables: any exception they raise
//! triple-faults and fails the call.

pub mod error;
pub mod loader;
pub mod memory;
pub mod paging;
pub mod vm;
pub mod x86;

use std::path::Path;

use bitflags::bitflags;
use log::info;

pub use error::{Error, Result};
pub use loader::ExecutableFormat;
pub use memory::Prot;
pub use vm::PIO_EXIT_PORT;

use memory::MemoryMap;
use vm::{KvmVm, VmExit};
use x86::CpuState;

bitflags! {
    /// Optional platform features a sandbox can be created with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u64 {}
}

/// Capabilities supported by this build. Nothing is advertised yet.
pub fn platform_capabilities() -> Capabilities {
    Capabilities::empty()
}

/// Register file handed to and returned from [`Sandbox::call`].
///
/// The GPRs are the whole calling convention: they go into the guest as
/// arguments and come back out as results. `rip` starts at the loaded
/// image's entry point and `rsp` at zero; a guest that needs a stack maps
/// or picks its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// A single-vCPU VM session that runs one loaded executable.
#[derive(Debug)]
pub struct Sandbox {
    // Field order doubles as teardown order: the KVM fds go first,
    // releasing every memory slot, then the map drops its host mappings.
    vm: KvmVm,
    memory: MemoryMap,
    cpu: CpuState,
    entry: u64,
    loaded: bool,
}

impl Sandbox {
    /// Create an empty sandbox. `caps` must be a subset of
    /// [`platform_capabilities`].
    pub fn new(caps: Capabilities) -> Result<Self> {
        if !platform_capabilities().contains(caps) {
            return Err(Error::Unsupported(format!(
                "requested capabilities {caps:?} are not available"
            )));
        }

        Ok(Self {
            vm: KvmVm::new()?,
            memory: MemoryMap::new(),
            cpu: CpuState::default(),
            entry: 0,
            loaded: false,
        })
    }

    /// Load `path` into the sandbox and make it callable.
    ///
    /// The file must be readable and executable. A sandbox accepts exactly
    /// one executable; on failure nothing is kept and the sandbox stays in
    /// its post-create state, so the load can be retried.
    pub fn load_executable(&mut self, path: impl AsRef<Path>, format: ExecutableFormat) -> Result<()> {
        let path = path.as_ref();
        if self.loaded {
            return Err(Error::InvalidArgument(
                "sandbox already has an executable loaded".into(),
            ));
        }
        loader::check_access(path)?;

        // The attempt owns its regions until the slots are installed; any
        // failure below drops the partial map and leaves the sandbox
        // untouched.
        let mut image = loader::load(path, format)?;
        paging::build(&mut image.memory)?;
        self.vm.install_memory_map(&image.memory)?;

        self.cpu = CpuState::boot();
        self.entry = image.entry;
        self.memory = image.memory;
        self.loaded = true;
        info!("{} ready, entry {:#x}", path.display(), self.entry);
        Ok(())
    }

    /// Run the guest from the entry point until it writes the exit port.
    ///
    /// On success `state` holds the guest's final register file. On any
    /// error (an unsupported exit, a triple fault, a failed run) `state`
    /// is left exactly as passed in.
    pub fn call(&mut self, state: &mut ArchState) -> Result<()> {
        if !self.loaded {
            return Err(Error::InvalidArgument("no executable loaded".into()));
        }

        self.load_call_state(state);
        self.vm.load_vcpu_state(&self.cpu)?;

        loop {
            match self.vm.run()? {
                VmExit::IoOut { port } if port == PIO_EXIT_PORT => break,
                VmExit::Shutdown => return Err(Error::TripleFault),
                exit => {
                    return Err(Error::Unsupported(format!("unhandled vm exit: {exit:?}")));
                }
            }
        }

        self.vm.store_vcpu_state(&mut self.cpu)?;
        self.store_call_state(state);
        Ok(())
    }

    fn load_call_state(&mut self, state: &ArchState) {
        let cpu = &mut self.cpu;
        cpu.rax = state.rax;
        cpu.rbx = state.rbx;
        cpu.rcx = state.rcx;
        cpu.rdx = state.rdx;
        cpu.rsi = state.rsi;
        cpu.rdi = state.rdi;
        cpu.rbp = state.rbp;
        cpu.r8 = state.r8;
        cpu.r9 = state.r9;
        cpu.r10 = state.r10;
        cpu.r11 = state.r11;
        cpu.r12 = state.r12;
        cpu.r13 = state.r13;
        cpu.r14 = state.r14;
        cpu.r15 = state.r15;
        cpu.rip = self.entry;
    }

    fn store_call_state(&self, state: &mut ArchState) {
        let cpu = &self.cpu;
        state.rax = cpu.rax;
        state.rbx = cpu.rbx;
        state.rcx = cpu.rcx;
        state.rdx = cpu.rdx;
        state.rsi = cpu.rsi;
        state.rdi = cpu.rdi;
        state.rbp = cpu.rbp;
        state.r8 = cpu.r8;
        state.r9 = cpu.r9;
        state.r10 = cpu.r10;
        state.r11 = cpu.r11;
        state.r12 = cpu.r12;
        state.r13 = cpu.r13;
        state.r14 = cpu.r14;
        state.r15 = cpu.r15;
    }
}
