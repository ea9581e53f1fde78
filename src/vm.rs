use std::sync::OnceLock;

use kvm_bindings::{KVM_MEM_READONLY, kvm_regs, kvm_segment, kvm_userspace_memory_region};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use log::debug;

use crate::error::Result;
use crate::memory::{MemoryMap, Prot};
use crate::x86::{CpuState, SegFlags, Segment};

/// Writing any byte to this port terminates the current call successfully;
/// the payload byte is ignored.
pub const PIO_EXIT_PORT: u16 = 0xF4;

static KVM: OnceLock<Kvm> = OnceLock::new();

/// Process-wide KVM driver handle, opened on first use and kept until
/// process exit.
fn kvm() -> Result<&'static Kvm> {
    if let Some(kvm) = KVM.get() {
        return Ok(kvm);
    }
    let kvm = Kvm::new()?;
    debug!("kvm api version {}", kvm.get_api_version());
    Ok(KVM.get_or_init(|| kvm))
}

/// Normalized vCPU exit record.
#[derive(Debug)]
pub enum VmExit {
    /// Guest wrote to an I/O port.
    IoOut { port: u16 },
    /// Guest read from an I/O port.
    IoIn { port: u16 },
    /// Guest touched guest physical space with no slot behind it.
    Mmio { addr: u64 },
    Hlt,
    /// Guest shut down; with zero-limit descriptor tables this is where
    /// triple faults surface.
    Shutdown,
    Other(String),
}

/// One VM and its single vCPU.
#[derive(Debug)]
pub struct KvmVm {
    vm: VmFd,
    vcpu: VcpuFd,
}

impl KvmVm {
    pub fn new() -> Result<Self> {
        let vm = kvm()?.create_vm()?;
        let vcpu = vm.create_vcpu(0)?;
        Ok(Self { vm, vcpu })
    }

    /// Assign every region of `memory` to its own memory slot. Regions
    /// without WRITE are installed read-only.
    pub fn install_memory_map(&self, memory: &MemoryMap) -> Result<()> {
        for (slot, region) in memory.regions().enumerate() {
            let flags = if region.prot().contains(Prot::WRITE) {
                0
            } else {
                KVM_MEM_READONLY
            };
            let kvm_region = kvm_userspace_memory_region {
                slot: slot as u32,
                guest_phys_addr: region.gpa(),
                memory_size: region.size(),
                userspace_addr: region.host_base() as u64,
                flags,
            };
            // SAFETY: the mapping behind `userspace_addr` is owned by the
            // session's memory map, which outlives the VM fd.
            unsafe { self.vm.set_user_memory_region(kvm_region)? };
        }
        debug!("installed {} memory slots", memory.len());
        Ok(())
    }

    /// Commit the full CPU image to the vCPU.
    pub fn load_vcpu_state(&self, cpu: &CpuState) -> Result<()> {
        let regs = kvm_regs {
            rax: cpu.rax,
            rbx: cpu.rbx,
            rcx: cpu.rcx,
            rdx: cpu.rdx,
            rsi: cpu.rsi,
            rdi: cpu.rdi,
            rsp: cpu.rsp,
            rbp: cpu.rbp,
            r8: cpu.r8,
            r9: cpu.r9,
            r10: cpu.r10,
            r11: cpu.r11,
            r12: cpu.r12,
            r13: cpu.r13,
            r14: cpu.r14,
            r15: cpu.r15,
            rip: cpu.rip,
            rflags: cpu.rflags,
        };
        self.vcpu.set_regs(&regs)?;

        let mut sregs = self.vcpu.get_sregs()?;
        sregs.cs = kvm_segment_from(&cpu.cs);
        sregs.ds = kvm_segment_from(&cpu.ds);
        sregs.ss = kvm_segment_from(&cpu.ss);
        sregs.es = kvm_segment_from(&cpu.es);
        sregs.fs = kvm_segment_from(&cpu.fs);
        sregs.gs = kvm_segment_from(&cpu.gs);
        sregs.tr = kvm_segment_from(&cpu.tr);
        sregs.ldt = kvm_segment_from(&cpu.ldt);
        // Zero-limit GDT/IDT: exceptions cannot dispatch and triple-fault
        // instead.
        sregs.gdt.base = 0;
        sregs.gdt.limit = 0;
        sregs.idt.base = 0;
        sregs.idt.limit = 0;
        sregs.cr0 = cpu.cr0;
        sregs.cr3 = cpu.cr3;
        sregs.cr4 = cpu.cr4;
        sregs.efer = cpu.efer;
        self.vcpu.set_sregs(&sregs)?;

        Ok(())
    }

    /// Read the register file back after a run. `rbp` travels both ways,
    /// same as every other GPR.
    pub fn store_vcpu_state(&self, cpu: &mut CpuState) -> Result<()> {
        let regs = self.vcpu.get_regs()?;
        cpu.rax = regs.rax;
        cpu.rbx = regs.rbx;
        cpu.rcx = regs.rcx;
        cpu.rdx = regs.rdx;
        cpu.rsi = regs.rsi;
        cpu.rdi = regs.rdi;
        cpu.rsp = regs.rsp;
        cpu.rbp = regs.rbp;
        cpu.r8 = regs.r8;
        cpu.r9 = regs.r9;
        cpu.r10 = regs.r10;
        cpu.r11 = regs.r11;
        cpu.r12 = regs.r12;
        cpu.r13 = regs.r13;
        cpu.r14 = regs.r14;
        cpu.r15 = regs.r15;
        cpu.rip = regs.rip;
        cpu.rflags = regs.rflags;
        Ok(())
    }

    /// One entry into guest execution. A failed run ioctl (including an
    /// interrupt by signal) is fatal and must not be resumed.
    pub fn run(&mut self) -> Result<VmExit> {
        let exit = match self.vcpu.run()? {
            VcpuExit::IoOut(port, _) => VmExit::IoOut { port },
            VcpuExit::IoIn(port, _) => VmExit::IoIn { port },
            VcpuExit::MmioRead(addr, _) | VcpuExit::MmioWrite(addr, _) => VmExit::Mmio { addr },
            VcpuExit::Hlt => VmExit::Hlt,
            VcpuExit::Shutdown => VmExit::Shutdown,
            other => VmExit::Other(format!("{other:?}")),
        };
        Ok(exit)
    }
}

fn kvm_segment_from(seg: &Segment) -> kvm_segment {
    kvm_segment {
        base: seg.base,
        limit: seg.limit,
        selector: seg.selector,
        type_: seg.type_,
        dpl: seg.dpl,
        present: seg.flags.contains(SegFlags::PRESENT) as u8,
        s: seg.flags.contains(SegFlags::S) as u8,
        l: seg.flags.contains(SegFlags::L) as u8,
        db: seg.flags.contains(SegFlags::DB) as u8,
        g: seg.flags.contains(SegFlags::G) as u8,
        avl: 0,
        unusable: 0,
        padding: 0,
    }
}
