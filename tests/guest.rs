//! End-to-end guest runs. Payloads are hand-assembled x86-64 byte
//! sequences; test ELFs are synthesized by `build_elf` below. Every test
//! skips when KVM is unavailable on the host.

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use guestcall::{ArchState, Capabilities, Error, ExecutableFormat, PIO_EXIT_PORT, Sandbox};

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const EM_X86_64: u16 = 62;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

fn sandbox() -> Option<Sandbox> {
    match Sandbox::new(Capabilities::empty()) {
        Ok(sandbox) => Some(sandbox),
        Err(err) => {
            eprintln!("skipping: kvm unavailable ({err})");
            None
        }
    }
}

fn write_guest(name: &str, content: &[u8]) -> PathBuf {
    let path = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join(name);
    let mut file = std::fs::File::create(&path).expect("create guest binary");
    file.write_all(content).expect("write guest binary");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("mark guest binary executable");
    path
}

/// mov dx, PIO_EXIT_PORT; out dx, al
fn exit_sequence() -> Vec<u8> {
    let port = PIO_EXIT_PORT.to_le_bytes();
    vec![0x66, 0xBA, port[0], port[1], 0xEE]
}

struct Segment<'a> {
    vaddr: u64,
    flags: u32,
    data: &'a [u8],
    memsz: u64,
}

/// Minimal ELF64 executable: header, one program header per segment,
/// segment bytes appended in order.
fn build_elf(entry: u64, segments: &[Segment]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&EM_X86_64.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // no sections
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    out.extend_from_slice(&[0u8; 6]);

    let mut data_off = (EHDR_SIZE + PHDR_SIZE * segments.len()) as u64;
    for seg in segments {
        out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        out.extend_from_slice(&seg.flags.to_le_bytes());
        out.extend_from_slice(&data_off.to_le_bytes());
        out.extend_from_slice(&seg.vaddr.to_le_bytes());
        out.extend_from_slice(&seg.vaddr.to_le_bytes());
        out.extend_from_slice(&(seg.data.len() as u64).to_le_bytes());
        out.extend_from_slice(&seg.memsz.to_le_bytes());
        out.extend_from_slice(&0x1000u64.to_le_bytes());
        data_off += seg.data.len() as u64;
    }
    for seg in segments {
        out.extend_from_slice(seg.data);
    }
    out
}

#[test]
fn flat_guest_exits_via_magic_port() {
    let Some(mut sandbox) = sandbox() else { return };
    let path = write_guest("exit_only.bin", &exit_sequence());

    sandbox
        .load_executable(&path, ExecutableFormat::Flat)
        .expect("load flat binary");

    let mut state = ArchState::default();
    sandbox.call(&mut state).expect("call guest");
}

#[test]
fn guest_registers_round_trip() {
    let Some(mut sandbox) = sandbox() else { return };

    // xchg rax, rbx; exit
    let mut code = vec![0x48, 0x93];
    code.extend_from_slice(&exit_sequence());
    let path = write_guest("xchg.bin", &code);

    sandbox
        .load_executable(&path, ExecutableFormat::Auto)
        .expect("load flat binary");

    let mut state = ArchState {
        rbx: 0xDEAD_BEEF,
        rbp: 0x1337,
        r15: 42,
        ..Default::default()
    };
    sandbox.call(&mut state).expect("call guest");

    assert_eq!(state.rax, 0xDEAD_BEEF);
    assert_eq!(state.rbx, 0);
    // Untouched registers survive the round trip, rbp included.
    assert_eq!(state.rbp, 0x1337);
    assert_eq!(state.r15, 42);
}

#[test]
fn repeated_calls_reuse_the_same_entry_state() {
    let Some(mut sandbox) = sandbox() else { return };

    // add rax, rbx; exit
    let mut code = vec![0x48, 0x01, 0xD8];
    code.extend_from_slice(&exit_sequence());
    let path = write_guest("add.bin", &code);

    sandbox
        .load_executable(&path, ExecutableFormat::Flat)
        .expect("load flat binary");

    for (rax, rbx, sum) in [(1u64, 2u64, 3u64), (10, 20, 30), (0, 0, 0)] {
        let mut state = ArchState {
            rax,
            rbx,
            ..Default::default()
        };
        sandbox.call(&mut state).expect("call guest");
        assert_eq!(state.rax, sum);
    }
}

#[test]
fn unhandled_port_fails_and_preserves_state() {
    let Some(mut sandbox) = sandbox() else { return };

    // in al, 0x60 (an arbitrary port the sandbox does not implement)
    let path = write_guest("bad_port.bin", &[0xE4, 0x60]);

    sandbox
        .load_executable(&path, ExecutableFormat::Flat)
        .expect("load flat binary");

    let mut state = ArchState {
        rax: 7,
        r15: 99,
        ..Default::default()
    };
    let err = sandbox.call(&mut state).expect_err("port must be rejected");
    assert!(matches!(err, Error::Unsupported(_)), "got: {err}");

    // Nothing is stored back on a failed call.
    assert_eq!(state.rax, 7);
    assert_eq!(state.r15, 99);
}

#[test]
fn elf_bss_reads_back_zero() {
    let Some(mut sandbox) = sandbox() else { return };

    let vaddr = 0x40_0000u64;
    // xor eax, eax; movabs rbx, bss; mov al, [rbx]; exit
    const CODE_LEN: u64 = 19;
    let bss_addr = vaddr + CODE_LEN;

    let mut code = vec![0x31, 0xC0];
    code.extend_from_slice(&[0x48, 0xBB]);
    code.extend_from_slice(&bss_addr.to_le_bytes());
    code.extend_from_slice(&[0x8A, 0x03]);
    code.extend_from_slice(&exit_sequence());
    assert_eq!(code.len() as u64, CODE_LEN);

    let elf = build_elf(
        vaddr,
        &[Segment {
            vaddr,
            flags: PF_R | PF_W | PF_X,
            data: &code,
            memsz: CODE_LEN + 0x1000,
        }],
    );
    let path = write_guest("bss.elf", &elf);

    sandbox
        .load_executable(&path, ExecutableFormat::Elf64)
        .expect("load elf");

    let mut state = ArchState {
        rax: 0x1234,
        ..Default::default()
    };
    sandbox.call(&mut state).expect("call guest");
    assert_eq!(state.rax, 0);
}

#[test]
fn write_to_readonly_segment_triple_faults() {
    let Some(mut sandbox) = sandbox() else { return };

    let vaddr = 0x40_0000u64;
    // movabs rbx, vaddr; mov [rbx], al, a store into our own R+X page
    let mut code = vec![0x48, 0xBB];
    code.extend_from_slice(&vaddr.to_le_bytes());
    code.extend_from_slice(&[0x88, 0x03]);
    code.extend_from_slice(&exit_sequence());

    let elf = build_elf(
        vaddr,
        &[Segment {
            vaddr,
            flags: PF_R | PF_X,
            data: &code,
            memsz: code.len() as u64,
        }],
    );
    let path = write_guest("wp.elf", &elf);

    sandbox
        .load_executable(&path, ExecutableFormat::Elf64)
        .expect("load elf");

    let mut state = ArchState::default();
    let err = sandbox.call(&mut state).expect_err("store must fault");
    assert!(matches!(err, Error::TripleFault), "got: {err}");
}

#[test]
fn jump_into_non_executable_segment_fails() {
    let Some(mut sandbox) = sandbox() else { return };

    let code_vaddr = 0x40_0000u64;
    let data_vaddr = 0x41_0000u64;

    // movabs rax, data; jmp rax
    let mut code = vec![0x48, 0xB8];
    code.extend_from_slice(&data_vaddr.to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xE0]);

    let elf = build_elf(
        code_vaddr,
        &[
            Segment {
                vaddr: code_vaddr,
                flags: PF_R | PF_X,
                data: &code,
                memsz: code.len() as u64,
            },
            Segment {
                vaddr: data_vaddr,
                flags: PF_R,
                data: &exit_sequence(),
                memsz: 0x1000,
            },
        ],
    );
    let path = write_guest("nx.elf", &elf);

    sandbox
        .load_executable(&path, ExecutableFormat::Elf64)
        .expect("load elf");

    let mut state = ArchState::default();
    let err = sandbox.call(&mut state).expect_err("fetch must fault");
    assert!(matches!(err, Error::TripleFault), "got: {err}");
}

#[test]
fn failed_elf_load_leaves_the_sandbox_reusable() {
    let Some(mut sandbox) = sandbox() else { return };

    let garbage = write_guest("garbage.bin", &[0x00, 0x01, 0x02, 0x03]);
    sandbox
        .load_executable(&garbage, ExecutableFormat::Elf64)
        .expect_err("garbage is not an elf");

    // The failed attempt kept nothing; a follow-up load works.
    let path = write_guest("retry.bin", &exit_sequence());
    sandbox
        .load_executable(&path, ExecutableFormat::Flat)
        .expect("load after failed attempt");

    let mut state = ArchState::default();
    sandbox.call(&mut state).expect("call guest");
}

#[test]
fn second_load_is_rejected() {
    let Some(mut sandbox) = sandbox() else { return };

    let path = write_guest("first.bin", &exit_sequence());
    sandbox
        .load_executable(&path, ExecutableFormat::Flat)
        .expect("load flat binary");

    let err = sandbox
        .load_executable(&path, ExecutableFormat::Flat)
        .expect_err("second load must fail");
    assert!(matches!(err, Error::InvalidArgument(_)), "got: {err}");
}

#[test]
fn call_without_load_is_rejected() {
    let Some(mut sandbox) = sandbox() else { return };

    let mut state = ArchState::default();
    let err = sandbox.call(&mut state).expect_err("nothing to run");
    assert!(matches!(err, Error::InvalidArgument(_)), "got: {err}");
}
