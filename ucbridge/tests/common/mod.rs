//! An in-process engine implementing the raw C API for tests.
//!
//! It runs a tiny byte-coded ISA so hooks fire from real `emu_start` calls:
//!
//! | bytes             | instruction                                   |
//! |-------------------|-----------------------------------------------|
//! | `90`              | nop                                           |
//! | `F4`              | hlt (stops after this instruction)            |
//! | `CD nn`           | int nn                                        |
//! | `0F 05`           | syscall                                       |
//! | `0F A2`           | cpuid                                         |
//! | `0F 0B`           | ud2 (invalid instruction)                     |
//! | `E4 pp`           | in al, pp                                     |
//! | `E6 pp`           | out pp, al                                    |
//! | `A0 <addr:8 LE>`  | rax = [addr] (8 bytes)                        |
//! | `A2 <addr:8 LE>`  | [addr] = rax (8 bytes)                        |
//!
//! Callbacks are always invoked without the engine lock held, and deleted
//! hooks are re-checked before each call, as libunicorn does.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{CStr, c_int, c_void};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, AtomicUsize, Ordering};
use ucbridge::sys::{
    self, uc_arch, uc_cb_mmio_read_t, uc_cb_mmio_write_t, uc_context, uc_engine, uc_err, uc_hook,
    uc_hook_type, uc_mem_region, uc_mode, uc_query_type, uc_tb, uc_tlb_entry,
};
use ucbridge::{Arch, Backend, CtlRequest, HookExtra, Mode, Unicorn};

pub const PAGE: u64 = 0x1000;

/// 16-bit alias of the low bits of `REG_RAX`.
pub const REG_AX: c_int = 3;
pub const REG_RAX: c_int = 35;
pub const REG_RIP: c_int = 41;
pub const REG_RBX: c_int = 37;
/// 16-byte vector register.
pub const REG_XMM0: c_int = 123;

pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(
            "ucbridge=debug".parse().expect("valid directive"),
        ))
        .with_test_writer()
        .try_init();
}

/// A fresh mock backend with one open x86-64 engine.
pub fn open_x86() -> (Arc<MockBackend>, Unicorn) {
    init_tracing();
    let mock = MockBackend::new();
    let uc = Unicorn::open(mock.clone(), Arch::X86, Mode::MODE_64).expect("open mock engine");
    (mock, uc)
}

/// Encodes `A0 <addr>`.
pub fn load(addr: u64) -> Vec<u8> {
    let mut code = vec![0xa0];
    code.extend_from_slice(&addr.to_le_bytes());
    code
}

/// Encodes `A2 <addr>`.
pub fn store(addr: u64) -> Vec<u8> {
    let mut code = vec![0xa2];
    code.extend_from_slice(&addr.to_le_bytes());
    code
}

struct AssertSend<T>(T);

// SAFETY: test-only; used to hand callback invocations to a scoped thread
// while the calling thread blocks on it.
unsafe impl<T> Send for AssertSend<T> {}

impl<T> AssertSend<T> {
    fn into_inner(self) -> T {
        self.0
    }
}

#[derive(Clone, Default)]
struct RegFile {
    gprs: HashMap<c_int, u64>,
    vectors: HashMap<c_int, [u8; 16]>,
    mmrs: HashMap<c_int, sys::uc_x86_mmr>,
    msrs: HashMap<u32, u64>,
    arm_cp: HashMap<[u32; 7], u64>,
    arm64_cp: HashMap<[u32; 5], u64>,
}

impl RegFile {
    fn gpr(&self, regid: c_int) -> u64 {
        self.gprs.get(&regid).copied().unwrap_or(0)
    }

    unsafe fn read(&self, regid: c_int, value: *mut c_void) -> uc_err {
        unsafe {
            match regid {
                REG_AX => ptr::write_unaligned(value.cast::<u16>(), self.gpr(REG_RAX) as u16),
                REG_XMM0 => {
                    let bytes = self.vectors.get(&regid).copied().unwrap_or([0; 16]);
                    ptr::copy_nonoverlapping(bytes.as_ptr(), value.cast::<u8>(), 16);
                }
                sys::UC_X86_REG_GDTR..=sys::UC_X86_REG_TR => {
                    let mmr = self.mmrs.get(&regid).copied().unwrap_or_default();
                    ptr::write_unaligned(value.cast::<sys::uc_x86_mmr>(), mmr);
                }
                sys::UC_X86_REG_MSR => {
                    let msr = value.cast::<sys::uc_x86_msr>();
                    let mut record = ptr::read_unaligned(msr);
                    record.value = self.msrs.get(&record.rid).copied().unwrap_or(0);
                    ptr::write_unaligned(msr, record);
                }
                sys::UC_ARM_REG_CP_REG => {
                    let cp = value.cast::<sys::uc_arm_cp_reg>();
                    let mut record = ptr::read_unaligned(cp);
                    record.val = self.arm_cp.get(&arm_key(&record)).copied().unwrap_or(0);
                    ptr::write_unaligned(cp, record);
                }
                sys::UC_ARM64_REG_CP_REG => {
                    let cp = value.cast::<sys::uc_arm64_cp_reg>();
                    let mut record = ptr::read_unaligned(cp);
                    record.val = self.arm64_cp.get(&arm64_key(&record)).copied().unwrap_or(0);
                    ptr::write_unaligned(cp, record);
                }
                0..300 => ptr::write_unaligned(value.cast::<u64>(), self.gpr(regid)),
                _ => return sys::UC_ERR_ARG,
            }
        }
        sys::UC_ERR_OK
    }

    unsafe fn write(&mut self, regid: c_int, value: *const c_void) -> uc_err {
        unsafe {
            match regid {
                REG_AX => {
                    let ax = ptr::read_unaligned(value.cast::<u16>()) as u64;
                    let rax = self.gpr(REG_RAX);
                    self.gprs.insert(REG_RAX, (rax & !0xffff) | ax);
                }
                REG_XMM0 => {
                    let mut bytes = [0u8; 16];
                    ptr::copy_nonoverlapping(value.cast::<u8>(), bytes.as_mut_ptr(), 16);
                    self.vectors.insert(regid, bytes);
                }
                sys::UC_X86_REG_GDTR..=sys::UC_X86_REG_TR => {
                    self.mmrs
                        .insert(regid, ptr::read_unaligned(value.cast::<sys::uc_x86_mmr>()));
                }
                sys::UC_X86_REG_MSR => {
                    let record = ptr::read_unaligned(value.cast::<sys::uc_x86_msr>());
                    self.msrs.insert(record.rid, record.value);
                }
                sys::UC_ARM_REG_CP_REG => {
                    let record = ptr::read_unaligned(value.cast::<sys::uc_arm_cp_reg>());
                    self.arm_cp.insert(arm_key(&record), record.val);
                }
                sys::UC_ARM64_REG_CP_REG => {
                    let record = ptr::read_unaligned(value.cast::<sys::uc_arm64_cp_reg>());
                    self.arm64_cp.insert(arm64_key(&record), record.val);
                }
                0..300 => {
                    self.gprs
                        .insert(regid, ptr::read_unaligned(value.cast::<u64>()));
                }
                _ => return sys::UC_ERR_ARG,
            }
        }
        sys::UC_ERR_OK
    }
}

fn arm_key(r: &sys::uc_arm_cp_reg) -> [u32; 7] {
    [r.cp, r.is64, r.sec, r.crn, r.crm, r.opc1, r.opc2]
}

fn arm64_key(r: &sys::uc_arm64_cp_reg) -> [u32; 5] {
    [r.crn, r.crm, r.op0, r.op1, r.op2]
}

enum Backing {
    Owned(Vec<u8>),
    Host(*mut u8),
    Mmio {
        read: Option<uc_cb_mmio_read_t>,
        read_ud: *mut c_void,
        write: Option<uc_cb_mmio_write_t>,
        write_ud: *mut c_void,
    },
}

struct Region {
    begin: u64,
    size: u64,
    perms: u32,
    backing: Backing,
}

impl Region {
    fn contains(&self, address: u64) -> bool {
        address >= self.begin && address - self.begin < self.size
    }

    fn overlaps(&self, begin: u64, size: u64) -> bool {
        begin < self.begin + self.size && self.begin < begin + size
    }

    fn byte(&self, address: u64) -> Option<u8> {
        let offset = (address - self.begin) as usize;
        match &self.backing {
            Backing::Owned(data) => Some(data[offset]),
            // SAFETY: the mapping contract keeps the host buffer alive.
            Backing::Host(ptr) => Some(unsafe { ptr.add(offset).read() }),
            Backing::Mmio { .. } => None,
        }
    }

    fn set_byte(&mut self, address: u64, value: u8) -> bool {
        let offset = (address - self.begin) as usize;
        match &mut self.backing {
            Backing::Owned(data) => data[offset] = value,
            // SAFETY: the mapping contract keeps the host buffer alive.
            Backing::Host(ptr) => unsafe { ptr.add(offset).write(value) },
            Backing::Mmio { .. } => return false,
        }
        true
    }
}

#[derive(Clone, Copy)]
struct MockHook {
    id: uc_hook,
    kind: uc_hook_type,
    callback: *mut c_void,
    user_data: *mut c_void,
    begin: u64,
    end: u64,
    extra: HookExtra,
}

impl MockHook {
    fn covers(&self, address: u64) -> bool {
        self.begin > self.end || (self.begin..=self.end).contains(&address)
    }
}

struct MockState {
    regs: RegFile,
    regions: Vec<Region>,
    hooks: Vec<MockHook>,
    next_hook: uc_hook,
    page_size: u32,
    timeout: u64,
    use_exits: bool,
    exits: Vec<u64>,
    cpu_model: c_int,
    tlb_mode: c_int,
    errno: uc_err,
    removed_cache: Vec<(u64, u64)>,
    tb_flushes: usize,
    tlb_flushes: usize,
}

impl MockState {
    fn region(&self, address: u64) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(address))
    }
}

struct MockUc {
    arch: uc_arch,
    mode: uc_mode,
    foreign_thread: bool,
    stop: AtomicBool,
    stop_requests: AtomicUsize,
    state: Mutex<MockState>,
}

unsafe fn mock<'a>(uc: *mut uc_engine) -> &'a MockUc {
    unsafe { &*uc.cast::<MockUc>() }
}

struct MockContext {
    regs: RegFile,
}

unsafe fn mock_context<'a>(ctx: *mut uc_context) -> &'a mut MockContext {
    unsafe { &mut *ctx.cast::<MockContext>() }
}

enum Lookup {
    Plain { perms: u32 },
    Mmio {
        begin: u64,
        read: Option<uc_cb_mmio_read_t>,
        read_ud: *mut c_void,
        write: Option<uc_cb_mmio_write_t>,
        write_ud: *mut c_void,
    },
    Unmapped,
}

enum Flow {
    Next,
    Halt,
    Fault(uc_err),
}

fn mem_hook_bit(kind: c_int) -> uc_hook_type {
    match kind {
        sys::UC_MEM_READ => sys::UC_HOOK_MEM_READ,
        sys::UC_MEM_WRITE => sys::UC_HOOK_MEM_WRITE,
        sys::UC_MEM_FETCH => sys::UC_HOOK_MEM_FETCH,
        sys::UC_MEM_READ_UNMAPPED => sys::UC_HOOK_MEM_READ_UNMAPPED,
        sys::UC_MEM_WRITE_UNMAPPED => sys::UC_HOOK_MEM_WRITE_UNMAPPED,
        sys::UC_MEM_FETCH_UNMAPPED => sys::UC_HOOK_MEM_FETCH_UNMAPPED,
        sys::UC_MEM_READ_PROT => sys::UC_HOOK_MEM_READ_PROT,
        sys::UC_MEM_WRITE_PROT => sys::UC_HOOK_MEM_WRITE_PROT,
        sys::UC_MEM_FETCH_PROT => sys::UC_HOOK_MEM_FETCH_PROT,
        _ => 0,
    }
}

fn insn_len(opcode: u8) -> usize {
    match opcode {
        0xcd | 0x0f | 0xe4 | 0xe6 => 2,
        0xa0 | 0xa2 => 9,
        _ => 1,
    }
}

impl MockUc {
    fn invoke<R>(&self, f: impl FnOnce() -> R) -> R {
        if !self.foreign_thread {
            return f();
        }
        let job = AssertSend(f);
        let joined = std::thread::scope(|s| {
            s.spawn(move || AssertSend(job.into_inner()()))
                .join()
        });
        match joined {
            Ok(result) => result.into_inner(),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Calls `f` for every hook matching `pred` that is still registered at
    /// the moment of the call.
    fn fire_edge(&self, uc: *mut uc_engine, cur: Option<uc_tb>, prev: Option<uc_tb>) {
        self.for_each_hook(
            |h| h.kind & sys::UC_HOOK_EDGE_GENERATED != 0,
            |h| unsafe {
                let mut cur = cur;
                let mut prev = prev;
                let cur_ptr = cur.as_mut().map_or(ptr::null_mut(), |tb| tb as *mut uc_tb);
                let prev_ptr = prev.as_mut().map_or(ptr::null_mut(), |tb| tb as *mut uc_tb);
                let cb: sys::uc_hook_edge_gen_t = std::mem::transmute(h.callback);
                self.invoke(|| cb(uc, cur_ptr, prev_ptr, h.user_data));
            },
        );
    }

    fn for_each_hook(&self, pred: impl Fn(&MockHook) -> bool, mut f: impl FnMut(MockHook)) {
        let candidates: Vec<MockHook> = self
            .state
            .lock()
            .hooks
            .iter()
            .filter(|h| pred(h))
            .copied()
            .collect();
        for hook in candidates {
            let live = self.state.lock().hooks.iter().any(|h| h.id == hook.id);
            if live {
                f(hook);
            }
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn rax(&self) -> u64 {
        self.state.lock().regs.gpr(REG_RAX)
    }

    fn set_rax(&self, value: u64) {
        self.state.lock().regs.gprs.insert(REG_RAX, value);
    }

    fn fire_code(&self, uc: *mut uc_engine, kind: uc_hook_type, address: u64, size: u32) {
        self.for_each_hook(
            |h| h.kind & kind != 0 && h.covers(address),
            |h| unsafe {
                let cb: sys::uc_cb_hookcode_t = std::mem::transmute(h.callback);
                self.invoke(|| cb(uc, address, size, h.user_data));
            },
        );
    }

    fn fire_mem_valid(&self, uc: *mut uc_engine, kind: c_int, address: u64, value: i64) {
        let bit = mem_hook_bit(kind);
        self.for_each_hook(
            |h| h.kind & bit != 0 && h.covers(address),
            |h| unsafe {
                let cb: sys::uc_cb_hookmem_t = std::mem::transmute(h.callback);
                self.invoke(|| cb(uc, kind, address, 8, value, h.user_data));
            },
        );
    }

    /// Returns whether any hook claimed the fault.
    fn fire_mem_invalid(&self, uc: *mut uc_engine, kind: c_int, address: u64, value: i64) -> bool {
        let bit = mem_hook_bit(kind);
        let mut handled = false;
        self.for_each_hook(
            |h| h.kind & bit != 0 && h.covers(address),
            |h| unsafe {
                let cb: sys::uc_cb_eventmem_t = std::mem::transmute(h.callback);
                handled |= self.invoke(|| cb(uc, kind, address, 8, value, h.user_data));
            },
        );
        handled
    }

    fn insn_hooks(&self, id: c_int) -> impl Fn(&MockHook) -> bool {
        move |h| h.kind & sys::UC_HOOK_INSN != 0 && h.extra == HookExtra::Insn(id)
    }

    fn lookup(&self, address: u64) -> Lookup {
        let state = self.state.lock();
        match state.region(address) {
            None => Lookup::Unmapped,
            Some(Region {
                backing:
                    Backing::Mmio {
                        read,
                        read_ud,
                        write,
                        write_ud,
                    },
                begin,
                ..
            }) => Lookup::Mmio {
                begin: *begin,
                read: *read,
                read_ud: *read_ud,
                write: *write,
                write_ud: *write_ud,
            },
            Some(region) => Lookup::Plain {
                perms: region.perms,
            },
        }
    }

    fn read_plain(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock();
        (0..len as u64)
            .map(|i| state.region(address + i).and_then(|r| r.byte(address + i)))
            .collect()
    }

    fn write_plain(&self, address: u64, bytes: &[u8]) -> bool {
        let mut state = self.state.lock();
        for (i, byte) in bytes.iter().enumerate() {
            let at = address + i as u64;
            let Some(region) = state.regions.iter_mut().find(|r| r.contains(at)) else {
                return false;
            };
            if !region.set_byte(at, *byte) {
                return false;
            }
        }
        true
    }

    /// One 8-byte guest load or store. Returns the loaded value.
    fn guest_access(&self, uc: *mut uc_engine, write: bool, address: u64, value: u64) -> Result<u64, uc_err> {
        for attempt in 0..2 {
            let (unmapped, prot, fault_unmapped, fault_prot) = if write {
                (
                    sys::UC_MEM_WRITE_UNMAPPED,
                    sys::UC_MEM_WRITE_PROT,
                    sys::UC_ERR_WRITE_UNMAPPED,
                    sys::UC_ERR_WRITE_PROT,
                )
            } else {
                (
                    sys::UC_MEM_READ_UNMAPPED,
                    sys::UC_MEM_READ_PROT,
                    sys::UC_ERR_READ_UNMAPPED,
                    sys::UC_ERR_READ_PROT,
                )
            };
            let valid = if write { sys::UC_MEM_WRITE } else { sys::UC_MEM_READ };

            match self.lookup(address) {
                Lookup::Mmio {
                    begin,
                    read,
                    read_ud,
                    write: write_cb,
                    write_ud,
                } => {
                    let offset = address - begin;
                    return if write {
                        if let Some(cb) = write_cb {
                            self.invoke(|| unsafe { cb(uc, offset, 8, value, write_ud) });
                        }
                        Ok(value)
                    } else {
                        Ok(match read {
                            Some(cb) => self.invoke(|| unsafe { cb(uc, offset, 8, read_ud) }),
                            None => 0,
                        })
                    };
                }
                Lookup::Plain { perms } => {
                    let needed = if write { sys::UC_PROT_WRITE } else { sys::UC_PROT_READ };
                    if perms & needed != 0 {
                        self.fire_mem_valid(uc, valid, address, if write { value as i64 } else { 0 });
                        if write {
                            if !self.write_plain(address, &value.to_le_bytes()) {
                                return Err(fault_unmapped);
                            }
                            return Ok(value);
                        }
                        let bytes = self.read_plain(address, 8).ok_or(fault_unmapped)?;
                        let mut word = [0u8; 8];
                        word.copy_from_slice(&bytes);
                        return Ok(u64::from_le_bytes(word));
                    }
                    if !self.fire_mem_invalid(uc, prot, address, value as i64) || attempt == 1 {
                        return Err(fault_prot);
                    }
                }
                Lookup::Unmapped => {
                    if !self.fire_mem_invalid(uc, unmapped, address, value as i64) || attempt == 1 {
                        return Err(fault_unmapped);
                    }
                }
            }
        }
        unreachable!("the second attempt always returns")
    }

    fn fetch(&self, uc: *mut uc_engine, pc: u64) -> Result<Vec<u8>, uc_err> {
        for attempt in 0..2 {
            match self.lookup(pc) {
                Lookup::Plain { perms } if perms & sys::UC_PROT_EXEC != 0 => {
                    let opcode = self.read_plain(pc, 1).ok_or(sys::UC_ERR_FETCH_UNMAPPED)?[0];
                    return self
                        .read_plain(pc, insn_len(opcode))
                        .ok_or(sys::UC_ERR_FETCH_UNMAPPED);
                }
                Lookup::Plain { .. } | Lookup::Mmio { .. } => {
                    if !self.fire_mem_invalid(uc, sys::UC_MEM_FETCH_PROT, pc, 0) || attempt == 1 {
                        return Err(sys::UC_ERR_FETCH_PROT);
                    }
                }
                Lookup::Unmapped => {
                    if !self.fire_mem_invalid(uc, sys::UC_MEM_FETCH_UNMAPPED, pc, 0) || attempt == 1 {
                        return Err(sys::UC_ERR_FETCH_UNMAPPED);
                    }
                }
            }
        }
        unreachable!("the second attempt always returns")
    }

    fn invalid_instruction(&self, uc: *mut uc_engine) -> Flow {
        let mut handled = false;
        self.for_each_hook(
            |h| h.kind & sys::UC_HOOK_INSN_INVALID != 0,
            |h| unsafe {
                let cb: sys::uc_cb_hookinsn_invalid_t = std::mem::transmute(h.callback);
                handled |= self.invoke(|| cb(uc, h.user_data));
            },
        );
        if handled {
            Flow::Next
        } else {
            Flow::Fault(sys::UC_ERR_INSN_INVALID)
        }
    }

    fn execute(&self, uc: *mut uc_engine, insn: &[u8]) -> Flow {
        match insn {
            [0x90] => Flow::Next,
            [0xf4] => Flow::Halt,
            [0xcd, intno] => {
                let mut fired = false;
                self.for_each_hook(
                    |h| h.kind & sys::UC_HOOK_INTR != 0,
                    |h| unsafe {
                        fired = true;
                        let cb: sys::uc_cb_hookintr_t = std::mem::transmute(h.callback);
                        self.invoke(|| cb(uc, *intno as u32, h.user_data));
                    },
                );
                if fired {
                    Flow::Next
                } else {
                    Flow::Fault(sys::UC_ERR_EXCEPTION)
                }
            }
            [0x0f, 0x05] => {
                self.for_each_hook(self.insn_hooks(sys::UC_X86_INS_SYSCALL), |h| unsafe {
                    let cb: sys::uc_cb_insn_syscall_t = std::mem::transmute(h.callback);
                    self.invoke(|| cb(uc, h.user_data));
                });
                Flow::Next
            }
            [0x0f, 0xa2] => {
                let mut skip = false;
                self.for_each_hook(self.insn_hooks(sys::UC_X86_INS_CPUID), |h| unsafe {
                    let cb: sys::uc_cb_insn_cpuid_t = std::mem::transmute(h.callback);
                    skip |= self.invoke(|| cb(uc, h.user_data)) != 0;
                });
                if !skip {
                    // "Genu"
                    self.set_rax(0x756e_6547);
                }
                Flow::Next
            }
            [0x0f, 0x0b] => self.invalid_instruction(uc),
            [0xe4, port] => {
                let mut value = None;
                self.for_each_hook(self.insn_hooks(sys::UC_X86_INS_IN), |h| unsafe {
                    let cb: sys::uc_cb_insn_in_t = std::mem::transmute(h.callback);
                    value = Some(self.invoke(|| cb(uc, *port as u32, 1, h.user_data)));
                });
                if let Some(value) = value {
                    let rax = self.rax();
                    self.set_rax((rax & !0xff) | (value as u64 & 0xff));
                }
                Flow::Next
            }
            [0xe6, port] => {
                let al = (self.rax() & 0xff) as u32;
                self.for_each_hook(self.insn_hooks(sys::UC_X86_INS_OUT), |h| unsafe {
                    let cb: sys::uc_cb_insn_out_t = std::mem::transmute(h.callback);
                    self.invoke(|| cb(uc, *port as u32, 1, al, h.user_data));
                });
                Flow::Next
            }
            [0xa0, addr @ ..] | [0xa2, addr @ ..] if addr.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(addr);
                let address = u64::from_le_bytes(raw);
                if insn[0] == 0xa0 {
                    match self.guest_access(uc, false, address, 0) {
                        Ok(value) => {
                            self.set_rax(value);
                            Flow::Next
                        }
                        Err(status) => Flow::Fault(status),
                    }
                } else {
                    match self.guest_access(uc, true, address, self.rax()) {
                        Ok(_) => Flow::Next,
                        Err(status) => Flow::Fault(status),
                    }
                }
            }
            _ => self.invalid_instruction(uc),
        }
    }

    fn run(&self, uc: *mut uc_engine, begin: u64, until: u64, count: usize) -> uc_err {
        let mut pc = begin;
        let mut executed = 0usize;
        self.fire_code(uc, sys::UC_HOOK_BLOCK, pc, until.saturating_sub(begin) as u32);
        loop {
            if self.stopped() || pc == until || (count != 0 && executed >= count) {
                break;
            }
            {
                let state = self.state.lock();
                if state.use_exits && state.exits.contains(&pc) {
                    break;
                }
            }
            let insn = match self.fetch(uc, pc) {
                Ok(insn) => insn,
                Err(status) => return status,
            };
            self.fire_code(uc, sys::UC_HOOK_CODE, pc, insn.len() as u32);
            if self.stopped() {
                break;
            }
            let flow = self.execute(uc, &insn);
            if let Flow::Fault(status) = flow {
                return status;
            }
            pc += insn.len() as u64;
            executed += 1;
            self.state.lock().regs.gprs.insert(REG_RIP, pc);
            if let Flow::Halt = flow {
                break;
            }
        }
        sys::UC_ERR_OK
    }
}

/// The mock engine library. One instance may open several engines.
#[derive(Default)]
pub struct MockBackend {
    foreign_thread_hooks: AtomicBool,
    fail_next_hook_add: AtomicI32,
    fail_next_mmio_map: AtomicI32,
    fail_next_context_alloc: AtomicI32,
    engines: Mutex<Vec<usize>>,
    allocations: Mutex<HashMap<usize, usize>>,
    pub hook_adds: AtomicUsize,
    pub hook_dels: AtomicUsize,
    pub closes: AtomicUsize,
    pub live_contexts: AtomicIsize,
    pub frees: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Engines opened afterwards invoke every callback from a fresh thread.
    pub fn set_foreign_thread_hooks(&self, enabled: bool) {
        self.foreign_thread_hooks.store(enabled, Ordering::Release);
    }

    pub fn fail_next_hook_add(&self, status: uc_err) {
        self.fail_next_hook_add.store(status, Ordering::Release);
    }

    pub fn fail_next_mmio_map(&self, status: uc_err) {
        self.fail_next_mmio_map.store(status, Ordering::Release);
    }

    pub fn fail_next_context_alloc(&self, status: uc_err) {
        self.fail_next_context_alloc.store(status, Ordering::Release);
    }

    pub fn open_engines(&self) -> usize {
        self.engines.lock().len()
    }

    /// The most recently opened engine that is still open.
    pub fn engine(&self) -> MockEngine {
        let uc = *self.engines.lock().last().expect("no open mock engine");
        MockEngine {
            uc: uc as *mut uc_engine,
        }
    }

    fn injected(slot: &AtomicI32) -> Option<uc_err> {
        match slot.swap(0, Ordering::AcqRel) {
            0 => None,
            status => Some(status),
        }
    }
}

/// Test access to one open mock engine.
pub struct MockEngine {
    uc: *mut uc_engine,
}

impl MockEngine {
    fn uc(&self) -> &MockUc {
        unsafe { mock(self.uc) }
    }

    pub fn hook_count(&self) -> usize {
        self.uc().state.lock().hooks.len()
    }

    pub fn mmio_regions(&self) -> usize {
        self.uc()
            .state
            .lock()
            .regions
            .iter()
            .filter(|r| matches!(r.backing, Backing::Mmio { .. }))
            .count()
    }

    pub fn stop_requests(&self) -> usize {
        self.uc().stop_requests.load(Ordering::Acquire)
    }

    pub fn page_size(&self) -> u32 {
        self.uc().state.lock().page_size
    }

    pub fn cpu_model(&self) -> c_int {
        self.uc().state.lock().cpu_model
    }

    pub fn tlb_mode(&self) -> c_int {
        self.uc().state.lock().tlb_mode
    }

    pub fn exits(&self) -> (bool, Vec<u64>) {
        let state = self.uc().state.lock();
        (state.use_exits, state.exits.clone())
    }

    pub fn removed_cache(&self) -> Vec<(u64, u64)> {
        self.uc().state.lock().removed_cache.clone()
    }

    pub fn flushes(&self) -> (usize, usize) {
        let state = self.uc().state.lock();
        (state.tb_flushes, state.tlb_flushes)
    }

    pub fn fire_edge_generated(&self, cur: Option<uc_tb>, prev: Option<uc_tb>) {
        self.uc().fire_edge(self.uc, cur, prev);
    }

    /// Asks every TLB fill hook in turn; the first that accepts wins.
    pub fn fire_tlb_fill(&self, vaddr: u64, kind: c_int) -> Option<uc_tlb_entry> {
        let m = self.uc();
        let uc = self.uc;
        let mut found = None;
        m.for_each_hook(
            |h| h.kind & sys::UC_HOOK_TLB_FILL != 0 && h.covers(vaddr),
            |h| unsafe {
                if found.is_some() {
                    return;
                }
                let mut entry = uc_tlb_entry::default();
                let entry_ptr = &mut entry as *mut uc_tlb_entry;
                let cb: sys::uc_cb_tlbevent_t = std::mem::transmute(h.callback);
                if m.invoke(|| cb(uc, vaddr, kind, entry_ptr, h.user_data)) {
                    found = Some(entry);
                }
            },
        );
        found
    }

    pub fn fire_tcg_opcode(&self, address: u64, arg1: u64, arg2: u64, size: u32) {
        let m = self.uc();
        let uc = self.uc;
        m.for_each_hook(
            |h| h.kind & sys::UC_HOOK_TCG_OPCODE != 0 && h.covers(address),
            |h| unsafe {
                let cb: sys::uc_hook_tcg_op_2 = std::mem::transmute(h.callback);
                m.invoke(|| cb(uc, address, arg1, arg2, size, h.user_data));
            },
        );
    }

    /// Returns each hook's answer in registration order.
    pub fn fire_arm64_sys(
        &self,
        insn: c_int,
        reg: c_int,
        cp_reg: Option<sys::uc_arm64_cp_reg>,
    ) -> Vec<u32> {
        let m = self.uc();
        let uc = self.uc;
        let mut answers = Vec::new();
        m.for_each_hook(m.insn_hooks(insn), |h| unsafe {
            let cp_ptr = cp_reg
                .as_ref()
                .map_or(ptr::null(), |cp| cp as *const sys::uc_arm64_cp_reg);
            let cb: sys::uc_cb_insn_sys_t = std::mem::transmute(h.callback);
            answers.push(m.invoke(|| cb(uc, reg, cp_ptr, h.user_data)));
        });
        answers
    }
}

static MESSAGES: [&CStr; 23] = [
    c"OK (UC_ERR_OK)",
    c"No memory available or memory not present (UC_ERR_NOMEM)",
    c"Invalid/unsupported architecture (UC_ERR_ARCH)",
    c"Invalid handle (UC_ERR_HANDLE)",
    c"Invalid mode (UC_ERR_MODE)",
    c"Different API version between core & binding (UC_ERR_VERSION)",
    c"Invalid memory read (UC_ERR_READ_UNMAPPED)",
    c"Invalid memory write (UC_ERR_WRITE_UNMAPPED)",
    c"Invalid memory fetch (UC_ERR_FETCH_UNMAPPED)",
    c"Invalid hook type (UC_ERR_HOOK)",
    c"Invalid instruction (UC_ERR_INSN_INVALID)",
    c"Invalid memory mapping (UC_ERR_MAP)",
    c"Write to write-protected memory (UC_ERR_WRITE_PROT)",
    c"Read from non-readable memory (UC_ERR_READ_PROT)",
    c"Fetch from non-executable memory (UC_ERR_FETCH_PROT)",
    c"Invalid argument (UC_ERR_ARG)",
    c"Read from unaligned memory (UC_ERR_READ_UNALIGNED)",
    c"Write to unaligned memory (UC_ERR_WRITE_UNALIGNED)",
    c"Fetch from unaligned memory (UC_ERR_FETCH_UNALIGNED)",
    c"Hook for this type event already exists (UC_ERR_HOOK_EXIST)",
    c"Insufficient resource (UC_ERR_RESOURCE)",
    c"Unhandled CPU exception (UC_ERR_EXCEPTION)",
    c"Provided buffer is too small (UC_ERR_OVERFLOW)",
];

pub fn message(code: uc_err) -> &'static str {
    MESSAGES[code as usize].to_str().expect("ascii")
}

unsafe impl Backend for MockBackend {
    fn version(&self) -> u32 {
        (sys::UC_API_MAJOR << 24) | (sys::UC_API_MINOR << 16)
    }

    fn arch_supported(&self, arch: uc_arch) -> bool {
        matches!(arch, sys::UC_ARCH_X86 | sys::UC_ARCH_ARM | sys::UC_ARCH_ARM64)
    }

    fn strerror(&self, code: uc_err) -> &'static CStr {
        usize::try_from(code)
            .ok()
            .and_then(|i| MESSAGES.get(i).copied())
            .unwrap_or(c"Unknown error code")
    }

    unsafe fn open(&self, arch: uc_arch, mode: uc_mode, uc: *mut *mut uc_engine) -> uc_err {
        if !self.arch_supported(arch) {
            return sys::UC_ERR_ARCH;
        }
        if arch == sys::UC_ARCH_X86
            && !matches!(mode, sys::UC_MODE_16 | sys::UC_MODE_32 | sys::UC_MODE_64)
        {
            return sys::UC_ERR_MODE;
        }
        let engine = Box::new(MockUc {
            arch,
            mode,
            foreign_thread: self.foreign_thread_hooks.load(Ordering::Acquire),
            stop: AtomicBool::new(false),
            stop_requests: AtomicUsize::new(0),
            state: Mutex::new(MockState {
                regs: RegFile::default(),
                regions: Vec::new(),
                hooks: Vec::new(),
                next_hook: 1,
                page_size: PAGE as u32,
                timeout: 0,
                use_exits: false,
                exits: Vec::new(),
                cpu_model: -1,
                tlb_mode: sys::UC_TLB_CPU,
                errno: sys::UC_ERR_OK,
                removed_cache: Vec::new(),
                tb_flushes: 0,
                tlb_flushes: 0,
            }),
        });
        let raw = Box::into_raw(engine);
        self.engines.lock().push(raw as usize);
        unsafe { *uc = raw.cast() };
        sys::UC_ERR_OK
    }

    unsafe fn close(&self, uc: *mut uc_engine) -> uc_err {
        let mut engines = self.engines.lock();
        let Some(pos) = engines.iter().position(|&e| e == uc as usize) else {
            return sys::UC_ERR_HANDLE;
        };
        engines.remove(pos);
        drop(unsafe { Box::from_raw(uc.cast::<MockUc>()) });
        self.closes.fetch_add(1, Ordering::AcqRel);
        sys::UC_ERR_OK
    }

    unsafe fn query(&self, uc: *mut uc_engine, kind: uc_query_type, result: *mut usize) -> uc_err {
        let m = unsafe { mock(uc) };
        let value = match kind {
            sys::UC_QUERY_MODE => m.mode as usize,
            sys::UC_QUERY_ARCH => m.arch as usize,
            sys::UC_QUERY_PAGE_SIZE => m.state.lock().page_size as usize,
            sys::UC_QUERY_TIMEOUT => 0,
            _ => return sys::UC_ERR_ARG,
        };
        unsafe { *result = value };
        sys::UC_ERR_OK
    }

    unsafe fn ctl(&self, uc: *mut uc_engine, request: CtlRequest<'_>) -> uc_err {
        let m = unsafe { mock(uc) };
        let mut state = m.state.lock();
        match request {
            CtlRequest::GetMode(out) => *out = m.mode,
            CtlRequest::GetArch(out) => *out = m.arch,
            CtlRequest::GetTimeout(out) => *out = state.timeout,
            CtlRequest::GetPageSize(out) => *out = state.page_size,
            CtlRequest::SetPageSize(size) => {
                if !size.is_power_of_two() || !state.regions.is_empty() {
                    return sys::UC_ERR_ARG;
                }
                state.page_size = size;
            }
            CtlRequest::SetUseExits(enable) => state.use_exits = enable,
            CtlRequest::GetExitsCount(out) => {
                if !state.use_exits {
                    return sys::UC_ERR_ARG;
                }
                *out = state.exits.len();
            }
            CtlRequest::GetExits(buf) => {
                if !state.use_exits || buf.len() < state.exits.len() {
                    return sys::UC_ERR_ARG;
                }
                buf[..state.exits.len()].copy_from_slice(&state.exits);
            }
            CtlRequest::SetExits(exits) => {
                if !state.use_exits {
                    return sys::UC_ERR_ARG;
                }
                state.exits = exits.to_vec();
            }
            CtlRequest::GetCpuModel(out) => *out = state.cpu_model,
            CtlRequest::SetCpuModel(model) => state.cpu_model = model,
            CtlRequest::RequestCache { address, tb } => {
                let Some(opcode) = state
                    .region(address)
                    .and_then(|r| r.byte(address))
                else {
                    return sys::UC_ERR_FETCH_UNMAPPED;
                };
                *tb = uc_tb {
                    pc: address,
                    icount: 1,
                    size: insn_len(opcode) as u16,
                };
                // A freshly translated block is reported as an edge with no
                // predecessor, outside of any run.
                let block = *tb;
                drop(state);
                m.fire_edge(uc, Some(block), None);
                return sys::UC_ERR_OK;
            }
            CtlRequest::RemoveCache { begin, end } => state.removed_cache.push((begin, end)),
            CtlRequest::FlushTb => state.tb_flushes += 1,
            CtlRequest::FlushTlb => state.tlb_flushes += 1,
            CtlRequest::TlbMode(mode) => state.tlb_mode = mode,
        }
        sys::UC_ERR_OK
    }

    unsafe fn errno(&self, uc: *mut uc_engine) -> uc_err {
        unsafe { mock(uc) }.state.lock().errno
    }

    unsafe fn emu_start(
        &self,
        uc: *mut uc_engine,
        begin: u64,
        until: u64,
        timeout: u64,
        count: usize,
    ) -> uc_err {
        let m = unsafe { mock(uc) };
        m.stop.store(false, Ordering::Release);
        {
            let mut state = m.state.lock();
            state.timeout = timeout;
            state.regs.gprs.insert(REG_RIP, begin);
        }
        let status = m.run(uc, begin, until, count);
        m.state.lock().errno = status;
        status
    }

    unsafe fn emu_stop(&self, uc: *mut uc_engine) -> uc_err {
        let m = unsafe { mock(uc) };
        m.stop_requests.fetch_add(1, Ordering::AcqRel);
        m.stop.store(true, Ordering::Release);
        sys::UC_ERR_OK
    }

    unsafe fn reg_read(&self, uc: *mut uc_engine, regid: c_int, value: *mut c_void) -> uc_err {
        unsafe { mock(uc).state.lock().regs.read(regid, value) }
    }

    unsafe fn reg_write(&self, uc: *mut uc_engine, regid: c_int, value: *const c_void) -> uc_err {
        unsafe { mock(uc).state.lock().regs.write(regid, value) }
    }

    unsafe fn context_reg_read(
        &self,
        ctx: *mut uc_context,
        regid: c_int,
        value: *mut c_void,
    ) -> uc_err {
        unsafe { mock_context(ctx).regs.read(regid, value) }
    }

    unsafe fn context_reg_write(
        &self,
        ctx: *mut uc_context,
        regid: c_int,
        value: *const c_void,
    ) -> uc_err {
        unsafe { mock_context(ctx).regs.write(regid, value) }
    }

    unsafe fn mem_read(&self, uc: *mut uc_engine, address: u64, bytes: *mut u8, size: usize) -> uc_err {
        let Some(data) = (unsafe { mock(uc) }).read_plain(address, size) else {
            return sys::UC_ERR_READ_UNMAPPED;
        };
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), bytes, size) };
        sys::UC_ERR_OK
    }

    unsafe fn mem_write(
        &self,
        uc: *mut uc_engine,
        address: u64,
        bytes: *const u8,
        size: usize,
    ) -> uc_err {
        let data = unsafe { std::slice::from_raw_parts(bytes, size) };
        if unsafe { mock(uc) }.write_plain(address, data) {
            sys::UC_ERR_OK
        } else {
            sys::UC_ERR_WRITE_UNMAPPED
        }
    }

    unsafe fn mem_map(&self, uc: *mut uc_engine, address: u64, size: usize, perms: u32) -> uc_err {
        unsafe {
            self.add_region(uc, address, size, perms, Backing::Owned(vec![0; size]))
        }
    }

    unsafe fn mem_map_ptr(
        &self,
        uc: *mut uc_engine,
        address: u64,
        size: usize,
        perms: u32,
        ptr: *mut c_void,
    ) -> uc_err {
        if ptr.is_null() {
            return sys::UC_ERR_ARG;
        }
        unsafe { self.add_region(uc, address, size, perms, Backing::Host(ptr.cast())) }
    }

    unsafe fn mmio_map(
        &self,
        uc: *mut uc_engine,
        address: u64,
        size: usize,
        read_cb: Option<uc_cb_mmio_read_t>,
        user_data_read: *mut c_void,
        write_cb: Option<uc_cb_mmio_write_t>,
        user_data_write: *mut c_void,
    ) -> uc_err {
        if let Some(status) = Self::injected(&self.fail_next_mmio_map) {
            return status;
        }
        let backing = Backing::Mmio {
            read: read_cb,
            read_ud: user_data_read,
            write: write_cb,
            write_ud: user_data_write,
        };
        unsafe { self.add_region(uc, address, size, sys::UC_PROT_READ | sys::UC_PROT_WRITE, backing) }
    }

    unsafe fn mem_unmap(&self, uc: *mut uc_engine, address: u64, size: usize) -> uc_err {
        let mut state = unsafe { mock(uc) }.state.lock();
        let end = address + size as u64;
        let before = state.regions.len();
        if state
            .regions
            .iter()
            .any(|r| r.overlaps(address, size as u64) && (r.begin < address || r.begin + r.size > end))
        {
            // Splitting regions is not modelled.
            return sys::UC_ERR_ARG;
        }
        state
            .regions
            .retain(|r| !(r.begin >= address && r.begin + r.size <= end));
        if state.regions.len() == before {
            return sys::UC_ERR_NOMEM;
        }
        sys::UC_ERR_OK
    }

    unsafe fn mem_protect(&self, uc: *mut uc_engine, address: u64, size: usize, perms: u32) -> uc_err {
        if perms & !sys::UC_PROT_ALL != 0 {
            return sys::UC_ERR_ARG;
        }
        let mut state = unsafe { mock(uc) }.state.lock();
        let end = address + size as u64;
        let mut touched = false;
        for region in state.regions.iter_mut() {
            if region.begin >= address && region.begin + region.size <= end {
                region.perms = perms;
                touched = true;
            }
        }
        if touched { sys::UC_ERR_OK } else { sys::UC_ERR_NOMEM }
    }

    unsafe fn mem_regions(
        &self,
        uc: *mut uc_engine,
        regions: *mut *mut uc_mem_region,
        count: *mut u32,
    ) -> uc_err {
        let state = unsafe { mock(uc) }.state.lock();
        let mut list: Vec<uc_mem_region> = state
            .regions
            .iter()
            .map(|r| uc_mem_region {
                begin: r.begin,
                end: r.begin + r.size - 1,
                perms: r.perms,
            })
            .collect();
        list.sort_by_key(|r| r.begin);
        let len = list.len();
        let raw = Box::into_raw(list.into_boxed_slice()).cast::<uc_mem_region>();
        self.allocations.lock().insert(raw as usize, len);
        unsafe {
            *regions = raw;
            *count = len as u32;
        }
        sys::UC_ERR_OK
    }

    unsafe fn free(&self, mem: *mut c_void) -> uc_err {
        let Some(len) = self.allocations.lock().remove(&(mem as usize)) else {
            return sys::UC_ERR_ARG;
        };
        let slice = ptr::slice_from_raw_parts_mut(mem.cast::<uc_mem_region>(), len);
        drop(unsafe { Box::from_raw(slice) });
        self.frees.fetch_add(1, Ordering::AcqRel);
        sys::UC_ERR_OK
    }

    unsafe fn context_alloc(&self, _uc: *mut uc_engine, context: *mut *mut uc_context) -> uc_err {
        if let Some(status) = Self::injected(&self.fail_next_context_alloc) {
            return status;
        }
        let ctx = Box::into_raw(Box::new(MockContext {
            regs: RegFile::default(),
        }));
        self.live_contexts.fetch_add(1, Ordering::AcqRel);
        unsafe { *context = ctx.cast() };
        sys::UC_ERR_OK
    }

    unsafe fn context_free(&self, context: *mut uc_context) -> uc_err {
        drop(unsafe { Box::from_raw(context.cast::<MockContext>()) });
        self.live_contexts.fetch_sub(1, Ordering::AcqRel);
        sys::UC_ERR_OK
    }

    unsafe fn context_save(&self, uc: *mut uc_engine, context: *mut uc_context) -> uc_err {
        let regs = unsafe { mock(uc) }.state.lock().regs.clone();
        unsafe { mock_context(context).regs = regs };
        sys::UC_ERR_OK
    }

    unsafe fn context_restore(&self, uc: *mut uc_engine, context: *mut uc_context) -> uc_err {
        let regs = unsafe { mock_context(context) }.regs.clone();
        unsafe { mock(uc) }.state.lock().regs = regs;
        sys::UC_ERR_OK
    }

    unsafe fn hook_add(
        &self,
        uc: *mut uc_engine,
        hh: *mut uc_hook,
        kind: uc_hook_type,
        callback: *mut c_void,
        user_data: *mut c_void,
        begin: u64,
        end: u64,
        extra: HookExtra,
    ) -> uc_err {
        if let Some(status) = Self::injected(&self.fail_next_hook_add) {
            return status;
        }
        if callback.is_null() {
            return sys::UC_ERR_ARG;
        }
        let mut state = unsafe { mock(uc) }.state.lock();
        let id = state.next_hook;
        state.next_hook += 1;
        state.hooks.push(MockHook {
            id,
            kind,
            callback,
            user_data,
            begin,
            end,
            extra,
        });
        unsafe { *hh = id };
        self.hook_adds.fetch_add(1, Ordering::AcqRel);
        sys::UC_ERR_OK
    }

    unsafe fn hook_del(&self, uc: *mut uc_engine, hh: uc_hook) -> uc_err {
        unsafe { mock(uc) }.state.lock().hooks.retain(|h| h.id != hh);
        self.hook_dels.fetch_add(1, Ordering::AcqRel);
        sys::UC_ERR_OK
    }
}

impl MockBackend {
    unsafe fn add_region(
        &self,
        uc: *mut uc_engine,
        address: u64,
        size: usize,
        perms: u32,
        backing: Backing,
    ) -> uc_err {
        let mut state = unsafe { mock(uc) }.state.lock();
        let page = state.page_size as u64;
        if size == 0 || address % page != 0 || size as u64 % page != 0 {
            return sys::UC_ERR_ARG;
        }
        if perms & !sys::UC_PROT_ALL != 0 {
            return sys::UC_ERR_ARG;
        }
        if state.regions.iter().any(|r| r.overlaps(address, size as u64)) {
            return sys::UC_ERR_MAP;
        }
        state.regions.push(Region {
            begin: address,
            size: size as u64,
            perms,
            backing,
        });
        sys::UC_ERR_OK
    }
}
