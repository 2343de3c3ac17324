// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end coverage of the six concrete scenarios this crate's design
//! walks through: lazy anonymous allocation, eviction-and-restore, mmap
//! write-back, automatic stack growth, a bad fault, and fork isolation.

use vm_core::config::VmConfig;
use vm_core::disk::MemDisk;
use vm_core::file::MemFile;
use vm_core::mmu::TestMmu;
use vm_core::{BackingKind, Pid, VirtAddr, VmSystem};

fn start_vm(config: VmConfig) -> VmSystem<TestMmu, MemDisk> {
    let _ = env_logger::builder().is_test(true).try_init();
    let disk = MemDisk::new(4096, config.sector_size);
    VmSystem::new(config, TestMmu::new(), disk)
}

#[test]
fn lazy_anon_allocation_defers_the_frame() {
    let vm = start_vm(VmConfig::default());
    let pid = Pid::new(1);
    vm.register_process(pid);

    let va = VirtAddr::new(0x400000);
    vm.vm_alloc_page(pid, BackingKind::Anon, va, true).unwrap();

    {
        let spt = vm.spt_of(pid).unwrap();
        let spt = spt.lock();
        assert_eq!(spt.len(), 1);
        let page = spt.find(va, vm.config().page_size).unwrap();
        assert!(!page.lock().is_resident(), "page must not have a frame before the first touch");
    }

    vm.vm_claim_page(pid, va).unwrap();

    let spt = vm.spt_of(pid).unwrap();
    let page = spt.lock().find(va, vm.config().page_size).unwrap();
    let page = page.lock();
    assert!(page.is_resident());
}

#[test]
fn eviction_restores_original_contents() {
    // Small pool: four frames is enough to force eviction on the fifth.
    let mut config = VmConfig::default();
    config.frame_pool_size = 4;
    let vm = start_vm(config);
    let pid = Pid::new(1);
    vm.register_process(pid);

    let page_size = vm.config().page_size;
    let mut vas = Vec::new();
    for i in 0..4u8 {
        let va = VirtAddr::new(0x500000 + i as usize * page_size);
        vm.vm_alloc_page(pid, BackingKind::Anon, va, true).unwrap();
        vm.vm_claim_page(pid, va).unwrap();
        write_byte(&vm, pid, va, i);
        vas.push(va);
    }

    // A fifth page forces the clock hand to pick a victim among the four.
    let extra = VirtAddr::new(0x500000 + 4 * page_size);
    vm.vm_alloc_page(pid, BackingKind::Anon, extra, true).unwrap();
    vm.vm_claim_page(pid, extra).unwrap();

    for (i, va) in vas.iter().enumerate() {
        // Touching a swapped-out page re-faults it in transparently.
        if !is_resident(&vm, pid, *va) {
            vm.vm_claim_page(pid, *va).unwrap();
        }
        assert_eq!(read_byte(&vm, pid, *va), i as u8, "page at {va:?} lost its contents across eviction");
    }
}

#[test]
fn mmap_write_back_respects_read_bytes_and_zero_padding() {
    let vm = start_vm(VmConfig::default());
    let pid = Pid::new(1);
    vm.register_process(pid);

    let contents = vec![0u8; 5000];
    let file = MemFile::new(contents);
    let addr = VirtAddr::new(0x600000);

    let mapped = vm.do_mmap(pid, addr, 5000, true, file.clone(), 0);
    assert_eq!(mapped, Some(addr));

    let page_size = vm.config().page_size;
    {
        let spt = vm.spt_of(pid).unwrap();
        let spt = spt.lock();
        assert_eq!(spt.len(), 2, "5000 bytes at 4096-byte pages must span exactly two pages");
    }

    // Fault both pages in, then dirty one byte inside the second page.
    vm.vm_claim_page(pid, addr).unwrap();
    vm.vm_claim_page(pid, addr + page_size).unwrap();
    write_byte_at_offset(&vm, pid, addr + page_size, 4200 - page_size, 0xAA);

    vm.do_munmap(pid, addr).unwrap();

    let snapshot = file.snapshot();
    assert_eq!(snapshot[4200], 0xAA);
    assert_eq!(snapshot[4999], 0);
    assert_eq!(snapshot.len(), 5000, "the zero-pad tail of the last page must not extend the file");
}

#[test]
fn stack_grows_on_a_near_rsp_fault() {
    let vm = start_vm(VmConfig::default());
    let pid = Pid::new(1);
    vm.register_process(pid);

    let stack_top = vm.config().user_stack_addr();
    let rsp = stack_top;
    let fault_addr = VirtAddr::new(stack_top.as_usize() - 8);

    let handled = vm.vm_try_handle_fault(pid, fault_addr, true, true, true, rsp);
    assert!(handled);

    let page_va = fault_addr.page_floor(vm.config().page_size);
    let spt = vm.spt_of(pid).unwrap();
    let page = spt.lock().find(page_va, vm.config().page_size).unwrap();
    let page = page.lock();
    assert!(page.is_resident());
    assert!(page.is_stack);
}

#[test]
fn a_fault_with_no_mapping_and_far_from_the_stack_is_rejected() {
    let vm = start_vm(VmConfig::default());
    let pid = Pid::new(1);
    vm.register_process(pid);

    let handled =
        vm.vm_try_handle_fault(pid, VirtAddr::new(0x1000), true, false, true, vm.config().user_stack_addr());
    assert!(!handled);
}

#[test]
fn fork_copies_contents_and_isolates_subsequent_writes() {
    let vm = start_vm(VmConfig::default());
    let parent = Pid::new(1);
    let child = Pid::new(2);
    vm.register_process(parent);
    vm.register_process(child);

    let va = VirtAddr::new(0x400000);
    vm.vm_alloc_page(parent, BackingKind::Anon, va, true).unwrap();
    vm.vm_claim_page(parent, va).unwrap();
    write_byte(&vm, parent, va, 0xCD);

    vm.spt_copy(child, parent).unwrap();
    assert_eq!(read_byte(&vm, child, va), 0xCD);

    write_byte(&vm, child, va, 0xEF);
    assert_eq!(read_byte(&vm, child, va), 0xEF);
    assert_eq!(read_byte(&vm, parent, va), 0xCD, "fork must isolate writes in either direction");
}

// ---- scenario helpers ---------------------------------------------------

fn frame_id_of(vm: &VmSystem<TestMmu, MemDisk>, pid: Pid, va: VirtAddr) -> Option<vm_core::frame::FrameId> {
    let spt = vm.spt_of(pid).unwrap();
    let page = spt.lock().find(va, vm.config().page_size)?;
    let frame = page.lock().frame;
    frame
}

fn is_resident(vm: &VmSystem<TestMmu, MemDisk>, pid: Pid, va: VirtAddr) -> bool {
    frame_id_of(vm, pid, va).is_some()
}

fn write_byte(vm: &VmSystem<TestMmu, MemDisk>, pid: Pid, va: VirtAddr, value: u8) {
    write_byte_at_offset(vm, pid, va, 0, value);
}

fn write_byte_at_offset(vm: &VmSystem<TestMmu, MemDisk>, pid: Pid, va: VirtAddr, offset: usize, value: u8) {
    // Exercising the frame table directly here stands in for "the CPU
    // writes through the mapping installed by do_claim," which this
    // crate's test doubles don't actually route memory stores through.
    let frame_id = frame_id_of(vm, pid, va).expect("page must be resident before writing to it");
    vm.with_frame_mut(frame_id, |buf| buf[offset] = value);
}

fn read_byte(vm: &VmSystem<TestMmu, MemDisk>, pid: Pid, va: VirtAddr) -> u8 {
    let frame_id = frame_id_of(vm, pid, va).expect("page must be resident before reading it");
    vm.with_frame(frame_id, |buf| buf[0])
}
