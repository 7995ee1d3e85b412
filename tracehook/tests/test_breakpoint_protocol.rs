use std::sync::Arc;
use std::thread;

use tracehook::domain::{HostError, Pid};
use tracehook::engine::{BreakpointRequest, HardwareBreakpointManager, HitOutcome};
use tracehook::host::sim::{SimulatedHost, TrapEvent};
use tracehook_common::{BreakpointKind, BreakpointWidth};

const ADDR: u64 = 0x40_1000;

fn exec_at(address: u64) -> BreakpointRequest {
    BreakpointRequest::new(address, BreakpointKind::Exec, BreakpointWidth::Four)
}

/// Fire every trap armed at `address` and return the outcomes
fn execute(host: &SimulatedHost, manager: &HardwareBreakpointManager, address: u64) -> Vec<HitOutcome> {
    host.execute(address).into_iter().map(|handle| manager.on_hit(handle, address)).collect()
}

#[test]
fn test_execution_trap_relocates_and_restores() {
    let host = SimulatedHost::new();
    let manager = HardwareBreakpointManager::new(host.capabilities());
    let index = manager.set(&exec_at(ADDR)).expect("Failed to set breakpoint");

    assert_eq!(execute(&host, &manager, ADDR), [HitOutcome::SteppedPast { index, hits: 1 }]);
    let info = manager.get(index).unwrap();
    assert_eq!(info.state, "moved");
    assert_eq!(info.current_address, ADDR + 4);
    assert!(host.execute(ADDR).is_empty());

    assert_eq!(execute(&host, &manager, ADDR + 4), [HitOutcome::Restored { index }]);
    let info = manager.get(index).unwrap();
    assert_eq!(info.state, "armed");
    assert_eq!(info.current_address, ADDR);
    assert_eq!(info.hit_count, 1);

    // Second pass counts again
    assert_eq!(execute(&host, &manager, ADDR), [HitOutcome::SteppedPast { index, hits: 2 }]);
}

#[test]
fn test_watchpoint_restores_kind_and_width() {
    let host = SimulatedHost::new();
    let manager = HardwareBreakpointManager::new(host.capabilities());
    let request = BreakpointRequest::new(0x7fff_0000, BreakpointKind::Write, BreakpointWidth::Eight);
    let index = manager.set(&request).unwrap();
    let handle = host.execute(0x7fff_0000)[0];

    // A data trap fires after the writing instruction at some pc
    assert_eq!(manager.on_hit(handle, 0x40_2000), HitOutcome::SteppedPast { index, hits: 1 });
    let moved = host.trap(handle).unwrap().request;
    assert_eq!(moved.address, 0x40_2004);
    assert_eq!(moved.kind, BreakpointKind::Exec);
    assert_eq!(moved.width, BreakpointWidth::Four);

    assert_eq!(manager.on_hit(handle, 0x40_2004), HitOutcome::Restored { index });
    let restored = host.trap(handle).unwrap().request;
    assert_eq!(restored.address, 0x7fff_0000);
    assert_eq!(restored.kind, BreakpointKind::Write);
    assert_eq!(restored.width, BreakpointWidth::Eight);
}

#[test]
fn test_one_shot_without_relocation() {
    let host = SimulatedHost::new();
    let manager = HardwareBreakpointManager::new(host.capabilities_without_relocation());
    assert!(!manager.relocation_available());

    let index = manager.set(&exec_at(ADDR)).unwrap();
    assert_eq!(execute(&host, &manager, ADDR), [HitOutcome::Retired { index }]);
    assert_eq!(manager.active_count(), 0);
    assert_eq!(host.active_traps(), 0);

    // The slot can be reused
    assert_eq!(manager.set(&exec_at(ADDR)).unwrap(), index);
}

#[test]
fn test_failed_step_past_retires_slot() {
    let host = SimulatedHost::new();
    let manager = HardwareBreakpointManager::new(host.capabilities());
    let index = manager.set(&exec_at(ADDR)).unwrap();
    host.set_relocation_error(Some(HostError::BUSY));

    assert_eq!(execute(&host, &manager, ADDR), [HitOutcome::Retired { index }]);
    assert!(manager.get(index).is_none());
    assert_eq!(host.active_traps(), 0);
    assert!(host
        .trap_events()
        .iter()
        .any(|event| matches!(event, TrapEvent::RelocateFailed { address, .. } if *address == ADDR + 4)));
}

#[test]
fn test_failed_move_back_leaves_trap_on_next_instruction() {
    let host = SimulatedHost::new();
    let manager = HardwareBreakpointManager::new(host.capabilities());
    let index = manager.set(&exec_at(ADDR)).unwrap();

    assert_eq!(execute(&host, &manager, ADDR), [HitOutcome::SteppedPast { index, hits: 1 }]);
    host.set_relocation_error(Some(HostError::BUSY));
    assert_eq!(execute(&host, &manager, ADDR + 4), [HitOutcome::Stuck { index }]);

    let info = manager.get(index).unwrap();
    assert_eq!(info.state, "moved");
    assert_eq!(info.hit_count, 1);

    // Once relocation works again the next hit there moves it back
    host.set_relocation_error(None);
    assert_eq!(execute(&host, &manager, ADDR + 4), [HitOutcome::Restored { index }]);
}

#[test]
fn test_process_scoped_breakpoint() {
    let host = SimulatedHost::new();
    host.add_process(1234, "target", "target");
    let manager = HardwareBreakpointManager::new(host.capabilities());

    let request = exec_at(ADDR).for_process(Pid(1234)).describe("main loop");
    let index = manager.set(&request).unwrap();
    let info = manager.get(index).unwrap();
    assert_eq!(info.pid, Some(1234));
    assert_eq!(info.description, "main loop");

    let missing = exec_at(ADDR).for_process(Pid(4321));
    assert!(manager.set(&missing).is_err());
    assert_eq!(manager.active_count(), 1);
}

#[test]
fn test_stale_handle_is_ignored() {
    let host = SimulatedHost::new();
    let manager = HardwareBreakpointManager::new(host.capabilities());
    let index = manager.set(&exec_at(ADDR)).unwrap();
    let handle = host.execute(ADDR)[0];
    manager.clear(index).unwrap();

    assert_eq!(manager.on_hit(handle, ADDR), HitOutcome::Ignored);
}

#[test]
fn test_concurrent_hits_and_control() {
    let host = SimulatedHost::new();
    let manager = Arc::new(HardwareBreakpointManager::new(host.capabilities()));
    for i in 0..4 {
        manager.set(&exec_at(ADDR + i * 0x100)).unwrap();
    }

    let hitters: Vec<_> = (0..4u64)
        .map(|i| {
            let host = host.clone();
            let manager = manager.clone();
            thread::spawn(move || {
                let address = ADDR + i * 0x100;
                for _ in 0..200 {
                    for at in [address, address + 4] {
                        for handle in host.execute(at) {
                            manager.on_hit(handle, at);
                        }
                    }
                }
            })
        })
        .collect();

    for _ in 0..50 {
        manager.clear_all();
        for i in 0..4 {
            let _ = manager.set(&exec_at(ADDR + i * 0x100));
        }
    }
    for hitter in hitters {
        hitter.join().expect("hit thread panicked");
    }

    assert!(manager.active_count() <= 4);
    manager.clear_all();
    assert_eq!(manager.active_count(), 0);
    assert_eq!(host.active_traps(), 0);
}
