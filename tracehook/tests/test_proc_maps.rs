use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracehook::config::EngineSettings;
use tracehook::domain::Pid;
use tracehook::engine::{CallSite, Engine, ModuleResolver};
use tracehook::host::linux::maps::ProcMaps;
use tracehook::host::linux::procfs::ProcFs;
use tracehook::host::{HostCapabilities, ProcessTable};
use tracehook_common::RegisterSnapshot;

const MAPS: &str = "\
70000000-70001000 r--p 00000000 fd:01 100    /system/lib/libfoo.so
70001000-70003000 r-xp 00001000 fd:01 100    /system/lib/libfoo.so
70003000-70004000 rw-p 00003000 fd:01 100    /system/lib/libfoo.so
70004000-70005000 rw-p 00000000 00:00 0
7ffc0000-7ffc1000 rw-p 00000000 00:00 0      [stack]
";

fn write_process(root: &Path, pid: i32, cmdline: &[u8], maps: &str) {
    let dir = root.join(pid.to_string());
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("stat"), format!("{pid} (foo) S 1 1 1 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 4242 0 0")).unwrap();
    fs::write(dir.join("cmdline"), cmdline).unwrap();
    fs::write(dir.join("maps"), maps).unwrap();
}

#[test]
fn test_labels_from_maps_file() {
    let dir = tempfile::tempdir().unwrap();
    write_process(dir.path(), 500, b"com.example.foo\0", MAPS);

    let procfs = ProcFs::at(dir.path());
    let process = procfs.find(Pid(500)).expect("process should exist");
    let resolver = ModuleResolver::new(Some(Arc::new(ProcMaps::new(procfs))));

    assert_eq!(resolver.resolve(process, 0x7000_0010), "libfoo.so + 0x10");
    // Later segments are labelled relative to the first segment of the file
    assert_eq!(resolver.resolve(process, 0x7000_2a40), "libfoo.so + 0x2a40");
    assert_eq!(resolver.resolve(process, 0x7000_4008), "[anon] + 0x8");
    assert_eq!(resolver.resolve(process, 0x7ffc_0010), "[anon] + 0x10");
    assert_eq!(resolver.resolve(process, 0x1000), "");
}

#[test]
fn test_missing_maps_file_gives_no_label() {
    let dir = tempfile::tempdir().unwrap();
    write_process(dir.path(), 501, b"foo\0", MAPS);
    fs::remove_file(dir.path().join("501").join("maps")).unwrap();

    let procfs = ProcFs::at(dir.path());
    let process = procfs.find(Pid(501)).unwrap();
    let resolver = ModuleResolver::new(Some(Arc::new(ProcMaps::new(procfs))));
    assert_eq!(resolver.resolve(process, 0x7000_0010), "");
}

#[test]
fn test_engine_over_proc_tree() {
    let dir = tempfile::tempdir().unwrap();
    write_process(dir.path(), 600, b"com.example.foo\0", MAPS);

    let procfs = ProcFs::at(dir.path());
    let process = procfs.find(Pid(600)).unwrap();
    let host = HostCapabilities::new()
        .with_processes(Arc::new(procfs.clone()))
        .with_address_spaces(Arc::new(ProcMaps::new(procfs)));
    let engine = Engine::new(&EngineSettings::default(), host).unwrap();

    // No user copy facility: the path is reported as missing, the event still counts
    let site = CallSite { process, user_regs: RegisterSnapshot::default() };
    let seen = engine.observer().on_access(&site, 0x7000_0000, 0).unwrap();
    assert_eq!(seen.record(), "[com.example.foo] (PID:600) -> <symbol_missing> [Mode:0]");
    assert!(seen.stack.is_empty());

    // Breakpoints and memory reads need facilities this host lacks
    assert_eq!(engine.execute("bp_set:70001000:exec:4").status, -libc::ENOSYS);
    assert_eq!(engine.execute("mem_read:600:70000000:4").status, -libc::ENOSYS);
    let status = engine.execute("get_status").message;
    assert!(status.ends_with("bp_relocate=one-shot"));
}

#[test]
fn test_live_self_resolution() {
    #[cfg(target_os = "linux")]
    {
        let procfs = ProcFs::default();
        let pid = Pid(i32::try_from(std::process::id()).unwrap());
        let process = procfs.find(pid).expect("own process should be visible");
        let resolver = ModuleResolver::new(Some(Arc::new(ProcMaps::new(procfs))));

        let address = test_live_self_resolution as usize as u64;
        let label = resolver.resolve(process, address);
        assert!(label.contains(" + 0x"), "unexpected label: {label}");
    }
}
