//! `vmpulse scan`: one-shot discovery of live VMs.

use std::time::Duration;

use vmpulse_core::{Hypervisor, QemuProcfsHypervisor};

pub fn run(json: bool) {
    let mut hypervisor = QemuProcfsHypervisor::new(Duration::from_secs(300));
    if let Err(e) = hypervisor.connect() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    let vms = match hypervisor.list_live_vms() {
        Ok(vms) => vms,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    hypervisor.close();

    if json {
        match serde_json::to_string_pretty(&vms) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    if vms.is_empty() {
        println!("No running VMs found");
        return;
    }
    println!(
        "{:<8} {:<20} {:<38} {:>5} {:>12}",
        "VMID", "NAME", "UUID", "VCPU", "MEM (KiB)"
    );
    for vm in &vms {
        println!(
            "{:<8} {:<20} {:<38} {:>5} {:>12}",
            vm.id, vm.name, vm.uuid, vm.vcpu_count, vm.memory_max_kb
        );
    }
    println!();
    println!("{} VM(s)", vms.len());
}
