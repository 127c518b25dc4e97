//! Resource accounting: spare CPU, RAM and disk per server.
//!
//! Turns raw server telemetry plus the hosted VM list into "unreserved"
//! figures: physical capacity minus what is already promised to existing
//! instances, adjusted for overprovisioning. CPU is in centi-cores, RAM
//! and disk in MiB, all floored.

use designate_core::{
    ResolvedRatios, Server, Unreserved, Vm, VmState, DEFAULT_RESERVATION_RATIO, GIB, MIB,
};

/// Share of the zpool usable before ZFS performance degrades.
pub const POOL_USABLE_RATIO: f64 = 0.94;

/// Floor charged per HVM instance on top of its volume size. Older HVM
/// instances had quotas applied inconsistently, so their real footprint is
/// underreported without it.
pub const HVM_DISK_FLOOR_BYTES: u64 = 10 * GIB;

/// Compute spare resources for a server given its hosted VMs.
///
/// A server without sysinfo reports zero everywhere.
pub fn unreserved<'a, I>(server: &Server, vms: I, ratios: ResolvedRatios) -> Unreserved
where
    I: IntoIterator<Item = &'a Vm> + Clone,
{
    let Some(sysinfo) = &server.sysinfo else {
        return Unreserved::default();
    };

    Unreserved {
        unreserved_cpu: unreserved_cpu(sysinfo.cpu_total_cores, vms.clone(), ratios.cpu),
        unreserved_ram: unreserved_ram(server, vms.clone(), ratios.ram),
        unreserved_disk: unreserved_disk(server, vms, ratios.disk),
    }
}

/// Centi-cores left after capped VMs, scaled by the CPU ratio.
///
/// Any live VM without a cap could use every core, so its presence leaves
/// nothing unreserved.
pub fn unreserved_cpu<'a, I>(total_cores: u32, vms: I, ratio: f64) -> i64
where
    I: IntoIterator<Item = &'a Vm>,
{
    let mut promised = 0.0;
    for vm in vms.into_iter().filter(|vm| vm.state != VmState::Failed) {
        match vm.cpu_cap {
            Some(cap) => promised += cap as f64 / ratio,
            None => return 0,
        }
    }
    (f64::from(total_cores) * 100.0 - promised).floor() as i64
}

/// MiB of RAM left after the host reservation and live VMs.
///
/// HVM instances own their whole allocation; others are divided by the
/// RAM ratio.
pub fn unreserved_ram<'a, I>(server: &Server, vms: I, ratio: f64) -> i64
where
    I: IntoIterator<Item = &'a Vm>,
{
    let reservation = server.reservation_ratio.unwrap_or(DEFAULT_RESERVATION_RATIO);
    let total_mib = server.memory_total_bytes as f64 / MIB as f64;

    let promised: f64 = vms
        .into_iter()
        .filter(|vm| vm.state != VmState::Failed)
        .map(|vm| ram_footprint(vm.ram, vm.brand.is_hvm(), ratio))
        .sum();

    (total_mib * (1.0 - reservation) - promised).floor() as i64
}

/// MiB of RAM a VM of `ram` MiB is charged for.
pub fn ram_footprint(ram: u64, hvm: bool, ratio: f64) -> f64 {
    if hvm {
        ram as f64
    } else {
        ram as f64 / ratio
    }
}

/// MiB of disk left in the zpool.
///
/// Starts from the usable share of the pool, removes platform usage, the
/// full size of HVM volumes, and zone quotas. Only the unused part of a
/// zone quota is discounted by the disk ratio so heavy overprovisioning
/// cannot promise space that is already written. The result never exceeds
/// the raw free space of the pool.
pub fn unreserved_disk<'a, I>(server: &Server, vms: I, ratio: f64) -> i64
where
    I: IntoIterator<Item = &'a Vm>,
{
    let usable = server.disk_pool_size_bytes as f64 * POOL_USABLE_RATIO;

    let mut hvm_count: u64 = 0;
    let mut hvm_volsize: u64 = 0;
    let mut zone_quota_total: u64 = 0;
    for vm in vms {
        if vm.brand.is_hvm() {
            hvm_count += 1;
            hvm_volsize += vm.quota * GIB;
        } else {
            zone_quota_total += vm.quota * GIB;
        }
    }

    let zone_quota_used = server.disk_zone_quota_used_bytes.min(zone_quota_total);
    let zone_quota_free = zone_quota_total - zone_quota_used;

    let platform_used = (server.disk_system_used_bytes
        + server.disk_installed_images_used_bytes
        + server.disk_cores_quota_used_bytes) as f64;
    let hvm_used = (hvm_volsize + hvm_count * HVM_DISK_FLOOR_BYTES) as f64;
    let zone_used = zone_quota_used as f64 + zone_quota_free as f64 / ratio;

    let promised_free = usable - platform_used - hvm_used - zone_used;
    let raw_free = usable - server.disk_pool_alloc_bytes as f64;

    (promised_free.min(raw_free) / MIB as f64).floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use designate_core::{Brand, Sysinfo};

    fn make_server(cores: u32, ram_mib: u64) -> Server {
        Server {
            uuid: "s1".into(),
            memory_total_bytes: ram_mib * MIB,
            sysinfo: Some(Sysinfo {
                cpu_total_cores: cores,
                ..Sysinfo::default()
            }),
            ..Server::default()
        }
    }

    fn make_vm(brand: Brand, ram: u64, cpu_cap: Option<u64>, quota: u64) -> Vm {
        Vm {
            uuid: format!("vm-{ram}-{quota}"),
            brand,
            ram,
            cpu_cap,
            quota,
            ..Vm::default()
        }
    }

    #[test]
    fn disk_regression_value() {
        let mut server = make_server(8, 1024);
        server.disk_pool_size_bytes = 2048 * GIB;
        server.disk_pool_alloc_bytes = 50 * GIB;
        server.disk_system_used_bytes = 5 * GIB;
        server.disk_installed_images_used_bytes = GIB;
        server.disk_cores_quota_used_bytes = GIB;
        server.disk_zone_quota_used_bytes = 0;

        let vms = vec![
            make_vm(Brand::Kvm, 1024, Some(100), 25),
            make_vm(Brand::Kvm, 1024, Some(100), 5),
        ];
        assert_eq!(unreserved_disk(&server, &vms, 1.0), 1_912_954);
    }

    #[test]
    fn disk_is_clamped_to_raw_free() {
        let mut server = make_server(8, 1024);
        server.disk_pool_size_bytes = 100 * GIB;
        server.disk_pool_alloc_bytes = 90 * GIB;
        // 94 GiB usable, 4 GiB raw free.
        assert_eq!(unreserved_disk(&server, &Vec::<Vm>::new(), 1.0), 4 * 1024);
    }

    #[test]
    fn disk_overprovisions_only_unused_zone_quota() {
        let mut server = make_server(8, 1024);
        server.disk_pool_size_bytes = 1001 * GIB;
        server.disk_zone_quota_used_bytes = 20 * GIB;
        let vms = vec![make_vm(Brand::Joyent, 1024, Some(100), 100)];

        // 940.94 GiB usable - (20 used + 80 free / 2) = 880.94 GiB.
        assert_eq!(unreserved_disk(&server, &vms, 2.0), 902_082);
        // Without overprovisioning the whole quota is promised.
        assert_eq!(unreserved_disk(&server, &vms, 1.0), 861_122);
    }

    #[test]
    fn zone_quota_used_cannot_exceed_total() {
        let mut server = make_server(8, 1024);
        server.disk_pool_size_bytes = 1001 * GIB;
        server.disk_zone_quota_used_bytes = 500 * GIB;
        let vms = vec![make_vm(Brand::Joyent, 1024, Some(100), 10)];
        // Used is capped at the 10 GiB promised.
        assert_eq!(unreserved_disk(&server, &vms, 1.0), 953_282);
    }

    #[test]
    fn cpu_subtracts_scaled_caps() {
        let vms = vec![
            make_vm(Brand::Joyent, 1024, Some(400), 10),
            make_vm(Brand::Joyent, 1024, Some(200), 10),
        ];
        // 16 cores = 1600, minus (400 + 200) / 4.
        assert_eq!(unreserved_cpu(16, &vms, 4.0), 1450);
    }

    #[test]
    fn cpu_uncapped_vm_consumes_everything() {
        let vms = vec![
            make_vm(Brand::Joyent, 1024, Some(100), 10),
            make_vm(Brand::Joyent, 1024, None, 10),
        ];
        assert_eq!(unreserved_cpu(16, &vms, 4.0), 0);
    }

    #[test]
    fn cpu_ignores_failed_vms() {
        let mut failed = make_vm(Brand::Joyent, 1024, None, 10);
        failed.state = VmState::Failed;
        let vms = vec![failed, make_vm(Brand::Joyent, 1024, Some(100), 10)];
        assert_eq!(unreserved_cpu(2, &vms, 1.0), 100);
    }

    #[test]
    fn ram_charges_hvm_in_full() {
        let server = make_server(8, 10_000);
        let vms = vec![
            make_vm(Brand::Kvm, 1000, Some(100), 10),
            make_vm(Brand::Joyent, 1000, Some(100), 10),
        ];
        // 10000 * 0.85 - 1000 - 1000 / 2.
        assert_eq!(unreserved_ram(&server, &vms, 2.0), 7000);
    }

    #[test]
    fn ram_honours_server_reservation() {
        let mut server = make_server(8, 10_000);
        server.reservation_ratio = Some(0.5);
        let mut failed = make_vm(Brand::Joyent, 4000, Some(100), 10);
        failed.state = VmState::Failed;
        assert_eq!(unreserved_ram(&server, &[failed], 1.0), 5000);
    }

    #[test]
    fn missing_sysinfo_yields_zero() {
        let mut server = make_server(8, 10_000);
        server.sysinfo = None;
        server.disk_pool_size_bytes = 1000 * GIB;
        let vms: Vec<Vm> = Vec::new();
        assert_eq!(
            unreserved(&server, &vms, ResolvedRatios::default()),
            Unreserved::default()
        );
    }

    #[test]
    fn accounting_is_idempotent() {
        let mut server = make_server(24, 65_536);
        server.disk_pool_size_bytes = 4096 * GIB;
        server.disk_pool_alloc_bytes = 300 * GIB;
        let vms = vec![
            make_vm(Brand::Bhyve, 4096, Some(200), 40),
            make_vm(Brand::Lx, 2048, Some(100), 20),
        ];
        let first = unreserved(&server, &vms, ResolvedRatios::default());
        let second = unreserved(&server, &vms, ResolvedRatios::default());
        assert_eq!(first, second);
        assert!(first.unreserved_ram > 0);
        assert!(first.unreserved_disk > 0);
        assert_eq!(first.unreserved_cpu, 2400 - 75);
    }
}
