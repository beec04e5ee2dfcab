use podsim_core::Config;
use sysinfo::System;
use tracing::info;

/// Concurrent simulations this host can carry:
/// `max(1, min((ram - reserve) / ram_per_sim, (cpus - 2) / cpus_per_sim, cap))`,
/// further capped by an operator override when one is set.
pub fn compute_capacity(config: &Config, max_concurrent_override: Option<u32>) -> u32 {
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu_all();
    let total_ram_mb = system.total_memory() / (1024 * 1024);
    let cpus = system.cpus().len() as u64;
    let capacity = capacity_for(
        config,
        total_ram_mb,
        cpus,
        max_concurrent_override,
    );
    info!(
        total_ram_mb,
        cpus,
        capacity,
        override_cap = ?max_concurrent_override,
        "computed worker capacity"
    );
    capacity
}

fn capacity_for(
    config: &Config,
    total_ram_mb: u64,
    cpus: u64,
    max_concurrent_override: Option<u32>,
) -> u32 {
    let by_ram = total_ram_mb
        .saturating_sub(config.system_reserve_mb)
        .checked_div(config.ram_per_sim_mb)
        .unwrap_or(0);
    let by_cpu = cpus
        .saturating_sub(2)
        .checked_div(u64::from(config.cpus_per_sim))
        .unwrap_or(0);
    let bounded = by_ram
        .min(by_cpu)
        .min(u64::from(config.max_concurrent_sims));
    // Even tiny hosts run one sim at a time.
    let capacity = if bounded == 0 { 1 } else { bounded as u32 };
    match max_concurrent_override {
        // A zero override is treated as the smallest usable limit.
        Some(0) => 1,
        Some(limit) => capacity.min(limit),
        None => capacity,
    }
}
