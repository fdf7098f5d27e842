use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use enum_map::EnumMap;
use log::{info, warn};

use cli::{Cli, Commands, SourceArg, WorkloadArg};
use energy_probes::perf_event::PowerEvent;
use energy_probes::powercap::PowerZoneHierarchy;
use energy_probes::{perf_event, powercap, CounterSource, ProbeKind, RaplDomainType};
use rapl_interface::{LoopController, ReportSink, Sampler, SyntheticSource};

mod cli;

fn main() -> Result<(), anyhow::Error> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();

    match cli.command {
        Commands::Info => show_info(),
        Commands::Measure {
            probe,
            domains,
            iterations,
            workload,
            size,
            output,
        } => {
            let domains = domains.unwrap_or_else(|| RaplDomainType::ALL.to_vec());
            measure(probe, &domains, iterations, workload, size, output)
        }
    }
}

fn show_info() -> Result<(), anyhow::Error> {
    let socket_cpus = energy_probes::cpus_to_monitor()?;
    let n_sockets = socket_cpus.len();
    info!("{n_sockets} monitorable CPU (cores) found: {socket_cpus:?}");

    let perf_events = perf_event::all_power_events()?;
    let power_zones = powercap::all_power_zones()?;

    println!("\nFound RAPL perf events:");
    for evt in &perf_events {
        println!("- {evt:?}");
    }

    println!("\nFound powercap zones:");
    for zone in &power_zones.top {
        println!("{zone}");
    }

    let available_domains = check_domains_consistency(&perf_events, &power_zones);
    println!("\nAll available RAPL domains: {}", mkstring(&available_domains, ", "));
    Ok(())
}

fn measure(
    probe: SourceArg,
    domains: &[RaplDomainType],
    iterations: u64,
    workload: WorkloadArg,
    size: u64,
    output: Option<PathBuf>,
) -> Result<(), anyhow::Error> {
    let source: Box<dyn CounterSource> = match probe {
        SourceArg::Auto => energy_probes::open_default_source(domains)?,
        SourceArg::PerfEvent => energy_probes::open_source(ProbeKind::PerfEvent, domains)?,
        SourceArg::Powercap => energy_probes::open_source(ProbeKind::Powercap, domains)?,
        SourceArg::Msr => energy_probes::open_source(ProbeKind::Msr, domains)?,
        SourceArg::Synthetic => Box::new(SyntheticSource::new(1, 50_000, u32::MAX as u64, 0.001)),
    };

    let mut sampler = Sampler::new(source);
    let mut sink = match &output {
        Some(path) => ReportSink::with_csv(path, sampler.counters())
            .with_context(|| format!("cannot write to {}", path.display()))?,
        None => ReportSink::in_memory(),
    };
    let mut control = LoopController::new(iterations);

    while control.should_continue() {
        sampler.start()?;
        run_workload(workload, size);
        let reading = sampler.stop()?;
        info!(
            "iteration done: {} ms, {:.6} J",
            reading.duration.as_millis(),
            reading.total_joules
        );
        sink.record(reading);
    }

    print_summary(&sink.drain());
    Ok(())
}

fn run_workload(workload: WorkloadArg, size: u64) {
    match workload {
        WorkloadArg::Sleep => std::thread::sleep(Duration::from_millis(size)),
        WorkloadArg::Spin => {
            // printing the result keeps the loop observable
            println!("{}", harmonic_steps(size as f64));
        }
    }
}

/// Counts the harmonic-series terms needed to exceed `target`.
fn harmonic_steps(target: f64) -> u64 {
    let mut sum = 0.0;
    let mut n = 0u64;
    while sum < target {
        n += 1;
        sum += 1.0 / n as f64;
    }
    n
}

fn print_summary(readings: &[rapl_interface::EnergyReading]) {
    let mut per_domain: EnumMap<RaplDomainType, f64> = EnumMap::default();
    let mut total = 0.0;
    let mut total_duration = Duration::ZERO;
    for reading in readings {
        total += reading.total_joules;
        total_duration += reading.duration;
        for d in &reading.domains {
            per_domain[d.domain] += d.joules;
        }
    }

    println!(
        "\n{} iterations in {} ms, {:.6} J total",
        readings.len(),
        total_duration.as_millis(),
        total
    );
    for (domain, joules) in &per_domain {
        if *joules > 0.0 {
            println!("  {domain}: {joules:.6} J");
        }
    }
}

fn check_domains_consistency(perf_events: &[PowerEvent], power_zones: &PowerZoneHierarchy) -> Vec<RaplDomainType> {
    // get all the domains available via perf-events
    let mut perf_rapl_domains: Vec<RaplDomainType> = perf_events.iter().map(|e| e.domain).collect();
    perf_rapl_domains.sort_by_key(|k| k.to_string());
    perf_rapl_domains.dedup_by_key(|k| k.to_string());

    // get all the domains available via Powercap
    let mut powercap_rapl_domains: Vec<RaplDomainType> = power_zones.flat.iter().map(|z| z.domain).collect();
    powercap_rapl_domains.sort_by_key(|k| k.to_string());
    powercap_rapl_domains.dedup_by_key(|k| k.to_string());

    if perf_rapl_domains != powercap_rapl_domains {
        warn!("Powercap and perf-event don't report the same RAPL domains. This may be due to a bug in powercap or in perf-event.");
        warn!("Upgrading to a newer kernel could fix the problem.");
        warn!("Perf-event: {}", mkstring(&perf_rapl_domains, ", "));
        warn!("Powercap:   {}", mkstring(&powercap_rapl_domains, ", "));
    } else {
        info!("Available RAPL domains: {}", mkstring(&perf_rapl_domains, ", "));
    }

    if perf_rapl_domains.len() >= powercap_rapl_domains.len() {
        perf_rapl_domains
    } else {
        powercap_rapl_domains
    }
}

/// Takes a slice of elements that can be converted to strings, converts them and joins them all.
fn mkstring<A: ToString>(elems: &[A], sep: &str) -> String {
    elems.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(sep)
}

#[cfg(test)]
mod tests {
    use super::harmonic_steps;

    #[test]
    fn test_harmonic_steps() {
        assert_eq!(harmonic_steps(1.0), 1);
        assert_eq!(harmonic_steps(1.5), 2);
        assert_eq!(harmonic_steps(2.0), 4);
        assert!(harmonic_steps(10.0) > 1000);
    }
}
