use std::time::Instant;
use std::{fmt, fs, io, num::ParseIntError, str::FromStr};

use clap::ValueEnum;
use enum_map::Enum;
use log::debug;
use thiserror::Error;

pub mod msr;
pub mod perf_event;
pub mod powercap;

const CPUMASK_PATH: &str = "/sys/devices/power/cpumask";

#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RaplDomainType {
    /// entire socket
    Package,
    /// power plane 0: core
    PP0,
    /// power plane 1: uncore
    PP1,
    /// DRAM
    Dram,
    /// psys
    Platform,
}

impl RaplDomainType {
    pub const ALL: [RaplDomainType; 5] = [
        RaplDomainType::Package,
        RaplDomainType::PP0,
        RaplDomainType::PP1,
        RaplDomainType::Dram,
        RaplDomainType::Platform,
    ];
}

impl fmt::Display for RaplDomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = match self {
            RaplDomainType::Package => "package",
            RaplDomainType::PP0 => "pp0",
            RaplDomainType::PP1 => "pp1",
            RaplDomainType::Dram => "dram",
            RaplDomainType::Platform => "platform",
        };
        f.write_str(str)
    }
}

/// Errors raised while acquiring access to the energy counters.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("permission denied while opening energy counters ({0}), run with elevated privileges")]
    PermissionDenied(String),
    #[error("no usable RAPL energy counters on this platform")]
    UnsupportedPlatform,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn open_error(err: io::Error, what: &str) -> ProbeError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied(what.to_owned()),
        io::ErrorKind::NotFound => ProbeError::UnsupportedPlatform,
        _ => ProbeError::Other(anyhow::Error::from(err)),
    }
}

/// Describes one opened energy counter.
///
/// The raw counter is monotonically increasing and wraps back to zero after
/// `wrap_at`. The wrap value and the unit scale depend on the underlying
/// interface, so each source reports them per counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterMeta {
    pub socket: u32,
    pub domain: RaplDomainType,
    /// Highest value the raw counter reaches before wrapping to zero.
    pub wrap_at: u64,
    /// Joules per counter increment.
    ///
    /// The energy can be a floating-point number in Joules without any loss
    /// of precision, because the RAPL unit is always a power of two and
    /// multiplying by it only changes the exponent part. A f32 only holds
    /// integers up to about 2^24, which is not enough for the counter
    /// values, hence f64.
    pub joules_per_unit: f64,
}

/// A point-in-time reading of all the counters of a source.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub timestamp: Instant,
    /// Raw counter values, in the order of [`CounterSource::counters`].
    pub raw: Vec<u64>,
}

/// Reads raw values from hardware energy counters.
///
/// A source owns the handles it opened (files, perf event fds) and releases
/// them when dropped. Reading is repeatable and has no side effect besides
/// the read itself.
pub trait CounterSource: Send {
    /// The opened counters. The list and its order are fixed for the
    /// lifetime of the source.
    fn counters(&self) -> &[CounterMeta];

    /// Reads the current raw value of every counter.
    fn snapshot(&mut self) -> anyhow::Result<Snapshot>;
}

/// The available ways to read the RAPL counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeKind {
    PerfEvent,
    Powercap,
    Msr,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = match self {
            ProbeKind::PerfEvent => "perf-event",
            ProbeKind::Powercap => "powercap",
            ProbeKind::Msr => "msr",
        };
        f.write_str(str)
    }
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "perf" | "perf-event" => Ok(ProbeKind::PerfEvent),
            "powercap" | "powercap-sysfs" => Ok(ProbeKind::Powercap),
            "msr" => Ok(ProbeKind::Msr),
            _ => Err(s.to_owned()),
        }
    }
}

/// Opens a counter source of the given kind, restricted to the given domains.
///
/// Discovery and filtering happen here; the concrete constructors only open
/// what they are handed.
pub fn open_source(
    kind: ProbeKind,
    domains: &[RaplDomainType],
) -> Result<Box<dyn CounterSource>, ProbeError> {
    match kind {
        ProbeKind::PerfEvent => {
            let socket_cpus = cpus_to_monitor()?;
            let events = perf_event::all_power_events()?;
            let filtered: Vec<&perf_event::PowerEvent> =
                events.iter().filter(|e| domains.contains(&e.domain)).collect();
            let source = perf_event::PerfEventSource::new(&socket_cpus, &filtered)?;
            Ok(Box::new(source))
        }
        ProbeKind::Powercap => {
            let zones = powercap::all_power_zones()?;
            let filtered: Vec<&powercap::PowerZone> =
                zones.flat.iter().filter(|z| domains.contains(&z.domain)).collect();
            let source = powercap::PowercapSource::<true>::new(&filtered)?;
            Ok(Box::new(source))
        }
        ProbeKind::Msr => {
            let socket_cpus = cpus_to_monitor()?;
            let vendor = msr::cpu_vendor()?;
            let supported = msr::all_domains(vendor);
            let filtered: Vec<RaplDomainType> = domains
                .iter()
                .copied()
                .filter(|d| supported.contains(d))
                .collect();
            let source = msr::MsrSource::new(&socket_cpus, &filtered)?;
            Ok(Box::new(source))
        }
    }
}

/// Opens the first counter source that works on this machine.
///
/// perf-event is preferred (no raw register access), then powercap, then MSR.
pub fn open_default_source(
    domains: &[RaplDomainType],
) -> Result<Box<dyn CounterSource>, ProbeError> {
    let mut denied = None;
    for kind in [ProbeKind::PerfEvent, ProbeKind::Powercap, ProbeKind::Msr] {
        match open_source(kind, domains) {
            Ok(source) => {
                debug!("opened {kind} energy counters");
                return Ok(source);
            }
            Err(e) => {
                debug!("{kind} counters unavailable: {e}");
                if matches!(e, ProbeError::PermissionDenied(_)) {
                    denied = Some(e);
                }
            }
        }
    }
    Err(denied.unwrap_or(ProbeError::UnsupportedPlatform))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuId {
    pub cpu: u32,
    pub socket: u32,
}

/// Retrieves the CPUs to monitor (one per socket) in order
/// to get RAPL counters.
pub fn cpus_to_monitor() -> Result<Vec<CpuId>, ProbeError> {
    let mask = fs::read_to_string(CPUMASK_PATH).map_err(|e| open_error(e, CPUMASK_PATH))?;
    let cpus_and_sockets = parse_cpu_and_socket_list(&mask)?;
    Ok(cpus_and_sockets)
}

pub(crate) fn check_socket_cpus(socket_cpus: &[CpuId]) -> Result<(), ProbeError> {
    if socket_cpus.is_empty() {
        return Err(ProbeError::UnsupportedPlatform);
    }
    Ok(())
}

fn parse_cpu_and_socket_list(cpulist: &str) -> anyhow::Result<Vec<CpuId>> {
    let cpus = parse_cpu_list(cpulist);

    // here we assume that /sys/devices/power/cpumask returns one cpu per socket
    let cpus_and_sockets = cpus?
        .into_iter()
        .enumerate()
        .map(|(i, cpu)| CpuId { cpu, socket: i as u32 })
        .collect();

    Ok(cpus_and_sockets)
}

fn parse_cpu_list(cpulist: &str) -> anyhow::Result<Vec<u32>> {
    // handles "n" or "start-end"
    fn parse_cpulist_item(item: &str) -> anyhow::Result<Vec<u32>> {
        let bounds: Vec<u32> = item
            .split('-')
            .map(str::parse)
            .collect::<Result<Vec<u32>, ParseIntError>>()?;

        match bounds.as_slice() {
            &[start, end] => Ok((start..=end).collect()),
            &[n] => Ok(vec![n]),
            _ => Err(anyhow::anyhow!("invalid cpulist: {}", item)),
        }
    }

    // this can be "0,64" or "0-1" or maybe "0-1,64-66"
    let cpus: Vec<u32> = cpulist
        .trim_end()
        .split(',')
        .map(parse_cpulist_item)
        .collect::<anyhow::Result<Vec<Vec<u32>>>>()?
        .into_iter()
        .flatten()
        .collect();

    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use crate::parse_cpu_and_socket_list;
    use crate::CpuId;

    #[test]
    fn test_parse_cpumask() -> anyhow::Result<()> {
        let single = "0";
        assert_eq!(parse_cpu_and_socket_list(single)?, vec![CpuId { cpu: 0, socket: 0 }]);

        let comma = "0,64";
        assert_eq!(
            parse_cpu_and_socket_list(comma)?,
            vec![CpuId { cpu: 0, socket: 0 }, CpuId { cpu: 64, socket: 1 }]
        );

        let caret = "0-1";
        assert_eq!(
            parse_cpu_and_socket_list(caret)?,
            vec![CpuId { cpu: 0, socket: 0 }, CpuId { cpu: 1, socket: 1 }]
        );

        let combined = "1-3,5-6";
        assert_eq!(
            parse_cpu_and_socket_list(combined)?,
            vec![
                CpuId { cpu: 1, socket: 0 },
                CpuId { cpu: 2, socket: 1 },
                CpuId { cpu: 3, socket: 2 },
                CpuId { cpu: 5, socket: 3 },
                CpuId { cpu: 6, socket: 4 },
            ]
        );

        Ok(())
    }

    #[test]
    fn test_parse_probe_kind() {
        use crate::ProbeKind;
        assert_eq!("perf".parse::<ProbeKind>(), Ok(ProbeKind::PerfEvent));
        assert_eq!("perf-event".parse::<ProbeKind>(), Ok(ProbeKind::PerfEvent));
        assert_eq!("powercap".parse::<ProbeKind>(), Ok(ProbeKind::Powercap));
        assert_eq!("msr".parse::<ProbeKind>(), Ok(ProbeKind::Msr));
        assert!("ebpf".parse::<ProbeKind>().is_err());
    }
}
