// According to Intel 64 and IA-32 architectures software developer's manual, volume 3B,
// MSR_PKG_ENERGY_STATUS reports the measured energy usage of the package.

use std::{
    fs::File,
    io,
    os::unix::prelude::FileExt,
    process::{Command, Stdio},
    time::Instant,
};

use anyhow::{anyhow, Context};
use regex::Regex;

use super::{open_error, check_socket_cpus, CounterMeta, CounterSource, CpuId, ProbeError, RaplDomainType, Snapshot};

type Addr = u64;

/// MSR registers' addresses for Intel RAPL domains
mod intel {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0x00000606;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0x00000611;
    pub const MSR_PP0_ENERGY_STATUS: Addr = 0x00000639;
    pub const MSR_PP1_ENERGY_STATUS: Addr = 0x00000641;
    pub const MSR_DRAM_ENERGY_STATUS: Addr = 0x00000619;
    pub const MSR_PLATFORM_ENERGY_STATUS: Addr = 0x0000064D;
}

/// MSR registers' addresses for AMD RAPL domains
mod amd {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0xc0010299;
    pub const MSR_CORE_ENERGY_STATUS: Addr = 0xc001029a;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0xc001029b;
}

/// Mask to apply when reading the energy values
const MSR_ENERGY_MASK: u64 = 0xffffffff;

/// Maximum value of the MSR counter.
/// Note that this technically depends on the exact hardware, but for our purposes it's good enough.
const MSR_MAX_ENERGY: u64 = u32::MAX as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaplVendor {
    Intel,
    Amd,
}

/// Counter source reading the RAPL MSR values directly,
/// via /dev/cpu/<cpu_id>/msr for one CPU per socket.
pub struct MsrSource {
    /// MSR file descriptor and register addresses for each socket cpu.
    msr_per_cpu: Vec<RaplMsrAccess>,
    metas: Vec<CounterMeta>,
}

struct RaplMsrAccess {
    /// File descriptor to the MSR sysfs for one cpu
    fd: File,
    /// The MSR RAPL registers to read on this cpu, one per domain.
    addrs: Vec<Addr>,
}

impl MsrSource {
    pub fn new(socket_cpus: &[CpuId], domains: &[RaplDomainType]) -> Result<MsrSource, ProbeError> {
        check_socket_cpus(socket_cpus)?;
        if domains.is_empty() {
            return Err(ProbeError::UnsupportedPlatform);
        }

        let vendor = cpu_vendor()?;
        let addrs = domains
            .iter()
            .map(|d| {
                domain_msr_address(*d, vendor)
                    .with_context(|| format!("RAPL domain {d} has no MSR for this vendor"))
                    .map_err(ProbeError::Other)
            })
            .collect::<Result<Vec<Addr>, ProbeError>>()?;

        let mut msr_per_cpu = Vec::with_capacity(socket_cpus.len());
        let mut metas = Vec::with_capacity(socket_cpus.len() * domains.len());

        for CpuId { cpu, socket } in socket_cpus {
            let path = format!("/dev/cpu/{cpu}/msr");
            let fd = File::open(&path).map_err(|e| open_error(e, &path))?;
            let energy_unit = read_energy_unit(&fd, vendor)
                .map_err(|e| open_error(e, "MSR_RAPL_POWER_UNIT"))? as f64;

            for domain in domains {
                metas.push(CounterMeta {
                    socket: *socket,
                    domain: *domain,
                    wrap_at: MSR_MAX_ENERGY,
                    joules_per_unit: energy_unit,
                });
            }
            msr_per_cpu.push(RaplMsrAccess {
                fd,
                addrs: addrs.clone(),
            });
        }

        Ok(MsrSource { msr_per_cpu, metas })
    }
}

impl CounterSource for MsrSource {
    fn counters(&self) -> &[CounterMeta] {
        &self.metas
    }

    fn snapshot(&mut self) -> anyhow::Result<Snapshot> {
        let timestamp = Instant::now();
        let mut raw = Vec::with_capacity(self.metas.len());
        for msr in &self.msr_per_cpu {
            for addr in &msr.addrs {
                let msr_value = read_msr(&msr.fd, *addr)
                    .with_context(|| format!("failed to read MSR at {addr:#x}"))?;
                raw.push(msr_value & MSR_ENERGY_MASK);
            }
        }
        Ok(Snapshot { timestamp, raw })
    }
}

fn read_msr(msr: &File, at: Addr) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    msr.read_exact_at(&mut buf, at)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Extract the energy unit from the Model Specific Register `msr`.
///
/// # Wrong values
///
/// Note that the returned energy unit may not apply for all measurements,
/// because some architectures use a different unit for some domains (e.g. DRAM).
/// This is platform-dependent, and I do not wish to implement all of them here.
///
/// See [Linux source code - rapl.c](https://github.com/torvalds/linux/blob/0036fb00a756a2f6e360d44e2e3d2200a8afbc9b/arch/x86/events/rapl.c#L612)
///
fn read_energy_unit(msr: &File, vendor: RaplVendor) -> io::Result<f32> {
    let offset = match vendor {
        RaplVendor::Intel => intel::MSR_RAPL_POWER_UNIT,
        RaplVendor::Amd => amd::MSR_RAPL_POWER_UNIT,
    };
    let msr_value = read_msr(msr, offset)?;

    Ok(energy_unit_from_msr(msr_value))
}

/// Decodes the "energy status unit" field of MSR_RAPL_POWER_UNIT,
/// at bits 12:8 (mask 0x1F00) according to the Intel Software Developer manual.
fn energy_unit_from_msr(msr_value: u64) -> f32 {
    let esu = (msr_value & 0x1F00) >> 8;

    // The energy unit, aka "multiplier", is 1/(2^esu) = (1/2)^esu
    // This means that when we read an energy value from MSR, the actual value is
    // `msr_value * multiplier` Joules.
    0.5_f32.powi(esu as i32)
}

pub fn cpu_vendor() -> anyhow::Result<RaplVendor> {
    // run: LC_ALL=C lscpu
    let child = Command::new("lscpu")
        .env("LC_ALL", "C")
        .stdout(Stdio::piped())
        .spawn()
        .context("lscpu should be executable")?;
    let finished = child.wait_with_output()?;
    let stdout = std::str::from_utf8(&finished.stdout)?;

    // find the Vendor ID
    let vendor_regex = Regex::new(r"Vendor ID:\s+(\w+)")?;
    let group = vendor_regex
        .captures(stdout)
        .context("vendor id not found in lscpu output")?
        .get(1)
        .unwrap();
    let vendor = group.as_str().trim();

    // turn it into the right enum variant
    match vendor {
        "AuthenticAMD" => Ok(RaplVendor::Amd),
        "GenuineIntel" => Ok(RaplVendor::Intel),
        _ => Err(anyhow!("Unsupported CPU vendor {vendor}")),
    }
}

pub fn domain_msr_address(domain: RaplDomainType, vendor: RaplVendor) -> Option<Addr> {
    match vendor {
        RaplVendor::Intel => match domain {
            RaplDomainType::Package => Some(intel::MSR_PKG_ENERGY_STATUS),
            RaplDomainType::PP0 => Some(intel::MSR_PP0_ENERGY_STATUS),
            RaplDomainType::PP1 => Some(intel::MSR_PP1_ENERGY_STATUS),
            RaplDomainType::Dram => Some(intel::MSR_DRAM_ENERGY_STATUS),
            RaplDomainType::Platform => Some(intel::MSR_PLATFORM_ENERGY_STATUS),
        },
        RaplVendor::Amd => match domain {
            RaplDomainType::Package => Some(amd::MSR_PKG_ENERGY_STATUS),
            RaplDomainType::PP0 => Some(amd::MSR_CORE_ENERGY_STATUS),
            RaplDomainType::PP1 => None,
            RaplDomainType::Dram => None,
            RaplDomainType::Platform => None,
        },
    }
}

pub fn all_domains(vendor: RaplVendor) -> Vec<RaplDomainType> {
    match vendor {
        RaplVendor::Intel => vec![
            RaplDomainType::Package,
            RaplDomainType::PP0,
            RaplDomainType::PP1,
            RaplDomainType::Dram,
            RaplDomainType::Platform,
        ],
        RaplVendor::Amd => vec![RaplDomainType::Package, RaplDomainType::PP0],
    }
}

#[cfg(test)]
mod tests {
    use super::{all_domains, domain_msr_address, energy_unit_from_msr, RaplVendor};

    #[test]
    fn test_energy_unit_decoding() {
        // esu = 16 -> unit = 2^-16 (the common Intel value)
        assert_eq!(energy_unit_from_msr(16 << 8), 0.5_f32.powi(16));
        // esu = 0 -> unit = 1 Joule per count
        assert_eq!(energy_unit_from_msr(0), 1.0);
        // bits outside 12:8 are ignored
        assert_eq!(energy_unit_from_msr(0xF000_0000 | (5 << 8)), 0.5_f32.powi(5));
    }

    #[test]
    fn test_vendor_domains_have_addresses() {
        for vendor in [RaplVendor::Intel, RaplVendor::Amd] {
            for domain in all_domains(vendor) {
                assert!(domain_msr_address(domain, vendor).is_some());
            }
        }
    }
}
