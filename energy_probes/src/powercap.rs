// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::{
    fmt::Display,
    fs::{self, File},
    io::{Read, Seek},
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::Context;

use super::{open_error, CounterMeta, CounterSource, ProbeError, RaplDomainType, Snapshot};

const POWERCAP_RAPL_PATH: &str = "/sys/devices/virtual/powercap/intel-rapl";
const POWER_ZONE_PREFIX: &str = "intel-rapl";
const POWERCAP_ENERGY_UNIT: f64 = 0.000_001; // 1 microJoule

/// Hierarchy of power zones
pub struct PowerZoneHierarchy {
    /// All the zones in the same Vec.
    pub flat: Vec<PowerZone>,
    /// The top zones. To access their children, use [PowerZone::children].
    pub top: Vec<PowerZone>,
}

/// A power zone.
#[derive(Debug, Clone)]
pub struct PowerZone {
    /// The name of the zone, as returned by powercap, for instance
    /// `package-0` or `core`.
    pub name: String,

    /// The RAPL domain type, as an enum
    pub domain: RaplDomainType,

    /// The path of the zone in sysfs, for instance
    /// `/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0`.
    ///
    /// In the above path, `intel-rapl` is the "control type" and
    /// `intel-rapl:0` is the power zone itself.
    pub path: PathBuf,

    /// The sub-zones (can be empty).
    pub children: Vec<PowerZone>,

    /// The id of the socket that "contains" this zone, if applicable
    /// (psys has no socket).
    pub socket_id: Option<u32>,
}

impl PowerZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join("energy_uj")
    }

    pub fn max_energy_path(&self) -> PathBuf {
        self.path.join("max_energy_range_uj")
    }

    fn fmt_rec(&self, f: &mut std::fmt::Formatter<'_>, level: i8) -> std::fmt::Result {
        let mut indent = "  ".repeat(level as _);
        if level > 0 {
            indent.insert(0, '\n');
        }

        let powercap_name = &self.name;
        let domain = self.domain;
        let path = self.path.to_string_lossy();

        write!(f, "{indent}- {powercap_name} ({domain:?}) \t\t: {path}")?;
        for subzone in &self.children {
            subzone.fmt_rec(f, level + 1)?;
        }
        Ok(())
    }
}

impl Display for PowerZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_rec(f, 0)
    }
}

/// Discovers all the RAPL power zones in the powercap sysfs.
pub fn all_power_zones() -> anyhow::Result<PowerZoneHierarchy> {
    /// Recursively explore a power zone
    fn explore_rec(dir: &Path, parent_socket: Option<u32>, flat: &mut Vec<PowerZone>) -> anyhow::Result<Vec<PowerZone>> {
        let mut zones = Vec::new();
        for e in fs::read_dir(dir)? {
            let entry = e?;
            let path = entry.path();
            let file_name = path.file_name().unwrap().to_string_lossy();

            if path.is_dir() && file_name.starts_with(POWER_ZONE_PREFIX) {
                let name_path = path.join("name");
                let name = fs::read_to_string(&name_path)?.trim().to_owned();
                let socket_id = {
                    if let Some(parent_id) = parent_socket {
                        Some(parent_id)
                    } else if let Some(id_str) = name.strip_prefix("package-") {
                        let id: u32 = id_str
                            .parse()
                            .with_context(|| format!("Failed to extract package id from '{name}'"))?;
                        Some(id)
                    } else {
                        None
                    }
                };
                let domain = parse_zone_name(&name).with_context(|| format!("Unknown RAPL powercap zone {name}"))?;
                let children = explore_rec(&path, socket_id, flat)?; // recursively explore
                let zone = PowerZone {
                    name,
                    domain,
                    path,
                    children,
                    socket_id,
                };
                zones.push(zone.clone());
                flat.push(zone);
            }
        }
        zones.sort_by_key(|z| z.path.to_string_lossy().to_string());
        Ok(zones)
    }
    let mut flat = Vec::new();
    let top = explore_rec(Path::new(POWERCAP_RAPL_PATH), None, &mut flat)?;
    Ok(PowerZoneHierarchy { flat, top })
}

fn parse_zone_name(name: &str) -> Option<RaplDomainType> {
    match name {
        "psys" => Some(RaplDomainType::Platform),
        "core" => Some(RaplDomainType::PP0),
        "uncore" => Some(RaplDomainType::PP1),
        "dram" => Some(RaplDomainType::Dram),
        _ if name.starts_with("package-") => Some(RaplDomainType::Package),
        _ => None,
    }
}

/// Counter source backed by the powercap sysfs.
///
/// Each zone is kept open as a `File` on its `energy_uj` attribute; reading
/// a snapshot rewinds and re-reads every file. The counter wraps at the
/// value reported by `max_energy_range_uj`, and counts microjoules.
///
/// The file contents are plain ASCII digits. With `CHECK_UTF8 = false` the
/// UTF-8 validation is skipped when parsing them.
pub struct PowercapSource<const CHECK_UTF8: bool> {
    files: Vec<File>,
    metas: Vec<CounterMeta>,
}

impl<const CHECK_UTF8: bool> PowercapSource<CHECK_UTF8> {
    pub fn new(zones: &[&PowerZone]) -> Result<PowercapSource<CHECK_UTF8>, ProbeError> {
        if zones.is_empty() {
            return Err(ProbeError::UnsupportedPlatform);
        }

        let mut files = Vec::with_capacity(zones.len());
        let mut metas = Vec::with_capacity(zones.len());

        for zone in zones {
            let energy_path = zone.energy_path();
            let file = File::open(&energy_path)
                .map_err(|e| open_error(e, &energy_path.to_string_lossy()))?;

            let max_energy_path = zone.max_energy_path();
            let str_max_energy_uj = fs::read_to_string(&max_energy_path)
                .with_context(|| format!("read {}", max_energy_path.to_string_lossy()))?;

            let max_energy_uj = str_max_energy_uj
                .trim_end()
                .parse()
                .with_context(|| format!("parse max_energy_range_uj: '{str_max_energy_uj}'"))?;

            files.push(file);
            metas.push(CounterMeta {
                socket: zone.socket_id.unwrap_or(0), // put psys in socket 0
                domain: zone.domain,
                wrap_at: max_energy_uj,
                joules_per_unit: POWERCAP_ENERGY_UNIT,
            });
        }

        Ok(PowercapSource { files, metas })
    }
}

impl<const CHECK_UTF8: bool> CounterSource for PowercapSource<CHECK_UTF8> {
    fn counters(&self) -> &[CounterMeta] {
        &self.metas
    }

    fn snapshot(&mut self) -> anyhow::Result<Snapshot> {
        let timestamp = Instant::now();
        let mut raw = Vec::with_capacity(self.files.len());

        // reuse the same buffer for all the zones
        // the content of `energy_uj` never exceeds that of `max_energy_range_uj`,
        // which is 16 bytes on all our test machines
        let mut buf = Vec::with_capacity(16);

        for file in &mut self.files {
            // read the file from the beginning
            file.rewind()?;
            file.read_to_end(&mut buf)?;

            let content = if CHECK_UTF8 {
                std::str::from_utf8(&buf)?
            } else {
                unsafe { std::str::from_utf8_unchecked(&buf) }
            };
            let counter_value: u64 = content
                .trim_end()
                .parse()
                .with_context(|| format!("failed to parse {file:?}: '{content}'"))?;

            raw.push(counter_value);
            buf.clear();
        }

        Ok(Snapshot { timestamp, raw })
    }
}

#[cfg(test)]
mod tests {
    use super::{all_power_zones, parse_zone_name};
    use crate::RaplDomainType;

    #[test]
    fn test_parse_zone_name() {
        assert_eq!(parse_zone_name("package-0"), Some(RaplDomainType::Package));
        assert_eq!(parse_zone_name("package-13"), Some(RaplDomainType::Package));
        assert_eq!(parse_zone_name("core"), Some(RaplDomainType::PP0));
        assert_eq!(parse_zone_name("uncore"), Some(RaplDomainType::PP1));
        assert_eq!(parse_zone_name("dram"), Some(RaplDomainType::Dram));
        assert_eq!(parse_zone_name("psys"), Some(RaplDomainType::Platform));
        assert_eq!(parse_zone_name("mmio"), None);
    }

    #[test]
    #[ignore = "requires RAPL powercap access"]
    fn test_powercap() {
        let zones = all_power_zones().expect("failed to get powercap power zones");
        println!("---- Hierarchy ----");
        for z in zones.top {
            println!("{z}");
        }
        println!("---- Flat list ----");
        for z in zones.flat {
            println!("{z}")
        }
    }
}
