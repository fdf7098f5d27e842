use std::time::Duration;

use energy_probes::{CounterMeta, CounterSource, RaplDomainType, Snapshot};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("a measurement session is already active")]
    AlreadyActive,
    #[error("no measurement session is active")]
    NoActiveSession,
    #[error(transparent)]
    Probe(#[from] anyhow::Error),
}

/// Energy consumed by one counter during a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainEnergy {
    pub socket: u32,
    pub domain: RaplDomainType,
    pub joules: f64,
    /// `true` if the raw counter wrapped during the session. At most one
    /// wrap can be corrected; sessions longer than one full counter period
    /// under-report.
    pub overflowed: bool,
}

/// The result of one start/stop session.
#[derive(Debug, Clone)]
pub struct EnergyReading {
    pub duration: Duration,
    pub domains: Vec<DomainEnergy>,
    /// Sum of the `Package` counters when any were opened, otherwise the
    /// sum of everything. Summing sub-domains together with their package
    /// would double-count.
    pub total_joules: f64,
}

/// Turns two counter snapshots into an energy delta.
///
/// At most one session is active per sampler. The underlying RAPL counters
/// are package-global, so a process should hold a single sampler and call
/// `start`/`stop` from one orchestrating thread, bracketing the whole
/// workload (including its worker threads, if any).
pub struct Sampler {
    source: Box<dyn CounterSource>,
    baseline: Option<Snapshot>,
}

impl Sampler {
    pub fn new(source: Box<dyn CounterSource>) -> Sampler {
        Sampler {
            source,
            baseline: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.baseline.is_some()
    }

    /// The counters the underlying source has opened.
    pub fn counters(&self) -> &[CounterMeta] {
        self.source.counters()
    }

    /// Begins a session by recording a baseline snapshot.
    ///
    /// Fails with [`SamplerError::AlreadyActive`] if a session is running;
    /// the existing baseline is left untouched in that case.
    pub fn start(&mut self) -> Result<(), SamplerError> {
        if self.baseline.is_some() {
            return Err(SamplerError::AlreadyActive);
        }
        self.baseline = Some(self.source.snapshot()?);
        Ok(())
    }

    /// Ends the session and returns what was consumed since `start`.
    ///
    /// The session is consumed even if reading the counters fails.
    pub fn stop(&mut self) -> Result<EnergyReading, SamplerError> {
        let baseline = self.baseline.take().ok_or(SamplerError::NoActiveSession)?;
        let current = self.source.snapshot()?;

        let metas = self.source.counters();
        let mut domains = Vec::with_capacity(metas.len());
        for (i, meta) in metas.iter().enumerate() {
            let base = baseline.raw[i];
            let cur = current.raw[i];
            let overflowed = cur < base;
            // the counter wrapped at most once between the two snapshots
            let raw_delta = if overflowed {
                meta.wrap_at - base + cur
            } else {
                cur - base
            };
            domains.push(DomainEnergy {
                socket: meta.socket,
                domain: meta.domain,
                joules: raw_delta as f64 * meta.joules_per_unit,
                overflowed,
            });
        }

        let duration = current.timestamp.saturating_duration_since(baseline.timestamp);
        let total_joules = total_of(&domains);
        Ok(EnergyReading {
            duration,
            domains,
            total_joules,
        })
    }
}

fn total_of(domains: &[DomainEnergy]) -> f64 {
    let mut package = 0.0;
    let mut all = 0.0;
    let mut has_package = false;
    for d in domains {
        all += d.joules;
        if d.domain == RaplDomainType::Package {
            package += d.joules;
            has_package = true;
        }
    }
    if has_package {
        package
    } else {
        all
    }
}

#[cfg(test)]
mod tests {
    use super::{total_of, DomainEnergy};
    use energy_probes::RaplDomainType;

    fn entry(domain: RaplDomainType, joules: f64) -> DomainEnergy {
        DomainEnergy {
            socket: 0,
            domain,
            joules,
            overflowed: false,
        }
    }

    #[test]
    fn test_total_prefers_package() {
        let domains = [
            entry(RaplDomainType::Package, 10.0),
            entry(RaplDomainType::PP0, 4.0),
            entry(RaplDomainType::Dram, 2.0),
        ];
        assert_eq!(total_of(&domains), 10.0);
    }

    #[test]
    fn test_total_falls_back_to_sum() {
        let domains = [entry(RaplDomainType::PP0, 4.0), entry(RaplDomainType::Dram, 2.0)];
        assert_eq!(total_of(&domains), 6.0);
    }

    #[test]
    fn test_total_empty() {
        assert_eq!(total_of(&[]), 0.0);
    }
}
