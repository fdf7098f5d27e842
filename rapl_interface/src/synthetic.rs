use std::time::Instant;

use energy_probes::{CounterMeta, CounterSource, RaplDomainType, Snapshot};

/// Counter source backed by plain integers instead of hardware registers.
///
/// Every snapshot advances each counter by a fixed step, wrapping at the
/// advertised modulus, so deltas are deterministic. Useful on machines
/// without RAPL access, and to measure the overhead of the sampler itself.
pub struct SyntheticSource {
    metas: Vec<CounterMeta>,
    values: Vec<u64>,
    step: u64,
}

impl SyntheticSource {
    /// One fake `Package` counter per socket.
    pub fn new(sockets: usize, step: u64, wrap_at: u64, joules_per_unit: f64) -> SyntheticSource {
        let metas = (0..sockets)
            .map(|socket| CounterMeta {
                socket: socket as u32,
                domain: RaplDomainType::Package,
                wrap_at,
                joules_per_unit,
            })
            .collect();
        SyntheticSource {
            metas,
            values: vec![0; sockets],
            step,
        }
    }
}

impl CounterSource for SyntheticSource {
    fn counters(&self) -> &[CounterMeta] {
        &self.metas
    }

    fn snapshot(&mut self) -> anyhow::Result<Snapshot> {
        let snapshot = Snapshot {
            timestamp: Instant::now(),
            raw: self.values.clone(),
        };
        for (value, meta) in self.values.iter_mut().zip(&self.metas) {
            // u128 arithmetic avoids overflow near wrap_at
            *value = ((*value as u128 + self.step as u128) % meta.wrap_at as u128) as u64;
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::SyntheticSource;
    use energy_probes::CounterSource;

    #[test]
    fn test_counters_advance_and_wrap() -> anyhow::Result<()> {
        let mut source = SyntheticSource::new(2, 60, 100, 1.0);
        assert_eq!(source.snapshot()?.raw, vec![0, 0]);
        assert_eq!(source.snapshot()?.raw, vec![60, 60]);
        // 120 wraps at 100
        assert_eq!(source.snapshot()?.raw, vec![20, 20]);
        Ok(())
    }
}
