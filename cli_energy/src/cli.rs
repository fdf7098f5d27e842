use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use energy_probes::RaplDomainType;

#[derive(Parser)]
#[command(author, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Only show info about CPU and RAPL domains, then exit.
    Info,

    /// Measure the energy consumed by a workload, repeated a number of times.
    Measure {
        /// How to access RAPL counters.
        #[arg(long, value_enum, default_value = "auto")]
        probe: SourceArg,

        /// The RAPL domains to record (defaults to all of them).
        #[arg(short, long, value_delimiter = ',')]
        domains: Option<Vec<RaplDomainType>>,

        /// How many times to repeat the workload.
        #[arg(short, long, default_value_t = 1)]
        iterations: u64,

        /// The workload to bracket with the measurement.
        #[arg(short, long, value_enum, default_value = "sleep")]
        workload: WorkloadArg,

        /// Workload size: milliseconds for sleep, harmonic-sum target for spin.
        #[arg(short = 'n', long, default_value_t = 100)]
        size: u64,

        /// Append the readings to this CSV file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum, Debug, PartialEq, Eq)]
pub enum SourceArg {
    /// First working source among perf-event, powercap and msr.
    Auto,
    PerfEvent,
    Powercap,
    Msr,
    /// In-process fake counters, for machines without RAPL access.
    Synthetic,
}

#[derive(Clone, Copy, ValueEnum, Debug, PartialEq, Eq)]
pub enum WorkloadArg {
    /// Sleep for the given number of milliseconds.
    Sleep,
    /// Sum the harmonic series until it exceeds the given target.
    Spin,
}
