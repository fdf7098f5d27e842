//! The symbols linked by foreign benchmark runners.
//!
//! Only primitive integers cross the boundary. One measurement context
//! exists per process; it is built on the first `start_rapl` call from the
//! environment and reclaimed by the OS at process exit. An active session
//! left open by a killed process needs no cleanup beyond that.

use std::env;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, error, warn};
use once_cell::sync::Lazy;

use energy_probes::{open_default_source, open_source, CounterSource, ProbeError, ProbeKind, RaplDomainType};

use crate::control::LoopController;
use crate::sampler::{Sampler, SamplerError};
use crate::sink::ReportSink;

/// Selects the counter access kind (`perf-event`, `powercap` or `msr`)
/// instead of auto-detection.
pub const PROBE_ENV: &str = "RAPL_PROBE";
/// Overrides the CSV file the readings are appended to.
pub const OUTPUT_ENV: &str = "RAPL_OUTPUT";

const DEFAULT_OUTPUT: &str = "measurements.csv";

/// A session was started, the caller should run its workload.
pub const START_OK: i32 = 1;
/// The caller must terminate its loop: iteration budget exhausted,
/// counters unavailable, or an internal fault.
pub const START_STOP: i32 = 0;
/// `start_rapl` was called while a session was active. The existing
/// baseline is kept; the call is a no-op besides this code.
pub const START_ALREADY_ACTIVE: i32 = -1;

struct MeasurementContext {
    sampler: Sampler,
    sink: ReportSink,
    control: LoopController,
}

enum State {
    Uninit,
    Ready(MeasurementContext),
    /// Initialization failed once; don't retry on every call.
    Unavailable,
}

static STATE: Lazy<Mutex<State>> = Lazy::new(|| Mutex::new(State::Uninit));

fn lock_state() -> MutexGuard<'static, State> {
    // a panic while holding the lock was already reported at the boundary
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Begins a measured iteration.
///
/// Returns nonzero when the caller should run its workload (and call
/// `stop_rapl` afterwards), 0 when the loop must terminate. The intended
/// calling convention is `while (start_rapl()) { workload(); stop_rapl(); }`.
#[no_mangle]
pub extern "C" fn start_rapl() -> i32 {
    panic::catch_unwind(AssertUnwindSafe(start_impl)).unwrap_or_else(|_| {
        error!("start_rapl panicked, terminating the measurement loop");
        START_STOP
    })
}

/// Ends the current measured iteration and records the reading.
///
/// Out-of-order calls are reported and ignored; nothing unwinds into the
/// caller.
#[no_mangle]
pub extern "C" fn stop_rapl() {
    if panic::catch_unwind(AssertUnwindSafe(stop_impl)).is_err() {
        error!("stop_rapl panicked, the reading of this iteration is lost");
    }
}

fn start_impl() -> i32 {
    // make diagnostics visible to foreign callers via RUST_LOG
    let _ = env_logger::try_init();

    let mut state = lock_state();
    if matches!(*state, State::Uninit) {
        *state = match init_context() {
            Ok(context) => State::Ready(context),
            Err(e) => {
                error!("energy measurement unavailable: {e}");
                State::Unavailable
            }
        };
    }
    let State::Ready(context) = &mut *state else {
        return START_STOP;
    };

    if !context.control.should_continue() {
        debug!("iteration budget exhausted after {} readings", context.sink.len());
        return START_STOP;
    }
    match context.sampler.start() {
        Ok(()) => START_OK,
        Err(SamplerError::AlreadyActive) => {
            warn!("start_rapl called twice without stop_rapl, keeping the current session");
            START_ALREADY_ACTIVE
        }
        Err(e) => {
            error!("failed to start a measurement session: {e}");
            START_STOP
        }
    }
}

fn stop_impl() {
    let mut state = lock_state();
    let State::Ready(context) = &mut *state else {
        return;
    };
    match context.sampler.stop() {
        Ok(reading) => {
            debug!(
                "measured {} J over {} ms",
                reading.total_joules,
                reading.duration.as_millis()
            );
            context.sink.record(reading);
        }
        Err(SamplerError::NoActiveSession) => {
            warn!("stop_rapl called without a matching start_rapl");
        }
        Err(e) => error!("failed to stop the measurement session: {e}"),
    }
}

fn init_context() -> Result<MeasurementContext, ProbeError> {
    let source = source_from_env()?;
    let sampler = Sampler::new(source);

    let output = env::var(OUTPUT_ENV).unwrap_or_else(|_| DEFAULT_OUTPUT.to_owned());
    let sink = match ReportSink::with_csv(&output, sampler.counters()) {
        Ok(sink) => sink,
        Err(e) => {
            // measuring still works, the readings just stay in memory
            warn!("cannot write readings to '{output}': {e}");
            ReportSink::in_memory()
        }
    };

    Ok(MeasurementContext {
        sampler,
        sink,
        control: LoopController::from_env(),
    })
}

fn source_from_env() -> Result<Box<dyn CounterSource>, ProbeError> {
    match env::var(PROBE_ENV) {
        Ok(value) => match value.parse::<ProbeKind>() {
            Ok(kind) => open_source(kind, &RaplDomainType::ALL),
            Err(_) => {
                warn!("unknown {PROBE_ENV}='{value}', falling back to auto-detection");
                open_default_source(&RaplDomainType::ALL)
            }
        },
        Err(_) => open_default_source(&RaplDomainType::ALL),
    }
}
