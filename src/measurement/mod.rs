//! Sweep execution: setpoint arrays, ramps and the sweep drivers.

mod array;
mod sweep;

pub use array::{dbm_to_vrf, is_monotonic, lin_array, rf_array, vrf_to_dbm, Spacing};
pub use sweep::{ramp, AbortHandle, RunSummary, Sweep1d, Sweep1dRepeat, Sweep2d, SweepTime};
