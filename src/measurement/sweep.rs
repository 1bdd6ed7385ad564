//! The sweep drivers.
//!
//! Each driver is a builder over a settable (or two), a setpoint array and an
//! ordered list of readables, and records one run per execution:
//!
//! - [`Sweep1d`]: step one parameter through an array.
//! - [`Sweep2d`]: raster two parameters serpentine-style; even outer rows
//!   sweep the inner array forward into the `primary` stream, odd rows run
//!   it in reverse, either measured into a `retrace` stream or stepped back
//!   silently and left unrecorded.
//! - [`SweepTime`]: monitor readables at a fixed interval until a timeout.
//! - [`Sweep1dRepeat`]: repeat a 1D trace N times with a repetition column
//!   and the same alternating retrace behavior.
//!
//! All drivers share the same execution contract: set, settle, read, record.
//! Reads always land in the event in declaration order; `concurrent_reads`
//! only changes whether they are issued in parallel. Aborts are cooperative
//! (checked once per point) and close the run as `abort` with the partial
//! data kept. An instrument failure closes the run as `fail` and propagates
//! the error; the swept parameter stays at its last setpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::SweepDefaults;
use crate::core::{ElapsedTime, Readable, Settable};
use crate::error::MesoResult;
use crate::experiment::{
    DataKey, DescriptorDoc, EventDoc, ExitStatus, Experiment, RunWriter, StartDoc, StopDoc,
};
use crate::measurement::array::{is_monotonic, lin_array, Spacing};

/// Interval between steps of a rate-limited ramp.
const RAMP_TICK: Duration = Duration::from_millis(50);

/// A time sweep stops when less than this much of the timeout remains.
const TIMEOUT_SLOP: Duration = Duration::from_millis(5);

const ABORT_REASON: &str = "abort requested";

/// Cooperative abort flag, checked by sweeps once per point.
///
/// Clone it and hand it to a task that watches for operator input; the sweep
/// closes its run as `abort` and keeps the partial data.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the sweep to stop after the current point.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a finished sweep reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Run id of the recorded data.
    pub run_id: u64,
    /// `Success` or `Abort` (failures propagate as errors instead).
    pub exit_status: ExitStatus,
    /// Events recorded across all streams.
    pub num_events: u32,
}

/// Walk a settable to `target`, honoring its `max_rate`.
///
/// Without a rate limit this is a single set. With one, intermediate
/// setpoints are spaced so each 50 ms tick moves at most `max_rate * 0.05`
/// units; the final set lands on `target` exactly.
pub async fn ramp(param: &Arc<dyn Settable>, target: f64) -> MesoResult<()> {
    let Some(rate) = param.max_rate() else {
        return param.set(target).await;
    };
    let current = param.get().await?;
    let max_step = rate * RAMP_TICK.as_secs_f64();
    let distance = (target - current).abs();
    if distance <= max_step {
        return param.set(target).await;
    }
    let steps = (distance / max_step).ceil() as usize;
    for i in 1..steps {
        let v = current + (target - current) * (i as f64 / steps as f64);
        param.set(v).await?;
        tokio::time::sleep(RAMP_TICK).await;
    }
    param.set(target).await
}

/// Read all parameters, returning values in declaration order.
async fn read_all(readables: &[Arc<dyn Readable>], concurrent: bool) -> MesoResult<Vec<f64>> {
    if concurrent {
        futures::future::try_join_all(readables.iter().map(|r| r.read())).await
    } else {
        let mut values = Vec::with_capacity(readables.len());
        for readable in readables {
            values.push(readable.read().await?);
        }
        Ok(values)
    }
}

fn with_measured_keys(mut doc: DescriptorDoc, readables: &[Arc<dyn Readable>]) -> DescriptorDoc {
    for readable in readables {
        doc = doc.with_data_key(
            readable.name(),
            DataKey::measured(readable.name(), readable.unit()),
        );
    }
    doc
}

/// Close the run according to how the body ended and build the summary.
///
/// `body`: `Ok(true)` ran to completion, `Ok(false)` was aborted, `Err`
/// failed. Failures close the run as `fail` and propagate.
fn close_run(writer: RunWriter, body: MesoResult<bool>) -> MesoResult<RunSummary> {
    let run_id = writer.run_id();
    let run_uid = writer.run_uid().to_string();
    let num_events = writer.num_events();
    match body {
        Ok(true) => {
            writer.finish(StopDoc::success(&run_uid, num_events))?;
            info!(run_id, num_events, "sweep complete");
            Ok(RunSummary {
                run_id,
                exit_status: ExitStatus::Success,
                num_events,
            })
        }
        Ok(false) => {
            writer.finish(StopDoc::abort(&run_uid, ABORT_REASON, num_events))?;
            warn!(run_id, num_events, "sweep aborted, partial data kept");
            Ok(RunSummary {
                run_id,
                exit_status: ExitStatus::Abort,
                num_events,
            })
        }
        Err(e) => {
            writer.finish(StopDoc::fail(&run_uid, &e.to_string(), num_events))?;
            Err(e)
        }
    }
}

fn warn_if_not_monotonic(points: &[f64], axis: &str) {
    if !is_monotonic(points) {
        warn!(axis, "setpoint array is not monotonic");
    }
}

/// One-dimensional sweep: step a settable through an array, reading after a
/// settling delay at each point.
pub struct Sweep1d {
    settable: Arc<dyn Settable>,
    setpoints: Vec<f64>,
    readables: Vec<Arc<dyn Readable>>,
    settle: Duration,
    name: String,
    concurrent_reads: bool,
    abort: AbortHandle,
}

impl Sweep1d {
    pub fn new(settable: Arc<dyn Settable>, setpoints: Vec<f64>) -> Self {
        Self {
            settable,
            setpoints,
            readables: Vec::new(),
            settle: Duration::from_millis(100),
            name: "sweep".to_string(),
            concurrent_reads: false,
            abort: AbortHandle::new(),
        }
    }

    /// Add a measured parameter. Order of calls is the order in the data.
    pub fn read(mut self, readable: Arc<dyn Readable>) -> Self {
        self.readables.push(readable);
        self
    }

    /// Settling delay between set and read.
    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Apply configured sweep defaults. Later builder calls still override.
    pub fn with_defaults(mut self, defaults: &SweepDefaults) -> Self {
        self.settle = defaults.settle;
        self.concurrent_reads = defaults.concurrent_reads;
        self
    }

    /// Measurement name recorded in the start document.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Issue the reads at each point concurrently.
    pub fn concurrent_reads(mut self, concurrent: bool) -> Self {
        self.concurrent_reads = concurrent;
        self
    }

    /// Handle for aborting the sweep from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Execute, recording one run.
    pub async fn run(&self, exp: &Experiment) -> MesoResult<RunSummary> {
        warn_if_not_monotonic(&self.setpoints, self.settable.name());
        let start = StartDoc::new(0, "sweep1d", &self.name)
            .with_arg("parameter", self.settable.name())
            .with_arg("points", self.setpoints.len())
            .with_arg("settle_ms", self.settle.as_millis())
            .with_arg("concurrent_reads", self.concurrent_reads);
        let mut writer = exp.begin_run(start)?;
        let descriptor = with_measured_keys(
            DescriptorDoc::new("", "primary").with_data_key(
                self.settable.name(),
                DataKey::setpoint(self.settable.name(), self.settable.unit()),
            ),
            &self.readables,
        );
        let primary = writer.descriptor(descriptor)?;

        let body = self.sweep_body(&mut writer, &primary).await;
        close_run(writer, body)
    }

    async fn sweep_body(&self, writer: &mut RunWriter, primary: &str) -> MesoResult<bool> {
        for &setpoint in &self.setpoints {
            if self.abort.is_aborted() {
                return Ok(false);
            }
            self.settable.set(setpoint).await?;
            tokio::time::sleep(self.settle).await;
            let values = read_all(&self.readables, self.concurrent_reads).await?;
            let mut event =
                EventDoc::new("", "", 0).with_position(self.settable.name(), setpoint);
            for (readable, value) in self.readables.iter().zip(values) {
                event = event.with_datum(readable.name(), value);
            }
            writer.event(primary, event)?;
        }
        Ok(true)
    }
}

/// Two-dimensional raster sweep, serpentine-style.
///
/// The outer parameter steps through its array. At even-index outer rows the
/// inner parameter sweeps its array forward into the `primary` stream. At
/// odd-index rows the inner axis runs back: with `measure_retrace` it sweeps
/// the reversed array into a `retrace` stream at that row's outer value,
/// otherwise it is stepped back silently through `retrace_points` setpoints
/// and the row yields no data.
pub struct Sweep2d {
    outer: Arc<dyn Settable>,
    outer_setpoints: Vec<f64>,
    outer_settle: Duration,
    inner: Arc<dyn Settable>,
    inner_setpoints: Vec<f64>,
    inner_settle: Duration,
    readables: Vec<Arc<dyn Readable>>,
    name: String,
    concurrent_reads: bool,
    measure_retrace: bool,
    retrace_points: usize,
    abort: AbortHandle,
}

impl Sweep2d {
    pub fn new(
        outer: Arc<dyn Settable>,
        outer_setpoints: Vec<f64>,
        inner: Arc<dyn Settable>,
        inner_setpoints: Vec<f64>,
    ) -> Self {
        Self {
            outer,
            outer_setpoints,
            outer_settle: Duration::from_secs(1),
            inner,
            inner_setpoints,
            inner_settle: Duration::from_millis(100),
            readables: Vec::new(),
            name: "map".to_string(),
            concurrent_reads: false,
            measure_retrace: false,
            retrace_points: 201,
            abort: AbortHandle::new(),
        }
    }

    /// Add a measured parameter. Order of calls is the order in the data.
    pub fn read(mut self, readable: Arc<dyn Readable>) -> Self {
        self.readables.push(readable);
        self
    }

    /// Settling delay after stepping the outer parameter.
    pub fn outer_settle(mut self, settle: Duration) -> Self {
        self.outer_settle = settle;
        self
    }

    /// Settling delay between inner set and read.
    pub fn settle(mut self, settle: Duration) -> Self {
        self.inner_settle = settle;
        self
    }

    /// Apply configured sweep defaults. Later builder calls still override.
    pub fn with_defaults(mut self, defaults: &SweepDefaults) -> Self {
        self.inner_settle = defaults.settle;
        self.outer_settle = defaults.outer_settle;
        self.concurrent_reads = defaults.concurrent_reads;
        self.retrace_points = defaults.retrace_points.max(2);
        self
    }

    /// Measurement name recorded in the start document.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Issue the reads at each point concurrently.
    pub fn concurrent_reads(mut self, concurrent: bool) -> Self {
        self.concurrent_reads = concurrent;
        self
    }

    /// Measure the odd-row return traces into a `retrace` stream.
    pub fn measure_retrace(mut self, measure: bool) -> Self {
        self.measure_retrace = measure;
        self
    }

    /// Number of setpoints of a silent (unmeasured) return trace.
    pub fn retrace_points(mut self, points: usize) -> Self {
        self.retrace_points = points.max(2);
        self
    }

    /// Handle for aborting the sweep from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Execute, recording one run.
    pub async fn run(&self, exp: &Experiment) -> MesoResult<RunSummary> {
        warn_if_not_monotonic(&self.outer_setpoints, self.outer.name());
        warn_if_not_monotonic(&self.inner_setpoints, self.inner.name());
        let start = StartDoc::new(0, "sweep2d", &self.name)
            .with_arg("outer", self.outer.name())
            .with_arg("inner", self.inner.name())
            .with_arg("outer_points", self.outer_setpoints.len())
            .with_arg("inner_points", self.inner_setpoints.len())
            .with_arg("measure_retrace", self.measure_retrace);
        let mut writer = exp.begin_run(start)?;

        let setpoint_keys = DescriptorDoc::new("", "primary")
            .with_data_key(
                self.outer.name(),
                DataKey::setpoint(self.outer.name(), self.outer.unit()),
            )
            .with_data_key(
                self.inner.name(),
                DataKey::setpoint(self.inner.name(), self.inner.unit()),
            );
        let primary = writer.descriptor(with_measured_keys(setpoint_keys, &self.readables))?;
        let retrace = if self.measure_retrace {
            let mut doc = DescriptorDoc::new("", "retrace")
                .with_data_key(
                    self.outer.name(),
                    DataKey::setpoint(self.outer.name(), self.outer.unit()),
                )
                .with_data_key(
                    self.inner.name(),
                    DataKey::setpoint(self.inner.name(), self.inner.unit()),
                );
            doc = with_measured_keys(doc, &self.readables);
            Some(writer.descriptor(doc)?)
        } else {
            None
        };

        let body = self.sweep_body(&mut writer, &primary, retrace.as_deref()).await;
        close_run(writer, body)
    }

    async fn sweep_body(
        &self,
        writer: &mut RunWriter,
        primary: &str,
        retrace: Option<&str>,
    ) -> MesoResult<bool> {
        for (row, &outer_value) in self.outer_setpoints.iter().enumerate() {
            if self.abort.is_aborted() {
                return Ok(false);
            }
            self.outer.set(outer_value).await?;

            // Even rows sweep forward; odd rows run the inner axis back,
            // either measured or as an unrecorded ramp.
            let (stream, reversed) = if row % 2 == 0 {
                (primary, false)
            } else if let Some(stream) = retrace {
                (stream, true)
            } else {
                self.silent_retrace().await?;
                continue;
            };
            tokio::time::sleep(self.outer_settle).await;
            if !self.trace(writer, stream, outer_value, reversed).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sweep the inner axis once, recording into `stream`.
    async fn trace(
        &self,
        writer: &mut RunWriter,
        stream: &str,
        outer_value: f64,
        reversed: bool,
    ) -> MesoResult<bool> {
        let forward = self.inner_setpoints.iter();
        let backward = self.inner_setpoints.iter().rev();
        let order: Box<dyn Iterator<Item = &f64> + Send> = if reversed {
            Box::new(backward)
        } else {
            Box::new(forward)
        };
        for &inner_value in order {
            if self.abort.is_aborted() {
                return Ok(false);
            }
            self.inner.set(inner_value).await?;
            tokio::time::sleep(self.inner_settle).await;
            let values = read_all(&self.readables, self.concurrent_reads).await?;
            let mut event = EventDoc::new("", "", 0)
                .with_position(self.outer.name(), outer_value)
                .with_position(self.inner.name(), inner_value);
            for (readable, value) in self.readables.iter().zip(values) {
                event = event.with_datum(readable.name(), value);
            }
            writer.event(stream, event)?;
        }
        Ok(true)
    }

    /// Step the inner parameter back to the start of its array, unrecorded.
    async fn silent_retrace(&self) -> MesoResult<()> {
        let (Some(&last), Some(&first)) =
            (self.inner_setpoints.last(), self.inner_setpoints.first())
        else {
            return Ok(());
        };
        for value in lin_array(last, first, Spacing::Points(self.retrace_points))? {
            self.inner.set(value).await?;
        }
        Ok(())
    }
}

/// Monitor readables at a fixed interval until a timeout elapses.
///
/// The independent variable is elapsed time in seconds.
pub struct SweepTime {
    readables: Vec<Arc<dyn Readable>>,
    interval: Duration,
    timeout: Duration,
    name: String,
    concurrent_reads: bool,
    abort: AbortHandle,
}

impl SweepTime {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            readables: Vec::new(),
            interval,
            timeout,
            name: "monitor".to_string(),
            concurrent_reads: false,
            abort: AbortHandle::new(),
        }
    }

    /// Add a measured parameter. Order of calls is the order in the data.
    pub fn read(mut self, readable: Arc<dyn Readable>) -> Self {
        self.readables.push(readable);
        self
    }

    /// Measurement name recorded in the start document.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Issue the reads at each point concurrently.
    pub fn concurrent_reads(mut self, concurrent: bool) -> Self {
        self.concurrent_reads = concurrent;
        self
    }

    /// Handle for aborting the sweep from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Execute, recording one run.
    pub async fn run(&self, exp: &Experiment) -> MesoResult<RunSummary> {
        let start = StartDoc::new(0, "sweeptime", &self.name)
            .with_arg("interval_ms", self.interval.as_millis())
            .with_arg("timeout_ms", self.timeout.as_millis());
        let mut writer = exp.begin_run(start)?;
        let descriptor = with_measured_keys(
            DescriptorDoc::new("", "primary")
                .with_data_key("time", DataKey::setpoint("time", "s")),
            &self.readables,
        );
        let primary = writer.descriptor(descriptor)?;

        let body = self.sweep_body(&mut writer, &primary).await;
        close_run(writer, body)
    }

    async fn sweep_body(&self, writer: &mut RunWriter, primary: &str) -> MesoResult<bool> {
        let clock = ElapsedTime::new("time");
        loop {
            if self.abort.is_aborted() {
                return Ok(false);
            }
            let elapsed = Duration::from_secs_f64(clock.elapsed());
            if self.timeout.saturating_sub(elapsed) < TIMEOUT_SLOP {
                return Ok(true);
            }
            let values = read_all(&self.readables, self.concurrent_reads).await?;
            let mut event =
                EventDoc::new("", "", 0).with_position("time", elapsed.as_secs_f64());
            for (readable, value) in self.readables.iter().zip(values) {
                event = event.with_datum(readable.name(), value);
            }
            writer.event(primary, event)?;
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Repeat a 1D trace N times, recording the repetition index alongside the
/// setpoint.
///
/// Repetitions alternate like the rows of a [`Sweep2d`]: even repetitions
/// sweep forward into `primary`, odd ones run the array in reverse, either
/// measured into a `retrace` stream or silently stepped back and skipped.
pub struct Sweep1dRepeat {
    settable: Arc<dyn Settable>,
    setpoints: Vec<f64>,
    repetitions: usize,
    readables: Vec<Arc<dyn Readable>>,
    settle: Duration,
    name: String,
    concurrent_reads: bool,
    measure_retrace: bool,
    retrace_points: usize,
    abort: AbortHandle,
}

impl Sweep1dRepeat {
    pub fn new(settable: Arc<dyn Settable>, setpoints: Vec<f64>, repetitions: usize) -> Self {
        Self {
            settable,
            setpoints,
            repetitions,
            readables: Vec::new(),
            settle: Duration::from_millis(100),
            name: "repeat".to_string(),
            concurrent_reads: false,
            measure_retrace: false,
            retrace_points: 201,
            abort: AbortHandle::new(),
        }
    }

    /// Add a measured parameter. Order of calls is the order in the data.
    pub fn read(mut self, readable: Arc<dyn Readable>) -> Self {
        self.readables.push(readable);
        self
    }

    /// Settling delay between set and read.
    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Apply configured sweep defaults. Later builder calls still override.
    pub fn with_defaults(mut self, defaults: &SweepDefaults) -> Self {
        self.settle = defaults.settle;
        self.concurrent_reads = defaults.concurrent_reads;
        self.retrace_points = defaults.retrace_points.max(2);
        self
    }

    /// Measurement name recorded in the start document.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Issue the reads at each point concurrently.
    pub fn concurrent_reads(mut self, concurrent: bool) -> Self {
        self.concurrent_reads = concurrent;
        self
    }

    /// Measure the odd-repetition return traces into a `retrace` stream.
    pub fn measure_retrace(mut self, measure: bool) -> Self {
        self.measure_retrace = measure;
        self
    }

    /// Handle for aborting the sweep from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn stream_descriptor(&self, stream: &str) -> DescriptorDoc {
        with_measured_keys(
            DescriptorDoc::new("", stream)
                .with_data_key(
                    self.settable.name(),
                    DataKey::setpoint(self.settable.name(), self.settable.unit()),
                )
                .with_data_key("repetition", DataKey::setpoint("repetition", "")),
            &self.readables,
        )
    }

    /// Execute, recording one run.
    pub async fn run(&self, exp: &Experiment) -> MesoResult<RunSummary> {
        warn_if_not_monotonic(&self.setpoints, self.settable.name());
        let start = StartDoc::new(0, "sweep1d_repeat", &self.name)
            .with_arg("parameter", self.settable.name())
            .with_arg("points", self.setpoints.len())
            .with_arg("repetitions", self.repetitions)
            .with_arg("measure_retrace", self.measure_retrace);
        let mut writer = exp.begin_run(start)?;
        let primary = writer.descriptor(self.stream_descriptor("primary"))?;
        let retrace = if self.measure_retrace {
            Some(writer.descriptor(self.stream_descriptor("retrace"))?)
        } else {
            None
        };

        let body = self.sweep_body(&mut writer, &primary, retrace.as_deref()).await;
        close_run(writer, body)
    }

    async fn sweep_body(
        &self,
        writer: &mut RunWriter,
        primary: &str,
        retrace: Option<&str>,
    ) -> MesoResult<bool> {
        for repetition in 0..self.repetitions {
            if self.abort.is_aborted() {
                return Ok(false);
            }
            // Even repetitions run forward; odd ones run back, either
            // measured or as an unrecorded ramp.
            let (stream, reversed) = if repetition % 2 == 0 {
                (primary, false)
            } else if let Some(stream) = retrace {
                (stream, true)
            } else {
                self.silent_retrace().await?;
                continue;
            };
            if !self.trace(writer, stream, repetition, reversed).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Run the trace once, recording into `stream`.
    async fn trace(
        &self,
        writer: &mut RunWriter,
        stream: &str,
        repetition: usize,
        reversed: bool,
    ) -> MesoResult<bool> {
        let forward = self.setpoints.iter();
        let backward = self.setpoints.iter().rev();
        let order: Box<dyn Iterator<Item = &f64> + Send> = if reversed {
            Box::new(backward)
        } else {
            Box::new(forward)
        };
        for &setpoint in order {
            if self.abort.is_aborted() {
                return Ok(false);
            }
            self.settable.set(setpoint).await?;
            tokio::time::sleep(self.settle).await;
            let values = read_all(&self.readables, self.concurrent_reads).await?;
            let mut event = EventDoc::new("", "", 0)
                .with_position(self.settable.name(), setpoint)
                .with_position("repetition", repetition as f64);
            for (readable, value) in self.readables.iter().zip(values) {
                event = event.with_datum(readable.name(), value);
            }
            writer.event(stream, event)?;
        }
        Ok(true)
    }

    async fn silent_retrace(&self) -> MesoResult<()> {
        let (Some(&last), Some(&first)) = (self.setpoints.last(), self.setpoints.first()) else {
            return Ok(());
        };
        for value in lin_array(last, first, Spacing::Points(self.retrace_points))? {
            self.settable.set(value).await?;
        }
        Ok(())
    }
}
