//! The transport orchestrator (C6) and everything it owns: the endpoint
//! gateway (C1), the keep-alive scheduler (C7), and the handle's public API
//! surface (§6).

pub mod gateway;

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::commands::{CommandBlock, TestUnitReadyCommand};
use crate::error::{Error, OpenError};
use crate::lifecycle::{LifecycleConfig, LifecycleMachine, Phase, PhaseCounters, Transition};
use crate::policy::{PolicyTable, StallRecovery};
use crate::protocol::{Cbw, Csw, CswStatus, Direction};
use crate::tag::{TagHistorySummary, TagMonitor, TagOutcome};

use self::gateway::{EndpointGateway, EndpointKind, GatewayError, RusbGateway};

/// Per-stage timeouts (§5).
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub cbw_out: Duration,
    /// Base timeout for the data phase; `per_kib` is added per KiB transferred.
    pub data_base: Duration,
    pub data_per_kib: Duration,
    pub csw_in: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            cbw_out: Duration::from_secs(1),
            data_base: Duration::from_secs(5),
            data_per_kib: Duration::from_millis(10),
            csw_in: Duration::from_secs(1),
        }
    }
}

impl StageTimeouts {
    fn data_timeout(&self, len_bytes: usize) -> Duration {
        let kib = len_bytes.div_ceil(1024) as u32;
        self.data_base + self.data_per_kib.saturating_mul(kib)
    }
}

/// All tunable behavior of a [`Transport`], gathered in one struct (§6
/// "Configuration"). No external config-file format is introduced — the CLI
/// that sits on top of this crate takes all of its tuning through struct
/// fields and `clap` flags, never a TOML/serde layer — every field has a
/// sensible [`Default`] and can be overridden individually.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub policy: PolicyTable,
    pub lifecycle: LifecycleConfig,
    pub keepalive_interval: Duration,
    pub stage_timeouts: StageTimeouts,
    pub auto_keepalive: bool,
    pub auto_reconnect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            policy: PolicyTable::default(),
            lifecycle: LifecycleConfig::default(),
            keepalive_interval: Duration::from_secs(3),
            stage_timeouts: StageTimeouts::default(),
            auto_keepalive: true,
            auto_reconnect: false,
        }
    }
}

/// What data phase (if any) an `execute` call performs.
#[derive(Debug, Clone, Copy)]
pub enum DataRequest<'a> {
    None,
    Out(&'a [u8]),
    In(usize),
}

/// Per-call knobs for `execute`; distinct from [`TransportConfig`], which is
/// set once at `open()`.
#[derive(Default)]
pub struct ExecuteOptions {
    /// Permit this call to proceed (and attempt reconnection) even though
    /// the lifecycle machine currently reports Disconnected.
    pub allow_when_disconnected: bool,
    /// Cooperative cancellation; only honored at suspension points (§5).
    pub cancel: Option<CancelToken>,
}

/// A cooperative cancellation flag, checked only at suspension points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<std::sync::atomic::AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// The result of a successful `execute` call: the decoded CSW plus any
/// bytes read during an `In` data phase.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub csw: Csw,
    pub bytes_in: Option<Vec<u8>>,
}

/// A point-in-time snapshot of the transport's observability surface (§6
/// `statistics()`).
#[derive(Debug, Clone, Copy)]
pub struct Statistics {
    pub phase: Phase,
    pub elapsed_in_phase: Duration,
    pub counters: PhaseCounters,
    pub tag_history: TagHistorySummary,
}

struct TransportState {
    gateway: Box<dyn EndpointGateway>,
    tag_monitor: TagMonitor,
    lifecycle: LifecycleMachine,
    poisoned: bool,
    vendor: u16,
    product: u16,
}

struct KeepAliveHandle {
    cancel_tx: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl KeepAliveHandle {
    fn cancel_and_join(&mut self) {
        let _ = self.cancel_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct Shared {
    state: Mutex<TransportState>,
    config: TransportConfig,
    keepalive: Mutex<Option<KeepAliveHandle>>,
}

/// The lifecycle-aware BOT transport handle (§3 "Transport handle", §6 API
/// surface).
///
/// Cloning a `Transport` clones a reference to the same underlying device —
/// this is what lets the keep-alive task and ordinary callers share the
/// single serialization point required by invariant I1, and lets the
/// keep-alive task hold only a [`std::sync::Weak`] back-reference (design
/// note 9) so it never keeps the handle alive on its own.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Shared>,
}

impl Transport {
    /// Open the device at `vendor:product` and bring the handle up.
    pub fn open(vendor: u16, product: u16, config: TransportConfig) -> Result<Self, OpenError> {
        let gateway = RusbGateway::open(vendor, product)?;
        Self::from_gateway(Box::new(gateway), vendor, product, config)
    }

    fn from_gateway(
        gateway: Box<dyn EndpointGateway>,
        vendor: u16,
        product: u16,
        config: TransportConfig,
    ) -> Result<Self, OpenError> {
        let state = TransportState {
            gateway,
            tag_monitor: TagMonitor::new(),
            lifecycle: LifecycleMachine::new(config.lifecycle, Instant::now()),
            poisoned: false,
            vendor,
            product,
        };

        Ok(Self {
            inner: Arc::new(Shared {
                state: Mutex::new(state),
                config,
                keepalive: Mutex::new(None),
            }),
        })
    }

    /// Construct a transport over an arbitrary gateway (real or mock). Used
    /// by the property-test suite; not part of the public API surface
    /// described in §6, but `pub` so `tests/` (an external crate target)
    /// can reach it.
    #[doc(hidden)]
    pub fn from_gateway_for_testing(
        gateway: Box<dyn EndpointGateway>,
        config: TransportConfig,
    ) -> Self {
        Self::from_gateway(gateway, 0x0402, 0x3922, config).expect("mock gateway never fails to open")
    }

    /// Force the handle directly into `phase`, bypassing the normal trigger
    /// table (§4.4). Used only by the scripted-device test suite to reach
    /// Connecting/Connected without waiting out real elapsed time; not part
    /// of the public API surface described in §6.
    #[doc(hidden)]
    pub fn force_phase_for_testing(&self, phase: Phase) {
        let mut state = self.inner.state.lock().unwrap();
        state.lifecycle.force_phase_for_testing(phase, Instant::now());
    }

    /// Current inferred phase (§6 `current_phase()`).
    ///
    /// Applies the lifecycle machine's wall-clock check before reading, so a
    /// caller that stops issuing commands still observes e.g. the Connected
    /// → Disconnected silence timeout (§4.4, scenario S4) without needing to
    /// provoke another `execute()` first.
    pub fn current_phase(&self) -> Phase {
        let mut state = self.inner.state.lock().unwrap();
        state.lifecycle.check_wall_clock(Instant::now());
        state.lifecycle.phase()
    }

    /// Block the calling thread until `target` is reached or `timeout`
    /// elapses (§6 `wait_for_phase`).
    pub fn wait_for_phase(&self, target: Phase, timeout: Duration) -> Result<Phase, Phase> {
        let deadline = Instant::now() + timeout;
        loop {
            let phase = self.current_phase();
            if phase == target {
                return Ok(phase);
            }
            if Instant::now() >= deadline {
                return Err(phase);
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// Snapshot statistics (§6 `statistics()`). Applies the same wall-clock
    /// check as [`Transport::current_phase`] before reading.
    pub fn statistics(&self) -> Statistics {
        let mut state = self.inner.state.lock().unwrap();
        state.lifecycle.check_wall_clock(Instant::now());
        Statistics {
            phase: state.lifecycle.phase(),
            elapsed_in_phase: state.lifecycle.elapsed_in_phase(Instant::now()),
            counters: state.lifecycle.counters(),
            tag_history: state.tag_monitor.summary(),
        }
    }

    fn time_since_last_csw_at_least(&self, min: Duration) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        match state.lifecycle.elapsed_since_last_csw(Instant::now()) {
            Some(elapsed) => elapsed >= min,
            // No CSW observed yet on this handle; nothing to wait on.
            None => true,
        }
    }

    /// Close the handle (§3, §6 `close()`): cancels and joins the keep-alive
    /// task, then releases the USB interface. Idempotent (§8 property 6).
    pub fn close(&self) {
        if let Some(mut handle) = self.inner.keepalive.lock().unwrap().take() {
            handle.cancel_and_join();
        }
        let mut state = self.inner.state.lock().unwrap();
        state.gateway.shutdown();
        state.poisoned = true;
        state.lifecycle.force_unknown(Instant::now());
    }

    /// Run one SCSI command through the full BOT protocol (§4.6, the C6
    /// orchestrator). This is the single entry point both ordinary callers
    /// and the keep-alive task funnel through, so invariant I1 (single
    /// outstanding exchange per handle) only needs one mutex.
    pub fn execute<T: CommandBlock>(
        &self,
        cmd: &T,
        data: DataRequest<'_>,
        options: ExecuteOptions,
    ) -> Result<ExecuteOutcome, Error> {
        let mut state = self.inner.state.lock().unwrap();
        let now = Instant::now();

        // Fail-fast (§4.6 step 1): a poisoned or Disconnected handle is
        // rejected before any phase bookkeeping runs, so a stray call on a
        // closed handle can never be the thing that flips it out of Unknown.
        if state.poisoned {
            if self.inner.config.auto_reconnect {
                drop(state);
                self.reconnect()?;
                state = self.inner.state.lock().unwrap();
            } else {
                let phase = state.lifecycle.phase();
                return Err(Error::DeviceGone {
                    phase,
                    tag: 0,
                    elapsed_in_phase: state.lifecycle.elapsed_in_phase(now),
                    attempt: 0,
                });
            }
        }

        let phase_at_entry = state.lifecycle.phase();
        if phase_at_entry == Phase::Disconnected && !options.allow_when_disconnected {
            return Err(Error::DeviceGone {
                phase: phase_at_entry,
                tag: 0,
                elapsed_in_phase: state.lifecycle.elapsed_in_phase(now),
                attempt: 0,
            });
        }

        state.lifecycle.before_operation(now);

        let phase = state.lifecycle.phase();
        let policy = self.inner.config.policy.for_phase(phase);
        let timeouts = self.inner.config.stage_timeouts;

        if let Some(err) = check_cancelled(&options, phase, 0, 0) {
            return Err(err);
        }
        if !policy.pre_delay.is_zero() {
            thread::sleep(policy.pre_delay);
        }

        let tag = state.tag_monitor.next();
        let (direction, data_len) = match &data {
            DataRequest::None => (Direction::None, 0u32),
            DataRequest::Out(bytes) => (Direction::Out, bytes.len() as u32),
            DataRequest::In(len) => (Direction::In, *len as u32),
        };
        let cbw = Cbw::new(tag, data_len, direction, cmd);

        let mut attempt = 0u32;
        let outcome = loop {
            match self.try_once(&mut state, &cbw, data, tag, phase, &timeouts, attempt) {
                Ok(outcome) => break Ok(outcome),
                Err(RetryDecision::Retry(_)) if attempt < policy.max_retries => {
                    let backoff = policy.backoff_for_attempt(attempt);
                    if !backoff.is_zero() {
                        thread::sleep(backoff);
                    }
                    attempt += 1;
                    continue;
                }
                Err(RetryDecision::Fatal(err)) => break Err(err),
                // Retries exhausted: surface the real error that kept causing
                // the retry (PipeStall, ResourceBusy, TagMismatch, ...),
                // rather than a fabricated one.
                Err(RetryDecision::Retry(err)) => break Err(err),
            }
        };

        match &outcome {
            Ok(o) => {
                let scsi_success = o.csw.status.is_success() || policy.accept_scsi_failure;
                let tag_matched = o.csw.tag == tag;
                if let Some(_t) = state.lifecycle.after_csw(Instant::now(), scsi_success, tag_matched) {
                    log::debug!("lifecycle transition after csw");
                }
            }
            Err(e) if matches!(e, Error::DeviceGone { .. }) => {
                state.lifecycle.after_device_gone(Instant::now());
                state.poisoned = true;
            }
            Err(_) => {
                state.lifecycle.after_pipe_error();
            }
        }

        if !policy.post_delay.is_zero() {
            thread::sleep(policy.post_delay);
        }

        self.maybe_start_keepalive(&state);

        outcome
    }

    fn try_once(
        &self,
        state: &mut TransportState,
        cbw: &Cbw,
        data: DataRequest<'_>,
        tag: u32,
        phase: Phase,
        timeouts: &StageTimeouts,
        attempt: u32,
    ) -> Result<ExecuteOutcome, RetryDecision> {
        let policy = self.inner.config.policy.for_phase(phase);
        let elapsed = state.lifecycle.elapsed_in_phase(Instant::now());

        // Step 4: send the CBW.
        match state.gateway.bulk_out(&cbw.to_bytes(), timeouts.cbw_out) {
            Ok(_) => {}
            Err(GatewayError::PipeStall) => {
                self.recover_from_stall(state, &policy, attempt);
                return Err(RetryDecision::Retry(Error::PipeStall { phase, tag, elapsed_in_phase: elapsed, attempt }));
            }
            Err(GatewayError::ResourceBusy) => {
                return Err(RetryDecision::Retry(Error::ResourceBusy { phase, tag, elapsed_in_phase: elapsed, attempt }))
            }
            Err(GatewayError::Timeout) => {
                return Err(RetryDecision::Fatal(Error::Timeout { phase, tag, elapsed_in_phase: elapsed, attempt }))
            }
            Err(GatewayError::DeviceGone) => {
                return Err(RetryDecision::Fatal(Error::DeviceGone { phase, tag, elapsed_in_phase: elapsed, attempt }))
            }
        }

        // Step 5: data phase, if any.
        let mut bytes_in = None;
        match data {
            DataRequest::None => {}
            DataRequest::Out(bytes) => {
                let timeout = timeouts.data_timeout(bytes.len());
                match state.gateway.bulk_out(bytes, timeout) {
                    Ok(_) => {}
                    Err(GatewayError::PipeStall) => {
                        // Recoverable mid-data-phase: clear the halt and still
                        // attempt to read the CSW (§4.6 step 5).
                        let _ = state.gateway.clear_halt(EndpointKind::Out);
                    }
                    Err(GatewayError::ResourceBusy) => {
                        return Err(RetryDecision::Retry(Error::ResourceBusy { phase, tag, elapsed_in_phase: elapsed, attempt }))
                    }
                    Err(GatewayError::Timeout) => {
                        return Err(RetryDecision::Fatal(Error::Timeout { phase, tag, elapsed_in_phase: elapsed, attempt }))
                    }
                    Err(GatewayError::DeviceGone) => {
                        return Err(RetryDecision::Fatal(Error::DeviceGone { phase, tag, elapsed_in_phase: elapsed, attempt }))
                    }
                }
            }
            DataRequest::In(len) => {
                let timeout = timeouts.data_timeout(len);
                let mut buf = vec![0u8; len];
                match state.gateway.bulk_in(&mut buf, timeout) {
                    Ok(n) => {
                        buf.truncate(n);
                        bytes_in = Some(buf);
                    }
                    Err(GatewayError::PipeStall) => {
                        let _ = state.gateway.clear_halt(EndpointKind::In);
                    }
                    Err(GatewayError::ResourceBusy) => {
                        return Err(RetryDecision::Retry(Error::ResourceBusy { phase, tag, elapsed_in_phase: elapsed, attempt }))
                    }
                    Err(GatewayError::Timeout) => {
                        return Err(RetryDecision::Fatal(Error::Timeout { phase, tag, elapsed_in_phase: elapsed, attempt }))
                    }
                    Err(GatewayError::DeviceGone) => {
                        return Err(RetryDecision::Fatal(Error::DeviceGone { phase, tag, elapsed_in_phase: elapsed, attempt }))
                    }
                }
            }
        }

        // Step 6: status phase, with one re-read attempt on a malformed CSW.
        let csw = match self.read_csw(state, timeouts.csw_in, phase, tag, elapsed, attempt) {
            Ok(csw) => csw,
            Err(RetryDecision::Retry(_)) => {
                match self.read_csw(state, timeouts.csw_in, phase, tag, elapsed, attempt) {
                    Ok(csw) => csw,
                    Err(RetryDecision::Fatal(e)) => return Err(RetryDecision::Fatal(e)),
                    Err(RetryDecision::Retry(e)) => return Err(RetryDecision::Fatal(e)),
                }
            }
            Err(RetryDecision::Fatal(e)) => return Err(RetryDecision::Fatal(e)),
        };

        // Step 7: tag validation under the phase's policy. A mismatch isn't
        // fatal on the spot — it feeds back into the same retry loop as a
        // pipe error, and only surfaces once the phase's retry budget is
        // exhausted (§4.6 step 7: "retry the whole operation up to the
        // phase's max").
        let validation = state.tag_monitor.validate(tag, csw.tag, phase);
        match validation.outcome {
            TagOutcome::Accept => {}
            TagOutcome::SuspectedReset => {
                state.tag_monitor.rebase(csw.tag);
            }
            TagOutcome::Mismatch => {
                return Err(RetryDecision::Retry(Error::TagMismatch {
                    expected: tag,
                    actual: csw.tag,
                    phase,
                    tag,
                    elapsed_in_phase: elapsed,
                    attempt,
                }));
            }
        }

        if csw.status != CswStatus::Success && !policy.accept_scsi_failure {
            return Err(RetryDecision::Fatal(Error::ScsiFailure {
                status: csw.status.raw(),
                phase,
                tag,
                elapsed_in_phase: elapsed,
                attempt,
            }));
        }

        Ok(ExecuteOutcome { csw, bytes_in })
    }

    fn read_csw(
        &self,
        state: &mut TransportState,
        timeout: Duration,
        phase: Phase,
        tag: u32,
        elapsed: Duration,
        attempt: u32,
    ) -> Result<Csw, RetryDecision> {
        let mut buf = [0u8; crate::protocol::CSW_LEN];
        match state.gateway.bulk_in(&mut buf, timeout) {
            Ok(n) if n == crate::protocol::CSW_LEN => match Csw::from_bytes(&buf[..n]) {
                Ok(csw) => Ok(csw),
                Err(_) => {
                    let _ = state.gateway.clear_halt(EndpointKind::In);
                    Err(RetryDecision::Retry(Error::InvalidCsw {
                        reason: "malformed CSW body",
                        phase,
                        tag,
                        elapsed_in_phase: elapsed,
                        attempt,
                    }))
                }
            },
            Ok(_) => {
                let _ = state.gateway.clear_halt(EndpointKind::In);
                Err(RetryDecision::Retry(Error::InvalidCsw {
                    reason: "wrong CSW length",
                    phase,
                    tag,
                    elapsed_in_phase: elapsed,
                    attempt,
                }))
            }
            Err(GatewayError::PipeStall) => {
                let _ = state.gateway.clear_halt(EndpointKind::In);
                Err(RetryDecision::Retry(Error::PipeStall { phase, tag, elapsed_in_phase: elapsed, attempt }))
            }
            Err(GatewayError::Timeout) => {
                Err(RetryDecision::Fatal(Error::Timeout { phase, tag, elapsed_in_phase: elapsed, attempt }))
            }
            Err(GatewayError::ResourceBusy) => {
                Err(RetryDecision::Retry(Error::ResourceBusy { phase, tag, elapsed_in_phase: elapsed, attempt }))
            }
            Err(GatewayError::DeviceGone) => {
                Err(RetryDecision::Fatal(Error::DeviceGone { phase, tag, elapsed_in_phase: elapsed, attempt }))
            }
        }
    }

    fn recover_from_stall(&self, state: &mut TransportState, policy: &crate::policy::PhasePolicy, attempt: u32) {
        match policy.stall_recovery {
            StallRecovery::Never => {}
            StallRecovery::ClearHalts => {
                let _ = state.gateway.clear_halt(EndpointKind::Out);
                let _ = state.gateway.clear_halt(EndpointKind::In);
            }
            StallRecovery::ClearThenReset => {
                if attempt == 0 {
                    let _ = state.gateway.clear_halt(EndpointKind::Out);
                    let _ = state.gateway.clear_halt(EndpointKind::In);
                } else {
                    let _ = state.gateway.reset_device();
                    state.tag_monitor.reset();
                    state.lifecycle.force_unknown(Instant::now());
                }
            }
        }
    }

    fn reconnect(&self) -> Result<(), Error> {
        let (vendor, product) = {
            let state = self.inner.state.lock().unwrap();
            (state.vendor, state.product)
        };
        let gateway = RusbGateway::open(vendor, product).map_err(|_| Error::DeviceGone {
            phase: Phase::Disconnected,
            tag: 0,
            elapsed_in_phase: Duration::ZERO,
            attempt: 0,
        })?;

        let mut state = self.inner.state.lock().unwrap();
        state.gateway = Box::new(gateway);
        state.tag_monitor.reset();
        state.lifecycle.force_unknown(Instant::now());
        state.poisoned = false;
        Ok(())
    }

    fn maybe_start_keepalive(&self, state: &TransportState) {
        if !self.inner.config.auto_keepalive {
            return;
        }
        if state.lifecycle.phase() == Phase::Unknown || state.lifecycle.phase() == Phase::Animation {
            return;
        }
        let mut slot = self.inner.keepalive.lock().unwrap();
        if slot.is_some() {
            return;
        }
        *slot = Some(spawn_keepalive(self, self.inner.config.keepalive_interval));
    }
}

/// `Retry` carries the error that prompted the retry, so that when the
/// phase's retry budget is exhausted the caller sees the real cause
/// (PipeStall, ResourceBusy, TagMismatch, ...) instead of a generic timeout.
enum RetryDecision {
    Retry(Error),
    Fatal(Error),
}

fn check_cancelled(options: &ExecuteOptions, phase: Phase, tag: u32, attempt: u32) -> Option<Error> {
    match &options.cancel {
        Some(token) if token.is_cancelled() => Some(Error::Cancelled {
            phase,
            tag,
            elapsed_in_phase: Duration::ZERO,
            attempt,
        }),
        _ => None,
    }
}

fn spawn_keepalive(transport: &Transport, interval: Duration) -> KeepAliveHandle {
    let weak = Arc::downgrade(&transport.inner);
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();

    let join = thread::Builder::new()
        .name("usbh-tft-keepalive".into())
        .spawn(move || loop {
            match cancel_rx.recv_timeout(interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }

            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => break,
            };
            let transport = Transport { inner };

            if !transport.time_since_last_csw_at_least(Duration::from_secs(3)) {
                continue;
            }

            if let Err(e) = transport.execute(
                &TestUnitReadyCommand,
                DataRequest::None,
                ExecuteOptions::default(),
            ) {
                // Keep-alive failures are logged but never propagated to
                // other callers (§7); they still influence the lifecycle
                // machine through the normal execute() path above.
                log::warn!("keep-alive probe failed: {e}");
            }
        })
        .expect("failed to spawn keep-alive thread");

    KeepAliveHandle { cancel_tx, join: Some(join) }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(mut handle) = self.keepalive.lock().unwrap().take() {
            handle.cancel_and_join();
        }
    }
}
