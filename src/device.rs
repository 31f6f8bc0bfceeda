//! Helios device session
//!
//! This module provides the `HeliosDevice` struct, which owns one opened DAC
//! and implements the frame/status protocol on top of a `Transport`.
//!
//! Two locks are involved. The request lock serializes wire exchanges so a
//! command and its reply are never interleaved with another caller's. The
//! state lock guards every shared field and is also taken by the status
//! worker and by non-blocking frame transfers when they deliver results.
//! Lock order is always request, then state.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::completion::TransferCell;
use crate::config::DeviceConfig;
use crate::constants::{
    frame_transfer_timeout, DRAIN_MAX_PACKETS, DRAIN_TIMEOUT, EP_BULK_OUT, EP_INT_IN, EP_INT_OUT,
    HELIOS_SDK_VERSION, REPLY_SIZE,
};
use crate::error::{HeliosError, Result};
use crate::frame::{Frame, FrameFlags};
use crate::structures::{Command, DeviceName, DeviceStatus, Reply};
use crate::transport::{Transport, UsbTransport};
use crate::worker::{StatusChannelStats, StatusWorker};

/// Session fields shared with the status worker and frame transfers
#[derive(Debug, Default)]
struct SessionState {
    name: DeviceName,
    firmware_version: u32,
    transfer: TransferCell,
    /// Most recent reply captured by the status worker
    reply: Option<Reply>,
    stats: StatusChannelStats,
    /// Set by a firmware erase; the device is gone
    invalidated: bool,
}

/// Session internals reachable from background threads
pub(crate) struct Shared<T> {
    pub(crate) transport: T,
    pub(crate) config: DeviceConfig,
    state: Mutex<SessionState>,
    replies: Condvar,
}

impl<T: Transport> Shared<T> {
    fn new(transport: T, config: DeviceConfig) -> Self {
        Self {
            transport,
            config,
            state: Mutex::new(SessionState::default()),
            replies: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status_posted(&self) {
        self.lock_state().stats.posted += 1;
    }

    pub(crate) fn status_failed(&self) {
        self.lock_state().stats.failures += 1;
    }

    pub(crate) fn deliver_reply(&self, packet: &[u8]) {
        let mut state = self.lock_state();
        state.stats.replies += 1;
        match Reply::unpack(packet) {
            Some(reply) => {
                log::trace!("status reply 0x{:02x}", reply.opcode());
                state.reply = Some(reply);
                self.replies.notify_all();
            }
            None => log::debug!("ignoring short status packet ({} bytes)", packet.len()),
        }
    }

    /// Record the outcome of a frame transfer
    ///
    /// The cached reply is left alone: a query may be waiting on it, and
    /// every query clears the slot before it sends.
    fn complete_transfer(&self, outcome: rusb::Result<usize>) {
        let mut state = self.lock_state();
        if !state.transfer.complete(outcome) {
            log::debug!("frame completion with no transfer pending");
        }
    }
}

/// Threads and wire ordering owned by the foreground callers
struct Requests {
    transfer_thread: Option<JoinHandle<()>>,
    worker: Option<StatusWorker>,
}

impl Requests {
    /// Wait for the last frame transfer thread to exit
    fn join_transfer(&mut self) {
        if let Some(transfer) = self.transfer_thread.take() {
            if transfer.join().is_err() {
                log::error!("frame transfer thread panicked");
            }
        }
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

/// Helios DAC session
///
/// Owns one opened device. All methods take `&self` and may be called from
/// several threads; calls are serialized per device.
///
/// # Example
///
/// ```no_run
/// use helios_dac::{DeviceStatus, Frame, HeliosDac, Point};
///
/// let mut dac = HeliosDac::new()?;
/// if dac.open_devices()? == 0 {
///     println!("No Helios DAC found");
///     return Ok(());
/// }
///
/// let device = dac.device(0)?;
/// let points = vec![Point::new(0, 0, 255, 0, 0, 255), Point::new(4095, 4095, 0, 0, 255, 255)];
/// let frame = Frame::new(30000, points);
///
/// while device.get_status()? != DeviceStatus::Ready {}
/// device.write_frame(&frame)?;
/// # Ok::<(), helios_dac::HeliosError>(())
/// ```
pub struct HeliosDevice<T: Transport = UsbTransport> {
    shared: Option<Arc<Shared<T>>>,
    requests: Mutex<Requests>,
}

impl<T: Transport> HeliosDevice<T> {
    /// Start a session on an opened transport
    ///
    /// Drains stale replies, starts the status worker, caches the firmware
    /// version, announces the SDK version and caches the device name.
    pub fn open(transport: T, config: DeviceConfig) -> Result<Self> {
        let mut buf = [0u8; REPLY_SIZE];
        for _ in 0..DRAIN_MAX_PACKETS {
            if transport
                .read_interrupt(EP_INT_IN, &mut buf, DRAIN_TIMEOUT)
                .is_err()
            {
                break;
            }
        }

        let shared = Arc::new(Shared::new(transport, config));
        let worker = StatusWorker::spawn(Arc::clone(&shared))?;
        let device = Self {
            shared: Some(shared),
            requests: Mutex::new(Requests {
                transfer_thread: None,
                worker: Some(worker),
            }),
        };

        let mut attempts = config.open_attempts.max(1);
        let version = loop {
            attempts -= 1;
            match device.refresh_firmware_version() {
                Ok(version) => break version,
                Err(e) if attempts > 0 => log::debug!("firmware version query failed: {}", e),
                Err(e) => return Err(e),
            }
        };

        if let Err(e) = device.send_command(&Command::SdkVersion(HELIOS_SDK_VERSION)) {
            log::warn!("failed to announce SDK version: {}", e);
        }

        let name = match device.get_name() {
            Ok(name) => name,
            Err(e) => {
                log::warn!("failed to read device name: {}", e);
                DeviceName::default()
            }
        };

        log::info!("opened Helios DAC '{}' (firmware {})", name, version);
        Ok(device)
    }

    fn shared(&self) -> Result<&Arc<Shared<T>>> {
        self.shared.as_ref().ok_or(HeliosError::DeviceClosed)
    }

    fn lock_requests(&self) -> MutexGuard<'_, Requests> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the request lock on a live session
    fn begin(&self) -> Result<(MutexGuard<'_, Requests>, &Arc<Shared<T>>)> {
        let requests = self.lock_requests();
        let shared = self.shared()?;
        if shared.lock_state().invalidated {
            return Err(HeliosError::DeviceClosed);
        }
        Ok((requests, shared))
    }

    /// Send a command packet; caller holds the request lock
    fn send(shared: &Shared<T>, command: &Command) -> Result<()> {
        let packet = command.pack();
        shared
            .transport
            .write_interrupt(EP_INT_OUT, &packet, shared.config.command_timeout)
            .map_err(HeliosError::CommandTransfer)?;
        log::debug!("sent command 0x{:02x}", command.opcode());
        Ok(())
    }

    /// Send a query and wait for its reply; caller holds the request lock
    fn query(shared: &Shared<T>, command: &Command) -> Result<Reply> {
        let opcode = command.opcode();
        let expected = command
            .reply_opcode()
            .ok_or(HeliosError::InvalidReply { opcode })?;

        shared.lock_state().reply = None;
        Self::send(shared, command)?;

        let state = shared.lock_state();
        let (mut state, _) = shared
            .replies
            .wait_timeout_while(state, shared.config.reply_timeout, |s| {
                !matches!(&s.reply, Some(reply) if reply.opcode() == expected)
            })
            .unwrap_or_else(PoisonError::into_inner);

        match state.reply.take() {
            Some(reply) if reply.opcode() == expected => Ok(reply),
            _ => Err(HeliosError::NoReply { opcode }),
        }
    }

    fn send_command(&self, command: &Command) -> Result<()> {
        let (_requests, shared) = self.begin()?;
        Self::send(shared, command)
    }

    /// Write a frame to the device
    ///
    /// Without `FrameFlags::NON_BLOCKING` this returns once the bulk transfer
    /// has completed. With it, the transfer runs in the background and its
    /// outcome is reported by the next `get_status` or `write_frame`; a
    /// failed background transfer is returned as `FrameTransfer` by that call.
    ///
    /// Poll `get_status` until it reports `Ready` before each write.
    pub fn write_frame(&self, frame: &Frame) -> Result<()> {
        let data = frame.encode_for_transfer()?;
        let (mut requests, shared) = self.begin()?;

        {
            let mut state = shared.lock_state();
            if state.transfer.take_failure()? {
                return Err(HeliosError::FrameInFlight);
            }
            state.transfer.begin()?;
            state.reply = None;
        }

        requests.join_transfer();

        let timeout = frame_transfer_timeout(data.len());
        let expected = data.len();
        log::debug!(
            "writing frame: {} bytes, {} pps, flags 0x{:02x}",
            expected,
            frame.rate,
            frame.flags.bits()
        );

        if frame.flags.contains(FrameFlags::NON_BLOCKING) {
            let background = Arc::clone(shared);
            let spawned = thread::Builder::new()
                .name("helios-frame".into())
                .spawn(move || {
                    let outcome = background.transport.write_bulk(EP_BULK_OUT, &data, timeout);
                    background.complete_transfer(check_written(outcome, expected));
                });
            return match spawned {
                Ok(handle) => {
                    requests.transfer_thread = Some(handle);
                    Ok(())
                }
                Err(e) => {
                    shared.complete_transfer(Err(rusb::Error::Other));
                    shared.lock_state().transfer.take();
                    Err(HeliosError::Spawn(e))
                }
            };
        }

        let outcome = shared.transport.write_bulk(EP_BULK_OUT, &data, timeout);
        shared.complete_transfer(check_written(outcome, expected));
        shared.lock_state().transfer.take_failure().map(|_| ())
    }

    /// Check whether the device can accept a frame
    ///
    /// Reports `NotReady` while a non-blocking transfer is still running.
    /// `NotReady` is the normal answer while the device buffer is full;
    /// callers poll until `Ready`.
    pub fn get_status(&self) -> Result<DeviceStatus> {
        let (_requests, shared) = self.begin()?;

        if shared.lock_state().transfer.take_failure()? {
            return Ok(DeviceStatus::NotReady);
        }

        match Self::query(shared, &Command::GetStatus)? {
            Reply::Status(status) => Ok(status),
            reply => Err(HeliosError::InvalidReply {
                opcode: reply.opcode(),
            }),
        }
    }

    /// Firmware version cached at open
    pub fn get_firmware_version(&self) -> Result<u32> {
        Ok(self.shared()?.lock_state().firmware_version)
    }

    /// Query the firmware version again and update the cache
    pub fn refresh_firmware_version(&self) -> Result<u32> {
        let (_requests, shared) = self.begin()?;
        match Self::query(shared, &Command::GetFirmwareVersion)? {
            Reply::FirmwareVersion(version) => {
                shared.lock_state().firmware_version = version;
                Ok(version)
            }
            reply => Err(HeliosError::InvalidReply {
                opcode: reply.opcode(),
            }),
        }
    }

    /// Read the name stored on the device
    pub fn get_name(&self) -> Result<DeviceName> {
        let (_requests, shared) = self.begin()?;
        match Self::query(shared, &Command::GetName)? {
            Reply::Name(name) => {
                shared.lock_state().name = name.clone();
                Ok(name)
            }
            reply => Err(HeliosError::InvalidReply {
                opcode: reply.opcode(),
            }),
        }
    }

    /// Name cached at open or by the last `get_name`/`set_name`
    pub fn cached_name(&self) -> Result<DeviceName> {
        Ok(self.shared()?.lock_state().name.clone())
    }

    /// Store a new name on the device
    ///
    /// Names longer than 30 bytes are rejected before anything is sent.
    pub fn set_name(&self, name: impl AsRef<[u8]>) -> Result<()> {
        let name = DeviceName::new(name)?;
        let (_requests, shared) = self.begin()?;
        Self::send(shared, &Command::SetName(name.clone()))?;
        shared.lock_state().name = name;
        Ok(())
    }

    /// Stop output until a new frame is written
    ///
    /// The device does not acknowledge a stop; this blocks for the configured
    /// settle delay so the device has halted when it returns.
    pub fn stop(&self) -> Result<()> {
        let (_requests, shared) = self.begin()?;
        Self::send(shared, &Command::Stop)?;
        shared.lock_state().reply = None;
        thread::sleep(shared.config.stop_settle);
        Ok(())
    }

    /// Set the shutter level
    pub fn set_shutter(&self, level: bool) -> Result<()> {
        self.send_command(&Command::SetShutter(level))
    }

    /// Erase the firmware so it can be replaced through the bootloader
    ///
    /// The device re-enumerates as the bootloader; every later call on this
    /// session fails with `DeviceClosed`. The status worker is stopped here.
    pub fn erase_firmware(&self) -> Result<()> {
        let (mut requests, shared) = self.begin()?;
        Self::send(shared, &Command::EraseFirmware)?;
        shared.lock_state().invalidated = true;
        requests.join_transfer();
        requests.stop_worker();
        log::info!("firmware erased, session invalidated");
        Ok(())
    }

    /// Counters of the status worker
    pub fn status_channel_stats(&self) -> Result<StatusChannelStats> {
        Ok(self.shared()?.lock_state().stats)
    }

    /// Check if the session was closed or invalidated
    pub fn is_closed(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.lock_state().invalidated,
            None => true,
        }
    }

    /// Stop background work and release the device
    ///
    /// Waits for a running frame transfer, stops the status worker after its
    /// posted transfer drains, then drops the transport. Calling it again
    /// does nothing.
    pub fn close(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };

        {
            let mut requests = self.lock_requests();
            requests.join_transfer();
            requests.stop_worker();
        }

        log::info!("closed Helios DAC '{}'", shared.lock_state().name);
        drop(shared);
    }
}

/// A short bulk write is a failed frame transfer
fn check_written(outcome: rusb::Result<usize>, expected: usize) -> rusb::Result<usize> {
    match outcome {
        Ok(written) if written != expected => {
            log::warn!("short frame write: {} of {} bytes", written, expected);
            Err(rusb::Error::Io)
        }
        other => other,
    }
}

impl<T: Transport> std::fmt::Debug for HeliosDevice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.shared {
            Some(shared) => {
                let state = shared.lock_state();
                f.debug_struct("HeliosDevice")
                    .field("name", &state.name.to_string())
                    .field("firmware_version", &state.firmware_version)
                    .field("frame_in_flight", &state.transfer.is_in_flight())
                    .field("invalidated", &state.invalidated)
                    .finish()
            }
            None => f.debug_struct("HeliosDevice").field("closed", &true).finish(),
        }
    }
}

impl<T: Transport> Drop for HeliosDevice<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CMD_GET_FIRMWARE_VERSION, CMD_GET_NAME, CMD_SDK_VERSION, CMD_SET_NAME};
    use crate::frame::Point;
    use crate::testing::{test_config, wait_until, MockDevice};
    use std::time::{Duration, Instant};

    fn open(mock: &MockDevice) -> HeliosDevice<crate::testing::MockTransport> {
        HeliosDevice::open(mock.transport(), test_config()).unwrap()
    }

    fn frame() -> Frame {
        Frame::new(
            30000,
            vec![
                Point::new(0, 0, 255, 0, 0, 255),
                Point::new(2048, 2048, 0, 255, 0, 255),
                Point::new(4095, 0, 0, 0, 255, 255),
            ],
        )
    }

    #[test]
    fn test_open_caches_device_info() {
        let mock = MockDevice::new();
        let device = open(&mock);

        assert_eq!(device.get_firmware_version().unwrap(), 6);
        assert_eq!(device.cached_name().unwrap().as_bytes(), b"Helios Mock");
        mock.with_state(|s| {
            assert_eq!(s.sdk_version, Some(HELIOS_SDK_VERSION));
            assert_eq!(
                s.commands,
                vec![CMD_GET_FIRMWARE_VERSION, CMD_SDK_VERSION, CMD_GET_NAME]
            );
        });
    }

    #[test]
    fn test_open_drains_stale_replies() {
        let mock = MockDevice::new();
        mock.with_state(|s| s.queue_reply(&[0x83, 0]));

        let device = open(&mock);
        assert_eq!(device.get_status().unwrap(), DeviceStatus::Ready);
    }

    #[test]
    fn test_open_fails_without_firmware_reply() {
        let mock = MockDevice::new();
        mock.with_state(|s| s.silent = true);

        let config = test_config().with_reply_timeout(Duration::from_millis(20));
        let result = HeliosDevice::open(mock.transport(), config);

        assert!(matches!(
            result,
            Err(HeliosError::NoReply {
                opcode: CMD_GET_FIRMWARE_VERSION
            })
        ));
        mock.with_state(|s| {
            let queries = s
                .commands
                .iter()
                .filter(|&&op| op == CMD_GET_FIRMWARE_VERSION)
                .count();
            assert_eq!(queries, 2);
        });
        assert_eq!(mock.releases(), 1);
    }

    #[test]
    fn test_get_status() {
        let mock = MockDevice::new();
        let device = open(&mock);

        assert_eq!(device.get_status().unwrap(), DeviceStatus::Ready);
        mock.with_state(|s| s.busy = true);
        assert_eq!(device.get_status().unwrap(), DeviceStatus::NotReady);
    }

    #[test]
    fn test_get_status_without_reply() {
        let mock = MockDevice::new();
        let config = test_config().with_reply_timeout(Duration::from_millis(20));
        let device = HeliosDevice::open(mock.transport(), config).unwrap();

        mock.with_state(|s| s.silent = true);
        let err = device.get_status().unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_blocking_write_waits_for_transfer() {
        let mock = MockDevice::new();
        mock.with_state(|s| s.bulk_delay = Duration::from_millis(50));
        let device = open(&mock);

        let start = Instant::now();
        device.write_frame(&frame()).unwrap();

        assert!(start.elapsed() >= Duration::from_millis(50));
        mock.with_state(|s| {
            assert_eq!(s.completed_bulk, 1);
            assert_eq!(s.frames[0], frame().encode().unwrap());
        });
    }

    #[test]
    fn test_blocking_write_reports_transfer_failure() {
        let mock = MockDevice::new();
        let device = open(&mock);

        mock.with_state(|s| s.bulk_error = Some(rusb::Error::Pipe));
        assert!(matches!(
            device.write_frame(&frame()),
            Err(HeliosError::FrameTransfer(rusb::Error::Pipe))
        ));

        mock.with_state(|s| s.bulk_error = None);
        device.write_frame(&frame()).unwrap();
    }

    #[test]
    fn test_invalid_frame_rejected_before_transfer() {
        let mock = MockDevice::new();
        let device = open(&mock);
        let commands_before = mock.with_state(|s| s.commands.len());

        let slow = Frame::new(3, frame().points);
        assert!(matches!(
            device.write_frame(&slow),
            Err(HeliosError::RateOutOfRange { .. })
        ));
        let huge = Frame::new(30000, vec![Point::default(); 4097]);
        assert!(matches!(
            device.write_frame(&huge),
            Err(HeliosError::TooManyPoints { .. })
        ));

        mock.with_state(|s| {
            assert_eq!(s.bulk_attempts, 0);
            assert_eq!(s.commands.len(), commands_before);
        });
    }

    #[test]
    fn test_non_blocking_write_returns_before_transfer() {
        let mock = MockDevice::new();
        mock.with_state(|s| s.bulk_gate_closed = true);
        let device = open(&mock);

        let non_blocking = frame().with_flags(FrameFlags::NON_BLOCKING);
        device.write_frame(&non_blocking).unwrap();
        assert_eq!(mock.with_state(|s| s.completed_bulk), 0);

        // Session is not locked by the pending transfer
        assert_eq!(device.get_status().unwrap(), DeviceStatus::NotReady);
        assert!(matches!(
            device.write_frame(&non_blocking),
            Err(HeliosError::FrameInFlight)
        ));

        mock.open_gate();
        assert!(wait_until(|| mock.with_state(|s| s.completed_bulk) == 1));
        assert!(wait_until(|| device.get_status().unwrap() == DeviceStatus::Ready));
        assert_eq!(mock.with_state(|s| s.frames.len()), 1);
    }

    #[test]
    fn test_non_blocking_failure_reported_once() {
        let mock = MockDevice::new();
        mock.with_state(|s| s.bulk_error = Some(rusb::Error::Pipe));
        let device = open(&mock);

        device
            .write_frame(&frame().with_flags(FrameFlags::NON_BLOCKING))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let result = loop {
            match device.get_status() {
                Ok(DeviceStatus::NotReady) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(1))
                }
                other => break other,
            }
        };
        assert!(matches!(
            result,
            Err(HeliosError::FrameTransfer(rusb::Error::Pipe))
        ));
        assert_eq!(device.get_status().unwrap(), DeviceStatus::Ready);
    }

    #[test]
    fn test_concurrent_writes_are_serialized() {
        let mock = MockDevice::new();
        mock.with_state(|s| s.bulk_delay = Duration::from_millis(20));
        let device = Arc::new(open(&mock));

        let writers: Vec<_> = (0..2)
            .map(|_| {
                let device = Arc::clone(&device);
                thread::spawn(move || {
                    for _ in 0..5 {
                        device.write_frame(&frame()).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        mock.with_state(|s| {
            assert_eq!(s.max_active_bulk, 1);
            assert_eq!(s.frames.len(), 10);
        });
    }

    #[test]
    fn test_set_and_get_name() {
        let mock = MockDevice::new();
        let device = open(&mock);

        let name = [b'L'; 30];
        device.set_name(name).unwrap();
        assert_eq!(device.get_name().unwrap().as_bytes(), &name[..]);
        assert_eq!(device.cached_name().unwrap().as_bytes(), &name[..]);
    }

    #[test]
    fn test_set_name_too_long_not_sent() {
        let mock = MockDevice::new();
        let device = open(&mock);

        assert!(matches!(
            device.set_name([b'L'; 31]),
            Err(HeliosError::NameTooLong { len: 31, max: 30 })
        ));
        mock.with_state(|s| assert!(!s.commands.contains(&CMD_SET_NAME)));
        assert_eq!(device.get_name().unwrap().as_bytes(), b"Helios Mock");
    }

    #[test]
    fn test_stop_settles_before_ready() {
        let mock = MockDevice::new();
        mock.with_state(|s| {
            s.busy = true;
            s.halt_time = Duration::from_millis(50);
        });
        let device = open(&mock);

        let start = Instant::now();
        device.stop().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(device.get_status().unwrap(), DeviceStatus::Ready);
    }

    #[test]
    fn test_set_shutter() {
        let mock = MockDevice::new();
        let device = open(&mock);

        device.set_shutter(true).unwrap();
        assert_eq!(mock.with_state(|s| s.shutter), Some(true));
        device.set_shutter(false).unwrap();
        assert_eq!(mock.with_state(|s| s.shutter), Some(false));
    }

    #[test]
    fn test_command_transfer_failure() {
        let mock = MockDevice::new();
        let device = open(&mock);

        mock.with_state(|s| s.command_error = Some(rusb::Error::NoDevice));
        assert!(matches!(
            device.set_shutter(true),
            Err(HeliosError::CommandTransfer(rusb::Error::NoDevice))
        ));
    }

    #[test]
    fn test_erase_firmware_invalidates_session() {
        let mock = MockDevice::new();
        let device = open(&mock);

        device.erase_firmware().unwrap();
        assert!(mock.with_state(|s| s.erased));
        assert!(device.is_closed());
        assert!(matches!(device.get_status(), Err(HeliosError::DeviceClosed)));
        assert!(matches!(
            device.write_frame(&frame()),
            Err(HeliosError::DeviceClosed)
        ));

        // Status worker is stopped with the session
        let posted = device.status_channel_stats().unwrap().posted;
        thread::sleep(Duration::from_millis(50));
        assert_eq!(device.status_channel_stats().unwrap().posted, posted);
    }

    #[test]
    fn test_query_reply_survives_frame_completion() {
        let mock = MockDevice::new();
        let device = open(&mock);
        mock.with_state(|s| {
            s.bulk_gate_closed = true;
            s.bulk_delay = Duration::from_millis(10);
            s.gate_opened_by = Some(CMD_GET_NAME);
            s.command_delay = Duration::from_millis(50);
        });

        // The frame completes between the name reply and the query wakeup
        device
            .write_frame(&frame().with_flags(FrameFlags::NON_BLOCKING))
            .unwrap();
        let name = device.get_name().unwrap();
        assert_eq!(name.as_bytes(), b"Helios Mock");
        assert!(wait_until(|| mock.with_state(|s| s.completed_bulk) == 1));
    }

    #[test]
    fn test_close_after_panicked_transfer() {
        let mock = MockDevice::new();
        let mut device = open(&mock);
        mock.with_state(|s| s.bulk_panic = true);

        device
            .write_frame(&frame().with_flags(FrameFlags::NON_BLOCKING))
            .unwrap();
        device.close();

        assert!(device.is_closed());
        assert_eq!(mock.releases(), 1);
        assert_eq!(mock.with_state(|s| s.completed_bulk), 0);
    }

    #[test]
    fn test_firmware_version_cached_until_refresh() {
        let mock = MockDevice::new();
        let device = open(&mock);

        mock.with_state(|s| s.firmware_version = 7);
        assert_eq!(device.get_firmware_version().unwrap(), 6);
        assert_eq!(device.refresh_firmware_version().unwrap(), 7);
        assert_eq!(device.get_firmware_version().unwrap(), 7);
    }

    #[test]
    fn test_status_channel_survives_failures() {
        let mock = MockDevice::new();
        let device = open(&mock);
        let before = device.status_channel_stats().unwrap();

        mock.with_state(|s| s.fail_interrupt_reads = 5);
        assert!(wait_until(|| {
            let stats = device.status_channel_stats().unwrap();
            stats.failures >= before.failures + 5 && stats.posted > before.posted + 5
        }));

        assert_eq!(device.get_status().unwrap(), DeviceStatus::Ready);
    }

    #[test]
    fn test_close_releases_once() {
        let mock = MockDevice::new();
        let mut device = open(&mock);

        device.close();
        assert_eq!(mock.releases(), 1);
        assert!(device.is_closed());
        assert!(matches!(device.get_status(), Err(HeliosError::DeviceClosed)));

        device.close();
        drop(device);
        assert_eq!(mock.releases(), 1);
    }

    #[test]
    fn test_close_waits_for_background_transfer() {
        let mock = MockDevice::new();
        mock.with_state(|s| s.bulk_delay = Duration::from_millis(30));
        let mut device = open(&mock);

        device
            .write_frame(&frame().with_flags(FrameFlags::NON_BLOCKING))
            .unwrap();
        device.close();

        assert_eq!(mock.with_state(|s| s.completed_bulk), 1);
        assert_eq!(mock.releases(), 1);
    }
}
