//! Simulated Helios device for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::DeviceConfig;
use crate::constants::{
    CMD_ERASE_FIRMWARE, CMD_GET_FIRMWARE_VERSION, CMD_GET_NAME, CMD_GET_STATUS, CMD_SDK_VERSION,
    CMD_SET_NAME, CMD_SET_SHUTTER, CMD_STOP, EP_BULK_OUT, EP_INT_IN, EP_INT_OUT, NAME_MAX_LEN,
    REPLY_FLAG, REPLY_SIZE,
};
use crate::transport::Transport;

/// Config with generous reply timeouts and a fast status worker
pub(crate) fn test_config() -> DeviceConfig {
    DeviceConfig::default()
        .with_reply_timeout(Duration::from_secs(1))
        .with_status_poll_interval(Duration::from_millis(5))
        .with_status_error_backoff(Duration::from_millis(1))
}

/// Poll `condition` for up to five seconds
pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Firmware-side state of the simulated device
pub(crate) struct MockState {
    pub name: Vec<u8>,
    pub firmware_version: u32,
    /// Frame buffer full
    pub busy: bool,
    /// How long output takes to halt after a stop command
    pub halt_time: Duration,
    pub halting_until: Option<Instant>,
    pub shutter: Option<bool>,
    pub sdk_version: Option<u8>,
    pub erased: bool,
    /// Do not answer queries
    pub silent: bool,
    /// Opcodes of every command received
    pub commands: Vec<u8>,
    pub replies: VecDeque<Vec<u8>>,
    pub frames: Vec<Vec<u8>>,
    pub bulk_delay: Duration,
    pub bulk_gate_closed: bool,
    pub bulk_error: Option<rusb::Error>,
    /// Panic inside the bulk write, as a broken transport would
    pub bulk_panic: bool,
    pub command_error: Option<rusb::Error>,
    /// Command opcode that opens the bulk gate when received
    pub gate_opened_by: Option<u8>,
    /// How long a command write blocks after the device has handled it
    pub command_delay: Duration,
    pub bulk_attempts: usize,
    pub completed_bulk: usize,
    pub active_bulk: usize,
    pub max_active_bulk: usize,
    pub fail_interrupt_reads: usize,
}

impl MockState {
    pub fn queue_reply(&mut self, payload: &[u8]) {
        let mut packet = vec![0u8; REPLY_SIZE];
        packet[..payload.len()].copy_from_slice(payload);
        self.replies.push_back(packet);
    }

    fn ready(&self) -> bool {
        !self.busy && self.halting_until.map_or(true, |t| Instant::now() >= t)
    }

    fn handle_command(&mut self, packet: &[u8]) {
        let opcode = packet[0];
        self.commands.push(opcode);

        match opcode {
            CMD_GET_STATUS if !self.silent => {
                let ready = self.ready() as u8;
                self.queue_reply(&[CMD_GET_STATUS | REPLY_FLAG, ready]);
            }
            CMD_GET_FIRMWARE_VERSION if !self.silent => {
                let mut reply = vec![CMD_GET_FIRMWARE_VERSION | REPLY_FLAG];
                reply.extend_from_slice(&self.firmware_version.to_le_bytes());
                self.queue_reply(&reply);
            }
            CMD_GET_NAME if !self.silent => {
                let mut reply = vec![CMD_GET_NAME | REPLY_FLAG];
                reply.extend_from_slice(&self.name);
                self.queue_reply(&reply);
            }
            CMD_SET_NAME => {
                let field = &packet[1..packet.len().min(1 + NAME_MAX_LEN)];
                let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
                self.name = field[..len].to_vec();
            }
            CMD_STOP => {
                self.busy = false;
                self.halting_until = Some(Instant::now() + self.halt_time);
            }
            CMD_SET_SHUTTER => self.shutter = Some(packet[1] != 0),
            CMD_SDK_VERSION => self.sdk_version = Some(packet[1]),
            CMD_ERASE_FIRMWARE => self.erased = true,
            _ => {}
        }
    }
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            name: b"Helios Mock".to_vec(),
            firmware_version: 6,
            busy: false,
            halt_time: Duration::ZERO,
            halting_until: None,
            shutter: None,
            sdk_version: None,
            erased: false,
            silent: false,
            commands: Vec::new(),
            replies: VecDeque::new(),
            frames: Vec::new(),
            bulk_delay: Duration::ZERO,
            bulk_gate_closed: false,
            bulk_error: None,
            bulk_panic: false,
            command_error: None,
            gate_opened_by: None,
            command_delay: Duration::ZERO,
            bulk_attempts: 0,
            completed_bulk: 0,
            active_bulk: 0,
            max_active_bulk: 0,
            fail_interrupt_reads: 0,
        }
    }
}

struct MockInner {
    state: Mutex<MockState>,
    changed: Condvar,
    releases: AtomicUsize,
}

impl MockInner {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

/// Test-side handle to a simulated device
#[derive(Clone)]
pub(crate) struct MockDevice {
    inner: Arc<MockInner>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState::default()),
                changed: Condvar::new(),
                releases: AtomicUsize::new(0),
            }),
        }
    }

    /// A transport to the device; dropping it counts as a release
    pub fn transport(&self) -> MockTransport {
        MockTransport {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let result = f(&mut *self.inner.lock());
        self.inner.changed.notify_all();
        result
    }

    pub fn open_gate(&self) {
        self.with_state(|s| s.bulk_gate_closed = false);
    }

    /// How many transports to this device were dropped
    pub fn releases(&self) -> usize {
        self.inner.releases.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockTransport {
    inner: Arc<MockInner>,
}

impl Transport for MockTransport {
    fn write_bulk(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        assert_eq!(endpoint, EP_BULK_OUT);
        if self.inner.lock().bulk_panic {
            panic!("bulk transfer panicked");
        }
        let delay = {
            let mut state = self.inner.lock();
            state.bulk_attempts += 1;
            state.active_bulk += 1;
            state.max_active_bulk = state.max_active_bulk.max(state.active_bulk);
            let (state, _) = self
                .inner
                .changed
                .wait_timeout_while(state, Duration::from_secs(5), |s| s.bulk_gate_closed)
                .unwrap();
            state.bulk_delay
        };

        thread::sleep(delay);

        let mut state = self.inner.lock();
        state.active_bulk -= 1;
        if let Some(e) = state.bulk_error {
            return Err(e);
        }
        state.frames.push(data.to_vec());
        state.completed_bulk += 1;
        Ok(data.len())
    }

    fn write_interrupt(
        &self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        assert_eq!(endpoint, EP_INT_OUT);
        let mut state = self.inner.lock();
        if let Some(e) = state.command_error {
            return Err(e);
        }
        state.handle_command(data);
        if state.gate_opened_by == Some(data[0]) {
            state.bulk_gate_closed = false;
        }
        let delay = state.command_delay;
        drop(state);
        self.inner.changed.notify_all();

        thread::sleep(delay);
        Ok(data.len())
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        assert_eq!(endpoint, EP_INT_IN);
        let mut state = self.inner.lock();
        if state.fail_interrupt_reads > 0 {
            state.fail_interrupt_reads -= 1;
            return Err(rusb::Error::Io);
        }

        let (mut state, _) = self
            .inner
            .changed
            .wait_timeout_while(state, timeout, |s| s.replies.is_empty())
            .unwrap();
        match state.replies.pop_front() {
            Some(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            None => Err(rusb::Error::Timeout),
        }
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.inner.releases.fetch_add(1, Ordering::SeqCst);
    }
}
