//! The readout session with one meter.
//!
//! [`Session::tick`] is called periodically by the host and never blocks.
//! Delays are stored as a start timestamp plus a period and checked on the
//! following ticks. All state survives between ticks in the session itself.

use super::frame::{FrameDetector, OutFrame, RECEIVE_BUDGET};
use super::negotiation::{self, ProtocolMode};
use super::obis_parser;
use super::sensors::SensorRegistry;
use super::structs::{SessionEvent, State};
use super::transport::Transport;
use super::utils::{self, format_hex_ascii_pretty, ACK, CR, ETX, LF, SOH, STX};
use log::{debug, error, info, trace, warn};
use std::time::{Duration, Instant};

/// Values requested in modes B and C unless the config lists its own
pub const DEFAULT_OBIS_CODES: [&str; 13] = [
    "0F0880FF", // Active energy totals
    "100700FF", // Current power total
    "240700FF", // Current power phase 1
    "380700FF", // Current power phase 2
    "4C0700FF", // Current power phase 3
    "600900FF", // Temperature
    "200700FF", // Voltage phase 1
    "340700FF", // Voltage phase 2
    "480700FF", // Voltage phase 3
    "1F0700FF", // Current phase 1
    "330700FF", // Current phase 2
    "470700FF", // Current phase 3
    "0D07FFFF", // Active power coefficient
];

pub const DEFAULT_PASSWORD: &str = "00000000";

const FIRST_READOUT_DELAY: Duration = Duration::from_secs(15);
/// The option select message has to leave the UART before the baud rate changes
const BAUD_RATE_SETTLE_DELAY: Duration = Duration::from_millis(250);
/// ~1.6s quiet time plus ~2.24s to transmit the NULs
const BATTERY_WAKEUP_DELAY: Duration = Duration::from_millis(1600 + 2240);
const INITIAL_BAUD_RATE: u32 = 300;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// `None` disables periodic readouts, only a trigger starts one
    pub update_interval: Option<Duration>,
    pub connection_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub battery_meter: bool,
    pub force_mode_d: bool,
    /// 0 means not limited
    pub baud_rate_max: u32,
    pub password: String,
    pub obis_codes: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            update_interval: Some(Duration::from_secs(60)),
            connection_timeout: Duration::from_millis(3000),
            max_retries: 2,
            retry_delay: Duration::from_millis(15000),
            battery_meter: false,
            force_mode_d: false,
            baud_rate_max: 0,
            password: DEFAULT_PASSWORD.to_string(),
            obis_codes: DEFAULT_OBIS_CODES.iter().map(|c| c.to_string()).collect(),
        }
    }
}

pub struct Session<T: Transport> {
    settings: SessionSettings,
    transport: T,
    sensors: SensorRegistry,
    detector: FrameDetector,
    out: OutFrame,

    state: State,
    reported_state: Option<State>,
    mode: ProtocolMode,
    baud_rate_identification: u8,
    baud_rate_char: u8,
    new_baud_rate: u32,
    meter_identification: String,
    retry_counter: u32,

    scheduled_connection_start: Option<Instant>,
    retry_connection_start: Instant,
    last_transmission_from_meter: Instant,

    wait_start: Instant,
    wait_period: Duration,
    wait_next_state: State,

    current_obis_index: usize,
    update_index: usize,
    mode_d_empty_frame_received: bool,

    events: Vec<SessionEvent>,
}

impl<T: Transport> Session<T> {
    pub fn new(settings: SessionSettings, transport: T, sensors: SensorRegistry, now: Instant) -> Self {
        Session {
            settings,
            transport,
            sensors,
            detector: FrameDetector::new(),
            out: OutFrame::new(),
            state: State::InfiniteWait,
            reported_state: None,
            mode: ProtocolMode::ModeA,
            baud_rate_identification: 0,
            baud_rate_char: 0,
            new_baud_rate: INITIAL_BAUD_RATE,
            meter_identification: String::new(),
            retry_counter: 0,
            scheduled_connection_start: None,
            retry_connection_start: now,
            last_transmission_from_meter: now,
            wait_start: now,
            wait_period: Duration::ZERO,
            wait_next_state: State::InfiniteWait,
            current_obis_index: 0,
            update_index: 0,
            mode_d_empty_frame_received: false,
            events: Vec::new(),
        }
    }

    /// Brings the session into its first state.
    pub fn setup(&mut self, now: Instant) {
        self.last_transmission_from_meter = now;
        self.clear_input_buffer();

        if self.settings.force_mode_d {
            info!("Mode D. Continuously reading data");
            self.set_next_state(State::ModeDWait);
        } else if self.is_periodic_readout_enabled() {
            self.wait(now, FIRST_READOUT_DELAY, State::Begin);
        } else {
            info!("No periodic readouts (update_interval=never). Only a trigger can start a readout.");
            self.set_next_state(State::InfiniteWait);
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mode(&self) -> ProtocolMode {
        self.mode
    }

    pub fn meter_identification(&self) -> &str {
        &self.meter_identification
    }

    pub fn sensors(&self) -> &SensorRegistry {
        &self.sensors
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Hands out everything that happened since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Starts a readout now. Only honored while the session is idle.
    pub fn trigger_readout(&mut self) -> bool {
        if self.settings.force_mode_d {
            debug!("Triggering readout in Mode D is not possible.");
            return false;
        }

        if !self.state.is_wait_state() {
            debug!("Readout in progress. Ignoring trigger.");
            return false;
        }

        debug!("Triggering readout");
        self.set_next_state(State::Begin);
        true
    }

    pub fn tick(&mut self, now: Instant) {
        if !self.state.is_wait_state()
            && now.saturating_duration_since(self.last_transmission_from_meter) >= self.settings.connection_timeout
        {
            error!("No transmission from meter.");
            self.connection_status(false);
            self.retry_or_sleep(now);
            return;
        }

        self.report_state();

        match self.state {
            State::InfiniteWait => {
                // only a trigger can set another state
                self.last_transmission_from_meter = now;
            }

            State::Wait => {
                if now.saturating_duration_since(self.wait_start) >= self.wait_period {
                    self.state = self.wait_next_state;
                }
                self.last_transmission_from_meter = now;
            }

            State::ModeDWait => self.handle_mode_d_wait(now),
            State::ModeDReadout => self.handle_mode_d_readout(now),

            State::Begin => {
                self.current_obis_index = 0;
                self.sensors.reset_all();
                self.update_connection_start(now);
                self.connection_status(true);

                if self.settings.battery_meter {
                    self.set_next_state(State::BatteryWakeup);
                } else {
                    self.set_next_state(State::SendRequest);
                }
                // every session starts with 300 bps
                self.update_baud_rate(INITIAL_BAUD_RATE);
                self.last_transmission_from_meter = now;
            }

            State::BatteryWakeup => {
                debug!("Battery meter wakeup sequence");
                self.out.build_battery_wakeup();
                self.send_frame();
                self.wait(now, BATTERY_WAKEUP_DELAY, State::SendRequest);
            }

            State::SendRequest => {
                // remove garbage including NULs of the wakeup sequence
                self.clear_input_buffer();
                self.out.build_id_request();
                self.send_frame();
                self.set_next_state(State::GetIdentification);
            }

            State::GetIdentification => self.handle_identification(now),
            State::PrepareAck => self.handle_prepare_ack(now),

            State::SetBaudRate => {
                debug!("Switching to new baud rate {} bps ('{}')", self.new_baud_rate, self.baud_rate_char as char);
                self.update_baud_rate(self.new_baud_rate);
                self.set_next_state(State::WaitForPpp);
            }

            State::WaitForPpp => {
                if let Some(first) = self.receive_first_byte(now) {
                    if first == SOH {
                        debug!("Meter asks for password");
                        self.set_next_state(State::WaitForPppReadData);
                    } else {
                        debug!("No password request. Got 0x{:02x}", first);
                        self.retry_or_sleep(now);
                    }
                }
            }

            State::WaitForPppReadData => {
                if let Some(first) = self.receive_first_byte(now) {
                    if first == b'(' {
                        debug!("Meter asks for password (data)");
                        self.set_next_state(State::SendPassword);
                    } else {
                        debug!("No password data. Got 0x{:02x}", first);
                        self.retry_or_sleep(now);
                    }
                }
            }

            State::SendPassword => {
                if let Err(e) = self.out.build_password(&self.settings.password) {
                    error!("Unable to build password frame: {e}");
                    self.retry_or_sleep(now);
                    return;
                }
                self.send_frame();
                self.set_next_state(State::WaitForAck);
            }

            State::WaitForAck => {
                if let Some(first) = self.receive_first_byte(now) {
                    if first == ACK {
                        debug!("Meter accepted password");
                        self.retry_counter = 0;
                        self.set_next_state(State::AskForEnergy);
                    } else {
                        // no retry here, the connection timeout ends the session
                        warn!("Meter rejected password. Got 0x{:02x}", first);
                    }
                }
            }

            State::WaitForStx2 => {
                if let Some(first) = self.receive_first_byte(now) {
                    if first == STX {
                        debug!("Meter started readout transmission");
                        self.set_next_state(State::Readout2);
                    } else {
                        debug!("No STX. Got 0x{:02x}", first);
                        self.retry_or_sleep(now);
                    }
                }
            }

            State::Readout2 => {
                if self.receive(now) > 0 {
                    self.set_next_state(State::AskForEnergy);
                }
            }

            State::AskForEnergy => {
                let obis = match self.settings.obis_codes.get(self.current_obis_index) {
                    Some(obis) => obis.clone(),
                    None => {
                        self.finish_readout(now);
                        return;
                    }
                };

                if let Err(e) = self.out.build_readout_command(&obis) {
                    error!("Unable to build readout command for OBIS '{obis}': {e}");
                    self.retry_or_sleep(now);
                    return;
                }
                debug!("Requesting OBIS '{obis}'");
                self.send_frame();
                self.set_next_state(State::WaitForStx);
            }

            State::WaitForStx => {
                if let Some(first) = self.receive_first_byte(now) {
                    if first == STX {
                        debug!("Meter started readout transmission");
                        self.set_next_state(State::Readout);
                    } else {
                        debug!("No STX. Got 0x{:02x}", first);
                        self.retry_or_sleep(now);
                    }
                }
            }

            State::Readout => self.handle_readout(now),

            State::UpdateStates => {
                match self.sensors.get(self.update_index) {
                    Some(sensor) => {
                        if let Some(value) = sensor.value() {
                            self.events.push(SessionEvent::SensorState {
                                name: sensor.name.clone(),
                                obis: sensor.obis.clone(),
                                value: value.clone(),
                            });
                        }
                        self.update_index += 1;
                    }
                    None => {
                        debug!("End of sensor update");
                        self.wait_next_readout(now);
                    }
                }
            }
        }
    }

    fn handle_mode_d_wait(&mut self, now: Instant) {
        let size = self.receive(now);
        if size == 0 {
            return;
        }

        let id = match utils::find_identification(self.detector.frame(size)) {
            Some(id) => id.to_vec(),
            None => return,
        };

        self.parse_id(&id);
        self.sensors.reset_all();
        self.set_next_state(State::ModeDReadout);
        self.last_transmission_from_meter = now;
        self.retry_connection_start = now;
        self.connection_status(true);
        self.mode_d_empty_frame_received = false;
    }

    fn handle_mode_d_readout(&mut self, now: Instant) {
        let size = self.receive(now);
        if size == 0 {
            return;
        }

        let frame = self.detector.frame(size).to_vec();
        if frame[0] == b'!' {
            // end of data
            self.finish_readout(now);
            return;
        }

        let line = strip_line_end(&frame);

        // in mode D an empty line is sent after the identification, ignore only one
        if line.is_empty() && !self.mode_d_empty_frame_received {
            trace!("Ignore empty frame");
            self.mode_d_empty_frame_received = true;
            return;
        }

        self.process_line(line);
    }

    fn handle_identification(&mut self, now: Instant) {
        let size = self.receive(now);
        if size == 0 {
            return;
        }

        let id = match utils::find_identification(self.detector.frame(size)) {
            Some(id) => id.to_vec(),
            None => {
                error!("Invalid identification frame");
                self.retry_or_sleep(now);
                return;
            }
        };

        self.parse_id(&id);
        debug!("Meter reported protocol: {}", self.mode);
        if self.mode != ProtocolMode::ModeA {
            debug!("Meter reported max baud rate: {} bps ('{}')",
                   negotiation::identification_to_baud_rate(self.mode, self.baud_rate_identification),
                   self.baud_rate_identification as char);
        }
        self.set_next_state(State::PrepareAck);
    }

    fn handle_prepare_ack(&mut self, now: Instant) {
        if self.mode == ProtocolMode::ModeA {
            // switching the baud rate is not supported, the meter sends its data right away
            trace!("Using protocol mode A");
            self.set_next_state(State::WaitForStx);
            return;
        }

        self.baud_rate_char = negotiation::negotiate(self.mode, self.baud_rate_identification, self.settings.baud_rate_max);
        self.new_baud_rate = negotiation::identification_to_baud_rate(self.mode, self.baud_rate_char);
        if self.baud_rate_char == self.baud_rate_identification {
            debug!("Using meter maximum baud rate {} bps ('{}')", self.new_baud_rate, self.baud_rate_char as char);
        } else {
            debug!("Using negotiated baud rate {} bps ('{}')", self.new_baud_rate, self.baud_rate_char as char);
        }

        self.out.build_option_select(self.baud_rate_char);
        self.send_frame();

        self.wait(now, BAUD_RATE_SETTLE_DELAY, State::SetBaudRate);
    }

    fn handle_readout(&mut self, now: Instant) {
        let size = self.receive(now);
        if size == 0 {
            return;
        }

        let frame = self.detector.frame(size).to_vec();

        if size >= 2 && frame[size - 2] == ETX {
            debug!("Detected ETX at the end of data");

            // block check covers everything up to and including ETX
            self.detector.accumulate(size - 1);
            let expected = self.detector.bcc();
            let received = self.detector.received_bcc();
            self.detector.reset_bcc();

            if expected == received {
                debug!("BCC verification is OK");
            } else {
                error!("BCC verification failed. Expected 0x{:02x}, got 0x{:02x}", expected, received);
                debug!("BCC check has failed, but will carry on with the sensors update");
            }

            self.process_line(&frame[..size - 2]);

            // mode A sends the whole data message at once
            if self.mode == ProtocolMode::ModeA {
                self.finish_readout(now);
                return;
            }

            self.current_obis_index += 1;
            if self.current_obis_index < self.settings.obis_codes.len() {
                self.set_next_state(State::AskForEnergy);
            } else {
                self.finish_readout(now);
            }
        } else {
            // data line without ETX
            self.detector.accumulate(size);
            self.process_line(strip_line_end(&frame));
        }
    }

    /// Parses one data line and hands it to the sensors. Bad lines are dropped.
    fn process_line(&mut self, data: &[u8]) {
        let line = String::from_utf8_lossy(data).to_string();
        if line.is_empty() || line == "!" {
            trace!("Skipping line '{line}'");
            return;
        }

        debug!("Data: '{line}'");
        match obis_parser::parse_obis_line(&line) {
            Ok(obis_line) => {
                self.sensors.dispatch(&line, &obis_line);
            }
            Err(e) => {
                error!("Invalid frame format: '{line}' ({e})");
            }
        }
    }

    /// All values are read, start publishing them.
    fn finish_readout(&mut self, now: Instant) {
        self.connection_status(false);
        debug!("Total connection time: {} ms",
               now.saturating_duration_since(self.retry_connection_start).as_millis());

        self.verify_all_sensors_got_value();
        debug!("Start of sensor update");
        self.update_index = 0;
        self.set_next_state(State::UpdateStates);
    }

    fn parse_id(&mut self, raw: &[u8]) {
        let device = match utils::parse_identification_line(raw) {
            Ok(device) => device,
            Err(e) => {
                error!("Invalid identification '{}': {e}", format_hex_ascii_pretty(raw));
                return;
            }
        };

        let id = device.full_id;
        debug!("Meter identification: '{id}'");

        self.baud_rate_identification = device.baud_rate_char;
        trace!("Baud rate char: '{}'", device.baud_rate_char as char);
        self.mode = negotiation::protocol_mode(device.baud_rate_char, self.settings.force_mode_d);

        if device.mode_e_requested {
            debug!("The meter is indicating mode E, which is unsupported. Attempting mode C. \
                    This will work for meters supporting both mode E and C.");
        }

        if self.meter_identification != id {
            self.meter_identification = id.clone();
            self.events.push(SessionEvent::Identification(id));
        }
    }

    fn receive(&mut self, now: Instant) -> usize {
        let size = self.detector.receive(&mut self.transport, &mut self.out, RECEIVE_BUDGET);
        if size > 0 {
            self.last_transmission_from_meter = now;
        }
        size
    }

    fn receive_first_byte(&mut self, now: Instant) -> Option<u8> {
        match self.receive(now) {
            0 => None,
            size => Some(self.detector.frame(size)[0]),
        }
    }

    fn send_frame(&mut self) {
        trace!("TX: {}", format_hex_ascii_pretty(self.out.as_slice()));
        if let Err(e) = self.transport.write_all(self.out.as_slice()) {
            error!("Unable to write to serial port: {e}");
        }
    }

    fn clear_input_buffer(&mut self) {
        match self.transport.discard_input() {
            Ok(0) => {}
            Ok(n) => trace!("Garbage data in UART input buffer: {n} bytes"),
            Err(e) => error!("Unable to clear serial input: {e}"),
        }
        self.detector.clear();
    }

    fn update_baud_rate(&mut self, baud_rate: u32) {
        trace!("Baud rate set to: {baud_rate} bps");
        if let Err(e) = self.transport.set_baud_rate(baud_rate) {
            error!("Unable to set baud rate {baud_rate}: {e}");
        }
    }

    fn connection_status(&mut self, connected: bool) {
        if connected {
            debug!("Connection start");
        } else {
            debug!("Connection end");
        }
        self.events.push(SessionEvent::Connection(connected));
    }

    fn verify_all_sensors_got_value(&self) {
        // only the first one, listing all of them takes too long
        if let Some(s) = self.sensors.first_without_value() {
            error!("Not all sensors received data from the meter. The first one: OBIS '{}'. \
                    Verify sensor is defined with valid OBIS code.", s.obis);
        }
    }

    fn set_next_state(&mut self, state: State) {
        self.state = state;
    }

    fn report_state(&mut self) {
        if self.reported_state != Some(self.state) {
            debug!("{}", self.state.to_string());
            self.reported_state = Some(self.state);
        }
    }

    fn wait(&mut self, now: Instant, period: Duration, next: State) {
        trace!("Start WAIT for {} ms", period.as_millis());
        self.set_next_state(State::Wait);
        self.wait_start = now;
        self.wait_period = period;
        self.wait_next_state = next;
    }

    fn is_periodic_readout_enabled(&self) -> bool {
        self.settings.update_interval.is_some()
    }

    fn retry_or_sleep(&mut self, now: Instant) {
        if self.settings.force_mode_d {
            // next timeout starts now
            self.last_transmission_from_meter = now;
            self.set_next_state(State::ModeDWait);
        } else if self.retry_counter >= self.settings.max_retries {
            debug!("Exceeded retry counter.");
            self.wait_next_readout(now);
        } else {
            self.retry_counter += 1;
            debug!("Retry {} of {}. Waiting {} ms before the next try",
                   self.retry_counter, self.settings.max_retries, self.settings.retry_delay.as_millis());
            self.wait(now, self.settings.retry_delay, State::Begin);
        }
    }

    fn wait_next_readout(&mut self, now: Instant) {
        if self.settings.force_mode_d {
            self.set_next_state(State::ModeDWait);
            return;
        }

        self.retry_counter = 0;
        let delta = self.scheduled_connection_start
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or(Duration::ZERO);
        self.scheduled_connection_start = None;

        match self.settings.update_interval {
            Some(interval) => {
                let actual_wait_time = if delta > interval {
                    debug!("Total connection time greater than configured update interval. Working continuously.");
                    Duration::ZERO
                } else {
                    interval - delta
                };
                debug!("Waiting {} ms for the next scheduled readout (every {} ms).",
                       actual_wait_time.as_millis(), interval.as_millis());
                self.wait(now, actual_wait_time, State::Begin);
            }
            None => {
                debug!("No scheduled readout. Use a trigger to start a readout.");
                self.set_next_state(State::InfiniteWait);
            }
        }
    }

    fn update_connection_start(&mut self, now: Instant) {
        self.retry_connection_start = now;

        // only for the first try of a cycle
        if self.scheduled_connection_start.is_none() {
            self.scheduled_connection_start = Some(now);
            trace!("Begin scheduled readout");
        } else {
            trace!("Begin retry");
        }
    }
}

fn strip_line_end(frame: &[u8]) -> &[u8] {
    frame.strip_suffix(&[CR, LF]).unwrap_or(frame)
}
