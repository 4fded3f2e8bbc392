#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentification {
    pub manufacturer: String,
    /// Fifth character of the identification, `0` when missing
    pub baud_rate_char: u8,
    pub mode_e_requested: bool,
    pub full_id: String,
}

/// States of the readout session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    InfiniteWait,
    Wait,
    ModeDWait,
    ModeDReadout,
    Begin,
    BatteryWakeup,
    SendRequest,
    GetIdentification,
    PrepareAck,
    SetBaudRate,
    WaitForPpp,
    WaitForPppReadData,
    SendPassword,
    WaitForAck,
    WaitForStx2,
    Readout2,
    AskForEnergy,
    WaitForStx,
    Readout,
    UpdateStates,
}

impl State {
    pub fn to_string(&self) -> String {
        match self {
            State::InfiniteWait => "INFINITE_WAIT".to_string(),
            State::Wait => "WAIT".to_string(),
            State::ModeDWait => "MODE_D_WAIT".to_string(),
            State::ModeDReadout => "MODE_D_READOUT".to_string(),
            State::Begin => "BEGIN".to_string(),
            State::BatteryWakeup => "BATTERY_WAKEUP".to_string(),
            State::SendRequest => "SEND_REQUEST".to_string(),
            State::GetIdentification => "GET_IDENTIFICATION".to_string(),
            State::PrepareAck => "PREPARE_ACK".to_string(),
            State::SetBaudRate => "SET_BAUD_RATE".to_string(),
            State::WaitForPpp => "WAIT_FOR_PPP".to_string(),
            State::WaitForPppReadData => "WAIT_FOR_PPP_READ_DATA".to_string(),
            State::SendPassword => "SEND_PASSWORD".to_string(),
            State::WaitForAck => "WAIT_FOR_ACK".to_string(),
            State::WaitForStx2 => "WAIT_FOR_STX2".to_string(),
            State::Readout2 => "READOUT2".to_string(),
            State::AskForEnergy => "ASK_FOR_ENERGY".to_string(),
            State::WaitForStx => "WAIT_FOR_STX".to_string(),
            State::Readout => "READOUT".to_string(),
            State::UpdateStates => "UPDATE_STATES".to_string(),
        }
    }

    pub fn is_wait_state(&self) -> bool {
        matches!(self, State::Wait | State::InfiniteWait)
    }
}

/// Everything the session hands over to the outside world
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// `true` while a session with the meter is running
    Connection(bool),
    Identification(String),
    SensorState {
        name: String,
        obis: String,
        value: super::sensors::SensorValue,
    },
}
