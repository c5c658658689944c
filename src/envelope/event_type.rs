use std::fmt;

/// Event codes understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EventType {
    /// Connector node announces itself.
    InstanceRegister = 10,
    RegisterSuccess = 11,
    /// Node is already registered.
    RegisterFail = 12,
    /// Node advertised an unknown equipment type or protocol.
    RegisterError = 13,
    /// Tells a connector node that its registration lapsed and it must reconnect.
    Dropped = 14,
    DeviceLogin = 40,
    LoginSuccess = 41,
    LoginFail = 42,
    DeviceUpload = 50,
    UploadSuccess = 51,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        EventType::InstanceRegister,
        EventType::RegisterSuccess,
        EventType::RegisterFail,
        EventType::RegisterError,
        EventType::Dropped,
        EventType::DeviceLogin,
        EventType::LoginSuccess,
        EventType::LoginFail,
        EventType::DeviceUpload,
        EventType::UploadSuccess,
    ];

    /// Wire code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

impl From<EventType> for i32 {
    fn from(t: EventType) -> Self {
        t.code()
    }
}
