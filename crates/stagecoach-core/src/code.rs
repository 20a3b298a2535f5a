/// Stable numeric codes the control channel uses to report terminal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    OperationCancelled,
    OperationAborted,
    UnsupportedPackaging,
    OperationFailed,
}

impl ErrorCode {
    pub fn value(self) -> i64 {
        match self {
            Self::OperationCancelled => 499,
            Self::OperationAborted => 410,
            Self::UnsupportedPackaging => 3000,
            Self::OperationFailed => -32603,
        }
    }

    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            499 => Some(Self::OperationCancelled),
            410 => Some(Self::OperationAborted),
            3000 => Some(Self::UnsupportedPackaging),
            -32603 => Some(Self::OperationFailed),
            _ => None,
        }
    }
}
