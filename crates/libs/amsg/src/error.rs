use std::io;

/// Errors produced by the message transport.
///
/// Every variant has a stable numeric code so it can travel inside a
/// default response payload and be rebuilt on the other side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum AmsgError {
    #[error("bad magic")]
    MagicBad,
    #[error("message truncated")]
    MsgTruncated,
    #[error("protocol version unsupported")]
    VersionUnsupported,
    #[error("interface unsupported")]
    InterfaceUnsupported,
    #[error("message type unsupported")]
    TypeUnsupported,
    #[error("sequence number mismatch")]
    SequenceBad,
    #[error("permission denied")]
    PermissionDenied,
    #[error("message too large")]
    MessageTooLarge,
    #[error("disconnected")]
    Disconnected,
    #[error("socket error")]
    Socket,
    #[error("data corrupt")]
    DataCorrupt,
    #[error("application error")]
    Application,
    #[error("timed out")]
    TimedOut,
    #[error("interrupted")]
    Interrupted,
    #[error("already exists")]
    AlreadyExists,
}

impl AmsgError {
    pub fn code(self) -> u16 {
        match self {
            Self::MagicBad => 1,
            Self::MsgTruncated => 2,
            Self::VersionUnsupported => 3,
            Self::InterfaceUnsupported => 4,
            Self::TypeUnsupported => 5,
            Self::SequenceBad => 6,
            Self::PermissionDenied => 7,
            Self::MessageTooLarge => 8,
            Self::Disconnected => 9,
            Self::Socket => 10,
            Self::DataCorrupt => 11,
            Self::Application => 12,
            Self::TimedOut => 13,
            Self::Interrupted => 14,
            Self::AlreadyExists => 15,
        }
    }

    /// Maps a wire code back to an error. `0` means success and yields `None`;
    /// unknown codes collapse to `Application`.
    pub fn from_code(code: u16) -> Option<Self> {
        let err = match code {
            0 => return None,
            1 => Self::MagicBad,
            2 => Self::MsgTruncated,
            3 => Self::VersionUnsupported,
            4 => Self::InterfaceUnsupported,
            5 => Self::TypeUnsupported,
            6 => Self::SequenceBad,
            7 => Self::PermissionDenied,
            8 => Self::MessageTooLarge,
            9 => Self::Disconnected,
            10 => Self::Socket,
            11 => Self::DataCorrupt,
            12 => Self::Application,
            13 => Self::TimedOut,
            14 => Self::Interrupted,
            15 => Self::AlreadyExists,
            _ => Self::Application,
        };
        Some(err)
    }

    /// Errors after which the endpoint cannot be used anymore.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Socket)
    }
}

impl From<rustix::io::Errno> for AmsgError {
    fn from(errno: rustix::io::Errno) -> Self {
        use rustix::io::Errno;
        match errno {
            Errno::PIPE | Errno::CONNRESET | Errno::NOTCONN | Errno::CONNREFUSED | Errno::NOENT => {
                Self::Disconnected
            }
            Errno::ACCESS | Errno::PERM => Self::PermissionDenied,
            Errno::INTR => Self::Interrupted,
            Errno::MSGSIZE => Self::MessageTooLarge,
            Errno::ADDRINUSE => Self::AlreadyExists,
            _ => Self::Socket,
        }
    }
}

impl From<io::Error> for AmsgError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotFound => Self::Disconnected,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::Interrupted => Self::Interrupted,
            io::ErrorKind::TimedOut => Self::TimedOut,
            io::ErrorKind::AddrInUse => Self::AlreadyExists,
            _ => Self::Socket,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AmsgError;

    #[test]
    fn wire_codes_round_trip_for_every_variant() {
        for code in 1..=15u16 {
            let err = AmsgError::from_code(code).expect("non-zero code maps to an error");
            assert_eq!(err.code(), code);
        }
        assert_eq!(AmsgError::from_code(0), None);
        assert_eq!(AmsgError::from_code(999), Some(AmsgError::Application));
    }
}
