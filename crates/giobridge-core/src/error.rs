use core::fmt;
use giobridge_proto::{ProtoError, Status};
use std::io;

/// Mapper error categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapperErrorKind {
    /// Region resources are not fully acquired yet.
    NotReady,
    /// Operation flags contradict each other.
    NotUnderstood,
    /// Valid request the mapper refuses to carry out.
    NotSupported,
    /// Pool shut down, region failed, or provider allocation failed.
    ResourceUnavailable,
    /// Caller buffer could not be copied in or out.
    Fault,
    /// Provider reported a transfer error.
    Io(Status),
    /// No bound instance with the requested number.
    NoDevice,
    /// Bind handshake was refused.
    CannotBind,
}

/// Errors surfaced by the mapper and its devices.
#[derive(Clone, Debug)]
pub struct MapperError {
    kind: MapperErrorKind,
    message: Option<String>,
}

impl MapperError {
    pub fn new(kind: MapperErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: MapperErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> MapperErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Provider-style status equivalent, used when an error has to travel in a reply.
    pub fn status(&self) -> Status {
        match self.kind {
            MapperErrorKind::NotReady | MapperErrorKind::NoDevice => Status::INVALID_STATE,
            MapperErrorKind::NotUnderstood => Status::NOT_UNDERSTOOD,
            MapperErrorKind::NotSupported => Status::NOT_SUPPORTED,
            MapperErrorKind::ResourceUnavailable => Status::RESOURCE_UNAVAILABLE,
            MapperErrorKind::Fault => Status::DATA_ERROR,
            MapperErrorKind::Io(status) => status,
            MapperErrorKind::CannotBind => Status::CANNOT_BIND,
        }
    }
}

impl fmt::Display for MapperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.message()) {
            (MapperErrorKind::Io(status), Some(msg)) => write!(f, "Io({status}): {msg}"),
            (MapperErrorKind::Io(status), None) => write!(f, "Io({status})"),
            (kind, Some(msg)) => write!(f, "{kind:?}: {msg}"),
            (kind, None) => write!(f, "{kind:?}"),
        }
    }
}

impl std::error::Error for MapperError {}

impl From<ProtoError> for MapperError {
    fn from(err: ProtoError) -> Self {
        MapperError::with_message(MapperErrorKind::NotUnderstood, err.to_string())
    }
}

impl From<MapperError> for io::Error {
    fn from(err: MapperError) -> Self {
        let errno = match err.kind() {
            MapperErrorKind::NotReady => libc::EAGAIN,
            MapperErrorKind::NotUnderstood | MapperErrorKind::NotSupported => libc::EINVAL,
            MapperErrorKind::ResourceUnavailable => libc::ENOMEM,
            MapperErrorKind::Fault => libc::EFAULT,
            MapperErrorKind::Io(_) => libc::EIO,
            MapperErrorKind::NoDevice => libc::ENXIO,
            MapperErrorKind::CannotBind => libc::ENODEV,
        };
        let kind = io::Error::from_raw_os_error(errno).kind();
        io::Error::new(kind, err)
    }
}

pub type MapperResult<T> = core::result::Result<T, MapperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message() {
        let err = MapperError::with_message(MapperErrorKind::NotSupported, "async read");
        assert_eq!(err.to_string(), "NotSupported: async read");
        let io = MapperError::new(MapperErrorKind::Io(Status::DATA_ERROR));
        assert_eq!(io.to_string(), "Io(data_error)");
    }

    #[test]
    fn io_errors_keep_mapper_error_as_source() {
        let err: io::Error = MapperError::new(MapperErrorKind::NotUnderstood).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let inner = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<MapperError>())
            .unwrap();
        assert_eq!(inner.kind(), MapperErrorKind::NotUnderstood);

        let err: io::Error = MapperError::new(MapperErrorKind::NotReady).into();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn io_kinds_follow_platform_errno() {
        let cases = [
            (MapperErrorKind::NotReady, libc::EAGAIN),
            (MapperErrorKind::NotSupported, libc::EINVAL),
            (MapperErrorKind::ResourceUnavailable, libc::ENOMEM),
            (MapperErrorKind::Fault, libc::EFAULT),
            (MapperErrorKind::Io(Status::DATA_ERROR), libc::EIO),
            (MapperErrorKind::NoDevice, libc::ENXIO),
            (MapperErrorKind::CannotBind, libc::ENODEV),
        ];
        for (kind, errno) in cases {
            let err: io::Error = MapperError::new(kind).into();
            assert_eq!(
                err.kind(),
                io::Error::from_raw_os_error(errno).kind(),
                "{kind:?}"
            );
        }
        let err: io::Error = MapperError::new(MapperErrorKind::NotReady).into();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn status_round_trips_provider_errors() {
        let err = MapperError::new(MapperErrorKind::Io(Status::HW_PROBLEM));
        assert_eq!(err.status(), Status::HW_PROBLEM);
        assert_eq!(
            MapperError::new(MapperErrorKind::ResourceUnavailable).status(),
            Status::RESOURCE_UNAVAILABLE
        );
    }
}
