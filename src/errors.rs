use std::error::Error;
use std::fmt;
use std::io::{self, ErrorKind};

use http::StatusCode;

use crate::store::StoreError;

pub(crate) type DavResult<T> = Result<T, DavError>;

/// Errors returned by the resource layer.
#[derive(Debug)]
pub enum FsError {
    NotImplemented,
    GeneralFailure(String),
    Exists,
    NotFound,
    Forbidden,
}

/// A result type with `FsError` as the error.
pub type FsResult<T> = Result<T, FsError>;

impl Error for FsError {}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FsError::NotImplemented => write!(f, "not implemented"),
            FsError::GeneralFailure(msg) => write!(f, "{msg}"),
            FsError::Exists => write!(f, "resource already exists"),
            FsError::NotFound => write!(f, "not found"),
            FsError::Forbidden => write!(f, "forbidden"),
        }
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            ErrorKind::NotFound => FsError::NotFound,
            ErrorKind::PermissionDenied => FsError::Forbidden,
            ErrorKind::AlreadyExists => FsError::Exists,
            _ => FsError::GeneralFailure(e.to_string()),
        }
    }
}

impl From<&io::Error> for FsError {
    fn from(e: &io::Error) -> Self {
        match e.kind() {
            ErrorKind::NotFound => FsError::NotFound,
            ErrorKind::PermissionDenied => FsError::Forbidden,
            ErrorKind::AlreadyExists => FsError::Exists,
            _ => FsError::GeneralFailure(e.to_string()),
        }
    }
}

impl From<StoreError> for FsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NoSuchBucket(_) | StoreError::NoSuchKey(_) => FsError::NotFound,
            StoreError::AccessDenied => FsError::Forbidden,
            StoreError::Io(e) => e.into(),
            StoreError::Other(msg) => FsError::GeneralFailure(msg),
        }
    }
}

impl FsError {
    pub(crate) fn statuscode(&self) -> StatusCode {
        match self {
            FsError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            FsError::GeneralFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FsError::Exists => StatusCode::CONFLICT,
            FsError::NotFound => StatusCode::NOT_FOUND,
            FsError::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

/// Everything a request handler can fail with.
///
/// The first group is the protocol-level taxonomy: each variant maps to
/// one status code and may carry a message that ends up in the response
/// body. The rest wraps lower-level failures.
#[derive(Debug)]
pub enum DavError {
    BadRequest(Option<String>),
    Unauthorized,
    Forbidden(Option<String>),
    NotFound,
    NotAllowed,
    Conflict(Option<String>),
    PreconditionFailed(Option<String>),
    NotModified,
    UnsupportedMediaType,
    MultiStatus,
    NotImplemented,
    BadGateway(Option<String>),
    Internal(String),

    UnknownDavMethod,
    InvalidPath,
    XmlParseError,
    Status(StatusCode),
    StatusClose(StatusCode),
    FsError(FsError),
    IoError(io::Error),
    XmlWriterError(xml::writer::Error),
}

impl Error for DavError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DavError::FsError(e) => Some(e),
            DavError::IoError(e) => Some(e),
            DavError::XmlWriterError(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for DavError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DavError::XmlWriterError(e) => write!(f, "XML generate error: {e}"),
            DavError::IoError(e) => write!(f, "I/O error: {e}"),
            DavError::FsError(e) => write!(f, "resource error: {e}"),
            DavError::Internal(msg) => write!(f, "{msg}"),
            _ => match self.message() {
                Some(msg) => write!(f, "{}: {}", self.statuscode(), msg),
                None => write!(f, "{:?}", self),
            },
        }
    }
}

impl From<FsError> for DavError {
    fn from(e: FsError) -> Self {
        DavError::FsError(e)
    }
}

impl From<DavError> for io::Error {
    fn from(e: DavError) -> Self {
        match e {
            DavError::IoError(e) => e,
            DavError::FsError(e) => io::Error::new(io::ErrorKind::Other, e.to_string()),
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}

impl From<io::Error> for DavError {
    fn from(e: io::Error) -> Self {
        DavError::IoError(e)
    }
}

impl From<StatusCode> for DavError {
    fn from(e: StatusCode) -> Self {
        DavError::Status(e)
    }
}

impl From<xml::writer::Error> for DavError {
    fn from(e: xml::writer::Error) -> Self {
        DavError::XmlWriterError(e)
    }
}

impl From<xmltree::ParseError> for DavError {
    fn from(e: xmltree::ParseError) -> Self {
        debug!("xml parse error: {e}");
        DavError::XmlParseError
    }
}

impl DavError {
    pub(crate) fn statuscode(&self) -> StatusCode {
        match self {
            DavError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DavError::Unauthorized => StatusCode::UNAUTHORIZED,
            DavError::Forbidden(_) => StatusCode::FORBIDDEN,
            DavError::NotFound => StatusCode::NOT_FOUND,
            DavError::NotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            DavError::Conflict(_) => StatusCode::CONFLICT,
            DavError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            DavError::NotModified => StatusCode::NOT_MODIFIED,
            DavError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DavError::MultiStatus => StatusCode::MULTI_STATUS,
            DavError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            DavError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            DavError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DavError::UnknownDavMethod => StatusCode::METHOD_NOT_ALLOWED,
            DavError::InvalidPath => StatusCode::BAD_REQUEST,
            DavError::XmlParseError => StatusCode::BAD_REQUEST,
            DavError::Status(e) => *e,
            DavError::StatusClose(e) => *e,
            DavError::FsError(e) => e.statuscode(),
            DavError::IoError(e) => FsError::from(e).statuscode(),
            DavError::XmlWriterError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Human readable text for the response body, if any.
    pub(crate) fn message(&self) -> Option<String> {
        match self {
            DavError::BadRequest(m)
            | DavError::Forbidden(m)
            | DavError::Conflict(m)
            | DavError::PreconditionFailed(m)
            | DavError::BadGateway(m) => m.clone(),
            DavError::Internal(m) => Some(m.clone()),
            DavError::FsError(FsError::GeneralFailure(m)) => Some(m.clone()),
            DavError::IoError(e) if FsError::from(e).statuscode().is_server_error() => {
                Some(e.to_string())
            }
            DavError::XmlWriterError(e) => Some(e.to_string()),
            _ => None,
        }
    }

    pub(crate) fn must_close(&self) -> bool {
        !matches!(
            self,
            &DavError::Status(_)
                | &DavError::BadRequest(_)
                | &DavError::Unauthorized
                | &DavError::Forbidden(_)
                | &DavError::NotFound
                | &DavError::Conflict(_)
                | &DavError::PreconditionFailed(_)
                | &DavError::NotModified
                | &DavError::FsError(FsError::NotFound)
                | &DavError::FsError(FsError::Exists)
                | &DavError::FsError(FsError::Forbidden)
        )
    }
}
