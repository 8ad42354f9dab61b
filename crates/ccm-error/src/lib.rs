// Defines a small, gRPC-flavored set of error codes shared across the agent
// crates so that callers can handle failures generically without downcasting.
use std::error::Error;

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum ErrorCodes {
    Success = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl ErrorCodes {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCodes::InvalidArgument => "InvalidArgumentError",
            ErrorCodes::NotFound => "NotFoundError",
            ErrorCodes::Internal => "InternalError",
            _ => "CcmError",
        }
    }
}

pub trait CcmError: Error + Send {
    fn code(&self) -> ErrorCodes;
    fn boxed(self) -> Box<dyn CcmError>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
    fn should_trace_error(&self) -> bool {
        true
    }
}

impl Error for Box<dyn CcmError> {}

impl CcmError for Box<dyn CcmError> {
    fn code(&self) -> ErrorCodes {
        self.as_ref().code()
    }
}

impl CcmError for std::io::Error {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Unknown
    }
}
