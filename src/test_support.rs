use crate::Error;

/// Rejection reason used across the unit tests.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reason {
    Code(i32),
    Internal(Error),
}

impl From<Error> for Reason {
    fn from(err: Error) -> Self {
        Reason::Internal(err)
    }
}
