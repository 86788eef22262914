use thiserror::Error;

/// Errors raised while classifying a target.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("failed to get a valid answer")]
    NoValidAnswer,

    #[error("dns lookup failed for {host}: {reason}")]
    Lookup { host: String, reason: String },

    #[error("can not read resolver configuration: {0}")]
    ResolverConfig(String),
}

/// Errors raised by the process helpers.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start process {executable}: {source}")]
    Start {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for process {executable}: {source}")]
    Wait {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process output could not be parsed: {parser_error}")]
    Parse {
        output: Vec<u8>,
        err_output: Vec<u8>,
        status: Option<i32>,
        parser_error: String,
    },

    #[error("can not open {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process canceled")]
    Canceled,
}

/// Errors raised by the push transport.
#[derive(Debug, Clone, Error)]
pub enum PushError {
    #[error("push queue is closed")]
    Closed,

    #[error("error sending message to collector: {0}")]
    Delivery(String),

    #[error("invalid collector address {0}")]
    InvalidAddress(String),
}

/// Lifecycle level errors.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("check canceled")]
    Canceled,

    #[error("target is not scannable")]
    NotScannable,

    #[error("check state could not be delivered: {0}")]
    Delivery(#[from] PushError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("can not listen for termination signals: {0}")]
    Signal(#[source] std::io::Error),

    #[error("can not start the test collector: {0}")]
    Collector(#[source] std::io::Error),

    #[error("check task did not complete: {0}")]
    Join(String),
}

impl CheckError {
    /// True when the report is, or wraps, a cancellation.
    pub fn is_cancellation(report: &eyre::Report) -> bool {
        report
            .chain()
            .any(|cause| matches!(cause.downcast_ref::<CheckError>(), Some(CheckError::Canceled))
                || matches!(cause.downcast_ref::<ProcessError>(), Some(ProcessError::Canceled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::WrapErr;

    #[test]
    fn test_cancellation_is_recognized() {
        let report = eyre::Report::new(CheckError::Canceled);
        assert!(CheckError::is_cancellation(&report));

        let wrapped: eyre::Result<()> = Err(CheckError::Canceled).wrap_err("scan interrupted");
        assert!(CheckError::is_cancellation(&wrapped.unwrap_err()));

        let process = eyre::Report::new(ProcessError::Canceled);
        assert!(CheckError::is_cancellation(&process));
    }

    #[test]
    fn test_ordinary_failure_is_not_cancellation() {
        let report = eyre::eyre!("connection refused");
        assert!(!CheckError::is_cancellation(&report));
        let not_scannable = eyre::Report::new(CheckError::NotScannable);
        assert!(!CheckError::is_cancellation(&not_scannable));
    }
}
