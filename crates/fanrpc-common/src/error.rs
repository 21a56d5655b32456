use thiserror::Error;

use crate::status::Code;

#[derive(Error, Debug, Clone)]
pub enum FanrpcError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("client connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("no client connection found")]
    NoConnectionFound,

    #[error("no connections available, failed to connect to [{}]", .0.join(", "))]
    NoConnections(Vec<String>),

    #[error("rpc error: code = {code} desc = {message}")]
    Status { code: Code, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("connection to {0} is unhealthy")]
    Unhealthy(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("client is closed")]
    ClientClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{addr}: {source}")]
    Addr {
        addr: String,
        #[source]
        source: Box<FanrpcError>,
    },

    #[error("{}", join_messages(.0))]
    Multiple(Vec<FanrpcError>),
}

fn join_messages(errs: &[FanrpcError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl FanrpcError {
    /// Builds a status error as returned by a worker node.
    pub fn status(code: Code, message: impl Into<String>) -> Self {
        FanrpcError::Status {
            code,
            message: message.into(),
        }
    }

    /// Tags the error with the address it failed against.
    pub fn at_addr(self, addr: impl Into<String>) -> Self {
        let addr = addr.into();
        match self {
            FanrpcError::Addr { addr: ref a, .. } if *a == addr => self,
            other => FanrpcError::Addr {
                addr,
                source: Box::new(other),
            },
        }
    }

    /// Joins a list of errors. An empty list yields `None`, a single error is
    /// returned as is, nested joins are flattened.
    pub fn join(errs: impl IntoIterator<Item = FanrpcError>) -> Option<Self> {
        let mut flat = Vec::new();
        for err in errs {
            match err {
                FanrpcError::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(FanrpcError::Multiple(flat)),
        }
    }

    /// Strips `Addr` wrappers.
    pub fn root(&self) -> &FanrpcError {
        let mut err = self;
        while let FanrpcError::Addr { source, .. } = err {
            err = source;
        }
        err
    }

    fn any(&self, pred: &dyn Fn(&FanrpcError) -> bool) -> bool {
        match self.root() {
            FanrpcError::Multiple(errs) => errs.iter().any(|e| e.any(pred)),
            root => pred(root),
        }
    }

    /// The status code carried by this error, with context errors mapped to
    /// their code equivalents.
    pub fn code(&self) -> Option<Code> {
        match self.root() {
            FanrpcError::Status { code, .. } => Some(*code),
            FanrpcError::Canceled => Some(Code::Cancelled),
            FanrpcError::DeadlineExceeded => Some(Code::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_canceled_or_deadline(&self) -> bool {
        self.any(&|e| {
            matches!(
                e,
                FanrpcError::Canceled
                    | FanrpcError::DeadlineExceeded
                    | FanrpcError::Status {
                        code: Code::Cancelled | Code::DeadlineExceeded,
                        ..
                    }
            )
        })
    }

    pub fn is_not_found(&self) -> bool {
        self.any(&|e| {
            matches!(
                e,
                FanrpcError::ConnectionNotFound(_) | FanrpcError::NoConnectionFound
            )
        })
    }

    pub fn is_circuit_open(&self) -> bool {
        self.any(&|e| matches!(e, FanrpcError::CircuitOpen(_)))
    }

    /// Conditions that heal on their own: cancellation, deadlines, an open
    /// breaker, or an address that is not registered yet.
    pub fn is_transient(&self) -> bool {
        self.is_canceled_or_deadline() || self.is_circuit_open() || self.is_not_found()
    }
}

impl From<std::io::Error> for FanrpcError {
    fn from(err: std::io::Error) -> Self {
        FanrpcError::Connection(err.to_string())
    }
}

impl From<std::net::AddrParseError> for FanrpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        FanrpcError::InvalidAddress(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for FanrpcError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        FanrpcError::DeadlineExceeded
    }
}

pub type Result<T> = std::result::Result<T, FanrpcError>;
