//! Request layer: transport seam, reqwest transport and executor.

pub mod executor;
pub mod reqwest_transport;
pub mod transport;

pub use executor::{
    ExecutionError, RequestExecutor, RequestOptions, ResponseBody, ResponseEnvelope,
    transaction_id,
};
pub use reqwest_transport::ReqwestTransport;
pub use transport::{
    HttpTransport, TransportError, TransportErrorKind, TransportRequest, TransportResponse,
};
