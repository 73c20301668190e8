//! HTTP API Module
//!
//! REST surface for operators: pushes, status, and site availability.

mod http;

pub use http::{
    AppState, ErrorResponse, HealthResponse, HttpServer, ModeBody, OperationResponse, ReceivingResponse,
    SiteSummary, StatusResponse,
};
