//! HTTP middleware

pub mod request_handling;

pub use request_handling::{
    handle_requests, render_error, status_for, ErrorBody, EscapedError, RequestHandlingExt,
    GENERIC_ERROR_MESSAGE,
};
