use core::error::Error;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
    #[display("Failed to bind {addr}: {message}")]
    BindFailed { addr: String, message: String },
}

impl Error for ApiError {}
