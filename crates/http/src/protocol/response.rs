use http::Response;

/// Status line and headers of a response, before a body is attached.
pub type ResponseHead = Response<()>;
