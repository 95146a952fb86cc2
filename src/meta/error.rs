quick_error!{
    #[derive(Debug)]
    pub enum MetaError {
        Remote(code: i64, message: String) {
            description("Metaserver error")
            display("Metaserver error {}: {}", code, message)
        }
        Status(status: u16) {
            description("Unexpected HTTP status")
            display("Metaserver returned HTTP status {}", status)
        }
        Transport(err: reqwest::Error) {
            from()
            cause(err)
            description("Transport error")
            display("Transport error: {}", err)
        }
        Format(reason: &'static str) {
            description("Malformed metaserver response")
            display("Malformed metaserver response: {}", reason)
        }
    }
}

impl MetaError {
    /// The remote error code, if the metaserver rejected the request.
    pub fn code(&self) -> Option<i64> {
        match *self {
            MetaError::Remote(code, _) => Some(code),
            _ => None
        }
    }
}
